pub mod state;

pub use state::{ServerState, StateError};
