//! Domain layer: pure types and validation.
//!
//! This module has zero imports from `crate::infra`, `crate::commands`,
//! `crate::application`, `tokio`, `std::fs`, or `std::process`.
//! All functions are synchronous and take data in, returning data out.

pub mod boot;
pub mod config;
pub mod error;
pub mod instance;
pub mod redact;
pub mod remote;
pub mod secret;
pub mod shell;
pub mod ssh;
pub mod stage;

pub use boot::{BootObservation, BootPhase, StabilityTracker};
pub use config::{
    BuildConfig, BuildSettings, CleanupConfig, PollPolicy, ReadinessSettings, ReleaseSettings,
    ServerSpec, SourceLocation,
};
pub use error::{
    BuildError, CleanupError, ConfigError, ProviderError, ReadinessError, TransportError,
};
pub use instance::{
    CreatedInstance, Credential, EphemeralKeypair, Instance, InstanceRequest, InstanceStatus,
};
pub use secret::Secret;
pub use stage::Stage;
