//! Infrastructure layer: concrete implementations of application port traits.
//!
//! This module contains all I/O-performing code: process execution, the
//! OpenSSH transport, the cloud provider and GitHub HTTP clients, source
//! archiving, and the persisted server state.
//!
//! Imports from `crate::domain` and `crate::application::ports` are allowed.
//! Imports from `crate::commands` or `crate::output` are forbidden.

pub mod archive;
pub mod command_runner;
pub mod config;
pub mod github;
pub mod hetzner;
pub mod network;
pub mod ssh;
pub mod state;
