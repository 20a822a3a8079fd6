//! Unit tests for the burnbox CLI.
//!
//! These tests use hand-written fakes for every port and run without
//! network access or cloud credentials.

mod mocks;
mod orchestrator_scenarios;
mod readiness_scenarios;
