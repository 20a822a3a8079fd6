//! Integration tests for the burnbox CLI.
//!
//! These tests spawn the actual binary. None of them reach a cloud API: they
//! cover argument parsing, configuration errors, and the offline paths.

mod cli_tests;
