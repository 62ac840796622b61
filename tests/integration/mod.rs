//! Integration testing framework for the svchub supervisor
//!
//! This module provides testing capabilities for the boot sequence, the
//! control protocol, directory reconciliation, output capture, and the
//! shutdown escalation path.

pub mod infrastructure;
pub mod scenarios;

// Re-export commonly used types for convenience
pub use infrastructure::{ControlClient, DaemonHarness};
