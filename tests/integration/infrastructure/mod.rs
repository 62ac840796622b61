pub mod daemon_harness;

pub use control_client::ControlClient;
pub use daemon_harness::DaemonHarness;
