pub mod control_tests;
pub mod lifecycle_tests;
pub mod reload_tests;
