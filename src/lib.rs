pub type Result<T> = color_eyre::eyre::Result<T>;

pub mod config;
pub mod launcher;
pub mod loader;
pub mod protocol;
pub mod registry;
pub mod ring;
pub mod sequencer;
pub mod server;
pub mod signals;
pub mod supervisor;
pub mod watcher;

pub use config::Config;
pub use supervisor::Supervisor;
