type Result<T> = color_eyre::eyre::Result<T>;

use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use svchub::{Config, Supervisor};

/// The supervisor takes no arguments; all configuration is directory
/// locations and tuning constants (see `Config`). One current-thread
/// runtime: both tables are only ever touched from the supervisor task.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    info!("svchub starting");

    let config = Config::from_env();
    Supervisor::run(config).await?;

    info!("svchub exiting");
    Ok(())
}
