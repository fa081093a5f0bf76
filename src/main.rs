use muxline::config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        udp_listen = ?config.udp_listen,
        protocol = ?config.protocol,
        max_connections = config.max_connections,
        framing = ?config.framing(),
        "Starting muxline server"
    );

    muxline::run(&config)?;
    Ok(())
}
