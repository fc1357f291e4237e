use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// castdeckd — headless control-deck daemon for streaming production engines
#[derive(Parser)]
#[command(name = "castdeckd", version, about)]
struct Cli {
    /// Path to the settings file (TOML).
    #[arg(short, long, default_value = "/etc/castdeckd/config.toml")]
    config: PathBuf,

    /// Enable JSON log output (for journald).
    #[arg(long)]
    json: bool,

    /// Validate settings and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Init tracing.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("castdeckd=info"));

    if cli.json {
        fmt().with_env_filter(filter).json().init();
    } else {
        fmt().with_env_filter(filter).init();
    }

    info!("castdeckd v{}", env!("CARGO_PKG_VERSION"));

    // Load settings.
    let config_path = cli
        .config
        .canonicalize()
        .unwrap_or_else(|_| cli.config.clone());
    let settings = castdeckd::config::load(&config_path)?;

    if cli.check {
        println!(
            "config OK: engine {} | api {} | store {}",
            settings.engine.url(),
            settings.server.bind,
            settings.store.path.display(),
        );
        return Ok(());
    }

    // Run the daemon.
    castdeckd::daemon::run(settings).await?;

    Ok(())
}
