//! Trackrelay CLI - standalone live-tracking server

use clap::Parser;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use trackrelay::{Config, Core};

#[derive(Parser, Debug)]
#[command(name = "trackrelay")]
#[command(version)]
#[command(about = "Trackrelay - headless live-tracking server", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "TRACKRELAY_CONFIG",
        default_value = "~/.trackrelay/config.toml"
    )]
    config: PathBuf,

    /// Override server port
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Initialize a new config file with defaults
    #[arg(long)]
    init: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Handle --init flag. Plain prints: logging is configured from the
    // file this flag is about to create.
    if args.init {
        let config_path = trackrelay::config::expand_path(&args.config);
        if config_path.exists() {
            println!("Config file already exists: {}", config_path.display());
            return Ok(());
        }
        Config::create_default(&config_path)?;
        println!("Created default config at: {}", config_path.display());
        println!("Add credentials to the .users file next to the track directory before starting.");
        return Ok(());
    }

    // Load configuration
    let config_path = trackrelay::config::expand_path(&args.config);
    if !config_path.exists() {
        anyhow::bail!(
            "Configuration file not found: {} (run `trackrelay --init` to create one)",
            config_path.display()
        );
    }
    let mut config = Config::from_file(&config_path)?;

    // Apply CLI overrides
    if let Some(port) = args.port {
        config.server.port = Some(port);
    }

    // Initialize logging
    let log_level = if args.verbose {
        "debug"
    } else {
        config.log.level.as_str()
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("trackrelay={},tower_http=debug", log_level).into());

    let (file_layer, _guard) = match &config.log.file {
        Some(file) => {
            let file = trackrelay::config::expand_path(file);
            let dir = file.parent().filter(|p| !p.as_os_str().is_empty());
            let name = file
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "trackrelay.log".into());
            let appender =
                tracing_appender::rolling::never(dir.unwrap_or_else(|| Path::new(".")), name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    // Create core instance and run until shutdown
    let core = Core::new(config)?;
    tracing::info!(
        "Starting trackrelay with {} destination(s)",
        core.config.destinations.len()
    );
    core.start_server().await?;

    Ok(())
}
