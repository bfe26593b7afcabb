//! chatrelay - Rate-limited streaming chat proxy
//!
//! Accepts conversations over HTTP, forwards them to an OpenRouter-compatible
//! provider, and streams the generated text back to the caller.

use std::path::Path;

use anyhow::Context;
use chatrelay::config::{Config, KeySource};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Config file read when `--config` is not given (optional).
const DEFAULT_CONFIG_PATH: &str = "chatrelay.toml";

#[derive(Parser)]
#[command(name = "chatrelay")]
#[command(about = "Rate-limited streaming chat proxy")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the proxy server
    Serve {
        /// Path to configuration file [default: chatrelay.toml if present]
        #[arg(short, long)]
        config: Option<String>,

        /// Override listen address
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Validate configuration and print the resolved settings
    Check {
        /// Path to configuration file [default: chatrelay.toml if present]
        #[arg(short, long)]
        config: Option<String>,
    },
}

/// Load configuration from an explicit path, the default file if it exists,
/// or the environment alone.
fn load_config(path: Option<&str>) -> anyhow::Result<(Config, KeySource)> {
    let loaded = match path {
        Some(path) => Config::from_file_with_env(path)
            .with_context(|| format!("loading config from {}", path))?,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            Config::from_file_with_env(DEFAULT_CONFIG_PATH)
                .with_context(|| format!("loading config from {}", DEFAULT_CONFIG_PATH))?
        }
        None => Config::from_env().context("building config from environment")?,
    };
    Ok(loaded)
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("chatrelay={},tower_http=info", level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, listen } => {
            let (mut config, key_source) = load_config(config.as_deref())?;
            init_tracing(&config.logging.level);

            if let Some(addr) = listen {
                tracing::info!(listen = %addr, "Override listen address");
                config.server.listen = addr;
            }

            match key_source {
                KeySource::None => tracing::warn!(
                    "No upstream API key found - requests will fail with the provider's 401"
                ),
                source => tracing::info!(key_source = %source, "Upstream API key loaded"),
            }

            chatrelay::proxy::run_server(config).await
        }

        Commands::Check { config } => {
            let (config, key_source) = load_config(config.as_deref())?;
            init_tracing(&config.logging.level);

            println!("Configuration OK");
            println!("  listen:        {}", config.server.listen);
            println!("  upstream:      {}", config.upstream.base_url);
            println!("  model:         {}", config.upstream.model);
            println!("  api key:       {}", key_source);
            println!(
                "  site:          {} ({})",
                config.upstream.site_name.as_deref().unwrap_or("-"),
                config.upstream.site_url.as_deref().unwrap_or("-")
            );
            println!(
                "  rate limit:    {} requests / {} ms",
                config.rate_limit.max_requests, config.rate_limit.window_ms
            );
            println!(
                "  retry:         {} attempts, {} ms base delay",
                config.retry.max_attempts, config.retry.base_delay_ms
            );
            Ok(())
        }
    }
}
