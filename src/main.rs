//! llmgate - admission-controlled gateway for LLM provider APIs
//!
//! A local proxy that enforces per-provider concurrency, rate limits and
//! circuit breakers, and relays streamed completions as SSE.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use llmgate::config::{Config, KeySource};
use llmgate::proxy::run_server;

#[derive(Parser)]
#[command(name = "llmgate")]
#[command(about = "Admission-controlled gateway for LLM provider APIs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,

        /// Override listen address
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Validate configuration file
    Check {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },

    /// Show effective admission limits per configured provider
    Limits {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

fn init_tracing(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("llmgate={},tower_http={}", default_level, default_level).into()
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load(path: &Path) -> anyhow::Result<(Config, Vec<(llmgate::Provider, KeySource)>)> {
    Ok(Config::from_file_with_env(path)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, listen } => {
            let (mut cfg, key_sources) = load(&config)?;
            init_tracing(&cfg.logging.level);
            tracing::info!(config = %config.display(), "Loaded configuration");

            for (provider, source) in &key_sources {
                if *source == KeySource::None {
                    tracing::warn!(provider = %provider, "No API key configured");
                }
            }
            if let Some(addr) = listen {
                tracing::info!(listen = %addr, "Override listen address");
                cfg.server.listen = addr;
            }

            run_server(cfg).await
        }

        Commands::Check { config } => {
            init_tracing("warn");
            let (cfg, key_sources) = load(&config)?;
            println!("Configuration OK: {}", config.display());
            println!("  listen: {}", cfg.server.listen);
            if let Some(default) = cfg.server.default_provider {
                println!("  default provider: {}", default);
            }
            for (provider, source) in key_sources {
                println!("  {:<11} key: {}", provider.as_str(), source);
            }
            Ok(())
        }

        Commands::Limits { config } => {
            init_tracing("warn");
            let (cfg, _) = load(&config)?;
            println!(
                "{:<11} {:>10} {:>6} {:>10} {:>14}",
                "provider", "concurrent", "queue", "timeout", "rate limit"
            );
            for p in &cfg.providers {
                let limits = p.limits();
                println!(
                    "{:<11} {:>10} {:>6} {:>9}s {:>8}/{:>4}s",
                    p.provider.as_str(),
                    limits.max_concurrent_requests,
                    limits.max_queue_size,
                    limits.request_timeout.as_secs(),
                    limits.rate_limit.requests,
                    limits.rate_limit.window.as_secs(),
                );
            }
            Ok(())
        }
    }
}
