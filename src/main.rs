use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use docthread::AppContext;
use docthread::config::Config;
use docthread::server;

#[derive(Parser, Debug)]
#[command(name = "docthread", version, about = "Document conversation server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP and WebSocket server
    Serve {
        /// Path to the JSON config file
        #[arg(long, default_value = "")]
        config: String,
        /// Override the configured bind address
        #[arg(long)]
        bind: Option<String>,
    },
    /// Ingest a file and print the stored document
    Ingest {
        file: PathBuf,
        #[arg(long, default_value = "")]
        config: String,
    },
    /// Validate the configuration and exit
    CheckConfig {
        #[arg(long, default_value = "")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Cli::parse().command {
        Command::Serve { config, bind } => {
            let mut config = Config::load(&config)?;
            if let Some(bind) = bind {
                config.bind_addr = bind;
            }
            config.validate().context("invalid configuration")?;
            let addr = config.socket_addr()?;

            info!("Starting docthread {}...", env!("CARGO_PKG_VERSION"));
            let ctx = AppContext::from_config(config)?;
            server::serve(ctx, addr).await
        }
        Command::Ingest { file, config } => {
            let config = Config::load(&config)?;
            config.validate().context("invalid configuration")?;
            let bytes = std::fs::read(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let filename = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            let ctx = AppContext::from_config(config)?;
            let stored = ctx.ingest(bytes, filename).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "document": stored.document,
                    "chunk_count": stored.chunks.len(),
                    "main_conversation_id": stored.main_conversation.id,
                }))?
            );
            Ok(())
        }
        Command::CheckConfig { config } => {
            let config = Config::load(&config)?;
            config.validate()?;
            println!("configuration OK");
            Ok(())
        }
    }
}
