//! Chatrelay - persona chat relay over remote and resident local models

use anyhow::Context;
use chatrelay_core::{AppConfig, BindMode};
use chatrelay_gateway::{start_gateway, AppState};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "chatrelay",
    about = "Chatrelay - persona chat relay over remote and resident local models"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway
    Serve {
        #[arg(short, long, env = "CHATRELAY_CONFIG", default_value = "chatrelay.toml")]
        config: PathBuf,
        #[arg(short, long, env = "CHATRELAY_PORT")]
        port: Option<u16>,
        /// loopback or lan
        #[arg(short, long)]
        bind: Option<String>,
        /// Also write daily-rotated logs into this directory
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },
    /// Load and validate a configuration, then exit
    CheckConfig {
        #[arg(short, long, env = "CHATRELAY_CONFIG", default_value = "chatrelay.toml")]
        config: PathBuf,
    },
    /// Print the persona/backend catalog as JSON
    Personas {
        #[arg(short, long, env = "CHATRELAY_CONFIG", default_value = "chatrelay.toml")]
        config: PathBuf,
    },
    /// Show version
    Version,
}

/// Console logging, plus a non-blocking daily file when `log_dir` is given.
/// The returned guard must live as long as the process.
fn init_logging(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "chatrelay=info,tower_http=info".into());

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "chatrelay.log");
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
    guard
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    AppConfig::load(path).with_context(|| format!("loading {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            port,
            bind,
            log_dir,
        } => {
            let _guard = init_logging(log_dir.as_deref());
            let mut app_config = load_config(&config)?;
            if let Some(port) = port {
                app_config.server.port = port;
            }
            if let Some(bind) = bind {
                app_config.server.bind = match bind.as_str() {
                    "loopback" | "localhost" | "127.0.0.1" => BindMode::Loopback,
                    "lan" | "0.0.0.0" => BindMode::Lan,
                    other => anyhow::bail!("unknown bind mode: {}", other),
                };
            }
            start_gateway(app_config).await?;
        }

        Commands::CheckConfig { config } => {
            let _guard = init_logging(None);
            let app_config = load_config(&config)?;
            let state = AppState::from_config(app_config)?;
            let orch = &state.orchestrator;
            println!(
                "{}: ok ({} personas, {} backends, {} slots)",
                config.display(),
                orch.personas().len(),
                orch.backends().list(None).len(),
                orch.slots().slot_count()
            );
        }

        Commands::Personas { config } => {
            let _guard = init_logging(None);
            let state = AppState::from_config(load_config(&config)?)?;
            let catalog = state.orchestrator.catalog();
            println!("{}", serde_json::to_string_pretty(&catalog)?);
        }

        Commands::Version => {
            println!("chatrelay v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
