//! CLI for agentbus
//!
//! Subcommands:
//! - `serve`: run the broker with its WebSocket gateway
//! - `show-config`: print the effective configuration and exit

use std::process::ExitCode;
use std::sync::Arc;

use agentbus::MessageBroker;
use agentbus::config::{Settings, load_config};
use agentbus::transport::websocket::start_websocket_server;
use agentbus::utils::logging;
use clap::Parser;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "agentbus", version, about = "Message broker for cooperating agents")]
enum Command {
    /// Start the broker and its WebSocket gateway
    Serve {
        /// Override the configured log level
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Print the effective configuration as JSON
    ShowConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cmd = Command::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cmd {
        Command::Serve { log_level } => {
            logging::init(log_level.as_deref().unwrap_or(&settings.logging.level));
            if let Err(e) = run_server(settings).await {
                error!("Server failed: {e}");
                return ExitCode::FAILURE;
            }
        }
        Command::ShowConfig => match serde_json::to_string_pretty(&settings) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                logging::init("info");
                error!("Failed to render configuration: {e}");
                return ExitCode::FAILURE;
            }
        },
    }
    ExitCode::SUCCESS
}

async fn run_server(settings: Settings) -> agentbus::Result<()> {
    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let broker = Arc::new(MessageBroker::new(&settings)?);
    broker.start_maintenance();

    let outcome = tokio::select! {
        result = start_websocket_server(&addr, broker.clone()) => {
            error!("WebSocket gateway exited unexpectedly.");
            result
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
            Ok(())
        }
    };

    broker.shutdown().await;
    outcome
}
