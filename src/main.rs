use clap::Parser;
use kubescrape::cli::{commands, Cli};
use std::process;
use tracing::{info, warn};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };

    // RUST_LOG overrides --verbose
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    // try_init also forwards `log` records from the agent crate
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    if let Err(e) = subscriber.try_init() {
        warn!("Failed to set tracing subscriber: {}", e);
    }

    info!("Starting kubescrape v{}", env!("CARGO_PKG_VERSION"));

    let result = match cli.command {
        Some(command) => commands::handle_command(command).await,
        None => {
            eprintln!("No command specified. Use --help for usage information.");
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
