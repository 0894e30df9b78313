//! kubescrape-agent - discovers pod scrape targets
//!
//! Runs as a Deployment with cluster-wide pod access, or as a DaemonSet in
//! node scrape scope. Configuration is read from the YAML file named by
//! `KUBESCRAPE_CONFIG`.

use anyhow::{Context, Result};
use kubescrape_agent::{Discovery, DiscoveryConfig, Reconciler, TargetRegistry};
use log::info;
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;

const CONFIG_ENV: &str = "KUBESCRAPE_CONFIG";
const REPORT_INTERVAL: Duration = Duration::from_secs(60);

fn load_config() -> Result<DiscoveryConfig> {
    match std::env::var_os(CONFIG_ENV) {
        Some(path) => {
            let path = PathBuf::from(path);
            info!("Loading configuration from {}", path.display());
            DiscoveryConfig::from_yaml_file(&path)
                .with_context(|| format!("failed to load {}", path.display()))
        }
        None => Ok(DiscoveryConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("kubescrape-agent starting...");

    let config = load_config()?;
    let registry = TargetRegistry::new();
    let discovery = Discovery::new(config, Reconciler::new(registry.clone()))?;

    let token = CancellationToken::new();
    let discovery_task = {
        let token = token.clone();
        tokio::spawn(async move { discovery.run(token).await })
    };

    info!("kubescrape-agent running. Press Ctrl+C to exit.");

    let mut report = tokio::time::interval(REPORT_INTERVAL);
    report.tick().await;

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            _ = report.tick() => {
                info!("Tracking {} scrape targets", registry.len());
            }
        }
    }

    token.cancel();
    discovery_task.await?;

    info!("kubescrape-agent stopped");
    Ok(())
}
