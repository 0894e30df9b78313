use kubescrape_agent::DiscoveryError;
use kubescrape_common::SelectorError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KubescrapeError {
    #[error("Discovery error: {0}")]
    DiscoveryError(#[from] DiscoveryError),

    #[error("Invalid selector: {0}")]
    SelectorError(#[from] SelectorError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Failed to decode pod from {path}: {message}")]
    PodDecodeError { path: String, message: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Task failed: {0}")]
    TaskError(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, KubescrapeError>;
