use kubescrape_common::SelectorError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid selector: {0}")]
    Selector(#[from] SelectorError),

    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Failed to load kubeconfig: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    #[error("Watch error: {0}")]
    Watch(String),

    #[error("Request for pod list failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Request for pod list returned status {0}")]
    Status(reqwest::StatusCode),

    #[error("Decoding pod list failed: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure to turn a pod's declared endpoint into a URL
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("invalid port {port:?} declared by pod {key}")]
    InvalidPort { key: String, port: String },

    #[error("could not parse path {path:?} declared by pod {key}: {reason}")]
    InvalidPath {
        key: String,
        path: String,
        reason: &'static str,
    },

    #[error("could not build URL for pod {key}: {source}")]
    InvalidUrl {
        key: String,
        #[source]
        source: http::Error,
    },
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;
