//! Shared types for kubescrape
//!
//! This crate holds what both the agent and the CLI need without pulling in a
//! Kubernetes client:
//! - The annotation keys pods use to opt in to scraping
//! - The label and field selector language used to scope discovery

pub mod fields;
pub mod labels;

pub use fields::FieldSelector;
pub use labels::LabelSelector;

use thiserror::Error;

/// Annotation keys read from pod metadata
pub mod annotations {
    /// Must equal `"true"` for a pod to be scraped
    pub const SCRAPE: &str = "prometheus.io/scrape";
    /// `http` or `https`
    pub const SCHEME: &str = "prometheus.io/scheme";
    /// Path and optional query of the metrics endpoint
    pub const PATH: &str = "prometheus.io/path";
    pub const PORT: &str = "prometheus.io/port";
}

/// Defaults applied when a pod leaves the corresponding annotation unset
pub mod defaults {
    pub const SCHEME: &str = "http";
    pub const PORT: &str = "9102";
    pub const PATH: &str = "/metrics";
}

/// Tag keys synthesized for every scrape target
pub mod tags {
    pub const POD_NAME: &str = "pod_name";
    pub const POD_NAMESPACE: &str = "pod_namespace";
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectorError {
    #[error("unexpected {found} at position {position} in selector {input:?}, expected {expected}")]
    Unexpected {
        input: String,
        position: usize,
        found: String,
        expected: &'static str,
    },

    #[error("operator {operator} on key {key:?} requires at least one value")]
    EmptyValueSet { key: String, operator: &'static str },

    #[error("value {value:?} for key {key:?} is not an integer")]
    NotAnInteger { key: String, value: String },

    #[error("invalid field selector term {0:?}")]
    InvalidFieldTerm(String),
}
