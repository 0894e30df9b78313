//! Kubernetes client and credential loading

use crate::error::{DiscoveryError, Result};
use k8s_openapi::api::core::v1::Pod;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use log::{debug, info};
use secrecy::ExposeSecret;
use std::path::{Path, PathBuf};

/// Token mounted into every pod that runs with a service account
pub const SERVICE_ACCOUNT_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// Build a client configuration
///
/// An explicit kubeconfig path wins. Otherwise in-cluster credentials are
/// tried first, then the default kubeconfig location (`$KUBECONFIG` or
/// `~/.kube/config`).
pub async fn load_config(kubeconfig: Option<&Path>) -> Result<Config> {
    if let Some(path) = kubeconfig {
        debug!("Loading kubeconfig from {}", path.display());
        let kubeconfig = Kubeconfig::read_from(path)?;
        let config =
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
        return Ok(config);
    }

    match Config::incluster() {
        Ok(config) => {
            debug!("Using in-cluster configuration");
            Ok(config)
        }
        Err(e) => {
            debug!(
                "In-cluster configuration unavailable ({}), trying default kubeconfig",
                e
            );
            Ok(Config::from_kubeconfig(&KubeConfigOptions::default()).await?)
        }
    }
}

pub async fn init_client(config: Config) -> Result<Client> {
    let client = Client::try_from(config)?;
    info!("Kubernetes client initialized");
    Ok(client)
}

/// Pod API scoped to a namespace, or cluster-wide when none is given
pub fn pod_api(client: Client, namespace: Option<&str>) -> Api<Pod> {
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Bearer token presented to the kubelet
///
/// Looks at the explicit override, then an inline token in the client
/// configuration, then its token file, then the service account mount.
pub async fn bearer_token(config: &Config, override_path: Option<&Path>) -> Result<String> {
    if let Some(path) = override_path {
        return read_token(path).await;
    }

    if let Some(token) = config
        .auth_info
        .token
        .as_ref()
        .map(|t| t.expose_secret().trim())
        .filter(|t| !t.is_empty())
    {
        return Ok(token.to_string());
    }

    let path = config
        .auth_info
        .token_file
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(SERVICE_ACCOUNT_TOKEN_PATH));

    read_token(&path).await
}

async fn read_token(path: &Path) -> Result<String> {
    let token = tokio::fs::read_to_string(path).await.map_err(|e| {
        DiscoveryError::Config(format!(
            "failed to read bearer token from {}: {}",
            path.display(),
            e
        ))
    })?;

    let token = token.trim().to_string();
    if token.is_empty() {
        return Err(DiscoveryError::Config(format!(
            "bearer token file {} is empty",
            path.display()
        )));
    }

    Ok(token)
}
