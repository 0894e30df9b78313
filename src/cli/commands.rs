use crate::cli::{CheckArgs, Commands, DiscoverArgs};
use crate::{KubescrapeError, Result};
use k8s_openapi::api::core::v1::Pod;
use kubescrape_agent::filter::{has_scrape_annotation, is_ready, pod_key};
use kubescrape_agent::{
    resolve, Discovery, DiscoveryConfig, Reconciler, ScopeFilter, ScrapeTarget, TargetRegistry,
};
use kubescrape_common::{FieldSelector, LabelSelector};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub async fn handle_command(command: Commands) -> Result<()> {
    match command {
        Commands::Discover(args) => handle_discover(args).await,
        Commands::Check(args) => handle_check(args).await,
    }
}

/// Merge the optional config file with command line flags
pub fn build_config(args: &DiscoverArgs) -> Result<DiscoveryConfig> {
    let mut config = match &args.config {
        Some(path) => DiscoveryConfig::from_yaml_file(path)?,
        None => DiscoveryConfig::default(),
    };

    if let Some(path) = &args.kubeconfig {
        config.kube_config = Some(path.clone());
    }
    if let Some(ns) = &args.namespace {
        config.namespace = Some(ns.clone());
    }
    if let Some(selector) = &args.label_selector {
        config.label_selector = Some(selector.clone());
    }
    if let Some(selector) = &args.field_selector {
        config.field_selector = Some(selector.clone());
    }
    if args.node_scrape_scope {
        config.node_scrape_scope = true;
    }
    if let Some(ip) = &args.node_ip {
        config.node_ip = Some(ip.clone());
    }
    if let Some(interval) = args.pod_scrape_interval {
        config.pod_scrape_interval = interval;
    }
    if let Some(mode) = args.watch_mode {
        config.watch_mode = mode.into();
    }
    if let Some(path) = &args.bearer_token_file {
        config.bearer_token_file = Some(path.clone());
    }

    config.validate()?;
    Ok(config)
}

async fn handle_discover(args: DiscoverArgs) -> Result<()> {
    if args.report_interval == 0 {
        return Err(KubescrapeError::ConfigError(
            "report interval must be at least one second".to_string(),
        ));
    }

    let config = build_config(&args)?;
    info!(
        "Discovering pods (namespace: {}, node scope: {})",
        config.namespace().unwrap_or("<all>"),
        config.node_scrape_scope
    );

    let registry = TargetRegistry::new();
    let discovery = Discovery::new(config, Reconciler::new(registry.clone()))?;

    let token = CancellationToken::new();
    let task = {
        let token = token.clone();
        tokio::spawn(async move { discovery.run(token).await })
    };

    let mut report = tokio::time::interval(Duration::from_secs(args.report_interval));
    report.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            _ = report.tick() => {
                print!("{}", format_registry(&registry.snapshot()));
            }
        }
    }

    token.cancel();
    task.await?;
    Ok(())
}

/// One line per target: key, URL and sorted tags
pub fn format_registry(targets: &BTreeMap<String, ScrapeTarget>) -> String {
    let mut out = format!("{} scrape targets\n", targets.len());
    for (key, target) in targets {
        let tags: Vec<String> = target
            .tags
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        out.push_str(&format!("{}\t{}\t{}\n", key, target.url, tags.join(",")));
    }
    out
}

/// Read a pod manifest, as JSON for `.json` files and YAML otherwise
pub fn load_pod(path: &Path) -> Result<Pod> {
    let raw = std::fs::read_to_string(path)?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    let decoded = if is_json {
        serde_json::from_str(&raw).map_err(|e| e.to_string())
    } else {
        serde_yaml::from_str(&raw).map_err(|e| e.to_string())
    };

    decoded.map_err(|message| KubescrapeError::PodDecodeError {
        path: path.display().to_string(),
        message,
    })
}

/// Offline verdict for a single pod
#[derive(Debug)]
pub struct CheckReport {
    pub key: String,
    pub annotated: bool,
    pub ready: bool,
    pub namespace_match: bool,
    pub labels_match: bool,
    pub fields_match: bool,
    pub target: std::result::Result<ScrapeTarget, String>,
}

impl CheckReport {
    pub fn is_eligible(&self) -> bool {
        self.annotated && self.ready && self.namespace_match && self.labels_match && self.fields_match
    }
}

/// Run the eligibility checks and resolution the discovery backends use
pub fn evaluate(pod: &Pod, filter: &ScopeFilter) -> CheckReport {
    let target = match resolve(pod) {
        Err(e) => Err(e.to_string()),
        Ok(None) => Err("pod has no IP address yet".to_string()),
        Ok(Some(_)) if !has_scrape_annotation(pod) => {
            Err("pod is not annotated for scraping".to_string())
        }
        Ok(Some(_)) => {
            let reconciler = Reconciler::new(TargetRegistry::new());
            reconciler.register_pod(pod);
            reconciler
                .registry()
                .get(&pod_key(pod))
                .ok_or_else(|| "pod was not registered".to_string())
        }
    };

    CheckReport {
        key: pod_key(pod),
        annotated: has_scrape_annotation(pod),
        ready: is_ready(pod),
        namespace_match: filter.matches_namespace(pod),
        labels_match: filter.matches_labels(pod),
        fields_match: filter.matches_fields(pod),
        target,
    }
}

fn verdict(ok: bool) -> &'static str {
    if ok {
        "yes"
    } else {
        "no"
    }
}

impl fmt::Display for CheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Pod:              {}", self.key)?;
        writeln!(f, "Scrape annotated: {}", verdict(self.annotated))?;
        writeln!(f, "Ready:            {}", verdict(self.ready))?;
        writeln!(f, "Namespace match:  {}", verdict(self.namespace_match))?;
        writeln!(f, "Labels match:     {}", verdict(self.labels_match))?;
        writeln!(f, "Fields match:     {}", verdict(self.fields_match))?;
        writeln!(f, "Eligible:         {}", verdict(self.is_eligible()))?;

        match &self.target {
            Ok(target) => {
                writeln!(f, "Target:           {}", target.url)?;
                for (k, v) in &target.tags {
                    writeln!(f, "  {}={}", k, v)?;
                }
            }
            Err(reason) => writeln!(f, "Target:           none ({})", reason)?,
        }
        Ok(())
    }
}

async fn handle_check(args: CheckArgs) -> Result<()> {
    info!("Checking pod manifest {}", args.pod.display());

    let pod = load_pod(&args.pod)?;
    let labels = args
        .label_selector
        .as_deref()
        .map(LabelSelector::parse)
        .transpose()?;
    let fields = args
        .field_selector
        .as_deref()
        .map(FieldSelector::parse)
        .transpose()?;
    let filter = ScopeFilter::new(args.namespace, labels, fields);

    print!("{}", evaluate(&pod, &filter));
    Ok(())
}
