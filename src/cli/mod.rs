pub mod commands;

use clap::{Args, Parser, Subcommand, ValueEnum};
use kubescrape_agent::WatchMode;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "kubescrape")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Prometheus scrape target discovery for Kubernetes pods", long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Discover scrape targets and print the registry periodically")]
    Discover(DiscoverArgs),
    #[command(about = "Evaluate a single pod manifest offline")]
    Check(CheckArgs),
}

#[derive(Args, Debug, Default)]
pub struct DiscoverArgs {
    #[arg(short, long, help = "YAML discovery config; flags override its values")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Path to a kubeconfig file")]
    pub kubeconfig: Option<PathBuf>,

    #[arg(short, long, help = "Only discover pods in this namespace")]
    pub namespace: Option<String>,

    #[arg(short = 'l', long, help = "Label selector, e.g. 'app=web,tier!=cache'")]
    pub label_selector: Option<String>,

    #[arg(short = 'f', long, help = "Field selector, e.g. 'spec.nodeName=node-1'")]
    pub field_selector: Option<String>,

    #[arg(long, help = "Poll the local kubelet instead of watching the API server")]
    pub node_scrape_scope: bool,

    #[arg(long, help = "Node address for kubelet polling")]
    pub node_ip: Option<String>,

    #[arg(long, help = "Seconds between kubelet polls")]
    pub pod_scrape_interval: Option<u64>,

    #[arg(long, value_enum, help = "Cluster-wide watch strategy")]
    pub watch_mode: Option<WatchModeArg>,

    #[arg(long, help = "Bearer token file presented to the kubelet")]
    pub bearer_token_file: Option<PathBuf>,

    #[arg(
        short,
        long,
        default_value_t = 30,
        help = "Seconds between registry reports"
    )]
    pub report_interval: u64,
}

#[derive(Args, Debug)]
pub struct CheckArgs {
    #[arg(short, long, help = "Pod manifest (JSON or YAML)")]
    pub pod: PathBuf,

    #[arg(short, long, help = "Namespace the pod must be in")]
    pub namespace: Option<String>,

    #[arg(short = 'l', long, help = "Label selector to evaluate")]
    pub label_selector: Option<String>,

    #[arg(short = 'f', long, help = "Field selector to evaluate")]
    pub field_selector: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum WatchModeArg {
    Informer,
    Direct,
}

impl From<WatchModeArg> for WatchMode {
    fn from(arg: WatchModeArg) -> Self {
        match arg {
            WatchModeArg::Informer => WatchMode::Informer,
            WatchModeArg::Direct => WatchMode::Direct,
        }
    }
}
