use crate::config::Config;
use crate::credentials::CredentialStore;
use crate::oci_registry::RegistryClient;
use crate::state::{ExcludedNamespaces, NamespaceSelection, RunContext, RunOptions};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

mod annotation;
mod challenge;
mod config;
mod controller;
mod credentials;
mod error;
mod image_reference;
mod oci_registry;
mod planner;
mod pods;
mod rollout;
mod secret_string;
mod state;
mod workload;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Pins workload container images to the digests their tags currently resolve to.
#[derive(Parser, Debug)]
#[command(name = "kube-digestpin", version, about)]
struct Cli {
    /// Path to the kubeconfig file; defaults to KUBECONFIG, ~/.kube/config or the in-cluster config
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Namespace to check, may be repeated; defaults to the current namespace
    #[arg(
        short = 'n',
        long = "namespace",
        conflicts_with_all = ["all_namespaces", "exclude_namespaces"]
    )]
    namespaces: Vec<String>,

    /// Check workloads in all namespaces
    #[arg(short = 'A', long)]
    all_namespaces: bool,

    /// Skip namespaces matching this glob, may be repeated; implies --all-namespaces
    #[arg(short = 'x', long = "exclude-namespace")]
    exclude_namespaces: Vec<String>,

    /// Label selector for the workloads (not their pods)
    #[arg(short = 'l', long = "selector")]
    label_selector: Option<String>,

    /// Field selector for the workloads
    #[arg(long)]
    field_selector: Option<String>,

    /// Write updated images back; without it outdated workloads are only reported
    #[arg(long)]
    update: bool,

    /// Compare against the image digests of running pods
    #[arg(long)]
    check_pods: bool,

    /// Docker config.json with default registry credentials
    #[arg(long)]
    docker_config: Option<PathBuf>,

    /// YAML file with registry and update settings
    #[arg(long, env = "KUBE_DIGESTPIN_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    info!("Starting kube-digestpin {}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(Cli::parse()).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => Config::default(),
    };

    let default_credentials = credentials::load_default_credentials(cli.docker_config.as_deref())?;

    let kube_client = controller::create_client(cli.kubeconfig.as_deref()).await?;
    let http_client = oci_registry::create_client(&config.registry)?;

    let excluded = ExcludedNamespaces::new(&cli.exclude_namespaces)?;
    let selection = if cli.all_namespaces || !excluded.is_empty() {
        NamespaceSelection::All
    } else if cli.namespaces.is_empty() {
        NamespaceSelection::Namespaces(vec![kube_client.default_namespace().to_string()])
    } else {
        NamespaceSelection::Namespaces(cli.namespaces)
    };

    let ctx = RunContext {
        registry: RegistryClient::new(http_client, config.registry.insecure_registries.clone()),
        credentials: CredentialStore::new(kube_client.clone(), default_credentials),
        cluster: kube_client,
        options: RunOptions {
            selection,
            excluded,
            label_selector: cli.label_selector,
            field_selector: cli.field_selector,
            update: cli.update,
            check_pods: cli.check_pods,
            retry: config.update.retry_policy(),
        },
    };

    let defaults = ctx.credentials.default_auth();
    if defaults.is_empty() {
        info!("No default registry credentials found");
    } else {
        info!("Loaded default credentials for {} registries", defaults.len());
    }
    if !ctx.options.update {
        info!("Dry run, pass --update to write changes");
    }
    controller::run(&ctx).await
}
