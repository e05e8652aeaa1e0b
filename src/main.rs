//! vCenter Operator - inventory-driven Kubernetes manifest reconciliation

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::Client;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vcenter_operator::config;
use vcenter_operator::orchestrator::{Orchestrator, OrchestratorSettings};
use vcenter_operator::reconcile::DynamicResourceClient;
use vcenter_operator::template::TemplateRenderer;
use vcenter_operator::vcenter::{VimSessionFactory, VimSettings};

/// vCenter Operator - renders and reconciles manifests from vCenter inventory
#[derive(Parser, Debug)]
#[command(name = "vcenter-operator", version, about, long_about = None)]
struct Cli {
    /// Directory holding the manifest templates
    #[arg(
        long,
        env = "VCENTER_OPERATOR_TEMPLATES",
        default_value = "/var/lib/vcenter-operator/templates"
    )]
    templates: PathBuf,

    /// Seconds between ticks of the control loop
    #[arg(long, default_value_t = vcenter_operator::DEFAULT_TICK_INTERVAL_SECS)]
    interval: u64,

    /// Log intended writes without performing them, regardless of config
    #[arg(long)]
    dry_run: bool,

    /// Verify vCenter TLS certificates
    #[arg(long)]
    vcenter_verify_tls: bool,

    /// DNS domain holding the vCenter records (detected if omitted)
    #[arg(long)]
    domain: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let in_cluster = config::running_in_cluster();
    let own_namespace = config::own_namespace().map_err(|e| anyhow::anyhow!("{}", e))?;
    let domain = match cli.domain {
        Some(domain) => domain,
        None => config::detect_domain().map_err(|e| anyhow::anyhow!("{}", e))?,
    };

    let client = Client::try_default().await?;

    let settings = OrchestratorSettings {
        own_namespace,
        domain,
        in_cluster,
        interval: Duration::from_secs(cli.interval),
        dry_run_override: cli.dry_run,
    };

    let renderer = TemplateRenderer::new(cli.templates);
    let sessions = Arc::new(VimSessionFactory::new(VimSettings {
        verify_tls: cli.vcenter_verify_tls,
        ..VimSettings::default()
    }));
    let resources = Arc::new(DynamicResourceClient::new(client.clone()));

    let mut orchestrator = Orchestrator::new(client, settings, renderer, sessions, resources);
    orchestrator.run().await.map_err(|e| anyhow::anyhow!("{}", e))
}
