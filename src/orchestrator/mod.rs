//! The outer control loop
//!
//! The orchestrator owns everything with cross-tick lifetime: the kube
//! client, the discovery state, the open vCenter sessions, the cached
//! master key, and the reconciler with its previous desired state. Each
//! tick it reloads config, refreshes the vCenter set from DNS, polls
//! every vCenter's inventory, renders all scopes, and hands the finished
//! desired state to the reconciler. Rendering always completes before the
//! first write.
//!
//! Failure policy follows the error taxonomy: configuration and KDF
//! errors terminate the process (the platform restarts it); everything
//! transient is logged, the affected unit of work is skipped, and the
//! next tick retries.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config::OperatorConfig;
use crate::discovery::{designate_endpoint, AxfrZoneSource, Discovery};
use crate::password::{vcenter_password, MasterKey};
use crate::reconcile::{Reconciler, ResourceClient};
use crate::state::DesiredState;
use crate::template::{
    Options, TemplateRenderer, SCOPE_CLUSTER, SCOPE_DATACENTER, SCOPE_GLOBAL,
};
use crate::vcenter::{
    apply_config_hash, classify, cluster_options, SessionFactory, VCenter,
};
use crate::{Error, Result, DNS_TIMEOUT_SECS, VCENTER_POLL_TIMEOUT_SECS};

/// Static settings for the control loop
#[derive(Clone, Debug)]
pub struct OrchestratorSettings {
    /// Namespace the operator runs in (ConfigMap and DNS Service live here)
    pub own_namespace: String,
    /// DNS zone holding the vCenter host records
    pub domain: String,
    /// Whether the process runs inside the cluster
    pub in_cluster: bool,
    /// Time between ticks
    pub interval: Duration,
    /// Force dry-run regardless of the ConfigMap
    pub dry_run_override: bool,
}

struct MasterCache {
    username: String,
    password: String,
    key: MasterKey,
}

/// Top-level loop driving discovery, inventory, rendering, and reconciliation
pub struct Orchestrator {
    client: Client,
    settings: OrchestratorSettings,
    renderer: TemplateRenderer,
    reconciler: Reconciler,
    discovery: Discovery,
    sessions: Arc<dyn SessionFactory>,
    vcenters: BTreeMap<String, VCenter>,
    master: Option<MasterCache>,
}

impl Orchestrator {
    /// Create an orchestrator; nothing is contacted until [`run`](Self::run)
    pub fn new(
        client: Client,
        settings: OrchestratorSettings,
        renderer: TemplateRenderer,
        sessions: Arc<dyn SessionFactory>,
        resources: Arc<dyn ResourceClient>,
    ) -> Self {
        Self {
            client,
            settings,
            renderer,
            reconciler: Reconciler::new(resources),
            discovery: Discovery::new(),
            sessions,
            vcenters: BTreeMap::new(),
            master: None,
        }
    }

    /// Run the control loop until shutdown
    ///
    /// Terminates with an error on configuration or KDF failures; the
    /// supervising platform is expected to restart the process. A shutdown
    /// signal finishes the current tick and disconnects all sessions.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            domain = %self.settings.domain,
            namespace = %self.settings.own_namespace,
            interval = ?self.settings.interval,
            "starting control loop"
        );

        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "fatal error in control loop");
                        self.shutdown().await;
                        return Err(e);
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// One pass of the control loop
    pub async fn tick(&mut self) -> Result<()> {
        let config = match OperatorConfig::load(self.client.clone(), &self.settings.own_namespace)
            .await
        {
            Ok(config) => config,
            Err(e @ Error::Config(_)) => return Err(e),
            Err(e) => {
                warn!(error = %e, "cannot load runtime config, skipping tick");
                return Ok(());
            }
        };

        self.ensure_master_key(&config)?;
        let master_key = self
            .master
            .as_ref()
            .map(|cache| cache.key.clone())
            .expect("master key derived above");

        if let Err(e) = self.discover().await {
            warn!(error = %e, "dns discovery failed, keeping known vcenter set");
        }
        let known = self.discovery.known().clone();
        sync_vcenters(
            &mut self.vcenters,
            self.sessions.as_ref(),
            &config,
            &master_key,
            &known,
        )
        .await;

        let desired =
            render_desired_state(&self.renderer, &self.vcenters, &config, Some(&master_key)).await;

        let dry_run = config.dry_run || self.settings.dry_run_override;
        let outcome = self
            .reconciler
            .apply(&config.namespace, desired, dry_run)
            .await;
        info!(
            created = outcome.created,
            patched = outcome.patched,
            deleted = outcome.deleted,
            unchanged = outcome.unchanged,
            failed = outcome.failed,
            dry_run,
            "tick complete"
        );
        Ok(())
    }

    /// Refresh the known vCenter set from the DNS zone
    async fn discover(&mut self) -> Result<()> {
        let endpoint = designate_endpoint(
            self.client.clone(),
            &self.settings.own_namespace,
            self.settings.in_cluster,
        )
        .await?;
        let source = AxfrZoneSource::new(endpoint, Duration::from_secs(DNS_TIMEOUT_SECS));
        self.discovery.poll(&source, &self.settings.domain).await?;
        Ok(())
    }

    /// Keep the stretched master key in step with the config credentials
    fn ensure_master_key(&mut self, config: &OperatorConfig) -> Result<()> {
        let stale = match &self.master {
            Some(cache) => {
                cache.username != config.username || cache.password != config.password
            }
            None => true,
        };
        if stale {
            if self.master.is_some() {
                info!("master credentials changed, re-deriving master key");
            }
            let key = MasterKey::new(&config.username, &config.password)?;
            self.master = Some(MasterCache {
                username: config.username.clone(),
                password: config.password.clone(),
                key,
            });
        }
        Ok(())
    }

    /// Best-effort disconnect from every vCenter
    async fn shutdown(&mut self) {
        for (host, vcenter) in std::mem::take(&mut self.vcenters) {
            vcenter.session.disconnect().await;
            info!(host = %host, "vcenter disconnected");
        }
    }
}

/// Converge the session map toward the known host set
///
/// Hosts gone from DNS are disconnected and dropped; hosts without a
/// session get one. A failed connect leaves the host out of the map so
/// the next tick retries it.
async fn sync_vcenters(
    vcenters: &mut BTreeMap<String, VCenter>,
    sessions: &dyn SessionFactory,
    config: &OperatorConfig,
    master_key: &MasterKey,
    known: &BTreeSet<String>,
) {
    let gone: Vec<String> = vcenters
        .keys()
        .filter(|host| !known.contains(*host))
        .cloned()
        .collect();
    for host in gone {
        if let Some(vcenter) = vcenters.remove(&host) {
            vcenter.session.disconnect().await;
            info!(host = %host, "vcenter dropped");
        }
    }

    for host in known {
        if vcenters.contains_key(host) {
            continue;
        }
        let password = match vcenter_password(master_key, host) {
            Ok(password) => password,
            Err(e) => {
                warn!(host = %host, error = %e, "cannot derive vcenter password");
                continue;
            }
        };
        match sessions.connect(host, &config.username, &password).await {
            Ok(session) => {
                info!(host = %host, "vcenter connected");
                vcenters.insert(
                    host.clone(),
                    VCenter {
                        name: VCenter::short_name(host),
                        host: host.clone(),
                        username: config.username.clone(),
                        password,
                        session,
                    },
                );
            }
            Err(e) => {
                warn!(host = %host, error = %e, "cannot connect vcenter, will retry next tick");
            }
        }
    }
}

/// Poll every vCenter and render all scopes into one desired state
///
/// Scope order per tick: `global` once, `vcenter_cluster` per matching
/// cluster, `vcenter_datacenter` per availability zone. A vCenter that
/// fails or times out contributes nothing this tick; the others proceed.
async fn render_desired_state(
    renderer: &TemplateRenderer,
    vcenters: &BTreeMap<String, VCenter>,
    config: &OperatorConfig,
    master_key: Option<&MasterKey>,
) -> DesiredState {
    let mut state = DesiredState::new();

    let mut global = global_options(config);
    apply_config_hash(&mut global);
    render_into(&mut state, renderer, SCOPE_GLOBAL, &global, master_key);

    let mut zones = BTreeSet::new();
    for vcenter in vcenters.values() {
        let poll = timeout(
            Duration::from_secs(VCENTER_POLL_TIMEOUT_SECS),
            vcenter.session.clusters(),
        )
        .await;
        let inventories = match poll {
            Ok(Ok(inventories)) => inventories,
            Ok(Err(e)) => {
                warn!(host = %vcenter.host, error = %e, "inventory poll failed, skipping vcenter this tick");
                continue;
            }
            Err(_) => {
                warn!(host = %vcenter.host, "inventory poll timed out, skipping vcenter this tick");
                continue;
            }
        };

        for inventory in inventories {
            let attributes = match classify(&inventory, config.pbm_enabled) {
                Some(attributes) => attributes,
                None => continue,
            };
            zones.insert(attributes.availability_zone.clone());
            let options = cluster_options(&config.options, vcenter, &attributes);
            render_into(&mut state, renderer, SCOPE_CLUSTER, &options, master_key);
        }
    }

    for zone in zones {
        let mut options = global.clone();
        options.insert("availability_zone".to_string(), zone);
        apply_config_hash(&mut options);
        render_into(&mut state, renderer, SCOPE_DATACENTER, &options, master_key);
    }

    state
}

/// Global options: the config map with the master secret remapped
fn global_options(config: &OperatorConfig) -> Options {
    let mut options = config.options.clone();
    if let Some(master) = options.remove("password") {
        options.insert("master_password".to_string(), master);
    }
    options
}

fn render_into(
    state: &mut DesiredState,
    renderer: &TemplateRenderer,
    scope: &str,
    options: &Options,
    master_key: Option<&MasterKey>,
) {
    match renderer.render_scope(scope, options, master_key) {
        Ok(stream) => {
            if let Err(e) = state.add_documents(&stream) {
                warn!(scope, error = %e, "rendered stream not parseable");
            }
        }
        Err(e) => error!(scope, error = %e, "cannot render scope"),
    }
}
