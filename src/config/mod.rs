//! Runtime configuration
//!
//! All runtime configuration lives in one ConfigMap in the operator's own
//! namespace and is re-read at the start of every tick; redeploying the
//! operator is never needed for a config change. Beyond the recognized
//! keys, everything in the map is forwarded to templates as-is.
//!
//! The operator's own namespace and the DNS domain are detected from the
//! environment: the service-account files in-cluster, the active
//! kube-config context outside.

use std::collections::BTreeMap;
use std::path::Path;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::Api;
use kube::config::Kubeconfig;
use kube::Client;

use crate::template::Options;
use crate::{Error, Result, CONFIG_MAP_NAME};

/// Namespace file mounted into every pod with a service account
const SERVICE_ACCOUNT_NAMESPACE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Parsed runtime configuration for one tick
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// vCenter login user
    pub username: String,
    /// Master secret feeding the password derivation
    pub password: String,
    /// Target namespace for rendered resources
    pub namespace: String,
    /// Perform reads and diffs but no writes
    pub dry_run: bool,
    /// Policy-based storage management; suppresses datastore regexes
    pub pbm_enabled: bool,
    /// The full map, forwarded to templates
    pub options: Options,
}

impl OperatorConfig {
    /// Parse the ConfigMap data
    pub fn from_data(data: BTreeMap<String, String>) -> Result<Self> {
        let required = |key: &str| -> Result<String> {
            data.get(key)
                .filter(|value| !value.is_empty())
                .cloned()
                .ok_or_else(|| Error::config(format!("missing required config key {:?}", key)))
        };

        Ok(Self {
            username: required("username")?,
            password: required("password")?,
            namespace: required("namespace")?,
            dry_run: flag(&data, "dry_run"),
            pbm_enabled: flag(&data, "pbm_enabled"),
            options: data,
        })
    }

    /// Load the operator ConfigMap from the API
    pub async fn load(client: Client, own_namespace: &str) -> Result<Self> {
        let configmaps: Api<ConfigMap> = Api::namespaced(client, own_namespace);
        let configmap = configmaps.get(CONFIG_MAP_NAME).await?;
        Self::from_data(configmap.data.unwrap_or_default())
    }
}

fn flag(data: &BTreeMap<String, String>, key: &str) -> bool {
    data.get(key)
        .map(|value| value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Whether the process runs inside a Kubernetes pod
pub fn running_in_cluster() -> bool {
    Path::new(SERVICE_ACCOUNT_NAMESPACE).exists()
}

/// The namespace the operator itself runs in
///
/// In-cluster this is the service-account namespace; outside it comes
/// from the active kube-config context, defaulting to `default`.
pub fn own_namespace() -> Result<String> {
    if running_in_cluster() {
        let namespace = std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE)
            .map_err(|e| Error::config(format!("cannot read service account namespace: {}", e)))?;
        return Ok(namespace.trim().to_string());
    }

    let kubeconfig =
        Kubeconfig::read().map_err(|e| Error::config(format!("cannot read kubeconfig: {}", e)))?;
    Ok(current_context(&kubeconfig)
        .and_then(|context| context.namespace.clone())
        .unwrap_or_else(|| "default".to_string()))
}

/// The DNS domain holding the vCenter host records
///
/// In-cluster the domain is taken from the resolver search path; outside
/// it is derived from the context's cluster (region) name.
pub fn detect_domain() -> Result<String> {
    if running_in_cluster() {
        let resolv = std::fs::read_to_string("/etc/resolv.conf")
            .map_err(|e| Error::config(format!("cannot read /etc/resolv.conf: {}", e)))?;
        return domain_from_resolv_conf(&resolv)
            .ok_or_else(|| Error::config("no cloud domain in resolver search path"));
    }

    let kubeconfig =
        Kubeconfig::read().map_err(|e| Error::config(format!("cannot read kubeconfig: {}", e)))?;
    let region = current_context(&kubeconfig)
        .map(|context| context.cluster.clone())
        .ok_or_else(|| Error::config("kubeconfig has no usable current context"))?;
    Ok(format!("cc.{}.cloud.sap", region))
}

fn current_context(kubeconfig: &Kubeconfig) -> Option<&kube::config::Context> {
    let name = kubeconfig.current_context.as_deref()?;
    kubeconfig
        .contexts
        .iter()
        .find(|context| context.name == name)
        .and_then(|context| context.context.as_ref())
}

/// Pick the cloud domain out of a resolver search line
fn domain_from_resolv_conf(content: &str) -> Option<String> {
    for line in content.lines() {
        let mut tokens = line.split_whitespace();
        if tokens.next() != Some("search") {
            continue;
        }
        for token in tokens {
            if token.starts_with("cc.") && token.ends_with(".cloud.sap") {
                return Some(token.to_string());
            }
            // Pod search entries end with the cluster domain; the region
            // is the label in front of cloud.sap
            if let Some(stripped) = token.strip_suffix(".cloud.sap") {
                if let Some(region) = stripped.rsplit('.').next() {
                    if !region.is_empty() {
                        return Some(format!("cc.{}.cloud.sap", region));
                    }
                }
            }
        }
    }
    None
}
