//! vCenter inventory
//!
//! One [`VCenter`] record exists per discovered host, carrying the derived
//! login credentials and an open session. Each tick the session yields the
//! raw [`ClusterInventory`] per compute cluster; [`classify`] turns a raw
//! record into the derived attributes the templates consume, filtering out
//! clusters that do not match the naming or networking contract.
//!
//! The wire protocol lives behind [`InventorySource`] so tests can drive
//! classification and orchestration without a vCenter; [`VimSession`] is
//! the real SOAP implementation.

mod vim;

use std::sync::Arc;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

pub use vim::{VimSession, VimSessionFactory, VimSettings};

use crate::template::Options;
use crate::Result;

/// Cluster names the operator manages, capture group 1 is the short name
static CLUSTER_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^production(bb[1-9][0-9]*)\z").expect("static regex"));

/// Ephemeral datastores contributing to the datastore regex
static EPH_DATASTORE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^eph").expect("static regex"));

/// Bridge networks, capture group 1 is the physical network name
static BRIDGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^br-(.*)\z").expect("static regex"));

/// Raw per-cluster inventory as fetched from one vCenter
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterInventory {
    /// Cluster name as it appears in the inventory tree
    pub name: String,
    /// Name of the datacenter two levels above the cluster
    pub datacenter: String,
    /// Names of all attached datastores
    pub datastores: Vec<String>,
    /// Names of all attached networks, in inventory order
    pub networks: Vec<String>,
}

/// Trait abstracting the vCenter wire operations the operator needs
///
/// This trait allows mocking a vCenter in tests while using the real SOAP
/// session in production. The operator only ever reads inventory.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InventorySource: Send + Sync {
    /// Fetch one record per compute cluster
    async fn clusters(&self) -> Result<Vec<ClusterInventory>>;

    /// Best-effort session teardown; never fails the caller
    async fn disconnect(&self);
}

/// Creates sessions for newly discovered vCenters
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Open a session against one vCenter host
    async fn connect(
        &self,
        host: &str,
        username: &str,
        password: &str,
    ) -> Result<Arc<dyn InventorySource>>;
}

/// One known vCenter server
pub struct VCenter {
    /// Short label, the hostname's leftmost label
    pub name: String,
    /// Fully qualified hostname
    pub host: String,
    /// Login user from global config
    pub username: String,
    /// Login password derived from the master secret
    pub password: String,
    /// Open session used for inventory polling
    pub session: Arc<dyn InventorySource>,
}

impl VCenter {
    /// The short label for a fully qualified hostname
    pub fn short_name(host: &str) -> String {
        host.split('.').next().unwrap_or(host).to_string()
    }
}

/// Derived attributes for one matching cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterAttributes {
    /// Raw inventory name, e.g. `productionbb01`
    pub cluster_name: String,
    /// Matched short name, e.g. `bb01`
    pub name: String,
    /// Datacenter name, lowercased
    pub availability_zone: String,
    /// Anchored prefix regex over the ephemeral datastores, if any match
    pub datastore_regex: Option<String>,
    /// First bridge network, lowercased
    pub bridge: String,
    /// Physical network behind the bridge, lowercased
    pub physical: String,
}

/// Classify one raw cluster record
///
/// Returns `None` for clusters outside the operator's contract: a name
/// that does not match the production pattern, or no bridge network.
/// With `pbm_enabled` the datastore regex is left unset; placement is
/// policy-driven in that case.
pub fn classify(inventory: &ClusterInventory, pbm_enabled: bool) -> Option<ClusterAttributes> {
    let captures = match CLUSTER_NAME_RE.captures(&inventory.name) {
        Some(c) => c,
        None => {
            debug!(cluster = %inventory.name, "cluster name out of scope, skipping");
            return None;
        }
    };
    let name = captures[1].to_lowercase();

    let (bridge, physical) = match inventory.networks.iter().find_map(|network| {
        BRIDGE_RE
            .captures(network)
            .map(|c| (c[0].to_lowercase(), c[1].to_lowercase()))
    }) {
        Some(pair) => pair,
        None => {
            warn!(cluster = %inventory.name, "cluster has no bridge network, skipping");
            return None;
        }
    };

    let datastore_regex = if pbm_enabled {
        None
    } else {
        datastore_prefix_regex(&inventory.datastores)
    };

    Some(ClusterAttributes {
        cluster_name: inventory.name.clone(),
        name,
        availability_zone: inventory.datacenter.to_lowercase(),
        datastore_regex,
        bridge,
        physical,
    })
}

/// Anchored regex over the longest common prefix of ephemeral datastores
fn datastore_prefix_regex(datastores: &[String]) -> Option<String> {
    let matching: Vec<&str> = datastores
        .iter()
        .map(String::as_str)
        .filter(|name| EPH_DATASTORE_RE.is_match(name))
        .collect();
    let first = *matching.first()?;

    let prefix_len = matching
        .iter()
        .fold(first.len(), |len, name| common_prefix_len(&first[..len], name));
    Some(format!("^{}.*", &first[..prefix_len]))
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    let mut len = 0;
    for (x, y) in a.chars().zip(b.chars()) {
        if x != y {
            break;
        }
        len += x.len_utf8();
    }
    len
}

/// Build the options map one cluster is rendered with
///
/// The map is the union of global config, the vCenter record, and the
/// derived cluster attributes, in that order of precedence. The global
/// `password` key is remapped to `master_password`; `password` itself
/// carries the per-host derived secret.
pub fn cluster_options(
    config: &Options,
    vcenter: &VCenter,
    attributes: &ClusterAttributes,
) -> Options {
    let mut options = config.clone();
    if let Some(master) = options.remove("password") {
        options.insert("master_password".to_string(), master);
    }

    options.insert("name".to_string(), vcenter.name.clone());
    options.insert("host".to_string(), vcenter.host.clone());
    options.insert("username".to_string(), vcenter.username.clone());
    options.insert("password".to_string(), vcenter.password.clone());

    options.insert("cluster_name".to_string(), attributes.cluster_name.clone());
    options.insert("name".to_string(), attributes.name.clone());
    options.insert(
        "availability_zone".to_string(),
        attributes.availability_zone.clone(),
    );
    if let Some(regex) = &attributes.datastore_regex {
        options.insert("datastore_regex".to_string(), regex.clone());
    }
    options.insert("bridge".to_string(), attributes.bridge.clone());
    options.insert("physical".to_string(), attributes.physical.clone());

    apply_config_hash(&mut options);
    options
}

/// Stamp the stable hash of the option set into the options themselves
///
/// The hash appears twice: `config_hash` as hex for churn detection, and
/// `config_hash_port` as a NodePort-range number for templates that need
/// a numeric value. Both are computed over the sorted option set with the
/// two hash keys excluded, so re-stamping is idempotent.
pub fn apply_config_hash(options: &mut Options) {
    let mut hasher = Sha256::new();
    for (key, value) in options
        .iter()
        .filter(|(key, _)| key.as_str() != "config_hash" && key.as_str() != "config_hash_port")
    {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    let digest = hasher.finalize();
    let hash = u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"));

    options.insert("config_hash".to_string(), format!("{:016x}", hash));
    options.insert(
        "config_hash_port".to_string(),
        (30000 + hash % 2000).to_string(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inventory(name: &str, datacenter: &str, datastores: &[&str], networks: &[&str]) -> ClusterInventory {
        ClusterInventory {
            name: name.to_string(),
            datacenter: datacenter.to_string(),
            datastores: datastores.iter().map(|s| s.to_string()).collect(),
            networks: networks.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn options(pairs: &[(&str, &str)]) -> Options {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    // =========================================================================
    // Story: Cluster name filtering
    // =========================================================================

    #[test]
    fn test_only_production_clusters_match() {
        let matching = inventory("productionbb01", "DC-A", &[], &["br-ext"]);
        let attrs = classify(&matching, false).unwrap();
        assert_eq!(attrs.name, "bb01");
        assert_eq!(attrs.cluster_name, "productionbb01");

        assert!(classify(&inventory("stagingbb01", "DC-A", &[], &["br-ext"]), false).is_none());
        assert!(classify(&inventory("productionbb0", "DC-A", &[], &["br-ext"]), false).is_none());
        assert!(classify(&inventory("productionbb01x", "DC-A", &[], &["br-ext"]), false).is_none());

        let high = classify(&inventory("productionbb99", "DC-A", &[], &["br-ext"]), false).unwrap();
        assert_eq!(high.name, "bb99");
    }

    #[test]
    fn test_availability_zone_is_lowercased_datacenter() {
        let attrs = classify(&inventory("productionbb01", "QA-DE-1", &[], &["br-ext"]), false).unwrap();
        assert_eq!(attrs.availability_zone, "qa-de-1");
    }

    // =========================================================================
    // Story: Datastore prefix derivation
    // =========================================================================

    #[test]
    fn test_datastore_regex_from_common_prefix() {
        let attrs = classify(
            &inventory(
                "productionbb01",
                "DC-A",
                &["eph-az1-ssd-01", "eph-az1-ssd-02", "logs"],
                &["br-ext"],
            ),
            false,
        )
        .unwrap();
        assert_eq!(attrs.datastore_regex.as_deref(), Some("^eph-az1-ssd-0.*"));
    }

    #[test]
    fn test_no_ephemeral_datastores_leaves_regex_unset() {
        let attrs = classify(
            &inventory("productionbb01", "DC-A", &["logs", "backup"], &["br-ext"]),
            false,
        )
        .unwrap();
        assert!(attrs.datastore_regex.is_none());
    }

    #[test]
    fn test_pbm_enabled_skips_datastore_regex() {
        let attrs = classify(
            &inventory("productionbb01", "DC-A", &["eph-a", "eph-b"], &["br-ext"]),
            true,
        )
        .unwrap();
        assert!(attrs.datastore_regex.is_none());
    }

    #[test]
    fn test_single_ephemeral_datastore_uses_full_name() {
        let attrs = classify(
            &inventory("productionbb01", "DC-A", &["eph-only"], &["br-ext"]),
            false,
        )
        .unwrap();
        assert_eq!(attrs.datastore_regex.as_deref(), Some("^eph-only.*"));
    }

    // =========================================================================
    // Story: Bridge derivation
    // =========================================================================

    #[test]
    fn test_first_bridge_network_wins() {
        let attrs = classify(
            &inventory(
                "productionbb01",
                "DC-A",
                &[],
                &["vlan-123", "br-EXT-01", "br-other"],
            ),
            false,
        )
        .unwrap();
        assert_eq!(attrs.bridge, "br-ext-01");
        assert_eq!(attrs.physical, "ext-01");
    }

    #[test]
    fn test_cluster_without_bridge_is_skipped() {
        assert!(classify(
            &inventory("productionbb01", "DC-A", &[], &["vlan-123"]),
            false
        )
        .is_none());
    }

    // =========================================================================
    // Story: Options assembly and config hash
    // =========================================================================

    fn sample_vcenter() -> VCenter {
        VCenter {
            name: "vc-a-1".to_string(),
            host: "vc-a-1.cc.example.cloud.sap".to_string(),
            username: "operator".to_string(),
            password: "Derived9-Secret".to_string(),
            session: Arc::new(MockInventorySource::new()),
        }
    }

    fn sample_attributes() -> ClusterAttributes {
        ClusterAttributes {
            cluster_name: "productionbb01".to_string(),
            name: "bb01".to_string(),
            availability_zone: "dc-a".to_string(),
            datastore_regex: Some("^eph.*".to_string()),
            bridge: "br-ext".to_string(),
            physical: "ext".to_string(),
        }
    }

    #[test]
    fn test_cluster_options_union() {
        let config = options(&[
            ("username", "operator"),
            ("password", "master-secret"),
            ("namespace", "monsoon3"),
            ("extra", "forwarded"),
        ]);
        let opts = cluster_options(&config, &sample_vcenter(), &sample_attributes());

        // Cluster short name wins the `name` key
        assert_eq!(opts.get("name").map(String::as_str), Some("bb01"));
        assert_eq!(
            opts.get("master_password").map(String::as_str),
            Some("master-secret")
        );
        assert_eq!(
            opts.get("password").map(String::as_str),
            Some("Derived9-Secret")
        );
        assert_eq!(
            opts.get("host").map(String::as_str),
            Some("vc-a-1.cc.example.cloud.sap")
        );
        assert_eq!(opts.get("extra").map(String::as_str), Some("forwarded"));
        assert_eq!(opts.get("datastore_regex").map(String::as_str), Some("^eph.*"));
        assert!(opts.contains_key("config_hash"));
        assert!(opts.contains_key("config_hash_port"));
    }

    #[test]
    fn test_config_hash_is_stable_and_input_sensitive() {
        let mut a = options(&[("k", "v"), ("x", "y")]);
        let mut b = a.clone();
        apply_config_hash(&mut a);
        apply_config_hash(&mut b);
        assert_eq!(a.get("config_hash"), b.get("config_hash"));

        // Re-stamping does not feed the hash into itself
        let mut c = a.clone();
        apply_config_hash(&mut c);
        assert_eq!(a.get("config_hash"), c.get("config_hash"));

        let mut d = options(&[("k", "v"), ("x", "z")]);
        apply_config_hash(&mut d);
        assert_ne!(a.get("config_hash"), d.get("config_hash"));
    }

    #[test]
    fn test_config_hash_port_is_in_nodeport_range() {
        let mut opts = options(&[("k", "v")]);
        apply_config_hash(&mut opts);
        let port: u32 = opts.get("config_hash_port").unwrap().parse().unwrap();
        assert!((30000..32000).contains(&port));
    }

    #[test]
    fn test_short_name() {
        assert_eq!(VCenter::short_name("vc-a-1.cc.example.cloud.sap"), "vc-a-1");
        assert_eq!(VCenter::short_name("bare"), "bare");
    }
}
