//! vCenter Operator - inventory-driven Kubernetes manifest reconciliation
//!
//! The operator runs a single control loop that converges a Kubernetes
//! namespace toward what vCenter inventory says should exist:
//!
//! 1. vCenter servers are discovered by transferring an authoritative DNS
//!    zone (serial-gated AXFR).
//! 2. Each discovered vCenter is logged into with a password derived
//!    deterministically from one master secret, and its compute clusters
//!    are classified by name, datastore layout, and attached network.
//! 3. Kubernetes manifests are rendered from templates, one bundle per
//!    matching cluster and per availability zone.
//! 4. The rendered desired state is diffed against the live API and
//!    converged with creates, patches, and orphaning deletes.
//!
//! Every boundary (DNS, vCenter, Kubernetes API) tolerates partial
//! failure: the affected unit of work is skipped for the tick and retried
//! on the next one.
//!
//! # Modules
//!
//! - [`config`] - ConfigMap-backed runtime configuration and environment detection
//! - [`discovery`] - DNS zone transfer discovery of vCenter hosts
//! - [`vcenter`] - vCenter sessions, inventory retrieval, and cluster classification
//! - [`password`] - Master Password key derivation for per-host credentials
//! - [`template`] - Scope-based manifest rendering
//! - [`state`] - Desired-state accumulation keyed by (apiVersion, kind, name)
//! - [`reconcile`] - Field-wise diff and create/patch/delete against the live API
//! - [`orchestrator`] - The outer tick loop tying everything together
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod config;
pub mod discovery;
pub mod error;
pub mod orchestrator;
pub mod password;
pub mod reconcile;
pub mod state;
pub mod template;
pub mod vcenter;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Name of the ConfigMap holding runtime configuration
pub const CONFIG_MAP_NAME: &str = "vcenter-operator";

/// Label selector for the designate backend Service providing the DNS zone
pub const DNS_SERVICE_SELECTOR: &str = "component=designate,type=backend";

/// Default seconds between ticks of the outer loop
pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 10;

/// Timeout for a single DNS operation (SOA query or zone transfer)
pub const DNS_TIMEOUT_SECS: u64 = 10;

/// Timeout for a single vCenter round trip
pub const VCENTER_TIMEOUT_SECS: u64 = 30;

/// Timeout for one full inventory poll of one vCenter (several round trips)
pub const VCENTER_POLL_TIMEOUT_SECS: u64 = 120;

/// Field manager name used for Kubernetes writes
pub const FIELD_MANAGER: &str = "vcenter-operator";
