//! DNS-based vCenter discovery
//!
//! The set of vCenter servers is published as host records in an
//! authoritative DNS zone. Discovery polls the zone's SOA serial as a
//! cheap change indicator and performs a full AXFR zone transfer only
//! when the serial moved; host records whose leftmost label looks like a
//! vCenter name are kept and diffed against the previously known set.
//!
//! The wire protocol lives behind the [`ZoneSource`] trait so tests can
//! drive discovery without a DNS server; [`AxfrZoneSource`] is the real
//! TCP implementation.

mod axfr;
mod endpoint;

use std::collections::BTreeSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

pub use axfr::AxfrZoneSource;
pub use endpoint::designate_endpoint;

use crate::Result;

/// Leftmost label of a vCenter host record, e.g. `vc-foo-1`
static VC_HOST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^vc-[a-z]+-?\d+\z").expect("static regex"));

/// One record returned by a zone transfer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ZoneRecord {
    /// Fully qualified owner name, trailing dot optional
    pub owner: String,
    /// Record type, reduced to what discovery distinguishes
    pub record_type: ZoneRecordType,
}

/// Record types discovery cares about
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ZoneRecordType {
    /// IPv4 host record
    A,
    /// IPv6 host record
    Aaaa,
    /// Alias record
    Cname,
    /// Anything else; ignored
    Other,
}

/// Change in the known vCenter set between two discovery passes
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Delta {
    /// Hosts that appeared since the last pass
    pub added: BTreeSet<String>,
    /// Hosts that disappeared since the last pass
    pub removed: BTreeSet<String>,
}

impl Delta {
    /// Whether nothing changed
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Trait abstracting the DNS wire operations discovery needs
///
/// This trait allows mocking the DNS server in tests while using the
/// real AXFR client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ZoneSource: Send + Sync {
    /// Fetch the zone's current SOA serial
    async fn soa_serial(&self, zone: &str) -> Result<u32>;

    /// Transfer the full zone over TCP
    async fn transfer(&self, zone: &str) -> Result<Vec<ZoneRecord>>;
}

/// Serial-gated discovery of vCenter host names
///
/// Holds only the discovery state; the zone source is passed per poll
/// because the DNS backend endpoint is itself rediscovered every tick.
#[derive(Debug, Default)]
pub struct Discovery {
    last_serial: Option<u32>,
    known: BTreeSet<String>,
}

impl Discovery {
    /// Create an empty discovery state
    pub fn new() -> Self {
        Self::default()
    }

    /// The currently known set of vCenter FQDNs
    pub fn known(&self) -> &BTreeSet<String> {
        &self.known
    }

    /// Run one discovery pass against the zone
    ///
    /// Returns the delta against the previously known set. When the SOA
    /// serial is unchanged no transfer is issued and the delta is empty.
    /// The serial is recorded only after a successful full pass, so a
    /// failed transfer is retried on the next tick.
    pub async fn poll(&mut self, source: &dyn ZoneSource, zone: &str) -> Result<Delta> {
        let serial = source.soa_serial(zone).await?;
        if self.last_serial == Some(serial) {
            debug!(zone, serial, "zone serial unchanged, skipping transfer");
            return Ok(Delta::default());
        }

        let records = source.transfer(zone).await?;
        let mut current = BTreeSet::new();
        for record in &records {
            if !matches!(
                record.record_type,
                ZoneRecordType::A | ZoneRecordType::Aaaa | ZoneRecordType::Cname
            ) {
                continue;
            }
            let owner = record.owner.trim_end_matches('.');
            let label = owner.split('.').next().unwrap_or_default();
            if VC_HOST_RE.is_match(label) {
                current.insert(owner.to_string());
            }
        }

        let delta = Delta {
            added: current.difference(&self.known).cloned().collect(),
            removed: self.known.difference(&current).cloned().collect(),
        };
        if !delta.is_empty() {
            info!(
                zone,
                serial,
                added = delta.added.len(),
                removed = delta.removed.len(),
                "vcenter set changed"
            );
        }

        self.known = current;
        self.last_serial = Some(serial);
        Ok(delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn record(owner: &str, record_type: ZoneRecordType) -> ZoneRecord {
        ZoneRecord {
            owner: owner.to_string(),
            record_type,
        }
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    // =========================================================================
    // Story: Happy discovery (scenario: first pass, then unchanged serial)
    // =========================================================================

    #[tokio::test]
    async fn test_first_pass_adds_then_unchanged_serial_skips_transfer() {
        let mut source = MockZoneSource::new();
        source.expect_soa_serial().times(2).returning(|_| Ok(42));
        // Transfer must run exactly once: the second poll sees serial 42 again
        source.expect_transfer().times(1).returning(|_| {
            Ok(vec![record(
                "vc-foo-1.cc.example.cloud.sap.",
                ZoneRecordType::A,
            )])
        });

        let mut discovery = Discovery::new();

        let first = discovery.poll(&source, "cc.example.cloud.sap").await.unwrap();
        assert_eq!(first.added, set(&["vc-foo-1.cc.example.cloud.sap"]));
        assert!(first.removed.is_empty());

        let second = discovery.poll(&source, "cc.example.cloud.sap").await.unwrap();
        assert!(second.is_empty());
        assert_eq!(discovery.known().len(), 1);
    }

    #[test]
    fn test_host_label_pattern() {
        assert!(VC_HOST_RE.is_match("vc-foo-1"));
        assert!(VC_HOST_RE.is_match("vc-abc12"));
        assert!(!VC_HOST_RE.is_match("vc-foo"));
        assert!(!VC_HOST_RE.is_match("vc-FOO-1"));
        assert!(!VC_HOST_RE.is_match("api-foo-1"));
        assert!(!VC_HOST_RE.is_match("vc-foo-1x"));
    }

    // =========================================================================
    // Story: Record filtering
    // =========================================================================

    #[tokio::test]
    async fn test_only_host_records_with_matching_label_survive() {
        let mut source = MockZoneSource::new();
        source.expect_soa_serial().returning(|_| Ok(7));
        source.expect_transfer().returning(|_| {
            Ok(vec![
                record("vc-foo-1.zone.example.", ZoneRecordType::A),
                record("vc-bar-2.zone.example.", ZoneRecordType::Aaaa),
                record("vc-baz-3.zone.example.", ZoneRecordType::Cname),
                // Wrong label shape
                record("mail.zone.example.", ZoneRecordType::A),
                // Right label shape, wrong record type
                record("vc-qux-4.zone.example.", ZoneRecordType::Other),
            ])
        });

        let mut discovery = Discovery::new();
        let delta = discovery.poll(&source, "zone.example").await.unwrap();
        assert_eq!(
            delta.added,
            set(&[
                "vc-foo-1.zone.example",
                "vc-bar-2.zone.example",
                "vc-baz-3.zone.example",
            ])
        );
    }

    // =========================================================================
    // Story: Removal and failed-transfer retry
    // =========================================================================

    #[tokio::test]
    async fn test_disappeared_host_is_reported_removed() {
        let mut source = MockZoneSource::new();
        let mut serial = 1;
        source.expect_soa_serial().returning(move |_| {
            serial += 1;
            Ok(serial)
        });
        let mut pass = 0;
        source.expect_transfer().returning(move |_| {
            pass += 1;
            if pass == 1 {
                Ok(vec![
                    record("vc-a-1.zone.example.", ZoneRecordType::A),
                    record("vc-b-2.zone.example.", ZoneRecordType::A),
                ])
            } else {
                Ok(vec![record("vc-a-1.zone.example.", ZoneRecordType::A)])
            }
        });

        let mut discovery = Discovery::new();
        discovery.poll(&source, "zone.example").await.unwrap();
        let delta = discovery.poll(&source, "zone.example").await.unwrap();
        assert!(delta.added.is_empty());
        assert_eq!(delta.removed, set(&["vc-b-2.zone.example"]));
    }

    #[tokio::test]
    async fn test_failed_transfer_keeps_serial_unrecorded() {
        let mut source = MockZoneSource::new();
        source.expect_soa_serial().times(2).returning(|_| Ok(5));
        let mut pass = 0;
        source.expect_transfer().times(2).returning(move |_| {
            pass += 1;
            if pass == 1 {
                Err(Error::dns("connection reset"))
            } else {
                Ok(vec![record("vc-a-1.zone.example.", ZoneRecordType::A)])
            }
        });

        let mut discovery = Discovery::new();
        assert!(discovery.poll(&source, "zone.example").await.is_err());

        // Same serial, but the first pass never completed, so the transfer
        // runs again and the host is picked up.
        let delta = discovery.poll(&source, "zone.example").await.unwrap();
        assert_eq!(delta.added, set(&["vc-a-1.zone.example"]));
    }
}
