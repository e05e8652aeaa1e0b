//! Desired-state accumulation
//!
//! Rendered templates produce a stream of YAML documents. This module
//! parses that stream into [`DynamicObject`]s and accumulates them into an
//! addressable set keyed by `(apiVersion, kind, name)`, scoped to one
//! target namespace. Two consecutive desired states let the reconciler
//! compute which resources disappeared.

use std::collections::BTreeMap;
use std::fmt;

use kube::api::DynamicObject;
use serde::Deserialize;
use tracing::warn;

use crate::Result;

/// Identity of one desired resource inside the target namespace
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceKey {
    /// Kubernetes apiVersion, e.g. `v1` or `apps/v1`
    pub api_version: String,
    /// Kubernetes kind, e.g. `ConfigMap`
    pub kind: String,
    /// Object name
    pub name: String,
}

impl ResourceKey {
    /// Create a key from its three parts
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.api_version, self.kind, self.name)
    }
}

/// The set of resources the operator intends to exist after this tick
#[derive(Clone, Debug, Default)]
pub struct DesiredState {
    objects: BTreeMap<ResourceKey, DynamicObject>,
}

impl DesiredState {
    /// Create an empty desired state
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a multi-document YAML stream and add every document
    ///
    /// Documents without apiVersion, kind, or metadata.name are skipped
    /// with a warning. A document whose key is already present replaces
    /// the earlier one, also with a warning.
    pub fn add_documents(&mut self, yaml: &str) -> Result<()> {
        for document in serde_yaml::Deserializer::from_str(yaml) {
            let value = match serde_yaml::Value::deserialize(document) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "skipping unparseable rendered document");
                    continue;
                }
            };
            if value.is_null() {
                // Empty document between separators
                continue;
            }
            let json = serde_json::to_value(&value)?;
            self.add_value(json);
        }
        Ok(())
    }

    /// Add one parsed document
    fn add_value(&mut self, value: serde_json::Value) {
        let api_version = value.get("apiVersion").and_then(|v| v.as_str());
        let kind = value.get("kind").and_then(|v| v.as_str());
        let name = value
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(|v| v.as_str());

        let (api_version, kind, name) = match (api_version, kind, name) {
            (Some(a), Some(k), Some(n)) => (a.to_string(), k.to_string(), n.to_string()),
            _ => {
                warn!("skipping rendered document without apiVersion, kind, or metadata.name");
                return;
            }
        };

        let object: DynamicObject = match serde_json::from_value(value) {
            Ok(o) => o,
            Err(e) => {
                warn!(error = %e, kind, name, "skipping rendered document that is not a resource");
                return;
            }
        };

        let key = ResourceKey::new(api_version, kind, name);
        if self.objects.insert(key.clone(), object).is_some() {
            warn!(key = %key, "duplicate desired resource, last write wins");
        }
    }

    /// Insert a single object under an explicit key
    pub fn insert(&mut self, key: ResourceKey, object: DynamicObject) {
        if self.objects.insert(key.clone(), object).is_some() {
            warn!(key = %key, "duplicate desired resource, last write wins");
        }
    }

    /// Look up one object
    pub fn get(&self, key: &ResourceKey) -> Option<&DynamicObject> {
        self.objects.get(key)
    }

    /// Whether a key is present
    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.objects.contains_key(key)
    }

    /// Iterate over all (key, object) pairs in key order
    pub fn iter(&self) -> impl Iterator<Item = (&ResourceKey, &DynamicObject)> {
        self.objects.iter()
    }

    /// Iterate over all keys in order
    pub fn keys(&self) -> impl Iterator<Item = &ResourceKey> {
        self.objects.keys()
    }

    /// Number of desired resources
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the state is empty
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Keys present here but absent in `newer`
    ///
    /// This is the delete set when `self` is the previous tick's state and
    /// `newer` is the freshly rendered one.
    pub fn disappeared<'a>(&'a self, newer: &DesiredState) -> Vec<&'a ResourceKey> {
        self.objects
            .keys()
            .filter(|k| !newer.contains(k))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_DOCS: &str = r#"---
apiVersion: v1
kind: ConfigMap
metadata:
  name: cloud-provider
data:
  key: value
---
apiVersion: v1
kind: Secret
metadata:
  name: vcenter-credentials
stringData:
  password: hunter2
"#;

    // =========================================================================
    // Story: Multi-document parsing
    // =========================================================================

    #[test]
    fn test_parses_multiple_documents() {
        let mut state = DesiredState::new();
        state.add_documents(TWO_DOCS).unwrap();

        assert_eq!(state.len(), 2);
        assert!(state.contains(&ResourceKey::new("v1", "ConfigMap", "cloud-provider")));
        assert!(state.contains(&ResourceKey::new("v1", "Secret", "vcenter-credentials")));
    }

    #[test]
    fn test_skips_empty_documents() {
        let mut state = DesiredState::new();
        state
            .add_documents("---\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: only\n")
            .unwrap();
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn test_skips_document_without_identity() {
        let mut state = DesiredState::new();
        state
            .add_documents("apiVersion: v1\nmetadata:\n  name: nameless-kind\n")
            .unwrap();
        assert!(state.is_empty());
    }

    // =========================================================================
    // Story: Duplicate keys are last-write-wins
    // =========================================================================

    #[test]
    fn test_duplicate_key_last_write_wins() {
        let mut state = DesiredState::new();
        state
            .add_documents(
                "---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: dup\ndata:\n  v: first\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: dup\ndata:\n  v: second\n",
            )
            .unwrap();

        assert_eq!(state.len(), 1);
        let object = state
            .get(&ResourceKey::new("v1", "ConfigMap", "dup"))
            .unwrap();
        assert_eq!(
            object.data.get("data").and_then(|d| d.get("v")).and_then(|v| v.as_str()),
            Some("second")
        );
    }

    // =========================================================================
    // Story: Disappearance between consecutive states
    // =========================================================================

    #[test]
    fn test_disappeared_keys() {
        let mut previous = DesiredState::new();
        previous.add_documents(TWO_DOCS).unwrap();

        let mut current = DesiredState::new();
        current
            .add_documents("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cloud-provider\n")
            .unwrap();

        let gone = previous.disappeared(&current);
        assert_eq!(gone.len(), 1);
        assert_eq!(gone[0], &ResourceKey::new("v1", "Secret", "vcenter-credentials"));
    }
}
