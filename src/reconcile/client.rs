//! Dynamic resource client
//!
//! Abstracts the Kubernetes reads and writes behind a trait so the
//! reconciler is testable without an API server, with a real
//! implementation over `DynamicObject` and kube discovery.

use std::collections::HashMap;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams, PropagationPolicy};
use kube::Client;
use tokio::sync::Mutex;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::state::ResourceKey;
use crate::{Error, Result, FIELD_MANAGER};

/// Trait abstracting resource operations against the target namespace
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real dynamic client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Read one object; a 404 is returned as `None`
    async fn get(&self, namespace: &str, key: &ResourceKey) -> Result<Option<DynamicObject>>;

    /// Create the object in the namespace
    async fn create(
        &self,
        namespace: &str,
        key: &ResourceKey,
        object: &DynamicObject,
    ) -> Result<()>;

    /// Patch the live object with the desired one
    async fn patch(
        &self,
        namespace: &str,
        key: &ResourceKey,
        object: &DynamicObject,
    ) -> Result<()>;

    /// Delete the object, orphaning its dependents; a 404 is success
    async fn delete(&self, namespace: &str, key: &ResourceKey) -> Result<()>;
}

/// Real resource client over the kube dynamic API
pub struct DynamicResourceClient {
    client: Client,
    /// (apiVersion, kind) -> discovered ApiResource
    cache: Mutex<HashMap<(String, String), kube::discovery::ApiResource>>,
}

impl DynamicResourceClient {
    /// Create a client wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Discover the ApiResource for a given API version and kind.
    ///
    /// Queries the API server once per (apiVersion, kind) to get the
    /// correct plural form and caches the answer for the process lifetime.
    async fn api_resource(
        &self,
        api_version: &str,
        kind: &str,
    ) -> Result<kube::discovery::ApiResource> {
        let cache_key = (api_version.to_string(), kind.to_string());
        if let Some(resource) = self.cache.lock().await.get(&cache_key) {
            return Ok(resource.clone());
        }

        let (group, version) = parse_api_version(api_version);

        let discovery = kube::discovery::Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|e| Error::serialization(format!("API discovery failed: {}", e)))?;

        let mut found = None;
        for api_group in discovery.groups() {
            if api_group.name() != group {
                continue;
            }
            for (ar, _caps) in api_group.recommended_resources() {
                if ar.kind == kind && ar.version == version {
                    found = Some(ar.clone());
                    break;
                }
            }
        }

        let resource = match found {
            Some(resource) => resource,
            None => {
                // Discovery can lag freshly installed CRDs; fall back to
                // standard pluralization
                debug!(
                    api_version = %api_version,
                    kind = %kind,
                    "resource not found in discovery, using fallback pluralization"
                );
                kube::discovery::ApiResource {
                    group: group.to_string(),
                    version: version.to_string(),
                    api_version: api_version.to_string(),
                    kind: kind.to_string(),
                    plural: pluralize_kind(kind),
                }
            }
        };

        self.cache
            .lock()
            .await
            .insert(cache_key, resource.clone());
        Ok(resource)
    }

    async fn api_for(&self, namespace: &str, key: &ResourceKey) -> Result<Api<DynamicObject>> {
        let resource = self.api_resource(&key.api_version, &key.kind).await?;
        Ok(Api::namespaced_with(
            self.client.clone(),
            namespace,
            &resource,
        ))
    }
}

#[async_trait]
impl ResourceClient for DynamicResourceClient {
    async fn get(&self, namespace: &str, key: &ResourceKey) -> Result<Option<DynamicObject>> {
        let api = self.api_for(namespace, key).await?;
        match api.get(&key.name).await {
            Ok(object) => Ok(Some(object)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create(
        &self,
        namespace: &str,
        key: &ResourceKey,
        object: &DynamicObject,
    ) -> Result<()> {
        let api = self.api_for(namespace, key).await?;
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        api.create(&params, object).await?;
        Ok(())
    }

    async fn patch(
        &self,
        namespace: &str,
        key: &ResourceKey,
        object: &DynamicObject,
    ) -> Result<()> {
        let api = self.api_for(namespace, key).await?;
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        api.patch(&key.name, &params, &Patch::Merge(object)).await?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &ResourceKey) -> Result<()> {
        let api = self.api_for(namespace, key).await?;
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Orphan),
            ..Default::default()
        };
        match api.delete(&key.name, &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Parse API version into group and version components
fn parse_api_version(api_version: &str) -> (&str, &str) {
    match api_version.rfind('/') {
        Some(idx) => (&api_version[..idx], &api_version[idx + 1..]),
        // Core API (e.g. "v1")
        None => ("", api_version),
    }
}

/// Convert a Kind to its plural form for Kubernetes API paths.
///
/// Kubernetes pluralization is all-lowercase with a handful of irregular
/// forms; everything the templates commonly render is covered by the
/// standard rules below.
fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        // policy -> policies, but not gateway -> gateways
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_api_version() {
        assert_eq!(parse_api_version("v1"), ("", "v1"));
        assert_eq!(parse_api_version("apps/v1"), ("apps", "v1"));
        assert_eq!(
            parse_api_version("networking.k8s.io/v1"),
            ("networking.k8s.io", "v1")
        );
    }

    #[test]
    fn test_pluralize_kind() {
        assert_eq!(pluralize_kind("ConfigMap"), "configmaps");
        assert_eq!(pluralize_kind("Secret"), "secrets");
        assert_eq!(pluralize_kind("Ingress"), "ingresses");
        assert_eq!(pluralize_kind("NetworkPolicy"), "networkpolicies");
        assert_eq!(pluralize_kind("Gateway"), "gateways");
    }
}
