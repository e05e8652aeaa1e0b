//! Reconciliation against the live Kubernetes API
//!
//! The reconciler owns the last two desired states. Each tick it walks
//! the newest state, reads the live object for every key, and issues a
//! create or patch where the live cluster disagrees; keys present in the
//! previous state but gone from the newest one are deleted with orphan
//! semantics. A failing key never blocks the rest of the tick; the next
//! tick retries.
//!
//! In dry-run mode all reads and diffs still run, so the log shows
//! exactly what would have been written.

mod client;
mod diff;

use std::sync::Arc;

use kube::api::DynamicObject;
use tracing::{debug, info, warn};

pub use client::{DynamicResourceClient, ResourceClient};
pub use diff::objects_differ;

use crate::state::{DesiredState, ResourceKey};
use crate::Result;

#[cfg(test)]
pub use client::MockResourceClient;

/// Counters for one reconcile pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Objects created because they were absent
    pub created: usize,
    /// Objects patched because they differed
    pub patched: usize,
    /// Objects deleted because they disappeared from desired state
    pub deleted: usize,
    /// Objects left alone
    pub unchanged: usize,
    /// Keys that failed and will be retried next tick
    pub failed: usize,
}

impl ReconcileOutcome {
    /// Total writes issued in this pass
    pub fn writes(&self) -> usize {
        self.created + self.patched + self.deleted
    }
}

enum Applied {
    Created,
    Patched,
    Unchanged,
}

/// Converges the live cluster toward the newest desired state
pub struct Reconciler {
    resources: Arc<dyn ResourceClient>,
    previous: Option<DesiredState>,
}

impl Reconciler {
    /// Create a reconciler over the given resource client
    pub fn new(resources: Arc<dyn ResourceClient>) -> Self {
        Self {
            resources,
            previous: None,
        }
    }

    /// Apply one desired state
    ///
    /// Consumes the state and keeps it as the baseline for the next pass.
    /// Per-key failures are logged and counted, never propagated: the
    /// affected resource is retried when the next tick renders it again.
    pub async fn apply(
        &mut self,
        namespace: &str,
        desired: DesiredState,
        dry_run: bool,
    ) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();

        for (key, object) in desired.iter() {
            match self.apply_one(namespace, key, object, dry_run).await {
                Ok(Applied::Created) => outcome.created += 1,
                Ok(Applied::Patched) => outcome.patched += 1,
                Ok(Applied::Unchanged) => outcome.unchanged += 1,
                Err(e) => {
                    warn!(key = %key, error = %e, "failed to apply resource, will retry next tick");
                    outcome.failed += 1;
                }
            }
        }

        if let Some(previous) = &self.previous {
            for key in previous.disappeared(&desired) {
                if dry_run {
                    info!(key = %key, "dry-run: would delete");
                    outcome.deleted += 1;
                    continue;
                }
                match self.resources.delete(namespace, key).await {
                    Ok(()) => {
                        info!(key = %key, "deleted");
                        outcome.deleted += 1;
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "failed to delete resource, will retry next tick");
                        outcome.failed += 1;
                    }
                }
            }
        }

        self.previous = Some(desired);
        outcome
    }

    async fn apply_one(
        &self,
        namespace: &str,
        key: &ResourceKey,
        object: &DynamicObject,
        dry_run: bool,
    ) -> Result<Applied> {
        let live = self.resources.get(namespace, key).await?;

        match live {
            None => {
                if dry_run {
                    info!(key = %key, yaml = %intended_yaml(object), "dry-run: would create");
                } else {
                    self.resources.create(namespace, key, object).await?;
                    info!(key = %key, "created");
                }
                Ok(Applied::Created)
            }
            Some(live) => {
                let desired_value = serde_json::to_value(object)?;
                let live_value = serde_json::to_value(&live)?;
                if objects_differ(&desired_value, &live_value) {
                    if dry_run {
                        info!(key = %key, yaml = %intended_yaml(object), "dry-run: would patch");
                    } else {
                        self.resources.patch(namespace, key, object).await?;
                        info!(key = %key, "patched");
                    }
                    Ok(Applied::Patched)
                } else {
                    debug!(key = %key, "up to date");
                    Ok(Applied::Unchanged)
                }
            }
        }
    }
}

fn intended_yaml(object: &DynamicObject) -> String {
    serde_yaml::to_string(object).unwrap_or_else(|e| format!("<unserializable: {}>", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn desired_with(docs: &str) -> DesiredState {
        let mut state = DesiredState::new();
        state.add_documents(docs).unwrap();
        state
    }

    fn configmap_doc(name: &str, value: &str) -> String {
        format!(
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {}\ndata:\n  key: {}\n",
            name, value
        )
    }

    fn object_from(doc: &str) -> DynamicObject {
        let value: serde_yaml::Value = serde_yaml::from_str(doc).unwrap();
        serde_json::from_value(serde_json::to_value(value).unwrap()).unwrap()
    }

    // =========================================================================
    // Story: Reconcile create (absent object appears exactly once)
    // =========================================================================

    #[tokio::test]
    async fn test_absent_object_is_created_once_then_settles() {
        let mut mock = MockResourceClient::new();
        let mut pass = 0;
        mock.expect_get().times(2).returning(move |_, _| {
            pass += 1;
            if pass == 1 {
                Ok(None)
            } else {
                Ok(Some(object_from(&configmap_doc("foo", "v"))))
            }
        });
        mock.expect_create().times(1).returning(|_, _, _| Ok(()));
        mock.expect_patch().times(0);
        mock.expect_delete().times(0);

        let mut reconciler = Reconciler::new(Arc::new(mock));

        let first = reconciler
            .apply("monsoon3", desired_with(&configmap_doc("foo", "v")), false)
            .await;
        assert_eq!(first.created, 1);
        assert_eq!(first.failed, 0);

        // Second tick: identical desired state, live object now present
        let second = reconciler
            .apply("monsoon3", desired_with(&configmap_doc("foo", "v")), false)
            .await;
        assert_eq!(second.writes(), 0);
        assert_eq!(second.unchanged, 1);
    }

    #[tokio::test]
    async fn test_differing_object_is_patched() {
        let mut mock = MockResourceClient::new();
        mock.expect_get()
            .returning(|_, _| Ok(Some(object_from(&configmap_doc("foo", "stale")))));
        mock.expect_patch().times(1).returning(|_, _, _| Ok(()));
        mock.expect_create().times(0);

        let mut reconciler = Reconciler::new(Arc::new(mock));
        let outcome = reconciler
            .apply("monsoon3", desired_with(&configmap_doc("foo", "fresh")), false)
            .await;
        assert_eq!(outcome.patched, 1);
    }

    // =========================================================================
    // Story: Reconcile delete (disappeared key, exactly one delete)
    // =========================================================================

    #[tokio::test]
    async fn test_disappeared_key_is_deleted_once() {
        let mut mock = MockResourceClient::new();
        mock.expect_get()
            .returning(|_, key| Ok(Some(object_from(&configmap_doc(&key.name, "v")))));
        mock.expect_delete()
            .times(1)
            .withf(|_, key| key.name == "gone")
            .returning(|_, _| Ok(()));

        let mut reconciler = Reconciler::new(Arc::new(mock));

        let both = format!("{}---\n{}", configmap_doc("keep", "v"), configmap_doc("gone", "v"));
        reconciler.apply("monsoon3", desired_with(&both), false).await;

        let outcome = reconciler
            .apply("monsoon3", desired_with(&configmap_doc("keep", "v")), false)
            .await;
        assert_eq!(outcome.deleted, 1);
    }

    #[tokio::test]
    async fn test_first_tick_deletes_nothing() {
        let mut mock = MockResourceClient::new();
        mock.expect_get().returning(|_, _| Ok(None));
        mock.expect_create().returning(|_, _, _| Ok(()));
        mock.expect_delete().times(0);

        let mut reconciler = Reconciler::new(Arc::new(mock));
        reconciler
            .apply("monsoon3", desired_with(&configmap_doc("foo", "v")), false)
            .await;
    }

    // =========================================================================
    // Story: Dry run reads and diffs but never writes
    // =========================================================================

    #[tokio::test]
    async fn test_dry_run_issues_no_writes() {
        let mut mock = MockResourceClient::new();
        mock.expect_get().times(1).returning(|_, _| Ok(None));
        mock.expect_create().times(0);
        mock.expect_patch().times(0);
        mock.expect_delete().times(0);

        let mut reconciler = Reconciler::new(Arc::new(mock));

        let first = reconciler
            .apply("monsoon3", desired_with(&configmap_doc("foo", "v")), true)
            .await;
        assert_eq!(first.created, 1);

        // Disappearance is also only logged
        let second = reconciler.apply("monsoon3", DesiredState::new(), true).await;
        assert_eq!(second.deleted, 1);
    }

    // =========================================================================
    // Story: One failing key does not block the rest
    // =========================================================================

    #[tokio::test]
    async fn test_failing_key_does_not_block_others() {
        let mut mock = MockResourceClient::new();
        mock.expect_get().returning(|_, key| {
            if key.name == "bad" {
                Err(Error::config("simulated api failure"))
            } else {
                Ok(None)
            }
        });
        mock.expect_create()
            .times(1)
            .withf(|_, key, _| key.name == "good")
            .returning(|_, _, _| Ok(()));

        let mut reconciler = Reconciler::new(Arc::new(mock));
        let both = format!("{}---\n{}", configmap_doc("bad", "v"), configmap_doc("good", "v"));
        let outcome = reconciler.apply("monsoon3", desired_with(&both), false).await;
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.created, 1);
    }
}
