use crate::{
    Result,
    conditions::{Condition, set_condition},
    k8sgeneric::{ObjectKey, ObjectStore},
    node::LynqNodeStatus,
};
use chrono::Utc;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::*;

/// Read-modify-write of a status subresource with a resourceVersion precondition.
///
/// Returns Ok(false) when the object is gone or when `mutate` leaves the status
/// untouched (no write is issued then). 409 answers are retried up to `attempts` times.
pub async fn update_status_with<S, F>(
    store: &dyn ObjectStore,
    key: &ObjectKey,
    attempts: u32,
    mut mutate: F,
) -> Result<bool>
where
    S: Serialize + DeserializeOwned + Default + PartialEq,
    F: FnMut(&mut S),
{
    let mut attempt = 0;
    loop {
        let Some(obj) = store.get(key).await? else {
            debug!("{} is gone, skipping status update", key);
            return Ok(false);
        };
        let old_value = obj.get("status").cloned().unwrap_or(Value::Null);
        let before: S = if old_value.is_null() {
            S::default()
        } else {
            serde_json::from_value(old_value.clone())?
        };
        let mut status = serde_json::from_value::<S>(serde_json::to_value(&before)?)?;
        mutate(&mut status);
        if status == before && !old_value.is_null() {
            return Ok(false);
        }
        let mut patch = serde_json::to_value(&status)?;
        // fields dropped by serialization must be cleared explicitly
        if let (Some(old), Some(new)) = (old_value.as_object(), patch.as_object_mut()) {
            for k in old.keys() {
                if !new.contains_key(k) {
                    new.insert(k.clone(), Value::Null);
                }
            }
        }
        let rv = obj.pointer("/metadata/resourceVersion").and_then(Value::as_str);
        match store.patch_status(key, &patch, rv).await {
            Ok(_) => return Ok(true),
            Err(e) if e.is_api_conflict() && attempt + 1 < attempts => {
                debug!("Status of {} changed underneath, retrying", key);
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(20 * u64::from(attempt))).await;
            }
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        }
    }
}

/// Pending changes to one LynqNode status
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeStatusUpdate {
    pub conditions: Vec<Condition>,
    pub desired: Option<i32>,
    pub ready: Option<i32>,
    pub failed: Option<i32>,
    pub conflicted: Option<i32>,
    pub applied_resources: Option<Vec<String>>,
    pub observed_generation: Option<i64>,
}

impl NodeStatusUpdate {
    #[must_use]
    pub fn condition(mut self, cond: Condition) -> Self {
        self.conditions.retain(|c| c.condition_type != cond.condition_type);
        self.conditions.push(cond);
        self
    }

    #[must_use]
    pub fn counters(mut self, desired: i32, ready: i32, failed: i32, conflicted: i32) -> Self {
        self.desired = Some(desired);
        self.ready = Some(ready);
        self.failed = Some(failed);
        self.conflicted = Some(conflicted);
        self
    }

    /// Fold a newer update into this one, the newer values winning
    pub fn absorb(&mut self, newer: NodeStatusUpdate) {
        for cond in newer.conditions {
            self.conditions.retain(|c| c.condition_type != cond.condition_type);
            self.conditions.push(cond);
        }
        self.desired = newer.desired.or(self.desired);
        self.ready = newer.ready.or(self.ready);
        self.failed = newer.failed.or(self.failed);
        self.conflicted = newer.conflicted.or(self.conflicted);
        self.applied_resources = newer.applied_resources.or(self.applied_resources.take());
        self.observed_generation = newer.observed_generation.or(self.observed_generation);
    }

    pub fn apply_to(&self, status: &mut LynqNodeStatus) {
        let now = Utc::now();
        for cond in &self.conditions {
            set_condition(&mut status.conditions, cond.clone(), now);
        }
        if let Some(v) = self.desired {
            status.desired_resources = v;
        }
        if let Some(v) = self.ready {
            status.ready_resources = v;
        }
        if let Some(v) = self.failed {
            status.failed_resources = v;
        }
        if let Some(v) = self.conflicted {
            status.conflicted_resources = v;
        }
        if let Some(v) = &self.applied_resources {
            status.applied_resources = v.clone();
        }
        if let Some(v) = self.observed_generation {
            status.observed_generation = v;
        }
    }
}

/// Coalesces LynqNode status updates and writes them with optimistic concurrency
pub struct StatusManager {
    store: Arc<dyn ObjectStore>,
    pending: Mutex<HashMap<ObjectKey, NodeStatusUpdate>>,
    attempts: u32,
}

impl StatusManager {
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, attempts: u32) -> StatusManager {
        StatusManager {
            store,
            pending: Mutex::new(HashMap::new()),
            attempts: attempts.max(1),
        }
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<ObjectKey, NodeStatusUpdate>> {
        self.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Queue an update, merging it with whatever is already pending for `key`
    pub fn queue(&self, key: &ObjectKey, update: NodeStatusUpdate) {
        let mut pending = self.pending();
        match pending.get_mut(key) {
            Some(existing) => existing.absorb(update),
            None => {
                pending.insert(key.clone(), update);
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    /// Write the pending update of `key`; returns whether the status changed
    pub async fn flush(&self, key: &ObjectKey) -> Result<bool> {
        let Some(update) = self.pending().remove(key) else {
            return Ok(false);
        };
        let res = update_status_with::<LynqNodeStatus, _>(self.store.as_ref(), key, self.attempts, |s| {
            update.apply_to(s)
        })
        .await;
        if res.is_err() {
            // keep it for the next flush unless something newer arrived meanwhile
            let mut pending = self.pending();
            let mut restored = update;
            if let Some(newer) = pending.remove(key) {
                restored.absorb(newer);
            }
            pending.insert(key.clone(), restored);
        }
        res
    }

    pub async fn flush_all(&self) {
        let keys: Vec<ObjectKey> = self.pending().keys().cloned().collect();
        for key in keys {
            if let Err(e) = self.flush(&key).await {
                warn!("Failed to write status of {}: {}", key, e);
            }
        }
    }

    /// Queue then write immediately
    pub async fn publish(&self, key: &ObjectKey, update: NodeStatusUpdate) -> Result<bool> {
        self.queue(key, update);
        self.flush(key).await
    }

    /// Drop what is pending for an object that went away
    pub fn forget(&self, key: &ObjectKey) {
        self.pending().remove(key);
    }

    /// Periodic flush of everything left pending
    pub async fn run(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            self.flush_all().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        LynqNode,
        conditions::{CONFLICTED, READY, find_condition},
        k8smock::MockStore,
    };
    use serde_json::json;

    fn node_key() -> ObjectKey {
        ObjectKey::of::<LynqNode>("tenants", "u1-web")
    }

    fn setup() -> (MockStore, StatusManager) {
        let store = MockStore::new();
        store
            .insert(json!({
                "apiVersion": "operator.lynq.sh/v1", "kind": "LynqNode",
                "metadata": {"name": "u1-web", "namespace": "tenants"},
                "spec": {"uid": "u1", "templateRef": "web"}
            }))
            .unwrap();
        let manager = StatusManager::new(Arc::new(store.clone()), 5);
        (store, manager)
    }

    fn status(store: &MockStore) -> LynqNodeStatus {
        serde_json::from_value(store.object(&node_key()).unwrap()["status"].clone()).unwrap()
    }

    #[tokio::test]
    async fn test_updates_are_coalesced_into_one_write() {
        let (store, manager) = setup();
        manager.queue(&node_key(), NodeStatusUpdate::default().counters(3, 1, 0, 0));
        manager.queue(
            &node_key(),
            NodeStatusUpdate::default()
                .counters(3, 2, 1, 0)
                .condition(Condition::new(READY, false, "ResourcesFailed", "")),
        );
        assert_eq!(manager.pending_count(), 1);
        assert!(manager.flush(&node_key()).await.unwrap());
        let s = status(&store);
        assert_eq!(s.ready_resources, 2);
        assert_eq!(s.failed_resources, 1);
        assert_eq!(find_condition(&s.conditions, READY).unwrap().reason, "ResourcesFailed");
        assert_eq!(store.writes().iter().filter(|w| w.starts_with("status")).count(), 1);
    }

    #[tokio::test]
    async fn test_conflicts_are_retried() {
        let (store, manager) = setup();
        store.inject_conflicts(&node_key(), 3);
        let update = NodeStatusUpdate::default().condition(Condition::new(CONFLICTED, false, "NoConflict", ""));
        assert!(manager.publish(&node_key(), update).await.unwrap());
        assert!(find_condition(&status(&store).conditions, CONFLICTED).is_some());
    }

    #[tokio::test]
    async fn test_exhausted_retries_keep_the_update_pending() {
        let store = MockStore::new();
        store
            .insert(json!({"apiVersion": "operator.lynq.sh/v1", "kind": "LynqNode",
                "metadata": {"name": "u1-web", "namespace": "tenants"}}))
            .unwrap();
        let manager = StatusManager::new(Arc::new(store.clone()), 2);
        store.inject_conflicts(&node_key(), 5);
        assert!(manager.publish(&node_key(), NodeStatusUpdate::default().counters(1, 1, 0, 0)).await.is_err());
        assert_eq!(manager.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_noop_write_is_elided() {
        let (store, manager) = setup();
        let update = NodeStatusUpdate::default().counters(1, 1, 0, 0);
        assert!(manager.publish(&node_key(), update.clone()).await.unwrap());
        store.clear_writes();
        assert!(!manager.publish(&node_key(), update).await.unwrap());
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn test_applied_resources_can_be_cleared() {
        let (store, manager) = setup();
        let mut update = NodeStatusUpdate::default();
        update.applied_resources = Some(vec!["ConfigMap/tenants/a@a".into()]);
        manager.publish(&node_key(), update).await.unwrap();
        let mut clear = NodeStatusUpdate::default();
        clear.applied_resources = Some(vec![]);
        manager.publish(&node_key(), clear).await.unwrap();
        assert!(status(&store).applied_resources.is_empty());
    }

    #[tokio::test]
    async fn test_missing_object_is_not_an_error() {
        let store = MockStore::new();
        let manager = StatusManager::new(Arc::new(store), 5);
        assert!(!manager.publish(&node_key(), NodeStatusUpdate::default()).await.unwrap());
    }
}
