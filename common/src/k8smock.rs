use crate::{
    Error, Result,
    k8sgeneric::{ObjectKey, ObjectStore},
    merge::{comparable, merge_patch},
};
use async_trait::async_trait;
use kube::core::ErrorResponse;
use serde_json::{Value, json};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard},
};

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::KubeError(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

fn not_found(key: &ObjectKey) -> Error {
    api_error(404, "NotFound", format!("{key} not found"))
}

#[derive(Default, Debug)]
struct MockState {
    objects: BTreeMap<ObjectKey, Value>,
    revision: u64,
    // pending injected 409 per key
    conflicts: HashMap<ObjectKey, usize>,
    // create/replace of these keys fail
    failing: Vec<ObjectKey>,
    // get of these keys fail
    unreadable: Vec<ObjectKey>,
    writes: Vec<String>,
}

impl MockState {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }

    fn take_conflict(&mut self, key: &ObjectKey) -> bool {
        match self.conflicts.get_mut(key) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }

    fn is_failing(&self, key: &ObjectKey) -> bool {
        self.failing.iter().any(|k| k == key)
    }

    /// Drop an object and, like the garbage collector, everything it controls
    fn remove_cascading(&mut self, key: &ObjectKey) {
        let Some(obj) = self.objects.remove(key) else {
            return;
        };
        let Some(uid) = obj.pointer("/metadata/uid").and_then(Value::as_str) else {
            return;
        };
        let dependents: Vec<ObjectKey> = self
            .objects
            .iter()
            .filter(|(_, o)| {
                o.pointer("/metadata/ownerReferences")
                    .and_then(Value::as_array)
                    .is_some_and(|refs| refs.iter().any(|r| r.get("uid").and_then(Value::as_str) == Some(uid)))
            })
            .map(|(k, _)| k.clone())
            .collect();
        for dep in dependents {
            self.writes.push(format!("gc {dep}"));
            self.delete_one(&dep);
        }
    }

    /// Finalizers turn a delete into a deletionTimestamp
    fn delete_one(&mut self, key: &ObjectKey) -> bool {
        let rv = self.next_revision();
        let Some(obj) = self.objects.get_mut(key) else {
            return false;
        };
        let has_finalizers = obj
            .pointer("/metadata/finalizers")
            .and_then(Value::as_array)
            .is_some_and(|f| !f.is_empty());
        if has_finalizers {
            if obj.pointer("/metadata/deletionTimestamp").is_none() {
                obj["metadata"]["deletionTimestamp"] = json!(chrono::Utc::now().to_rfc3339());
                obj["metadata"]["resourceVersion"] = json!(rv);
            }
        } else {
            self.remove_cascading(key);
        }
        true
    }
}

/// In-memory ObjectStore with the API server behaviours the controllers rely on:
/// resourceVersion preconditions, 404/409 errors, finalizers and owner-based
/// garbage collection.
#[derive(Clone, Default, Debug)]
pub struct MockStore {
    state: Arc<Mutex<MockState>>,
}

impl MockStore {
    #[must_use]
    pub fn new() -> MockStore {
        MockStore::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // a panicking test must not poison the others
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Store an object as if some other actor created it
    pub fn insert(&self, obj: Value) -> Result<Value> {
        let key = ObjectKey::from_value(&obj)?;
        let mut state = self.lock();
        let stored = stamp_new(&mut state, obj);
        state.objects.insert(key, stored.clone());
        Ok(stored)
    }

    pub fn object(&self, key: &ObjectKey) -> Option<Value> {
        self.lock().objects.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        self.lock().objects.keys().cloned().collect()
    }

    /// Edit a stored object in place, bumping its resourceVersion
    pub fn modify(&self, key: &ObjectKey, f: impl FnOnce(&mut Value)) {
        let mut state = self.lock();
        let rv = state.next_revision();
        if let Some(obj) = state.objects.get_mut(key) {
            f(obj);
            obj["metadata"]["resourceVersion"] = json!(rv);
        }
    }

    pub fn remove(&self, key: &ObjectKey) {
        self.lock().remove_cascading(key);
    }

    /// The next `times` writes to `key` fail with 409
    pub fn inject_conflicts(&self, key: &ObjectKey, times: usize) {
        self.lock().conflicts.insert(key.clone(), times);
    }

    /// Every create or replace of `key` fails with a 500
    pub fn fail_writes(&self, key: &ObjectKey) {
        self.lock().failing.push(key.clone());
    }

    /// Every get of `key` fails with a 500 until `heal` is called
    pub fn fail_reads(&self, key: &ObjectKey) {
        self.lock().unreadable.push(key.clone());
    }

    /// Stop failing reads and writes of `key`
    pub fn heal(&self, key: &ObjectKey) {
        let mut state = self.lock();
        state.failing.retain(|k| k != key);
        state.unreadable.retain(|k| k != key);
    }

    /// Log of the mutating calls, `verb Kind/ns/name`
    pub fn writes(&self) -> Vec<String> {
        self.lock().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }
}

fn stamp_new(state: &mut MockState, mut obj: Value) -> Value {
    let rv = state.next_revision();
    let meta = &mut obj["metadata"];
    if meta.get("uid").is_none() {
        meta["uid"] = json!(format!("uid-{rv}"));
    }
    meta["resourceVersion"] = json!(rv);
    meta["generation"] = json!(1);
    if meta.get("creationTimestamp").is_none() {
        meta["creationTimestamp"] = json!(chrono::Utc::now().to_rfc3339());
    }
    obj
}

fn without_meta_and_status(obj: &Value) -> Value {
    let mut out = obj.clone();
    if let Some(map) = out.as_object_mut() {
        map.remove("metadata");
        map.remove("status");
    }
    out
}

fn matches_labels(obj: &Value, labels: &BTreeMap<String, String>) -> bool {
    labels.iter().all(|(k, v)| {
        obj.pointer("/metadata/labels")
            .and_then(|l| l.get(k))
            .and_then(Value::as_str)
            == Some(v.as_str())
    })
}

#[async_trait]
impl ObjectStore for MockStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Value>> {
        let state = self.lock();
        if state.unreadable.contains(key) {
            return Err(api_error(500, "InternalError", format!("get of {key} refused")));
        }
        Ok(state.objects.get(key).cloned())
    }

    async fn create(&self, obj: &Value) -> Result<Value> {
        let key = ObjectKey::from_value(obj)?;
        let mut state = self.lock();
        if state.is_failing(&key) {
            return Err(api_error(500, "InternalError", format!("create of {key} refused")));
        }
        if state.objects.contains_key(&key) {
            return Err(api_error(409, "AlreadyExists", format!("{key} already exists")));
        }
        let mut stored = obj.clone();
        if let Some(map) = stored.as_object_mut() {
            map.remove("status");
        }
        if let Some(meta) = stored["metadata"].as_object_mut() {
            meta.remove("resourceVersion");
            meta.remove("deletionTimestamp");
        }
        let stored = stamp_new(&mut state, stored);
        state.writes.push(format!("create {key}"));
        state.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn replace(&self, obj: &Value) -> Result<Value> {
        let key = ObjectKey::from_value(obj)?;
        let mut state = self.lock();
        if state.is_failing(&key) {
            return Err(api_error(500, "InternalError", format!("update of {key} refused")));
        }
        let Some(current) = state.objects.get(&key).cloned() else {
            return Err(not_found(&key));
        };
        let current_rv = current.pointer("/metadata/resourceVersion").cloned();
        let wanted_rv = obj.pointer("/metadata/resourceVersion").cloned();
        if state.take_conflict(&key) || wanted_rv.is_some_and(|rv| Some(rv) != current_rv) {
            return Err(api_error(409, "Conflict", format!("{key} has been modified")));
        }
        let mut next = obj.clone();
        // status and server-owned metadata are not writable through replace
        match current.get("status") {
            Some(status) => next["status"] = status.clone(),
            None => {
                if let Some(map) = next.as_object_mut() {
                    map.remove("status");
                }
            }
        }
        for field in ["uid", "creationTimestamp", "deletionTimestamp", "generation", "resourceVersion"] {
            match current.pointer(&format!("/metadata/{field}")) {
                Some(v) => next["metadata"][field] = v.clone(),
                None => {
                    if let Some(meta) = next["metadata"].as_object_mut() {
                        meta.remove(field);
                    }
                }
            }
        }
        if comparable(&next) == comparable(&current) {
            return Ok(current);
        }
        if without_meta_and_status(&next) != without_meta_and_status(&current) {
            let generation = current.pointer("/metadata/generation").and_then(Value::as_i64).unwrap_or(1);
            next["metadata"]["generation"] = json!(generation + 1);
        }
        let rv = state.next_revision();
        next["metadata"]["resourceVersion"] = json!(rv);
        state.writes.push(format!("replace {key}"));
        let finalized = next.pointer("/metadata/deletionTimestamp").is_some()
            && !next
                .pointer("/metadata/finalizers")
                .and_then(Value::as_array)
                .is_some_and(|f| !f.is_empty());
        state.objects.insert(key.clone(), next.clone());
        if finalized {
            state.remove_cascading(&key);
        }
        Ok(next)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<bool> {
        let mut state = self.lock();
        let found = state.delete_one(key);
        if found {
            state.writes.push(format!("delete {key}"));
        }
        Ok(found)
    }

    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Value>> {
        Ok(self
            .lock()
            .objects
            .iter()
            .filter(|(k, o)| {
                k.api_version == api_version
                    && k.kind == kind
                    && namespace.is_none_or(|ns| k.namespace.as_deref() == Some(ns))
                    && matches_labels(o, labels)
            })
            .map(|(_, o)| o.clone())
            .collect())
    }

    async fn patch_status(
        &self,
        key: &ObjectKey,
        status: &Value,
        resource_version: Option<&str>,
    ) -> Result<Value> {
        let mut state = self.lock();
        let Some(current) = state.objects.get(key).cloned() else {
            return Err(not_found(key));
        };
        let current_rv = current.pointer("/metadata/resourceVersion").and_then(Value::as_str);
        if state.take_conflict(key) || resource_version.is_some_and(|rv| Some(rv) != current_rv) {
            return Err(api_error(409, "Conflict", format!("{key} has been modified")));
        }
        let mut next = current.clone();
        merge_patch(&mut next, &json!({ "status": status }));
        if next == current {
            return Ok(current);
        }
        let rv = state.next_revision();
        next["metadata"]["resourceVersion"] = json!(rv);
        state.writes.push(format!("status {key}"));
        state.objects.insert(key.clone(), next.clone());
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cm(name: &str) -> Value {
        json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name, "namespace": "ns"}, "data": {"k": "v"}})
    }

    #[tokio::test]
    async fn test_create_then_already_exists() {
        let store = MockStore::new();
        store.create(&cm("a")).await.unwrap();
        let err = store.create(&cm("a")).await.unwrap_err();
        assert!(err.is_api_conflict());
    }

    #[tokio::test]
    async fn test_replace_checks_resource_version() {
        let store = MockStore::new();
        let created = store.create(&cm("a")).await.unwrap();
        let mut stale = created.clone();
        stale["data"]["k"] = json!("w");
        store.replace(&stale).await.unwrap();
        let err = store.replace(&stale).await.unwrap_err();
        assert!(err.is_api_conflict());
    }

    #[tokio::test]
    async fn test_noop_replace_keeps_resource_version() {
        let store = MockStore::new();
        let created = store.create(&cm("a")).await.unwrap();
        let again = store.replace(&created).await.unwrap();
        assert_eq!(again["metadata"]["resourceVersion"], created["metadata"]["resourceVersion"]);
    }

    #[tokio::test]
    async fn test_delete_collects_owned_objects() {
        let store = MockStore::new();
        let owner = store.create(&cm("owner")).await.unwrap();
        let mut child = cm("child");
        child["metadata"]["ownerReferences"] = json!([{"uid": owner["metadata"]["uid"], "name": "owner"}]);
        store.create(&child).await.unwrap();
        store.create(&cm("other")).await.unwrap();
        assert!(store.delete(&ObjectKey::from_value(&owner).unwrap()).await.unwrap());
        assert_eq!(store.keys().len(), 1);
        assert!(!store.delete(&ObjectKey::from_value(&owner).unwrap()).await.unwrap());
    }

    #[tokio::test]
    async fn test_finalizer_delays_deletion() {
        let store = MockStore::new();
        let mut obj = cm("guarded");
        obj["metadata"]["finalizers"] = json!(["x/y"]);
        store.create(&obj).await.unwrap();
        let key = ObjectKey::from_value(&obj).unwrap();
        store.delete(&key).await.unwrap();
        let mut live = store.object(&key).unwrap();
        assert!(live.pointer("/metadata/deletionTimestamp").is_some());
        live["metadata"]["finalizers"] = json!([]);
        store.replace(&live).await.unwrap();
        assert!(store.object(&key).is_none());
    }

    #[tokio::test]
    async fn test_failing_reads_until_healed() {
        let store = MockStore::new();
        let created = store.create(&cm("r")).await.unwrap();
        let key = ObjectKey::from_value(&created).unwrap();
        store.fail_reads(&key);
        assert!(store.get(&key).await.is_err());
        store.heal(&key);
        assert!(store.get(&key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_patch_status_and_injected_conflict() {
        let store = MockStore::new();
        let created = store.create(&cm("s")).await.unwrap();
        let key = ObjectKey::from_value(&created).unwrap();
        store.inject_conflicts(&key, 1);
        let rv = created["metadata"]["resourceVersion"].as_str().map(str::to_string);
        assert!(store.patch_status(&key, &json!({"ready": 1}), rv.as_deref()).await.is_err());
        let patched = store.patch_status(&key, &json!({"ready": 1}), rv.as_deref()).await.unwrap();
        assert_eq!(patched["status"]["ready"], 1);
    }
}
