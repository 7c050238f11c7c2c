use crate::{Error, Result, resources::known_api_version};
use async_trait::async_trait;
use kube::{
    Client, Resource,
    api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams},
    core::GroupVersionKind,
    discovery::{ApiCapabilities, ApiResource, Scope, pinned_kind},
};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// Identity of one object in the cluster
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> ObjectKey {
        ObjectKey {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        }
    }

    /// Key of a typed resource
    pub fn of<K: Resource<DynamicType = ()>>(namespace: &str, name: &str) -> ObjectKey {
        ObjectKey::new(&K::api_version(&()), &K::kind(&()), Some(namespace), name)
    }

    /// Key of a manifest, apiVersion defaulting for the builtin kinds
    pub fn from_value(obj: &Value) -> Result<ObjectKey> {
        let kind = obj
            .get("kind")
            .and_then(Value::as_str)
            .filter(|k| !k.is_empty())
            .ok_or(Error::MissingObjectKey("kind"))?;
        let api_version = obj
            .get("apiVersion")
            .and_then(Value::as_str)
            .filter(|v| !v.is_empty())
            .or_else(|| known_api_version(kind))
            .ok_or(Error::MissingObjectKey("apiVersion"))?;
        let name = obj
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .filter(|n| !n.is_empty())
            .ok_or(Error::MissingObjectKey("metadata.name"))?;
        let namespace = obj
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .filter(|n| !n.is_empty());
        Ok(ObjectKey::new(api_version, kind, namespace, name))
    }

    fn gvk(&self) -> GroupVersionKind {
        match self.api_version.split_once('/') {
            Some((group, version)) => GroupVersionKind::gvk(group, version, &self.kind),
            None => GroupVersionKind::gvk("", &self.api_version, &self.kind),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Object access used by the apply engine, the status manager and the controllers.
///
/// Objects travel as JSON trees; the typed helpers below deserialize them.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// None when the object does not exist
    async fn get(&self, key: &ObjectKey) -> Result<Option<Value>>;

    /// Fails with a 409 when the object already exists
    async fn create(&self, obj: &Value) -> Result<Value>;

    /// Full update, `metadata.resourceVersion` (when set) is a precondition
    async fn replace(&self, obj: &Value) -> Result<Value>;

    /// Returns false when the object was already gone
    async fn delete(&self, key: &ObjectKey) -> Result<bool>;

    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Value>>;

    /// Merge `status` into the status subresource, guarded by `resource_version`
    async fn patch_status(&self, key: &ObjectKey, status: &Value, resource_version: Option<&str>)
    -> Result<Value>;
}

pub async fn get_as<K: DeserializeOwned>(store: &dyn ObjectStore, key: &ObjectKey) -> Result<Option<K>> {
    match store.get(key).await? {
        Some(v) => Ok(Some(serde_json::from_value(v)?)),
        None => Ok(None),
    }
}

pub async fn list_as<K: Resource<DynamicType = ()> + DeserializeOwned>(
    store: &dyn ObjectStore,
    namespace: &str,
    labels: &BTreeMap<String, String>,
) -> Result<Vec<K>> {
    store
        .list(&K::api_version(&()), &K::kind(&()), Some(namespace), labels)
        .await?
        .into_iter()
        .map(|v| serde_json::from_value(v).map_err(Error::SerializationError))
        .collect()
}

/// Replace a typed resource, returning the stored version
pub async fn replace_as<K: serde::Serialize + DeserializeOwned>(store: &dyn ObjectStore, obj: &K) -> Result<K> {
    let stored = store.replace(&serde_json::to_value(obj)?).await?;
    Ok(serde_json::from_value(stored)?)
}

fn selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// ObjectStore backed by the kubernetes API, kinds resolved through discovery
pub struct KubeStore {
    client: Client,
    cache: RwLock<HashMap<(String, String), (ApiResource, ApiCapabilities)>>,
}

impl KubeStore {
    #[must_use]
    pub fn new(client: Client) -> KubeStore {
        KubeStore {
            client,
            cache: RwLock::new(HashMap::new()),
        }
    }

    async fn resolve(&self, api_version: &str, kind: &str) -> Result<(ApiResource, ApiCapabilities)> {
        let cache_key = (api_version.to_string(), kind.to_string());
        if let Some(found) = self.cache.read().await.get(&cache_key) {
            return Ok(found.clone());
        }
        let gvk = ObjectKey::new(api_version, kind, None, "").gvk();
        let found = pinned_kind(&self.client, &gvk).await.map_err(|e| match e {
            kube::Error::Discovery(_) => Error::UnknownKind(format!("{api_version}/{kind}")),
            other => Error::KubeError(other),
        })?;
        tracing::debug!("Resolved {}/{} to {}", api_version, kind, found.0.plural);
        self.cache.write().await.insert(cache_key, found.clone());
        Ok(found)
    }

    async fn api(&self, api_version: &str, kind: &str, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
        let (res, caps) = self.resolve(api_version, kind).await?;
        Ok(match (caps.scope, namespace) {
            (Scope::Cluster, _) | (Scope::Namespaced, None) => Api::all_with(self.client.clone(), &res),
            (Scope::Namespaced, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &res),
        })
    }

    async fn api_for(&self, key: &ObjectKey) -> Result<Api<DynamicObject>> {
        self.api(&key.api_version, &key.kind, key.namespace.as_deref()).await
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Value>> {
        let api = self.api_for(key).await?;
        match api.get_opt(&key.name).await? {
            Some(obj) => Ok(Some(serde_json::to_value(obj)?)),
            None => Ok(None),
        }
    }

    async fn create(&self, obj: &Value) -> Result<Value> {
        let key = ObjectKey::from_value(obj)?;
        let api = self.api_for(&key).await?;
        let data: DynamicObject = serde_json::from_value(obj.clone())?;
        let created = api.create(&PostParams::default(), &data).await?;
        Ok(serde_json::to_value(created)?)
    }

    async fn replace(&self, obj: &Value) -> Result<Value> {
        let key = ObjectKey::from_value(obj)?;
        let api = self.api_for(&key).await?;
        let data: DynamicObject = serde_json::from_value(obj.clone())?;
        let replaced = api.replace(&key.name, &PostParams::default(), &data).await?;
        Ok(serde_json::to_value(replaced)?)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<bool> {
        let api = self.api_for(key).await?;
        match api.delete(&key.name, &DeleteParams::background()).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(false),
            Err(e) => Err(Error::KubeError(e)),
        }
    }

    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Value>> {
        let api = self.api(api_version, kind, namespace).await?;
        let mut params = ListParams::default();
        if !labels.is_empty() {
            params = params.labels(&selector(labels));
        }
        api.list(&params)
            .await?
            .items
            .into_iter()
            .map(|o| serde_json::to_value(o).map_err(Error::SerializationError))
            .collect()
    }

    async fn patch_status(
        &self,
        key: &ObjectKey,
        status: &Value,
        resource_version: Option<&str>,
    ) -> Result<Value> {
        let api = self.api_for(key).await?;
        let mut patch = json!({ "status": status });
        if let Some(rv) = resource_version {
            patch["metadata"] = json!({ "resourceVersion": rv });
        }
        let patched = api
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(serde_json::to_value(patched)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LynqNode;

    #[test]
    fn test_key_from_manifest_defaults_api_version() {
        let key = ObjectKey::from_value(&json!({
            "kind": "ConfigMap", "metadata": {"name": "cm", "namespace": "default"}
        }))
        .unwrap();
        assert_eq!(key.api_version, "v1");
        assert_eq!(key.to_string(), "ConfigMap/default/cm");
    }

    #[test]
    fn test_key_requires_name() {
        let err = ObjectKey::from_value(&json!({"kind": "ConfigMap", "apiVersion": "v1"})).unwrap_err();
        assert!(matches!(err, Error::MissingObjectKey("metadata.name")));
        assert!(ObjectKey::from_value(&json!({"kind": "Widget", "metadata": {"name": "w"}})).is_err());
    }

    #[test]
    fn test_typed_key() {
        let key = ObjectKey::of::<LynqNode>("tenants", "acme-web");
        assert_eq!(key.api_version, "operator.lynq.sh/v1");
        assert_eq!(key.kind, "LynqNode");
        assert_eq!(key.gvk().group, "operator.lynq.sh");
    }

    #[test]
    fn test_selector_is_sorted() {
        let mut labels = BTreeMap::new();
        labels.insert("lynq.sh/uid".to_string(), "u1".to_string());
        labels.insert("lynq.sh/hub".to_string(), "h".to_string());
        assert_eq!(selector(&labels), "lynq.sh/hub=h,lynq.sh/uid=u1");
    }
}
