//! Bookkeeping of the children applied by a LynqNode.
//!
//! Each applied child is recorded in `status.appliedResources` as
//! `Kind/Namespace/Name@id`, the namespace being empty for cluster scoped kinds.
//! The previous list diffed against the current rendering gives the orphans.
use crate::{Error, Result};
use common::{k8sgeneric::ObjectKey, resources::known_api_version};
use serde_json::Value;
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AppliedKey {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub id: String,
}

impl AppliedKey {
    pub fn of(obj: &Value, id: &str) -> Result<AppliedKey> {
        let key = ObjectKey::from_value(obj)?;
        Ok(AppliedKey {
            kind: key.kind,
            namespace: key.namespace.unwrap_or_default(),
            name: key.name,
            id: id.to_string(),
        })
    }

    /// Address of the child; `api_versions` covers the kinds without a builtin version
    pub fn object_key(&self, api_versions: &BTreeMap<String, String>) -> Option<ObjectKey> {
        let api_version = known_api_version(&self.kind)
            .map(str::to_string)
            .or_else(|| api_versions.get(&self.kind).cloned())?;
        let namespace = (!self.namespace.is_empty()).then_some(self.namespace.as_str());
        Some(ObjectKey::new(&api_version, &self.kind, namespace, &self.name))
    }
}

impl fmt::Display for AppliedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}@{}", self.kind, self.namespace, self.name, self.id)
    }
}

impl FromStr for AppliedKey {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        let invalid = || Error::InvalidResourceKey(raw.to_string());
        let (path, id) = raw.split_once('@').ok_or_else(invalid)?;
        let parts: Vec<&str> = path.split('/').collect();
        let [kind, namespace, name] = parts.as_slice() else {
            return Err(invalid());
        };
        if kind.is_empty() || name.is_empty() || id.is_empty() {
            return Err(invalid());
        }
        Ok(AppliedKey {
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            id: id.to_string(),
        })
    }
}

/// Keys of `previous` missing from `current`, in their original order
pub fn orphans(previous: &[String], current: &BTreeSet<String>) -> Vec<String> {
    previous
        .iter()
        .filter(|k| !current.contains(*k))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_format() {
        let cm = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "u1-cm", "namespace": "tenants"}});
        let key = AppliedKey::of(&cm, "cm").unwrap();
        assert_eq!(key.to_string(), "ConfigMap/tenants/u1-cm@cm");
        assert_eq!("ConfigMap/tenants/u1-cm@cm".parse::<AppliedKey>().unwrap(), key);
    }

    #[test]
    fn test_cluster_scoped_key() {
        let ns = json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "u1"}});
        let key = AppliedKey::of(&ns, "ns").unwrap();
        assert_eq!(key.to_string(), "Namespace//u1@ns");
        let object = key.object_key(&BTreeMap::new()).unwrap();
        assert_eq!(object.namespace, None);
        assert_eq!(object.api_version, "v1");
    }

    #[test]
    fn test_invalid_keys() {
        for raw in ["ConfigMap/tenants/u1-cm", "ConfigMap/u1-cm@cm", "/tenants/x@y", "ConfigMap/tenants/x@"] {
            assert!(raw.parse::<AppliedKey>().is_err(), "{raw}");
        }
    }

    #[test]
    fn test_custom_kind_needs_a_known_version() {
        let key: AppliedKey = "Certificate/tenants/u1-tls@tls".parse().unwrap();
        assert!(key.object_key(&BTreeMap::new()).is_none());
        let versions = BTreeMap::from([("Certificate".to_string(), "cert-manager.io/v1".to_string())]);
        assert_eq!(key.object_key(&versions).unwrap().api_version, "cert-manager.io/v1");
    }

    #[test]
    fn test_orphans_keep_order() {
        let previous = vec!["a@1".to_string(), "b@2".to_string(), "c@3".to_string()];
        let current = BTreeSet::from(["b@2".to_string()]);
        assert_eq!(orphans(&previous, &current), vec!["a@1", "c@3"]);
    }
}
