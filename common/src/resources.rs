use schemars::{
    JsonSchema,
    r#gen::SchemaGenerator,
    schema::{InstanceType, Schema, SchemaObject},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::BTreeMap, fmt, str::FromStr};

/// Schema for untyped kubernetes manifests
pub fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    let mut obj = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    obj.extensions
        .insert("x-kubernetes-preserve-unknown-fields".to_string(), Value::Bool(true));
    Schema::Object(obj)
}

/// Whether a resource is kept in sync or only created once
#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Copy, Debug, JsonSchema, Default)]
pub enum CreationPolicy {
    /// Create and keep the resource in sync with the template
    #[default]
    WhenNeeded,
    /// Create the resource once, never update it afterward
    Once,
}

/// What happens to a resource when its LynqNode goes away
#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Copy, Debug, JsonSchema, Default)]
pub enum DeletionPolicy {
    /// Owned through an ownerReference, garbage collected with the LynqNode
    #[default]
    Delete,
    /// Tracked by labels, left in place with orphan markers
    Retain,
}

impl DeletionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeletionPolicy::Delete => "Delete",
            DeletionPolicy::Retain => "Retain",
        }
    }
}

impl fmt::Display for DeletionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeletionPolicy {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Delete" => Ok(DeletionPolicy::Delete),
            "Retain" => Ok(DeletionPolicy::Retain),
            other => Err(crate::Error::Other(format!("unknown deletion policy {other}"))),
        }
    }
}

/// Behaviour when the target object is owned by someone else
#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Copy, Debug, JsonSchema, Default)]
pub enum ConflictPolicy {
    /// Refuse to touch the object and report a conflict
    #[default]
    Stuck,
    /// Take the object over
    Force,
}

impl ConflictPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::Stuck => "Stuck",
            ConflictPolicy::Force => "Force",
        }
    }
}

/// How updates are written to an existing object
#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Copy, Debug, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum PatchStrategy {
    /// Three-way merge against the last applied configuration
    #[default]
    Merge,
    /// Full overwrite, fields missing from the template are removed
    Replace,
}

fn default_wait_for_ready() -> bool {
    true
}

fn default_timeout_seconds() -> i32 {
    300
}

/// TResource is one templated kubernetes object inside a LynqForm or a LynqNode
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TResource {
    /// Identifier of the resource, unique within the template
    pub id: String,
    /// Kubernetes manifest, strings may contain template placeholders
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub spec: Value,
    /// Ids of the resources that must be applied before this one
    #[serde(default, alias = "dependsOn", skip_serializing_if = "Vec::is_empty")]
    pub depend_ids: Vec<String>,
    /// WhenNeeded (default) or Once
    #[serde(default)]
    pub creation_policy: CreationPolicy,
    /// Delete (default) or Retain
    #[serde(default)]
    pub deletion_policy: DeletionPolicy,
    /// Stuck (default) or Force
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    /// Namespace template, defaults to the LynqNode namespace
    #[serde(default, alias = "namespaceTemplate", skip_serializing_if = "Option::is_none")]
    pub target_namespace: Option<String>,
    /// Name template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_template: Option<String>,
    /// Labels templates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels_template: Option<BTreeMap<String, String>>,
    /// Annotations templates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations_template: Option<BTreeMap<String, String>>,
    /// Sample the readiness of the object after apply
    #[serde(default = "default_wait_for_ready")]
    pub wait_for_ready: bool,
    /// Readiness budget in seconds
    #[serde(default = "default_timeout_seconds")]
    #[schemars(range(min = 1, max = 3600))]
    pub timeout_seconds: i32,
    /// merge (default) or replace
    #[serde(default)]
    pub patch_strategy: PatchStrategy,
    /// Paths (`$.spec.replicas`, `$.data['key']`) whose live value is preserved
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore_fields: Vec<String>,
}

impl TResource {
    pub fn kind(&self) -> &str {
        self.spec.get("kind").and_then(Value::as_str).unwrap_or_default()
    }

    pub fn api_version(&self) -> &str {
        self.spec.get("apiVersion").and_then(Value::as_str).unwrap_or_default()
    }
}

/// apiVersion of the builtin kinds handled by the typed lists
pub fn known_api_version(kind: &str) -> Option<&'static str> {
    match kind {
        "Namespace" | "ServiceAccount" | "Service" | "ConfigMap" | "Secret" | "PersistentVolumeClaim"
        | "Pod" => Some("v1"),
        "Deployment" | "StatefulSet" | "DaemonSet" => Some("apps/v1"),
        "Job" | "CronJob" => Some("batch/v1"),
        "Ingress" | "NetworkPolicy" => Some("networking.k8s.io/v1"),
        "PodDisruptionBudget" => Some("policy/v1"),
        "HorizontalPodAutoscaler" => Some("autoscaling/v2"),
        _ => None,
    }
}

/// The typed resource lists shared by LynqForm and LynqNode specs
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSet {
    /// ServiceAccounts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_accounts: Vec<TResource>,
    /// Deployments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deployments: Vec<TResource>,
    /// StatefulSets
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stateful_sets: Vec<TResource>,
    /// DaemonSets
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub daemon_sets: Vec<TResource>,
    /// Services
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<TResource>,
    /// Ingresses
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ingresses: Vec<TResource>,
    /// ConfigMaps
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config_maps: Vec<TResource>,
    /// Secrets
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<TResource>,
    /// PersistentVolumeClaims
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub persistent_volume_claims: Vec<TResource>,
    /// Jobs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub jobs: Vec<TResource>,
    /// CronJobs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cron_jobs: Vec<TResource>,
    /// PodDisruptionBudgets
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pod_disruption_budgets: Vec<TResource>,
    /// NetworkPolicies
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network_policies: Vec<TResource>,
    /// HorizontalPodAutoscalers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub horizontal_pod_autoscalers: Vec<TResource>,
    /// Namespaces
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<TResource>,
    /// Arbitrary manifests, apiVersion and kind are mandatory
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub manifests: Vec<TResource>,
}

impl ResourceSet {
    fn lists(&self) -> [(Option<&'static str>, &Vec<TResource>); 16] {
        [
            (Some("ServiceAccount"), &self.service_accounts),
            (Some("Deployment"), &self.deployments),
            (Some("StatefulSet"), &self.stateful_sets),
            (Some("DaemonSet"), &self.daemon_sets),
            (Some("Service"), &self.services),
            (Some("Ingress"), &self.ingresses),
            (Some("ConfigMap"), &self.config_maps),
            (Some("Secret"), &self.secrets),
            (Some("PersistentVolumeClaim"), &self.persistent_volume_claims),
            (Some("Job"), &self.jobs),
            (Some("CronJob"), &self.cron_jobs),
            (Some("PodDisruptionBudget"), &self.pod_disruption_budgets),
            (Some("NetworkPolicy"), &self.network_policies),
            (Some("HorizontalPodAutoscaler"), &self.horizontal_pod_autoscalers),
            (Some("Namespace"), &self.namespaces),
            (None, &self.manifests),
        ]
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TResource> {
        self.service_accounts
            .iter_mut()
            .chain(self.deployments.iter_mut())
            .chain(self.stateful_sets.iter_mut())
            .chain(self.daemon_sets.iter_mut())
            .chain(self.services.iter_mut())
            .chain(self.ingresses.iter_mut())
            .chain(self.config_maps.iter_mut())
            .chain(self.secrets.iter_mut())
            .chain(self.persistent_volume_claims.iter_mut())
            .chain(self.jobs.iter_mut())
            .chain(self.cron_jobs.iter_mut())
            .chain(self.pod_disruption_budgets.iter_mut())
            .chain(self.network_policies.iter_mut())
            .chain(self.horizontal_pod_autoscalers.iter_mut())
            .chain(self.namespaces.iter_mut())
            .chain(self.manifests.iter_mut())
    }

    /// Flatten every list in declaration order.
    ///
    /// Entries of a typed list get their `kind` and `apiVersion` filled in when the
    /// manifest leaves them out.
    pub fn collect(&self) -> Vec<TResource> {
        let mut all = Vec::new();
        for (kind, list) in self.lists() {
            for res in list {
                let mut res = res.clone();
                if let Some(kind) = kind {
                    default_type(&mut res.spec, kind);
                }
                all.push(res);
            }
        }
        all
    }

    pub fn len(&self) -> usize {
        self.lists().iter().map(|(_, l)| l.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids declared more than once, sorted
    pub fn duplicate_ids(&self) -> Vec<String> {
        let mut seen: BTreeMap<&str, usize> = BTreeMap::new();
        for (_, list) in self.lists() {
            for res in list {
                *seen.entry(res.id.as_str()).or_default() += 1;
            }
        }
        seen.into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(id, _)| id.to_string())
            .collect()
    }
}

fn default_type(spec: &mut Value, kind: &str) {
    if !spec.is_object() {
        *spec = Value::Object(Default::default());
    }
    if let Some(obj) = spec.as_object_mut() {
        if !obj.get("kind").is_some_and(Value::is_string) {
            obj.insert("kind".to_string(), Value::from(kind));
        }
        if !obj.get("apiVersion").is_some_and(Value::is_string) {
            if let Some(api_version) = known_api_version(kind) {
                obj.insert("apiVersion".to_string(), Value::from(api_version));
            }
        }
    }
}
