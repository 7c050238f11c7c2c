use crate::{
    conditions::Condition,
    labels::{ANNOTATION_ACTIVATE, ANNOTATION_EXTRA, ANNOTATION_HOST_OR_URL, ANNOTATION_TEMPLATE_GENERATION},
    resources::ResourceSet,
};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// LynqNode is one form rendered for one hub row
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    kind = "LynqNode",
    status = "LynqNodeStatus",
    shortname = "ln",
    group = "operator.lynq.sh",
    version = "v1",
    namespaced
)]
#[kube(
    doc = "Custom resource representing one hub row rendered through one form",
    printcolumn = r#"
    {"name":"UID",        "type":"string",  "description":"Row uid", "jsonPath":".spec.uid"},
    {"name":"Form",       "type":"string",  "description":"Form", "jsonPath":".spec.templateRef"},
    {"name":"Ready",      "type":"string",  "description":"Ready", "jsonPath":".status.conditions[?(@.type == 'Ready')].status"},
    {"name":"Resources",  "type":"integer", "description":"Ready resources", "jsonPath":".status.readyResources"},
    {"name":"Desired",    "type":"integer", "description":"Desired resources", "jsonPath":".status.desiredResources"},
    {"name":"Conflicted", "type":"integer", "description":"Conflicted resources", "jsonPath":".status.conflictedResources", "priority": 1},
    {"name":"Age",        "type":"date",    "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LynqNodeSpec {
    /// Row uid
    pub uid: String,
    /// Name of the LynqForm this node was rendered from
    pub template_ref: String,
    /// Resources with rendered names, labels, annotations and namespaces
    #[serde(flatten)]
    pub resources: ResourceSet,
}

/// The status object of `LynqNode`
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LynqNodeStatus {
    /// Generation of the spec last applied
    #[serde(default)]
    pub observed_generation: i64,
    /// Number of resources declared
    #[serde(default)]
    pub desired_resources: i32,
    /// Number of resources ready
    #[serde(default)]
    pub ready_resources: i32,
    /// Number of resources that failed (conflicted ones included)
    #[serde(default)]
    pub failed_resources: i32,
    /// Number of resources owned by someone else
    #[serde(default)]
    pub conflicted_resources: i32,
    /// Keys (`Kind/Namespace/Name@id`) of the resources applied by the last spec pass
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applied_resources: Vec<String>,
    /// Ready, Progressing, Conflicted and Degraded
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl LynqNode {
    /// The row values stored on the node by the hub controller
    pub fn host_or_url(&self) -> Option<&str> {
        self.annotations().get(ANNOTATION_HOST_OR_URL).map(String::as_str)
    }

    pub fn activate(&self) -> Option<&str> {
        self.annotations().get(ANNOTATION_ACTIVATE).map(String::as_str)
    }

    /// Extra values, an empty map when the annotation is missing or not valid JSON
    pub fn extra(&self) -> BTreeMap<String, String> {
        self.annotations()
            .get(ANNOTATION_EXTRA)
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }

    pub fn template_generation(&self) -> Option<i64> {
        self.annotations()
            .get(ANNOTATION_TEMPLATE_GENERATION)
            .and_then(|g| g.parse().ok())
    }

    pub fn observed_generation(&self) -> i64 {
        self.status.as_ref().map(|s| s.observed_generation).unwrap_or_default()
    }

    pub fn applied_resources(&self) -> &[String] {
        self.status
            .as_ref()
            .map(|s| s.applied_resources.as_slice())
            .unwrap_or_default()
    }

    pub fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or_default()
    }
}
