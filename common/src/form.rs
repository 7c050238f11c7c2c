use crate::{conditions::Condition, resources::ResourceSet};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// LynqForm is the template instantiated once per active hub row
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    kind = "LynqForm",
    status = "LynqFormStatus",
    shortname = "lf",
    group = "operator.lynq.sh",
    version = "v1",
    namespaced
)]
#[kube(
    doc = "Custom resource describing the resources rendered for every hub row",
    printcolumn = r#"
    {"name":"Hub",     "type":"string",  "description":"Hub", "jsonPath":".spec.hubId"},
    {"name":"Total",   "type":"integer", "description":"Nodes using the form", "jsonPath":".status.totalNodes"},
    {"name":"Ready",   "type":"integer", "description":"Ready nodes", "jsonPath":".status.readyNodes"},
    {"name":"Applied", "type":"string",  "description":"Applied", "jsonPath":".status.conditions[?(@.type == 'Applied')].status"},
    {"name":"Age",     "type":"date",    "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LynqFormSpec {
    /// Name of the LynqHub in the same namespace
    pub hub_id: String,
    /// Templated resources
    #[serde(flatten)]
    pub resources: ResourceSet,
}

/// The status object of `LynqForm`
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LynqFormStatus {
    /// Generation of the spec last validated
    #[serde(default)]
    pub observed_generation: i64,
    /// Number of nodes rendered from this form
    #[serde(default)]
    pub total_nodes: i32,
    /// Number of those nodes that are ready
    #[serde(default)]
    pub ready_nodes: i32,
    /// Valid and Applied conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,
}
