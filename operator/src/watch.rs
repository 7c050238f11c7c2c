//! Watch plumbing of the controllers: which child kinds are watched, which
//! child changes are worth a LynqNode reconcile and how events map back to
//! the objects to reconcile.
use common::{LynqForm, LynqHub, LynqNode, labels::*};
use futures::{Stream, StreamExt};
use k8s_openapi::api::{
    apps::v1::{DaemonSet, Deployment, StatefulSet},
    autoscaling::v2::HorizontalPodAutoscaler,
    batch::v1::{CronJob, Job},
    core::v1::{ConfigMap, Namespace, PersistentVolumeClaim, Secret, Service, ServiceAccount},
    networking::v1::{Ingress, NetworkPolicy},
    policy::v1::PodDisruptionBudget,
};
use kube::{
    ResourceExt,
    api::{ApiResource, DynamicObject},
    runtime::{reflector::ObjectRef, watcher},
};
use serde_json::Value;
use std::{
    collections::HashMap,
    hash::{DefaultHasher, Hash, Hasher},
    sync::Arc,
};

/// Kinds a LynqNode owns through ownerReferences
pub fn child_resources() -> Vec<ApiResource> {
    vec![
        ApiResource::erase::<ServiceAccount>(&()),
        ApiResource::erase::<Deployment>(&()),
        ApiResource::erase::<StatefulSet>(&()),
        ApiResource::erase::<DaemonSet>(&()),
        ApiResource::erase::<Service>(&()),
        ApiResource::erase::<Ingress>(&()),
        ApiResource::erase::<ConfigMap>(&()),
        ApiResource::erase::<Secret>(&()),
        ApiResource::erase::<PersistentVolumeClaim>(&()),
        ApiResource::erase::<Job>(&()),
        ApiResource::erase::<CronJob>(&()),
        ApiResource::erase::<PodDisruptionBudget>(&()),
        ApiResource::erase::<NetworkPolicy>(&()),
        ApiResource::erase::<HorizontalPodAutoscaler>(&()),
    ]
}

/// Kinds that may point back to a LynqNode with tracking labels
pub fn tracked_resources() -> Vec<ApiResource> {
    let mut all = child_resources();
    all.push(ApiResource::erase::<Namespace>(&()));
    all
}

// status fields the readiness evaluation looks at
const READINESS_FIELDS: &[&str] = &[
    "/status/observedGeneration",
    "/status/replicas",
    "/status/readyReplicas",
    "/status/availableReplicas",
    "/status/updatedReplicas",
    "/status/currentRevision",
    "/status/updateRevision",
    "/status/numberReady",
    "/status/desiredNumberScheduled",
    "/status/succeeded",
    "/status/failed",
    "/status/phase",
    "/status/loadBalancer",
];

/// Hash of what can change the outcome of a LynqNode pass: generation,
/// annotations, deletion and the readiness related status fields
pub fn fingerprint(obj: &DynamicObject) -> u64 {
    let mut hasher = DefaultHasher::new();
    obj.metadata.generation.hash(&mut hasher);
    obj.annotations().hash(&mut hasher);
    obj.metadata.deletion_timestamp.is_some().hash(&mut hasher);
    for field in READINESS_FIELDS {
        obj.data.pointer(field).map(Value::to_string).hash(&mut hasher);
    }
    if let Some(conditions) = obj.data.pointer("/status/conditions").and_then(Value::as_array) {
        for c in conditions {
            c.get("type").map(Value::to_string).hash(&mut hasher);
            c.get("status").map(Value::to_string).hash(&mut hasher);
        }
    }
    hasher.finish()
}

/// Objects of a child watch whose fingerprint moved. Deletions always pass.
pub fn relevant_changes<S>(events: S) -> impl Stream<Item = Result<DynamicObject, watcher::Error>> + Send
where
    S: Stream<Item = Result<watcher::Event<DynamicObject>, watcher::Error>> + Send,
{
    let mut seen: HashMap<String, u64> = HashMap::new();
    events.filter_map(move |event| {
        let out = match event {
            Ok(watcher::Event::Apply(obj) | watcher::Event::InitApply(obj)) => {
                let fp = fingerprint(&obj);
                let id = obj.uid().unwrap_or_else(|| obj.name_any());
                (seen.insert(id, fp) != Some(fp)).then_some(Ok(obj))
            }
            Ok(watcher::Event::Delete(obj)) => {
                seen.remove(&obj.uid().unwrap_or_else(|| obj.name_any()));
                Some(Ok(obj))
            }
            Ok(watcher::Event::Init | watcher::Event::InitDone) => None,
            Err(e) => Some(Err(e)),
        };
        futures::future::ready(out)
    })
}

/// The LynqNode named by the tracking labels of a child
pub fn tracked_node(obj: &DynamicObject) -> Option<ObjectRef<LynqNode>> {
    let labels = obj.labels();
    let name = labels.get(LABEL_NODE)?;
    let namespace = labels.get(LABEL_NODE_NAMESPACE)?;
    Some(ObjectRef::new(name).within(namespace))
}

/// Forms of the hub namespace whose hubId names `hub`
pub fn forms_referencing(forms: &[Arc<LynqForm>], hub: &LynqHub) -> Vec<ObjectRef<LynqForm>> {
    let namespace = hub.namespace();
    forms
        .iter()
        .filter(|f| f.namespace() == namespace && f.spec.hub_id == hub.name_any())
        .map(|f| ObjectRef::from_obj(f.as_ref()))
        .collect()
}

/// The hub a form points to
pub fn form_hub(form: &LynqForm) -> Option<ObjectRef<LynqHub>> {
    let namespace = form.namespace()?;
    (!form.spec.hub_id.is_empty()).then(|| ObjectRef::new(&form.spec.hub_id).within(&namespace))
}

/// The form a node was rendered from
pub fn node_form(node: &LynqNode) -> Option<ObjectRef<LynqForm>> {
    let namespace = node.namespace()?;
    (!node.spec.template_ref.is_empty()).then(|| ObjectRef::new(&node.spec.template_ref).within(&namespace))
}
