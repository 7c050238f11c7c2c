use crate::{
    Error, LynqNode, Result,
    fieldpath::{parse_all, preserve_fields},
    k8sgeneric::{ObjectKey, ObjectStore},
    labels::*,
    merge::{comparable, covers, three_way_merge},
    resources::{ConflictPolicy, CreationPolicy, DeletionPolicy, PatchStrategy, TResource},
};
use kube::{Resource, ResourceExt};
use serde_json::{Map, Value, json};
use std::{sync::Arc, time::Duration};
use tracing::*;

/// The LynqNode a child object belongs to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Owner {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub uid: String,
}

impl Owner {
    pub fn from_node(node: &LynqNode) -> Result<Owner> {
        Ok(Owner {
            api_version: LynqNode::api_version(&()).to_string(),
            kind: LynqNode::kind(&()).to_string(),
            name: node.name_any(),
            namespace: node.namespace().ok_or(Error::MissingObjectKey("metadata.namespace"))?,
            uid: node.uid().ok_or(Error::MissingObjectKey("metadata.uid"))?,
        })
    }

    pub fn owner_reference(&self) -> Value {
        json!({
            "apiVersion": self.api_version,
            "kind": self.kind,
            "name": self.name,
            "uid": self.uid,
            "controller": true,
            "blockOwnerDeletion": true,
        })
    }
}

/// Per-resource policies
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ApplyOptions {
    pub creation_policy: CreationPolicy,
    pub conflict_policy: ConflictPolicy,
    pub patch_strategy: PatchStrategy,
    pub deletion_policy: DeletionPolicy,
    pub ignore_fields: Vec<String>,
}

impl From<&TResource> for ApplyOptions {
    fn from(res: &TResource) -> Self {
        ApplyOptions {
            creation_policy: res.creation_policy,
            conflict_policy: res.conflict_policy,
            patch_strategy: res.patch_strategy,
            deletion_policy: res.deletion_policy,
            ignore_fields: res.ignore_fields.clone(),
        }
    }
}

/// The object exists and belongs to someone else
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} {namespace}/{name} is not managed by this LynqNode: {reason}")]
pub struct ConflictError {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ownership {
    Managed,
    /// No owner at all but lynq markers, safe to take back
    Adoptable,
    Foreign(String),
}

fn owner_refs(obj: &Value) -> Vec<Value> {
    obj.pointer("/metadata/ownerReferences")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn meta_str<'a>(obj: &'a Value, section: &str, key: &str) -> Option<&'a str> {
    obj.get("metadata")?.get(section)?.get(key)?.as_str()
}

fn meta_map<'a>(obj: &'a mut Value, section: &str) -> &'a mut Map<String, Value> {
    if !obj["metadata"][section].is_object() {
        obj["metadata"][section] = Value::Object(Map::new());
    }
    match &mut obj["metadata"][section] {
        Value::Object(m) => m,
        _ => unreachable!("section was just made an object"),
    }
}

fn remove_meta(obj: &mut Value, section: &str, keys: &[&str]) {
    if let Some(m) = obj
        .get_mut("metadata")
        .and_then(|m| m.get_mut(section))
        .and_then(Value::as_object_mut)
    {
        for k in keys {
            m.remove(*k);
        }
    }
}

pub fn has_orphan_markers(obj: &Value) -> bool {
    meta_str(obj, "labels", LABEL_ORPHANED) == Some(TRUE_VALUE)
        || meta_str(obj, "annotations", ANNOTATION_ORPHANED_AT).is_some()
        || meta_str(obj, "annotations", ANNOTATION_ORPHANED_REASON).is_some()
}

fn strip_orphan_markers(obj: &mut Value) {
    remove_meta(obj, "labels", &[LABEL_ORPHANED]);
    remove_meta(obj, "annotations", &[ANNOTATION_ORPHANED_AT, ANNOTATION_ORPHANED_REASON]);
}

pub fn is_created_once(obj: &Value) -> bool {
    meta_str(obj, "annotations", ANNOTATION_CREATED_ONCE) == Some(TRUE_VALUE)
}

/// Deletion policy recorded on a live object, Delete when absent or unknown
pub fn live_deletion_policy(obj: &Value) -> DeletionPolicy {
    meta_str(obj, "annotations", ANNOTATION_DELETION_POLICY)
        .and_then(|p| p.parse().ok())
        .unwrap_or_default()
}

/// Who manages `live` from the point of view of `owner`
pub fn ownership(live: &Value, owner: &Owner) -> Ownership {
    let refs = owner_refs(live);
    if refs
        .iter()
        .any(|r| r.get("uid").and_then(Value::as_str) == Some(owner.uid.as_str()))
    {
        return Ownership::Managed;
    }
    let node = meta_str(live, "labels", LABEL_NODE);
    let node_ns = meta_str(live, "labels", LABEL_NODE_NAMESPACE);
    if node == Some(owner.name.as_str()) && node_ns == Some(owner.namespace.as_str()) {
        return Ownership::Managed;
    }
    if let Some(r) = refs.first() {
        return Ownership::Foreign(format!(
            "owned by {} {}",
            r.get("kind").and_then(Value::as_str).unwrap_or("unknown"),
            r.get("name").and_then(Value::as_str).unwrap_or("unknown")
        ));
    }
    if let Some(other) = node {
        return Ownership::Foreign(format!(
            "tracked by LynqNode {}/{}",
            node_ns.unwrap_or_default(),
            other
        ));
    }
    if meta_str(live, "annotations", ANNOTATION_DELETION_POLICY).is_some() || has_orphan_markers(live) {
        return Ownership::Adoptable;
    }
    Ownership::Foreign("exists without lynq ownership".to_string())
}

/// Drop foreign controller references and foreign tracking labels
fn take_over(live: &mut Value, owner: &Owner) {
    let refs: Vec<Value> = owner_refs(live)
        .into_iter()
        .filter(|r| {
            r.get("uid").and_then(Value::as_str) == Some(owner.uid.as_str())
                || r.get("controller").and_then(Value::as_bool) != Some(true)
        })
        .collect();
    live["metadata"]["ownerReferences"] = Value::Array(refs);
    if meta_str(live, "labels", LABEL_NODE).is_some_and(|n| n != owner.name)
        || meta_str(live, "labels", LABEL_NODE_NAMESPACE).is_some_and(|n| n != owner.namespace)
    {
        remove_meta(live, "labels", &[LABEL_NODE, LABEL_NODE_NAMESPACE]);
    }
}

/// Whether the child is tied to the Node by an ownerReference
fn uses_owner_reference(key: &ObjectKey, owner: &Owner, policy: DeletionPolicy) -> bool {
    policy == DeletionPolicy::Delete
        && key.kind != "Namespace"
        && key.namespace.as_deref() == Some(owner.namespace.as_str())
}

/// Owner references of `live` with ours added or removed
fn merged_owner_refs(live: Option<&Value>, owner: &Owner, with_ours: bool) -> Vec<Value> {
    let mut refs: Vec<Value> = live
        .map(owner_refs)
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.get("uid").and_then(Value::as_str) != Some(owner.uid.as_str()))
        .collect();
    if with_ours {
        refs.push(owner.owner_reference());
    }
    refs
}

fn set_owner_refs(obj: &mut Value, refs: Vec<Value>) {
    if refs.is_empty() {
        remove_meta_key(obj, "ownerReferences");
    } else {
        obj["metadata"]["ownerReferences"] = Value::Array(refs);
    }
}

fn remove_meta_key(obj: &mut Value, key: &str) {
    if let Some(m) = obj.get_mut("metadata").and_then(Value::as_object_mut) {
        m.remove(key);
    }
}

/// Desired object with the ownership markers of `opts` (owner references excluded)
fn prepare(obj: &Value, key: &ObjectKey, owner: &Owner, opts: &ApplyOptions) -> Value {
    let mut desired = obj.clone();
    if let Some(map) = desired.as_object_mut() {
        map.remove("status");
        map.insert("apiVersion".to_string(), Value::from(key.api_version.clone()));
    }
    remove_meta_key(&mut desired, "ownerReferences");
    remove_meta_key(&mut desired, "resourceVersion");
    if !uses_owner_reference(key, owner, opts.deletion_policy) {
        let labels = meta_map(&mut desired, "labels");
        labels.insert(LABEL_NODE.to_string(), Value::from(owner.name.clone()));
        labels.insert(LABEL_NODE_NAMESPACE.to_string(), Value::from(owner.namespace.clone()));
    }
    let annotations = meta_map(&mut desired, "annotations");
    annotations.insert(
        ANNOTATION_DELETION_POLICY.to_string(),
        Value::from(opts.deletion_policy.as_str()),
    );
    if opts.creation_policy == CreationPolicy::Once {
        annotations.insert(ANNOTATION_CREATED_ONCE.to_string(), Value::from(TRUE_VALUE));
    }
    annotations.remove(ANNOTATION_LAST_APPLIED);
    strip_orphan_markers(&mut desired);
    desired
}

fn with_last_applied(desired: &Value, template: &Value) -> Result<Value> {
    let snapshot = serde_json::to_string(template)?;
    let mut out = desired.clone();
    meta_map(&mut out, "annotations").insert(ANNOTATION_LAST_APPLIED.to_string(), Value::from(snapshot));
    Ok(out)
}

fn last_applied(live: &Value) -> Option<Value> {
    meta_str(live, "annotations", ANNOTATION_LAST_APPLIED).and_then(|s| serde_json::from_str(s).ok())
}

/// What an apply would do to the live counterpart of a rendered object
#[derive(Clone, Debug, PartialEq)]
pub enum Plan {
    /// Nothing there yet, create this
    Create(Value),
    /// The live object drifted, replace it with `next`
    Update { next: Value, readopted: bool },
    /// Replace strategy: every declared field matches `live`, only fields the manifest
    /// leaves out differ. An apply still writes `next`, observing treats it as in sync.
    Refresh { next: Value, live: Value },
    /// The live object already matches
    InSync(Value),
    /// Created once earlier, left as it is
    SkipOnce(Value),
}

impl Plan {
    /// Whether carrying out the plan writes to the cluster
    pub fn writes(&self) -> bool {
        matches!(self, Plan::Create(_) | Plan::Update { .. } | Plan::Refresh { .. })
    }
}

/// Decide how `obj` should be written given its `live` counterpart.
///
/// A foreign object under the Stuck policy comes back as `Error::Conflict`.
pub fn plan(obj: &Value, live: Option<Value>, owner: &Owner, opts: &ApplyOptions) -> Result<Plan> {
    let key = ObjectKey::from_value(obj)?;
    let fields = parse_all(&opts.ignore_fields)?;

    if opts.creation_policy == CreationPolicy::Once {
        if let Some(live) = live.as_ref().filter(|l| is_created_once(l)) {
            return Ok(Plan::SkipOnce(live.clone()));
        }
    }

    let mut desired = prepare(obj, &key, owner, opts);
    let with_ref = uses_owner_reference(&key, owner, opts.deletion_policy);

    let Some(live) = live else {
        let mut fresh = with_last_applied(&desired, &desired)?;
        set_owner_refs(&mut fresh, merged_owner_refs(None, owner, with_ref));
        return Ok(Plan::Create(fresh));
    };

    let mut base = live.clone();
    match ownership(&base, owner) {
        Ownership::Managed | Ownership::Adoptable => {}
        Ownership::Foreign(reason) => match opts.conflict_policy {
            ConflictPolicy::Stuck => {
                return Err(Error::Conflict(ConflictError {
                    kind: key.kind.clone(),
                    namespace: key.namespace.clone().unwrap_or_default(),
                    name: key.name.clone(),
                    reason,
                }));
            }
            ConflictPolicy::Force => {
                debug!("{} is foreign ({}), taking it over", key, reason);
                take_over(&mut base, owner);
            }
        },
    }
    let readopted = has_orphan_markers(&base);
    strip_orphan_markers(&mut base);
    // the snapshot records the template, not the preserved live values
    let template = desired.clone();
    preserve_fields(&mut desired, &base, &fields);

    let mut next = match opts.patch_strategy {
        PatchStrategy::Merge => {
            let previous = last_applied(&base);
            three_way_merge(previous.as_ref(), &with_last_applied(&desired, &template)?, &base)
        }
        PatchStrategy::Replace => {
            let mut next = with_last_applied(&desired, &template)?;
            for field in ["uid", "creationTimestamp", "generation", "finalizers", "deletionTimestamp"] {
                if let Some(v) = base.pointer(&format!("/metadata/{field}")) {
                    next["metadata"][field] = v.clone();
                }
            }
            next
        }
    };
    set_owner_refs(&mut next, merged_owner_refs(Some(&base), owner, with_ref));
    if let Some(rv) = live.pointer("/metadata/resourceVersion") {
        next["metadata"]["resourceVersion"] = rv.clone();
    }

    let (wanted, current) = (comparable(&next), comparable(&live));
    if wanted == current {
        return Ok(Plan::InSync(live));
    }
    if opts.patch_strategy == PatchStrategy::Replace && !readopted && covers(&wanted, &current) {
        return Ok(Plan::Refresh { next, live });
    }
    Ok(Plan::Update { next, readopted })
}

/// Outcome of one apply
#[derive(Clone, Debug)]
pub struct Applied {
    /// The write touched the object (creation included)
    pub changed: bool,
    /// Orphan markers were removed from a previously retained object
    pub readopted: bool,
    /// Creation skipped because the object was created once already
    pub skipped_once: bool,
    /// The object as stored after the apply
    pub live: Value,
}

impl Applied {
    fn untouched(live: Value, skipped_once: bool) -> Applied {
        Applied {
            changed: false,
            readopted: false,
            skipped_once,
            live,
        }
    }
}

/// Policy-aware create and update of unstructured objects
#[derive(Clone)]
pub struct Applier {
    store: Arc<dyn ObjectStore>,
    max_attempts: u32,
    backoff: Duration,
}

impl Applier {
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>) -> Applier {
        Applier {
            store,
            max_attempts: 5,
            backoff: Duration::from_millis(100),
        }
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: Duration) -> Applier {
        self.backoff = backoff;
        self
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    async fn pause(&self, attempt: u32) {
        tokio::time::sleep(self.backoff * 2u32.saturating_pow(attempt)).await;
    }

    /// Plan `obj` against the object currently stored, without writing
    pub async fn preview(&self, obj: &Value, owner: &Owner, opts: &ApplyOptions) -> Result<Plan> {
        let key = ObjectKey::from_value(obj)?;
        let live = self.store.get(&key).await?;
        plan(obj, live, owner, opts)
    }

    /// Create or update `obj` for `owner`, retrying resourceVersion races
    #[instrument(skip_all, fields(object = obj.pointer("/metadata/name").and_then(serde_json::Value::as_str).unwrap_or_default()))]
    pub async fn apply(&self, obj: &Value, owner: &Owner, opts: &ApplyOptions) -> Result<Applied> {
        let mut attempt = 0;
        loop {
            match self.try_apply(obj, owner, opts).await {
                Err(e) if e.is_api_conflict() && attempt + 1 < self.max_attempts => {
                    debug!("Conflict while applying, retrying: {e}");
                    self.pause(attempt).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn try_apply(&self, obj: &Value, owner: &Owner, opts: &ApplyOptions) -> Result<Applied> {
        let key = ObjectKey::from_value(obj)?;
        match self.preview(obj, owner, opts).await? {
            Plan::SkipOnce(live) => Ok(Applied::untouched(live, true)),
            Plan::InSync(live) => Ok(Applied::untouched(live, false)),
            Plan::Create(fresh) => {
                let created = self.store.create(&fresh).await?;
                info!("Created {}", key);
                Ok(Applied {
                    changed: true,
                    readopted: false,
                    skipped_once: false,
                    live: created,
                })
            }
            Plan::Update { next, readopted } => self.replace(&key, &next, readopted).await,
            Plan::Refresh { next, .. } => self.replace(&key, &next, false).await,
        }
    }

    async fn replace(&self, key: &ObjectKey, next: &Value, readopted: bool) -> Result<Applied> {
        let live_rv = next.pointer("/metadata/resourceVersion").cloned();
        let stored = self.store.replace(next).await?;
        let changed = stored.pointer("/metadata/resourceVersion") != live_rv.as_ref();
        if changed {
            info!("Updated {}", key);
        }
        Ok(Applied {
            changed,
            readopted: readopted && changed,
            skipped_once: false,
            live: stored,
        })
    }

    /// Remove a child: delete it, or leave it in place with orphan markers
    #[instrument(skip_all, fields(object = obj.pointer("/metadata/name").and_then(serde_json::Value::as_str).unwrap_or_default()))]
    pub async fn delete(&self, obj: &Value, owner: &Owner, policy: DeletionPolicy, reason: &str) -> Result<bool> {
        let key = ObjectKey::from_value(obj)?;
        match policy {
            DeletionPolicy::Delete => {
                let found = self.store.delete(&key).await?;
                if found {
                    info!("Deleted {}", key);
                }
                Ok(found)
            }
            DeletionPolicy::Retain => {
                let mut attempt = 0;
                loop {
                    match self.orphan(&key, owner, reason).await {
                        Err(e) if e.is_api_conflict() && attempt + 1 < self.max_attempts => {
                            self.pause(attempt).await;
                            attempt += 1;
                        }
                        other => return other,
                    }
                }
            }
        }
    }

    async fn orphan(&self, key: &ObjectKey, owner: &Owner, reason: &str) -> Result<bool> {
        let Some(mut live) = self.store.get(key).await? else {
            return Ok(false);
        };
        let refs = merged_owner_refs(Some(&live), owner, false);
        set_owner_refs(&mut live, refs);
        remove_meta(&mut live, "labels", &[LABEL_NODE, LABEL_NODE_NAMESPACE]);
        meta_map(&mut live, "labels").insert(LABEL_ORPHANED.to_string(), Value::from(TRUE_VALUE));
        let annotations = meta_map(&mut live, "annotations");
        annotations.insert(
            ANNOTATION_ORPHANED_AT.to_string(),
            Value::from(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
        );
        if !reason.is_empty() {
            annotations.insert(ANNOTATION_ORPHANED_REASON.to_string(), Value::from(reason));
        }
        self.store.replace(&live).await?;
        info!("Retained {} with orphan markers ({})", key, reason);
        Ok(true)
    }
}
