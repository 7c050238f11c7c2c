use crate::{Error, Result, applied::AppliedKey};
use common::{
    LynqForm, LynqHub, LynqNode, LynqNodeSpec,
    datasource::Row,
    labels::*,
    resources::{ResourceSet, TResource},
    template::{Engine, Variables, build_variables, render_value},
};
use kube::{Resource, ResourceExt, api::ObjectMeta};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// `{uid}-{form}`
pub fn node_name(uid: &str, form: &str) -> String {
    format!("{uid}-{form}")
}

fn row_variables(row: &Row) -> Variables {
    build_variables(&row.uid, &row.host_or_url, &row.activate, &row.extra)
}

/// Render the metadata templates of every resource, manifests are left untouched
pub fn render_metadata(engine: &dyn Engine, resources: &ResourceSet, vars: &Variables) -> Result<ResourceSet> {
    let mut rendered = resources.clone();
    for res in rendered.iter_mut() {
        let context = |e: Error| Error::Other(format!("resource {}: {e}", res.id));
        if let Some(name) = &res.name_template {
            res.name_template = Some(engine.render(name, vars).map_err(context)?);
        }
        if let Some(ns) = &res.target_namespace {
            res.target_namespace = Some(engine.render(ns, vars).map_err(context)?);
        }
        if let Some(labels) = &res.labels_template {
            res.labels_template = Some(engine.render_map(labels, vars).map_err(context)?);
        }
        if let Some(annotations) = &res.annotations_template {
            res.annotations_template = Some(engine.render_map(annotations, vars).map_err(context)?);
        }
    }
    Ok(rendered)
}

/// Annotations carrying the row values and the form generation
pub fn node_annotations(form: &LynqForm, row: &Row) -> Result<BTreeMap<String, String>> {
    Ok(BTreeMap::from([
        (ANNOTATION_HOST_OR_URL.to_string(), row.host_or_url.clone()),
        (ANNOTATION_ACTIVATE.to_string(), row.activate.clone()),
        (ANNOTATION_EXTRA.to_string(), serde_json::to_string(&row.extra)?),
        (
            ANNOTATION_TEMPLATE_GENERATION.to_string(),
            form.metadata.generation.unwrap_or_default().to_string(),
        ),
    ]))
}

/// The LynqNode a hub wants for (`form`, `row`)
pub fn build_node(engine: &dyn Engine, hub: &LynqHub, form: &LynqForm, row: &Row) -> Result<LynqNode> {
    let vars = row_variables(row);
    let form_name = form.name_any();
    let resources = render_metadata(engine, &form.spec.resources, &vars)?;
    let owner = hub
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey("metadata.uid"))?;
    Ok(LynqNode {
        metadata: ObjectMeta {
            name: Some(node_name(&row.uid, &form_name)),
            namespace: hub.namespace(),
            labels: Some(BTreeMap::from([
                (LABEL_HUB.to_string(), hub.name_any()),
                (LABEL_UID.to_string(), row.uid.clone()),
            ])),
            annotations: Some(node_annotations(form, row)?),
            owner_references: Some(vec![owner]),
            ..ObjectMeta::default()
        },
        spec: LynqNodeSpec {
            uid: row.uid.clone(),
            template_ref: form_name,
            resources,
        },
        status: None,
    })
}

/// Whether the row data or the form moved since `node` was rendered
pub fn needs_update(node: &LynqNode, form: &LynqForm, row: &Row) -> bool {
    let Ok(wanted) = node_annotations(form, row) else {
        return true;
    };
    let current = node.annotations();
    wanted.iter().any(|(k, v)| current.get(k) != Some(v))
}

/// Variables of a LynqNode, read back from the annotations the hub wrote
pub fn node_variables(node: &LynqNode) -> Variables {
    let uid = node.spec.uid.as_str();
    let host_or_url = node.host_or_url().filter(|h| !h.is_empty()).unwrap_or(uid);
    let activate = node.activate().filter(|a| !a.is_empty()).unwrap_or(TRUE_VALUE);
    build_variables(uid, host_or_url, activate, &node.extra())
}

/// A child manifest ready to be applied
#[derive(Clone, Debug, PartialEq)]
pub struct Rendered {
    pub object: Value,
    pub key: AppliedKey,
}

fn metadata_mut(obj: &mut Value) -> &mut Map<String, Value> {
    if !obj["metadata"].is_object() {
        obj["metadata"] = Value::Object(Map::new());
    }
    match &mut obj["metadata"] {
        Value::Object(m) => m,
        _ => unreachable!("metadata was just made an object"),
    }
}

fn overlay(meta: &mut Map<String, Value>, section: &str, values: &BTreeMap<String, String>) {
    if values.is_empty() {
        return;
    }
    let entry = meta
        .entry(section.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    if let Some(map) = entry.as_object_mut() {
        for (k, v) in values {
            map.insert(k.clone(), Value::from(v.clone()));
        }
    }
}

/// Deep render the manifest of `res` then overlay its rendered name, namespace,
/// labels and annotations. Namespaced children land in `default_namespace`
/// unless the resource targets another one.
pub fn render_resource(
    engine: &dyn Engine,
    res: &TResource,
    vars: &Variables,
    default_namespace: &str,
) -> Result<Rendered> {
    let (mut object, failures) = render_value(engine, &res.spec, vars);
    if let Some(first) = failures.first() {
        return Err(Error::Other(format!(
            "resource {}: {} template(s) failed, first {:?}: {}",
            res.id,
            failures.len(),
            first.template,
            first.message
        )));
    }
    let cluster_scoped = res.kind() == "Namespace";
    let meta = metadata_mut(&mut object);
    if let Some(name) = res.name_template.as_ref().filter(|n| !n.is_empty()) {
        meta.insert("name".to_string(), Value::from(name.clone()));
    }
    if cluster_scoped {
        meta.remove("namespace");
    } else {
        let namespace = res
            .target_namespace
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(default_namespace);
        meta.insert("namespace".to_string(), Value::from(namespace));
    }
    overlay(meta, "labels", res.labels_template.as_ref().unwrap_or(&BTreeMap::new()));
    overlay(meta, "annotations", res.annotations_template.as_ref().unwrap_or(&BTreeMap::new()));
    let key = AppliedKey::of(&object, &res.id)?;
    Ok(Rendered { object, key })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use common::template::HandleBars;
    use serde_json::json;

    pub fn hub() -> LynqHub {
        let mut hub: LynqHub = serde_json::from_value(json!({
            "apiVersion": "operator.lynq.sh/v1", "kind": "LynqHub",
            "metadata": {"name": "customers", "namespace": "tenants", "uid": "hub-uid"},
            "spec": {
                "source": {"type": "mysql", "syncInterval": "1m", "mysql": {
                    "host": "db", "username": "lynq", "database": "crm", "table": "tenants"}},
                "valueMappings": {"uid": "id", "hostOrUrl": "url", "activate": "active"}
            }
        }))
        .unwrap();
        hub.metadata.generation = Some(1);
        hub
    }

    pub fn form(name: &str, resources: Value) -> LynqForm {
        let mut spec = resources;
        spec["hubId"] = json!("customers");
        serde_json::from_value(json!({
            "apiVersion": "operator.lynq.sh/v1", "kind": "LynqForm",
            "metadata": {"name": name, "namespace": "tenants", "generation": 1, "uid": format!("{name}-uid")},
            "spec": spec
        }))
        .unwrap()
    }

    pub fn row(uid: &str) -> Row {
        Row {
            uid: uid.to_string(),
            host_or_url: format!("https://{uid}.example.com/app"),
            activate: "1".to_string(),
            extra: BTreeMap::from([("plan".to_string(), "gold".to_string())]),
        }
    }

    fn web_form() -> LynqForm {
        form(
            "web",
            json!({"configMaps": [{
                "id": "cm",
                "nameTemplate": "{{uid}}-cm",
                "labelsTemplate": {"plan": "{{plan}}"},
                "spec": {"data": {"host": "{{host}}"}}
            }]}),
        )
    }

    #[test]
    fn test_build_node_renders_metadata_only() {
        let engine = HandleBars::new();
        let node = build_node(&engine, &hub(), &web_form(), &row("u1")).unwrap();
        assert_eq!(node.name_any(), "u1-web");
        assert_eq!(node.labels()[LABEL_HUB], "customers");
        assert_eq!(node.labels()[LABEL_UID], "u1");
        assert_eq!(node.annotations()[ANNOTATION_TEMPLATE_GENERATION], "1");
        assert_eq!(node.annotations()[ANNOTATION_EXTRA], r#"{"plan":"gold"}"#);
        let owner = &node.owner_references()[0];
        assert_eq!(owner.uid, "hub-uid");
        assert_eq!(owner.controller, Some(true));
        let cm = &node.spec.resources.config_maps[0];
        assert_eq!(cm.name_template.as_deref(), Some("u1-cm"));
        assert_eq!(cm.labels_template.as_ref().unwrap()["plan"], "gold");
        assert_eq!(cm.spec["data"]["host"], "{{host}}");
    }

    #[test]
    fn test_needs_update_on_row_or_generation_change() {
        let engine = HandleBars::new();
        let mut form = web_form();
        let node = build_node(&engine, &hub(), &form, &row("u1")).unwrap();
        assert!(!needs_update(&node, &form, &row("u1")));
        let mut changed = row("u1");
        changed.extra.insert("plan".into(), "silver".into());
        assert!(needs_update(&node, &form, &changed));
        form.metadata.generation = Some(2);
        assert!(needs_update(&node, &form, &row("u1")));
    }

    #[test]
    fn test_node_variables_fall_back_to_uid() {
        let engine = HandleBars::new();
        let mut node = build_node(&engine, &hub(), &web_form(), &row("u1")).unwrap();
        node.annotations_mut().remove(ANNOTATION_HOST_OR_URL);
        node.annotations_mut().remove(ANNOTATION_ACTIVATE);
        let vars = node_variables(&node);
        assert_eq!(vars["hostOrUrl"], "u1");
        assert_eq!(vars["activate"], "true");
        assert_eq!(vars["plan"], "gold");
    }

    #[test]
    fn test_render_resource_overlays_metadata() {
        let engine = HandleBars::new();
        let node = build_node(&engine, &hub(), &web_form(), &row("u1")).unwrap();
        let res = &node.spec.resources.collect()[0];
        let rendered = render_resource(&engine, res, &node_variables(&node), "tenants").unwrap();
        assert_eq!(rendered.key.to_string(), "ConfigMap/tenants/u1-cm@cm");
        assert_eq!(rendered.object["data"]["host"], "u1.example.com");
        assert_eq!(rendered.object["metadata"]["labels"]["plan"], "gold");
        assert_eq!(rendered.object["apiVersion"], "v1");
    }

    #[test]
    fn test_namespace_children_are_cluster_scoped() {
        let engine = HandleBars::new();
        let ns: TResource = serde_json::from_value(json!({
            "id": "ns", "nameTemplate": "tenant-u1",
            "spec": {"apiVersion": "v1", "kind": "Namespace", "metadata": {"namespace": "oops"}}
        }))
        .unwrap();
        let rendered = render_resource(&engine, &ns, &Variables::new(), "tenants").unwrap();
        assert!(rendered.object["metadata"].get("namespace").is_none());
        assert_eq!(rendered.key.to_string(), "Namespace//tenant-u1@ns");
    }

    #[test]
    fn test_render_failure_is_reported() {
        let engine = HandleBars::new();
        let res: TResource = serde_json::from_value(json!({
            "id": "bad", "nameTemplate": "x",
            "spec": {"apiVersion": "v1", "kind": "ConfigMap", "data": {"v": "{{#if}}"}}
        }))
        .unwrap();
        let err = render_resource(&engine, &res, &Variables::new(), "tenants").unwrap_err();
        assert!(err.to_string().contains("resource bad"));
    }
}
