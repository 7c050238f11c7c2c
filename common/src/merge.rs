use serde_json::{Map, Value};

/// Merge `desired` into `live`, removing what `last_applied` set and `desired` dropped.
///
/// Objects are merged key by key. Arrays and scalars from `desired` replace the live
/// value. Keys that neither `desired` nor `last_applied` mention belong to somebody else
/// (defaulting, other controllers) and are kept.
pub fn three_way_merge(last_applied: Option<&Value>, desired: &Value, live: &Value) -> Value {
    match (desired, live) {
        (Value::Object(want), Value::Object(have)) => {
            let last = last_applied.and_then(Value::as_object);
            let mut out = have.clone();
            if let Some(last) = last {
                for key in last.keys() {
                    if !want.contains_key(key) {
                        out.remove(key);
                    }
                }
            }
            for (key, value) in want {
                let merged = match have.get(key) {
                    Some(current) => three_way_merge(last.and_then(|l| l.get(key)), value, current),
                    None => value.clone(),
                };
                out.insert(key.clone(), merged);
            }
            Value::Object(out)
        }
        _ => desired.clone(),
    }
}

/// JSON merge patch: objects merge recursively, `null` removes a key, anything else replaces
pub fn merge_patch(base: &mut Value, patch: &Value) {
    match patch {
        Value::Object(p) => {
            if !base.is_object() {
                *base = Value::Object(Map::new());
            }
            if let Value::Object(b) = base {
                for (key, value) in p {
                    if value.is_null() {
                        b.remove(key);
                    } else {
                        merge_patch(b.entry(key.clone()).or_insert(Value::Null), value);
                    }
                }
            }
        }
        other => *base = other.clone(),
    }
}

/// The parts of an object compared when deciding whether a write is needed
pub fn comparable(obj: &Value) -> Value {
    let mut out = obj.clone();
    if let Some(map) = out.as_object_mut() {
        map.remove("status");
        if let Some(meta) = map.get_mut("metadata").and_then(Value::as_object_mut) {
            for volatile in [
                "resourceVersion",
                "managedFields",
                "generation",
                "creationTimestamp",
                "uid",
                "selfLink",
            ] {
                meta.remove(volatile);
            }
            drop_empty(meta, "labels");
            drop_empty(meta, "annotations");
            drop_empty(meta, "ownerReferences");
        }
    }
    out
}

/// Whether every field `declared` sets holds the same value in `live`.
///
/// Fields `live` has on top (server defaults, additions by others) are not looked at.
/// Arrays must have the same length and cover element by element.
pub fn covers(declared: &Value, live: &Value) -> bool {
    match (declared, live) {
        (Value::Object(want), Value::Object(have)) => want
            .iter()
            .all(|(key, value)| have.get(key).is_some_and(|current| covers(value, current))),
        (Value::Array(want), Value::Array(have)) => {
            want.len() == have.len() && want.iter().zip(have).all(|(w, h)| covers(w, h))
        }
        _ => declared == live,
    }
}

fn drop_empty(meta: &mut Map<String, Value>, key: &str) {
    let empty = match meta.get(key) {
        Some(Value::Object(m)) => m.is_empty(),
        Some(Value::Array(a)) => a.is_empty(),
        Some(Value::Null) => true,
        _ => false,
    };
    if empty {
        meta.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_removed_template_keys_are_dropped() {
        let last = json!({"data": {"a": "1", "b": "2"}});
        let desired = json!({"data": {"a": "1"}});
        let live = json!({"data": {"a": "1", "b": "2", "c": "foreign"}});
        let merged = three_way_merge(Some(&last), &desired, &live);
        assert_eq!(merged, json!({"data": {"a": "1", "c": "foreign"}}));
    }

    #[test]
    fn test_foreign_fields_survive_without_history() {
        let desired = json!({"spec": {"replicas": 2}});
        let live = json!({"spec": {"replicas": 1, "revisionHistoryLimit": 10}});
        let merged = three_way_merge(None, &desired, &live);
        assert_eq!(merged, json!({"spec": {"replicas": 2, "revisionHistoryLimit": 10}}));
    }

    #[test]
    fn test_arrays_are_replaced() {
        let desired = json!({"args": ["b"]});
        let live = json!({"args": ["a", "b"]});
        assert_eq!(three_way_merge(None, &desired, &live), json!({"args": ["b"]}));
    }

    #[test]
    fn test_comparable_ignores_volatile_metadata() {
        let a = json!({"metadata": {"name": "x", "resourceVersion": "3", "labels": {}}, "status": {"ready": 1}});
        let b = json!({"metadata": {"name": "x"}});
        assert_eq!(comparable(&a), comparable(&b));
    }

    #[test]
    fn test_covers_ignores_defaulted_fields() {
        let declared = json!({"spec": {"replicas": 1, "template": {"spec": {"containers": [{"name": "app", "image": "nginx"}]}}}});
        let live = json!({"spec": {"replicas": 1, "revisionHistoryLimit": 10, "template": {"spec": {
            "restartPolicy": "Always",
            "containers": [{"name": "app", "image": "nginx", "imagePullPolicy": "Always"}]}}}});
        assert!(covers(&declared, &live));

        let mut edited = live.clone();
        edited["spec"]["template"]["spec"]["containers"][0]["image"] = json!("httpd");
        assert!(!covers(&declared, &edited));
        let mut extra = live;
        if let Some(list) = extra["spec"]["template"]["spec"]["containers"].as_array_mut() {
            list.push(json!({"name": "sidecar"}));
        }
        assert!(!covers(&declared, &extra));
        assert!(!covers(&json!({"data": {"k": "v"}}), &json!({})));
    }

    #[test]
    fn test_merge_patch_overlays_and_removes() {
        let mut base = json!({"a": {"b": 1, "c": 2}, "e": "x"});
        merge_patch(&mut base, &json!({"a": {"c": 3}, "d": true, "e": null}));
        assert_eq!(base, json!({"a": {"b": 1, "c": 3}, "d": true}));
    }
}
