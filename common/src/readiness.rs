use serde_json::Value;

fn int_at(obj: &Value, pointer: &str) -> Option<i64> {
    obj.pointer(pointer).and_then(Value::as_i64)
}

fn str_at<'a>(obj: &'a Value, pointer: &str) -> Option<&'a str> {
    obj.pointer(pointer).and_then(Value::as_str)
}

fn non_empty_array(obj: &Value, pointer: &str) -> bool {
    obj.pointer(pointer)
        .and_then(Value::as_array)
        .is_some_and(|a| !a.is_empty())
}

/// Status of the `status.conditions[type]` entry
fn condition_status<'a>(obj: &'a Value, condition_type: &str) -> Option<&'a str> {
    obj.pointer("/status/conditions")?
        .as_array()?
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some(condition_type))
        .and_then(|c| c.get("status"))
        .and_then(Value::as_str)
}

fn condition_true(obj: &Value, condition_type: &str) -> bool {
    condition_status(obj, condition_type) == Some("True")
}

/// Health of a live object, sampled from its last reported status
pub fn is_ready(obj: &Value) -> bool {
    match str_at(obj, "/kind").unwrap_or_default() {
        "Deployment" => {
            let generation = int_at(obj, "/metadata/generation").unwrap_or(0);
            let observed = int_at(obj, "/status/observedGeneration").unwrap_or(0);
            let replicas = int_at(obj, "/spec/replicas").unwrap_or(1);
            let available = int_at(obj, "/status/availableReplicas").unwrap_or(0);
            observed >= generation && available == replicas
        }
        "StatefulSet" => {
            let replicas = int_at(obj, "/spec/replicas").unwrap_or(1);
            let ready = int_at(obj, "/status/readyReplicas").unwrap_or(0);
            ready == replicas
                && str_at(obj, "/status/currentRevision") == str_at(obj, "/status/updateRevision")
        }
        "DaemonSet" => match int_at(obj, "/status/desiredNumberScheduled") {
            Some(desired) => int_at(obj, "/status/numberReady").unwrap_or(0) == desired,
            None => false,
        },
        "Job" => {
            if condition_true(obj, "Failed") {
                return false;
            }
            let completions = int_at(obj, "/spec/completions").unwrap_or(1);
            let succeeded = int_at(obj, "/status/succeeded").unwrap_or(0);
            succeeded >= completions || condition_true(obj, "Complete")
        }
        "Pod" => condition_true(obj, "Ready"),
        "PersistentVolumeClaim" => str_at(obj, "/status/phase") == Some("Bound"),
        "Ingress" => {
            non_empty_array(obj, "/status/loadBalancer/ingress") || non_empty_array(obj, "/spec/rules")
        }
        "HorizontalPodAutoscaler" => condition_true(obj, "ScalingActive"),
        _ => true,
    }
}

/// Short explanation used in events when an object is not ready yet
pub fn readiness_message(obj: &Value) -> String {
    if is_ready(obj) {
        return "Resource is ready".to_string();
    }
    match str_at(obj, "/kind").unwrap_or_default() {
        "Deployment" => format!(
            "Waiting for replicas: {}/{} available",
            int_at(obj, "/status/availableReplicas").unwrap_or(0),
            int_at(obj, "/spec/replicas").unwrap_or(1)
        ),
        "StatefulSet" => format!(
            "Waiting for replicas: {}/{} ready",
            int_at(obj, "/status/readyReplicas").unwrap_or(0),
            int_at(obj, "/spec/replicas").unwrap_or(1)
        ),
        "Job" => format!(
            "Job status: {} succeeded, {} failed",
            int_at(obj, "/status/succeeded").unwrap_or(0),
            int_at(obj, "/status/failed").unwrap_or(0)
        ),
        "PersistentVolumeClaim" => format!(
            "Waiting for claim to be bound (phase {})",
            str_at(obj, "/status/phase").unwrap_or("Unknown")
        ),
        _ => "Waiting for resource to be ready".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deployment_needs_observed_generation_and_replicas() {
        let mut d = json!({"kind": "Deployment", "metadata": {"generation": 2},
            "spec": {"replicas": 3}, "status": {"observedGeneration": 1, "availableReplicas": 3}});
        assert!(!is_ready(&d));
        d["status"]["observedGeneration"] = json!(2);
        assert!(is_ready(&d));
        d["status"]["availableReplicas"] = json!(2);
        assert!(!is_ready(&d));
        assert_eq!(readiness_message(&d), "Waiting for replicas: 2/3 available");
    }

    #[test]
    fn test_deployment_replicas_default_to_one() {
        let d = json!({"kind": "Deployment", "metadata": {"generation": 1},
            "status": {"observedGeneration": 1, "availableReplicas": 1}});
        assert!(is_ready(&d));
    }

    #[test]
    fn test_statefulset_needs_matching_revisions() {
        let mut s = json!({"kind": "StatefulSet", "spec": {"replicas": 2},
            "status": {"readyReplicas": 2, "currentRevision": "a", "updateRevision": "b"}});
        assert!(!is_ready(&s));
        s["status"]["updateRevision"] = json!("a");
        assert!(is_ready(&s));
    }

    #[test]
    fn test_daemonset_and_job() {
        assert!(!is_ready(&json!({"kind": "DaemonSet"})));
        assert!(is_ready(&json!({"kind": "DaemonSet", "status": {"desiredNumberScheduled": 3, "numberReady": 3}})));
        assert!(!is_ready(&json!({"kind": "Job", "spec": {"completions": 2}, "status": {"succeeded": 1}})));
        assert!(is_ready(&json!({"kind": "Job", "status": {"conditions": [{"type": "Complete", "status": "True"}]}})));
        assert!(!is_ready(&json!({"kind": "Job", "status": {"succeeded": 1,
            "conditions": [{"type": "Failed", "status": "True"}]}})));
    }

    #[test]
    fn test_condition_based_kinds() {
        assert!(is_ready(&json!({"kind": "Pod", "status": {"conditions": [{"type": "Ready", "status": "True"}]}})));
        assert!(!is_ready(&json!({"kind": "Pod", "status": {}})));
        assert!(is_ready(&json!({"kind": "HorizontalPodAutoscaler",
            "status": {"conditions": [{"type": "ScalingActive", "status": "True"}]}})));
        assert!(!is_ready(&json!({"kind": "PersistentVolumeClaim", "status": {"phase": "Pending"}})));
        assert!(is_ready(&json!({"kind": "PersistentVolumeClaim", "status": {"phase": "Bound"}})));
    }

    #[test]
    fn test_ingress_and_unknown_kinds() {
        assert!(!is_ready(&json!({"kind": "Ingress", "spec": {}})));
        assert!(is_ready(&json!({"kind": "Ingress", "spec": {"rules": [{"host": "a"}]}})));
        assert!(is_ready(&json!({"kind": "Ingress", "status": {"loadBalancer": {"ingress": [{"ip": "1.2.3.4"}]}}})));
        assert!(is_ready(&json!({"kind": "ConfigMap"})));
        assert!(is_ready(&json!({"kind": "Widget", "apiVersion": "example.com/v1"})));
    }
}
