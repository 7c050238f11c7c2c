//! Conditions of a LynqNode derived from the resource counters of a pass.
use crate::metrics::NodeCounts;
use common::conditions::{CONFLICTED, Condition, DEGRADED, PROGRESSING, READY};

fn ready_condition(c: NodeCounts) -> Condition {
    let all_ready = c.failed == 0 && c.conflicted == 0 && c.ready == c.desired;
    if all_ready {
        return Condition::new(
            READY,
            true,
            "Reconciled",
            &format!("All {} resources are ready", c.desired),
        );
    }
    let (reason, message) = if c.failed > 0 && c.conflicted > 0 {
        (
            "ResourcesFailedAndConflicted",
            format!("{} resources failed and {} are in conflict", c.failed, c.conflicted),
        )
    } else if c.conflicted > 0 {
        ("ResourcesConflicted", format!("{} resources are in conflict", c.conflicted))
    } else if c.failed > 0 {
        ("ResourcesFailed", format!("{} resources failed", c.failed))
    } else {
        (
            "NotAllResourcesReady",
            format!("{}/{} resources ready", c.ready, c.desired),
        )
    };
    Condition::new(READY, false, reason, &message)
}

fn degraded_condition(c: NodeCounts) -> Condition {
    let reason = if c.failed > 0 && c.conflicted > 0 {
        "ResourceFailuresAndConflicts"
    } else if c.failed > 0 {
        "ResourceFailures"
    } else if c.conflicted > 0 {
        "ResourceConflicts"
    } else if c.ready != c.desired {
        "ResourcesNotReady"
    } else {
        return Condition::new(DEGRADED, false, "Healthy", "All resources are healthy");
    };
    Condition::new(
        DEGRADED,
        true,
        reason,
        &format!(
            "{} failed, {} conflicted, {}/{} ready",
            c.failed, c.conflicted, c.ready, c.desired
        ),
    )
}

fn conflicted_condition(c: NodeCounts) -> Condition {
    if c.conflicted > 0 {
        Condition::new(
            CONFLICTED,
            true,
            "ResourceConflict",
            &format!("{} resources are owned by someone else", c.conflicted),
        )
    } else {
        Condition::new(CONFLICTED, false, "NoConflict", "No resource conflicts")
    }
}

/// Ready, Progressing (complete), Conflicted and Degraded after a full pass
pub fn pass_conditions(c: NodeCounts, generation: Option<i64>) -> Vec<Condition> {
    vec![
        ready_condition(c).with_generation(generation),
        Condition::new(PROGRESSING, false, "ReconcileComplete", "Reconciliation completed")
            .with_generation(generation),
        conflicted_condition(c).with_generation(generation),
        degraded_condition(c).with_generation(generation),
    ]
}

/// Progressing while the spec pass is changing children
pub fn progressing(generation: Option<i64>) -> Condition {
    Condition::new(PROGRESSING, true, "Reconciling", "Applying resources").with_generation(generation)
}

/// The resources cannot be ordered, nothing gets applied
pub fn dependency_failure(message: &str, generation: Option<i64>) -> Vec<Condition> {
    vec![
        Condition::new(READY, false, "DependencyCycle", message).with_generation(generation),
        Condition::new(PROGRESSING, false, "DependencyCycle", message).with_generation(generation),
        Condition::new(CONFLICTED, false, "DependencyCycle", "No resource was applied").with_generation(generation),
        Condition::new(DEGRADED, true, "DependencyCycle", message).with_generation(generation),
    ]
}
