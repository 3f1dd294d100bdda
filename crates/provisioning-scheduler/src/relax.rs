//! Preference relaxer: applies exactly one relaxation to a pod per call, trying each
//! step in order and returning on the first that makes progress.

use k8s_openapi::api::core::v1::{PreferredSchedulingTerm, Taint, Toleration, WeightedPodAffinityTerm};

use crate::pod::Pod;

/// Returns `true` if a relaxation was applied.
pub fn relax(pod: &mut Pod, pool_taints: &[Taint]) -> bool {
    remove_first_required_node_affinity_term(pod)
        || remove_highest_weight_preferred_pod_affinity_term(pod)
        || remove_highest_weight_preferred_pod_anti_affinity_term(pod)
        || remove_highest_weight_preferred_node_affinity_term(pod)
        || remove_schedule_anyway_spread_constraint(pod)
        || add_prefer_no_schedule_toleration(pod, pool_taints)
}

/// Required node-affinity terms are OR'd; the last remaining term can never be
/// removed, or the pod would lose its only required placement.
fn remove_first_required_node_affinity_term(pod: &mut Pod) -> bool {
    let Some(node_affinity) = pod.affinity.node_affinity.as_mut() else {
        return false;
    };
    let Some(required) = node_affinity.required_during_scheduling_ignored_during_execution.as_mut() else {
        return false;
    };
    if required.node_selector_terms.len() <= 1 {
        return false;
    }
    required.node_selector_terms.remove(0);
    true
}

trait Weighted {
    fn weight(&self) -> i32;
}

impl Weighted for WeightedPodAffinityTerm {
    fn weight(&self) -> i32 {
        self.weight
    }
}

impl Weighted for PreferredSchedulingTerm {
    fn weight(&self) -> i32 {
        self.weight
    }
}

fn remove_highest_weight<T: Weighted>(items: &mut Vec<T>) -> bool {
    if items.is_empty() {
        return false;
    }
    let (idx, _) = items
        .iter()
        .enumerate()
        .max_by_key(|(_, item)| item.weight())
        .expect("checked non-empty above");
    items.remove(idx);
    true
}

fn remove_highest_weight_preferred_pod_affinity_term(pod: &mut Pod) -> bool {
    let Some(pod_affinity) = pod.affinity.pod_affinity.as_mut() else {
        return false;
    };
    let Some(preferred) = pod_affinity.preferred_during_scheduling_ignored_during_execution.as_mut() else {
        return false;
    };
    remove_highest_weight(preferred)
}

fn remove_highest_weight_preferred_pod_anti_affinity_term(pod: &mut Pod) -> bool {
    let Some(anti_affinity) = pod.affinity.pod_anti_affinity.as_mut() else {
        return false;
    };
    let Some(preferred) = anti_affinity.preferred_during_scheduling_ignored_during_execution.as_mut() else {
        return false;
    };
    remove_highest_weight(preferred)
}

fn remove_highest_weight_preferred_node_affinity_term(pod: &mut Pod) -> bool {
    let Some(node_affinity) = pod.affinity.node_affinity.as_mut() else {
        return false;
    };
    let Some(preferred) = node_affinity.preferred_during_scheduling_ignored_during_execution.as_mut() else {
        return false;
    };
    remove_highest_weight(preferred)
}

fn remove_schedule_anyway_spread_constraint(pod: &mut Pod) -> bool {
    let idx = pod
        .topology_spread_constraints
        .iter()
        .position(|c| c.when_unsatisfiable == "ScheduleAnyway");
    match idx {
        Some(i) => {
            pod.topology_spread_constraints.remove(i);
            true
        }
        None => false,
    }
}

fn add_prefer_no_schedule_toleration(pod: &mut Pod, pool_taints: &[Taint]) -> bool {
    let has_prefer_no_schedule_taint = pool_taints.iter().any(|t| t.effect == "PreferNoSchedule");
    if !has_prefer_no_schedule_taint {
        return false;
    }
    let already_tolerates_all = pod
        .tolerations
        .iter()
        .any(|t| t.key.is_none() && t.effect.as_deref() == Some("PreferNoSchedule"));
    if already_tolerates_all {
        return false;
    }
    pod.tolerations.push(Toleration {
        key: None,
        operator: Some("Exists".to_string()),
        value: None,
        effect: Some("PreferNoSchedule".to_string()),
        toleration_seconds: None,
    });
    true
}
