//! Pod-shaped input data: the subset of a Kubernetes pod spec this crate actually
//! reasons about, plus the precomputed [`PodData`] the scheduler loop derives once
//! per pod before the queue starts draining.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    NodeAffinity, NodeSelectorRequirement, PodAffinity, PodAntiAffinity, Toleration,
    TopologySpreadConstraint,
};

use crate::{
    requirement::{Domain, Requirement, RequirementSet},
    resources::ResourceList,
};

/// An init container's restart policy, relevant only to tell a "sidecar" (native,
/// long-running init container with `restartPolicy: Always`) apart from a regular,
/// run-to-completion init container.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InitRestartPolicy {
    Always,
    RunToCompletion,
}

#[derive(Clone, Debug, Default)]
pub struct Container {
    pub requests: ResourceList,
}

#[derive(Clone, Debug)]
pub struct InitContainer {
    pub requests: ResourceList,
    pub restart_policy: InitRestartPolicy,
}

/// A single PVC reference carried by the pod; the actual zone/region restriction it
/// implies is resolved by the external volume-topology collaborator, not by this
/// crate.
#[derive(Clone, Debug)]
pub struct VolumeClaimRef {
    pub claim_name: String,
    pub driver: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct PodAffinityRules {
    pub node_affinity: Option<NodeAffinity>,
    pub pod_affinity: Option<PodAffinity>,
    pub pod_anti_affinity: Option<PodAntiAffinity>,
}

#[derive(Clone, Debug)]
pub struct Pod {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub node_selector: BTreeMap<String, String>,
    pub affinity: PodAffinityRules,
    pub tolerations: Vec<Toleration>,
    pub topology_spread_constraints: Vec<TopologySpreadConstraint>,
    pub init_containers: Vec<InitContainer>,
    pub containers: Vec<Container>,
    pub volume_claims: Vec<VolumeClaimRef>,
    pub host_ports: Vec<(String, Option<String>, i32)>,
    pub is_daemon: bool,
    pub has_resource_claims: bool,
}

impl Pod {
    /// Aggregated resource requests across init, sidecar, and regular containers.
    ///
    /// Regular init containers run sequentially before the main containers start, so
    /// only the single largest one needs to be accounted for; sidecars (init
    /// containers with `restartPolicy: Always`) keep running alongside both the
    /// remaining init containers and the main containers, so their requests are
    /// summed in on both sides of the `max`.
    pub fn aggregate_requests(&self) -> ResourceList {
        let mut sidecar_sum = ResourceList::new();
        let mut init_max = ResourceList::new();

        for init in &self.init_containers {
            match init.restart_policy {
                InitRestartPolicy::Always => sidecar_sum.add(&init.requests),
                InitRestartPolicy::RunToCompletion => {
                    init_max = component_wise_max(&init_max, &init.requests);
                }
            }
        }

        let mut container_sum = ResourceList::new();
        for container in &self.containers {
            container_sum.add(&container.requests);
        }

        let steady_state = component_wise_max(&init_max, &container_sum);
        sidecar_sum.plus(&steady_state)
    }

    pub fn tolerates(&self, taint_key: &str, taint_value: Option<&str>, effect: &str) -> bool {
        tolerates(&self.tolerations, taint_key, taint_value, effect)
    }

    /// Removes every soft (preferred / `ScheduleAnyway`) scheduling term, so that
    /// [`crate::relax::relax`] never finds anything left to relax away.
    pub fn strip_preferred_terms(&mut self) {
        if let Some(node_affinity) = self.affinity.node_affinity.as_mut() {
            node_affinity.preferred_during_scheduling_ignored_during_execution = None;
        }
        if let Some(pod_affinity) = self.affinity.pod_affinity.as_mut() {
            pod_affinity.preferred_during_scheduling_ignored_during_execution = None;
        }
        if let Some(pod_anti_affinity) = self.affinity.pod_anti_affinity.as_mut() {
            pod_anti_affinity.preferred_during_scheduling_ignored_during_execution = None;
        }
        self.topology_spread_constraints.retain(|c| c.when_unsatisfiable != "ScheduleAnyway");
    }
}

/// The plain toleration-matching rule, factored out so callers that only have a
/// toleration list (not a full [`Pod`]) can reuse it.
pub fn tolerates(tolerations: &[Toleration], taint_key: &str, taint_value: Option<&str>, effect: &str) -> bool {
    tolerations.iter().any(|t| {
        let key_matches = t.key.as_deref().is_none_or(|k| k == taint_key);
        let value_matches = match t.operator.as_deref() {
            Some("Exists") | None if t.key.is_none() => true,
            Some("Exists") => true,
            _ => t.value.as_deref() == taint_value,
        };
        let effect_matches = t.effect.as_deref().is_none_or(|e| e == effect);
        key_matches && value_matches && effect_matches
    })
}

fn component_wise_max(a: &ResourceList, b: &ResourceList) -> ResourceList {
    let names: std::collections::BTreeSet<&str> =
        a.resource_names().chain(b.resource_names()).collect();
    names
        .into_iter()
        .map(|name| {
            let value = a.get(name).max(b.get(name));
            (name.to_string(), value)
        })
        .collect()
}

/// Requirements derived from a pod's node selector and *required* node-affinity
/// terms, prior to any topology or instance-type augmentation.
pub fn node_selector_requirements(pod: &Pod) -> RequirementSet {
    let mut set = RequirementSet::new();
    for (key, value) in &pod.node_selector {
        set.add(key.clone(), Requirement::new(Domain::single(value.clone())));
    }
    set
}

/// Required node-affinity terms, OR'd together (a pod matches if *any* term's
/// AND-of-expressions is satisfiable). The queue/relaxer operate on the list of
/// terms directly; this helper is for building the effective set once a term has
/// been chosen.
pub fn node_affinity_term_requirements(exprs: &[NodeSelectorRequirement]) -> RequirementSet {
    let mut set = RequirementSet::new();
    for expr in exprs {
        set.add(expr.key.clone(), Requirement::from_node_selector_requirement(expr));
    }
    set
}

/// The derived per-pod data the scheduler loop computes once, before the pod ever
/// enters the queue. `strict_requirements` deliberately excludes preferred
/// node-affinity terms so that preference relaxation can never shrink the set of
/// domains topology considers reachable.
#[derive(Clone, Debug)]
pub struct PodData {
    pub requests: ResourceList,
    pub requirements: RequirementSet,
    pub strict_requirements: RequirementSet,
    pub has_resource_claims: bool,
}

impl PodData {
    pub fn derive(pod: &Pod, extra_requirements: &RequirementSet) -> PodData {
        let mut requirements = node_selector_requirements(pod);
        requirements.add_all(extra_requirements);

        if let Some(node_affinity) = &pod.affinity.node_affinity {
            if let Some(required) = &node_affinity.required_during_scheduling_ignored_during_execution
            {
                // Required terms are OR'd; only the first is folded into the
                // "live" requirement set used for add() attempts. Remaining terms
                // are consulted by the relaxer/queue, which retry the pod against
                // alternate terms on failure.
                if let Some(first) = required.node_selector_terms.first() {
                    if let Some(exprs) = &first.match_expressions {
                        requirements.add_all(&node_affinity_term_requirements(exprs));
                    }
                }
            }
        }

        let strict_requirements = requirements.clone();

        PodData {
            requests: pod.aggregate_requests(),
            requirements,
            strict_requirements,
            has_resource_claims: pod.has_resource_claims,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::resources::CPU;

    fn container(cpu: f64) -> Container {
        Container {
            requests: [(CPU.to_string(), crate::quantity::Quantity::from(cpu))]
                .into_iter()
                .collect(),
        }
    }

    fn init(cpu: f64, policy: InitRestartPolicy) -> InitContainer {
        InitContainer {
            requests: [(CPU.to_string(), crate::quantity::Quantity::from(cpu))]
                .into_iter()
                .collect(),
            restart_policy: policy,
        }
    }

    fn empty_pod() -> Pod {
        Pod {
            name: "p".into(),
            namespace: "default".into(),
            labels: BTreeMap::new(),
            node_selector: BTreeMap::new(),
            affinity: PodAffinityRules::default(),
            tolerations: vec![],
            topology_spread_constraints: vec![],
            init_containers: vec![],
            containers: vec![],
            volume_claims: vec![],
            host_ports: vec![],
            is_daemon: false,
            has_resource_claims: false,
        }
    }

    #[test]
    fn sequential_init_takes_max_not_sum() {
        let mut pod = empty_pod();
        pod.init_containers = vec![
            init(1.0, InitRestartPolicy::RunToCompletion),
            init(3.0, InitRestartPolicy::RunToCompletion),
        ];
        pod.containers = vec![container(2.0)];
        // max(init_max=3, container_sum=2) = 3
        assert_eq!(pod.aggregate_requests().get(CPU).as_f64(), 3.0);
    }

    #[test]
    fn sidecar_is_summed_on_top_of_steady_state() {
        let mut pod = empty_pod();
        pod.init_containers = vec![init(1.0, InitRestartPolicy::Always)];
        pod.containers = vec![container(2.0)];
        // sidecar_sum=1 + max(init_max=0, container_sum=2) = 3
        assert_eq!(pod.aggregate_requests().get(CPU).as_f64(), 3.0);
    }

    #[test]
    fn daemon_pod_always_tolerates_prefer_no_schedule() {
        // Exercised at the nodeclaim/existing-node layer; here we only check the
        // plain toleration matcher used by both.
        let mut pod = empty_pod();
        pod.tolerations.push(Toleration {
            key: Some("dedicated".into()),
            operator: Some("Equal".into()),
            value: Some("gpu".into()),
            effect: Some("NoSchedule".into()),
            toleration_seconds: None,
        });
        assert!(pod.tolerates("dedicated", Some("gpu"), "NoSchedule"));
        assert!(!pod.tolerates("dedicated", Some("cpu"), "NoSchedule"));
    }
}
