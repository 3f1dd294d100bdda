//! The scheduler loop: drives the priority queue to empty or a deadline, trying
//! existing nodes, then candidate nodeclaims, then fresh templates for each pod in
//! turn.

use std::{collections::BTreeMap, sync::Arc, time::Instant};

use k8s_openapi::{
    api::core::v1::{PodAffinityTerm, Taint},
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use tokio::{sync::Semaphore, task::JoinSet};

use crate::{
    config::{MinValuesPolicy, PreferencePolicy, SchedulerConfig},
    error::Error,
    existing_node::{self, ExistingNode},
    instance_type,
    node_pool::{self, NodeClaimTemplate},
    nodeclaim::CandidateNodeClaim,
    pod::{self, Pod, PodData},
    queue::{self, PodQueue},
    relax,
    requirement::{Domain, RequirementSet},
    reservation::ReservationManager,
    topology::{self, DomainCatalog, ExistingNodeSnapshot, PodTopologyView, TopologyEngine},
};

#[derive(Debug, Default)]
pub struct Results {
    pub new_node_claims: Vec<CandidateNodeClaim>,
    pub existing_node_assignments: BTreeMap<String, Vec<String>>,
    pub pod_errors: BTreeMap<String, Error>,
}

pub struct Scheduler {
    config: SchedulerConfig,
    templates: Vec<NodeClaimTemplate>,
    reservations: Arc<ReservationManager>,
    topology: Arc<TopologyEngine>,
    catalog: Arc<DomainCatalog>,
}

enum Placement {
    ExistingNode { index: usize, reqs: RequirementSet },
    Candidate { index: usize, outcome: crate::nodeclaim::CanAddOutcome },
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, mut templates: Vec<NodeClaimTemplate>) -> Self {
        node_pool::sort_templates(&mut templates);
        Scheduler {
            config,
            templates,
            reservations: Arc::new(ReservationManager::new()),
            topology: Arc::new(TopologyEngine::new()),
            catalog: Arc::new(DomainCatalog::new()),
        }
    }

    pub fn seed_reservation_capacity(&self, reservation_id: impl Into<String>, capacity: u32) {
        self.reservations.seed_capacity(reservation_id, capacity);
    }

    #[tracing::instrument(skip(self, pods, existing_nodes), fields(pods = pods.len(), existing_nodes = existing_nodes.len()))]
    pub async fn solve(&mut self, pods: Vec<Pod>, mut existing_nodes: Vec<ExistingNode>) -> Results {
        existing_node::sort_existing_nodes(&mut existing_nodes);
        self.catalog = Arc::new(build_domain_catalog(&self.templates, &existing_nodes));
        self.topology = Arc::new(TopologyEngine::with_existing(existing_node_snapshots(&existing_nodes)));

        let deadline = Instant::now() + self.config.deadline;
        let daemon_overhead = self.daemon_overhead(&pods);

        let mut working_pods = pods;
        if self.config.preference_policy == PreferencePolicy::Ignore {
            for pod in &mut working_pods {
                pod.strip_preferred_terms();
            }
        }

        let mut queue = PodQueue::new();
        for (index, pod) in working_pods.iter().enumerate() {
            let data = PodData::derive(pod, &RequirementSet::new());
            queue.push(index, queue::complexity(pod, data.requirements.keys().count()));
        }

        let mut node_claims: Vec<CandidateNodeClaim> = Vec::new();
        let mut existing_assignments: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut pod_errors: BTreeMap<String, Error> = BTreeMap::new();
        let mut next_claim_id: u64 = 0;
        let pool_taints = self.all_pool_taints();

        while let Some((pod_index, _push_count)) = queue.pop() {
            if Instant::now() >= deadline {
                tracing::warn!(remaining = queue.len(), "deadline exceeded with pods still queued");
                pod_errors
                    .entry(working_pods[pod_index].name.clone())
                    .or_insert(Error::DeadlineExceeded);
                break;
            }

            let pod = working_pods[pod_index].clone();

            if pod.has_resource_claims && self.config.ignore_resource_claim_requests {
                pod_errors.insert(pod.name.clone(), Error::ResourceClaimUnsupported);
                continue;
            }

            let data = PodData::derive(&pod, &RequirementSet::new());
            let topo_view = derive_topology_view(&pod);

            match self
                .try_schedule(&pod, &data, &topo_view, &mut existing_nodes, &mut node_claims, &mut next_claim_id, &daemon_overhead)
                .await
            {
                Ok(host) => {
                    if let Some(host) = host {
                        existing_assignments.entry(host).or_default().push(pod.name.clone());
                    }
                }
                Err(err) => {
                    if err.is_relaxable() {
                        let mut relaxed = working_pods[pod_index].clone();
                        if relax::relax(&mut relaxed, &pool_taints) {
                            tracing::debug!(pod = %relaxed.name, "relaxed preference, re-queueing");
                            self.topology.update(&topo_view);
                            working_pods[pod_index] = relaxed;
                            let new_data = PodData::derive(&working_pods[pod_index], &RequirementSet::new());
                            let complexity =
                                queue::complexity(&working_pods[pod_index], new_data.requirements.keys().count());
                            queue.push(pod_index, complexity);
                            continue;
                        }
                    }
                    self.topology.update(&topo_view);
                    pod_errors.insert(pod.name.clone(), err);
                }
            }
        }

        for claim in &mut node_claims {
            if let Err(err) = claim.finalize(self.config.max_instance_types) {
                for pod_name in &claim.pods {
                    pod_errors.insert(pod_name.clone(), clone_error(&err));
                }
            }
        }

        Results {
            new_node_claims: node_claims,
            existing_node_assignments: existing_assignments,
            pod_errors,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn try_schedule(
        &self,
        pod: &Pod,
        data: &PodData,
        topo_view: &PodTopologyView,
        existing_nodes: &mut [ExistingNode],
        node_claims: &mut Vec<CandidateNodeClaim>,
        next_claim_id: &mut u64,
        daemon_overhead: &BTreeMap<String, crate::resources::ResourceList>,
    ) -> Result<Option<String>, Error> {
        if let Some(Placement::ExistingNode { index, reqs }) =
            self.scan_existing_nodes(pod, data, topo_view, existing_nodes).await
        {
            let node = &mut existing_nodes[index];
            node.add(pod, data, topo_view, &reqs, &self.topology);
            return Ok(Some(node.host_name.clone()));
        }

        let mut order: Vec<usize> = (0..node_claims.len()).collect();
        order.sort_by_key(|&i| (node_claims[i].pod_count(), node_claims[i].creation_index));

        if let Some(Placement::Candidate { index, outcome }) =
            self.scan_candidates(pod, data, topo_view, node_claims, &order).await
        {
            let claim = &mut node_claims[index];
            claim.add(pod, data, topo_view, outcome, &self.reservations, &self.topology)?;
            return Ok(None);
        }

        match self.scan_templates(pod, data, topo_view, daemon_overhead, next_claim_id).await? {
            Some((mut claim, outcome)) => {
                claim.add(pod, data, topo_view, outcome, &self.reservations, &self.topology)?;
                node_claims.push(claim);
                Ok(None)
            }
            None => Err(Error::NoTemplates),
        }
    }

    async fn scan_existing_nodes(
        &self,
        pod: &Pod,
        data: &PodData,
        topo_view: &PodTopologyView,
        existing_nodes: &[ExistingNode],
    ) -> Option<Placement> {
        let semaphore = Arc::new(Semaphore::new(self.config.num_concurrent_reconciles.get()));
        let mut set = JoinSet::new();
        for (index, node) in existing_nodes.iter().cloned().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let pod = pod.clone();
            let data = data.clone();
            let topo_view = topo_view.clone();
            let topology = Arc::clone(&self.topology);
            let catalog = Arc::clone(&self.catalog);
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                node.can_add(&pod, &data, &topo_view, &topology, &catalog)
                    .ok()
                    .map(|reqs| (index, reqs))
            });
        }

        let mut best: Option<(usize, RequirementSet)> = None;
        while let Some(joined) = set.join_next().await {
            if let Ok(Some((index, reqs))) = joined {
                if best.as_ref().is_none_or(|(best_index, _)| index < *best_index) {
                    let found_zero = index == 0;
                    best = Some((index, reqs));
                    if found_zero {
                        set.abort_all();
                        break;
                    }
                }
            }
        }
        best.map(|(index, reqs)| Placement::ExistingNode { index, reqs })
    }

    async fn scan_candidates(
        &self,
        pod: &Pod,
        data: &PodData,
        topo_view: &PodTopologyView,
        node_claims: &[CandidateNodeClaim],
        order: &[usize],
    ) -> Option<Placement> {
        let semaphore = Arc::new(Semaphore::new(self.config.num_concurrent_reconciles.get()));
        let mut set = JoinSet::new();
        for (rank, &claim_index) in order.iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let pod = pod.clone();
            let data = data.clone();
            let topo_view = topo_view.clone();
            let claim = node_claims[claim_index].clone();
            let reservations = Arc::clone(&self.reservations);
            let topology = Arc::clone(&self.topology);
            let catalog = Arc::clone(&self.catalog);
            let mode = self.config.reserved_offering_mode;
            let allow_min_values_relaxation = matches!(self.config.min_values_policy, MinValuesPolicy::BestEffort);
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                claim
                    .can_add(&pod, &data, &topo_view, allow_min_values_relaxation, mode, &reservations, &topology, &catalog)
                    .ok()
                    .map(|outcome| (rank, claim_index, outcome))
            });
        }

        let mut best: Option<(usize, usize, crate::nodeclaim::CanAddOutcome)> = None;
        while let Some(joined) = set.join_next().await {
            if let Ok(Some((rank, claim_index, outcome))) = joined {
                if best.as_ref().is_none_or(|(best_rank, _, _)| rank < *best_rank) {
                    let found_zero = rank == 0;
                    best = Some((rank, claim_index, outcome));
                    if found_zero {
                        set.abort_all();
                        break;
                    }
                }
            }
        }
        best.map(|(_, claim_index, outcome)| Placement::Candidate {
            index: claim_index,
            outcome,
        })
    }

    async fn scan_templates(
        &self,
        pod: &Pod,
        data: &PodData,
        topo_view: &PodTopologyView,
        daemon_overhead: &BTreeMap<String, crate::resources::ResourceList>,
        next_claim_id: &mut u64,
    ) -> Result<Option<(CandidateNodeClaim, crate::nodeclaim::CanAddOutcome)>, Error> {
        let semaphore = Arc::new(Semaphore::new(self.config.num_concurrent_reconciles.get()));
        let mut set = JoinSet::new();
        for (index, template) in self.templates.iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let pod = pod.clone();
            let data = data.clone();
            let topo_view = topo_view.clone();
            let overhead = daemon_overhead.get(&template.pool_name).cloned().unwrap_or_default();
            let claim_id = format!("candidate-{}", *next_claim_id + index as u64);
            let claim = CandidateNodeClaim::from_template(template, claim_id, *next_claim_id + index as u64, overhead, BTreeMap::new());
            let reservations = Arc::clone(&self.reservations);
            let topology = Arc::clone(&self.topology);
            let catalog = Arc::clone(&self.catalog);
            let mode = self.config.reserved_offering_mode;
            let allow_min_values_relaxation = matches!(self.config.min_values_policy, MinValuesPolicy::BestEffort);
            set.spawn(async move {
                let result = claim
                    .can_add(&pod, &data, &topo_view, allow_min_values_relaxation, mode, &reservations, &topology, &catalog)
                    .map(|outcome| (claim, outcome));
                (index, result)
            });
        }
        *next_claim_id += self.templates.len() as u64;

        let mut results: Vec<(usize, Result<(CandidateNodeClaim, crate::nodeclaim::CanAddOutcome), Error>)> = Vec::new();
        while let Some(joined) = set.join_next().await {
            if let Ok(entry) = joined {
                results.push(entry);
            }
        }
        results.sort_by_key(|(index, _)| *index);

        let best_index = results.iter().find(|(_, r)| r.is_ok()).map(|(i, _)| *i);
        if let Some(best_index) = best_index {
            for (index, result) in &results {
                if *index < best_index && matches!(result, Err(Error::ReservedOffering)) {
                    return Err(Error::ReservedOffering);
                }
            }
            let (_, result) = results.into_iter().find(|(i, _)| *i == best_index).expect("found above");
            return result.map(Some);
        }

        Ok(None)
    }

    fn daemon_overhead(&self, pods: &[Pod]) -> BTreeMap<String, crate::resources::ResourceList> {
        let daemons: Vec<&Pod> = pods
            .iter()
            .filter(|p| p.is_daemon && !(p.has_resource_claims && self.config.ignore_resource_claim_requests))
            .collect();
        let mut overhead = BTreeMap::new();
        for template in &self.templates {
            let mut sum = crate::resources::ResourceList::new();
            for daemon in &daemons {
                let tolerates_all = template
                    .taints
                    .iter()
                    .chain(&template.startup_taints)
                    .all(|t| t.effect == "PreferNoSchedule" || daemon.tolerates(&t.key, t.value.as_deref(), &t.effect));
                if tolerates_all && daemon_compatible_with_template(daemon, template) {
                    sum.add(&daemon.aggregate_requests());
                }
            }
            overhead.insert(template.pool_name.clone(), sum);
        }
        overhead
    }

    fn all_pool_taints(&self) -> Vec<Taint> {
        self.templates
            .iter()
            .flat_map(|t| t.taints.iter().chain(&t.startup_taints))
            .cloned()
            .collect()
    }
}

fn clone_error(err: &Error) -> Error {
    match err {
        Error::MinValuesIncompatible { kind } => Error::MinValuesIncompatible { kind: *kind },
        other => Error::ReservationLedgerCorrupted {
            detail: other.to_string(),
        },
    }
}

fn build_domain_catalog(templates: &[NodeClaimTemplate], existing_nodes: &[ExistingNode]) -> DomainCatalog {
    let mut catalog = DomainCatalog::new();
    for template in templates {
        let pool_taints: Vec<Taint> = template.taints.iter().chain(&template.startup_taints).cloned().collect();
        for it in &template.instance_types {
            for offering in &it.offerings {
                catalog.insert(instance_type::LABEL_ZONE, offering.zone.clone());
                catalog.insert(instance_type::LABEL_CAPACITY_TYPE, offering.capacity_type.to_string());
                catalog.insert(instance_type::LABEL_INSTANCE_TYPE, it.name.clone());
                catalog.insert_taints(instance_type::LABEL_ZONE, offering.zone.clone(), &pool_taints);
                catalog.insert_taints(instance_type::LABEL_CAPACITY_TYPE, offering.capacity_type.to_string(), &pool_taints);
                catalog.insert_taints(instance_type::LABEL_INSTANCE_TYPE, it.name.clone(), &pool_taints);
            }
        }
    }
    for node in existing_nodes {
        catalog.insert(existing_node::LABEL_HOSTNAME, node.host_name.clone());
        catalog.insert_taints(existing_node::LABEL_HOSTNAME, node.host_name.clone(), &node.taints);
        for (key, requirement) in node.requirements.iter() {
            if let Domain::In(values) = &requirement.domain {
                for value in values {
                    catalog.insert(key, value.clone());
                }
            }
        }
    }
    catalog
}

fn existing_node_snapshots(existing_nodes: &[ExistingNode]) -> Vec<ExistingNodeSnapshot> {
    existing_nodes
        .iter()
        .map(|node| ExistingNodeSnapshot {
            labels: node.labels.clone(),
            pods: node.existing_pods.clone(),
        })
        .collect()
}

/// Whether `daemon` could ever land on a node built from `template`, checked the
/// same way [`crate::relax::relax`] walks required node-affinity terms: the pod's
/// node selector plus *some* required OR-term must be compatible with the pool's
/// fixed requirements.
fn daemon_compatible_with_template(daemon: &Pod, template: &NodeClaimTemplate) -> bool {
    let base = pod::node_selector_requirements(daemon);
    let required_terms = daemon
        .affinity
        .node_affinity
        .as_ref()
        .and_then(|a| a.required_during_scheduling_ignored_during_execution.as_ref())
        .map(|r| r.node_selector_terms.as_slice())
        .unwrap_or(&[]);

    if required_terms.is_empty() {
        return base.compatible(&template.requirements);
    }

    required_terms.iter().any(|term| {
        let mut reqs = base.clone();
        if let Some(exprs) = &term.match_expressions {
            reqs.add_all(&pod::node_affinity_term_requirements(exprs));
        }
        reqs.compatible(&template.requirements)
    })
}

fn derive_topology_view(pod: &Pod) -> PodTopologyView {
    let mut spreads = Vec::new();
    for constraint in &pod.topology_spread_constraints {
        spreads.push(topology::SpreadSpec {
            topology_key: constraint.topology_key.clone(),
            selector: constraint.label_selector.clone().unwrap_or_default(),
            namespace_scope: topology::NamespaceScope::Same,
            max_skew: constraint.max_skew,
            min_domains: constraint.min_domains,
            when_unsatisfiable: if constraint.when_unsatisfiable == "ScheduleAnyway" {
                topology::WhenUnsatisfiable::ScheduleAnyway
            } else {
                topology::WhenUnsatisfiable::DoNotSchedule
            },
            node_affinity_policy: match constraint.node_affinity_policy.as_deref() {
                Some("Ignore") => topology::NodeAffinityPolicy::Ignore,
                _ => topology::NodeAffinityPolicy::Honor,
            },
            node_taints_policy: match constraint.node_taints_policy.as_deref() {
                Some("Ignore") => topology::NodeTaintsPolicy::Ignore,
                _ => topology::NodeTaintsPolicy::Honor,
            },
            match_label_keys: constraint.match_label_keys.clone().unwrap_or_default(),
        });
    }

    let mut pod_affinity_terms = Vec::new();
    let mut pod_anti_affinity_terms = Vec::new();

    if let Some(pod_affinity) = &pod.affinity.pod_affinity {
        if let Some(required) = &pod_affinity.required_during_scheduling_ignored_during_execution {
            pod_affinity_terms.extend(required.iter().map(|t| affinity_term(t, true)));
        }
        if let Some(preferred) = &pod_affinity.preferred_during_scheduling_ignored_during_execution {
            pod_affinity_terms.extend(preferred.iter().map(|w| affinity_term(&w.pod_affinity_term, false)));
        }
    }
    if let Some(anti_affinity) = &pod.affinity.pod_anti_affinity {
        if let Some(required) = &anti_affinity.required_during_scheduling_ignored_during_execution {
            pod_anti_affinity_terms.extend(required.iter().map(|t| affinity_term(t, true)));
        }
        if let Some(preferred) = &anti_affinity.preferred_during_scheduling_ignored_during_execution {
            pod_anti_affinity_terms.extend(preferred.iter().map(|w| affinity_term(&w.pod_affinity_term, false)));
        }
    }

    PodTopologyView {
        labels: pod.labels.clone(),
        spreads,
        pod_affinity_terms,
        pod_anti_affinity_terms,
        tolerations: pod.tolerations.clone(),
        is_daemon: pod.is_daemon,
    }
}

fn affinity_term(term: &PodAffinityTerm, required: bool) -> topology::AffinityTerm {
    topology::AffinityTerm {
        topology_key: term.topology_key.clone(),
        selector: term.label_selector.clone().unwrap_or_else(LabelSelector::default),
        namespace_scope: topology::NamespaceScope::Same,
        required,
    }
}
