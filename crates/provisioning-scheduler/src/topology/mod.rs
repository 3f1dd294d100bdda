//! The topology engine: tracks per-domain pod counts for spread constraints and
//! pod-affinity/anti-affinity terms, and derives the extra requirements a pod's
//! placement on a given node must additionally satisfy.

pub mod group;

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Mutex,
};

use k8s_openapi::{api::core::v1::Taint, apimachinery::pkg::apis::meta::v1::LabelSelector};

pub use group::{GroupKey, GroupKind, NamespaceScope, NodeAffinityPolicy, NodeTaintsPolicy, WhenUnsatisfiable};

use crate::{
    error::Error,
    requirement::{Domain, Requirement, RequirementSet},
};

#[derive(Clone, Debug)]
pub struct SpreadSpec {
    pub topology_key: String,
    pub selector: LabelSelector,
    pub namespace_scope: NamespaceScope,
    pub max_skew: i32,
    pub min_domains: Option<i32>,
    pub when_unsatisfiable: WhenUnsatisfiable,
    pub node_affinity_policy: NodeAffinityPolicy,
    pub node_taints_policy: NodeTaintsPolicy,
    pub match_label_keys: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct AffinityTerm {
    pub topology_key: String,
    pub selector: LabelSelector,
    pub namespace_scope: NamespaceScope,
    pub required: bool,
}

/// What the scheduler loop asks the topology engine to reason about for one pod.
#[derive(Clone, Debug, Default)]
pub struct PodTopologyView {
    pub labels: BTreeMap<String, String>,
    pub spreads: Vec<SpreadSpec>,
    pub pod_affinity_terms: Vec<AffinityTerm>,
    pub pod_anti_affinity_terms: Vec<AffinityTerm>,
    pub tolerations: Vec<k8s_openapi::api::core::v1::Toleration>,
    pub is_daemon: bool,
}

/// The labels and namespace of one already-running pod, as reported by
/// [`crate::provider::ClusterState`], used only to seed [`TopologyEngine`] group
/// counts from cluster state that predates this `Solve`.
#[derive(Clone, Debug, Default)]
pub struct ExistingPodLabels {
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
}

/// A live node's labels, taints, and the pods already running on it; the input the
/// topology engine seeds its group counts from at the start of a `Solve`.
#[derive(Clone, Debug, Default)]
pub struct ExistingNodeSnapshot {
    pub labels: BTreeMap<String, String>,
    pub pods: Vec<ExistingPodLabels>,
}

/// Candidate domain values known for each topology key, assembled once per `Solve`
/// from node pools (filtered by the pod's strict requirements and taint/affinity
/// policy) and existing nodes' observed values; hostname topology gets one synthetic
/// domain per node. Built by the scheduler loop, not by this engine.
#[derive(Clone, Debug, Default)]
pub struct DomainCatalog {
    domains: BTreeMap<String, BTreeSet<String>>,
    /// Taints observed on any pool/node contributing to a given `(topology_key,
    /// domain)` pair. A domain is treated as taint-reachable for `NodeTaintsPolicy::
    /// Honor` only if the pod tolerates every taint ever seen there, since a single
    /// domain can span several pools or nodes with different taints.
    taints: BTreeMap<(String, String), Vec<Taint>>,
}

impl DomainCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, topology_key: impl Into<String>, domain: impl Into<String>) {
        self.domains.entry(topology_key.into()).or_default().insert(domain.into());
    }

    pub fn insert_taints(&mut self, topology_key: impl Into<String>, domain: impl Into<String>, taints: &[Taint]) {
        self.taints
            .entry((topology_key.into(), domain.into()))
            .or_default()
            .extend(taints.iter().cloned());
    }

    pub fn domains_for(&self, topology_key: &str) -> BTreeSet<String> {
        self.domains.get(topology_key).cloned().unwrap_or_default()
    }

    pub fn taints_for(&self, topology_key: &str, domain: &str) -> &[Taint] {
        self.taints
            .get(&(topology_key.to_string(), domain.to_string()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[derive(Clone, Debug, Default)]
struct GroupState {
    counts: BTreeMap<String, u32>,
}

impl GroupState {
    fn count(&self, domain: &str) -> u32 {
        self.counts.get(domain).copied().unwrap_or(0)
    }

    fn bump(&mut self, domain: &str) {
        *self.counts.entry(domain.to_string()).or_insert(0) += 1;
    }
}

/// Process-scoped for the duration of one `Solve`; reinitialize from cluster state
/// (via [`TopologyEngine::with_existing`]) each time rather than reusing across
/// calls.
#[derive(Debug, Default)]
pub struct TopologyEngine {
    groups: Mutex<BTreeMap<GroupKey, GroupState>>,
    existing: Vec<ExistingNodeSnapshot>,
}

impl TopologyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an engine whose group counts, once first touched, are seeded from
    /// `existing` — the cluster state a `Solve` started against — rather than zero.
    pub fn with_existing(existing: Vec<ExistingNodeSnapshot>) -> Self {
        TopologyEngine {
            groups: Mutex::new(BTreeMap::new()),
            existing,
        }
    }

    /// Seeds a group's observed count for `domain` from existing cluster state.
    pub fn seed(&self, key: GroupKey, domain: &str, count: u32) {
        let mut groups = self.groups.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let state = groups.entry(key).or_default();
        *state.counts.entry(domain.to_string()).or_insert(0) += count;
    }

    /// Builds the initial [`GroupState`] for a freshly-seen group from this engine's
    /// existing-cluster snapshot: for every node whose `topology_key` label is set,
    /// counts how many of its already-running pods match `selector`.
    fn seeded_group_state(&self, topology_key: &str, selector: &LabelSelector) -> GroupState {
        let mut state = GroupState::default();
        for node in &self.existing {
            let Some(domain) = node.labels.get(topology_key) else {
                continue;
            };
            let matching = node
                .pods
                .iter()
                .filter(|pod| group::label_selector_matches(selector, &pod.labels))
                .count();
            if matching > 0 {
                *state.counts.entry(domain.clone()).or_insert(0) += matching as u32;
            }
        }
        state
    }

    /// `AddRequirements`: derives the extra requirements a pod's placement on a node
    /// matching `current_node_reqs` must carry, from its spread constraints and
    /// required affinity/anti-affinity terms. Preferred terms never appear here.
    pub fn add_requirements(
        &self,
        pod: &PodTopologyView,
        current_node_reqs: &RequirementSet,
        catalog: &DomainCatalog,
    ) -> Result<RequirementSet, Error> {
        let mut groups = self.groups.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut extra = RequirementSet::new();

        for spread in &pod.spreads {
            let selector = effective_selector(&spread.selector, &spread.match_label_keys, &pod.labels);
            let key = GroupKey::new(
                GroupKind::Spread,
                spread.topology_key.clone(),
                &selector,
                spread.namespace_scope.clone(),
                true,
            );
            let state = groups
                .entry(key)
                .or_insert_with(|| self.seeded_group_state(&spread.topology_key, &selector));

            let node_domain = current_node_reqs.get(&spread.topology_key).domain;
            let reachable_domains = catalog.domains_for(&spread.topology_key);
            let candidate_domains: BTreeSet<String> = reachable_domains
                .into_iter()
                .filter(|d| match spread.node_affinity_policy {
                    NodeAffinityPolicy::Honor => node_domain.contains(d),
                    NodeAffinityPolicy::Ignore => true,
                })
                .filter(|d| match spread.node_taints_policy {
                    NodeTaintsPolicy::Ignore => true,
                    NodeTaintsPolicy::Honor => catalog
                        .taints_for(&spread.topology_key, d)
                        .iter()
                        .all(|t| tolerates_taint(pod, t)),
                })
                .collect();

            if candidate_domains.is_empty() {
                if matches!(spread.when_unsatisfiable, WhenUnsatisfiable::DoNotSchedule) {
                    return Err(Error::TopologyInfeasible {
                        reason: format!("no candidate domain for spread key {}", spread.topology_key),
                    });
                }
                continue;
            }

            let counts: BTreeMap<String, u32> = candidate_domains
                .iter()
                .map(|d| (d.clone(), state.count(d)))
                .collect();
            let min_count = counts.values().copied().min().unwrap_or(0);
            let max_skew = u32::try_from(spread.max_skew.max(0)).unwrap_or(0);
            let chosen: BTreeSet<String> = counts
                .iter()
                .filter(|&(_, count)| (*count + 1).saturating_sub(min_count) <= max_skew)
                .map(|(d, _)| d.clone())
                .collect();

            if chosen.is_empty() {
                if matches!(spread.when_unsatisfiable, WhenUnsatisfiable::DoNotSchedule) {
                    return Err(Error::TopologyInfeasible {
                        reason: format!("spread on {} cannot keep maxSkew", spread.topology_key),
                    });
                }
                continue;
            }

            if !extra.add(spread.topology_key.clone(), Requirement::new(Domain::exact(chosen))) {
                return Err(Error::TopologyInfeasible {
                    reason: format!(
                        "spread requirement on {} conflicts with node requirements",
                        spread.topology_key
                    ),
                });
            }
        }

        for term in pod.pod_affinity_terms.iter().filter(|t| t.required) {
            let key = GroupKey::new(
                GroupKind::PodAffinity,
                term.topology_key.clone(),
                &term.selector,
                term.namespace_scope.clone(),
                true,
            );
            let state = groups
                .entry(key)
                .or_insert_with(|| self.seeded_group_state(&term.topology_key, &term.selector));
            let node_domain = current_node_reqs.get(&term.topology_key).domain;
            let allowed: BTreeSet<String> = state
                .counts
                .iter()
                .filter(|&(_, &count)| count > 0)
                .map(|(d, _)| d.clone())
                .filter(|d| node_domain.contains(d))
                .collect();
            if allowed.is_empty() {
                return Err(Error::TopologyInfeasible {
                    reason: format!("required pod affinity on {} has no co-located domain", term.topology_key),
                });
            }
            if !extra.add(term.topology_key.clone(), Requirement::new(Domain::exact(allowed))) {
                return Err(Error::TopologyInfeasible {
                    reason: format!(
                        "pod affinity requirement on {} conflicts with node requirements",
                        term.topology_key
                    ),
                });
            }
        }

        for term in pod.pod_anti_affinity_terms.iter().filter(|t| t.required) {
            let key = GroupKey::new(
                GroupKind::PodAntiAffinity,
                term.topology_key.clone(),
                &term.selector,
                term.namespace_scope.clone(),
                true,
            );
            let state = groups
                .entry(key)
                .or_insert_with(|| self.seeded_group_state(&term.topology_key, &term.selector));
            let forbidden: BTreeSet<String> = state
                .counts
                .iter()
                .filter(|&(_, &count)| count > 0)
                .map(|(d, _)| d.clone())
                .collect();
            if !forbidden.is_empty()
                && !extra.add(term.topology_key.clone(), Requirement::new(Domain::not_in(forbidden)))
            {
                return Err(Error::TopologyInfeasible {
                    reason: format!(
                        "pod anti-affinity requirement on {} conflicts with node requirements",
                        term.topology_key
                    ),
                });
            }
        }

        Ok(extra)
    }

    /// `Record`: commits the pod's contribution to every group it matches once a node
    /// has actually admitted it. A domain still undecided on a candidate nodeclaim
    /// (`key In {d1, d2, ...}`) bumps only the minimum-count domain among the
    /// allowed set — pessimistic accounting, since the finalizer could still pick any
    /// of them.
    pub fn record(&self, pod: &PodTopologyView, chosen_reqs: &RequirementSet) {
        let mut groups = self.groups.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        for spread in &pod.spreads {
            let selector = effective_selector(&spread.selector, &spread.match_label_keys, &pod.labels);
            let key = GroupKey::new(
                GroupKind::Spread,
                spread.topology_key.clone(),
                &selector,
                spread.namespace_scope.clone(),
                true,
            );
            bump_pessimistic(&mut groups, key, &spread.topology_key, chosen_reqs);
        }
        for term in &pod.pod_affinity_terms {
            let key = GroupKey::new(
                GroupKind::PodAffinity,
                term.topology_key.clone(),
                &term.selector,
                term.namespace_scope.clone(),
                term.required,
            );
            bump_pessimistic(&mut groups, key, &term.topology_key, chosen_reqs);
        }
        for term in &pod.pod_anti_affinity_terms {
            let key = GroupKey::new(
                GroupKind::PodAntiAffinity,
                term.topology_key.clone(),
                &term.selector,
                term.namespace_scope.clone(),
                term.required,
            );
            bump_pessimistic(&mut groups, key, &term.topology_key, chosen_reqs);
        }
    }

    /// Marks a re-queued pod's prior domain commitment stale. Counts are derived
    /// fresh from `chosen_reqs` on every [`Self::record`] call, so there is no cached
    /// per-pod state to invalidate here.
    pub fn update(&self, _pod: &PodTopologyView) {}
}

/// Augments `selector` with an equality per `match_label_keys` entry, using the
/// scheduled pod's own label values. Two pods whose plain selector is identical but
/// whose `matchLabelKeys` values differ land in distinct skew-count buckets, the way
/// a deployment revision label keeps successive rollouts from sharing one bucket.
fn effective_selector(selector: &LabelSelector, match_label_keys: &[String], pod_labels: &BTreeMap<String, String>) -> LabelSelector {
    if match_label_keys.is_empty() {
        return selector.clone();
    }
    let mut augmented = selector.clone();
    let mut match_labels = augmented.match_labels.unwrap_or_default();
    for key in match_label_keys {
        if let Some(value) = pod_labels.get(key) {
            match_labels.insert(key.clone(), value.clone());
        }
    }
    augmented.match_labels = Some(match_labels);
    augmented
}

/// Whether the pod described by `pod` tolerates `taint`, under the same
/// daemon/`PreferNoSchedule` exception the candidate-nodeclaim and existing-node
/// taint checks apply.
fn tolerates_taint(pod: &PodTopologyView, taint: &Taint) -> bool {
    if pod.is_daemon && taint.effect == "PreferNoSchedule" {
        return true;
    }
    crate::pod::tolerates(&pod.tolerations, &taint.key, taint.value.as_deref(), &taint.effect)
}

fn bump_pessimistic(
    groups: &mut BTreeMap<GroupKey, GroupState>,
    key: GroupKey,
    topology_key: &str,
    chosen_reqs: &RequirementSet,
) {
    let domain = chosen_reqs.get(topology_key).domain;
    let Domain::In(candidates) = &domain else {
        return;
    };
    if candidates.is_empty() {
        return;
    }
    let state = groups.entry(key).or_default();
    let target = candidates
        .iter()
        .min_by_key(|d| state.count(d))
        .expect("candidates checked non-empty above");
    state.bump(target);
}

#[cfg(test)]
mod test {
    use super::*;

    fn spread(key: &str, max_skew: i32) -> SpreadSpec {
        SpreadSpec {
            topology_key: key.to_string(),
            selector: LabelSelector::default(),
            namespace_scope: NamespaceScope::Same,
            max_skew,
            min_domains: None,
            when_unsatisfiable: WhenUnsatisfiable::DoNotSchedule,
            node_affinity_policy: NodeAffinityPolicy::Honor,
            node_taints_policy: NodeTaintsPolicy::Honor,
            match_label_keys: vec![],
        }
    }

    #[test]
    fn spread_picks_only_zones_within_skew() {
        let engine = TopologyEngine::new();
        let key = GroupKey::new(
            GroupKind::Spread,
            "zone",
            &LabelSelector::default(),
            NamespaceScope::Same,
            true,
        );
        engine.seed(key, "z1", 2);
        engine.seed(
            GroupKey::new(GroupKind::Spread, "zone", &LabelSelector::default(), NamespaceScope::Same, true),
            "z2",
            0,
        );

        let mut catalog = DomainCatalog::new();
        catalog.insert("zone", "z1");
        catalog.insert("zone", "z2");

        let pod = PodTopologyView {
            spreads: vec![spread("zone", 1)],
            ..Default::default()
        };

        let extra = engine.add_requirements(&pod, &RequirementSet::new(), &catalog).unwrap();
        assert_eq!(extra.get("zone").domain, Domain::single("z2"));
    }

    #[test]
    fn do_not_schedule_with_no_domains_is_infeasible() {
        let engine = TopologyEngine::new();
        let catalog = DomainCatalog::new();
        let pod = PodTopologyView {
            spreads: vec![spread("zone", 1)],
            ..Default::default()
        };
        let result = engine.add_requirements(&pod, &RequirementSet::new(), &catalog);
        assert!(matches!(result, Err(Error::TopologyInfeasible { .. })));
    }

    #[test]
    fn required_anti_affinity_forbids_occupied_domains() {
        let engine = TopologyEngine::new();
        let key = GroupKey::new(
            GroupKind::PodAntiAffinity,
            "zone",
            &LabelSelector::default(),
            NamespaceScope::Same,
            true,
        );
        engine.seed(key, "z1", 1);

        let pod = PodTopologyView {
            pod_anti_affinity_terms: vec![AffinityTerm {
                topology_key: "zone".to_string(),
                selector: LabelSelector::default(),
                namespace_scope: NamespaceScope::Same,
                required: true,
            }],
            ..Default::default()
        };

        let extra = engine.add_requirements(&pod, &RequirementSet::new(), &DomainCatalog::new()).unwrap();
        assert_eq!(extra.get("zone").domain, Domain::not_in(["z1".to_string()]));
    }
}
