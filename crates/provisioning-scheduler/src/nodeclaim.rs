//! Candidate NodeClaim: represents an as-yet-uncreated node built from one
//! node-pool template. Owns the running intersection of requirements, the pruned
//! instance-type list, and everything admitted so far.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::Taint;

use crate::{
    error::{Error, FilterFailureKind},
    filter::{self, FilterInput},
    instance_type::InstanceType,
    node_pool::{NodeClaimTemplate, TemplateKind},
    pod::{Pod, PodData},
    reservation::ReservationManager,
    requirement::RequirementSet,
    resources::ResourceList,
    topology::{DomainCatalog, PodTopologyView, TopologyEngine},
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReservedOfferingMode {
    Fallback,
    Strict,
}

/// The result of a successful [`CandidateNodeClaim::can_add`]: everything [`CandidateNodeClaim::add`]
/// needs to commit the pod without recomputing it.
pub struct CanAddOutcome {
    new_reqs: RequirementSet,
    new_its: Vec<InstanceType>,
    reserved_to_hold: Vec<String>,
    relaxed_min_values: BTreeMap<String, usize>,
}

#[derive(Clone, Debug)]
pub struct CandidateNodeClaim {
    pub claim_id: String,
    pub pool_name: String,
    pub weight: i32,
    pub kind: TemplateKind,
    pub taints: Vec<Taint>,
    pub startup_taints: Vec<Taint>,
    pub requirements: RequirementSet,
    pub instance_types: Vec<InstanceType>,
    pub resource_limits: Option<ResourceList>,
    pub daemon_overhead: ResourceList,
    pub accumulated: ResourceList,
    pub pods: Vec<String>,
    pub host_ports: BTreeSet<(String, Option<String>, i32)>,
    pub volume_usage: BTreeMap<String, u32>,
    pub volume_limits: BTreeMap<String, u32>,
    pub creation_index: u64,
}

impl CandidateNodeClaim {
    pub fn from_template(
        template: &NodeClaimTemplate,
        claim_id: impl Into<String>,
        creation_index: u64,
        daemon_overhead: ResourceList,
        volume_limits: BTreeMap<String, u32>,
    ) -> Self {
        CandidateNodeClaim {
            claim_id: claim_id.into(),
            pool_name: template.pool_name.clone(),
            weight: template.weight,
            kind: template.kind,
            taints: template.taints.clone(),
            startup_taints: template.startup_taints.clone(),
            requirements: template.requirements.clone(),
            instance_types: template.instance_types.clone(),
            resource_limits: template.resource_limits.clone(),
            daemon_overhead,
            accumulated: ResourceList::new(),
            pods: Vec::new(),
            host_ports: BTreeSet::new(),
            volume_usage: BTreeMap::new(),
            volume_limits,
            creation_index,
        }
    }

    pub fn pod_count(&self) -> usize {
        self.pods.len()
    }

    /// Checks whether this pod can join the candidate, aborting on the first
    /// failing step: compatibility, topology, host ports, volumes, resource fit,
    /// instance-type filtering, then reservation partitioning.
    #[allow(clippy::too_many_arguments)]
    pub fn can_add(
        &self,
        pod: &Pod,
        pod_data: &PodData,
        pod_topology: &PodTopologyView,
        allow_min_values_relaxation: bool,
        reservation_mode: ReservedOfferingMode,
        reservations: &ReservationManager,
        topology: &TopologyEngine,
        catalog: &DomainCatalog,
    ) -> Result<CanAddOutcome, Error> {
        self.check_taints(pod)?;
        self.check_volume_limits(pod)?;
        self.check_host_ports(pod)?;

        let mut new_reqs = self.requirements.clone();
        if !new_reqs.add_all(&pod_data.requirements) {
            return Err(Error::IncompatibleRequirements);
        }

        let extra = topology.add_requirements(pod_topology, &new_reqs, catalog)?;
        if !new_reqs.add_all(&extra) {
            return Err(Error::IncompatibleRequirements);
        }

        let filtered = filter::filter(FilterInput {
            instance_types: &self.instance_types,
            requirements: &new_reqs,
            requested: &pod_data.requests,
            daemon: &self.daemon_overhead,
            existing: &self.accumulated,
            allow_min_values_relaxation,
        })?;

        let (new_its, reserved_to_hold) =
            self.partition_reservations(filtered.instance_types, &new_reqs, reservation_mode, reservations)?;

        Ok(CanAddOutcome {
            new_reqs,
            new_its,
            reserved_to_hold,
            relaxed_min_values: filtered.relaxed_min_values,
        })
    }

    /// `Add`: commits the outcome of a prior `can_add` call.
    pub fn add(
        &mut self,
        pod: &Pod,
        pod_data: &PodData,
        pod_topology: &PodTopologyView,
        outcome: CanAddOutcome,
        reservations: &ReservationManager,
        topology: &TopologyEngine,
    ) -> Result<(), Error> {
        for id in &outcome.reserved_to_hold {
            reservations.reserve(&self.claim_id, id)?;
        }

        self.accumulated.add(&pod_data.requests);
        self.requirements = outcome.new_reqs.clone();
        self.instance_types = outcome.new_its;
        self.pods.push(pod.name.clone());

        for (protocol, host_ip, port) in &pod.host_ports {
            self.host_ports.insert((protocol.clone(), host_ip.clone(), *port));
        }
        for claim in &pod.volume_claims {
            if let Some(driver) = &claim.driver {
                *self.volume_usage.entry(driver.clone()).or_insert(0) += 1;
            }
        }

        topology.record(pod_topology, &outcome.new_reqs);
        Ok(())
    }

    /// `FinalizeScheduling`: truncates instance types ascending by minimum offering
    /// price, then re-checks that every `minValues` obligation still holds.
    pub fn finalize(&mut self, max_instance_types: usize) -> Result<(), Error> {
        filter::sort_by_price_ascending(&mut self.instance_types, &self.requirements);
        self.instance_types.truncate(max_instance_types);

        for (key, requirement) in self.requirements.iter() {
            let Some(min_values) = requirement.min_values else {
                continue;
            };
            let achievable: BTreeSet<String> = self
                .instance_types
                .iter()
                .flat_map(|it| it.compatible_offerings(&self.requirements).map(move |o| (it.name.as_str(), o)))
                .filter_map(|(it_name, o)| crate::filter::value_of_well_known_key(key, it_name, o))
                .collect();
            if achievable.len() < min_values {
                return Err(Error::MinValuesIncompatible {
                    kind: FilterFailureKind::MinValues,
                });
            }
        }
        Ok(())
    }

    fn check_taints(&self, pod: &Pod) -> Result<(), Error> {
        for taint in self.taints.iter().chain(&self.startup_taints) {
            if pod.is_daemon && taint.effect == "PreferNoSchedule" {
                continue;
            }
            if !pod.tolerates(&taint.key, taint.value.as_deref(), &taint.effect) {
                return Err(Error::IncompatibleRequirements);
            }
        }
        Ok(())
    }

    fn check_volume_limits(&self, pod: &Pod) -> Result<(), Error> {
        for claim in &pod.volume_claims {
            let Some(driver) = &claim.driver else { continue };
            if let Some(&limit) = self.volume_limits.get(driver) {
                let used = self.volume_usage.get(driver).copied().unwrap_or(0);
                if used + 1 > limit {
                    return Err(Error::VolumeLimitExceeded { driver: driver.clone() });
                }
            }
        }
        Ok(())
    }

    fn check_host_ports(&self, pod: &Pod) -> Result<(), Error> {
        for (protocol, host_ip, port) in &pod.host_ports {
            if self.host_ports.contains(&(protocol.clone(), host_ip.clone(), *port)) {
                return Err(Error::HostPortConflict {
                    protocol: protocol.clone(),
                    host_ip: host_ip.clone(),
                    port: *port,
                });
            }
        }
        Ok(())
    }

    /// Step 7: partitions the filtered instance-type list by reserved-offering
    /// availability. An IT whose only compatible offerings are reserved and
    /// exhausted is dropped; in `Strict` mode, losing every reserved offering that
    /// was available before this pod was considered is a hard failure.
    fn partition_reservations(
        &self,
        candidates: Vec<InstanceType>,
        new_reqs: &RequirementSet,
        mode: ReservedOfferingMode,
        reservations: &ReservationManager,
    ) -> Result<(Vec<InstanceType>, Vec<String>), Error> {
        let before_ids = reserved_ids_compatible(&self.instance_types, &self.requirements);

        let mut survivors = Vec::with_capacity(candidates.len());
        let mut reserved_to_hold = Vec::new();
        let mut after_ids = BTreeSet::new();

        for it in candidates {
            let reserved_offerings: Vec<_> = it
                .compatible_offerings(new_reqs)
                .filter(|o| o.is_reserved())
                .collect();

            if reserved_offerings.is_empty() {
                survivors.push(it);
                continue;
            }

            let reservable = reserved_offerings.iter().find(|o| {
                o.reservation_id
                    .as_deref()
                    .is_some_and(|id| reservations.can_reserve(&self.claim_id, id))
            });

            match reservable {
                Some(offering) => {
                    if let Some(id) = &offering.reservation_id {
                        after_ids.insert(id.clone());
                        reserved_to_hold.push(id.clone());
                    }
                    survivors.push(it);
                }
                None => {
                    // Every reserved offering on this IT is exhausted; it survives
                    // only if it also has a non-reserved, requirement-compatible
                    // offering to fall back on.
                    if it.compatible_offerings(new_reqs).any(|o| !o.is_reserved()) {
                        survivors.push(it);
                    }
                }
            }
        }

        if mode == ReservedOfferingMode::Strict && !before_ids.is_empty() && after_ids.is_empty() {
            return Err(Error::ReservedOffering);
        }

        if survivors.is_empty() {
            return Err(Error::InsufficientResources {
                kind: FilterFailureKind::Compatibility,
            });
        }

        reserved_to_hold.sort_unstable();
        reserved_to_hold.dedup();
        Ok((survivors, reserved_to_hold))
    }
}

fn reserved_ids_compatible(instance_types: &[InstanceType], reqs: &RequirementSet) -> BTreeSet<String> {
    instance_types
        .iter()
        .flat_map(|it| it.compatible_offerings(reqs))
        .filter(|o| o.is_reserved())
        .filter_map(|o| o.reservation_id.clone())
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        instance_type::{CapacityType, Offering},
        resources::CPU,
    };

    fn template() -> NodeClaimTemplate {
        NodeClaimTemplate {
            pool_name: "default".to_string(),
            weight: 10,
            requirements: RequirementSet::new(),
            taints: vec![],
            startup_taints: vec![],
            instance_types: vec![InstanceType {
                name: "m5.large".to_string(),
                capacity: [(CPU.to_string(), crate::quantity::Quantity::from(4.0))]
                    .into_iter()
                    .collect(),
                overhead: ResourceList::new(),
                offerings: vec![Offering {
                    capacity_type: CapacityType::OnDemand,
                    zone: "z1".to_string(),
                    reservation_id: None,
                    reservation_capacity: None,
                    price: 1.0,
                    available: true,
                    requirements: RequirementSet::new(),
                }],
            }],
            resource_limits: None,
            kind: TemplateKind::Dynamic,
        }
    }

    fn empty_pod() -> Pod {
        Pod {
            name: "p".into(),
            namespace: "default".into(),
            labels: BTreeMap::new(),
            node_selector: BTreeMap::new(),
            affinity: crate::pod::PodAffinityRules::default(),
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
    fn host_port_conflict_rejects_second_pod() {
        let claim = CandidateNodeClaim::from_template(&template(), "claim-1", 0, ResourceList::new(), BTreeMap::new());
        let mut pod = empty_pod();
        pod.host_ports.push(("TCP".to_string(), None, 8080));
        let pod_data = PodData::derive(&pod, &RequirementSet::new());
        let topology_view = PodTopologyView::default();
        let reservations = ReservationManager::new();
        let topology = TopologyEngine::new();
        let catalog = DomainCatalog::new();

        let outcome = claim
            .can_add(
                &pod,
                &pod_data,
                &topology_view,
                true,
                ReservedOfferingMode::Fallback,
                &reservations,
                &topology,
                &catalog,
            )
            .unwrap();

        let mut claim = claim;
        claim
            .add(&pod, &pod_data, &topology_view, outcome, &reservations, &topology)
            .unwrap();

        let result = claim.can_add(
            &pod,
            &pod_data,
            &topology_view,
            true,
            ReservedOfferingMode::Fallback,
            &reservations,
            &topology,
            &catalog,
        );
        assert!(matches!(result, Err(Error::HostPortConflict { .. })));
    }
}
