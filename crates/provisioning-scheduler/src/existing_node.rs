//! ExistingNode adapter: wraps a live cluster node so the scheduler loop can try
//! admitting pods onto it the same way it tries a candidate nodeclaim, without
//! instance-type selection or reservation bookkeeping.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::Taint;

use crate::{
    error::Error,
    pod::{Pod, PodData},
    requirement::{Domain, Requirement, RequirementSet},
    resources::ResourceList,
    topology::{DomainCatalog, ExistingPodLabels, PodTopologyView, TopologyEngine},
};

pub const LABEL_HOSTNAME: &str = "kubernetes.io/hostname";

/// The ephemeral taint a cloud provider applies to a node before it finishes joining
/// the cluster; ignored for admission until the node is marked `initialized`.
pub const EPHEMERAL_NOT_READY_TAINT_KEY: &str = "node.kubernetes.io/not-ready";

#[derive(Clone, Debug)]
pub struct ExistingNode {
    pub host_name: String,
    pub provider_id: String,
    pub available: ResourceList,
    pub labels: BTreeMap<String, String>,
    pub taints: Vec<Taint>,
    pub requirements: RequirementSet,
    pub initialized: bool,
    pub host_ports: BTreeSet<(String, Option<String>, i32)>,
    pub volume_usage: BTreeMap<String, u32>,
    pub volume_limits: BTreeMap<String, u32>,
    /// Pods already running on this node, as reported by `ClusterState`; used only to
    /// seed the topology engine's group counts at the start of a `Solve`.
    pub existing_pods: Vec<ExistingPodLabels>,
}

impl ExistingNode {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        host_name: impl Into<String>,
        provider_id: impl Into<String>,
        capacity: ResourceList,
        daemon_set_requests: &ResourceList,
        labels: &BTreeMap<String, String>,
        taints: Vec<Taint>,
        initialized: bool,
        host_port_usage: BTreeSet<(String, Option<String>, i32)>,
        volume_usage: BTreeMap<String, u32>,
        volume_limits: BTreeMap<String, u32>,
        existing_pods: Vec<ExistingPodLabels>,
    ) -> Self {
        let host_name = host_name.into();
        let mut requirements = RequirementSet::new();
        for (key, value) in labels {
            requirements.add(key.clone(), Requirement::new(Domain::single(value.clone())));
        }
        requirements.add(LABEL_HOSTNAME, Requirement::new(Domain::single(host_name.clone())));

        ExistingNode {
            host_name,
            provider_id: provider_id.into(),
            available: capacity.saturating_sub(daemon_set_requests),
            labels: labels.clone(),
            taints,
            requirements,
            initialized,
            host_ports: host_port_usage,
            volume_usage,
            volume_limits,
            existing_pods,
        }
    }

    fn tolerable_taints(&self, pod: &Pod) -> impl Iterator<Item = &Taint> {
        self.taints.iter().filter(move |taint| {
            if taint.key == EPHEMERAL_NOT_READY_TAINT_KEY && !self.initialized {
                return false;
            }
            if pod.is_daemon && taint.effect == "PreferNoSchedule" {
                return false;
            }
            true
        })
    }

    /// Checks compatibility, host ports, and volumes the same way a candidate
    /// nodeclaim does, plus a resource-fit check against the node's cached available
    /// resources. No instance-type selection, no reservation step — an existing
    /// node already has a fixed machine type.
    pub fn can_add(
        &self,
        pod: &Pod,
        pod_data: &PodData,
        pod_topology: &PodTopologyView,
        topology: &TopologyEngine,
        catalog: &DomainCatalog,
    ) -> Result<RequirementSet, Error> {
        for taint in self.tolerable_taints(pod) {
            if !pod.tolerates(&taint.key, taint.value.as_deref(), &taint.effect) {
                return Err(Error::IncompatibleRequirements);
            }
        }

        for (protocol, host_ip, port) in &pod.host_ports {
            if self.host_ports.contains(&(protocol.clone(), host_ip.clone(), *port)) {
                return Err(Error::HostPortConflict {
                    protocol: protocol.clone(),
                    host_ip: host_ip.clone(),
                    port: *port,
                });
            }
        }

        for claim in &pod.volume_claims {
            let Some(driver) = &claim.driver else { continue };
            if let Some(&limit) = self.volume_limits.get(driver) {
                let used = self.volume_usage.get(driver).copied().unwrap_or(0);
                if used + 1 > limit {
                    return Err(Error::VolumeLimitExceeded { driver: driver.clone() });
                }
            }
        }

        let mut new_reqs = self.requirements.clone();
        if !new_reqs.add_all(&pod_data.requirements) {
            return Err(Error::IncompatibleRequirements);
        }

        let extra = topology.add_requirements(pod_topology, &new_reqs, catalog)?;
        if !new_reqs.add_all(&extra) {
            return Err(Error::IncompatibleRequirements);
        }

        if !self.available.fits(&pod_data.requests) {
            return Err(Error::InsufficientResources {
                kind: crate::error::FilterFailureKind::Resources,
            });
        }

        Ok(new_reqs)
    }

    /// `Add`: commits resources, host ports, volume usage, and topology for a pod
    /// already approved by [`Self::can_add`].
    pub fn add(
        &mut self,
        pod: &Pod,
        pod_data: &PodData,
        pod_topology: &PodTopologyView,
        new_reqs: &RequirementSet,
        topology: &TopologyEngine,
    ) {
        self.available = self.available.saturating_sub(&pod_data.requests);
        self.requirements = new_reqs.clone();
        for (protocol, host_ip, port) in &pod.host_ports {
            self.host_ports.insert((protocol.clone(), host_ip.clone(), *port));
        }
        for claim in &pod.volume_claims {
            if let Some(driver) = &claim.driver {
                *self.volume_usage.entry(driver.clone()).or_insert(0) += 1;
            }
        }
        topology.record(pod_topology, new_reqs);
    }
}

/// Sorts existing nodes initialized-first, then ascending by host name, so
/// concurrent evaluation still produces a deterministic winner on ties.
pub fn sort_existing_nodes(nodes: &mut [ExistingNode]) {
    nodes.sort_by(|a, b| {
        b.initialized
            .cmp(&a.initialized)
            .then_with(|| a.host_name.cmp(&b.host_name))
    });
}
