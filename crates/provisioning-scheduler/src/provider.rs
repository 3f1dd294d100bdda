//! External collaborators: the scheduler core consumes these traits but never
//! implements them against a live cluster or cloud API — that wiring lives outside
//! this crate.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Taint;

use crate::{
    instance_type::InstanceType, pod::Pod, requirement::RequirementSet, resources::ResourceList,
    topology::ExistingPodLabels,
};

/// Reports the machine-type catalog for a node pool. Stable within one `Solve` call.
#[async_trait::async_trait]
pub trait CloudProvider: Send + Sync {
    async fn instance_types_for(&self, node_pool_name: &str) -> crate::error::Result<Vec<InstanceType>>;
}

/// A live cluster node, as reported by [`ClusterState::existing_nodes`].
#[derive(Clone, Debug)]
pub struct StateNode {
    pub host_name: String,
    pub provider_id: String,
    pub capacity: ResourceList,
    pub daemon_set_requests: ResourceList,
    pub labels: BTreeMap<String, String>,
    pub taints: Vec<Taint>,
    pub initialized: bool,
    pub host_port_usage: Vec<(String, Option<String>, i32)>,
    pub volume_usage: BTreeMap<String, u32>,
    /// Pods already running on this node, used to seed the topology engine's group
    /// counts so required pod-affinity/anti-affinity against the existing cluster is
    /// enforced from the first `Solve` iteration, not only among pods in this batch.
    pub existing_pods: Vec<ExistingPodLabels>,
}

#[async_trait::async_trait]
pub trait ClusterState: Send + Sync {
    async fn existing_nodes(&self) -> crate::error::Result<Vec<StateNode>>;

    /// Signals that pods on the node at `provider_id` are candidates for
    /// rescheduling (e.g. the node is draining). Consulted by callers outside this
    /// crate's `Solve`; the scheduler core itself only reads `existing_nodes`.
    async fn mark_for_deletion(&self, provider_id: &str) -> crate::error::Result<()>;
}

/// Derives additional node-selector requirements for a pod from its PVCs/PVs (e.g.
/// zone or region restriction implied by the volumes it claims).
#[async_trait::async_trait]
pub trait VolumeTopology: Send + Sync {
    async fn requirements_for(&self, pod: &Pod) -> crate::error::Result<RequirementSet>;
}
