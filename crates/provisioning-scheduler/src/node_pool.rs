//! Node pool templates: the catalog of ways new nodes may be created.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Taint;

use crate::{instance_type::InstanceType, requirement::RequirementSet, resources::ResourceList};

/// Whether new nodeclaims from this pool pick their own instance type (`Dynamic`) or
/// defer that choice to the cloud provider at launch time (`Static`, e.g. a
/// replica-driven node group).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TemplateKind {
    Dynamic,
    Static,
}

#[derive(Clone, Debug)]
pub struct NodePool {
    pub name: String,
    pub weight: i32,
    pub requirements: RequirementSet,
    pub taints: Vec<Taint>,
    pub startup_taints: Vec<Taint>,
    pub labels: BTreeMap<String, String>,
    pub instance_types: Vec<InstanceType>,
    pub resource_limits: Option<ResourceList>,
    pub kind: TemplateKind,
}

/// A node-claim template derived from a [`NodePool`]: the requirement set every
/// nodeclaim built from this pool must satisfy.
#[derive(Clone, Debug)]
pub struct NodeClaimTemplate {
    pub pool_name: String,
    pub weight: i32,
    pub requirements: RequirementSet,
    pub taints: Vec<Taint>,
    pub startup_taints: Vec<Taint>,
    pub instance_types: Vec<InstanceType>,
    pub resource_limits: Option<ResourceList>,
    pub kind: TemplateKind,
}

impl NodeClaimTemplate {
    pub fn from_pool(pool: &NodePool) -> Self {
        NodeClaimTemplate {
            pool_name: pool.name.clone(),
            weight: pool.weight,
            requirements: pool.requirements.clone(),
            taints: pool.taints.clone(),
            startup_taints: pool.startup_taints.clone(),
            instance_types: pool.instance_types.clone(),
            resource_limits: pool.resource_limits.clone(),
            kind: pool.kind,
        }
    }
}

/// Sorts templates descending by weight, then ascending by pool name, so concurrent
/// evaluation still produces a deterministic winner on ties.
pub fn sort_templates(templates: &mut [NodeClaimTemplate]) {
    templates.sort_by(|a, b| b.weight.cmp(&a.weight).then_with(|| a.pool_name.cmp(&b.pool_name)));
}
