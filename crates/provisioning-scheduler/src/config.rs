//! Scheduler configuration.

use std::{num::NonZeroUsize, time::Duration};

pub use crate::nodeclaim::ReservedOfferingMode;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub enum PreferencePolicy {
    #[default]
    Respect,
    Ignore,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub enum MinValuesPolicy {
    #[default]
    BestEffort,
    Strict,
}

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub reserved_offering_mode: ReservedOfferingMode,
    pub preference_policy: PreferencePolicy,
    pub min_values_policy: MinValuesPolicy,
    /// Worker count bounding each of the two fan-outs (existing-node scan,
    /// candidate/template scan).
    pub num_concurrent_reconciles: NonZeroUsize,
    /// Per-nodeclaim instance-type truncation applied at `FinalizeScheduling`.
    pub max_instance_types: usize,
    pub deadline: Duration,
    /// When set, pods carrying resource-claim requirements are rejected outright
    /// instead of scheduled.
    pub ignore_resource_claim_requests: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            reserved_offering_mode: ReservedOfferingMode::Fallback,
            preference_policy: PreferencePolicy::Respect,
            min_values_policy: MinValuesPolicy::BestEffort,
            num_concurrent_reconciles: NonZeroUsize::new(10).unwrap_or(NonZeroUsize::MIN),
            max_instance_types: 60,
            deadline: Duration::from_secs(10),
            ignore_resource_claim_requests: false,
        }
    }
}
