pub mod config;
pub mod error;
pub mod existing_node;
pub mod filter;
pub mod instance_type;
pub mod node_pool;
pub mod nodeclaim;
pub mod pod;
pub mod provider;
pub mod quantity;
pub mod queue;
pub mod relax;
pub mod requirement;
pub mod reservation;
pub mod resources;
pub mod scheduler;
pub mod topology;

pub use crate::{
    config::SchedulerConfig,
    error::Error,
    provider::{CloudProvider, ClusterState, VolumeTopology},
    scheduler::{Results, Scheduler},
};

pub use ::k8s_openapi;
