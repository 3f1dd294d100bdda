//! The crate's error taxonomy, implemented as a `snafu`-derived enum with one
//! variant per distinct failure so callers can match on it instead of parsing
//! display strings.

use snafu::Snafu;

/// Why an instance-type filter pass rejected every candidate instance type.
#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
pub enum FilterFailureKind {
    #[snafu(display("no offering of any candidate instance type is compatible with the node's requirements"))]
    Compatibility,
    #[snafu(display("no candidate instance type has capacity for the requested, daemon, and already-admitted resources"))]
    Resources,
    #[snafu(display("filtering would leave fewer distinct values than a requirement's minValues demands"))]
    MinValues,
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("pod's requirements are incompatible with this node/nodeclaim"))]
    IncompatibleRequirements,

    #[snafu(display("no instance type has capacity for this pod: {kind}"))]
    InsufficientResources { kind: FilterFailureKind },

    #[snafu(display("host port {port} ({protocol}) on {host_ip:?} is already claimed on this node"))]
    HostPortConflict {
        protocol: String,
        host_ip: Option<String>,
        port: i32,
    },

    #[snafu(display("pod would exceed the volume limit for driver {driver:?}"))]
    VolumeLimitExceeded { driver: String },

    #[snafu(display("topology constraint cannot be satisfied: {reason}"))]
    TopologyInfeasible { reason: String },

    #[snafu(display("{kind}"))]
    MinValuesIncompatible { kind: FilterFailureKind },

    #[snafu(display("adding this pod would consume the last reserved offering available to it"))]
    ReservedOffering,

    #[snafu(display("pod has resource-claim requirements, which are disabled by configuration"))]
    ResourceClaimUnsupported,

    #[snafu(display("every node pool was pre-filtered to an empty candidate list"))]
    NoTemplates,

    #[snafu(display("scheduling deadline exceeded with pods still queued"))]
    DeadlineExceeded,

    #[snafu(display("reservation ledger corrupted: {detail}"))]
    ReservationLedgerCorrupted { detail: String },
}

impl Error {
    /// Whether the scheduler loop should attempt [`crate::relax::relax`] before
    /// retrying this pod.
    pub fn is_relaxable(&self) -> bool {
        !matches!(self, Error::ReservedOffering | Error::ResourceClaimUnsupported)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
