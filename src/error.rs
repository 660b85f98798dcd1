//! Error types for shan

use thiserror::Error;

use crate::fabric::FabricError;

/// Result type for shan operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for setup and teardown operations.
///
/// Hot-path operations (`notify_or_write`, `test_recv`, `test_send` and the
/// wait loops) never return these: protocol violations there panic.
#[derive(Error, Debug)]
pub enum Error {
    /// MPI has already been initialized
    #[error("MPI has already been initialized")]
    AlreadyInitialized,

    /// MPI has not been initialized
    #[error("MPI has not been initialized")]
    NotInitialized,

    /// Invalid rank specified
    #[error("Invalid rank: {0}")]
    InvalidRank(i32),

    /// Invalid buffer provided
    #[error("Invalid buffer")]
    InvalidBuffer,

    /// Invalid count specified
    #[error("Invalid count: {0}")]
    InvalidCount(i64),

    /// A descriptor lists more elements than its type can hold
    #[error("{count} elements exceed capacity {capacity}")]
    ExceedsCapacity {
        /// Elements requested
        count: usize,
        /// Elements the type was sized for
        capacity: usize,
    },

    /// No segment or neighborhood is registered under this handle
    #[error("Invalid handle: {0}")]
    InvalidHandle(i32),

    /// The partner roster cannot be used to build a neighborhood
    #[error("Invalid neighbor roster: {0}")]
    InvalidRoster(String),

    /// A partner does not list this rank back
    #[error("Asymmetric neighbor roster: rank {rank} lists {partner}, which does not list it back")]
    AsymmetricRoster {
        /// Rank that lists the partner
        rank: i32,
        /// Partner missing the reciprocal entry
        partner: i32,
    },

    /// The neighborhood id exceeds what the fabric can bind
    #[error("Segment id {id} exceeds the fabric limit of {max} segments")]
    SegmentLimit {
        /// Requested segment id
        id: i32,
        /// Fabric segment limit
        max: u32,
    },

    /// The segment id is already bound on the fabric
    #[error("Segment id {0} is already in use")]
    SegmentInUse(i32),

    /// The fabric cannot provide enough notification slots
    #[error("Neighborhood needs {required} notifications, fabric provides {available}")]
    NotificationLimit {
        /// Slots needed by the neighborhood
        required: u64,
        /// Slots offered by the fabric
        available: u32,
    },

    /// Operating system error while creating or mapping shared memory
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Another rank of the node failed while setting up shared memory
    #[error("Shared segment setup failed on another rank: {0}")]
    PeerFailure(String),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// One-sided fabric failure
    #[error("Fabric error: {0}")]
    Fabric(#[from] FabricError),

    /// Operation not supported (e.g., a segment backend unavailable for a communicator)
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// MPI error with code
    #[error("MPI error (code {0})")]
    MpiError(i32),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check an MPI return code, returning Ok(()) for success.
    pub fn check(code: i32) -> Result<()> {
        if code == 0 {
            Ok(())
        } else {
            Err(Error::MpiError(code))
        }
    }
}

/// Unwraps results on paths where failure leaves the protocol in an
/// undefined state.
pub(crate) trait OrDie<T> {
    fn or_die(self, what: &str) -> T;
}

impl<T, E: std::fmt::Display> OrDie<T> for std::result::Result<T, E> {
    #[track_caller]
    fn or_die(self, what: &str) -> T {
        match self {
            Ok(value) => value,
            Err(err) => panic!("{what} failed: {err}"),
        }
    }
}
