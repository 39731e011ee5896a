use thiserror::Error;

/// Errors returned by the scheduling core to the command layer. None of
/// these are fatal to the process; the protocol layer translates each into
/// a client-visible response.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum Error {
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    /// A delete was attempted on a job that is ready or delayed. Jobs must
    /// be reserved (or buried) before they can be deleted.
    #[error("job {0} cannot be deleted in its current state")]
    InvalidDeletion(u64),

    #[error("job {0} is not reserved")]
    NotReserved(u64),

    #[error("no job with id {0}")]
    NotFound(u64),

    #[error("tube is at its limit of {0} jobs")]
    CapacityExceeded(usize),

    /// A reserve deadline elapsed with no job becoming available.
    #[error("timed out waiting for a job")]
    TimedOut,
}

pub type Result<T> = std::result::Result<T, Error>;
