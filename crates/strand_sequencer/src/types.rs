//! Shared identifier and status types.
//!
//! These are kept in a small, dependency-light module because they are used
//! by every layer: the activator, the sequencer registry, the epoch store,
//! and the configuration snapshots.

use serde::{Deserialize, Serialize};

/// Logical node identifier within the cluster.
pub type NodeId = u64;

/// Bit marking a log id as a metadata pseudo-log. Metadata logs carry epoch
/// metadata for their data log and never interact with the epoch store, so
/// the background activator must never see them.
const METADATA_LOG_BIT: u64 = 1 << 63;

/// 64-bit opaque log identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogId(pub u64);

impl LogId {
    pub fn is_metadata(self) -> bool {
        self.0 & METADATA_LOG_BIT != 0
    }

    /// The metadata pseudo-log paired with this data log.
    pub fn metadata_log(self) -> LogId {
        LogId(self.0 | METADATA_LOG_BIT)
    }
}

impl std::fmt::Display for LogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Epoch number separating sequencer incarnations for one log.
///
/// Epochs only grow. Running out of them is a terminal condition for the
/// log; reactivation stops two epochs short of the ceiling.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Epoch(pub u32);

pub const EPOCH_INVALID: Epoch = Epoch(0);
pub const EPOCH_MAX: Epoch = Epoch(u32::MAX);

impl Epoch {
    pub fn next(self) -> Epoch {
        Epoch(self.0 + 1)
    }

    pub fn is_valid(self) -> bool {
        self != EPOCH_INVALID
    }
}

impl std::fmt::Display for Epoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// Outcome domain shared by the activator and its collaborators.
///
/// Collaborator calls report one of these instead of a structured error;
/// the reconciler turns each into a scheduling decision (see
/// `activator::should_retry`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    /// Nothing to do; metadata already matches the configuration.
    Uptodate,
    /// An operation that will re-trigger reconciliation is already running.
    InProgress,
    /// The sequencer vanished or is no longer active.
    NoSequencer,
    /// The log is no longer in the cluster configuration.
    NotFound,
    /// Epoch numbers for the log are exhausted.
    TooBig,
    /// Metadata is unexpectedly empty.
    Empty,
    Failed,
    NoBufs,
    TooMany,
    NotConn,
    Access,
    SysLimit,
    /// A conditional epoch-store write lost to a higher epoch.
    Aborted,
    Shutdown,
    /// Internal invariant violation.
    Internal,
}

impl Status {
    pub fn name(self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::Uptodate => "up-to-date",
            Status::InProgress => "in-progress",
            Status::NoSequencer => "no-sequencer",
            Status::NotFound => "not-found",
            Status::TooBig => "too-big",
            Status::Empty => "empty",
            Status::Failed => "failed",
            Status::NoBufs => "no-bufs",
            Status::TooMany => "too-many",
            Status::NotConn => "not-conn",
            Status::Access => "access",
            Status::SysLimit => "sys-limit",
            Status::Aborted => "aborted",
            Status::Shutdown => "shutdown",
            Status::Internal => "internal",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
