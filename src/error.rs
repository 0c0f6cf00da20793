//! Error taxonomy for the outbound guard.
//!
//! Every failure a caller can observe is a [`GuardError`]. Each variant maps to an
//! [`ErrorKind`], whose [`ErrorKind::name`] is the stable name carried in events and
//! snapshots. Errors are `Clone` because one leader outcome is fanned out to every follower.
use crate::transport::TransportError;
use std::fmt;
use std::time::Duration;

/// Why an upstream attempt was declared failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The transport reported an error before any status was received.
    Transport(TransportError),
    /// The upstream answered with a status listed as retryable.
    Status(u16),
    /// The leader task went away without publishing an outcome.
    LeaderLost,
}

impl FailureReason {
    /// `true` when the failure says something about upstream health: transient transport
    /// errors. Status-based health is decided by the breaker's own status list.
    pub fn is_transport_transient(&self) -> bool {
        matches!(self, Self::Transport(e) if e.is_transient())
    }

    /// Short label used in retry notifications.
    pub fn label(&self) -> String {
        match self {
            Self::Transport(e) => e.name().to_string(),
            Self::Status(status) => format!("status {}", status),
            Self::LeaderLost => "leader lost".to_string(),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "{}", e),
            Self::Status(status) => write!(f, "upstream returned status {}", status),
            Self::LeaderLost => write!(f, "leader finished without an outcome"),
        }
    }
}

/// Unified error type for every guarded request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuardError {
    /// The admission queue was already full.
    #[error("admission queue full ({queued} queued, max {max_queue})")]
    Rejected { queued: usize, max_queue: usize },
    /// Waited longer than the enqueue timeout for an admission slot.
    #[error("waited {waited:?} for an admission slot (limit {limit:?})")]
    QueueTimeout { waited: Duration, limit: Duration },
    /// The circuit breaker is blocking traffic.
    #[error("circuit breaker open ({failures} consecutive failures, probe allowed in {retry_in:?})")]
    CircuitOpen { failures: usize, retry_in: Duration },
    /// The per-request deadline passed.
    #[error("request timed out after {elapsed:?} (limit: {timeout:?})")]
    Timeout { elapsed: Duration, timeout: Duration },
    /// The upstream kept failing after all retries.
    #[error("upstream failed after {attempts} attempt(s): {reason}")]
    Upstream { attempts: usize, reason: FailureReason },
    /// A follower stopped waiting for the leader's refresh.
    #[error("gave up after {waited:?} waiting for the in-flight refresh of {key}")]
    FollowerTimeout { key: String, waited: Duration },
    /// Too many followers were already attached to one in-flight refresh.
    #[error("too many waiters on {key} (max {max_waiters})")]
    Capacity { key: String, max_waiters: usize },
}

/// Field-less discriminant of [`GuardError`], used in events and snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorKind {
    Rejected,
    QueueTimeout,
    CircuitOpen,
    Timeout,
    Upstream,
    FollowerTimeout,
    Capacity,
}

impl ErrorKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Rejected => "RejectedError",
            Self::QueueTimeout => "QueueTimeoutError",
            Self::CircuitOpen => "CircuitOpenError",
            Self::Timeout => "TimeoutError",
            Self::Upstream => "UpstreamError",
            Self::FollowerTimeout => "FollowerTimeoutError",
            Self::Capacity => "CapacityError",
        }
    }

    /// Admission failures are reported as rejections rather than failures.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected | Self::QueueTimeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl GuardError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Rejected { .. } => ErrorKind::Rejected,
            Self::QueueTimeout { .. } => ErrorKind::QueueTimeout,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Upstream { .. } => ErrorKind::Upstream,
            Self::FollowerTimeout { .. } => ErrorKind::FollowerTimeout,
            Self::Capacity { .. } => ErrorKind::Capacity,
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }

    pub fn is_queue_timeout(&self) -> bool {
        matches!(self, Self::QueueTimeout { .. })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_upstream(&self) -> bool {
        matches!(self, Self::Upstream { .. })
    }

    pub fn is_follower_timeout(&self) -> bool {
        matches!(self, Self::FollowerTimeout { .. })
    }

    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::Capacity { .. })
    }

    /// `true` for an `Upstream` failure whose last try ran out of time.
    pub fn is_transport_timeout(&self) -> bool {
        matches!(
            self,
            Self::Upstream { reason: FailureReason::Transport(TransportError::Timeout(_)), .. }
        )
    }

    /// Reason of an `Upstream` failure, if this is one.
    pub fn upstream_reason(&self) -> Option<&FailureReason> {
        match self {
            Self::Upstream { reason, .. } => Some(reason),
            _ => None,
        }
    }
}
