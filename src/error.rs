//! Error types for madwave
//!
//! Per the design notes, failures split into three kinds: bad configuration
//! detected at construction, invariant breakage detected at the next fence,
//! and contract/transport violations that are not meant to be recovered from
//! and instead go through [`abort_fatal`].

use thiserror::Error;

/// Errors surfaced to callers of the public API.
///
/// Only configuration mistakes and fence-time invariant failures are
/// represented here; everything else is a contract violation handled by
/// [`abort_fatal`].
#[derive(Debug, Error)]
pub enum CoreError {
    /// A factory option was out of its valid domain.
    #[error("invalid configuration: {field} - {reason}")]
    InvalidConfig {
        /// Name of the offending field.
        field: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// A global invariant did not hold at a fence boundary.
    #[error("invariant violated at fence: {0}")]
    InvariantViolation(String),

    /// The reliable messaging layer could not be reached.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Errors from the [`crate::transport`] collaborator.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The destination rank does not exist in this world.
    #[error("no such peer: {0}")]
    NoSuchPeer(usize),

    /// The transport's channel was closed (peer gone / world torn down).
    #[error("channel closed to peer {0}")]
    ChannelClosed(usize),
}

/// Errors from the reliable messaging layer.
#[derive(Debug, Error)]
pub enum RmlError {
    /// The out-of-order parking queue for a peer overflowed. Fatal per
    /// spec: the caller should route this to [`abort_fatal`].
    #[error("out-of-order queue overflow for peer {0}")]
    QueueOverflow(usize),

    /// A receive or huge-message buffer could not be allocated. Fatal.
    #[error("allocation failure for {0} bytes")]
    AllocationFailure(usize),

    /// Payload exceeds `MAX_MSG_LEN` but was submitted on the eager path.
    #[error("payload of {0} bytes exceeds eager buffer; use huge protocol")]
    PayloadTooLarge(usize),

    /// Underlying transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Abort the process on a contract violation.
///
/// Spec §7: contract violations (illegal `k`, inconsistent tensor shapes,
/// missing expected node after a fence, out-of-order queue overflow) and
/// transport/allocation failures are fatal — log with location, then abort.
/// There is no automatic retry and no recoverable `Result` path for these.
#[macro_export]
macro_rules! abort_fatal {
    ($($arg:tt)*) => {{
        tracing::error!(
            target: "madwave::fatal",
            location = %format!("{}:{}", file!(), line!()),
            message = %format!($($arg)*),
        );
        std::process::abort();
    }};
}
