//! The transport error taxonomy

use thiserror::Error;

/// Errors surfaced by transports and sessions
///
/// Reassembly problems are intentionally absent: they are reported through statistics and
/// tracers only and never raised to the user.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The deadline elapsed before the operation could complete. User-level, benign.
    #[error("the monotonic deadline has expired")]
    Timeout,

    /// Bad endpoint, invalid node-ID, conflicting port-ID. Raised at construction.
    #[error("invalid transport configuration: {0}")]
    InvalidConfiguration(String),

    /// The requested operation is not available on this platform or media.
    #[error("capability not supported: {0}")]
    UnsupportedCapability(String),

    /// Operation on a transport or session after close.
    #[error("the transport or session is closed")]
    ResourceClosed,

    /// The media refused the frames, or every redundant inferior errored.
    #[error("transmission failed: {0}")]
    SendFailed(String),

    /// The payload exceeds MTU times the maximum frame count of the session.
    #[error("payload of {payload_bytes} B exceeds the session limit of {limit_bytes} B")]
    PayloadTooLarge {
        payload_bytes: usize,
        limit_bytes: usize,
    },
}

impl From<hostcyphal_driver::link::LinkClosed> for TransportError {
    fn from(_: hostcyphal_driver::link::LinkClosed) -> Self {
        TransportError::ResourceClosed
    }
}
