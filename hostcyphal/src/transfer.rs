//! The transfer model shared by all transports

use std::time::SystemTime;

use crate::core::{DataSpecifier, NodeId, Priority, TransferId};
use crate::time::Instant;

/// Paired wall-clock and monotonic time of an event
///
/// Ingress transfers are stamped at the reception of their first frame. The monotonic half
/// orders events and drives deadlines; the wall-clock half anchors log correlation across
/// hosts and is never used for arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub system: SystemTime,
    pub monotonic: Instant,
}

impl Timestamp {
    pub fn now() -> Self {
        Self {
            system: SystemTime::now(),
            monotonic: Instant::now(),
        }
    }

    /// Reconstructs a capture-time stamp from a stored monotonic instant, back-dating the
    /// wall-clock half by the same distance.
    pub fn from_monotonic(monotonic: Instant) -> Self {
        let now = Self::now();
        let system = match now.monotonic.checked_duration_since(monotonic) {
            Some(age) => now
                .system
                .checked_sub(std::time::Duration::from_micros(age.as_micros()))
                .unwrap_or(now.system),
            None => now.system,
        };
        Self { system, monotonic }
    }
}

/// An egress transfer submitted to an output session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub priority: Priority,
    pub transfer_id: TransferId,
    pub payload: Vec<u8>,
}

/// An ingress transfer surfaced by an input session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFrom {
    pub timestamp: Timestamp,
    pub priority: Priority,
    pub transfer_id: TransferId,
    /// `None` for anonymous transfers.
    pub source_node_id: Option<NodeId>,
    pub payload: Vec<u8>,
}

/// Addressing of a transfer observed or injected outside the local node's own sessions
///
/// Unlike regular session specifiers, both endpoints are arbitrary: a capture may show two
/// remote nodes talking to each other, and a spoofed transfer may impersonate any of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlienSessionSpecifier {
    /// `None` represents an anonymous transfer.
    pub source_node_id: Option<NodeId>,
    /// `None` represents a broadcast transfer.
    pub destination_node_id: Option<NodeId>,
    pub data_specifier: DataSpecifier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlienTransferMetadata {
    pub priority: Priority,
    /// For outgoing transfers over transports with a cyclic transfer-ID the modulo is
    /// applied automatically.
    pub transfer_id: TransferId,
    pub session_specifier: AlienSessionSpecifier,
}

/// A captured, reconstructed, or spoofed transfer
///
/// This models diagnostics traffic: transfers between remote nodes, misaddressed transfers,
/// or fabricated ones. Normal communication uses [`Transfer`]/[`TransferFrom`] instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlienTransfer {
    pub metadata: AlienTransferMetadata,
    pub payload: Vec<u8>,
}
