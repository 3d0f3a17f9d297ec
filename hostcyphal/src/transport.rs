//! Transport abstraction and the concrete transports
//!
//! A transport converts between transfers and media frames. The presentation layer consumes
//! the [`Transport`] facade exclusively; the [`redundant`] pseudo-transport satisfies the
//! same facade by composing concrete transports.

use std::pin::Pin;

use crate::core::NodeId;
use crate::time::Instant;
use crate::transfer::AlienTransfer;

pub mod can;
pub mod capture;
pub(crate) mod commons;
pub mod crc;
pub mod error;
pub mod loopback;
pub mod redundant;
pub mod serial;
pub mod session;
pub mod udp;

pub use capture::{Capture, CaptureHandler, Direction, Trace, Tracer};
pub use error::TransportError;
pub use session::{
    InputSession, InputSessionSpecifier, OutputSession, OutputSessionSpecifier, PayloadMetadata,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn core::future::Future<Output = T> + Send + 'a>>;

/// Transfer-level properties of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolParameters {
    /// The modulo of the transfer-ID counter; [`crate::core::TransferId::UNBOUNDED_MODULO`]
    /// for transports whose 64-bit counter practically never overflows.
    pub transfer_id_modulo: u64,
    /// Number of distinct node-ID values, anonymous excluded.
    pub max_nodes: usize,
    /// The largest payload carried by a single frame.
    pub mtu: usize,
}

/// Aggregate transport counters, sampled atomically under the transport state lock
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStatistics {
    pub frames_in: u64,
    pub frames_out: u64,
    pub transfers_in: u64,
    pub transfers_out: u64,
    /// Frames that did not belong to any active session.
    pub frames_unrouted: u64,
    /// Reassembly failures: CRC mismatch, toggle/index errors, transfer-ID regressions.
    pub reassembly_errors: u64,
    /// Inbound transfers dropped because a session queue was full.
    pub queue_overflows: u64,
    /// Frames whose header failed validation (malformed, wrong version).
    pub frames_malformed: u64,
}

/// The transport facade
///
/// Implementations: [`can::CanTransport`], [`udp::UdpTransport`],
/// [`serial::SerialTransport`], [`redundant::RedundantTransport`],
/// [`loopback::LoopbackTransport`].
///
/// Closing a transport closes every session it owns; pending operations on those sessions
/// complete promptly with `ResourceClosed` or a nil result.
pub trait Transport: Send + Sync {
    fn protocol_parameters(&self) -> ProtocolParameters;

    /// `None` when the transport operates anonymously.
    fn local_node_id(&self) -> Option<NodeId>;

    /// Returns the input session for the specifier, creating it on first reference.
    ///
    /// For a given `(data_specifier, remote_node_id)` at most one session exists; repeated
    /// calls return handles to the same session state, and the payload metadata of the
    /// first creation wins.
    fn input_session(
        &self,
        specifier: InputSessionSpecifier,
        payload_metadata: PayloadMetadata,
    ) -> Result<InputSession, TransportError>;

    /// Returns the shared output session for the specifier, creating it on first reference.
    ///
    /// All ports sharing the specifier share the session and its transfer-ID counter.
    fn output_session(
        &self,
        specifier: OutputSessionSpecifier,
    ) -> Result<OutputSession, TransportError>;

    fn sample_statistics(&self) -> TransportStatistics;

    /// Starts delivery of capture records to the handler, one per frame observed.
    ///
    /// Handlers are invoked from the transport's I/O context and must not block. Capture
    /// cannot be stopped short of closing the transport.
    fn begin_capture(&self, handler: CaptureHandler);

    /// Injects a fully-formed transfer with arbitrary addressing.
    fn spoof<'a>(
        &'a self,
        transfer: &'a AlienTransfer,
        deadline: Instant,
    ) -> BoxFuture<'a, Result<(), TransportError>>;

    /// Constructs a stateful tracer that reconstructs transfers from a chronologically
    /// ordered stream of this transport's capture records.
    fn make_tracer(&self) -> Box<dyn Tracer>;

    /// Idempotent. Closes the media and every session owned by the transport.
    fn close(&self);
}
