//! Sideband monitoring and transfer-level reconstruction
//!
//! Capture delivers one opaque record per frame observed by a transport, including frames
//! not addressed to the local node where the media supports promiscuous operation, and the
//! transport's own emissions. A [`Tracer`] folds a chronologically ordered capture stream
//! back into transfers, which enables both live sniffing and offline log analysis.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::transfer::{AlienSessionSpecifier, AlienTransfer, Timestamp};

/// Which way the captured frame was travelling relative to the capturing transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ingress,
    Egress,
}

/// One captured event. The variant identifies the transport kind that produced it.
#[derive(Debug, Clone)]
pub enum Capture {
    Can(CanCapture),
    Udp(UdpCapture),
    Serial(SerialCapture),
    Loopback(LoopbackCapture),
}

impl Capture {
    pub fn timestamp(&self) -> Timestamp {
        match self {
            Capture::Can(c) => c.timestamp,
            Capture::Udp(c) => c.timestamp,
            Capture::Serial(c) => c.timestamp,
            Capture::Loopback(c) => c.timestamp,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CanCapture {
    pub timestamp: Timestamp,
    pub direction: Direction,
    pub frame: hostcyphal_driver::can::Frame,
}

#[derive(Debug, Clone)]
pub struct UdpCapture {
    pub timestamp: Timestamp,
    pub direction: Direction,
    pub frame: super::udp::wire::UdpFrame,
}

#[derive(Debug, Clone)]
pub struct SerialCapture {
    pub timestamp: Timestamp,
    pub direction: Direction,
    pub frame: super::serial::wire::SerialFrame,
}

/// The loopback transport has no frames; its captures carry whole transfers.
#[derive(Debug, Clone)]
pub struct LoopbackCapture {
    pub timestamp: Timestamp,
    pub transfer: AlienTransfer,
}

/// Invoked from the transport's I/O context; must not block.
pub type CaptureHandler = Arc<dyn Fn(&Capture) + Send + Sync>;

/// Protocol error states encountered during transfer reconstruction.
///
/// These are never raised to the user; they reach the surface only through statistics
/// counters and [`Trace::Error`] events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferReassemblyError {
    /// The reassembled payload did not pass its integrity check.
    IntegrityError,
    /// The transfer-ID of a frame does not match the anticipated value.
    UnexpectedTransferId,
    /// A new transfer started before the old one could be completed.
    MissingFrames,
    /// A frame without payload arrived as part of a multi-frame transfer.
    EmptyFrame,
    /// The end-of-transfer flag is set on frame N while frames past N exist.
    EotMisplaced,
    /// Two frames of one transfer both claim to be terminal, at different indexes.
    EotInconsistent,
    /// A CAN frame broke the toggle bit alternation.
    ToggleMismatch,
    /// The frame index exceeds the implementation limit; the transfer cannot be stored.
    FrameIndexOutOfRange,
}

/// Output of a [`Tracer`]
#[derive(Debug, Clone)]
pub enum Trace {
    Transfer(TransferTrace),
    Error(ErrorTrace),
}

#[derive(Debug, Clone)]
pub struct TransferTrace {
    pub timestamp: Timestamp,
    pub transfer: AlienTransfer,
}

#[derive(Debug, Clone)]
pub struct ErrorTrace {
    pub timestamp: Timestamp,
    /// The session the offending frame belonged to, when it could be determined.
    pub session_specifier: Option<AlienSessionSpecifier>,
    pub error: TransferReassemblyError,
}

/// Reconstructs transfers from a chronologically ordered capture stream.
///
/// A tracer is stateful and single-use; captures from unrelated transports are ignored.
pub trait Tracer: Send {
    fn update(&mut self, capture: &Capture) -> Option<Trace>;
}

/// Handler fan-out shared by the transports.
pub(crate) struct CaptureRegistry {
    active: AtomicBool,
    handlers: Mutex<Vec<CaptureHandler>>,
}

impl CaptureRegistry {
    pub(crate) fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            handlers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn add(&self, handler: CaptureHandler) {
        self.handlers.lock().push(handler);
        self.active.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Builds the record only when at least one handler is attached.
    pub(crate) fn emit(&self, make: impl FnOnce() -> Capture) {
        if !self.is_active() {
            return;
        }
        let capture = make();
        for handler in self.handlers.lock().iter() {
            handler(&capture);
        }
    }
}
