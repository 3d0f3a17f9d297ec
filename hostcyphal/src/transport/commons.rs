//! Transfer (de)fragmentation shared by the high-overhead transports (UDP, serial)
//!
//! Unlike Cyphal/CAN, these transports carry an explicit frame index and a 64-bit
//! transfer-ID in every frame, which allows out-of-order reassembly: the first frame of a
//! transfer does not have to be received first, and the terminal frame does not have to be
//! received last. Out-of-order tolerance is what makes frame-level redundancy and plain IP
//! networks workable without a preliminary deduplication pass.
//!
//! A multi-frame transfer must not contain frames with empty payload. Every transfer,
//! single- or multi-frame, ends with the CRC-32C of its payload.

use crate::core::{NodeId, Priority, TransferId};
use crate::time::Duration;
use crate::transfer::{Timestamp, TransferFrom};
use crate::transport::capture::TransferReassemblyError;
use crate::transport::crc::TransferCrc32c;

/// A transport frame stripped of its transport-specific header envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HotFrame {
    pub priority: Priority,
    pub transfer_id: TransferId,
    pub index: u32,
    pub end_of_transfer: bool,
    pub payload: Vec<u8>,
}

impl HotFrame {
    pub(crate) fn single_frame_transfer(&self) -> bool {
        self.index == 0 && self.end_of_transfer
    }
}

/// Upper bound on the frame index accepted for reassembly. At the default UDP MTU this
/// admits transfers of tens of megabytes while keeping the fragment table bounded.
pub(crate) const FRAME_INDEX_LIMIT: u32 = 1 << 16;

/// Splits a transfer payload into frame payload windows.
///
/// The transfer CRC is appended after the payload and may occupy a frame of its own.
/// The returned windows are ordered; the last one is the end-of-transfer frame.
pub(crate) fn serialize_transfer(payload: &[u8], max_frame_payload: usize) -> Vec<Vec<u8>> {
    debug_assert!(max_frame_payload > TransferCrc32c::LENGTH);
    let crc = TransferCrc32c::new(payload).to_bytes();

    if payload.len() + crc.len() <= max_frame_payload {
        let mut single = Vec::with_capacity(payload.len() + crc.len());
        single.extend_from_slice(payload);
        single.extend_from_slice(&crc);
        return vec![single];
    }

    let mut suffixed = Vec::with_capacity(payload.len() + crc.len());
    suffixed.extend_from_slice(payload);
    suffixed.extend_from_slice(&crc);
    suffixed
        .chunks(max_frame_payload)
        .map(|chunk| chunk.to_vec())
        .collect()
}

/// Out-of-order tolerant transfer reassembly state machine.
///
/// One instance tracks one remote node over one data specifier. Anonymous transfers are
/// stateless and handled by [`Reassembler::construct_anonymous_transfer`] instead.
#[derive(Debug)]
pub(crate) struct Reassembler {
    source_node_id: NodeId,
    payloads: Vec<Option<Vec<u8>>>,
    max_index: Option<u32>,
    timestamp: Timestamp,
    transfer_id: TransferId,
}

impl Reassembler {
    pub(crate) fn new(source_node_id: NodeId) -> Self {
        Self {
            source_node_id,
            payloads: Vec::new(),
            max_index: None,
            timestamp: Timestamp {
                system: std::time::SystemTime::UNIX_EPOCH,
                monotonic: crate::time::Instant::MIN,
            },
            transfer_id: TransferId::SESSION_START,
        }
    }

    pub(crate) fn source_node_id(&self) -> NodeId {
        self.source_node_id
    }

    /// Updates the state machine with a new frame.
    ///
    /// Returns the finished transfer when the frame completed one. Protocol errors are
    /// reported through the callback and the affected transfer is discarded.
    pub(crate) fn process_frame(
        &mut self,
        timestamp: Timestamp,
        frame: &HotFrame,
        transfer_id_timeout: Duration,
        mut on_error: impl FnMut(TransferReassemblyError),
    ) -> Option<TransferFrom> {
        // A multi-frame transfer cannot contain frames without payload.
        if !frame.single_frame_transfer() && frame.payload.is_empty() {
            on_error(TransferReassemblyError::EmptyFrame);
            return None;
        }
        // Bound the reassembly storage; no legitimate transfer needs this many frames.
        if frame.index >= FRAME_INDEX_LIMIT {
            on_error(TransferReassemblyError::FrameIndexOutOfRange);
            return None;
        }

        // Either a newer transfer-ID or the transfer-ID timeout starts a new transfer.
        // Restarting only makes sense on a frame that can begin one (index zero), except
        // that out-of-order reception means any frame of a future transfer takes over.
        let is_future_transfer_id = frame.transfer_id.into_u64() > self.transfer_id.into_u64();
        let is_tid_timeout = frame.index == 0
            && frame.transfer_id != self.transfer_id
            && timestamp
                .monotonic
                .checked_duration_since(self.timestamp.monotonic)
                .is_some_and(|age| age > transfer_id_timeout);
        if is_future_transfer_id || is_tid_timeout {
            let interrupted = self.payloads.iter().any(Option::is_some);
            self.restart(
                frame.transfer_id,
                interrupted.then_some(TransferReassemblyError::MissingFrames),
                &mut on_error,
            );
        }
        if frame.transfer_id != self.transfer_id {
            on_error(TransferReassemblyError::UnexpectedTransferId);
            return None;
        }

        // Frame N with EOT followed by frame M with EOT, N != M, is unrecoverable.
        if frame.end_of_transfer {
            if let Some(max_index) = self.max_index {
                if max_index != frame.index {
                    self.restart(
                        self.transfer_id.next_modulo(TransferId::UNBOUNDED_MODULO),
                        Some(TransferReassemblyError::EotInconsistent),
                        &mut on_error,
                    );
                    return None;
                }
            }
            self.max_index = Some(frame.index);
        }

        // If EOT is set on index N, frames with index > N are invalid.
        if let Some(max_index) = self.max_index {
            let seen_past_end = self.payloads.len() as u32 > max_index + 1;
            if frame.index > max_index || seen_past_end {
                self.restart(
                    self.transfer_id.next_modulo(TransferId::UNBOUNDED_MODULO),
                    Some(TransferReassemblyError::EotMisplaced),
                    &mut on_error,
                );
                return None;
            }
        }

        // The transfer timestamp is the timestamp of its first frame.
        if frame.index == 0 {
            self.timestamp = timestamp;
        }

        // Duplicates are accepted, assuming they carry the same payload.
        while self.payloads.len() <= frame.index as usize {
            self.payloads.push(None);
        }
        self.payloads[frame.index as usize] = Some(frame.payload.clone());

        let max_index = self.max_index?;
        if max_index > 0 && self.payloads.iter().any(Option::is_none) {
            return None;
        }

        // All frames are received; validate and finalize.
        let mut whole: Vec<u8> = Vec::new();
        for fragment in self.payloads.iter().flatten() {
            whole.extend_from_slice(fragment);
        }
        let multi_frame = self.payloads.len() > 1;
        let size_ok = if multi_frame {
            whole.len() > TransferCrc32c::LENGTH
        } else {
            whole.len() >= TransferCrc32c::LENGTH
        };
        let crc_ok = TransferCrc32c::new(&whole).check_residue();

        let result = (size_ok && crc_ok).then(|| {
            whole.truncate(whole.len() - TransferCrc32c::LENGTH);
            TransferFrom {
                timestamp: self.timestamp,
                priority: frame.priority,
                transfer_id: self.transfer_id,
                source_node_id: Some(self.source_node_id),
                payload: whole,
            }
        });
        self.restart(
            self.transfer_id.next_modulo(TransferId::UNBOUNDED_MODULO),
            result.is_none().then_some(TransferReassemblyError::IntegrityError),
            &mut on_error,
        );
        result
    }

    fn restart(
        &mut self,
        transfer_id: TransferId,
        error: Option<TransferReassemblyError>,
        on_error: &mut impl FnMut(TransferReassemblyError),
    ) {
        if let Some(error) = error {
            on_error(error);
            log::debug!(
                "reassembler for node {} restarted at tid={}: {error:?}",
                u16::from(self.source_node_id),
                self.transfer_id.into_u64(),
            );
        }
        self.transfer_id = transfer_id;
        self.max_index = None;
        self.payloads.clear();
    }

    /// Validates a frame as an anonymous transfer and constructs it if valid.
    ///
    /// Anonymous transfers cannot be multi-frame, so they are stateless.
    pub(crate) fn construct_anonymous_transfer(
        timestamp: Timestamp,
        frame: &HotFrame,
    ) -> Option<TransferFrom> {
        if !frame.single_frame_transfer() {
            return None;
        }
        let size_ok = frame.payload.len() > TransferCrc32c::LENGTH;
        let crc_ok = TransferCrc32c::new(&frame.payload).check_residue();
        (size_ok && crc_ok).then(|| TransferFrom {
            timestamp,
            priority: frame.priority,
            transfer_id: frame.transfer_id,
            source_node_id: None,
            payload: frame.payload[..frame.payload.len() - TransferCrc32c::LENGTH].to_vec(),
        })
    }
}

/// Shared transfer-reconstruction state for UDP and serial tracers.
///
/// Keeps one [`Reassembler`] per alien session; anonymous frames are validated
/// statelessly.
pub(crate) struct HotTracerCore {
    sessions: std::collections::HashMap<crate::transfer::AlienSessionSpecifier, Reassembler>,
    transfer_id_timeout: Duration,
}

impl HotTracerCore {
    pub(crate) fn new(transfer_id_timeout: Duration) -> Self {
        Self {
            sessions: std::collections::HashMap::new(),
            transfer_id_timeout,
        }
    }

    pub(crate) fn update(
        &mut self,
        timestamp: Timestamp,
        session_specifier: crate::transfer::AlienSessionSpecifier,
        frame: &HotFrame,
    ) -> Option<crate::transport::capture::Trace> {
        use crate::transfer::{AlienTransfer, AlienTransferMetadata};
        use crate::transport::capture::{ErrorTrace, Trace, TransferTrace};

        let make_trace = |transfer: TransferFrom| {
            Trace::Transfer(TransferTrace {
                timestamp: transfer.timestamp,
                transfer: AlienTransfer {
                    metadata: AlienTransferMetadata {
                        priority: transfer.priority,
                        transfer_id: transfer.transfer_id,
                        session_specifier,
                    },
                    payload: transfer.payload,
                },
            })
        };

        let Some(source) = session_specifier.source_node_id else {
            return match Reassembler::construct_anonymous_transfer(timestamp, frame) {
                Some(transfer) => Some(make_trace(transfer)),
                None => Some(Trace::Error(ErrorTrace {
                    timestamp,
                    session_specifier: Some(session_specifier),
                    error: TransferReassemblyError::IntegrityError,
                })),
            };
        };

        let reassembler = self
            .sessions
            .entry(session_specifier)
            .or_insert_with(|| Reassembler::new(source));
        let mut first_error = None;
        let transfer = reassembler.process_frame(timestamp, frame, self.transfer_id_timeout, |e| {
            first_error.get_or_insert(e);
        });
        match transfer {
            Some(transfer) => Some(make_trace(transfer)),
            None => first_error.map(|error| {
                Trace::Error(ErrorTrace {
                    timestamp,
                    session_specifier: Some(session_specifier),
                    error,
                })
            }),
        }
    }
}
