//! Transfer reception state machine for Cyphal/CAN
//!
//! One instance tracks one source node over one data specifier. The rules follow the
//! specification where it is unambiguous and the reference implementations where it is not:
//!
//! 1. A frame with empty data is ignored: without a tail byte it has no transfer-ID and
//!    cannot participate in reassembly.
//! 2. A start-of-transfer frame begins a new buffer and requires the toggle bit to be 1;
//!    an unfinished reassembly in progress at that point is discarded.
//! 3. Subsequent frames must alternate the toggle; the first mismatch (including an exact
//!    duplicate) discards the partial transfer. Transfer-level redundancy is handled by the
//!    deduplicator upstairs, not by tolerating repeated frames here.
//! 4. The terminal frame carries the CRC-16 of the payload (single-frame transfers carry
//!    none); a residue mismatch discards the transfer.
//! 5. A partial transfer whose frames are separated by more than the gap timeout is
//!    discarded.
//! 6. A start frame whose transfer-ID is not ahead of the last accepted one by 1..=window
//!    increments is rejected: zero distance is a duplicate, beyond the window is a replay
//!    of an old value. The window defaults to half the modulo and is configurable; after
//!    the gap timeout any transfer-ID is accepted (the node may have restarted).
//! 7. The transfer priority and payload bytes beyond the storage limit follow the terminal
//!    frame and the implicit truncation rule respectively; truncated bytes still
//!    participate in the CRC.

use crate::core::{Priority, TransferId};
use crate::time::{Duration, Instant};
use crate::transfer::Timestamp;
use crate::transport::can::format::{SOT_TOGGLE_BIT, TailByte, TRANSFER_ID_MODULO};
use crate::transport::capture::TransferReassemblyError;
use crate::transport::crc::TransferCrc16;

/// A reassembled transfer, not yet attributed to a source (the caller keys instances by
/// source and data specifier).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct GatheredTransfer {
    pub timestamp: Timestamp,
    pub priority: Priority,
    pub transfer_id: u8,
    pub payload: Vec<u8>,
}

enum State {
    Idle,
    Assembling {
        transfer_id: u8,
        toggle: bool,
        started: Timestamp,
        last_frame: Instant,
        stored: Vec<u8>,
        total_length: usize,
        crc: TransferCrc16,
    },
}

pub(crate) struct Gather {
    state: State,
    /// Transfer-ID and monotonic time of the last accepted transfer.
    last_accepted: Option<(u8, Instant)>,
    /// Gap timeout; also bounds the duplicate-rejection memory.
    timeout: Duration,
    /// Transfer-ID acceptance window, in increments ahead of the last accepted value.
    window: u64,
    /// Storage limit for the reassembled payload (the extent); the CRC still covers
    /// everything beyond it.
    storage_limit: usize,
}

impl Gather {
    pub(crate) fn new(timeout: Duration, window: u64, storage_limit: usize) -> Self {
        Self {
            state: State::Idle,
            last_accepted: None,
            timeout,
            window,
            storage_limit,
        }
    }

    /// The monotonic time of the most recent activity, for idle-state garbage collection.
    pub(crate) fn last_activity(&self) -> Option<Instant> {
        match &self.state {
            State::Assembling { last_frame, .. } => Some(*last_frame),
            State::Idle => self.last_accepted.map(|(_, at)| at),
        }
    }

    pub(crate) fn push_frame(
        &mut self,
        data: &[u8],
        priority: Priority,
        timestamp: Timestamp,
        mut on_error: impl FnMut(TransferReassemblyError),
    ) -> Option<GatheredTransfer> {
        // R1: a frame without data carries no tail byte.
        let (tail_byte, body) = data.split_last()?;
        let tail = TailByte::from(*tail_byte);
        let now = timestamp.monotonic;

        // R5: expire a stale partial transfer before interpreting the new frame.
        if let State::Assembling { last_frame, .. } = &self.state {
            if now
                .checked_duration_since(*last_frame)
                .is_some_and(|age| age > self.timeout)
            {
                on_error(TransferReassemblyError::MissingFrames);
                self.state = State::Idle;
            }
        }
        // Duplicate rejection memory also expires with the gap timeout.
        if let Some((_, accepted_at)) = self.last_accepted {
            if now
                .checked_duration_since(accepted_at)
                .is_some_and(|age| age > self.timeout)
            {
                self.last_accepted = None;
            }
        }

        if tail.sot() {
            if tail.toggle() != SOT_TOGGLE_BIT {
                // R2: clear format error; the remainder of the transfer is meaningless.
                if matches!(self.state, State::Assembling { .. }) {
                    self.state = State::Idle;
                }
                on_error(TransferReassemblyError::ToggleMismatch);
                return None;
            }
            if matches!(self.state, State::Assembling { .. }) {
                on_error(TransferReassemblyError::MissingFrames);
                self.state = State::Idle;
            }
            // R6: the transfer-ID window.
            if let Some((last, _)) = self.last_accepted {
                let distance = TransferId::new(u64::from(last))
                    .forward_distance(TransferId::new(u64::from(tail.transfer_id())), TRANSFER_ID_MODULO);
                if distance == 0 || distance > self.window {
                    on_error(TransferReassemblyError::UnexpectedTransferId);
                    return None;
                }
            }

            if tail.eot() {
                // Single-frame transfer, no CRC.
                self.last_accepted = Some((tail.transfer_id(), now));
                let mut payload = body.to_vec();
                payload.truncate(self.storage_limit);
                return Some(GatheredTransfer {
                    timestamp,
                    priority,
                    transfer_id: tail.transfer_id(),
                    payload,
                });
            }

            let mut stored = Vec::new();
            stored.extend_from_slice(&body[..body.len().min(self.storage_limit)]);
            self.state = State::Assembling {
                transfer_id: tail.transfer_id(),
                toggle: SOT_TOGGLE_BIT,
                started: timestamp,
                last_frame: now,
                stored,
                total_length: body.len(),
                crc: TransferCrc16::new(body),
            };
            return None;
        }

        // Continuation frames.
        let State::Assembling {
            transfer_id,
            toggle,
            started,
            last_frame,
            stored,
            total_length,
            crc,
        } = &mut self.state
        else {
            // A continuation without a start: the head of the transfer is missing.
            on_error(TransferReassemblyError::MissingFrames);
            return None;
        };

        if tail.transfer_id() != *transfer_id {
            on_error(TransferReassemblyError::UnexpectedTransferId);
            self.state = State::Idle;
            return None;
        }
        if tail.toggle() == *toggle {
            // R3: duplicate or missing frame.
            on_error(TransferReassemblyError::ToggleMismatch);
            self.state = State::Idle;
            return None;
        }
        if body.is_empty() {
            on_error(TransferReassemblyError::EmptyFrame);
            self.state = State::Idle;
            return None;
        }

        *toggle = tail.toggle();
        *last_frame = now;
        let spare = self.storage_limit.saturating_sub(stored.len());
        stored.extend_from_slice(&body[..body.len().min(spare + TransferCrc16::LENGTH)]);
        *total_length += body.len();
        crc.add_bytes(body);

        if !tail.eot() {
            return None;
        }

        // R4: terminal frame; verify the transfer CRC and strip it.
        let complete = crc.check_residue() && *total_length >= TransferCrc16::LENGTH;
        let result = complete.then(|| {
            let payload_length = (*total_length - TransferCrc16::LENGTH)
                .min(stored.len())
                .min(self.storage_limit);
            let mut payload = core::mem::take(stored);
            payload.truncate(payload_length);
            GatheredTransfer {
                timestamp: *started,
                priority,
                transfer_id: *transfer_id,
                payload,
            }
        });
        if result.is_some() {
            self.last_accepted = Some((*transfer_id, now));
        } else {
            on_error(TransferReassemblyError::IntegrityError);
        }
        self.state = State::Idle;
        result
    }
}
