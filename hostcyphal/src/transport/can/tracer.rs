//! Transfer reconstruction from Cyphal/CAN capture streams

use std::collections::HashMap;

use crate::core::TransferId;
use crate::time::Duration;
use crate::transfer::{AlienSessionSpecifier, AlienTransfer, AlienTransferMetadata};
use crate::transport::can::format::{SOT_TOGGLE_BIT, TailByte};
use crate::transport::can::gather::Gather;
use crate::transport::capture::{
    CanCapture, Capture, ErrorTrace, Trace, Tracer, TransferReassemblyError, TransferTrace,
};

/// Reconstructs transfers from a chronologically ordered stream of CAN captures.
///
/// One reassembly state machine is kept per alien session (source, destination, data
/// specifier); anonymous frames are validated statelessly. Protocol errors surface as
/// [`Trace::Error`] events.
pub struct CanTracer {
    sessions: HashMap<AlienSessionSpecifier, Gather>,
    timeout: Duration,
    window: u64,
}

/// The tracer cannot know the subscribers' extents; it stores payloads up to the
/// protocol-wide practical maximum instead.
const TRACER_STORAGE_LIMIT: usize = 1024 * 1024;

impl CanTracer {
    pub fn new(timeout: Duration, window: u64) -> Self {
        Self {
            sessions: HashMap::new(),
            timeout,
            window,
        }
    }
}

impl Tracer for CanTracer {
    fn update(&mut self, capture: &Capture) -> Option<Trace> {
        let Capture::Can(CanCapture {
            timestamp, frame, ..
        }) = capture
        else {
            return None;
        };
        let session_specifier = AlienSessionSpecifier {
            source_node_id: frame.header.source,
            destination_node_id: frame.header.destination,
            data_specifier: frame.header.data_spec,
        };

        // Anonymous transfers are single-frame and stateless.
        if frame.header.source.is_none() {
            let (tail_byte, body) = frame.data.split_last()?;
            let tail = TailByte::from(*tail_byte);
            if tail.sot() && tail.eot() && tail.toggle() == SOT_TOGGLE_BIT {
                return Some(Trace::Transfer(TransferTrace {
                    timestamp: *timestamp,
                    transfer: AlienTransfer {
                        metadata: AlienTransferMetadata {
                            priority: frame.header.priority,
                            transfer_id: TransferId::new(u64::from(tail.transfer_id())),
                            session_specifier,
                        },
                        payload: body.to_vec(),
                    },
                }));
            }
            return Some(Trace::Error(ErrorTrace {
                timestamp: *timestamp,
                session_specifier: Some(session_specifier),
                error: TransferReassemblyError::ToggleMismatch,
            }));
        }

        let gather = self
            .sessions
            .entry(session_specifier)
            .or_insert_with(|| Gather::new(self.timeout, self.window, TRACER_STORAGE_LIMIT));
        let mut first_error = None;
        let gathered = gather.push_frame(&frame.data, frame.header.priority, *timestamp, |e| {
            first_error.get_or_insert(e);
        });

        if let Some(gathered) = gathered {
            return Some(Trace::Transfer(TransferTrace {
                timestamp: gathered.timestamp,
                transfer: AlienTransfer {
                    metadata: AlienTransferMetadata {
                        priority: gathered.priority,
                        transfer_id: TransferId::new(u64::from(gathered.transfer_id)),
                        session_specifier,
                    },
                    payload: gathered.payload,
                },
            }));
        }
        first_error.map(|error| {
            Trace::Error(ErrorTrace {
                timestamp: *timestamp,
                session_specifier: Some(session_specifier),
                error,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DataSpecifier, NodeId, Priority, SubjectId};
    use crate::time::Instant;
    use crate::transfer::Timestamp;
    use hostcyphal_driver::can::{Data, Frame, Header};

    fn capture(data: &[u8], at_us: u64) -> Capture {
        let header = Header {
            priority: Priority::Nominal,
            data_spec: DataSpecifier::Message(SubjectId::new(100).unwrap()),
            source: NodeId::new(7),
            destination: None,
        };
        Capture::Can(CanCapture {
            timestamp: Timestamp {
                system: std::time::SystemTime::UNIX_EPOCH,
                monotonic: Instant::MIN + Duration::from_micros(at_us),
            },
            direction: crate::transport::capture::Direction::Ingress,
            frame: Frame {
                header,
                data: Data::new(data).unwrap(),
                timestamp: Instant::MIN + Duration::from_micros(at_us),
                loop_back: false,
            },
        })
    }

    #[test]
    fn test_two_frame_transfer_plus_orphan() {
        let mut tracer = CanTracer::new(Duration::from_secs(2), 16);

        // Two valid frames of a two-frame transfer.
        assert!(tracer
            .update(&capture(&[0, 1, 2, 3, 4, 5, 6, 0b1010_0000 + 27], 10))
            .is_none());
        let trace = tracer
            .update(&capture(&[7, 0x17, 0x8d, 0b0100_0000 + 27], 20))
            .unwrap();
        let Trace::Transfer(transfer) = trace else {
            panic!("expected a transfer");
        };
        assert_eq!(transfer.transfer.payload, [0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(
            transfer.transfer.metadata.transfer_id,
            TransferId::new(27)
        );

        // A third frame with a mismatched toggle is an orphan.
        let trace = tracer
            .update(&capture(&[9, 9, 9, 0b0000_0000 + 28], 30))
            .unwrap();
        assert!(matches!(
            trace,
            Trace::Error(ErrorTrace {
                error: TransferReassemblyError::MissingFrames,
                ..
            })
        ));
    }
}
