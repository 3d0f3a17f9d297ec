//! Loopback transport
//!
//! Connects a node to itself: every emitted transfer is delivered straight into the
//! matching local input sessions, with no media and no frames. Useful for presentation
//! layer tests, dry-runs of application components, and as a stand-in inferior for
//! redundancy experiments. The protocol parameters (MTU, transfer-ID modulo) are
//! configurable so the loopback can mimic any concrete transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::core::{DataSpecifier, NodeId, TransferId};
use crate::time::Instant;
use crate::transfer::{
    AlienSessionSpecifier, AlienTransfer, AlienTransferMetadata, Timestamp, Transfer,
    TransferFrom,
};
use crate::transport::capture::{
    Capture, CaptureHandler, CaptureRegistry, LoopbackCapture, Trace, Tracer, TransferTrace,
};
use crate::transport::error::TransportError;
use crate::transport::session::{
    InputQueue, InputSession, InputSessionSpecifier, OutputRoute, OutputSession,
    OutputSessionSpecifier, PayloadMetadata, INPUT_QUEUE_DEPTH,
};
use crate::transport::{BoxFuture, ProtocolParameters, Transport, TransportStatistics};

#[derive(Debug, Clone)]
pub struct LoopbackTransportOptions {
    pub local_node_id: Option<NodeId>,
    pub mtu: usize,
    pub transfer_id_modulo: u64,
}

impl Default for LoopbackTransportOptions {
    fn default() -> Self {
        Self {
            local_node_id: None,
            mtu: 1024,
            transfer_id_modulo: TransferId::UNBOUNDED_MODULO,
        }
    }
}

struct InputEntry {
    queue: Arc<InputQueue>,
    payload_metadata: PayloadMetadata,
}

struct State {
    inputs: HashMap<InputSessionSpecifier, InputEntry>,
    outputs: HashMap<OutputSessionSpecifier, OutputSession>,
    stats: TransportStatistics,
}

struct Inner {
    options: LoopbackTransportOptions,
    capture: CaptureRegistry,
    closed: AtomicBool,
    state: Mutex<State>,
}

/// The loopback transport. Cheap to clone; all clones share one instance.
#[derive(Clone)]
pub struct LoopbackTransport {
    inner: Arc<Inner>,
}

impl LoopbackTransport {
    pub fn new(options: LoopbackTransportOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                capture: CaptureRegistry::new(),
                closed: AtomicBool::new(false),
                state: Mutex::new(State {
                    inputs: HashMap::new(),
                    outputs: HashMap::new(),
                    stats: TransportStatistics::default(),
                }),
            }),
        }
    }
}

impl Inner {
    fn check_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::ResourceClosed)
        } else {
            Ok(())
        }
    }

    /// Immediate local delivery; the shared path for regular sends and spoofed transfers.
    fn deliver(
        &self,
        data_specifier: DataSpecifier,
        destination: Option<NodeId>,
        transfer: TransferFrom,
    ) {
        self.capture.emit(|| {
            Capture::Loopback(LoopbackCapture {
                timestamp: transfer.timestamp,
                transfer: AlienTransfer {
                    metadata: AlienTransferMetadata {
                        priority: transfer.priority,
                        transfer_id: transfer.transfer_id,
                        session_specifier: AlienSessionSpecifier {
                            source_node_id: transfer.source_node_id,
                            destination_node_id: destination,
                            data_specifier,
                        },
                    },
                    payload: transfer.payload.clone(),
                },
            })
        });

        let mut state = self.state.lock();
        let state = &mut *state;
        state.stats.transfers_out += 1;

        if let Some(destination) = destination {
            if self.options.local_node_id != Some(destination) {
                state.stats.frames_unrouted += 1;
                return;
            }
        }

        let selective = transfer.source_node_id.map(|source| InputSessionSpecifier {
            data_specifier,
            remote_node_id: Some(source),
        });
        let promiscuous = InputSessionSpecifier {
            data_specifier,
            remote_node_id: None,
        };
        let mut routed = false;
        for spec in [selective, Some(promiscuous)].into_iter().flatten() {
            if let Some(entry) = state.inputs.get(&spec) {
                routed = true;
                let mut clone = transfer.clone();
                clone.payload.truncate(entry.payload_metadata.extent);
                if !entry.queue.push(clone) {
                    state.stats.queue_overflows += 1;
                }
            }
        }
        if routed {
            state.stats.transfers_in += 1;
        } else {
            state.stats.frames_unrouted += 1;
        }
    }

    fn detach_input(&self, specifier: InputSessionSpecifier) {
        if let Some(entry) = self.state.lock().inputs.remove(&specifier) {
            entry.queue.close();
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = self.state.lock();
        for entry in state.inputs.values() {
            entry.queue.close();
        }
        state.inputs.clear();
        for session in state.outputs.values() {
            session.close();
        }
    }
}

struct LoopbackRoute {
    inner: Weak<Inner>,
    specifier: OutputSessionSpecifier,
}

impl OutputRoute for LoopbackRoute {
    fn send<'a>(
        &'a self,
        transfer: &'a Transfer,
        deadline: Instant,
    ) -> BoxFuture<'a, Result<bool, TransportError>> {
        Box::pin(async move {
            let inner = self.inner.upgrade().ok_or(TransportError::ResourceClosed)?;
            inner.check_open()?;
            if Instant::now() > deadline {
                return Ok(false);
            }
            let modulo = inner.options.transfer_id_modulo;
            inner.deliver(
                self.specifier.data_specifier,
                self.specifier.remote_node_id,
                TransferFrom {
                    timestamp: Timestamp::now(),
                    priority: transfer.priority,
                    transfer_id: TransferId::new(if modulo == TransferId::UNBOUNDED_MODULO {
                        transfer.transfer_id.into_u64()
                    } else {
                        transfer.transfer_id.into_u64() % modulo
                    }),
                    source_node_id: inner.options.local_node_id,
                    payload: transfer.payload.clone(),
                },
            );
            Ok(true)
        })
    }
}

impl Transport for LoopbackTransport {
    fn protocol_parameters(&self) -> ProtocolParameters {
        ProtocolParameters {
            transfer_id_modulo: self.inner.options.transfer_id_modulo,
            max_nodes: usize::from(u16::from(NodeId::MAX)) + 1,
            mtu: self.inner.options.mtu,
        }
    }

    fn local_node_id(&self) -> Option<NodeId> {
        self.inner.options.local_node_id
    }

    fn input_session(
        &self,
        specifier: InputSessionSpecifier,
        payload_metadata: PayloadMetadata,
    ) -> Result<InputSession, TransportError> {
        self.inner.check_open()?;
        let mut state = self.inner.state.lock();
        let entry = state.inputs.entry(specifier).or_insert(InputEntry {
            queue: Arc::new(InputQueue::new(INPUT_QUEUE_DEPTH)),
            payload_metadata,
        });
        let queue = entry.queue.clone();
        let payload_metadata = entry.payload_metadata;
        let inner = self.inner.clone();
        Ok(InputSession::new(
            specifier,
            payload_metadata,
            queue,
            Arc::new(move || inner.detach_input(specifier)),
        ))
    }

    fn output_session(
        &self,
        specifier: OutputSessionSpecifier,
    ) -> Result<OutputSession, TransportError> {
        self.inner.check_open()?;
        let modulo = self.inner.options.transfer_id_modulo;
        let mut state = self.inner.state.lock();
        let session = state.outputs.entry(specifier).or_insert_with(|| {
            OutputSession::new(
                specifier,
                modulo,
                Box::new(LoopbackRoute {
                    inner: Arc::downgrade(&self.inner),
                    specifier,
                }),
            )
        });
        Ok(session.clone())
    }

    fn sample_statistics(&self) -> TransportStatistics {
        self.inner.state.lock().stats
    }

    fn begin_capture(&self, handler: CaptureHandler) {
        self.inner.capture.add(handler);
    }

    fn spoof<'a>(
        &'a self,
        transfer: &'a AlienTransfer,
        deadline: Instant,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            self.inner.check_open()?;
            if Instant::now() > deadline {
                return Err(TransportError::Timeout);
            }
            let session = transfer.metadata.session_specifier;
            self.inner.deliver(
                session.data_specifier,
                session.destination_node_id,
                TransferFrom {
                    timestamp: Timestamp::now(),
                    priority: transfer.metadata.priority,
                    transfer_id: transfer.metadata.transfer_id,
                    source_node_id: session.source_node_id,
                    payload: transfer.payload.clone(),
                },
            );
            Ok(())
        })
    }

    fn make_tracer(&self) -> Box<dyn Tracer> {
        Box::new(LoopbackTracer)
    }

    fn close(&self) {
        self.inner.close();
    }
}

impl core::fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("local_node_id", &self.inner.options.local_node_id)
            .finish_non_exhaustive()
    }
}

/// Loopback captures already carry whole transfers; tracing is a pass-through.
pub struct LoopbackTracer;

impl Tracer for LoopbackTracer {
    fn update(&mut self, capture: &Capture) -> Option<Trace> {
        let Capture::Loopback(LoopbackCapture {
            timestamp,
            transfer,
        }) = capture
        else {
            return None;
        };
        Some(Trace::Transfer(TransferTrace {
            timestamp: *timestamp,
            transfer: transfer.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Priority, SubjectId};
    use crate::time::Duration;
    use crate::transport::Transport as _;

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[test]
    fn test_local_round_trip() {
        let transport = LoopbackTransport::new(LoopbackTransportOptions {
            local_node_id: NodeId::new(42),
            ..Default::default()
        });
        let spec = DataSpecifier::Message(SubjectId::new(10).unwrap());
        let rx = transport
            .input_session(
                InputSessionSpecifier {
                    data_specifier: spec,
                    remote_node_id: None,
                },
                PayloadMetadata { extent: 8 },
            )
            .unwrap();
        let tx = transport
            .output_session(OutputSessionSpecifier {
                data_specifier: spec,
                remote_node_id: None,
            })
            .unwrap();

        futures_executor::block_on(tx.send(
            Transfer {
                priority: Priority::High,
                transfer_id: tx.next_transfer_id(),
                payload: vec![1, 2, 3],
            },
            deadline(),
        ))
        .unwrap();

        let received = rx.try_receive().unwrap();
        assert_eq!(received.payload, [1, 2, 3]);
        assert_eq!(received.source_node_id, NodeId::new(42));
    }

    #[test]
    fn test_extent_truncation() {
        let transport = LoopbackTransport::new(LoopbackTransportOptions {
            local_node_id: NodeId::new(1),
            ..Default::default()
        });
        let spec = DataSpecifier::Message(SubjectId::new(2).unwrap());
        let rx = transport
            .input_session(
                InputSessionSpecifier {
                    data_specifier: spec,
                    remote_node_id: None,
                },
                PayloadMetadata { extent: 2 },
            )
            .unwrap();
        let tx = transport
            .output_session(OutputSessionSpecifier {
                data_specifier: spec,
                remote_node_id: None,
            })
            .unwrap();
        futures_executor::block_on(tx.send(
            Transfer {
                priority: Priority::Nominal,
                transfer_id: tx.next_transfer_id(),
                payload: vec![1, 2, 3, 4],
            },
            deadline(),
        ))
        .unwrap();
        assert_eq!(rx.try_receive().unwrap().payload, [1, 2]);
    }

    #[test]
    fn test_tracer_passthrough() {
        let transport = LoopbackTransport::new(LoopbackTransportOptions {
            local_node_id: NodeId::new(3),
            ..Default::default()
        });
        let captured: Arc<Mutex<Vec<Capture>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = captured.clone();
        transport.begin_capture(Arc::new(move |c| sink.lock().push(c.clone())));

        let spec = DataSpecifier::Message(SubjectId::new(9).unwrap());
        let tx = transport
            .output_session(OutputSessionSpecifier {
                data_specifier: spec,
                remote_node_id: None,
            })
            .unwrap();
        futures_executor::block_on(tx.send(
            Transfer {
                priority: Priority::Nominal,
                transfer_id: tx.next_transfer_id(),
                payload: vec![7],
            },
            deadline(),
        ))
        .unwrap();

        let mut tracer = transport.make_tracer();
        let captures = captured.lock();
        assert_eq!(captures.len(), 1);
        let Some(Trace::Transfer(trace)) = tracer.update(&captures[0]) else {
            panic!("expected a transfer trace");
        };
        assert_eq!(trace.transfer.payload, [7]);
    }
}
