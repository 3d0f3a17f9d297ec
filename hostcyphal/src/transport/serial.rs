//! Cyphal/serial transport
//!
//! A raw byte stream framed by COBS delimiters carries UDP-style frames with a
//! self-validating 24-byte header and a 64-bit transfer-ID; see [`wire`]. Works over local
//! serial ports, TCP tunnels, and the in-memory pipe used by tests. The stream has no
//! addressing, so there are no acceptance filters; the transport discards frames it has no
//! session for.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::core::{DataSpecifier, NodeId, TransferId};
use crate::link::LinkPort;
use crate::time::{Duration, Instant};
use crate::transfer::{AlienTransfer, Timestamp, TransferFrom};
use crate::transport::capture::{
    Capture, CaptureHandler, CaptureRegistry, Direction, SerialCapture, Trace, Tracer,
};
use crate::transport::commons::{self, HotFrame, HotTracerCore, Reassembler};
use crate::transport::error::TransportError;
use crate::transport::session::{
    InputQueue, InputSession, InputSessionSpecifier, OutputRoute, OutputSession,
    OutputSessionSpecifier, PayloadMetadata, INPUT_QUEUE_DEPTH,
};
use crate::transport::{BoxFuture, ProtocolParameters, Transport, TransportStatistics};

pub mod media;
pub mod wire;

use media::SerialMedia;
use wire::{ParseError, SerialFrame, StreamEvent, StreamParser};

#[derive(Debug, Clone)]
pub struct SerialTransportOptions {
    /// `None` runs the node anonymously (single-frame messages only).
    pub local_node_id: Option<NodeId>,
    pub transfer_id_timeout: Duration,
}

impl Default for SerialTransportOptions {
    fn default() -> Self {
        Self {
            local_node_id: None,
            transfer_id_timeout: Duration::from_secs(2),
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
    reassembly: HashMap<(DataSpecifier, NodeId), Reassembler>,
    parser: StreamParser,
    stats: TransportStatistics,
}

struct Inner {
    options: SerialTransportOptions,
    mtu: usize,
    link_port: LinkPort<Vec<u8>>,
    media: Mutex<Option<Box<dyn SerialMedia>>>,
    capture: CaptureRegistry,
    closed: AtomicBool,
    state: Mutex<State>,
}

/// The Cyphal/serial transport. Cheap to clone; all clones share one instance.
#[derive(Clone)]
pub struct SerialTransport {
    inner: Arc<Inner>,
}

impl SerialTransport {
    pub fn new(
        mut media: Box<dyn SerialMedia>,
        options: SerialTransportOptions,
    ) -> Result<Self, TransportError> {
        let mtu = media.mtu();
        if mtu <= crate::transport::crc::TransferCrc32c::LENGTH {
            return Err(TransportError::InvalidConfiguration(format!(
                "serial MTU of {mtu} B cannot fit the transfer CRC",
            )));
        }

        let dispatch_target: Arc<Mutex<Option<Weak<Inner>>>> = Arc::new(Mutex::new(None));
        let target = dispatch_target.clone();
        let (link_port, link) = crate::link::new(Box::new(move |chunk: Vec<u8>| {
            if let Some(inner) = target.lock().as_ref().and_then(Weak::upgrade) {
                inner.dispatch(chunk);
            }
        }));

        let inner = Arc::new(Inner {
            options,
            mtu,
            link_port,
            media: Mutex::new(None),
            capture: CaptureRegistry::new(),
            closed: AtomicBool::new(false),
            state: Mutex::new(State {
                inputs: HashMap::new(),
                outputs: HashMap::new(),
                reassembly: HashMap::new(),
                parser: StreamParser::new(mtu),
                stats: TransportStatistics::default(),
            }),
        });
        *dispatch_target.lock() = Some(Arc::downgrade(&inner));

        media.start(link)?;
        *inner.media.lock() = Some(media);
        Ok(Self { inner })
    }
}

impl Inner {
    fn check_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) || self.link_port.is_closed() {
            Err(TransportError::ResourceClosed)
        } else {
            Ok(())
        }
    }

    fn dispatch(self: Arc<Self>, chunk: Vec<u8>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let timestamp = Timestamp::now();

        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            state.parser.push_bytes(&chunk, |event| events.push(event));
        }
        for event in events {
            match event {
                StreamEvent::Frame(frame) => self.process_frame(timestamp, frame),
                StreamEvent::Error(error) => {
                    if error == ParseError::VersionMismatch {
                        log::warn!(
                            "received a serial frame of an unsupported header version; \
                             the legacy layout is not auto-detected"
                        );
                    }
                    self.state.lock().stats.frames_malformed += 1;
                }
            }
        }
    }

    fn process_frame(self: &Arc<Self>, timestamp: Timestamp, frame: SerialFrame) {
        self.capture.emit(|| {
            Capture::Serial(SerialCapture {
                timestamp,
                direction: Direction::Ingress,
                frame: frame.clone(),
            })
        });

        let mut state = self.state.lock();
        let state = &mut *state;
        state.stats.frames_in += 1;

        let addressed_here = match frame.destination_node_id {
            None => true,
            Some(destination) => self.options.local_node_id == Some(destination),
        };
        if !addressed_here {
            state.stats.frames_unrouted += 1;
            return;
        }

        let data_spec = frame.data_specifier;
        let selective = frame.source_node_id.map(|source| InputSessionSpecifier {
            data_specifier: data_spec,
            remote_node_id: Some(source),
        });
        let promiscuous = InputSessionSpecifier {
            data_specifier: data_spec,
            remote_node_id: None,
        };
        let has_selective = selective
            .as_ref()
            .is_some_and(|spec| state.inputs.contains_key(spec));
        if !has_selective && !state.inputs.contains_key(&promiscuous) {
            state.stats.frames_unrouted += 1;
            return;
        }

        let hot = HotFrame {
            priority: frame.priority,
            transfer_id: frame.transfer_id,
            index: frame.index,
            end_of_transfer: frame.end_of_transfer,
            payload: frame.payload,
        };
        let transfer = match frame.source_node_id {
            None => {
                let transfer = Reassembler::construct_anonymous_transfer(timestamp, &hot);
                if transfer.is_none() {
                    state.stats.reassembly_errors += 1;
                }
                transfer
            }
            Some(source) => {
                let reassembler = state
                    .reassembly
                    .entry((data_spec, source))
                    .or_insert_with(|| Reassembler::new(source));
                let mut errors = 0u64;
                let transfer = reassembler.process_frame(
                    timestamp,
                    &hot,
                    self.options.transfer_id_timeout,
                    |_| errors += 1,
                );
                state.stats.reassembly_errors += errors;
                transfer
            }
        };

        if let Some(transfer) = transfer {
            state.stats.transfers_in += 1;
            for spec in [selective, Some(promiscuous)].into_iter().flatten() {
                if let Some(entry) = state.inputs.get(&spec) {
                    let mut clone: TransferFrom = transfer.clone();
                    clone.payload.truncate(entry.payload_metadata.extent);
                    if !entry.queue.push(clone) {
                        state.stats.queue_overflows += 1;
                    }
                }
            }
        }
    }

    fn detach_input(self: &Arc<Self>, specifier: InputSessionSpecifier) {
        let mut state = self.state.lock();
        if let Some(entry) = state.inputs.remove(&specifier) {
            entry.queue.close();
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.link_port.close();
        if let Some(mut media) = self.media.lock().take() {
            media.close();
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

struct SerialRoute {
    inner: Weak<Inner>,
    specifier: OutputSessionSpecifier,
}

impl SerialRoute {
    async fn send_impl(
        &self,
        transfer: &crate::transfer::Transfer,
        deadline: Instant,
    ) -> Result<bool, TransportError> {
        let inner = self.inner.upgrade().ok_or(TransportError::ResourceClosed)?;
        inner.check_open()?;

        let windows = commons::serialize_transfer(&transfer.payload, inner.mtu);
        if inner.options.local_node_id.is_none() && windows.len() > 1 {
            return Err(TransportError::PayloadTooLarge {
                payload_bytes: transfer.payload.len(),
                limit_bytes: inner.mtu - crate::transport::crc::TransferCrc32c::LENGTH,
            });
        }

        let last_index = windows.len() - 1;
        let mut frames_out = 0u64;
        let mut complete = true;
        for (index, window) in windows.into_iter().enumerate() {
            let frame = SerialFrame {
                priority: transfer.priority,
                source_node_id: inner.options.local_node_id,
                destination_node_id: self.specifier.remote_node_id,
                data_specifier: self.specifier.data_specifier,
                transfer_id: transfer.transfer_id,
                index: index as u32,
                end_of_transfer: index == last_index,
                user_data: 0,
                payload: window,
            };
            inner.capture.emit(|| {
                Capture::Serial(SerialCapture {
                    timestamp: Timestamp::now(),
                    direction: Direction::Egress,
                    frame: frame.clone(),
                })
            });
            if !inner.link_port.send_frame(frame.compile(), deadline).await? {
                complete = false;
                break;
            }
            frames_out += 1;
        }

        let mut state = inner.state.lock();
        state.stats.frames_out += frames_out;
        if complete {
            state.stats.transfers_out += 1;
        }
        Ok(complete)
    }
}

impl OutputRoute for SerialRoute {
    fn send<'a>(
        &'a self,
        transfer: &'a crate::transfer::Transfer,
        deadline: Instant,
    ) -> BoxFuture<'a, Result<bool, TransportError>> {
        Box::pin(self.send_impl(transfer, deadline))
    }
}

impl Transport for SerialTransport {
    fn protocol_parameters(&self) -> ProtocolParameters {
        ProtocolParameters {
            transfer_id_modulo: TransferId::UNBOUNDED_MODULO,
            max_nodes: usize::from(u16::from(NodeId::MAX)) + 1,
            mtu: self.inner.mtu,
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
        if specifier.data_specifier.is_service() && self.inner.options.local_node_id.is_none() {
            return Err(TransportError::InvalidConfiguration(
                "an anonymous node cannot exchange service transfers".into(),
            ));
        }

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
        match specifier.data_specifier {
            DataSpecifier::Message(_) => {
                if specifier.remote_node_id.is_some() {
                    return Err(TransportError::InvalidConfiguration(
                        "message transfers are broadcast; a destination cannot be specified"
                            .into(),
                    ));
                }
            }
            DataSpecifier::Request(_) | DataSpecifier::Response(_) => {
                if self.inner.options.local_node_id.is_none() {
                    return Err(TransportError::InvalidConfiguration(
                        "an anonymous node cannot exchange service transfers".into(),
                    ));
                }
                if specifier.remote_node_id.is_none() {
                    return Err(TransportError::InvalidConfiguration(
                        "service transfers require a destination node-ID".into(),
                    ));
                }
            }
        }

        let mut state = self.inner.state.lock();
        let session = state.outputs.entry(specifier).or_insert_with(|| {
            OutputSession::new(
                specifier,
                TransferId::UNBOUNDED_MODULO,
                Box::new(SerialRoute {
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
        // The stream is inherently promiscuous; every frame is already observed.
        self.inner.capture.add(handler);
    }

    fn spoof<'a>(
        &'a self,
        transfer: &'a AlienTransfer,
        deadline: Instant,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            self.inner.check_open()?;
            let session = transfer.metadata.session_specifier;
            let windows = commons::serialize_transfer(&transfer.payload, self.inner.mtu);
            if session.source_node_id.is_none() && windows.len() > 1 {
                return Err(TransportError::UnsupportedCapability(
                    "anonymous transfers cannot be multi-frame".into(),
                ));
            }
            let last_index = windows.len() - 1;
            for (index, window) in windows.into_iter().enumerate() {
                let frame = SerialFrame {
                    priority: transfer.metadata.priority,
                    source_node_id: session.source_node_id,
                    destination_node_id: session.destination_node_id,
                    data_specifier: session.data_specifier,
                    transfer_id: transfer.metadata.transfer_id,
                    index: index as u32,
                    end_of_transfer: index == last_index,
                    user_data: 0,
                    payload: window,
                };
                self.inner.capture.emit(|| {
                    Capture::Serial(SerialCapture {
                        timestamp: Timestamp::now(),
                        direction: Direction::Egress,
                        frame: frame.clone(),
                    })
                });
                if !self
                    .inner
                    .link_port
                    .send_frame(frame.compile(), deadline)
                    .await?
                {
                    return Err(TransportError::Timeout);
                }
            }
            Ok(())
        })
    }

    fn make_tracer(&self) -> Box<dyn Tracer> {
        Box::new(SerialTracer::new(self.inner.options.transfer_id_timeout))
    }

    fn close(&self) {
        self.inner.close();
    }
}

impl core::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("local_node_id", &self.inner.options.local_node_id)
            .field("mtu", &self.inner.mtu)
            .finish_non_exhaustive()
    }
}

/// Reconstructs transfers from a chronologically ordered stream of serial captures.
pub struct SerialTracer {
    core: HotTracerCore,
}

impl SerialTracer {
    pub fn new(transfer_id_timeout: Duration) -> Self {
        Self {
            core: HotTracerCore::new(transfer_id_timeout),
        }
    }
}

impl Tracer for SerialTracer {
    fn update(&mut self, capture: &Capture) -> Option<Trace> {
        let Capture::Serial(SerialCapture {
            timestamp, frame, ..
        }) = capture
        else {
            return None;
        };
        let session_specifier = crate::transfer::AlienSessionSpecifier {
            source_node_id: frame.source_node_id,
            destination_node_id: frame.destination_node_id,
            data_specifier: frame.data_specifier,
        };
        let hot = HotFrame {
            priority: frame.priority,
            transfer_id: frame.transfer_id,
            index: frame.index,
            end_of_transfer: frame.end_of_transfer,
            payload: frame.payload.clone(),
        };
        self.core.update(*timestamp, session_specifier, &hot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Priority, ServiceId, SubjectId};
    use crate::transfer::Transfer;
    use crate::transport::Transport as _;
    use media::MemoryPipe;

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    fn subject(id: u16) -> DataSpecifier {
        DataSpecifier::Message(SubjectId::new(id).unwrap())
    }

    fn make_pair(mtu: usize) -> (MemoryPipe, SerialTransport, SerialTransport) {
        let pipe = MemoryPipe::new(mtu);
        let (end_a, end_b) = pipe.ends();
        let a = SerialTransport::new(
            Box::new(end_a),
            SerialTransportOptions {
                local_node_id: NodeId::new(1000),
                ..Default::default()
            },
        )
        .unwrap();
        let b = SerialTransport::new(
            Box::new(end_b),
            SerialTransportOptions {
                local_node_id: NodeId::new(2000),
                ..Default::default()
            },
        )
        .unwrap();
        (pipe, a, b)
    }

    #[test]
    fn test_multi_frame_round_trip() {
        let (pipe, a, b) = make_pair(16);
        let rx = b
            .input_session(
                InputSessionSpecifier {
                    data_specifier: subject(100),
                    remote_node_id: None,
                },
                PayloadMetadata { extent: 128 },
            )
            .unwrap();
        let tx = a
            .output_session(OutputSessionSpecifier {
                data_specifier: subject(100),
                remote_node_id: None,
            })
            .unwrap();

        let payload: Vec<u8> = (0u8..60).collect();
        assert!(futures_executor::block_on(tx.send(
            Transfer {
                priority: Priority::Low,
                transfer_id: tx.next_transfer_id(),
                payload: payload.clone(),
            },
            deadline(),
        ))
        .unwrap());
        pipe.process();

        let received = rx.try_receive().unwrap();
        assert_eq!(received.payload, payload);
        assert_eq!(received.source_node_id, NodeId::new(1000));
        assert_eq!(received.priority, Priority::Low);
    }

    #[test]
    fn test_service_round_trip() {
        let (pipe, a, b) = make_pair(64);
        let service = DataSpecifier::Request(ServiceId::new(123).unwrap());
        let rx = b
            .input_session(
                InputSessionSpecifier {
                    data_specifier: service,
                    remote_node_id: None,
                },
                PayloadMetadata { extent: 64 },
            )
            .unwrap();
        let tx = a
            .output_session(OutputSessionSpecifier {
                data_specifier: service,
                remote_node_id: NodeId::new(2000),
            })
            .unwrap();
        assert!(futures_executor::block_on(tx.send(
            Transfer {
                priority: Priority::Nominal,
                transfer_id: tx.next_transfer_id(),
                payload: vec![10, 1, 20, 2],
            },
            deadline(),
        ))
        .unwrap());
        pipe.process();
        assert_eq!(rx.try_receive().unwrap().payload, [10, 1, 20, 2]);
    }

    #[test]
    fn test_misaddressed_service_is_dropped() {
        let (pipe, a, b) = make_pair(64);
        let service = DataSpecifier::Request(ServiceId::new(5).unwrap());
        let rx = b
            .input_session(
                InputSessionSpecifier {
                    data_specifier: service,
                    remote_node_id: None,
                },
                PayloadMetadata { extent: 64 },
            )
            .unwrap();
        // Addressed to a third node, not to b.
        let tx = a
            .output_session(OutputSessionSpecifier {
                data_specifier: service,
                remote_node_id: NodeId::new(3000),
            })
            .unwrap();
        futures_executor::block_on(tx.send(
            Transfer {
                priority: Priority::Nominal,
                transfer_id: TransferId::new(0),
                payload: vec![1],
            },
            deadline(),
        ))
        .unwrap();
        pipe.process();
        assert!(rx.try_receive().is_none());
        assert_eq!(b.sample_statistics().frames_unrouted, 1);
    }

    #[test]
    fn test_noise_counted_not_raised() {
        let (_pipe, _a, b) = make_pair(64);
        b.inner.clone().dispatch(vec![0x00, 0x13, 0x37, 0x00]);
        let stats = b.sample_statistics();
        assert_eq!(stats.frames_malformed, 1);
        assert_eq!(stats.frames_in, 0);
    }
}
