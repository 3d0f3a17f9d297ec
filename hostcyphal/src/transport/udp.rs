//! Cyphal/UDP transport
//!
//! Each subject maps to a fixed multicast group derived from the subject-ID; each service
//! exchange maps to a service group derived from the destination node-ID. Addressing is
//! carried in the frame header rather than inferred from the IP layer, so a node may bind
//! to an arbitrary local interface and transfer spoofing needs no raw sockets.
//!
//! Transfers may span multiple datagrams; reassembly tolerates out-of-order arrival
//! (see [`crate::transport::commons`]).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::core::{DataSpecifier, NodeId, TransferId};
use crate::link::LinkPort;
use crate::time::{Duration, Instant};
use crate::transfer::{AlienTransfer, Timestamp, TransferFrom};
use crate::transport::capture::{
    Capture, CaptureHandler, CaptureRegistry, Direction, Trace, Tracer, UdpCapture,
};
use crate::transport::commons::{self, HotFrame, HotTracerCore, Reassembler};
use crate::transport::error::TransportError;
use crate::transport::session::{
    InputQueue, InputSession, InputSessionSpecifier, OutputRoute, OutputSession,
    OutputSessionSpecifier, PayloadMetadata, INPUT_QUEUE_DEPTH,
};
use crate::transport::{BoxFuture, ProtocolParameters, Transport, TransportStatistics};

pub mod endpoint;
pub mod media;
pub mod wire;

use media::{Datagram, UdpMedia, UdpMediaConfig};
use wire::UdpFrame;

#[derive(Debug, Clone)]
pub struct UdpTransportOptions {
    /// `None` runs the node anonymously (single-frame messages only).
    pub local_node_id: Option<NodeId>,
    /// Local interface address for multicast membership and transmission.
    pub local_iface: std::net::Ipv4Addr,
    pub message_port: u16,
    pub service_port: u16,
    pub transfer_id_timeout: Duration,
    /// Compatibility switch: historic stacks treated node-ID 0 as anonymous.
    /// The current protocol treats 0 as a regular address and only 0xffff as anonymous.
    pub legacy_zero_is_anonymous: bool,
}

impl Default for UdpTransportOptions {
    fn default() -> Self {
        Self {
            local_node_id: None,
            local_iface: std::net::Ipv4Addr::LOCALHOST,
            message_port: endpoint::MESSAGE_PORT,
            service_port: endpoint::SERVICE_PORT,
            transfer_id_timeout: Duration::from_secs(2),
            legacy_zero_is_anonymous: false,
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
    subject_refs: HashMap<crate::core::SubjectId, usize>,
    service_refs: usize,
    stats: TransportStatistics,
}

struct Inner {
    options: UdpTransportOptions,
    mtu: usize,
    link_port: LinkPort<Datagram>,
    media: Mutex<Option<Box<dyn UdpMedia>>>,
    capture: CaptureRegistry,
    closed: AtomicBool,
    state: Mutex<State>,
}

/// The Cyphal/UDP transport. Cheap to clone; all clones share one instance.
#[derive(Clone)]
pub struct UdpTransport {
    inner: Arc<Inner>,
}

impl UdpTransport {
    pub fn new(
        mut media: Box<dyn UdpMedia>,
        options: UdpTransportOptions,
    ) -> Result<Self, TransportError> {
        let mtu = media.mtu();
        if mtu <= wire::HEADER_SIZE + crate::transport::crc::TransferCrc32c::LENGTH {
            return Err(TransportError::InvalidConfiguration(format!(
                "UDP MTU of {mtu} B cannot fit the header and the transfer CRC",
            )));
        }

        let dispatch_target: Arc<Mutex<Option<Weak<Inner>>>> = Arc::new(Mutex::new(None));
        let target = dispatch_target.clone();
        let (link_port, link) = crate::link::new(Box::new(move |datagram: Datagram| {
            if let Some(inner) = target.lock().as_ref().and_then(Weak::upgrade) {
                inner.dispatch(datagram);
            }
        }));

        let config = UdpMediaConfig {
            local_iface: options.local_iface,
            message_port: options.message_port,
            service_port: options.service_port,
            local_node_id: options.local_node_id,
        };
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
                subject_refs: HashMap::new(),
                service_refs: 0,
                stats: TransportStatistics::default(),
            }),
        });
        *dispatch_target.lock() = Some(Arc::downgrade(&inner));

        media.start(link, config)?;
        *inner.media.lock() = Some(media);
        Ok(Self { inner })
    }

    /// The largest transfer payload a single datagram can carry.
    fn frame_payload_capacity(&self) -> usize {
        self.inner.mtu - wire::HEADER_SIZE
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

    fn dispatch(self: Arc<Self>, datagram: Datagram) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let timestamp = Timestamp::now();
        let Some(mut frame) = UdpFrame::parse(&datagram.data) else {
            self.state.lock().stats.frames_malformed += 1;
            return;
        };
        if self.options.legacy_zero_is_anonymous && frame.source_node_id == NodeId::new(0) {
            frame.source_node_id = None;
        }
        self.capture.emit(|| {
            Capture::Udp(UdpCapture {
                timestamp,
                direction: Direction::Ingress,
                frame: frame.clone(),
            })
        });

        let mut state = self.state.lock();
        let state = &mut *state;
        state.stats.frames_in += 1;

        // Service frames not addressed to the local node, and unicast-addressed message
        // frames of other nodes, are visible to capture only.
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
        let has_promiscuous = state.inputs.contains_key(&promiscuous);
        if !has_selective && !has_promiscuous {
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
            deliver(state, &[selective, Some(promiscuous)], transfer);
        }
    }

    fn detach_input(self: &Arc<Self>, specifier: InputSessionSpecifier) {
        let mut state = self.state.lock();
        let Some(entry) = state.inputs.remove(&specifier) else {
            return;
        };
        entry.queue.close();
        match specifier.data_specifier {
            DataSpecifier::Message(subject) => {
                let stale = {
                    let count = state.subject_refs.entry(subject).or_insert(1);
                    *count = count.saturating_sub(1);
                    *count == 0
                };
                if stale {
                    state.subject_refs.remove(&subject);
                    self.link_port.request_filter(
                        crate::link::FilterUpdate::RemoveSubjectRange([subject, subject]),
                    );
                }
            }
            DataSpecifier::Request(_) | DataSpecifier::Response(_) => {
                state.service_refs = state.service_refs.saturating_sub(1);
                if state.service_refs == 0 {
                    if let Some(local) = self.options.local_node_id {
                        self.link_port.request_filter(
                            crate::link::FilterUpdate::RemoveDestinationRange([local, local]),
                        );
                    }
                }
            }
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

    fn endpoint_for(&self, specifier: &OutputSessionSpecifier) -> std::net::SocketAddrV4 {
        match specifier.data_specifier {
            DataSpecifier::Message(subject) => {
                endpoint::message_endpoint(subject, self.options.message_port)
            }
            DataSpecifier::Request(_) | DataSpecifier::Response(_) => {
                endpoint::service_endpoint(specifier.remote_node_id, self.options.service_port)
            }
        }
    }
}

fn deliver(
    state: &mut State,
    specs: &[Option<InputSessionSpecifier>; 2],
    transfer: TransferFrom,
) {
    for spec in specs.iter().flatten() {
        if let Some(entry) = state.inputs.get(spec) {
            let mut clone = transfer.clone();
            clone.payload.truncate(entry.payload_metadata.extent);
            if !entry.queue.push(clone) {
                state.stats.queue_overflows += 1;
            }
        }
    }
}

struct UdpRoute {
    inner: Weak<Inner>,
    specifier: OutputSessionSpecifier,
}

impl UdpRoute {
    async fn send_impl(
        &self,
        transfer: &crate::transfer::Transfer,
        deadline: Instant,
    ) -> Result<bool, TransportError> {
        let inner = self.inner.upgrade().ok_or(TransportError::ResourceClosed)?;
        inner.check_open()?;

        let capacity = inner.mtu - wire::HEADER_SIZE;
        let windows = commons::serialize_transfer(&transfer.payload, capacity);
        if inner.options.local_node_id.is_none() && windows.len() > 1 {
            return Err(TransportError::PayloadTooLarge {
                payload_bytes: transfer.payload.len(),
                limit_bytes: capacity - crate::transport::crc::TransferCrc32c::LENGTH,
            });
        }

        let endpoint = inner.endpoint_for(&self.specifier);
        let last_index = windows.len() - 1;
        let mut frames_out = 0u64;
        let mut complete = true;
        for (index, window) in windows.into_iter().enumerate() {
            let frame = UdpFrame {
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
                Capture::Udp(UdpCapture {
                    timestamp: Timestamp::now(),
                    direction: Direction::Egress,
                    frame: frame.clone(),
                })
            });
            let datagram = Datagram {
                data: frame.compile(),
                endpoint,
            };
            if !inner.link_port.send_frame(datagram, deadline).await? {
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

impl OutputRoute for UdpRoute {
    fn send<'a>(
        &'a self,
        transfer: &'a crate::transfer::Transfer,
        deadline: Instant,
    ) -> BoxFuture<'a, Result<bool, TransportError>> {
        Box::pin(self.send_impl(transfer, deadline))
    }
}

impl Transport for UdpTransport {
    fn protocol_parameters(&self) -> ProtocolParameters {
        ProtocolParameters {
            transfer_id_modulo: TransferId::UNBOUNDED_MODULO,
            max_nodes: usize::from(u16::from(NodeId::MAX)) + 1,
            mtu: self.frame_payload_capacity(),
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
        if !state.inputs.contains_key(&specifier) {
            match specifier.data_specifier {
                DataSpecifier::Message(subject) => {
                    let refs = state.subject_refs.entry(subject).or_insert(0);
                    *refs += 1;
                    if *refs == 1 {
                        self.inner
                            .link_port
                            .request_filter(crate::link::FilterUpdate::AddSubject(subject));
                    }
                }
                DataSpecifier::Request(_) | DataSpecifier::Response(_) => {
                    state.service_refs += 1;
                    if state.service_refs == 1 {
                        if let Some(local) = self.inner.options.local_node_id {
                            self.inner
                                .link_port
                                .request_filter(crate::link::FilterUpdate::AddDestination(local));
                        }
                    }
                }
            }
            state.inputs.insert(
                specifier,
                InputEntry {
                    queue: Arc::new(InputQueue::new(INPUT_QUEUE_DEPTH)),
                    payload_metadata,
                },
            );
        }

        let entry = &state.inputs[&specifier];
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
                Box::new(UdpRoute {
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
        self.inner
            .link_port
            .request_filter(crate::link::FilterUpdate::AcceptAll);
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
            let capacity = self.inner.mtu - wire::HEADER_SIZE;
            let windows = commons::serialize_transfer(&transfer.payload, capacity);
            if session.source_node_id.is_none() && windows.len() > 1 {
                return Err(TransportError::UnsupportedCapability(
                    "anonymous transfers cannot be multi-frame".into(),
                ));
            }
            let endpoint = match session.data_specifier {
                DataSpecifier::Message(subject) => {
                    endpoint::message_endpoint(subject, self.inner.options.message_port)
                }
                DataSpecifier::Request(_) | DataSpecifier::Response(_) => endpoint::service_endpoint(
                    session.destination_node_id,
                    self.inner.options.service_port,
                ),
            };
            let last_index = windows.len() - 1;
            for (index, window) in windows.into_iter().enumerate() {
                let frame = UdpFrame {
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
                    Capture::Udp(UdpCapture {
                        timestamp: Timestamp::now(),
                        direction: Direction::Egress,
                        frame: frame.clone(),
                    })
                });
                let datagram = Datagram {
                    data: frame.compile(),
                    endpoint,
                };
                if !self.inner.link_port.send_frame(datagram, deadline).await? {
                    return Err(TransportError::Timeout);
                }
            }
            Ok(())
        })
    }

    fn make_tracer(&self) -> Box<dyn Tracer> {
        Box::new(UdpTracer::new(self.inner.options.transfer_id_timeout))
    }

    fn close(&self) {
        self.inner.close();
    }
}

impl core::fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("UdpTransport")
            .field("local_node_id", &self.inner.options.local_node_id)
            .field("local_iface", &self.inner.options.local_iface)
            .field("mtu", &self.inner.mtu)
            .finish_non_exhaustive()
    }
}

/// Reconstructs transfers from a chronologically ordered stream of UDP captures.
pub struct UdpTracer {
    core: HotTracerCore,
}

impl UdpTracer {
    pub fn new(transfer_id_timeout: Duration) -> Self {
        Self {
            core: HotTracerCore::new(transfer_id_timeout),
        }
    }
}

impl Tracer for UdpTracer {
    fn update(&mut self, capture: &Capture) -> Option<Trace> {
        let Capture::Udp(UdpCapture {
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
    use crate::core::{Priority, SubjectId};
    use crate::transfer::Transfer;
    use crate::transport::Transport as _;
    use media::MemoryFabric;

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    fn subject(id: u16) -> DataSpecifier {
        DataSpecifier::Message(SubjectId::new(id).unwrap())
    }

    fn make_transport(fabric: &MemoryFabric, node: u16) -> UdpTransport {
        UdpTransport::new(
            Box::new(fabric.attach()),
            UdpTransportOptions {
                local_node_id: NodeId::new(node),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_multi_frame_round_trip() {
        let fabric = MemoryFabric::new(wire::HEADER_SIZE + 16);
        let a = make_transport(&fabric, 5);
        let b = make_transport(&fabric, 6);

        let rx = b
            .input_session(
                InputSessionSpecifier {
                    data_specifier: subject(3210),
                    remote_node_id: None,
                },
                PayloadMetadata { extent: 128 },
            )
            .unwrap();
        let tx = a
            .output_session(OutputSessionSpecifier {
                data_specifier: subject(3210),
                remote_node_id: None,
            })
            .unwrap();

        let payload: Vec<u8> = (0u8..50).collect();
        let sent = futures_executor::block_on(tx.send(
            Transfer {
                priority: Priority::Nominal,
                transfer_id: tx.next_transfer_id(),
                payload: payload.clone(),
            },
            deadline(),
        ))
        .unwrap();
        assert!(sent);
        fabric.process(); // group joins
        // The join raced the datagrams in a single process() pass; run again to be sure
        // nothing is left queued.
        fabric.process();

        let received = rx.try_receive().unwrap();
        assert_eq!(received.payload, payload);
        assert_eq!(received.source_node_id, NodeId::new(5));
        // 50 B payload + 4 B CRC over 16 B windows: four datagrams.
        assert_eq!(a.sample_statistics().frames_out, 4);
    }

    #[test]
    fn test_legacy_zero_compatibility() {
        let fabric = MemoryFabric::new(1200);
        let modern = make_transport(&fabric, 9);
        let frame = UdpFrame {
            priority: Priority::Nominal,
            source_node_id: NodeId::new(0),
            destination_node_id: None,
            data_specifier: subject(5),
            transfer_id: TransferId::new(0),
            index: 0,
            end_of_transfer: true,
            user_data: 0,
            payload: commons::serialize_transfer(b"x", 100).remove(0),
        };
        // Modern semantics: node-ID 0 is a regular source.
        let rx = modern
            .input_session(
                InputSessionSpecifier {
                    data_specifier: subject(5),
                    remote_node_id: None,
                },
                PayloadMetadata { extent: 16 },
            )
            .unwrap();
        modern.inner.clone().dispatch(Datagram {
            data: frame.compile(),
            endpoint: std::net::SocketAddrV4::new(std::net::Ipv4Addr::LOCALHOST, 1),
        });
        assert_eq!(rx.try_receive().unwrap().source_node_id, NodeId::new(0));

        // Legacy semantics: the same frame is anonymous.
        let legacy = UdpTransport::new(
            Box::new(fabric.attach()),
            UdpTransportOptions {
                local_node_id: NodeId::new(10),
                legacy_zero_is_anonymous: true,
                ..Default::default()
            },
        )
        .unwrap();
        let rx = legacy
            .input_session(
                InputSessionSpecifier {
                    data_specifier: subject(5),
                    remote_node_id: None,
                },
                PayloadMetadata { extent: 16 },
            )
            .unwrap();
        legacy.inner.clone().dispatch(Datagram {
            data: frame.compile(),
            endpoint: std::net::SocketAddrV4::new(std::net::Ipv4Addr::LOCALHOST, 1),
        });
        assert_eq!(rx.try_receive().unwrap().source_node_id, None);
    }

    #[test]
    fn test_spoof_arbitrary_source() {
        let fabric = MemoryFabric::new(1200);
        let sniffer = make_transport(&fabric, 1);
        let rx = sniffer
            .input_session(
                InputSessionSpecifier {
                    data_specifier: subject(42),
                    remote_node_id: None,
                },
                PayloadMetadata { extent: 16 },
            )
            .unwrap();
        let spoofer = make_transport(&fabric, 2);
        fabric.process();

        let transfer = AlienTransfer {
            metadata: crate::transfer::AlienTransferMetadata {
                priority: Priority::High,
                transfer_id: TransferId::new(777),
                session_specifier: crate::transfer::AlienSessionSpecifier {
                    source_node_id: NodeId::new(1234),
                    destination_node_id: None,
                    data_specifier: subject(42),
                },
            },
            payload: b"fabricated".to_vec(),
        };
        futures_executor::block_on(spoofer.spoof(&transfer, deadline())).unwrap();
        fabric.process();

        let received = rx.try_receive().unwrap();
        assert_eq!(received.source_node_id, NodeId::new(1234));
        assert_eq!(received.transfer_id, TransferId::new(777));
        assert_eq!(received.payload, b"fabricated");
    }
}
