//! Cyphal/CAN transport
//!
//! Works on top of any [`media::CanMedia`] implementation: SocketCAN (classic and FD),
//! a socketcand TCP bridge, a candump log replayer for offline analysis, or the in-memory
//! bus used by the test suites.
//!
//! The transfer-ID is five bits (modulo 32); multi-frame transfers are protected by a
//! CRC-16 carried in the tail of the terminal frame(s). Anonymous transfers are restricted
//! to a single frame by the protocol.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use hostcyphal_driver::can::{Frame, Header, Mtu};
use parking_lot::Mutex;

use crate::core::{DataSpecifier, NodeId, TransferId};
use crate::link::LinkPort;
use crate::time::{Duration, Instant};
use crate::transfer::{AlienTransfer, Timestamp, TransferFrom};
use crate::transport::capture::{
    CanCapture, Capture, CaptureHandler, CaptureRegistry, Direction, Tracer,
};
use crate::transport::error::TransportError;
use crate::transport::session::{
    InputQueue, InputSession, InputSessionSpecifier, OutputRoute, OutputSession,
    OutputSessionSpecifier, PayloadMetadata, INPUT_QUEUE_DEPTH,
};
use crate::transport::{BoxFuture, ProtocolParameters, Transport, TransportStatistics};

pub mod format;
mod gather;
pub mod media;
mod scatter;
mod tracer;

use format::{wire_transfer_id, TailByte, SOT_TOGGLE_BIT, TRANSFER_ID_MODULO};
use gather::Gather;
use media::CanMedia;
use scatter::Scatter;
pub use tracer::CanTracer;

/// Reassembly state entries idle longer than this multiple of the transfer-ID timeout are
/// garbage-collected once the table grows past [`REASSEMBLY_GC_THRESHOLD`].
const REASSEMBLY_GC_THRESHOLD: usize = 1024;

#[derive(Debug, Clone)]
pub struct CanTransportOptions {
    /// `None` runs the node anonymously: only single-frame messages can be emitted and no
    /// service transfers can be exchanged.
    pub local_node_id: Option<NodeId>,
    /// Transfer-ID acceptance window of the reassembler, in increments ahead of the last
    /// accepted value. Half the modulo unless a mixed-version network dictates otherwise.
    pub transfer_id_window: u64,
    /// Discards partial transfers and duplicate-rejection state older than this.
    pub transfer_id_timeout: Duration,
}

impl Default for CanTransportOptions {
    fn default() -> Self {
        Self {
            local_node_id: None,
            transfer_id_window: TRANSFER_ID_MODULO / 2,
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
    reassembly: HashMap<(DataSpecifier, NodeId), Gather>,
    /// Reference counts backing the media acceptance filter requests.
    subject_refs: HashMap<crate::core::SubjectId, usize>,
    service_refs: usize,
    stats: TransportStatistics,
}

struct Inner {
    options: CanTransportOptions,
    mtu: Mtu,
    link_port: LinkPort<Frame>,
    media: Mutex<Option<Box<dyn CanMedia>>>,
    capture: CaptureRegistry,
    closed: AtomicBool,
    state: Mutex<State>,
}

/// The Cyphal/CAN transport. Cheap to clone; all clones share one instance.
#[derive(Clone)]
pub struct CanTransport {
    inner: Arc<Inner>,
}

impl CanTransport {
    pub fn new(
        mut media: Box<dyn CanMedia>,
        options: CanTransportOptions,
    ) -> Result<Self, TransportError> {
        if let Some(node_id) = options.local_node_id {
            if node_id > NodeId::MAX_CAN {
                return Err(TransportError::InvalidConfiguration(format!(
                    "node-ID {} exceeds the CAN limit of {}",
                    u16::from(node_id),
                    u16::from(NodeId::MAX_CAN),
                )));
            }
        }

        let dispatch_target: Arc<Mutex<Option<Weak<Inner>>>> = Arc::new(Mutex::new(None));
        let target = dispatch_target.clone();
        let (link_port, link) = crate::link::new(Box::new(move |frame: Frame| {
            if let Some(inner) = target.lock().as_ref().and_then(Weak::upgrade) {
                inner.dispatch(frame);
            }
        }));

        let inner = Arc::new(Inner {
            options,
            mtu: media.mtu(),
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

        media.start(link)?;
        *inner.media.lock() = Some(media);
        Ok(Self { inner })
    }

    pub fn mtu(&self) -> Mtu {
        self.inner.mtu
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

    /// Frame delivery from the media runner. Runs within one bounded critical section per
    /// interested session.
    fn dispatch(self: Arc<Self>, frame: Frame) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        // Loop-back frames only confirm transmission; egress capture happens at send time.
        if frame.loop_back {
            return;
        }
        let timestamp = Timestamp::from_monotonic(frame.timestamp);
        self.capture.emit(|| {
            Capture::Can(CanCapture {
                timestamp,
                direction: Direction::Ingress,
                frame,
            })
        });

        let mut state = self.state.lock();
        let state = &mut *state;
        state.stats.frames_in += 1;

        // Service frames not addressed to the local node are visible to capture only.
        if let Some(destination) = frame.header.destination {
            if self.options.local_node_id != Some(destination) {
                state.stats.frames_unrouted += 1;
                return;
            }
        }

        let data_spec = frame.header.data_spec;
        let selective = frame.header.source.map(|source| InputSessionSpecifier {
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

        let transfer = match frame.header.source {
            None => {
                // Anonymous transfers are single-frame; there is no reassembly state.
                match frame.data.split_last() {
                    Some((tail_byte, body)) => {
                        let tail = TailByte::from(*tail_byte);
                        if tail.sot() && tail.eot() && tail.toggle() == SOT_TOGGLE_BIT {
                            Some(TransferFrom {
                                timestamp,
                                priority: frame.header.priority,
                                transfer_id: TransferId::new(u64::from(tail.transfer_id())),
                                source_node_id: None,
                                payload: body.to_vec(),
                            })
                        } else {
                            state.stats.reassembly_errors += 1;
                            None
                        }
                    }
                    None => None,
                }
            }
            Some(source) => {
                let storage_limit = [selective.as_ref(), Some(&promiscuous)]
                    .into_iter()
                    .flatten()
                    .filter_map(|spec| state.inputs.get(spec))
                    .map(|entry| entry.payload_metadata.extent)
                    .max()
                    .unwrap_or(0);
                let gather = state
                    .reassembly
                    .entry((data_spec, source))
                    .or_insert_with(|| {
                        Gather::new(
                            self.options.transfer_id_timeout,
                            self.options.transfer_id_window,
                            storage_limit,
                        )
                    });
                let mut errors = 0u64;
                let gathered = gather.push_frame(
                    &frame.data,
                    frame.header.priority,
                    timestamp,
                    |_| errors += 1,
                );
                state.stats.reassembly_errors += errors;
                gathered.map(|g| TransferFrom {
                    timestamp: g.timestamp,
                    priority: g.priority,
                    transfer_id: TransferId::new(u64::from(g.transfer_id)),
                    source_node_id: Some(source),
                    payload: g.payload,
                })
            }
        };

        if let Some(transfer) = transfer {
            state.stats.transfers_in += 1;
            for spec in [selective, Some(promiscuous)].into_iter().flatten() {
                if let Some(entry) = state.inputs.get(&spec) {
                    let mut clone = transfer.clone();
                    clone.payload.truncate(entry.payload_metadata.extent);
                    if !entry.queue.push(clone) {
                        state.stats.queue_overflows += 1;
                    }
                }
            }
        }

        if state.reassembly.len() > REASSEMBLY_GC_THRESHOLD {
            let horizon = self.options.transfer_id_timeout * 2;
            let now = Instant::now();
            state.reassembly.retain(|_, gather| {
                gather
                    .last_activity()
                    .and_then(|at| now.checked_duration_since(at))
                    .is_none_or(|idle| idle <= horizon)
            });
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
}

struct CanRoute {
    inner: Weak<Inner>,
    specifier: OutputSessionSpecifier,
}

impl CanRoute {
    async fn send_impl(
        &self,
        transfer: &crate::transfer::Transfer,
        deadline: Instant,
    ) -> Result<bool, TransportError> {
        let inner = self.inner.upgrade().ok_or(TransportError::ResourceClosed)?;
        inner.check_open()?;

        if inner.options.local_node_id.is_none()
            && Scatter::frame_count(transfer.payload.len(), inner.mtu) > 1
        {
            // Anonymous transfers cannot be multi-frame.
            return Err(TransportError::PayloadTooLarge {
                payload_bytes: transfer.payload.len(),
                limit_bytes: usize::from(inner.mtu) - 1,
            });
        }

        let header = Header {
            priority: transfer.priority,
            data_spec: self.specifier.data_specifier,
            source: inner.options.local_node_id,
            destination: self.specifier.remote_node_id,
        };
        let mut scatter = Scatter::new(wire_transfer_id(transfer.transfer_id), &transfer.payload);
        let mut frames_out = 0u64;
        let mut complete = true;
        while let Some(data) = scatter.next_frame(inner.mtu) {
            let frame = Frame {
                header,
                data,
                timestamp: deadline,
                loop_back: false,
            };
            inner.capture.emit(|| {
                Capture::Can(CanCapture {
                    timestamp: Timestamp::now(),
                    direction: Direction::Egress,
                    frame,
                })
            });
            if !inner.link_port.send_frame(frame, deadline).await? {
                // Deadline passed mid-transfer: the remainder is abandoned.
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

impl OutputRoute for CanRoute {
    fn send<'a>(
        &'a self,
        transfer: &'a crate::transfer::Transfer,
        deadline: Instant,
    ) -> BoxFuture<'a, Result<bool, TransportError>> {
        Box::pin(self.send_impl(transfer, deadline))
    }
}

impl Transport for CanTransport {
    fn protocol_parameters(&self) -> ProtocolParameters {
        ProtocolParameters {
            transfer_id_modulo: TRANSFER_ID_MODULO,
            max_nodes: usize::from(NodeId::MAX_CAN) + 1,
            mtu: usize::from(self.inner.mtu) - 1,
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
        if let Some(remote) = specifier.remote_node_id {
            if remote > NodeId::MAX_CAN {
                return Err(TransportError::InvalidConfiguration(format!(
                    "remote node-ID {} exceeds the CAN limit",
                    u16::from(remote),
                )));
            }
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
                match specifier.remote_node_id {
                    None => {
                        return Err(TransportError::InvalidConfiguration(
                            "service transfers require a destination node-ID".into(),
                        ));
                    }
                    Some(remote) if remote > NodeId::MAX_CAN => {
                        return Err(TransportError::InvalidConfiguration(format!(
                            "remote node-ID {} exceeds the CAN limit",
                            u16::from(remote),
                        )));
                    }
                    Some(_) => {}
                }
            }
        }

        let mut state = self.inner.state.lock();
        let session = state.outputs.entry(specifier).or_insert_with(|| {
            OutputSession::new(
                specifier,
                TRANSFER_ID_MODULO,
                Box::new(CanRoute {
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
        // Promiscuous reception: ask the media to stop filtering.
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
            for node in [session.source_node_id, session.destination_node_id]
                .into_iter()
                .flatten()
            {
                if node > NodeId::MAX_CAN {
                    return Err(TransportError::InvalidConfiguration(format!(
                        "node-ID {} exceeds the CAN limit",
                        u16::from(node),
                    )));
                }
            }
            if session.source_node_id.is_none()
                && Scatter::frame_count(transfer.payload.len(), self.inner.mtu) > 1
            {
                return Err(TransportError::UnsupportedCapability(
                    "anonymous transfers cannot be multi-frame".into(),
                ));
            }
            let header = Header {
                priority: transfer.metadata.priority,
                data_spec: session.data_specifier,
                source: session.source_node_id,
                destination: session.destination_node_id,
            };
            let mut scatter = Scatter::new(
                wire_transfer_id(transfer.metadata.transfer_id),
                &transfer.payload,
            );
            while let Some(data) = scatter.next_frame(self.inner.mtu) {
                let frame = Frame {
                    header,
                    data,
                    timestamp: deadline,
                    loop_back: false,
                };
                self.inner.capture.emit(|| {
                    Capture::Can(CanCapture {
                        timestamp: Timestamp::now(),
                        direction: Direction::Egress,
                        frame,
                    })
                });
                if !self.inner.link_port.send_frame(frame, deadline).await? {
                    return Err(TransportError::Timeout);
                }
            }
            Ok(())
        })
    }

    fn make_tracer(&self) -> Box<dyn Tracer> {
        Box::new(CanTracer::new(
            self.inner.options.transfer_id_timeout,
            self.inner.options.transfer_id_window,
        ))
    }

    fn close(&self) {
        self.inner.close();
    }
}

impl core::fmt::Debug for CanTransport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CanTransport")
            .field("local_node_id", &self.inner.options.local_node_id)
            .field("mtu", &self.inner.mtu)
            .finish_non_exhaustive()
    }
}

pub use media::MemoryBus;
