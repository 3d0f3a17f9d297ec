//! Redundant pseudo-transport
//!
//! Presents the [`Transport`] facade over any number of inferior transports, possibly of
//! dissimilar kinds (e.g. CAN alongside UDP). On the receive path each inferior feeds a
//! per-session [`dedup::Deduplicator`]; the first successfully reassembled copy of a
//! transfer wins. On the transmit path the transfer is submitted to every inferior
//! concurrently and `send` resolves as soon as the first inferior accepts it, while the
//! laggards continue in the background driven by the [`RedundantRunner`] task the user
//! spawns alongside the transport.
//!
//! Inferiors may be attached and detached at runtime. Transfer-ID counters live in the
//! pseudo-transport's own output sessions, so attaching an inferior never resets sequence
//! numbers.

use core::future::{poll_fn, Future};
use core::task::{Poll, Waker};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::with_deadline;
use parking_lot::Mutex;

use crate::core::{DataSpecifier, NodeId, TransferId};
use crate::time::{Duration, Instant};
use crate::transfer::{AlienTransfer, Transfer, TransferFrom};
use crate::transport::capture::{Capture, CaptureHandler, Trace, Tracer};
use crate::transport::error::TransportError;
use crate::transport::session::{
    InputQueue, InputSession, InputSessionSpecifier, OutputRoute, OutputSession,
    OutputSessionSpecifier, PayloadMetadata, INPUT_QUEUE_DEPTH,
};
use crate::transport::{BoxFuture, ProtocolParameters, Transport, TransportStatistics};

mod dedup;

use dedup::Deduplicator;

const FORWARD_QUEUE_DEPTH: usize = 16;

type ForwardQueue = Channel<CriticalSectionRawMutex, Arc<Outbound>, FORWARD_QUEUE_DEPTH>;

#[derive(Debug, Clone)]
pub struct RedundantTransportOptions {
    /// Governs deduplicator interface failover and inferior session behavior.
    pub transfer_id_timeout: Duration,
}

impl Default for RedundantTransportOptions {
    fn default() -> Self {
        Self {
            transfer_id_timeout: Duration::from_secs(2),
        }
    }
}

struct Outbound {
    specifier: OutputSessionSpecifier,
    transfer: Transfer,
    deadline: Instant,
    status: OutboundStatus,
}

#[derive(Default)]
struct StatusState {
    expected: usize,
    successes: usize,
    timeouts: usize,
    errors: usize,
    last_error: Option<TransportError>,
    wakers: Vec<Waker>,
}

struct OutboundStatus {
    state: Mutex<StatusState>,
}

enum Outcome {
    /// At least one inferior accepted the transfer.
    Accepted,
    /// Every inferior timed out before accepting.
    Expired,
    /// Every inferior errored out.
    Failed(TransportError),
}

impl OutboundStatus {
    fn new(expected: usize) -> Self {
        Self {
            state: Mutex::new(StatusState {
                expected,
                ..Default::default()
            }),
        }
    }

    fn record(&self, result: Result<bool, TransportError>) {
        let wakers = {
            let mut state = self.state.lock();
            match result {
                Ok(true) => state.successes += 1,
                Ok(false) => state.timeouts += 1,
                Err(error) => {
                    state.errors += 1;
                    state.last_error = Some(error);
                }
            }
            core::mem::take(&mut state.wakers)
        };
        for waker in wakers {
            waker.wake();
        }
    }

    /// Resolves on the first success or once every inferior has reported.
    async fn wait(&self) -> Outcome {
        poll_fn(|cx| {
            let mut state = self.state.lock();
            if state.successes > 0 {
                return Poll::Ready(Outcome::Accepted);
            }
            if state.timeouts + state.errors >= state.expected {
                return Poll::Ready(if state.errors == state.expected {
                    Outcome::Failed(
                        state
                            .last_error
                            .clone()
                            .unwrap_or(TransportError::SendFailed("inferior failure".into())),
                    )
                } else {
                    Outcome::Expired
                });
            }
            if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                state.wakers.push(cx.waker().clone());
            }
            Poll::Pending
        })
        .await
    }
}

struct Inferior {
    iface_id: usize,
    transport: Arc<dyn Transport>,
    forward_queue: Arc<ForwardQueue>,
}

struct InputEntry {
    queue: Arc<InputQueue>,
    payload_metadata: PayloadMetadata,
    deduplicator: Arc<Mutex<Deduplicator>>,
    inferior_sessions: Vec<(usize, InputSession)>,
}

struct Inner {
    options: RedundantTransportOptions,
    inferiors: Mutex<Vec<Inferior>>,
    next_iface_id: AtomicUsize,
    /// Bumped on attach/detach; the runner rebuilds its forwarder set on change.
    generation: AtomicU64,
    runner_waker: Mutex<Option<Waker>>,
    inputs: Mutex<HashMap<InputSessionSpecifier, InputEntry>>,
    outputs: Mutex<HashMap<OutputSessionSpecifier, OutputSession>>,
    capture_handlers: Mutex<Vec<CaptureHandler>>,
    closed: AtomicBool,
}

impl Inner {
    fn check_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::ResourceClosed)
        } else {
            Ok(())
        }
    }

    fn wake_runner(&self) {
        if let Some(waker) = self.runner_waker.lock().take() {
            waker.wake();
        }
    }

    fn min_transfer_id_modulo(&self) -> u64 {
        self.inferiors
            .lock()
            .iter()
            .map(|i| i.transport.protocol_parameters().transfer_id_modulo)
            .min()
            .unwrap_or(TransferId::UNBOUNDED_MODULO)
    }

    fn install_hook(
        &self,
        entry_queue: &Arc<InputQueue>,
        deduplicator: &Arc<Mutex<Deduplicator>>,
        iface_id: usize,
        session: &InputSession,
    ) {
        let queue = entry_queue.clone();
        let deduplicator = deduplicator.clone();
        let timeout = self.options.transfer_id_timeout;
        session
            .queue()
            .set_delivery_hook(Box::new(move |transfer: TransferFrom| {
                let accept = deduplicator.lock().should_accept(
                    iface_id,
                    timeout,
                    transfer.timestamp,
                    transfer.source_node_id,
                    transfer.transfer_id,
                );
                if accept {
                    queue.push(transfer);
                }
            }));
    }

    fn detach_input(&self, specifier: InputSessionSpecifier) {
        let Some(entry) = self.inputs.lock().remove(&specifier) else {
            return;
        };
        entry.queue.close();
        for (_, session) in entry.inferior_sessions {
            session.close();
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for entry in self.inputs.lock().values() {
            entry.queue.close();
            for (_, session) in &entry.inferior_sessions {
                session.close();
            }
        }
        for session in self.outputs.lock().values() {
            session.close();
        }
        for inferior in self.inferiors.lock().iter() {
            inferior.transport.close();
        }
        self.wake_runner();
    }
}

/// The redundant pseudo-transport handle. Cheap to clone; all clones share one instance.
#[derive(Clone)]
pub struct RedundantTransport {
    inner: Arc<Inner>,
}

impl RedundantTransport {
    /// Creates an empty pseudo-transport and its background runner. The runner future
    /// must be spawned for the transmit path to make progress.
    pub fn new(options: RedundantTransportOptions) -> (Self, RedundantRunner) {
        let inner = Arc::new(Inner {
            options,
            inferiors: Mutex::new(Vec::new()),
            next_iface_id: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
            runner_waker: Mutex::new(None),
            inputs: Mutex::new(HashMap::new()),
            outputs: Mutex::new(HashMap::new()),
            capture_handlers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        (
            Self {
                inner: inner.clone(),
            },
            RedundantRunner { inner },
        )
    }

    /// Adds an inferior transport. All inferiors must agree on the local node-ID.
    ///
    /// Existing redundant sessions immediately extend onto the new inferior; output
    /// transfer-ID counters are unaffected.
    pub fn attach_inferior(
        &self,
        transport: Arc<dyn Transport>,
    ) -> Result<usize, TransportError> {
        self.inner.check_open()?;
        // The inferior and input locks are never held together (see input_session).
        {
            let inferiors = self.inner.inferiors.lock();
            if let Some(existing) = inferiors.first() {
                if existing.transport.local_node_id() != transport.local_node_id() {
                    return Err(TransportError::InvalidConfiguration(format!(
                        "inferior node-ID {:?} conflicts with the group's {:?}",
                        transport.local_node_id(),
                        existing.transport.local_node_id(),
                    )));
                }
            }
        }
        let iface_id = self.inner.next_iface_id.fetch_add(1, Ordering::SeqCst);

        // Extend existing input sessions onto the new inferior.
        {
            let mut inputs = self.inner.inputs.lock();
            for (specifier, entry) in inputs.iter_mut() {
                let session = transport.input_session(*specifier, entry.payload_metadata)?;
                self.inner
                    .install_hook(&entry.queue, &entry.deduplicator, iface_id, &session);
                entry.inferior_sessions.push((iface_id, session));
            }
        }

        for handler in self.inner.capture_handlers.lock().iter() {
            transport.begin_capture(handler.clone());
        }

        self.inner.inferiors.lock().push(Inferior {
            iface_id,
            transport,
            forward_queue: Arc::new(Channel::new()),
        });

        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.wake_runner();
        Ok(iface_id)
    }

    /// Removes an inferior by the identifier returned from [`Self::attach_inferior`].
    /// Its sessions are closed; transfers already forwarded to it may still go out.
    pub fn detach_inferior(&self, iface_id: usize) -> Result<(), TransportError> {
        let mut inferiors = self.inner.inferiors.lock();
        let index = inferiors
            .iter()
            .position(|i| i.iface_id == iface_id)
            .ok_or_else(|| {
                TransportError::InvalidConfiguration(format!("unknown inferior {iface_id}"))
            })?;
        inferiors.remove(index);
        drop(inferiors);

        for entry in self.inner.inputs.lock().values_mut() {
            entry.inferior_sessions.retain(|(id, session)| {
                if *id == iface_id {
                    session.close();
                    false
                } else {
                    true
                }
            });
        }

        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.wake_runner();
        Ok(())
    }

    pub fn inferior_count(&self) -> usize {
        self.inner.inferiors.lock().len()
    }
}

struct RedundantRoute {
    inner: Weak<Inner>,
    specifier: OutputSessionSpecifier,
}

impl RedundantRoute {
    async fn send_impl(
        &self,
        transfer: &Transfer,
        deadline: Instant,
    ) -> Result<bool, TransportError> {
        let inner = self.inner.upgrade().ok_or(TransportError::ResourceClosed)?;
        inner.check_open()?;

        let queues: Vec<Arc<ForwardQueue>> = inner
            .inferiors
            .lock()
            .iter()
            .map(|i| i.forward_queue.clone())
            .collect();
        if queues.is_empty() {
            return Err(TransportError::SendFailed(
                "the redundant transport has no inferiors".into(),
            ));
        }

        let outbound = Arc::new(Outbound {
            specifier: self.specifier,
            transfer: transfer.clone(),
            deadline,
            status: OutboundStatus::new(queues.len()),
        });
        for queue in &queues {
            match with_deadline(deadline, queue.send(outbound.clone())).await {
                Ok(()) => {}
                Err(_timeout) => outbound.status.record(Ok(false)),
            }
        }

        match with_deadline(deadline, outbound.status.wait()).await {
            Ok(Outcome::Accepted) => Ok(true),
            Ok(Outcome::Expired) | Err(_) => Ok(false),
            Ok(Outcome::Failed(error)) => Err(TransportError::SendFailed(format!(
                "every inferior failed; last error: {error}"
            ))),
        }
    }
}

impl OutputRoute for RedundantRoute {
    fn send<'a>(
        &'a self,
        transfer: &'a Transfer,
        deadline: Instant,
    ) -> BoxFuture<'a, Result<bool, TransportError>> {
        Box::pin(self.send_impl(transfer, deadline))
    }
}

/// Drives the transmit-path forwarders of a [`RedundantTransport`].
///
/// Spawn `run()` on the same executor as the rest of the stack; it completes when the
/// transport is closed.
pub struct RedundantRunner {
    inner: Arc<Inner>,
}

async fn run_forwarder(transport: Arc<dyn Transport>, queue: Arc<ForwardQueue>) {
    loop {
        let outbound = queue.receive().await;
        let result = match transport.output_session(outbound.specifier) {
            Ok(session) => {
                session
                    .send(outbound.transfer.clone(), outbound.deadline)
                    .await
            }
            Err(error) => Err(error),
        };
        if let Err(error) = &result {
            log::debug!(
                "inferior send on {:?} failed: {error}",
                outbound.specifier.data_specifier,
            );
        }
        outbound.status.record(result);
    }
}

impl RedundantRunner {
    pub async fn run(self) {
        let inner = self.inner;
        let mut forwarders: HashMap<usize, BoxFuture<'static, ()>> = HashMap::new();
        let mut seen_generation = u64::MAX;
        poll_fn(move |cx| {
            if inner.closed.load(Ordering::SeqCst) {
                return Poll::Ready(());
            }
            *inner.runner_waker.lock() = Some(cx.waker().clone());

            let generation = inner.generation.load(Ordering::SeqCst);
            if generation != seen_generation {
                seen_generation = generation;
                let current: Vec<(usize, Arc<dyn Transport>, Arc<ForwardQueue>)> = inner
                    .inferiors
                    .lock()
                    .iter()
                    .map(|i| (i.iface_id, i.transport.clone(), i.forward_queue.clone()))
                    .collect();
                forwarders.retain(|id, _| current.iter().any(|(cid, _, _)| cid == id));
                for (iface_id, transport, queue) in current {
                    forwarders
                        .entry(iface_id)
                        .or_insert_with(|| Box::pin(run_forwarder(transport, queue)));
                }
            }

            for forwarder in forwarders.values_mut() {
                // Forwarder loops never complete; they park on their queues.
                let _ = forwarder.as_mut().poll(cx);
            }
            Poll::Pending
        })
        .await
    }
}

impl Transport for RedundantTransport {
    fn protocol_parameters(&self) -> ProtocolParameters {
        let inferiors = self.inner.inferiors.lock();
        let mut parameters = ProtocolParameters {
            transfer_id_modulo: TransferId::UNBOUNDED_MODULO,
            max_nodes: 0,
            mtu: 0,
        };
        for inferior in inferiors.iter() {
            let p = inferior.transport.protocol_parameters();
            parameters.transfer_id_modulo = parameters.transfer_id_modulo.min(p.transfer_id_modulo);
            parameters.max_nodes = if parameters.max_nodes == 0 {
                p.max_nodes
            } else {
                parameters.max_nodes.min(p.max_nodes)
            };
            parameters.mtu = if parameters.mtu == 0 {
                p.mtu
            } else {
                parameters.mtu.min(p.mtu)
            };
        }
        parameters
    }

    fn local_node_id(&self) -> Option<NodeId> {
        self.inner
            .inferiors
            .lock()
            .first()
            .and_then(|i| i.transport.local_node_id())
    }

    fn input_session(
        &self,
        specifier: InputSessionSpecifier,
        payload_metadata: PayloadMetadata,
    ) -> Result<InputSession, TransportError> {
        self.inner.check_open()?;
        // Snapshot the inferiors first; the inferior and input locks are never held
        // together (see attach_inferior).
        let snapshot: Vec<(usize, Arc<dyn Transport>)> = self
            .inner
            .inferiors
            .lock()
            .iter()
            .map(|i| (i.iface_id, i.transport.clone()))
            .collect();
        let modulo = self.inner.min_transfer_id_modulo();

        let mut inputs = self.inner.inputs.lock();
        if let Some(entry) = inputs.get(&specifier) {
            let inner = self.inner.clone();
            return Ok(InputSession::new(
                specifier,
                entry.payload_metadata,
                entry.queue.clone(),
                Arc::new(move || inner.detach_input(specifier)),
            ));
        }

        let queue = Arc::new(InputQueue::new(INPUT_QUEUE_DEPTH));
        let deduplicator = Arc::new(Mutex::new(Deduplicator::new(modulo)));
        let mut inferior_sessions = Vec::new();
        for (iface_id, transport) in snapshot {
            let session = transport.input_session(specifier, payload_metadata)?;
            self.inner
                .install_hook(&queue, &deduplicator, iface_id, &session);
            inferior_sessions.push((iface_id, session));
        }
        inputs.insert(
            specifier,
            InputEntry {
                queue: queue.clone(),
                payload_metadata,
                deduplicator,
                inferior_sessions,
            },
        );

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
            DataSpecifier::Message(_) if specifier.remote_node_id.is_some() => {
                return Err(TransportError::InvalidConfiguration(
                    "message transfers are broadcast; a destination cannot be specified".into(),
                ));
            }
            DataSpecifier::Request(_) | DataSpecifier::Response(_)
                if specifier.remote_node_id.is_none() =>
            {
                return Err(TransportError::InvalidConfiguration(
                    "service transfers require a destination node-ID".into(),
                ));
            }
            _ => {}
        }

        let modulo = self.inner.min_transfer_id_modulo();
        let mut outputs = self.inner.outputs.lock();
        let session = outputs.entry(specifier).or_insert_with(|| {
            OutputSession::new(
                specifier,
                modulo,
                Box::new(RedundantRoute {
                    inner: Arc::downgrade(&self.inner),
                    specifier,
                }),
            )
        });
        Ok(session.clone())
    }

    fn sample_statistics(&self) -> TransportStatistics {
        let mut total = TransportStatistics::default();
        for inferior in self.inner.inferiors.lock().iter() {
            let stats = inferior.transport.sample_statistics();
            total.frames_in += stats.frames_in;
            total.frames_out += stats.frames_out;
            total.transfers_in += stats.transfers_in;
            total.transfers_out += stats.transfers_out;
            total.frames_unrouted += stats.frames_unrouted;
            total.reassembly_errors += stats.reassembly_errors;
            total.queue_overflows += stats.queue_overflows;
            total.frames_malformed += stats.frames_malformed;
        }
        total
    }

    fn begin_capture(&self, handler: CaptureHandler) {
        self.inner.capture_handlers.lock().push(handler.clone());
        for inferior in self.inner.inferiors.lock().iter() {
            inferior.transport.begin_capture(handler.clone());
        }
    }

    fn spoof<'a>(
        &'a self,
        transfer: &'a AlienTransfer,
        deadline: Instant,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            self.inner.check_open()?;
            let inferiors: Vec<Arc<dyn Transport>> = self
                .inner
                .inferiors
                .lock()
                .iter()
                .map(|i| i.transport.clone())
                .collect();
            if inferiors.is_empty() {
                return Err(TransportError::SendFailed(
                    "the redundant transport has no inferiors".into(),
                ));
            }
            let mut last_error = None;
            let mut delivered = false;
            for inferior in inferiors {
                match inferior.spoof(transfer, deadline).await {
                    Ok(()) => delivered = true,
                    Err(error) => last_error = Some(error),
                }
            }
            if delivered {
                Ok(())
            } else {
                Err(last_error.unwrap_or(TransportError::SendFailed("spoof failed".into())))
            }
        })
    }

    fn make_tracer(&self) -> Box<dyn Tracer> {
        let tracers = self
            .inner
            .inferiors
            .lock()
            .iter()
            .map(|i| i.transport.make_tracer())
            .collect();
        Box::new(RedundantTracer { tracers })
    }

    fn close(&self) {
        self.inner.close();
    }
}

impl core::fmt::Debug for RedundantTransport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedundantTransport")
            .field("inferiors", &self.inner.inferiors.lock().len())
            .finish_non_exhaustive()
    }
}

/// Dispatches captures to the per-inferior tracers by capture kind.
///
/// Transfers observed on several inferiors are reported once per inferior; transfer-level
/// deduplication of traces would hide genuine link asymmetries from the analyst.
pub struct RedundantTracer {
    tracers: Vec<Box<dyn Tracer>>,
}

impl Tracer for RedundantTracer {
    fn update(&mut self, capture: &Capture) -> Option<Trace> {
        self.tracers.iter_mut().find_map(|t| t.update(capture))
    }
}
