//! Session objects shared by all transports
//!
//! A session owns the state of communication with one remote peer (or all peers, for
//! promiscuous subscriptions) over one data specifier. The queue and wake-up machinery is
//! transport-agnostic; transports plug in their own frame (de)fragmentation through
//! [`OutputRoute`] and by pushing reassembled transfers into the session queues from their
//! media dispatch context.

use core::future::poll_fn;
use core::task::{Poll, Waker};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use embassy_time::with_deadline;
use parking_lot::Mutex;

use crate::core::{DataSpecifier, NodeId, TransferId};
use crate::time::Instant;
use crate::transfer::{Transfer, TransferFrom};
use crate::transport::error::TransportError;
use crate::transport::BoxFuture;

/// Addresses an input session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputSessionSpecifier {
    pub data_specifier: DataSpecifier,
    /// `None` accepts transfers from any source (promiscuous), including anonymous ones.
    pub remote_node_id: Option<NodeId>,
}

/// Addresses an output session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputSessionSpecifier {
    pub data_specifier: DataSpecifier,
    /// `None` broadcasts (messages); `Some` targets one node (services).
    pub remote_node_id: Option<NodeId>,
}

/// Properties of the payload exchanged through a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadMetadata {
    /// The maximum serialized size declared by the DSDL type; reassembled payloads are
    /// truncated to this value before delivery.
    pub extent: usize,
}

/// Default depth of a session receive queue.
pub(crate) const INPUT_QUEUE_DEPTH: usize = 32;

type DeliveryHook = Box<dyn Fn(TransferFrom) + Send + Sync>;

struct InputQueueState {
    queue: VecDeque<TransferFrom>,
    wakers: Vec<Waker>,
    hook: Option<DeliveryHook>,
    closed: bool,
    overflows: u64,
}

/// The receive side of a session: a bounded transfer queue with multi-waiter wake-up
pub(crate) struct InputQueue {
    state: Mutex<InputQueueState>,
    capacity: usize,
}

impl InputQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(InputQueueState {
                queue: VecDeque::new(),
                wakers: Vec::new(),
                hook: None,
                closed: false,
                overflows: 0,
            }),
            capacity,
        }
    }

    /// Delivers one transfer. When the queue is full the oldest entry is dropped so that a
    /// stalled consumer observes the freshest traffic. Returns false on overflow.
    pub(crate) fn push(&self, transfer: TransferFrom) -> bool {
        let (wakers, fit) = {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            if let Some(hook) = &state.hook {
                hook(transfer);
                return true;
            }
            let mut fit = true;
            if state.queue.len() >= self.capacity {
                state.queue.pop_front();
                state.overflows += 1;
                fit = false;
            }
            state.queue.push_back(transfer);
            (core::mem::take(&mut state.wakers), fit)
        };
        for waker in wakers {
            waker.wake();
        }
        fit
    }

    pub(crate) fn try_pop(&self) -> Option<TransferFrom> {
        self.state.lock().queue.pop_front()
    }

    /// Resolves to `None` once the queue is closed and drained.
    pub(crate) async fn pop(&self) -> Option<TransferFrom> {
        poll_fn(|cx| {
            let mut state = self.state.lock();
            if let Some(transfer) = state.queue.pop_front() {
                return Poll::Ready(Some(transfer));
            }
            if state.closed {
                return Poll::Ready(None);
            }
            if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                state.wakers.push(cx.waker().clone());
            }
            Poll::Pending
        })
        .await
    }

    /// Registers interest in the next delivery or closure without consuming anything.
    /// Used by composite consumers that wait on several sessions at once.
    pub(crate) fn register_waker(&self, waker: &Waker) -> bool {
        let mut state = self.state.lock();
        if !state.queue.is_empty() || state.closed {
            return true;
        }
        if !state.wakers.iter().any(|w| w.will_wake(waker)) {
            state.wakers.push(waker.clone());
        }
        false
    }

    /// Redirects deliveries into the hook instead of the queue. The hook runs in the
    /// transport's dispatch context and must not block.
    pub(crate) fn set_delivery_hook(&self, hook: DeliveryHook) {
        self.state.lock().hook = Some(hook);
    }

    pub(crate) fn overflows(&self) -> u64 {
        self.state.lock().overflows
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub(crate) fn close(&self) {
        let wakers = {
            let mut state = self.state.lock();
            state.closed = true;
            core::mem::take(&mut state.wakers)
        };
        for waker in wakers {
            waker.wake();
        }
    }
}

/// Receives transfers addressed by one [`InputSessionSpecifier`]
///
/// Handles are cheap clones of the shared session state owned by the parent transport.
/// Closing any handle closes the session for all of them and detaches it from the
/// transport.
pub struct InputSession {
    specifier: InputSessionSpecifier,
    payload_metadata: PayloadMetadata,
    queue: Arc<InputQueue>,
    detach: Arc<dyn Fn() + Send + Sync>,
}

impl Clone for InputSession {
    fn clone(&self) -> Self {
        Self {
            specifier: self.specifier,
            payload_metadata: self.payload_metadata,
            queue: self.queue.clone(),
            detach: self.detach.clone(),
        }
    }
}

impl InputSession {
    pub(crate) fn new(
        specifier: InputSessionSpecifier,
        payload_metadata: PayloadMetadata,
        queue: Arc<InputQueue>,
        detach: Arc<dyn Fn() + Send + Sync>,
    ) -> Self {
        Self {
            specifier,
            payload_metadata,
            queue,
            detach,
        }
    }

    pub fn specifier(&self) -> InputSessionSpecifier {
        self.specifier
    }

    pub fn payload_metadata(&self) -> PayloadMetadata {
        self.payload_metadata
    }

    /// Awaits the next transfer.
    ///
    /// Returns `None` when the deadline expires or the session is closed.
    pub async fn receive(&self, deadline: Instant) -> Option<TransferFrom> {
        match with_deadline(deadline, self.queue.pop()).await {
            Ok(transfer) => transfer,
            Err(_timeout) => None,
        }
    }

    /// Awaits the next transfer with no deadline; `None` only on closure.
    pub async fn receive_forever(&self) -> Option<TransferFrom> {
        self.queue.pop().await
    }

    pub fn try_receive(&self) -> Option<TransferFrom> {
        self.queue.try_pop()
    }

    /// Transfers dropped due to receive queue overflow.
    pub fn sample_overflows(&self) -> u64 {
        self.queue.overflows()
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    /// Closes the session and detaches it from the parent transport. Idempotent.
    pub fn close(&self) {
        self.queue.close();
        (self.detach)();
    }

    pub(crate) fn queue(&self) -> &Arc<InputQueue> {
        &self.queue
    }
}

/// Transport-specific egress path behind an [`OutputSession`]
pub(crate) trait OutputRoute: Send + Sync {
    /// Fragments and enqueues the transfer. `Ok(false)` on deadline expiry; frames already
    /// enqueued at that point are not revoked.
    fn send<'a>(
        &'a self,
        transfer: &'a Transfer,
        deadline: Instant,
    ) -> BoxFuture<'a, Result<bool, TransportError>>;
}

struct OutputShared {
    specifier: OutputSessionSpecifier,
    transfer_id_modulo: u64,
    next_transfer_id: AtomicU64,
    route: Box<dyn OutputRoute>,
    /// Serializes sends so each transfer's frames stay contiguous within the session.
    send_lock: embassy_sync::mutex::Mutex<
        embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex,
        (),
    >,
    closed: std::sync::atomic::AtomicBool,
    transfers_sent: AtomicU64,
}

/// Transmits transfers addressed by one [`OutputSessionSpecifier`]
///
/// Sessions are shared: every port with the same specifier holds a clone of the same state,
/// including the transfer-ID counter.
#[derive(Clone)]
pub struct OutputSession {
    shared: Arc<OutputShared>,
}

impl std::fmt::Debug for OutputSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputSession")
            .field("specifier", &self.shared.specifier)
            .finish()
    }
}

impl OutputSession {
    pub(crate) fn new(
        specifier: OutputSessionSpecifier,
        transfer_id_modulo: u64,
        route: Box<dyn OutputRoute>,
    ) -> Self {
        Self {
            shared: Arc::new(OutputShared {
                specifier,
                transfer_id_modulo,
                next_transfer_id: AtomicU64::new(0),
                route,
                send_lock: embassy_sync::mutex::Mutex::new(()),
                closed: std::sync::atomic::AtomicBool::new(false),
                transfers_sent: AtomicU64::new(0),
            }),
        }
    }

    pub fn specifier(&self) -> OutputSessionSpecifier {
        self.shared.specifier
    }

    /// Allocates the next transfer-ID of this session's shared counter.
    pub fn next_transfer_id(&self) -> TransferId {
        let modulo = self.shared.transfer_id_modulo;
        let raw = self
            .shared
            .next_transfer_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |value| {
                Some(TransferId::new(value).next_modulo(modulo).into_u64())
            })
            .unwrap_or(0);
        TransferId::new(raw)
    }

    /// The transfer-ID the next [`Self::next_transfer_id`] call would return.
    pub fn peek_transfer_id(&self) -> TransferId {
        TransferId::new(self.shared.next_transfer_id.load(Ordering::SeqCst))
    }

    /// Emits one transfer.
    ///
    /// Transfers are emitted in the order the calls were accepted; each transfer's frames
    /// are contiguous with respect to this session. Returns `Ok(false)` when the deadline
    /// expired before all frames were accepted by the media queue.
    pub async fn send(
        &self,
        transfer: Transfer,
        deadline: Instant,
    ) -> Result<bool, TransportError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ResourceClosed);
        }
        let _guard = self.shared.send_lock.lock().await;
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ResourceClosed);
        }
        let sent = self.shared.route.send(&transfer, deadline).await?;
        if sent {
            self.shared.transfers_sent.fetch_add(1, Ordering::Relaxed);
        }
        Ok(sent)
    }

    /// Allocates the next transfer-ID and emits in one step, keeping concurrent callers'
    /// transfer-IDs in emission order.
    ///
    /// Returns the transfer-ID used, or `None` when the deadline expired.
    pub async fn send_sequenced(
        &self,
        priority: crate::core::Priority,
        payload: Vec<u8>,
        deadline: Instant,
    ) -> Result<Option<TransferId>, TransportError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ResourceClosed);
        }
        let _guard = self.shared.send_lock.lock().await;
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ResourceClosed);
        }
        let transfer_id = self.next_transfer_id();
        let transfer = Transfer {
            priority,
            transfer_id,
            payload,
        };
        let sent = self.shared.route.send(&transfer, deadline).await?;
        if sent {
            self.shared.transfers_sent.fetch_add(1, Ordering::Relaxed);
            Ok(Some(transfer_id))
        } else {
            Ok(None)
        }
    }

    pub fn sample_transfer_count(&self) -> u64 {
        self.shared.transfers_sent.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
    }
}
