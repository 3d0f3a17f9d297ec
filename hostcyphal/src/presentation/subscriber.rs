//! Message subscription port with fan-out

use core::future::poll_fn;
use core::marker::PhantomData;
use core::task::Poll;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use embassy_time::with_deadline;
use parking_lot::Mutex;

use crate::core::SubjectId;
use crate::encoding::Deserialize;
use crate::presentation::PresentationInner;
use crate::time::Instant;
use crate::transfer::TransferFrom;
use crate::transport::session::{InputQueue, InputSession};

/// Per-subscriber delivery queue depth.
const SLOT_DEPTH: usize = 32;

/// The shared fan-out node of one subject: one transport input session feeding any number
/// of subscriber slots. Whichever subscriber polls first drains the session and
/// distributes to every slot; the others are woken by their slots filling up.
pub(crate) struct Subscription {
    subject: SubjectId,
    session: InputSession,
    slots: Mutex<HashMap<usize, Arc<InputQueue>>>,
    next_slot_id: std::sync::atomic::AtomicUsize,
    presentation: Weak<PresentationInner>,
}

impl Subscription {
    pub(crate) fn new(
        subject: SubjectId,
        session: InputSession,
        presentation: Weak<PresentationInner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            subject,
            session,
            slots: Mutex::new(HashMap::new()),
            next_slot_id: std::sync::atomic::AtomicUsize::new(0),
            presentation,
        })
    }

    fn add_slot(&self) -> (usize, Arc<InputQueue>) {
        let id = self.next_slot_id.fetch_add(1, Ordering::SeqCst);
        let queue = Arc::new(InputQueue::new(SLOT_DEPTH));
        self.slots.lock().insert(id, queue.clone());
        (id, queue)
    }

    fn remove_slot(&self, id: usize) {
        let mut slots = self.slots.lock();
        if let Some(queue) = slots.remove(&id) {
            queue.close();
        }
        if slots.is_empty() {
            // The last subscriber is gone: tear the session down.
            self.session.close();
            if let Some(presentation) = self.presentation.upgrade() {
                presentation.forget_subscription(self.subject);
            }
        }
    }

    /// Moves everything the transport has queued into the subscriber slots.
    fn pump(&self) {
        while let Some(transfer) = self.session.try_receive() {
            let slots = self.slots.lock();
            for queue in slots.values() {
                queue.push(transfer.clone());
            }
        }
    }
}

/// Receives typed messages from one subject.
///
/// Every subscriber observes the full transfer stream of the subject independently of its
/// siblings. Malformed payloads are skipped and counted, never surfaced as errors, so a
/// single faulty publisher cannot take the stream down.
pub struct Subscriber<T> {
    subscription: Arc<Subscription>,
    slot_id: usize,
    slot: Arc<InputQueue>,
    deserialization_failures: Arc<AtomicU64>,
    _phantom: PhantomData<fn(&T)>,
}

impl<T: Deserialize> Subscriber<T> {
    pub(crate) fn new(subscription: Arc<Subscription>) -> Self {
        let (slot_id, slot) = subscription.add_slot();
        Self {
            subscription,
            slot_id,
            slot,
            deserialization_failures: Arc::new(AtomicU64::new(0)),
            _phantom: PhantomData,
        }
    }

    /// Awaits the next message.
    ///
    /// Returns `None` when the deadline expires or the port is closed. The metadata
    /// carries the raw payload alongside the timestamp, source, and transfer-ID.
    pub async fn receive(&self, deadline: Instant) -> Option<(T, TransferFrom)> {
        match with_deadline(deadline, self.receive_inner()).await {
            Ok(result) => result,
            Err(_timeout) => None,
        }
    }

    /// Awaits the next message with no deadline; `None` only on closure.
    pub async fn receive_forever(&self) -> Option<(T, TransferFrom)> {
        self.receive_inner().await
    }

    async fn receive_inner(&self) -> Option<(T, TransferFrom)> {
        loop {
            if let Some(transfer) = self.slot.try_pop() {
                match T::deserialize_from_bytes(&transfer.payload) {
                    Ok(message) => return Some((message, transfer)),
                    Err(_) => {
                        self.deserialization_failures.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                }
            }
            if self.slot.is_closed() || self.subscription.session.is_closed() {
                // Drain residue before reporting closure.
                if let Some(transfer) = self.slot.try_pop() {
                    match T::deserialize_from_bytes(&transfer.payload) {
                        Ok(message) => return Some((message, transfer)),
                        Err(_) => {
                            self.deserialization_failures.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                    }
                }
                return None;
            }
            self.subscription.pump();
            // Park on both the own slot and the shared session; resolves immediately if
            // the pump above delivered anything.
            poll_fn(|cx| {
                let slot_ready = self.slot.register_waker(cx.waker());
                let session_ready = self.subscription.session.queue().register_waker(cx.waker());
                if slot_ready || session_ready {
                    Poll::Ready(())
                } else {
                    Poll::Pending
                }
            })
            .await;
        }
    }

    /// Non-blocking receive.
    pub fn try_receive(&self) -> Option<(T, TransferFrom)> {
        loop {
            self.subscription.pump();
            let transfer = self.slot.try_pop()?;
            match T::deserialize_from_bytes(&transfer.payload) {
                Ok(message) => return Some((message, transfer)),
                Err(_) => {
                    self.deserialization_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Runs the handler for every received message until the port is closed.
    ///
    /// The returned future must be spawned by the caller; the stack does not own an
    /// executor.
    pub async fn receive_in_background(self, mut handler: impl FnMut(T, &TransferFrom)) {
        while let Some((message, metadata)) = self.receive_forever().await {
            handler(message, &metadata);
        }
    }

    /// Payloads that failed to deserialize and were skipped.
    pub fn sample_deserialization_failures(&self) -> u64 {
        self.deserialization_failures.load(Ordering::Relaxed)
    }

    /// Transfers dropped because this subscriber lagged behind the stream.
    pub fn sample_overflows(&self) -> u64 {
        self.slot.overflows()
    }
}

impl<T> Drop for Subscriber<T> {
    fn drop(&mut self) {
        self.subscription.remove_slot(self.slot_id);
    }
}

impl<T> core::fmt::Debug for Subscriber<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Subscriber")
            .field("subject", &self.subscription.subject)
            .finish_non_exhaustive()
    }
}
