//! Channels connecting a media driver and a Hostcyphal transport
//!
//! The stack side constructs the link and keeps the [`LinkPort`]; the [`Link`] half is handed
//! to the driver. Driver runners pull outbound frames and push received frames; an inbound
//! push dispatches straight into the owning transport within a bounded critical section.

use core::future::poll_fn;
use core::task::{Poll, Waker};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::with_deadline;
use hostcyphal_core::{NodeId, SubjectId};
use parking_lot::Mutex;

use crate::time::Instant;

/// Receiver filter update request
///
/// Range removal requests may cover the entire ID range. The driver should process range
/// requests with complexity bounded by the number of removed or remaining entries, not the
/// range size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterUpdate {
    AddSubject(SubjectId),
    RemoveSubjectRange([SubjectId; 2]),
    AddDestination(NodeId),
    RemoveDestinationRange([NodeId; 2]),
    /// Disable filtering altogether (promiscuous capture). Irreversible for the link
    /// lifetime; add/remove requests received afterwards keep maintaining their sets so
    /// the driver may narrow again after a restart.
    AcceptAll,
}

/// A frame queued for transmission
///
/// The deadline is absolute on the monotonic clock. A driver should drop frames that were
/// not transmitted in time.
#[derive(Debug, Clone)]
pub struct OutboundFrame<F> {
    pub frame: F,
    pub deadline: Instant,
}

pub const TX_QUEUE_DEPTH: usize = 64;
const FILTER_QUEUE_DEPTH: usize = 64;

/// Inbound dispatch installed by the transport. Invoked from the driver runner's context;
/// must complete within a bounded critical section and never block on I/O.
pub type Dispatch<F> = Box<dyn Fn(F) + Send + Sync>;

/// The link endpoint failed because the transport or the media was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkClosed;

impl core::fmt::Display for LinkClosed {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("link closed")
    }
}

impl std::error::Error for LinkClosed {}

struct Shared<F> {
    source: Channel<CriticalSectionRawMutex, OutboundFrame<F>, TX_QUEUE_DEPTH>,
    filters: Channel<CriticalSectionRawMutex, FilterUpdate, FILTER_QUEUE_DEPTH>,
    dispatch: Dispatch<F>,
    closed: AtomicBool,
    close_wakers: Mutex<Vec<Waker>>,
}

impl<F> Shared<F> {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            for waker in self.close_wakers.lock().drain(..) {
                waker.wake();
            }
        }
    }

    async fn closed_wait(&self) {
        poll_fn(|cx| {
            if self.closed.load(Ordering::SeqCst) {
                return Poll::Ready(());
            }
            let mut wakers = self.close_wakers.lock();
            if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
                wakers.push(cx.waker().clone());
            }
            // Re-check after registration so a concurrent close cannot be missed.
            if self.closed.load(Ordering::SeqCst) {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
        .await
    }
}

/// Creates a connected link pair. The transport keeps the [`LinkPort`], the driver consumes
/// the [`Link`].
pub fn new<F>(dispatch: Dispatch<F>) -> (LinkPort<F>, Link<F>) {
    let shared = Arc::new(Shared {
        source: Channel::new(),
        filters: Channel::new(),
        dispatch,
        closed: AtomicBool::new(false),
        close_wakers: Mutex::new(Vec::new()),
    });
    (LinkPort(shared.clone()), Link(shared))
}

/// Driver-facing half of the link. A driver runner should consume it.
pub struct Link<F>(Arc<Shared<F>>);

impl<F> Clone for Link<F> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<F> Link<F> {
    /// Delivers a received frame to the transport. Dropped silently after close.
    pub fn push_received(&self, frame: F) {
        if !self.0.closed.load(Ordering::SeqCst) {
            (self.0.dispatch)(frame);
        }
    }

    /// Fetches the next frame queued for transmission.
    ///
    /// Resolves to `None` once the link is closed; frames still queued at that point are
    /// abandoned.
    pub async fn pop_outbound(&self) -> Option<OutboundFrame<F>> {
        if self.0.closed.load(Ordering::SeqCst) {
            return None;
        }
        match select(self.0.source.receive(), self.0.closed_wait()).await {
            Either::First(frame) => Some(frame),
            Either::Second(()) => None,
        }
    }

    /// Blocking variant of [`Link::pop_outbound`] for driver runner threads.
    pub fn pop_outbound_blocking(&self) -> Option<OutboundFrame<F>> {
        futures_executor::block_on(self.pop_outbound())
    }

    /// Non-blocking variant of [`Link::pop_outbound`] for poll-driven drivers.
    pub fn try_pop_outbound(&self) -> Option<OutboundFrame<F>> {
        if self.0.closed.load(Ordering::SeqCst) {
            return None;
        }
        self.0.source.try_receive().ok()
    }

    /// Fetches the next receiver filter update.
    pub async fn pop_filter(&self) -> Option<FilterUpdate> {
        if self.0.closed.load(Ordering::SeqCst) {
            return None;
        }
        match select(self.0.filters.receive(), self.0.closed_wait()).await {
            Either::First(update) => Some(update),
            Either::Second(()) => None,
        }
    }

    /// Non-blocking variant of [`Link::pop_filter`].
    pub fn try_pop_filter(&self) -> Option<FilterUpdate> {
        self.0.filters.try_receive().ok()
    }

    /// Reports a media fault. A fatal fault (interface gone: `ENODEV`, `ENXIO`, `EBADF`)
    /// closes the link and thereby the owning transport's sessions.
    pub fn report_trouble(&self, error: &dyn std::error::Error, fatal: bool) {
        if fatal {
            log::error!("media driver failed fatally: {error}");
            self.0.close();
        } else {
            log::warn!("media driver reported transient trouble: {error}");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        self.0.close();
    }
}

/// Stack-facing half of the link.
pub struct LinkPort<F>(Arc<Shared<F>>);

impl<F> Clone for LinkPort<F> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<F> LinkPort<F> {
    /// Queues one frame for transmission.
    ///
    /// Returns `Ok(false)` when the queue did not accept the frame before the deadline.
    /// The caller is expected to serialize per-session pushes so that frames of one
    /// transfer stay contiguous within the session.
    pub async fn send_frame(&self, frame: F, deadline: Instant) -> Result<bool, LinkClosed> {
        if self.0.closed.load(Ordering::SeqCst) {
            return Err(LinkClosed);
        }
        let push = with_deadline(deadline, self.0.source.send(OutboundFrame { frame, deadline }));
        match select(push, self.0.closed_wait()).await {
            Either::First(Ok(())) => Ok(true),
            Either::First(Err(_timeout)) => Ok(false),
            Either::Second(()) => Err(LinkClosed),
        }
    }

    /// Requests a receiver filter update. Updates are advisory; on overflow the update is
    /// dropped with a log record and the driver keeps a wider filter.
    pub fn request_filter(&self, update: FilterUpdate) {
        if self.0.filters.try_send(update).is_err() {
            log::warn!("filter update queue overflow, update dropped: {update:?}");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        self.0.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Duration;
    use std::sync::atomic::AtomicUsize;

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(3600)
    }

    #[test]
    fn test_round_trip() {
        let received = Arc::new(AtomicUsize::new(0));
        let counter = received.clone();
        let (port, link) = new::<u32>(Box::new(move |frame| {
            counter.fetch_add(frame as usize, Ordering::SeqCst);
        }));

        futures_executor::block_on(async {
            assert!(port.send_frame(7, far_deadline()).await.unwrap());
            let outbound = link.pop_outbound().await.unwrap();
            assert_eq!(outbound.frame, 7);
        });

        link.push_received(35);
        assert_eq!(received.load(Ordering::SeqCst), 35);
    }

    #[test]
    fn test_close_unblocks_consumer() {
        let (port, link) = new::<u32>(Box::new(|_| {}));
        port.close();
        assert!(link.pop_outbound_blocking().is_none());
        assert!(futures_executor::block_on(port.send_frame(1, far_deadline())).is_err());
    }

    #[test]
    fn test_filter_stream() {
        let (port, link) = new::<u32>(Box::new(|_| {}));
        let subject = SubjectId::new(10).unwrap();
        port.request_filter(FilterUpdate::AddSubject(subject));
        assert_eq!(link.try_pop_filter(), Some(FilterUpdate::AddSubject(subject)));
        assert_eq!(link.try_pop_filter(), None);
    }
}
