//! CAN media drivers
//!
//! A media driver consumes the driver-facing half of a [`Link`]: its runner pulls outbound
//! frames, pushes received frames, and applies acceptance filter updates. On real hardware
//! the runner is a pair of OS threads around blocking socket I/O; the in-memory bus used
//! by the tests moves frames synchronously so that scenarios stay deterministic.

use std::sync::Arc;

use hostcyphal_driver::can::{AcceptanceFilter, Frame, Mtu};
use hostcyphal_driver::link::{FilterUpdate, Link};
use parking_lot::Mutex;

use crate::core::{NodeId, SubjectId};
use crate::time::Instant;
use crate::transport::error::TransportError;

#[cfg(target_os = "linux")]
pub mod socketcan;

pub mod candump;
pub mod socketcand;

/// A CAN media driver: SocketCAN, a socketcand bridge, a log replayer, or a test double.
pub trait CanMedia: Send {
    fn mtu(&self) -> Mtu;

    /// Takes ownership of the link and begins pumping it, typically on runner threads.
    fn start(&mut self, link: Link<Frame>) -> Result<(), TransportError>;

    /// Idempotent release of OS resources. The link is closed as a side effect.
    fn close(&mut self);
}

/// Maintains the receiver filter state accumulated from a [`FilterUpdate`] stream.
///
/// Drivers call [`FilterTracker::apply`] for every update and reconfigure the hardware or
/// kernel filters whenever it reports a change.
#[derive(Debug, Default, Clone)]
pub struct FilterTracker {
    subjects: std::collections::BTreeSet<SubjectId>,
    destinations: std::collections::BTreeSet<NodeId>,
    accept_all: bool,
}

impl FilterTracker {
    /// Returns true when the effective filter set changed.
    pub fn apply(&mut self, update: FilterUpdate) -> bool {
        match update {
            FilterUpdate::AddSubject(subject) => self.subjects.insert(subject),
            FilterUpdate::RemoveSubjectRange([low, high]) => {
                let before = self.subjects.len();
                self.subjects.retain(|s| *s < low || *s > high);
                self.subjects.len() != before
            }
            FilterUpdate::AddDestination(node) => self.destinations.insert(node),
            FilterUpdate::RemoveDestinationRange([low, high]) => {
                let before = self.destinations.len();
                self.destinations.retain(|n| *n < low || *n > high);
                self.destinations.len() != before
            }
            FilterUpdate::AcceptAll => {
                let changed = !self.accept_all;
                self.accept_all = true;
                changed
            }
        }
    }

    /// Drains every pending update from the link. Returns true when anything changed.
    pub fn drain(&mut self, link: &Link<Frame>) -> bool {
        let mut changed = false;
        while let Some(update) = link.try_pop_filter() {
            changed |= self.apply(update);
        }
        changed
    }

    /// The acceptance filter set matching the current state; empty means accept nothing.
    pub fn filters(&self) -> Vec<AcceptanceFilter> {
        if self.accept_all {
            return vec![AcceptanceFilter { id: 0, mask: 0 }];
        }
        self.subjects
            .iter()
            .map(|subject| AcceptanceFilter::subject(Some(*subject)))
            .chain(
                self.destinations
                    .iter()
                    .map(|node| AcceptanceFilter::service(Some(*node))),
            )
            .collect()
    }

    pub fn accepts(&self, can_id: u32) -> bool {
        self.accept_all || self.filters().iter().any(|f| f.matches(can_id))
    }
}

struct BusInner {
    mtu: Mtu,
    links: Mutex<Vec<Link<Frame>>>,
}

/// An in-process CAN bus connecting any number of transports, used by tests and dry-runs.
///
/// Frame movement is explicit: [`MemoryBus::process`] drains every attached link's
/// outbound queue and delivers to all other links. Interleave it with executor polls for
/// fully deterministic scenarios.
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<BusInner>,
}

impl MemoryBus {
    pub fn new(mtu: Mtu) -> Self {
        Self {
            inner: Arc::new(BusInner {
                mtu,
                links: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Creates a media endpoint for one transport.
    pub fn attach(&self) -> MemoryBusMedia {
        MemoryBusMedia {
            inner: self.inner.clone(),
            link: None,
        }
    }

    /// Moves every queued outbound frame to the other endpoints. Frames whose transmission
    /// deadline has passed are dropped, as a real driver would. Returns true if anything
    /// moved.
    pub fn process(&self) -> bool {
        let links = self.inner.links.lock().clone();
        let now = Instant::now();
        let mut moved = false;
        for (index, link) in links.iter().enumerate() {
            while let Some(outbound) = link.try_pop_outbound() {
                moved = true;
                if outbound.deadline < now {
                    continue;
                }
                for (other_index, other) in links.iter().enumerate() {
                    if other_index != index {
                        let mut frame = outbound.frame;
                        frame.timestamp = now;
                        frame.loop_back = false;
                        other.push_received(frame);
                    }
                }
            }
        }
        moved
    }

    /// Injects a frame as if it appeared on the bus, delivering to every endpoint.
    pub fn inject(&self, frame: Frame) {
        for link in self.inner.links.lock().iter() {
            link.push_received(frame);
        }
    }
}

pub struct MemoryBusMedia {
    inner: Arc<BusInner>,
    link: Option<Link<Frame>>,
}

impl CanMedia for MemoryBusMedia {
    fn mtu(&self) -> Mtu {
        self.inner.mtu
    }

    fn start(&mut self, link: Link<Frame>) -> Result<(), TransportError> {
        self.inner.links.lock().push(link.clone());
        self.link = Some(link);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(link) = self.link.take() {
            link.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject(id: u16) -> SubjectId {
        SubjectId::new(id).unwrap()
    }

    #[test]
    fn test_filter_tracker() {
        let mut tracker = FilterTracker::default();
        assert!(tracker.apply(FilterUpdate::AddSubject(subject(10))));
        assert!(tracker.apply(FilterUpdate::AddSubject(subject(20))));
        assert!(!tracker.apply(FilterUpdate::AddSubject(subject(10))));
        assert_eq!(tracker.filters().len(), 2);

        assert!(tracker.apply(FilterUpdate::RemoveSubjectRange([subject(0), subject(15)])));
        assert_eq!(tracker.filters().len(), 1);

        let node = NodeId::new(5).unwrap();
        assert!(tracker.apply(FilterUpdate::AddDestination(node)));
        assert!(tracker.apply(FilterUpdate::RemoveDestinationRange([node, node])));
        assert_eq!(tracker.filters().len(), 1);

        assert!(tracker.apply(FilterUpdate::AcceptAll));
        assert!(tracker.accepts(0xdead));
    }
}
