//! Transfer deduplication across redundant inferiors
//!
//! An inferior whose transfer-ID modulo is at least 2^48 never overflows in practice
//! ("monotonic"); duplicates are then recognized directly by comparing transfer-IDs per
//! source. A small modulo ("cyclic", e.g. Cyphal/CAN) makes transfer-IDs ambiguous across
//! interfaces, so deduplication falls back to interface ownership: the first interface to
//! deliver for a source stays authoritative until it goes silent for the transfer-ID
//! timeout, at which point the source fails over to whichever interface delivers next.

use std::collections::HashMap;

use crate::core::{NodeId, TransferId};
use crate::time::{Duration, Instant};
use crate::transfer::Timestamp;

/// Transfer-ID modulos below this overflow routinely during operation.
pub(crate) const MONOTONIC_MODULO_THRESHOLD: u64 = 1 << 48;

pub(crate) enum Deduplicator {
    Monotonic(MonotonicDeduplicator),
    Cyclic(CyclicDeduplicator),
}

impl Deduplicator {
    pub(crate) fn new(transfer_id_modulo: u64) -> Self {
        if transfer_id_modulo >= MONOTONIC_MODULO_THRESHOLD {
            Deduplicator::Monotonic(MonotonicDeduplicator::default())
        } else {
            Deduplicator::Cyclic(CyclicDeduplicator::default())
        }
    }

    /// Decides whether a reassembled transfer is the first copy seen. The first interface
    /// to deliver wins; identical transfers arriving later on other interfaces lose.
    pub(crate) fn should_accept(
        &mut self,
        iface_id: usize,
        transfer_id_timeout: Duration,
        timestamp: Timestamp,
        source_node_id: Option<NodeId>,
        transfer_id: TransferId,
    ) -> bool {
        match self {
            Deduplicator::Monotonic(d) => d.should_accept(source_node_id, transfer_id),
            Deduplicator::Cyclic(d) => {
                d.should_accept(iface_id, transfer_id_timeout, timestamp, source_node_id)
            }
        }
    }
}

#[derive(Default)]
pub(crate) struct MonotonicDeduplicator {
    last_transfer_id: HashMap<NodeId, u64>,
}

impl MonotonicDeduplicator {
    fn should_accept(&mut self, source_node_id: Option<NodeId>, transfer_id: TransferId) -> bool {
        // Anonymous transfers carry no session state and cannot be deduplicated.
        let Some(source) = source_node_id else {
            return true;
        };
        match self.last_transfer_id.get_mut(&source) {
            None => {
                self.last_transfer_id.insert(source, transfer_id.into_u64());
                true
            }
            Some(last) => {
                if transfer_id.into_u64() > *last {
                    *last = transfer_id.into_u64();
                    true
                } else {
                    false
                }
            }
        }
    }
}

struct IfaceClaim {
    iface_id: usize,
    last_delivery: Instant,
}

#[derive(Default)]
pub(crate) struct CyclicDeduplicator {
    claims: HashMap<Option<NodeId>, IfaceClaim>,
}

impl CyclicDeduplicator {
    fn should_accept(
        &mut self,
        iface_id: usize,
        transfer_id_timeout: Duration,
        timestamp: Timestamp,
        source_node_id: Option<NodeId>,
    ) -> bool {
        let now = timestamp.monotonic;
        match self.claims.get_mut(&source_node_id) {
            None => {
                self.claims.insert(
                    source_node_id,
                    IfaceClaim {
                        iface_id,
                        last_delivery: now,
                    },
                );
                true
            }
            Some(claim) if claim.iface_id == iface_id => {
                claim.last_delivery = now;
                true
            }
            Some(claim) => {
                let silent = now
                    .checked_duration_since(claim.last_delivery)
                    .is_some_and(|age| age > transfer_id_timeout);
                if silent {
                    claim.iface_id = iface_id;
                    claim.last_delivery = now;
                    true
                } else {
                    false
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn ts(seconds: u64) -> Timestamp {
        Timestamp {
            system: std::time::SystemTime::UNIX_EPOCH,
            monotonic: Instant::MIN + Duration::from_secs(seconds),
        }
    }

    fn node(value: u16) -> Option<NodeId> {
        NodeId::new(value)
    }

    #[test]
    fn test_strategy_selection() {
        assert!(matches!(Deduplicator::new(32), Deduplicator::Cyclic(_)));
        assert!(matches!(
            Deduplicator::new(TransferId::UNBOUNDED_MODULO),
            Deduplicator::Monotonic(_)
        ));
    }

    #[test]
    fn test_monotonic_first_copy_wins() {
        let mut dedup = Deduplicator::new(TransferId::UNBOUNDED_MODULO);
        // Both inferiors deliver transfer 5; only the first copy is accepted.
        assert!(dedup.should_accept(0, TIMEOUT, ts(1), node(7), TransferId::new(5)));
        assert!(!dedup.should_accept(1, TIMEOUT, ts(1), node(7), TransferId::new(5)));
        // The next transfer is accepted regardless of which inferior is first.
        assert!(dedup.should_accept(1, TIMEOUT, ts(1), node(7), TransferId::new(6)));
        assert!(!dedup.should_accept(0, TIMEOUT, ts(1), node(7), TransferId::new(6)));
        // Sources are independent.
        assert!(dedup.should_accept(1, TIMEOUT, ts(1), node(8), TransferId::new(5)));
    }

    #[test]
    fn test_monotonic_anonymous_passes() {
        let mut dedup = Deduplicator::new(TransferId::UNBOUNDED_MODULO);
        assert!(dedup.should_accept(0, TIMEOUT, ts(1), None, TransferId::new(5)));
        assert!(dedup.should_accept(1, TIMEOUT, ts(1), None, TransferId::new(5)));
    }

    #[test]
    fn test_cyclic_iface_ownership() {
        let mut dedup = Deduplicator::new(32);
        assert!(dedup.should_accept(0, TIMEOUT, ts(1), node(7), TransferId::new(5)));
        // The other interface is ignored while the owner keeps delivering.
        assert!(!dedup.should_accept(1, TIMEOUT, ts(1), node(7), TransferId::new(5)));
        assert!(dedup.should_accept(0, TIMEOUT, ts(2), node(7), TransferId::new(6)));
        // Once the owner goes silent past the timeout, the source fails over.
        assert!(dedup.should_accept(1, TIMEOUT, ts(10), node(7), TransferId::new(9)));
        assert!(!dedup.should_accept(0, TIMEOUT, ts(10), node(7), TransferId::new(9)));
    }
}
