//! Hostcyphal driver interface
//!
//! The crate provides the interface between media drivers and the Hostcyphal stack.
//! Limited scope facilitates compatibility across versions. Driver crates should depend
//! on this crate. Hostcyphal stack users should depend on the `hostcyphal` crate instead.
//!
//! A [`link::Link`] encompasses three channels:
//! * a filter stream producing receiver filter updates,
//! * an inbound path consuming received frames,
//! * an outbound queue producing frames for transmission.
//!
//! Unlike other network stack implementations, Hostcyphal relies on driver runners to pull
//! and push data. On a host, a runner is typically a pair of OS threads wrapping blocking
//! socket I/O; the stack side stays executor-agnostic. The inverse structure eliminates
//! intermediate channels and redundant pump tasks: an inbound frame is dispatched into the
//! owning transport directly from the runner's call, within a bounded critical section.
//!
//! A driver should be able to filter in message frames on specified subjects, though it may
//! limit the number of simultaneous subscriptions. The filter stream provides subscription
//! add and removal requests; range removal requests simplify asynchronous cleanup. A driver
//! that cannot filter (e.g., a raw serial line) may ignore the stream entirely.
//!
//! Inbound dispatch may block only for the duration of one session delivery. It must not be
//! used to exert back-pressure on the driver: when a session queue is full, the oldest
//! transfer is dropped and a counter incremented.

pub mod can;
pub mod link;

pub mod time {
    pub use embassy_time::{Duration, Instant};
}
