//! # Hostcyphal
//!
//! This library provides an async implementation of the Cyphal protocol \[1\] for
//! non-embedded hosts: diagnostic tools, simulators, R&D tooling, and hardware-in-the-loop
//! rigs. It speaks Cyphal/CAN, Cyphal/UDP, and Cyphal/serial, composes dissimilar transports
//! redundantly, and includes sideband capture, offline tracing, and transfer spoofing for
//! protocol analysis.
//!
//! ## Architecture
//!
//! ```text
//!  ┌────────────────────────────────────────────────┐
//!  │                  Application                   │
//!  │        (registers, port factory, tooling)      │
//!  └───────────────────────┬────────────────────────┘
//!  ┌───────────────────────▼────────────────────────┐
//!  │                  Presentation                  │
//!  │   Publisher · Subscriber · Client · Server     │
//!  └───────────────────────┬────────────────────────┘
//!  ┌───────────────────────▼────────────────────────┐
//!  │             Transport (facade trait)           │
//!  │  ┌───────────┐  ┌───────────────────────────┐  │
//!  │  │ Redundant ├──┤ CAN │ UDP │ Serial │ Loop │  │
//!  │  └───────────┘  └──────────┬────────────────┘  │
//!  └────────────────────────────┼───────────────────┘
//!  ┌────────────────────────────▼───────────────────┐
//!  │                 Media drivers                  │
//!  │  SocketCAN · socketcand · candump · UDP mcast  │
//!  │  serial port · TCP tunnel · in-memory fabrics  │
//!  └────────────────────────────────────────────────┘
//! ```
//!
//! Components:
//! * A _transport_ fragments transfers into frames, reassembles frames into transfers,
//!   tracks transfer-IDs, and owns the input/output _sessions_ keyed by data specifier and
//!   remote node-ID.
//! * The _redundant pseudo-transport_ presents the same facade over several dissimilar
//!   transports, deduplicating on reception and racing the inferiors on transmission.
//! * The _presentation_ layer binds typed DSDL records to sessions, correlates RPC requests
//!   with responses, and fans incoming messages out to subscribers.
//! * _Media drivers_ are runner threads wrapping blocking OS I/O; they exchange frames with
//!   the stack through bounded channels ([`hostcyphal_driver::link`]).
//!
//! ## Concurrency model
//!
//! The stack is single-threaded cooperative: every operation that may wait is `async` and
//! suspends instead of blocking. Internal critical sections are brief blocking mutexes that
//! are never held across a suspension point, so the stack can be driven by any executor;
//! the test suites run it on `futures_executor::LocalPool`. Media driver threads interact
//! with the stack only through channels and bounded dispatch calls.
//!
//! ## Cyphal data types
//!
//! The library relies on the code generator from the `canadensis` project to convert Cyphal
//! DSDL to (de)serializable Rust structs; the contract is re-exported through
//! [`hostcyphal_encoding`]. The receive path sizes buffers from the declared type extent.
//!
//! # References:
//!
//! * \[1\] Cyphal Specification v1.0
//!   <https://opencyphal.org/specification/Cyphal_Specification.pdf>

pub use hostcyphal_core as core;
pub use hostcyphal_driver::{can as can_frame, link, time};
pub use hostcyphal_encoding as encoding;

pub mod application;
pub mod data_types;
pub mod presentation;
pub mod transfer;
pub mod transport;
