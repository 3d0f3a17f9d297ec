//! Application-layer support: the register interface and configuration-driven ports
//!
//! Registers are the protocol's named configuration values. This module provides the
//! host-side register store with environment-variable overrides and file persistence,
//! plus the factory that turns `uavcan.{pub,sub,srv,cln}.<name>.id` assignments into
//! validated port identifiers.

pub mod factory;
pub mod ports;
pub mod register;

pub use factory::make_transport;
pub use ports::{PortFactory, PortKind, PortSpec};
pub use register::{Registry, Value};
