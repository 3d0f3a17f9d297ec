//! Transport construction from registers
//!
//! The node's transports are declared through the standard registers:
//!
//! * `uavcan.can.iface` — `socketcan:<iface>`, `socketcan-fd:<iface>`, or
//!   `socketcand:<host:port>:<iface>`;
//! * `uavcan.udp.iface` — the local IPv4 interface address;
//! * `uavcan.serial.iface` — a serial device path, or `tcp://<host:port>` for a
//!   TCP-tunneled line.
//!
//! An empty or absent register leaves the corresponding transport disabled. With one
//! interface configured the concrete transport is returned directly; with several, they
//! are composed redundantly and the returned runner must be spawned.

use std::sync::Arc;

use crate::application::register::{Registry, Value};
use crate::core::NodeId;
use crate::transport::redundant::{
    RedundantRunner, RedundantTransport, RedundantTransportOptions,
};
use crate::transport::serial::{
    media::{SerialPortMedia, TcpSerialMedia},
    SerialTransport, SerialTransportOptions,
};
use crate::transport::udp::{media::StdUdpMedia, UdpTransport, UdpTransportOptions};
use crate::transport::{Transport, TransportError};

pub const CAN_IFACE_REGISTER: &str = "uavcan.can.iface";
pub const UDP_IFACE_REGISTER: &str = "uavcan.udp.iface";
pub const SERIAL_IFACE_REGISTER: &str = "uavcan.serial.iface";

fn iface(registry: &Registry, register: &str) -> Option<String> {
    let text = registry.get(register).and_then(Value::as_str)?.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn make_can(spec: &str, local_node_id: Option<NodeId>) -> Result<Arc<dyn Transport>, TransportError> {
    use crate::transport::can::{media, CanTransport, CanTransportOptions};
    let options = CanTransportOptions {
        local_node_id,
        ..Default::default()
    };
    let media: Box<dyn media::CanMedia> = match spec.split_once(':') {
        #[cfg(target_os = "linux")]
        Some(("socketcan", iface)) => Box::new(media::socketcan::SocketCanMedia::new(
            iface,
            hostcyphal_driver::can::Mtu::Classic,
        )),
        #[cfg(target_os = "linux")]
        Some(("socketcan-fd", iface)) => Box::new(media::socketcan::SocketCanMedia::new(
            iface,
            hostcyphal_driver::can::Mtu::Fd,
        )),
        Some(("socketcand", rest)) => {
            let (address, iface) = rest.rsplit_once(':').ok_or_else(|| {
                TransportError::InvalidConfiguration(format!(
                    "expected socketcand:<host:port>:<iface>, got {spec:?}"
                ))
            })?;
            Box::new(media::socketcand::SocketcandMedia::new(address, iface))
        }
        _ => {
            return Err(TransportError::InvalidConfiguration(format!(
                "unrecognized CAN interface specification {spec:?}"
            )));
        }
    };
    Ok(Arc::new(CanTransport::new(media, options)?))
}

fn make_udp(spec: &str, local_node_id: Option<NodeId>) -> Result<Arc<dyn Transport>, TransportError> {
    let local_iface = spec.parse().map_err(|_| {
        TransportError::InvalidConfiguration(format!(
            "the UDP interface must be a local IPv4 address, got {spec:?}"
        ))
    })?;
    let transport = UdpTransport::new(
        Box::new(StdUdpMedia::default()),
        UdpTransportOptions {
            local_node_id,
            local_iface,
            ..Default::default()
        },
    )?;
    Ok(Arc::new(transport))
}

fn make_serial(
    spec: &str,
    local_node_id: Option<NodeId>,
) -> Result<Arc<dyn Transport>, TransportError> {
    let options = SerialTransportOptions {
        local_node_id,
        ..Default::default()
    };
    let transport = match spec.strip_prefix("tcp://") {
        Some(address) => {
            SerialTransport::new(Box::new(TcpSerialMedia::new(address)), options)?
        }
        None => SerialTransport::new(Box::new(SerialPortMedia::new(spec, 115_200)), options)?,
    };
    Ok(Arc::new(transport))
}

/// Builds the node's transport from the registry.
///
/// Returns `Ok(None)` when no interface register is populated. The runner accompanies a
/// redundant composition and must be spawned by the caller; it is absent for a single
/// concrete transport.
pub fn make_transport(
    registry: &Registry,
) -> Result<Option<(Arc<dyn Transport>, Option<RedundantRunner>)>, TransportError> {
    let local_node_id = registry.node_id();

    let mut transports: Vec<Arc<dyn Transport>> = Vec::new();
    if let Some(spec) = iface(registry, CAN_IFACE_REGISTER) {
        transports.push(make_can(&spec, local_node_id)?);
    }
    if let Some(spec) = iface(registry, UDP_IFACE_REGISTER) {
        transports.push(make_udp(&spec, local_node_id)?);
    }
    if let Some(spec) = iface(registry, SERIAL_IFACE_REGISTER) {
        transports.push(make_serial(&spec, local_node_id)?);
    }

    match transports.len() {
        0 => Ok(None),
        1 => Ok(Some((transports.remove(0), None))),
        _ => {
            let (redundant, runner) =
                RedundantTransport::new(RedundantTransportOptions::default());
            for transport in transports {
                redundant.attach_inferior(transport)?;
            }
            Ok(Some((Arc::new(redundant), Some(runner))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_when_unconfigured() {
        let registry = Registry::new();
        assert!(make_transport(&registry).unwrap().is_none());

        let mut registry = Registry::new();
        registry.set(UDP_IFACE_REGISTER, Value::String(String::new()));
        assert!(make_transport(&registry).unwrap().is_none());
    }

    #[test]
    fn test_single_udp_transport() {
        let mut registry = Registry::new();
        registry.set("uavcan.node.id", Value::Natural(vec![17]));
        registry.set(UDP_IFACE_REGISTER, Value::String("127.0.0.1".into()));
        let (transport, runner) = make_transport(&registry).unwrap().unwrap();
        assert!(runner.is_none());
        assert_eq!(transport.local_node_id(), NodeId::new(17));
        transport.close();
    }

    #[test]
    fn test_bad_specifications_rejected() {
        let mut registry = Registry::new();
        registry.set(UDP_IFACE_REGISTER, Value::String("not-an-address".into()));
        assert!(matches!(
            make_transport(&registry),
            Err(TransportError::InvalidConfiguration(_))
        ));

        let mut registry = Registry::new();
        registry.set(CAN_IFACE_REGISTER, Value::String("pigeon:coop0".into()));
        assert!(matches!(
            make_transport(&registry),
            Err(TransportError::InvalidConfiguration(_))
        ));
    }
}
