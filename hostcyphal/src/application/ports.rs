//! Configuration-driven port construction
//!
//! A node's set of ports is determined at startup from registers of the form
//! `uavcan.{pub,sub,srv,cln}.<name>.id`. The factory validates the assignments and hands
//! out typed port identifiers; the application then instantiates the corresponding
//! presentation-layer objects with the data types it knows.

use crate::application::register::{Registry, Value};
use crate::core::{ServiceId, SubjectId};
use crate::transport::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortKind {
    Publication,
    Subscription,
    Server,
    Client,
}

impl PortKind {
    const ALL: [PortKind; 4] = [
        PortKind::Publication,
        PortKind::Subscription,
        PortKind::Server,
        PortKind::Client,
    ];

    fn prefix(self) -> &'static str {
        match self {
            PortKind::Publication => "uavcan.pub.",
            PortKind::Subscription => "uavcan.sub.",
            PortKind::Server => "uavcan.srv.",
            PortKind::Client => "uavcan.cln.",
        }
    }

    fn is_service(self) -> bool {
        matches!(self, PortKind::Server | PortKind::Client)
    }
}

/// One declared port: the application-chosen name, its kind, and the assigned port-ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    pub name: String,
    pub kind: PortKind,
    pub id: u16,
}

/// Reads port-ID assignments from a register store.
pub struct PortFactory<'a> {
    registry: &'a Registry,
}

impl<'a> PortFactory<'a> {
    pub fn new(registry: &'a Registry) -> Self {
        Self { registry }
    }

    fn register_name(kind: PortKind, port_name: &str) -> String {
        format!("{}{port_name}.id", kind.prefix())
    }

    fn raw_id(&self, kind: PortKind, port_name: &str) -> Result<u64, TransportError> {
        let register = Self::register_name(kind, port_name);
        self.registry
            .get(&register)
            .and_then(Value::as_natural)
            .ok_or_else(|| {
                TransportError::InvalidConfiguration(format!(
                    "port {port_name:?} has no ID assignment in register {register:?}"
                ))
            })
    }

    /// The subject-ID assigned to a publication or subscription port.
    pub fn subject_id(&self, kind: PortKind, port_name: &str) -> Result<SubjectId, TransportError> {
        if kind.is_service() {
            return Err(TransportError::InvalidConfiguration(format!(
                "port {port_name:?} is a service port, not a subject port"
            )));
        }
        let raw = self.raw_id(kind, port_name)?;
        u16::try_from(raw)
            .ok()
            .and_then(SubjectId::new)
            .ok_or_else(|| {
                TransportError::InvalidConfiguration(format!(
                    "subject-ID {raw} of port {port_name:?} is out of range"
                ))
            })
    }

    /// The service-ID assigned to a server or client port.
    pub fn service_id(&self, kind: PortKind, port_name: &str) -> Result<ServiceId, TransportError> {
        if !kind.is_service() {
            return Err(TransportError::InvalidConfiguration(format!(
                "port {port_name:?} is a subject port, not a service port"
            )));
        }
        let raw = self.raw_id(kind, port_name)?;
        u16::try_from(raw)
            .ok()
            .and_then(ServiceId::new)
            .ok_or_else(|| {
                TransportError::InvalidConfiguration(format!(
                    "service-ID {raw} of port {port_name:?} is out of range"
                ))
            })
    }

    /// Every declared port, in register order. Malformed assignments are included with
    /// their raw values truncated so the caller can report them; use the typed getters
    /// for validation.
    pub fn ports(&self) -> Vec<PortSpec> {
        let mut ports = Vec::new();
        for name in self.registry.names() {
            for kind in PortKind::ALL {
                let Some(stem) = name.strip_prefix(kind.prefix()) else {
                    continue;
                };
                let Some(port_name) = stem.strip_suffix(".id") else {
                    continue;
                };
                if port_name.is_empty() {
                    continue;
                }
                if let Some(raw) = self.registry.get(name).and_then(Value::as_natural) {
                    ports.push(PortSpec {
                        name: port_name.to_string(),
                        kind,
                        id: raw.min(u64::from(u16::MAX)) as u16,
                    });
                }
            }
        }
        ports
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry.set("uavcan.pub.airspeed.id", Value::Natural(vec![2100]));
        registry.set("uavcan.sub.setpoint.id", Value::Natural(vec![2101]));
        registry.set("uavcan.srv.least_squares.id", Value::Natural(vec![123]));
        registry.set("uavcan.cln.least_squares.id", Value::Natural(vec![123]));
        registry.set("uavcan.node.id", Value::Natural(vec![42]));
        registry
    }

    #[test]
    fn test_typed_lookup() {
        let registry = registry();
        let factory = PortFactory::new(&registry);
        assert_eq!(
            factory.subject_id(PortKind::Publication, "airspeed").unwrap(),
            SubjectId::new(2100).unwrap()
        );
        assert_eq!(
            factory.service_id(PortKind::Server, "least_squares").unwrap(),
            ServiceId::new(123).unwrap()
        );
        assert!(matches!(
            factory.subject_id(PortKind::Publication, "missing"),
            Err(TransportError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            factory.subject_id(PortKind::Client, "least_squares"),
            Err(TransportError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_out_of_range_rejected() {
        let mut registry = Registry::new();
        registry.set("uavcan.pub.broken.id", Value::Natural(vec![9999]));
        let factory = PortFactory::new(&registry);
        assert!(matches!(
            factory.subject_id(PortKind::Publication, "broken"),
            Err(TransportError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_enumeration() {
        let registry = registry();
        let ports = PortFactory::new(&registry).ports();
        assert_eq!(ports.len(), 4);
        assert!(ports.contains(&PortSpec {
            name: "airspeed".into(),
            kind: PortKind::Publication,
            id: 2100,
        }));
        assert!(ports.contains(&PortSpec {
            name: "least_squares".into(),
            kind: PortKind::Client,
            id: 123,
        }));
    }
}
