//! IP multicast endpoint mapping for Cyphal/UDP
//!
//! Message subjects and service destinations map onto disjoint ranges of the 239.0.0.0/15
//! administratively-scoped block:
//!
//! ```text
//!   message:  11101111.00000000.0nnnnnnn.nnnnnnnn   (239.0.0.0  | subject-ID)
//!   service:  11101111.00000001.nnnnnnnn.nnnnnnnn   (239.1.0.0  | destination node-ID)
//! ```
//!
//! Subjects and services use two distinct well-known UDP ports, so a datagram's port and
//! group together identify the data specifier kind and its numeric ID.

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::core::{NodeId, SubjectId};

/// Well-known destination port for message subjects.
pub const MESSAGE_PORT: u16 = 9382;
/// Well-known destination port for service transfers.
pub const SERVICE_PORT: u16 = 9383;

const MULTICAST_PREFIX: u32 = 0xef00_0000;
const SNM_BIT: u32 = 0x0001_0000;
const PREFIX_MASK: u32 = 0xfffe_0000;
const BROADCAST_NODE: u32 = 0xffff;

/// The multicast group every subscriber of a subject joins.
pub fn message_group(subject: SubjectId) -> Ipv4Addr {
    Ipv4Addr::from(MULTICAST_PREFIX | u32::from(subject.into_u16()))
}

/// The multicast group a node listens on for service transfers addressed to it.
/// `None` yields the broadcast service group.
pub fn service_group(destination: Option<NodeId>) -> Ipv4Addr {
    let node = destination
        .map(|n| u32::from(n.into_u16()))
        .unwrap_or(BROADCAST_NODE);
    Ipv4Addr::from(MULTICAST_PREFIX | SNM_BIT | node)
}

/// True when the address lies within the Cyphal/UDP multicast block.
pub fn is_cyphal_group(address: Ipv4Addr) -> bool {
    u32::from(address) & PREFIX_MASK == MULTICAST_PREFIX
}

/// The full subject endpoint (group and port).
pub fn message_endpoint(subject: SubjectId, port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(message_group(subject), port)
}

/// The full service endpoint (group and port).
pub fn service_endpoint(destination: Option<NodeId>, port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(service_group(destination), port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_groups() {
        assert_eq!(
            message_group(SubjectId::new(123).unwrap()),
            Ipv4Addr::new(239, 0, 0, 123)
        );
        assert_eq!(
            message_group(SubjectId::new(456).unwrap()),
            Ipv4Addr::new(239, 0, 1, 200)
        );
    }

    #[test]
    fn test_service_groups() {
        assert_eq!(
            service_group(NodeId::new(123)),
            Ipv4Addr::new(239, 1, 0, 123)
        );
        assert_eq!(
            service_group(NodeId::new(456)),
            Ipv4Addr::new(239, 1, 1, 200)
        );
        assert_eq!(service_group(None), Ipv4Addr::new(239, 1, 255, 255));
    }

    #[test]
    fn test_group_recognition() {
        assert!(is_cyphal_group(Ipv4Addr::new(239, 0, 0, 1)));
        assert!(is_cyphal_group(Ipv4Addr::new(239, 1, 255, 255)));
        assert!(!is_cyphal_group(Ipv4Addr::new(239, 2, 0, 1)));
        assert!(!is_cyphal_group(Ipv4Addr::new(224, 0, 0, 1)));
    }
}
