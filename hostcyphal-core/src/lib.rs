//! Cyphal protocol core data types
//!
//! This crate provides basic data type definitions used by other Hostcyphal crates.
//! Hostcyphal users should not depend on this crate directly. Use `hostcyphal::core` reexport
//! instead.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidValue;

impl core::fmt::Display for InvalidValue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("value out of range for the protocol field")
    }
}

impl std::error::Error for InvalidValue {}

/// Transfer priority [1; 4.1.1.3]
///
/// The type has explicit numeric encoding to facilitate look-up table implementation.
/// The encoding matches the CAN ID encoding [1; 4.2.1.1], thus the ordering is reversed:
/// Optional > Exceptional
///
/// # References:
///
/// * \[1\] Cyphal Specification v1.0
///   <https://opencyphal.org/specification/Cyphal_Specification.pdf>
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Priority {
    /// The bus designer can ignore these messages when calculating bus load since they should
    /// only be sent when a total system failure has occurred. For example, a self-destruct message
    /// on a rocket would use this priority. Another analogy is an NMI on a microcontroller.
    Exceptional = 0,
    /// Immediate is a "high priority message" but with additional latency constraints. Since
    /// exceptional messages are not considered when designing a bus, the latency of immediate
    /// messages can be determined by considering only immediate messages.
    Immediate = 1,
    /// Fast and immediate are both "high priority messages" but with additional latency
    /// constraints.
    Fast = 2,
    /// High priority messages are more important than nominal messages but have looser latency
    /// requirements than fast messages. This priority is used so that, in the presence of rogue
    /// nominal messages, important commands can still be received.
    High = 3,
    /// This is what all messages should use by default. Specifically, heartbeat messages should
    /// use this priority.
    Nominal = 4,
    /// Low priority messages are expected to be sent on a bus under all conditions but cannot
    /// prevent the delivery of nominal messages.
    Low = 5,
    /// Slow messages are low priority messages that have no time sensitivity at all. The bus
    /// designer need only ensure that for all possible system states, these messages will
    /// eventually be sent.
    Slow = 6,
    /// These messages might never be sent (theoretically) for some possible system states.
    /// This should be the priority used for diagnostic or debug messages that are not required
    /// on an operational system.
    Optional = 7,
}

impl Priority {
    pub const MIN: Priority = Priority::Exceptional;
    pub const MAX: Priority = Priority::Optional;

    pub const fn try_from_u8(code: u8) -> Option<Priority> {
        if code <= Self::MAX.into_u8() {
            Some(Priority::from_u8_truncating(code))
        } else {
            None
        }
    }

    pub const fn from_u8_truncating(code: u8) -> Priority {
        match code & 0x7 {
            0 => Priority::Exceptional,
            1 => Priority::Immediate,
            2 => Priority::Fast,
            3 => Priority::High,
            4 => Priority::Nominal,
            5 => Priority::Low,
            6 => Priority::Slow,
            7 => Priority::Optional,
            _ => unreachable!(),
        }
    }

    pub const fn into_u8(self) -> u8 {
        self as u8
    }
}

impl From<Priority> for u8 {
    fn from(value: Priority) -> Self {
        value.into_u8()
    }
}

impl From<Priority> for usize {
    fn from(value: Priority) -> Self {
        u8::from(value).into()
    }
}

impl TryFrom<u8> for Priority {
    type Error = InvalidValue;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::try_from_u8(value).ok_or(InvalidValue)
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Nominal
    }
}

/// Node identifier of a bus participant
///
/// The representable range covers every supported transport: UDP and serial address up to
/// 65534, CAN up to 127. The transport constructors validate their own narrower bound.
/// The wire sentinel 0xffff denotes an anonymous transfer and is not representable here;
/// anonymity is expressed as `Option<NodeId>` throughout the stack.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u16);

impl NodeId {
    const MAX_VALUE: u16 = 0xfffe;
    pub const MAX: NodeId = NodeId(Self::MAX_VALUE);
    /// Upper bound on Cyphal/CAN networks, enforced by the CAN transport.
    pub const MAX_CAN: NodeId = NodeId(127);

    pub const fn new(value: u16) -> Option<Self> {
        if value <= Self::MAX_VALUE {
            Some(Self(value))
        } else {
            None
        }
    }

    pub const fn into_u16(self) -> u16 {
        self.0
    }
}

impl From<NodeId> for u16 {
    fn from(value: NodeId) -> Self {
        value.into_u16()
    }
}

impl From<NodeId> for usize {
    fn from(value: NodeId) -> Self {
        u16::from(value).into()
    }
}

impl TryFrom<u16> for NodeId {
    type Error = InvalidValue;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(InvalidValue)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubjectId(u16);

impl SubjectId {
    const MAX_VALUE: u16 = 0x1fff;
    pub const MAX: SubjectId = SubjectId(Self::MAX_VALUE);

    pub const fn new(value: u16) -> Option<Self> {
        if value <= Self::MAX_VALUE {
            Some(Self::from_u16_truncating(value))
        } else {
            None
        }
    }

    pub const fn from_u16_truncating(value: u16) -> Self {
        Self(value & Self::MAX_VALUE)
    }

    pub const fn into_u16(self) -> u16 {
        self.0
    }
}

impl From<SubjectId> for u16 {
    fn from(value: SubjectId) -> Self {
        value.into_u16()
    }
}

impl TryFrom<u16> for SubjectId {
    type Error = InvalidValue;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(InvalidValue)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceId(u16);

impl ServiceId {
    const MAX_VALUE: u16 = 0x1ff;
    pub const MAX: ServiceId = ServiceId(Self::MAX_VALUE);

    pub const fn new(value: u16) -> Option<Self> {
        if value <= Self::MAX_VALUE {
            Some(Self::from_u16_truncating(value))
        } else {
            None
        }
    }

    pub const fn from_u16_truncating(value: u16) -> Self {
        Self(value & Self::MAX_VALUE)
    }

    pub const fn into_u16(self) -> u16 {
        self.0
    }
}

impl From<ServiceId> for u16 {
    fn from(value: ServiceId) -> Self {
        value.into_u16()
    }
}

impl TryFrom<u16> for ServiceId {
    type Error = InvalidValue;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(InvalidValue)
    }
}

/// Encodes the semantic properties of the data type carried by a transfer and its kind
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DataSpecifier {
    Message(SubjectId),
    Request(ServiceId),
    Response(ServiceId),
}

impl DataSpecifier {
    pub const fn is_service(&self) -> bool {
        !matches!(self, DataSpecifier::Message(_))
    }

    /// The service identifier for both roles, `None` for messages.
    pub const fn service_id(&self) -> Option<ServiceId> {
        match self {
            DataSpecifier::Message(_) => None,
            DataSpecifier::Request(id) | DataSpecifier::Response(id) => Some(*id),
        }
    }

    /// The data specifier of the transfer flowing in the opposite direction of a service
    /// exchange. Messages have no counterpart and are returned unchanged.
    pub const fn flip(self) -> Self {
        match self {
            DataSpecifier::Message(id) => DataSpecifier::Message(id),
            DataSpecifier::Request(id) => DataSpecifier::Response(id),
            DataSpecifier::Response(id) => DataSpecifier::Request(id),
        }
    }
}

/// Modular transfer sequence number [1; 4.1.1.7]
///
/// The representation is wide enough for every supported transport: UDP and serial use the
/// full 64-bit range, Cyphal/CAN masks the low five bits at the wire. A modulo of
/// [`TransferId::UNBOUNDED_MODULO`] denotes a counter that is not expected to overflow
/// during the lifetime of a vehicle.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TransferId(u64);

impl TransferId {
    /// TransferId of the first transfer in a session, see [1; 4.1.1.7]
    pub const SESSION_START: TransferId = TransferId(0);

    /// Stand-in modulo for the transports whose 64-bit counter practically never overflows.
    pub const UNBOUNDED_MODULO: u64 = u64::MAX;

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn into_u64(self) -> u64 {
        self.0
    }

    /// The successor within the given modulo window.
    pub const fn next_modulo(self, modulo: u64) -> Self {
        if modulo == Self::UNBOUNDED_MODULO {
            Self(self.0.wrapping_add(1))
        } else {
            Self(self.0.wrapping_add(1) % modulo)
        }
    }

    /// Number of increments separating `self` from `newer` in the given modulo window.
    pub const fn forward_distance(self, newer: TransferId, modulo: u64) -> u64 {
        if modulo == Self::UNBOUNDED_MODULO {
            newer.0.wrapping_sub(self.0)
        } else {
            newer.0.wrapping_sub(self.0) % modulo
        }
    }
}

impl From<TransferId> for u64 {
    fn from(value: TransferId) -> Self {
        value.into_u64()
    }
}

impl From<u64> for TransferId {
    fn from(value: u64) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_codes() {
        for code in 0..8u8 {
            let priority = Priority::try_from(code).unwrap();
            assert_eq!(u8::from(priority), code);
        }
        assert_eq!(Priority::try_from(8), Err(InvalidValue));
        assert!(Priority::Exceptional < Priority::Optional);
    }

    #[test]
    fn test_node_id_bounds() {
        assert_eq!(NodeId::new(0).map(u16::from), Some(0));
        assert_eq!(NodeId::new(0xfffe), Some(NodeId::MAX));
        assert_eq!(NodeId::new(0xffff), None);
    }

    #[test]
    fn test_port_id_bounds() {
        assert_eq!(SubjectId::new(8191), Some(SubjectId::MAX));
        assert_eq!(SubjectId::new(8192), None);
        assert_eq!(ServiceId::new(511), Some(ServiceId::MAX));
        assert_eq!(ServiceId::new(512), None);
        assert_eq!(u16::from(SubjectId::from_u16_truncating(0x2001)), 1);
    }

    #[test]
    fn test_data_specifier_flip() {
        let service = ServiceId::new(42).unwrap();
        assert_eq!(
            DataSpecifier::Request(service).flip(),
            DataSpecifier::Response(service)
        );
        assert_eq!(
            DataSpecifier::Response(service).flip(),
            DataSpecifier::Request(service)
        );
        let subject = SubjectId::new(7).unwrap();
        assert_eq!(
            DataSpecifier::Message(subject).flip(),
            DataSpecifier::Message(subject)
        );
        assert!(!DataSpecifier::Message(subject).is_service());
        assert_eq!(DataSpecifier::Request(service).service_id(), Some(service));
    }

    #[test]
    fn test_transfer_id_modulo() {
        let id = TransferId::new(31);
        assert_eq!(id.next_modulo(32), TransferId::new(0));
        assert_eq!(TransferId::new(30).next_modulo(32), TransferId::new(31));

        assert_eq!(
            TransferId::new(30).forward_distance(TransferId::new(2), 32),
            4
        );
        assert_eq!(
            TransferId::new(2).forward_distance(TransferId::new(30), 32),
            28
        );
        assert_eq!(TransferId::new(5).forward_distance(TransferId::new(5), 32), 0);
    }

    #[test]
    fn test_transfer_id_unbounded() {
        let id = TransferId::new(u64::MAX);
        assert_eq!(
            id.next_modulo(TransferId::UNBOUNDED_MODULO),
            TransferId::new(0)
        );
        assert_eq!(
            TransferId::new(3).forward_distance(TransferId::new(10), TransferId::UNBOUNDED_MODULO),
            7
        );
    }
}
