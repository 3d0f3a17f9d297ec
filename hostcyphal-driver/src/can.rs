//! CAN transport frame object and identifier codec

use hostcyphal_core::{DataSpecifier, NodeId, Priority, ServiceId, SubjectId};

use crate::time::Instant;

/// Payload capacity class of the attached CAN link: 8 B for classic CAN 2.0,
/// 64 B for CAN FD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Mtu {
    Classic,
    Fd,
}

impl From<Mtu> for usize {
    fn from(value: Mtu) -> Self {
        match value {
            Mtu::Classic => 8,
            Mtu::Fd => 64,
        }
    }
}

/// The value is neither of the two supported CAN payload capacities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncorrectMtu;

impl TryFrom<usize> for Mtu {
    type Error = IncorrectMtu;
    fn try_from(value: usize) -> Result<Self, Self::Error> {
        match value {
            8 => Ok(Mtu::Classic),
            64 => Ok(Mtu::Fd),
            _ => Err(IncorrectMtu),
        }
    }
}

/// Addressing and priority fields carried by the 29-bit CAN identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub priority: Priority,
    pub data_spec: DataSpecifier,
    /// `None` for anonymous message transfers.
    pub source: Option<NodeId>,
    /// `Some` for services, `None` for messages.
    pub destination: Option<NodeId>,
}

/// One frame as exchanged with a CAN controller, classic or FD
///
/// The payload must not exceed the MTU of the link the frame travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub data: Data,
    /// When the frame appeared on the bus: the reception instant for inbound frames,
    /// the transmission instant for loop-back confirmations.
    pub timestamp: Instant,
    pub loop_back: bool,
}

/// A frame length that the CAN DLC encoding can express
///
/// Past 8 bytes the four-bit DLC field of an FD frame can only name a handful of sizes,
/// so payloads in between are rounded up and padded by the sender. Classic frames use
/// the contiguous sub-8 part of the same scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DataLength(u8);

impl DataLength {
    pub const MAX: usize = 64;

    /// Every length a DLC can express, ascending.
    const STEPS: [u8; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 12, 16, 20, 24, 32, 48, 64];

    /// Accepts the value only if a DLC can express it exactly.
    pub const fn new(value: usize) -> Option<Self> {
        let mut i = 0;
        while i < Self::STEPS.len() {
            if Self::STEPS[i] as usize == value {
                return Some(Self(Self::STEPS[i]));
            }
            i += 1;
        }
        None
    }

    /// The largest expressible length not exceeding the value.
    pub const fn new_floor(value: usize) -> Self {
        let mut best = Self::STEPS[0];
        let mut i = 0;
        while i < Self::STEPS.len() {
            if Self::STEPS[i] as usize <= value {
                best = Self::STEPS[i];
            }
            i += 1;
        }
        Self(best)
    }

    /// The smallest expressible length that fits the value, i.e. how large the frame
    /// must grow to carry it. `None` beyond [`Self::MAX`].
    pub const fn new_ceil(value: usize) -> Option<Self> {
        let mut i = 0;
        while i < Self::STEPS.len() {
            if Self::STEPS[i] as usize >= value {
                return Some(Self(Self::STEPS[i]));
            }
            i += 1;
        }
        None
    }

    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

impl From<DataLength> for usize {
    fn from(value: DataLength) -> Self {
        value.as_usize()
    }
}

/// No DLC can express the requested payload length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidLength;

/// Inline frame payload storage, sized for the largest FD frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Data {
    length: DataLength,
    bytes: [u8; 64],
}

impl Data {
    /// Wraps a payload slice whose length a DLC can express exactly.
    pub fn new(data: &[u8]) -> Result<Self, InvalidLength> {
        let Some(length) = DataLength::new(data.len()) else {
            return Err(InvalidLength);
        };
        let mut bytes = [0; 64];
        bytes[..data.len()].copy_from_slice(data);

        Ok(Self { length, bytes })
    }

    /// An all-zero payload of the given length, to be filled in place.
    pub fn new_zeros(length: DataLength) -> Self {
        Self {
            length,
            bytes: [0; 64],
        }
    }

    pub fn length(&self) -> DataLength {
        self.length
    }
}

impl core::ops::Deref for Data {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.bytes[..usize::from(self.length)]
    }
}

impl core::ops::DerefMut for Data {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.bytes[..usize::from(self.length)]
    }
}

const CAN_ID_MASK: u32 = lsb_mask(29);
const NODE_ID_MASK: u32 = lsb_mask(7);
const SUBJECT_ID_MASK: u32 = lsb_mask(13);
const SERVICE_ID_MASK: u32 = lsb_mask(9);
const PRIORITY_MASK: u32 = lsb_mask(3);

const PRIORITY_OFFSET: u32 = 26;
const SOURCE_OFFSET: u32 = 0;
const MSG_SUBJECT_OFFSET: u32 = 8;
const SRV_DESTINATION_OFFSET: u32 = 7;
const SRV_SERVICE_OFFSET: u32 = 14;

const SERVICE_FLAG: u32 = 1 << 25;
const RES_23_FLAG: u32 = 1 << 23;
const MSG_ANONYMOUS_FLAG: u32 = 1 << 24;
const MSG_RES_7_FLAG: u32 = 1 << 7;
const SRV_REQUEST_FLAG: u32 = 1 << 24;

const MSG_CHECK_MASK: u32 = SERVICE_FLAG | RES_23_FLAG | MSG_RES_7_FLAG;
const MSG_CHECK_VALUE: u32 = 0;
/// Reserved bits 21..22, set on transmission and ignored on reception [1; 4.2.1].
const MSG_IGNORE_MASK: u32 = CAN_ID_MASK
    & !MSG_CHECK_MASK
    & !(PRIORITY_MASK << PRIORITY_OFFSET)
    & !MSG_ANONYMOUS_FLAG
    & !(SUBJECT_ID_MASK << MSG_SUBJECT_OFFSET)
    & !(NODE_ID_MASK << SOURCE_OFFSET);

const SRV_CHECK_MASK: u32 = SERVICE_FLAG | RES_23_FLAG;
const SRV_CHECK_VALUE: u32 = SERVICE_FLAG;

/// The anonymous source field placeholder; the anonymous flag is authoritative.
const ANONYMOUS_SOURCE: u32 = NODE_ID_MASK;

/// Encodes a frame header into a 29-bit extended CAN identifier.
///
/// Node-IDs are masked to seven bits; the CAN transport validates the range beforehand.
pub fn encode_id(header: &Header) -> u32 {
    let priority = u32::from(header.priority.into_u8()) << PRIORITY_OFFSET;
    match header.data_spec {
        DataSpecifier::Message(subject) => {
            let source = match header.source {
                Some(node) => u32::from(node.into_u16()) & NODE_ID_MASK,
                None => ANONYMOUS_SOURCE,
            };
            let anonymous = if header.source.is_none() {
                MSG_ANONYMOUS_FLAG
            } else {
                0
            };
            priority
                | MSG_IGNORE_MASK
                | anonymous
                | (u32::from(subject.into_u16()) << MSG_SUBJECT_OFFSET)
                | source
        }
        DataSpecifier::Request(service) | DataSpecifier::Response(service) => {
            let request = matches!(header.data_spec, DataSpecifier::Request(_));
            let source = header
                .source
                .map(|node| u32::from(node.into_u16()) & NODE_ID_MASK)
                .unwrap_or(ANONYMOUS_SOURCE);
            let destination = header
                .destination
                .map(|node| u32::from(node.into_u16()) & NODE_ID_MASK)
                .unwrap_or(0);
            priority
                | SERVICE_FLAG
                | if request { SRV_REQUEST_FLAG } else { 0 }
                | (u32::from(service.into_u16()) << SRV_SERVICE_OFFSET)
                | (destination << SRV_DESTINATION_OFFSET)
                | source
        }
    }
}

/// Decodes a 29-bit extended CAN identifier into a frame header.
///
/// Returns `None` for identifiers that violate the reserved-bit rules and therefore do not
/// belong to the protocol.
pub fn decode_id(can_id: u32) -> Option<Header> {
    let can_id = can_id & CAN_ID_MASK;
    let priority = Priority::from_u8_truncating((can_id >> PRIORITY_OFFSET) as u8);

    if can_id & SERVICE_FLAG == 0 {
        if can_id & MSG_CHECK_MASK != MSG_CHECK_VALUE {
            return None;
        }
        let subject = SubjectId::from_u16_truncating((can_id >> MSG_SUBJECT_OFFSET) as u16);
        let source = if can_id & MSG_ANONYMOUS_FLAG != 0 {
            None
        } else {
            Some(NodeId::new((can_id & NODE_ID_MASK) as u16)?)
        };
        Some(Header {
            priority,
            data_spec: DataSpecifier::Message(subject),
            source,
            destination: None,
        })
    } else {
        if can_id & SRV_CHECK_MASK != SRV_CHECK_VALUE {
            return None;
        }
        let service = ServiceId::from_u16_truncating((can_id >> SRV_SERVICE_OFFSET) as u16);
        let data_spec = if can_id & SRV_REQUEST_FLAG != 0 {
            DataSpecifier::Request(service)
        } else {
            DataSpecifier::Response(service)
        };
        let source = NodeId::new((can_id & NODE_ID_MASK) as u16)?;
        let destination =
            NodeId::new(((can_id >> SRV_DESTINATION_OFFSET) & NODE_ID_MASK) as u16)?;
        Some(Header {
            priority,
            data_spec,
            source: Some(source),
            destination: Some(destination),
        })
    }
}

/// Hardware/kernel acceptance filter specification: accept when `frame_id & mask == id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptanceFilter {
    pub id: u32,
    pub mask: u32,
}

impl AcceptanceFilter {
    /// Accepts message frames; narrows to one subject when given.
    pub fn subject(subject: Option<SubjectId>) -> Self {
        match subject {
            Some(subject) => Self {
                id: MSG_CHECK_VALUE | (u32::from(subject.into_u16()) << MSG_SUBJECT_OFFSET),
                mask: MSG_CHECK_MASK | (SUBJECT_ID_MASK << MSG_SUBJECT_OFFSET),
            },
            None => Self {
                id: MSG_CHECK_VALUE,
                mask: MSG_CHECK_MASK,
            },
        }
    }

    /// Accepts service frames; narrows to one destination node when given.
    pub fn service(destination: Option<NodeId>) -> Self {
        match destination {
            Some(node) => Self {
                id: SRV_CHECK_VALUE
                    | ((u32::from(node.into_u16()) & NODE_ID_MASK) << SRV_DESTINATION_OFFSET),
                mask: SRV_CHECK_MASK | (NODE_ID_MASK << SRV_DESTINATION_OFFSET),
            },
            None => Self {
                id: SRV_CHECK_VALUE,
                mask: SRV_CHECK_MASK,
            },
        }
    }

    pub fn matches(&self, can_id: u32) -> bool {
        can_id & self.mask == self.id
    }
}

const fn lsb_mask(n: u32) -> u32 {
    if n > 0 {
        u32::MAX >> (u32::BITS - n)
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expressible_lengths() {
        // Contiguous up to 8 B, then the DLC steps only.
        for len in 0usize..=8 {
            assert_eq!(DataLength::new(len).map(usize::from), Some(len));
        }
        for len in [9usize, 10, 11, 13, 25, 47, 63, 65, 100] {
            assert_eq!(DataLength::new(len), None);
        }
        for len in [12usize, 16, 20, 24, 32, 48, 64] {
            assert_eq!(DataLength::new(len).map(usize::from), Some(len));
        }
    }

    #[test]
    fn test_floor_and_ceil_bracket_the_value() {
        for len in 0usize..100 {
            let floor = usize::from(DataLength::new_floor(len));
            assert!(floor <= len.min(DataLength::MAX));
            assert!(DataLength::new(floor).is_some());
            // Nothing expressible fits between the floor and the value.
            for between in floor + 1..=len.min(DataLength::MAX) {
                assert_eq!(DataLength::new(between), None, "len {len}");
            }

            match DataLength::new_ceil(len) {
                Some(ceil) => {
                    let ceil = usize::from(ceil);
                    assert!(ceil >= len);
                    assert!(DataLength::new(ceil).is_some());
                    for between in len..ceil {
                        assert_eq!(DataLength::new(between), None, "len {len}");
                    }
                }
                None => assert!(len > DataLength::MAX),
            }
        }
    }

    #[test]
    fn test_rounding_spot_values() {
        assert_eq!(usize::from(DataLength::new_floor(11)), 8);
        assert_eq!(DataLength::new_ceil(9).map(usize::from), Some(12));
        assert_eq!(usize::from(DataLength::new_floor(63)), 48);
        assert_eq!(DataLength::new_ceil(33).map(usize::from), Some(48));
        assert_eq!(DataLength::new_ceil(64).map(usize::from), Some(64));
        assert_eq!(usize::from(DataLength::new_floor(100)), 64);
        assert_eq!(DataLength::new_ceil(65), None);
    }

    fn node(value: u16) -> NodeId {
        NodeId::new(value).unwrap()
    }

    #[test]
    fn test_message_id_round_trip() {
        let header = Header {
            priority: Priority::Nominal,
            data_spec: DataSpecifier::Message(SubjectId::new(1234).unwrap()),
            source: Some(node(42)),
            destination: None,
        };
        let id = encode_id(&header);
        assert_eq!(id & PRIORITY_MASK << PRIORITY_OFFSET, 4 << PRIORITY_OFFSET);
        assert_eq!(id & SERVICE_FLAG, 0);
        assert_eq!(id & MSG_ANONYMOUS_FLAG, 0);
        assert_eq!((id >> MSG_SUBJECT_OFFSET) & SUBJECT_ID_MASK, 1234);
        assert_eq!(id & NODE_ID_MASK, 42);
        assert_eq!(decode_id(id), Some(header));
    }

    #[test]
    fn test_anonymous_message_id() {
        let header = Header {
            priority: Priority::Low,
            data_spec: DataSpecifier::Message(SubjectId::new(8191).unwrap()),
            source: None,
            destination: None,
        };
        let id = encode_id(&header);
        assert_ne!(id & MSG_ANONYMOUS_FLAG, 0);
        assert_eq!(decode_id(id), Some(header));
    }

    #[test]
    fn test_service_id_round_trip() {
        for request in [true, false] {
            let service = ServiceId::new(123).unwrap();
            let header = Header {
                priority: Priority::High,
                data_spec: if request {
                    DataSpecifier::Request(service)
                } else {
                    DataSpecifier::Response(service)
                },
                source: Some(node(111)),
                destination: Some(node(42)),
            };
            let id = encode_id(&header);
            assert_ne!(id & SERVICE_FLAG, 0);
            assert_eq!(decode_id(id), Some(header));
        }
    }

    #[test]
    fn test_decode_rejects_reserved_violations() {
        let header = Header {
            priority: Priority::Nominal,
            data_spec: DataSpecifier::Message(SubjectId::new(10).unwrap()),
            source: Some(node(1)),
            destination: None,
        };
        let id = encode_id(&header);
        assert_eq!(decode_id(id | RES_23_FLAG), None);
        assert_eq!(decode_id(id | MSG_RES_7_FLAG), None);
        // ignored bits flip freely
        assert_eq!(decode_id(id & !MSG_IGNORE_MASK), Some(header));
    }

    #[test]
    fn test_acceptance_filters() {
        let subject = SubjectId::new(1234).unwrap();
        let msg = Header {
            priority: Priority::Nominal,
            data_spec: DataSpecifier::Message(subject),
            source: Some(node(42)),
            destination: None,
        };
        let srv = Header {
            priority: Priority::Nominal,
            data_spec: DataSpecifier::Request(ServiceId::new(5).unwrap()),
            source: Some(node(42)),
            destination: Some(node(7)),
        };

        let filter = AcceptanceFilter::subject(Some(subject));
        assert!(filter.matches(encode_id(&msg)));
        assert!(!filter.matches(encode_id(&srv)));

        let filter = AcceptanceFilter::service(Some(node(7)));
        assert!(filter.matches(encode_id(&srv)));
        assert!(!filter.matches(encode_id(&msg)));

        assert!(AcceptanceFilter::subject(None).matches(encode_id(&msg)));
    }
}
