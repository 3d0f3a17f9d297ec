//! Cyphal/UDP frame codec
//!
//! Every datagram is one frame: a fixed 24-byte little-endian header followed by the
//! payload. The header replicates the addressing normally inferred from the IP layer so
//! that a node can bind to an arbitrary local interface; 0xffff stands for an anonymous
//! source and for the broadcast destination. End-of-transfer frames carry the CRC-16 of
//! their own payload in the trailing header field; the transfer-wide CRC-32C travels at
//! the end of the payload stream (see [`crate::transport::commons`]).
//!
//! ```text
//! struct Header {
//!     uint8   version;              // 1
//!     uint8   priority;             // 0 = highest, 7 = lowest
//!     uint16  source_node_id;       // 0xffff = anonymous
//!     uint16  destination_node_id;  // 0xffff = broadcast
//!     uint16  data_specifier;       // subject-ID, or service-ID | RNR; bit 15 = SNM
//!     uint64  transfer_id;
//!     uint32  frame_index;          // bit 31 = end of transfer
//!     uint16  user_data;
//!     uint16  payload_crc;          // CRC-16 of the payload, EOT frames only
//! };
//! ```

use crate::core::{DataSpecifier, NodeId, Priority, ServiceId, SubjectId, TransferId};
use crate::transport::crc::TransferCrc16;

pub const HEADER_SIZE: usize = 24;
pub const VERSION: u8 = 1;

const NODE_ID_UNSET: u16 = 0xffff;
const SNM_BIT: u16 = 1 << 15;
const RNR_BIT: u16 = 1 << 14;
const SUBJECT_ID_MASK: u16 = (1 << 15) - 1;
const SERVICE_ID_MASK: u16 = (1 << 14) - 1;
const INDEX_MASK: u32 = (1 << 31) - 1;
const EOT_BIT: u32 = 1 << 31;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpFrame {
    pub priority: Priority,
    pub source_node_id: Option<NodeId>,
    pub destination_node_id: Option<NodeId>,
    pub data_specifier: DataSpecifier,
    pub transfer_id: TransferId,
    pub index: u32,
    pub end_of_transfer: bool,
    pub user_data: u16,
    pub payload: Vec<u8>,
}

fn encode_data_specifier(data_specifier: DataSpecifier) -> u16 {
    match data_specifier {
        DataSpecifier::Message(subject) => subject.into_u16(),
        DataSpecifier::Request(service) => SNM_BIT | RNR_BIT | service.into_u16(),
        DataSpecifier::Response(service) => SNM_BIT | service.into_u16(),
    }
}

fn decode_data_specifier(raw: u16) -> Option<DataSpecifier> {
    if raw & SNM_BIT != 0 {
        let service = ServiceId::new(raw & SERVICE_ID_MASK)?;
        Some(if raw & RNR_BIT != 0 {
            DataSpecifier::Request(service)
        } else {
            DataSpecifier::Response(service)
        })
    } else {
        Some(DataSpecifier::Message(SubjectId::new(raw & SUBJECT_ID_MASK)?))
    }
}

fn encode_node_id(node: Option<NodeId>) -> u16 {
    node.map(u16::from).unwrap_or(NODE_ID_UNSET)
}

fn decode_node_id(raw: u16) -> Option<Option<NodeId>> {
    if raw == NODE_ID_UNSET {
        Some(None)
    } else {
        NodeId::new(raw).map(Some)
    }
}

impl UdpFrame {
    /// Compiles the frame into one datagram image.
    pub fn compile(&self) -> Vec<u8> {
        let mut image = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        image.push(VERSION);
        image.push(self.priority.into_u8());
        image.extend_from_slice(&encode_node_id(self.source_node_id).to_le_bytes());
        image.extend_from_slice(&encode_node_id(self.destination_node_id).to_le_bytes());
        image.extend_from_slice(&encode_data_specifier(self.data_specifier).to_le_bytes());
        image.extend_from_slice(&self.transfer_id.into_u64().to_le_bytes());
        let index_eot = (self.index & INDEX_MASK)
            | if self.end_of_transfer { EOT_BIT } else { 0 };
        image.extend_from_slice(&index_eot.to_le_bytes());
        image.extend_from_slice(&self.user_data.to_le_bytes());
        let payload_crc = if self.end_of_transfer {
            TransferCrc16::new(&self.payload).get()
        } else {
            0
        };
        image.extend_from_slice(&payload_crc.to_le_bytes());
        image.extend_from_slice(&self.payload);
        image
    }

    /// Parses one datagram. Returns `None` for malformed images, foreign versions, and
    /// end-of-transfer frames whose payload CRC does not match.
    pub fn parse(image: &[u8]) -> Option<UdpFrame> {
        if image.len() < HEADER_SIZE || image[0] != VERSION {
            return None;
        }
        let word16 = |at: usize| u16::from_le_bytes([image[at], image[at + 1]]);
        let priority = Priority::try_from_u8(image[1])?;
        let source_node_id = decode_node_id(word16(2))?;
        let destination_node_id = decode_node_id(word16(4))?;
        let data_specifier = decode_data_specifier(word16(6))?;
        let transfer_id = TransferId::new(u64::from_le_bytes(image[8..16].try_into().ok()?));
        let index_eot = u32::from_le_bytes(image[16..20].try_into().ok()?);
        let user_data = word16(20);
        let payload_crc = word16(22);
        let payload = image[HEADER_SIZE..].to_vec();

        let end_of_transfer = index_eot & EOT_BIT != 0;
        if end_of_transfer && TransferCrc16::new(&payload).get() != payload_crc {
            return None;
        }

        Some(UdpFrame {
            priority,
            source_node_id,
            destination_node_id,
            data_specifier,
            transfer_id,
            index: index_eot & INDEX_MASK,
            end_of_transfer,
            user_data,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(value: u16) -> Option<NodeId> {
        Some(NodeId::new(value).unwrap())
    }

    #[test]
    fn test_compile_multiframe_subject() {
        let frame = UdpFrame {
            priority: Priority::Slow,
            source_node_id: node(1),
            destination_node_id: node(2),
            data_specifier: DataSpecifier::Message(SubjectId::new(3).unwrap()),
            transfer_id: TransferId::new(0x00de_ad_be_ef_c0_ff_ee_u64),
            index: 0x00dd_f00d,
            end_of_transfer: false,
            user_data: 0,
            payload: b"Well, I got here the same way the coin did.".to_vec(),
        };
        let image = frame.compile();
        let expected_header: &[u8] = &[
            0x01, // version
            0x06, // priority
            0x01, 0x00, // source_node_id
            0x02, 0x00, // destination_node_id
            0x03, 0x00, // data_specifier
            0xee, 0xff, 0xc0, 0xef, 0xbe, 0xad, 0xde, 0x00, // transfer_id
            0x0d, 0xf0, 0xdd, 0x00, // index
            0x00, 0x00, // user_data
            0x00, 0x00, // payload_crc (not EOT)
        ];
        assert_eq!(&image[..HEADER_SIZE], expected_header);
        assert_eq!(&image[HEADER_SIZE..], frame.payload.as_slice());
    }

    #[test]
    fn test_compile_single_frame_subject_with_crc() {
        let frame = UdpFrame {
            priority: Priority::Nominal,
            source_node_id: node(5),
            destination_node_id: None,
            data_specifier: DataSpecifier::Message(SubjectId::new(3210).unwrap()),
            transfer_id: TransferId::new(12340),
            index: 0,
            end_of_transfer: true,
            user_data: 0,
            payload: b"onetwothree".to_vec(),
        };
        assert_eq!(
            frame.compile(),
            [
                b"\x01\x04\x05\x00\xff\xff\x8a\x0c40\x00\x00\x00\x00\x00\x00\x00\x00\x00\x80\x00\x00\xe3\xc2".as_slice(),
                b"onetwothree",
            ]
            .concat()
        );
    }

    #[test]
    fn test_compile_service_request() {
        let frame = UdpFrame {
            priority: Priority::Optional,
            source_node_id: node(6),
            destination_node_id: node(2222),
            data_specifier: DataSpecifier::Request(ServiceId::new(321).unwrap()),
            transfer_id: TransferId::new(54321),
            index: 0,
            end_of_transfer: false,
            user_data: 0,
            payload: b"onetwothre".to_vec(),
        };
        assert_eq!(
            frame.compile(),
            [
                b"\x01\x07\x06\x00\xae\x08A\xc11\xd4\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00"
                    .as_slice(),
                b"onetwothre",
            ]
            .concat()
        );
    }

    #[test]
    fn test_parse_round_trip() {
        let frame = UdpFrame {
            priority: Priority::Optional,
            source_node_id: node(5),
            destination_node_id: node(4),
            data_specifier: DataSpecifier::Request(ServiceId::new(3).unwrap()),
            transfer_id: TransferId::new(0x00de_ad_be_ef_c0_ff_ee_u64),
            index: 0x00dd_f00d,
            end_of_transfer: true,
            user_data: 0,
            payload: b"Well, I got here the same way the coin did.".to_vec(),
        };
        assert_eq!(UdpFrame::parse(&frame.compile()), Some(frame.clone()));

        // Anonymous broadcast.
        let frame = UdpFrame {
            source_node_id: None,
            destination_node_id: None,
            end_of_transfer: false,
            ..frame
        };
        assert_eq!(UdpFrame::parse(&frame.compile()), Some(frame));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for size in 0..HEADER_SIZE {
            assert_eq!(UdpFrame::parse(&vec![0; size]), None);
        }

        let frame = UdpFrame {
            priority: Priority::Nominal,
            source_node_id: node(1),
            destination_node_id: None,
            data_specifier: DataSpecifier::Message(SubjectId::new(5).unwrap()),
            transfer_id: TransferId::new(1),
            index: 0,
            end_of_transfer: true,
            user_data: 0,
            payload: b"payload".to_vec(),
        };
        let mut image = frame.compile();

        // Wrong payload CRC.
        let last = image.len() - 1;
        image[last] ^= 0xff;
        assert_eq!(UdpFrame::parse(&image), None);

        // Foreign version.
        let mut image = frame.compile();
        image[0] = 2;
        assert_eq!(UdpFrame::parse(&image), None);

        // Out-of-range service-ID.
        let mut image = frame.compile();
        image[6] = 0xff;
        image[7] = 0xff; // SNM | RNR | 0x3fff
        assert_eq!(UdpFrame::parse(&image), None);
    }
}
