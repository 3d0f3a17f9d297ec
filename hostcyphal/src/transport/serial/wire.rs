//! Cyphal/serial frame codec and stream parser
//!
//! The byte stream is framed with COBS, delimited by zero bytes. Each frame carries a
//! 24-byte header mirroring Cyphal/UDP, except that the trailing CRC-16 protects the
//! header itself (the stream has no datagram boundaries, so the header must be
//! self-validating). The transfer-wide CRC-32C travels at the end of the payload stream
//! exactly as on UDP.
//!
//! Only header version 1 is understood. The pre-release layout is rejected with a
//! version-mismatch diagnostic rather than auto-detected.

use crate::core::{DataSpecifier, NodeId, Priority, ServiceId, SubjectId, TransferId};
use crate::transport::crc::TransferCrc16;

pub const HEADER_SIZE: usize = 24;
pub const VERSION: u8 = 1;
pub const FRAME_DELIMITER: u8 = 0;

const NODE_ID_UNSET: u16 = 0xffff;
const SNM_BIT: u16 = 1 << 15;
const RNR_BIT: u16 = 1 << 14;
const SUBJECT_ID_MASK: u16 = (1 << 15) - 1;
const SERVICE_ID_MASK: u16 = (1 << 14) - 1;
const INDEX_MASK: u32 = (1 << 31) - 1;
const EOT_BIT: u32 = 1 << 31;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialFrame {
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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// The image is shorter than one header.
    Truncated,
    /// The header CRC does not match: noise or framing slip.
    HeaderCrc,
    /// A well-formed header of a protocol version this implementation does not speak.
    VersionMismatch,
    /// Header fields are out of range.
    Malformed,
}

impl SerialFrame {
    fn header_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut header = [0u8; HEADER_SIZE];
        header[0] = VERSION;
        header[1] = self.priority.into_u8();
        header[2..4].copy_from_slice(
            &self
                .source_node_id
                .map(u16::from)
                .unwrap_or(NODE_ID_UNSET)
                .to_le_bytes(),
        );
        header[4..6].copy_from_slice(
            &self
                .destination_node_id
                .map(u16::from)
                .unwrap_or(NODE_ID_UNSET)
                .to_le_bytes(),
        );
        let data_spec = match self.data_specifier {
            DataSpecifier::Message(subject) => subject.into_u16(),
            DataSpecifier::Request(service) => SNM_BIT | RNR_BIT | service.into_u16(),
            DataSpecifier::Response(service) => SNM_BIT | service.into_u16(),
        };
        header[6..8].copy_from_slice(&data_spec.to_le_bytes());
        header[8..16].copy_from_slice(&self.transfer_id.into_u64().to_le_bytes());
        let index_eot =
            (self.index & INDEX_MASK) | if self.end_of_transfer { EOT_BIT } else { 0 };
        header[16..20].copy_from_slice(&index_eot.to_le_bytes());
        header[20..22].copy_from_slice(&self.user_data.to_le_bytes());
        let crc = TransferCrc16::new(&header[..HEADER_SIZE - 2]).to_bytes();
        header[22..24].copy_from_slice(&crc);
        header
    }

    /// Compiles the frame into its on-wire form: delimiter, COBS image, delimiter.
    pub fn compile(&self) -> Vec<u8> {
        let mut image = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        image.extend_from_slice(&self.header_bytes());
        image.extend_from_slice(&self.payload);

        let encoded = cobs_encode(&image);
        let mut wire = Vec::with_capacity(encoded.len() + 2);
        wire.push(FRAME_DELIMITER);
        wire.extend_from_slice(&encoded);
        wire.push(FRAME_DELIMITER);
        wire
    }

    /// Parses one COBS-decoded frame image.
    pub fn parse(image: &[u8]) -> Result<SerialFrame, ParseError> {
        if image.len() < HEADER_SIZE {
            return Err(ParseError::Truncated);
        }
        if !TransferCrc16::new(&image[..HEADER_SIZE]).check_residue() {
            return Err(ParseError::HeaderCrc);
        }
        if image[0] != VERSION {
            return Err(ParseError::VersionMismatch);
        }
        let word16 = |at: usize| u16::from_le_bytes([image[at], image[at + 1]]);
        let priority = Priority::try_from_u8(image[1]).ok_or(ParseError::Malformed)?;
        let decode_node = |raw: u16| -> Result<Option<NodeId>, ParseError> {
            if raw == NODE_ID_UNSET {
                Ok(None)
            } else {
                NodeId::new(raw).map(Some).ok_or(ParseError::Malformed)
            }
        };
        let source_node_id = decode_node(word16(2))?;
        let destination_node_id = decode_node(word16(4))?;
        let raw_spec = word16(6);
        let data_specifier = if raw_spec & SNM_BIT != 0 {
            let service =
                ServiceId::new(raw_spec & SERVICE_ID_MASK).ok_or(ParseError::Malformed)?;
            if raw_spec & RNR_BIT != 0 {
                DataSpecifier::Request(service)
            } else {
                DataSpecifier::Response(service)
            }
        } else {
            DataSpecifier::Message(
                SubjectId::new(raw_spec & SUBJECT_ID_MASK).ok_or(ParseError::Malformed)?,
            )
        };
        let transfer_id = TransferId::new(u64::from_le_bytes(
            image[8..16].try_into().map_err(|_| ParseError::Malformed)?,
        ));
        let index_eot = u32::from_le_bytes(
            image[16..20].try_into().map_err(|_| ParseError::Malformed)?,
        );

        Ok(SerialFrame {
            priority,
            source_node_id,
            destination_node_id,
            data_specifier,
            transfer_id,
            index: index_eot & INDEX_MASK,
            end_of_transfer: index_eot & EOT_BIT != 0,
            user_data: word16(20),
            payload: image[HEADER_SIZE..].to_vec(),
        })
    }
}

/// COBS encoding: the output contains no zero bytes.
pub fn cobs_encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 254 + 1);
    let mut code_index = 0;
    out.push(0); // placeholder for the first code byte
    let mut code = 1u8;

    for &byte in data {
        if byte == 0 {
            out[code_index] = code;
            code_index = out.len();
            out.push(0);
            code = 1;
        } else {
            out.push(byte);
            code += 1;
            if code == 0xff {
                out[code_index] = code;
                code_index = out.len();
                out.push(0);
                code = 1;
            }
        }
    }
    out[code_index] = code;
    out
}

/// COBS decoding; `None` for corrupt input (embedded zeros or bad codes).
pub fn cobs_decode(data: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len());
    let mut index = 0;
    while index < data.len() {
        let code = data[index];
        if code == 0 {
            return None;
        }
        index += 1;
        for _ in 1..code {
            let byte = *data.get(index)?;
            if byte == 0 {
                return None;
            }
            out.push(byte);
            index += 1;
        }
        if code != 0xff && index < data.len() {
            out.push(0);
        }
    }
    Some(out)
}

/// Events produced by the [`StreamParser`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Frame(SerialFrame),
    Error(ParseError),
}

/// Incremental frame extractor for the raw byte stream.
///
/// Bytes between delimiters accumulate until the closing delimiter arrives; anything that
/// fails COBS or header validation is reported and skipped, keeping the parser in sync
/// with the stream. An accumulation exceeding the size limit is discarded as noise.
pub struct StreamParser {
    buffer: Vec<u8>,
    overflown: bool,
    limit: usize,
}

impl StreamParser {
    pub fn new(max_frame_payload: usize) -> Self {
        let decoded_limit = HEADER_SIZE + max_frame_payload;
        Self {
            buffer: Vec::new(),
            overflown: false,
            // Worst-case COBS expansion is one byte per 254.
            limit: decoded_limit + decoded_limit / 254 + 2,
        }
    }

    pub fn push_bytes(&mut self, bytes: &[u8], mut on_event: impl FnMut(StreamEvent)) {
        for &byte in bytes {
            if byte != FRAME_DELIMITER {
                if self.buffer.len() >= self.limit {
                    self.buffer.clear();
                    self.overflown = true;
                }
                if !self.overflown {
                    self.buffer.push(byte);
                }
                continue;
            }

            let overflown = core::mem::take(&mut self.overflown);
            let accumulated = core::mem::take(&mut self.buffer);
            if overflown {
                on_event(StreamEvent::Error(ParseError::Malformed));
                continue;
            }
            if accumulated.is_empty() {
                continue; // back-to-back delimiters are idle line noise
            }
            match cobs_decode(&accumulated) {
                Some(image) => match SerialFrame::parse(&image) {
                    Ok(frame) => on_event(StreamEvent::Frame(frame)),
                    Err(error) => on_event(StreamEvent::Error(error)),
                },
                None => on_event(StreamEvent::Error(ParseError::Malformed)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cobs_reference_vectors() {
        assert_eq!(cobs_encode(&[]), [1]);
        assert_eq!(cobs_encode(&[0]), [1, 1]);
        assert_eq!(cobs_encode(&[0, 0]), [1, 1, 1]);
        assert_eq!(cobs_encode(&[11, 22, 0, 33]), [3, 11, 22, 2, 33]);
        assert_eq!(cobs_encode(&[11, 22, 33, 44]), [5, 11, 22, 33, 44]);

        let long: Vec<u8> = (1..=254u8).collect();
        let encoded = cobs_encode(&long);
        assert_eq!(encoded[0], 0xff);
        assert_eq!(encoded.len(), 256);
        assert_eq!(cobs_decode(&encoded).unwrap(), long);
    }

    #[test]
    fn test_cobs_round_trip() {
        for length in [0usize, 1, 5, 253, 254, 255, 300, 1000] {
            let data: Vec<u8> = (0..length).map(|i| (i % 7) as u8).collect();
            let encoded = cobs_encode(&data);
            assert!(!encoded.contains(&0), "length {length}");
            assert_eq!(cobs_decode(&encoded).unwrap(), data, "length {length}");
        }
    }

    #[test]
    fn test_cobs_decode_rejects_corruption() {
        assert_eq!(cobs_decode(&[0, 1]), None);
        assert_eq!(cobs_decode(&[5, 1, 2]), None); // truncated block
    }

    fn frame(payload: &[u8]) -> SerialFrame {
        SerialFrame {
            priority: Priority::Nominal,
            source_node_id: NodeId::new(1234),
            destination_node_id: None,
            data_specifier: DataSpecifier::Message(SubjectId::new(555).unwrap()),
            transfer_id: TransferId::new(0xbadc0ffee),
            index: 0,
            end_of_transfer: true,
            user_data: 0,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn test_frame_round_trip() {
        let frame = frame(b"The fog is thick today");
        let wire = frame.compile();
        assert_eq!(wire.first(), Some(&FRAME_DELIMITER));
        assert_eq!(wire.last(), Some(&FRAME_DELIMITER));
        assert!(!wire[1..wire.len() - 1].contains(&FRAME_DELIMITER));

        let image = cobs_decode(&wire[1..wire.len() - 1]).unwrap();
        assert_eq!(SerialFrame::parse(&image), Ok(frame));
    }

    #[test]
    fn test_parse_header_validation() {
        let mut image = cobs_decode(&{
            let wire = frame(b"x").compile();
            wire[1..wire.len() - 1].to_vec()
        })
        .unwrap();

        assert_eq!(SerialFrame::parse(&image[..10]), Err(ParseError::Truncated));

        let saved = image[1];
        image[1] = 0xaa; // corrupt priority; the header CRC catches it first
        assert_eq!(SerialFrame::parse(&image), Err(ParseError::HeaderCrc));
        image[1] = saved;

        // A foreign version with a valid CRC is a version mismatch, not noise.
        image[0] = 0;
        let crc = TransferCrc16::new(&image[..HEADER_SIZE - 2]).to_bytes();
        image[22..24].copy_from_slice(&crc);
        assert_eq!(SerialFrame::parse(&image), Err(ParseError::VersionMismatch));
    }

    #[test]
    fn test_stream_parser_resynchronizes() {
        let good = frame(b"payload one");
        let mut stream = Vec::new();
        stream.extend_from_slice(&good.compile());
        stream.extend_from_slice(&[0x55, 0xaa, 0x01]); // line noise
        stream.push(FRAME_DELIMITER);
        stream.extend_from_slice(&frame(b"payload two").compile());

        let mut events = Vec::new();
        let mut parser = StreamParser::new(1024);
        parser.push_bytes(&stream, |e| events.push(e));

        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], StreamEvent::Frame(f) if f.payload == b"payload one"));
        assert!(matches!(events[1], StreamEvent::Error(ParseError::Malformed)));
        assert!(matches!(&events[2], StreamEvent::Frame(f) if f.payload == b"payload two"));
    }

    #[test]
    fn test_stream_parser_split_delivery() {
        let wire = frame(b"split across reads").compile();
        let mut events = Vec::new();
        let mut parser = StreamParser::new(1024);
        for chunk in wire.chunks(3) {
            parser.push_bytes(chunk, |e| events.push(e));
        }
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_stream_parser_discards_oversize_noise() {
        let mut events = Vec::new();
        let mut parser = StreamParser::new(16);
        let noise = vec![0x42u8; 4096];
        parser.push_bytes(&noise, |e| events.push(e));
        parser.push_bytes(&[FRAME_DELIMITER], |e| events.push(e));
        assert_eq!(events, [StreamEvent::Error(ParseError::Malformed)]);
    }
}
