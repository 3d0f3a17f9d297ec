//! Transfer segmentation for Cyphal/CAN
//!
//! Splits a transfer payload into frame data windows with tail bytes. Single-frame
//! transfers carry no CRC; multi-frame transfers append the CRC-16 of the payload after
//! the last payload byte, possibly spilling it into a dedicated trailing frame. CAN FD
//! padding of the terminal frame is inserted before the CRC so the check covers it.

use hostcyphal_driver::can::{Data, DataLength, Mtu};

use crate::transport::can::format::{PAD_VALUE, SOT_TOGGLE_BIT, TailByte};
use crate::transport::crc::TransferCrc16;

pub(crate) struct Scatter<'a> {
    transfer_id: u8,
    toggle_bit: bool,
    payload: &'a [u8],
    offset: usize,
    crc: TransferCrc16,
}

impl<'a> Scatter<'a> {
    const CRC_LENGTH: usize = TransferCrc16::LENGTH;
    const TAIL_LENGTH: usize = 1;

    pub(crate) fn new(transfer_id: u8, payload: &'a [u8]) -> Self {
        Self {
            transfer_id,
            toggle_bit: SOT_TOGGLE_BIT,
            payload,
            offset: 0,
            crc: TransferCrc16::new(payload),
        }
    }

    /// Number of frames a payload occupies at the given MTU.
    pub(crate) fn frame_count(payload_length: usize, mtu: Mtu) -> usize {
        let window = usize::from(mtu) - Self::TAIL_LENGTH;
        if payload_length <= window {
            1
        } else {
            (payload_length + Self::CRC_LENGTH).div_ceil(window)
        }
    }

    pub(crate) fn next_frame(&mut self, mtu: Mtu) -> Option<Data> {
        let window = usize::from(mtu) - Self::TAIL_LENGTH;

        // single frame transfer
        if self.offset == 0 && self.payload.len() <= window {
            let frame_length = DataLength::new_ceil(self.payload.len() + Self::TAIL_LENGTH)
                .expect("single frame fits the MTU");
            let mut data = Data::new_zeros(frame_length);
            let (tail, body) = data.split_last_mut().expect("frame has a tail byte");
            let (body_payload, body_pad) = body.split_at_mut(self.payload.len());
            body_payload.copy_from_slice(self.payload);
            body_pad.fill(PAD_VALUE);
            *tail = TailByte::new(true, true, SOT_TOGGLE_BIT, self.transfer_id).into();

            self.offset = self.payload.len() + Self::CRC_LENGTH;
            return Some(data);
        }

        let total = self.payload.len() + Self::CRC_LENGTH;
        let residual = total - self.offset;
        if residual == 0 {
            return None;
        }

        let sot = self.offset == 0;
        let body_length = residual.min(window);
        let eot = residual <= window;

        let frame_length = if eot {
            // Padding may be required on FD; it goes before the CRC and is covered by it.
            DataLength::new_ceil(body_length + Self::TAIL_LENGTH).expect("fits the MTU")
        } else {
            DataLength::new(window + Self::TAIL_LENGTH).expect("full frames match the MTU")
        };
        let mut data = Data::new_zeros(frame_length);
        let (tail, body) = data.split_last_mut().expect("frame has a tail byte");

        if eot {
            self.fill_terminal(body);
        } else {
            self.fill_full(body);
        }

        *tail = TailByte::new(sot, eot, self.toggle_bit, self.transfer_id).into();
        self.toggle_bit = !self.toggle_bit;
        Some(data)
    }

    // Fills a non-terminal frame: payload only, or payload plus the leading CRC byte(s).
    fn fill_full(&mut self, body: &mut [u8]) {
        let payload_part = &self.payload[self.offset.min(self.payload.len())..];
        let take = payload_part.len().min(body.len());
        body[..take].copy_from_slice(&payload_part[..take]);

        if take < body.len() {
            let crc_offset = self.offset + take - self.payload.len();
            let crc_bytes = self.crc.to_bytes();
            let rest = body.len() - take;
            body[take..].copy_from_slice(&crc_bytes[crc_offset..crc_offset + rest]);
        }
        self.offset += body.len();
    }

    // Fills the terminal frame: residual payload, FD padding, then the CRC recomputed
    // over the padding.
    fn fill_terminal(&mut self, body: &mut [u8]) {
        let consumed_crc = self.offset.saturating_sub(self.payload.len());
        let payload_part = &self.payload[self.offset.min(self.payload.len())..];

        let (body_data, body_rest) = body.split_at_mut(payload_part.len());
        body_data.copy_from_slice(payload_part);

        let crc_space = Self::CRC_LENGTH - consumed_crc;
        let pad_length = body_rest.len() - crc_space;
        let (body_pad, body_crc) = body_rest.split_at_mut(pad_length);
        body_pad.fill(PAD_VALUE);

        let crc_bytes = if body_pad.is_empty() {
            self.crc.to_bytes()
        } else {
            debug_assert_eq!(consumed_crc, 0, "padding after a partially sent CRC");
            let mut crc = self.crc;
            crc.add_bytes(body_pad);
            crc.to_bytes()
        };
        body_crc.copy_from_slice(&crc_bytes[consumed_crc..]);

        self.offset = self.payload.len() + Self::CRC_LENGTH;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(transfer_id: u8, payload: &[u8], mtu: Mtu) -> Vec<Vec<u8>> {
        let mut scatter = Scatter::new(transfer_id, payload);
        let mut frames = Vec::new();
        while let Some(data) = scatter.next_frame(mtu) {
            frames.push(data.to_vec());
        }
        assert_eq!(frames.len(), Scatter::frame_count(payload.len(), mtu));
        frames
    }

    #[test]
    fn test_zero_length_single_frame() {
        assert_eq!(
            collect(27, &[], Mtu::Classic),
            vec![vec![0b1110_0000 + 27]]
        );
    }

    #[test]
    fn test_non_full_single_frame() {
        assert_eq!(
            collect(27, &[0, 1, 2, 3, 4, 5], Mtu::Classic),
            vec![vec![0, 1, 2, 3, 4, 5, 0b1110_0000 + 27]]
        );
    }

    #[test]
    fn test_full_single_frame() {
        assert_eq!(
            collect(27, &[0, 1, 2, 3, 4, 5, 6], Mtu::Classic),
            vec![vec![0, 1, 2, 3, 4, 5, 6, 0b1110_0000 + 27]]
        );
    }

    #[test]
    fn test_minimum_double_frame() {
        // CRC-16 of [0..=7] is 0x178d.
        assert_eq!(
            collect(27, &[0, 1, 2, 3, 4, 5, 6, 7], Mtu::Classic),
            vec![
                vec![0, 1, 2, 3, 4, 5, 6, 0b1010_0000 + 27],
                vec![7, 0x17, 0x8d, 0b0100_0000 + 27],
            ]
        );
    }

    #[test]
    fn test_full_double_frame() {
        // CRC-16 of [0..=11] is 0x7673.
        assert_eq!(
            collect(27, &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11], Mtu::Classic),
            vec![
                vec![0, 1, 2, 3, 4, 5, 6, 0b1010_0000 + 27],
                vec![7, 8, 9, 10, 11, 0x76, 0x73, 0b0100_0000 + 27],
            ]
        );
    }

    #[test]
    fn test_crc_split_across_frames() {
        // CRC-16 of [0..=12] is 0xacdd; the first CRC byte rides in the second frame.
        assert_eq!(
            collect(27, &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12], Mtu::Classic),
            vec![
                vec![0, 1, 2, 3, 4, 5, 6, 0b1010_0000 + 27],
                vec![7, 8, 9, 10, 11, 12, 0xac, 0b0000_0000 + 27],
                vec![0xdd, 0b0110_0000 + 27],
            ]
        );
    }

    #[test]
    fn test_crc_only_terminal_frame() {
        // CRC-16 of [0..=13] is 0x78cb; the whole CRC rides in a dedicated frame.
        assert_eq!(
            collect(27, &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13], Mtu::Classic),
            vec![
                vec![0, 1, 2, 3, 4, 5, 6, 0b1010_0000 + 27],
                vec![7, 8, 9, 10, 11, 12, 13, 0b0000_0000 + 27],
                vec![0x78, 0xcb, 0b0110_0000 + 27],
            ]
        );
    }

    #[test]
    fn test_twenty_byte_transfer_toggles() {
        // Payload split 7 + 7 + 6; the CRC straddles the last two frames.
        let payload: Vec<u8> = (0u8..20).collect();
        let frames = collect(0, &payload, Mtu::Classic);
        assert_eq!(frames.len(), 4);
        let tails: Vec<TailByte> = frames
            .iter()
            .map(|f| TailByte::from(*f.last().unwrap()))
            .collect();
        assert!(tails[0].sot() && !tails[0].eot() && tails[0].toggle());
        assert!(!tails[1].sot() && !tails[1].eot() && !tails[1].toggle());
        assert!(!tails[2].sot() && !tails[2].eot() && tails[2].toggle());
        assert!(!tails[3].sot() && tails[3].eot() && !tails[3].toggle());

        let crc = TransferCrc16::new(&payload).to_bytes();
        assert_eq!(frames[2], [&payload[14..20], &crc[..1]].concat());
        assert_eq!(frames[3][0], crc[1]);
        assert_eq!(frames[3].len(), 2);
    }

    #[test]
    fn test_fd_padding_single_frame() {
        // 8 B + tail does not match a DLC step on FD; three pad bytes are inserted.
        let mut scatter = Scatter::new(27, &[0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(
            scatter.next_frame(Mtu::Fd).unwrap().to_vec(),
            vec![0, 1, 2, 3, 4, 5, 6, 7, 0, 0, 0, 0b1110_0000 + 27]
        );
        assert!(scatter.next_frame(Mtu::Fd).is_none());
    }

    #[test]
    fn test_fd_padding_multi_frame_covered_by_crc() {
        let payload: Vec<u8> = (0u8..69).collect();
        let mut scatter = Scatter::new(27, &payload);
        let first = scatter.next_frame(Mtu::Fd).unwrap();
        assert_eq!(&first[..63], &payload[..63]);
        assert_eq!(first[63], 0b1010_0000 + 27);

        // Terminal frame: 6 payload bytes, 3 pad bytes, CRC over payload + padding.
        let second = scatter.next_frame(Mtu::Fd).unwrap();
        let mut crc = TransferCrc16::new(&payload);
        crc.add_bytes(&[0, 0, 0]);
        let expected: Vec<u8> = [63, 64, 65, 66, 67, 68, 0, 0, 0]
            .into_iter()
            .chain(crc.to_bytes())
            .chain([0b0100_0000 + 27])
            .collect();
        assert_eq!(second.to_vec(), expected);
        assert!(scatter.next_frame(Mtu::Fd).is_none());
    }
}
