//! candump log replayer
//!
//! Parses the compact single-line format produced by `candump -L` / `candump -l` and turns
//! it into capture records for offline tracing, or replays it into a live link for
//! hardware-free reproduction of a recorded bus.

use std::io::BufRead;

use hostcyphal_driver::can::{self, Data, Frame};
use hostcyphal_driver::link::Link;

use crate::time::{Duration, Instant};
use crate::transfer::Timestamp;
use crate::transport::capture::{CanCapture, Direction};

/// One parsed candump line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandumpRecord {
    /// Wall-clock time of reception, microseconds since the Unix epoch.
    pub timestamp_us: u64,
    pub iface: String,
    pub can_id: u32,
    pub extended: bool,
    pub fd: bool,
    pub data: Vec<u8>,
}

/// Parses one `candump -L` line, e.g. `(1631878543.134253) can0 1F334455#DEADBEEF`.
///
/// CAN FD records use `##` with a flags nibble: `1F334455##0DEADBEEF`. Remote and error
/// frames are not Cyphal traffic and yield `None`, as does anything malformed.
pub fn parse_line(line: &str) -> Option<CandumpRecord> {
    let mut parts = line.split_ascii_whitespace();
    let stamp = parts.next()?.strip_prefix('(')?.strip_suffix(')')?;
    let (seconds, micros) = stamp.split_once('.')?;
    let timestamp_us = seconds
        .parse::<u64>()
        .ok()?
        .checked_mul(1_000_000)?
        .checked_add(micros.parse::<u64>().ok()?)?;

    let iface = parts.next()?.to_string();
    let body = parts.next()?;

    let (id_text, rest) = body.split_once('#')?;
    let can_id = u32::from_str_radix(id_text, 16).ok()?;
    let extended = id_text.len() > 3;

    let (fd, data_hex) = match rest.strip_prefix('#') {
        Some(fd_rest) => (true, fd_rest.get(1..)?), // skip the FD flags nibble
        None => (false, rest),
    };
    if data_hex.starts_with('R') {
        return None; // remote frame
    }
    if data_hex.len() % 2 != 0 {
        return None;
    }
    let data = (0..data_hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&data_hex[i..i + 2], 16))
        .collect::<Result<Vec<u8>, _>>()
        .ok()?;

    Some(CandumpRecord {
        timestamp_us,
        iface,
        can_id,
        extended,
        fd,
        data,
    })
}

fn record_to_frame(record: &CandumpRecord) -> Option<(Timestamp, Frame)> {
    if !record.extended {
        return None;
    }
    let header = can::decode_id(record.can_id)?;
    let data = Data::new(&record.data).ok()?;
    let offset = Duration::from_micros(record.timestamp_us);
    let timestamp = Timestamp {
        system: std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_micros(record.timestamp_us),
        monotonic: Instant::MIN + offset,
    };
    Some((
        timestamp,
        Frame {
            header,
            data,
            timestamp: timestamp.monotonic,
            loop_back: false,
        },
    ))
}

/// Reads a whole log into chronologically ordered capture records for a tracer.
///
/// Lines that are not valid Cyphal frames (error frames, standard-ID traffic, other
/// protocols on the same bus) are skipped silently.
pub fn read_captures(reader: impl BufRead) -> std::io::Result<Vec<CanCapture>> {
    let mut captures = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let Some(record) = parse_line(&line) else {
            continue;
        };
        if let Some((timestamp, frame)) = record_to_frame(&record) {
            captures.push(CanCapture {
                timestamp,
                direction: Direction::Ingress,
                frame,
            });
        }
    }
    Ok(captures)
}

/// Replays a log into a live link as fast as possible, preserving relative order.
pub fn replay(reader: impl BufRead, link: &Link<Frame>) -> std::io::Result<usize> {
    let mut count = 0;
    for line in reader.lines() {
        let line = line?;
        let Some(record) = parse_line(&line) else {
            continue;
        };
        if let Some((_, mut frame)) = record_to_frame(&record) {
            frame.timestamp = Instant::now();
            link.push_received(frame);
            count += 1;
        }
    }
    Ok(count)
}
