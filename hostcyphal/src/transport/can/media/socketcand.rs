//! socketcand media driver
//!
//! Bridges a remote CAN interface exposed by the socketcand daemon over its text TCP
//! protocol. Only the raw mode is used: after the `< open iface >` and `< rawmode >`
//! handshake the daemon relays every bus frame as `< frame <id> <sec>.<usec> <data> >`
//! and accepts `< send <id> <dlc> <bytes...> >`.
//!
//! Acceptance filter updates are ignored: the daemon delivers everything and the
//! transport discards frames it has no session for.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::thread::JoinHandle;
use std::time::Duration as StdDuration;

use hostcyphal_driver::can::{self, Data, Frame, Mtu};
use hostcyphal_driver::link::Link;

use crate::time::Instant;
use crate::transport::can::media::CanMedia;
use crate::transport::error::TransportError;

pub struct SocketcandMedia {
    address: String,
    iface: String,
    stream: Option<TcpStream>,
    threads: Vec<JoinHandle<()>>,
    link: Option<Link<Frame>>,
}

impl SocketcandMedia {
    /// `address` is `host:port` of the daemon, `iface` the remote bus name (e.g. `can0`).
    pub fn new(address: impl Into<String>, iface: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            iface: iface.into(),
            stream: None,
            threads: Vec::new(),
            link: None,
        }
    }
}

fn read_message(reader: &mut impl BufRead) -> io::Result<String> {
    // Messages are "< ... >"; anything between them is protocol noise.
    let mut message = Vec::new();
    let mut inside = false;
    loop {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte)?;
        match byte[0] {
            b'<' => {
                inside = true;
                message.clear();
            }
            b'>' if inside => {
                return Ok(String::from_utf8_lossy(&message).trim().to_string());
            }
            _ if inside => message.push(byte[0]),
            _ => {}
        }
    }
}

fn expect_ok(reader: &mut impl BufRead, context: &str) -> Result<(), TransportError> {
    let reply = read_message(reader)
        .map_err(|e| TransportError::InvalidConfiguration(format!("{context}: {e}")))?;
    if reply.starts_with("ok") {
        Ok(())
    } else {
        Err(TransportError::InvalidConfiguration(format!(
            "{context}: daemon answered {reply:?}"
        )))
    }
}

fn parse_frame(message: &str) -> Option<(u32, Vec<u8>)> {
    // "frame <id_hex> <sec>.<usec> <data_hex>"
    let mut parts = message.split_ascii_whitespace();
    if parts.next()? != "frame" {
        return None;
    }
    let can_id = u32::from_str_radix(parts.next()?, 16).ok()?;
    let _timestamp = parts.next()?;
    let data_hex = parts.next().unwrap_or("");
    if data_hex.len() % 2 != 0 {
        return None;
    }
    let data = (0..data_hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&data_hex[i..i + 2], 16))
        .collect::<Result<Vec<u8>, _>>()
        .ok()?;
    Some((can_id, data))
}

impl CanMedia for SocketcandMedia {
    fn mtu(&self) -> Mtu {
        // socketcand raw mode is classic CAN only.
        Mtu::Classic
    }

    fn start(&mut self, link: Link<Frame>) -> Result<(), TransportError> {
        let stream = TcpStream::connect(&self.address).map_err(|e| {
            TransportError::InvalidConfiguration(format!(
                "cannot connect to socketcand at {}: {e}",
                self.address,
            ))
        })?;
        let mut reader = BufReader::new(stream.try_clone().map_err(|e| {
            TransportError::InvalidConfiguration(format!("cannot clone stream: {e}"))
        })?);
        let mut writer = stream.try_clone().map_err(|e| {
            TransportError::InvalidConfiguration(format!("cannot clone stream: {e}"))
        })?;

        let greeting = read_message(&mut reader)
            .map_err(|e| TransportError::InvalidConfiguration(format!("no greeting: {e}")))?;
        if !greeting.starts_with("hi") {
            return Err(TransportError::InvalidConfiguration(format!(
                "unexpected socketcand greeting {greeting:?}"
            )));
        }
        writer
            .write_all(format!("< open {} >", self.iface).as_bytes())
            .and_then(|()| writer.write_all(b"< rawmode >"))
            .map_err(|e| TransportError::InvalidConfiguration(format!("handshake failed: {e}")))?;
        expect_ok(&mut reader, "open")?;
        expect_ok(&mut reader, "rawmode")?;

        // Periodic read timeouts let the receiver notice closure.
        let _ = stream.set_read_timeout(Some(StdDuration::from_millis(500)));

        let rx_link = link.clone();
        self.threads.push(std::thread::spawn(move || {
            loop {
                if rx_link.is_closed() {
                    return;
                }
                match read_message(&mut reader) {
                    Ok(message) => {
                        let Some((can_id, bytes)) = parse_frame(&message) else {
                            continue;
                        };
                        let Some(header) = can::decode_id(can_id) else {
                            continue;
                        };
                        let Ok(data) = Data::new(&bytes) else {
                            continue;
                        };
                        rx_link.push_received(Frame {
                            header,
                            data,
                            timestamp: Instant::now(),
                            loop_back: false,
                        });
                    }
                    Err(error)
                        if matches!(
                            error.kind(),
                            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                        ) => {}
                    Err(error) => {
                        rx_link.report_trouble(&error, true);
                        return;
                    }
                }
            }
        }));

        let tx_link = link.clone();
        self.threads.push(std::thread::spawn(move || {
            while let Some(outbound) = tx_link.pop_outbound_blocking() {
                if Instant::now() > outbound.deadline {
                    continue;
                }
                let id = can::encode_id(&outbound.frame.header);
                let mut command = format!("< send {:x} {} ", id, outbound.frame.data.len());
                for byte in outbound.frame.data.iter() {
                    command.push_str(&format!("{byte:02x} "));
                }
                command.push('>');
                if let Err(error) = writer.write_all(command.as_bytes()) {
                    tx_link.report_trouble(&error, true);
                    return;
                }
            }
        }));

        self.stream = Some(stream);
        self.link = Some(link);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(link) = self.link.take() {
            link.close();
        }
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for SocketcandMedia {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frame() {
        let (id, data) = parse_frame("frame 10abcdef 23.424242 dead10cc").unwrap();
        assert_eq!(id, 0x10ab_cdef);
        assert_eq!(data, [0xde, 0xad, 0x10, 0xcc]);

        let (_, data) = parse_frame("frame 123 1.0 ").unwrap();
        assert!(data.is_empty());

        assert!(parse_frame("error state").is_none());
        assert!(parse_frame("frame xyz 1.0 00").is_none());
    }
}
