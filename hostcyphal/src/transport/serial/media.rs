//! Serial media: byte-stream transports
//!
//! The media moves opaque byte chunks; framing lives in the transport's stream parser.
//! Implementations cover local serial ports, TCP-tunneled serial concentrators, and an
//! in-memory pipe for tests. Filter updates are meaningless on a point-to-point byte
//! stream and are ignored.

use std::io::{Read, Write};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration as StdDuration;

use hostcyphal_driver::link::Link;
use parking_lot::Mutex;

use crate::transport::error::TransportError;

const READ_CHUNK: usize = 4096;

/// A serial media driver moving raw bytes. Outbound chunks are complete encoded frames;
/// inbound chunks are whatever the line produced.
pub trait SerialMedia: Send {
    /// Largest transfer-payload window per frame (the transport MTU).
    fn mtu(&self) -> usize;

    fn start(&mut self, link: Link<Vec<u8>>) -> Result<(), TransportError>;

    fn close(&mut self);
}

fn run_reader(mut reader: impl Read, link: Link<Vec<u8>>) {
    let mut buffer = vec![0u8; READ_CHUNK];
    while !link.is_closed() {
        match reader.read(&mut buffer) {
            Ok(0) => {
                link.report_trouble(
                    &std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "stream closed"),
                    true,
                );
                return;
            }
            Ok(length) => link.push_received(buffer[..length].to_vec()),
            Err(error)
                if matches!(
                    error.kind(),
                    std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::Interrupted
                ) => {}
            Err(error) => {
                link.report_trouble(&error, true);
                return;
            }
        }
    }
}

fn run_writer(mut writer: impl Write, link: Link<Vec<u8>>) {
    while let Some(outbound) = link.pop_outbound_blocking() {
        if crate::time::Instant::now() > outbound.deadline {
            continue;
        }
        if let Err(error) = writer
            .write_all(&outbound.frame)
            .and_then(|()| writer.flush())
        {
            link.report_trouble(&error, true);
            return;
        }
    }
}

/// A local serial port (POSIX or Windows) via the `serialport` crate.
pub struct SerialPortMedia {
    path: String,
    baud_rate: u32,
    mtu: usize,
    threads: Vec<JoinHandle<()>>,
    link: Option<Link<Vec<u8>>>,
}

/// Default frame payload window on serial links.
pub const DEFAULT_SERIAL_MTU: usize = 1024;

impl SerialPortMedia {
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            mtu: DEFAULT_SERIAL_MTU,
            threads: Vec::new(),
            link: None,
        }
    }

    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }
}

impl SerialMedia for SerialPortMedia {
    fn mtu(&self) -> usize {
        self.mtu
    }

    fn start(&mut self, link: Link<Vec<u8>>) -> Result<(), TransportError> {
        let port = serialport::new(&self.path, self.baud_rate)
            .timeout(StdDuration::from_millis(100))
            .open()
            .map_err(|e| {
                TransportError::InvalidConfiguration(format!(
                    "cannot open serial port {}: {e}",
                    self.path,
                ))
            })?;
        let writer = port.try_clone().map_err(|e| {
            TransportError::InvalidConfiguration(format!("cannot clone serial port: {e}"))
        })?;

        let rx_link = link.clone();
        self.threads
            .push(std::thread::spawn(move || run_reader(port, rx_link)));
        let tx_link = link.clone();
        self.threads
            .push(std::thread::spawn(move || run_writer(writer, tx_link)));
        self.link = Some(link);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(link) = self.link.take() {
            link.close();
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for SerialPortMedia {
    fn drop(&mut self) {
        self.close();
    }
}

/// A serial line tunneled over TCP, e.g. a serial concentrator or an `socat` bridge.
pub struct TcpSerialMedia {
    address: String,
    mtu: usize,
    stream: Option<std::net::TcpStream>,
    threads: Vec<JoinHandle<()>>,
    link: Option<Link<Vec<u8>>>,
}

impl TcpSerialMedia {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            mtu: DEFAULT_SERIAL_MTU,
            stream: None,
            threads: Vec::new(),
            link: None,
        }
    }

    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }
}

impl SerialMedia for TcpSerialMedia {
    fn mtu(&self) -> usize {
        self.mtu
    }

    fn start(&mut self, link: Link<Vec<u8>>) -> Result<(), TransportError> {
        let stream = std::net::TcpStream::connect(&self.address).map_err(|e| {
            TransportError::InvalidConfiguration(format!(
                "cannot connect to {}: {e}",
                self.address,
            ))
        })?;
        let _ = stream.set_read_timeout(Some(StdDuration::from_millis(100)));
        let _ = stream.set_nodelay(true);
        let reader = stream.try_clone().map_err(|e| {
            TransportError::InvalidConfiguration(format!("cannot clone stream: {e}"))
        })?;
        let writer = stream.try_clone().map_err(|e| {
            TransportError::InvalidConfiguration(format!("cannot clone stream: {e}"))
        })?;

        let rx_link = link.clone();
        self.threads
            .push(std::thread::spawn(move || run_reader(reader, rx_link)));
        let tx_link = link.clone();
        self.threads
            .push(std::thread::spawn(move || run_writer(writer, tx_link)));
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

impl Drop for TcpSerialMedia {
    fn drop(&mut self) {
        self.close();
    }
}

struct PipeInner {
    mtu: usize,
    links: Mutex<[Option<Link<Vec<u8>>>; 2]>,
}

/// An in-process full-duplex byte pipe connecting two serial transports, for tests.
///
/// Byte movement is explicit via [`MemoryPipe::process`] so that scenarios interleave
/// deterministically with executor polls.
#[derive(Clone)]
pub struct MemoryPipe {
    inner: Arc<PipeInner>,
}

impl MemoryPipe {
    pub fn new(mtu: usize) -> Self {
        Self {
            inner: Arc::new(PipeInner {
                mtu,
                links: Mutex::new([None, None]),
            }),
        }
    }

    /// The two ends of the pipe.
    pub fn ends(&self) -> (MemoryPipeMedia, MemoryPipeMedia) {
        (
            MemoryPipeMedia {
                inner: self.inner.clone(),
                side: 0,
            },
            MemoryPipeMedia {
                inner: self.inner.clone(),
                side: 1,
            },
        )
    }

    /// Moves queued bytes across the pipe in both directions. Returns true if anything
    /// moved.
    pub fn process(&self) -> bool {
        let links = self.inner.links.lock();
        let now = crate::time::Instant::now();
        let mut moved = false;
        for side in 0..2 {
            let Some(source) = &links[side] else { continue };
            while let Some(outbound) = source.try_pop_outbound() {
                moved = true;
                if outbound.deadline < now {
                    continue;
                }
                if let Some(sink) = &links[1 - side] {
                    sink.push_received(outbound.frame);
                }
            }
        }
        moved
    }
}

pub struct MemoryPipeMedia {
    inner: Arc<PipeInner>,
    side: usize,
}

impl SerialMedia for MemoryPipeMedia {
    fn mtu(&self) -> usize {
        self.inner.mtu
    }

    fn start(&mut self, link: Link<Vec<u8>>) -> Result<(), TransportError> {
        self.inner.links.lock()[self.side] = Some(link);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(link) = self.inner.links.lock()[self.side].take() {
            link.close();
        }
    }
}
