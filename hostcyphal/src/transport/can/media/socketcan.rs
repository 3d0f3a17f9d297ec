//! SocketCAN media driver (Linux)
//!
//! Two runner threads per interface: the receiver polls a non-blocking socket and applies
//! acceptance filter updates between reads; the transmitter drains the outbound queue and
//! retries transient `ENOBUFS` back-pressure until the frame deadline.

use std::io;
use std::thread::JoinHandle;
use std::time::Duration as StdDuration;

use embedded_can::{ExtendedId, Frame as EmbeddedFrame, Id};
use hostcyphal_driver::can::{self, Data, Frame, Mtu};
use hostcyphal_driver::link::Link;
use socketcan::{
    CanAnyFrame, CanFdFrame, CanFdSocket, CanFilter, CanFrame, CanSocket, Socket, SocketOptions,
};

use crate::time::Instant;
use crate::transport::can::media::{CanMedia, FilterTracker};
use crate::transport::error::TransportError;

const POLL_PERIOD: StdDuration = StdDuration::from_millis(2);

/// Interface gone; the media cannot recover.
fn is_fatal(error: &io::Error) -> bool {
    matches!(error.raw_os_error(), Some(libc::ENODEV | libc::ENXIO | libc::EBADF))
}

fn is_transient(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::WouldBlock
        || error.kind() == io::ErrorKind::TimedOut
        || error.raw_os_error() == Some(libc::ENOBUFS)
}

enum AnySocket {
    Classic(CanSocket),
    Fd(CanFdSocket),
}

impl AnySocket {
    fn open(iface: &str, mtu: Mtu) -> io::Result<Self> {
        Ok(match mtu {
            Mtu::Classic => AnySocket::Classic(CanSocket::open(iface)?),
            Mtu::Fd => AnySocket::Fd(CanFdSocket::open(iface)?),
        })
    }

    fn set_nonblocking(&self) -> io::Result<()> {
        match self {
            AnySocket::Classic(s) => s.set_nonblocking(true),
            AnySocket::Fd(s) => s.set_nonblocking(true),
        }
    }

    fn set_filters(&self, filters: &[CanFilter]) -> io::Result<()> {
        match self {
            AnySocket::Classic(s) => s.set_filters(filters),
            AnySocket::Fd(s) => s.set_filters(filters),
        }
    }

    fn read(&self) -> io::Result<Option<(Id, Vec<u8>)>> {
        match self {
            AnySocket::Classic(s) => {
                let frame = s.read_frame()?;
                Ok(Some((frame.id(), frame.data().to_vec())))
            }
            AnySocket::Fd(s) => match s.read_frame()? {
                CanAnyFrame::Normal(frame) => Ok(Some((frame.id(), frame.data().to_vec()))),
                CanAnyFrame::Fd(frame) => Ok(Some((frame.id(), frame.data().to_vec()))),
                _ => Ok(None), // remote and error frames are not Cyphal traffic
            },
        }
    }

    fn write(&self, id: ExtendedId, data: &[u8]) -> io::Result<()> {
        match self {
            AnySocket::Classic(s) => {
                let frame = CanFrame::new(id, data)
                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "bad frame"))?;
                s.write_frame(&frame)
            }
            AnySocket::Fd(s) => {
                let frame = CanFdFrame::new(id, data)
                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "bad frame"))?;
                s.write_frame(&frame)
            }
        }
    }
}

/// SocketCAN media for classic CAN 2.0 or CAN FD.
pub struct SocketCanMedia {
    iface: String,
    mtu: Mtu,
    link: Option<Link<Frame>>,
    threads: Vec<JoinHandle<()>>,
}

impl SocketCanMedia {
    pub fn new(iface: impl Into<String>, mtu: Mtu) -> Self {
        Self {
            iface: iface.into(),
            mtu,
            link: None,
            threads: Vec::new(),
        }
    }
}

impl CanMedia for SocketCanMedia {
    fn mtu(&self) -> Mtu {
        self.mtu
    }

    fn start(&mut self, link: Link<Frame>) -> Result<(), TransportError> {
        let open = |purpose: &str| {
            AnySocket::open(&self.iface, self.mtu).map_err(|e| {
                TransportError::InvalidConfiguration(format!(
                    "cannot open SocketCAN {purpose} socket on {}: {e}",
                    self.iface,
                ))
            })
        };
        let rx = open("receive")?;
        let tx = open("transmit")?;
        rx.set_nonblocking().map_err(|e| {
            TransportError::InvalidConfiguration(format!("cannot configure socket: {e}"))
        })?;
        // Accept nothing until the stack subscribes.
        let _ = rx.set_filters(&[]);

        let rx_link = link.clone();
        let mtu = self.mtu;
        self.threads.push(std::thread::spawn(move || {
            run_receiver(rx, rx_link, mtu);
        }));

        let tx_link = link.clone();
        self.threads.push(std::thread::spawn(move || {
            run_transmitter(tx, tx_link);
        }));

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

impl Drop for SocketCanMedia {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_receiver(socket: AnySocket, link: Link<Frame>, mtu: Mtu) {
    let mut tracker = FilterTracker::default();
    while !link.is_closed() {
        if tracker.drain(&link) {
            let filters: Vec<CanFilter> = tracker
                .filters()
                .iter()
                .map(|f| CanFilter::new(f.id | libc::CAN_EFF_FLAG, f.mask | libc::CAN_EFF_FLAG))
                .collect();
            if let Err(error) = socket.set_filters(&filters) {
                link.report_trouble(&error, is_fatal(&error));
            }
        }
        match socket.read() {
            Ok(Some((Id::Extended(id), data))) => {
                let Some(header) = can::decode_id(id.as_raw()) else {
                    continue;
                };
                let Ok(data) = Data::new(&data) else {
                    continue;
                };
                if usize::from(data.length()) > usize::from(mtu) {
                    continue;
                }
                link.push_received(Frame {
                    header,
                    data,
                    timestamp: Instant::now(),
                    loop_back: false,
                });
            }
            Ok(_) => {} // standard-ID frames are not Cyphal traffic
            Err(error) if is_transient(&error) => std::thread::sleep(POLL_PERIOD),
            Err(error) => {
                link.report_trouble(&error, is_fatal(&error));
                if is_fatal(&error) {
                    return;
                }
                std::thread::sleep(POLL_PERIOD);
            }
        }
    }
}

fn run_transmitter(socket: AnySocket, link: Link<Frame>) {
    while let Some(outbound) = link.pop_outbound_blocking() {
        let Some(id) = ExtendedId::new(can::encode_id(&outbound.frame.header)) else {
            continue;
        };
        loop {
            if Instant::now() > outbound.deadline {
                log::debug!("dropping overdue frame for {:?}", outbound.frame.header);
                break;
            }
            match socket.write(id, &outbound.frame.data) {
                Ok(()) => break,
                Err(error) if is_transient(&error) => std::thread::sleep(POLL_PERIOD),
                Err(error) => {
                    link.report_trouble(&error, is_fatal(&error));
                    if is_fatal(&error) {
                        return;
                    }
                    break;
                }
            }
        }
    }
}
