//! UDP media: multicast socket management
//!
//! The standard implementation keeps one transmit socket and one receive socket per joined
//! multicast group, each receive socket served by its own reader thread (the demultiplexing
//! happens at the group level, so per-socket readers keep the hot path trivial). Group
//! membership follows the transport's filter update stream.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration as StdDuration;

use hostcyphal_driver::link::{FilterUpdate, Link};
use parking_lot::Mutex;

use crate::core::NodeId;
use crate::transport::error::TransportError;
use crate::transport::udp::endpoint;

/// One UDP frame in flight: the datagram image plus its remote endpoint — the destination
/// group for outbound frames, the sender's address for inbound ones.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub data: Vec<u8>,
    pub endpoint: SocketAddrV4,
}

/// Addressing parameters the media needs to map filter updates onto group membership.
#[derive(Debug, Clone, Copy)]
pub struct UdpMediaConfig {
    /// Local interface address used for joins and as the transmit source.
    pub local_iface: Ipv4Addr,
    pub message_port: u16,
    pub service_port: u16,
    pub local_node_id: Option<NodeId>,
}

/// A UDP media driver: real multicast sockets or the in-memory fabric used by tests.
pub trait UdpMedia: Send {
    /// Largest datagram payload the media will carry (the transport MTU).
    fn mtu(&self) -> usize;

    fn start(&mut self, link: Link<Datagram>, config: UdpMediaConfig) -> Result<(), TransportError>;

    fn close(&mut self);
}

/// Translates one filter update into the set of (joined/left) group endpoints.
fn update_endpoints(update: FilterUpdate, config: &UdpMediaConfig) -> (Vec<SocketAddrV4>, Vec<SocketAddrV4>) {
    let mut joined = Vec::new();
    let mut left = Vec::new();
    match update {
        FilterUpdate::AddSubject(subject) => {
            joined.push(endpoint::message_endpoint(subject, config.message_port));
        }
        FilterUpdate::RemoveSubjectRange([low, high]) => {
            for raw in low.into_u16()..=high.into_u16() {
                if let Some(subject) = crate::core::SubjectId::new(raw) {
                    left.push(endpoint::message_endpoint(subject, config.message_port));
                }
            }
        }
        FilterUpdate::AddDestination(node) => {
            joined.push(endpoint::service_endpoint(Some(node), config.service_port));
        }
        FilterUpdate::RemoveDestinationRange([low, high]) => {
            for raw in low.into_u16()..=high.into_u16() {
                if let Some(node) = NodeId::new(raw) {
                    left.push(endpoint::service_endpoint(Some(node), config.service_port));
                }
            }
        }
        FilterUpdate::AcceptAll => {
            // Joining every possible group is not feasible; promiscuous UDP capture
            // requires a link-layer sniffer, which is out of scope of this media.
            log::warn!("promiscuous capture is limited to joined groups on the UDP media");
        }
    }
    (joined, left)
}

#[cfg(unix)]
mod sys {
    use super::*;
    use std::io;
    use std::os::fd::FromRawFd;

    /// Creates a socket bound to the multicast group with address reuse enabled, which
    /// `std` alone cannot express (the option must be set before bind).
    pub(super) fn bind_group(group: SocketAddrV4) -> io::Result<UdpSocket> {
        unsafe {
            let fd = libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            let close_on_error = |error: io::Error| {
                libc::close(fd);
                Err(error)
            };

            let one: libc::c_int = 1;
            if libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &one as *const _ as *const libc::c_void,
                core::mem::size_of::<libc::c_int>() as libc::socklen_t,
            ) < 0
            {
                return close_on_error(io::Error::last_os_error());
            }

            let address = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: group.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from(*group.ip()).to_be(),
                },
                sin_zero: [0; 8],
                #[cfg(any(target_os = "macos", target_os = "freebsd"))]
                sin_len: 0,
            };
            if libc::bind(
                fd,
                &address as *const _ as *const libc::sockaddr,
                core::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            ) < 0
            {
                return close_on_error(io::Error::last_os_error());
            }

            Ok(UdpSocket::from_raw_fd(fd))
        }
    }

    /// Selects the outgoing interface for multicast transmission.
    pub(super) fn set_multicast_if(socket: &UdpSocket, iface: Ipv4Addr) -> io::Result<()> {
        use std::os::fd::AsRawFd;
        let request = libc::in_addr {
            s_addr: u32::from(iface).to_be(),
        };
        let rc = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::IPPROTO_IP,
                libc::IP_MULTICAST_IF,
                &request as *const _ as *const libc::c_void,
                core::mem::size_of::<libc::in_addr>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

#[cfg(not(unix))]
mod sys {
    use super::*;
    use std::io;

    pub(super) fn bind_group(group: SocketAddrV4) -> io::Result<UdpSocket> {
        UdpSocket::bind((Ipv4Addr::UNSPECIFIED, group.port()))
    }

    pub(super) fn set_multicast_if(_socket: &UdpSocket, _iface: Ipv4Addr) -> io::Result<()> {
        Ok(())
    }
}

/// Interface gone; the media cannot recover.
fn is_fatal_io(error: &std::io::Error) -> bool {
    #[cfg(unix)]
    {
        matches!(
            error.raw_os_error(),
            Some(libc::ENODEV | libc::ENXIO | libc::EBADF)
        )
    }
    #[cfg(not(unix))]
    {
        let _ = error;
        false
    }
}

struct GroupReader {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Multicast UDP media over the operating system's socket API.
pub struct StdUdpMedia {
    mtu: usize,
    readers: Arc<Mutex<HashMap<SocketAddrV4, GroupReader>>>,
    threads: Vec<JoinHandle<()>>,
    link: Option<Link<Datagram>>,
}

/// A practical default for Ethernet networks without jumbo frames.
pub const DEFAULT_UDP_MTU: usize = 1200;

impl StdUdpMedia {
    pub fn new(mtu: usize) -> Self {
        Self {
            mtu,
            readers: Arc::new(Mutex::new(HashMap::new())),
            threads: Vec::new(),
            link: None,
        }
    }
}

impl Default for StdUdpMedia {
    fn default() -> Self {
        Self::new(DEFAULT_UDP_MTU)
    }
}

fn spawn_group_reader(
    group: SocketAddrV4,
    config: &UdpMediaConfig,
    link: Link<Datagram>,
) -> Result<GroupReader, std::io::Error> {
    let socket = sys::bind_group(group)?;
    socket.join_multicast_v4(group.ip(), &config.local_iface)?;
    socket.set_read_timeout(Some(StdDuration::from_millis(200)))?;
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();
    let handle = std::thread::spawn(move || {
        let mut buffer = vec![0u8; 65536];
        while !stop_flag.load(Ordering::SeqCst) && !link.is_closed() {
            match socket.recv_from(&mut buffer) {
                Ok((length, remote)) => {
                    let endpoint = match remote {
                        std::net::SocketAddr::V4(v4) => v4,
                        std::net::SocketAddr::V6(_) => continue,
                    };
                    link.push_received(Datagram {
                        data: buffer[..length].to_vec(),
                        endpoint,
                    });
                }
                Err(error)
                    if matches!(
                        error.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) => {}
                Err(error) => {
                    link.report_trouble(&error, false);
                    std::thread::sleep(StdDuration::from_millis(50));
                }
            }
        }
    });
    Ok(GroupReader { stop, handle })
}

impl UdpMedia for StdUdpMedia {
    fn mtu(&self) -> usize {
        self.mtu
    }

    fn start(&mut self, link: Link<Datagram>, config: UdpMediaConfig) -> Result<(), TransportError> {
        let tx = UdpSocket::bind(SocketAddrV4::new(config.local_iface, 0)).map_err(|e| {
            TransportError::InvalidConfiguration(format!(
                "cannot bind the UDP transmit socket on {}: {e}",
                config.local_iface,
            ))
        })?;
        sys::set_multicast_if(&tx, config.local_iface).map_err(|e| {
            TransportError::InvalidConfiguration(format!("cannot select multicast interface: {e}"))
        })?;
        let _ = tx.set_multicast_loop_v4(true);
        let _ = tx.set_multicast_ttl_v4(16);

        // Transmitter runner.
        let tx_link = link.clone();
        self.threads.push(std::thread::spawn(move || {
            while let Some(outbound) = tx_link.pop_outbound_blocking() {
                if crate::time::Instant::now() > outbound.deadline {
                    continue;
                }
                if let Err(error) = tx.send_to(&outbound.frame.data, outbound.frame.endpoint) {
                    let fatal = is_fatal_io(&error);
                    tx_link.report_trouble(&error, fatal);
                    if fatal {
                        return;
                    }
                }
            }
        }));

        // Group membership runner.
        let filter_link = link.clone();
        let readers = self.readers.clone();
        self.threads.push(std::thread::spawn(move || {
            while let Some(update) = futures_executor::block_on(filter_link.pop_filter()) {
                let (joined, left) = update_endpoints(update, &config);
                let mut readers = readers.lock();
                for group in left {
                    if let Some(reader) = readers.remove(&group) {
                        reader.stop.store(true, Ordering::SeqCst);
                        let _ = reader.handle.join();
                    }
                }
                for group in joined {
                    if readers.contains_key(&group) {
                        continue;
                    }
                    match spawn_group_reader(group, &config, filter_link.clone()) {
                        Ok(reader) => {
                            readers.insert(group, reader);
                        }
                        Err(error) => filter_link.report_trouble(&error, false),
                    }
                }
            }
        }));

        self.link = Some(link);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(link) = self.link.take() {
            link.close();
        }
        for (_, reader) in self.readers.lock().drain() {
            reader.stop.store(true, Ordering::SeqCst);
            let _ = reader.handle.join();
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for StdUdpMedia {
    fn drop(&mut self) {
        self.close();
    }
}

struct FabricEndpoint {
    link: Link<Datagram>,
    config: UdpMediaConfig,
    joined: std::collections::HashSet<SocketAddrV4>,
}

struct FabricInner {
    mtu: usize,
    endpoints: Mutex<Vec<FabricEndpoint>>,
}

/// An in-process multicast fabric connecting any number of UDP transports, for tests.
///
/// Like the real network, a datagram is delivered to every endpoint that joined its
/// destination group, including the sender (multicast loopback). Frame movement happens
/// inside [`MemoryFabric::process`] for determinism.
#[derive(Clone)]
pub struct MemoryFabric {
    inner: Arc<FabricInner>,
}

impl MemoryFabric {
    pub fn new(mtu: usize) -> Self {
        Self {
            inner: Arc::new(FabricInner {
                mtu,
                endpoints: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn attach(&self) -> MemoryFabricMedia {
        MemoryFabricMedia {
            inner: self.inner.clone(),
            link: None,
        }
    }

    /// Applies pending group membership changes and moves queued datagrams. Returns true
    /// if anything moved.
    pub fn process(&self) -> bool {
        let mut endpoints = self.inner.endpoints.lock();
        let now = crate::time::Instant::now();

        for endpoint in endpoints.iter_mut() {
            while let Some(update) = endpoint.link.try_pop_filter() {
                let (joined, left) = update_endpoints(update, &endpoint.config);
                for group in joined {
                    endpoint.joined.insert(group);
                }
                for group in left {
                    endpoint.joined.remove(&group);
                }
            }
        }

        let mut moved = false;
        let mut in_flight: Vec<(usize, Datagram)> = Vec::new();
        for (index, endpoint) in endpoints.iter().enumerate() {
            while let Some(outbound) = endpoint.link.try_pop_outbound() {
                moved = true;
                if outbound.deadline < now {
                    continue;
                }
                in_flight.push((index, outbound.frame));
            }
        }
        for (sender, datagram) in in_flight {
            let source = SocketAddrV4::new(
                endpoints[sender].config.local_iface,
                endpoints[sender].config.message_port,
            );
            for endpoint in endpoints.iter() {
                if endpoint.joined.contains(&datagram.endpoint) {
                    endpoint.link.push_received(Datagram {
                        data: datagram.data.clone(),
                        endpoint: source,
                    });
                }
            }
        }
        moved
    }
}

pub struct MemoryFabricMedia {
    inner: Arc<FabricInner>,
    link: Option<Link<Datagram>>,
}

impl UdpMedia for MemoryFabricMedia {
    fn mtu(&self) -> usize {
        self.inner.mtu
    }

    fn start(&mut self, link: Link<Datagram>, config: UdpMediaConfig) -> Result<(), TransportError> {
        self.inner.endpoints.lock().push(FabricEndpoint {
            link: link.clone(),
            config,
            joined: std::collections::HashSet::new(),
        });
        self.link = Some(link);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(link) = self.link.take() {
            link.close();
        }
    }
}
