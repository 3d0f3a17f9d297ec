//! Presentation layer: typed ports over the transport facade
//!
//! Binds DSDL record types to transport sessions. [`Publisher`]s sharing a subject share
//! one output session and its transfer-ID counter; each subject has at most one input
//! session whose transfers fan out to every live [`Subscriber`]; [`Client`]s correlate
//! responses with requests through a pending-call table keyed by transfer-ID;
//! a [`Server`] answers requests with the request's own transfer-ID and priority.
//!
//! Deserialization failures on the receive paths never interrupt the streams: they are
//! counted and the offending transfer is skipped, keeping a noisy publisher from killing
//! its subscribers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::core::{DataSpecifier, NodeId, Priority, ServiceId, SubjectId};
use crate::encoding::{DataType, Deserialize, Serialize};
use crate::transport::session::{
    InputSessionSpecifier, OutputSessionSpecifier, PayloadMetadata,
};
use crate::transport::{Transport, TransportError};

mod client;
mod publisher;
mod server;
mod subscriber;

pub use client::Client;
pub use publisher::Publisher;
pub use server::Server;
pub use subscriber::Subscriber;

use client::ClientShared;
use subscriber::Subscription;

/// Receive buffer size for types whose DSDL extent is not declared (sealed types).
pub const DEFAULT_EXTENT: usize = 1024;

pub(crate) struct PresentationInner {
    transport: Arc<dyn Transport>,
    subscriptions: Mutex<HashMap<SubjectId, Weak<Subscription>>>,
    clients: Mutex<HashMap<(ServiceId, NodeId), Weak<ClientShared>>>,
    closed: AtomicBool,
}

impl PresentationInner {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn forget_subscription(&self, subject: SubjectId) {
        self.subscriptions.lock().remove(&subject);
    }

    pub(crate) fn forget_client(&self, key: (ServiceId, NodeId)) {
        self.clients.lock().remove(&key);
    }
}

/// The presentation layer instance owning the port registry of one transport.
///
/// Cheap to clone; all clones share one instance. Closing it closes the underlying
/// transport and thereby every port.
#[derive(Clone)]
pub struct Presentation {
    inner: Arc<PresentationInner>,
}

impl Presentation {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(PresentationInner {
                transport,
                subscriptions: Mutex::new(HashMap::new()),
                clients: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    fn check_open(&self) -> Result<(), TransportError> {
        if self.inner.is_closed() {
            Err(TransportError::ResourceClosed)
        } else {
            Ok(())
        }
    }

    /// Creates a message publisher. Publishers of one subject share the output session
    /// and its transfer-ID counter.
    pub fn make_publisher<T: Serialize>(
        &self,
        subject: SubjectId,
        priority: Priority,
    ) -> Result<Publisher<T>, TransportError> {
        self.check_open()?;
        let session = self.inner.transport.output_session(OutputSessionSpecifier {
            data_specifier: DataSpecifier::Message(subject),
            remote_node_id: None,
        })?;
        Ok(Publisher::new(session, priority))
    }

    /// Creates a message subscriber; the receive buffer is sized from the type's extent.
    pub fn make_subscriber<T: Deserialize + DataType>(
        &self,
        subject: SubjectId,
    ) -> Result<Subscriber<T>, TransportError> {
        self.make_subscriber_with_extent(subject, crate::encoding::extent_bytes::<T>(DEFAULT_EXTENT))
    }

    /// Creates a message subscriber with an explicit receive buffer size.
    pub fn make_subscriber_with_extent<T: Deserialize>(
        &self,
        subject: SubjectId,
        extent: usize,
    ) -> Result<Subscriber<T>, TransportError> {
        self.check_open()?;
        let mut subscriptions = self.inner.subscriptions.lock();
        let subscription = match subscriptions.get(&subject).and_then(Weak::upgrade) {
            Some(subscription) => subscription,
            None => {
                let session = self.inner.transport.input_session(
                    InputSessionSpecifier {
                        data_specifier: DataSpecifier::Message(subject),
                        remote_node_id: None,
                    },
                    PayloadMetadata { extent },
                )?;
                let subscription =
                    Subscription::new(subject, session, Arc::downgrade(&self.inner));
                subscriptions.insert(subject, Arc::downgrade(&subscription));
                subscription
            }
        };
        Ok(Subscriber::new(subscription))
    }

    /// Creates an RPC client for one service on one server node. Clients of the same
    /// `(service, server)` pair share the transfer-ID counter and the pending-call table.
    pub fn make_client<Req: Serialize, Resp: Deserialize + DataType>(
        &self,
        service: ServiceId,
        server_node_id: NodeId,
    ) -> Result<Client<Req, Resp>, TransportError> {
        self.make_client_with_extent(
            service,
            server_node_id,
            crate::encoding::extent_bytes::<Resp>(DEFAULT_EXTENT),
        )
    }

    pub fn make_client_with_extent<Req: Serialize, Resp: Deserialize>(
        &self,
        service: ServiceId,
        server_node_id: NodeId,
        response_extent: usize,
    ) -> Result<Client<Req, Resp>, TransportError> {
        self.check_open()?;
        let key = (service, server_node_id);
        let mut clients = self.inner.clients.lock();
        let shared = match clients.get(&key).and_then(Weak::upgrade) {
            Some(shared) => shared,
            None => {
                let shared = ClientShared::create(
                    &self.inner.transport,
                    service,
                    server_node_id,
                    response_extent,
                    Arc::downgrade(&self.inner),
                )?;
                clients.insert(key, Arc::downgrade(&shared));
                shared
            }
        };
        Ok(Client::new(shared))
    }

    /// Creates an RPC server for one service; the request buffer is sized from the type's
    /// extent.
    pub fn make_server<Req: Deserialize + DataType, Resp: Serialize>(
        &self,
        service: ServiceId,
    ) -> Result<Server<Req, Resp>, TransportError> {
        self.make_server_with_extent(service, crate::encoding::extent_bytes::<Req>(DEFAULT_EXTENT))
    }

    pub fn make_server_with_extent<Req: Deserialize, Resp: Serialize>(
        &self,
        service: ServiceId,
        request_extent: usize,
    ) -> Result<Server<Req, Resp>, TransportError> {
        self.check_open()?;
        let session = self.inner.transport.input_session(
            InputSessionSpecifier {
                data_specifier: DataSpecifier::Request(service),
                remote_node_id: None,
            },
            PayloadMetadata {
                extent: request_extent,
            },
        )?;
        Ok(Server::new(
            self.inner.transport.clone(),
            service,
            session,
        ))
    }

    /// Closes the presentation together with the underlying transport; every pending
    /// `publish`, `receive`, and `call` completes promptly with `ResourceClosed` or a nil
    /// result.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            self.inner.transport.close();
        }
    }
}

impl core::fmt::Debug for Presentation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Presentation")
            .field("local_node_id", &self.inner.transport.local_node_id())
            .finish_non_exhaustive()
    }
}
