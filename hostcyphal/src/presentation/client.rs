//! RPC client port

use core::future::poll_fn;
use core::marker::PhantomData;
use core::task::{Poll, Waker};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use embassy_time::with_deadline;
use parking_lot::Mutex;

use crate::core::{DataSpecifier, NodeId, Priority, ServiceId};
use crate::encoding::{Deserialize, Serialize};
use crate::presentation::PresentationInner;
use crate::time::Instant;
use crate::transfer::{Transfer, TransferFrom};
use crate::transport::session::{
    InputSession, InputSessionSpecifier, OutputSession, OutputSessionSpecifier, PayloadMetadata,
};
use crate::transport::{Transport, TransportError};

#[derive(Default)]
struct PendingSlot {
    response: Option<TransferFrom>,
    waker: Option<Waker>,
}

/// State shared by every client of one `(service, server)` pair: the request session with
/// its transfer-ID counter and the pending-call table. Sharing keeps the invariant that a
/// request in flight owns exactly one response slot keyed by its transfer-ID.
pub(crate) struct ClientShared {
    service: ServiceId,
    server_node_id: NodeId,
    request_session: OutputSession,
    response_session: InputSession,
    pending: Mutex<HashMap<u64, PendingSlot>>,
    deserialization_failures: AtomicU64,
    presentation: Weak<PresentationInner>,
}

impl ClientShared {
    pub(crate) fn create(
        transport: &Arc<dyn Transport>,
        service: ServiceId,
        server_node_id: NodeId,
        response_extent: usize,
        presentation: Weak<PresentationInner>,
    ) -> Result<Arc<Self>, TransportError> {
        let request_session = transport.output_session(OutputSessionSpecifier {
            data_specifier: DataSpecifier::Request(service),
            remote_node_id: Some(server_node_id),
        })?;
        let response_session = transport.input_session(
            InputSessionSpecifier {
                data_specifier: DataSpecifier::Response(service),
                remote_node_id: Some(server_node_id),
            },
            PayloadMetadata {
                extent: response_extent,
            },
        )?;
        Ok(Arc::new(Self {
            service,
            server_node_id,
            request_session,
            response_session,
            pending: Mutex::new(HashMap::new()),
            deserialization_failures: AtomicU64::new(0),
            presentation,
        }))
    }

    fn register(&self, key: u64) {
        let mut pending = self.pending.lock();
        if pending.insert(key, PendingSlot::default()).is_some() {
            // Possible only when the transfer-ID counter laps a still-pending call on a
            // cyclic transport; the older call can no longer be matched.
            log::warn!(
                "request transfer-ID {key} reused while still pending on service {}",
                u16::from(self.service),
            );
        }
    }

    fn unregister(&self, key: u64) {
        self.pending.lock().remove(&key);
    }

    /// Drains the response session, filling the matching pending slots.
    fn pump(&self) {
        while let Some(response) = self.response_session.try_receive() {
            let key = response.transfer_id.into_u64();
            let mut pending = self.pending.lock();
            match pending.get_mut(&key) {
                Some(slot) => {
                    slot.response = Some(response);
                    if let Some(waker) = slot.waker.take() {
                        waker.wake();
                    }
                }
                None => {
                    log::debug!(
                        "dropping unmatched response with transfer-ID {key} on service {}",
                        u16::from(self.service),
                    );
                }
            }
        }
    }

    /// Resolves when the slot is filled; `None` when the session is closed first.
    async fn wait_response(&self, key: u64) -> Option<TransferFrom> {
        loop {
            {
                let mut pending = self.pending.lock();
                if let Some(slot) = pending.get_mut(&key) {
                    if let Some(response) = slot.response.take() {
                        return Some(response);
                    }
                }
            }
            if self.response_session.is_closed() {
                return None;
            }
            self.pump();
            poll_fn(|cx| {
                {
                    let mut pending = self.pending.lock();
                    if let Some(slot) = pending.get_mut(&key) {
                        if slot.response.is_some() {
                            return Poll::Ready(());
                        }
                        slot.waker = Some(cx.waker().clone());
                    } else {
                        return Poll::Ready(());
                    }
                }
                if self.response_session.queue().register_waker(cx.waker()) {
                    return Poll::Ready(());
                }
                Poll::Pending
            })
            .await;
        }
    }
}

impl Drop for ClientShared {
    fn drop(&mut self) {
        self.response_session.close();
        if let Some(presentation) = self.presentation.upgrade() {
            presentation.forget_client((self.service, self.server_node_id));
        }
    }
}

/// Calls one service on one remote server node.
///
/// Instances for the same `(service, server)` pair share the transfer-ID counter, so each
/// call is uniquely correlated with its response even across clients.
pub struct Client<Req, Resp> {
    shared: Arc<ClientShared>,
    priority: Priority,
    _phantom: PhantomData<fn(&Req, &Resp)>,
}

impl<Req: Serialize, Resp: Deserialize> Client<Req, Resp> {
    pub(crate) fn new(shared: Arc<ClientShared>) -> Self {
        Self {
            shared,
            priority: Priority::Nominal,
            _phantom: PhantomData,
        }
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    pub fn server_node_id(&self) -> NodeId {
        self.shared.server_node_id
    }

    /// Sends the request and awaits the matching response.
    ///
    /// `Ok(None)` means the deadline expired, either before the request could be emitted
    /// or before the response arrived; a cancelled call does not revoke frames already on
    /// the wire. A response that fails to deserialize is counted and reported as `None`.
    pub async fn call(
        &self,
        request: &Req,
        deadline: Instant,
    ) -> Result<Option<(Resp, TransferFrom)>, TransportError> {
        let payload = crate::encoding::to_vec(request);
        let transfer_id = self.shared.request_session.next_transfer_id();
        let key = transfer_id.into_u64();
        self.shared.register(key);
        let result = self.call_registered(transfer_id, payload, deadline).await;
        self.shared.unregister(key);
        result
    }

    async fn call_registered(
        &self,
        transfer_id: crate::core::TransferId,
        payload: Vec<u8>,
        deadline: Instant,
    ) -> Result<Option<(Resp, TransferFrom)>, TransportError> {
        let sent = self
            .shared
            .request_session
            .send(
                Transfer {
                    priority: self.priority,
                    transfer_id,
                    payload,
                },
                deadline,
            )
            .await?;
        if !sent {
            return Ok(None);
        }

        let key = transfer_id.into_u64();
        match with_deadline(deadline, self.shared.wait_response(key)).await {
            Ok(Some(response)) => match Resp::deserialize_from_bytes(&response.payload) {
                Ok(message) => Ok(Some((message, response))),
                Err(_) => {
                    self.shared
                        .deserialization_failures
                        .fetch_add(1, Ordering::Relaxed);
                    Ok(None)
                }
            },
            Ok(None) => Err(TransportError::ResourceClosed),
            Err(_timeout) => Ok(None),
        }
    }

    /// Responses that failed to deserialize and were discarded.
    pub fn sample_deserialization_failures(&self) -> u64 {
        self.shared.deserialization_failures.load(Ordering::Relaxed)
    }
}

impl<Req, Resp> Clone for Client<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            priority: self.priority,
            _phantom: PhantomData,
        }
    }
}

impl<Req, Resp> core::fmt::Debug for Client<Req, Resp> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Client")
            .field("service", &self.shared.service)
            .field("server_node_id", &self.shared.server_node_id)
            .finish_non_exhaustive()
    }
}
