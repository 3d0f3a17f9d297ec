//! RPC server port

use core::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::core::{DataSpecifier, ServiceId};
use crate::encoding::{Deserialize, Serialize};
use crate::time::{Duration, Instant};
use crate::transfer::{Transfer, TransferFrom};
use crate::transport::session::{InputSession, OutputSessionSpecifier};
use crate::transport::{Transport, TransportError};

/// Answers requests of one service.
///
/// For each incoming request the user handler is invoked (it may suspend); the returned
/// response goes back to the request's source with the request's transfer-ID and
/// priority, which is what correlates it on the client side. A handler returning `None`
/// declines the request and nothing is sent.
pub struct Server<Req, Resp> {
    transport: Arc<dyn Transport>,
    service: ServiceId,
    session: InputSession,
    response_timeout: Duration,
    deserialization_failures: AtomicU64,
    _phantom: PhantomData<fn(&Req, &Resp)>,
}

impl<Req: Deserialize, Resp: Serialize> Server<Req, Resp> {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        service: ServiceId,
        session: InputSession,
    ) -> Self {
        Self {
            transport,
            service,
            session,
            response_timeout: Duration::from_secs(1),
            deserialization_failures: AtomicU64::new(0),
            _phantom: PhantomData,
        }
    }

    pub fn service(&self) -> ServiceId {
        self.service
    }

    /// Budget for emitting each response, counted from handler completion.
    pub fn set_response_timeout(&mut self, timeout: Duration) {
        self.response_timeout = timeout;
    }

    /// Serves requests until the port or the transport is closed.
    ///
    /// The handler receives the deserialized request and its metadata (source, priority,
    /// transfer-ID, timestamp). Requests that fail to deserialize are counted and
    /// skipped.
    pub async fn serve(
        &self,
        mut handler: impl AsyncFnMut(Req, &TransferFrom) -> Option<Resp>,
    ) -> Result<(), TransportError> {
        loop {
            let Some(request) = self.session.receive_forever().await else {
                return Ok(()); // closed
            };
            // Anonymous nodes cannot issue service requests; nowhere to respond to.
            let Some(client_node) = request.source_node_id else {
                continue;
            };
            let message = match Req::deserialize_from_bytes(&request.payload) {
                Ok(message) => message,
                Err(_) => {
                    self.deserialization_failures.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };

            let Some(response) = handler(message, &request).await else {
                continue;
            };

            let output = self.transport.output_session(OutputSessionSpecifier {
                data_specifier: DataSpecifier::Response(self.service),
                remote_node_id: Some(client_node),
            })?;
            let sent = output
                .send(
                    Transfer {
                        priority: request.priority,
                        transfer_id: request.transfer_id,
                        payload: crate::encoding::to_vec(&response),
                    },
                    Instant::now() + self.response_timeout,
                )
                .await?;
            if !sent {
                log::debug!(
                    "response to node {} on service {} missed its deadline",
                    u16::from(client_node),
                    u16::from(self.service),
                );
            }
        }
    }

    /// Requests that failed to deserialize and were skipped.
    pub fn sample_deserialization_failures(&self) -> u64 {
        self.deserialization_failures.load(Ordering::Relaxed)
    }

    /// Closes the request session; a running [`Self::serve`] loop returns.
    pub fn close(&self) {
        self.session.close();
    }
}

impl<Req, Resp> core::fmt::Debug for Server<Req, Resp> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Server")
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}
