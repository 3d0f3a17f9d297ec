//! Message publishing port

use core::marker::PhantomData;

use crate::core::Priority;
use crate::encoding::Serialize;
use crate::time::Instant;
use crate::transport::session::OutputSession;
use crate::transport::TransportError;

/// Transmits typed messages on one subject.
///
/// All publishers of a subject share the underlying output session and therefore one
/// transfer-ID counter, so the subject carries a single monotonic sequence regardless of
/// how many publishers feed it. The priority is per-publisher.
pub struct Publisher<T> {
    session: OutputSession,
    priority: Priority,
    _phantom: PhantomData<fn(&T)>,
}

impl<T: Serialize> Publisher<T> {
    pub(crate) fn new(session: OutputSession, priority: Priority) -> Self {
        Self {
            session,
            priority,
            _phantom: PhantomData,
        }
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    /// Serializes and emits one message.
    ///
    /// Returns `Ok(false)` when the deadline expired before the transfer was accepted by
    /// the media queue; frames already on the wire at that point are not revoked.
    pub async fn publish(&self, message: &T, deadline: Instant) -> Result<bool, TransportError> {
        let payload = crate::encoding::to_vec(message);
        Ok(self
            .session
            .send_sequenced(self.priority, payload, deadline)
            .await?
            .is_some())
    }

    /// Total transfers emitted through the shared session, all publishers included.
    pub fn sample_transfer_count(&self) -> u64 {
        self.session.sample_transfer_count()
    }
}

impl<T> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
            priority: self.priority,
            _phantom: PhantomData,
        }
    }
}

impl<T> core::fmt::Debug for Publisher<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Publisher")
            .field("specifier", &self.session.specifier())
            .field("priority", &self.priority)
            .finish()
    }
}
