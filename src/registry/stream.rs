// ABOUTME: Outgoing stream handles and incoming stream subscriptions
// ABOUTME: One teardown routine per stream kind, each safe to call more than once

use crate::error::Error;
use crate::events::SubscriptionId;
use crate::transport::{StreamId, TransportIncomingStream, TransportOutgoingStream};
use crate::Result;
use bytes::Bytes;
use parking_lot::ReentrantMutex;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Handle to a stream the local participant sends on
///
/// Cloning is cheap; all clones refer to the same stream.
#[derive(Clone)]
pub struct OutgoingStream {
    inner: Arc<OutgoingInner>,
}

struct OutgoingInner {
    id: u32,
    session_id: String,
    transport: Arc<dyn TransportOutgoingStream>,
    disposed: AtomicBool,
}

impl OutgoingStream {
    pub(crate) fn new(
        id: u32,
        session_id: &str,
        transport: Arc<dyn TransportOutgoingStream>,
    ) -> Self {
        Self {
            inner: Arc::new(OutgoingInner {
                id,
                session_id: session_id.to_string(),
                transport,
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Locally assigned id, unique within the owning session
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Id of the owning session
    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Id remote participants see this stream under
    pub fn transport_stream_id(&self) -> StreamId {
        self.inner.transport.stream_id()
    }

    /// Check if the stream has been removed
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Send one payload
    pub fn send(&self, payload: impl Into<Bytes>) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }
        self.inner.transport.send(payload.into())?;
        Ok(())
    }

    /// Check whether two handles refer to the same stream
    pub fn ptr_eq(&self, other: &OutgoingStream) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Release the transport stream; only the first call has any effect
    pub(crate) fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.inner.transport.close() {
            log::warn!(
                "Failed to close outgoing stream {} of session {}: {}",
                self.inner.id,
                self.inner.session_id,
                e
            );
        } else {
            log::debug!(
                "Outgoing stream {} of session {} closed",
                self.inner.id,
                self.inner.session_id
            );
        }
    }
}

impl std::fmt::Debug for OutgoingStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutgoingStream")
            .field("id", &self.inner.id)
            .field("session_id", &self.inner.session_id)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Gate checked by the data callback before forwarding a payload
///
/// Forwarding holds the gate for the whole delivery. Closing takes the same
/// lock, so once `close` returns no forwarding is in flight and none will
/// start. The lock is reentrant so a handler that removes its own stream on
/// the delivery thread does not deadlock.
#[derive(Clone)]
pub(crate) struct ForwardGate {
    open: Arc<ReentrantMutex<Cell<bool>>>,
}

impl ForwardGate {
    pub(crate) fn new() -> Self {
        Self {
            open: Arc::new(ReentrantMutex::new(Cell::new(true))),
        }
    }

    /// Run `forward` if the gate is still open
    pub(crate) fn pass<F: FnOnce()>(&self, forward: F) -> bool {
        let open = self.open.lock();
        if !open.get() {
            return false;
        }
        forward();
        true
    }

    pub(crate) fn close(&self) {
        self.open.lock().set(false);
    }

    pub(crate) fn same(&self, other: &ForwardGate) -> bool {
        Arc::ptr_eq(&self.open, &other.open)
    }
}

/// Subscription to an incoming stream's payloads
#[derive(Clone)]
pub(crate) struct IncomingEntry {
    pub(crate) stream: Arc<dyn TransportIncomingStream>,
    pub(crate) subscription: SubscriptionId,
    pub(crate) gate: ForwardGate,
}

impl IncomingEntry {
    /// Stop forwarding and unsubscribe from the transport stream
    pub(crate) fn detach(&self) {
        self.gate.close();
        self.stream.unsubscribe(self.subscription);
    }
}
