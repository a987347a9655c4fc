// ABOUTME: Session handle owning outgoing and incoming audio streams
// ABOUTME: Forwards transport payloads to a single incoming-audio event

use crate::error::Error;
use crate::events::{EventHub, SubscriptionId};
use crate::registry::stream::{ForwardGate, IncomingEntry, OutgoingStream};
use crate::transport::{IncomingStreamEvent, StreamId, TransportIncomingStream, TransportSession};
use crate::Result;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

/// Unique session identifier
pub type SessionId = String;

/// A payload received on one of the session's incoming streams
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingAudio {
    /// Transport-assigned id of the incoming stream
    pub stream_id: StreamId,
    /// Opaque payload bytes
    pub payload: Bytes,
}

/// Outgoing streams of one session
struct OutgoingStreams {
    next_id: u32,
    streams: HashMap<u32, OutgoingStream>,
}

struct SessionInner {
    id: SessionId,
    transport: Arc<dyn TransportSession>,
    disposed: AtomicBool,
    /// Subscription to the transport's incoming stream add/remove callback
    transport_subscription: Mutex<Option<SubscriptionId>>,
    outgoing: Mutex<OutgoingStreams>,
    incoming: Mutex<HashMap<StreamId, IncomingEntry>>,
    audio_events: Arc<EventHub<IncomingAudio>>,
}

/// Handle to a joined session
///
/// Cloning is cheap; all clones refer to the same session. The registry keeps
/// one clone; callers may hold others.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionInner>,
}

impl SessionHandle {
    /// Wrap a transport session and subscribe to its incoming stream notifications
    pub(crate) fn attach(id: SessionId, transport: Arc<dyn TransportSession>) -> Self {
        let inner = Arc::new(SessionInner {
            id,
            transport: Arc::clone(&transport),
            disposed: AtomicBool::new(false),
            transport_subscription: Mutex::new(None),
            outgoing: Mutex::new(OutgoingStreams {
                next_id: 1,
                streams: HashMap::new(),
            }),
            incoming: Mutex::new(HashMap::new()),
            audio_events: Arc::new(EventHub::new("incoming audio")),
        });

        let weak: Weak<SessionInner> = Arc::downgrade(&inner);
        let subscription = transport.subscribe_incoming(Arc::new(move |event: IncomingStreamEvent| {
            if let Some(inner) = weak.upgrade() {
                inner.on_incoming_stream_event(event);
            }
        }));
        *inner.transport_subscription.lock() = Some(subscription);

        Self { inner }
    }

    /// Session identifier
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Check if the session has been torn down
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Check whether two handles refer to the same session
    pub fn ptr_eq(&self, other: &SessionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Open a new outgoing stream
    pub fn create_outgoing_stream(&self) -> Result<OutgoingStream> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }

        let transport_stream = self.inner.transport.open_outgoing_stream()?;

        let mut outgoing = self.inner.outgoing.lock();
        if self.is_disposed() {
            drop(outgoing);
            if let Err(e) = transport_stream.close() {
                log::warn!("Failed to close stream opened during teardown of {}: {}", self.inner.id, e);
            }
            return Err(Error::Disposed);
        }

        let id = outgoing.next_id;
        outgoing.next_id = outgoing.next_id.wrapping_add(1);
        let stream = OutgoingStream::new(id, &self.inner.id, transport_stream);
        outgoing.streams.insert(id, stream.clone());

        log::debug!(
            "Outgoing stream {} created in session {}, total: {}",
            id,
            self.inner.id,
            outgoing.streams.len()
        );
        Ok(stream)
    }

    /// Remove an outgoing stream by id
    ///
    /// Returns false if no stream with this id is live.
    pub fn remove_outgoing_stream(&self, id: u32) -> bool {
        let removed = self.inner.outgoing.lock().streams.remove(&id);
        match removed {
            Some(stream) => {
                stream.dispose();
                true
            }
            None => false,
        }
    }

    /// Remove an outgoing stream by handle
    ///
    /// Only removes the stream if the handle belongs to this session.
    pub fn remove_outgoing_stream_handle(&self, stream: &OutgoingStream) -> bool {
        let removed = {
            let mut outgoing = self.inner.outgoing.lock();
            let owned = outgoing
                .streams
                .get(&stream.id())
                .is_some_and(|existing| existing.ptr_eq(stream));
            if owned {
                outgoing.streams.remove(&stream.id())
            } else {
                None
            }
        };
        match removed {
            Some(stream) => {
                stream.dispose();
                true
            }
            None => false,
        }
    }

    /// All live outgoing streams, ordered by id
    pub fn list_outgoing_streams(&self) -> Vec<OutgoingStream> {
        let mut streams: Vec<_> = self.inner.outgoing.lock().streams.values().cloned().collect();
        streams.sort_by_key(OutgoingStream::id);
        streams
    }

    /// Look up an outgoing stream
    pub fn get_outgoing_stream(&self, id: u32) -> Option<OutgoingStream> {
        self.inner.outgoing.lock().streams.get(&id).cloned()
    }

    /// Number of live outgoing streams
    pub fn outgoing_stream_count(&self) -> usize {
        self.inner.outgoing.lock().streams.len()
    }

    /// Ids of the incoming streams currently announced by the transport, sorted
    pub fn incoming_stream_ids(&self) -> Vec<StreamId> {
        let mut ids: Vec<_> = self.inner.incoming.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Subscribe to incoming audio payloads
    ///
    /// Handlers run on the transport's delivery thread. A panicking handler is
    /// logged and does not affect other handlers or the transport.
    ///
    /// Deliveries on one incoming stream are serialized, and removing that
    /// stream waits for a delivery in progress to return. Handlers should
    /// hand work off rather than block. Removing a stream from inside its own
    /// handler is allowed.
    pub fn on_incoming_audio<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&IncomingAudio) + Send + Sync + 'static,
    {
        self.inner.audio_events.subscribe(handler)
    }

    /// Remove an incoming audio handler
    pub fn remove_incoming_audio_handler(&self, id: SubscriptionId) -> bool {
        self.inner.audio_events.unsubscribe(id)
    }

    /// Receive incoming audio through a channel instead of a handler
    ///
    /// The channel closes when the session is disposed.
    pub fn incoming_audio_channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<IncomingAudio>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.on_incoming_audio(move |audio| {
            let _ = tx.send(audio.clone());
        });
        (id, rx)
    }

    /// Stop receiving incoming stream notifications from the transport
    pub(crate) fn detach_transport(&self) {
        let subscription = self.inner.transport_subscription.lock().take();
        if let Some(subscription) = subscription {
            self.inner.transport.unsubscribe(subscription);
        }
    }

    /// Tear the session down; only the first call has any effect
    ///
    /// Unsubscribes from the transport, removes and closes every outgoing
    /// stream, detaches every incoming stream, drops event handlers and finally
    /// leaves the transport session.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.detach_transport();

        let outgoing: Vec<_> = self
            .inner
            .outgoing
            .lock()
            .streams
            .drain()
            .map(|(_, stream)| stream)
            .collect();
        for stream in &outgoing {
            stream.dispose();
        }

        let incoming: Vec<_> = self.inner.incoming.lock().values().cloned().collect();
        for entry in &incoming {
            entry.detach();
        }
        self.inner.incoming.lock().clear();

        self.inner.audio_events.clear();

        if let Err(e) = self.inner.transport.close() {
            log::warn!("Failed to close transport session {}: {}", self.inner.id, e);
        }

        log::debug!(
            "Session {} disposed ({} outgoing, {} incoming streams released)",
            self.inner.id,
            outgoing.len(),
            incoming.len()
        );
    }
}

impl SessionInner {
    fn on_incoming_stream_event(&self, event: IncomingStreamEvent) {
        match event {
            IncomingStreamEvent::Added(stream) => self.add_incoming(stream),
            IncomingStreamEvent::Removed(id) => self.remove_incoming(id),
        }
    }

    fn add_incoming(&self, stream: Arc<dyn TransportIncomingStream>) {
        let stream_id = stream.stream_id();
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }

        let gate = ForwardGate::new();
        let forward_gate = gate.clone();
        let audio_events = Arc::clone(&self.audio_events);
        let subscription = stream.subscribe_data(Arc::new(move |stream_id: StreamId, payload: Bytes| {
            forward_gate.pass(|| {
                audio_events.emit(&IncomingAudio { stream_id, payload });
            });
        }));
        let entry = IncomingEntry {
            stream,
            subscription,
            gate,
        };

        let replaced = {
            let mut incoming = self.incoming.lock();
            if self.disposed.load(Ordering::SeqCst) {
                drop(incoming);
                entry.detach();
                return;
            }
            let replaced = incoming.insert(stream_id, entry);
            log::debug!(
                "Incoming stream {} added to session {}, total: {}",
                stream_id,
                self.id,
                incoming.len()
            );
            replaced
        };

        // A repeated announcement replaces the previous subscription
        if let Some(previous) = replaced {
            previous.detach();
        }
    }

    fn remove_incoming(&self, stream_id: StreamId) {
        let entry = self.incoming.lock().get(&stream_id).cloned();
        let Some(entry) = entry else {
            return;
        };

        // Unsubscribe before erasing; detach waits for in-flight forwarding
        entry.detach();

        let mut incoming = self.incoming.lock();
        if matches!(incoming.get(&stream_id), Some(current) if current.gate.same(&entry.gate)) {
            incoming.remove(&stream_id);
            log::debug!(
                "Incoming stream {} removed from session {}, total: {}",
                stream_id,
                self.id,
                incoming.len()
            );
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.inner.id)
            .field("disposed", &self.is_disposed())
            .field("outgoing_streams", &self.outgoing_stream_count())
            .field("incoming_streams", &self.inner.incoming.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{DataCallback, IncomingStreamCallback, TransportError, TransportOutgoingStream};
    use std::sync::atomic::AtomicUsize;

    /// Transport session whose incoming notifications are driven by the test
    #[derive(Default)]
    struct ScriptedSession {
        callbacks: Mutex<Vec<(SubscriptionId, IncomingStreamCallback)>>,
        opened: AtomicUsize,
        closed: AtomicUsize,
        fail_open: AtomicBool,
    }

    impl ScriptedSession {
        fn announce(&self, event: IncomingStreamEvent) {
            let callbacks: Vec<_> = self.callbacks.lock().iter().map(|(_, c)| c.clone()).collect();
            for callback in callbacks {
                callback(event.clone());
            }
        }
    }

    impl TransportSession for ScriptedSession {
        fn session_id(&self) -> &str {
            "scripted"
        }

        fn open_outgoing_stream(
            &self,
        ) -> std::result::Result<Arc<dyn TransportOutgoingStream>, TransportError> {
            if self.fail_open.load(Ordering::SeqCst) {
                return Err(TransportError::Stream("no capacity".to_string()));
            }
            let id = self.opened.fetch_add(1, Ordering::SeqCst) as StreamId + 100;
            Ok(Arc::new(NullStream { id }))
        }

        fn subscribe_incoming(&self, callback: IncomingStreamCallback) -> SubscriptionId {
            let id = crate::events::next_subscription_id();
            self.callbacks.lock().push((id, callback));
            id
        }

        fn unsubscribe(&self, id: SubscriptionId) {
            self.callbacks.lock().retain(|(existing, _)| *existing != id);
        }

        fn close(&self) -> std::result::Result<(), TransportError> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct NullStream {
        id: StreamId,
    }

    impl TransportOutgoingStream for NullStream {
        fn stream_id(&self) -> StreamId {
            self.id
        }

        fn send(&self, _payload: Bytes) -> std::result::Result<(), TransportError> {
            Ok(())
        }

        fn close(&self) -> std::result::Result<(), TransportError> {
            Ok(())
        }
    }

    /// Incoming stream that keeps delivering even after unsubscribe,
    /// the way a transport racing its own callback thread would
    #[derive(Default)]
    struct LeakyIncoming {
        callback: Mutex<Option<DataCallback>>,
        unsubscribed: AtomicBool,
    }

    impl LeakyIncoming {
        fn deliver(&self, payload: &'static [u8]) {
            let callback = self.callback.lock().clone();
            if let Some(callback) = callback {
                callback(7, Bytes::from_static(payload));
            }
        }
    }

    impl TransportIncomingStream for LeakyIncoming {
        fn stream_id(&self) -> StreamId {
            7
        }

        fn subscribe_data(&self, callback: DataCallback) -> SubscriptionId {
            *self.callback.lock() = Some(callback);
            1
        }

        fn unsubscribe(&self, _id: SubscriptionId) {
            self.unsubscribed.store(true, Ordering::SeqCst);
        }
    }

    fn scripted() -> (Arc<ScriptedSession>, SessionHandle) {
        let transport = Arc::new(ScriptedSession::default());
        let handle = SessionHandle::attach("s1".to_string(), transport.clone());
        (transport, handle)
    }

    #[test]
    fn test_outgoing_stream_lifecycle() {
        let (_transport, session) = scripted();

        let first = session.create_outgoing_stream().unwrap();
        let second = session.create_outgoing_stream().unwrap();
        assert_eq!(first.id(), 1);
        assert_eq!(second.id(), 2);
        assert_eq!(session.list_outgoing_streams().len(), 2);

        assert!(session.remove_outgoing_stream(first.id()));
        assert!(!session.remove_outgoing_stream(first.id()));
        assert!(first.is_disposed());
        assert!(session.get_outgoing_stream(first.id()).is_none());

        assert!(session.remove_outgoing_stream_handle(&second));
        assert!(session.list_outgoing_streams().is_empty());
    }

    #[test]
    fn test_remove_handle_from_other_session_is_ignored() {
        let (_a, first) = scripted();
        let (_b, second) = scripted();

        let stream = first.create_outgoing_stream().unwrap();
        let _other = second.create_outgoing_stream().unwrap();

        assert!(!second.remove_outgoing_stream_handle(&stream));
        assert!(!stream.is_disposed());
        assert_eq!(second.outgoing_stream_count(), 1);
    }

    #[test]
    fn test_transport_open_error_surfaces() {
        let (transport, session) = scripted();
        transport.fail_open.store(true, Ordering::SeqCst);

        let err = session.create_outgoing_stream().unwrap_err();
        assert!(matches!(err, Error::Transport(TransportError::Stream(_))));
        assert_eq!(session.outgoing_stream_count(), 0);
    }

    #[test]
    fn test_incoming_stream_forwarding_and_removal() {
        let (transport, session) = scripted();
        let received = Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();
        session.on_incoming_audio(move |audio| received_clone.lock().push(audio.clone()));

        let incoming = Arc::new(LeakyIncoming::default());
        transport.announce(IncomingStreamEvent::Added(incoming.clone()));
        assert_eq!(session.incoming_stream_ids(), vec![7]);

        incoming.deliver(b"one");
        transport.announce(IncomingStreamEvent::Removed(7));
        assert!(incoming.unsubscribed.load(Ordering::SeqCst));
        assert!(session.incoming_stream_ids().is_empty());

        // Late delivery after the remove completed must not be forwarded
        incoming.deliver(b"two");

        let received = received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].stream_id, 7);
        assert_eq!(received[0].payload, Bytes::from_static(b"one"));
    }

    #[test]
    fn test_handler_panic_does_not_stop_forwarding() {
        let (transport, session) = scripted();
        let count = Arc::new(AtomicUsize::new(0));

        session.on_incoming_audio(|_| panic!("bad handler"));
        let count_clone = count.clone();
        session.on_incoming_audio(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        let incoming = Arc::new(LeakyIncoming::default());
        transport.announce(IncomingStreamEvent::Added(incoming.clone()));
        incoming.deliver(b"a");
        incoming.deliver(b"b");
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_dispose_releases_everything_once() {
        let (transport, session) = scripted();
        let stream = session.create_outgoing_stream().unwrap();
        let incoming = Arc::new(LeakyIncoming::default());
        transport.announce(IncomingStreamEvent::Added(incoming.clone()));
        let (_id, mut rx) = session.incoming_audio_channel();

        session.dispose();
        session.dispose();

        assert!(session.is_disposed());
        assert!(stream.is_disposed());
        assert!(incoming.unsubscribed.load(Ordering::SeqCst));
        assert!(transport.callbacks.lock().is_empty());
        assert_eq!(transport.closed.load(Ordering::SeqCst), 1);
        assert!(session.incoming_stream_ids().is_empty());
        assert!(matches!(session.create_outgoing_stream(), Err(Error::Disposed)));

        // Handlers were dropped, so the channel sender is gone
        incoming.deliver(b"late");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_added_after_dispose_is_ignored() {
        let (transport, session) = scripted();
        let leaked: Vec<_> = transport.callbacks.lock().iter().map(|(_, c)| c.clone()).collect();
        session.dispose();

        let incoming = Arc::new(LeakyIncoming::default());
        for callback in leaked {
            callback(IncomingStreamEvent::Added(incoming.clone()));
        }
        assert!(session.incoming_stream_ids().is_empty());
    }

    #[test]
    fn test_concurrent_reannouncement_leaves_no_live_subscription() {
        for _ in 0..50 {
            let (transport, session) = scripted();
            let received = Arc::new(AtomicUsize::new(0));
            let received_clone = received.clone();
            session.on_incoming_audio(move |_| {
                received_clone.fetch_add(1, Ordering::SeqCst);
            });

            let original = Arc::new(LeakyIncoming::default());
            transport.announce(IncomingStreamEvent::Added(original.clone()));

            let replacements: Vec<_> = (0..2).map(|_| Arc::new(LeakyIncoming::default())).collect();
            let barrier = std::sync::Barrier::new(replacements.len());
            std::thread::scope(|scope| {
                for stream in &replacements {
                    let transport = &transport;
                    let barrier = &barrier;
                    scope.spawn(move || {
                        barrier.wait();
                        transport.announce(IncomingStreamEvent::Added(stream.clone()));
                    });
                }
            });
            assert_eq!(session.incoming_stream_ids(), vec![7]);

            transport.announce(IncomingStreamEvent::Removed(7));
            assert!(session.incoming_stream_ids().is_empty());

            for stream in replacements.iter().chain(std::iter::once(&original)) {
                assert!(stream.unsubscribed.load(Ordering::SeqCst));
                stream.deliver(b"late");
            }
            assert_eq!(received.load(Ordering::SeqCst), 0);
        }
    }
}
