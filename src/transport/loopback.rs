// ABOUTME: In-process loopback implementation of the transport traits
// ABOUTME: Sessions joined under the same id form a room and exchange stream payloads

use super::{
    Connection, ConnectionParams, ConnectionState, ConnectionStats, IncomingStreamCallback,
    IncomingStreamEvent, JoinOptions, StateCallback, StatsCallback, StreamId, Transport,
    TransportError, TransportIncomingStream, TransportOutgoingStream, TransportSession,
    DataCallback,
};
use crate::events::{EventHub, SubscriptionId};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Shared state behind every clone of a [`LoopbackTransport`]
struct Hub {
    /// Session id -> participants currently joined
    rooms: Mutex<HashMap<String, Vec<Arc<LoopbackSession>>>>,
    /// Connections that have not been closed
    connections: Mutex<Vec<Arc<LoopbackConnection>>>,
    next_stream_id: AtomicU32,
    next_key: AtomicU64,
    connect_attempts: AtomicUsize,
    fail_connects: AtomicBool,
    connect_latency: Mutex<Duration>,
    join_latency: Mutex<Duration>,
}

impl Hub {
    fn next_key(&self) -> u64 {
        self.next_key.fetch_add(1, Ordering::Relaxed)
    }

    /// Add a participant to its room, returning the participants already there
    fn enter_room(&self, session: &Arc<LoopbackSession>) -> Vec<Arc<LoopbackSession>> {
        let mut rooms = self.rooms.lock();
        let members = rooms.entry(session.session_id.clone()).or_default();
        let peers = members.clone();
        members.push(Arc::clone(session));
        peers
    }

    fn leave_room(&self, room: &str, key: u64) {
        let mut rooms = self.rooms.lock();
        if let Some(members) = rooms.get_mut(room) {
            members.retain(|member| member.key != key);
            if members.is_empty() {
                rooms.remove(room);
            }
        }
    }

    fn room_peers(&self, room: &str, key: u64) -> Vec<Arc<LoopbackSession>> {
        self.rooms
            .lock()
            .get(room)
            .map(|members| {
                members
                    .iter()
                    .filter(|member| member.key != key)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn live_connections(&self) -> Vec<Arc<LoopbackConnection>> {
        self.connections.lock().clone()
    }
}

/// In-process transport
///
/// Every clone shares the same rooms, so two registries built on clones of
/// one `LoopbackTransport` can exchange audio by joining the same session id.
/// An outgoing stream opened by one participant is announced as an incoming
/// stream to every other participant of the room.
#[derive(Clone)]
pub struct LoopbackTransport {
    hub: Arc<Hub>,
}

impl LoopbackTransport {
    /// Create a transport with no latency and no injected failures
    pub fn new() -> Self {
        Self {
            hub: Arc::new(Hub {
                rooms: Mutex::new(HashMap::new()),
                connections: Mutex::new(Vec::new()),
                next_stream_id: AtomicU32::new(1),
                next_key: AtomicU64::new(1),
                connect_attempts: AtomicUsize::new(0),
                fail_connects: AtomicBool::new(false),
                connect_latency: Mutex::new(Duration::ZERO),
                join_latency: Mutex::new(Duration::ZERO),
            }),
        }
    }

    /// Delay every connect by `latency`
    pub fn with_connect_latency(self, latency: Duration) -> Self {
        *self.hub.connect_latency.lock() = latency;
        self
    }

    /// Delay every session join by `latency`
    pub fn with_join_latency(self, latency: Duration) -> Self {
        *self.hub.join_latency.lock() = latency;
        self
    }

    /// Make subsequent connects fail (or succeed again)
    pub fn set_fail_connects(&self, fail: bool) {
        self.hub.fail_connects.store(fail, Ordering::SeqCst);
    }

    /// Number of connect calls made so far, successful or not
    pub fn connect_attempts(&self) -> usize {
        self.hub.connect_attempts.load(Ordering::SeqCst)
    }

    /// Number of connections that are still open
    pub fn live_connections(&self) -> usize {
        self.hub.connections.lock().len()
    }

    /// Number of participants joined under `session_id`
    pub fn room_size(&self, session_id: &str) -> usize {
        self.hub
            .rooms
            .lock()
            .get(session_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Push a stats sample to every open connection's subscribers
    pub fn publish_stats(&self) {
        for connection in self.hub.live_connections() {
            let stats = connection.stats();
            connection.stats_events.emit(&stats);
        }
    }

    /// Drive every open connection into `state`
    ///
    /// `Disconnected` tears the connections down the way a network loss
    /// would: their sessions leave their rooms and subscribers are notified.
    pub fn simulate_state(&self, state: ConnectionState) {
        for connection in self.hub.live_connections() {
            if state == ConnectionState::Disconnected {
                connection.shutdown();
            } else {
                connection.set_state(state);
            }
        }
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("live_connections", &self.live_connections())
            .field("connect_attempts", &self.connect_attempts())
            .finish()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(
        &self,
        params: &ConnectionParams,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        self.hub.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let latency = *self.hub.connect_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if self.hub.fail_connects.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed(format!(
                "{} is unreachable",
                params.endpoint
            )));
        }
        if matches!(params.credential.as_deref(), Some("")) {
            return Err(TransportError::Credential("empty credential".to_string()));
        }

        let connection = LoopbackConnection::new(Arc::clone(&self.hub), &params.client_name);
        self.hub.connections.lock().push(Arc::clone(&connection));
        log::debug!(
            "Loopback connection {} opened for {}",
            connection.key,
            params.client_name
        );
        Ok(connection)
    }
}

/// A loopback connection
pub struct LoopbackConnection {
    key: u64,
    client_name: String,
    hub: Arc<Hub>,
    self_ref: Weak<LoopbackConnection>,
    state: Mutex<ConnectionState>,
    state_events: EventHub<ConnectionState>,
    stats_events: EventHub<ConnectionStats>,
    sessions: Mutex<Vec<Arc<LoopbackSession>>>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl LoopbackConnection {
    fn new(hub: Arc<Hub>, client_name: &str) -> Arc<Self> {
        let key = hub.next_key();
        Arc::new_cyclic(|self_ref| Self {
            key,
            client_name: client_name.to_string(),
            hub,
            self_ref: self_ref.clone(),
            state: Mutex::new(ConnectionState::Connected),
            state_events: EventHub::new("connection state"),
            stats_events: EventHub::new("connection stats"),
            sessions: Mutex::new(Vec::new()),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        })
    }

    fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            round_trip_ms: 0.0,
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_lost: 0,
        }
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
        self.state_events.emit(&state);
    }

    /// Close every session and mark the connection disconnected
    ///
    /// Returns false if the connection was already down.
    fn shutdown(&self) -> bool {
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Disconnected {
                return false;
            }
            *state = ConnectionState::Disconnected;
        }

        self.hub.connections.lock().retain(|c| c.key != self.key);
        let sessions: Vec<_> = self.sessions.lock().drain(..).collect();
        for session in sessions {
            session.shutdown();
        }

        log::debug!("Loopback connection {} ({}) closed", self.key, self.client_name);
        self.state_events.emit(&ConnectionState::Disconnected);
        true
    }
}

#[async_trait]
impl Connection for LoopbackConnection {
    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    async fn join_session(
        &self,
        session_id: &str,
        options: &JoinOptions,
    ) -> Result<Arc<dyn TransportSession>, TransportError> {
        let latency = *self.hub.join_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if session_id.is_empty() {
            return Err(TransportError::JoinFailed("empty session id".to_string()));
        }
        if !matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Failover
        ) {
            return Err(TransportError::Closed);
        }

        let session = LoopbackSession::new(
            session_id,
            options.participant_name.clone(),
            Arc::clone(&self.hub),
            self.self_ref.clone(),
        );
        self.sessions.lock().push(Arc::clone(&session));

        // The connection may have dropped while we were registering
        if self.state() == ConnectionState::Disconnected {
            session.shutdown();
            return Err(TransportError::Closed);
        }

        let peers = self.hub.enter_room(&session);
        for peer in &peers {
            for stream_id in peer.outgoing_ids() {
                session.announce_added(stream_id);
            }
        }

        log::debug!(
            "Loopback session {} joined by {:?} ({} peers)",
            session_id,
            session.participant,
            peers.len()
        );
        Ok(session)
    }

    fn subscribe_state(&self, callback: StateCallback) -> SubscriptionId {
        self.state_events.subscribe(move |state| callback(*state))
    }

    fn subscribe_stats(&self, callback: StatsCallback) -> SubscriptionId {
        self.stats_events.subscribe(move |stats| callback(stats))
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        if !self.state_events.unsubscribe(id) {
            self.stats_events.unsubscribe(id);
        }
    }

    fn close(&self) -> Result<(), TransportError> {
        self.shutdown();
        Ok(())
    }
}

/// A participant in a loopback room
pub struct LoopbackSession {
    key: u64,
    session_id: String,
    participant: Option<String>,
    hub: Arc<Hub>,
    connection: Weak<LoopbackConnection>,
    self_ref: Weak<LoopbackSession>,
    closed: AtomicBool,
    incoming_events: EventHub<IncomingStreamEvent>,
    outgoing: Mutex<Vec<Arc<LoopbackOutgoingStream>>>,
    incoming: Mutex<HashMap<StreamId, Arc<LoopbackIncomingStream>>>,
}

impl LoopbackSession {
    fn new(
        session_id: &str,
        participant: Option<String>,
        hub: Arc<Hub>,
        connection: Weak<LoopbackConnection>,
    ) -> Arc<Self> {
        let key = hub.next_key();
        Arc::new_cyclic(|self_ref| Self {
            key,
            session_id: session_id.to_string(),
            participant,
            hub,
            connection,
            self_ref: self_ref.clone(),
            closed: AtomicBool::new(false),
            incoming_events: EventHub::new("incoming stream"),
            outgoing: Mutex::new(Vec::new()),
            incoming: Mutex::new(HashMap::new()),
        })
    }

    fn outgoing_ids(&self) -> Vec<StreamId> {
        self.outgoing.lock().iter().map(|s| s.id).collect()
    }

    fn announce_added(&self, stream_id: StreamId) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let stream = Arc::new(LoopbackIncomingStream::new(stream_id));
        self.incoming.lock().insert(stream_id, Arc::clone(&stream));
        self.incoming_events
            .emit(&IncomingStreamEvent::Added(stream));
    }

    fn announce_removed(&self, stream_id: StreamId) {
        let removed = self.incoming.lock().remove(&stream_id);
        if removed.is_some() {
            self.incoming_events
                .emit(&IncomingStreamEvent::Removed(stream_id));
        }
    }

    fn deliver(&self, stream_id: StreamId, payload: &Bytes) {
        let stream = self.incoming.lock().get(&stream_id).cloned();
        if let Some(stream) = stream {
            if let Some(connection) = self.connection.upgrade() {
                connection
                    .bytes_received
                    .fetch_add(payload.len() as u64, Ordering::Relaxed);
            }
            stream.data_events.emit(&(stream_id, payload.clone()));
        }
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.hub.leave_room(&self.session_id, self.key);
        let outgoing: Vec<_> = self.outgoing.lock().drain(..).collect();
        for stream in outgoing {
            stream.shutdown();
        }
        self.incoming.lock().clear();
        self.incoming_events.clear();

        if let Some(connection) = self.connection.upgrade() {
            connection.sessions.lock().retain(|s| s.key != self.key);
        }
    }
}

impl TransportSession for LoopbackSession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn open_outgoing_stream(&self) -> Result<Arc<dyn TransportOutgoingStream>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let stream = Arc::new(LoopbackOutgoingStream {
            id: self.hub.next_stream_id.fetch_add(1, Ordering::Relaxed),
            owner: self.self_ref.clone(),
            closed: AtomicBool::new(false),
        });
        self.outgoing.lock().push(Arc::clone(&stream));

        for peer in self.hub.room_peers(&self.session_id, self.key) {
            peer.announce_added(stream.id);
        }
        Ok(stream)
    }

    /// Subscribe, then replay streams announced before the subscription
    ///
    /// A stream added concurrently may be reported twice.
    fn subscribe_incoming(&self, callback: IncomingStreamCallback) -> SubscriptionId {
        let live = Arc::clone(&callback);
        let id = self
            .incoming_events
            .subscribe(move |event| live(event.clone()));

        let existing: Vec<_> = self.incoming.lock().values().cloned().collect();
        for stream in existing {
            callback(IncomingStreamEvent::Added(stream));
        }
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.incoming_events.unsubscribe(id);
    }

    fn close(&self) -> Result<(), TransportError> {
        self.shutdown();
        Ok(())
    }
}

/// An outgoing loopback stream
pub struct LoopbackOutgoingStream {
    id: StreamId,
    owner: Weak<LoopbackSession>,
    closed: AtomicBool,
}

impl LoopbackOutgoingStream {
    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(owner) = self.owner.upgrade() {
            owner.outgoing.lock().retain(|s| s.id != self.id);
            for peer in owner.hub.room_peers(&owner.session_id, owner.key) {
                peer.announce_removed(self.id);
            }
        }
    }
}

impl TransportOutgoingStream for LoopbackOutgoingStream {
    fn stream_id(&self) -> StreamId {
        self.id
    }

    fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Stream(format!("stream {} is closed", self.id)));
        }
        let owner = self.owner.upgrade().ok_or(TransportError::Closed)?;
        if owner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        if let Some(connection) = owner.connection.upgrade() {
            connection
                .bytes_sent
                .fetch_add(payload.len() as u64, Ordering::Relaxed);
        }
        for peer in owner.hub.room_peers(&owner.session_id, owner.key) {
            peer.deliver(self.id, &payload);
        }
        Ok(())
    }

    fn close(&self) -> Result<(), TransportError> {
        self.shutdown();
        Ok(())
    }
}

/// An incoming loopback stream
pub struct LoopbackIncomingStream {
    id: StreamId,
    data_events: EventHub<(StreamId, Bytes)>,
}

impl LoopbackIncomingStream {
    fn new(id: StreamId) -> Self {
        Self {
            id,
            data_events: EventHub::new("incoming data"),
        }
    }
}

impl TransportIncomingStream for LoopbackIncomingStream {
    fn stream_id(&self) -> StreamId {
        self.id
    }

    fn subscribe_data(&self, callback: DataCallback) -> SubscriptionId {
        self.data_events
            .subscribe(move |(stream_id, payload)| callback(*stream_id, payload.clone()))
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.data_events.unsubscribe(id);
    }
}
