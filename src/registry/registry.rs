// ABOUTME: Session registry with a lazily established shared connection
// ABOUTME: Thread-safe create/terminate with optional auto-disconnect when empty

use crate::error::Error;
use crate::events::SubscriptionId;
use crate::registry::config::RegistryConfig;
use crate::registry::session::{SessionHandle, SessionId};
use crate::transport::{Connection, ConnectionState, ConnectionStats, Transport, TransportError};
use crate::Result;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The shared connection together with the registry's subscriptions on it
struct ActiveConnection {
    /// Distinguishes this connection from earlier ones in callbacks
    generation: u64,
    connection: Arc<dyn Connection>,
    subscriptions: Vec<SubscriptionId>,
}

impl ActiveConnection {
    /// Unsubscribe the registry callbacks, then optionally close the connection
    fn release(self, close: bool) {
        for subscription in &self.subscriptions {
            self.connection.unsubscribe(*subscription);
        }
        if close {
            if let Err(e) = self.connection.close() {
                log::warn!("Failed to close connection {}: {}", self.generation, e);
            }
        }
    }
}

/// Everything guarded by the registry lock
struct RegistryState {
    connection: Option<ActiveConnection>,
    sessions: HashMap<SessionId, SessionHandle>,
    /// Joins in flight on the current connection
    pending_joins: usize,
    disposed: bool,
    connection_state: ConnectionState,
    last_stats: Option<ConnectionStats>,
}

impl RegistryState {
    fn generation(&self) -> Option<u64> {
        self.connection.as_ref().map(|active| active.generation)
    }
}

struct RegistryInner {
    config: RegistryConfig,
    transport: Arc<dyn Transport>,
    state: Mutex<RegistryState>,
    /// Serializes connection establishment
    connect_gate: tokio::sync::Mutex<()>,
    next_generation: AtomicU64,
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for (_, session) in state.sessions.drain() {
            session.dispose();
        }
        if let Some(active) = state.connection.take() {
            active.release(true);
        }
    }
}

/// A claimed `pending_joins` slot
///
/// Dropping an unreleased slot, including when the `create_session` future
/// is cancelled, gives the slot back and re-applies the auto-disconnect
/// policy.
struct JoinSlot {
    registry: SessionRegistry,
    generation: u64,
    released: bool,
}

impl JoinSlot {
    fn new(registry: &SessionRegistry, generation: u64) -> Self {
        Self {
            registry: registry.clone(),
            generation,
            released: false,
        }
    }

    /// Give the slot back while the caller holds the registry lock
    fn release_locked(&mut self, state: &mut RegistryState) {
        state.pending_joins = state.pending_joins.saturating_sub(1);
        self.released = true;
    }
}

impl Drop for JoinSlot {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let release = {
            let mut state = self.registry.inner.state.lock();
            state.pending_joins = state.pending_joins.saturating_sub(1);
            self.registry.release_wanted(&state)
        };
        if let Some(generation) = release {
            self.registry.schedule_auto_disconnect(generation);
        }
    }
}

/// Restores the previous connection state unless the connect completed
struct ConnectAttempt<'a> {
    inner: &'a RegistryInner,
    previous_state: ConnectionState,
    finished: bool,
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut state = self.inner.state.lock();
        if state.connection.is_none() && state.connection_state == ConnectionState::Connecting {
            state.connection_state = self.previous_state;
        }
    }
}

/// Per-session line of a [`RegistrySnapshot`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    /// Session identifier
    pub id: String,
    /// Live outgoing streams
    pub outgoing_streams: usize,
    /// Incoming streams currently announced
    pub incoming_streams: usize,
}

/// Point-in-time view of a registry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistrySnapshot {
    /// Whether a shared connection exists
    pub connected: bool,
    /// Last observed connection state
    pub connection_state: ConnectionState,
    /// Active sessions, ordered by id
    pub sessions: Vec<SessionSummary>,
    /// Latest statistics of the current connection
    pub stats: Option<ConnectionStats>,
}

/// Registry of active sessions sharing one transport connection
///
/// The connection is established by the first `create_session` and kept
/// until `disconnect`, `dispose`, a transport-side drop, or (with
/// auto-disconnect enabled) termination of the last session.
///
/// Cloning is cheap; all clones share the same state.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    /// Create a registry on top of a transport
    pub fn new(config: RegistryConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                transport,
                state: Mutex::new(RegistryState {
                    connection: None,
                    sessions: HashMap::new(),
                    pending_joins: 0,
                    disposed: false,
                    connection_state: ConnectionState::Idle,
                    last_stats: None,
                }),
                connect_gate: tokio::sync::Mutex::new(()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Registry configuration
    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Join a session, connecting first if needed
    ///
    /// Connect and join run outside the registry lock; the result is
    /// re-validated once the lock is taken again. A failed or cancelled call
    /// leaves no session behind.
    pub async fn create_session(&self, id: impl Into<SessionId>) -> Result<SessionHandle> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::InvalidSessionId);
        }
        {
            let state = self.inner.state.lock();
            if state.disposed {
                return Err(Error::Disposed);
            }
            if state.sessions.contains_key(&id) {
                return Err(Error::DuplicateSession(id));
            }
        }

        let (mut slot, connection) = self.acquire_connection().await?;
        let generation = slot.generation;

        let transport_session = match connection.join_session(&id, &self.inner.config.join).await {
            Ok(session) => session,
            Err(e) => {
                log::warn!("Failed to join session {}: {}", id, e);
                drop(slot);
                let connection_lost = self.inner.state.lock().generation() != Some(generation);
                return Err(if connection_lost {
                    Error::Connection(e)
                } else {
                    Error::Transport(e)
                });
            }
        };
        let handle = SessionHandle::attach(id.clone(), transport_session);

        let mut state = self.inner.state.lock();
        slot.release_locked(&mut state);

        let conflict = if state.disposed {
            Some(Error::Disposed)
        } else if state.generation() != Some(generation) {
            Some(Error::Connection(TransportError::Closed))
        } else if state.sessions.contains_key(&id) {
            Some(Error::DuplicateSession(id.clone()))
        } else {
            None
        };

        if let Some(err) = conflict {
            let release = self.release_wanted(&state);
            drop(state);
            log::warn!("Discarding joined session {}: {}", id, err);
            handle.dispose();
            if let Some(generation) = release {
                self.schedule_auto_disconnect(generation);
            }
            return Err(err);
        }

        state.sessions.insert(id.clone(), handle.clone());
        log::info!("Session {} created, total sessions: {}", id, state.sessions.len());
        Ok(handle)
    }

    /// Terminate a session by id; no-op if it is not registered
    pub fn terminate_session(&self, id: &str) {
        if let Some(session) = self.get_session(id) {
            self.terminate_session_handle(&session);
        }
    }

    /// Terminate a session by handle
    ///
    /// Teardown order: transport notifications are unsubscribed, then the
    /// entry is removed from the registry, then the session is disposed. The
    /// handle is always disposed; the registry entry is only removed if it is
    /// this very handle.
    pub fn terminate_session_handle(&self, session: &SessionHandle) {
        session.detach_transport();

        let (owned, release, remaining) = {
            let mut state = self.inner.state.lock();
            let owned = state
                .sessions
                .get(session.id())
                .is_some_and(|registered| registered.ptr_eq(session));
            if owned {
                state.sessions.remove(session.id());
            }
            let release = if owned { self.release_wanted(&state) } else { None };
            (owned, release, state.sessions.len())
        };

        session.dispose();
        if owned {
            log::info!("Session {} terminated, total sessions: {}", session.id(), remaining);
            if let Some(generation) = release {
                self.schedule_auto_disconnect(generation);
            }
        }
    }

    /// Look up a session
    pub fn get_session(&self, id: &str) -> Option<SessionHandle> {
        self.inner.state.lock().sessions.get(id).cloned()
    }

    /// Number of registered sessions
    pub fn get_active_session_count(&self) -> usize {
        self.inner.state.lock().sessions.len()
    }

    /// Ids of registered sessions, sorted
    pub fn get_active_session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.inner.state.lock().sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Whether a shared connection currently exists
    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().connection.is_some()
    }

    /// Last observed connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.lock().connection_state
    }

    /// Latest statistics published for the current connection
    pub fn last_stats(&self) -> Option<ConnectionStats> {
        self.inner.state.lock().last_stats.clone()
    }

    /// Whether `dispose` has been called
    pub fn is_disposed(&self) -> bool {
        self.inner.state.lock().disposed
    }

    /// Point-in-time view of the registry
    pub fn snapshot(&self) -> RegistrySnapshot {
        let (connected, connection_state, stats, sessions) = {
            let state = self.inner.state.lock();
            let sessions: Vec<SessionHandle> = state.sessions.values().cloned().collect();
            (
                state.connection.is_some(),
                state.connection_state,
                state.last_stats.clone(),
                sessions,
            )
        };

        let mut sessions: Vec<SessionSummary> = sessions
            .iter()
            .map(|session| SessionSummary {
                id: session.id().to_string(),
                outgoing_streams: session.outgoing_stream_count(),
                incoming_streams: session.incoming_stream_ids().len(),
            })
            .collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));

        RegistrySnapshot {
            connected,
            connection_state,
            sessions,
            stats,
        }
    }

    /// Terminate every session and close the shared connection
    ///
    /// A later `create_session` reconnects from scratch. No-op when already
    /// disconnected.
    pub fn disconnect(&self) {
        let (sessions, active) = {
            let mut state = self.inner.state.lock();
            let sessions: Vec<SessionHandle> = state.sessions.drain().map(|(_, s)| s).collect();
            let active = state.connection.take();
            if active.is_some() {
                state.connection_state = ConnectionState::Disconnected;
            }
            state.last_stats = None;
            (sessions, active)
        };

        if sessions.is_empty() && active.is_none() {
            return;
        }

        log::info!("Disconnecting, terminating {} sessions", sessions.len());
        for session in &sessions {
            session.dispose();
        }
        if let Some(active) = active {
            active.release(true);
        }
    }

    /// Disconnect and make the registry permanently unusable
    pub fn dispose(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
        }
        self.disconnect();
        log::info!("Session registry disposed");
    }

    /// Return the current connection, establishing it if absent
    ///
    /// On success the caller holds a [`JoinSlot`] until its join is settled.
    async fn acquire_connection(&self) -> Result<(JoinSlot, Arc<dyn Connection>)> {
        if let Some(found) = self.claim_existing()? {
            return Ok(found);
        }

        let _gate = self.inner.connect_gate.lock().await;
        if let Some(found) = self.claim_existing()? {
            return Ok(found);
        }

        let previous_state = {
            let mut state = self.inner.state.lock();
            std::mem::replace(&mut state.connection_state, ConnectionState::Connecting)
        };
        let mut attempt = ConnectAttempt {
            inner: &self.inner,
            previous_state,
            finished: false,
        };
        log::info!("Connecting to {}", self.inner.config.connection.endpoint);

        let connection = match self.inner.transport.connect(&self.inner.config.connection).await {
            Ok(connection) => connection,
            Err(e) => {
                log::warn!(
                    "Failed to connect to {}: {}",
                    self.inner.config.connection.endpoint,
                    e
                );
                return Err(Error::Connection(e));
            }
        };

        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
        let subscriptions = self.subscribe_connection(generation, &connection);
        let active = ActiveConnection {
            generation,
            connection: Arc::clone(&connection),
            subscriptions,
        };

        let mut state = self.inner.state.lock();
        if state.disposed {
            drop(state);
            active.release(true);
            return Err(Error::Disposed);
        }
        state.connection = Some(active);
        state.connection_state = connection.state();
        state.pending_joins += 1;
        attempt.finished = true;
        log::info!(
            "Connected to {} (connection {})",
            self.inner.config.connection.endpoint,
            generation
        );
        Ok((JoinSlot::new(self, generation), connection))
    }

    fn claim_existing(&self) -> Result<Option<(JoinSlot, Arc<dyn Connection>)>> {
        let mut state = self.inner.state.lock();
        if state.disposed {
            return Err(Error::Disposed);
        }
        let Some(active) = state.connection.as_ref() else {
            return Ok(None);
        };
        let found = (
            JoinSlot::new(self, active.generation),
            Arc::clone(&active.connection),
        );
        state.pending_joins += 1;
        Ok(Some(found))
    }

    fn subscribe_connection(
        &self,
        generation: u64,
        connection: &Arc<dyn Connection>,
    ) -> Vec<SubscriptionId> {
        let weak = Arc::downgrade(&self.inner);
        let state_subscription =
            connection.subscribe_state(Arc::new(move |new_state: ConnectionState| {
                if let Some(inner) = weak.upgrade() {
                    SessionRegistry { inner }.on_connection_state(generation, new_state);
                }
            }));

        let weak = Arc::downgrade(&self.inner);
        let stats_subscription =
            connection.subscribe_stats(Arc::new(move |stats: &ConnectionStats| {
                if let Some(inner) = weak.upgrade() {
                    SessionRegistry { inner }.on_connection_stats(generation, stats);
                }
            }));

        vec![state_subscription, stats_subscription]
    }

    /// Transport state callback
    ///
    /// `Disconnected` force-terminates every session and forgets the
    /// connection without going through `disconnect`.
    fn on_connection_state(&self, generation: u64, new_state: ConnectionState) {
        let (sessions, dropped) = {
            let mut state = self.inner.state.lock();
            if state.generation() != Some(generation) {
                log::debug!(
                    "Ignoring state {} from stale connection {}",
                    new_state,
                    generation
                );
                return;
            }
            state.connection_state = new_state;
            if new_state != ConnectionState::Disconnected {
                log::info!("Connection state changed to {}", new_state);
                return;
            }
            state.last_stats = None;
            let sessions: Vec<SessionHandle> = state.sessions.drain().map(|(_, s)| s).collect();
            (sessions, state.connection.take())
        };

        log::warn!(
            "Connection {} lost, force-terminating {} sessions",
            generation,
            sessions.len()
        );
        for session in &sessions {
            session.dispose();
        }
        if let Some(active) = dropped {
            active.release(false);
        }
    }

    fn on_connection_stats(&self, generation: u64, stats: &ConnectionStats) {
        let mut state = self.inner.state.lock();
        if state.generation() != Some(generation) {
            return;
        }
        log::debug!(
            "Connection stats: rtt={:.1}ms sent={} received={} lost={}",
            stats.round_trip_ms,
            stats.bytes_sent,
            stats.bytes_received,
            stats.packets_lost
        );
        state.last_stats = Some(stats.clone());
    }

    /// Connection generation to release if the auto-disconnect policy applies
    fn release_wanted(&self, state: &RegistryState) -> Option<u64> {
        if !self.inner.config.auto_disconnect_when_empty
            || state.disposed
            || !state.sessions.is_empty()
            || state.pending_joins > 0
        {
            return None;
        }
        state.generation()
    }

    /// Release the connection off the caller's thread
    ///
    /// Runs inline when there is no tokio runtime to hand it to.
    fn schedule_auto_disconnect(&self, generation: u64) {
        let registry = self.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || registry.disconnect_if_idle(generation));
            }
            Err(_) => registry.disconnect_if_idle(generation),
        }
    }

    /// Tear down the connection if it is still unused
    ///
    /// Re-checks under the lock: a session created or a join started since
    /// the decision aborts the disconnect.
    fn disconnect_if_idle(&self, generation: u64) {
        let released = {
            let mut state = self.inner.state.lock();
            let idle = state.sessions.is_empty()
                && state.pending_joins == 0
                && state.generation() == Some(generation);
            if !idle {
                log::debug!("Auto-disconnect of connection {} aborted, registry in use", generation);
                return;
            }
            state.connection_state = ConnectionState::Disconnected;
            state.last_stats = None;
            state.connection.take()
        };

        if let Some(active) = released {
            log::info!("No sessions remain, releasing connection {}", generation);
            active.release(true);
        }
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("SessionRegistry")
            .field("connected", &state.connection.is_some())
            .field("connection_state", &state.connection_state)
            .field("sessions", &state.sessions.len())
            .field("disposed", &state.disposed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;

    fn registry(auto_disconnect: bool) -> (LoopbackTransport, SessionRegistry) {
        let transport = LoopbackTransport::new();
        let config = RegistryConfig::new("loopback://unit")
            .client_name("unit")
            .auto_disconnect_when_empty(auto_disconnect);
        let registry = SessionRegistry::new(config, Arc::new(transport.clone()));
        (transport, registry)
    }

    #[tokio::test]
    async fn test_failed_connect_leaves_state_unchanged() {
        let (transport, registry) = registry(false);
        transport.set_fail_connects(true);

        let err = registry.create_session("s1").await.unwrap_err();
        assert!(matches!(err, Error::Connection(TransportError::ConnectionFailed(_))));
        assert!(!registry.is_connected());
        assert_eq!(registry.connection_state(), ConnectionState::Idle);
        assert_eq!(registry.get_active_session_count(), 0);
        assert_eq!(registry.inner.state.lock().pending_joins, 0);

        transport.set_fail_connects(false);
        registry.create_session("s1").await.unwrap();
        assert!(registry.is_connected());
        assert_eq!(registry.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_stale_state_callback_is_ignored() {
        let (_transport, registry) = registry(false);
        registry.create_session("s1").await.unwrap();
        let generation = registry.inner.state.lock().generation().unwrap();

        registry.on_connection_state(generation + 10, ConnectionState::Disconnected);
        assert!(registry.is_connected());
        assert_eq!(registry.get_active_session_count(), 1);

        registry.on_connection_state(generation, ConnectionState::Failover);
        assert_eq!(registry.connection_state(), ConnectionState::Failover);
        assert_eq!(registry.get_active_session_count(), 1);
    }

    #[tokio::test]
    async fn test_idle_check_aborts_when_join_pending() {
        let (_transport, registry) = registry(true);
        registry.create_session("s1").await.unwrap();
        let generation = registry.inner.state.lock().generation().unwrap();
        registry.inner.state.lock().sessions.clear();
        registry.inner.state.lock().pending_joins = 1;

        registry.disconnect_if_idle(generation);
        assert!(registry.is_connected());

        registry.inner.state.lock().pending_joins = 0;
        registry.disconnect_if_idle(generation);
        assert!(!registry.is_connected());
    }

    #[test]
    fn test_auto_disconnect_without_runtime_runs_inline() {
        let (transport, registry) = registry(true);
        let session = tokio_test::block_on(registry.create_session("s1")).unwrap();
        assert_eq!(transport.live_connections(), 1);

        registry.terminate_session_handle(&session);
        assert!(!registry.is_connected());
        assert_eq!(transport.live_connections(), 0);
    }

    #[tokio::test]
    async fn test_drop_releases_connection() {
        let (transport, registry) = registry(false);
        let session = registry.create_session("s1").await.unwrap();
        drop(registry);

        assert!(session.is_disposed());
        assert_eq!(transport.live_connections(), 0);
    }

    /// Records, on every session unsubscribe, whether the registry still
    /// lists that session
    #[derive(Clone)]
    struct OrderRecorder {
        registry: Arc<Mutex<Option<SessionRegistry>>>,
        registered_at_unsubscribe: Arc<Mutex<Vec<bool>>>,
    }

    struct RecordingTransport {
        inner: LoopbackTransport,
        recorder: OrderRecorder,
    }

    struct RecordingConnection {
        inner: Arc<dyn Connection>,
        recorder: OrderRecorder,
    }

    struct RecordingSession {
        inner: Arc<dyn crate::transport::TransportSession>,
        recorder: OrderRecorder,
    }

    #[async_trait::async_trait]
    impl Transport for RecordingTransport {
        async fn connect(
            &self,
            params: &crate::transport::ConnectionParams,
        ) -> std::result::Result<Arc<dyn Connection>, TransportError> {
            let inner = self.inner.connect(params).await?;
            Ok(Arc::new(RecordingConnection {
                inner,
                recorder: self.recorder.clone(),
            }))
        }
    }

    #[async_trait::async_trait]
    impl Connection for RecordingConnection {
        fn state(&self) -> ConnectionState {
            self.inner.state()
        }

        async fn join_session(
            &self,
            session_id: &str,
            options: &crate::transport::JoinOptions,
        ) -> std::result::Result<Arc<dyn crate::transport::TransportSession>, TransportError> {
            let inner = self.inner.join_session(session_id, options).await?;
            Ok(Arc::new(RecordingSession {
                inner,
                recorder: self.recorder.clone(),
            }))
        }

        fn subscribe_state(&self, callback: crate::transport::StateCallback) -> SubscriptionId {
            self.inner.subscribe_state(callback)
        }

        fn subscribe_stats(&self, callback: crate::transport::StatsCallback) -> SubscriptionId {
            self.inner.subscribe_stats(callback)
        }

        fn unsubscribe(&self, id: SubscriptionId) {
            self.inner.unsubscribe(id)
        }

        fn close(&self) -> std::result::Result<(), TransportError> {
            self.inner.close()
        }
    }

    impl crate::transport::TransportSession for RecordingSession {
        fn session_id(&self) -> &str {
            self.inner.session_id()
        }

        fn open_outgoing_stream(
            &self,
        ) -> std::result::Result<Arc<dyn crate::transport::TransportOutgoingStream>, TransportError>
        {
            self.inner.open_outgoing_stream()
        }

        fn subscribe_incoming(
            &self,
            callback: crate::transport::IncomingStreamCallback,
        ) -> SubscriptionId {
            self.inner.subscribe_incoming(callback)
        }

        fn unsubscribe(&self, id: SubscriptionId) {
            let registry = self.recorder.registry.lock().clone();
            let registered = registry
                .map(|registry| registry.get_session(self.inner.session_id()).is_some())
                .unwrap_or(false);
            self.recorder.registered_at_unsubscribe.lock().push(registered);
            self.inner.unsubscribe(id)
        }

        fn close(&self) -> std::result::Result<(), TransportError> {
            self.inner.close()
        }
    }

    #[tokio::test]
    async fn test_terminate_unsubscribes_before_removal() {
        let recorder = OrderRecorder {
            registry: Arc::new(Mutex::new(None)),
            registered_at_unsubscribe: Arc::new(Mutex::new(Vec::new())),
        };
        let transport = RecordingTransport {
            inner: LoopbackTransport::new(),
            recorder: recorder.clone(),
        };
        let registry = SessionRegistry::new(RegistryConfig::default(), Arc::new(transport));
        *recorder.registry.lock() = Some(registry.clone());

        registry.create_session("s1").await.unwrap();
        let second = registry.create_session("s2").await.unwrap();

        registry.terminate_session("s1");
        registry.terminate_session_handle(&second);

        assert_eq!(recorder.registered_at_unsubscribe.lock().as_slice(), &[true, true]);
        assert_eq!(registry.get_active_session_count(), 0);
        recorder.registry.lock().take();
    }
}
