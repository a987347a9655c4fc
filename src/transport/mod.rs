// ABOUTME: Transport abstraction consumed by the session registry
// ABOUTME: Traits and value types standing in for an external real-time media SDK

/// In-process transport used by the demo and tests
pub mod loopback;

use crate::events::SubscriptionId;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

pub use loopback::LoopbackTransport;

/// Numeric stream identifier
pub type StreamId = u32;

/// Connection state reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No connection attempt has been made
    Idle,
    /// Connection establishment in progress
    Connecting,
    /// Connected and usable
    Connected,
    /// Transport is moving to another edge; sessions stay alive
    Failover,
    /// Connection is gone; every session on it is dead
    Disconnected,
}

impl ConnectionState {
    /// Convert to a log-friendly string
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failover => "failover",
            ConnectionState::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection statistics published by the transport
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStats {
    /// Round trip time to the media edge in milliseconds
    pub round_trip_ms: f64,
    /// Payload bytes sent on this connection
    pub bytes_sent: u64,
    /// Payload bytes received on this connection
    pub bytes_received: u64,
    /// Packets reported lost
    pub packets_lost: u64,
}

/// Parameters needed to open a connection
#[derive(Clone, Debug)]
pub struct ConnectionParams {
    /// Media service endpoint
    pub endpoint: String,
    /// Access credential, if the endpoint requires one
    pub credential: Option<String>,
    /// Name this client reports to the service
    pub client_name: String,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            endpoint: "loopback://local".to_string(),
            credential: None,
            client_name: format!("sessionhub-{}", uuid::Uuid::new_v4()),
        }
    }
}

/// Options passed when joining a session
#[derive(Clone, Debug)]
pub struct JoinOptions {
    /// Display name of the local participant
    pub participant_name: Option<String>,
    /// Audio sample rate in Hz
    pub sample_rate: u32,
    /// Number of audio channels
    pub channels: u8,
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self {
            participant_name: None,
            sample_rate: 48000,
            channels: 2,
        }
    }
}

/// Errors raised by a transport implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The endpoint could not be reached
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The credential was rejected
    #[error("Credential rejected: {0}")]
    Credential(String),

    /// The session join was refused
    #[error("Join failed: {0}")]
    JoinFailed(String),

    /// A stream operation failed
    #[error("Stream error: {0}")]
    Stream(String),

    /// The object has already been closed
    #[error("Transport object closed")]
    Closed,
}

/// Notification that an incoming stream appeared or went away
#[derive(Clone)]
pub enum IncomingStreamEvent {
    /// A remote participant started sending on a new stream
    Added(Arc<dyn TransportIncomingStream>),
    /// The stream with this id is gone
    Removed(StreamId),
}

impl std::fmt::Debug for IncomingStreamEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IncomingStreamEvent::Added(stream) => {
                f.debug_tuple("Added").field(&stream.stream_id()).finish()
            }
            IncomingStreamEvent::Removed(id) => f.debug_tuple("Removed").field(id).finish(),
        }
    }
}

/// Connection state callback
pub type StateCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;
/// Connection statistics callback
pub type StatsCallback = Arc<dyn Fn(&ConnectionStats) + Send + Sync>;
/// Incoming stream add/remove callback
pub type IncomingStreamCallback = Arc<dyn Fn(IncomingStreamEvent) + Send + Sync>;
/// Incoming payload callback: (stream id, payload)
pub type DataCallback = Arc<dyn Fn(StreamId, Bytes) + Send + Sync>;

/// Entry point of a media SDK
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection; one network round trip
    async fn connect(
        &self,
        params: &ConnectionParams,
    ) -> Result<Arc<dyn Connection>, TransportError>;
}

/// A live connection to the media service
#[async_trait]
pub trait Connection: Send + Sync {
    /// Current state of the connection
    fn state(&self) -> ConnectionState;

    /// Join (or create) the session with the given id
    async fn join_session(
        &self,
        session_id: &str,
        options: &JoinOptions,
    ) -> Result<Arc<dyn TransportSession>, TransportError>;

    /// Register for state transitions
    fn subscribe_state(&self, callback: StateCallback) -> SubscriptionId;

    /// Register for periodic statistics
    fn subscribe_stats(&self, callback: StatsCallback) -> SubscriptionId;

    /// Remove a state or stats subscription
    fn unsubscribe(&self, id: SubscriptionId);

    /// Close the connection and every session on it
    fn close(&self) -> Result<(), TransportError>;
}

/// A joined session on a connection
pub trait TransportSession: Send + Sync {
    /// Session identifier
    fn session_id(&self) -> &str;

    /// Open a new outgoing stream
    fn open_outgoing_stream(&self) -> Result<Arc<dyn TransportOutgoingStream>, TransportError>;

    /// Register for incoming stream add/remove notifications
    fn subscribe_incoming(&self, callback: IncomingStreamCallback) -> SubscriptionId;

    /// Remove an incoming stream subscription
    fn unsubscribe(&self, id: SubscriptionId);

    /// Leave the session
    fn close(&self) -> Result<(), TransportError>;
}

/// A stream the local participant sends on
pub trait TransportOutgoingStream: Send + Sync {
    /// Transport-assigned stream id, as seen by remote participants
    fn stream_id(&self) -> StreamId;

    /// Send one payload
    fn send(&self, payload: Bytes) -> Result<(), TransportError>;

    /// Stop sending and release the stream
    fn close(&self) -> Result<(), TransportError>;
}

/// A stream announced by the transport
pub trait TransportIncomingStream: Send + Sync {
    /// Transport-assigned stream id
    fn stream_id(&self) -> StreamId;

    /// Register for received payloads
    fn subscribe_data(&self, callback: DataCallback) -> SubscriptionId;

    /// Remove a data subscription
    fn unsubscribe(&self, id: SubscriptionId);
}
