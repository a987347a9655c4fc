// ABOUTME: Main library entry point for sessionhub
// ABOUTME: Exports the session registry, transport abstraction and error types

//! # sessionhub
//!
//! Registry of real-time audio sessions sharing one lazily established
//! transport connection.
//!
//! The first `create_session` opens the connection; later sessions reuse it.
//! Each session owns its outgoing streams and forwards payloads from incoming
//! streams to subscribers. The connection is released on `disconnect`,
//! `dispose`, a transport-side drop, or, when configured, once the last
//! session is terminated.
//!
//! ## Features
//!
//! - **Registry**: Thread-safe session create/terminate over a shared connection
//! - **Streams**: Outgoing stream handles and incoming audio events per session
//! - **Transport**: Async traits for a media SDK plus an in-process loopback
//!
//! ## Example
//!
//! ```no_run
//! use sessionhub::{LoopbackTransport, RegistryConfig, SessionRegistry};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> sessionhub::Result<()> {
//!     let config = RegistryConfig::new("loopback://local").auto_disconnect_when_empty(true);
//!     let registry = SessionRegistry::new(config, Arc::new(LoopbackTransport::new()));
//!
//!     let session = registry.create_session("room-1").await?;
//!     session.on_incoming_audio(|audio| println!("{} bytes", audio.payload.len()));
//!     let stream = session.create_outgoing_stream()?;
//!     stream.send(vec![0u8; 960])?;
//!
//!     registry.terminate_session("room-1");
//!     registry.dispose();
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

/// Subscriber lists used for transport and session callbacks
pub mod events;
/// Session registry, sessions and stream handles
pub mod registry;
/// Transport traits and the loopback implementation
pub mod transport;

pub use registry::{
    IncomingAudio, OutgoingStream, RegistryConfig, RegistrySnapshot, SessionHandle, SessionId,
    SessionRegistry, SessionSummary,
};
pub use transport::{ConnectionState, ConnectionStats, LoopbackTransport, Transport, TransportError};

/// Result type for sessionhub operations
pub type Result<T> = std::result::Result<T, error::Error>;

/// Error types for sessionhub
pub mod error {
    use crate::transport::TransportError;
    use thiserror::Error;

    /// Error types for registry and session operations
    #[derive(Error, Debug, Clone, PartialEq)]
    pub enum Error {
        /// Establishing the shared connection failed, or it went away mid-join
        #[error("Connection error: {0}")]
        Connection(TransportError),

        /// A session with this id is already registered
        #[error("Session already exists: {0}")]
        DuplicateSession(String),

        /// The registry, session or stream has been disposed
        #[error("Disposed")]
        Disposed,

        /// Session ids must be non-empty
        #[error("Invalid session id")]
        InvalidSessionId,

        /// A transport call other than connect failed
        #[error("Transport error: {0}")]
        Transport(#[from] TransportError),
    }
}
