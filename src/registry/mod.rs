// ABOUTME: Session registry module
// ABOUTME: Shared connection, session map and the per-session stream handles

mod cli;
mod config;
#[allow(clippy::module_inception)]
mod registry;
mod session;
mod stream;

pub use cli::DemoArgs;
pub use config::RegistryConfig;
pub use registry::{RegistrySnapshot, SessionRegistry, SessionSummary};
pub use session::{IncomingAudio, SessionHandle, SessionId};
pub use stream::OutgoingStream;
