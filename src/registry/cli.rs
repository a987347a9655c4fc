// ABOUTME: CLI argument parsing for the console demo
// ABOUTME: Turns flags into a registry configuration and a loopback transport

use crate::registry::RegistryConfig;
use crate::transport::LoopbackTransport;
use clap::Args;
use std::time::Duration;

/// Demo arguments
///
/// Use with `#[command(flatten)]` in the binary's Args struct:
/// ```ignore
/// #[derive(Parser)]
/// struct MyArgs {
///     #[command(flatten)]
///     demo: DemoArgs,
/// }
/// ```
#[derive(Args, Debug, Clone)]
pub struct DemoArgs {
    /// Media service endpoint
    #[arg(short, long, default_value = "loopback://local")]
    pub endpoint: String,

    /// Access credential passed on connect
    #[arg(long)]
    pub credential: Option<String>,

    /// Number of sessions to create
    #[arg(short, long, default_value = "3")]
    pub sessions: usize,

    /// Payloads sent on each outgoing stream
    #[arg(short, long, default_value = "10")]
    pub payloads: usize,

    /// Delay between payloads in milliseconds
    #[arg(long, default_value = "20")]
    pub payload_interval_ms: u64,

    /// Keep the connection open after the last session is terminated
    #[arg(long)]
    pub keep_connection: bool,

    /// Sample rate in Hz requested when joining
    #[arg(long, default_value = "48000")]
    pub sample_rate: u32,

    /// Channel count requested when joining
    #[arg(long, default_value = "2")]
    pub channels: u8,

    /// Simulated connect latency in milliseconds
    #[arg(long, default_value = "0")]
    pub connect_latency_ms: u64,

    /// Print the final registry snapshot as JSON
    #[arg(long)]
    pub json: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl DemoArgs {
    /// Initialize tracing based on verbosity flag
    pub fn init_tracing(&self) {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

        let filter = if self.verbose {
            "sessionhub=debug"
        } else {
            "sessionhub=info"
        };

        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| filter.into()),
            )
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    /// Log startup information
    pub fn log_startup_info(&self) {
        tracing::info!("sessionhub demo v{}", env!("CARGO_PKG_VERSION"));
        tracing::info!("Endpoint: {}", self.endpoint);
        tracing::info!(
            "Sessions: {}, payloads per stream: {}, auto-disconnect: {}",
            self.sessions,
            self.payloads,
            !self.keep_connection
        );
    }

    /// Build a registry configuration for one participant
    pub fn build_config(&self, participant: &str) -> RegistryConfig {
        let mut config = RegistryConfig::new(self.endpoint.clone())
            .auto_disconnect_when_empty(!self.keep_connection)
            .client_name(format!("sessionhub-demo-{}", participant))
            .participant_name(participant)
            .audio_format(self.sample_rate, self.channels);
        if let Some(credential) = &self.credential {
            config = config.credential(credential.clone());
        }
        config
    }

    /// Build the shared in-process transport
    pub fn build_transport(&self) -> LoopbackTransport {
        LoopbackTransport::new().with_connect_latency(Duration::from_millis(self.connect_latency_ms))
    }

    /// Session ids the demo joins
    pub fn session_ids(&self) -> Vec<String> {
        (1..=self.sessions).map(|n| format!("room-{}", n)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct TestArgs {
        #[command(flatten)]
        demo: DemoArgs,
    }

    #[test]
    fn test_default_args() {
        let args = TestArgs::parse_from(["sessionhub"]).demo;

        assert_eq!(args.endpoint, "loopback://local");
        assert_eq!(args.sessions, 3);
        assert_eq!(args.payloads, 10);
        assert!(!args.keep_connection);
        assert!(args.credential.is_none());
        assert_eq!(args.session_ids(), vec!["room-1", "room-2", "room-3"]);
    }

    #[test]
    fn test_build_config() {
        let args = TestArgs::parse_from([
            "sessionhub",
            "--keep-connection",
            "--credential",
            "secret",
            "--sample-rate",
            "16000",
            "--channels",
            "1",
        ])
        .demo;

        let config = args.build_config("alice");
        assert!(!config.auto_disconnect_when_empty);
        assert_eq!(config.connection.credential.as_deref(), Some("secret"));
        assert_eq!(config.connection.client_name, "sessionhub-demo-alice");
        assert_eq!(config.join.participant_name.as_deref(), Some("alice"));
        assert_eq!(config.join.sample_rate, 16000);
        assert_eq!(config.join.channels, 1);
    }
}
