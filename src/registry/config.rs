// ABOUTME: Session registry configuration
// ABOUTME: Auto-disconnect policy plus the parameters handed to the transport

use crate::transport::{ConnectionParams, JoinOptions};

/// Registry configuration
#[derive(Clone, Debug, Default)]
pub struct RegistryConfig {
    /// Release the shared connection once the last session is terminated
    pub auto_disconnect_when_empty: bool,
    /// Parameters for establishing the shared connection
    pub connection: ConnectionParams,
    /// Options passed with every session join
    pub join: JoinOptions,
}

impl RegistryConfig {
    /// Create a configuration targeting the given endpoint
    pub fn new(endpoint: impl Into<String>) -> Self {
        let mut config = Self::default();
        config.connection.endpoint = endpoint.into();
        config
    }

    /// Set the auto-disconnect policy
    pub fn auto_disconnect_when_empty(mut self, enabled: bool) -> Self {
        self.auto_disconnect_when_empty = enabled;
        self
    }

    /// Set the access credential
    pub fn credential(mut self, credential: impl Into<String>) -> Self {
        self.connection.credential = Some(credential.into());
        self
    }

    /// Set the client name reported to the service
    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.connection.client_name = name.into();
        self
    }

    /// Set the participant display name used when joining
    pub fn participant_name(mut self, name: impl Into<String>) -> Self {
        self.join.participant_name = Some(name.into());
        self
    }

    /// Set the audio format used when joining
    pub fn audio_format(mut self, sample_rate: u32, channels: u8) -> Self {
        self.join.sample_rate = sample_rate;
        self.join.channels = channels;
        self
    }
}
