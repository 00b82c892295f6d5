//! Chat gateway state
//!
//! Everything a chat session needs, shared by all sessions of this process.

use std::sync::Arc;
use std::time::Duration;

use crate::auth::CredentialVerifier;
use crate::config::Config;
use crate::pipeline::Ingestor;
use crate::presence::PresenceStore;
use crate::social::SocialService;
use crate::store::OfflineStore;

use super::registry::ConnectionRegistry;

/// Per-connection timing and buffering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// Time a new connection has to log in
    pub handshake_timeout: Duration,
    /// Silence after which an authenticated connection is dropped
    pub read_timeout: Duration,
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    pub outbound_buffer: usize,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            handshake_timeout: config.handshake_timeout,
            read_timeout: config.read_timeout,
            ping_interval: config.ping_interval,
            write_timeout: config.write_timeout,
            outbound_buffer: config.outbound_buffer,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            ping_interval: Duration::from_secs(54),
            write_timeout: Duration::from_secs(10),
            outbound_buffer: 256,
        }
    }
}

pub struct ChatGateway {
    /// Identifies this process in presence records
    pub gateway_id: String,
    pub registry: Arc<ConnectionRegistry>,
    pub presence: Arc<dyn PresenceStore>,
    pub verifier: Arc<dyn CredentialVerifier>,
    pub offline: Arc<dyn OfflineStore>,
    pub ingestor: Arc<Ingestor>,
    pub social: Arc<SocialService>,
    pub settings: SessionSettings,
}
