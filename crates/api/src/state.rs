//! Application state
//!
//! Built once at startup from the infrastructure adapters and shared by every route,
//! session, and embedded consumer.

use std::sync::Arc;

use crate::auth::{CredentialVerifier, JwtVerifier};
use crate::config::Config;
use crate::pipeline::{
    DispatchConsumer, Ingestor, LogNotifier, PersistenceConsumer, PushConsumer, PushNotifier,
    WebhookNotifier,
};
use crate::presence::PresenceStore;
use crate::queue::{Broker, Publisher};
use crate::signaling::SignalingHub;
use crate::social::{SocialGraph, SocialService};
use crate::store::{MessageStore, OfflineStore, PushLog};
use crate::websocket::{ChatGateway, ConnectionRegistry, SessionSettings};

/// Infrastructure adapters the gateway is assembled from
#[derive(Clone)]
pub struct Infrastructure {
    pub presence: Arc<dyn PresenceStore>,
    pub messages: Arc<dyn MessageStore>,
    pub offline: Arc<dyn OfflineStore>,
    pub push_log: Arc<dyn PushLog>,
    pub social: Arc<dyn SocialGraph>,
    pub broker: Arc<dyn Broker>,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub gateway: Arc<ChatGateway>,
    pub signaling: Arc<SignalingHub>,
    pub verifier: Arc<dyn CredentialVerifier>,
    pub publisher: Publisher,
    pub infra: Infrastructure,
}

impl AppState {
    pub fn new(config: Config, infra: Infrastructure) -> Self {
        let verifier: Arc<dyn CredentialVerifier> = Arc::new(JwtVerifier::new(&config.jwt_secret));
        Self::with_verifier(config, infra, verifier)
    }

    pub fn with_verifier(
        config: Config,
        infra: Infrastructure,
        verifier: Arc<dyn CredentialVerifier>,
    ) -> Self {
        let publisher = Publisher::new(infra.broker.clone(), config.topology.clone());
        let registry = Arc::new(ConnectionRegistry::new());

        let gateway = Arc::new(ChatGateway {
            gateway_id: config.gateway_id.clone(),
            registry: registry.clone(),
            presence: infra.presence.clone(),
            verifier: verifier.clone(),
            offline: infra.offline.clone(),
            ingestor: Arc::new(Ingestor::new(config.node_id, publisher.clone(), registry.clone())),
            social: Arc::new(SocialService::new(infra.social.clone(), registry)),
            settings: SessionSettings::from_config(&config),
        });
        let signaling = Arc::new(SignalingHub::new(config.ice_servers.clone()));

        Self {
            config: Arc::new(config),
            gateway,
            signaling,
            verifier,
            publisher,
            infra,
        }
    }

    /// Consumer for `offline.message`; needs this process's registry
    pub fn dispatch_consumer(&self) -> DispatchConsumer {
        DispatchConsumer::new(
            self.config.gateway_id.clone(),
            self.gateway.registry.clone(),
            self.infra.presence.clone(),
            self.infra.offline.clone(),
            self.publisher.clone(),
            self.config.push_enabled,
        )
    }

    pub fn persistence_consumer(&self) -> PersistenceConsumer {
        PersistenceConsumer::new(self.infra.messages.clone(), self.publisher.clone())
    }

    pub fn push_consumer(&self) -> PushConsumer {
        PushConsumer::new(notifier_for(&self.config), self.infra.push_log.clone())
    }
}

/// Webhook notifier when a URL is configured, otherwise log only
pub fn notifier_for(config: &Config) -> Arc<dyn PushNotifier> {
    match &config.push_webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
        None => Arc::new(LogNotifier),
    }
}
