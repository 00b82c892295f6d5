//! Connection registry
//!
//! In-process map of user id to live connection. At most one connection per user:
//! registering a second one hands the previous connection back to the caller, which
//! closes it after the lock is released.
//!
//! Logins for one user are serialized through [`ConnectionRegistry::login_lock`] so the
//! presence record and the registered connection always name the same session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock};

use chatgate_shared::{GatewayError, GatewayResult};

use super::connection::Connection;

type LoginLocks = Mutex<HashMap<String, Arc<AsyncMutex<()>>>>;

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    logins: LoginLocks,
}

/// Held while one login for `user_id` publishes presence and registers
#[derive(Debug)]
pub struct LoginGuard<'a> {
    logins: &'a LoginLocks,
    user_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for LoginGuard<'_> {
    fn drop(&mut self) {
        let Ok(mut logins) = self.logins.lock() else {
            return;
        };
        // Map entry plus this guard; anything more is a queued login
        if logins
            .get(&self.user_id)
            .is_some_and(|lock| Arc::strong_count(lock) <= 2)
        {
            logins.remove(&self.user_id);
        }
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for any other login of `user_id` on this gateway to finish
    pub async fn login_lock(&self, user_id: &str) -> GatewayResult<LoginGuard<'_>> {
        let lock = {
            let mut logins = self
                .logins
                .lock()
                .map_err(|_| GatewayError::fatal("login lock poisoned"))?;
            logins.entry(user_id.to_string()).or_default().clone()
        };
        let guard = lock.lock_owned().await;
        Ok(LoginGuard {
            logins: &self.logins,
            user_id: user_id.to_string(),
            _guard: guard,
        })
    }

    #[cfg(test)]
    fn pending_logins(&self) -> usize {
        self.logins.lock().map(|logins| logins.len()).unwrap_or(0)
    }

    /// Register `conn` for `user_id`, returning the connection it replaced
    pub async fn register(&self, user_id: &str, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        let mut connections = self.connections.write().await;
        let evicted = connections.insert(user_id.to_string(), Arc::clone(&conn));

        tracing::info!(
            session_id = %conn.session_id,
            user_id = %user_id,
            evicted = evicted.is_some(),
            total_connections = connections.len(),
            "Connection registered"
        );

        evicted
    }

    pub async fn lookup(&self, user_id: &str) -> Option<Arc<Connection>> {
        let connections = self.connections.read().await;
        connections.get(user_id).cloned()
    }

    /// Remove `conn` only if it is still the registered connection for `user_id`.
    /// Returns whether it was removed.
    pub async fn remove(&self, user_id: &str, conn: &Arc<Connection>) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get(user_id) {
            Some(current) if Arc::ptr_eq(current, conn) => {
                connections.remove(user_id);
                tracing::info!(
                    session_id = %conn.session_id,
                    user_id = %user_id,
                    remaining_connections = connections.len(),
                    "Connection removed"
                );
                true
            }
            _ => {
                tracing::debug!(
                    session_id = %conn.session_id,
                    user_id = %user_id,
                    "Skipping removal of superseded connection"
                );
                false
            }
        }
    }

    /// Registered user ids, sorted
    pub async fn user_ids(&self) -> Vec<String> {
        let connections = self.connections.read().await;
        let mut ids: Vec<String> = connections.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}
