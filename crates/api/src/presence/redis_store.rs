//! Redis-backed presence store

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chatgate_shared::{GatewayError, GatewayResult, PresenceRecord, UnreadCount};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use time::OffsetDateTime;

use super::{online_key, unread_key, PresenceStore};

/// Delete the presence hash only when its session_id still matches
const COMPARE_AND_DELETE: &str = r#"
if redis.call('HGET', KEYS[1], 'session_id') == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Touch last_heartbeat and push the expiry out only when the hash exists, so a late
/// heartbeat cannot resurrect a deleted record as a partial hash
const TOUCH_IF_PRESENT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    redis.call('HSET', KEYS[1], 'last_heartbeat', ARGV[1])
    return redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

/// Floor for the presence hash expiry
pub const MIN_PRESENCE_TTL: Duration = Duration::from_secs(30);

/// Expiry for a presence hash. A socket silent for longer than `read_timeout` is dropped,
/// so three read timeouts without a heartbeat means the owning gateway is gone.
pub fn presence_ttl(read_timeout: Duration) -> Duration {
    read_timeout.saturating_mul(3).max(MIN_PRESENCE_TTL)
}

#[derive(Clone)]
pub struct RedisPresence {
    conn: ConnectionManager,
    ttl_secs: i64,
    compare_and_delete: Script,
    touch_if_present: Script,
}

impl RedisPresence {
    pub async fn connect(redis_url: &str, ttl: Duration) -> GatewayResult<Self> {
        let client = redis::Client::open(redis_url).map_err(GatewayError::transient)?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(GatewayError::transient)?;
        Ok(Self::new(conn, ttl))
    }

    pub fn new(conn: ConnectionManager, ttl: Duration) -> Self {
        Self {
            conn,
            ttl_secs: ttl_secs(ttl),
            compare_and_delete: Script::new(COMPARE_AND_DELETE),
            touch_if_present: Script::new(TOUCH_IF_PRESENT),
        }
    }
}

fn ttl_secs(ttl: Duration) -> i64 {
    i64::try_from(ttl.max(MIN_PRESENCE_TTL).as_secs()).unwrap_or(i64::MAX)
}

fn record_from_hash(user_id: &str, fields: &HashMap<String, String>) -> Option<PresenceRecord> {
    let gateway_id = fields.get("gateway_id")?.clone();
    let parse_i64 = |name: &str| {
        fields
            .get(name)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or_default()
    };
    Some(PresenceRecord {
        user_id: user_id.to_string(),
        gateway_id,
        session_id: fields.get("session_id").cloned().unwrap_or_default(),
        connected_at: parse_i64("connected_at"),
        last_heartbeat: parse_i64("last_heartbeat"),
    })
}

#[async_trait]
impl PresenceStore for RedisPresence {
    async fn set_online(&self, record: &PresenceRecord) -> GatewayResult<()> {
        let mut conn = self.conn.clone();
        let key = online_key(&record.user_id);
        // Replace rather than merge so no field from an older session survives
        let _: () = redis::pipe()
            .atomic()
            .del(&key)
            .hset_multiple(
                &key,
                &[
                    ("gateway_id", record.gateway_id.clone()),
                    ("session_id", record.session_id.clone()),
                    ("connected_at", record.connected_at.to_string()),
                    ("last_heartbeat", record.last_heartbeat.to_string()),
                ],
            )
            .expire(&key, self.ttl_secs)
            .query_async(&mut conn)
            .await
            .map_err(GatewayError::transient)?;
        Ok(())
    }

    async fn get(&self, user_id: &str) -> GatewayResult<Option<PresenceRecord>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(online_key(user_id))
            .await
            .map_err(GatewayError::transient)?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(record_from_hash(user_id, &fields))
    }

    async fn is_online(&self, user_id: &str) -> GatewayResult<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn
            .exists(online_key(user_id))
            .await
            .map_err(GatewayError::transient)?;
        Ok(exists)
    }

    async fn heartbeat(&self, user_id: &str) -> GatewayResult<()> {
        let mut conn = self.conn.clone();
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let _: i64 = self
            .touch_if_present
            .key(online_key(user_id))
            .arg(now)
            .arg(self.ttl_secs)
            .invoke_async(&mut conn)
            .await
            .map_err(GatewayError::transient)?;
        Ok(())
    }

    async fn set_offline(&self, user_id: &str, session_id: &str) -> GatewayResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .compare_and_delete
            .key(online_key(user_id))
            .arg(session_id)
            .invoke_async(&mut conn)
            .await
            .map_err(GatewayError::transient)?;
        Ok(removed > 0)
    }

    async fn incr_unread(&self, user_id: &str, conversation_id: &str) -> GatewayResult<i64> {
        let mut conn = self.conn.clone();
        let count: i64 = conn
            .hincr(unread_key(user_id), conversation_id, 1)
            .await
            .map_err(GatewayError::transient)?;
        Ok(count)
    }

    async fn clear_unread(&self, user_id: &str, conversation_id: &str) -> GatewayResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .hdel(unread_key(user_id), conversation_id)
            .await
            .map_err(GatewayError::transient)?;
        Ok(())
    }

    async fn unread_counts(&self, user_id: &str) -> GatewayResult<Vec<UnreadCount>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, i64> = conn
            .hgetall(unread_key(user_id))
            .await
            .map_err(GatewayError::transient)?;
        let mut counts: Vec<UnreadCount> = fields
            .into_iter()
            .filter(|(_, count)| *count > 0)
            .map(|(conversation_id, count)| UnreadCount {
                conversation_id,
                count,
            })
            .collect();
        counts.sort_by(|a, b| a.conversation_id.cmp(&b.conversation_id));
        Ok(counts)
    }

    async fn ping(&self) -> GatewayResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(GatewayError::transient)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_from_hash() {
        let mut fields = HashMap::new();
        fields.insert("gateway_id".to_string(), "gw-1".to_string());
        fields.insert("session_id".to_string(), "s-1".to_string());
        fields.insert("connected_at".to_string(), "100".to_string());
        fields.insert("last_heartbeat".to_string(), "150".to_string());

        let record = record_from_hash("alice", &fields).unwrap();
        assert_eq!(record.gateway_id, "gw-1");
        assert_eq!(record.session_id, "s-1");
        assert_eq!(record.connected_at, 100);
        assert_eq!(record.last_heartbeat, 150);
    }

    #[test]
    fn test_hash_without_gateway_is_not_a_record() {
        let mut fields = HashMap::new();
        fields.insert("last_heartbeat".to_string(), "150".to_string());
        assert!(record_from_hash("alice", &fields).is_none());
    }

    #[test]
    fn test_presence_ttl_outlives_read_timeout() {
        assert_eq!(presence_ttl(Duration::from_secs(60)), Duration::from_secs(180));
        assert_eq!(presence_ttl(Duration::from_secs(1)), MIN_PRESENCE_TTL);
        assert_eq!(presence_ttl(Duration::MAX), Duration::MAX);
        assert_eq!(ttl_secs(Duration::from_secs(180)), 180);
        assert_eq!(ttl_secs(Duration::ZERO), 30);
        assert_eq!(ttl_secs(Duration::MAX), i64::MAX);
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_compare_and_delete() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
        let presence = RedisPresence::connect(&url, Duration::from_secs(60)).await.unwrap();

        let record = PresenceRecord::new("presence-test-user", "gw-1", "session-new");
        presence.set_online(&record).await.unwrap();

        assert!(!presence.set_offline("presence-test-user", "session-old").await.unwrap());
        assert!(presence.is_online("presence-test-user").await.unwrap());
        assert!(presence.set_offline("presence-test-user", "session-new").await.unwrap());
        assert!(!presence.is_online("presence-test-user").await.unwrap());
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_presence_expires_without_heartbeat() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
        let presence = RedisPresence::connect(&url, Duration::from_secs(60)).await.unwrap();
        let mut conn = presence.conn.clone();
        let key = online_key("presence-ttl-user");

        let record = PresenceRecord::new("presence-ttl-user", "gw-1", "session-1");
        presence.set_online(&record).await.unwrap();
        let ttl: i64 = conn.ttl(&key).await.unwrap();
        assert!(ttl > 0 && ttl <= 60);

        let _: () = conn.expire(&key, 5).await.unwrap();
        presence.heartbeat("presence-ttl-user").await.unwrap();
        let ttl: i64 = conn.ttl(&key).await.unwrap();
        assert!(ttl > 5);

        assert!(presence.set_offline("presence-ttl-user", "session-1").await.unwrap());
    }
}
