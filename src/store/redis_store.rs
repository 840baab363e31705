//! Redis-backed counter and state storage.
//!
//! Sliding-window counters are sorted sets of request markers scored by
//! timestamp. State tokens are hashes that expire with their TTL and carry a
//! `used` field that is only ever set through `HSETNX`.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisResult, Script};
use tokio::sync::Mutex;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use super::{CounterStore, StateBackend, StateRecord, StoreError};

/// Consume a state hash. Returns nil for missing or already-used tokens,
/// otherwise the stored fields, with `used` set in the same script run.
const TAKE_UNUSED_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return false
end
if redis.call('HSETNX', KEYS[1], 'used', '1') == 0 then
    return false
end
return redis.call('HMGET', KEYS[1], 'subject', 'session_id', 'created_at', 'expires_at')
"#;

/// Connection settings for [`RedisStore`].
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// `redis://[:password@]host[:port][/db]` or `rediss://` for TLS
    pub url: String,
    /// Prefix applied to every key this store touches
    pub key_prefix: String,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "linkguard:".to_string(),
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(2),
        }
    }
}

/// The durable counter store.
///
/// A single multiplexed connection is shared by all callers. It is opened
/// lazily and discarded after a transport failure so the next permitted
/// attempt reconnects from scratch.
pub struct RedisStore {
    client: Client,
    config: RedisStoreConfig,
    connection: Mutex<ConnectionSlot>,
    take_script: Script,
}

#[derive(Default)]
struct ConnectionSlot {
    conn: Option<MultiplexedConnection>,
    /// When the last connect attempt failed, and why
    last_failure: Option<(Instant, String)>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("url", &mask_url(&self.config.url))
            .field("key_prefix", &self.config.key_prefix)
            .finish()
    }
}

impl RedisStore {
    /// Validate the URL and build the store. No connection is made yet.
    pub fn open(config: RedisStoreConfig) -> Result<Self, StoreError> {
        let client = Client::open(config.url.as_str())?;
        info!(url = %mask_url(&config.url), "Redis store configured");

        Ok(Self {
            client,
            config,
            connection: Mutex::new(ConnectionSlot::default()),
            take_script: Script::new(TAKE_UNUSED_SCRIPT),
        })
    }

    /// Key holding the sliding-window markers for a rate key.
    pub fn window_key(&self, rate_key: &str) -> String {
        format!("{}rl:{}", self.config.key_prefix, rate_key)
    }

    /// Key holding a state token record.
    pub fn state_key(&self, token: &str) -> String {
        format!("{}state:{}", self.config.key_prefix, token)
    }

    /// The shared connection, opening it if needed.
    ///
    /// Waiting for the slot and connecting share one `connect_timeout`
    /// deadline. Callers queued behind a connect that fails get that failure
    /// instead of dialling again.
    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        let started = Instant::now();
        let deadline = started + self.config.connect_timeout;

        let mut slot = timeout_at(deadline, self.connection.lock())
            .await
            .map_err(|_| StoreError::Timeout { op: "connect" })?;
        if let Some(conn) = slot.conn.as_ref() {
            return Ok(conn.clone());
        }
        if let Some((failed_at, reason)) = &slot.last_failure {
            if *failed_at >= started {
                return Err(StoreError::ConnectFailed(reason.clone()));
            }
        }

        debug!(url = %mask_url(&self.config.url), "Connecting to Redis");
        let result = match timeout_at(deadline, self.client.get_multiplexed_async_connection()).await
        {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(StoreError::Redis(e)),
            Err(_) => Err(StoreError::Timeout { op: "connect" }),
        };

        match result {
            Ok(conn) => {
                info!(url = %mask_url(&self.config.url), "Connected to Redis");
                *slot = ConnectionSlot {
                    conn: Some(conn.clone()),
                    last_failure: None,
                };
                Ok(conn)
            }
            Err(e) => {
                slot.last_failure = Some((Instant::now(), e.to_string()));
                Err(e)
            }
        }
    }

    /// Run one round trip with the command timeout applied.
    async fn run<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut + Send,
        Fut: Future<Output = RedisResult<T>> + Send,
        T: Send,
    {
        let conn = self.connection().await?;

        let result = match timeout(self.config.command_timeout, f(conn)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(StoreError::Redis(e)),
            Err(_) => Err(StoreError::Timeout { op }),
        };

        if let Err(ref e) = result {
            if is_transport_error(e) {
                warn!(op, error = %e, "Dropping Redis connection after transport failure");
                // Whoever holds the slot finds out on its own round trip.
                if let Ok(mut slot) = self.connection.try_lock() {
                    slot.conn = None;
                }
            }
        }

        result
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn record_hit(
        &self,
        key: &str,
        now_ms: u64,
        window: Duration,
        member: &str,
    ) -> Result<u64, StoreError> {
        let key = self.window_key(key);
        let cutoff = now_ms.saturating_sub(window.as_millis() as u64);
        let expire_secs = window.as_millis().div_ceil(1000).max(1) as u64;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("ZREMRANGEBYSCORE").arg(&key).arg("-inf").arg(format!("({}", cutoff)).ignore()
            .cmd("ZCARD").arg(&key)
            .cmd("ZADD").arg(&key).arg(now_ms).arg(member).ignore()
            .cmd("EXPIRE").arg(&key).arg(expire_secs).ignore();

        let counts: Vec<u64> = self
            .run("record_hit", |mut conn| async move { pipe.query_async(&mut conn).await })
            .await?;

        cardinality_before(&counts)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let reply: String = self
            .run("ping", |mut conn| async move {
                redis::cmd("PING").query_async(&mut conn).await
            })
            .await?;

        if reply == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Malformed(format!("unexpected PING reply: {}", reply)))
        }
    }
}

#[async_trait]
impl StateBackend for RedisStore {
    async fn insert(&self, record: StateRecord, ttl: Duration) -> Result<(), StoreError> {
        let key = self.state_key(&record.token);
        let ttl_ms = ttl.as_millis().max(1) as u64;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("HSET")
            .arg(&key)
            .arg("subject").arg(&record.subject)
            .arg("session_id").arg(&record.session_id)
            .arg("created_at").arg(record.created_at_ms)
            .arg("expires_at").arg(record.expires_at_ms)
            .ignore()
            .cmd("PEXPIRE").arg(&key).arg(ttl_ms).ignore();

        self.run("state_insert", |mut conn| async move { pipe.query_async(&mut conn).await })
            .await
    }

    async fn take_unused(&self, token: &str) -> Result<Option<StateRecord>, StoreError> {
        let key = self.state_key(token);
        let mut invocation = self.take_script.prepare_invoke();
        invocation.key(&key);

        let fields: Option<(String, String, u64, u64)> = self
            .run("state_take", |mut conn| async move {
                invocation.invoke_async(&mut conn).await
            })
            .await?;

        Ok(fields.map(|(subject, session_id, created_at_ms, expires_at_ms)| StateRecord {
            token: token.to_string(),
            subject,
            session_id,
            created_at_ms,
            expires_at_ms,
            used: false,
        }))
    }

    async fn purge_expired(&self, _now_ms: u64) -> Result<usize, StoreError> {
        // State hashes carry a PEXPIRE equal to their TTL.
        Ok(0)
    }
}

/// The `ZCARD` reply is the only non-ignored result of the window pipeline.
fn cardinality_before(replies: &[u64]) -> Result<u64, StoreError> {
    replies.first().copied().ok_or(StoreError::EmptyResponse)
}

fn is_transport_error(error: &StoreError) -> bool {
    match error {
        StoreError::Timeout { .. } | StoreError::ConnectFailed(_) => true,
        StoreError::Redis(e) => {
            e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
        }
        _ => false,
    }
}

/// Mask the credentials part of a Redis URL for logging.
pub(crate) fn mask_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}****{}", &url[..scheme_end + 3], &url[at..])
        }
        _ => url.to_string(),
    }
}
