use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;

use super::limits::{CounterBackend, CounterError};

const DEFAULT_OP_TIMEOUT: Duration = Duration::from_millis(250);

// INCRBYFLOAT keeps an existing TTL, so the window is only armed on creation.
const INCR_SCRIPT: &str = r#"
local value = redis.call("INCRBYFLOAT", KEYS[1], ARGV[1])
if redis.call("TTL", KEYS[1]) < 0 then
  redis.call("EXPIRE", KEYS[1], tonumber(ARGV[2]))
end
return value
"#;

const DECR_FLOOR_SCRIPT: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 0 then
  return "0"
end
local value = redis.call("INCRBYFLOAT", KEYS[1], ARGV[1])
if tonumber(value) < 0 then
  redis.call("SET", KEYS[1], "0", "KEEPTTL")
  return "0"
end
return value
"#;

/// Redis-backed window counters shared by every gateway process.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    prefix: String,
    op_timeout: Duration,
    connection: Arc<Mutex<Option<MultiplexedConnection>>>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("prefix", &self.prefix)
            .field("op_timeout", &self.op_timeout)
            .finish()
    }
}

impl RedisStore {
    pub fn new(url: impl AsRef<str>) -> Result<Self, redis::RedisError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
            prefix: "gatekeeper".to_string(),
            op_timeout: DEFAULT_OP_TIMEOUT,
            connection: Arc::new(Mutex::new(None)),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn key_window(&self, key: &str) -> String {
        format!("{}:window:{key}", self.prefix)
    }

    async fn connection(&self) -> Result<MultiplexedConnection, redis::RedisError> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Whether a connection is currently cached.
    pub async fn is_connected(&self) -> bool {
        self.connection.lock().await.is_some()
    }

    /// Drops the cached connection. The next operation reconnects.
    pub async fn close(&self) {
        self.connection.lock().await.take();
    }

    async fn run<T, F, Fut>(&self, op: F) -> Result<T, CounterError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = Result<T, redis::RedisError>>,
    {
        let attempt = async {
            let conn = self.connection().await?;
            op(conn).await
        };
        match tokio::time::timeout(self.op_timeout, attempt).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                self.close().await;
                Err(err.into())
            }
            Err(_) => {
                self.close().await;
                Err(CounterError::Timeout(self.op_timeout))
            }
        }
    }

    pub async fn ping(&self) -> Result<(), CounterError> {
        let key = format!("{}:__ping__", self.prefix);
        self.run(|mut conn| async move {
            let _: Option<String> = conn.get(key).await?;
            Ok(())
        })
        .await
    }
}

fn parse_counter(raw: Option<String>) -> f64 {
    raw.and_then(|raw| raw.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .unwrap_or(0.0)
}

#[async_trait]
impl CounterBackend for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<f64, CounterError> {
        let key = self.key_window(key);
        self.run(|mut conn| async move {
            let raw: Option<String> = conn.get(key).await?;
            Ok(parse_counter(raw))
        })
        .await
    }

    async fn ttl(&self, key: &str) -> Result<u64, CounterError> {
        let key = self.key_window(key);
        self.run(|mut conn| async move {
            let ttl: i64 = conn.ttl(key).await?;
            Ok(u64::try_from(ttl).unwrap_or(0))
        })
        .await
    }

    async fn incr(&self, key: &str, amount: f64, window_seconds: u64) -> Result<f64, CounterError> {
        let key = self.key_window(key);
        self.run(|mut conn| async move {
            let raw: Option<String> = redis::Script::new(INCR_SCRIPT)
                .key(key)
                .arg(amount)
                .arg(window_seconds.max(1))
                .invoke_async(&mut conn)
                .await?;
            Ok(parse_counter(raw))
        })
        .await
    }

    async fn decr_floor(&self, key: &str, amount: f64) -> Result<f64, CounterError> {
        let key = self.key_window(key);
        self.run(|mut conn| async move {
            let raw: Option<String> = redis::Script::new(DECR_FLOOR_SCRIPT)
                .key(key)
                .arg(-amount)
                .invoke_async(&mut conn)
                .await?;
            Ok(parse_counter(raw))
        })
        .await
    }
}
