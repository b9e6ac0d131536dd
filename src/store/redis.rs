//! Redis binding for [`BatchStore`].

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Value};
use tracing::{debug, error};

use super::{BatchStore, KvOp, KvReply};
use crate::error::{QuotaError, Result};

/// Runs batches as `MULTI`/`EXEC` transactions on a Redis connection.
#[derive(Clone)]
pub struct RedisStore {
    connection_manager: ConnectionManager,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Wrap an existing connection manager.
    pub fn new(connection_manager: ConnectionManager) -> Self {
        Self { connection_manager }
    }

    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let connection_manager = client.get_connection_manager().await?;
        debug!("Connected to Redis");
        Ok(Self::new(connection_manager))
    }

    fn reply(value: Value) -> Result<KvReply> {
        match value {
            Value::Nil => Ok(KvReply::Nil),
            Value::Okay => Ok(KvReply::Ok),
            Value::Int(value) => Ok(KvReply::Integer(value)),
            Value::SimpleString(status) if status == "OK" => Ok(KvReply::Ok),
            Value::BulkString(bytes) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .map(KvReply::Integer)
                .ok_or_else(|| {
                    QuotaError::Backend(format!(
                        "non-integer value: {}",
                        String::from_utf8_lossy(&bytes)
                    ))
                }),
            other => Err(QuotaError::Backend(format!(
                "unexpected Redis reply: {:?}",
                other
            ))),
        }
    }
}

#[async_trait]
impl BatchStore for RedisStore {
    async fn exec(&self, ops: Vec<KvOp>) -> Result<Vec<KvReply>> {
        let mut pipe = redis::pipe();
        pipe.atomic();

        for op in &ops {
            match op {
                KvOp::SetIfAbsent { key, value, ttl_ms } => {
                    pipe.cmd("SET")
                        .arg(key)
                        .arg(*value)
                        .arg("PX")
                        .arg(*ttl_ms)
                        .arg("NX");
                }
                KvOp::IncrBy { key, delta } => {
                    pipe.cmd("INCRBY").arg(key).arg(*delta);
                }
                KvOp::Del { key } => {
                    pipe.cmd("DEL").arg(key);
                }
                KvOp::Get { key } => {
                    pipe.cmd("GET").arg(key);
                }
            }
        }

        let mut connection_manager = self.connection_manager.clone();
        let values: Vec<Value> = pipe.query_async(&mut connection_manager).await.map_err(|e| {
            error!(error = %e, commands = ops.len(), "Redis transaction failed");
            QuotaError::from(e)
        })?;

        values.into_iter().map(Self::reply).collect()
    }
}
