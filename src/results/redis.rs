//! Redis Result Store
//!
//! One hash per task at `{prefix}:result:{task_id}`:
//!
//! | Field | Description |
//! |-------|-------------|
//! | `rank` | Lifecycle rank of the stored state (0 pending, 1 started, 2 terminal) |
//! | `attempts` | Number of `STARTED` writes |
//! | `data` | `TaskRecord` JSON (its `attempts` field is overridden by the hash field) |
//!
//! The transition rule is evaluated inside a Lua script so concurrent workers
//! see a single atomic check-and-set.

use super::types::*;
use crate::error::StoreError;
use crate::executor::types::TaskId;

use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, Script};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;

/// Conditional write of a task state.
///
/// KEYS[1] = result hash. ARGV[1] = next rank, ARGV[2] = record JSON,
/// ARGV[3] = ttl seconds (0 keeps the key forever).
/// Returns 1 if written, 0 if the stored state refused the transition.
const LUA_TRANSITION: &str = r#"
local current = redis.call('HGET', KEYS[1], 'rank')
local next_rank = tonumber(ARGV[1])
if current then
    local rank = tonumber(current)
    if rank >= 2 then return 0 end
    if next_rank < rank then return 0 end
    if next_rank == rank and rank ~= 1 then return 0 end
end

local attempts = tonumber(redis.call('HGET', KEYS[1], 'attempts') or '0')
if next_rank == 1 then attempts = attempts + 1 end

redis.call('HSET', KEYS[1], 'rank', ARGV[1], 'attempts', tostring(attempts), 'data', ARGV[2])
local ttl = tonumber(ARGV[3])
if ttl > 0 then
    redis.call('EXPIRE', KEYS[1], ttl)
end
return 1
"#;

#[derive(Clone)]
pub struct RedisResultStore {
    conn: MultiplexedConnection,
    key_prefix: String,
    ttl: Duration,
}

impl RedisResultStore {
    pub async fn connect(url: &str, ttl: Duration) -> Result<Self, StoreError> {
        let client =
            ::redis::Client::open(url).map_err(|e| StoreError::unavailable("redis client", e))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::unavailable("redis connect", e))?;

        tracing::info!("Connected to Redis result store");

        Ok(Self {
            conn,
            key_prefix: "orderstats".to_string(),
            ttl,
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn result_key(&self, task_id: &TaskId) -> String {
        format!("{}:result:{}", self.key_prefix, task_id.0)
    }
}

#[async_trait]
impl ResultStore for RedisResultStore {
    async fn get(&self, task_id: &TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let key = self.result_key(task_id);
        let mut conn = self.conn.clone();

        let fields: HashMap<String, String> = conn
            .hgetall(&key)
            .await
            .map_err(|e| StoreError::unavailable("redis HGETALL", e))?;

        if fields.is_empty() {
            return Ok(None);
        }

        let data = fields.get("data").ok_or_else(|| StoreError::Corrupt {
            key: key.clone(),
            reason: "missing data field".to_string(),
        })?;
        let mut record: TaskRecord =
            serde_json::from_str(data).map_err(|e| StoreError::Corrupt {
                key: key.clone(),
                reason: e.to_string(),
            })?;
        record.attempts = fields
            .get("attempts")
            .and_then(|a| a.parse().ok())
            .unwrap_or(record.attempts);

        Ok(Some(record))
    }

    async fn transition(
        &self,
        task_id: &TaskId,
        name: &str,
        next: TaskState,
    ) -> Result<bool, StoreError> {
        let key = self.result_key(task_id);
        let rank = next.rank();
        let record = TaskRecord {
            task_id: task_id.clone(),
            name: name.to_string(),
            state: next,
            attempts: 0,
            updated_at: Utc::now(),
        };
        let data = serde_json::to_string(&record).map_err(|e| StoreError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;

        let written: i64 = Script::new(LUA_TRANSITION)
            .key(&key)
            .arg(rank)
            .arg(data)
            .arg(self.ttl.as_secs())
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| StoreError::unavailable("redis transition", e))?;

        Ok(written == 1)
    }
}
