//! Redis Broker
//!
//! Reliable-queue pattern on Redis lists.
//!
//! | Key | Type | Purpose |
//! |-----|------|---------|
//! | `{prefix}:queue:{name}` | List | Messages waiting for a worker (`LPUSH` in, popped from the right) |
//! | `{prefix}:processing:{name}` | List | Messages handed to a worker and not yet acked |
//! | `{prefix}:inflight:{name}` | Sorted Set | Visibility deadline (epoch ms) per in-flight message |
//!
//! The receipt of a delivery is the raw envelope JSON, which is also the member
//! stored in the processing list and the deadline set.
//!
//! `BLMOVE` and the deadline `ZADD` are two round-trips. A member of the
//! processing list without a deadline is given one by the reaper, so a worker
//! dying between the two calls delays the message instead of losing it.

use super::types::*;

use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncConnectionConfig, Script};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::Mutex;

/// Seconds a single `BLMOVE` waits before the receive loop re-issues it.
const BLOCK_SECS: f64 = 1.0;

/// Extends a deadline only if the member is still in flight.
///
/// KEYS[1] = deadline set. ARGV[1] = new deadline, ARGV[2] = receipt.
/// Returns 1 if extended, 0 if the message was acked or requeued meanwhile.
const LUA_EXTEND: &str = r#"
if redis.call('ZSCORE', KEYS[1], ARGV[2]) then
    redis.call('ZADD', KEYS[1], ARGV[1], ARGV[2])
    return 1
end
return 0
"#;

/// Claims every expired in-flight member by removing it from the deadline set.
///
/// KEYS[1] = deadline set, KEYS[2] = processing list.
/// ARGV[1] = now (epoch ms), ARGV[2] = deadline for members found without one.
/// Returns the claimed receipts.
const LUA_CLAIM_EXPIRED: &str = r#"
for _, raw in ipairs(redis.call('LRANGE', KEYS[2], 0, -1)) do
    if not redis.call('ZSCORE', KEYS[1], raw) then
        redis.call('ZADD', KEYS[1], ARGV[2], raw)
    end
end
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, raw in ipairs(expired) do
    redis.call('ZREM', KEYS[1], raw)
end
return expired
"#;

pub struct RedisBroker {
    client: ::redis::Client,
    conn: MultiplexedConnection,
    /// Idle connections for `BLMOVE`. A blocked command stalls every other
    /// command on its connection, so each concurrent receive holds one.
    blocking: Mutex<Vec<MultiplexedConnection>>,
    queue_key: String,
    processing_key: String,
    inflight_key: String,
    visibility_timeout: Duration,
}

impl RedisBroker {
    /// Connects to `redis://[:<password>@]<host>:<port>[/<db>]`.
    pub async fn connect(
        url: &str,
        queue: &str,
        visibility_timeout: Duration,
    ) -> Result<Self, BrokerError> {
        let client = ::redis::Client::open(url).map_err(map_redis_error)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)?;

        tracing::info!("Connected to Redis broker, queue '{}'", queue);

        Ok(Self {
            client,
            conn,
            blocking: Mutex::new(Vec::new()),
            queue_key: format!("orderstats:queue:{}", queue),
            processing_key: format!("orderstats:processing:{}", queue),
            inflight_key: format!("orderstats:inflight:{}", queue),
            visibility_timeout,
        })
    }

    /// Checks out a connection for a blocking receive, opening one if none is idle.
    async fn blocking_connection(&self) -> Result<MultiplexedConnection, BrokerError> {
        if let Some(conn) = self.blocking.lock().await.pop() {
            return Ok(conn);
        }

        // The default response timeout is shorter than the block time.
        let config = AsyncConnectionConfig::new().set_response_timeout(None);
        self.client
            .get_multiplexed_async_connection_with_config(&config)
            .await
            .map_err(map_redis_error)
    }

    /// Blocks until a message moves from the queue into the processing list.
    async fn move_to_processing(&self) -> Result<String, BrokerError> {
        let mut blocking = self.blocking_connection().await?;

        loop {
            let raw: Option<String> = ::redis::cmd("BLMOVE")
                .arg(&self.queue_key)
                .arg(&self.processing_key)
                .arg("RIGHT")
                .arg("LEFT")
                .arg(BLOCK_SECS)
                .query_async(&mut blocking)
                .await
                .map_err(map_redis_error)?;

            if let Some(raw) = raw {
                // Only a connection whose reply was read goes back to the pool.
                self.blocking.lock().await.push(blocking);
                return Ok(raw);
            }
        }
    }

    fn deadline_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis() + self.visibility_timeout.as_millis() as i64
    }
}

fn map_redis_error(err: ::redis::RedisError) -> BrokerError {
    BrokerError::Unavailable(format!("redis: {}", err))
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, message: TaskMessage) -> Result<(), BrokerError> {
        let raw = serde_json::to_string(&Envelope::first(message))?;
        let mut conn = self.conn.clone();

        let _: i64 = ::redis::cmd("LPUSH")
            .arg(&self.queue_key)
            .arg(&raw)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        Ok(())
    }

    async fn receive(&self) -> Result<Delivery, BrokerError> {
        loop {
            let raw = self.move_to_processing().await?;

            let mut conn = self.conn.clone();
            let _: i64 = ::redis::cmd("ZADD")
                .arg(&self.inflight_key)
                .arg(self.deadline_ms())
                .arg(&raw)
                .query_async(&mut conn)
                .await
                .map_err(map_redis_error)?;

            match serde_json::from_str::<Envelope>(&raw) {
                Ok(envelope) => {
                    return Ok(Delivery {
                        message: envelope.message,
                        receipt: raw,
                        attempt: envelope.attempt,
                    });
                }
                Err(e) => {
                    tracing::error!("Dropping undecodable message from queue: {}", e);
                    let _: () = ::redis::pipe()
                        .atomic()
                        .cmd("LREM")
                        .arg(&self.processing_key)
                        .arg(1)
                        .arg(&raw)
                        .ignore()
                        .cmd("ZREM")
                        .arg(&self.inflight_key)
                        .arg(&raw)
                        .ignore()
                        .query_async(&mut conn)
                        .await
                        .map_err(map_redis_error)?;
                }
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: () = ::redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(&self.processing_key)
            .arg(1)
            .arg(&delivery.receipt)
            .ignore()
            .cmd("ZREM")
            .arg(&self.inflight_key)
            .arg(&delivery.receipt)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn extend(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let extended: i64 = Script::new(LUA_EXTEND)
            .key(&self.inflight_key)
            .arg(self.deadline_ms())
            .arg(&delivery.receipt)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(map_redis_error)?;

        if extended == 1 {
            Ok(())
        } else {
            Err(BrokerError::UnknownDelivery(delivery.message.id.to_string()))
        }
    }

    async fn requeue_expired(&self) -> Result<usize, BrokerError> {
        let mut conn = self.conn.clone();
        let claimed: Vec<String> = Script::new(LUA_CLAIM_EXPIRED)
            .key(&self.inflight_key)
            .key(&self.processing_key)
            .arg(chrono::Utc::now().timestamp_millis())
            .arg(self.deadline_ms())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        let mut requeued = 0;
        for raw in claimed {
            let mut pipe = ::redis::pipe();
            pipe.atomic()
                .cmd("LREM")
                .arg(&self.processing_key)
                .arg(1)
                .arg(&raw)
                .ignore();

            match serde_json::from_str::<Envelope>(&raw) {
                Ok(envelope) => {
                    let next = envelope.redelivery();
                    tracing::warn!(
                        "Task {} missed its visibility deadline, redelivering (attempt {})",
                        next.message.id,
                        next.attempt
                    );
                    // RPUSH puts it at the consuming end of the list.
                    pipe.cmd("RPUSH")
                        .arg(&self.queue_key)
                        .arg(serde_json::to_string(&next)?)
                        .ignore();
                    requeued += 1;
                }
                Err(e) => {
                    tracing::error!("Discarding undecodable in-flight message: {}", e);
                }
            }

            let _: () = pipe.query_async(&mut conn).await.map_err(map_redis_error)?;
        }

        Ok(requeued)
    }

    fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }
}
