//! Single-Flight Locks
//!
//! Mutual exclusion keyed by task name, held for the whole read-compute-append
//! sequence of one aggregation run.

use crate::error::StoreError;

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Proof of holding a lock. Hand it back to `release`.
pub struct LockToken {
    pub key: String,
    /// Value written to the remote lock key, used for compare-and-delete.
    pub token: String,
    /// Held for local locks; dropping it unlocks.
    guard: Option<OwnedMutexGuard<()>>,
}

#[async_trait]
pub trait SingleFlight: Send + Sync {
    async fn acquire(&self, key: &str) -> Result<LockToken, StoreError>;
    async fn release(&self, token: LockToken) -> Result<(), StoreError>;
}

/// Lock shared by the workers of one process.
#[derive(Default)]
pub struct LocalSingleFlight {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LocalSingleFlight {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SingleFlight for LocalSingleFlight {
    async fn acquire(&self, key: &str) -> Result<LockToken, StoreError> {
        let lock = self.locks.entry(key.to_string()).or_default().clone();
        let guard = lock.lock_owned().await;
        tracing::trace!("Acquired local lock {}", key);

        Ok(LockToken {
            key: key.to_string(),
            token: String::new(),
            guard: Some(guard),
        })
    }

    async fn release(&self, mut token: LockToken) -> Result<(), StoreError> {
        token.guard.take();
        tracing::trace!("Released local lock {}", token.key);
        Ok(())
    }
}

#[cfg(feature = "redis")]
pub use self::redis_lock::RedisSingleFlight;

#[cfg(feature = "redis")]
mod redis_lock {
    use super::*;
    use ::redis::aio::MultiplexedConnection;
    use ::redis::Script;
    use std::time::Duration;

    /// Deletes the key only if it still holds our token.
    const LUA_RELEASE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

    /// Lock shared by every process connected to the same Redis.
    ///
    /// `SET key token NX PX ttl`; the TTL frees the lock if its holder dies.
    pub struct RedisSingleFlight {
        conn: MultiplexedConnection,
        ttl: Duration,
        wait: Duration,
    }

    impl RedisSingleFlight {
        pub async fn connect(url: &str, ttl: Duration, wait: Duration) -> Result<Self, StoreError> {
            let client = ::redis::Client::open(url)
                .map_err(|e| StoreError::unavailable("redis client", e))?;
            let conn = client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| StoreError::unavailable("redis connect", e))?;
            Ok(Self { conn, ttl, wait })
        }

        fn lock_key(key: &str) -> String {
            format!("orderstats:lock:{}", key)
        }
    }

    #[async_trait]
    impl SingleFlight for RedisSingleFlight {
        async fn acquire(&self, key: &str) -> Result<LockToken, StoreError> {
            let lock_key = Self::lock_key(key);
            let token = uuid::Uuid::new_v4().to_string();
            let started = tokio::time::Instant::now();
            let mut delay_ms = 50u64;

            loop {
                let mut conn = self.conn.clone();
                let acquired: Option<String> = ::redis::cmd("SET")
                    .arg(&lock_key)
                    .arg(&token)
                    .arg("NX")
                    .arg("PX")
                    .arg(self.ttl.as_millis() as u64)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| StoreError::unavailable("redis SET NX", e))?;

                if acquired.is_some() {
                    tracing::debug!("Acquired distributed lock {}", lock_key);
                    return Ok(LockToken {
                        key: key.to_string(),
                        token,
                        guard: None,
                    });
                }

                if started.elapsed() >= self.wait {
                    tracing::warn!("Gave up waiting for lock {} after {:?}", lock_key, self.wait);
                    return Err(StoreError::LockContended {
                        key: key.to_string(),
                    });
                }

                let jitter = rand::random::<u64>() % 50;
                tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                delay_ms = (delay_ms * 2).min(1000);
            }
        }

        async fn release(&self, token: LockToken) -> Result<(), StoreError> {
            let lock_key = Self::lock_key(&token.key);
            let released: i64 = Script::new(LUA_RELEASE)
                .key(&lock_key)
                .arg(&token.token)
                .invoke_async(&mut self.conn.clone())
                .await
                .map_err(|e| StoreError::unavailable("redis release", e))?;

            if released == 0 {
                tracing::warn!("Lock {} expired before release", lock_key);
            }
            Ok(())
        }
    }
}
