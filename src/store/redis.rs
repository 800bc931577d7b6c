//! Redis-backed bucket counters and baseline cache.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;

use super::{BaselineSource, CounterStore};
use crate::errors::StoreError;
use crate::services::anomaly::behavioral::BehavioralBaseline;

/// Cache key holding the serialized behavioral baseline.
pub const BASELINE_KEY: &str = "security:baseline";

#[derive(Clone)]
pub struct RedisCounterStore {
    conn: MultiplexedConnection,
}

impl RedisCounterStore {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, ttl_secs: u64) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let (count,): (u64,) = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(key)
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn get(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<u64> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value.unwrap_or(0))
    }

    async fn set(&self, key: &str, value: u64, ttl_secs: u64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct RedisBaselineSource {
    conn: MultiplexedConnection,
}

impl RedisBaselineSource {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl BaselineSource for RedisBaselineSource {
    async fn load(&self) -> Result<Option<BehavioralBaseline>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(BASELINE_KEY)
            .query_async(&mut conn)
            .await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, baseline: &BehavioralBaseline) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(baseline)?;
        let _: () = redis::cmd("SET")
            .arg(BASELINE_KEY)
            .arg(json)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}
