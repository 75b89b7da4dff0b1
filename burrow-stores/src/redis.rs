// Copyright 2025 Burrow Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Redis-backed position store and failure spool.
//!
//! One [`RedisStore`] implements both [`PositionStore`] and [`FailureSpool`]
//! over a shared `deadpool-redis` pool, so several relay instances on
//! different hosts can share positions and a spool.
//!
//! # Key Pattern
//!
//! ```text
//! {prefix}:position:{collection}   BSON-encoded PositionRecord
//! {prefix}:spool                   list of JSON-encoded SpooledMessage, oldest at the head
//! ```
//!
//! The prefix defaults to `burrow`.
//!
//! # Example
//!
//! ```rust,no_run
//! use burrow_stores::redis::{RedisConfig, RedisStore};
//! use burrow_core::state::PositionStore;
//! use bson::doc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RedisConfig::builder()
//!     .url("redis://localhost:6379")
//!     .pool_size(10)
//!     .position_ttl(Duration::from_secs(30 * 24 * 60 * 60))
//!     .build()?;
//!
//! let store = RedisStore::new(config).await?;
//! store.commit("orders", &doc! { "_data": "token" }, None).await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use bson::Document;
use burrow_core::spool::{sort_oldest_first, FailureSpool, SpoolError, SpooledMessage};
use burrow_core::state::{PositionRecord, PositionStore, StateStoreError};
use deadpool_redis::{Config as PoolConfig, Connection, Pool, Runtime};
use redis::{AsyncCommands, RedisError};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Default key prefix.
pub const DEFAULT_KEY_PREFIX: &str = "burrow";

const MAX_RETRIES: u32 = 3;

const BASE_RETRY_DELAY_MS: u64 = 100;

/// Configuration for [`RedisStore`].
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection URL, e.g. `redis://localhost:6379`.
    pub url: String,

    /// Connection pool size (default: 10).
    pub pool_size: usize,

    /// Expiry for position keys, refreshed on every commit. Spooled messages
    /// never expire.
    pub position_ttl: Option<Duration>,

    /// Prefix of every key (default: `burrow`).
    pub key_prefix: String,

    /// Connection timeout (default: 5 seconds).
    pub connection_timeout: Duration,

    /// Retries for transient errors (default: 3).
    pub max_retries: u32,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 10,
            position_ttl: None,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            connection_timeout: Duration::from_secs(5),
            max_retries: MAX_RETRIES,
        }
    }
}

impl RedisConfig {
    /// Creates a new builder.
    #[must_use]
    pub fn builder() -> RedisConfigBuilder {
        RedisConfigBuilder::default()
    }
}

/// Builder for [`RedisConfig`].
#[derive(Debug, Default)]
pub struct RedisConfigBuilder {
    url: Option<String>,
    pool_size: Option<usize>,
    position_ttl: Option<Duration>,
    key_prefix: Option<String>,
    connection_timeout: Option<Duration>,
    max_retries: Option<u32>,
}

impl RedisConfigBuilder {
    /// Sets the Redis connection URL.
    ///
    /// # Formats
    ///
    /// - Standalone: `redis://localhost:6379`
    /// - With auth: `redis://:password@localhost:6379`
    /// - With database: `redis://localhost:6379/0`
    /// - TLS: `rediss://localhost:6380`
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Default: 10
    #[must_use]
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = Some(size);
        self
    }

    /// Expire position keys after `ttl` without a commit.
    #[must_use]
    pub fn position_ttl(mut self, ttl: Duration) -> Self {
        self.position_ttl = Some(ttl);
        self
    }

    /// Default: `burrow`
    #[must_use]
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// Default: 5 seconds
    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = Some(timeout);
        self
    }

    /// Default: 3
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Builds the `RedisConfig`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - URL is not provided
    /// - Pool size is 0
    /// - Key prefix is empty
    pub fn build(self) -> Result<RedisConfig, StateStoreError> {
        let url = self
            .url
            .ok_or_else(|| StateStoreError::Configuration("Redis URL is required".to_string()))?;

        let pool_size = self.pool_size.unwrap_or(10);
        if pool_size == 0 {
            return Err(StateStoreError::Configuration(
                "Pool size must be greater than 0".to_string(),
            ));
        }

        let key_prefix = self
            .key_prefix
            .unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string());
        if key_prefix.is_empty() {
            return Err(StateStoreError::Configuration(
                "Key prefix cannot be empty".to_string(),
            ));
        }

        if self.position_ttl.is_some_and(|ttl| ttl.as_secs() == 0) {
            return Err(StateStoreError::Configuration(
                "Position TTL must be at least one second".to_string(),
            ));
        }

        Ok(RedisConfig {
            url,
            pool_size,
            position_ttl: self.position_ttl,
            key_prefix,
            connection_timeout: self.connection_timeout.unwrap_or(Duration::from_secs(5)),
            max_retries: self.max_retries.unwrap_or(MAX_RETRIES),
        })
    }
}

/// Redis-backed [`PositionStore`] and [`FailureSpool`].
///
/// Cloning shares the connection pool.
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
    config: RedisConfig,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn pool_error(e: &deadpool_redis::PoolError) -> RedisError {
    RedisError::from((
        redis::ErrorKind::IoError,
        "Failed to get connection from pool",
        e.to_string(),
    ))
}

impl RedisStore {
    /// Creates the pool and checks connectivity with `PING`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot be created or Redis does not answer.
    pub async fn new(config: RedisConfig) -> Result<Self, StateStoreError> {
        debug!(url = %config.url, pool_size = config.pool_size, "Initializing Redis store");

        let mut pool_config = PoolConfig::from_url(&config.url);
        if let Some(pool) = pool_config.pool.as_mut() {
            pool.max_size = config.pool_size;
            pool.timeouts.wait = Some(config.connection_timeout);
            pool.timeouts.create = Some(config.connection_timeout);
            pool.timeouts.recycle = Some(config.connection_timeout);
        }

        let pool = pool_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| {
                error!(error = %e, "Failed to create Redis connection pool");
                StateStoreError::Connection(format!("Failed to create pool: {e}"))
            })?;

        let mut conn = pool.get().await.map_err(|e| {
            StateStoreError::Connection(format!("Failed to connect to Redis: {e}"))
        })?;

        redis::cmd("PING")
            .query_async::<()>(&mut *conn)
            .await
            .map_err(|e| {
                StateStoreError::Connection(format!("Redis connection test failed: {e}"))
            })?;

        debug!("Redis store initialized");
        Ok(Self { pool, config })
    }

    fn position_key(&self, collection: &str) -> String {
        format!("{}:position:{}", self.config.key_prefix, collection)
    }

    fn position_pattern(&self) -> String {
        format!("{}:position:*", self.config.key_prefix)
    }

    fn spool_key(&self) -> String {
        format!("{}:spool", self.config.key_prefix)
    }

    async fn connection(&self) -> Result<Connection, RedisError> {
        self.pool.get().await.map_err(|e| pool_error(&e))
    }

    /// Runs `operation`, retrying I/O and response errors with exponential
    /// backoff.
    async fn with_retry<F, T, Fut>(&self, operation: F) -> Result<T, RedisError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, RedisError>>,
    {
        let mut retries = 0;
        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if Self::is_retryable(&e) && retries < self.config.max_retries => {
                    retries += 1;
                    let delay = Duration::from_millis(BASE_RETRY_DELAY_MS * 2_u64.pow(retries - 1));
                    warn!(
                        attempt = retries,
                        max_retries = self.config.max_retries,
                        ?delay,
                        error = %e,
                        "Redis operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(retries, error = %e, "Redis operation failed");
                    return Err(e);
                }
            }
        }
    }

    fn is_retryable(error: &RedisError) -> bool {
        matches!(
            error.kind(),
            redis::ErrorKind::IoError | redis::ErrorKind::ResponseError
        )
    }

    fn encode_position(record: &PositionRecord) -> Result<Vec<u8>, StateStoreError> {
        bson::to_vec(record).map_err(|e| {
            StateStoreError::Serialization(format!("Failed to serialize position: {e}"))
        })
    }

    fn decode_position(bytes: &[u8]) -> Result<PositionRecord, StateStoreError> {
        bson::from_slice(bytes).map_err(|e| {
            StateStoreError::Serialization(format!("Failed to deserialize position: {e}"))
        })
    }

    fn encode_message(message: &SpooledMessage) -> Result<String, SpoolError> {
        serde_json::to_string(message).map_err(|e| SpoolError::Serialization(e.to_string()))
    }

    fn decode_message(raw: &str) -> Result<SpooledMessage, SpoolError> {
        serde_json::from_str(raw).map_err(|e| SpoolError::Serialization(e.to_string()))
    }
}

fn state_error(e: &RedisError) -> StateStoreError {
    StateStoreError::Connection(format!("Redis operation failed: {e}"))
}

fn spool_error(e: &RedisError) -> SpoolError {
    SpoolError::Connection(format!("Redis operation failed: {e}"))
}

#[async_trait]
impl PositionStore for RedisStore {
    async fn load(&self, collection: &str) -> Result<Option<PositionRecord>, StateStoreError> {
        let key = self.position_key(collection);

        let bytes: Option<Vec<u8>> = self
            .with_retry(|| async {
                let mut conn = self.connection().await?;
                conn.get(&key).await
            })
            .await
            .map_err(|e| state_error(&e))?;

        debug!(collection, found = bytes.is_some(), "Loaded position");
        bytes.as_deref().map(Self::decode_position).transpose()
    }

    async fn commit(
        &self,
        collection: &str,
        position: &Document,
        description: Option<Document>,
    ) -> Result<(), StateStoreError> {
        let key = self.position_key(collection);
        let value = Self::encode_position(&PositionRecord::new(
            collection,
            position.clone(),
            description,
        ))?;
        let ttl = self.config.position_ttl;

        self.with_retry::<_, (), _>(|| async {
            let mut conn = self.connection().await?;
            match ttl {
                Some(ttl) => conn.set_ex(&key, &value, ttl.as_secs()).await,
                None => conn.set(&key, &value).await,
            }
        })
        .await
        .map_err(|e| state_error(&e))?;

        debug!(collection, "Committed position");
        Ok(())
    }

    async fn delete(&self, collection: &str) -> Result<(), StateStoreError> {
        let key = self.position_key(collection);

        self.with_retry::<_, (), _>(|| async {
            let mut conn = self.connection().await?;
            conn.del(&key).await
        })
        .await
        .map_err(|e| state_error(&e))?;

        debug!(collection, "Deleted position");
        Ok(())
    }

    async fn list(&self) -> Result<HashMap<String, PositionRecord>, StateStoreError> {
        let pattern = self.position_pattern();

        let keys: Vec<String> = self
            .with_retry(|| async {
                let mut conn = self.connection().await?;
                redis::cmd("KEYS").arg(&pattern).query_async(&mut *conn).await
            })
            .await
            .map_err(|e| state_error(&e))?;

        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let values: Vec<Option<Vec<u8>>> = self
            .with_retry(|| async {
                let mut conn = self.connection().await?;
                redis::cmd("MGET").arg(&keys).query_async(&mut *conn).await
            })
            .await
            .map_err(|e| state_error(&e))?;

        // A key can expire between KEYS and MGET.
        let mut records = HashMap::with_capacity(keys.len());
        for bytes in values.into_iter().flatten() {
            let record = Self::decode_position(&bytes)?;
            records.insert(record.collection.clone(), record);
        }

        debug!(count = records.len(), "Listed positions");
        Ok(records)
    }

    async fn close(&self) -> Result<(), StateStoreError> {
        // The pool closes when the last clone drops; the spool half may
        // still be in use.
        debug!("Closing Redis store");
        Ok(())
    }
}

#[async_trait]
impl FailureSpool for RedisStore {
    async fn append(&self, message: SpooledMessage) -> Result<(), SpoolError> {
        let key = self.spool_key();
        let value = Self::encode_message(&message)?;

        let depth: i64 = self
            .with_retry(|| async {
                let mut conn = self.connection().await?;
                conn.rpush(&key, &value).await
            })
            .await
            .map_err(|e| spool_error(&e))?;

        debug!(destination = %message.target, depth, "Spooled message");
        Ok(())
    }

    async fn drain_all(&self) -> Result<Vec<SpooledMessage>, SpoolError> {
        let key = self.spool_key();

        // Read and delete in one MULTI so appends land wholly before or after.
        // Not retried: a lost reply after EXEC would duplicate the drain.
        let mut conn = self.connection().await.map_err(|e| spool_error(&e))?;
        let (raw, _deleted): (Vec<String>, i64) = redis::pipe()
            .atomic()
            .lrange(&key, 0, -1)
            .del(&key)
            .query_async(&mut *conn)
            .await
            .map_err(|e| spool_error(&e))?;

        let mut drained = Vec::with_capacity(raw.len());
        for entry in &raw {
            match Self::decode_message(entry) {
                Ok(message) => drained.push(message),
                Err(e) => error!(error = %e, entry = %entry, "Dropping undecodable spool entry"),
            }
        }
        sort_oldest_first(&mut drained);

        debug!(count = drained.len(), "Drained spool");
        Ok(drained)
    }

    async fn len(&self) -> Result<usize, SpoolError> {
        let key = self.spool_key();

        let depth: usize = self
            .with_retry(|| async {
                let mut conn = self.connection().await?;
                conn.llen(&key).await
            })
            .await
            .map_err(|e| spool_error(&e))?;
        Ok(depth)
    }
}
