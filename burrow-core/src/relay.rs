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

//! Relay orchestration.
//!
//! A [`Relay`] runs one [`ChangeFeedWatcher`] per watched collection and one
//! broker health supervisor, all sharing a single broker connection, position
//! store and failure spool.
//!
//! # Example
//!
//! ```rust,no_run
//! use burrow_core::destination::Destination;
//! use burrow_core::relay::{Relay, RelayConfig};
//! # use burrow_core::broker::MockBroker;
//! # use burrow_core::state::PositionStore;
//! # use burrow_core::spool::FailureSpool;
//! # use std::sync::Arc;
//!
//! # async fn example(
//! #     positions: Arc<dyn PositionStore>,
//! #     spool: Arc<dyn FailureSpool>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let config = RelayConfig::builder()
//!     .connection_string("mongodb://localhost:27017/shop?replicaSet=rs0")
//!     .collection("orders")
//!     .destination(Destination::queue("orders.audit"))
//!     .build()?;
//!
//! let mut relay = Relay::new(config, Arc::new(MockBroker::new()), positions, spool)?;
//! relay.start().await?;
//!
//! tokio::signal::ctrl_c().await?;
//! relay.stop().await?;
//! # Ok(())
//! # }
//! ```

use crate::broker::{Broker, BrokerError};
use crate::delivery::{DeliveryOptions, DeliveryPipeline, PipelineError, DEFAULT_PUBLISH_TIMEOUT};
use crate::destination::Destination;
use crate::metrics;
use crate::spool::FailureSpool;
use crate::state::PositionStore;
use crate::stream::{ChangeFeed, ChangeStreamConfig, MongoChangeFeed};
use crate::topology::{BrokerTopologyManager, DEFAULT_HEALTH_CHECK_INTERVAL};
use crate::watcher::{ChangeFeedWatcher, WatcherHandle};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Runtime options shared by every watch.
///
/// Deserializable so binaries can load it from a file:
///
/// ```rust
/// use burrow_core::relay::RelayOptions;
///
/// let options: RelayOptions = serde_json::from_str(
///     r#"{ "silent": true, "healthCheckIntervalMs": 5000 }"#,
/// ).unwrap();
/// assert!(options.silent);
/// assert!(options.structured_formatting);
/// assert_eq!(options.health_check_interval.as_secs(), 5);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RelayOptions {
    /// Quiet lifecycle logging.
    pub silent: bool,

    /// Normalize events and run transforms. When off, raw events are
    /// published as JSON.
    pub structured_formatting: bool,

    /// Interval between broker health checks.
    #[serde(rename = "healthCheckIntervalMs", with = "duration_ms")]
    pub health_check_interval: Duration,

    /// Bound on one publish, including confirmation.
    #[serde(rename = "publishTimeoutMs", with = "duration_ms")]
    pub publish_timeout: Duration,

    /// Extra attempts at the initial broker connection in
    /// [`Relay::start`], spaced by the stream backoff. `None` tries once.
    pub max_connect_retries: Option<u32>,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            silent: false,
            structured_formatting: true,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            max_connect_retries: None,
        }
    }
}

impl From<RelayOptions> for DeliveryOptions {
    fn from(options: RelayOptions) -> Self {
        Self {
            structured_formatting: options.structured_formatting,
            publish_timeout: options.publish_timeout,
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Everything a relay needs to run.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Watched collections, one watcher each.
    pub collections: Vec<String>,

    /// Database connection string.
    pub connection_string: String,

    /// Database name; defaults to the connection string's database.
    pub database: Option<String>,

    /// Where every event goes.
    pub destinations: Vec<Destination>,

    /// Runtime options.
    pub options: RelayOptions,

    /// Change stream options and reconnect backoff.
    pub stream_config: ChangeStreamConfig,
}

impl RelayConfig {
    /// Starts a builder.
    #[must_use]
    pub fn builder() -> RelayConfigBuilder {
        RelayConfigBuilder::default()
    }

    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Configuration`] describing the first problem.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.collections.is_empty() {
            return Err(RelayError::Configuration(
                "at least one collection is required".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for collection in &self.collections {
            if collection.is_empty() {
                return Err(RelayError::Configuration(
                    "collection names cannot be empty".to_string(),
                ));
            }
            if !seen.insert(collection.as_str()) {
                return Err(RelayError::Configuration(format!(
                    "collection {collection} is watched twice"
                )));
            }
        }

        if self.connection_string.is_empty() {
            return Err(RelayError::Configuration(
                "connection_string is required".to_string(),
            ));
        }

        if self.destinations.is_empty() {
            return Err(RelayError::Configuration(
                "at least one destination is required".to_string(),
            ));
        }

        if self.options.health_check_interval.is_zero() {
            return Err(RelayError::Configuration(
                "health_check_interval must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder for [`RelayConfig`].
#[derive(Debug, Default)]
pub struct RelayConfigBuilder {
    collections: Vec<String>,
    connection_string: Option<String>,
    database: Option<String>,
    destinations: Vec<Destination>,
    options: RelayOptions,
    stream_config: Option<ChangeStreamConfig>,
}

impl RelayConfigBuilder {
    /// Adds a watched collection.
    #[must_use]
    pub fn collection(mut self, name: impl Into<String>) -> Self {
        self.collections.push(name.into());
        self
    }

    /// Replaces the watched collections.
    #[must_use]
    pub fn collections(mut self, names: Vec<String>) -> Self {
        self.collections = names;
        self
    }

    /// Database connection string.
    #[must_use]
    pub fn connection_string(mut self, uri: impl Into<String>) -> Self {
        self.connection_string = Some(uri.into());
        self
    }

    /// Overrides the connection string's database.
    #[must_use]
    pub fn database(mut self, name: impl Into<String>) -> Self {
        self.database = Some(name.into());
        self
    }

    /// Adds a destination.
    #[must_use]
    pub fn destination(mut self, destination: Destination) -> Self {
        self.destinations.push(destination);
        self
    }

    /// Replaces the destinations.
    #[must_use]
    pub fn destinations(mut self, destinations: Vec<Destination>) -> Self {
        self.destinations = destinations;
        self
    }

    /// Runtime options.
    #[must_use]
    pub fn options(mut self, options: RelayOptions) -> Self {
        self.options = options;
        self
    }

    /// Default: 30s
    #[must_use]
    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.options.health_check_interval = interval;
        self
    }

    /// Default: 30s
    #[must_use]
    pub fn publish_timeout(mut self, timeout: Duration) -> Self {
        self.options.publish_timeout = timeout;
        self
    }

    /// Retries of the initial broker connection. Default: none
    #[must_use]
    pub fn max_connect_retries(mut self, retries: u32) -> Self {
        self.options.max_connect_retries = Some(retries);
        self
    }

    /// Change stream options.
    #[must_use]
    pub fn stream_config(mut self, config: ChangeStreamConfig) -> Self {
        self.stream_config = Some(config);
        self
    }

    /// Builds and validates.
    ///
    /// # Errors
    ///
    /// See [`RelayConfig::validate`].
    pub fn build(self) -> Result<RelayConfig, RelayError> {
        let config = RelayConfig {
            collections: self.collections,
            connection_string: self.connection_string.unwrap_or_default(),
            database: self.database,
            destinations: self.destinations,
            options: self.options,
            stream_config: self.stream_config.unwrap_or_default(),
        };

        config.validate()?;
        Ok(config)
    }
}

/// Relay errors.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Relay is already running
    #[error("Relay is already running")]
    AlreadyRunning,

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Initial broker setup failed
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
}

impl From<PipelineError> for RelayError {
    fn from(err: PipelineError) -> Self {
        Self::Configuration(err.to_string())
    }
}

/// Runs watchers and the health supervisor.
pub struct Relay {
    config: RelayConfig,
    pipeline: DeliveryPipeline,
    topology: Arc<BrokerTopologyManager>,
    positions: Arc<dyn PositionStore>,
    feeds: Vec<Arc<dyn ChangeFeed>>,
    handles: Vec<WatcherHandle>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("collections", &self.config.collections)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Relay {
    /// Creates a relay watching `MongoDB` change streams.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Configuration`] if the destinations are invalid
    /// for the options (duplicate names, transforms without structured
    /// formatting, zero publish timeout).
    pub fn new(
        config: RelayConfig,
        broker: Arc<dyn Broker>,
        positions: Arc<dyn PositionStore>,
        spool: Arc<dyn FailureSpool>,
    ) -> Result<Self, RelayError> {
        let connection_string = config.connection_string.clone();
        let database = config.database.clone();
        let stream_config = config.stream_config.clone();

        Self::with_feeds(config, broker, positions, spool, |collection| -> Arc<dyn ChangeFeed> {
            Arc::new(MongoChangeFeed::new(
                connection_string.clone(),
                database.clone(),
                collection,
                stream_config.clone(),
            ))
        })
    }

    /// Creates a relay with custom change feeds, one per configured
    /// collection.
    ///
    /// # Errors
    ///
    /// See [`Relay::new`].
    pub fn with_feeds<F>(
        config: RelayConfig,
        broker: Arc<dyn Broker>,
        positions: Arc<dyn PositionStore>,
        spool: Arc<dyn FailureSpool>,
        make_feed: F,
    ) -> Result<Self, RelayError>
    where
        F: Fn(&str) -> Arc<dyn ChangeFeed>,
    {
        config.validate()?;

        let pipeline = DeliveryPipeline::new(
            config.destinations.clone(),
            config.options.into(),
            Arc::clone(&broker),
            spool,
        )?;
        let topology = Arc::new(BrokerTopologyManager::new(
            broker,
            config.options.health_check_interval,
        ));
        let feeds = config.collections.iter().map(|c| make_feed(c)).collect();

        Ok(Self {
            config,
            pipeline,
            topology,
            positions,
            feeds,
            handles: Vec::new(),
            shutdown_tx: None,
            tasks: Vec::new(),
        })
    }

    /// Declares the broker topology, then spawns the watchers and the health
    /// supervisor.
    ///
    /// # Errors
    ///
    /// Returns an error if the relay is already running or if the initial
    /// broker connection or declarations still fail after
    /// `max_connect_retries`. Later connectivity faults are retried in the
    /// background.
    #[instrument(skip(self), fields(collections = ?self.config.collections))]
    pub async fn start(&mut self) -> Result<(), RelayError> {
        if self.is_running() {
            return Err(RelayError::AlreadyRunning);
        }

        self.connect_broker().await?;

        if !self.config.options.silent {
            for destination in &self.config.destinations {
                info!(destination = %destination.target(), "Destination ready");
            }
        }

        let (shutdown_tx, _) = broadcast::channel(1);

        self.handles.clear();
        for feed in &self.feeds {
            let watcher = ChangeFeedWatcher::new(
                Arc::clone(feed),
                Arc::clone(&self.positions),
                self.pipeline.clone(),
                self.config.stream_config.clone(),
            );
            self.handles.push(watcher.handle());
            self.tasks.push(tokio::spawn(watcher.run(shutdown_tx.subscribe())));
        }

        let topology = Arc::clone(&self.topology);
        let handles = self.handles.clone();
        let pipeline = self.pipeline.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        self.tasks.push(tokio::spawn(async move {
            topology.supervise_health(handles, pipeline, shutdown_rx).await;
        }));

        self.shutdown_tx = Some(shutdown_tx);
        metrics::set_active_watchers(self.handles.len());

        if self.config.options.silent {
            debug!(watchers = self.handles.len(), "Relay started");
        } else {
            info!(watchers = self.handles.len(), "Relay started");
        }
        Ok(())
    }

    async fn connect_broker(&self) -> Result<(), BrokerError> {
        let retries = self.config.options.max_connect_retries.unwrap_or(0);
        let mut attempt: u32 = 0;

        loop {
            match self.topology.initialize(&self.config.destinations).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < retries => {
                    attempt += 1;
                    let delay = self.config.stream_config.calculate_backoff(attempt);
                    warn!(error = %e, attempt, retries, ?delay, "Broker setup failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(error = %e, attempts = attempt + 1, "Broker setup failed");
                    return Err(e);
                }
            }
        }
    }

    /// Signals shutdown, waits for every task, then closes the broker and
    /// the position store.
    ///
    /// # Errors
    ///
    /// Currently infallible; close failures are logged.
    #[instrument(skip(self))]
    pub async fn stop(&mut self) -> Result<(), RelayError> {
        let Some(shutdown_tx) = self.shutdown_tx.take() else {
            warn!("Relay is not running");
            return Ok(());
        };

        let _ = shutdown_tx.send(());

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(?e, "Relay task panicked");
            }
        }

        if let Err(e) = self.topology.close().await {
            warn!(error = %e, "Error closing broker connection");
        }
        if let Err(e) = self.positions.close().await {
            warn!(error = %e, "Error closing position store");
        }

        metrics::set_active_watchers(0);
        info!("Relay stopped");
        Ok(())
    }

    /// True between `start` and `stop`.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    /// Broker health.
    #[must_use]
    pub fn broker_healthy(&self) -> bool {
        self.topology.is_healthy()
    }

    /// Database health: every watcher connected and streaming.
    #[must_use]
    pub fn database_healthy(&self) -> bool {
        !self.handles.is_empty() && self.handles.iter().all(WatcherHandle::is_healthy)
    }

    /// Watcher handles, empty before the first `start`.
    #[must_use]
    pub fn watchers(&self) -> &[WatcherHandle] {
        &self.handles
    }

    /// The delivery pipeline, for ad-hoc publishes.
    #[must_use]
    pub fn pipeline(&self) -> &DeliveryPipeline {
        &self.pipeline
    }

    /// The topology manager.
    #[must_use]
    pub fn topology(&self) -> &Arc<BrokerTopologyManager> {
        &self.topology
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> RelayConfigBuilder {
        RelayConfig::builder()
            .connection_string("mongodb://localhost:27017/shop")
            .collection("orders")
            .destination(Destination::queue("audit"))
    }

    #[test]
    fn builds_with_defaults() {
        let config = builder().build().unwrap();
        assert_eq!(config.collections, vec!["orders"]);
        assert_eq!(config.database, None);
        assert_eq!(config.options, RelayOptions::default());
        assert!(config.stream_config.full_document_on_update);
    }

    #[test]
    fn rejects_missing_pieces() {
        assert!(RelayConfig::builder()
            .collection("orders")
            .destination(Destination::queue("audit"))
            .build()
            .is_err());
        assert!(builder().collections(vec![]).build().is_err());
        assert!(builder().destinations(vec![]).build().is_err());
        assert!(builder().collection("orders").build().is_err());
        assert!(builder()
            .health_check_interval(Duration::ZERO)
            .build()
            .is_err());
    }

    #[test]
    fn options_deserialize_from_millis() {
        let options: RelayOptions = serde_json::from_str(
            r#"{
                "silent": false,
                "structuredFormatting": false,
                "healthCheckIntervalMs": 1500,
                "publishTimeoutMs": 250,
                "maxConnectRetries": 5
            }"#,
        )
        .unwrap();

        assert!(!options.structured_formatting);
        assert_eq!(options.max_connect_retries, Some(5));
        assert_eq!(options.health_check_interval, Duration::from_millis(1500));
        assert_eq!(options.publish_timeout, Duration::from_millis(250));

        let json = serde_json::to_value(options).unwrap();
        assert_eq!(json["publishTimeoutMs"], 250);
    }

    #[test]
    fn pipeline_errors_surface_as_configuration() {
        let config = builder()
            .destination(Destination::queue("audit"))
            .build()
            .unwrap();
        let result = Relay::new(
            config,
            Arc::new(crate::broker::MockBroker::new()),
            Arc::new(NoPositions),
            Arc::new(NoSpool),
        );
        assert!(matches!(result, Err(RelayError::Configuration(_))));
    }

    struct NoPositions;

    #[async_trait::async_trait]
    impl PositionStore for NoPositions {
        async fn load(
            &self,
            _collection: &str,
        ) -> Result<Option<crate::state::PositionRecord>, crate::state::StateStoreError> {
            Ok(None)
        }
        async fn commit(
            &self,
            _collection: &str,
            _position: &bson::Document,
            _description: Option<bson::Document>,
        ) -> Result<(), crate::state::StateStoreError> {
            Ok(())
        }
        async fn delete(&self, _collection: &str) -> Result<(), crate::state::StateStoreError> {
            Ok(())
        }
        async fn list(
            &self,
        ) -> Result<
            std::collections::HashMap<String, crate::state::PositionRecord>,
            crate::state::StateStoreError,
        > {
            Ok(std::collections::HashMap::new())
        }
        async fn close(&self) -> Result<(), crate::state::StateStoreError> {
            Ok(())
        }
    }

    struct NoSpool;

    #[async_trait::async_trait]
    impl FailureSpool for NoSpool {
        async fn append(
            &self,
            _message: crate::spool::SpooledMessage,
        ) -> Result<(), crate::spool::SpoolError> {
            Ok(())
        }
        async fn drain_all(
            &self,
        ) -> Result<Vec<crate::spool::SpooledMessage>, crate::spool::SpoolError> {
            Ok(Vec::new())
        }
        async fn len(&self) -> Result<usize, crate::spool::SpoolError> {
            Ok(0)
        }
    }
}
