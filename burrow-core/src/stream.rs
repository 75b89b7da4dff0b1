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

//! `MongoDB` change feed.
//!
//! A [`ChangeFeed`] owns a database connection and opens resumable change
//! streams on one collection. Reconnection policy lives in the watcher
//! ([`crate::watcher`]); the feed only connects, opens and reports health.
//!
//! ## Resume flow
//!
//! ```text
//! PositionStore ──load──▶ Watcher ──open(resume_after)──▶ ChangeFeed
//!       ▲                    │                                │
//!       └──────commit────────┘◀──────── ChangeEvent ──────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use burrow_core::stream::{ChangeFeed, ChangeStreamConfig, MongoChangeFeed};
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let feed = MongoChangeFeed::new(
//!     "mongodb://localhost:27017/shop?replicaSet=rs0",
//!     None,
//!     "orders",
//!     ChangeStreamConfig::default(),
//! );
//! feed.connect().await?;
//!
//! let mut events = feed.open(None).await?;
//! while let Some(event) = events.next().await {
//!     let event = event?;
//!     println!("{:?} on {}", event.operation, event.collection_name());
//! }
//! # Ok(())
//! # }
//! ```

use crate::broker::ConnectionState;
use crate::event::{ChangeEvent, ConversionError};
use async_trait::async_trait;
use bson::{doc, Document};
use futures::stream::BoxStream;
use futures::StreamExt;
use mongodb::{
    change_stream::event::ResumeToken,
    error::{Error as MongoError, ErrorKind as MongoErrorKind},
    options::ChangeStreamOptions,
    Client, Database,
};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Errors that can occur while connecting to or reading a change feed.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Driver error, possibly transient
    #[error("Connection error: {message}")]
    Connection {
        /// Driver message.
        message: String,
        /// Driver error.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
        /// Server error code.
        code: Option<i32>,
        /// Server error labels (e.g. "NetworkError").
        labels: Vec<String>,
    },

    /// `open` was called before `connect`, or after the connection was dropped.
    #[error("Not connected to database")]
    NotConnected,

    /// Driver event could not be converted.
    #[error("Event conversion failed: {0}")]
    Conversion(#[from] ConversionError),

    /// Stream invalidated (collection dropped or renamed).
    #[error("Stream invalidated: {reason}")]
    Invalidated {
        /// What the server reported.
        reason: String,
    },

    /// Resume token rejected by the server (code 286), usually because the
    /// oplog no longer covers it.
    #[error("Invalid resume token (code {code}): oplog may be truncated")]
    InvalidResumeToken {
        /// Server error code.
        code: i32,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<MongoError> for StreamError {
    fn from(err: MongoError) -> Self {
        Self::from_mongo_error(err)
    }
}

impl StreamError {
    /// Classifies a driver error by server code and labels.
    #[must_use]
    pub fn from_mongo_error(err: MongoError) -> Self {
        let code = match err.kind.as_ref() {
            MongoErrorKind::Command(cmd_err) => Some(cmd_err.code),
            _ => None,
        };

        if code == Some(286) {
            return Self::InvalidResumeToken { code: 286 };
        }

        let labels: Vec<String> = err.labels().iter().cloned().collect();

        Self::Connection {
            message: err.to_string(),
            source: Some(Box::new(err)),
            code,
            labels,
        }
    }

    /// Whether reconnecting is expected to help.
    ///
    /// Connection errors are retryable when labelled `RetryableWriteError`,
    /// `TransientTransactionError` or `NetworkError`, or when the server code
    /// is one of the transient network, failover or cursor codes.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { code, labels, .. } => {
                if labels.iter().any(|l| {
                    l == "RetryableWriteError"
                        || l == "TransientTransactionError"
                        || l == "NetworkError"
                }) {
                    return true;
                }

                matches!(
                    code,
                    Some(
                        6 |     // HostUnreachable
                        7 |     // HostNotFound
                        43 |    // CursorNotFound
                        89 |    // NetworkTimeout
                        91 |    // ShutdownInProgress
                        10107 | // NotWritablePrimary
                        11600 | // InterruptedAtShutdown
                        11602 | // InterruptedDueToReplStateChange
                        13435 | // NotPrimaryNoSecondaryOk
                        13436   // NotPrimaryOrSecondary
                    )
                )
            }
            Self::NotConnected => true,
            Self::Invalidated { .. }
            | Self::InvalidResumeToken { .. }
            | Self::Conversion(_)
            | Self::Configuration(_) => false,
        }
    }

    /// Label for logs and metrics.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::Connection { .. } | Self::NotConnected => "connection",
            Self::Conversion(_) => "conversion",
            Self::Invalidated { .. } => "invalidated",
            Self::InvalidResumeToken { .. } => "invalid_token",
            Self::Configuration(_) => "configuration",
        }
    }
}

/// Change stream options and reconnect backoff.
///
/// ```rust
/// use burrow_core::stream::ChangeStreamConfig;
///
/// let config = ChangeStreamConfig::builder()
///     .batch_size(500)
///     .max_backoff_ms(10_000)
///     .build()
///     .unwrap();
/// assert!(config.full_document_on_update);
/// ```
#[derive(Debug, Clone)]
pub struct ChangeStreamConfig {
    /// Extra aggregation stages, appended after the namespace filter.
    pub pipeline: Vec<Document>,

    /// Look up the current document for update events.
    pub full_document_on_update: bool,

    /// Include pre-images when available (server 6.0+).
    pub full_document_before_change: bool,

    /// First reconnect delay in milliseconds.
    pub initial_backoff_ms: u64,

    /// Reconnect delay cap in milliseconds.
    pub max_backoff_ms: u64,

    /// Server batch size.
    pub batch_size: Option<u32>,

    /// Backoff jitter factor in `[0.0, 1.0]`.
    pub backoff_jitter: f64,
}

impl Default for ChangeStreamConfig {
    fn default() -> Self {
        Self {
            pipeline: Vec::new(),
            full_document_on_update: true,
            full_document_before_change: false,
            initial_backoff_ms: 100,
            max_backoff_ms: 30_000,
            batch_size: None,
            backoff_jitter: 0.1,
        }
    }
}

impl ChangeStreamConfig {
    /// Starts a builder.
    #[must_use]
    pub fn builder() -> ChangeStreamConfigBuilder {
        ChangeStreamConfigBuilder::default()
    }

    /// Checks backoff settings.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Configuration`] if the initial backoff is zero
    /// or above the cap, or if the jitter is outside `[0.0, 1.0]`.
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.initial_backoff_ms == 0 {
            return Err(StreamError::Configuration(
                "initial_backoff_ms must be greater than 0".to_string(),
            ));
        }

        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(StreamError::Configuration(format!(
                "initial_backoff_ms ({}) must be <= max_backoff_ms ({})",
                self.initial_backoff_ms, self.max_backoff_ms
            )));
        }

        if !(0.0..=1.0).contains(&self.backoff_jitter) {
            return Err(StreamError::Configuration(format!(
                "backoff_jitter ({}) must be between 0.0 and 1.0",
                self.backoff_jitter
            )));
        }

        Ok(())
    }

    /// Delay before reconnect attempt `attempt` (1-based):
    /// `initial * 2^(attempt-1)` capped at the maximum, with ±jitter/2.
    #[must_use]
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(63);
        let base_ms = self
            .initial_backoff_ms
            .saturating_mul(1_u64 << shift)
            .min(self.max_backoff_ms);

        if self.backoff_jitter > 0.0 {
            let jitter_range = (base_ms as f64) * self.backoff_jitter;
            let jitter = (rand::random::<f64>() * jitter_range) - (jitter_range / 2.0);
            Duration::from_millis(((base_ms as f64) + jitter).max(0.0) as u64)
        } else {
            Duration::from_millis(base_ms)
        }
    }

    /// Driver options for a stream resuming after `resume_after`.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Configuration`] if the stored position is not a
    /// valid resume token.
    pub fn to_mongo_options(
        &self,
        resume_after: Option<&Document>,
    ) -> Result<ChangeStreamOptions, StreamError> {
        let mut options = ChangeStreamOptions::default();

        if self.full_document_on_update {
            options.full_document = Some(mongodb::options::FullDocumentType::UpdateLookup);
        }

        if self.full_document_before_change {
            options.full_document_before_change =
                Some(mongodb::options::FullDocumentBeforeChangeType::WhenAvailable);
        }

        options.batch_size = self.batch_size;

        // Positions are stored as plain documents; the driver wants its own
        // ResumeToken type, which round-trips through raw BSON.
        if let Some(token) = resume_after {
            let bytes = bson::to_vec(token).map_err(|e| {
                StreamError::Configuration(format!("stored position is not BSON: {e}"))
            })?;
            let token = bson::from_slice::<ResumeToken>(&bytes).map_err(|e| {
                StreamError::Configuration(format!("stored position is not a resume token: {e}"))
            })?;
            options.resume_after = Some(token);
        }

        Ok(options)
    }
}

/// Builder for [`ChangeStreamConfig`].
#[derive(Debug, Default)]
pub struct ChangeStreamConfigBuilder {
    pipeline: Vec<Document>,
    full_document_on_update: Option<bool>,
    full_document_before_change: bool,
    initial_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    batch_size: Option<u32>,
    backoff_jitter: Option<f64>,
}

impl ChangeStreamConfigBuilder {
    /// Extra aggregation stages.
    #[must_use]
    pub fn pipeline(mut self, pipeline: Vec<Document>) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Toggles full document lookup on updates (default: on).
    #[must_use]
    pub fn full_document_on_update(mut self, enabled: bool) -> Self {
        self.full_document_on_update = Some(enabled);
        self
    }

    /// Requests pre-images.
    #[must_use]
    pub fn full_document_before_change(mut self) -> Self {
        self.full_document_before_change = true;
        self
    }

    /// Default: 100ms
    #[must_use]
    pub fn initial_backoff_ms(mut self, ms: u64) -> Self {
        self.initial_backoff_ms = Some(ms);
        self
    }

    /// Default: 30,000ms
    #[must_use]
    pub fn max_backoff_ms(mut self, ms: u64) -> Self {
        self.max_backoff_ms = Some(ms);
        self
    }

    /// Server batch size.
    #[must_use]
    pub fn batch_size(mut self, size: u32) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Default: 0.1
    #[must_use]
    pub fn backoff_jitter(mut self, jitter: f64) -> Self {
        self.backoff_jitter = Some(jitter);
        self
    }

    /// Builds and validates.
    ///
    /// # Errors
    ///
    /// See [`ChangeStreamConfig::validate`].
    pub fn build(self) -> Result<ChangeStreamConfig, StreamError> {
        let defaults = ChangeStreamConfig::default();
        let config = ChangeStreamConfig {
            pipeline: self.pipeline,
            full_document_on_update: self
                .full_document_on_update
                .unwrap_or(defaults.full_document_on_update),
            full_document_before_change: self.full_document_before_change,
            initial_backoff_ms: self.initial_backoff_ms.unwrap_or(defaults.initial_backoff_ms),
            max_backoff_ms: self.max_backoff_ms.unwrap_or(defaults.max_backoff_ms),
            batch_size: self.batch_size,
            backoff_jitter: self.backoff_jitter.unwrap_or(defaults.backoff_jitter),
        };

        config.validate()?;
        Ok(config)
    }
}

/// Stream of converted change events.
pub type EventStream = BoxStream<'static, Result<ChangeEvent, StreamError>>;

/// Source of change events for one collection.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Watched collection name.
    fn collection(&self) -> &str;

    /// Connects (or reconnects) to the database.
    async fn connect(&self) -> Result<(), StreamError>;

    /// Current connection state.
    fn state(&self) -> ConnectionState;

    /// True when connected.
    fn is_healthy(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Opens a stream starting after `resume_after`, or at the current tail.
    async fn open(&self, resume_after: Option<Document>) -> Result<EventStream, StreamError>;

    /// Drops the connection.
    async fn disconnect(&self);
}

#[derive(Default)]
struct Session {
    state: ConnectionState,
    database: Option<Database>,
}

/// [`ChangeFeed`] over a `MongoDB` replica set or sharded cluster.
pub struct MongoChangeFeed {
    connection_string: String,
    database_override: Option<String>,
    collection: String,
    config: ChangeStreamConfig,
    session: RwLock<Session>,
}

impl std::fmt::Debug for MongoChangeFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MongoChangeFeed")
            .field("database_override", &self.database_override)
            .field("collection", &self.collection)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl MongoChangeFeed {
    /// Creates a disconnected feed.
    ///
    /// The database is `database` if given, otherwise the default database of
    /// `connection_string`.
    pub fn new(
        connection_string: impl Into<String>,
        database: Option<String>,
        collection: impl Into<String>,
        config: ChangeStreamConfig,
    ) -> Self {
        Self {
            connection_string: connection_string.into(),
            database_override: database,
            collection: collection.into(),
            config,
            session: RwLock::new(Session::default()),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .state = state;
    }

    fn database(&self) -> Option<Database> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .database
            .clone()
    }
}

#[async_trait]
impl ChangeFeed for MongoChangeFeed {
    fn collection(&self) -> &str {
        &self.collection
    }

    async fn connect(&self) -> Result<(), StreamError> {
        self.set_state(ConnectionState::Connecting);

        let result = async {
            let client = Client::with_uri_str(&self.connection_string).await?;
            let database = match &self.database_override {
                Some(name) => client.database(name),
                None => client.default_database().ok_or_else(|| {
                    StreamError::Configuration(
                        "connection string has no default database".to_string(),
                    )
                })?,
            };
            database.run_command(doc! { "ping": 1 }).await?;
            Ok::<_, StreamError>(database)
        }
        .await;

        let mut session = self.session.write().unwrap_or_else(PoisonError::into_inner);
        match result {
            Ok(database) => {
                info!(
                    database = %database.name(),
                    collection = %self.collection,
                    "Connected to database"
                );
                session.database = Some(database);
                session.state = ConnectionState::Ready;
                Ok(())
            }
            Err(e) => {
                session.database = None;
                session.state = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    fn state(&self) -> ConnectionState {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    async fn open(&self, resume_after: Option<Document>) -> Result<EventStream, StreamError> {
        let database = self.database().ok_or(StreamError::NotConnected)?;
        let options = self.config.to_mongo_options(resume_after.as_ref())?;

        let mut pipeline = vec![doc! {
            "$match": {
                "ns.db": database.name(),
                "ns.coll": &self.collection,
            }
        }];
        pipeline.extend(self.config.pipeline.iter().cloned());

        debug!(
            collection = %self.collection,
            resuming = resume_after.is_some(),
            "Opening change stream"
        );

        let stream = database
            .collection::<Document>(&self.collection)
            .watch()
            .pipeline(pipeline)
            .with_options(options)
            .await?;

        Ok(stream
            .map(|item| match item {
                Ok(event) => ChangeEvent::try_from(event).map_err(StreamError::from),
                Err(e) => Err(StreamError::from_mongo_error(e)),
            })
            .boxed())
    }

    async fn disconnect(&self) {
        let mut session = self.session.write().unwrap_or_else(PoisonError::into_inner);
        if session.database.take().is_some() {
            debug!(collection = %self.collection, "Dropped database connection");
        }
        session.state = ConnectionState::Disconnected;
    }
}
