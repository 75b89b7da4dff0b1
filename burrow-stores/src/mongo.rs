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

//! `MongoDB`-backed position store and failure spool.
//!
//! Both live in the watched database by default, next to the data:
//!
//! ```text
//! burrow_positions  { _id: <collection>, lastPosition, observedAt, description? }
//! burrow_spool      { _id: ObjectId, target, payload, failureReason, createdAt, attempts }
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use burrow_stores::mongo::{MongoPositionStore, MongoSpool, MongoStoreConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MongoStoreConfig::builder()
//!     .connection_string("mongodb://localhost:27017/shop?replicaSet=rs0")
//!     .build()?;
//!
//! let database = config.connect().await?;
//! let positions = MongoPositionStore::from_database(&database, &config);
//! let spool = MongoSpool::from_database(&database, &config).await?;
//! # let _ = (positions, spool);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use bson::{doc, oid::ObjectId, spec::BinarySubtype, Binary, Bson, Document};
use burrow_core::destination::{DeliverablePayload, DestinationTarget};
use burrow_core::spool::{FailureSpool, SpoolError, SpooledMessage};
use burrow_core::state::{PositionRecord, PositionStore, StateStoreError};
use futures::TryStreamExt;
use mongodb::{Client, Collection, Database, IndexModel};
use std::collections::HashMap;
use tracing::{debug, error, trace};

/// Default collection for positions.
pub const DEFAULT_POSITIONS_COLLECTION: &str = "burrow_positions";

/// Default collection for spooled messages.
pub const DEFAULT_SPOOL_COLLECTION: &str = "burrow_spool";

/// Where the stores keep their documents.
#[derive(Debug, Clone)]
pub struct MongoStoreConfig {
    /// Connection string.
    pub connection_string: String,
    /// Database; defaults to the connection string's database.
    pub database: Option<String>,
    /// Collection holding one position per watched collection.
    pub positions_collection: String,
    /// Collection holding spooled messages.
    pub spool_collection: String,
}

impl MongoStoreConfig {
    /// Starts a builder.
    #[must_use]
    pub fn builder() -> MongoStoreConfigBuilder {
        MongoStoreConfigBuilder::default()
    }

    /// Connects and pings the configured database.
    ///
    /// # Errors
    ///
    /// Returns [`StateStoreError::Configuration`] if no database is named and
    /// the connection string has none, or [`StateStoreError::Connection`] if
    /// the server is unreachable.
    pub async fn connect(&self) -> Result<Database, StateStoreError> {
        let client = Client::with_uri_str(&self.connection_string)
            .await
            .map_err(|e| StateStoreError::Connection(e.to_string()))?;

        let database = match &self.database {
            Some(name) => client.database(name),
            None => client.default_database().ok_or_else(|| {
                StateStoreError::Configuration(
                    "connection string has no default database".to_string(),
                )
            })?,
        };

        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| StateStoreError::Connection(e.to_string()))?;

        debug!(database = %database.name(), "Connected store database");
        Ok(database)
    }
}

/// Builder for [`MongoStoreConfig`].
#[derive(Debug, Default)]
pub struct MongoStoreConfigBuilder {
    connection_string: Option<String>,
    database: Option<String>,
    positions_collection: Option<String>,
    spool_collection: Option<String>,
}

impl MongoStoreConfigBuilder {
    /// Connection string (required).
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

    /// Default: `burrow_positions`
    #[must_use]
    pub fn positions_collection(mut self, name: impl Into<String>) -> Self {
        self.positions_collection = Some(name.into());
        self
    }

    /// Default: `burrow_spool`
    #[must_use]
    pub fn spool_collection(mut self, name: impl Into<String>) -> Self {
        self.spool_collection = Some(name.into());
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection string is missing or a collection
    /// name is empty.
    pub fn build(self) -> Result<MongoStoreConfig, StateStoreError> {
        let connection_string = self.connection_string.ok_or_else(|| {
            StateStoreError::Configuration("connection string is required".to_string())
        })?;

        let positions_collection = self
            .positions_collection
            .unwrap_or_else(|| DEFAULT_POSITIONS_COLLECTION.to_string());
        let spool_collection = self
            .spool_collection
            .unwrap_or_else(|| DEFAULT_SPOOL_COLLECTION.to_string());

        if positions_collection.is_empty() || spool_collection.is_empty() {
            return Err(StateStoreError::Configuration(
                "collection names cannot be empty".to_string(),
            ));
        }

        Ok(MongoStoreConfig {
            connection_string,
            database: self.database,
            positions_collection,
            spool_collection,
        })
    }
}

/// [`PositionStore`] keeping one document per watched collection.
#[derive(Debug, Clone)]
pub struct MongoPositionStore {
    positions: Collection<Document>,
}

impl MongoPositionStore {
    /// Connects with `config`.
    ///
    /// # Errors
    ///
    /// See [`MongoStoreConfig::connect`].
    pub async fn connect(config: &MongoStoreConfig) -> Result<Self, StateStoreError> {
        let database = config.connect().await?;
        Ok(Self::from_database(&database, config))
    }

    /// Uses an existing database handle.
    #[must_use]
    pub fn from_database(database: &Database, config: &MongoStoreConfig) -> Self {
        Self {
            positions: database.collection(&config.positions_collection),
        }
    }

    fn to_document(record: &PositionRecord) -> Document {
        let mut document = doc! {
            "_id": &record.collection,
            "lastPosition": record.last_position.clone(),
            "observedAt": bson::DateTime::from_chrono(record.observed_at),
        };
        if let Some(description) = &record.description {
            document.insert("description", description.clone());
        }
        document
    }

    fn from_document(document: &Document) -> Result<PositionRecord, StateStoreError> {
        let invalid = |e: bson::document::ValueAccessError| {
            StateStoreError::Serialization(format!("malformed position document: {e}"))
        };

        Ok(PositionRecord {
            collection: document.get_str("_id").map_err(invalid)?.to_string(),
            last_position: document.get_document("lastPosition").map_err(invalid)?.clone(),
            observed_at: document.get_datetime("observedAt").map_err(invalid)?.to_chrono(),
            description: document.get_document("description").ok().cloned(),
        })
    }
}

fn store_error(e: &mongodb::error::Error) -> StateStoreError {
    StateStoreError::Connection(e.to_string())
}

#[async_trait]
impl PositionStore for MongoPositionStore {
    async fn load(&self, collection: &str) -> Result<Option<PositionRecord>, StateStoreError> {
        let found = self
            .positions
            .find_one(doc! { "_id": collection })
            .await
            .map_err(|e| store_error(&e))?;

        trace!(collection, found = found.is_some(), "Loaded position");
        found.as_ref().map(Self::from_document).transpose()
    }

    async fn commit(
        &self,
        collection: &str,
        position: &Document,
        description: Option<Document>,
    ) -> Result<(), StateStoreError> {
        let record = PositionRecord::new(collection, position.clone(), description);

        self.positions
            .replace_one(doc! { "_id": collection }, Self::to_document(&record))
            .upsert(true)
            .await
            .map_err(|e| store_error(&e))?;

        trace!(collection, "Committed position");
        Ok(())
    }

    async fn delete(&self, collection: &str) -> Result<(), StateStoreError> {
        let result = self
            .positions
            .delete_one(doc! { "_id": collection })
            .await
            .map_err(|e| store_error(&e))?;

        debug!(collection, removed = result.deleted_count, "Deleted position");
        Ok(())
    }

    async fn list(&self) -> Result<HashMap<String, PositionRecord>, StateStoreError> {
        let documents: Vec<Document> = self
            .positions
            .find(doc! {})
            .await
            .map_err(|e| store_error(&e))?
            .try_collect()
            .await
            .map_err(|e| store_error(&e))?;

        documents
            .iter()
            .map(|d| Self::from_document(d).map(|r| (r.collection.clone(), r)))
            .collect()
    }

    async fn close(&self) -> Result<(), StateStoreError> {
        debug!("Closing MongoDB position store");
        Ok(())
    }
}

/// [`FailureSpool`] appending one document per message.
///
/// `drain_all` reads everything sorted by `createdAt` then `_id`, then deletes
/// exactly the documents it read. Messages appended in between are left for
/// the next drain.
#[derive(Debug, Clone)]
pub struct MongoSpool {
    messages: Collection<Document>,
}

impl MongoSpool {
    /// Connects with `config` and ensures the drain index exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the database is unreachable.
    pub async fn connect(config: &MongoStoreConfig) -> Result<Self, SpoolError> {
        let database = config
            .connect()
            .await
            .map_err(|e| SpoolError::Connection(e.to_string()))?;
        Self::from_database(&database, config).await
    }

    /// Uses an existing database handle and ensures the drain index exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be created.
    pub async fn from_database(
        database: &Database,
        config: &MongoStoreConfig,
    ) -> Result<Self, SpoolError> {
        let messages = database.collection::<Document>(&config.spool_collection);
        messages
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "createdAt": 1, "_id": 1 })
                    .build(),
            )
            .await
            .map_err(|e| spool_error(&e))?;

        Ok(Self { messages })
    }
}

fn spool_error(e: &mongodb::error::Error) -> SpoolError {
    SpoolError::Connection(e.to_string())
}

fn encode_payload(payload: &DeliverablePayload) -> Result<Document, SpoolError> {
    Ok(match payload {
        DeliverablePayload::Text(text) => doc! { "kind": "text", "body": text },
        DeliverablePayload::Binary(bytes) => doc! {
            "kind": "binary",
            "body": Binary { subtype: BinarySubtype::Generic, bytes: bytes.clone() },
        },
        DeliverablePayload::Structured(value) => {
            let body = bson::to_bson(value)
                .map_err(|e| SpoolError::Serialization(format!("payload has no BSON form: {e}")))?;
            doc! { "kind": "structured", "body": body }
        }
    })
}

fn decode_payload(document: &Document) -> Result<DeliverablePayload, SpoolError> {
    let malformed = |what: &str| SpoolError::Serialization(format!("malformed payload: {what}"));

    match (document.get_str("kind"), document.get("body")) {
        (Ok("text"), Some(Bson::String(text))) => Ok(DeliverablePayload::Text(text.clone())),
        (Ok("binary"), Some(Bson::Binary(binary))) => {
            Ok(DeliverablePayload::Binary(binary.bytes.clone()))
        }
        (Ok("structured"), Some(body)) => Ok(DeliverablePayload::Structured(
            body.clone().into_relaxed_extjson(),
        )),
        (Ok(kind), _) => Err(malformed(kind)),
        (Err(_), _) => Err(malformed("missing kind")),
    }
}

fn encode_message(message: &SpooledMessage) -> Result<Document, SpoolError> {
    let target = bson::to_document(&message.target)
        .map_err(|e| SpoolError::Serialization(e.to_string()))?;

    Ok(doc! {
        "target": target,
        "payload": encode_payload(&message.payload)?,
        "failureReason": &message.failure_reason,
        "createdAt": bson::DateTime::from_chrono(message.created_at),
        "attempts": i64::from(message.attempts),
    })
}

fn decode_message(document: &Document) -> Result<SpooledMessage, SpoolError> {
    let malformed =
        |e: bson::document::ValueAccessError| SpoolError::Serialization(e.to_string());

    let target: DestinationTarget =
        bson::from_document(document.get_document("target").map_err(malformed)?.clone())
            .map_err(|e| SpoolError::Serialization(e.to_string()))?;

    Ok(SpooledMessage {
        target,
        payload: decode_payload(document.get_document("payload").map_err(malformed)?)?,
        failure_reason: document
            .get_str("failureReason")
            .map_err(malformed)?
            .to_string(),
        created_at: document
            .get_datetime("createdAt")
            .map_err(malformed)?
            .to_chrono(),
        attempts: document
            .get_i64("attempts")
            .ok()
            .and_then(|a| u32::try_from(a).ok())
            .unwrap_or_default(),
    })
}

#[async_trait]
impl FailureSpool for MongoSpool {
    async fn append(&self, message: SpooledMessage) -> Result<(), SpoolError> {
        self.messages
            .insert_one(encode_message(&message)?)
            .await
            .map_err(|e| spool_error(&e))?;
        trace!(destination = %message.target, "Spooled message");
        Ok(())
    }

    async fn drain_all(&self) -> Result<Vec<SpooledMessage>, SpoolError> {
        let documents: Vec<Document> = self
            .messages
            .find(doc! {})
            .sort(doc! { "createdAt": 1, "_id": 1 })
            .await
            .map_err(|e| spool_error(&e))?
            .try_collect()
            .await
            .map_err(|e| spool_error(&e))?;

        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let mut ids: Vec<ObjectId> = Vec::with_capacity(documents.len());
        let mut drained = Vec::with_capacity(documents.len());
        for document in &documents {
            let Ok(id) = document.get_object_id("_id") else {
                error!("Spool document without ObjectId, leaving it in place");
                continue;
            };
            match decode_message(document) {
                Ok(message) => {
                    ids.push(id);
                    drained.push(message);
                }
                Err(e) => error!(%id, error = %e, "Undecodable spool document, leaving it in place"),
            }
        }

        self.messages
            .delete_many(doc! { "_id": { "$in": ids } })
            .await
            .map_err(|e| spool_error(&e))?;

        debug!(count = drained.len(), "Drained spool");
        Ok(drained)
    }

    async fn len(&self) -> Result<usize, SpoolError> {
        let count = self
            .messages
            .count_documents(doc! {})
            .await
            .map_err(|e| spool_error(&e))?;
        Ok(usize::try_from(count).unwrap_or(usize::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_core::destination::{Destination, ExchangeBinding, ExchangeKind};
    use chrono::{TimeZone, Utc};

    #[test]
    fn config_defaults() {
        let config = MongoStoreConfig::builder()
            .connection_string("mongodb://localhost:27017/shop")
            .build()
            .unwrap();
        assert_eq!(config.positions_collection, DEFAULT_POSITIONS_COLLECTION);
        assert_eq!(config.spool_collection, DEFAULT_SPOOL_COLLECTION);
        assert_eq!(config.database, None);
    }

    #[test]
    fn config_requires_connection_string() {
        assert!(MongoStoreConfig::builder().build().is_err());
        assert!(MongoStoreConfig::builder()
            .connection_string("mongodb://localhost")
            .spool_collection("")
            .build()
            .is_err());
    }

    #[test]
    fn position_document_shape() {
        let record = PositionRecord::new(
            "orders",
            doc! { "_data": "abc" },
            Some(doc! { "operationType": "update" }),
        );
        let document = MongoPositionStore::to_document(&record);

        assert_eq!(document.get_str("_id").unwrap(), "orders");
        assert_eq!(
            document.get_document("lastPosition").unwrap(),
            &doc! { "_data": "abc" }
        );

        let back = MongoPositionStore::from_document(&document).unwrap();
        assert_eq!(back.collection, "orders");
        assert_eq!(back.description, record.description);
    }

    #[test]
    fn spooled_message_document_shape() {
        let mut message = SpooledMessage::new(
            Destination::queue("audit")
                .with_exchange(ExchangeBinding::new("events", ExchangeKind::Topic, "orders.*"))
                .target(),
            DeliverablePayload::Structured(serde_json::json!({ "data": { "id": "42" } })),
            "timeout",
        );
        message.created_at = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        message.attempts = 2;

        let document = encode_message(&message).unwrap();
        assert_eq!(
            document.get_document("payload").unwrap().get_str("kind").unwrap(),
            "structured"
        );
        assert_eq!(document.get_i64("attempts").unwrap(), 2);

        let back = decode_message(&document).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn binary_and_text_payloads_decode() {
        for payload in [
            DeliverablePayload::Binary(vec![0, 159, 146, 150]),
            DeliverablePayload::Text("plain".to_string()),
        ] {
            let encoded = encode_payload(&payload).unwrap();
            assert_eq!(decode_payload(&encoded).unwrap(), payload);
        }
        assert!(decode_payload(&doc! { "kind": "text", "body": 1 }).is_err());
    }
}
