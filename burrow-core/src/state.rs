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

//! Change stream position tracking.
//!
//! A [`PositionStore`] keeps, per watched collection, the resume token of the
//! last event that was fully handled: delivered or spooled for every
//! destination. There is exactly one record per collection; `commit` replaces
//! it.
//!
//! # Example
//!
//! ```rust
//! use burrow_core::state::{PositionRecord, PositionStore, StateStoreError};
//! use bson::Document;
//! use std::collections::HashMap;
//!
//! #[derive(Default)]
//! struct Positions(tokio::sync::Mutex<HashMap<String, PositionRecord>>);
//!
//! #[async_trait::async_trait]
//! impl PositionStore for Positions {
//!     async fn load(&self, collection: &str) -> Result<Option<PositionRecord>, StateStoreError> {
//!         Ok(self.0.lock().await.get(collection).cloned())
//!     }
//!
//!     async fn commit(
//!         &self,
//!         collection: &str,
//!         position: &Document,
//!         description: Option<Document>,
//!     ) -> Result<(), StateStoreError> {
//!         let record = PositionRecord::new(collection, position.clone(), description);
//!         self.0.lock().await.insert(collection.to_string(), record);
//!         Ok(())
//!     }
//!
//!     async fn delete(&self, collection: &str) -> Result<(), StateStoreError> {
//!         self.0.lock().await.remove(collection);
//!         Ok(())
//!     }
//!
//!     async fn list(&self) -> Result<HashMap<String, PositionRecord>, StateStoreError> {
//!         Ok(self.0.lock().await.clone())
//!     }
//!
//!     async fn close(&self) -> Result<(), StateStoreError> {
//!         Ok(())
//!     }
//! }
//! ```

use bson::Document;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Last committed position for a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRecord {
    /// Watched collection.
    pub collection: String,
    /// Resume token of the last fully handled event.
    pub last_position: Document,
    /// When the position was committed.
    pub observed_at: DateTime<Utc>,
    /// Operation kind and document key of that event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<Document>,
}

impl PositionRecord {
    /// Record stamped with the current time.
    pub fn new(
        collection: impl Into<String>,
        last_position: Document,
        description: Option<Document>,
    ) -> Self {
        Self {
            collection: collection.into(),
            last_position,
            observed_at: Utc::now(),
            description,
        }
    }
}

/// Durable per-collection position storage.
#[async_trait::async_trait]
pub trait PositionStore: Send + Sync {
    /// Last committed position for `collection`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    async fn load(&self, collection: &str) -> Result<Option<PositionRecord>, StateStoreError>;

    /// Replaces the committed position for `collection`.
    ///
    /// # Errors
    ///
    /// Returns an error if the position was not persisted. Callers must then
    /// treat the event as unhandled.
    async fn commit(
        &self,
        collection: &str,
        position: &Document,
        description: Option<Document>,
    ) -> Result<(), StateStoreError>;

    /// Forgets the position for `collection`; the next watch starts at the
    /// stream's current tail.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be written.
    async fn delete(&self, collection: &str) -> Result<(), StateStoreError>;

    /// All stored positions keyed by collection.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    async fn list(&self) -> Result<HashMap<String, PositionRecord>, StateStoreError>;

    /// Releases backend resources.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be closed cleanly.
    async fn close(&self) -> Result<(), StateStoreError>;
}

/// Errors from [`PositionStore`] backends.
#[derive(Debug, thiserror::Error)]
pub enum StateStoreError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored data could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Backend unreachable.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Invalid store configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Other errors
    #[error("State store error: {0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn position_record_serializes_camel_case() {
        let record = PositionRecord::new(
            "orders",
            doc! { "_data": "abc" },
            Some(doc! { "operationType": "insert" }),
        );
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["collection"], "orders");
        assert_eq!(json["lastPosition"]["_data"], "abc");
        assert!(json["observedAt"].is_string());
        assert_eq!(json["description"]["operationType"], "insert");
    }

    #[test]
    fn description_is_optional() {
        let record = PositionRecord::new("orders", doc! { "_data": "abc" }, None);
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("description").is_none());

        let back: PositionRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back.description, None);
    }
}
