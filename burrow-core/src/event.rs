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

//! Raw change notifications as they come off a `MongoDB` change stream.
//!
//! [`ChangeEvent`] keeps everything the driver gives us that the relay cares
//! about. It is the input of the normalizer ([`crate::record`]) and, when
//! structured formatting is disabled, the payload that gets published as-is.
//!
//! ```rust
//! use burrow_core::event::{ChangeEvent, Namespace, OperationType};
//! use bson::doc;
//! use chrono::Utc;
//!
//! let event = ChangeEvent {
//!     operation: OperationType::Insert,
//!     namespace: Namespace::new("shop", "orders"),
//!     document_key: Some(doc! { "_id": 7 }),
//!     full_document: Some(doc! { "_id": 7, "total": 12.5 }),
//!     update_description: None,
//!     cluster_time: Utc::now(),
//!     resume_token: doc! { "_data": "8263..." },
//! };
//!
//! assert!(event.is_insert());
//! assert_eq!(event.collection_name(), "orders");
//! ```

use bson::{Bson, Document};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Error converting a driver `ChangeStreamEvent` into a [`ChangeEvent`].
#[derive(Debug, Clone, Error)]
pub enum ConversionError {
    /// The resume token could not be represented as a BSON document.
    #[error("failed to convert resume token: {0}")]
    ResumeTokenConversion(String),
}

/// Change stream operation kinds.
///
/// `Unknown` carries the server's string for kinds this crate does not model.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum OperationType {
    /// Document inserted.
    Insert,
    /// Document modified in place.
    Update,
    /// Document removed.
    Delete,
    /// Document replaced wholesale.
    Replace,
    /// Stream invalidated (collection dropped or renamed).
    Invalidate,
    /// Collection dropped.
    Drop,
    /// Database dropped.
    #[serde(rename = "dropdatabase")]
    DropDatabase,
    /// Collection renamed.
    Rename,
    /// Operation kind introduced by a newer server.
    #[serde(untagged)]
    Unknown(String),
}

impl OperationType {
    /// Lowercase wire name, as used in metric labels.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Replace => "replace",
            Self::Invalidate => "invalidate",
            Self::Drop => "drop",
            Self::DropDatabase => "dropdatabase",
            Self::Rename => "rename",
            Self::Unknown(name) => name,
        }
    }

    /// True for insert, update, delete and replace.
    #[inline]
    #[must_use]
    pub fn is_document_change(&self) -> bool {
        matches!(
            self,
            Self::Insert | Self::Update | Self::Delete | Self::Replace
        )
    }
}

/// Database and collection an event belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    /// Database name.
    #[serde(rename = "db")]
    pub database: String,

    /// Collection name.
    #[serde(rename = "coll")]
    pub collection: String,
}

impl Namespace {
    /// Creates a namespace.
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// `database.collection`
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.database, self.collection)
    }
}

/// Fields touched by an update operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateDescription {
    /// Fields that were set, with their new values.
    #[serde(rename = "updatedFields")]
    pub updated_fields: Document,

    /// Dotted paths of fields that were unset.
    #[serde(rename = "removedFields")]
    pub removed_fields: Vec<String>,
}

/// A single change stream notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Operation kind.
    #[serde(rename = "operationType")]
    pub operation: OperationType,

    /// Where the change happened.
    #[serde(rename = "ns")]
    pub namespace: Namespace,

    /// `_id` (plus shard key) of the affected document. Absent for
    /// collection-level events.
    #[serde(rename = "documentKey", skip_serializing_if = "Option::is_none")]
    pub document_key: Option<Document>,

    /// Post-image of the document, when the server supplied one.
    #[serde(rename = "fullDocument", skip_serializing_if = "Option::is_none")]
    pub full_document: Option<Document>,

    /// Present on update operations.
    #[serde(rename = "updateDescription", skip_serializing_if = "Option::is_none")]
    pub update_description: Option<UpdateDescription>,

    /// Oplog time of the operation.
    #[serde(rename = "clusterTime")]
    pub cluster_time: DateTime<Utc>,

    /// Opaque position of this event in the stream.
    #[serde(rename = "_id")]
    pub resume_token: Document,
}

impl ChangeEvent {
    /// True for insert operations.
    #[inline]
    #[must_use]
    pub fn is_insert(&self) -> bool {
        self.operation == OperationType::Insert
    }

    /// True for update operations.
    #[inline]
    #[must_use]
    pub fn is_update(&self) -> bool {
        self.operation == OperationType::Update
    }

    /// True for delete operations.
    #[inline]
    #[must_use]
    pub fn is_delete(&self) -> bool {
        self.operation == OperationType::Delete
    }

    /// Collection name.
    #[inline]
    #[must_use]
    pub fn collection_name(&self) -> &str {
        &self.namespace.collection
    }

    /// `documentKey._id`, if any.
    #[must_use]
    pub fn document_id(&self) -> Option<&Bson> {
        self.document_key.as_ref()?.get("_id")
    }

    /// Small summary stored next to a committed position: operation kind and
    /// document key.
    #[must_use]
    pub fn position_description(&self) -> Document {
        let mut description = Document::new();
        description.insert("operationType", self.operation.as_str());
        if let Some(key) = &self.document_key {
            description.insert("documentKey", key.clone());
        }
        description
    }

    /// JSON rendering of the raw event, used when structured formatting is
    /// disabled.
    ///
    /// # Errors
    ///
    /// Returns an error if a BSON value has no JSON representation.
    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

impl TryFrom<mongodb::change_stream::event::ChangeStreamEvent<Document>> for ChangeEvent {
    type Error = ConversionError;

    fn try_from(
        event: mongodb::change_stream::event::ChangeStreamEvent<Document>,
    ) -> Result<Self, Self::Error> {
        use mongodb::change_stream::event::OperationType as DriverOp;

        let operation = match event.operation_type {
            DriverOp::Insert => OperationType::Insert,
            DriverOp::Update => OperationType::Update,
            DriverOp::Delete => OperationType::Delete,
            DriverOp::Replace => OperationType::Replace,
            DriverOp::Invalidate => OperationType::Invalidate,
            DriverOp::Drop => OperationType::Drop,
            DriverOp::DropDatabase => OperationType::DropDatabase,
            DriverOp::Rename => OperationType::Rename,
            DriverOp::Other(name) => OperationType::Unknown(name),
            other => OperationType::Unknown(format!("{other:?}").to_lowercase()),
        };

        let namespace = event.ns.map_or_else(
            || Namespace::new(String::new(), String::new()),
            |ns| Namespace::new(ns.db, ns.coll.unwrap_or_default()),
        );

        let update_description = event.update_description.map(|ud| UpdateDescription {
            updated_fields: ud.updated_fields,
            removed_fields: ud.removed_fields,
        });

        // Second precision: the increment is an oplog ordinal, not a time.
        let cluster_time = match event.cluster_time {
            Some(ts) => cluster_time_of(ts),
            None => Utc::now(),
        };

        let resume_token = bson::to_document(&event.id)
            .map_err(|e| ConversionError::ResumeTokenConversion(e.to_string()))?;

        Ok(Self {
            operation,
            namespace,
            document_key: event.document_key,
            full_document: event.full_document,
            update_description,
            cluster_time,
            resume_token,
        })
    }
}

fn cluster_time_of(ts: bson::Timestamp) -> DateTime<Utc> {
    DateTime::from_timestamp(i64::from(ts.time), 0).unwrap_or_else(|| {
        warn!(time = ts.time, "Invalid cluster time, using now");
        Utc::now()
    })
}
