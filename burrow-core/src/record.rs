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

//! Event normalization.
//!
//! A [`ChangeRecord`] is the stable, minimal shape consumers see: an id, an
//! operation kind, the full document and the update description. Which fields
//! are populated depends on the operation:
//!
//! | operation        | `fullDocument`     | `updateDescription` |
//! |------------------|--------------------|---------------------|
//! | insert, replace  | copied             | empty               |
//! | update           | copied             | copied              |
//! | delete           | empty              | empty               |
//! | anything else    | empty              | empty               |
//!
//! ```rust
//! use burrow_core::event::{ChangeEvent, Namespace, OperationType, UpdateDescription};
//! use burrow_core::record::{ChangeOperation, ChangeRecord};
//! use bson::doc;
//!
//! let event = ChangeEvent {
//!     operation: OperationType::Update,
//!     namespace: Namespace::new("shop", "orders"),
//!     document_key: Some(doc! { "_id": "42" }),
//!     full_document: Some(doc! { "_id": "42", "x": 1 }),
//!     update_description: Some(UpdateDescription {
//!         updated_fields: doc! { "x": 1 },
//!         removed_fields: vec!["y".into()],
//!     }),
//!     cluster_time: chrono::Utc::now(),
//!     resume_token: doc! { "_data": "t" },
//! };
//!
//! let record = ChangeRecord::normalize(&event);
//! assert_eq!(record.id, "42");
//! assert_eq!(record.operation, ChangeOperation::Update);
//! ```

use crate::event::{ChangeEvent, OperationType};
use bson::{Bson, Document};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Id used when the event carries no document key.
pub const MISSING_ID: &str = "null";

/// Operation kinds a [`ChangeRecord`] can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    /// Document inserted.
    Insert,
    /// Document modified in place.
    Update,
    /// Document removed.
    Delete,
    /// Document replaced.
    Replace,
    /// Anything else the server reported.
    Unknown,
}

impl ChangeOperation {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Replace => "replace",
            Self::Unknown => "unknown",
        }
    }
}

impl From<&OperationType> for ChangeOperation {
    fn from(op: &OperationType) -> Self {
        match op {
            OperationType::Insert => Self::Insert,
            OperationType::Update => Self::Update,
            OperationType::Delete => Self::Delete,
            OperationType::Replace => Self::Replace,
            _ => Self::Unknown,
        }
    }
}

/// Update description as carried by a record. Both parts are always present,
/// possibly empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordUpdate {
    /// Fields set by the update.
    pub updated_fields: Document,
    /// Fields unset by the update.
    pub removed_fields: Vec<String>,
}

/// Normalized change event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    /// String form of `documentKey._id`, or `"null"`.
    pub id: String,
    /// Operation kind.
    pub operation: ChangeOperation,
    /// Post-image for insert, replace and update; empty otherwise.
    pub full_document: Document,
    /// Populated for update only.
    pub update_description: RecordUpdate,
}

impl ChangeRecord {
    /// Builds the normalized record for `event`. Never fails.
    #[must_use]
    pub fn normalize(event: &ChangeEvent) -> Self {
        let id = event.document_id().map_or_else(|| MISSING_ID.to_string(), id_string);
        let operation = ChangeOperation::from(&event.operation);

        let (full_document, update_description) = match operation {
            ChangeOperation::Insert | ChangeOperation::Replace => {
                (event.full_document.clone().unwrap_or_default(), RecordUpdate::default())
            }
            ChangeOperation::Update => {
                let update = event
                    .update_description
                    .as_ref()
                    .map(|ud| RecordUpdate {
                        updated_fields: ud.updated_fields.clone(),
                        removed_fields: ud.removed_fields.clone(),
                    })
                    .unwrap_or_default();
                (event.full_document.clone().unwrap_or_default(), update)
            }
            ChangeOperation::Delete => (Document::new(), RecordUpdate::default()),
            ChangeOperation::Unknown => {
                warn!(
                    operation = event.operation.as_str(),
                    collection = %event.namespace.full_name(),
                    "Unrecognized operation type, forwarding as unknown"
                );
                (Document::new(), RecordUpdate::default())
            }
        };

        Self {
            id,
            operation,
            full_document,
            update_description,
        }
    }
}

fn id_string(id: &Bson) -> String {
    match id {
        Bson::String(s) => s.clone(),
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::Null => MISSING_ID.to_string(),
        other => other.to_string(),
    }
}
