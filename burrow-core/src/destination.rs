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

//! Delivery destinations and per-destination transforms.
//!
//! A [`Destination`] names a durable queue, optionally reached through an
//! exchange, and optionally carries a [`Transform`] that turns a normalized
//! [`ChangeRecord`] into zero, one or many [`DeliverablePayload`]s.
//!
//! # Example
//!
//! ```rust
//! use burrow_core::destination::{
//!     DeliverablePayload, Destination, ExchangeBinding, ExchangeKind, TransformOutput,
//! };
//! use burrow_core::record::ChangeOperation;
//!
//! // Plain queue, default transform.
//! let audit = Destination::queue("audit");
//!
//! // Through a topic exchange, only forwarding deletes.
//! let deletes = Destination::queue("deletes")
//!     .with_exchange(ExchangeBinding::new("changes", ExchangeKind::Topic, "orders.delete"))
//!     .with_transform(|record, _collection| {
//!         if record.operation == ChangeOperation::Delete {
//!             TransformOutput::One(DeliverablePayload::Text(record.id.clone()))
//!         } else {
//!             TransformOutput::None
//!         }
//!     });
//!
//! assert!(audit.transform.is_none());
//! assert_eq!(deletes.target().routing_key(), "orders.delete");
//! ```

use crate::record::ChangeRecord;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// AMQP exchange types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Routes on exact routing key.
    Direct,
    /// Routes to every bound queue.
    Fanout,
    /// Routes on routing key patterns.
    Topic,
    /// Routes on message headers.
    Headers,
}

impl ExchangeKind {
    /// Broker-side type name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Fanout => "fanout",
            Self::Topic => "topic",
            Self::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exchange a destination queue is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeBinding {
    /// Exchange name.
    pub name: String,
    /// Exchange type.
    #[serde(rename = "type")]
    pub kind: ExchangeKind,
    /// Routing key used both for the binding and for publishing.
    pub routing_key: String,
}

impl ExchangeBinding {
    /// Creates a binding.
    pub fn new(name: impl Into<String>, kind: ExchangeKind, routing_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            routing_key: routing_key.into(),
        }
    }
}

/// A single message body produced for a destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum DeliverablePayload {
    /// UTF-8 text, published as `text/plain`.
    Text(String),
    /// Raw bytes, published as `application/octet-stream`.
    Binary(Vec<u8>),
    /// JSON value, published as `application/json`.
    Structured(serde_json::Value),
}

impl DeliverablePayload {
    /// Wire bytes.
    ///
    /// # Errors
    ///
    /// Only structured payloads can fail, if the value cannot be serialized.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Self::Text(text) => Ok(text.as_bytes().to_vec()),
            Self::Binary(bytes) => Ok(bytes.clone()),
            Self::Structured(value) => serde_json::to_vec(value),
        }
    }

    /// Content type announced to the broker.
    #[must_use]
    pub const fn content_type(&self) -> &'static str {
        match self {
            Self::Text(_) => "text/plain",
            Self::Binary(_) => "application/octet-stream",
            Self::Structured(_) => "application/json",
        }
    }
}

impl From<serde_json::Value> for DeliverablePayload {
    fn from(value: serde_json::Value) -> Self {
        Self::Structured(value)
    }
}

impl From<String> for DeliverablePayload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Vec<u8>> for DeliverablePayload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(bytes)
    }
}

/// Result of applying a transform.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformOutput {
    /// Nothing to publish for this event.
    None,
    /// A single message.
    One(DeliverablePayload),
    /// Several messages, published in order.
    Many(Vec<DeliverablePayload>),
}

impl TransformOutput {
    /// Flattens into the list of payloads to publish.
    #[must_use]
    pub fn into_payloads(self) -> Vec<DeliverablePayload> {
        match self {
            Self::None => Vec::new(),
            Self::One(payload) => vec![payload],
            Self::Many(payloads) => payloads,
        }
    }
}

/// User transform: receives the normalized record and the watched collection's
/// name.
pub type Transform = Arc<dyn Fn(&ChangeRecord, &str) -> TransformOutput + Send + Sync>;

/// Transform used when a destination has none: `{"data": record, "collection": name}`.
#[must_use]
pub fn default_transform(record: &ChangeRecord, collection: &str) -> TransformOutput {
    match serde_json::to_value(record) {
        Ok(data) => TransformOutput::One(DeliverablePayload::Structured(serde_json::json!({
            "data": data,
            "collection": collection,
        }))),
        Err(e) => {
            tracing::error!(
                id = %record.id,
                collection,
                error = %e,
                "Failed to serialize change record, skipping"
            );
            TransformOutput::None
        }
    }
}

/// Serializable identity of a destination: where a message goes, without the
/// transform. Stored alongside spooled messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationTarget {
    /// Queue name.
    pub queue: String,
    /// Exchange to publish through, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange: Option<ExchangeBinding>,
}

impl DestinationTarget {
    /// Exchange name to publish to; empty for the default exchange.
    #[must_use]
    pub fn exchange_name(&self) -> &str {
        self.exchange.as_ref().map_or("", |e| e.name.as_str())
    }

    /// Routing key to publish with. Direct-to-queue publishing uses the queue
    /// name on the default exchange.
    #[must_use]
    pub fn routing_key(&self) -> &str {
        self.exchange
            .as_ref()
            .map_or(self.queue.as_str(), |e| e.routing_key.as_str())
    }
}

impl fmt::Display for DestinationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.exchange {
            Some(exchange) => write!(
                f,
                "{} via {}({})",
                self.queue, exchange.name, exchange.routing_key
            ),
            None => f.write_str(&self.queue),
        }
    }
}

/// One delivery target.
#[derive(Clone)]
pub struct Destination {
    /// Queue name, unique within a relay.
    pub name: String,
    /// Exchange the queue is bound to.
    pub exchange: Option<ExchangeBinding>,
    /// Custom transform; requires structured formatting.
    pub transform: Option<Transform>,
}

impl Destination {
    /// Destination publishing straight to `name`.
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exchange: None,
            transform: None,
        }
    }

    /// Route through an exchange.
    #[must_use]
    pub fn with_exchange(mut self, exchange: ExchangeBinding) -> Self {
        self.exchange = Some(exchange);
        self
    }

    /// Attach a transform.
    #[must_use]
    pub fn with_transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(&ChangeRecord, &str) -> TransformOutput + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(transform));
        self
    }

    /// Serializable target for this destination.
    #[must_use]
    pub fn target(&self) -> DestinationTarget {
        DestinationTarget {
            queue: self.name.clone(),
            exchange: self.exchange.clone(),
        }
    }

    /// Runs the configured transform, or the default one.
    #[must_use]
    pub fn apply(&self, record: &ChangeRecord, collection: &str) -> TransformOutput {
        match &self.transform {
            Some(transform) => transform(record, collection),
            None => default_transform(record, collection),
        }
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Destination")
            .field("name", &self.name)
            .field("exchange", &self.exchange)
            .field("transform", &self.transform.as_ref().map(|_| "<fn>"))
            .finish()
    }
}
