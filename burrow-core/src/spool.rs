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

//! Durable storage for messages the broker did not accept.
//!
//! Failed publishes are appended to a [`FailureSpool`] instead of being
//! retried inline, so a broker outage never blocks the change stream. The
//! health supervisor drains the spool and replays it once the broker is back.
//!
//! Implementations must guarantee:
//!
//! - `drain_all` returns messages ordered by `created_at`, ties in append order;
//! - a message appended while a drain runs is either part of that drain or
//!   of the next one, never lost.

use crate::destination::{DeliverablePayload, DestinationTarget};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A message waiting in the spool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpooledMessage {
    /// Where the message was going.
    pub target: DestinationTarget,
    /// Message body.
    pub payload: DeliverablePayload,
    /// Last failure, for operators.
    pub failure_reason: String,
    /// First failure time; kept across requeues.
    pub created_at: DateTime<Utc>,
    /// Replay attempts so far.
    #[serde(default)]
    pub attempts: u32,
}

impl SpooledMessage {
    /// New spool entry stamped now.
    pub fn new(
        target: DestinationTarget,
        payload: DeliverablePayload,
        failure_reason: impl Into<String>,
    ) -> Self {
        Self {
            target,
            payload,
            failure_reason: failure_reason.into(),
            created_at: Utc::now(),
            attempts: 0,
        }
    }

    /// Same message after another failed attempt.
    #[must_use]
    pub fn requeued(mut self, failure_reason: impl Into<String>) -> Self {
        self.failure_reason = failure_reason.into();
        self.attempts = self.attempts.saturating_add(1);
        self
    }
}

/// Errors from [`FailureSpool`] backends.
#[derive(Debug, Error)]
pub enum SpoolError {
    /// Backend unreachable.
    #[error("Spool connection error: {0}")]
    Connection(String),

    /// Entry could not be encoded or decoded.
    #[error("Spool serialization error: {0}")]
    Serialization(String),

    /// Backend rejected the operation.
    #[error("Spool storage error: {0}")]
    Storage(String),
}

/// Append-only failure store.
#[async_trait]
pub trait FailureSpool: Send + Sync {
    /// Appends one message.
    ///
    /// # Errors
    ///
    /// Returns an error if the message was not persisted.
    async fn append(&self, message: SpooledMessage) -> Result<(), SpoolError>;

    /// Removes and returns every spooled message, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the spool could not be read. Nothing is removed in
    /// that case.
    async fn drain_all(&self) -> Result<Vec<SpooledMessage>, SpoolError>;

    /// Number of spooled messages.
    ///
    /// # Errors
    ///
    /// Returns an error if the spool could not be read.
    async fn len(&self) -> Result<usize, SpoolError>;

    /// True when nothing is spooled.
    ///
    /// # Errors
    ///
    /// Returns an error if the spool could not be read.
    async fn is_empty(&self) -> Result<bool, SpoolError> {
        Ok(self.len().await? == 0)
    }
}

/// Sorts drained messages oldest first. The sort is stable, so backends that
/// read in append order keep that order for equal timestamps.
pub fn sort_oldest_first(messages: &mut [SpooledMessage]) {
    messages.sort_by_key(|m| m.created_at);
}
