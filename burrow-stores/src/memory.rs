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

//! In-memory position store and failure spool.
//!
//! Suitable for tests, local development and single-process deployments that
//! can afford to forget positions on restart.
//!
//! # Limitations
//!
//! - **No persistence**: positions and spooled messages are lost on restart
//! - **Single process only**: cannot be shared across instances
//!
//! Use the `MongoDB` or Redis backends when either matters.
//!
//! # Example
//!
//! ```rust
//! use burrow_stores::memory::{MemoryPositionStore, MemorySpool};
//! use burrow_core::state::PositionStore;
//! use bson::doc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let positions = MemoryPositionStore::new();
//! positions.commit("orders", &doc! { "_data": "token" }, None).await?;
//!
//! let record = positions.load("orders").await?.unwrap();
//! assert_eq!(record.last_position, doc! { "_data": "token" });
//!
//! let spool = MemorySpool::new();
//! # let _ = spool;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use bson::Document;
use burrow_core::spool::{sort_oldest_first, FailureSpool, SpoolError, SpooledMessage};
use burrow_core::state::{PositionRecord, PositionStore, StateStoreError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, trace};

/// In-memory [`PositionStore`]: one record per collection in a map.
///
/// Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct MemoryPositionStore {
    records: Arc<RwLock<HashMap<String, PositionRecord>>>,
}

impl MemoryPositionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        debug!("Creating in-memory position store");
        Self::default()
    }

    /// Creates a store with pre-populated records.
    #[must_use]
    pub fn with_records(records: HashMap<String, PositionRecord>) -> Self {
        debug!(count = records.len(), "Creating in-memory position store with records");
        Self {
            records: Arc::new(RwLock::new(records)),
        }
    }

    /// Number of tracked collections.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// True when no collection is tracked.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl PositionStore for MemoryPositionStore {
    async fn load(&self, collection: &str) -> Result<Option<PositionRecord>, StateStoreError> {
        let record = self.records.read().await.get(collection).cloned();
        trace!(collection, found = record.is_some(), "Loaded position");
        Ok(record)
    }

    async fn commit(
        &self,
        collection: &str,
        position: &Document,
        description: Option<Document>,
    ) -> Result<(), StateStoreError> {
        let record = PositionRecord::new(collection, position.clone(), description);
        self.records
            .write()
            .await
            .insert(collection.to_string(), record);
        trace!(collection, "Committed position");
        Ok(())
    }

    async fn delete(&self, collection: &str) -> Result<(), StateStoreError> {
        let removed = self.records.write().await.remove(collection).is_some();
        debug!(collection, removed, "Deleted position");
        Ok(())
    }

    async fn list(&self) -> Result<HashMap<String, PositionRecord>, StateStoreError> {
        Ok(self.records.read().await.clone())
    }

    async fn close(&self) -> Result<(), StateStoreError> {
        debug!("Closing in-memory position store");
        Ok(())
    }
}

/// In-memory [`FailureSpool`].
///
/// Appends and drains take the same lock, so an append racing a drain lands
/// either in that drain or in the next one.
#[derive(Debug, Clone, Default)]
pub struct MemorySpool {
    messages: Arc<Mutex<Vec<SpooledMessage>>>,
}

impl MemorySpool {
    /// Creates an empty spool.
    #[must_use]
    pub fn new() -> Self {
        debug!("Creating in-memory failure spool");
        Self::default()
    }

    /// Copy of the spooled messages in append order, without draining.
    pub async fn snapshot(&self) -> Vec<SpooledMessage> {
        self.messages.lock().await.clone()
    }
}

#[async_trait]
impl FailureSpool for MemorySpool {
    async fn append(&self, message: SpooledMessage) -> Result<(), SpoolError> {
        let mut messages = self.messages.lock().await;
        messages.push(message);
        trace!(depth = messages.len(), "Spooled message");
        Ok(())
    }

    async fn drain_all(&self) -> Result<Vec<SpooledMessage>, SpoolError> {
        let mut drained = std::mem::take(&mut *self.messages.lock().await);
        sort_oldest_first(&mut drained);
        debug!(count = drained.len(), "Drained spool");
        Ok(drained)
    }

    async fn len(&self) -> Result<usize, SpoolError> {
        Ok(self.messages.lock().await.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use burrow_core::destination::{DeliverablePayload, Destination};
    use chrono::{Duration, Utc};

    fn message(queue: &str, text: &str) -> SpooledMessage {
        SpooledMessage::new(
            Destination::queue(queue).target(),
            DeliverablePayload::Text(text.to_string()),
            "timeout",
        )
    }

    fn text(message: &SpooledMessage) -> &str {
        match &message.payload {
            DeliverablePayload::Text(t) => t,
            _ => "",
        }
    }

    #[tokio::test]
    async fn commit_replaces_previous_position() {
        let store = MemoryPositionStore::new();
        store.commit("orders", &doc! { "_data": "1" }, None).await.unwrap();
        store
            .commit(
                "orders",
                &doc! { "_data": "2" },
                Some(doc! { "operationType": "insert" }),
            )
            .await
            .unwrap();

        assert_eq!(store.len().await, 1);
        let record = store.load("orders").await.unwrap().unwrap();
        assert_eq!(record.last_position, doc! { "_data": "2" });
        assert_eq!(record.description, Some(doc! { "operationType": "insert" }));
    }

    #[tokio::test]
    async fn load_missing_collection() {
        let store = MemoryPositionStore::new();
        assert!(store.load("orders").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_and_list() {
        let store = MemoryPositionStore::new();
        store.commit("orders", &doc! { "_data": "1" }, None).await.unwrap();
        store.commit("users", &doc! { "_data": "2" }, None).await.unwrap();

        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["users"].last_position, doc! { "_data": "2" });

        store.delete("orders").await.unwrap();
        store.delete("orders").await.unwrap();
        assert!(store.load("orders").await.unwrap().is_none());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn clones_share_records() {
        let store = MemoryPositionStore::new();
        let clone = store.clone();
        clone.commit("orders", &doc! { "_data": "1" }, None).await.unwrap();
        assert!(store.load("orders").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn drain_returns_oldest_first_and_clears() {
        let spool = MemorySpool::new();
        let now = Utc::now();

        let mut late = message("audit", "late");
        late.created_at = now;
        let mut early = message("audit", "early");
        early.created_at = now - Duration::seconds(5);
        let mut tie = message("search", "tie");
        tie.created_at = now;

        spool.append(late).await.unwrap();
        spool.append(early).await.unwrap();
        spool.append(tie).await.unwrap();
        assert_eq!(spool.len().await.unwrap(), 3);

        let drained = spool.drain_all().await.unwrap();
        let order: Vec<_> = drained.iter().map(text).collect();
        assert_eq!(order, vec!["early", "late", "tie"]);
        assert!(spool.is_empty().await.unwrap());
        assert!(spool.drain_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn append_racing_drain_is_not_lost() {
        let spool = MemorySpool::new();
        for i in 0..100 {
            spool.append(message("audit", &i.to_string())).await.unwrap();
        }

        let appender = {
            let spool = spool.clone();
            tokio::spawn(async move { spool.append(message("audit", "racer")).await })
        };
        let first = spool.drain_all().await.unwrap();
        appender.await.unwrap().unwrap();
        let second = spool.drain_all().await.unwrap();

        let total: Vec<_> = first.iter().chain(second.iter()).map(text).collect();
        assert_eq!(total.len(), 101);
        assert_eq!(total.iter().filter(|t| **t == "racer").count(), 1);
    }
}
