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

//! Fakes shared by the integration tests: a scripted change feed and
//! failure-injecting wrappers around the in-memory stores.

#![allow(dead_code)]

use async_trait::async_trait;
use bson::{doc, Document};
use burrow_core::broker::{ConnectionState, PublishRequest};
use burrow_core::event::{ChangeEvent, Namespace, OperationType};
use burrow_core::spool::{FailureSpool, SpoolError, SpooledMessage};
use burrow_core::state::{PositionRecord, PositionStore, StateStoreError};
use burrow_core::stream::{ChangeFeed, EventStream, StreamError};
use burrow_stores::memory::{MemoryPositionStore, MemorySpool};
use chrono::Utc;
use futures::channel::mpsc;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Insert event for document `seq` with resume token `seq`.
pub fn insert_event(collection: &str, seq: u32) -> ChangeEvent {
    ChangeEvent {
        operation: OperationType::Insert,
        namespace: Namespace::new("shop", collection),
        document_key: Some(doc! { "_id": seq.to_string() }),
        full_document: Some(doc! { "_id": seq.to_string(), "n": i64::from(seq) }),
        update_description: None,
        cluster_time: Utc::now(),
        resume_token: token(seq),
    }
}

/// Resume token of event `seq`.
pub fn token(seq: u32) -> Document {
    doc! { "_data": format!("{seq:08}") }
}

/// `data.id` of every published default-transform message.
pub fn published_ids(requests: &[PublishRequest]) -> Vec<String> {
    requests
        .iter()
        .map(|r| {
            let body: serde_json::Value = serde_json::from_slice(&r.body).unwrap();
            body["data"]["id"].as_str().unwrap().to_string()
        })
        .collect()
}

/// Polls `check` until it holds, panicking after five seconds.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Waits until the committed position of `collection` is `expected`.
pub async fn committed(positions: &FlakyPositions, collection: &str, expected: &Document) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while positions.position(collection).await.as_ref() != Some(expected) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {collection} to commit {expected}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[derive(Default)]
struct FeedLog {
    events: Vec<ChangeEvent>,
    live: Option<mpsc::UnboundedSender<Result<ChangeEvent, StreamError>>>,
}

/// Change feed over an in-memory event log.
///
/// `open(Some(token))` replays every logged event after `token` and then
/// follows new ones; `open(None)` only follows new ones.
pub struct ScriptedFeed {
    collection: String,
    connected: AtomicBool,
    fail_connect: AtomicBool,
    log: Mutex<FeedLog>,
    opens: Mutex<Vec<Option<Document>>>,
}

impl ScriptedFeed {
    pub fn new(collection: &str) -> Self {
        Self {
            collection: collection.to_string(),
            connected: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            log: Mutex::new(FeedLog::default()),
            opens: Mutex::new(Vec::new()),
        }
    }

    /// Writes an event to the collection.
    pub fn emit(&self, event: ChangeEvent) {
        let mut log = lock(&self.log);
        log.events.push(event.clone());
        if let Some(live) = &log.live {
            let _ = live.unbounded_send(Ok(event));
        }
    }

    /// Breaks the currently open stream.
    pub fn fail_stream(&self, error: StreamError) {
        if let Some(live) = lock(&self.log).live.take() {
            let _ = live.unbounded_send(Err(error));
        }
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// `resume_after` of every `open` call.
    pub fn opens(&self) -> Vec<Option<Document>> {
        lock(&self.opens).clone()
    }
}

#[async_trait]
impl ChangeFeed for ScriptedFeed {
    fn collection(&self) -> &str {
        &self.collection
    }

    async fn connect(&self) -> Result<(), StreamError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(StreamError::Connection {
                message: "simulated connect failure".to_string(),
                source: None,
                code: Some(6),
                labels: Vec::new(),
            });
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        if self.connected.load(Ordering::SeqCst) {
            ConnectionState::Ready
        } else {
            ConnectionState::Disconnected
        }
    }

    async fn open(&self, resume_after: Option<Document>) -> Result<EventStream, StreamError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(StreamError::NotConnected);
        }
        lock(&self.opens).push(resume_after.clone());

        let (tx, rx) = mpsc::unbounded();
        let mut log = lock(&self.log);

        if let Some(position) = &resume_after {
            let start = log
                .events
                .iter()
                .position(|e| &e.resume_token == position)
                .map_or(log.events.len(), |i| i + 1);
            for event in &log.events[start..] {
                let _ = tx.unbounded_send(Ok(event.clone()));
            }
        }
        log.live = Some(tx);

        Ok(rx.boxed())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        lock(&self.log).live = None;
    }
}

/// [`MemoryPositionStore`] whose commits can be made to fail.
#[derive(Default)]
pub struct FlakyPositions {
    store: MemoryPositionStore,
    fail_commits: AtomicBool,
}

impl FlakyPositions {
    /// Committed position of `collection`.
    pub async fn position(&self, collection: &str) -> Option<Document> {
        self.store
            .load(collection)
            .await
            .ok()
            .flatten()
            .map(|r| r.last_position)
    }

    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PositionStore for FlakyPositions {
    async fn load(&self, collection: &str) -> Result<Option<PositionRecord>, StateStoreError> {
        self.store.load(collection).await
    }

    async fn commit(
        &self,
        collection: &str,
        position: &Document,
        description: Option<Document>,
    ) -> Result<(), StateStoreError> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(StateStoreError::Connection("simulated outage".to_string()));
        }
        self.store.commit(collection, position, description).await
    }

    async fn delete(&self, collection: &str) -> Result<(), StateStoreError> {
        self.store.delete(collection).await
    }

    async fn list(&self) -> Result<HashMap<String, PositionRecord>, StateStoreError> {
        self.store.list().await
    }

    async fn close(&self) -> Result<(), StateStoreError> {
        self.store.close().await
    }
}

/// [`MemorySpool`] whose appends can be made to fail.
#[derive(Default)]
pub struct FlakySpool {
    spool: MemorySpool,
    fail_appends: AtomicBool,
}

impl FlakySpool {
    /// Spooled messages in append order, without draining.
    pub async fn snapshot(&self) -> Vec<SpooledMessage> {
        self.spool.snapshot().await
    }

    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl FailureSpool for FlakySpool {
    async fn append(&self, message: SpooledMessage) -> Result<(), SpoolError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(SpoolError::Storage("simulated outage".to_string()));
        }
        self.spool.append(message).await
    }

    async fn drain_all(&self) -> Result<Vec<SpooledMessage>, SpoolError> {
        self.spool.drain_all().await
    }

    async fn len(&self) -> Result<usize, SpoolError> {
        self.spool.len().await
    }
}
