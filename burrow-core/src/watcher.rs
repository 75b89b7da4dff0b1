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

//! Per-collection change stream consumer.
//!
//! A [`ChangeFeedWatcher`] drives one collection:
//!
//! ```text
//!            ┌──────────── backoff ◀──────────┐
//!            ▼                                 │
//! Stopped ─▶ Connecting ─▶ Streaming ──error──▶ Error
//!                ▲             │
//!                └─reinitialize┘
//! ```
//!
//! Events are handled strictly one at a time: normalize, deliver to every
//! destination, then commit the position. If delivery or commit fails the
//! stream is dropped and reopened from the last committed position, so the
//! event is seen again.

use crate::broker::ConnectionState;
use crate::delivery::DeliveryPipeline;
use crate::event::{ChangeEvent, OperationType};
use crate::metrics::{self, ConnectionStatus, ErrorCategory};
use crate::record::ChangeRecord;
use crate::state::PositionStore;
use crate::stream::{ChangeFeed, ChangeStreamConfig, StreamError};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Notify};
use tracing::{debug, error, info, instrument, warn};

/// Lifecycle of a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WatcherState {
    /// Not running.
    #[default]
    Stopped,
    /// Connecting or opening the stream.
    Connecting,
    /// Stream open, events flowing.
    Streaming,
    /// Last session failed; waiting to retry.
    Error,
}

/// Cheap handle for observing and poking a running watcher.
#[derive(Clone)]
pub struct WatcherHandle {
    collection: String,
    reinit: Arc<Notify>,
    state: watch::Receiver<WatcherState>,
    feed: Arc<dyn ChangeFeed>,
}

impl std::fmt::Debug for WatcherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatcherHandle")
            .field("collection", &self.collection)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl WatcherHandle {
    /// Watched collection.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Asks the watcher to drop its stream and reopen it from the last
    /// committed position. Requests made while the watcher is between
    /// streams are kept until the next stream is open.
    pub fn reinitialize(&self) {
        self.reinit.notify_one();
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> WatcherState {
        *self.state.borrow()
    }

    /// True when the database connection is up and the stream is open.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.state() == WatcherState::Streaming && self.feed.state() == ConnectionState::Ready
    }

    /// Waits until the watcher reaches `target`.
    ///
    /// Returns `false` if the watcher was dropped first.
    pub async fn wait_for(&mut self, target: WatcherState) -> bool {
        self.state.wait_for(|s| *s == target).await.is_ok()
    }
}

/// How a streaming session ended.
enum SessionEnd {
    Shutdown,
    Reinitialize,
    Failed(&'static str),
}

/// Consumes the change stream of one collection.
pub struct ChangeFeedWatcher {
    feed: Arc<dyn ChangeFeed>,
    positions: Arc<dyn PositionStore>,
    pipeline: DeliveryPipeline,
    config: ChangeStreamConfig,
    reinit: Arc<Notify>,
    state: watch::Sender<WatcherState>,
}

impl std::fmt::Debug for ChangeFeedWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeedWatcher")
            .field("collection", &self.feed.collection())
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl ChangeFeedWatcher {
    /// Creates a stopped watcher.
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        positions: Arc<dyn PositionStore>,
        pipeline: DeliveryPipeline,
        config: ChangeStreamConfig,
    ) -> Self {
        let (state, _) = watch::channel(WatcherState::Stopped);
        Self {
            feed,
            positions,
            pipeline,
            config,
            reinit: Arc::new(Notify::new()),
            state,
        }
    }

    /// Handle for health checks and reinitialization.
    #[must_use]
    pub fn handle(&self) -> WatcherHandle {
        WatcherHandle {
            collection: self.feed.collection().to_string(),
            reinit: Arc::clone(&self.reinit),
            state: self.state.subscribe(),
            feed: Arc::clone(&self.feed),
        }
    }

    /// Runs until `shutdown` fires. Connection and stream failures are
    /// retried forever with exponential backoff.
    #[instrument(skip_all, fields(collection = %self.feed.collection()))]
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let collection = self.feed.collection().to_string();
        let _stopped = StoppedOnExit(&self.state);
        info!("Starting watcher");
        let mut attempt: u32 = 0;

        loop {
            self.set_state(WatcherState::Connecting);

            match self.session(&collection, &mut shutdown, &mut attempt).await {
                SessionEnd::Shutdown => break,
                SessionEnd::Reinitialize => {
                    info!("Reinitializing change stream");
                    metrics::increment_watcher_restarts(&collection, "reinitialize");
                }
                SessionEnd::Failed(reason) => {
                    self.set_state(WatcherState::Error);
                    metrics::increment_watcher_restarts(&collection, reason);
                    self.feed.disconnect().await;
                    metrics::set_database_status(&collection, ConnectionStatus::Down);

                    attempt = attempt.saturating_add(1);
                    let delay = self.config.calculate_backoff(attempt);
                    warn!(reason, attempt, ?delay, "Watcher session ended, retrying");

                    tokio::select! {
                        _ = shutdown.recv() => break,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.feed.disconnect().await;
        info!("Watcher stopped");
    }

    /// Connects, opens the stream and handles events until something ends it.
    async fn session(
        &self,
        collection: &str,
        shutdown: &mut broadcast::Receiver<()>,
        attempt: &mut u32,
    ) -> SessionEnd {
        if !self.feed.is_healthy() {
            let connected = tokio::select! {
                _ = shutdown.recv() => return SessionEnd::Shutdown,
                result = self.feed.connect() => result,
            };
            if let Err(e) = connected {
                error!(error = %e, retryable = e.is_retryable(), "Failed to connect to database");
                return SessionEnd::Failed("connect");
            }
        }
        metrics::set_database_status(collection, ConnectionStatus::Up);

        let position = match self.positions.load(collection).await {
            Ok(position) => position,
            Err(e) => {
                error!(error = %e, "Failed to load stream position");
                return SessionEnd::Failed("position_load");
            }
        };

        let resume_after = position.map(|p| p.last_position);
        if let Some(token) = &resume_after {
            info!(?token, "Resuming after committed position");
        } else {
            info!("No committed position, starting at the current tail");
        }

        let mut events = match self.feed.open(resume_after).await {
            Ok(events) => events,
            Err(e) => {
                log_open_error(&e);
                return SessionEnd::Failed(e.category());
            }
        };

        self.set_state(WatcherState::Streaming);
        *attempt = 0;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    info!("Received shutdown signal");
                    return SessionEnd::Shutdown;
                }

                () = self.reinit.notified() => return SessionEnd::Reinitialize,

                next = events.next() => match next {
                    Some(Ok(event)) => {
                        if let Err(reason) = self.handle_event(collection, &event).await {
                            return SessionEnd::Failed(reason);
                        }
                    }
                    Some(Err(e)) => {
                        if matches!(e, StreamError::InvalidResumeToken { .. }) {
                            log_open_error(&e);
                        } else {
                            error!(error = %e, "Error reading from change stream");
                        }
                        return SessionEnd::Failed(e.category());
                    }
                    None => {
                        warn!("Change stream ended unexpectedly");
                        return SessionEnd::Failed("stream_ended");
                    }
                },
            }
        }
    }

    /// Normalize, deliver, commit. An error means the event is not handled
    /// and the stream must be reopened.
    async fn handle_event(&self, collection: &str, event: &ChangeEvent) -> Result<(), &'static str> {
        debug!(operation = %event.operation.as_str(), "Received event");

        let record = ChangeRecord::normalize(event);

        if let Err(failures) = self.pipeline.deliver(event, &record, collection).await {
            for failure in &failures {
                error!(
                    destination = %failure.destination,
                    error = %failure.error,
                    "Message neither published nor spooled"
                );
            }
            metrics::increment_events_failed(collection, ErrorCategory::Storage);
            return Err("delivery_failed");
        }

        // The server rejects resuming after an invalidate, so the next
        // stream starts at the tail of the recreated collection.
        if event.operation == OperationType::Invalidate {
            warn!("Change stream invalidated, discarding committed position");
            if let Err(e) = self.positions.delete(collection).await {
                error!(error = %e, "Failed to discard position after invalidate");
            }
            return Err("invalidated");
        }

        if let Err(e) = self
            .positions
            .commit(
                collection,
                &event.resume_token,
                Some(event.position_description()),
            )
            .await
        {
            error!(error = %e, "Failed to commit position, event will be redelivered");
            metrics::increment_events_failed(collection, ErrorCategory::Storage);
            return Err("commit_failed");
        }

        metrics::increment_events_processed(collection, record.operation.as_str());
        Ok(())
    }

    fn set_state(&self, state: WatcherState) {
        self.state.send_replace(state);
    }
}

/// Publishes [`WatcherState::Stopped`] however `run` ends, unwinding and
/// task abort included.
struct StoppedOnExit<'a>(&'a watch::Sender<WatcherState>);

impl Drop for StoppedOnExit<'_> {
    fn drop(&mut self) {
        self.0.send_replace(WatcherState::Stopped);
    }
}

fn log_open_error(e: &StreamError) {
    match e {
        StreamError::InvalidResumeToken { .. } => error!(
            error = %e,
            "Committed position is no longer in the oplog; delete it to restart from the tail"
        ),
        _ => error!(error = %e, "Failed to open change stream"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_state_is_stopped() {
        assert_eq!(WatcherState::default(), WatcherState::Stopped);
    }

    #[test]
    fn exit_guard_publishes_stopped() {
        let (tx, rx) = watch::channel(WatcherState::Streaming);
        {
            let _stopped = StoppedOnExit(&tx);
            assert_eq!(*rx.borrow(), WatcherState::Streaming);
        }
        assert_eq!(*rx.borrow(), WatcherState::Stopped);
    }

    #[test]
    fn exit_guard_runs_while_unwinding() {
        let (tx, rx) = watch::channel(WatcherState::Streaming);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _stopped = StoppedOnExit(&tx);
            panic!("watcher loop panicked");
        }));
        assert!(result.is_err());
        assert_eq!(*rx.borrow(), WatcherState::Stopped);
    }
}
