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

//! Metrics instrumentation for the relay.
//!
//! Uses the `metrics` facade; install any recorder (for example
//! `metrics-exporter-prometheus`) to export them. Without a recorder every
//! call is a no-op.
//!
//! # Naming
//!
//! - prefixed with `burrow_`
//! - counters end in `_total`
//! - durations end in `_seconds`
//!
//! # Labels
//!
//! Only low-cardinality values are used as labels: collection, destination
//! (queue name), operation kind, error type and origin (`live` / `replay`).
//! Never document ids or error messages.
//!
//! ```rust
//! use burrow_core::metrics::{self, ErrorCategory};
//!
//! metrics::increment_events_processed("orders", "insert");
//! metrics::increment_messages_spooled("audit", ErrorCategory::Timeout);
//! metrics::set_broker_status(metrics::ConnectionStatus::Up);
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

#[doc(hidden)]
pub const METRIC_PREFIX: &str = "burrow";

#[doc(hidden)]
pub const EVENTS_PROCESSED_TOTAL: &str = "burrow_events_processed_total";

const EVENTS_FAILED_TOTAL: &str = "burrow_events_failed_total";

#[doc(hidden)]
pub const MESSAGES_PUBLISHED_TOTAL: &str = "burrow_messages_published_total";

const MESSAGES_SPOOLED_TOTAL: &str = "burrow_messages_spooled_total";

const MESSAGES_REQUEUED_TOTAL: &str = "burrow_messages_requeued_total";

const SPOOL_REPLAYS_TOTAL: &str = "burrow_spool_replays_total";

const BROKER_RECONNECTS_TOTAL: &str = "burrow_broker_reconnects_total";

const WATCHER_RESTARTS_TOTAL: &str = "burrow_watcher_restarts_total";

#[doc(hidden)]
pub const PUBLISH_DURATION_SECONDS: &str = "burrow_publish_duration_seconds";

const FANOUT_DURATION_SECONDS: &str = "burrow_fanout_duration_seconds";

const ACTIVE_WATCHERS: &str = "burrow_active_watchers";

const BROKER_STATUS: &str = "burrow_broker_status";

const DATABASE_STATUS: &str = "burrow_database_status";

const SPOOL_DEPTH: &str = "burrow_spool_depth";

/// Registers descriptions for all metrics. Call once after installing a
/// recorder.
pub fn init_metrics() {
    describe_counter!(
        EVENTS_PROCESSED_TOTAL,
        "Change events fully handled (delivered or spooled) and committed"
    );
    describe_counter!(
        EVENTS_FAILED_TOTAL,
        "Change events that could not be handled and will be redelivered"
    );
    describe_counter!(
        MESSAGES_PUBLISHED_TOTAL,
        "Messages accepted by the broker"
    );
    describe_counter!(
        MESSAGES_SPOOLED_TOTAL,
        "Messages written to the failure spool after a failed publish"
    );
    describe_counter!(
        MESSAGES_REQUEUED_TOTAL,
        "Spooled messages put back after failing again during replay"
    );
    describe_counter!(SPOOL_REPLAYS_TOTAL, "Spool replay passes");
    describe_counter!(
        BROKER_RECONNECTS_TOTAL,
        "Broker reconnections performed by the health supervisor"
    );
    describe_counter!(
        WATCHER_RESTARTS_TOTAL,
        "Change stream restarts after errors or reinitialization"
    );

    describe_histogram!(
        PUBLISH_DURATION_SECONDS,
        metrics::Unit::Seconds,
        "Time from publish start to broker confirmation"
    );
    describe_histogram!(
        FANOUT_DURATION_SECONDS,
        metrics::Unit::Seconds,
        "Time to deliver one event to all destinations"
    );

    describe_gauge!(
        ACTIVE_WATCHERS,
        metrics::Unit::Count,
        "Change feed watchers currently running"
    );
    describe_gauge!(BROKER_STATUS, "Broker connection: 0=down, 1=up");
    describe_gauge!(DATABASE_STATUS, "Database connection per collection: 0=down, 1=up");
    describe_gauge!(
        SPOOL_DEPTH,
        metrics::Unit::Count,
        "Messages left in the failure spool after the last replay"
    );
}

/// Event handled for `collection`.
pub fn increment_events_processed(collection: &str, operation: &str) {
    counter!(EVENTS_PROCESSED_TOTAL, "collection" => collection.to_string(), "operation" => operation.to_string())
        .increment(1);
}

/// Event left unhandled for `collection`.
pub fn increment_events_failed(collection: &str, error_category: ErrorCategory) {
    counter!(EVENTS_FAILED_TOTAL, "collection" => collection.to_string(), "error_type" => error_category.as_str())
        .increment(1);
}

/// Message accepted by the broker.
pub fn increment_messages_published(destination: &str, origin: &'static str) {
    counter!(MESSAGES_PUBLISHED_TOTAL, "destination" => destination.to_string(), "origin" => origin)
        .increment(1);
}

/// Message written to the spool.
pub fn increment_messages_spooled(destination: &str, error_category: ErrorCategory) {
    counter!(MESSAGES_SPOOLED_TOTAL, "destination" => destination.to_string(), "error_type" => error_category.as_str())
        .increment(1);
}

/// Spooled messages put back during replay.
pub fn increment_messages_requeued_by(count: u64, destination: &str) {
    counter!(MESSAGES_REQUEUED_TOTAL, "destination" => destination.to_string()).increment(count);
}

/// One spool replay pass.
pub fn increment_spool_replays() {
    counter!(SPOOL_REPLAYS_TOTAL).increment(1);
}

/// Supervisor re-established the broker connection.
pub fn increment_broker_reconnects() {
    counter!(BROKER_RECONNECTS_TOTAL).increment(1);
}

/// Watcher dropped its stream and started over.
pub fn increment_watcher_restarts(collection: &str, reason: &'static str) {
    counter!(WATCHER_RESTARTS_TOTAL, "collection" => collection.to_string(), "reason" => reason)
        .increment(1);
}

/// Publish latency.
pub fn record_publish_duration(duration: Duration, destination: &str) {
    histogram!(PUBLISH_DURATION_SECONDS, "destination" => destination.to_string())
        .record(duration.as_secs_f64());
}

/// Fan-out latency for one event.
pub fn record_fanout_duration(duration: Duration, collection: &str) {
    histogram!(FANOUT_DURATION_SECONDS, "collection" => collection.to_string())
        .record(duration.as_secs_f64());
}

/// Number of running watchers.
pub fn set_active_watchers(count: usize) {
    gauge!(ACTIVE_WATCHERS).set(count as f64);
}

/// Broker connection status.
pub fn set_broker_status(status: ConnectionStatus) {
    gauge!(BROKER_STATUS).set(f64::from(status as u8));
}

/// Database connection status for a watched collection.
pub fn set_database_status(collection: &str, status: ConnectionStatus) {
    gauge!(DATABASE_STATUS, "collection" => collection.to_string()).set(f64::from(status as u8));
}

/// Messages still spooled after a replay.
pub fn set_spool_depth(depth: usize) {
    gauge!(SPOOL_DEPTH).set(depth as f64);
}

/// Gauge values for connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionStatus {
    /// Not connected.
    Down = 0,
    /// Connected and healthy.
    Up = 1,
}

/// Error categories used as the `error_type` label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Operation exceeded its deadline.
    Timeout,
    /// Connection refused, dropped or missing.
    Connection,
    /// Payload or document could not be encoded.
    Serialization,
    /// Invalid configuration or declaration.
    Validation,
    /// Persistence (position store or spool) failed.
    Storage,
    /// A user transform panicked.
    Transform,
    /// Anything else.
    Unknown,
}

impl ErrorCategory {
    /// Label value.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout_error",
            Self::Connection => "connection_error",
            Self::Serialization => "serialization_error",
            Self::Validation => "validation_error",
            Self::Storage => "storage_error",
            Self::Transform => "transform_error",
            Self::Unknown => "unknown_error",
        }
    }
}

/// Records the elapsed time through `record_fn` when dropped.
///
/// ```rust
/// use burrow_core::metrics::{self, Timer};
///
/// {
///     let _timer = Timer::new("orders", |d, label| metrics::record_fanout_duration(d, label));
///     // deliver...
/// }
/// ```
pub struct Timer<F>
where
    F: FnOnce(Duration, &str),
{
    start: std::time::Instant,
    label: String,
    record_fn: Option<F>,
}

impl<F> Timer<F>
where
    F: FnOnce(Duration, &str),
{
    /// Starts timing.
    pub fn new(label: impl Into<String>, record_fn: F) -> Self {
        Self {
            start: std::time::Instant::now(),
            label: label.into(),
            record_fn: Some(record_fn),
        }
    }
}

impl<F> Drop for Timer<F>
where
    F: FnOnce(Duration, &str),
{
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        if let Some(record_fn) = self.record_fn.take() {
            record_fn(duration, &self.label);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_category_labels_are_distinct() {
        let all = [
            ErrorCategory::Timeout,
            ErrorCategory::Connection,
            ErrorCategory::Serialization,
            ErrorCategory::Validation,
            ErrorCategory::Storage,
            ErrorCategory::Transform,
            ErrorCategory::Unknown,
        ];
        let labels: std::collections::HashSet<_> = all.iter().map(ErrorCategory::as_str).collect();
        assert_eq!(labels.len(), all.len());
        assert!(labels.iter().all(|l| l.ends_with("_error")));
    }

    #[test]
    fn helpers_are_noops_without_recorder() {
        init_metrics();
        increment_events_processed("orders", "insert");
        increment_messages_published("audit", "live");
        increment_messages_spooled("audit", ErrorCategory::Timeout);
        record_publish_duration(Duration::from_millis(3), "audit");
        set_broker_status(ConnectionStatus::Up);
        set_spool_depth(0);
    }
}
