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

//! Fan-out of one change event to every destination.
//!
//! [`DeliveryPipeline::deliver`] applies each destination's transform and
//! publishes the results with a bounded timeout. Destinations are handled
//! concurrently; the payloads of one destination are published one after the
//! other, in order.
//!
//! A publish that fails or times out is not retried inline: the message goes
//! to the [`FailureSpool`] and the destination counts as handled. The only
//! failure reported back to the caller is a failure to spool, in which case
//! the event must not be committed.
//!
//! [`DeliveryPipeline::replay`] drains the spool and publishes its content
//! again, oldest first, putting back whatever fails.
//!
//! ```rust
//! use burrow_core::broker::{Broker, MockBroker};
//! use burrow_core::delivery::{DeliveryOptions, DeliveryPipeline};
//! use burrow_core::destination::Destination;
//! # use burrow_core::spool::{FailureSpool, SpooledMessage, SpoolError};
//! # #[derive(Default)]
//! # struct Spool(tokio::sync::Mutex<Vec<SpooledMessage>>);
//! # #[async_trait::async_trait]
//! # impl FailureSpool for Spool {
//! #     async fn append(&self, m: SpooledMessage) -> Result<(), SpoolError> { self.0.lock().await.push(m); Ok(()) }
//! #     async fn drain_all(&self) -> Result<Vec<SpooledMessage>, SpoolError> { Ok(std::mem::take(&mut *self.0.lock().await)) }
//! #     async fn len(&self) -> Result<usize, SpoolError> { Ok(self.0.lock().await.len()) }
//! # }
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = Arc::new(MockBroker::new());
//! let pipeline = DeliveryPipeline::new(
//!     vec![Destination::queue("audit"), Destination::queue("search")],
//!     DeliveryOptions::default(),
//!     broker,
//!     Arc::new(Spool::default()),
//! )?;
//! assert_eq!(pipeline.destinations().len(), 2);
//! # Ok(())
//! # }
//! ```

use crate::broker::{Broker, BrokerError, PublishRequest};
use crate::destination::{DeliverablePayload, Destination, DestinationTarget, TransformOutput};
use crate::event::ChangeEvent;
use crate::metrics::{self, ErrorCategory};
use crate::record::ChangeRecord;
use crate::spool::{FailureSpool, SpoolError, SpooledMessage};
use futures::future::join_all;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// Default bound on a single publish.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(30);

/// Delivery behavior shared by all destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryOptions {
    /// Normalize events and run transforms. When off, the raw event is
    /// published as JSON and destinations may not carry transforms.
    pub structured_formatting: bool,
    /// Upper bound on one publish, including broker confirmation.
    pub publish_timeout: Duration,
}

impl Default for DeliveryOptions {
    fn default() -> Self {
        Self {
            structured_formatting: true,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }
}

/// Where a publish attempt comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOrigin {
    /// Fresh change event or ad-hoc publish.
    Live,
    /// Spool replay.
    Replay,
}

impl DeliveryOrigin {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Replay => "replay",
        }
    }
}

/// What happened to one payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Broker accepted it.
    Published,
    /// Publish failed; the message is in the spool.
    Spooled,
    /// Nothing was sent: the payload could not be encoded.
    Dropped,
}

/// Totals for one [`DeliveryPipeline::deliver`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Messages accepted by the broker.
    pub published: usize,
    /// Messages written to the spool.
    pub spooled: usize,
    /// Messages that could not be encoded.
    pub dropped: usize,
    /// Destinations whose transform produced nothing.
    pub skipped_destinations: usize,
    /// Destinations whose transform panicked. Nothing was sent to them.
    pub failed_transforms: usize,
}

impl DeliveryReport {
    fn add(&mut self, outcome: PublishOutcome) {
        match outcome {
            PublishOutcome::Published => self.published += 1,
            PublishOutcome::Spooled => self.spooled += 1,
            PublishOutcome::Dropped => self.dropped += 1,
        }
    }
}

/// A destination for which a message was neither published nor spooled.
#[derive(Debug)]
pub struct DeliveryFailure {
    /// Destination queue name.
    pub destination: String,
    /// Why spooling failed.
    pub error: SpoolError,
}

/// Totals for one [`DeliveryPipeline::replay`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Messages taken from the spool.
    pub drained: usize,
    /// Messages accepted by the broker.
    pub published: usize,
    /// Messages put back into the spool.
    pub requeued: usize,
    /// Messages that could be neither published nor put back.
    pub lost: usize,
}

/// Errors raised while building or running a [`DeliveryPipeline`].
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Invalid destination set or options.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The spool could not be read.
    #[error("Spool error: {0}")]
    Spool(#[from] SpoolError),
}

/// Publishes change events to all destinations, spooling failures.
///
/// Cheap to clone; clones share the broker, spool and destinations.
#[derive(Clone)]
pub struct DeliveryPipeline {
    destinations: Arc<[Destination]>,
    options: DeliveryOptions,
    broker: Arc<dyn Broker>,
    spool: Arc<dyn FailureSpool>,
}

impl std::fmt::Debug for DeliveryPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryPipeline")
            .field("destinations", &self.destinations)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl DeliveryPipeline {
    /// Validates the destination set and builds the pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Configuration`] when:
    /// - a destination has a transform but structured formatting is off
    /// - two destinations share a queue name
    /// - the publish timeout is zero
    pub fn new(
        destinations: Vec<Destination>,
        options: DeliveryOptions,
        broker: Arc<dyn Broker>,
        spool: Arc<dyn FailureSpool>,
    ) -> Result<Self, PipelineError> {
        validate(&destinations, &options)?;

        Ok(Self {
            destinations: destinations.into(),
            options,
            broker,
            spool,
        })
    }

    /// Configured destinations.
    #[must_use]
    pub fn destinations(&self) -> &[Destination] {
        &self.destinations
    }

    /// Delivery options.
    #[must_use]
    pub const fn options(&self) -> &DeliveryOptions {
        &self.options
    }

    /// The shared broker handle.
    #[must_use]
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Number of messages waiting in the spool.
    ///
    /// # Errors
    ///
    /// Returns an error if the spool cannot be read.
    pub async fn spooled(&self) -> Result<usize, SpoolError> {
        self.spool.len().await
    }

    /// Delivers one event to every destination.
    ///
    /// Returns `Ok` once every destination is handled, published or spooled.
    ///
    /// # Errors
    ///
    /// Returns the destinations for which a failed publish could not be
    /// spooled either. The event must then be treated as unhandled.
    #[instrument(skip_all, fields(collection = %collection, id = %record.id))]
    pub async fn deliver(
        &self,
        event: &ChangeEvent,
        record: &ChangeRecord,
        collection: &str,
    ) -> Result<DeliveryReport, Vec<DeliveryFailure>> {
        let started = Instant::now();

        let raw = if self.options.structured_formatting {
            None
        } else {
            match event.to_json() {
                Ok(value) => Some(DeliverablePayload::Structured(value)),
                Err(e) => {
                    error!(error = %e, "Raw event has no JSON form, nothing to deliver");
                    return Ok(DeliveryReport::default());
                }
            }
        };

        let raw = raw.as_ref();
        let results = join_all(self.destinations.iter().map(|destination| async move {
            let payloads = match raw {
                Some(payload) => vec![payload.clone()],
                None => match apply_transform(destination, record, collection) {
                    Some(output) => output.into_payloads(),
                    None => return Ok(DestinationResult::TransformFailed),
                },
            };
            self.deliver_to(destination, payloads).await
        }))
        .await;

        let mut report = DeliveryReport::default();
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(DestinationResult::Skipped) => report.skipped_destinations += 1,
                Ok(DestinationResult::TransformFailed) => {
                    report.failed_transforms += 1;
                    metrics::increment_events_failed(collection, ErrorCategory::Transform);
                }
                Ok(DestinationResult::Sent(outcomes)) => {
                    outcomes.into_iter().for_each(|o| report.add(o));
                }
                Err(failure) => failures.push(failure),
            }
        }

        metrics::record_fanout_duration(started.elapsed(), collection);

        if failures.is_empty() {
            debug!(?report, "Event delivered");
            Ok(report)
        } else {
            Err(failures)
        }
    }

    /// Publishes `payloads` to one destination in order.
    async fn deliver_to(
        &self,
        destination: &Destination,
        payloads: Vec<DeliverablePayload>,
    ) -> Result<DestinationResult, DeliveryFailure> {
        if payloads.is_empty() {
            debug!(destination = %destination.name, "Transform produced no payload");
            return Ok(DestinationResult::Skipped);
        }

        let target = destination.target();
        let mut outcomes = Vec::with_capacity(payloads.len());
        let mut blocked: Option<(String, ErrorCategory)> = None;

        for payload in payloads {
            // After a failure the remaining payloads go straight to the spool
            // so they stay behind the one that failed.
            let outcome = match &blocked {
                Some((reason, category)) => {
                    self.spool_message(&target, payload, reason.clone(), *category)
                        .await?
                }
                None => match self.publish(&target, &payload, DeliveryOrigin::Live).await {
                    Ok(()) => PublishOutcome::Published,
                    Err(PublishFailure::Encode(reason)) => {
                        error!(destination = %target, %reason, "Dropping payload that cannot be encoded");
                        PublishOutcome::Dropped
                    }
                    Err(PublishFailure::Broker(e)) => {
                        let reason = e.to_string();
                        warn!(
                            destination = %target,
                            error = %reason,
                            "Publish failed, spooling message"
                        );
                        blocked = Some((reason.clone(), e.category()));
                        self.spool_message(&target, payload, reason, e.category())
                            .await?
                    }
                },
            };
            outcomes.push(outcome);
        }

        Ok(DestinationResult::Sent(outcomes))
    }

    /// Publishes an ad-hoc payload to `target` with the same timeout and
    /// spool-on-failure handling as change events.
    ///
    /// # Errors
    ///
    /// Returns a [`DeliveryFailure`] only if the publish failed and the
    /// message could not be spooled.
    pub async fn publish_direct(
        &self,
        target: &DestinationTarget,
        payload: DeliverablePayload,
    ) -> Result<PublishOutcome, DeliveryFailure> {
        match self.publish(target, &payload, DeliveryOrigin::Live).await {
            Ok(()) => Ok(PublishOutcome::Published),
            Err(PublishFailure::Encode(reason)) => {
                error!(destination = %target, %reason, "Dropping payload that cannot be encoded");
                Ok(PublishOutcome::Dropped)
            }
            Err(PublishFailure::Broker(e)) => {
                warn!(destination = %target, error = %e, "Publish failed, spooling message");
                self.spool_message(target, payload, e.to_string(), e.category())
                    .await
            }
        }
    }

    /// Drains the spool and publishes its messages again, oldest first.
    ///
    /// Targets are replayed concurrently. Within a target, the first renewed
    /// failure stops further attempts: that message and every later one for
    /// the same target are put back untouched, keeping their order.
    ///
    /// # Errors
    ///
    /// Returns an error only if the spool cannot be drained; nothing has been
    /// removed in that case.
    #[instrument(skip(self))]
    pub async fn replay(&self) -> Result<ReplayReport, PipelineError> {
        let drained = self.spool.drain_all().await?;
        metrics::increment_spool_replays();

        if drained.is_empty() {
            debug!("Spool empty, nothing to replay");
            metrics::set_spool_depth(0);
            return Ok(ReplayReport::default());
        }

        info!(messages = drained.len(), "Replaying spooled messages");
        let mut report = ReplayReport {
            drained: drained.len(),
            ..ReplayReport::default()
        };

        let groups = group_by_target(drained);
        let results = join_all(
            groups
                .into_iter()
                .map(|(target, messages)| self.replay_target(target, messages)),
        )
        .await;

        for partial in results {
            report.published += partial.published;
            report.requeued += partial.requeued;
            report.lost += partial.lost;
        }

        if report.requeued > 0 || report.lost > 0 {
            warn!(?report, "Spool replay incomplete");
        } else {
            info!(?report, "Spool replay complete");
        }
        metrics::set_spool_depth(report.requeued);

        Ok(report)
    }

    async fn replay_target(
        &self,
        target: DestinationTarget,
        messages: Vec<SpooledMessage>,
    ) -> ReplayReport {
        let mut report = ReplayReport::default();
        let mut failed: Option<String> = None;

        for message in messages {
            if failed.is_none() {
                match self.publish(&target, &message.payload, DeliveryOrigin::Replay).await {
                    Ok(()) => {
                        report.published += 1;
                        continue;
                    }
                    Err(PublishFailure::Encode(reason)) => {
                        error!(destination = %target, %reason, "Discarding spooled payload that cannot be encoded");
                        report.lost += 1;
                        continue;
                    }
                    Err(PublishFailure::Broker(e)) => {
                        warn!(destination = %target, error = %e, "Replay publish failed, requeueing");
                        failed = Some(e.to_string());
                    }
                }
            }

            let reason = failed.clone().unwrap_or_default();
            match self.spool.append(message.requeued(reason)).await {
                Ok(()) => report.requeued += 1,
                Err(e) => {
                    error!(destination = %target, error = %e, "Failed to requeue spooled message, message lost");
                    report.lost += 1;
                }
            }
        }

        if report.requeued > 0 {
            metrics::increment_messages_requeued_by(report.requeued as u64, &target.queue);
        }
        report
    }

    async fn publish(
        &self,
        target: &DestinationTarget,
        payload: &DeliverablePayload,
        origin: DeliveryOrigin,
    ) -> Result<(), PublishFailure> {
        let body = payload
            .to_bytes()
            .map_err(|e| PublishFailure::Encode(e.to_string()))?;
        let request = PublishRequest::for_target(target, body, payload.content_type());

        let started = Instant::now();
        match tokio::time::timeout(self.options.publish_timeout, self.broker.publish(request)).await
        {
            Ok(Ok(())) => {
                metrics::record_publish_duration(started.elapsed(), &target.queue);
                metrics::increment_messages_published(&target.queue, origin.as_str());
                debug!(destination = %target, origin = origin.as_str(), "Message published");
                Ok(())
            }
            Ok(Err(e)) => Err(PublishFailure::Broker(e)),
            Err(_) => Err(PublishFailure::Broker(BrokerError::Timeout(
                self.options.publish_timeout,
            ))),
        }
    }

    async fn spool_message(
        &self,
        target: &DestinationTarget,
        payload: DeliverablePayload,
        reason: String,
        category: ErrorCategory,
    ) -> Result<PublishOutcome, DeliveryFailure> {
        self.spool
            .append(SpooledMessage::new(target.clone(), payload, reason))
            .await
            .map(|()| {
                metrics::increment_messages_spooled(&target.queue, category);
                PublishOutcome::Spooled
            })
            .map_err(|error| {
                error!(destination = %target, error = %error, "Failed to spool message");
                DeliveryFailure {
                    destination: target.queue.clone(),
                    error,
                }
            })
    }
}

enum PublishFailure {
    Encode(String),
    Broker(BrokerError),
}

enum DestinationResult {
    Sent(Vec<PublishOutcome>),
    Skipped,
    TransformFailed,
}

/// Runs the destination's transform. A panic is logged and yields `None`;
/// the other destinations of the event are unaffected.
fn apply_transform(
    destination: &Destination,
    record: &ChangeRecord,
    collection: &str,
) -> Option<TransformOutput> {
    match panic::catch_unwind(AssertUnwindSafe(|| destination.apply(record, collection))) {
        Ok(output) => Some(output),
        Err(payload) => {
            error!(
                destination = %destination.name,
                panic = panic_message(payload.as_ref()),
                "Transform panicked, event not sent to this destination"
            );
            None
        }
    }
}

fn panic_message<'a>(payload: &'a (dyn Any + Send + 'static)) -> &'a str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

fn validate(destinations: &[Destination], options: &DeliveryOptions) -> Result<(), PipelineError> {
    if options.publish_timeout.is_zero() {
        return Err(PipelineError::Configuration(
            "publish_timeout must be greater than 0".to_string(),
        ));
    }

    let mut names = HashSet::new();
    for destination in destinations {
        if destination.name.is_empty() {
            return Err(PipelineError::Configuration(
                "destination name must not be empty".to_string(),
            ));
        }
        if !names.insert(destination.name.as_str()) {
            return Err(PipelineError::Configuration(format!(
                "duplicate destination '{}'",
                destination.name
            )));
        }
        if destination.transform.is_some() && !options.structured_formatting {
            return Err(PipelineError::Configuration(format!(
                "destination '{}' has a transform but structured formatting is disabled",
                destination.name
            )));
        }
    }

    Ok(())
}

/// Groups messages by target, keeping the order of first appearance and the
/// order within each group.
fn group_by_target(messages: Vec<SpooledMessage>) -> Vec<(DestinationTarget, Vec<SpooledMessage>)> {
    let mut index: HashMap<DestinationTarget, usize> = HashMap::new();
    let mut groups: Vec<(DestinationTarget, Vec<SpooledMessage>)> = Vec::new();

    for message in messages {
        match index.get(&message.target) {
            Some(&i) => groups[i].1.push(message),
            None => {
                index.insert(message.target.clone(), groups.len());
                groups.push((message.target.clone(), vec![message]));
            }
        }
    }

    groups
}
