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

//! Broker topology and health supervision.
//!
//! [`BrokerTopologyManager::initialize`] declares the queues, exchanges and
//! bindings the destinations need. Declared objects are remembered for the
//! lifetime of the connection, so calling it again on a live connection does
//! nothing.
//!
//! [`BrokerTopologyManager::supervise_health`] checks the broker on a fixed
//! interval. When the connection is gone it reconnects, declares the topology
//! again, reinitializes every watcher and replays the failure spool.

use crate::broker::{Broker, BrokerError};
use crate::delivery::DeliveryPipeline;
use crate::destination::Destination;
use crate::metrics::{self, ConnectionStatus};
use crate::watcher::WatcherHandle;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// Default interval between broker health checks.
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Objects declared on the current connection.
#[derive(Debug, Default)]
struct KnownTopology {
    queues: HashSet<String>,
    exchanges: HashSet<String>,
    /// (exchange, queue, routing key)
    bindings: HashSet<(String, String, String)>,
}

impl KnownTopology {
    fn clear(&mut self) {
        self.queues.clear();
        self.exchanges.clear();
        self.bindings.clear();
    }
}

/// Owns the broker connection's topology and health.
pub struct BrokerTopologyManager {
    broker: Arc<dyn Broker>,
    known: Mutex<KnownTopology>,
    health_check_interval: Duration,
}

impl std::fmt::Debug for BrokerTopologyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerTopologyManager")
            .field("health_check_interval", &self.health_check_interval)
            .field("state", &self.broker.state())
            .finish_non_exhaustive()
    }
}

impl BrokerTopologyManager {
    /// Creates a manager checking health every `health_check_interval`.
    pub fn new(broker: Arc<dyn Broker>, health_check_interval: Duration) -> Self {
        Self {
            broker,
            known: Mutex::new(KnownTopology::default()),
            health_check_interval,
        }
    }

    /// The managed broker.
    #[must_use]
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// True when the broker connection is ready.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.broker.is_healthy()
    }

    /// Connects if needed and declares what `destinations` require.
    ///
    /// Queues are durable. Objects already declared on this connection are
    /// skipped.
    ///
    /// # Errors
    ///
    /// Returns the first connection or declaration error. Objects declared
    /// before the failure stay known.
    #[instrument(skip_all, fields(destinations = destinations.len()))]
    pub async fn initialize(&self, destinations: &[Destination]) -> Result<(), BrokerError> {
        let mut known = self.known.lock().await;

        if !self.broker.is_healthy() {
            known.clear();
            self.broker.connect().await?;
            info!("Connected to broker");
        }

        for destination in destinations {
            let queue = destination.name.as_str();

            if !known.queues.contains(queue) {
                self.broker.declare_queue(queue, true).await?;
                debug!(queue, "Declared queue");
                known.queues.insert(queue.to_string());
            }

            let Some(exchange) = &destination.exchange else {
                continue;
            };

            if !known.exchanges.contains(&exchange.name) {
                self.broker
                    .declare_exchange(&exchange.name, exchange.kind)
                    .await?;
                debug!(exchange = %exchange.name, kind = %exchange.kind, "Declared exchange");
                known.exchanges.insert(exchange.name.clone());
            }

            let binding = (
                exchange.name.clone(),
                queue.to_string(),
                exchange.routing_key.clone(),
            );
            if !known.bindings.contains(&binding) {
                self.broker
                    .bind_queue(queue, &exchange.name, &exchange.routing_key)
                    .await?;
                debug!(
                    queue,
                    exchange = %exchange.name,
                    routing_key = %exchange.routing_key,
                    "Bound queue"
                );
                known.bindings.insert(binding);
            }
        }

        metrics::set_broker_status(ConnectionStatus::Up);
        Ok(())
    }

    /// Closes the connection and forgets the declared topology.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker failed to close cleanly. The topology is
    /// forgotten regardless.
    pub async fn close(&self) -> Result<(), BrokerError> {
        self.known.lock().await.clear();
        metrics::set_broker_status(ConnectionStatus::Down);
        self.broker.close().await
    }

    /// Checks broker health every interval until `shutdown` fires.
    ///
    /// The first check happens one interval after the call.
    #[instrument(skip_all, fields(interval = ?self.health_check_interval))]
    pub async fn supervise_health(
        &self,
        watchers: Vec<WatcherHandle>,
        pipeline: DeliveryPipeline,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = interval_at(
            Instant::now() + self.health_check_interval,
            self.health_check_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(watchers = watchers.len(), "Starting health supervisor");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Health supervisor shutting down");
                    break;
                }
                _ = ticker.tick() => self.health_cycle(&watchers, &pipeline).await,
            }
        }
    }

    /// One supervision pass.
    ///
    /// Healthy: replays the spool if anything is waiting in it. Unhealthy:
    /// reconnects, redeclares, reinitializes watchers, then replays.
    pub async fn health_cycle(&self, watchers: &[WatcherHandle], pipeline: &DeliveryPipeline) {
        if self.is_healthy() {
            metrics::set_broker_status(ConnectionStatus::Up);
            match pipeline.spooled().await {
                Ok(0) => {}
                Ok(pending) => {
                    debug!(pending, "Broker healthy with spooled messages");
                    replay(pipeline).await;
                }
                Err(e) => warn!(error = %e, "Failed to read spool size"),
            }
            return;
        }

        warn!("Broker connection unhealthy, reconnecting");
        metrics::set_broker_status(ConnectionStatus::Down);

        if let Err(e) = self.close().await {
            debug!(error = %e, "Error closing stale broker connection");
        }

        if let Err(e) = self.initialize(pipeline.destinations()).await {
            error!(
                error = %e,
                retryable = e.is_retryable(),
                "Broker reconnection failed, retrying on next health check"
            );
            return;
        }

        metrics::increment_broker_reconnects();
        info!("Broker connection restored");

        for watcher in watchers {
            debug!(collection = %watcher.collection(), "Reinitializing watcher");
            watcher.reinitialize();
        }

        replay(pipeline).await;
    }
}

async fn replay(pipeline: &DeliveryPipeline) {
    if let Err(e) = pipeline.replay().await {
        error!(error = %e, "Spool replay failed, retrying on next health check");
    }
}
