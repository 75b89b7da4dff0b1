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

//! Message broker abstraction.
//!
//! The relay talks to its broker only through the [`Broker`] trait. The
//! production implementation lives in `burrow-amqp`; [`MockBroker`] is an
//! in-memory implementation for tests and examples.
//!
//! # Implementing a broker
//!
//! ```rust
//! use async_trait::async_trait;
//! use burrow_core::broker::{Broker, BrokerError, ConnectionState, PublishRequest};
//! use burrow_core::destination::ExchangeKind;
//!
//! struct StdoutBroker;
//!
//! #[async_trait]
//! impl Broker for StdoutBroker {
//!     async fn connect(&self) -> Result<(), BrokerError> { Ok(()) }
//!     fn state(&self) -> ConnectionState { ConnectionState::Ready }
//!     async fn close(&self) -> Result<(), BrokerError> { Ok(()) }
//!     async fn declare_queue(&self, _name: &str, _durable: bool) -> Result<(), BrokerError> { Ok(()) }
//!     async fn declare_exchange(&self, _name: &str, _kind: ExchangeKind) -> Result<(), BrokerError> { Ok(()) }
//!     async fn bind_queue(&self, _q: &str, _e: &str, _rk: &str) -> Result<(), BrokerError> { Ok(()) }
//!     async fn publish(&self, request: PublishRequest) -> Result<(), BrokerError> {
//!         println!("{} -> {} bytes", request.routing_key, request.body.len());
//!         Ok(())
//!     }
//! }
//! ```

use crate::destination::{DestinationTarget, ExchangeKind};
use crate::metrics::ErrorCategory;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

/// Errors reported by a [`Broker`].
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Connection could not be established or was lost.
    #[error("Connection error: {message}")]
    Connection {
        /// Human readable message.
        message: String,
        /// Underlying client error.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The operation needs a live connection and there is none.
    #[error("Not connected to broker")]
    NotConnected,

    /// Declaring a queue, exchange or binding failed.
    #[error("Topology error on {object}: {message}")]
    Topology {
        /// Queue, exchange or binding the declaration targeted.
        object: String,
        /// Human readable message.
        message: String,
    },

    /// The broker refused or failed to confirm a publish.
    #[error("Publish to {target} failed: {message}")]
    Publish {
        /// Exchange/routing key the publish targeted.
        target: String,
        /// Human readable message.
        message: String,
    },

    /// Payload could not be encoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Publish did not complete in time.
    #[error("Publish timed out after {0:?}")]
    Timeout(Duration),
}

impl BrokerError {
    /// Wraps a client error as a connection error.
    #[must_use]
    pub fn connection(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Connection {
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Connection error from a message.
    #[must_use]
    pub fn connection_msg(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Topology declaration error.
    #[must_use]
    pub fn topology(object: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Topology {
            object: object.into(),
            message: message.into(),
        }
    }

    /// Publish error.
    #[must_use]
    pub fn publish(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publish {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Whether the failure is expected to clear once the connection recovers.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Serialization(_))
    }

    /// Metric label for this error.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection { .. } | Self::NotConnected => ErrorCategory::Connection,
            Self::Topology { .. } => ErrorCategory::Validation,
            Self::Publish { .. } => ErrorCategory::Unknown,
            Self::Serialization(_) => ErrorCategory::Serialization,
            Self::Timeout(_) => ErrorCategory::Timeout,
        }
    }
}

/// Connection lifecycle owned by a connection component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connection.
    #[default]
    Disconnected,
    /// Connection attempt in progress.
    Connecting,
    /// Connected and usable.
    Ready,
}

/// A message ready to hand to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    /// Exchange name; empty for the default exchange.
    pub exchange: String,
    /// Routing key; the queue name when publishing on the default exchange.
    pub routing_key: String,
    /// Encoded body.
    pub body: Vec<u8>,
    /// MIME type of the body.
    pub content_type: String,
    /// Ask the broker to persist the message (delivery mode 2).
    pub persistent: bool,
}

impl PublishRequest {
    /// Persistent publish for `target`.
    #[must_use]
    pub fn for_target(target: &DestinationTarget, body: Vec<u8>, content_type: &str) -> Self {
        Self {
            exchange: target.exchange_name().to_string(),
            routing_key: target.routing_key().to_string(),
            body,
            content_type: content_type.to_string(),
            persistent: true,
        }
    }
}

/// Connection to a message broker.
///
/// Implementations own their connection and its [`ConnectionState`]. All
/// methods take `&self`; implementations are shared behind an `Arc`.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Opens a connection. Connecting while already connected is a no-op.
    async fn connect(&self) -> Result<(), BrokerError>;

    /// Current connection state.
    fn state(&self) -> ConnectionState;

    /// True when the connection is open and ready.
    fn is_healthy(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Closes the connection. Closing a closed connection is a no-op.
    async fn close(&self) -> Result<(), BrokerError>;

    /// Declares a queue.
    async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), BrokerError>;

    /// Declares an exchange.
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError>;

    /// Binds `queue` to `exchange` with `routing_key`.
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Publishes one message and waits for the broker to accept it.
    async fn publish(&self, request: PublishRequest) -> Result<(), BrokerError>;
}

/// A declaration observed by [`MockBroker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Declaration {
    /// `declare_queue`
    Queue {
        /// Queue name.
        name: String,
        /// Durable flag.
        durable: bool,
    },
    /// `declare_exchange`
    Exchange {
        /// Exchange name.
        name: String,
        /// Exchange type.
        kind: ExchangeKind,
    },
    /// `bind_queue`
    Binding {
        /// Bound queue.
        queue: String,
        /// Source exchange.
        exchange: String,
        /// Binding key.
        routing_key: String,
    },
}

/// How [`MockBroker`] reacts to the next publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishBehavior {
    /// Accept.
    Accept,
    /// Return a publish error.
    Fail,
    /// Never complete.
    Hang,
}

/// In-memory broker for tests.
///
/// Records declarations and accepted publishes. Publishes can be scripted to
/// fail or hang, and the connection can be dropped to simulate an outage.
#[derive(Debug)]
pub struct MockBroker {
    connected: AtomicBool,
    fail_connect: AtomicBool,
    default_behavior: Mutex<PublishBehavior>,
    scripted: Mutex<VecDeque<PublishBehavior>>,
    declarations: Mutex<Vec<Declaration>>,
    published: Mutex<Vec<PublishRequest>>,
    connect_count: AtomicUsize,
    connect_attempts: AtomicUsize,
    close_count: AtomicUsize,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self {
            connected: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            default_behavior: Mutex::new(PublishBehavior::Accept),
            scripted: Mutex::new(VecDeque::new()),
            declarations: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            connect_count: AtomicUsize::new(0),
            connect_attempts: AtomicUsize::new(0),
            close_count: AtomicUsize::new(0),
        }
    }
}

impl MockBroker {
    /// A disconnected mock that accepts everything once connected.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Behavior for publishes with nothing scripted.
    pub fn set_publish_behavior(&self, behavior: PublishBehavior) {
        *lock(&self.default_behavior) = behavior;
    }

    /// Queues a one-shot behavior for the next publish.
    pub fn script_publish(&self, behavior: PublishBehavior) {
        lock(&self.scripted).push_back(behavior);
    }

    /// Makes subsequent `connect` calls fail (or succeed again).
    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Drops the connection without going through `close`.
    pub fn sever(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Declarations seen so far.
    #[must_use]
    pub fn declarations(&self) -> Vec<Declaration> {
        lock(&self.declarations).clone()
    }

    /// Accepted publishes, in order.
    #[must_use]
    pub fn published(&self) -> Vec<PublishRequest> {
        lock(&self.published).clone()
    }

    /// Accepted publishes routed with `routing_key`.
    #[must_use]
    pub fn published_to(&self, routing_key: &str) -> Vec<PublishRequest> {
        lock(&self.published)
            .iter()
            .filter(|r| r.routing_key == routing_key)
            .cloned()
            .collect()
    }

    /// Number of successful connects.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.connect_count.load(Ordering::SeqCst)
    }

    /// Number of `connect` calls, failed ones included.
    #[must_use]
    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Number of `close` calls.
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    fn ensure_connected(&self) -> Result<(), BrokerError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::NotConnected)
        }
    }

    fn next_behavior(&self) -> PublishBehavior {
        lock(&self.scripted)
            .pop_front()
            .unwrap_or_else(|| *lock(&self.default_behavior))
    }
}

// Mock state is only ever touched under short critical sections; a poisoned
// lock still holds consistent data.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[async_trait]
impl Broker for MockBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(BrokerError::connection_msg("simulated connect failure"));
        }
        if !self.connected.swap(true, Ordering::SeqCst) {
            self.connect_count.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        if self.connected.load(Ordering::SeqCst) {
            ConnectionState::Ready
        } else {
            ConnectionState::Disconnected
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        lock(&self.declarations).push(Declaration::Queue {
            name: name.to_string(),
            durable,
        });
        Ok(())
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        lock(&self.declarations).push(Declaration::Exchange {
            name: name.to_string(),
            kind,
        });
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        lock(&self.declarations).push(Declaration::Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });
        Ok(())
    }

    async fn publish(&self, request: PublishRequest) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        match self.next_behavior() {
            PublishBehavior::Accept => {
                lock(&self.published).push(request);
                Ok(())
            }
            PublishBehavior::Fail => Err(BrokerError::publish(
                request.routing_key,
                "simulated publish failure",
            )),
            PublishBehavior::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}
