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

//! Burrow Core - MongoDB change streams to RabbitMQ
//!
//! This crate holds the types, traits and orchestration for relaying change
//! events from `MongoDB` collections to AMQP queues with per-collection
//! ordering and at-least-once delivery.
//!
//! # Key Components
//!
//! - **Events**: [`event`] raw change notifications, [`record`] their
//!   normalized form
//! - **Destinations**: [`destination`] queues, exchange bindings and transforms
//! - **Broker**: [`broker`] connection trait, [`topology`] declarations and
//!   health supervision
//! - **Delivery**: [`delivery`] fan-out with spool-on-failure, [`spool`] the
//!   failure store
//! - **Positions**: [`state`] resume tokens per collection
//! - **Change feed**: [`stream`] the `MongoDB` source, [`watcher`] the
//!   per-collection loop
//! - **Relay**: [`relay`] ties it all together
//!
//! # Example
//!
//! ```rust
//! use burrow_core::event::{ChangeEvent, OperationType};
//! use burrow_core::record::ChangeRecord;
//!
//! fn describe(event: &ChangeEvent) -> String {
//!     let record = ChangeRecord::normalize(event);
//!     match event.operation {
//!         OperationType::Insert => format!("inserted {}", record.id),
//!         OperationType::Update => format!("updated {}", record.id),
//!         OperationType::Delete => format!("deleted {}", record.id),
//!         _ => format!("{} on {}", event.operation.as_str(), record.id),
//!     }
//! }
//! ```

pub mod broker;
pub mod delivery;
pub mod destination;
pub mod event;
pub mod metrics;
pub mod record;
pub mod relay;
pub mod spool;
pub mod state;
pub mod stream;
pub mod topology;
pub mod watcher;

pub use broker::ConnectionState;
