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

//! Position store and failure spool backends for Burrow.
//!
//! Implementations of [`PositionStore`](burrow_core::state::PositionStore) and
//! [`FailureSpool`](burrow_core::spool::FailureSpool).
//!
//! # Available Stores
//!
//! - **Memory** (always available): process-local, for tests and development
//! - **`MongoDB`** (`mongo-store` feature, default): positions and spool in the
//!   watched database
//! - **Redis** (`redis-store` feature): shared across relay instances
//!
//! # Example: `MongoDB` Stores
//!
//! ```rust,ignore
//! use burrow_stores::mongo::{MongoPositionStore, MongoSpool, MongoStoreConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MongoStoreConfig::builder()
//!     .connection_string("mongodb://localhost:27017/shop?replicaSet=rs0")
//!     .build()?;
//! let database = config.connect().await?;
//!
//! let positions = MongoPositionStore::from_database(&database, &config);
//! let spool = MongoSpool::from_database(&database, &config).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod memory;

#[cfg(feature = "mongo-store")]
pub mod mongo;

#[cfg(feature = "redis-store")]
pub mod redis;
