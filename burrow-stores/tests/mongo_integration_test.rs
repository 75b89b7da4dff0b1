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

#![cfg(feature = "mongo-store")]

use bson::doc;
use burrow_core::destination::{DeliverablePayload, Destination, ExchangeBinding, ExchangeKind};
use burrow_core::spool::{FailureSpool, SpooledMessage};
use burrow_core::state::PositionStore;
use burrow_stores::mongo::{MongoPositionStore, MongoSpool, MongoStoreConfig};
use chrono::{Duration, Utc};
use serde_json::json;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::mongo::Mongo;

fn config(port: u16) -> MongoStoreConfig {
    MongoStoreConfig::builder()
        .connection_string(format!("mongodb://127.0.0.1:{port}/shop"))
        .build()
        .expect("valid config")
}

#[tokio::test]
#[ignore] // Requires Docker
async fn positions_upsert_and_list() {
    let container = Mongo::default()
        .start()
        .await
        .expect("failed to start MongoDB container");
    let port = container
        .get_host_port_ipv4(27017)
        .await
        .expect("failed to get port");

    let store = MongoPositionStore::connect(&config(port)).await.unwrap();
    assert!(store.load("orders").await.unwrap().is_none());

    store
        .commit("orders", &doc! { "_data": "1" }, None)
        .await
        .unwrap();
    store
        .commit(
            "orders",
            &doc! { "_data": "2" },
            Some(doc! { "operationType": "delete", "documentKey": { "_id": "42" } }),
        )
        .await
        .unwrap();
    store
        .commit("users", &doc! { "_data": "7" }, None)
        .await
        .unwrap();

    let record = store.load("orders").await.unwrap().unwrap();
    assert_eq!(record.last_position, doc! { "_data": "2" });
    assert_eq!(
        record.description.unwrap().get_str("operationType").unwrap(),
        "delete"
    );

    let all = store.list().await.unwrap();
    assert_eq!(all.len(), 2);

    store.delete("users").await.unwrap();
    store.delete("users").await.unwrap();
    assert_eq!(store.list().await.unwrap().len(), 1);
}

#[tokio::test]
#[ignore] // Requires Docker
async fn spool_drains_oldest_first() {
    let container = Mongo::default()
        .start()
        .await
        .expect("failed to start MongoDB container");
    let port = container
        .get_host_port_ipv4(27017)
        .await
        .expect("failed to get port");

    let config = config(port);
    let database = config.connect().await.unwrap();
    let spool = MongoSpool::from_database(&database, &config).await.unwrap();

    let now = Utc::now();
    let mut late = SpooledMessage::new(
        Destination::queue("audit").target(),
        DeliverablePayload::Structured(json!({ "data": { "id": "late" } })),
        "timeout",
    );
    late.created_at = now;
    let mut early = SpooledMessage::new(
        Destination::queue("search")
            .with_exchange(ExchangeBinding::new("events", ExchangeKind::Topic, "orders.#"))
            .target(),
        DeliverablePayload::Binary(vec![7, 7, 7]),
        "channel closed",
    );
    early.created_at = now - Duration::seconds(30);

    spool.append(late).await.unwrap();
    spool.append(early).await.unwrap();
    assert_eq!(spool.len().await.unwrap(), 2);

    let drained = spool.drain_all().await.unwrap();
    assert_eq!(drained.len(), 2);
    assert_eq!(drained[0].target.queue, "search");
    assert_eq!(drained[0].target.exchange_name(), "events");
    assert_eq!(drained[0].payload, DeliverablePayload::Binary(vec![7, 7, 7]));
    assert_eq!(
        drained[1].payload,
        DeliverablePayload::Structured(json!({ "data": { "id": "late" } }))
    );

    assert_eq!(spool.len().await.unwrap(), 0);
    assert!(spool.drain_all().await.unwrap().is_empty());
}
