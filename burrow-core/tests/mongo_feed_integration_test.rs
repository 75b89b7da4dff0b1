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

//! Change feed tests against a real `MongoDB` replica set.
//!
//! Change streams need a replica set, started here with testcontainers.
//! Run with:
//! ```bash
//! cargo test --package burrow-core --test mongo_feed_integration_test -- --ignored
//! ```

mod common;

use bson::{doc, Document};
use burrow_core::broker::MockBroker;
use burrow_core::destination::Destination;
use burrow_core::event::OperationType;
use burrow_core::relay::{Relay, RelayConfig};
use burrow_core::stream::{ChangeFeed, ChangeStreamConfig, MongoChangeFeed};
use common::{eventually, published_ids, FlakyPositions, FlakySpool};
use futures::StreamExt;
use mongodb::Client;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::mongo::Mongo;
use tokio::time::timeout;

fn uri(port: u16) -> String {
    format!("mongodb://127.0.0.1:{port}/shop?directConnection=true")
}

#[tokio::test]
#[ignore] // Requires Docker
async fn feed_resumes_after_token() {
    let container = Mongo::repl_set()
        .start()
        .await
        .expect("failed to start MongoDB container");
    let port = container
        .get_host_port_ipv4(27017)
        .await
        .expect("failed to get port");

    let client = Client::with_uri_str(uri(port)).await.unwrap();
    let orders = client.database("shop").collection::<Document>("orders");

    let feed = MongoChangeFeed::new(uri(port), None, "orders", ChangeStreamConfig::default());
    feed.connect().await.expect("failed to connect");
    assert!(feed.is_healthy());

    let mut events = feed.open(None).await.unwrap();
    orders.insert_one(doc! { "_id": "a", "n": 1 }).await.unwrap();
    orders.insert_one(doc! { "_id": "b", "n": 2 }).await.unwrap();

    let first = timeout(Duration::from_secs(10), events.next())
        .await
        .expect("no event")
        .unwrap()
        .unwrap();
    assert_eq!(first.operation, OperationType::Insert);
    assert_eq!(first.document_id(), Some(&bson::Bson::String("a".into())));
    drop(events);

    let mut resumed = feed.open(Some(first.resume_token.clone())).await.unwrap();
    let second = timeout(Duration::from_secs(10), resumed.next())
        .await
        .expect("no event")
        .unwrap()
        .unwrap();
    assert_eq!(second.document_id(), Some(&bson::Bson::String("b".into())));

    feed.disconnect().await;
    assert!(!feed.is_healthy());
}

#[tokio::test]
#[ignore] // Requires Docker
async fn updates_carry_full_document() {
    let container = Mongo::repl_set()
        .start()
        .await
        .expect("failed to start MongoDB container");
    let port = container
        .get_host_port_ipv4(27017)
        .await
        .expect("failed to get port");

    let client = Client::with_uri_str(uri(port)).await.unwrap();
    let orders = client.database("shop").collection::<Document>("orders");
    orders.insert_one(doc! { "_id": "42", "x": 0 }).await.unwrap();

    let feed = MongoChangeFeed::new(uri(port), None, "orders", ChangeStreamConfig::default());
    feed.connect().await.unwrap();
    let mut events = feed.open(None).await.unwrap();

    orders
        .update_one(doc! { "_id": "42" }, doc! { "$set": { "x": 1 } })
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(10), events.next())
        .await
        .expect("no event")
        .unwrap()
        .unwrap();
    assert_eq!(event.operation, OperationType::Update);
    assert_eq!(event.full_document, Some(doc! { "_id": "42", "x": 1 }));
    assert_eq!(
        event.update_description.map(|u| u.updated_fields),
        Some(doc! { "x": 1 })
    );
}

#[tokio::test]
#[ignore] // Requires Docker
async fn relay_forwards_inserts() {
    let container = Mongo::repl_set()
        .start()
        .await
        .expect("failed to start MongoDB container");
    let port = container
        .get_host_port_ipv4(27017)
        .await
        .expect("failed to get port");

    let broker = Arc::new(MockBroker::new());
    let positions = Arc::new(FlakyPositions::default());
    let config = RelayConfig::builder()
        .connection_string(uri(port))
        .collection("orders")
        .destination(Destination::queue("audit"))
        .build()
        .unwrap();

    let mut relay = Relay::new(
        config,
        broker.clone(),
        positions.clone(),
        Arc::new(FlakySpool::default()),
    )
    .unwrap();
    relay.start().await.unwrap();

    let watchers = relay.watchers().to_vec();
    eventually("watcher streaming", || watchers.iter().all(|w| w.is_healthy())).await;

    let client = Client::with_uri_str(uri(port)).await.unwrap();
    client
        .database("shop")
        .collection::<Document>("orders")
        .insert_one(doc! { "_id": "7" })
        .await
        .unwrap();

    eventually("message published", || !broker.published_to("audit").is_empty()).await;
    assert_eq!(published_ids(&broker.published_to("audit")), vec!["7"]);
    assert!(positions.position("orders").await.is_some());

    relay.stop().await.unwrap();
}
