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

//! Watcher, supervisor and relay behavior against in-memory fakes.

mod common;

use burrow_core::broker::{Broker, MockBroker, PublishBehavior};
use burrow_core::delivery::{DeliveryOptions, DeliveryPipeline};
use burrow_core::destination::{Destination, TransformOutput};
use burrow_core::event::{ChangeEvent, Namespace, OperationType};
use burrow_core::relay::{Relay, RelayConfig, RelayError, RelayOptions};
use burrow_core::spool::FailureSpool;
use burrow_core::stream::{ChangeFeed, ChangeStreamConfig, StreamError};
use burrow_core::topology::{BrokerTopologyManager, DEFAULT_HEALTH_CHECK_INTERVAL};
use burrow_core::watcher::{ChangeFeedWatcher, WatcherHandle, WatcherState};
use chrono::Utc;
use common::{
    committed, eventually, insert_event, published_ids, token, FlakyPositions, FlakySpool,
    ScriptedFeed,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const COLLECTION: &str = "orders";

fn fast_stream_config() -> ChangeStreamConfig {
    ChangeStreamConfig::builder()
        .initial_backoff_ms(10)
        .max_backoff_ms(50)
        .backoff_jitter(0.0)
        .build()
        .unwrap()
}

struct Harness {
    broker: Arc<MockBroker>,
    feed: Arc<ScriptedFeed>,
    positions: Arc<FlakyPositions>,
    spool: Arc<FlakySpool>,
    pipeline: DeliveryPipeline,
    topology: BrokerTopologyManager,
}

impl Harness {
    async fn new(destinations: Vec<Destination>, options: DeliveryOptions) -> Self {
        let broker = Arc::new(MockBroker::new());
        let spool = Arc::new(FlakySpool::default());
        let pipeline =
            DeliveryPipeline::new(destinations, options, broker.clone(), spool.clone()).unwrap();
        let topology = BrokerTopologyManager::new(broker.clone(), DEFAULT_HEALTH_CHECK_INTERVAL);
        topology.initialize(pipeline.destinations()).await.unwrap();

        Self {
            broker,
            feed: Arc::new(ScriptedFeed::new(COLLECTION)),
            positions: Arc::new(FlakyPositions::default()),
            spool,
            pipeline,
            topology,
        }
    }

    async fn spawn_watcher(&self) -> (WatcherHandle, broadcast::Sender<()>, JoinHandle<()>) {
        let watcher = ChangeFeedWatcher::new(
            self.feed.clone(),
            self.positions.clone(),
            self.pipeline.clone(),
            fast_stream_config(),
        );
        let mut handle = watcher.handle();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(watcher.run(shutdown_rx));

        let streaming = tokio::time::timeout(
            Duration::from_secs(5),
            handle.wait_for(WatcherState::Streaming),
        )
        .await;
        assert!(matches!(streaming, Ok(true)), "watcher never started streaming");

        (handle, shutdown_tx, task)
    }
}

async fn stop(shutdown_tx: broadcast::Sender<()>, task: JoinHandle<()>) {
    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("watcher did not stop")
        .unwrap();
}

#[tokio::test]
async fn events_reach_every_destination_in_emission_order() {
    let harness = Harness::new(
        vec![Destination::queue("audit"), Destination::queue("search")],
        DeliveryOptions::default(),
    )
    .await;
    let (handle, shutdown_tx, task) = harness.spawn_watcher().await;
    assert!(handle.is_healthy());

    for seq in 1..=5 {
        harness.feed.emit(insert_event(COLLECTION, seq));
    }

    let positions = harness.positions.clone();
    committed(&positions, COLLECTION, &token(5)).await;

    let expected: Vec<String> = (1..=5).map(|s| s.to_string()).collect();
    assert_eq!(published_ids(&harness.broker.published_to("audit")), expected);
    assert_eq!(published_ids(&harness.broker.published_to("search")), expected);

    stop(shutdown_tx, task).await;
    assert_eq!(handle.state(), WatcherState::Stopped);
}

#[tokio::test]
async fn publish_timeout_spools_once_and_next_health_cycle_replays_it() {
    let harness = Harness::new(
        vec![Destination::queue("q")],
        DeliveryOptions {
            publish_timeout: Duration::from_millis(50),
            ..DeliveryOptions::default()
        },
    )
    .await;
    let (handle, shutdown_tx, task) = harness.spawn_watcher().await;

    harness.broker.script_publish(PublishBehavior::Hang);
    harness.feed.emit(insert_event(COLLECTION, 1));

    let positions = harness.positions.clone();
    committed(&positions, COLLECTION, &token(1)).await;

    let spooled = harness.spool.snapshot().await;
    assert_eq!(spooled.len(), 1);
    assert_eq!(spooled[0].target.queue, "q");
    assert!(harness.broker.published_to("q").is_empty());

    harness
        .topology
        .health_cycle(&[handle.clone()], &harness.pipeline)
        .await;
    assert_eq!(published_ids(&harness.broker.published_to("q")), vec!["1"]);
    assert!(harness.spool.is_empty().await.unwrap());

    harness
        .topology
        .health_cycle(&[handle], &harness.pipeline)
        .await;
    assert_eq!(harness.broker.published_to("q").len(), 1);

    stop(shutdown_tx, task).await;
}

#[tokio::test]
async fn restart_resumes_after_committed_position() {
    let harness = Harness::new(vec![Destination::queue("audit")], DeliveryOptions::default()).await;

    let (_, shutdown_tx, task) = harness.spawn_watcher().await;
    for seq in 1..=3 {
        harness.feed.emit(insert_event(COLLECTION, seq));
    }
    let positions = harness.positions.clone();
    committed(&positions, COLLECTION, &token(3)).await;
    stop(shutdown_tx, task).await;

    // Written while nobody was watching.
    harness.feed.emit(insert_event(COLLECTION, 4));
    harness.feed.emit(insert_event(COLLECTION, 5));

    let (_, shutdown_tx, task) = harness.spawn_watcher().await;
    committed(&positions, COLLECTION, &token(5)).await;
    stop(shutdown_tx, task).await;

    assert_eq!(harness.feed.opens(), vec![None, Some(token(3))]);
    assert_eq!(
        published_ids(&harness.broker.published_to("audit")),
        vec!["1", "2", "3", "4", "5"]
    );
}

#[tokio::test]
async fn stream_error_reopens_from_last_commit() {
    let harness = Harness::new(vec![Destination::queue("audit")], DeliveryOptions::default()).await;
    let (handle, shutdown_tx, task) = harness.spawn_watcher().await;

    harness.feed.emit(insert_event(COLLECTION, 1));
    let positions = harness.positions.clone();
    committed(&positions, COLLECTION, &token(1)).await;

    harness.feed.fail_stream(StreamError::Connection {
        message: "connection reset".to_string(),
        source: None,
        code: None,
        labels: vec!["NetworkError".to_string()],
    });
    harness.feed.emit(insert_event(COLLECTION, 2));

    committed(&positions, COLLECTION, &token(2)).await;

    assert_eq!(harness.feed.opens(), vec![None, Some(token(1))]);
    assert_eq!(
        published_ids(&harness.broker.published_to("audit")),
        vec!["1", "2"]
    );
    assert_eq!(handle.state(), WatcherState::Streaming);

    stop(shutdown_tx, task).await;
}

#[tokio::test]
async fn unspooled_failure_is_not_committed_and_is_redelivered() {
    let harness = Harness::new(vec![Destination::queue("audit")], DeliveryOptions::default()).await;
    let (_, shutdown_tx, task) = harness.spawn_watcher().await;

    harness.feed.emit(insert_event(COLLECTION, 1));
    let positions = harness.positions.clone();
    committed(&positions, COLLECTION, &token(1)).await;

    // Publish fails once and the spool is down: the event cannot be handled.
    harness.spool.set_fail_appends(true);
    harness.broker.script_publish(PublishBehavior::Fail);
    harness.feed.emit(insert_event(COLLECTION, 2));

    committed(&positions, COLLECTION, &token(2)).await;

    assert_eq!(
        published_ids(&harness.broker.published_to("audit")),
        vec!["1", "2"]
    );
    assert_eq!(harness.feed.opens().last(), Some(&Some(token(1))));

    stop(shutdown_tx, task).await;
}

#[tokio::test]
async fn failed_commit_redelivers_event() {
    let harness = Harness::new(vec![Destination::queue("audit")], DeliveryOptions::default()).await;
    let (_, shutdown_tx, task) = harness.spawn_watcher().await;

    harness.feed.emit(insert_event(COLLECTION, 1));
    let positions = harness.positions.clone();
    committed(&positions, COLLECTION, &token(1)).await;

    harness.positions.set_fail_commits(true);
    harness.feed.emit(insert_event(COLLECTION, 2));

    let feed = harness.feed.clone();
    eventually("stream reopened", || feed.opens().len() >= 2).await;
    assert_eq!(positions.position(COLLECTION).await, Some(token(1)));

    harness.positions.set_fail_commits(false);
    committed(&positions, COLLECTION, &token(2)).await;

    // At-least-once: the event went out before the failed commit and again
    // after the reopen.
    let ids = published_ids(&harness.broker.published_to("audit"));
    assert_eq!(ids.first().map(String::as_str), Some("1"));
    assert!(ids.iter().filter(|id| *id == "2").count() >= 2);

    stop(shutdown_tx, task).await;
}

#[tokio::test]
async fn reinitialize_reopens_from_committed_position() {
    let harness = Harness::new(vec![Destination::queue("audit")], DeliveryOptions::default()).await;
    let (handle, shutdown_tx, task) = harness.spawn_watcher().await;

    harness.feed.emit(insert_event(COLLECTION, 1));
    let positions = harness.positions.clone();
    committed(&positions, COLLECTION, &token(1)).await;

    handle.reinitialize();
    let feed = harness.feed.clone();
    eventually("stream reopened", || feed.opens().len() == 2).await;
    assert_eq!(feed.opens()[1], Some(token(1)));

    stop(shutdown_tx, task).await;
    assert_eq!(harness.broker.published_to("audit").len(), 1);
}

#[tokio::test]
async fn watcher_retries_database_connection() {
    let harness = Harness::new(vec![Destination::queue("audit")], DeliveryOptions::default()).await;
    harness.feed.set_fail_connect(true);

    let watcher = ChangeFeedWatcher::new(
        harness.feed.clone(),
        harness.positions.clone(),
        harness.pipeline.clone(),
        fast_stream_config(),
    );
    let mut handle = watcher.handle();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(watcher.run(shutdown_rx));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!handle.is_healthy());
    assert!(harness.feed.opens().is_empty());

    harness.feed.set_fail_connect(false);
    let streaming = tokio::time::timeout(
        Duration::from_secs(5),
        handle.wait_for(WatcherState::Streaming),
    )
    .await;
    assert!(matches!(streaming, Ok(true)));
    assert!(handle.is_healthy());

    stop(shutdown_tx, task).await;
}

#[tokio::test]
async fn panicking_transform_does_not_stop_the_watcher() {
    let harness = Harness::new(
        vec![
            Destination::queue("picky").with_transform(|record, _| {
                assert_ne!(record.id, "1", "order 1 is malformed");
                TransformOutput::None
            }),
            Destination::queue("ok"),
        ],
        DeliveryOptions::default(),
    )
    .await;
    let (handle, shutdown_tx, task) = harness.spawn_watcher().await;

    harness.feed.emit(insert_event(COLLECTION, 1));
    harness.feed.emit(insert_event(COLLECTION, 2));

    let positions = harness.positions.clone();
    committed(&positions, COLLECTION, &token(2)).await;

    assert_eq!(published_ids(&harness.broker.published_to("ok")), vec!["1", "2"]);
    assert!(harness.broker.published_to("picky").is_empty());
    assert_eq!(harness.feed.opens(), vec![None]);
    assert!(handle.is_healthy());

    stop(shutdown_tx, task).await;
}

#[tokio::test]
async fn watcher_task_ending_reports_stopped() {
    let harness = Harness::new(vec![Destination::queue("audit")], DeliveryOptions::default()).await;
    let (handle, _shutdown_tx, task) = harness.spawn_watcher().await;
    assert!(handle.is_healthy());

    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    assert_eq!(handle.state(), WatcherState::Stopped);
    assert!(!handle.is_healthy());
}

#[tokio::test]
async fn invalidate_discards_position_and_restarts_at_tail() {
    let harness = Harness::new(vec![Destination::queue("audit")], DeliveryOptions::default()).await;
    let (_, shutdown_tx, task) = harness.spawn_watcher().await;

    harness.feed.emit(insert_event(COLLECTION, 1));
    let positions = harness.positions.clone();
    committed(&positions, COLLECTION, &token(1)).await;

    harness.feed.emit(ChangeEvent {
        operation: OperationType::Invalidate,
        namespace: Namespace::new("shop", COLLECTION),
        document_key: None,
        full_document: None,
        update_description: None,
        cluster_time: Utc::now(),
        resume_token: token(2),
    });

    let feed = harness.feed.clone();
    eventually("stream reopened after invalidate", || feed.opens().len() == 2).await;
    assert_eq!(feed.opens(), vec![None, None]);
    assert_eq!(positions.position(COLLECTION).await, None);

    let published = harness.broker.published_to("audit");
    assert_eq!(published.len(), 2);
    let body: serde_json::Value = serde_json::from_slice(&published[1].body).unwrap();
    assert_eq!(body["data"]["operation"], "unknown");

    harness.feed.emit(insert_event(COLLECTION, 3));
    committed(&positions, COLLECTION, &token(3)).await;
    assert_eq!(harness.broker.published_to("audit").len(), 3);

    stop(shutdown_tx, task).await;
}

fn relay_config(interval: Duration) -> RelayConfig {
    RelayConfig::builder()
        .connection_string("mongodb://localhost:27017/shop")
        .collection(COLLECTION)
        .destination(Destination::queue("audit"))
        .health_check_interval(interval)
        .publish_timeout(Duration::from_millis(200))
        .stream_config(fast_stream_config())
        .build()
        .unwrap()
}

#[tokio::test]
async fn supervisor_reconnects_broker_and_replays_spool() {
    let broker = Arc::new(MockBroker::new());
    let feed = Arc::new(ScriptedFeed::new(COLLECTION));
    let spool = Arc::new(FlakySpool::default());
    let positions = Arc::new(FlakyPositions::default());

    let feed_for_relay = feed.clone();
    let mut relay = Relay::with_feeds(
        relay_config(Duration::from_millis(50)),
        broker.clone(),
        positions.clone(),
        spool.clone(),
        move |_| -> Arc<dyn ChangeFeed> { feed_for_relay.clone() },
    )
    .unwrap();

    assert!(!relay.database_healthy());
    relay.start().await.unwrap();
    assert!(relay.broker_healthy());
    assert!(matches!(relay.start().await, Err(RelayError::AlreadyRunning)));

    let relay_watchers = relay.watchers().to_vec();
    eventually("watcher streaming", || {
        relay_watchers.iter().all(WatcherHandle::is_healthy)
    })
    .await;
    assert!(relay.database_healthy());

    broker.sever();
    feed.emit(insert_event(COLLECTION, 1));

    committed(&positions, COLLECTION, &token(1)).await;

    let broker_ref = broker.clone();
    eventually("spooled message replayed", || {
        broker_ref.published_to("audit").len() == 1
    })
    .await;

    assert!(relay.broker_healthy());
    assert!(broker.connect_count() >= 2);
    assert!(spool.is_empty().await.unwrap());
    eventually("watcher reinitialized", || feed.opens().len() >= 2).await;

    relay.stop().await.unwrap();
    assert!(!relay.is_running());
    assert!(!relay.database_healthy());
    assert!(!broker.is_healthy());
}

#[tokio::test]
async fn relay_start_fails_when_broker_unreachable() {
    let broker = Arc::new(MockBroker::new());
    broker.set_fail_connect(true);

    let mut relay = Relay::with_feeds(
        relay_config(DEFAULT_HEALTH_CHECK_INTERVAL),
        broker,
        Arc::new(FlakyPositions::default()),
        Arc::new(FlakySpool::default()),
        |collection| -> Arc<dyn ChangeFeed> { Arc::new(ScriptedFeed::new(collection)) },
    )
    .unwrap();

    assert!(matches!(relay.start().await, Err(RelayError::Broker(_))));
    assert!(!relay.is_running());
    relay.stop().await.unwrap();
}

#[tokio::test]
async fn relay_start_retries_broker_connection() {
    let broker = Arc::new(MockBroker::new());
    broker.set_fail_connect(true);

    let config = RelayConfig {
        options: RelayOptions {
            max_connect_retries: Some(50),
            ..relay_config(DEFAULT_HEALTH_CHECK_INTERVAL).options
        },
        ..relay_config(DEFAULT_HEALTH_CHECK_INTERVAL)
    };
    let mut relay = Relay::with_feeds(
        config,
        broker.clone(),
        Arc::new(FlakyPositions::default()),
        Arc::new(FlakySpool::default()),
        |collection| -> Arc<dyn ChangeFeed> { Arc::new(ScriptedFeed::new(collection)) },
    )
    .unwrap();

    let recovering = broker.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        recovering.set_fail_connect(false);
    });

    relay.start().await.unwrap();
    assert!(relay.broker_healthy());
    assert!(broker.connect_attempts() > 1);

    relay.stop().await.unwrap();
}

#[tokio::test]
async fn relay_start_gives_up_after_retry_limit() {
    let broker = Arc::new(MockBroker::new());
    broker.set_fail_connect(true);

    let config = RelayConfig {
        options: RelayOptions {
            max_connect_retries: Some(2),
            ..relay_config(DEFAULT_HEALTH_CHECK_INTERVAL).options
        },
        ..relay_config(DEFAULT_HEALTH_CHECK_INTERVAL)
    };
    let mut relay = Relay::with_feeds(
        config,
        broker.clone(),
        Arc::new(FlakyPositions::default()),
        Arc::new(FlakySpool::default()),
        |collection| -> Arc<dyn ChangeFeed> { Arc::new(ScriptedFeed::new(collection)) },
    )
    .unwrap();

    let started = Instant::now();
    assert!(matches!(relay.start().await, Err(RelayError::Broker(_))));
    assert_eq!(broker.connect_attempts(), 3);
    // Two backoff sleeps of the fast stream config: 10ms then 20ms.
    assert!(started.elapsed() >= Duration::from_millis(30));
    assert!(!relay.is_running());
}
