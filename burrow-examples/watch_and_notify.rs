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

//! Relay changes from `MongoDB` collections to RabbitMQ queues.
//!
//! Every insert, update, replace and delete on the watched collections is
//! published to each `--queue`, optionally through a topic exchange.
//!
//! # Prerequisites
//!
//! `MongoDB` as a replica set (change streams require one):
//! ```bash
//! docker run -d --name mongodb -p 27017:27017 mongo:7.0 --replSet rs0
//! docker exec mongodb mongosh --eval "rs.initiate()"
//! ```
//!
//! RabbitMQ:
//! ```bash
//! docker run -d --name rabbitmq -p 5672:5672 -p 15672:15672 rabbitmq:3-management
//! ```
//!
//! # Running
//!
//! ```bash
//! cargo run --example watch_and_notify -- \
//!   --collection orders --collection users \
//!   --queue audit --queue search --exchange events --routing-key 'shop.#' \
//!   --metrics-addr 0.0.0.0:9000
//! ```
//!
//! # Generate Test Data
//!
//! ```bash
//! docker exec mongodb mongosh shop --eval '
//!   db.orders.insertOne({ product: "Widget", quantity: 5 });
//!   db.orders.updateOne({ product: "Widget" }, { $inc: { quantity: 1 } });
//! '
//! ```

use burrow_amqp::{AmqpBroker, AmqpConfig};
use burrow_core::destination::{Destination, ExchangeBinding, ExchangeKind};
use burrow_core::relay::{Relay, RelayConfig};
use burrow_examples::{init_tracing, install_prometheus, open_stores, RelayArgs};
use clap::Parser;
use std::error::Error;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(about = "Relay MongoDB change events to RabbitMQ queues")]
struct Cli {
    #[command(flatten)]
    relay: RelayArgs,

    /// Destination queue; repeat for several.
    #[arg(long = "queue", short = 'q', required = true)]
    queues: Vec<String>,

    /// Route every queue through this topic exchange.
    #[arg(long)]
    exchange: Option<String>,

    /// Binding key used with `--exchange`.
    #[arg(long, default_value = "#", requires = "exchange")]
    routing_key: String,
}

impl Cli {
    fn destinations(&self) -> Vec<Destination> {
        self.queues
            .iter()
            .map(|queue| {
                let destination = Destination::queue(queue);
                match &self.exchange {
                    Some(exchange) => destination.with_exchange(ExchangeBinding::new(
                        exchange,
                        ExchangeKind::Topic,
                        &self.routing_key,
                    )),
                    None => destination,
                }
            })
            .collect()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_tracing(cli.relay.silent, cli.relay.json_logs);

    if let Some(addr) = cli.relay.metrics_addr {
        install_prometheus(addr)?;
    }

    let (positions, spool) = open_stores(&cli.relay).await?;
    let broker = Arc::new(AmqpBroker::new(
        AmqpConfig::builder()
            .url(&cli.relay.amqp_url)
            .connection_name("burrow-watch-and-notify")
            .build()?,
    ));

    let mut builder = RelayConfig::builder()
        .connection_string(&cli.relay.mongodb_uri)
        .collections(cli.relay.collections.clone())
        .destinations(cli.destinations())
        .options(cli.relay.options());
    if let Some(database) = &cli.relay.database {
        builder = builder.database(database);
    }

    let mut relay = Relay::new(builder.build()?, broker, positions, spool)?;
    relay.start().await?;

    info!(
        collections = ?cli.relay.collections,
        queues = ?cli.queues,
        "Relay running, press Ctrl+C to stop"
    );

    signal::ctrl_c().await?;
    info!("Shutting down");

    if let Err(e) = relay.stop().await {
        warn!(error = %e, "Relay did not stop cleanly");
    }
    Ok(())
}
