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

//! Custom transforms: reshape, filter and fan out change records.
//!
//! Three destinations share one watched `orders` collection:
//!
//! - `order-totals` receives a compact summary with a computed total
//! - `order-lines` receives one message per line item
//! - `order-deletions` receives plain-text notices for deletes only
//!
//! Positions and the spool are kept in memory, so a restart starts from the
//! current end of the stream.
//!
//! # Running
//!
//! ```bash
//! cargo run --example custom_transform -- --collection orders --store memory
//! ```
//!
//! Then insert an order:
//! ```bash
//! docker exec mongodb mongosh shop --eval '
//!   db.orders.insertOne({ customer: "ada", lines: [
//!     { sku: "A-1", qty: 2, price: 4.5 },
//!     { sku: "B-7", qty: 1, price: 12.0 }
//!   ]});
//! '
//! ```

use bson::{Bson, Document};
use burrow_amqp::{AmqpBroker, AmqpConfig};
use burrow_core::destination::{DeliverablePayload, Destination, TransformOutput};
use burrow_core::record::{ChangeOperation, ChangeRecord};
use burrow_core::relay::{Relay, RelayConfig};
use burrow_examples::{init_tracing, install_prometheus, open_stores, RelayArgs};
use clap::Parser;
use serde_json::json;
use std::error::Error;
use std::sync::Arc;
use tokio::signal;
use tracing::info;

#[derive(Debug, Parser)]
#[command(about = "Relay order changes through custom transforms")]
struct Cli {
    #[command(flatten)]
    relay: RelayArgs,
}

fn number(value: Option<&Bson>) -> f64 {
    match value {
        Some(Bson::Double(v)) => *v,
        Some(Bson::Int32(v)) => f64::from(*v),
        #[allow(clippy::cast_precision_loss)]
        Some(Bson::Int64(v)) => *v as f64,
        _ => 0.0,
    }
}

fn lines(order: &Document) -> Vec<&Document> {
    order
        .get_array("lines")
        .map(|lines| lines.iter().filter_map(Bson::as_document).collect())
        .unwrap_or_default()
}

fn order_total(record: &ChangeRecord, collection: &str) -> TransformOutput {
    if record.full_document.is_empty() {
        return TransformOutput::None;
    }

    let total: f64 = lines(&record.full_document)
        .iter()
        .map(|line| number(line.get("qty")) * number(line.get("price")))
        .sum();

    TransformOutput::One(DeliverablePayload::Structured(json!({
        "orderId": record.id,
        "operation": record.operation.as_str(),
        "collection": collection,
        "customer": record.full_document.get_str("customer").unwrap_or_default(),
        "total": total,
    })))
}

fn order_lines(record: &ChangeRecord, _collection: &str) -> TransformOutput {
    if record.operation != ChangeOperation::Insert {
        return TransformOutput::None;
    }

    TransformOutput::Many(
        lines(&record.full_document)
            .into_iter()
            .map(|line| {
                DeliverablePayload::Structured(json!({
                    "orderId": record.id,
                    "sku": line.get_str("sku").unwrap_or_default(),
                    "qty": number(line.get("qty")),
                }))
            })
            .collect(),
    )
}

fn deletion_notice(record: &ChangeRecord, collection: &str) -> TransformOutput {
    match record.operation {
        ChangeOperation::Delete => TransformOutput::One(DeliverablePayload::Text(format!(
            "{collection}/{} deleted",
            record.id
        ))),
        _ => TransformOutput::None,
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
            .connection_name("burrow-custom-transform")
            .build()?,
    ));

    let mut builder = RelayConfig::builder()
        .connection_string(&cli.relay.mongodb_uri)
        .collections(cli.relay.collections.clone())
        .destination(Destination::queue("order-totals").with_transform(order_total))
        .destination(Destination::queue("order-lines").with_transform(order_lines))
        .destination(Destination::queue("order-deletions").with_transform(deletion_notice))
        .options(cli.relay.options());
    if let Some(database) = &cli.relay.database {
        builder = builder.database(database);
    }

    let mut relay = Relay::new(builder.build()?, broker, positions, spool)?;
    relay.start().await?;
    info!("Relay running, press Ctrl+C to stop");

    signal::ctrl_c().await?;
    relay.stop().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use burrow_core::record::RecordUpdate;

    fn record(operation: ChangeOperation, full_document: Document) -> ChangeRecord {
        ChangeRecord {
            id: "o-1".to_string(),
            operation,
            full_document,
            update_description: RecordUpdate::default(),
        }
    }

    fn order() -> Document {
        doc! {
            "customer": "ada",
            "lines": [
                { "sku": "A-1", "qty": 2, "price": 4.5 },
                { "sku": "B-7", "qty": 1_i64, "price": 12.0 },
            ],
        }
    }

    #[test]
    fn total_sums_lines() {
        let TransformOutput::One(DeliverablePayload::Structured(summary)) =
            order_total(&record(ChangeOperation::Insert, order()), "orders")
        else {
            panic!("expected one structured payload");
        };
        assert_eq!(summary["total"], 21.0);
        assert_eq!(summary["customer"], "ada");
    }

    #[test]
    fn lines_fan_out_on_insert_only() {
        let inserted = order_lines(&record(ChangeOperation::Insert, order()), "orders");
        assert_eq!(inserted.into_payloads().len(), 2);

        let updated = order_lines(&record(ChangeOperation::Update, order()), "orders");
        assert_eq!(updated, TransformOutput::None);
    }

    #[test]
    fn deletions_are_text() {
        assert_eq!(
            deletion_notice(&record(ChangeOperation::Delete, Document::new()), "orders"),
            TransformOutput::One(DeliverablePayload::Text("orders/o-1 deleted".to_string()))
        );
        assert_eq!(
            order_total(&record(ChangeOperation::Delete, Document::new()), "orders"),
            TransformOutput::None
        );
    }
}
