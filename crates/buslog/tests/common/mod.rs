// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use buslog::record::Record;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

/// Receives exactly `n` records, failing if they take longer than `limit`.
pub async fn collect(rx: &mut UnboundedReceiver<Record>, n: usize, limit: Duration) -> Vec<Record> {
    let collected = timeout(limit, async {
        let mut records = Vec::with_capacity(n);
        while records.len() < n {
            match rx.recv().await {
                Some(record) => records.push(record),
                None => break,
            }
        }
        records
    })
    .await;

    match collected {
        Ok(records) => records,
        Err(_) => panic!("timed out waiting for {n} records"),
    }
}

pub fn field(record: &Record, name: &str) -> serde_json::Value {
    let entry: serde_json::Value =
        serde_json::from_str(&record.line).expect("record should be JSON");
    entry[name].clone()
}
