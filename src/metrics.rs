// Goldwatch - an auction house data service
// Copyright (C) 2023 Goldwatch contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::bus::{subjects, Bus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DurationKind {
    CollectorDuration,
    AuctionsIntakeDuration,
    PricelistsIntakeDuration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntakeKind {
    LiveAuctionsIntake,
    PricelistsIntake,
}

#[derive(Serialize)]
struct MetricRecord {
    metric: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_kind: Option<DurationKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_ms: Option<u128>,
    #[serde(skip_serializing_if = "Option::is_none")]
    byte_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    buffer_size: Option<usize>,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

/// Publish-only metric reporting over the bus. Losing a metric is never
/// worth failing the operation that produced it, so errors degrade to a
/// debug log.
#[derive(Clone)]
pub struct Reporter {
    bus: Bus,
}

impl Reporter {
    pub fn new(bus: Bus) -> Self {
        Reporter { bus }
    }

    async fn report(&self, record: MetricRecord) {
        let body = match serde_json::to_vec(&record) {
            Ok(body) => body,
            Err(err) => {
                debug!(error = %err, "Could not encode metric record");
                return;
            }
        };
        if let Err(err) = self.bus.publish(subjects::METRICS, body).await {
            debug!(error = %err, "Could not publish metric record");
        }
    }

    pub async fn report_duration(
        &self,
        kind: DurationKind,
        duration: Duration,
        fields: Map<String, Value>,
    ) {
        self.report(MetricRecord {
            metric: "operational_duration",
            duration_kind: Some(kind),
            duration_ms: Some(duration.as_millis()),
            byte_count: None,
            buffer_size: None,
            fields,
        })
        .await;
    }

    pub async fn report_ingress_bytes(&self, uri: &str, byte_count: usize) {
        let mut fields = Map::new();
        fields.insert("uri".to_owned(), Value::from(uri));
        self.report(MetricRecord {
            metric: "upstream_ingress_bytes",
            duration_kind: None,
            duration_ms: None,
            byte_count: Some(byte_count),
            buffer_size: None,
            fields,
        })
        .await;
    }

    pub async fn report_intake_buffer_size(&self, kind: IntakeKind, buffer_size: usize) {
        let mut fields = Map::new();
        fields.insert(
            "intake_kind".to_owned(),
            serde_json::to_value(kind).unwrap_or(Value::Null),
        );
        self.report(MetricRecord {
            metric: "intake_buffer_size",
            duration_kind: None,
            duration_ms: None,
            byte_count: None,
            buffer_size: Some(buffer_size),
            fields,
        })
        .await;
    }
}
