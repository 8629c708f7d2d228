use crate::models::{context_tag_keys::OPERATION_ID, TelemetryKind};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, time::SystemTime};

/// Context tags of a telemetry item.
pub type Tags = BTreeMap<String, String>;

/// A single telemetry envelope as produced by instrumentation.
///
/// The delivery core only looks at the envelope name (to determine the [`TelemetryKind`]), the
/// operation id tag and the sample rate. `data` is passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryItem {
    /// Envelope name, e.g. `Microsoft.ApplicationInsights.Request`.
    pub name: String,
    /// Event time in RFC 3339 format.
    pub time: String,
    /// Sampling percentage applied to this item.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<f64>,
    /// Instrumentation key of the destination resource.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub i_key: Option<String>,
    /// Context tags.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: Tags,
    /// Base type and base data, opaque to this crate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl TelemetryItem {
    /// Create an item of the given kind, timestamped with `time`.
    pub fn new(kind: TelemetryKind, time: SystemTime) -> Self {
        TelemetryItem {
            name: format!("Microsoft.ApplicationInsights.{}", kind.envelope_suffix()),
            time: time_to_string(time),
            sample_rate: None,
            i_key: None,
            tags: Tags::new(),
            data: None,
        }
    }

    /// Set the operation id, which correlates all items of one logical operation.
    pub fn with_operation_id(mut self, operation_id: impl Into<String>) -> Self {
        self.tags.insert(OPERATION_ID.into(), operation_id.into());
        self
    }

    /// Set a sampling percentage decided upstream.
    pub fn with_sample_rate(mut self, sample_rate: f64) -> Self {
        self.sample_rate = Some(sample_rate);
        self
    }

    /// Set base type and base data.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Telemetry kind derived from the envelope name, if known.
    pub fn kind(&self) -> Option<TelemetryKind> {
        TelemetryKind::from_envelope_name(&self.name)
    }

    /// Operation id, if set and not empty.
    pub fn operation_id(&self) -> Option<&str> {
        self.tags
            .get(OPERATION_ID)
            .map(String::as_str)
            .filter(|id| !id.is_empty())
    }
}

fn time_to_string(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339_opts(SecondsFormat::Millis, true)
}
