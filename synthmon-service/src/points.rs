//! Parser for the native executor's metric stream.
//!
//! The child process writes one JSON object per line. Only objects with
//! `type == "Point"` carry samples; everything else (metric declarations,
//! blank lines, partial writes) is skipped silently.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// One sample extracted from the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    pub time: Option<DateTime<Utc>>,
    pub metric: String,
    pub value: f64,
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RawLine {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    metric: String,
    #[serde(default)]
    data: RawData,
}

#[derive(Debug, Default, Deserialize)]
struct RawData {
    time: Option<String>,
    value: Option<f64>,
    tags: Option<HashMap<String, serde_json::Value>>,
}

/// Extracts all `Point` samples from a line-delimited stream.
pub fn parse_lines(input: &str) -> Vec<MetricPoint> {
    input
        .lines()
        .filter_map(|line| {
            let raw: RawLine = serde_json::from_str(line).ok()?;
            if raw.kind != "Point" {
                return None;
            }

            let time = raw
                .data
                .time
                .as_deref()
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Utc));

            let tags = raw
                .data
                .tags
                .unwrap_or_default()
                .into_iter()
                .filter_map(|(key, value)| match value {
                    serde_json::Value::String(s) => Some((key, s)),
                    _ => None,
                })
                .collect();

            Some(MetricPoint {
                time,
                metric: raw.metric,
                value: raw.data.value.unwrap_or_default(),
                tags,
            })
        })
        .collect()
}

/// Groups points by metric name for per-metric processing.
pub fn group_by_metric(points: Vec<MetricPoint>) -> HashMap<String, Vec<MetricPoint>> {
    let mut grouped: HashMap<String, Vec<MetricPoint>> = HashMap::new();
    for point in points {
        grouped.entry(point.metric.clone()).or_default().push(point);
    }
    grouped
}
