use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// The three data endpoints the dashboard polls. Each gets its own in-flight
/// slot in the throttle gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EndpointKind {
    ActivityCube,
    Metric,
    PrometheusMetrics,
}

impl EndpointKind {
    pub const ALL: [EndpointKind; 3] = [
        EndpointKind::ActivityCube,
        EndpointKind::Metric,
        EndpointKind::PrometheusMetrics,
    ];

    pub const fn path(self) -> &'static str {
        match self {
            EndpointKind::ActivityCube => "/api/v1/activity",
            EndpointKind::Metric => "/api/v1/metric",
            EndpointKind::PrometheusMetrics => "/api/v1/prometheus_metrics",
        }
    }
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EndpointKind::ActivityCube => "activity",
            EndpointKind::Metric => "metric",
            EndpointKind::PrometheusMetrics => "prometheus_metrics",
        };
        f.write_str(name)
    }
}

/// A monitored database instance as listed by `/api/v1/instance`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    #[serde(rename = "dbIdentifier", alias = "db_identifier")]
    pub db_identifier: String,
    #[serde(rename = "systemId", alias = "system_id", default)]
    pub system_id: Option<String>,
    #[serde(rename = "systemType", alias = "system_type", default)]
    pub system_type: Option<String>,
    #[serde(rename = "systemScope", alias = "system_scope", default)]
    pub system_scope: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Instance {
    pub fn new(db_identifier: impl Into<String>) -> Self {
        Instance {
            db_identifier: db_identifier.into(),
            system_id: None,
            system_type: None,
            system_scope: None,
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: i64,
    #[serde(deserialize_with = "number_or_string")]
    pub value: f64,
}

/// One labelled series. Cube rows carry the grouping/legend dimensions in
/// `metric`; flat metric responses carry metric labels.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Series {
    #[serde(default)]
    pub metric: BTreeMap<String, String>,
    #[serde(default)]
    pub values: Vec<Sample>,
}

pub type CubeRow = Series;
pub type DataPoint = Series;

#[derive(Clone, Debug, Deserialize)]
pub struct InstanceList {
    pub list: Option<Vec<Instance>>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SeriesResponse {
    pub data: Option<Vec<Series>>,
    pub server_now: Option<u64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct FilterOptionsResponse {
    pub data: Option<Vec<String>>,
    pub server_now: Option<u64>,
}

fn number_or_string<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => match s.as_str() {
            "NaN" => Ok(f64::NAN),
            "+Inf" => Ok(f64::INFINITY),
            "-Inf" => Ok(f64::NEG_INFINITY),
            s => s.parse().map_err(serde::de::Error::custom),
        },
    }
}
