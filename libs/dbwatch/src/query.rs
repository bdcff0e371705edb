//! Pure translation of the current [`ViewState`] into request descriptors.

use std::fmt;

use reqwest::Url;

use crate::Error;
use crate::model::EndpointKind;
use crate::state::{TimeRange, ViewState};
use crate::window::{self, QueryMode};

/// Every HTTP path the dashboard talks to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Instances,
    Databases,
    Data(EndpointKind),
}

impl Endpoint {
    pub const fn path(self) -> &'static str {
        match self {
            Endpoint::Instances => "/api/v1/instance",
            Endpoint::Databases => "/api/v1/instance/database",
            Endpoint::Data(kind) => kind.path(),
        }
    }
}

/// `why` parameter of the activity endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActivityWhy {
    Cube,
    TimeWindow,
    FilterOptions,
}

impl ActivityWhy {
    pub const fn as_str(self) -> &'static str {
        match self {
            ActivityWhy::Cube => "cube",
            ActivityWhy::TimeWindow => "timewindow",
            ActivityWhy::FilterOptions => "filteroptions",
        }
    }
}

/// Sample span of a data request, checked against the sample budget before
/// anything is sent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SampleSpan {
    pub time_range_ms: u64,
    pub interval_ms: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RequestDescriptor {
    pub endpoint: Endpoint,
    pub params: Vec<(&'static str, String)>,
    pub span: Option<SampleSpan>,
}

impl RequestDescriptor {
    fn new(endpoint: Endpoint) -> Self {
        RequestDescriptor {
            endpoint,
            params: Vec::new(),
            span: None,
        }
    }

    fn param(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.params.push((key, value.into()));
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Full URL against `base`, keeping any path prefix it carries. Values
    /// are form-encoded here and nowhere else.
    pub fn url(&self, base: &str) -> Result<Url, Error> {
        let mut base =
            Url::parse(base).map_err(|err| Error::InvalidUrl(format!("{base}: {err}")))?;
        if !base.path().ends_with('/') {
            let prefixed = format!("{}/", base.path());
            base.set_path(&prefixed);
        }
        let mut url = base
            .join(self.endpoint.path().trim_start_matches('/'))
            .map_err(|err| Error::InvalidUrl(err.to_string()))?;
        if !self.params.is_empty() {
            url.query_pairs_mut().extend_pairs(self.params.iter());
        }
        Ok(url)
    }
}

impl fmt::Display for RequestDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.endpoint.path())?;
        for (i, (key, value)) in self.params.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{sep}{key}={value}")?;
        }
        Ok(())
    }
}

enum Bounds {
    Relative { span_ms: u64 },
    Absolute(TimeRange),
}

impl Bounds {
    fn start(&self) -> String {
        match self {
            Bounds::Relative { span_ms } => format!("now-{span_ms}ms"),
            Bounds::Absolute(range) => range.start_ms.to_string(),
        }
    }

    fn end(&self) -> String {
        match self {
            Bounds::Relative { .. } => "now".to_string(),
            Bounds::Absolute(range) => range.end_ms.to_string(),
        }
    }

    fn span_ms(&self) -> u64 {
        match self {
            Bounds::Relative { span_ms } => *span_ms,
            Bounds::Absolute(range) => range.span_ms(),
        }
    }
}

fn step(interval_ms: u64) -> String {
    format!("{interval_ms}ms")
}

fn joined_databases(state: &ViewState) -> String {
    state.database_list.join("|")
}

/// Builds the request for `kind`, or `None` when the view lacks what the
/// query needs (databases, an instance, or a server clock for windows).
pub fn build_query(kind: EndpointKind, state: &ViewState) -> Option<RequestDescriptor> {
    match kind {
        EndpointKind::ActivityCube => {
            let why = match QueryMode::for_state(state) {
                QueryMode::FullTimeframe => ActivityWhy::Cube,
                QueryMode::Window => ActivityWhy::TimeWindow,
            };
            build_activity(why, state)
        }
        EndpointKind::Metric => build_metric(state),
        EndpointKind::PrometheusMetrics => Some(build_prometheus(state)),
    }
}

/// Option values for the selected filter dimension.
pub fn build_filter_options_query(state: &ViewState) -> Option<RequestDescriptor> {
    build_activity(ActivityWhy::FilterOptions, state)
}

pub fn instances_query() -> RequestDescriptor {
    RequestDescriptor::new(Endpoint::Instances)
}

pub fn databases_query(db_identifier: &str) -> RequestDescriptor {
    RequestDescriptor::new(Endpoint::Databases).param("dbidentifier", db_identifier)
}

fn activity_bounds(why: ActivityWhy, state: &ViewState) -> Option<Bounds> {
    let mode = match why {
        ActivityWhy::Cube => QueryMode::FullTimeframe,
        ActivityWhy::TimeWindow => QueryMode::Window,
        ActivityWhy::FilterOptions => QueryMode::for_state(state),
    };
    match mode {
        QueryMode::FullTimeframe => Some(Bounds::Relative {
            span_ms: state.timeframe_ms,
        }),
        QueryMode::Window => window::selected_window(state).map(Bounds::Absolute),
    }
}

fn build_activity(why: ActivityWhy, state: &ViewState) -> Option<RequestDescriptor> {
    if state.database_list.is_empty() {
        return None;
    }
    let instance = state.selected_instance.as_ref()?;
    let bounds = activity_bounds(why, state)?;
    let cube = &state.cube;

    let (filter_dim, filter_selected) = match why {
        ActivityWhy::FilterOptions => (cube.filter_dimension.clone()?, String::new()),
        _ => cube
            .filter()
            .map(|(dim, value)| (dim.to_string(), value.to_string()))
            .unwrap_or_default(),
    };
    if why == ActivityWhy::FilterOptions && filter_dim.is_empty() {
        return None;
    }

    let mut req = RequestDescriptor::new(Endpoint::Data(EndpointKind::ActivityCube))
        .param("why", why.as_str())
        .param("database_list", joined_databases(state))
        .param("start", bounds.start())
        .param("end", bounds.end())
        .param("step", step(state.interval_ms))
        .param("limitdim", cube.limit.to_string())
        .param("limitlegend", cube.limit.to_string())
        .param("legend", cube.legend_dimension.as_str())
        .param("dim", cube.group_dimension.as_str())
        .param("filterdim", filter_dim)
        .param("filterdimselected", filter_selected)
        .param("dbidentifier", instance.db_identifier.as_str());
    req.span = Some(SampleSpan {
        time_range_ms: bounds.span_ms(),
        interval_ms: state.interval_ms,
    });
    Some(req)
}

fn metric_bounds(state: &ViewState) -> Bounds {
    match state.explicit_range {
        Some(range) => Bounds::Absolute(window::clamp_window(range.start_ms, range.end_ms)),
        None => Bounds::Relative {
            span_ms: state.timeframe_ms,
        },
    }
}

fn build_metric(state: &ViewState) -> Option<RequestDescriptor> {
    if state.database_list.is_empty() {
        return None;
    }
    let instance = state.selected_instance.as_ref()?;
    let bounds = metric_bounds(state);
    let mut req = RequestDescriptor::new(Endpoint::Data(EndpointKind::Metric))
        .param("datname", joined_databases(state))
        .param("start", bounds.start())
        .param("end", bounds.end())
        .param("step", step(state.interval_ms))
        .param("dbidentifier", instance.db_identifier.as_str());
    req.span = Some(SampleSpan {
        time_range_ms: bounds.span_ms(),
        interval_ms: state.interval_ms,
    });
    Some(req)
}

fn build_prometheus(state: &ViewState) -> RequestDescriptor {
    let bounds = metric_bounds(state);
    let mut req = RequestDescriptor::new(Endpoint::Data(EndpointKind::PrometheusMetrics))
        .param("start", bounds.start())
        .param("end", bounds.end())
        .param("step", step(state.interval_ms));
    req.span = Some(SampleSpan {
        time_range_ms: bounds.span_ms(),
        interval_ms: state.interval_ms,
    });
    req
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Instance;

    fn scoped_state() -> ViewState {
        ViewState {
            database_list: vec!["postgres".into(), "app".into()],
            selected_instance: Some(Instance::new("abc")),
            ..Default::default()
        }
    }

    #[test]
    fn test_full_timeframe_cube() {
        let state = scoped_state();
        let req = build_query(EndpointKind::ActivityCube, &state).unwrap();
        assert_eq!(req.endpoint.path(), "/api/v1/activity");
        assert_eq!(req.get("why"), Some("cube"));
        assert_eq!(req.get("start"), Some("now-900000ms"));
        assert_eq!(req.get("end"), Some("now"));
        assert_eq!(req.get("step"), Some("10000ms"));
        assert_eq!(req.get("database_list"), Some("postgres|app"));
        assert_eq!(req.get("dbidentifier"), Some("abc"));
        assert_eq!(req.get("dim"), Some("time"));
        assert_eq!(req.get("filterdim"), Some(""));
        assert_eq!(req.get("filterdimselected"), Some(""));
        assert_eq!(
            req.span,
            Some(SampleSpan {
                time_range_ms: 900_000,
                interval_ms: 10_000
            })
        );
    }

    #[test]
    fn test_time_window_cube() {
        let mut state = scoped_state();
        state.cube.group_dimension = "usename".into();
        state.range_begin_pct = 10.0;
        state.range_end_pct = 50.0;
        state.timeframe_ms = 100_000;

        // no server clock yet
        assert!(build_query(EndpointKind::ActivityCube, &state).is_none());

        state.server_now = Some(1_000_000);
        let req = build_query(EndpointKind::ActivityCube, &state).unwrap();
        assert_eq!(req.get("why"), Some("timewindow"));
        assert_eq!(req.get("start"), Some("910000"));
        assert_eq!(req.get("end"), Some("950000"));
        assert_eq!(req.span.unwrap().time_range_ms, 40_000);
    }

    #[test]
    fn test_time_window_end_after_start() {
        let mut state = scoped_state();
        state.cube.group_dimension = "usename".into();
        state.range_begin_pct = 30.0;
        state.range_end_pct = 30.0;
        state.server_now = Some(1_000_000);
        let req = build_query(EndpointKind::ActivityCube, &state).unwrap();
        let start: u64 = req.get("start").unwrap().parse().unwrap();
        let end: u64 = req.get("end").unwrap().parse().unwrap();
        assert_eq!(end, start + 1);
    }

    #[test]
    fn test_filter_is_encoded_once() {
        let mut state = scoped_state();
        state.cube.filter_dimension = Some("query".into());
        state.cube.filter_value = Some("select a/b & c".into());
        let req = build_query(EndpointKind::ActivityCube, &state).unwrap();
        assert_eq!(req.get("filterdimselected"), Some("select a/b & c"));

        let url = req.url("http://localhost:7080").unwrap();
        let query = url.query().unwrap();
        assert!(query.contains("filterdim=query"));
        assert!(query.contains("filterdimselected=select+a%2Fb+%26+c"));
        assert!(query.contains("database_list=postgres%7Capp"));
        assert_eq!(url.path(), "/api/v1/activity");
    }

    #[test]
    fn test_url_keeps_base_path_prefix() {
        let req = instances_query();
        for base in ["http://proxy:8080/autodba", "http://proxy:8080/autodba/"] {
            let url = req.url(base).unwrap();
            assert_eq!(url.as_str(), "http://proxy:8080/autodba/api/v1/instance");
        }
        let url = databases_query("abc").url("http://localhost:7080").unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:7080/api/v1/instance/database?dbidentifier=abc"
        );
        assert!(matches!(req.url("not a url"), Err(Error::InvalidUrl(_))));
    }

    #[test]
    fn test_filter_options() {
        let mut state = scoped_state();
        assert!(build_filter_options_query(&state).is_none());
        state.cube.filter_dimension = Some("usename".into());
        let req = build_filter_options_query(&state).unwrap();
        assert_eq!(req.get("why"), Some("filteroptions"));
        assert_eq!(req.get("filterdim"), Some("usename"));
        assert_eq!(req.get("filterdimselected"), Some(""));
    }

    #[test]
    fn test_preconditions() {
        let mut state = scoped_state();
        state.database_list.clear();
        assert!(build_query(EndpointKind::ActivityCube, &state).is_none());
        assert!(build_query(EndpointKind::Metric, &state).is_none());

        let mut state = scoped_state();
        state.selected_instance = None;
        assert!(build_query(EndpointKind::ActivityCube, &state).is_none());
        assert!(build_query(EndpointKind::Metric, &state).is_none());
        assert!(build_query(EndpointKind::PrometheusMetrics, &state).is_some());
    }

    #[test]
    fn test_metric_relative_and_explicit() {
        let mut state = scoped_state();
        let req = build_query(EndpointKind::Metric, &state).unwrap();
        assert_eq!(req.endpoint.path(), "/api/v1/metric");
        assert_eq!(req.get("datname"), Some("postgres|app"));
        assert_eq!(req.get("start"), Some("now-900000ms"));
        assert_eq!(req.get("end"), Some("now"));

        state.explicit_range = Some(TimeRange {
            start_ms: 1_000,
            end_ms: 61_000,
        });
        let req = build_query(EndpointKind::Metric, &state).unwrap();
        assert_eq!(req.get("start"), Some("1000"));
        assert_eq!(req.get("end"), Some("61000"));
        assert_eq!(req.span.unwrap().time_range_ms, 60_000);
    }

    #[test]
    fn test_prometheus_params() {
        let req = build_query(EndpointKind::PrometheusMetrics, &ViewState::default()).unwrap();
        let keys: Vec<_> = req.params.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, ["start", "end", "step"]);
    }

    #[test]
    fn test_bootstrap_queries() {
        assert_eq!(instances_query().to_string(), "/api/v1/instance");
        assert_eq!(
            databases_query("abc").to_string(),
            "/api/v1/instance/database?dbidentifier=abc"
        );
        assert!(instances_query().span.is_none());
    }
}
