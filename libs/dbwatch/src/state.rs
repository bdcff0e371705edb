//! Shared view state with batched, path-scoped change notification.
//!
//! All mutation goes through [`Store::apply`], which takes a [`ViewPatch`],
//! applies every populated slot under a single lock and then notifies only the
//! subscribers whose [`StatePath`] actually changed. Observers therefore never
//! see a half-applied update (e.g. a new dataset paired with a stale
//! `server_now`).

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::model::{CubeRow, DataPoint, Instance};
use crate::window::{self, LiveProbe};

/// Grouping dimension that turns the activity chart into a time series.
pub const TIME_DIMENSION: &str = "time";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeRange {
    pub start_ms: u64,
    pub end_ms: u64,
}

impl TimeRange {
    pub fn span_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CubeState {
    pub legend_dimension: String,
    pub group_dimension: String,
    pub filter_dimension: Option<String>,
    pub filter_value: Option<String>,
    pub limit: u32,
    pub last_cube_data: Vec<CubeRow>,
    pub last_error: Option<String>,
    pub filter_options: Vec<String>,
}

impl Default for CubeState {
    fn default() -> Self {
        CubeState {
            legend_dimension: "wait_event_name".to_string(),
            group_dimension: TIME_DIMENSION.to_string(),
            filter_dimension: None,
            filter_value: None,
            limit: 15,
            last_cube_data: Vec::new(),
            last_error: None,
            filter_options: Vec::new(),
        }
    }
}

impl CubeState {
    pub fn groups_by_time(&self) -> bool {
        self.group_dimension == TIME_DIMENSION
    }

    /// Filter pair, present only when both the dimension and the value are set.
    pub fn filter(&self) -> Option<(&str, &str)> {
        match (&self.filter_dimension, &self.filter_value) {
            (Some(dim), Some(value)) if !dim.is_empty() && !value.is_empty() => {
                Some((dim.as_str(), value.as_str()))
            }
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ViewState {
    pub timeframe_ms: u64,
    pub interval_ms: u64,
    pub range_begin_pct: f64,
    /// `100.0` means the view tails live data.
    pub range_end_pct: f64,
    pub server_now: Option<u64>,
    pub selected_instance: Option<Instance>,
    pub instances: Vec<Instance>,
    pub database_list: Vec<String>,
    /// Absolute window for flat metric queries; `None` queries the trailing
    /// timeframe relative to the server's now.
    pub explicit_range: Option<TimeRange>,
    pub cube: CubeState,
    pub metric_series: Vec<DataPoint>,
    pub prometheus_series: Vec<DataPoint>,
    pub force_refresh: u64,
}

impl Default for ViewState {
    fn default() -> Self {
        ViewState {
            timeframe_ms: 15 * 60 * 1000,
            interval_ms: 10 * 1000,
            range_begin_pct: 0.0,
            range_end_pct: 100.0,
            server_now: None,
            selected_instance: None,
            instances: Vec::new(),
            database_list: Vec::new(),
            explicit_range: None,
            cube: CubeState::default(),
            metric_series: Vec::new(),
            prometheus_series: Vec::new(),
            force_refresh: 0,
        }
    }
}

impl ViewState {
    pub fn is_live(&self) -> bool {
        window::is_live(self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StatePath {
    Timeframe,
    Interval,
    Range,
    ServerNow,
    Instance,
    Instances,
    Databases,
    ExplicitRange,
    CubeParams,
    CubeData,
    CubeError,
    FilterOptions,
    MetricSeries,
    PrometheusSeries,
    ForceRefresh,
}

impl StatePath {
    /// Paths that feed the query builder; a change to any of them means the
    /// datasets need refetching.
    pub const QUERY_INPUTS: &'static [StatePath] = &[
        StatePath::Timeframe,
        StatePath::Interval,
        StatePath::Range,
        StatePath::Instance,
        StatePath::Databases,
        StatePath::ExplicitRange,
        StatePath::CubeParams,
        StatePath::ForceRefresh,
    ];
}

/// A partial update. Unset slots leave the field untouched.
#[derive(Clone, Debug, Default)]
pub struct ViewPatch {
    pub timeframe_ms: Option<u64>,
    pub interval_ms: Option<u64>,
    pub range_pct: Option<(f64, f64)>,
    pub server_now: Option<u64>,
    pub selected_instance: Option<Option<Instance>>,
    pub instances: Option<Vec<Instance>>,
    pub database_list: Option<Vec<String>>,
    pub explicit_range: Option<Option<TimeRange>>,
    pub legend_dimension: Option<String>,
    pub group_dimension: Option<String>,
    pub filter: Option<Option<(String, String)>>,
    pub limit: Option<u32>,
    pub cube_data: Option<Vec<CubeRow>>,
    pub cube_error: Option<Option<String>>,
    pub filter_options: Option<Vec<String>>,
    pub metric_series: Option<Vec<DataPoint>>,
    pub prometheus_series: Option<Vec<DataPoint>>,
}

impl ViewPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeframe_ms(mut self, timeframe_ms: u64) -> Self {
        self.timeframe_ms = Some(timeframe_ms);
        self
    }

    pub fn interval_ms(mut self, interval_ms: u64) -> Self {
        self.interval_ms = Some(interval_ms);
        self
    }

    /// Zoom/pan selection, clamped to `[0, 100]` with `begin <= end`. A NaN
    /// bound leaves the range untouched.
    pub fn range_pct(mut self, begin: f64, end: f64) -> Self {
        if begin.is_nan() || end.is_nan() {
            return self;
        }
        let end = end.clamp(0.0, 100.0);
        let begin = begin.clamp(0.0, end);
        self.range_pct = Some((begin, end));
        self
    }

    pub fn server_now(mut self, server_now: u64) -> Self {
        self.server_now = Some(server_now);
        self
    }

    pub fn selected_instance(mut self, instance: Option<Instance>) -> Self {
        self.selected_instance = Some(instance);
        self
    }

    pub fn instances(mut self, instances: Vec<Instance>) -> Self {
        self.instances = Some(instances);
        self
    }

    pub fn database_list(mut self, databases: Vec<String>) -> Self {
        self.database_list = Some(databases);
        self
    }

    pub fn explicit_range(mut self, range: Option<TimeRange>) -> Self {
        self.explicit_range = Some(range);
        self
    }

    pub fn legend_dimension(mut self, dimension: impl Into<String>) -> Self {
        self.legend_dimension = Some(dimension.into());
        self
    }

    pub fn group_dimension(mut self, dimension: impl Into<String>) -> Self {
        self.group_dimension = Some(dimension.into());
        self
    }

    pub fn filter(mut self, filter: Option<(String, String)>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn cube_data(mut self, rows: Vec<CubeRow>) -> Self {
        self.cube_data = Some(rows);
        self
    }

    pub fn cube_error(mut self, error: Option<String>) -> Self {
        self.cube_error = Some(error);
        self
    }

    pub fn filter_options(mut self, options: Vec<String>) -> Self {
        self.filter_options = Some(options);
        self
    }

    pub fn metric_series(mut self, series: Vec<DataPoint>) -> Self {
        self.metric_series = Some(series);
        self
    }

    pub fn prometheus_series(mut self, series: Vec<DataPoint>) -> Self {
        self.prometheus_series = Some(series);
        self
    }

    fn apply_to(self, state: &mut ViewState) -> BTreeSet<StatePath> {
        let mut changed = BTreeSet::new();
        let mut set = |path: StatePath, differs: bool| {
            if differs {
                changed.insert(path);
            }
        };

        if let Some(v) = self.timeframe_ms {
            set(StatePath::Timeframe, replace(&mut state.timeframe_ms, v));
        }
        if let Some(v) = self.interval_ms {
            set(StatePath::Interval, replace(&mut state.interval_ms, v));
        }
        if let Some((begin, end)) = self.range_pct {
            let b = replace(&mut state.range_begin_pct, begin);
            let e = replace(&mut state.range_end_pct, end);
            set(StatePath::Range, b || e);
        }
        if let Some(v) = self.server_now {
            set(StatePath::ServerNow, replace(&mut state.server_now, Some(v)));
        }
        if let Some(v) = self.selected_instance {
            set(StatePath::Instance, replace(&mut state.selected_instance, v));
        }
        if let Some(v) = self.instances {
            set(StatePath::Instances, replace(&mut state.instances, v));
        }
        if let Some(v) = self.database_list {
            set(StatePath::Databases, replace(&mut state.database_list, v));
        }
        if let Some(v) = self.explicit_range {
            set(StatePath::ExplicitRange, replace(&mut state.explicit_range, v));
        }

        let cube = &mut state.cube;
        let mut params = false;
        if let Some(v) = self.legend_dimension {
            params |= replace(&mut cube.legend_dimension, v);
        }
        if let Some(v) = self.group_dimension {
            params |= replace(&mut cube.group_dimension, v);
        }
        if let Some(filter) = self.filter {
            let (dim, value) = filter.unzip();
            params |= replace(&mut cube.filter_dimension, dim);
            params |= replace(&mut cube.filter_value, value);
        }
        if let Some(v) = self.limit {
            params |= replace(&mut cube.limit, v);
        }
        set(StatePath::CubeParams, params);
        if let Some(v) = self.cube_data {
            set(StatePath::CubeData, replace(&mut cube.last_cube_data, v));
        }
        if let Some(v) = self.cube_error {
            set(StatePath::CubeError, replace(&mut cube.last_error, v));
        }
        if let Some(v) = self.filter_options {
            set(StatePath::FilterOptions, replace(&mut cube.filter_options, v));
        }

        if let Some(v) = self.metric_series {
            set(StatePath::MetricSeries, replace(&mut state.metric_series, v));
        }
        if let Some(v) = self.prometheus_series {
            set(
                StatePath::PrometheusSeries,
                replace(&mut state.prometheus_series, v),
            );
        }
        changed
    }
}

/// Assigns `value` and reports whether it differed from the old value.
fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn(&ViewState) + Send + Sync>;

struct Subscriber {
    id: SubscriptionId,
    paths: BTreeSet<StatePath>,
    callback: Callback,
}

struct Inner {
    state: ViewState,
    subscribers: Vec<Subscriber>,
    next_id: u64,
}

/// Cheaply clonable handle to the single shared [`ViewState`].
#[derive(Clone)]
pub struct Store {
    inner: Arc<Mutex<Inner>>,
}

impl Default for Store {
    fn default() -> Self {
        Store::new(ViewState::default())
    }
}

impl Store {
    pub fn new(state: ViewState) -> Self {
        Store {
            inner: Arc::new(Mutex::new(Inner {
                state,
                subscribers: Vec::new(),
                next_id: 0,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // subscriber callbacks run outside the lock, so poisoning can only come
        // from a panic inside `apply_to`, which leaves the state consistent
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> ViewState {
        self.lock().state.clone()
    }

    pub fn read<R>(&self, f: impl FnOnce(&ViewState) -> R) -> R {
        f(&self.lock().state)
    }

    /// Applies `patch` atomically and notifies subscribers of the changed
    /// paths. Returns the set of paths that changed.
    pub fn apply(&self, patch: ViewPatch) -> BTreeSet<StatePath> {
        let (changed, notify) = {
            let mut inner = self.lock();
            let before = LiveProbe::of(&inner.state);
            let mut changed = patch.apply_to(&mut inner.state);
            if window::forces_refresh(&before, &LiveProbe::of(&inner.state)) {
                inner.state.force_refresh += 1;
                changed.insert(StatePath::ForceRefresh);
            }
            let callbacks: Vec<Callback> = inner
                .subscribers
                .iter()
                .filter(|sub| !sub.paths.is_disjoint(&changed))
                .map(|sub| sub.callback.clone())
                .collect();
            let notify = (!callbacks.is_empty()).then(|| (inner.state.clone(), callbacks));
            (changed, notify)
        };
        trace!(?changed, "applied view patch");
        if let Some((snapshot, callbacks)) = notify {
            for callback in callbacks {
                callback(&snapshot);
            }
        }
        changed
    }

    pub fn subscribe(
        &self,
        paths: impl IntoIterator<Item = StatePath>,
        callback: impl Fn(&ViewState) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let mut inner = self.lock();
        let id = SubscriptionId(inner.next_id);
        inner.next_id += 1;
        inner.subscribers.push(Subscriber {
            id,
            paths: paths.into_iter().collect(),
            callback: Arc::new(callback),
        });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.lock().subscribers.retain(|sub| sub.id != id);
    }
}
