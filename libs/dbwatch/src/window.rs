//! Maps the zoom/pan selection (percent of the timeframe) onto absolute
//! timestamps anchored at the server's clock, and tracks live/paused mode.

use crate::state::{TimeRange, ViewState};

/// Range end that marks the view as tailing live data.
pub const LIVE_END_PCT: f64 = 100.0;

/// Converts a position inside the timeframe into an epoch-millisecond
/// timestamp: 0% is `server_now - timeframe_ms`, 100% is `server_now`.
pub fn percent_to_timestamp(pct: f64, timeframe_ms: u64, server_now: u64) -> u64 {
    let pct = pct.clamp(0.0, 100.0);
    let back = timeframe_ms as f64 * (100.0 - pct) / 100.0;
    (server_now as f64 - back).round().max(0.0) as u64
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryMode {
    /// The whole trailing timeframe, regardless of zoom. Used when the
    /// activity chart groups by time and needs full-range density.
    FullTimeframe,
    /// Only the zoomed slice; aggregate bars don't need anything else.
    Window,
}

impl QueryMode {
    pub fn for_state(state: &ViewState) -> Self {
        if state.cube.groups_by_time() {
            QueryMode::FullTimeframe
        } else {
            QueryMode::Window
        }
    }
}

/// The zoomed slice as absolute timestamps, with `end > start`. `None` until
/// the first response has established `server_now`.
pub fn selected_window(state: &ViewState) -> Option<TimeRange> {
    let server_now = state.server_now?;
    let start_ms = percent_to_timestamp(state.range_begin_pct, state.timeframe_ms, server_now);
    let end_ms = percent_to_timestamp(state.range_end_pct, state.timeframe_ms, server_now);
    Some(clamp_window(start_ms, end_ms))
}

pub fn clamp_window(start_ms: u64, end_ms: u64) -> TimeRange {
    TimeRange {
        start_ms,
        end_ms: end_ms.max(start_ms + 1),
    }
}

pub fn is_live(state: &ViewState) -> bool {
    !state.database_list.is_empty() && state.range_end_pct == LIVE_END_PCT
}

/// The parts of the state that decide whether an update must force dependent
/// queries to re-run.
#[derive(Clone, Copy, Debug)]
pub struct LiveProbe {
    live: bool,
    range_end_pct: f64,
    groups_by_time: bool,
    has_server_now: bool,
}

impl LiveProbe {
    pub fn of(state: &ViewState) -> Self {
        LiveProbe {
            live: is_live(state),
            range_end_pct: state.range_end_pct,
            groups_by_time: state.cube.groups_by_time(),
            has_server_now: state.server_now.is_some(),
        }
    }
}

/// Returning to the live edge, leaving the time dimension while paused, or
/// learning the server clock while a windowed cube query was waiting for it,
/// may not change the query parameters enough to trigger a refetch on its own.
pub fn forces_refresh(before: &LiveProbe, after: &LiveProbe) -> bool {
    let back_to_live =
        before.range_end_pct < LIVE_END_PCT && after.range_end_pct == LIVE_END_PCT;
    let left_time = before.groups_by_time && !after.groups_by_time && !after.live;
    let clock_arrived = !before.has_server_now && after.has_server_now && !after.groups_by_time;
    back_to_live || left_time || clock_arrived
}
