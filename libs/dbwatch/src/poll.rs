use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::fetch::Dashboard;
use crate::model::EndpointKind;
use crate::state::{StatePath, SubscriptionId, ViewState};

/// Drives a [`Dashboard`]: tails live data on a fixed interval and refetches
/// immediately whenever a query input changes.
pub struct Poller {
    dashboard: Dashboard,
    interval: Duration,
}

impl Poller {
    pub fn new(dashboard: Dashboard, interval: Duration) -> Self {
        Poller {
            dashboard,
            interval,
        }
    }

    pub fn spawn(self) -> PollerHandle {
        let Poller {
            dashboard,
            interval,
        } = self;
        let wake = Arc::new(Notify::new());
        let subscription = dashboard
            .store()
            .subscribe(StatePath::QUERY_INPUTS.iter().copied(), {
                let wake = wake.clone();
                move |_| wake.notify_one()
            });

        let task = tokio::spawn({
            let dashboard = dashboard.clone();
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    let with_filter_options = tokio::select! {
                        _ = ticker.tick() => {
                            if !dashboard.store().read(ViewState::is_live) {
                                trace!("paused, skipping tick");
                                continue;
                            }
                            false
                        }
                        _ = wake.notified() => {
                            debug!("query inputs changed");
                            true
                        }
                    };
                    spawn_refreshes(&dashboard, with_filter_options);
                }
            }
        });

        PollerHandle {
            dashboard,
            subscription,
            task,
        }
    }
}

/// Each endpoint refreshes on its own task so a slow endpoint never delays
/// the others; the throttle keeps one request per endpoint in flight.
fn spawn_refreshes(dashboard: &Dashboard, with_filter_options: bool) {
    for kind in EndpointKind::ALL {
        let dashboard = dashboard.clone();
        tokio::spawn(async move {
            dashboard.refresh(kind).await;
        });
    }
    let has_filter_dimension = dashboard
        .store()
        .read(|state| state.cube.filter_dimension.is_some());
    if with_filter_options && has_filter_dimension {
        let dashboard = dashboard.clone();
        tokio::spawn(async move {
            dashboard.fetch_filter_options().await;
        });
    }
}

pub struct PollerHandle {
    dashboard: Dashboard,
    subscription: SubscriptionId,
    task: JoinHandle<()>,
}

impl PollerHandle {
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.dashboard.store().unsubscribe(self.subscription);
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::SampleBudget;
    use crate::model::Instance;
    use crate::query::RequestDescriptor;
    use crate::state::{Store, ViewPatch};
    use crate::testing::MockTransport;

    const ACTIVITY: &str = "/api/v1/activity";
    const METRIC: &str = "/api/v1/metric";
    const PROMETHEUS: &str = "/api/v1/prometheus_metrics";
    const CUBE_BODY: &str = r#"{"data":[],"server_now":1000000}"#;

    fn reply_everywhere(mock: &MockTransport) {
        for path in [ACTIVITY, METRIC, PROMETHEUS] {
            mock.reply(path, 200, CUBE_BODY);
        }
    }

    fn last_request(mock: &MockTransport, path: &str) -> RequestDescriptor {
        mock.requests(path)
            .pop()
            .unwrap_or_else(|| panic!("no request to {path}"))
    }

    fn dashboard(mock: &Arc<MockTransport>, range_end: f64) -> Dashboard {
        let state = ViewState {
            database_list: vec!["postgres".into()],
            selected_instance: Some(Instance::new("abc")),
            range_end_pct: range_end,
            ..Default::default()
        };
        Dashboard::new(
            Store::new(state),
            mock.clone(),
            SampleBudget::default(),
            Duration::from_secs(5),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_view_polls_on_interval() {
        let mock = MockTransport::new();
        mock.reply(ACTIVITY, 200, CUBE_BODY);
        let dash = dashboard(&mock, 100.0);
        let handle = Poller::new(dash, Duration::from_secs(10)).spawn();

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(mock.requests(ACTIVITY).len(), 1);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(mock.requests(ACTIVITY).len(), 2);

        handle.shutdown();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(mock.requests(ACTIVITY).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_view_refreshes_only_on_change() {
        let mock = MockTransport::new();
        mock.reply(ACTIVITY, 200, CUBE_BODY);
        let dash = dashboard(&mock, 50.0);
        let _handle = Poller::new(dash.clone(), Duration::from_secs(10)).spawn();

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(mock.requests(ACTIVITY).is_empty());

        dash.store().apply(ViewPatch::new().interval_ms(5000));
        tokio::time::sleep(Duration::from_millis(1)).await;
        let requests = mock.requests(ACTIVITY);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].get("step"), Some("5000ms"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_returning_to_live_refetches() {
        let mock = MockTransport::new();
        mock.reply(ACTIVITY, 200, CUBE_BODY);
        let dash = dashboard(&mock, 40.0);
        let _handle = Poller::new(dash.clone(), Duration::from_secs(60)).spawn();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(mock.requests(ACTIVITY).is_empty());

        let changed = dash.store().apply(ViewPatch::new().range_pct(0.0, 100.0));
        assert!(changed.contains(&StatePath::ForceRefresh));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(mock.requests(ACTIVITY).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inputs_changed_while_in_flight_are_fetched() {
        let mock = MockTransport::new();
        reply_everywhere(&mock);
        mock.hold();
        let dash = dashboard(&mock, 50.0);
        let _handle = Poller::new(dash.clone(), Duration::from_secs(10)).spawn();
        tokio::time::sleep(Duration::from_millis(1)).await;

        dash.store().apply(ViewPatch::new().legend_dimension("usename"));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(dash.throttle().is_in_flight(EndpointKind::ActivityCube));
        assert!(dash.throttle().is_in_flight(EndpointKind::Metric));

        dash.store().apply(
            ViewPatch::new()
                .legend_dimension("query")
                .interval_ms(5000),
        );
        tokio::time::sleep(Duration::from_millis(1)).await;
        mock.release();
        tokio::time::sleep(Duration::from_secs(120)).await;

        let cube = last_request(&mock, ACTIVITY);
        assert_eq!(cube.get("legend"), Some("query"));
        assert_eq!(cube.get("step"), Some("5000ms"));
        assert_eq!(last_request(&mock, METRIC).get("step"), Some("5000ms"));
        assert_eq!(last_request(&mock, PROMETHEUS).get("step"), Some("5000ms"));

        let throttle = dash.throttle().snapshot();
        assert_eq!(throttle.pending_replay, None);
        assert!(throttle.in_flight.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_windowed_cube_waits_for_server_clock() {
        let mock = MockTransport::new();
        reply_everywhere(&mock);
        let mut state = ViewState {
            range_begin_pct: 25.0,
            range_end_pct: 75.0,
            ..Default::default()
        };
        state.cube.group_dimension = "usename".into();
        let dash = Dashboard::new(
            Store::new(state),
            mock.clone(),
            SampleBudget::default(),
            Duration::from_secs(5),
        );
        let _handle = Poller::new(dash.clone(), Duration::from_secs(10)).spawn();
        tokio::time::sleep(Duration::from_millis(1)).await;

        dash.store().apply(
            ViewPatch::new()
                .selected_instance(Some(Instance::new("abc")))
                .database_list(vec!["postgres".into()]),
        );
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(dash.store().read(|s| s.server_now), Some(1_000_000));
        let cube = last_request(&mock, ACTIVITY);
        assert_eq!(cube.get("why"), Some("timewindow"));
        assert_eq!(cube.get("start"), Some("325000"));
        assert_eq!(cube.get("end"), Some("775000"));
    }
}
