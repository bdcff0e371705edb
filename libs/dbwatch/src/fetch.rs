//! Fetch orchestration: throttle, budget, build, GET, classify, merge.
//!
//! Nothing here returns an error to the caller. Every path ends in a
//! [`FetchOutcome`] (or `bool` for bootstrap) plus, at most, a state patch;
//! views react to the state.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::Error;
use crate::budget::SampleBudget;
use crate::config::Config;
use crate::model::{EndpointKind, FilterOptionsResponse, Instance, InstanceList, SeriesResponse};
use crate::query::{self, RequestDescriptor};
use crate::retry::{RetryKind, RetryScheduler};
use crate::state::{Store, ViewPatch};
use crate::throttle::ApiThrottle;
use crate::transport::{HttpTransport, Transport};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Response merged into the store.
    Updated,
    /// Sent, but the response was unusable (transport error, non-2xx,
    /// empty or malformed body).
    Failed,
    /// The endpoint was busy; the request was recorded for replay.
    Deferred,
    /// The view lacks what the query needs.
    NotApplicable,
    /// Rejected by the sample budget before sending.
    OverBudget,
}

impl FetchOutcome {
    pub fn is_ok(self) -> bool {
        self == FetchOutcome::Updated
    }
}

struct Inner {
    store: Store,
    throttle: ApiThrottle,
    retries: RetryScheduler,
    transport: Arc<dyn Transport>,
    budget: SampleBudget,
    retry_delay: Duration,
}

/// Handle tying the shared state to the backend. Clones share everything.
#[derive(Clone)]
pub struct Dashboard {
    inner: Arc<Inner>,
}

impl Dashboard {
    pub fn new(
        store: Store,
        transport: Arc<dyn Transport>,
        budget: SampleBudget,
        retry_delay: Duration,
    ) -> Self {
        Dashboard {
            inner: Arc::new(Inner {
                store,
                throttle: ApiThrottle::new(),
                retries: RetryScheduler::new(),
                transport,
                budget,
                retry_delay,
            }),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, Error> {
        let access_key = config
            .access_key
            .as_deref()
            .map(|key| (config.access_key_header.as_str(), key));
        let transport =
            HttpTransport::new(config.base_url.clone(), access_key, config.request_timeout())?;
        Ok(Dashboard::new(
            Store::new(config.view_defaults()),
            Arc::new(transport),
            SampleBudget::new(config.max_samples),
            config.retry_delay(),
        ))
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn throttle(&self) -> &ApiThrottle {
        &self.inner.throttle
    }

    pub fn retries(&self) -> &RetryScheduler {
        &self.inner.retries
    }

    /// Fetches `kind` and then drains the replay slot.
    pub async fn refresh(&self, kind: EndpointKind) -> FetchOutcome {
        let outcome = self.attempt(kind).await;
        self.drain_replays().await;
        outcome
    }

    /// The slot only remembers the most recent deferral, while every
    /// deferred request may have carried new inputs. A drained slot therefore
    /// re-runs the fetch decision for all data endpoints.
    ///
    /// Whoever settles last drains: if another request is still outstanding,
    /// its own refresh picks the slot up once it completes.
    async fn drain_replays(&self) {
        loop {
            if self.inner.throttle.any_in_flight() {
                return;
            }
            let Some(latest) = self.inner.throttle.settle_and_replay() else {
                return;
            };
            debug!(deferred = %latest, "replaying deferred refresh");
            join_all(EndpointKind::ALL.map(|kind| self.attempt(kind))).await;
        }
    }

    /// Refreshes every data endpoint concurrently.
    pub async fn refresh_all(&self) -> Vec<(EndpointKind, FetchOutcome)> {
        let refreshes = EndpointKind::ALL
            .into_iter()
            .map(|kind| async move { (kind, self.refresh(kind).await) });
        join_all(refreshes).await
    }

    async fn attempt(&self, kind: EndpointKind) -> FetchOutcome {
        let Some(_in_flight) = self.inner.throttle.acquire(kind) else {
            return FetchOutcome::Deferred;
        };
        let Some(request) = self.inner.store.read(|state| query::build_query(kind, state)) else {
            debug!(endpoint = %kind, "query not applicable");
            return FetchOutcome::NotApplicable;
        };
        if !self.within_budget(&request) {
            return FetchOutcome::OverBudget;
        }
        if kind == EndpointKind::ActivityCube {
            self.inner.store.apply(ViewPatch::new().cube_error(None));
        }

        match self.get_json::<SeriesResponse>(&request).await {
            Ok(SeriesResponse {
                data: Some(data),
                server_now,
            }) => {
                debug!(endpoint = %kind, series = data.len(), "fetched");
                let mut patch = match kind {
                    EndpointKind::ActivityCube => ViewPatch::new().cube_data(data),
                    EndpointKind::Metric => ViewPatch::new().metric_series(data),
                    EndpointKind::PrometheusMetrics => ViewPatch::new().prometheus_series(data),
                };
                if let Some(server_now) = server_now {
                    patch = patch.server_now(server_now);
                }
                self.inner.store.apply(patch);
                FetchOutcome::Updated
            }
            Ok(_) => {
                warn!(endpoint = %kind, "response without data");
                FetchOutcome::Failed
            }
            Err(err) => {
                self.record_failure(kind, &err);
                FetchOutcome::Failed
            }
        }
    }

    /// Option values for the selected filter dimension. Not throttled.
    pub async fn fetch_filter_options(&self) -> FetchOutcome {
        let Some(request) = self.inner.store.read(query::build_filter_options_query) else {
            return FetchOutcome::NotApplicable;
        };
        if !self.within_budget(&request) {
            return FetchOutcome::OverBudget;
        }
        self.inner.store.apply(ViewPatch::new().cube_error(None));
        match self.get_json::<FilterOptionsResponse>(&request).await {
            Ok(FilterOptionsResponse {
                data: Some(options),
                server_now,
            }) => {
                let mut patch = ViewPatch::new().filter_options(options);
                if let Some(server_now) = server_now {
                    patch = patch.server_now(server_now);
                }
                self.inner.store.apply(patch);
                FetchOutcome::Updated
            }
            Ok(_) => {
                warn!("filter options response without data");
                FetchOutcome::Failed
            }
            Err(err) => {
                self.record_failure(EndpointKind::ActivityCube, &err);
                FetchOutcome::Failed
            }
        }
    }

    fn within_budget(&self, request: &RequestDescriptor) -> bool {
        let Some(span) = request.span else {
            return true;
        };
        match self.inner.budget.check(span.time_range_ms, span.interval_ms) {
            Ok(_) => true,
            Err(err) => {
                debug!(request = %request, %err, "skipping query over sample budget");
                false
            }
        }
    }

    fn record_failure(&self, kind: EndpointKind, err: &Error) {
        match err.user_message() {
            Some(message) if kind == EndpointKind::ActivityCube => {
                warn!(endpoint = %kind, %message, "query rejected");
                self.inner
                    .store
                    .apply(ViewPatch::new().cube_error(Some(message)));
            }
            _ => warn!(endpoint = %kind, %err, "fetch failed"),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, request: &RequestDescriptor) -> Result<T, Error> {
        let res = self.inner.transport.get(request).await?.error_for_status()?;
        if res.body.is_empty() {
            return Err(Error::EmptyPayload);
        }
        Ok(serde_json::from_slice(&res.body)?)
    }

    fn schedule_retry(
        &self,
        kind: RetryKind,
        run: impl FnOnce(Dashboard) -> BoxFuture<'static, bool> + Send + 'static,
    ) {
        let this = self.clone();
        self.inner.retries.schedule(kind, self.inner.retry_delay, move || {
            async move {
                run(this).await;
            }
            .boxed()
        });
    }

    /// Lists instances, keeps the active one if it is still listed (else picks
    /// the first), then discovers its databases. With `retry`, an empty or
    /// failed result schedules another attempt.
    pub fn fetch_instances(&self, retry: bool) -> BoxFuture<'static, bool> {
        let this = self.clone();
        async move {
            let list = match this.get_json::<InstanceList>(&query::instances_query()).await {
                Ok(InstanceList { list: Some(list) }) if !list.is_empty() => Some(list),
                Ok(_) => {
                    warn!("no instances listed");
                    None
                }
                Err(err) => {
                    warn!(%err, "instance discovery failed");
                    None
                }
            };
            let Some(list) = list else {
                if retry {
                    this.schedule_retry(RetryKind::ActivityInstances, |d| d.fetch_instances(true));
                }
                return false;
            };

            let current = this
                .inner
                .store
                .read(|state| state.selected_instance.clone());
            let Some(active) = current
                .and_then(|cur| list.iter().find(|i| i.db_identifier == cur.db_identifier))
                .or_else(|| list.first())
                .cloned()
            else {
                return false;
            };
            info!(instances = list.len(), active = %active.db_identifier, "discovered instances");
            let db_identifier = active.db_identifier.clone();
            this.inner.store.apply(
                ViewPatch::new()
                    .instances(list)
                    .selected_instance(Some(active)),
            );
            this.fetch_databases(db_identifier, retry).await
        }
        .boxed()
    }

    /// Lists the databases of `db_identifier` and makes them the query scope.
    /// The result is dropped if the active instance changed meanwhile.
    pub fn fetch_databases(&self, db_identifier: String, retry: bool) -> BoxFuture<'static, bool> {
        let this = self.clone();
        async move {
            let request = query::databases_query(&db_identifier);
            let databases = match this.get_json::<Vec<String>>(&request).await {
                Ok(databases) if !databases.is_empty() => Some(databases),
                Ok(_) => {
                    warn!(%db_identifier, "no databases listed");
                    None
                }
                Err(err) => {
                    warn!(%db_identifier, %err, "database discovery failed");
                    None
                }
            };
            let Some(databases) = databases else {
                if retry {
                    this.schedule_retry(RetryKind::ActivityDatabases, move |d| {
                        d.fetch_databases(db_identifier, true)
                    });
                }
                return false;
            };

            let still_active = this.inner.store.read(|state| {
                state
                    .selected_instance
                    .as_ref()
                    .is_some_and(|i| i.db_identifier == db_identifier)
            });
            if !still_active {
                debug!(%db_identifier, "instance changed, dropping database list");
                return false;
            }
            info!(%db_identifier, databases = databases.len(), "discovered databases");
            this.inner
                .store
                .apply(ViewPatch::new().database_list(databases));
            true
        }
        .boxed()
    }

    /// Switches the active instance and rediscovers its databases.
    pub async fn select_instance(&self, instance: Instance, retry: bool) -> bool {
        let db_identifier = instance.db_identifier.clone();
        self.inner.store.apply(
            ViewPatch::new()
                .selected_instance(Some(instance))
                .database_list(Vec::new()),
        );
        self.fetch_databases(db_identifier, retry).await
    }

    /// Runs instance discovery, retrying until it succeeds.
    pub async fn bootstrap(&self) -> bool {
        self.fetch_instances(true).await
    }

    pub fn shutdown(&self) {
        self.inner.retries.cancel_all();
    }
}
