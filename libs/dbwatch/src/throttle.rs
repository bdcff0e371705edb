//! Per-endpoint in-flight gate with a single "latest wins" replay slot.
//!
//! At most one request per [`EndpointKind`] is outstanding. A request that
//! arrives while its endpoint is busy, or while a replay is already queued, is
//! not sent; instead it overwrites the replay slot. When a request settles the
//! slot is drained and the most recent deferred endpoint is fetched again, so
//! the view converges on the latest parameters without queueing every skipped
//! request.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tracing::{debug, trace};

use crate::model::EndpointKind;

#[derive(Clone, Debug, Default)]
pub struct ApiThrottleState {
    pub in_flight: HashMap<EndpointKind, Instant>,
    pub pending_replay: Option<EndpointKind>,
    /// Deferrals since the last replay. Observability only.
    pub pending_replay_count: u32,
}

#[derive(Clone, Default)]
pub struct ApiThrottle {
    state: Arc<Mutex<ApiThrottleState>>,
}

impl ApiThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ApiThrottleState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Marks `kind` in flight and returns `true` if nothing is outstanding for
    /// it and no replay is queued. Otherwise records `kind` as the replay
    /// target and returns `false`; the caller must not send the request.
    pub fn try_acquire(&self, kind: EndpointKind) -> bool {
        let mut state = self.lock();
        if !state.in_flight.contains_key(&kind) && state.pending_replay.is_none() {
            state.in_flight.insert(kind, Instant::now());
            trace!(endpoint = %kind, "acquired");
            return true;
        }
        state.pending_replay = Some(kind);
        state.pending_replay_count += 1;
        debug!(
            endpoint = %kind,
            deferred = state.pending_replay_count,
            "request deferred"
        );
        false
    }

    /// Scoped form of [`ApiThrottle::try_acquire`]; the returned guard
    /// releases the endpoint when dropped.
    pub fn acquire(&self, kind: EndpointKind) -> Option<InFlight> {
        self.try_acquire(kind).then(|| InFlight {
            throttle: self.clone(),
            kind,
        })
    }

    pub fn release(&self, kind: EndpointKind) {
        if self.lock().in_flight.remove(&kind).is_some() {
            trace!(endpoint = %kind, "released");
        }
    }

    /// Drains the replay slot. The returned endpoint should be fetched again
    /// right away.
    pub fn settle_and_replay(&self) -> Option<EndpointKind> {
        let mut state = self.lock();
        let kind = state.pending_replay.take()?;
        debug!(
            endpoint = %kind,
            deferred = state.pending_replay_count,
            "replaying latest deferred request"
        );
        state.pending_replay_count = 0;
        Some(kind)
    }

    pub fn is_in_flight(&self, kind: EndpointKind) -> bool {
        self.lock().in_flight.contains_key(&kind)
    }

    /// Whether any endpoint is outstanding. Its holder drains the replay slot
    /// once it settles.
    pub fn any_in_flight(&self) -> bool {
        !self.lock().in_flight.is_empty()
    }

    pub fn snapshot(&self) -> ApiThrottleState {
        self.lock().clone()
    }
}

/// An acquired endpoint slot. Released on drop, on every exit path.
#[must_use = "dropping the guard releases the endpoint immediately"]
pub struct InFlight {
    throttle: ApiThrottle,
    kind: EndpointKind,
}

impl InFlight {
    pub fn kind(&self) -> EndpointKind {
        self.kind
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.throttle.release(self.kind);
    }
}
