//! Data-fetch engine for database activity dashboards.
//!
//! A [`Dashboard`] owns the shared [`ViewState`] and decides what to query,
//! when, and how to merge the results:
//!
//! - [`throttle`] keeps at most one request per endpoint in flight and
//!   replays only the most recently deferred one.
//! - [`query`] turns the view into request descriptors for the activity cube,
//!   metric and Prometheus endpoints.
//! - [`window`] maps zoom percentages onto timestamps anchored at the
//!   server's clock and tracks live/paused mode.
//! - [`budget`] drops queries the backend would refuse for returning too
//!   many samples.
//! - [`fetch`] runs the request cycle and the bootstrap discovery with its
//!   single-timer retry.
//! - [`poll`] tails live data and refetches when query inputs change.

pub mod budget;
pub mod config;
mod error;
pub mod fetch;
pub mod model;
pub mod poll;
pub mod query;
pub mod retry;
pub mod state;
pub mod throttle;
pub mod transport;
pub mod window;

#[cfg(test)]
pub(crate) mod testing;

pub use budget::SampleBudget;
pub use config::Config;
pub use error::Error;
pub use fetch::{Dashboard, FetchOutcome};
pub use model::{EndpointKind, Instance};
pub use poll::{Poller, PollerHandle};
pub use state::{StatePath, Store, ViewPatch, ViewState};
