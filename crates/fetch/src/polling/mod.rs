//! Recurring polling
//!
//! - [`IntervalStore`] - the persisted poll period shared by all pollers
//! - [`Poller`] - fires a callback on that period with pause/resume and
//!   failure counting

mod interval_store;
mod poller;

pub use interval_store::{
    InMemoryPreferences, IntervalChange, IntervalError, IntervalListener, IntervalStore,
    JsonFilePreferences, PreferenceError, PreferenceStore, SubscriptionHandle,
    DEFAULT_POLL_INTERVAL, POLL_INTERVAL_KEY,
};
pub use poller::{
    IntervalGetter, PollCallback, Poller, PollerError, PollerOptions, StartOptions,
    FAILURE_STREAK_THRESHOLD,
};
