//! Application state.

use std::sync::Arc;

use sentinel_store::CounterStore;

/// Shared application state available to all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Pipeline counters, shared with the relay stages.
    pub counters: Arc<CounterStore>,
}

impl AppState {
    pub fn new(counters: Arc<CounterStore>) -> Self {
        Self { counters }
    }
}
