//! Shared server state — viewer registry, store, and publish path.

use std::sync::Arc;

use crate::broker::LocationPublisher;
use crate::config::Config;
use crate::hub::Registry;
use crate::store::LocationStore;

/// Shared state accessible from all handlers.
pub struct AppState {
    /// Timeline replayed to each new viewer.
    pub store: Arc<dyn LocationStore>,
    /// Live viewer connections. The hub task holds another handle.
    pub registry: Arc<Registry>,
    /// Producer ingress forwards through here, never straight to the store.
    pub publisher: Arc<dyn LocationPublisher>,
    pub config: Config,
}

impl AppState {
    pub fn new(
        store: Arc<dyn LocationStore>,
        registry: Arc<Registry>,
        publisher: Arc<dyn LocationPublisher>,
        config: Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            registry,
            publisher,
            config,
        })
    }
}
