//! Hooks for the host's app-lifecycle notifications.

use std::sync::Arc;

use appevent_observer::ObserverRegistry;

/// Forwards the host's "entered background" and "created/foreground"
/// notifications to the observers. Both return immediately; the observers
/// run on the registry's background queue.
#[derive(Clone)]
pub struct AppLifecycle {
    registry: Arc<ObserverRegistry>,
}

impl AppLifecycle {
    pub fn new(registry: Arc<ObserverRegistry>) -> Self {
        Self { registry }
    }

    pub fn on_background(&self) {
        tracing::debug!("app entered background");
        self.registry.handle_background();
    }

    pub fn on_foreground(&self) {
        tracing::debug!("app entered foreground");
        self.registry.handle_startup();
    }
}
