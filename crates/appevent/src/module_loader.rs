//! Named report backends and the modules that provide them.
//!
//! A module is an initialiser that registers one or more backends when it is
//! loaded. Processors are created from registered backends by name.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use appevent_observer::ReportBackend;

use crate::error::AppEventError;

pub type ModuleInit = Arc<dyn Fn(&ModuleLoader) + Send + Sync>;

#[derive(Default)]
pub struct ModuleLoader {
    modules: Mutex<HashMap<String, ModuleInit>>,
    loaded: Mutex<HashSet<String>>,
    backends: Mutex<HashMap<String, Arc<dyn ReportBackend>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes a module available to [`load`](Self::load).
    pub fn install_module<F>(&self, name: impl Into<String>, init: F)
    where
        F: Fn(&ModuleLoader) + Send + Sync + 'static,
    {
        lock(&self.modules).insert(name.into(), Arc::new(init));
    }

    /// Runs a module's initialiser once. Loading an already loaded module
    /// succeeds without running it again.
    pub fn load(&self, name: &str) -> Result<(), AppEventError> {
        if lock(&self.loaded).contains(name) {
            tracing::debug!(module = name, "module already loaded");
            return Ok(());
        }
        let init = lock(&self.modules)
            .get(name)
            .cloned()
            .ok_or_else(|| AppEventError::UnknownModule(name.to_string()))?;
        init(self);
        lock(&self.loaded).insert(name.to_string());
        tracing::info!(module = name, "module loaded");
        Ok(())
    }

    pub fn unload(&self, name: &str) -> Result<(), AppEventError> {
        if !lock(&self.loaded).remove(name) {
            return Err(AppEventError::UnknownModule(name.to_string()));
        }
        tracing::info!(module = name, "module unloaded");
        Ok(())
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        lock(&self.loaded).contains(name)
    }

    /// Registers a backend under `name`. Names are unique.
    pub fn register_processor(
        &self,
        name: &str,
        backend: Arc<dyn ReportBackend>,
    ) -> Result<(), AppEventError> {
        if name.is_empty() {
            return Err(AppEventError::InvalidArgument("empty processor name".into()));
        }
        let mut backends = lock(&self.backends);
        if backends.contains_key(name) {
            tracing::warn!(processor = name, "report backend already registered");
            return Err(AppEventError::InvalidArgument(format!(
                "processor {name:?} already registered"
            )));
        }
        backends.insert(name.to_string(), backend);
        Ok(())
    }

    pub fn unregister_processor(&self, name: &str) -> Result<(), AppEventError> {
        lock(&self.backends)
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| AppEventError::UnknownProcessor(name.to_string()))
    }

    /// The backend registered as `name`, if any.
    pub fn create_processor(&self, name: &str) -> Option<Arc<dyn ReportBackend>> {
        let backend = lock(&self.backends).get(name).cloned();
        if backend.is_none() {
            tracing::warn!(processor = name, "no report backend registered");
        }
        backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use appevent_observer::BackendError;
    use appevent_types::{AppEventInfo, UserId, UserProperty};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Noop;

    impl ReportBackend for Noop {
        fn on_report(
            &self,
            _processor_seq: i64,
            _user_ids: &[UserId],
            _user_properties: &[UserProperty],
            _events: &[AppEventInfo],
        ) -> Result<(), BackendError> {
            Ok(())
        }
    }

    #[test]
    fn loading_a_module_registers_its_backends_once() {
        let loader = ModuleLoader::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        loader.install_module("analytics", move |loader| {
            counter.fetch_add(1, Ordering::SeqCst);
            loader
                .register_processor("analytics_processor", Arc::new(Noop))
                .expect("register");
        });

        assert!(loader.create_processor("analytics_processor").is_none());
        loader.load("analytics").expect("load");
        loader.load("analytics").expect("second load");
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(loader.is_loaded("analytics"));
        assert!(loader.create_processor("analytics_processor").is_some());
    }

    #[test]
    fn unknown_names_are_errors() {
        let loader = ModuleLoader::new();
        assert!(matches!(loader.load("missing"), Err(AppEventError::UnknownModule(_))));
        assert!(loader.unload("missing").is_err());
        assert!(loader.unregister_processor("missing").is_err());
    }

    #[test]
    fn backend_names_are_unique() {
        let loader = ModuleLoader::new();
        loader.register_processor("p1", Arc::new(Noop)).expect("first");
        assert!(loader.register_processor("p1", Arc::new(Noop)).is_err());
        loader.unregister_processor("p1").expect("unregister");
        assert!(loader.create_processor("p1").is_none());
    }
}
