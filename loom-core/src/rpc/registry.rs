//! Process-wide method registry.
//!
//! The key space is flat: `{service}/{method}`. Population happens during
//! service initialization under a registration lock; once the dispatcher
//! is marked running the registry freezes and further registration fails.
//! Reads take no locks.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::FabricError;

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, FabricError>> + Send>>;
pub type Handler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

/// Wrap a plain async closure into a registrable handler.
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, FabricError>> + Send + 'static,
{
    Arc::new(move |params| Box::pin(f(params)))
}

#[derive(Clone)]
pub struct MethodEntry {
    pub handler: Handler,
    pub public: bool,
    pub description: String,
}

#[derive(Default)]
pub struct MethodRegistry {
    methods: DashMap<String, MethodEntry>,
    registration: Mutex<()>,
    frozen: AtomicBool,
}

impl MethodRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn method_key(service: &str, method: &str) -> String {
        format!("{service}/{method}")
    }

    pub fn register(
        &self,
        service: &str,
        method: &str,
        public: bool,
        description: &str,
        handler: Handler,
    ) -> Result<(), FabricError> {
        if service.contains('/') || method.contains('/') {
            return Err(FabricError::InvalidProxyPath(format!(
                "service and method names must not contain '/': {service}/{method}"
            )));
        }

        let _registration = self.registration.lock();
        if self.frozen.load(Ordering::Acquire) {
            return Err(FabricError::Invariant(format!(
                "registration of {service}/{method} after dispatcher start"
            )));
        }

        let key = Self::method_key(service, method);
        match self.methods.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(FabricError::DuplicateMethod(key))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(MethodEntry {
                    handler,
                    public,
                    description: description.to_string(),
                });
                Ok(())
            }
        }
    }

    /// Called by the lifecycle orchestrator once the dispatcher is up.
    pub fn freeze(&self) {
        let _registration = self.registration.lock();
        self.frozen.store(true, Ordering::Release);
    }

    pub fn lookup(&self, key: &str) -> Option<MethodEntry> {
        self.methods.get(key).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.methods.contains_key(key)
    }

    /// Public methods grouped by service, for the gossip service summary.
    pub fn public_methods_by_service(&self) -> BTreeMap<String, Vec<String>> {
        let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for entry in self.methods.iter() {
            if !entry.public {
                continue;
            }
            if let Some((service, method)) = entry.key().split_once('/') {
                out.entry(service.to_string())
                    .or_default()
                    .push(method.to_string());
            }
        }
        for methods in out.values_mut() {
            methods.sort();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop() -> Handler {
        handler(|_| async { Ok(json!(null)) })
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = MethodRegistry::new();
        registry
            .register("echo", "say", true, "", noop())
            .unwrap();
        let err = registry
            .register("echo", "say", true, "", noop())
            .unwrap_err();
        assert!(matches!(err, FabricError::DuplicateMethod(_)));
    }

    #[test]
    fn registration_fails_after_freeze() {
        let registry = MethodRegistry::new();
        registry
            .register("echo", "say", true, "", noop())
            .unwrap();
        registry.freeze();
        let err = registry
            .register("echo", "late", true, "", noop())
            .unwrap_err();
        assert!(matches!(err, FabricError::Invariant(_)));
        // Existing entries stay readable.
        assert!(registry.lookup("echo/say").is_some());
    }

    #[test]
    fn slash_in_names_is_rejected() {
        let registry = MethodRegistry::new();
        let err = registry
            .register("a/b", "c", true, "", noop())
            .unwrap_err();
        assert!(matches!(err, FabricError::InvalidProxyPath(_)));
    }

    #[test]
    fn public_method_summary_skips_private_entries() {
        let registry = MethodRegistry::new();
        registry
            .register("system", "ping", true, "", noop())
            .unwrap();
        registry
            .register("system", "reseed", false, "", noop())
            .unwrap();
        registry
            .register("echo", "say", true, "", noop())
            .unwrap();

        let summary = registry.public_methods_by_service();
        assert_eq!(summary["system"], vec!["ping"]);
        assert_eq!(summary["echo"], vec!["say"]);
    }
}
