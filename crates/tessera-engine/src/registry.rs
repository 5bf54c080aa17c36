//! Mapping from action type to handler, with composable action packs.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::{Engine, EngineError};

/// Action type that catches every otherwise-unhandled action.
pub const CATCH_ALL: &str = "*";

/// An action handler.
///
/// Handlers are pure with respect to their inputs and the engine handle;
/// side effects go through Chronicle changes on the engine's domain objects.
pub type Handler =
    Arc<dyn Fn(&Engine, &serde_json::Value) -> Result<serde_json::Value, EngineError> + Send + Sync>;

/// A named, composable set of handlers.
pub struct ActionPack {
    name: String,
    handlers: Vec<(String, Handler)>,
}

impl ActionPack {
    /// Creates an empty pack.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handlers: Vec::new(),
        }
    }

    /// The pack name, carried in worker init manifests.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a handler for an action type.
    pub fn with<F>(mut self, kind: &str, handler: F) -> Self
    where
        F: Fn(&Engine, &serde_json::Value) -> Result<serde_json::Value, EngineError>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.push((kind.to_string(), Arc::new(handler)));
        self
    }

    /// Action types this pack provides.
    pub fn kinds(&self) -> Vec<String> {
        self.handlers.iter().map(|(k, _)| k.clone()).collect()
    }
}

/// Mapping from action type to handler.
///
/// Cloning shares the underlying table, so an engine and its worker mirror
/// resolve the same handlers.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    handlers: Arc<RwLock<HashMap<String, Handler>>>,
    packs: Arc<RwLock<Vec<String>>>,
}

impl ActionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a single handler, replacing any existing one.
    pub fn register<F>(&self, kind: &str, handler: F)
    where
        F: Fn(&Engine, &serde_json::Value) -> Result<serde_json::Value, EngineError>
            + Send
            + Sync
            + 'static,
    {
        self.handlers
            .write()
            .insert(kind.to_string(), Arc::new(handler));
    }

    /// Registers every handler of a pack.
    pub fn register_pack(&self, pack: &ActionPack) {
        let mut handlers = self.handlers.write();
        for (kind, handler) in &pack.handlers {
            handlers.insert(kind.clone(), handler.clone());
        }
        self.packs.write().push(pack.name.clone());
    }

    /// Resolves a handler, falling back to the catch-all if registered.
    pub fn resolve(&self, kind: &str) -> Option<Handler> {
        let handlers = self.handlers.read();
        handlers
            .get(kind)
            .or_else(|| handlers.get(CATCH_ALL))
            .cloned()
    }

    /// Whether an exact handler exists for the action type.
    pub fn has(&self, kind: &str) -> bool {
        self.handlers.read().contains_key(kind)
    }

    /// Removes a handler; returns whether one existed.
    pub fn unregister(&self, kind: &str) -> bool {
        self.handlers.write().remove(kind).is_some()
    }

    /// Names of packs registered so far, in order.
    pub fn pack_manifest(&self) -> Vec<String> {
        self.packs.read().clone()
    }

    /// Registered action types, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.handlers.read().keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EngineConfig;

    #[test]
    fn test_register_and_resolve() {
        let registry = ActionRegistry::new();
        registry.register("test:noop", |_, _| Ok(serde_json::Value::Null));

        assert!(registry.has("test:noop"));
        assert!(registry.resolve("test:noop").is_some());
        assert!(registry.resolve("test:other").is_none());
    }

    #[test]
    fn test_catch_all_fallback() {
        let registry = ActionRegistry::new();
        registry.register(CATCH_ALL, |_, payload| Ok(payload.clone()));

        let handler = registry.resolve("anything:at-all").expect("catch-all");
        let engine = Engine::new(EngineConfig::default());
        let result = handler(&engine, &serde_json::json!({"k": 1})).unwrap();
        assert_eq!(result["k"], 1);
    }

    #[test]
    fn test_pack_registration_and_manifest() {
        let registry = ActionRegistry::new();
        let pack = ActionPack::new("test-pack")
            .with("a:x", |_, _| Ok(serde_json::Value::Null))
            .with("a:y", |_, _| Ok(serde_json::Value::Null));
        registry.register_pack(&pack);

        assert_eq!(pack.kinds(), ["a:x", "a:y"]);
        assert!(registry.has("a:x"));
        assert!(registry.has("a:y"));
        assert_eq!(registry.pack_manifest(), ["test-pack"]);
    }

    #[test]
    fn test_unregister() {
        let registry = ActionRegistry::new();
        registry.register("a:x", |_, _| Ok(serde_json::Value::Null));
        assert!(registry.unregister("a:x"));
        assert!(!registry.unregister("a:x"));
        assert!(!registry.has("a:x"));
    }

    #[test]
    fn test_clone_shares_table() {
        let registry = ActionRegistry::new();
        let mirror = registry.clone();
        registry.register("a:x", |_, _| Ok(serde_json::Value::Null));
        assert!(mirror.has("a:x"));
    }
}
