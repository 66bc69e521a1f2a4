//! Capability registry.
//!
//! An explicit instance constructed once at process start and passed
//! by reference to the orchestrator; no global singleton, so tests
//! and multi-tenant setups can hold isolated registries. Read-mostly
//! after startup registration completes.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::capabilities::CapabilityExecutor;
use crate::errors::{EngineError, EngineResult};
use crate::types::CapabilityDescriptor;

struct Registration {
    descriptor: CapabilityDescriptor,
    executor: Arc<dyn CapabilityExecutor>,
}

#[derive(Default)]
pub struct CapabilityRegistry {
    // Insertion order is kept separately so catalog() is stable.
    entries: RwLock<(Vec<String>, HashMap<String, Registration>)>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability. Fails if the name is already taken;
    /// descriptors are immutable once registered.
    pub fn register(
        &self,
        descriptor: CapabilityDescriptor,
        executor: Arc<dyn CapabilityExecutor>,
    ) -> EngineResult<()> {
        let mut guard = self.entries.write().expect("registry lock poisoned");
        let (order, map) = &mut *guard;
        if map.contains_key(&descriptor.name) {
            return Err(EngineError::DuplicateCapability(descriptor.name));
        }
        order.push(descriptor.name.clone());
        map.insert(
            descriptor.name.clone(),
            Registration { descriptor, executor },
        );
        Ok(())
    }

    /// Read-only snapshot of every descriptor, in registration order.
    /// Descriptors are self-contained; no cross-references are exposed.
    pub fn catalog(&self) -> Vec<CapabilityDescriptor> {
        let guard = self.entries.read().expect("registry lock poisoned");
        let (order, map) = &*guard;
        order
            .iter()
            .filter_map(|name| map.get(name).map(|r| r.descriptor.clone()))
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.read().expect("registry lock poisoned").0.clone()
    }

    pub fn get(&self, name: &str) -> EngineResult<Arc<dyn CapabilityExecutor>> {
        let guard = self.entries.read().expect("registry lock poisoned");
        guard
            .1
            .get(name)
            .map(|r| Arc::clone(&r.executor))
            .ok_or_else(|| EngineError::UnknownCapability(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CapabilityResult, TaskEnvelope};
    use async_trait::async_trait;

    struct NoopExecutor;

    #[async_trait]
    impl CapabilityExecutor for NoopExecutor {
        async fn execute(&self, _envelope: TaskEnvelope) -> EngineResult<CapabilityResult> {
            Ok(CapabilityResult::completed(serde_json::json!({})))
        }
    }

    fn descriptor(name: &str) -> CapabilityDescriptor {
        CapabilityDescriptor {
            name: name.to_string(),
            description: "test capability".to_string(),
            capabilities: vec!["testing".to_string()],
            input_schema: serde_json::json!({}),
            output_schema: serde_json::json!({}),
        }
    }

    #[test]
    fn test_register_and_get() {
        let registry = CapabilityRegistry::new();
        registry
            .register(descriptor("alpha"), Arc::new(NoopExecutor))
            .unwrap();
        assert!(registry.get("alpha").is_ok());
        assert_eq!(registry.catalog().len(), 1);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = CapabilityRegistry::new();
        registry
            .register(descriptor("alpha"), Arc::new(NoopExecutor))
            .unwrap();
        let err = registry
            .register(descriptor("alpha"), Arc::new(NoopExecutor))
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateCapability(_)));
    }

    #[test]
    fn test_unknown_capability() {
        let registry = CapabilityRegistry::new();
        let err = registry.get("missing").err().unwrap();
        assert!(matches!(err, EngineError::UnknownCapability(_)));
    }

    #[test]
    fn test_catalog_keeps_registration_order() {
        let registry = CapabilityRegistry::new();
        for name in ["c", "a", "b"] {
            registry
                .register(descriptor(name), Arc::new(NoopExecutor))
                .unwrap();
        }
        let names: Vec<String> = registry.catalog().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }
}
