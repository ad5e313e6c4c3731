//! Interface Descriptor cache (spec §4.4): reflects once over a service
//! interface's methods and keeps the result for the process lifetime, keyed
//! by `(interface, alias)` so two aliases of the same interface type don't
//! share method metadata that might differ between Exporters.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::RwLock;

#[derive(Debug, Clone)]
pub struct MethodDescriptor {
    pub name: String,
    pub param_types: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct InterfaceDescriptor {
    pub interface: String,
    pub alias: String,
    pub methods: HashMap<String, MethodDescriptor>,
}

impl InterfaceDescriptor {
    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.get(name)
    }
}

/// Builds the `MethodDescriptor` table for one interface. An Exporter
/// supplies one implementation per business interface it exposes; this is
/// the only place that knows the concrete method list, so it is built
/// once and cached rather than re-derived per call (spec §4.4).
pub trait DescriptorBuilder: Send + Sync {
    fn build(&self) -> InterfaceDescriptor;
}

/// Process-wide cache. An explicit object passed by reference (spec §9's
/// convention for anything process-scoped), not a hidden `static`.
#[derive(Default)]
pub struct DescriptorCache {
    entries: RwLock<HashMap<(String, String), Arc<InterfaceDescriptor>>>,
}

impl DescriptorCache {
    pub fn new() -> Self {
        Self { entries: RwLock::new(HashMap::new()) }
    }

    /// Return the cached descriptor for `(interface, alias)`, building it
    /// via `builder` on first access.
    pub fn get_or_build(&self, interface: &str, alias: &str, builder: &dyn DescriptorBuilder) -> Arc<InterfaceDescriptor> {
        let key = (interface.to_string(), alias.to_string());
        if let Some(existing) = self.entries.read().get(&key) {
            return Arc::clone(existing);
        }
        let mut guard = self.entries.write();
        if let Some(existing) = guard.get(&key) {
            return Arc::clone(existing);
        }
        let descriptor = Arc::new(builder.build());
        guard.insert(key, Arc::clone(&descriptor));
        descriptor
    }

    pub fn get(&self, interface: &str, alias: &str) -> Option<Arc<InterfaceDescriptor>> {
        self.entries.read().get(&(interface.to_string(), alias.to_string())).cloned()
    }
}

/// Global fallback cache for call sites that don't carry their own
/// `DescriptorCache` handle (spec §9 allows exactly this one process-wide
/// instance for descriptors, since reflecting over the same Rust type twice
/// would duplicate work for no benefit).
static GLOBAL: OnceCell<DescriptorCache> = OnceCell::new();

pub fn global() -> &'static DescriptorCache {
    GLOBAL.get_or_init(DescriptorCache::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoBuilder;
    impl DescriptorBuilder for EchoBuilder {
        fn build(&self) -> InterfaceDescriptor {
            let mut methods = HashMap::new();
            methods.insert("echo".to_string(), MethodDescriptor { name: "echo".to_string(), param_types: vec!["String".to_string()] });
            InterfaceDescriptor { interface: "Echo".to_string(), alias: "default".to_string(), methods }
        }
    }

    #[test]
    fn descriptor_is_built_once_and_cached() {
        let cache = DescriptorCache::new();
        let first = cache.get_or_build("Echo", "default", &EchoBuilder);
        let second = cache.get_or_build("Echo", "default", &EchoBuilder);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.method("echo").is_some());
    }

    #[test]
    fn different_aliases_get_independent_entries() {
        let cache = DescriptorCache::new();
        let a = cache.get_or_build("Echo", "a", &EchoBuilder);
        let b = cache.get_or_build("Echo", "b", &EchoBuilder);
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
