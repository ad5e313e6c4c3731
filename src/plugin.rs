//! Named-extension lookup with priority ordering (spec §4.2 / §9).
//!
//! Modeled as an explicit, process-scoped object constructed at startup and
//! passed by reference (spec §9 "Global singletons"), not hidden
//! module-level state — tests can build their own `PluginRegistry` and never
//! share state across test threads.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

/// A named, priority-ordered extension. Every plugin kind (codec,
/// load-balance strategy, filter, registry backend, transport, health
/// doctor) registers under this trait; the core only ever consumes the
/// capability named at lookup time (spec §9 "Dynamic dispatch").
pub trait Plugin: Any + Send + Sync {
    fn name(&self) -> &str;

    /// Lower sorts first. Ties are broken by name (spec §4.7).
    fn priority(&self) -> i32 {
        0
    }
}

/// Process-wide, load-once extension registry, keyed by plugin category
/// (`TypeId` of the trait object's erased kind) and name.
#[derive(Default)]
pub struct PluginRegistry {
    entries: DashMap<(TypeId, String), Arc<dyn Any + Send + Sync>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self { entries: DashMap::new() }
    }

    /// Register a plugin under category `K` (a marker type) and its name.
    /// Re-registering the same `(K, name)` overwrites — load-once is a
    /// convention callers uphold by registering during startup only.
    pub fn register<K: 'static, P: Plugin + 'static>(&self, plugin: Arc<P>) {
        let key = (TypeId::of::<K>(), plugin.name().to_string());
        self.entries.insert(key, plugin as Arc<dyn Any + Send + Sync>);
    }

    pub fn get<K: 'static, P: Plugin + 'static>(&self, name: &str) -> Option<Arc<P>> {
        let key = (TypeId::of::<K>(), name.to_string());
        self.entries
            .get(&key)
            .and_then(|entry| Arc::clone(entry.value()).downcast::<P>().ok())
    }

    pub fn names<K: 'static>(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.key().0 == TypeId::of::<K>())
            .map(|e| e.key().1.clone())
            .collect()
    }
}

/// Sort a set of plugins by priority, then name, for deterministic chain
/// construction (Filter Chain ordering, spec §4.7).
pub fn ordered_by_priority<P: Plugin>(mut plugins: Vec<P>) -> Vec<P> {
    plugins.sort_by(|a, b| a.priority().cmp(&b.priority()).then_with(|| a.name().cmp(b.name())));
    plugins
}

/// Convenience helper mirroring the teacher's `HashMap<name, T>` lookup
/// style for plugin kinds that don't need the `Any`-erased registry above
/// (e.g. a codec table built once at transport construction).
pub struct NamedTable<T> {
    entries: HashMap<String, T>,
}

impl<T> NamedTable<T> {
    pub fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    pub fn insert(&mut self, name: impl Into<String>, value: T) {
        self.entries.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.entries.get(name)
    }
}

impl<T> Default for NamedTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeCodec;
    impl Plugin for FakeCodec {
        fn name(&self) -> &str {
            "fake"
        }
    }

    struct CodecCategory;

    #[test]
    fn register_then_lookup_by_category_and_name() {
        let registry = PluginRegistry::new();
        registry.register::<CodecCategory, _>(Arc::new(FakeCodec));
        assert!(registry.get::<CodecCategory, FakeCodec>("fake").is_some());
        assert!(registry.get::<CodecCategory, FakeCodec>("missing").is_none());
    }

    #[test]
    fn priority_ties_break_on_name() {
        struct P(&'static str, i32);
        impl Plugin for P {
            fn name(&self) -> &str {
                self.0
            }
            fn priority(&self) -> i32 {
                self.1
            }
        }
        let ordered = ordered_by_priority(vec![P("b", 1), P("a", 1), P("z", 0)]);
        let names: Vec<_> = ordered.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["z", "a", "b"]);
    }
}
