//! Typed Registry - Contextual Data Plane for Executions
//!
//! A registry is an immutable mapping from a Rust type to zero or more
//! values of that type, with insertion order preserved.  Registries join
//! hierarchically: a child registry overlays its parent, so request-scoped
//! values shadow application-scoped ones without copying either side.
//!
//! # Design:
//! - Entries are `Arc<dyn Any + Send + Sync>` keyed by `TypeId`
//! - Joined registries answer child-first; `get_all` concatenates child
//!   then parent
//! - Joins with an empty registry short-circuit to the other side
//! - Joined lookups are cached, since both inputs are immutable
//!
//! Executions additionally carry a [`MutableRegistry`] overlay that user
//! code can extend while the execution runs.

use parking_lot::Mutex;
use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::ExecError;

/// A single registered value together with its type identity.
#[derive(Clone)]
struct Entry {
    type_id: TypeId,
    value: Arc<dyn Any + Send + Sync>,
}

impl Entry {
    fn of<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            value: Arc::new(value),
        }
    }

    fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        if self.type_id == TypeId::of::<T>() {
            Arc::clone(&self.value).downcast::<T>().ok()
        } else {
            None
        }
    }
}

enum Inner {
    Empty,
    Leaf(Vec<Entry>),
    Joined {
        child: Registry,
        parent: Registry,
        cache: Mutex<HashMap<TypeId, Option<Entry>>>,
    },
}

/// An immutable, optionally hierarchical, typed lookup.
///
/// Cloning a registry is cheap (a reference-count bump) and never copies
/// entries.
///
/// ```rust
/// # use strand_core::Registry;
/// let parent = Registry::builder().add("p1".to_string()).build();
/// let child = Registry::single("c1".to_string());
/// let joined = parent.join(child);
/// assert_eq!(*joined.get::<String>().unwrap(), "c1");
/// ```
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Registry {
    /// The registry with no entries.
    pub fn empty() -> Self {
        Self {
            inner: Arc::new(Inner::Empty),
        }
    }

    /// A single-entry registry.
    pub fn single<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            inner: Arc::new(Inner::Leaf(vec![Entry::of(value)])),
        }
    }

    /// Start building a multi-entry registry.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder {
            entries: Vec::new(),
        }
    }

    /// Returns `true` when no lookup can succeed against this registry.
    pub fn is_empty(&self) -> bool {
        match &*self.inner {
            Inner::Empty => true,
            Inner::Leaf(entries) => entries.is_empty(),
            // Joins never produce an empty registry: empty sides short-circuit.
            Inner::Joined { .. } => false,
        }
    }

    /// Return the first value registered under `T`, if any.
    pub fn maybe_get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.lookup(TypeId::of::<T>())
            .and_then(|entry| entry.downcast::<T>())
    }

    /// Return the first value registered under `T`, or a registry-miss error.
    pub fn get<T: Any + Send + Sync>(&self) -> Result<Arc<T>, ExecError> {
        self.maybe_get::<T>()
            .ok_or_else(|| ExecError::NotInRegistry(type_name::<T>()))
    }

    /// Return every value registered under `T`, child entries first.
    pub fn get_all<T: Any + Send + Sync>(&self) -> Vec<Arc<T>> {
        let mut out = Vec::new();
        self.collect_all::<T>(&mut out);
        out
    }

    /// Apply `f` to each registered `T` in lookup order and return the first
    /// non-`None` result.
    pub fn first<T: Any + Send + Sync, U>(&self, f: impl Fn(&T) -> Option<U>) -> Option<U> {
        self.get_all::<T>().iter().find_map(|item| f(item))
    }

    /// Join `child` over this registry.
    ///
    /// The child's entries shadow this registry's entries; `get_all` yields
    /// child entries before parent entries.  Joining with an empty registry
    /// on either side returns the other side unchanged.
    pub fn join(&self, child: Registry) -> Registry {
        if child.is_empty() {
            return self.clone();
        }
        if self.is_empty() {
            return child;
        }
        debug!("Joining registries");
        Registry {
            inner: Arc::new(Inner::Joined {
                child,
                parent: self.clone(),
                cache: Mutex::new(HashMap::new()),
            }),
        }
    }

    // ── private helpers ───────────────────────────────────────────────

    fn lookup(&self, type_id: TypeId) -> Option<Entry> {
        match &*self.inner {
            Inner::Empty => None,
            Inner::Leaf(entries) => entries.iter().find(|e| e.type_id == type_id).cloned(),
            Inner::Joined {
                child,
                parent,
                cache,
            } => {
                if let Some(cached) = cache.lock().get(&type_id) {
                    return cached.clone();
                }
                let found = child.lookup(type_id).or_else(|| parent.lookup(type_id));
                cache.lock().insert(type_id, found.clone());
                found
            }
        }
    }

    fn collect_all<T: Any + Send + Sync>(&self, out: &mut Vec<Arc<T>>) {
        match &*self.inner {
            Inner::Empty => {}
            Inner::Leaf(entries) => {
                out.extend(entries.iter().filter_map(|e| e.downcast::<T>()));
            }
            Inner::Joined { child, parent, .. } => {
                child.collect_all::<T>(out);
                parent.collect_all::<T>(out);
            }
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::empty()
    }
}

/// Builder for a leaf [`Registry`].
pub struct RegistryBuilder {
    entries: Vec<Entry>,
}

impl RegistryBuilder {
    /// Register a value.  Multiple values of the same type are allowed and
    /// retain insertion order.
    pub fn add<T: Any + Send + Sync>(mut self, value: T) -> Self {
        self.entries.push(Entry::of(value));
        self
    }

    /// Finish building.
    pub fn build(self) -> Registry {
        if self.entries.is_empty() {
            return Registry::empty();
        }
        Registry {
            inner: Arc::new(Inner::Leaf(self.entries)),
        }
    }
}

/// The mutable registry overlay carried by every execution.
///
/// Values added here shadow the execution's base registry.  Within the
/// overlay itself, insertion order is preserved, matching leaf semantics.
pub struct MutableRegistry {
    entries: Mutex<Vec<Entry>>,
}

impl MutableRegistry {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Add a value to the overlay.
    pub fn add<T: Any + Send + Sync>(&self, value: T) {
        self.entries.lock().push(Entry::of(value));
    }

    /// Return the first overlay value registered under `T`, if any.
    pub fn maybe_get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let type_id = TypeId::of::<T>();
        self.entries
            .lock()
            .iter()
            .find(|e| e.type_id == type_id)
            .and_then(|e| e.downcast::<T>())
    }

    /// Return every overlay value registered under `T` in insertion order.
    pub fn get_all<T: Any + Send + Sync>(&self) -> Vec<Arc<T>> {
        self.entries
            .lock()
            .iter()
            .filter_map(|e| e.downcast::<T>())
            .collect()
    }

    /// Returns `true` when the overlay holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_lookups() {
        let registry = Registry::empty();
        assert!(registry.is_empty());
        assert!(registry.maybe_get::<String>().is_none());
        assert!(registry.get_all::<String>().is_empty());
        assert!(matches!(
            registry.get::<String>(),
            Err(ExecError::NotInRegistry(_))
        ));
    }

    #[test]
    fn test_single_entry() {
        let registry = Registry::single(42_u32);
        assert_eq!(*registry.get::<u32>().unwrap(), 42);
        assert!(registry.maybe_get::<u64>().is_none());
    }

    #[test]
    fn test_leaf_insertion_order() {
        let registry = Registry::builder()
            .add("a".to_string())
            .add("b".to_string())
            .add(1_u8)
            .build();
        let all: Vec<String> = registry
            .get_all::<String>()
            .iter()
            .map(|s| (**s).clone())
            .collect();
        assert_eq!(all, vec!["a", "b"]);
        assert_eq!(*registry.get::<String>().unwrap(), "a");
    }

    #[test]
    fn test_join_child_overrides() {
        // Parent has {String -> "p1", "p2"}, child has {String -> "c1"}.
        let parent = Registry::builder()
            .add("p1".to_string())
            .add("p2".to_string())
            .build();
        let child = Registry::single("c1".to_string());
        let joined = parent.join(child);

        assert_eq!(*joined.get::<String>().unwrap(), "c1");
        let all: Vec<String> = joined
            .get_all::<String>()
            .iter()
            .map(|s| (**s).clone())
            .collect();
        assert_eq!(all, vec!["c1", "p1", "p2"]);
        assert_eq!(
            joined.first::<String, String>(|s| Some(s.clone())),
            Some("c1".to_string())
        );
    }

    #[test]
    fn test_join_law() {
        let parent = Registry::builder().add(1_u32).add("p".to_string()).build();
        let child = Registry::builder().add(2_u32).build();
        let joined = parent.join(child.clone());

        // joined.get(T) == child.maybe_get(T).or(parent.maybe_get(T))
        assert_eq!(
            joined.maybe_get::<u32>(),
            child.maybe_get::<u32>().or(parent.maybe_get::<u32>())
        );
        assert_eq!(
            joined.maybe_get::<String>(),
            child
                .maybe_get::<String>()
                .or(parent.maybe_get::<String>())
        );

        // get_all(joined) == get_all(child) ++ get_all(parent)
        let mut expected = child.get_all::<u32>();
        expected.extend(parent.get_all::<u32>());
        assert_eq!(joined.get_all::<u32>(), expected);
    }

    #[test]
    fn test_join_empty_short_circuits() {
        let registry = Registry::single(7_i64);
        let joined = registry.join(Registry::empty());
        assert_eq!(*joined.get::<i64>().unwrap(), 7);

        let joined = Registry::empty().join(registry.clone());
        assert_eq!(*joined.get::<i64>().unwrap(), 7);
    }

    #[test]
    fn test_joined_lookup_cached() {
        let parent = Registry::single("deep".to_string());
        let joined = parent.join(Registry::single(1_u8));
        // Two lookups of the same type hit the cache on the second pass and
        // must agree.
        assert_eq!(*joined.get::<String>().unwrap(), "deep");
        assert_eq!(*joined.get::<String>().unwrap(), "deep");
        // Cached misses stay misses.
        assert!(joined.maybe_get::<u64>().is_none());
        assert!(joined.maybe_get::<u64>().is_none());
    }

    #[test]
    fn test_first_predicate() {
        let registry = Registry::builder().add(3_u32).add(8_u32).add(10_u32).build();
        let found = registry.first::<u32, u32>(|n| if *n > 5 { Some(n * 2) } else { None });
        assert_eq!(found, Some(16));
    }

    #[test]
    fn test_trait_object_entries() {
        trait Greeter: Send + Sync {
            fn hello(&self) -> &'static str;
        }
        struct En;
        impl Greeter for En {
            fn hello(&self) -> &'static str {
                "hello"
            }
        }

        let greeter: Arc<dyn Greeter> = Arc::new(En);
        let registry = Registry::single(greeter);
        let found = registry.get::<Arc<dyn Greeter>>().unwrap();
        assert_eq!(found.hello(), "hello");
    }

    #[test]
    fn test_mutable_overlay() {
        let overlay = MutableRegistry::new();
        assert!(overlay.is_empty());

        overlay.add("x".to_string());
        overlay.add("y".to_string());
        assert_eq!(*overlay.maybe_get::<String>().unwrap(), "x");
        assert_eq!(overlay.get_all::<String>().len(), 2);
        assert!(overlay.maybe_get::<u32>().is_none());
    }
}
