//! Namespaced generator of unique device names.

use std::collections::HashSet;

use dashmap::DashMap;
use log::debug;

/// Hands out names that are unique within a namespace.
///
/// Each provider uses its own name as namespace, so two providers may both
/// expose a "Keyboard" while one provider exposes "Keyboard" and
/// "Keyboard (2)".
///
/// # Example
///
/// ```
/// use rgbd::id_registry::IdRegistry;
///
/// let registry = IdRegistry::new();
/// assert_eq!(registry.make_unique("usb", "Fan"), "Fan");
/// assert_eq!(registry.make_unique("usb", "Fan"), "Fan (2)");
/// assert_eq!(registry.make_unique("dmx", "Fan"), "Fan");
/// ```
#[derive(Debug, Default)]
pub struct IdRegistry {
    namespaces: DashMap<String, HashSet<String>>,
}

impl IdRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers and returns `id`, or `"{id} (n)"` with the smallest free `n >= 2`.
    pub fn make_unique(&self, namespace: &str, id: &str) -> String {
        let mut used = self.namespaces.entry(namespace.to_string()).or_default();

        let unique = if used.contains(id) {
            (2usize..)
                .map(|n| format!("{id} ({n})"))
                .find(|candidate| !used.contains(candidate))
                .unwrap_or_else(|| id.to_string())
        } else {
            id.to_string()
        };

        used.insert(unique.clone());
        debug!("Registered '{unique}' in namespace '{namespace}'");
        unique
    }

    pub fn contains(&self, namespace: &str, id: &str) -> bool {
        self.namespaces
            .get(namespace)
            .is_some_and(|used| used.contains(id))
    }

    /// Frees one name. Returns whether it was registered.
    pub fn release(&self, namespace: &str, id: &str) -> bool {
        self.namespaces
            .get_mut(namespace)
            .is_some_and(|mut used| used.remove(id))
    }

    /// Forgets every name registered in `namespace`.
    pub fn reset_namespace(&self, namespace: &str) {
        self.namespaces.remove(namespace);
    }
}
