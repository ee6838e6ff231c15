//! Native extension modules registered against a running environment.
//!
//! Script reaches them through `process._linkedBinding(name)`; the init
//! function runs once per environment and its exports object is cached.

use std::sync::{Arc, Mutex, MutexGuard};

/// Fills the exports object of a linked binding.
pub type LinkedBindingInit =
    dyn for<'s, 'i> Fn(&mut v8::PinScope<'s, 'i>, v8::Local<'s, v8::Object>) + Send + Sync;

#[derive(Clone)]
pub struct LinkedBinding {
    name: Arc<str>,
    init: Arc<LinkedBindingInit>,
}

impl LinkedBinding {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn init(&self) -> &LinkedBindingInit {
        &*self.init
    }
}

impl std::fmt::Debug for LinkedBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkedBinding").field("name", &self.name).finish()
    }
}

/// The linked-binding list of one environment.
///
/// Clones share the list, so another thread can register bindings while the
/// environment runs.
#[derive(Debug, Clone, Default)]
pub struct LinkedBindings {
    bindings: Arc<Mutex<Vec<LinkedBinding>>>,
}

impl LinkedBindings {
    pub fn new() -> Self {
        Self::default()
    }

    fn bindings(&self) -> MutexGuard<'_, Vec<LinkedBinding>> {
        self.bindings.lock().expect("linked bindings poisoned")
    }

    /// First binding registered under `name`.
    pub fn find(&self, name: &str) -> Option<LinkedBinding> {
        self.bindings().iter().find(|b| &*b.name == name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.bindings().iter().map(|b| b.name.to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.bindings().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings().is_empty()
    }
}

/// Register `init` as linked binding `name`.
///
/// A later registration under the same name is shadowed by the earlier one.
pub fn add_linked_binding<F>(bindings: &LinkedBindings, name: &str, init: F)
where
    F: for<'s, 'i> Fn(&mut v8::PinScope<'s, 'i>, v8::Local<'s, v8::Object>) + Send + Sync + 'static,
{
    let binding = LinkedBinding {
        name: Arc::from(name),
        init: Arc::new(init),
    };

    let mut list = bindings.bindings();

    if list.iter().any(|b| b.name == binding.name) {
        tracing::warn!("Linked binding '{name}' is already registered; the first registration wins");
    }

    list.push(binding);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_from_another_thread() {
        let bindings = LinkedBindings::new();
        let remote = bindings.clone();

        std::thread::spawn(move || {
            add_linked_binding(&remote, "remote", |_scope, _exports| {});
        })
        .join()
        .unwrap();

        assert_eq!(bindings.names(), vec!["remote".to_string()]);
        assert!(bindings.find("remote").is_some());
        assert!(bindings.find("missing").is_none());
    }

    #[test]
    fn test_first_registration_wins() {
        let bindings = LinkedBindings::new();
        add_linked_binding(&bindings, "dup", |_scope, _exports| {});
        add_linked_binding(&bindings, "dup", |_scope, _exports| {});

        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings.find("dup").map(|b| b.name().to_string()), Some("dup".to_string()));
    }
}
