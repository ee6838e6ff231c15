//! Cleanup hooks and at-exit callbacks.

use std::collections::BTreeMap;

/// Identifies a registered cleanup hook for [`CleanupHooks::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CleanupHookId(u64);

/// Hooks keyed by registration order; the newest runs first.
pub(crate) struct CleanupHooks<H> {
    next_id: u64,
    hooks: BTreeMap<u64, H>,
}

impl<H> CleanupHooks<H> {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 0,
            hooks: BTreeMap::new(),
        }
    }

    pub(crate) fn add(&mut self, hook: H) -> CleanupHookId {
        let id = self.next_id;
        self.next_id += 1;
        self.hooks.insert(id, hook);
        CleanupHookId(id)
    }

    pub(crate) fn remove(&mut self, id: CleanupHookId) -> Option<H> {
        self.hooks.remove(&id.0)
    }

    /// Most recently registered hook.
    pub(crate) fn pop_newest(&mut self) -> Option<H> {
        self.hooks.pop_last().map(|(_, hook)| hook)
    }

    pub(crate) fn len(&self) -> usize {
        self.hooks.len()
    }
}

/// At-exit callbacks, run newest first.
pub(crate) struct AtExitCallbacks<C> {
    callbacks: Vec<C>,
}

impl<C> AtExitCallbacks<C> {
    pub(crate) fn new() -> Self {
        Self { callbacks: Vec::new() }
    }

    pub(crate) fn push(&mut self, callback: C) {
        self.callbacks.push(callback);
    }

    pub(crate) fn pop(&mut self) -> Option<C> {
        self.callbacks.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hooks_pop_in_reverse_order() {
        let mut hooks = CleanupHooks::new();
        hooks.add("first");
        hooks.add("second");
        hooks.add("third");

        assert_eq!(hooks.pop_newest(), Some("third"));
        assert_eq!(hooks.pop_newest(), Some("second"));
        assert_eq!(hooks.pop_newest(), Some("first"));
        assert_eq!(hooks.pop_newest(), None);
    }

    #[test]
    fn test_removed_hook_never_runs() {
        let mut hooks = CleanupHooks::new();
        hooks.add("kept");
        let id = hooks.add("removed");

        assert_eq!(hooks.remove(id), Some("removed"));
        assert_eq!(hooks.remove(id), None);
        assert_eq!(hooks.len(), 1);
        assert_eq!(hooks.pop_newest(), Some("kept"));
    }

    #[test]
    fn test_hook_added_while_draining_runs_next() {
        let mut hooks = CleanupHooks::new();
        hooks.add(1);
        hooks.add(2);

        assert_eq!(hooks.pop_newest(), Some(2));
        hooks.add(3);
        assert_eq!(hooks.pop_newest(), Some(3));
        assert_eq!(hooks.pop_newest(), Some(1));
    }

    #[test]
    fn test_at_exit_reverse_order() {
        let mut callbacks = AtExitCallbacks::new();
        callbacks.push('a');
        callbacks.push('b');

        assert_eq!(callbacks.pop(), Some('b'));
        assert_eq!(callbacks.pop(), Some('a'));
        assert_eq!(callbacks.pop(), None);
    }
}
