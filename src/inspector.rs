//! Inspector parent/child bookkeeping.
//!
//! Every environment owns an [`InspectorAgent`]. A parent hands a child an
//! [`InspectorParentHandle`] naming the child's thread id and URL; the child
//! consumes it when it loads, which registers the child with the parent's
//! agent until the child environment is freed.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::fatal;
use crate::thread_id::ThreadId;

type Children = Arc<Mutex<BTreeMap<ThreadId, String>>>;

fn lock(children: &Children) -> MutexGuard<'_, BTreeMap<ThreadId, String>> {
    children.lock().expect("inspector children poisoned")
}

/// Ownership token linking a child environment to its parent's inspector.
///
/// Single use: loading an environment with it consumes it.
#[derive(Debug)]
pub struct InspectorParentHandle {
    parent_thread_id: ThreadId,
    thread_id: ThreadId,
    url: String,
    parent_children: Children,
}

impl InspectorParentHandle {
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[derive(Debug)]
struct ParentLink {
    parent_thread_id: ThreadId,
    parent_children: Children,
}

#[derive(Debug)]
pub struct InspectorAgent {
    thread_id: ThreadId,
    children: Children,
    parent: Option<ParentLink>,
}

impl InspectorAgent {
    pub(crate) fn new(thread_id: ThreadId) -> Self {
        Self {
            thread_id,
            children: Arc::default(),
            parent: None,
        }
    }

    /// Handle for a child running on `thread_id`.
    pub(crate) fn parent_handle(&self, thread_id: ThreadId, url: &str) -> InspectorParentHandle {
        if !thread_id.is_valid() {
            fatal!("Inspector parent handle requested for an invalid thread id");
        }

        InspectorParentHandle {
            parent_thread_id: self.thread_id,
            thread_id,
            url: url.to_string(),
            parent_children: Arc::clone(&self.children),
        }
    }

    pub(crate) fn attach(&mut self, handle: Option<InspectorParentHandle>) {
        let Some(handle) = handle else {
            tracing::trace!("Inspector for thread {} has no parent", self.thread_id);
            return;
        };

        if handle.thread_id != self.thread_id {
            tracing::warn!(
                "Inspector handle issued for thread {} attached by thread {}",
                handle.thread_id,
                self.thread_id
            );
        }

        lock(&handle.parent_children).insert(self.thread_id, handle.url);

        tracing::debug!(
            "Inspector for thread {} attached to parent thread {}",
            self.thread_id,
            handle.parent_thread_id
        );

        self.parent = Some(ParentLink {
            parent_thread_id: handle.parent_thread_id,
            parent_children: handle.parent_children,
        });
    }

    pub(crate) fn detach(&mut self) {
        if let Some(parent) = self.parent.take() {
            lock(&parent.parent_children).remove(&self.thread_id);
            tracing::debug!(
                "Inspector for thread {} detached from parent thread {}",
                self.thread_id,
                parent.parent_thread_id
            );
        }
    }

    pub fn parent_thread_id(&self) -> Option<ThreadId> {
        self.parent.as_ref().map(|p| p.parent_thread_id)
    }

    /// Attached children as (thread id, url).
    pub fn children(&self) -> Vec<(ThreadId, String)> {
        lock(&self.children)
            .iter()
            .map(|(id, url)| (*id, url.clone()))
            .collect()
    }
}
