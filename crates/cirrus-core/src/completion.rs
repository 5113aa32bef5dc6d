//! Single-slot, tag-checked completions.
//!
//! Listener-style vendor clients call back exactly once, from an unspecified
//! thread, and possibly after the caller has given up on the request. A
//! [`TaggedCompletion`] is created with the tag generated at the call site;
//! the callback must present the same tag to resolve it, so a late callback
//! from an abandoned request can never resolve a newer one.

use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

#[derive(Debug, Clone)]
enum Slot<V> {
    Pending,
    Completed(V),
    Cancelled,
}

/// The awaiter was released by [`TaggedCompletion::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("completion cancelled")]
pub struct Cancelled;

/// Cancellable one-shot result keyed by an opaque tag.
///
/// Exactly one of completed or cancelled becomes the terminal outcome.
/// Clones share the same slot, so any number of tasks may await it.
pub struct TaggedCompletion<T, V> {
    tag: T,
    slot: Arc<watch::Sender<Slot<V>>>,
}

impl<T: Clone, V> Clone for TaggedCompletion<T, V> {
    fn clone(&self) -> Self {
        Self {
            tag: self.tag.clone(),
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T: std::fmt::Debug, V> std::fmt::Debug for TaggedCompletion<T, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.slot.borrow() {
            Slot::Pending => "pending",
            Slot::Completed(_) => "completed",
            Slot::Cancelled => "cancelled",
        };
        f.debug_struct("TaggedCompletion")
            .field("tag", &self.tag)
            .field("state", &state)
            .finish()
    }
}

impl<T: PartialEq, V: Clone> TaggedCompletion<T, V> {
    pub fn new(tag: T) -> Self {
        let (tx, _rx) = watch::channel(Slot::Pending);
        Self {
            tag,
            slot: Arc::new(tx),
        }
    }

    pub fn tag(&self) -> &T {
        &self.tag
    }

    /// Resolve with `value` if `tag` matches and nothing resolved it yet.
    ///
    /// Returns false, leaving the awaiter untouched, on a tag mismatch, a
    /// second completion, or a completion after cancel.
    pub fn complete(&self, tag: &T, value: V) -> bool {
        if *tag != self.tag {
            tracing::debug!("Rejected completion carrying a foreign tag");
            return false;
        }
        self.slot.send_if_modified(move |slot| match slot {
            Slot::Pending => {
                *slot = Slot::Completed(value);
                true
            }
            _ => false,
        })
    }

    /// Release every awaiter with [`Cancelled`]. No-op once resolved.
    pub fn cancel(&self) -> bool {
        self.slot.send_if_modified(|slot| match slot {
            Slot::Pending => {
                *slot = Slot::Cancelled;
                true
            }
            _ => false,
        })
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.slot.borrow(), Slot::Pending)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(*self.slot.borrow(), Slot::Cancelled)
    }

    /// Terminal outcome if there is one, without waiting.
    pub fn outcome(&self) -> Option<Result<V, Cancelled>> {
        match &*self.slot.borrow() {
            Slot::Pending => None,
            Slot::Completed(v) => Some(Ok(v.clone())),
            Slot::Cancelled => Some(Err(Cancelled)),
        }
    }

    /// Wait for the terminal outcome.
    pub async fn wait(&self) -> Result<V, Cancelled> {
        let mut rx = self.slot.subscribe();
        // The sender lives as long as `self`, so the channel cannot close here.
        let slot = rx
            .wait_for(|s| !matches!(s, Slot::Pending))
            .await
            .map_err(|_| Cancelled)?;
        match &*slot {
            Slot::Completed(v) => Ok(v.clone()),
            _ => Err(Cancelled),
        }
    }
}

/// A reusable holder for the current [`TaggedCompletion`] of some logical
/// operation (a token refresh, a vendor request).
///
/// Callbacks route through the slot with the tag they were issued with; once
/// the slot has moved on to a newer request, stale callbacks are rejected.
pub struct CompletionSlot<T, V> {
    current: Mutex<Option<TaggedCompletion<T, V>>>,
}

impl<T, V> Default for CompletionSlot<T, V> {
    fn default() -> Self {
        Self {
            current: Mutex::new(None),
        }
    }
}

impl<T: PartialEq + Clone, V: Clone> CompletionSlot<T, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current completion with a fresh one for `tag`, cancelling
    /// the previous one if it was still pending.
    pub fn begin(&self, tag: T) -> TaggedCompletion<T, V> {
        let next = TaggedCompletion::new(tag);
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(prev) = current.replace(next.clone()) {
            prev.cancel();
        }
        next
    }

    /// Join the pending completion if there is one, otherwise start a new
    /// one with `make_tag()`. The flag is true when the caller started it and
    /// is therefore responsible for issuing the underlying request.
    pub fn join_or_begin(&self, make_tag: impl FnOnce() -> T) -> (TaggedCompletion<T, V>, bool) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pending) = current.as_ref().filter(|c| c.is_pending()) {
            return (pending.clone(), false);
        }
        let next = TaggedCompletion::new(make_tag());
        *current = Some(next.clone());
        (next, true)
    }

    /// Route a callback result to the current completion.
    pub fn complete(&self, tag: &T, value: V) -> bool {
        let current = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match current {
            Some(c) => c.complete(tag, value),
            None => false,
        }
    }

    /// Cancel and forget the current completion.
    pub fn cancel(&self) {
        if let Some(c) = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            c.cancel();
        }
    }
}
