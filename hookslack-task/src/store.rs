// ABOUTME: Correlation store mapping host callback tokens to waiting tasks and primitives.
// ABOUTME: Resolution removes the entry and hands back every waiter so all see the same value.

use crate::error::TaskError;
use crate::host::HookEvent;
use crate::primitive::Slot;
use crate::task::TaskId;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// No primitive is outstanding for a resolved identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationMiss(pub String);

/// Maps identifiers to the tasks suspended on them and to the outstanding
/// host-resolvable primitive behind each identifier.
#[derive(Default)]
pub struct CorrelationStore {
    waiters: RefCell<HashMap<String, Vec<TaskId>>>,
    outstanding: RefCell<HashMap<String, Rc<Slot<HookEvent>>>>,
}

impl CorrelationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate a waiting task with an identifier. Registering the same task
    /// twice is a no-op.
    pub fn register(&self, id: &str, waiter: &TaskId) {
        let mut waiters = self.waiters.borrow_mut();
        let entry = waiters.entry(id.to_string()).or_default();
        if !entry.contains(waiter) {
            entry.push(waiter.clone());
        }
    }

    /// Remove and return every task waiting on `id`.
    pub fn take_waiters(&self, id: &str) -> Vec<TaskId> {
        self.waiters.borrow_mut().remove(id).unwrap_or_default()
    }

    /// Drop a single task from the waiter list of `id` (used on cancellation).
    pub fn remove_waiter(&self, id: &str, waiter: &TaskId) {
        let mut waiters = self.waiters.borrow_mut();
        if let Some(entry) = waiters.get_mut(id) {
            entry.retain(|w| w != waiter);
            if entry.is_empty() {
                waiters.remove(id);
            }
        }
    }

    pub fn waiter_count(&self, id: &str) -> usize {
        self.waiters.borrow().get(id).map(Vec::len).unwrap_or(0)
    }

    /// Identifiers with an outstanding host-resolvable primitive.
    pub fn outstanding_ids(&self) -> Vec<String> {
        self.outstanding.borrow().keys().cloned().collect()
    }

    pub fn is_outstanding(&self, id: &str) -> bool {
        self.outstanding.borrow().contains_key(id)
    }

    /// Track a primitive so a later callback carrying its identifier can
    /// resolve it. Returns the already-pending slot when one exists, so that
    /// several callers can collapse onto one host call.
    pub(crate) fn track(&self, slot: Rc<Slot<HookEvent>>) -> Rc<Slot<HookEvent>> {
        let mut outstanding = self.outstanding.borrow_mut();
        match outstanding.get(slot.id()) {
            Some(existing) if !existing.is_done() => Rc::clone(existing),
            _ => {
                outstanding.insert(slot.id().to_string(), Rc::clone(&slot));
                slot
            }
        }
    }

    /// Resolve the outstanding primitive for `id`, returning the tasks to resume.
    ///
    /// A resolution for an unknown identifier is a miss: late or duplicate
    /// deliveries are expected and the caller drops them.
    pub fn resolve(&self, id: &str, event: HookEvent) -> Result<Vec<TaskId>, CorrelationMiss> {
        let slot = self.outstanding.borrow_mut().remove(id);
        let Some(slot) = slot else {
            return Err(CorrelationMiss(id.to_string()));
        };
        if let Err(TaskError::InvalidState(reason)) = slot.set(Ok(event)) {
            tracing::warn!(id = %id, reason = %reason, "Ignoring second resolution");
            return Err(CorrelationMiss(id.to_string()));
        }
        Ok(self.take_waiters(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timer() -> HookEvent {
        HookEvent::Timer { remaining_calls: 0 }
    }

    #[test]
    fn test_resolve_returns_all_waiters_once() {
        let store = CorrelationStore::new();
        let slot = store.track(Rc::new(Slot::new("abc".to_string())));
        store.register("abc", &"t1".to_string());
        store.register("abc", &"t2".to_string());
        store.register("abc", &"t1".to_string());

        let woken = store.resolve("abc", timer()).unwrap();
        assert_eq!(woken, vec!["t1".to_string(), "t2".to_string()]);
        assert_eq!(slot.read().unwrap().unwrap(), timer());

        // Entry is gone: a duplicate delivery is a miss
        assert_eq!(
            store.resolve("abc", timer()),
            Err(CorrelationMiss("abc".to_string()))
        );
    }

    #[test]
    fn test_unknown_identifier_is_a_miss() {
        let store = CorrelationStore::new();
        assert!(store.resolve("nope", timer()).is_err());
    }

    #[test]
    fn test_track_reuses_pending_slot() {
        let store = CorrelationStore::new();
        let first = store.track(Rc::new(Slot::new("shared".to_string())));
        let second = store.track(Rc::new(Slot::new("shared".to_string())));
        assert!(Rc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_remove_waiter() {
        let store = CorrelationStore::new();
        store.register("x", &"t1".to_string());
        store.register("x", &"t2".to_string());
        store.remove_waiter("x", &"t1".to_string());
        assert_eq!(store.waiter_count("x"), 1);
        store.remove_waiter("x", &"t2".to_string());
        assert_eq!(store.waiter_count("x"), 0);
    }
}
