//! Generic callback registry shared by every subscriber set in [`crate::manager`].
//!
//! Dispatch is snapshot-then-iterate, the same idiom used by an
//! event-loop-style subscription list (collect the currently registered ids,
//! then invoke, so a callback mutating the registry mid-dispatch never
//! corrupts the in-progress pass), adapted here from async-channel
//! subscriptions to plain synchronous closures. The manager owns its
//! registries outright rather than sharing them behind an `Arc`, so
//! unregistration is an explicit id-based `cancel` rather than a
//! `Drop`-triggered handshake — there is no handle to drop independently of
//! the manager.

use std::collections::HashMap;

/// Opaque handle identifying one registered callback, returned by
/// [`Registry::register`] and accepted by [`Registry::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// An identity-keyed collection of callbacks, supporting re-entrant
/// dispatch: a callback may register or cancel another callback from within
/// its own invocation without corrupting the in-progress dispatch.
pub struct Registry<F: ?Sized> {
    next_id: u64,
    entries: HashMap<u64, Box<F>>,
}

impl<F: ?Sized> Default for Registry<F> {
    fn default() -> Self {
        Self { next_id: 0, entries: HashMap::new() }
    }
}

impl<F: ?Sized> Registry<F> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback`, returning an id that can later be passed to
    /// [`cancel`](Self::cancel).
    pub fn register(&mut self, callback: Box<F>) -> CallbackId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, callback);
        CallbackId(id)
    }

    /// Unregisters the callback identified by `id`. A no-op if it was
    /// already cancelled or never existed.
    pub fn cancel(&mut self, id: CallbackId) {
        self.entries.remove(&id.0);
    }

    /// Number of currently registered callbacks.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry has no registered callbacks.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the ids currently registered, as a dispatch snapshot.
    ///
    /// Callers should collect this before iterating and invoking callbacks,
    /// since an invoked callback may mutate the registry (register or
    /// cancel another entry) — dispatching off a snapshot means such
    /// mutation is observed on the *next* dispatch, never corrupts the
    /// current one.
    fn snapshot_ids(&self) -> Vec<u64> {
        self.entries.keys().copied().collect()
    }
}

impl<A> Registry<dyn Fn(&A) + Send + Sync> {
    /// Invokes every currently registered callback with `arg`, in an
    /// unspecified order, guarding each call with `catch_unwind` so a
    /// panicking subscriber cannot take down dispatch for the others.
    pub fn dispatch(&self, arg: &A) {
        for id in self.snapshot_ids() {
            let Some(callback) = self.entries.get(&id) else { continue };
            let callback = std::panic::AssertUnwindSafe(callback.as_ref());
            let arg = std::panic::AssertUnwindSafe(arg);
            if std::panic::catch_unwind(move || (callback.0)(arg.0)).is_err() {
                log::warn!("subscriber callback panicked during dispatch");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    };

    use super::*;

    #[test]
    fn register_then_cancel_removes_entry() {
        let mut reg: Registry<dyn Fn(&i32) + Send + Sync> = Registry::new();
        let id = reg.register(Box::new(|_: &i32| {}));
        assert_eq!(reg.len(), 1);
        reg.cancel(id);
        assert!(reg.is_empty());
    }

    #[test]
    fn cancel_unknown_id_is_a_no_op() {
        let mut reg: Registry<dyn Fn(&i32) + Send + Sync> = Registry::new();
        let id = reg.register(Box::new(|_: &i32| {}));
        reg.cancel(id);
        reg.cancel(id);
        assert!(reg.is_empty());
    }

    #[test]
    fn dispatch_invokes_all_registered_callbacks() {
        let mut reg: Registry<dyn Fn(&i32) + Send + Sync> = Registry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen1 = seen.clone();
        reg.register(Box::new(move |v: &i32| seen1.lock().unwrap().push(*v)));
        let seen2 = seen.clone();
        reg.register(Box::new(move |v: &i32| seen2.lock().unwrap().push(*v * 10)));
        reg.dispatch(&3);
        let mut got = seen.lock().unwrap().clone();
        got.sort_unstable();
        assert_eq!(got, vec![3, 30]);
    }

    #[test]
    fn dispatch_survives_a_panicking_callback() {
        let mut reg: Registry<dyn Fn(&i32) + Send + Sync> = Registry::new();
        reg.register(Box::new(|_: &i32| panic!("boom")));
        let seen = Arc::new(AtomicBool::new(false));
        let seen1 = seen.clone();
        reg.register(Box::new(move |_: &i32| seen1.store(true, Ordering::SeqCst)));
        reg.dispatch(&1);
        assert!(seen.load(Ordering::SeqCst));
    }
}
