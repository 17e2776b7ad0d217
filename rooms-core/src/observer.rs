//! Typed observer registry. `on` returns a [`Subscription`] that removes the
//! handler when dropped.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registry<E> {
    next_id: u64,
    handlers: Vec<(u64, Handler<E>)>,
}

/// Fan-out of events of type `E` to registered handlers.
pub struct Emitter<E> {
    registry: Arc<Mutex<Registry<E>>>,
}

impl<E: 'static> Emitter<E> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                handlers: Vec::new(),
            })),
        }
    }

    /// Register a handler. It stays registered as long as the returned
    /// subscription is alive.
    pub fn on(&self, handler: impl Fn(&E) + Send + Sync + 'static) -> Subscription {
        let mut registry = self.registry.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.handlers.push((id, Arc::new(handler)));
        let weak: Weak<Mutex<Registry<E>>> = Arc::downgrade(&self.registry);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    registry.lock().handlers.retain(|(h, _)| *h != id);
                }
            })),
        }
    }

    /// Call every handler registered before this call started. Handlers run
    /// without the registry lock held, so they may subscribe or unsubscribe.
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Handler<E>> = self
            .registry
            .lock()
            .handlers
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for handler in snapshot {
            handler(event);
        }
    }

    pub fn handler_count(&self) -> usize {
        self.registry.lock().handlers.len()
    }
}

impl<E: 'static> Default for Emitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle of a registered handler. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the handler"]
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }

    /// Keep the handler registered for the emitter's whole lifetime.
    pub fn detach(mut self) {
        self.remove = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn emits_to_all_handlers() {
        let emitter = Emitter::<u32>::new();
        let total = Arc::new(AtomicUsize::new(0));
        let t1 = total.clone();
        let t2 = total.clone();
        let _a = emitter.on(move |v| {
            t1.fetch_add(*v as usize, Ordering::SeqCst);
        });
        let _b = emitter.on(move |v| {
            t2.fetch_add(*v as usize, Ordering::SeqCst);
        });
        emitter.emit(&5);
        assert_eq!(total.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn drop_unsubscribes() {
        let emitter = Emitter::<()>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let sub = emitter.on(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        emitter.emit(&());
        drop(sub);
        emitter.emit(&());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.handler_count(), 0);
    }

    #[test]
    fn explicit_unsubscribe_and_detach() {
        let emitter = Emitter::<()>::new();
        emitter.on(|_| {}).unsubscribe();
        assert_eq!(emitter.handler_count(), 0);
        emitter.on(|_| {}).detach();
        assert_eq!(emitter.handler_count(), 1);
    }

    #[test]
    fn handler_added_during_emit_waits_for_next_emit() {
        let emitter = Arc::new(Emitter::<()>::new());
        let late_hits = Arc::new(AtomicUsize::new(0));
        let subs = Arc::new(Mutex::new(Vec::new()));

        let e = emitter.clone();
        let lh = late_hits.clone();
        let s = subs.clone();
        let _outer = emitter.on(move |_| {
            let lh = lh.clone();
            s.lock().push(e.on(move |_| {
                lh.fetch_add(1, Ordering::SeqCst);
            }));
        });

        emitter.emit(&());
        assert_eq!(late_hits.load(Ordering::SeqCst), 0);
        emitter.emit(&());
        assert_eq!(late_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscription_outliving_emitter_is_harmless() {
        let emitter = Emitter::<()>::new();
        let sub = emitter.on(|_| {});
        drop(emitter);
        drop(sub);
    }
}
