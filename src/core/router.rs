use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::SystemTime;

use sonic_rs::Value;
use tracing::error;

/// One event as seen by handlers.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub name: String,
    pub payload: Value,
    pub received_at: SystemTime,
}

impl EventEnvelope {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
            received_at: SystemTime::now(),
        }
    }
}

/// Shared handler reference. Registration identity is the `Arc` allocation.
pub type EventHandler = Arc<dyn Fn(&EventEnvelope) + Send + Sync>;

pub fn handler<F>(f: F) -> EventHandler
where
    F: Fn(&EventEnvelope) + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

#[inline]
fn same_handler(a: &EventHandler, b: &EventHandler) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Name-keyed fan-out of inbound events.
///
/// Handlers for a name run in registration order, followed by the catch-all handlers.
/// A panicking handler is logged and skipped; the remaining handlers still run.
#[derive(Default)]
pub struct EventRouter {
    named: HashMap<String, Vec<EventHandler>>,
    fallback: Vec<EventHandler>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the same handler is already registered for `event`.
    pub fn on(&mut self, event: impl Into<String>, handler: EventHandler) -> bool {
        let handlers = self.named.entry(event.into()).or_default();
        if handlers.iter().any(|h| same_handler(h, &handler)) {
            return false;
        }
        handlers.push(handler);
        true
    }

    pub fn off(&mut self, event: &str, handler: &EventHandler) -> bool {
        let Some(handlers) = self.named.get_mut(event) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|h| !same_handler(h, handler));
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            self.named.remove(event);
        }
        removed
    }

    pub fn on_any(&mut self, handler: EventHandler) -> bool {
        if self.fallback.iter().any(|h| same_handler(h, &handler)) {
            return false;
        }
        self.fallback.push(handler);
        true
    }

    pub fn off_any(&mut self, handler: &EventHandler) -> bool {
        let before = self.fallback.len();
        self.fallback.retain(|h| !same_handler(h, handler));
        self.fallback.len() != before
    }

    pub fn dispatch(&self, envelope: &EventEnvelope) -> DispatchReport {
        let mut report = DispatchReport::default();
        let named = self
            .named
            .get(envelope.name.as_str())
            .map(Vec::as_slice)
            .unwrap_or_default();

        for handler in named.iter().chain(self.fallback.iter()) {
            match catch_unwind(AssertUnwindSafe(|| handler(envelope))) {
                Ok(()) => report.delivered += 1,
                Err(panic) => {
                    report.failed += 1;
                    let detail = panic
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic payload".to_string());
                    error!(event = %envelope.name, %detail, "event handler panicked");
                }
            }
        }
        report
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.named.get(event).map_or(0, Vec::len)
    }

    pub fn fallback_count(&self) -> usize {
        self.fallback.len()
    }

    pub fn clear(&mut self) {
        self.named.clear();
        self.fallback.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn envelope(name: &str) -> EventEnvelope {
        EventEnvelope::new(name, Value::default())
    }

    #[test]
    fn handlers_run_in_registration_order_then_fallback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut router = EventRouter::new();
        for tag in ["a", "b"] {
            let seen = seen.clone();
            router.on("update", handler(move |_| seen.lock().unwrap().push(tag)));
        }
        let any = seen.clone();
        router.on_any(handler(move |_| any.lock().unwrap().push("any")));

        let report = router.dispatch(&envelope("update"));
        assert_eq!(report.delivered, 3);
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "any"]);

        router.dispatch(&envelope("other"));
        assert_eq!(seen.lock().unwrap().last(), Some(&"any"));
    }

    #[test]
    fn duplicate_registration_is_ignored() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let h = handler(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut router = EventRouter::new();
        assert!(router.on("tick", h.clone()));
        assert!(!router.on("tick", h.clone()));
        assert_eq!(router.handler_count("tick"), 1);

        router.dispatch(&envelope("tick"));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(router.off("tick", &h));
        assert!(!router.off("tick", &h));
        assert_eq!(router.handler_count("tick"), 0);
    }

    #[test]
    fn panicking_handler_does_not_block_the_rest() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut router = EventRouter::new();
        router.on("boom", handler(|_| panic!("handler failure")));
        let counter = count.clone();
        router.on(
            "boom",
            handler(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let report = router.dispatch(&envelope("boom"));
        assert_eq!(report, DispatchReport { delivered: 1, failed: 1 });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clear_drops_every_handler() {
        let mut router = EventRouter::new();
        router.on("x", handler(|_| {}));
        router.on_any(handler(|_| {}));
        router.clear();
        assert_eq!(router.handler_count("x"), 0);
        assert_eq!(router.fallback_count(), 0);
        assert_eq!(router.dispatch(&envelope("x")), DispatchReport::default());
    }
}
