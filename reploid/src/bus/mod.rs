//! Typed topic-based pub/sub: the spine every component emits on.
//!
//! Topics are hierarchical dot/colon strings (`tool:start`, `replay:tool:start`);
//! the well-known ones are consts in [`topics`]. Delivery is synchronous and
//! ordered per topic in registration order. A handler returning an error is
//! logged and does not abort dispatch. Emits issued from inside a handler are
//! queued and drained after the current dispatch completes, so no handler ever
//! observes nested dispatch.
//!
//! Subscriptions are keyed by the registering module id;
//! [`EventBus::unsubscribe_module`] releases all of a module's handlers at once.

pub mod topics;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::warn;

/// Identifies the component that registered a handler. Unsubscribing by module
/// releases every handler it registered.
pub type ModuleId = String;

/// Opaque handle returned by [`EventBus::on`]; pass to [`EventBus::off`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// One event as seen by handlers.
#[derive(Clone, Debug)]
pub struct BusEvent {
    pub topic: String,
    pub payload: Value,
}

/// Error a handler may surface; logged, never propagated to the emitter.
pub type HandlerError = String;

type Handler = Arc<dyn Fn(&BusEvent) -> Result<(), HandlerError> + Send + Sync>;

/// Sink for handler errors, installed by the audit layer once it exists.
/// Arguments: topic, module id, error text.
pub type ErrorSink = Arc<dyn Fn(&str, &str, &str) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    module: ModuleId,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    by_topic: HashMap<String, Vec<Subscription>>,
}

#[derive(Default)]
struct DispatchState {
    queue: VecDeque<BusEvent>,
    dispatching: bool,
}

/// The pub/sub bus. Cheap to clone via `Arc`; constructed once and threaded
/// through component construction (no process-global singleton).
pub struct EventBus {
    next_id: AtomicU64,
    registry: Mutex<Registry>,
    dispatch: Mutex<DispatchState>,
    error_sink: Mutex<Option<ErrorSink>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            registry: Mutex::new(Registry::default()),
            dispatch: Mutex::new(DispatchState::default()),
            error_sink: Mutex::new(None),
        }
    }

    /// Registers `handler` for `topic` under `module`. Handlers for one topic
    /// fire in registration order.
    pub fn on(
        &self,
        topic: &str,
        module: &str,
        handler: impl Fn(&BusEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        registry
            .by_topic
            .entry(topic.to_string())
            .or_default()
            .push(Subscription {
                id,
                module: module.to_string(),
                handler: Arc::new(handler),
            });
        id
    }

    /// Removes one subscription. Unknown ids are ignored.
    pub fn off(&self, topic: &str, id: SubscriptionId) {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(subs) = registry.by_topic.get_mut(topic) {
            subs.retain(|s| s.id != id);
        }
    }

    /// Releases every handler registered under `module`, across all topics.
    pub fn unsubscribe_module(&self, module: &str) {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        for subs in registry.by_topic.values_mut() {
            subs.retain(|s| s.module != module);
        }
    }

    /// Installs the sink that receives handler errors (the audit logger).
    pub fn set_error_sink(&self, sink: ErrorSink) {
        *self.error_sink.lock().unwrap_or_else(|e| e.into_inner()) = Some(sink);
    }

    /// Number of live subscriptions for a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        registry.by_topic.get(topic).map_or(0, |s| s.len())
    }

    /// Emits `payload` on `topic`. Synchronous: handlers run on the calling
    /// thread before this returns, unless the call re-enters from inside a
    /// handler, in which case the event is queued and delivered by the outer
    /// dispatch after it finishes the current event.
    pub fn emit(&self, topic: &str, payload: Value) {
        {
            let mut state = self.dispatch.lock().unwrap_or_else(|e| e.into_inner());
            state.queue.push_back(BusEvent {
                topic: topic.to_string(),
                payload,
            });
            if state.dispatching {
                return; // outer dispatch drains the queue
            }
            state.dispatching = true;
        }

        loop {
            let event = {
                let mut state = self.dispatch.lock().unwrap_or_else(|e| e.into_inner());
                match state.queue.pop_front() {
                    Some(e) => e,
                    None => {
                        state.dispatching = false;
                        return;
                    }
                }
            };
            self.deliver(&event);
        }
    }

    fn deliver(&self, event: &BusEvent) {
        // Snapshot handlers so subscription changes from inside a handler
        // don't affect the current delivery.
        let handlers: Vec<(ModuleId, Handler)> = {
            let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            registry
                .by_topic
                .get(&event.topic)
                .map(|subs| {
                    subs.iter()
                        .map(|s| (s.module.clone(), Arc::clone(&s.handler)))
                        .collect()
                })
                .unwrap_or_default()
        };

        for (module, handler) in handlers {
            if let Err(err) = handler(event) {
                warn!(topic = %event.topic, module = %module, %err, "event handler failed");
                let sink = self
                    .error_sink
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                if let Some(sink) = sink {
                    sink(&event.topic, &module, &err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn handlers_fire_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            let order = Arc::clone(&order);
            bus.on("t", "test", move |_| {
                order.lock().unwrap().push(tag);
                Ok(())
            });
        }
        bus.emit("t", json!({}));
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn handler_error_does_not_stop_later_handlers() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(0));
        bus.on("t", "test", |_| Err("boom".to_string()));
        {
            let hits = Arc::clone(&hits);
            bus.on("t", "test", move |_| {
                *hits.lock().unwrap() += 1;
                Ok(())
            });
        }
        bus.emit("t", json!({}));
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn reentrant_emit_is_delivered_after_outer_dispatch() {
        let bus = Arc::new(EventBus::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        {
            let bus2 = Arc::clone(&bus);
            let order = Arc::clone(&order);
            bus.on("outer", "test", move |_| {
                order.lock().unwrap().push("outer:begin");
                bus2.emit("inner", json!({}));
                order.lock().unwrap().push("outer:end");
                Ok(())
            });
        }
        {
            let order = Arc::clone(&order);
            bus.on("inner", "test", move |_| {
                order.lock().unwrap().push("inner");
                Ok(())
            });
        }
        bus.emit("outer", json!({}));
        assert_eq!(
            *order.lock().unwrap(),
            vec!["outer:begin", "outer:end", "inner"]
        );
    }

    #[test]
    fn unsubscribe_module_releases_all_handlers() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(0));
        for topic in ["a", "b"] {
            let hits = Arc::clone(&hits);
            bus.on(topic, "mod-x", move |_| {
                *hits.lock().unwrap() += 1;
                Ok(())
            });
        }
        bus.unsubscribe_module("mod-x");
        bus.emit("a", json!({}));
        bus.emit("b", json!({}));
        assert_eq!(*hits.lock().unwrap(), 0);
        assert_eq!(bus.subscriber_count("a"), 0);
    }

    #[test]
    fn off_removes_only_the_given_subscription() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(Vec::new()));
        let id = {
            let hits = Arc::clone(&hits);
            bus.on("t", "test", move |_| {
                hits.lock().unwrap().push("first");
                Ok(())
            })
        };
        {
            let hits = Arc::clone(&hits);
            bus.on("t", "test", move |_| {
                hits.lock().unwrap().push("second");
                Ok(())
            });
        }
        bus.off("t", id);
        bus.emit("t", json!({}));
        assert_eq!(*hits.lock().unwrap(), vec!["second"]);
    }
}
