//! In-process asynchronous publish/subscribe.
//!
//! Topics are dotted strings matched by glob patterns. Each asynchronous
//! subscriber owns a bounded queue; a slow subscriber loses its oldest
//! events (observable through `eventbus.overflow`) instead of
//! back-pressuring publishers. Synchronous subscribers run inline and
//! must not block. The bus keeps a bounded history for late subscribers
//! that explicitly ask for it.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio::sync::Notify;

use crate::domain::models::{topics, Event, TopicPattern};

/// Per-subscriber queue bound.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 1024;
/// Events retained for catch-up subscriptions.
pub const HISTORY_CAPACITY: usize = 10_000;

type SyncHandler = Box<dyn Fn(&Event) + Send + Sync>;

struct SubQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

struct QueueState {
    events: VecDeque<Event>,
    closed: bool,
}

struct AsyncSubscriber {
    id: u64,
    pattern: TopicPattern,
    queue: Arc<SubQueue>,
}

struct SyncSubscriber {
    pattern: TopicPattern,
    handler: SyncHandler,
}

struct BusState {
    subscribers: Vec<AsyncSubscriber>,
    sync_subscribers: Vec<SyncSubscriber>,
    history: VecDeque<Event>,
    closed: bool,
}

/// Handle for receiving events from an asynchronous subscription.
pub struct Subscription {
    id: u64,
    queue: Arc<SubQueue>,
}

impl Subscription {
    /// Await the next matching event. Returns `None` once the bus is
    /// closed and the queue is drained.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            let notified = self.queue.notify.notified();
            {
                let mut state = self.queue.state.lock().expect("subscriber queue poisoned");
                if let Some(event) = state.events.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Event> {
        self.queue
            .state
            .lock()
            .expect("subscriber queue poisoned")
            .events
            .pop_front()
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Central event bus.
pub struct EventBus {
    state: Mutex<BusState>,
    queue_capacity: usize,
    next_id: AtomicU64,
    published: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_queue_capacity(SUBSCRIBER_QUEUE_CAPACITY)
    }

    /// Queue bound override for tests.
    pub fn with_queue_capacity(queue_capacity: usize) -> Self {
        Self {
            state: Mutex::new(BusState {
                subscribers: Vec::new(),
                sync_subscribers: Vec::new(),
                history: VecDeque::new(),
                closed: false,
            }),
            queue_capacity,
            next_id: AtomicU64::new(0),
            published: AtomicU64::new(0),
        }
    }

    /// Publish an event to every matching subscriber.
    ///
    /// Delivery to each subscriber preserves this publisher's ordering;
    /// a panicking synchronous handler is isolated and logged.
    pub fn publish(&self, event: Event) {
        let overflowed = {
            let mut state = self.state.lock().expect("event bus poisoned");
            if state.closed {
                return;
            }

            state.history.push_back(event.clone());
            while state.history.len() > HISTORY_CAPACITY {
                state.history.pop_front();
            }

            for sub in &state.sync_subscribers {
                if sub.pattern.matches(&event.topic) {
                    let result =
                        std::panic::catch_unwind(AssertUnwindSafe(|| (sub.handler)(&event)));
                    if result.is_err() {
                        tracing::error!(topic = %event.topic, "sync subscriber panicked");
                    }
                }
            }

            // Drop subscribers whose handles are gone, deliver to the rest.
            let capacity = self.queue_capacity;
            let mut overflowed: Vec<(u64, String)> = Vec::new();
            state.subscribers.retain(|sub| {
                if Arc::strong_count(&sub.queue) == 1 {
                    return false;
                }
                if sub.pattern.matches(&event.topic) {
                    let mut queue = sub.queue.state.lock().expect("subscriber queue poisoned");
                    queue.events.push_back(event.clone());
                    if queue.events.len() > capacity {
                        queue.events.pop_front();
                        overflowed.push((sub.id, sub.pattern.as_str().to_string()));
                    }
                    drop(queue);
                    sub.queue.notify.notify_one();
                }
                true
            });
            overflowed
        };

        self.published.fetch_add(1, Ordering::Relaxed);

        // Re-entrant publish happens outside the lock; overflow of the
        // overflow topic itself is not reported again.
        if event.topic != topics::EVENTBUS_OVERFLOW {
            for (subscriber_id, pattern) in overflowed {
                tracing::warn!(subscriber_id, pattern = %pattern, "subscriber queue overflow");
                self.publish(Event::new(
                    topics::EVENTBUS_OVERFLOW,
                    json!({ "subscriber_id": subscriber_id, "pattern": pattern, "dropped": 1 }),
                ));
            }
        }
    }

    /// Convenience wrapper building the event record in place.
    pub fn publish_json(&self, topic: &str, payload: serde_json::Value) {
        self.publish(Event::new(topic, payload));
    }

    /// Register an asynchronous subscription; only events published
    /// after this call are delivered.
    pub fn subscribe(&self, pattern: &str) -> Subscription {
        let (subscription, _) = self.subscribe_inner(pattern, false);
        subscription
    }

    /// Register an asynchronous subscription and atomically snapshot the
    /// matching history so no event is missed or duplicated in between.
    pub fn subscribe_with_history(&self, pattern: &str) -> (Vec<Event>, Subscription) {
        let (subscription, history) = self.subscribe_inner(pattern, true);
        (history, subscription)
    }

    fn subscribe_inner(&self, pattern: &str, with_history: bool) -> (Subscription, Vec<Event>) {
        let pattern = TopicPattern::new(pattern);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubQueue {
            state: Mutex::new(QueueState {
                events: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
        });

        let mut state = self.state.lock().expect("event bus poisoned");
        let history = if with_history {
            state
                .history
                .iter()
                .filter(|e| pattern.matches(&e.topic))
                .cloned()
                .collect()
        } else {
            Vec::new()
        };
        state.subscribers.push(AsyncSubscriber {
            id,
            pattern,
            queue: Arc::clone(&queue),
        });

        (Subscription { id, queue }, history)
    }

    /// Register a synchronous subscriber, invoked inline on publish.
    pub fn subscribe_sync(&self, pattern: &str, handler: impl Fn(&Event) + Send + Sync + 'static) {
        let mut state = self.state.lock().expect("event bus poisoned");
        state.sync_subscribers.push(SyncSubscriber {
            pattern: TopicPattern::new(pattern),
            handler: Box::new(handler),
        });
    }

    pub fn subscriber_count(&self) -> usize {
        let state = self.state.lock().expect("event bus poisoned");
        state.subscribers.len() + state.sync_subscribers.len()
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Close the bus: subscribers drain their queues and then observe
    /// end-of-stream.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("event bus poisoned");
        state.closed = true;
        for sub in &state.subscribers {
            let mut queue = sub.queue.state.lock().expect("subscriber queue poisoned");
            queue.closed = true;
            drop(queue);
            sub.queue.notify.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe_ordering() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("task.*");

        bus.publish_json(topics::TASK_CREATED, json!({ "task_id": "CD-001" }));
        bus.publish_json(topics::TASK_CLAIMED, json!({ "task_id": "CD-001" }));
        bus.publish_json("agent.text", json!({ "text": "ignored" }));
        bus.publish_json(topics::TASK_COMPLETED, json!({ "task_id": "CD-001" }));

        assert_eq!(sub.recv().await.unwrap().topic, topics::TASK_CREATED);
        assert_eq!(sub.recv().await.unwrap().topic, topics::TASK_CLAIMED);
        assert_eq!(sub.recv().await.unwrap().topic, topics::TASK_COMPLETED);
    }

    #[tokio::test]
    async fn test_subscribers_see_only_later_events() {
        let bus = EventBus::new();
        bus.publish_json(topics::TASK_CREATED, json!({}));

        let mut sub = bus.subscribe("*");
        bus.publish_json(topics::TASK_CLAIMED, json!({}));
        assert_eq!(sub.recv().await.unwrap().topic, topics::TASK_CLAIMED);
    }

    #[tokio::test]
    async fn test_history_catch_up_has_no_gap_or_duplicate() {
        let bus = EventBus::new();
        bus.publish_json(topics::TASK_CREATED, json!({ "n": 1 }));
        bus.publish_json(topics::TASK_CREATED, json!({ "n": 2 }));

        let (history, mut sub) = bus.subscribe_with_history("task.created");
        assert_eq!(history.len(), 2);

        bus.publish_json(topics::TASK_CREATED, json!({ "n": 3 }));
        let live = sub.recv().await.unwrap();
        assert_eq!(live.payload["n"], 3);
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest_and_reports() {
        let bus = EventBus::with_queue_capacity(2);
        let mut slow = bus.subscribe("task.created");
        let mut watcher = bus.subscribe(topics::EVENTBUS_OVERFLOW);

        for n in 0..4 {
            bus.publish_json(topics::TASK_CREATED, json!({ "n": n }));
        }

        // The oldest two events were dropped.
        assert_eq!(slow.recv().await.unwrap().payload["n"], 2);
        assert_eq!(slow.recv().await.unwrap().payload["n"], 3);

        let overflow = watcher.recv().await.unwrap();
        assert_eq!(overflow.topic, topics::EVENTBUS_OVERFLOW);
        assert_eq!(overflow.payload["pattern"], "task.created");
    }

    #[tokio::test]
    async fn test_sync_subscriber_runs_inline_and_panics_are_isolated() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicU64::new(0));
        let seen_clone = Arc::clone(&seen);

        bus.subscribe_sync("task.*", move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });
        bus.subscribe_sync("task.*", |_| panic!("bad subscriber"));

        bus.publish_json(topics::TASK_CREATED, json!({}));
        bus.publish_json(topics::TASK_COMPLETED, json!({}));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("*");
        bus.publish_json(topics::TASK_CREATED, json!({}));
        bus.close();

        // Queued events still drain, then end-of-stream.
        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let bus = EventBus::new();
        let sub = bus.subscribe("*");
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);

        bus.publish_json(topics::TASK_CREATED, json!({}));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
