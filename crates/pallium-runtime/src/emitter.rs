//! Per-turn event emitter.
//!
//! One emitter per turn. `emit` is non-blocking and thread-safe: it assigns
//! the next sequence number and fans the event out to every subscriber's
//! bounded queue. When a queue is full the oldest *droppable* event
//! (`delta_thinking`, `assistant_delta`, `log`) is discarded and a single
//! coalesced `overflow{dropped}` marker takes the first dropped event's
//! place, inheriting its sequence number. Backpressure is strictly
//! per-subscriber: a drop in one queue never consumes a turn-wide sequence
//! number, so other subscribers stay gap-free. Lifecycle events are never
//! dropped, even if that temporarily exceeds the buffer bound.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

use pallium_core::events::{EventBody, LogLevel, TurnEvent};

#[derive(Debug)]
struct Subscriber {
    queue: Mutex<VecDeque<TurnEvent>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
}

impl Subscriber {
    fn push(&self, event: TurnEvent) {
        let mut queue = self.queue.lock();

        if queue.len() >= self.capacity {
            if let Some(victim) = queue.iter().position(|e| e.body.is_droppable()) {
                let has_marker = queue
                    .iter()
                    .any(|e| matches!(e.body, EventBody::Overflow { .. }));
                if has_marker {
                    let _ = queue.remove(victim);
                    if let Some(EventBody::Overflow { dropped }) = queue
                        .iter_mut()
                        .find(|e| matches!(e.body, EventBody::Overflow { .. }))
                        .map(|e| &mut e.body)
                    {
                        *dropped += 1;
                    }
                } else if let Some(slot) = queue.get_mut(victim) {
                    // The marker takes the dropped event's place and seq;
                    // no turn-wide sequence number is consumed, so other
                    // subscribers see no gap.
                    slot.body = EventBody::Overflow { dropped: 1 };
                }
                queue.push_back(event);
                drop(queue);
                self.notify.notify_waiters();
                return;
            }
            // Nothing droppable: exceed the bound rather than lose a
            // lifecycle event.
        }

        queue.push_back(event);
        drop(queue);
        self.notify.notify_waiters();
    }
}

struct EmitterInner {
    seq: u64,
    subscribers: Vec<Arc<Subscriber>>,
}

/// Thread-safe, non-blocking event emitter for one turn.
pub struct TurnEmitter {
    turn_id: String,
    capacity: usize,
    inner: Mutex<EmitterInner>,
}

impl TurnEmitter {
    /// Create an emitter for `turn_id` with the given per-subscriber buffer.
    #[must_use]
    pub fn new(turn_id: impl Into<String>, capacity: usize) -> Self {
        Self {
            turn_id: turn_id.into(),
            capacity: capacity.max(1),
            inner: Mutex::new(EmitterInner {
                seq: 0,
                subscribers: Vec::new(),
            }),
        }
    }

    /// The turn this emitter serves.
    #[must_use]
    pub fn turn_id(&self) -> &str {
        &self.turn_id
    }

    /// Sequence number of the most recently emitted event.
    #[must_use]
    pub fn last_seq(&self) -> u64 {
        self.inner.lock().seq
    }

    /// Subscribe; receives every event emitted after this call.
    #[must_use]
    pub fn subscribe(&self) -> EventSubscription {
        let subscriber = Arc::new(Subscriber {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: self.capacity,
            closed: AtomicBool::new(false),
        });
        self.inner.lock().subscribers.push(Arc::clone(&subscriber));
        EventSubscription { subscriber }
    }

    /// Emit an event to all subscribers. Never blocks.
    pub fn emit(&self, body: EventBody) {
        let mut inner = self.inner.lock();
        inner.seq += 1;
        let event = TurnEvent::now(inner.seq, &self.turn_id, body);
        trace!(turn_id = %self.turn_id, seq = event.seq, kind = event.kind(), "emit");

        for subscriber in &inner.subscribers {
            subscriber.push(event.clone());
        }
    }

    /// Emit a `log` event.
    pub fn log(&self, level: LogLevel, source: &str, message: impl Into<String>) {
        self.emit(EventBody::Log {
            level,
            source: source.to_owned(),
            message: message.into(),
        });
    }

    /// Close the stream: subscribers drain whatever is queued, then end.
    pub fn close(&self) {
        let inner = self.inner.lock();
        for subscriber in &inner.subscribers {
            subscriber.closed.store(true, Ordering::SeqCst);
            subscriber.notify.notify_waiters();
        }
    }
}

/// Receiving end of a turn's event stream.
#[derive(Debug)]
pub struct EventSubscription {
    subscriber: Arc<Subscriber>,
}

impl EventSubscription {
    /// Receive the next event, or `None` once the emitter is closed and the
    /// queue is drained.
    pub async fn recv(&mut self) -> Option<TurnEvent> {
        loop {
            let notified = self.subscriber.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking, so a push between the check
            // and the await still wakes us.
            notified.as_mut().enable();

            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            if self.subscriber.closed.load(Ordering::SeqCst) {
                // Re-check: an event may have landed between the pop and the
                // closed read.
                return self.try_recv();
            }
            notified.as_mut().await;
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Option<TurnEvent> {
        self.subscriber.queue.lock().pop_front()
    }

    /// Drain the stream to completion (test helper).
    pub async fn collect_all(mut self) -> Vec<TurnEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.recv().await {
            events.push(event);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(text: &str) -> EventBody {
        EventBody::DeltaThinking { text: text.into() }
    }

    #[tokio::test]
    async fn seq_starts_at_one_and_is_contiguous() {
        let emitter = TurnEmitter::new("turn_1", 64);
        let mut sub = emitter.subscribe();
        emitter.emit(EventBody::AssistantStreamStart {});
        emitter.emit(delta("a"));
        emitter.emit(EventBody::AssistantStreamEnd {
            text_total: "a".into(),
        });
        emitter.close();

        let mut seqs = Vec::new();
        while let Some(event) = sub.recv().await {
            assert_eq!(event.turn_id, "turn_1");
            seqs.push(event.seq);
        }
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn subscriber_sees_only_later_events() {
        let emitter = TurnEmitter::new("turn_1", 64);
        emitter.emit(delta("before"));
        let mut sub = emitter.subscribe();
        emitter.emit(delta("after"));
        emitter.close();

        let event = sub.recv().await.unwrap();
        assert_eq!(event.seq, 2);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn overflow_replaces_oldest_droppable_with_marker() {
        let emitter = TurnEmitter::new("turn_1", 2);
        let sub = emitter.subscribe();
        emitter.emit(delta("one"));
        emitter.emit(delta("two"));
        emitter.emit(delta("three")); // "one" becomes the overflow marker
        emitter.close();

        let events = sub.collect_all().await;
        let kinds: Vec<&str> = events.iter().map(TurnEvent::kind).collect();
        assert_eq!(kinds, vec!["overflow", "delta_thinking", "delta_thinking"]);
        // The marker inherits the dropped event's seq; the stream stays
        // strictly increasing and contiguous.
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        match &events[0].body {
            EventBody::Overflow { dropped } => assert_eq!(*dropped, 1),
            other => panic!("unexpected {other:?}"),
        }
        match &events[1].body {
            EventBody::DeltaThinking { text } => assert_eq!(text, "two"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn overflow_marker_is_coalesced() {
        let emitter = TurnEmitter::new("turn_1", 2);
        let sub = emitter.subscribe();
        for i in 0..6 {
            emitter.emit(delta(&format!("d{i}")));
        }
        emitter.close();

        let events = sub.collect_all().await;
        let overflows: Vec<u64> = events
            .iter()
            .filter_map(|e| match e.body {
                EventBody::Overflow { dropped } => Some(dropped),
                _ => None,
            })
            .collect();
        assert_eq!(overflows.len(), 1, "one coalesced overflow marker");
        assert_eq!(overflows[0], 4);
    }

    #[tokio::test]
    async fn lifecycle_events_never_dropped() {
        let emitter = TurnEmitter::new("turn_1", 2);
        let sub = emitter.subscribe();
        emitter.emit(EventBody::AssistantStreamStart {});
        emitter.emit(EventBody::NodeStart {
            stage_id: "answer".into(),
            role_key: "answer".into(),
        });
        // Queue full of lifecycle events; this one must still land.
        emitter.emit(EventBody::WorldCommit {
            diff: pallium_core::world::WorldDiff::default(),
        });
        emitter.close();

        let events = sub.collect_all().await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].kind(), "world_commit");
    }

    #[tokio::test]
    async fn droppable_dropped_before_lifecycle() {
        let emitter = TurnEmitter::new("turn_1", 2);
        let sub = emitter.subscribe();
        emitter.emit(delta("droppable"));
        emitter.emit(EventBody::AssistantStreamStart {});
        emitter.emit(EventBody::AssistantStreamEnd {
            text_total: String::new(),
        });
        emitter.close();

        let events = sub.collect_all().await;
        let kinds: Vec<&str> = events.iter().map(TurnEvent::kind).collect();
        assert_eq!(
            kinds,
            vec!["overflow", "assistant_stream_start", "assistant_stream_end"]
        );
    }

    #[tokio::test]
    async fn overflow_in_one_subscriber_leaves_others_contiguous() {
        let emitter = TurnEmitter::new("turn_1", 2);
        let stalled = emitter.subscribe();
        let mut draining = emitter.subscribe();

        let mut drained_seqs = Vec::new();
        for i in 0..5 {
            emitter.emit(delta(&format!("d{i}")));
            // This subscriber keeps up, so it never drops.
            while let Some(event) = draining.try_recv() {
                drained_seqs.push(event.seq);
            }
        }
        emitter.close();

        // The keeping-up subscriber saw every event, gap-free, even though
        // the stalled one overflowed during the same emits.
        assert_eq!(drained_seqs, vec![1, 2, 3, 4, 5]);
        assert_eq!(emitter.last_seq(), 5, "drops mint no sequence numbers");

        // The stalled subscriber coalesced its drops into one marker and
        // its stream is still strictly increasing.
        let events = stalled.collect_all().await;
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert!(seqs.windows(2).all(|w| w[1] > w[0]));
        let dropped: u64 = events
            .iter()
            .filter_map(|e| match e.body {
                EventBody::Overflow { dropped } => Some(dropped),
                _ => None,
            })
            .sum();
        assert_eq!(dropped, 3);
        assert_eq!(events.len(), 3);
    }

    #[tokio::test]
    async fn multiple_subscribers_get_same_events() {
        let emitter = TurnEmitter::new("turn_1", 64);
        let sub_a = emitter.subscribe();
        let sub_b = emitter.subscribe();
        emitter.emit(delta("x"));
        emitter.close();

        let a = sub_a.collect_all().await;
        let b = sub_b.collect_all().await;
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn recv_wakes_on_emit() {
        let emitter = Arc::new(TurnEmitter::new("turn_1", 64));
        let mut sub = emitter.subscribe();

        let emitter_task = Arc::clone(&emitter);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            emitter_task.emit(delta("wake"));
        });

        let event = sub.recv().await.unwrap();
        assert_eq!(event.kind(), "delta_thinking");
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn log_helper_emits_log_event() {
        let emitter = TurnEmitter::new("turn_1", 64);
        let sub = emitter.subscribe();
        emitter.log(LogLevel::Info, "graph", "hello");
        emitter.close();
        let events = sub.collect_all().await;
        match &events[0].body {
            EventBody::Log {
                level,
                source,
                message,
            } => {
                assert_eq!(*level, LogLevel::Info);
                assert_eq!(source, "graph");
                assert_eq!(message, "hello");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
