// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{Envelope, Event};

/// Dispatcher tick period.  Chosen to coalesce bursts into one frame of a
/// 60 Hz frontend.
pub const TICK: Duration = Duration::from_millis(16);
/// Maximum events delivered per tick.
pub const MAX_BATCH: usize = 100;
/// Queue occupancy above which a warning metric is logged.
pub const QUEUE_WARN_THRESHOLD: usize = 10_000;

type Filter = Box<dyn Fn(&Envelope) -> bool + Send + Sync>;
type Handler = Box<dyn Fn(&Envelope) + Send + Sync>;

struct Subscriber {
    filter: Option<Filter>,
    handler: Handler,
}

struct Shared {
    subs: RwLock<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    depth: AtomicUsize,
}

/// Cheaply clonable handle to the process-wide event bus.
///
/// `publish` enqueues and returns immediately; a background task delivers
/// batched events to subscribers.  Delivery is FIFO within one event type
/// for a given subscriber (the queue is globally FIFO); there is no
/// ordering guarantee across types.  A panicking handler is caught and
/// logged without affecting other handlers or the publisher.
#[derive(Clone)]
pub struct EventBus {
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl EventBus {
    /// Create a bus and spawn its dispatcher task on the current runtime.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            subs: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            depth: AtomicUsize::new(0),
        });
        tokio::spawn(dispatch_loop(rx, Arc::clone(&shared)));
        Self { shared, tx }
    }

    /// Enqueue an event.  Never blocks; never fails while the bus is alive.
    pub fn publish(&self, source: &str, event: Event) {
        let depth = self.shared.depth.fetch_add(1, Ordering::Relaxed) + 1;
        if depth == QUEUE_WARN_THRESHOLD {
            warn!(depth, "event queue occupancy above threshold; coalescing will apply");
        }
        let _ = self.tx.send(Envelope::new(source, event));
    }

    /// Register a handler for every event.  Dropping the returned guard
    /// unsubscribes immediately; events published afterwards are not
    /// delivered to it.
    pub fn subscribe<H>(&self, handler: H) -> Subscription
    where
        H: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.add(None, Box::new(handler))
    }

    /// Register a handler gated by a predicate.
    pub fn subscribe_filtered<F, H>(&self, filter: F, handler: H) -> Subscription
    where
        F: Fn(&Envelope) -> bool + Send + Sync + 'static,
        H: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.add(Some(Box::new(filter)), Box::new(handler))
    }

    /// Channel subscription: returns the guard plus a receiver yielding
    /// every envelope that passes the filter.  This is the surface behind
    /// the chat API's "run → stream of events".
    pub fn subscribe_channel<F>(
        &self,
        filter: F,
    ) -> (Subscription, mpsc::UnboundedReceiver<Envelope>)
    where
        F: Fn(&Envelope) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = self.subscribe_filtered(filter, move |env| {
            let _ = tx.send(env.clone());
        });
        (sub, rx)
    }

    /// Convenience: channel subscription scoped to one session.
    pub fn subscribe_session(
        &self,
        session_id: &str,
    ) -> (Subscription, mpsc::UnboundedReceiver<Envelope>) {
        let sid = session_id.to_string();
        self.subscribe_channel(move |env| env.session_id.as_deref() == Some(sid.as_str()))
    }

    fn add(&self, filter: Option<Filter>, handler: Handler) -> Subscription {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared
            .subs
            .write()
            .unwrap()
            .insert(id, Subscriber { filter, handler });
        Subscription {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Current queue occupancy (approximate).
    pub fn queue_depth(&self) -> usize {
        self.shared.depth.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard returned by the subscribe family; dropping it releases the
/// handler immediately.
pub struct Subscription {
    id: u64,
    shared: Weak<Shared>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.subs.write().unwrap().remove(&self.id);
        }
    }
}

async fn dispatch_loop(mut rx: mpsc::UnboundedReceiver<Envelope>, shared: Arc<Shared>) {
    let mut interval = tokio::time::interval(TICK);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;

        let mut batch: Vec<Envelope> = Vec::new();
        let mut disconnected = false;
        while batch.len() < MAX_BATCH {
            match rx.try_recv() {
                Ok(env) => {
                    shared.depth.fetch_sub(1, Ordering::Relaxed);
                    batch.push(env);
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    disconnected = true;
                    break;
                }
            }
        }

        if !batch.is_empty() {
            coalesce_stream_chunks(&mut batch);
            deliver(&shared, &batch);
        }

        if disconnected {
            debug!("event bus closed; dispatcher exiting");
            return;
        }
    }
}

/// Merge consecutive stream-chunk events for the same (session, message,
/// cursor kind) into one, concatenating their deltas.  Safe because chunk
/// consumers only ever append.
fn coalesce_stream_chunks(batch: &mut Vec<Envelope>) {
    let mut out: Vec<Envelope> = Vec::with_capacity(batch.len());
    for env in batch.drain(..) {
        if let (
            Some(Envelope {
                event:
                    Event::StreamChunk {
                        session_id: ls,
                        message_id: lm,
                        kind: lk,
                        delta: last_delta,
                    },
                ..
            }),
            Event::StreamChunk {
                session_id,
                message_id,
                kind,
                delta,
            },
        ) = (out.last_mut(), &env.event)
        {
            if ls == session_id && lm == message_id && lk == kind {
                last_delta.push_str(delta);
                continue;
            }
        }
        out.push(env);
    }
    *batch = out;
}

fn deliver(shared: &Shared, batch: &[Envelope]) {
    let subs = shared.subs.read().unwrap();
    for env in batch {
        for (id, sub) in subs.iter() {
            if let Some(filter) = &sub.filter {
                if !filter(env) {
                    continue;
                }
            }
            let result =
                std::panic::catch_unwind(AssertUnwindSafe(|| (sub.handler)(env)));
            if result.is_err() {
                warn!(subscriber = id, event = env.event.kind(), "event handler panicked");
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn session_event(id: &str) -> Event {
        Event::SessionCreated {
            session_id: id.into(),
        }
    }

    async fn recv_one(
        rx: &mut mpsc::UnboundedReceiver<Envelope>,
    ) -> Option<Envelope> {
        tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = EventBus::new();
        let (_sub, mut rx) = bus.subscribe_channel(|_| true);
        bus.publish("test", session_event("s1"));
        let env = recv_one(&mut rx).await.expect("event delivered");
        assert_eq!(env.session_id.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn dropped_subscription_stops_delivery() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let sub = bus.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        drop(sub);
        bus.publish("test", session_event("s1"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn filter_scopes_delivery_to_session() {
        let bus = EventBus::new();
        let (_sub, mut rx) = bus.subscribe_session("wanted");
        bus.publish("test", session_event("other"));
        bus.publish("test", session_event("wanted"));
        let env = recv_one(&mut rx).await.expect("event delivered");
        assert_eq!(env.session_id.as_deref(), Some("wanted"));
        // Only the matching event arrives.
        assert!(
            tokio::time::timeout(Duration::from_millis(60), rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn fifo_within_one_event_type() {
        let bus = EventBus::new();
        let (_sub, mut rx) = bus.subscribe_channel(|_| true);
        for i in 0..10 {
            bus.publish("test", session_event(&format!("s{i}")));
        }
        for i in 0..10 {
            let env = recv_one(&mut rx).await.expect("event delivered");
            assert_eq!(env.session_id.as_deref(), Some(format!("s{i}").as_str()));
        }
    }

    #[tokio::test]
    async fn panicking_handler_does_not_poison_others() {
        let bus = EventBus::new();
        let _bad = bus.subscribe(|_| panic!("boom"));
        let (_sub, mut rx) = bus.subscribe_channel(|_| true);
        bus.publish("test", session_event("s1"));
        assert!(recv_one(&mut rx).await.is_some());
    }

    #[tokio::test]
    async fn consecutive_stream_chunks_coalesce() {
        let mut batch = vec![
            Envelope::new(
                "t",
                Event::StreamChunk {
                    session_id: "s".into(),
                    message_id: "m".into(),
                    kind: crate::ChunkKind::Text,
                    delta: "he".into(),
                },
            ),
            Envelope::new(
                "t",
                Event::StreamChunk {
                    session_id: "s".into(),
                    message_id: "m".into(),
                    kind: crate::ChunkKind::Text,
                    delta: "llo".into(),
                },
            ),
            Envelope::new("t", session_event("s")),
        ];
        coalesce_stream_chunks(&mut batch);
        assert_eq!(batch.len(), 2);
        match &batch[0].event {
            Event::StreamChunk { delta, .. } => assert_eq!(delta, "hello"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn chunks_for_different_messages_do_not_merge() {
        let mk = |m: &str| {
            Envelope::new(
                "t",
                Event::StreamChunk {
                    session_id: "s".into(),
                    message_id: m.into(),
                    kind: crate::ChunkKind::Text,
                    delta: "x".into(),
                },
            )
        };
        let mut batch = vec![mk("m1"), mk("m2")];
        coalesce_stream_chunks(&mut batch);
        assert_eq!(batch.len(), 2);
    }
}
