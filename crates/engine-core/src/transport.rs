//! Transport layer between producer threads and the session thread
//!
//! Every capability adapter owns one bounded `EventQueue`. Producers push
//! from their own threads; the session thread drains between script turns.
//! A queue is one mutex plus one condition variable, and the lock is held
//! only for the push or pop itself.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tether_protocol::{Event, Handle};

use crate::sync::{CondvarExt, MutexExt};

/// Trait for pushing events towards the session thread
pub trait EventSender: Send + Sync {
    fn send(&self, event: Event) -> Result<(), TransportError>;
}

/// Transport errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Queue closed")]
    Disconnected,
    #[error("Queue full")]
    Full,
    #[error("Producer already sent its close event")]
    ProducerClosed,
}

/// What a producer's push does when the queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backpressure {
    /// Refuse the new event and log it
    #[default]
    Reject,
    /// Evict the oldest queued event to make room
    DropOldest,
    /// Wait for space, then refuse
    Block { timeout_ms: u64 },
}

/// Queue sizing and overflow policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,
    pub backpressure: Backpressure,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            backpressure: Backpressure::Reject,
        }
    }
}

/// Counters exposed for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub queued: usize,
    pub rejected: u64,
    pub evicted: u64,
}

struct QueueState {
    events: VecDeque<Event>,
    closed: bool,
    rejected: u64,
    evicted: u64,
}

/// Bounded, thread-safe FIFO of events
pub struct EventQueue {
    name: String,
    capacity: usize,
    backpressure: Backpressure,
    state: Mutex<QueueState>,
    changed: Condvar,
}

impl EventQueue {
    pub fn new(name: impl Into<String>, config: &QueueConfig) -> Self {
        Self {
            name: name.into(),
            capacity: config.capacity.max(1),
            backpressure: config.backpressure,
            state: Mutex::new(QueueState {
                events: VecDeque::new(),
                closed: false,
                rejected: 0,
                evicted: 0,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn with_capacity(name: impl Into<String>, capacity: usize) -> Self {
        Self::new(
            name,
            &QueueConfig {
                capacity,
                ..QueueConfig::default()
            },
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Push without waiting. Fails when the queue is closed or full.
    pub fn try_push(&self, event: Event) -> Result<(), TransportError> {
        let mut state = self.state.lock_or_recover();
        if state.closed {
            return Err(TransportError::Disconnected);
        }
        if state.events.len() >= self.capacity {
            state.rejected += 1;
            return Err(TransportError::Full);
        }
        state.events.push_back(event);
        drop(state);
        self.changed.notify_all();
        Ok(())
    }

    /// Push without waiting; `false` if the queue is closed or full
    pub fn push(&self, event: Event) -> bool {
        self.try_push(event).is_ok()
    }

    /// Push, waiting up to `timeout` for space
    pub fn push_timeout(&self, event: Event, timeout: Duration) -> Result<(), TransportError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock_or_recover();
        loop {
            if state.closed {
                return Err(TransportError::Disconnected);
            }
            if state.events.len() < self.capacity {
                state.events.push_back(event);
                drop(state);
                self.changed.notify_all();
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                state.rejected += 1;
                return Err(TransportError::Full);
            }
            state = self.changed.wait_timeout_or_recover(state, deadline - now);
        }
    }

    /// Push a producer's final event, ignoring capacity.
    ///
    /// A producer that is shutting down must always be able to announce it.
    pub fn push_terminal(&self, event: Event) -> bool {
        let mut state = self.state.lock_or_recover();
        if state.closed {
            return false;
        }
        state.events.push_back(event);
        drop(state);
        self.changed.notify_all();
        true
    }

    fn push_evicting(&self, event: Event) -> Result<(), TransportError> {
        let mut state = self.state.lock_or_recover();
        if state.closed {
            return Err(TransportError::Disconnected);
        }
        while state.events.len() >= self.capacity {
            // Never evict a close; the producer behind it is gone.
            let Some(pos) = state.events.iter().position(|e| !e.is_terminal()) else {
                state.rejected += 1;
                return Err(TransportError::Full);
            };
            state.events.remove(pos);
            state.evicted += 1;
        }
        state.events.push_back(event);
        drop(state);
        self.changed.notify_all();
        Ok(())
    }

    pub fn pop(&self) -> Option<Event> {
        let event = self.state.lock_or_recover().events.pop_front();
        if event.is_some() {
            self.changed.notify_all();
        }
        event
    }

    /// Lazily drain at most `max_n` events.
    ///
    /// Each step takes the lock for one pop, so producers keep pushing while
    /// the session works through a batch. Call again for more.
    pub fn drain(&self, max_n: usize) -> Drain<'_> {
        Drain {
            queue: self,
            remaining: max_n,
        }
    }

    /// Wait until an event is queued or the queue closes
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock_or_recover();
        loop {
            if !state.events.is_empty() {
                return true;
            }
            if state.closed {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self.changed.wait_timeout_or_recover(state, deadline - now);
        }
    }

    /// Refuse further pushes. Queued events stay drainable.
    pub fn close(&self) {
        self.state.lock_or_recover().closed = true;
        self.changed.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock_or_recover().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock_or_recover().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock_or_recover();
        QueueStats {
            queued: state.events.len(),
            rejected: state.rejected,
            evicted: state.evicted,
        }
    }
}

impl EventSender for EventQueue {
    /// Push according to the queue's backpressure policy
    fn send(&self, event: Event) -> Result<(), TransportError> {
        let result = match self.backpressure {
            Backpressure::Reject => self.try_push(event),
            Backpressure::DropOldest => self.push_evicting(event),
            Backpressure::Block { timeout_ms } => {
                self.push_timeout(event, Duration::from_millis(timeout_ms))
            }
        };
        if result == Err(TransportError::Full) {
            tracing::warn!(queue = %self.name, capacity = self.capacity, "Event rejected, queue full");
        }
        result
    }
}

/// Iterator returned by `EventQueue::drain`
pub struct Drain<'a> {
    queue: &'a EventQueue,
    remaining: usize,
}

impl Iterator for Drain<'_> {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        if self.remaining == 0 {
            return None;
        }
        let event = self.queue.pop()?;
        self.remaining -= 1;
        Some(event)
    }
}

/// Producer-side view of a queue bound to one source handle.
///
/// Enforces that `Close` is the last event the producer emits: once closed,
/// every further push fails. Dropping an open producer sends its close.
pub struct QueueProducer {
    queue: Arc<EventQueue>,
    source: Handle,
    finished: AtomicBool,
    sent: AtomicU64,
}

impl QueueProducer {
    pub fn new(queue: Arc<EventQueue>, source: Handle) -> Self {
        Self {
            queue,
            source,
            finished: AtomicBool::new(false),
            sent: AtomicU64::new(0),
        }
    }

    pub fn source(&self) -> Handle {
        self.source
    }

    pub fn message(&self, payload: impl Into<Vec<u8>>) -> Result<(), TransportError> {
        self.emit(Event::message(self.source, payload))
    }

    pub fn error(&self, detail: impl Into<String>) -> Result<(), TransportError> {
        self.emit(Event::error(self.source, detail))
    }

    pub fn fire(&self) -> Result<(), TransportError> {
        self.emit(Event::Fire {
            source: self.source,
        })
    }

    fn emit(&self, event: Event) -> Result<(), TransportError> {
        if self.finished.load(Ordering::SeqCst) {
            return Err(TransportError::ProducerClosed);
        }
        self.queue.send(event)?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Send the terminal close once; later calls are no-ops returning false
    pub fn close(&self) -> bool {
        if self.finished.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.queue.push_terminal(Event::Close {
            source: self.source,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

impl Drop for QueueProducer {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn h(index: u32) -> Handle {
        Handle::new(index, 1)
    }

    #[test]
    fn push_drain_fifo() {
        let queue = EventQueue::with_capacity("test", 8);
        for i in 0..5u8 {
            assert!(queue.push(Event::message(h(1), vec![i])));
        }
        let first: Vec<_> = queue.drain(3).collect();
        assert_eq!(first.len(), 3);
        assert_eq!(first[0], Event::message(h(1), vec![0]));
        // Restartable: the rest comes out on the next call
        let rest: Vec<_> = queue.drain(10).collect();
        assert_eq!(rest, vec![Event::message(h(1), vec![3]), Event::message(h(1), vec![4])]);
        assert!(queue.drain(10).next().is_none());
    }

    #[test]
    fn full_queue_rejects_without_blocking() {
        let queue = EventQueue::with_capacity("test", 2);
        assert!(queue.push(Event::Tick));
        assert!(queue.push(Event::Tick));
        assert!(!queue.push(Event::Tick));
        assert_eq!(queue.try_push(Event::Tick), Err(TransportError::Full));
        assert_eq!(queue.stats().rejected, 2);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn closed_queue_refuses_pushes_but_drains() {
        let queue = EventQueue::with_capacity("test", 4);
        queue.push(Event::Tick);
        queue.close();
        assert_eq!(queue.try_push(Event::Tick), Err(TransportError::Disconnected));
        assert!(!queue.push_terminal(Event::Close { source: h(1) }));
        assert_eq!(queue.drain(10).count(), 1);
        assert!(!queue.wait(Duration::from_millis(1)));
    }

    #[test]
    fn drop_oldest_policy_keeps_newest() {
        let queue = EventQueue::new(
            "test",
            &QueueConfig {
                capacity: 2,
                backpressure: Backpressure::DropOldest,
            },
        );
        for i in 0..4u8 {
            queue.send(Event::message(h(1), vec![i])).unwrap();
        }
        let events: Vec<_> = queue.drain(10).collect();
        assert_eq!(
            events,
            vec![Event::message(h(1), vec![2]), Event::message(h(1), vec![3])]
        );
        assert_eq!(queue.stats().evicted, 2);
    }

    #[test]
    fn block_policy_waits_for_space() {
        let queue = Arc::new(EventQueue::new(
            "test",
            &QueueConfig {
                capacity: 1,
                backpressure: Backpressure::Block { timeout_ms: 2_000 },
            },
        ));
        queue.send(Event::Tick).unwrap();

        let consumer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                queue.pop()
            })
        };
        queue.send(Event::message(h(1), b"late".to_vec())).unwrap();
        assert_eq!(consumer.join().unwrap(), Some(Event::Tick));
        assert_eq!(queue.pop(), Some(Event::message(h(1), b"late".to_vec())));

        let timed_out = EventQueue::new(
            "test",
            &QueueConfig {
                capacity: 1,
                backpressure: Backpressure::Block { timeout_ms: 5 },
            },
        );
        timed_out.send(Event::Tick).unwrap();
        assert_eq!(timed_out.send(Event::Tick), Err(TransportError::Full));
    }

    #[test]
    fn terminal_push_ignores_capacity() {
        let queue = Arc::new(EventQueue::with_capacity("test", 1));
        let producer = QueueProducer::new(queue.clone(), h(7));
        producer.message(b"a".to_vec()).unwrap();
        assert_eq!(producer.message(b"b".to_vec()), Err(TransportError::Full));
        assert!(producer.close());
        assert!(!producer.close());
        assert_eq!(producer.message(b"c".to_vec()), Err(TransportError::ProducerClosed));

        let events: Vec<_> = queue.drain(10).collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], Event::Close { source: h(7) });
    }

    #[test]
    fn dropped_producer_sends_close() {
        let queue = Arc::new(EventQueue::with_capacity("test", 4));
        {
            let producer = QueueProducer::new(queue.clone(), h(3));
            producer.fire().unwrap();
        }
        let events: Vec<_> = queue.drain(10).collect();
        assert_eq!(events, vec![Event::Fire { source: h(3) }, Event::Close { source: h(3) }]);
    }

    #[test]
    fn fifo_per_producer_under_interleaving() {
        const PRODUCERS: u32 = 4;
        const PER_PRODUCER: u32 = 2_500;

        let queue = Arc::new(EventQueue::with_capacity("fifo", 64));
        let mut threads = Vec::new();
        for p in 0..PRODUCERS {
            let queue = queue.clone();
            threads.push(std::thread::spawn(move || {
                for seq in 0..PER_PRODUCER {
                    let event = Event::message(h(p), seq.to_le_bytes().to_vec());
                    // Spin on backpressure; never drop
                    while !queue.push(event.clone()) {
                        std::thread::yield_now();
                    }
                }
            }));
        }

        let mut last_seen: HashMap<u32, i64> = HashMap::new();
        let mut total = 0u32;
        while total < PRODUCERS * PER_PRODUCER {
            for event in queue.drain(32) {
                let Event::Message { source, payload } = event else {
                    panic!("unexpected event");
                };
                let seq = u32::from_le_bytes(payload[..4].try_into().unwrap()) as i64;
                let last = last_seen.entry(source.index()).or_insert(-1);
                assert_eq!(seq, *last + 1, "producer {} out of order", source.index());
                *last = seq;
                total += 1;
            }
            queue.wait(Duration::from_millis(10));
        }

        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(total, 10_000);
        assert!(queue.is_empty());
    }
}
