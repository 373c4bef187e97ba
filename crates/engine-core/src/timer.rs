//! Timer thread for script timers
//!
//! One thread per timer adapter waits on a condition variable for the
//! earliest deadline instead of polling, fires due timers into the
//! adapter's queue and follows one-shot and cancelled timers with `Close`.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tether_policy::CancellationToken;
use tether_protocol::{Event, Handle};

use crate::adapter::{ProducerSet, POLL_INTERVAL};
use crate::sync::{CondvarExt, MutexExt};
use crate::transport::{EventQueue, EventSender, TransportError};

/// Shortest period accepted for repeating timers
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Deadlines past the clock's range are clamped this far out
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// Entry in the timer heap
struct TimerEntry {
    due: Instant,
    seq: u64,
    source: Handle,
    period: Option<Duration>,
}

// Reverse ordering for min-heap (earliest deadline first)
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

struct TimerState {
    heap: BinaryHeap<TimerEntry>,
    next_seq: u64,
}

struct Shared {
    state: Mutex<TimerState>,
    notify: Condvar,
    queue: Arc<EventQueue>,
}

/// Schedules timers and owns the thread that fires them
pub struct TimerService {
    shared: Arc<Shared>,
    token: CancellationToken,
}

impl TimerService {
    /// Start the timer thread as one of `producers`
    pub fn spawn(producers: &ProducerSet, queue: Arc<EventQueue>) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(TimerState {
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
            notify: Condvar::new(),
            queue,
        });
        let thread_shared = shared.clone();
        let token = producers.spawn("timer", move |token| run_loop(&thread_shared, &token))?;
        Ok(Self { shared, token })
    }

    /// Fire `source` after `delay`, then every `period` if given
    pub fn schedule(&self, source: Handle, delay: Duration, period: Option<Duration>) {
        let mut state = self.shared.state.lock_or_recover();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(TimerEntry {
            due: deadline_after(Instant::now(), delay),
            seq,
            source,
            period: period.map(|p| p.max(MIN_PERIOD)),
        });
        drop(state);
        tracing::debug!(%source, ?delay, ?period, "Timer scheduled");
        self.shared.notify.notify_all();
    }

    /// Drop a pending timer and announce its end with `Close`
    pub fn cancel(&self, source: Handle) -> bool {
        let removed = {
            let mut state = self.shared.state.lock_or_recover();
            let before = state.heap.len();
            state.heap.retain(|entry| entry.source != source);
            state.heap.len() != before
        };
        if removed {
            self.shared.queue.push_terminal(Event::Close { source });
            self.shared.notify.notify_all();
        }
        removed
    }

    pub fn pending(&self) -> usize {
        self.shared.state.lock_or_recover().heap.len()
    }

    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled()
    }
}

fn deadline_after(from: Instant, delay: Duration) -> Instant {
    from.checked_add(delay)
        .or_else(|| from.checked_add(FAR_FUTURE))
        .unwrap_or(from)
}

fn run_loop(shared: &Shared, token: &CancellationToken) {
    let mut state = shared.state.lock_or_recover();
    loop {
        if token.is_cancelled() {
            break;
        }

        let now = Instant::now();
        while state.heap.peek().is_some_and(|entry| entry.due <= now) {
            let Some(mut entry) = state.heap.pop() else {
                break;
            };
            match shared.queue.send(Event::Fire {
                source: entry.source,
            }) {
                Ok(()) => match entry.period {
                    Some(period) => {
                        entry.due = deadline_after(entry.due, period).max(now);
                        state.heap.push(entry);
                    }
                    None => {
                        shared.queue.push_terminal(Event::Close {
                            source: entry.source,
                        });
                    }
                },
                Err(TransportError::Full) => {
                    // Retry after the session catches up
                    entry.due = now + POLL_INTERVAL;
                    state.heap.push(entry);
                }
                Err(e) => {
                    tracing::debug!(source = %entry.source, error = %e, "Timer queue gone, stopping");
                    return;
                }
            }
        }

        let wait = state
            .heap
            .peek()
            .map_or(POLL_INTERVAL, |next| next.due.saturating_duration_since(now))
            .min(POLL_INTERVAL);
        state = shared.notify.wait_timeout_or_recover(state, wait);
    }

    // Every timer still pending ends with its close
    for entry in state.heap.drain() {
        shared.queue.push_terminal(Event::Close {
            source: entry.source,
        });
    }
    tracing::debug!("Timer thread shutting down");
}
