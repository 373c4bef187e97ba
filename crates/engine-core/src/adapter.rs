//! Adapter lifecycle and the background producer threads adapters own
//!
//! - Lifecycle: `Idle → Active → Draining → Closed`, one per adapter
//! - Producers: named threads that observe a cancellation token within one
//!   poll interval and are joined with a bounded wait on shutdown

use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tether_policy::CancellationToken;

use crate::sync::MutexExt;

/// Longest a producer may go without checking its token
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Default bounded wait when joining producers
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Adapter state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    /// Installed, nothing running yet
    Idle,
    /// At least one producer or registration exists
    Active,
    /// Shutting down; producers cancelled, no new work accepted
    Draining,
    Closed,
}

/// Lifecycle state machine shared by every adapter
pub struct AdapterLifecycle {
    name: &'static str,
    state: Mutex<AdapterState>,
}

impl AdapterLifecycle {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(AdapterState::Idle),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> AdapterState {
        *self.state.lock_or_recover()
    }

    /// Whether new work (connections, timers, callbacks) may start
    pub fn accepts_work(&self) -> bool {
        matches!(self.state(), AdapterState::Idle | AdapterState::Active)
    }

    /// Mark the adapter active; false once it is draining or closed
    pub fn activate(&self) -> bool {
        let mut state = self.state.lock_or_recover();
        match *state {
            AdapterState::Idle => {
                tracing::debug!(adapter = self.name, "Adapter active");
                *state = AdapterState::Active;
                true
            }
            AdapterState::Active => true,
            AdapterState::Draining | AdapterState::Closed => false,
        }
    }

    /// Stop accepting work; returns false if already draining or closed
    pub fn begin_drain(&self) -> bool {
        let mut state = self.state.lock_or_recover();
        match *state {
            AdapterState::Idle | AdapterState::Active => {
                tracing::debug!(adapter = self.name, from = ?*state, "Adapter draining");
                *state = AdapterState::Draining;
                true
            }
            AdapterState::Draining | AdapterState::Closed => false,
        }
    }

    pub fn finish(&self) {
        let mut state = self.state.lock_or_recover();
        if *state != AdapterState::Closed {
            tracing::debug!(adapter = self.name, "Adapter closed");
            *state = AdapterState::Closed;
        }
    }
}

struct Producer {
    label: String,
    token: CancellationToken,
    thread: JoinHandle<()>,
}

/// Background threads owned by one adapter
pub struct ProducerSet {
    name: &'static str,
    stopped: CancellationToken,
    producers: Mutex<Vec<Producer>>,
}

impl ProducerSet {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            stopped: CancellationToken::new(),
            producers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn a producer thread.
    ///
    /// The closure receives its own token; the returned clone lets the
    /// adapter stop that one producer early.
    pub fn spawn<F>(&self, label: impl Into<String>, body: F) -> std::io::Result<CancellationToken>
    where
        F: FnOnce(CancellationToken) + Send + 'static,
    {
        let label = label.into();
        if self.stopped.is_cancelled() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("{} producers are shut down", self.name),
            ));
        }

        self.reap();

        let token = CancellationToken::new();
        let thread_token = token.clone();
        let thread = std::thread::Builder::new()
            .name(format!("tether-{}-{label}", self.name))
            .spawn(move || body(thread_token))?;

        tracing::debug!(adapter = self.name, producer = %label, "Producer started");
        self.producers.lock_or_recover().push(Producer {
            label,
            token: token.clone(),
            thread,
        });
        Ok(token)
    }

    /// Join producers that already exited
    pub fn reap(&self) {
        let finished: Vec<Producer> = {
            let mut producers = self.producers.lock_or_recover();
            let (done, running) = producers.drain(..).partition(|p| p.thread.is_finished());
            *producers = running;
            done
        };
        for producer in finished {
            join(self.name, producer);
        }
    }

    /// Producers still running
    pub fn running(&self) -> usize {
        self.producers
            .lock_or_recover()
            .iter()
            .filter(|p| !p.thread.is_finished())
            .count()
    }

    /// Cancel every producer and join them, waiting at most `timeout`.
    ///
    /// Returns how many producers had to be left behind.
    pub fn shutdown(&self, timeout: Duration) -> usize {
        self.stopped.cancel();
        let producers: Vec<Producer> = self.producers.lock_or_recover().drain(..).collect();
        for producer in &producers {
            producer.token.cancel();
        }

        let deadline = Instant::now() + timeout;
        let mut pending = producers;
        while !pending.is_empty() && Instant::now() < deadline {
            let (done, running): (Vec<_>, Vec<_>) =
                pending.into_iter().partition(|p| p.thread.is_finished());
            for producer in done {
                join(self.name, producer);
            }
            pending = running;
            if !pending.is_empty() {
                std::thread::sleep(Duration::from_millis(5));
            }
        }

        for producer in &pending {
            tracing::warn!(
                adapter = self.name,
                producer = %producer.label,
                "Producer did not stop in time, detaching"
            );
        }
        pending.len()
    }
}

impl Drop for ProducerSet {
    fn drop(&mut self) {
        self.shutdown(JOIN_TIMEOUT);
    }
}

fn join(adapter: &str, producer: Producer) {
    if producer.thread.join().is_err() {
        tracing::warn!(adapter, producer = %producer.label, "Producer thread panicked");
    } else {
        tracing::debug!(adapter, producer = %producer.label, "Producer joined");
    }
}

/// Sleep up to `total`, waking every poll interval to check `token`.
///
/// Returns false if the token was cancelled.
pub fn sleep_cancellable(token: &CancellationToken, total: Duration) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if token.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(POLL_INTERVAL));
    }
}
