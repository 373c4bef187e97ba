//! Runtime: one thread per session
//!
//! A `Session` never leaves the thread that opened it. Callers talk to it
//! through a request channel; each request carries a oneshot reply, so the
//! same worker serves blocking and async callers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_engine_core::MutexExt;
use tether_policy::{CancellationToken, Limits};
use tether_protocol::{ScriptValue, SessionId};
use tokio::sync::oneshot;

use crate::{BridgeError, CompiledUnit, PumpReport, Session, SessionBuilder, SessionConfig};

/// Events dispatched per idle auto-pump
pub const AUTO_PUMP_BATCH: usize = 64;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Applied to every session the runtime opens
    pub session: SessionConfig,
    /// Pump idle sessions at this interval; `None` leaves pumping to the host
    pub auto_pump_interval_ms: Option<u64>,
}

type Reply<T> = oneshot::Sender<Result<T, BridgeError>>;
type Setup = Box<dyn FnOnce(SessionBuilder) -> SessionBuilder + Send>;

enum Request {
    Execute {
        unit: CompiledUnit,
        reply: Reply<Vec<ScriptValue>>,
    },
    Pump {
        max_events: usize,
        reply: Reply<PumpReport>,
    },
    Configure {
        limits: Limits,
        reply: Reply<()>,
    },
    Call(Box<dyn FnOnce(&Session) + Send>),
    Close {
        reply: Reply<()>,
    },
}

struct Worker {
    requests: Sender<Request>,
    /// Requests sent and not yet finished
    inflight: Arc<AtomicUsize>,
    cancel: CancellationToken,
    thread: JoinHandle<()>,
}

impl Worker {
    fn send(&self, id: SessionId, request: Request) -> Result<(), BridgeError> {
        self.inflight.fetch_add(1, Ordering::SeqCst);
        self.requests.send(request).map_err(|_| {
            self.inflight.fetch_sub(1, Ordering::SeqCst);
            BridgeError::InvalidSession(id)
        })
    }

    /// Send only if nothing is queued or running
    fn send_exclusive(&self, id: SessionId, request: Request) -> Result<(), BridgeError> {
        if self
            .inflight
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(BridgeError::SessionBusy);
        }
        self.requests.send(request).map_err(|_| {
            self.inflight.fetch_sub(1, Ordering::SeqCst);
            BridgeError::InvalidSession(id)
        })
    }

    /// Close the session and join its thread. Safe to call from async
    /// code: the reply is read only after the join.
    fn stop(self, id: SessionId) -> Result<(), BridgeError> {
        let (reply, mut done) = oneshot::channel();
        self.cancel.cancel();
        let sent = self.send(id, Request::Close { reply });
        drop(self.requests);
        if self.thread.join().is_err() {
            tracing::warn!(session = %id, "Session thread panicked");
        }
        sent?;
        done.try_recv()
            .unwrap_or(Err(BridgeError::InvalidSession(id)))
    }
}

/// Owns every session opened through it
pub struct Runtime {
    config: RuntimeConfig,
    sessions: Mutex<HashMap<SessionId, Worker>>,
    last_error: Mutex<String>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
            last_error: Mutex::new(String::new()),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Open a session with the bundled capabilities
    pub fn open(&self) -> Result<SessionId, BridgeError> {
        self.open_with(|builder| builder)
    }

    /// Open a session, letting `setup` add sinks, backends or capabilities
    /// on the session thread before it opens
    pub fn open_with(
        &self,
        setup: impl FnOnce(SessionBuilder) -> SessionBuilder + Send + 'static,
    ) -> Result<SessionId, BridgeError> {
        let result = self.spawn_worker(Box::new(setup));
        self.record(result)
    }

    fn spawn_worker(&self, setup: Setup) -> Result<SessionId, BridgeError> {
        let (requests, inbox) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        let inflight = Arc::new(AtomicUsize::new(0));
        let config = self.config.session.clone();
        let auto_pump = self.config.auto_pump_interval_ms.map(Duration::from_millis);

        let worker_inflight = inflight.clone();
        let thread = std::thread::Builder::new()
            .name("tether-session".into())
            .spawn(move || {
                let session = match setup(Session::builder(config)).open() {
                    Ok(session) => session,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if ready_tx
                    .send(Ok((session.id(), session.cancellation_token())))
                    .is_err()
                {
                    return;
                }
                serve(&session, &inbox, &worker_inflight, auto_pump);
                if !session.is_closed() {
                    let _ = session.close();
                }
            })
            .map_err(|e| BridgeError::InitFailed(format!("cannot spawn session thread: {e}")))?;

        let (id, cancel) = match ready_rx.recv() {
            Ok(Ok(ready)) => ready,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(BridgeError::InitFailed("session thread exited".into()));
            }
        };

        self.sessions.lock_or_recover().insert(
            id,
            Worker {
                requests,
                inflight,
                cancel,
                thread,
            },
        );
        tracing::debug!(session = %id, "Session thread started");
        Ok(id)
    }

    /// Ids of the open sessions
    pub fn sessions(&self) -> Vec<SessionId> {
        self.sessions.lock_or_recover().keys().copied().collect()
    }

    /// Whether a request is queued or running on the session
    pub fn is_busy(&self, id: SessionId) -> bool {
        self.sessions
            .lock_or_recover()
            .get(&id)
            .is_some_and(|w| w.inflight.load(Ordering::SeqCst) > 0)
    }

    /// Run `unit` and wait for its results.
    ///
    /// Blocks the calling thread; async callers use `execute_async`.
    pub fn execute(&self, id: SessionId, unit: &CompiledUnit) -> Result<Vec<ScriptValue>, BridgeError> {
        let result = self
            .submit(id, false, |reply| Request::Execute {
                unit: unit.clone(),
                reply,
            })
            .and_then(|rx| wait(id, rx));
        self.record(result)
    }

    /// `execute`, refused with `SessionBusy` while the session is occupied
    pub fn try_execute(
        &self,
        id: SessionId,
        unit: &CompiledUnit,
    ) -> Result<Vec<ScriptValue>, BridgeError> {
        let result = self
            .submit(id, true, |reply| Request::Execute {
                unit: unit.clone(),
                reply,
            })
            .and_then(|rx| wait(id, rx));
        self.record(result)
    }

    pub async fn execute_async(
        &self,
        id: SessionId,
        unit: CompiledUnit,
    ) -> Result<Vec<ScriptValue>, BridgeError> {
        let result = match self.submit(id, false, |reply| Request::Execute { unit, reply }) {
            Ok(rx) => rx.await.unwrap_or(Err(BridgeError::InvalidSession(id))),
            Err(e) => Err(e),
        };
        self.record(result)
    }

    pub fn pump(&self, id: SessionId, max_events: usize) -> Result<PumpReport, BridgeError> {
        let result = self
            .submit(id, false, |reply| Request::Pump { max_events, reply })
            .and_then(|rx| wait(id, rx));
        self.record(result)
    }

    pub async fn pump_async(&self, id: SessionId, max_events: usize) -> Result<PumpReport, BridgeError> {
        let result = match self.submit(id, false, |reply| Request::Pump { max_events, reply }) {
            Ok(rx) => rx.await.unwrap_or(Err(BridgeError::InvalidSession(id))),
            Err(e) => Err(e),
        };
        self.record(result)
    }

    pub fn configure(&self, id: SessionId, limits: Limits) -> Result<(), BridgeError> {
        let result = self
            .submit(id, false, |reply| Request::Configure { limits, reply })
            .and_then(|rx| wait(id, rx));
        self.record(result)
    }

    /// Run `f` on the session thread
    pub fn with_session<T, F>(&self, id: SessionId, f: F) -> Result<T, BridgeError>
    where
        T: Send + 'static,
        F: FnOnce(&Session) -> T + Send + 'static,
    {
        let result = self
            .submit(id, false, |reply: Reply<T>| {
                Request::Call(Box::new(move |session| {
                    let _ = reply.send(Ok(f(session)));
                }))
            })
            .and_then(|rx| wait(id, rx));
        self.record(result)
    }

    /// Stop whatever is queued or running on `id`. Does nothing on an idle
    /// session, so a later run starts clean.
    pub fn cancel(&self, id: SessionId) -> Result<(), BridgeError> {
        let result = match self.sessions.lock_or_recover().get(&id) {
            Some(worker) => {
                if worker.inflight.load(Ordering::SeqCst) > 0 {
                    worker.cancel.cancel();
                } else {
                    tracing::debug!(session = %id, "Cancel on idle session ignored");
                }
                Ok(())
            }
            None => Err(BridgeError::InvalidSession(id)),
        };
        self.record(result)
    }

    /// Close the session and join its thread.
    ///
    /// A running script is cancelled first.
    pub fn close(&self, id: SessionId) -> Result<(), BridgeError> {
        let worker = self.sessions.lock_or_recover().remove(&id);
        let result = match worker {
            Some(worker) => worker.stop(id),
            None => Err(BridgeError::InvalidSession(id)),
        };
        if result.is_ok() {
            tracing::info!(session = %id, "Session closed");
        }
        self.record(result)
    }

    /// Close every session
    pub fn shutdown(&self) {
        let workers: Vec<_> = self.sessions.lock_or_recover().drain().collect();
        if workers.is_empty() {
            return;
        }
        let count = workers.len();
        for (id, worker) in workers {
            if let Err(e) = worker.stop(id) {
                tracing::warn!(session = %id, error = %e, "Session close during shutdown failed");
            }
        }
        tracing::info!(sessions = count, "Runtime shut down");
    }

    /// Message of the most recent failing call on this runtime
    pub fn last_error(&self) -> String {
        self.last_error.lock_or_recover().clone()
    }

    fn submit<T>(
        &self,
        id: SessionId,
        exclusive: bool,
        make: impl FnOnce(Reply<T>) -> Request,
    ) -> Result<oneshot::Receiver<Result<T, BridgeError>>, BridgeError> {
        let (reply, rx) = oneshot::channel();
        let sessions = self.sessions.lock_or_recover();
        let worker = sessions.get(&id).ok_or(BridgeError::InvalidSession(id))?;
        let request = make(reply);
        if exclusive {
            worker.send_exclusive(id, request)?;
        } else {
            worker.send(id, request)?;
        }
        Ok(rx)
    }

    fn record<T>(&self, result: Result<T, BridgeError>) -> Result<T, BridgeError> {
        if let Err(e) = &result {
            *self.last_error.lock_or_recover() = e.to_string();
        }
        result
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn wait<T>(id: SessionId, rx: oneshot::Receiver<Result<T, BridgeError>>) -> Result<T, BridgeError> {
    rx.blocking_recv()
        .unwrap_or(Err(BridgeError::InvalidSession(id)))
}

/// Request loop of one session thread
fn serve(
    session: &Session,
    inbox: &Receiver<Request>,
    inflight: &AtomicUsize,
    auto_pump: Option<Duration>,
) {
    loop {
        let request = match auto_pump {
            Some(interval) => match inbox.recv_timeout(interval) {
                Ok(request) => request,
                Err(RecvTimeoutError::Timeout) => {
                    idle_pump(session, inflight);
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match inbox.recv() {
                Ok(request) => request,
                Err(_) => break,
            },
        };

        let last = handle(session, request);
        inflight.fetch_sub(1, Ordering::SeqCst);
        if last || session.is_closed() {
            break;
        }
    }
    tracing::debug!(session = %session.id(), "Session thread exiting");
}

fn idle_pump(session: &Session, inflight: &AtomicUsize) {
    if inflight
        .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return;
    }
    if let Err(e) = session.pump(AUTO_PUMP_BATCH) {
        tracing::debug!(session = %session.id(), error = %e, "Auto-pump failed");
    }
    inflight.fetch_sub(1, Ordering::SeqCst);
}

/// Serve one request; true once the session has been closed
fn handle(session: &Session, request: Request) -> bool {
    match request {
        Request::Execute { unit, reply } => {
            let _ = reply.send(session.execute(&unit));
        }
        Request::Pump { max_events, reply } => {
            let _ = reply.send(session.pump(max_events));
        }
        Request::Configure { limits, reply } => {
            let _ = reply.send(session.configure(limits));
        }
        Request::Call(f) => f(session),
        Request::Close { reply } => {
            let _ = reply.send(session.close());
            return true;
        }
    }
    false
}
