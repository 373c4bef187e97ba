//! Lua sessions with sandbox limits
//!
//! A `Session` owns one Lua state, the registry of values native code holds
//! for it, and its capability adapters. It is not `Send`: the thread that
//! opened it is the only one that ever runs its Lua code. Producer threads
//! reach it only through adapter queues, drained by `pump`.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use mlua::{ChunkMode, HookTriggers, IntoLua, Lua, LuaOptions, MultiValue, StdLib, Value, VmState};
use serde::{Deserialize, Serialize};
use tether_engine_core::render::{NullBackend, RenderBackend};
use tether_engine_core::{AdapterState, EventQueue};
use tether_policy::{
    CancellationToken, EnvironmentProbe, ExecutionGuard, GuardRun, HostilePolicy, LimitExceeded,
    Limits,
};
use tether_protocol::{Event, ExecReport, Handle, LimitKind, ScriptValue, SessionId};

use crate::bindings::to_script_values;
use crate::capabilities::{
    Console, CryptoLib, DrawingLib, HttpLib, OutputSink, StoreLib, Timers, TracingSink,
    WebSocketLib,
};
use crate::{
    BridgeError, Callbacks, Capability, CompiledUnit, InstallContext, SessionConfig, ValueRegistry,
};

/// Globals removed or wrapped before any script runs
const SANDBOX_PRELUDE: &str = r#"
local rawload = load
load = function(chunk, name, _, env)
    return rawload(chunk, name, "t", env)
end
dofile = nil
loadfile = nil
"#;

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Ready,
    /// A script or callback is executing
    Running,
    Closed,
}

/// What one `pump` call did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PumpReport {
    /// Events taken off adapter queues
    pub drained: usize,
    /// Callbacks that ran to completion
    pub dispatched: usize,
    /// Routed handles that no longer resolve
    pub skipped: usize,
    /// Callbacks that raised or tripped a limit
    pub failed: usize,
    /// Handles released because their producer closed
    pub released: usize,
}

/// Builds a session with bundled and custom capabilities
pub struct SessionBuilder {
    config: SessionConfig,
    output: Option<Arc<dyn OutputSink>>,
    backend: Option<Box<dyn RenderBackend>>,
    probe: Option<(Arc<dyn EnvironmentProbe>, HostilePolicy)>,
    extra: Vec<Box<dyn Capability>>,
}

impl SessionBuilder {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            output: None,
            backend: None,
            probe: None,
            extra: Vec::new(),
        }
    }

    /// Where console output goes (default: tracing)
    pub fn output(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.output = Some(sink);
        self
    }

    /// Backend frames are presented to (default: discarded)
    pub fn render_backend(mut self, backend: Box<dyn RenderBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn EnvironmentProbe>, policy: HostilePolicy) -> Self {
        self.probe = Some((probe, policy));
        self
    }

    /// Install a host-provided capability after the bundled ones
    pub fn capability(mut self, capability: Box<dyn Capability>) -> Self {
        self.extra.push(capability);
        self
    }

    pub fn open(self) -> Result<Session, BridgeError> {
        let Self {
            config,
            output,
            backend,
            probe,
            extra,
        } = self;
        let id = SessionId::new();
        let init = |e: mlua::Error| BridgeError::InitFailed(e.to_string());

        // Guard hooks cover the main thread only, so no coroutine library
        let libs = StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8;
        let lua = Lua::new_with(libs, LuaOptions::default()).map_err(init)?;
        if let Some(max) = config.limits.max_memory {
            lua.set_memory_limit(max).map_err(init)?;
        }
        lua.load(SANDBOX_PRELUDE)
            .set_name("=sandbox")
            .exec()
            .map_err(init)?;

        let mut guard = ExecutionGuard::new(config.limits.clone());
        if let Some((probe, policy)) = probe {
            guard.set_probe(probe, policy);
        }

        let adapters = bundled(&config, output, backend)
            .into_iter()
            .chain(extra)
            .collect::<Vec<_>>();

        let callbacks = Callbacks::new(Rc::new(ValueRegistry::new("session")));
        let ctx = InstallContext {
            session: id,
            callbacks: callbacks.clone(),
        };
        for adapter in &adapters {
            adapter.install(&lua, &ctx).map_err(|e| {
                BridgeError::InitFailed(format!("installing {}: {e}", adapter.name()))
            })?;
        }

        tracing::info!(
            session = %id,
            adapters = ?adapters.iter().map(|a| a.name()).collect::<Vec<_>>(),
            "Session opened"
        );

        Ok(Session {
            id,
            lua,
            state: Cell::new(SessionState::Ready),
            guard: RefCell::new(guard),
            callbacks,
            adapters,
            next_adapter: Cell::new(0),
            last_error: RefCell::new(String::new()),
            last_instructions: Cell::new(0),
            close_requested: Cell::new(false),
        })
    }
}

fn bundled(
    config: &SessionConfig,
    output: Option<Arc<dyn OutputSink>>,
    backend: Option<Box<dyn RenderBackend>>,
) -> Vec<Box<dyn Capability>> {
    let enabled = config.capabilities;
    let mut adapters: Vec<Box<dyn Capability>> = Vec::new();
    if enabled.console {
        let sink = output.unwrap_or_else(|| Arc::new(TracingSink));
        adapters.push(Box::new(Console::new(sink)));
    }
    if enabled.crypto {
        adapters.push(Box::new(CryptoLib::new()));
    }
    if enabled.http {
        adapters.push(Box::new(HttpLib::new(&config.http, config.network.clone())));
    }
    if enabled.websocket {
        adapters.push(Box::new(WebSocketLib::new(
            &config.queue,
            config.network.clone(),
            Duration::from_millis(config.connect_timeout_ms),
        )));
    }
    if enabled.drawing {
        let backend = backend.unwrap_or_else(|| Box::new(NullBackend));
        adapters.push(Box::new(DrawingLib::new(
            &config.queue,
            config.screen_size,
            config.render_hz,
            backend,
        )));
    }
    if enabled.timers {
        adapters.push(Box::new(Timers::new(&config.queue)));
    }
    if enabled.store {
        adapters.push(Box::new(StoreLib::new(
            config.workspace_root.clone(),
            config.store_file.clone(),
        )));
    }
    adapters
}

/// One Lua interpreter and everything it owns
pub struct Session {
    id: SessionId,
    lua: Lua,
    state: Cell<SessionState>,
    guard: RefCell<ExecutionGuard>,
    callbacks: Callbacks,
    adapters: Vec<Box<dyn Capability>>,
    next_adapter: Cell<usize>,
    last_error: RefCell<String>,
    last_instructions: Cell<u64>,
    close_requested: Cell<bool>,
}

impl Session {
    /// Open a session with the bundled capabilities `config` enables
    pub fn open(config: SessionConfig) -> Result<Self, BridgeError> {
        SessionBuilder::new(config).open()
    }

    pub fn builder(config: SessionConfig) -> SessionBuilder {
        SessionBuilder::new(config)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn is_closed(&self) -> bool {
        self.state.get() == SessionState::Closed
    }

    /// The Lua state, for hosts that install their own globals
    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    /// Token that stops the run in progress (or the next one)
    pub fn cancellation_token(&self) -> CancellationToken {
        self.guard.borrow().cancellation_token()
    }

    pub fn limits(&self) -> Limits {
        self.guard.borrow().limits().clone()
    }

    /// Replace the execution limits; refused while a script runs
    pub fn configure(&self, limits: Limits) -> Result<(), BridgeError> {
        self.ensure_idle()?;
        if let Some(max) = limits.max_memory {
            self.lua
                .set_memory_limit(max)
                .map_err(|e| BridgeError::Runtime(e.to_string()))?;
        }
        self.guard.borrow_mut().configure(limits);
        Ok(())
    }

    /// Message of the most recent failure in this session
    pub fn last_error(&self) -> String {
        self.last_error.borrow().clone()
    }

    /// Instructions counted by the guard during the last guarded call
    pub fn last_instructions(&self) -> u64 {
        self.last_instructions.get()
    }

    /// Lifecycle state of every adapter, in install order
    pub fn adapter_states(&self) -> Vec<(&'static str, AdapterState)> {
        self.adapters
            .iter()
            .map(|a| (a.name(), a.lifecycle().state()))
            .collect()
    }

    /// Events waiting across all adapter queues
    pub fn pending_events(&self) -> usize {
        self.adapters
            .iter()
            .filter_map(|a| a.queue())
            .map(|q| q.len())
            .sum()
    }

    /// Run a compiled unit and return its results
    pub fn execute(&self, unit: &CompiledUnit) -> Result<Vec<ScriptValue>, BridgeError> {
        let result = self.enter(|| {
            let function = self
                .lua
                .load(unit.source())
                .set_name(unit.chunk_name())
                .set_mode(ChunkMode::Text)
                .into_function()
                .map_err(|e| self.classify(e, None))?;
            self.guarded(|| function.call::<MultiValue>(()))
                .map(to_script_values)
        });
        self.finish("execute", result)
    }

    /// `execute` for callers that want a status code and message
    pub fn execute_report(&self, unit: &CompiledUnit) -> ExecReport {
        crate::report_of(&self.execute(unit))
    }

    /// Drain up to `max_events` events across adapter queues and dispatch
    /// them.
    ///
    /// Queues are visited round-robin, one event per queue per turn, and the
    /// first queue visited rotates between calls.
    pub fn pump(&self, max_events: usize) -> Result<PumpReport, BridgeError> {
        let result = self.enter(|| Ok(self.drain(max_events)));
        self.finish("pump", result)
    }

    /// Shut down adapters, discard pending events and invalidate every handle
    pub fn close(&self) -> Result<(), BridgeError> {
        match self.state.get() {
            SessionState::Closed => Err(BridgeError::InvalidSession(self.id)),
            SessionState::Running => Err(BridgeError::SessionBusy),
            SessionState::Created | SessionState::Ready => {
                self.shutdown();
                Ok(())
            }
        }
    }

    /// Keep a Lua value alive under a fresh handle
    pub fn register(&self, value: impl IntoLua) -> Result<Handle, BridgeError> {
        let result = self
            .lua
            .create_registry_value(value)
            .map_err(|e| BridgeError::Runtime(e.to_string()))
            .and_then(|key| {
                self.callbacks
                    .table()
                    .register(key)
                    .map_err(|e| BridgeError::from_registry(e, self.id))
            });
        self.finish("register", result)
    }

    pub fn resolve(&self, handle: Handle) -> Result<Value, BridgeError> {
        let result = self
            .callbacks
            .table()
            .with(handle, |key| self.lua.registry_value::<Value>(key))
            .map_err(|e| BridgeError::from_registry(e, self.id))
            .and_then(|value| value.map_err(|e| BridgeError::Runtime(e.to_string())));
        self.finish("resolve", result)
    }

    pub fn release(&self, handle: Handle) -> Result<(), BridgeError> {
        let result = self
            .callbacks
            .release(&self.lua, handle)
            .map_err(|e| BridgeError::from_registry(e, self.id));
        self.finish("release", result)
    }

    fn ensure_idle(&self) -> Result<(), BridgeError> {
        match self.state.get() {
            SessionState::Closed => Err(BridgeError::InvalidSession(self.id)),
            SessionState::Running => Err(BridgeError::SessionBusy),
            SessionState::Created | SessionState::Ready => Ok(()),
        }
    }

    /// Mark the session running for the duration of `f`
    fn enter<R>(&self, f: impl FnOnce() -> Result<R, BridgeError>) -> Result<R, BridgeError> {
        self.ensure_idle()?;
        self.state.set(SessionState::Running);
        let result = f();
        self.state.set(SessionState::Ready);
        if self.close_requested.get() {
            tracing::error!(session = %self.id, "Closing session after hostile environment report");
            self.shutdown();
        }
        result
    }

    fn finish<R>(&self, operation: &str, result: Result<R, BridgeError>) -> Result<R, BridgeError> {
        if let Err(e) = &result {
            tracing::debug!(session = %self.id, operation, error = %e, "Session call failed");
            *self.last_error.borrow_mut() = e.to_string();
        }
        result
    }

    /// Run `call` with the instruction hook installed
    fn guarded<R>(&self, call: impl FnOnce() -> mlua::Result<R>) -> Result<R, BridgeError> {
        let run = {
            let guard = self.guard.borrow();
            if let Err(trip) = guard.preflight() {
                drop(guard);
                return Err(self.tripped(trip));
            }
            guard.begin()
        };
        if let Err(trip) = run.check(self.lua.used_memory()) {
            return Err(self.tripped(trip));
        }

        arm_hook(&self.lua, run.clone(), run.cadence());
        let result = call();
        self.lua.remove_hook();
        self.last_instructions.set(run.instructions());

        result.map_err(|e| self.classify(e, Some(&run)))
    }

    fn classify(&self, error: mlua::Error, run: Option<&GuardRun>) -> BridgeError {
        if let Some(run) = run {
            if let Some(kind) = run.tripped() {
                let trip = limit_in(&error)
                    .filter(|t| t.kind == kind)
                    .unwrap_or_else(|| LimitExceeded::new(kind, error.to_string()));
                return self.tripped(trip);
            }
        }
        match error {
            mlua::Error::MemoryError(detail) => {
                let trip = match run {
                    Some(run) => run.trip(LimitKind::Memory, detail),
                    None => LimitExceeded::new(LimitKind::Memory, detail),
                };
                self.tripped(trip)
            }
            other => BridgeError::Runtime(other.to_string()),
        }
    }

    fn tripped(&self, trip: LimitExceeded) -> BridgeError {
        match trip.kind {
            LimitKind::Cancelled => self.guard.borrow().cancellation_token().reset(),
            LimitKind::HostileEnvironment => match self.guard.borrow().hostile_policy() {
                HostilePolicy::CloseSession => self.close_requested.set(true),
                HostilePolicy::TerminateProcess => {
                    tracing::error!(session = %self.id, detail = %trip.detail, "Terminating process");
                    std::process::abort();
                }
                HostilePolicy::Ignore | HostilePolicy::AbortExecution => {}
            },
            _ => {}
        }
        trip.into()
    }

    fn drain(&self, max_events: usize) -> PumpReport {
        let mut report = PumpReport::default();
        let queued: Vec<(&dyn Capability, &Arc<EventQueue>)> = self
            .adapters
            .iter()
            .filter_map(|a| a.queue().map(|q| (a.as_ref(), q)))
            .collect();
        if queued.is_empty() || max_events == 0 {
            return report;
        }

        let start = self.next_adapter.get() % queued.len();
        self.next_adapter.set(start + 1);

        let mut budget = max_events;
        'turns: loop {
            let mut progressed = false;
            for offset in 0..queued.len() {
                let (adapter, queue) = queued[(start + offset) % queued.len()];
                let Some(event) = queue.pop() else {
                    continue;
                };
                progressed = true;
                budget -= 1;
                self.dispatch(adapter, event, &mut report);
                if budget == 0 || self.close_requested.get() {
                    break 'turns;
                }
            }
            if !progressed {
                break;
            }
        }

        if report.drained > 0 {
            tracing::trace!(session = %self.id, ?report, "Pumped events");
        }
        report
    }

    fn dispatch(&self, adapter: &dyn Capability, event: Event, report: &mut PumpReport) {
        report.drained += 1;

        for handle in adapter.route(&event) {
            let callback = match self.callbacks.function(&self.lua, handle) {
                Ok(callback) => callback,
                Err(e) => {
                    report.skipped += 1;
                    tracing::warn!(
                        session = %self.id,
                        adapter = adapter.name(),
                        %handle,
                        event = event.kind(),
                        error = %e,
                        "Dispatch skipped"
                    );
                    continue;
                }
            };

            let outcome = event_args(&self.lua, &event)
                .map_err(|e| BridgeError::Runtime(e.to_string()))
                .and_then(|args| self.guarded(|| callback.call::<()>(args)));
            match outcome {
                Ok(()) => report.dispatched += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        session = %self.id,
                        adapter = adapter.name(),
                        %handle,
                        error = %e,
                        "Callback failed"
                    );
                    *self.last_error.borrow_mut() = e.to_string();
                }
            }
        }

        if let Event::Close { source } = event {
            for handle in std::iter::once(source).chain(adapter.retire(source)) {
                match self.callbacks.release(&self.lua, handle) {
                    Ok(()) => report.released += 1,
                    Err(e) => tracing::debug!(%handle, error = %e, "Nothing to release after close"),
                }
            }
        }
    }

    fn shutdown(&self) {
        self.state.set(SessionState::Closed);
        self.close_requested.set(false);

        for adapter in &self.adapters {
            adapter.lifecycle().begin_drain();
        }
        for adapter in &self.adapters {
            adapter.shutdown();
        }

        let mut discarded = 0;
        for queue in self.adapters.iter().filter_map(|a| a.queue()) {
            queue.close();
            discarded += queue.drain(usize::MAX).count();
        }

        let released = self.callbacks.table().close();
        let released_count = released.len();
        for key in released {
            let _ = self.lua.remove_registry_value(key);
        }
        self.lua.expire_registry_values();

        for adapter in &self.adapters {
            adapter.lifecycle().finish();
        }
        tracing::info!(
            session = %self.id,
            discarded,
            released = released_count,
            "Session closed"
        );
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state.get() != SessionState::Closed {
            self.shutdown();
        }
    }
}

/// Install the guard hook. Once a limit trips the hook fires on every
/// instruction, so a script catching the error with `pcall` hits it again
/// as soon as it leaves the protected call.
fn arm_hook(lua: &Lua, run: GuardRun, every: u32) {
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(every),
        move |lua, _debug| {
            if let Some(kind) = run.tripped() {
                return Err(mlua::Error::external(LimitExceeded::new(
                    kind,
                    "limit already reached",
                )));
            }
            match run.on_hook(lua.used_memory()) {
                Ok(()) => Ok(VmState::Continue),
                Err(trip) => {
                    arm_hook(lua, run.clone(), 1);
                    Err(mlua::Error::external(trip))
                }
            }
        },
    );
}

fn event_args(lua: &Lua, event: &Event) -> mlua::Result<MultiValue> {
    let arg = match event {
        Event::Message { payload, .. } => Value::String(lua.create_string(payload)?),
        Event::Error { detail, .. } => Value::String(lua.create_string(detail)?),
        Event::Close { .. } | Event::Fire { .. } | Event::Tick => return Ok(MultiValue::new()),
    };
    Ok(MultiValue::from_vec(vec![arg]))
}

fn limit_in(error: &mlua::Error) -> Option<LimitExceeded> {
    match error {
        mlua::Error::ExternalError(inner) => inner.downcast_ref::<LimitExceeded>().cloned(),
        mlua::Error::CallbackError { cause, .. } => limit_in(cause),
        _ => None,
    }
}
