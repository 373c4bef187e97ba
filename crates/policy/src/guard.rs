//! Execution limits and the per-run guard state checked by the interpreter hook

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tether_protocol::LimitKind;
use thiserror::Error;

/// Probe every this many guard checks once a run is under way
const PROBE_EVERY_CHECKS: u64 = 64;

/// Thread-safe cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }
}

/// Resource limits applied to every script run in a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Maximum VM instructions per run (`None` = unbounded)
    pub max_instructions: Option<u64>,
    /// Maximum wall-clock time per run in milliseconds
    pub max_wall_time_ms: Option<u64>,
    /// Memory ceiling for the whole interpreter state in bytes
    pub max_memory: Option<usize>,
    /// Instructions between two guard checks
    pub hook_cadence: u32,
    /// Largest source accepted by the compiler entry points
    pub max_source_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_instructions: Some(200_000_000),
            max_wall_time_ms: Some(30_000),    // 30 seconds
            max_memory: Some(64 * 1024 * 1024), // 64 MB
            hook_cadence: 1_000,
            max_source_bytes: 4 * 1024 * 1024,
        }
    }
}

impl Limits {
    /// No limits at all; hosts running trusted code only
    pub fn unbounded() -> Self {
        Self {
            max_instructions: None,
            max_wall_time_ms: None,
            max_memory: None,
            ..Self::default()
        }
    }

    pub fn max_wall_time(&self) -> Option<Duration> {
        self.max_wall_time_ms.map(Duration::from_millis)
    }
}

/// A guard check failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("execution limit exceeded ({kind}): {detail}")]
pub struct LimitExceeded {
    pub kind: LimitKind,
    pub detail: String,
}

impl LimitExceeded {
    pub fn new(kind: LimitKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// Detects an execution context that must not be trusted.
///
/// No heuristics ship with the bridge; hosts plug their own in.
pub trait EnvironmentProbe: Send + Sync {
    fn name(&self) -> &str;

    /// `Some(reason)` when the environment is considered hostile
    fn inspect(&self) -> Option<String>;
}

/// What to do once a probe reports a hostile environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostilePolicy {
    /// Log the report and keep running
    Ignore,
    /// Abort the current run only
    #[default]
    AbortExecution,
    /// Abort the run and close the session
    CloseSession,
    /// Abort the whole host process
    TerminateProcess,
}

/// Session-scoped guard configuration
pub struct ExecutionGuard {
    limits: Limits,
    cancellation: CancellationToken,
    probe: Option<Arc<dyn EnvironmentProbe>>,
    hostile_policy: HostilePolicy,
}

impl ExecutionGuard {
    pub fn new(limits: Limits) -> Self {
        Self {
            limits,
            cancellation: CancellationToken::new(),
            probe: None,
            hostile_policy: HostilePolicy::default(),
        }
    }

    pub fn configure(&mut self, limits: Limits) {
        tracing::debug!(?limits, "Execution limits configured");
        self.limits = limits;
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn set_probe(&mut self, probe: Arc<dyn EnvironmentProbe>, policy: HostilePolicy) {
        self.probe = Some(probe);
        self.hostile_policy = policy;
    }

    pub fn hostile_policy(&self) -> HostilePolicy {
        self.hostile_policy
    }

    /// Token the host can use to stop the run in progress
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Hook cadence, clamped so an instruction limit of N overshoots by less
    /// than N
    pub fn cadence(&self) -> u32 {
        let cadence = self.limits.hook_cadence.max(1);
        match self.limits.max_instructions {
            Some(max) => cadence.min(u32::try_from(max.max(1)).unwrap_or(u32::MAX)),
            None => cadence,
        }
    }

    /// Check run before any script code executes
    pub fn preflight(&self) -> Result<(), LimitExceeded> {
        if self.cancellation.is_cancelled() {
            return Err(LimitExceeded::new(
                LimitKind::Cancelled,
                "cancelled before start",
            ));
        }
        if let Some(reason) = inspect(self.probe.as_deref()) {
            if self.hostile_policy != HostilePolicy::Ignore {
                return Err(LimitExceeded::new(LimitKind::HostileEnvironment, reason));
            }
        }
        Ok(())
    }

    /// Start a run; the returned state is what the interpreter hook checks
    pub fn begin(&self) -> GuardRun {
        GuardRun {
            inner: Arc::new(RunState {
                limits: self.limits.clone(),
                cadence: self.cadence(),
                started: Instant::now(),
                instructions: AtomicU64::new(0),
                checks: AtomicU64::new(0),
                tripped: AtomicU8::new(NOT_TRIPPED),
                cancellation: self.cancellation.clone(),
                probe: self.probe.clone(),
                hostile_policy: self.hostile_policy,
            }),
        }
    }
}

impl Default for ExecutionGuard {
    fn default() -> Self {
        Self::new(Limits::default())
    }
}

fn inspect(probe: Option<&dyn EnvironmentProbe>) -> Option<String> {
    let probe = probe?;
    let reason = probe.inspect()?;
    tracing::error!(probe = probe.name(), %reason, "Hostile environment detected");
    Some(reason)
}

const NOT_TRIPPED: u8 = 0;

fn kind_to_u8(kind: LimitKind) -> u8 {
    match kind {
        LimitKind::Instructions => 1,
        LimitKind::WallTime => 2,
        LimitKind::Memory => 3,
        LimitKind::Cancelled => 4,
        LimitKind::HostileEnvironment => 5,
    }
}

fn kind_from_u8(raw: u8) -> Option<LimitKind> {
    match raw {
        1 => Some(LimitKind::Instructions),
        2 => Some(LimitKind::WallTime),
        3 => Some(LimitKind::Memory),
        4 => Some(LimitKind::Cancelled),
        5 => Some(LimitKind::HostileEnvironment),
        _ => None,
    }
}

struct RunState {
    limits: Limits,
    cadence: u32,
    started: Instant,
    instructions: AtomicU64,
    checks: AtomicU64,
    tripped: AtomicU8,
    cancellation: CancellationToken,
    probe: Option<Arc<dyn EnvironmentProbe>>,
    hostile_policy: HostilePolicy,
}

/// Counters for one run, shared with the interpreter hook
#[derive(Clone)]
pub struct GuardRun {
    inner: Arc<RunState>,
}

impl GuardRun {
    pub fn cadence(&self) -> u32 {
        self.inner.cadence
    }

    /// Called by the interpreter hook every `cadence` instructions
    pub fn on_hook(&self, memory_in_use: usize) -> Result<(), LimitExceeded> {
        self.on_instructions(u64::from(self.inner.cadence));
        self.check(memory_in_use)
    }

    pub fn on_instructions(&self, count: u64) {
        self.inner.instructions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn instructions(&self) -> u64 {
        self.inner.instructions.load(Ordering::Relaxed)
    }

    pub fn elapsed(&self) -> Duration {
        self.inner.started.elapsed()
    }

    /// First limit that tripped during this run
    pub fn tripped(&self) -> Option<LimitKind> {
        kind_from_u8(self.inner.tripped.load(Ordering::SeqCst))
    }

    pub fn check(&self, memory_in_use: usize) -> Result<(), LimitExceeded> {
        let state = &self.inner;
        let checks = state.checks.fetch_add(1, Ordering::Relaxed) + 1;

        if state.cancellation.is_cancelled() {
            return Err(self.trip(LimitKind::Cancelled, "cancelled by host".into()));
        }

        if let Some(max) = state.limits.max_instructions {
            let executed = self.instructions();
            if executed >= max {
                return Err(self.trip(
                    LimitKind::Instructions,
                    format!("{executed} instructions executed (limit {max})"),
                ));
            }
        }

        if let Some(max) = state.limits.max_wall_time() {
            let elapsed = self.elapsed();
            if elapsed >= max {
                return Err(self.trip(
                    LimitKind::WallTime,
                    format!("ran for {}ms (limit {}ms)", elapsed.as_millis(), max.as_millis()),
                ));
            }
        }

        if let Some(max) = state.limits.max_memory {
            if memory_in_use > max {
                return Err(self.trip(
                    LimitKind::Memory,
                    format!("{memory_in_use} bytes in use (limit {max})"),
                ));
            }
        }

        if checks % PROBE_EVERY_CHECKS == 0 {
            if let Some(reason) = inspect(state.probe.as_deref()) {
                if state.hostile_policy != HostilePolicy::Ignore {
                    return Err(self.trip(LimitKind::HostileEnvironment, reason));
                }
            }
        }

        Ok(())
    }

    /// Record an externally detected trip (e.g. the allocator refused memory)
    pub fn trip(&self, kind: LimitKind, detail: String) -> LimitExceeded {
        let _ = self.inner.tripped.compare_exchange(
            NOT_TRIPPED,
            kind_to_u8(kind),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        tracing::warn!(kind = %kind, %detail, "Execution guard tripped");
        LimitExceeded::new(kind, detail)
    }
}
