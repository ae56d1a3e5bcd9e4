//! Sandbox executor: runs plugin code in a per-call wasmtime store with CPU
//! and memory ceilings and a capability-gated host namespace.
//!
//! The executor keeps compiled modules for loaded plugins and tracks every
//! execution in flight, so the lifecycle layer can refuse to unload a busy
//! plugin or cancel it cooperatively.

pub mod ceiling;
pub mod guard;
pub mod namespace;
pub mod services;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use wasmtime::{Config, Engine, Linker, Module, Store, Trap, UpdateDeadline};

use bastion_config::SandboxConfig;
use bastion_core::{BastionError, PluginId, Result};
use bastion_permissions::PermissionStore;

use ceiling::{EpochTicker, Interrupt, MemoryCeiling, Watchdog};
use services::HostServices;

pub use ceiling::{ResourceCeiling, cpu_time_from_secs};
pub use guard::{AttributeDenied, guarded_attribute_access};
pub use services::{ScopedServices, ServiceError};

/// Export called when an inline code unit is executed.
pub const INLINE_ENTRY: &str = "run";

/// Export called on a loaded module when no entry is named.
pub const DEFAULT_EXPORT: &str = "run";

// ── Requests and results ───────────────────────────────────────

/// What to run.
#[derive(Debug, Clone)]
pub enum CodeUnit {
    /// An exported function of the plugin's loaded module.
    Entry(String),
    /// A standalone module (binary or text format), run through its `run`
    /// export under the identity and grants of the plugin, which must be
    /// loaded.
    Inline(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub plugin: PluginId,
    pub code: CodeUnit,
    /// Variables readable through `ctx_get` / `attr_get`.
    pub context: BTreeMap<String, serde_json::Value>,
    pub ceiling: ResourceCeiling,
}

impl ExecutionRequest {
    pub fn new(plugin: PluginId, code: CodeUnit, ceiling: ResourceCeiling) -> Self {
        Self {
            plugin,
            code,
            context: BTreeMap::new(),
            ceiling,
        }
    }

    pub fn with_var(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(name.into(), value);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    CpuTime,
    Memory,
}

/// Why an execution did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SandboxFailure {
    #[error("resource exceeded: {resource:?} (limit {limit})")]
    ResourceExceeded { resource: Resource, limit: String },

    #[error("permission denied: {permission}")]
    PermissionDenied { permission: String },

    #[error("runtime fault: {message}")]
    RuntimeFault { message: String },

    #[error("cancelled")]
    Cancelled,
}

impl SandboxFailure {
    fn fault(message: impl Into<String>) -> Self {
        Self::RuntimeFault {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    /// Everything the guest printed, up to the output cap.
    pub output: String,
    pub output_truncated: bool,
    /// Values the guest bound with `bind`.
    pub bindings: BTreeMap<String, serde_json::Value>,
    pub outcome: std::result::Result<(), SandboxFailure>,
    pub elapsed: Duration,
}

impl ExecutionResult {
    fn failed(failure: SandboxFailure, elapsed: Duration) -> Self {
        Self {
            output: String::new(),
            output_truncated: false,
            bindings: BTreeMap::new(),
            outcome: Err(failure),
            elapsed,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn failure(&self) -> Option<&SandboxFailure> {
        self.outcome.as_ref().err()
    }
}

// ── Store state ────────────────────────────────────────────────

/// Guest output with a byte cap. Bytes past the cap are dropped.
pub(crate) struct OutputBuffer {
    bytes: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl OutputBuffer {
    fn new(cap: usize) -> Self {
        Self {
            bytes: Vec::new(),
            cap,
            truncated: false,
        }
    }

    pub(crate) fn push(&mut self, chunk: &[u8]) {
        let room = self.cap.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    fn into_string(self) -> (String, bool) {
        (String::from_utf8_lossy(&self.bytes).into_owned(), self.truncated)
    }
}

/// Data owned by the store of one execution.
pub(crate) struct ExecState {
    pub(crate) plugin: PluginId,
    pub(crate) permissions: Arc<PermissionStore>,
    pub(crate) services: Arc<dyn HostServices>,
    pub(crate) context: BTreeMap<String, serde_json::Value>,
    pub(crate) output: OutputBuffer,
    pub(crate) bindings: BTreeMap<String, serde_json::Value>,
    limiter: MemoryCeiling,
    watchdog: Watchdog,
}

// ── Executor ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SandboxOptions {
    pub tick: Duration,
    pub max_output_bytes: usize,
}

impl SandboxOptions {
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            tick: Duration::from_millis(config.tick_ms.max(1)),
            max_output_bytes: config.max_output_bytes,
        }
    }
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self::from_config(&SandboxConfig::default())
    }
}

#[derive(Default)]
struct ExecutorState {
    modules: HashMap<PluginId, Module>,
    /// plugin → execution id → cancel flag
    in_flight: HashMap<PluginId, HashMap<u64, Arc<AtomicBool>>>,
}

impl ExecutorState {
    fn in_flight(&self, plugin: &PluginId) -> usize {
        self.in_flight.get(plugin).map_or(0, HashMap::len)
    }
}

pub struct SandboxExecutor {
    engine: Engine,
    linker: Linker<ExecState>,
    permissions: Arc<PermissionStore>,
    services: Arc<dyn HostServices>,
    options: SandboxOptions,
    state: Mutex<ExecutorState>,
    idle: Condvar,
    violations: dashmap::DashMap<PluginId, u32>,
    next_exec: AtomicU64,
    _ticker: EpochTicker,
}

impl SandboxExecutor {
    pub fn new(
        permissions: Arc<PermissionStore>,
        services: Arc<dyn HostServices>,
        options: SandboxOptions,
    ) -> Result<Self> {
        let mut config = Config::new();
        config.epoch_interruption(true);

        let engine = Engine::new(&config).map_err(|e| sandbox_error("host", format!("failed to create WASM engine: {e}")))?;

        let mut linker = Linker::new(&engine);
        namespace::link(&mut linker)
            .map_err(|e| sandbox_error("host", format!("failed to link host namespace: {e}")))?;

        let ticker = EpochTicker::start(engine.clone(), options.tick)
            .map_err(|e| sandbox_error("host", format!("failed to start epoch ticker: {e}")))?;

        info!(tick_ms = options.tick.as_millis() as u64, "sandbox executor ready");
        Ok(Self {
            engine,
            linker,
            permissions,
            services,
            options,
            state: Mutex::new(ExecutorState::default()),
            idle: Condvar::new(),
            violations: dashmap::DashMap::new(),
            next_exec: AtomicU64::new(1),
            _ticker: ticker,
        })
    }

    pub fn permissions(&self) -> &Arc<PermissionStore> {
        &self.permissions
    }

    // ── Module cache ───────────────────────────────────────────

    /// Compile `code` and keep it as the plugin's loaded module.
    pub fn load(&self, plugin: &PluginId, code: &[u8]) -> Result<()> {
        let module = Module::new(&self.engine, code)
            .map_err(|e| sandbox_error(plugin.as_str(), format!("failed to compile module: {e:#}")))?;
        self.state.lock().modules.insert(plugin.clone(), module);
        debug!(plugin = %plugin, "module loaded into sandbox");
        Ok(())
    }

    /// Drop the plugin's module. Fails with `Busy` while executions are in
    /// flight; returns whether a module was loaded.
    pub fn unload(&self, plugin: &PluginId) -> Result<bool> {
        let mut state = self.state.lock();
        let in_flight = state.in_flight(plugin);
        if in_flight > 0 {
            return Err(BastionError::Busy {
                plugin: plugin.to_string(),
                in_flight,
            });
        }
        let removed = state.modules.remove(plugin).is_some();
        if removed {
            debug!(plugin = %plugin, "module unloaded from sandbox");
        }
        Ok(removed)
    }

    pub fn is_loaded(&self, plugin: &PluginId) -> bool {
        self.state.lock().modules.contains_key(plugin)
    }

    // ── In-flight tracking ─────────────────────────────────────

    pub fn in_flight(&self, plugin: &PluginId) -> usize {
        self.state.lock().in_flight(plugin)
    }

    /// Ask every running execution of `plugin` to stop at its next epoch
    /// tick. Returns how many were signalled.
    pub fn cancel(&self, plugin: &PluginId) -> usize {
        let state = self.state.lock();
        let Some(running) = state.in_flight.get(plugin) else {
            return 0;
        };
        for flag in running.values() {
            flag.store(true, Ordering::Release);
        }
        if !running.is_empty() {
            info!(plugin = %plugin, count = running.len(), "cancelling in-flight executions");
        }
        running.len()
    }

    /// Block until `plugin` has no executions in flight or `timeout` passes.
    pub fn wait_idle(&self, plugin: &PluginId, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.in_flight(plugin) > 0 {
            if self.idle.wait_until(&mut state, deadline).timed_out() {
                return state.in_flight(plugin) == 0;
            }
        }
        true
    }

    // ── Violations ─────────────────────────────────────────────

    /// ResourceExceeded results recorded for `plugin`.
    pub fn violations(&self, plugin: &PluginId) -> u32 {
        self.violations.get(plugin).map_or(0, |v| *v)
    }

    pub fn reset_violations(&self, plugin: &PluginId) {
        self.violations.remove(plugin);
    }

    // ── Execution ──────────────────────────────────────────────

    /// Run one code unit. Never panics and never returns a host error:
    /// every failure is reported in the result's `outcome`.
    pub fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let started = Instant::now();

        let (module, guard) = match self.begin(&request) {
            Ok(v) => v,
            Err(failure) => return ExecutionResult::failed(failure, started.elapsed()),
        };

        let ran = catch_unwind(AssertUnwindSafe(|| self.run(&module, &request, Arc::clone(&guard.cancel))));
        drop(guard);

        let mut result = match ran {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".into());
                warn!(plugin = %request.plugin, %message, "host panic during plugin execution");
                ExecutionResult::failed(SandboxFailure::fault(format!("host panic: {message}")), Duration::ZERO)
            }
        };
        result.elapsed = started.elapsed();

        if let Err(SandboxFailure::ResourceExceeded { resource, .. }) = &result.outcome {
            let mut count = self.violations.entry(request.plugin.clone()).or_insert(0);
            *count += 1;
            warn!(plugin = %request.plugin, ?resource, violations = *count, "plugin exceeded a resource ceiling");
        }

        debug!(
            plugin = %request.plugin,
            ok = result.is_success(),
            elapsed_ms = result.elapsed.as_millis() as u64,
            output_bytes = result.output.len(),
            "execution finished"
        );
        result
    }

    /// Resolve the module to run and register the execution as in flight.
    fn begin(&self, request: &ExecutionRequest) -> std::result::Result<(Module, InFlightGuard<'_>), SandboxFailure> {
        let exec_id = self.next_exec.fetch_add(1, Ordering::Relaxed);
        let cancel = Arc::new(AtomicBool::new(false));

        let loaded = {
            let mut state = self.state.lock();
            let loaded = state
                .modules
                .get(&request.plugin)
                .cloned()
                .ok_or_else(|| SandboxFailure::fault(format!("plugin {} is not loaded", request.plugin)))?;
            state
                .in_flight
                .entry(request.plugin.clone())
                .or_default()
                .insert(exec_id, Arc::clone(&cancel));
            loaded
        };
        let guard = InFlightGuard {
            executor: self,
            plugin: request.plugin.clone(),
            exec_id,
            cancel,
        };

        // Inline units run under the identity of a loaded plugin only.
        let module = match &request.code {
            CodeUnit::Entry(_) => loaded,
            CodeUnit::Inline(bytes) => Module::new(&self.engine, bytes)
                .map_err(|e| SandboxFailure::fault(format!("inline code does not compile: {e:#}")))?,
        };
        Ok((module, guard))
    }

    fn run(&self, module: &Module, request: &ExecutionRequest, cancel: Arc<AtomicBool>) -> ExecutionResult {
        let state = ExecState {
            plugin: request.plugin.clone(),
            permissions: Arc::clone(&self.permissions),
            services: Arc::clone(&self.services),
            context: request.context.clone(),
            output: OutputBuffer::new(self.options.max_output_bytes),
            bindings: BTreeMap::new(),
            limiter: MemoryCeiling::new(request.ceiling.memory_bytes),
            watchdog: Watchdog::arm(request.ceiling.cpu_time, cancel),
        };

        let mut store = Store::new(&self.engine, state);
        store.limiter(|s| &mut s.limiter);
        store.set_epoch_deadline(1);
        store.epoch_deadline_callback(|ctx| match ctx.data().watchdog.check() {
            Ok(()) => Ok(UpdateDeadline::Continue(1)),
            Err(interrupt) => Err(interrupt.trap()),
        });

        let export = match &request.code {
            CodeUnit::Entry(name) => name.as_str(),
            CodeUnit::Inline(_) => INLINE_ENTRY,
        };

        let outcome = self
            .linker
            .instantiate(&mut store, module)
            .and_then(|instance| {
                let func = instance.get_typed_func::<(), ()>(&mut store, export).map_err(|e| {
                    Interrupt::Fault(format!("export '{export}' is missing or not a `() -> ()` function: {e}")).trap()
                })?;
                func.call(&mut store, ())
            })
            .map_err(|e| classify(&e, store.data().limiter.tripped(), store.data().limiter.max_bytes()));

        if let Err(failure) = &outcome {
            debug!(plugin = %request.plugin, %failure, peak_memory = store.data().limiter.peak_bytes(), "execution failed");
        }

        let state = store.into_data();
        let (output, output_truncated) = state.output.into_string();
        ExecutionResult {
            output,
            output_truncated,
            bindings: state.bindings,
            outcome,
            elapsed: Duration::ZERO,
        }
    }
}

/// Map a wasmtime error to the failure it represents. The limiter's own
/// record wins over whatever the trap says.
fn classify(err: &wasmtime::Error, memory_tripped: bool, memory_limit: usize) -> SandboxFailure {
    if memory_tripped {
        return SandboxFailure::ResourceExceeded {
            resource: Resource::Memory,
            limit: format!("{memory_limit} bytes"),
        };
    }
    if let Some(interrupt) = err.downcast_ref::<Interrupt>() {
        return match interrupt {
            Interrupt::CpuExceeded(limit) => SandboxFailure::ResourceExceeded {
                resource: Resource::CpuTime,
                limit: format!("{limit:?}"),
            },
            Interrupt::MemoryExceeded(limit) => SandboxFailure::ResourceExceeded {
                resource: Resource::Memory,
                limit: format!("{limit} bytes"),
            },
            Interrupt::PermissionDenied(permission) => SandboxFailure::PermissionDenied {
                permission: permission.clone(),
            },
            Interrupt::Cancelled => SandboxFailure::Cancelled,
            Interrupt::Fault(message) => SandboxFailure::fault(message.clone()),
        };
    }
    if let Some(trap) = err.downcast_ref::<Trap>() {
        return SandboxFailure::fault(format!("trap: {trap}"));
    }
    SandboxFailure::fault(format!("{err:#}"))
}

fn sandbox_error(plugin: &str, reason: String) -> BastionError {
    BastionError::Sandbox {
        plugin: plugin.to_string(),
        reason,
    }
}

/// Removes an execution from the in-flight table when it ends, however it ends.
struct InFlightGuard<'a> {
    executor: &'a SandboxExecutor,
    plugin: PluginId,
    exec_id: u64,
    cancel: Arc<AtomicBool>,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.executor.state.lock();
        if let Some(running) = state.in_flight.get_mut(&self.plugin) {
            running.remove(&self.exec_id);
            if running.is_empty() {
                state.in_flight.remove(&self.plugin);
            }
        }
        drop(state);
        self.executor.idle.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_buffer_truncates() {
        let mut out = OutputBuffer::new(5);
        out.push(b"abc");
        out.push(b"defg");
        let (s, truncated) = out.into_string();
        assert_eq!(s, "abcde");
        assert!(truncated);
    }

    #[test]
    fn failure_serializes_with_kind_tag() {
        let f = SandboxFailure::PermissionDenied {
            permission: "fs.write".into(),
        };
        let json = serde_json::to_value(&f).unwrap();
        assert_eq!(json["kind"], "permission_denied");
        assert_eq!(json["permission"], "fs.write");
    }
}
