//! Per-execution resource ceilings.
//!
//! Memory is capped by a [`MemoryCeiling`] installed as the store's
//! resource limiter. CPU time is checked by a [`Watchdog`] that the store's
//! epoch-deadline callback consults on every tick of the engine-wide
//! [`EpochTicker`]. Both live in the store of a single execution, so they
//! are armed when the store is created and gone when it drops.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;
use wasmtime::{Engine, ResourceLimiter};

use bastion_config::SandboxConfig;
use bastion_config::schema::MAX_CPU_SECONDS;
use bastion_core::BastionError;

/// The wall clock may run this many times past the CPU ceiling before the
/// execution is stopped anyway (guest blocked in a host call, CPU clock
/// unavailable).
const WALL_BACKSTOP_FACTOR: u32 = 3;

/// Upper bounds for one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceCeiling {
    pub cpu_time: Duration,
    pub memory_bytes: usize,
}

impl ResourceCeiling {
    pub fn new(cpu_time: Duration, memory_bytes: usize) -> Self {
        Self {
            cpu_time,
            memory_bytes,
        }
    }

    /// Ceiling from the `[sandbox]` section. Fails for a CPU time that is
    /// not positive, not finite, or above [`MAX_CPU_SECONDS`].
    pub fn from_config(config: &SandboxConfig) -> bastion_core::Result<Self> {
        Ok(Self {
            cpu_time: cpu_time_from_secs(config.cpu_seconds)?,
            memory_bytes: (config.memory_mb as usize).saturating_mul(1024 * 1024),
        })
    }
}

impl Default for ResourceCeiling {
    fn default() -> Self {
        Self::from_config(&SandboxConfig::default())
            .unwrap_or_else(|_| Self::new(Duration::from_secs(5), 64 * 1024 * 1024))
    }
}

/// Convert a configured CPU ceiling in seconds. Sub-millisecond values are
/// rounded up to 1ms.
pub fn cpu_time_from_secs(secs: f64) -> bastion_core::Result<Duration> {
    if !(secs.is_finite() && secs > 0.0 && secs <= MAX_CPU_SECONDS) {
        return Err(BastionError::Config(format!(
            "cpu ceiling of {secs}s must be greater than 0 and at most {MAX_CPU_SECONDS}s"
        )));
    }
    Duration::try_from_secs_f64(secs.max(0.001))
        .map_err(|e| BastionError::Config(format!("cpu ceiling of {secs}s is not a valid duration: {e}")))
}

/// Why the host stopped a guest. Raised from host functions, the limiter,
/// or the epoch callback and recovered from the trap error afterwards.
#[derive(Debug, Clone, Error)]
pub(crate) enum Interrupt {
    #[error("cpu time ceiling of {0:?} exceeded")]
    CpuExceeded(Duration),

    #[error("memory ceiling of {0} bytes exceeded")]
    MemoryExceeded(usize),

    #[error("permission '{0}' not granted")]
    PermissionDenied(String),

    #[error("execution cancelled")]
    Cancelled,

    #[error("{0}")]
    Fault(String),
}

impl Interrupt {
    pub(crate) fn trap(self) -> wasmtime::Error {
        wasmtime::Error::new(self)
    }
}

// ── Memory ─────────────────────────────────────────────────────

/// Resource limiter that aborts (rather than failing the grow) when the
/// ceiling would be crossed, so the overrun is reported deterministically.
pub(crate) struct MemoryCeiling {
    max_bytes: usize,
    peak_bytes: usize,
    tripped: bool,
}

impl MemoryCeiling {
    pub(crate) fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            peak_bytes: 0,
            tripped: false,
        }
    }

    pub(crate) fn tripped(&self) -> bool {
        self.tripped
    }

    pub(crate) fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub(crate) fn peak_bytes(&self) -> usize {
        self.peak_bytes
    }
}

impl ResourceLimiter for MemoryCeiling {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        if desired > self.max_bytes {
            debug!(current, desired, max = self.max_bytes, "memory ceiling hit");
            self.tripped = true;
            return Err(Interrupt::MemoryExceeded(self.max_bytes).trap());
        }
        self.peak_bytes = self.peak_bytes.max(desired);
        Ok(true)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        Ok(desired <= 20_000)
    }

    fn instances(&self) -> usize {
        1
    }

    fn memories(&self) -> usize {
        1
    }

    fn tables(&self) -> usize {
        4
    }
}

// ── CPU ────────────────────────────────────────────────────────

/// CPU time consumed by the calling thread.
#[cfg(unix)]
pub(crate) fn thread_cpu_time() -> Option<Duration> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec for the duration of the call.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_THREAD_CPUTIME_ID, &mut ts) };
    if rc != 0 {
        return None;
    }
    Some(Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32))
}

#[cfg(not(unix))]
pub(crate) fn thread_cpu_time() -> Option<Duration> {
    None
}

/// Checked from the epoch-deadline callback on the executing thread.
pub(crate) struct Watchdog {
    cpu_limit: Duration,
    cpu_start: Option<Duration>,
    wall_start: Instant,
    cancel: Arc<AtomicBool>,
}

impl Watchdog {
    /// Must be created on the thread that runs the guest.
    pub(crate) fn arm(cpu_limit: Duration, cancel: Arc<AtomicBool>) -> Self {
        Self {
            cpu_limit,
            cpu_start: thread_cpu_time(),
            wall_start: Instant::now(),
            cancel,
        }
    }

    pub(crate) fn check(&self) -> Result<(), Interrupt> {
        if self.cancel.load(Ordering::Acquire) {
            return Err(Interrupt::Cancelled);
        }
        let wall = self.wall_start.elapsed();
        let cpu = match (self.cpu_start, thread_cpu_time()) {
            (Some(start), Some(now)) => now.saturating_sub(start),
            _ => wall,
        };
        if cpu > self.cpu_limit || wall > self.cpu_limit.saturating_mul(WALL_BACKSTOP_FACTOR) {
            debug!(?cpu, ?wall, limit = ?self.cpu_limit, "cpu ceiling hit");
            return Err(Interrupt::CpuExceeded(self.cpu_limit));
        }
        Ok(())
    }
}

// ── Epoch ticker ───────────────────────────────────────────────

/// Background thread advancing the engine epoch. Stopped and joined on drop.
pub(crate) struct EpochTicker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EpochTicker {
    pub(crate) fn start(engine: Engine, tick: Duration) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("bastion-epoch".into())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    std::thread::sleep(tick);
                    engine.increment_epoch();
                }
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceiling_from_config() {
        let config = SandboxConfig {
            cpu_seconds: 1.5,
            memory_mb: 2,
            ..SandboxConfig::default()
        };
        let c = ResourceCeiling::from_config(&config).unwrap();
        assert_eq!(c.cpu_time, Duration::from_millis(1500));
        assert_eq!(c.memory_bytes, 2 * 1024 * 1024);
    }

    #[test]
    fn unreasonable_cpu_ceiling_is_an_error() {
        for secs in [1e20, f64::INFINITY, f64::NAN, 0.0, -1.0, MAX_CPU_SECONDS + 1.0] {
            let config = SandboxConfig {
                cpu_seconds: secs,
                ..SandboxConfig::default()
            };
            assert!(ResourceCeiling::from_config(&config).is_err(), "{secs} should be rejected");
        }
        assert_eq!(cpu_time_from_secs(MAX_CPU_SECONDS).unwrap(), Duration::from_secs(86_400));
        assert_eq!(cpu_time_from_secs(0.0001).unwrap(), Duration::from_millis(1));
    }

    #[test]
    fn watchdog_backstop_saturates_for_huge_limits() {
        let w = Watchdog::arm(Duration::MAX, Arc::new(AtomicBool::new(false)));
        assert!(w.check().is_ok());
    }

    #[test]
    fn memory_ceiling_trips_once_exceeded() {
        let mut m = MemoryCeiling::new(1024);
        assert!(m.memory_growing(0, 512, None).unwrap());
        assert!(!m.tripped());
        assert!(m.memory_growing(512, 2048, None).is_err());
        assert!(m.tripped());
        assert_eq!(m.peak_bytes(), 512);
    }

    #[test]
    fn watchdog_honours_cancel() {
        let cancel = Arc::new(AtomicBool::new(false));
        let w = Watchdog::arm(Duration::from_secs(10), Arc::clone(&cancel));
        assert!(w.check().is_ok());
        cancel.store(true, Ordering::Release);
        assert!(matches!(w.check(), Err(Interrupt::Cancelled)));
    }

    #[test]
    fn watchdog_trips_on_busy_thread() {
        let w = Watchdog::arm(Duration::from_millis(20), Arc::new(AtomicBool::new(false)));
        let start = Instant::now();
        let mut x = 0u64;
        while start.elapsed() < Duration::from_millis(100) {
            x = x.wrapping_add(1);
        }
        assert!(x > 0);
        assert!(matches!(w.check(), Err(Interrupt::CpuExceeded(_))));
    }

    #[cfg(unix)]
    #[test]
    fn thread_clock_advances() {
        let a = thread_cpu_time().unwrap();
        let mut x = 0u64;
        for i in 0..5_000_000u64 {
            x = x.wrapping_add(i);
        }
        std::hint::black_box(x);
        assert!(thread_cpu_time().unwrap() >= a);
    }
}
