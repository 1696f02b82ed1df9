//! Periodic background sampling, started on demand.
//!
//! What a sampler collects (CPU, memory, queue depths, ...) is up to the
//! [`Sampler`] implementation. [`SamplerLauncher`] only owns the schedule: the
//! first [`ensure_running`](SamplerControl::ensure_running) spawns a task that
//! ticks every [`SamplerConfig::interval`] and calls each sampler in turn;
//! every later call is a cheap atomic load. If the task ends on its own (a
//! sampler panicked, the runtime shut down), the next call launches it again.

use crate::error::ReporterError;
use request_tracker::SamplerControl;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// A source of periodic measurements.
pub trait Sampler: Send + Sync {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    /// Takes one sample. Called from the launcher's task on every tick.
    fn sample(&self);
}

/// Configuration for the sampler schedule.
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// Time between samples.
    ///
    /// Default: 60s
    pub interval: Duration,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

impl SamplerConfig {
    /// Sets the sampling interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

struct RunningTask {
    handle: JoinHandle<()>,
    stop_tx: oneshot::Sender<()>,
}

/// Clears the running flag when the task of launch `generation` ends, unless
/// a later launch has replaced it.
struct ExitGuard {
    running: Arc<AtomicBool>,
    launches: Arc<AtomicU64>,
    generation: u64,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if self.launches.load(Ordering::Acquire) == self.generation {
            self.running.store(false, Ordering::Release);
        }
    }
}

/// [`SamplerControl`] that runs a set of samplers on a Tokio runtime.
pub struct SamplerLauncher {
    runtime: Handle,
    config: SamplerConfig,
    samplers: Arc<Vec<Arc<dyn Sampler>>>,
    running: Arc<AtomicBool>,
    task: Mutex<Option<RunningTask>>,
    launches: Arc<AtomicU64>,
    ticks: Arc<AtomicU64>,
}

impl SamplerLauncher {
    /// Creates a launcher bound to the current Tokio runtime. Nothing runs
    /// until [`ensure_running`](SamplerControl::ensure_running) is called.
    pub fn new(config: SamplerConfig, samplers: Vec<Arc<dyn Sampler>>) -> Result<Self, ReporterError> {
        let runtime = Handle::try_current()?;
        Ok(Self::with_handle(runtime, config, samplers))
    }

    /// Creates a launcher that spawns onto `runtime`.
    pub fn with_handle(runtime: Handle, config: SamplerConfig, samplers: Vec<Arc<dyn Sampler>>) -> Self {
        Self {
            runtime,
            config,
            samplers: Arc::new(samplers),
            running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
            launches: Arc::new(AtomicU64::new(0)),
            ticks: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Number of times the sampling task has been spawned.
    pub fn launches(&self) -> u64 {
        self.launches.load(Ordering::Relaxed)
    }

    /// Number of sampling rounds completed.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Stops the sampling task. A later `ensure_running` starts it again.
    pub fn stop(&self) {
        let mut slot = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = slot.take() {
            let _ = task.stop_tx.send(());
            drop(task.handle);
            debug!("sampler stopped");
        }
        self.running.store(false, Ordering::Release);
    }

    fn launch(&self) -> RunningTask {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let samplers = Arc::clone(&self.samplers);
        let ticks = Arc::clone(&self.ticks);
        let period = self.config.interval;
        let generation = self.launches.fetch_add(1, Ordering::AcqRel) + 1;
        let exit = ExitGuard {
            running: Arc::clone(&self.running),
            launches: Arc::clone(&self.launches),
            generation,
        };

        let handle = self.runtime.spawn(async move {
            // Clears the running flag however the task ends: stopped, a
            // sampler panicked, or the runtime shut down
            let _exit = exit;
            let mut interval = interval(period);
            // Skip missed ticks rather than sampling in a burst after a stall
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        for sampler in samplers.iter() {
                            trace!(sampler = sampler.name(), "sampling");
                            sampler.sample();
                        }
                        ticks.fetch_add(1, Ordering::Relaxed);
                    }
                    _ = &mut stop_rx => break,
                }
            }
        });

        RunningTask { handle, stop_tx }
    }
}

impl SamplerControl for SamplerLauncher {
    fn ensure_running(&self) {
        if self.running.load(Ordering::Acquire) {
            return;
        }

        let mut slot = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        // Decide under the lock from the task itself: another thread may have
        // launched meanwhile, or the task may still be unwinding
        if let Some(task) = slot.as_ref() {
            if !task.handle.is_finished() {
                return;
            }
            warn!(launches = self.launches(), "sampler task ended unexpectedly, relaunching");
        }

        // Set before spawning so an immediate exit of the new task wins
        self.running.store(true, Ordering::Release);
        *slot = Some(self.launch());
        debug!(
            samplers = self.samplers.len(),
            interval_ms = self.config.interval.as_millis() as u64,
            "sampler started"
        );
    }
}

impl Drop for SamplerLauncher {
    fn drop(&mut self) {
        self.stop();
    }
}
