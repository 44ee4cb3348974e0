//! # Demodulation Worker Pool
//!
//! A fixed set of named worker threads, optionally pinned to CPUs, each
//! owning one [`DoDemul`]. Workers pull [`TaskTag`]s from a shared bounded
//! queue, run them to completion and push the resulting [`EventData`] onto a
//! completion queue for the scheduler. A task that fails or panics is logged,
//! recorded as a [`TaskFailure`] and produces no event; the worker carries on
//! with the next task.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mimo_demul::prelude::*;
//!
//! let cfg = Arc::new(DemulConfig::default());
//! let window = Arc::new(FrameWindow::new(&cfg).unwrap());
//! let pilots = Arc::new(PilotSequence::generate(cfg.ofdm_data_num, cfg.ue_num, 1));
//!
//! let pool = WorkerPool::start(Arc::clone(&cfg), window, pilots, None).unwrap();
//! pool.submit(TaskTag::frm_sym_sc(0, 0, 0)).unwrap();
//! while pool.poll_completion().is_none() {
//!     std::thread::yield_now();
//! }
//! pool.shutdown().unwrap();
//! ```

use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::config::DemulConfig;
use crate::demul::DoDemul;
use crate::error::{DemulError, DemulResult};
use crate::frame_window::FrameWindow;
use crate::phase::PilotSequence;
use crate::phy_stats::PhyStats;
use crate::stats::StatsSink;
use crate::tag::{EventData, TaskTag};

/// A task that did not complete.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFailure {
    pub tid: usize,
    pub tag: TaskTag,
    pub error: DemulError,
}

/// Spawn a named thread, pinned to `cpu` when given.
///
/// Failing to pin is logged and the thread runs unpinned.
pub fn spawn_worker<F, T>(name: String, cpu: Option<usize>, f: F) -> DemulResult<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    thread::Builder::new()
        .name(name)
        .spawn(move || {
            if let Some(cpu) = cpu {
                if let Err(e) = set_cpu_affinity(cpu) {
                    tracing::warn!("Failed to set CPU affinity: {}", e);
                }
            }
            f()
        })
        .map_err(|e| DemulError::Worker(format!("failed to spawn thread: {}", e)))
}

#[cfg(target_os = "linux")]
fn set_cpu_affinity(cpu: usize) -> Result<(), String> {
    use std::mem;

    if cpu >= libc::CPU_SETSIZE as usize {
        return Err(format!("cpu {} beyond CPU_SETSIZE", cpu));
    }

    unsafe {
        let mut set: libc::cpu_set_t = mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);

        let result = libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &set);
        if result != 0 {
            return Err(format!(
                "sched_setaffinity failed: {}",
                std::io::Error::last_os_error()
            ));
        }
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_cpu_affinity(_cpu: usize) -> Result<(), String> {
    tracing::debug!("CPU affinity not supported on this platform");
    Ok(())
}

struct Shared {
    tasks: ArrayQueue<TaskTag>,
    completions: ArrayQueue<EventData>,
    failures: Mutex<Vec<TaskFailure>>,
    running: AtomicBool,
}

/// Pool of demodulation workers sharing one task queue.
pub struct WorkerPool {
    shared: Arc<Shared>,
    stats: StatsSink,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Build one [`DoDemul`] per configured worker and start the threads.
    ///
    /// Construction errors (configuration, allocation, kernel planning) are
    /// returned before any thread is spawned.
    pub fn start(
        cfg: Arc<DemulConfig>,
        window: Arc<FrameWindow>,
        pilots: Arc<PilotSequence>,
        phy_stats: Option<Arc<PhyStats>>,
    ) -> DemulResult<Self> {
        let num_workers = cfg.worker.num_workers;
        if num_workers == 0 || cfg.worker.queue_capacity == 0 {
            return Err(DemulError::InvalidConfig(
                "worker pool needs at least one worker and a non-empty queue".to_string(),
            ));
        }

        let stats = StatsSink::new(num_workers);
        let mut workers = Vec::with_capacity(num_workers);
        for tid in 0..num_workers {
            let mut demul = DoDemul::new(
                Arc::clone(&cfg),
                tid,
                Arc::clone(&window),
                Arc::clone(&pilots),
                &stats,
            )?;
            if let Some(phy) = &phy_stats {
                demul = demul.with_phy_stats(Arc::clone(phy))?;
            }
            workers.push(demul);
        }

        let shared = Arc::new(Shared {
            tasks: ArrayQueue::new(cfg.worker.queue_capacity),
            completions: ArrayQueue::new(cfg.worker.queue_capacity),
            failures: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
        });

        let mut pool = Self {
            shared,
            stats,
            handles: Vec::with_capacity(num_workers),
        };

        for (tid, demul) in workers.into_iter().enumerate() {
            let name = format!("{}-{}", cfg.worker.name_prefix, tid);
            let cpu = match cfg.worker.cpu_affinity.as_slice() {
                [] => None,
                cpus => Some(cpus[tid % cpus.len()]),
            };
            let shared = Arc::clone(&pool.shared);
            // Threads already started are joined when `pool` drops
            let handle = spawn_worker(name, cpu, move || worker_loop(demul, &shared))?;
            pool.handles.push(handle);
        }

        tracing::info!(num_workers, "demul worker pool started");
        Ok(pool)
    }

    /// Queue a task; hands the tag back if the queue is full.
    pub fn submit(&self, tag: TaskTag) -> Result<(), TaskTag> {
        self.shared.tasks.push(tag)
    }

    /// Next completion event, if any.
    pub fn poll_completion(&self) -> Option<EventData> {
        self.shared.completions.pop()
    }

    /// Drain the recorded task failures.
    pub fn take_failures(&self) -> Vec<TaskFailure> {
        std::mem::take(&mut *self.shared.failures.lock())
    }

    /// Stage counters of all workers.
    pub fn stats(&self) -> &StatsSink {
        &self.stats
    }

    pub fn num_workers(&self) -> usize {
        self.stats.num_workers()
    }

    /// Stop the workers after their current task and join them.
    ///
    /// Tasks still queued are discarded.
    pub fn shutdown(mut self) -> DemulResult<()> {
        self.stop()
    }

    fn stop(&mut self) -> DemulResult<()> {
        self.shared.running.store(false, Ordering::Release);
        let mut result = Ok(());
        for handle in self.handles.drain(..) {
            let name = handle.thread().name().unwrap_or("demul").to_string();
            if handle.join().is_err() {
                tracing::error!(worker = %name, "demul worker panicked");
                result = Err(DemulError::Worker(format!("{} panicked", name)));
            }
        }
        result
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn worker_loop(mut demul: DoDemul, shared: &Shared) {
    let tid = demul.tid();
    tracing::debug!(tid, "demul worker running");

    while shared.running.load(Ordering::Acquire) {
        let Some(tag) = shared.tasks.pop() else {
            thread::yield_now();
            continue;
        };
        if !run_task(&mut demul, tag, shared) {
            return;
        }
    }

    tracing::debug!(tid, "demul worker stopped");
}

/// Run one task and publish its outcome. Returns `false` once the pool
/// stops while a completion is still waiting for queue space.
fn run_task(demul: &mut DoDemul, tag: TaskTag, shared: &Shared) -> bool {
    let tid = demul.tid();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| demul.launch(tag))).unwrap_or_else(|payload| {
        Err(DemulError::Worker(format!(
            "task panicked: {}",
            panic_message(&*payload)
        )))
    });

    match outcome {
        Ok(mut event) => {
            // Wait for the scheduler to drain completions
            while let Err(back) = shared.completions.push(event) {
                if !shared.running.load(Ordering::Acquire) {
                    return false;
                }
                event = back;
                thread::yield_now();
            }
        }
        Err(error) => {
            tracing::error!(tid, tag = %tag, error = %error, "demul task failed");
            shared.failures.lock().push(TaskFailure { tid, tag, error });
        }
    }
    true
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
