//! # Per-Stage Timing Counters
//!
//! Lock-free per-worker accumulators for the demodulation stages. Each worker
//! owns one [`DurationStat`]; a [`StatsSink`] holds them all and sums them
//! into a [`DurationSnapshot`] for an external reporter.
//!
//! ## Example
//!
//! ```rust
//! use mimo_demul::stats::{Stage, StageTimer, StatsSink};
//!
//! let sink = StatsSink::new(2);
//! let worker = sink.worker(0).unwrap();
//!
//! {
//!     let _t = StageTimer::new(&worker, Stage::Gather);
//!     // gather...
//! }
//! worker.record_task();
//!
//! let total = sink.aggregate();
//! assert_eq!(total.task_count, 1);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Timed stages of one demodulation task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Whole task
    Total = 0,
    /// Gather/transpose of received samples
    Gather = 1,
    /// Matrix-vector equalization and phase handling
    Equalize = 2,
    /// Soft demodulation and LLR write-back
    Demod = 3,
}

impl Stage {
    pub const COUNT: usize = 4;
    pub const ALL: [Stage; Stage::COUNT] = [Stage::Total, Stage::Gather, Stage::Equalize, Stage::Demod];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Accumulated stage durations of one worker.
#[derive(Debug, Default)]
pub struct DurationStat {
    duration_ns: [AtomicU64; Stage::COUNT],
    task_count: AtomicU64,
}

impl DurationStat {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `ns` nanoseconds to `stage`.
    #[inline]
    pub fn record(&self, stage: Stage, ns: u64) {
        self.duration_ns[stage.index()].fetch_add(ns, Ordering::Relaxed);
    }

    /// Count one completed task.
    #[inline]
    pub fn record_task(&self) {
        self.task_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn duration_ns(&self, stage: Stage) -> u64 {
        self.duration_ns[stage.index()].load(Ordering::Relaxed)
    }

    #[inline]
    pub fn task_count(&self) -> u64 {
        self.task_count.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> DurationSnapshot {
        DurationSnapshot {
            duration_ns: Stage::ALL.map(|s| self.duration_ns(s)),
            task_count: self.task_count(),
        }
    }

    pub fn reset(&self) {
        for d in &self.duration_ns {
            d.store(0, Ordering::Relaxed);
        }
        self.task_count.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time copy of stage counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DurationSnapshot {
    /// Nanoseconds per stage, indexed by [`Stage::index`]
    pub duration_ns: [u64; Stage::COUNT],
    /// Completed tasks
    pub task_count: u64,
}

impl DurationSnapshot {
    #[inline]
    pub fn stage_ns(&self, stage: Stage) -> u64 {
        self.duration_ns[stage.index()]
    }

    /// Mean time per task in `stage`, in microseconds.
    pub fn avg_us(&self, stage: Stage) -> f64 {
        if self.task_count == 0 {
            0.0
        } else {
            self.stage_ns(stage) as f64 / self.task_count as f64 / 1000.0
        }
    }

    fn merge(mut self, other: DurationSnapshot) -> Self {
        for (a, b) in self.duration_ns.iter_mut().zip(other.duration_ns) {
            *a += b;
        }
        self.task_count += other.task_count;
        self
    }
}

/// RAII timer that adds its lifetime to one stage on drop.
pub struct StageTimer<'a> {
    stat: &'a DurationStat,
    stage: Stage,
    start: Instant,
}

impl<'a> StageTimer<'a> {
    #[inline]
    pub fn new(stat: &'a DurationStat, stage: Stage) -> Self {
        Self {
            stat,
            stage,
            start: Instant::now(),
        }
    }
}

impl Drop for StageTimer<'_> {
    fn drop(&mut self) {
        self.stat.record(self.stage, self.start.elapsed().as_nanos() as u64);
    }
}

/// Stage counters of every worker.
#[derive(Debug, Clone)]
pub struct StatsSink {
    workers: Vec<Arc<DurationStat>>,
}

impl StatsSink {
    pub fn new(num_workers: usize) -> Self {
        Self {
            workers: (0..num_workers).map(|_| Arc::new(DurationStat::new())).collect(),
        }
    }

    #[inline]
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Counters of worker `tid`; `None` if `tid` is not below the worker count.
    pub fn worker(&self, tid: usize) -> Option<Arc<DurationStat>> {
        self.workers.get(tid).cloned()
    }

    /// Sum over all workers.
    pub fn aggregate(&self) -> DurationSnapshot {
        self.workers
            .iter()
            .map(|w| w.snapshot())
            .fold(DurationSnapshot::default(), DurationSnapshot::merge)
    }

    pub fn reset(&self) {
        for w in &self.workers {
            w.reset();
        }
    }
}
