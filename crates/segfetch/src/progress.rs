use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Receives job progress as a percentage in `[0, 100]`.
pub trait ProgressSink: Send + Sync {
    fn report(&self, percent: f64);
}

impl<F> ProgressSink for F
where
    F: Fn(f64) + Send + Sync,
{
    fn report(&self, percent: f64) {
        self(percent)
    }
}

pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Default)]
struct Emitted {
    percent: f64,
    at: Option<Instant>,
}

/// Monotonic progress counter that throttles what reaches the sink: a value
/// is emitted only when it is higher than the last emitted one and either it
/// reached 100 or the interval has passed since the last emission.
pub struct ProgressReporter {
    total: AtomicU64,
    done: AtomicU64,
    interval: Duration,
    last: Mutex<Emitted>,
    sink: Arc<dyn ProgressSink>,
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("total", &self.total)
            .field("done", &self.done)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl ProgressReporter {
    pub fn new(total: u64, sink: Arc<dyn ProgressSink>) -> Self {
        Self::with_interval(total, sink, DEFAULT_REPORT_INTERVAL)
    }

    pub fn with_interval(total: u64, sink: Arc<dyn ProgressSink>, interval: Duration) -> Self {
        Self {
            total: AtomicU64::new(total),
            done: AtomicU64::new(0),
            interval,
            last: Mutex::new(Emitted::default()),
            sink,
        }
    }

    /// Change the denominator, e.g. once a probe learned the length.
    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::SeqCst);
    }

    /// Count `units` more as done.
    pub fn advance(&self, units: u64) {
        let done = self.done.fetch_add(units, Ordering::SeqCst).saturating_add(units);
        self.emit(self.percent_of(done));
    }

    /// Raise the done counter to `done`. Lower values are ignored.
    pub fn update(&self, done: u64) {
        let previous = self.done.fetch_max(done, Ordering::SeqCst);
        self.emit(self.percent_of(previous.max(done)));
    }

    /// Report 100 unless it was already reported.
    pub fn complete(&self) {
        let total = self.total.load(Ordering::SeqCst);
        self.done.fetch_max(total, Ordering::SeqCst);
        self.emit(100.0);
    }

    pub fn done(&self) -> u64 {
        self.done.load(Ordering::SeqCst)
    }

    pub fn percent(&self) -> f64 {
        self.percent_of(self.done())
    }

    fn percent_of(&self, done: u64) -> f64 {
        let total = self.total.load(Ordering::SeqCst);
        if total == 0 {
            return 0.0;
        }
        (done as f64 / total as f64 * 100.0).min(100.0)
    }

    fn emit(&self, percent: f64) {
        let mut last = self.last.lock();
        if percent <= last.percent {
            return;
        }
        let now = Instant::now();
        let due = percent >= 100.0
            || last
                .at
                .is_none_or(|at| now.duration_since(at) >= self.interval);
        if !due {
            return;
        }

        last.percent = percent;
        last.at = Some(now);
        // Emitting under the lock keeps the sink's view monotonic.
        self.sink.report(percent);
    }
}
