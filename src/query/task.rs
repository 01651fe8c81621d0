//! QueryTask - per-series-group unit of work
//!
//! One task owns every [`TimeSeries`] sharing a series key, reads each of
//! them over the query range (through the task's downsampler when one is
//! configured), and leaves the merged points in its local vector for the
//! result assembler.
//!
//! Tasks run on the executor's worker pool or inline on the request
//! thread; either way the attached [`CountingSignal`] fires exactly once
//! when the task reaches a terminal state, including on storage errors and
//! on cancellation during shutdown. The waiter would deadlock otherwise.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

use crate::query::downsample::Downsampler;
use crate::query::executor::CountingSignal;
use crate::storage::TimeSeries;
use crate::types::{DataPointVector, TagList, TimeRange};

/// Task lifecycle: `Fresh → Queued → Running → Done`, with
/// `Queued → Cancelled → Done` during shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Created, not yet handed to the executor
    Fresh = 0,
    /// Sitting in the executor queue
    Queued = 1,
    /// A worker is reading series
    Running = 2,
    /// Abandoned by executor shutdown before running
    Cancelled = 3,
    /// Terminal; the signal has fired
    Done = 4,
}

impl TaskState {
    fn from_u8(v: u8) -> TaskState {
        match v {
            0 => TaskState::Fresh,
            1 => TaskState::Queued,
            2 => TaskState::Running,
            3 => TaskState::Cancelled,
            _ => TaskState::Done,
        }
    }
}

/// Per-series-group retrieval + downsampling unit of work.
pub struct QueryTask {
    time_range: TimeRange,
    tsv: Vec<Arc<dyn TimeSeries>>,
    downsampler: Mutex<Option<Downsampler>>,
    dps: Mutex<DataPointVector>,
    signal: Mutex<Option<Arc<CountingSignal>>>,
    state: AtomicU8,
}

impl QueryTask {
    /// Create a task over a non-empty series group.
    pub fn new(
        time_range: TimeRange,
        tsv: Vec<Arc<dyn TimeSeries>>,
        downsampler: Option<Downsampler>,
    ) -> Self {
        debug_assert!(!tsv.is_empty());
        Self {
            time_range,
            tsv,
            downsampler: Mutex::new(downsampler),
            dps: Mutex::new(Vec::new()),
            signal: Mutex::new(None),
            state: AtomicU8::new(TaskState::Fresh as u8),
        }
    }

    /// Attach the caller's barrier; fired once on any terminal state.
    pub fn set_signal(&self, signal: Arc<CountingSignal>) {
        *self.signal.lock() = Some(signal);
    }

    /// Mark the task queued; called by the executor on submit.
    pub(crate) fn mark_queued(&self) {
        self.state
            .store(TaskState::Queued as u8, Ordering::Release);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Run the retrieval: read every owned series over the range, close
    /// the downsampler, signal.
    ///
    /// Storage errors are logged and swallowed here; a failed task
    /// contributes an empty vector rather than failing the query.
    pub fn perform(&self) {
        self.state
            .store(TaskState::Running as u8, Ordering::Release);
        let _guard = SignalGuard(self);

        let mut dps = self.dps.lock();
        let mut downsampler = self.downsampler.lock();

        for ts in &self.tsv {
            if let Err(e) = ts.query(self.time_range, downsampler.as_mut(), &mut dps) {
                error!(key = %ts.key(), error = %e, "series read failed; dropping its contribution");
            }
        }

        if let Some(ds) = downsampler.as_mut() {
            ds.fill_if_needed(&mut dps);
        }
        *downsampler = None;

        debug!(points = dps.len(), series = self.tsv.len(), "query task done");
    }

    /// Cancel a queued task during shutdown. Terminal, still signals.
    pub fn cancel(&self) {
        self.state
            .store(TaskState::Cancelled as u8, Ordering::Release);
        let _guard = SignalGuard(self);
    }

    /// Tags of the series group (all members share a key, so the first
    /// member's canonical tags stand for the group).
    pub fn tags(&self) -> TagList {
        self.tsv[0].tags()
    }

    /// Number of series this task owns.
    pub fn series_count(&self) -> usize {
        self.tsv.len()
    }

    /// Move the collected points out of the task.
    pub fn take_dps(&self) -> DataPointVector {
        std::mem::take(&mut *self.dps.lock())
    }
}

/// Fires the task's signal exactly once when the scope ends, even if the
/// scope unwinds; then marks the task done.
struct SignalGuard<'a>(&'a QueryTask);

impl Drop for SignalGuard<'_> {
    fn drop(&mut self) {
        self.0
            .state
            .store(TaskState::Done as u8, Ordering::Release);
        if let Some(signal) = self.0.signal.lock().take() {
            signal.count_down();
        }
    }
}
