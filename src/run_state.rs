use crate::ExitCode;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

/// What a worker hands back when it finishes, on every path.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerReport {
    pub channel: usize,
    pub code: ExitCode,
    pub error: Option<String>,
    pub transfers: u64,
    pub bytes_written: u64,
    pub sink_errors: u64,
}

/// Shared state of one run. Created before any worker starts and dropped
/// after the last join.
pub struct RunState {
    loop_count: u32,
    abort: AtomicBool,
    cancelled: AtomicBool,
    drained: BTreeMap<usize, AtomicU64>,
    reports: Sender<WorkerReport>,
}

impl RunState {
    pub fn new(loop_count: u32, channels: &[usize]) -> (Arc<Self>, Receiver<WorkerReport>) {
        let (reports, rx) = unbounded();
        let state = Self {
            loop_count,
            abort: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            drained: channels.iter().map(|&ch| (ch, AtomicU64::new(0))).collect(),
            reports,
        };
        (Arc::new(state), rx)
    }

    pub fn loop_count(&self) -> u32 {
        self.loop_count
    }

    /// Starting value of the remaining-passes counter and the amount it drops
    /// per ring pass. A loop count of zero never counts down, so the run goes
    /// on until the channel fails.
    pub fn loop_plan(&self) -> (u32, u32) {
        if self.loop_count == 0 {
            (1, 0)
        } else {
            (self.loop_count, 1)
        }
    }

    /// Set by a worker on a fatal error. Siblings keep running.
    pub fn set_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// Set by the coordinator when the trigger pulse will never be sent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn record_drain(&self, channel: usize) {
        if let Some(count) = self.drained.get(&channel) {
            count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn drained(&self, channel: usize) -> u64 {
        self.drained
            .get(&channel)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    pub fn report(&self, report: WorkerReport) {
        let _ = self.reports.send(report);
    }
}
