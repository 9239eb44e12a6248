use crate::BYTES_PER_WORD;
use log::{info, warn};
use std::{
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

/// Shortest trigger delay the trigger engine accepts, in sample clocks.
pub const MIN_TRIGGER_DELAY: u32 = 10;

/// Per-channel trigger state machine as seen by the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    Reset,
    Armed,
    WaitingForExternalTrigger,
    Running,
}

/// What gets written into a channel's trigger engine before it is armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerDescriptor {
    pub delay: u32,
    /// Capture length in 32-bit words, minus one.
    pub length: u32,
    pub repeat: u32,
}

impl TriggerDescriptor {
    /// One capture covering the whole ring.
    pub fn for_ring(delay: u32, ring_depth: usize, bytes_per_slot: usize) -> Self {
        let delay = if delay < MIN_TRIGGER_DELAY {
            warn!(
                "Trigger delay {} below minimum, using {}",
                delay, MIN_TRIGGER_DELAY
            );
            MIN_TRIGGER_DELAY
        } else {
            delay
        };
        let words = (ring_depth * bytes_per_slot / BYTES_PER_WORD).max(1);
        Self {
            delay,
            length: u32::try_from(words - 1).unwrap_or(u32::MAX),
            repeat: 1,
        }
    }
}

#[derive(Debug, Default)]
struct Arrivals {
    ready: Vec<usize>,
    withdrawn: Vec<usize>,
}

impl Arrivals {
    fn resolved(&self) -> usize {
        self.ready.len() + self.withdrawn.len()
    }
}

/// How the barrier resolved: who made it to ready and who dropped out first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarrierOutcome {
    pub ready: Vec<usize>,
    pub withdrawn: Vec<usize>,
}

impl BarrierOutcome {
    /// A pulse is only worth firing if someone is listening for it.
    pub fn should_pulse(&self) -> bool {
        !self.ready.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{ready} of {expected} channels ready after {timeout:?}")]
pub struct ReadyTimeout {
    pub ready: usize,
    pub expected: usize,
    pub timeout: Duration,
}

/// Gathers every worker at the ready point before the trigger pulse goes out.
///
/// A worker that fails during setup withdraws instead of arriving, so the
/// coordinator is never left waiting for a channel that will not come.
pub struct ReadyBarrier {
    expected: usize,
    arrivals: Mutex<Arrivals>,
    cond: Condvar,
}

impl ReadyBarrier {
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            arrivals: Mutex::new(Arrivals::default()),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Arrivals> {
        self.arrivals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn signal_ready(&self, channel: usize) {
        let mut arrivals = self.lock();
        if !arrivals.ready.contains(&channel) && !arrivals.withdrawn.contains(&channel) {
            arrivals.ready.push(channel);
        }
        self.cond.notify_all();
    }

    pub fn withdraw(&self, channel: usize) {
        let mut arrivals = self.lock();
        if !arrivals.ready.contains(&channel) && !arrivals.withdrawn.contains(&channel) {
            arrivals.withdrawn.push(channel);
        }
        self.cond.notify_all();
    }

    /// Block until every expected channel is ready or withdrawn. `None` waits
    /// forever.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<BarrierOutcome, ReadyTimeout> {
        let arrivals = self.lock();
        let arrivals = match timeout {
            None => self
                .cond
                .wait_while(arrivals, |a| a.resolved() < self.expected)
                .unwrap_or_else(PoisonError::into_inner),
            Some(timeout) => {
                let (arrivals, result) = self
                    .cond
                    .wait_timeout_while(arrivals, timeout, |a| a.resolved() < self.expected)
                    .unwrap_or_else(PoisonError::into_inner);
                if result.timed_out() && arrivals.resolved() < self.expected {
                    return Err(ReadyTimeout {
                        ready: arrivals.ready.len(),
                        expected: self.expected,
                        timeout,
                    });
                }
                arrivals
            }
        };

        let mut ready = arrivals.ready.clone();
        ready.sort_unstable();
        let mut withdrawn = arrivals.withdrawn.clone();
        withdrawn.sort_unstable();
        info!(
            "{} of {} channels ready, {} withdrawn",
            ready.len(),
            self.expected,
            withdrawn.len()
        );
        Ok(BarrierOutcome { ready, withdrawn })
    }
}
