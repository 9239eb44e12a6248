use crate::{ExitCode, WorkerState};
use std::{
    collections::{BTreeMap, VecDeque},
    time::{Duration, Instant},
};

/// Progress notifications a worker sends to whoever is watching the run.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    State { channel: usize, state: WorkerState },
    Drained { channel: usize, bytes: usize },
    SinkError { channel: usize },
    Finished { channel: usize, code: ExitCode },
}

/// Transfer statistics with *all-time* counters and a *sliding 1 s window*
/// rate.
#[derive(Debug, Clone)]
pub struct Counter {
    /// All-time total bytes
    pub total_size: usize,
    /// All-time number of drained slots
    pub n_transfers: usize,
    /// When the first slot was drained; channels start at different times
    first_transfer: Option<Instant>,

    window: Duration,
    transfers: VecDeque<(Instant, usize)>,
    bytes_in_window: usize,
}

impl Default for Counter {
    fn default() -> Self {
        Counter {
            total_size: 0,
            n_transfers: 0,
            first_transfer: None,
            window: Duration::from_secs(1),
            transfers: VecDeque::new(),
            bytes_in_window: 0,
        }
    }
}

impl Counter {
    pub fn new() -> Self {
        Default::default()
    }

    /// Average rate from the first drained slot until `now`, in MB/s.
    /// Zero before anything was drained.
    pub fn average_rate(&self, now: Instant) -> f64 {
        let Some(first) = self.first_transfer else {
            return 0.0;
        };
        let secs = now.duration_since(first).as_secs_f64().max(self.window.as_secs_f64());
        (self.total_size as f64 / secs) / (1024.0 * 1024.0)
    }

    /// Rate over the last window, in MB/s
    pub fn rate(&self) -> f64 {
        let secs = self.window.as_secs_f64().max(1e-6);
        (self.bytes_in_window as f64 / secs) / (1024.0 * 1024.0)
    }

    pub fn increment(&mut self, size: usize) {
        let now = Instant::now();
        self.first_transfer.get_or_insert(now);
        self.total_size += size;
        self.n_transfers += 1;
        self.transfers.push_back((now, size));
        self.bytes_in_window += size;
        self.evict(now);
    }

    /// Drop window entries older than the window. Called on every increment
    /// and before reading a rate from an idle channel.
    pub fn evict(&mut self, now: Instant) {
        while let Some(&(ts, sz)) = self.transfers.front() {
            if now.duration_since(ts) > self.window {
                self.transfers.pop_front();
                self.bytes_in_window -= sz;
            } else {
                break;
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChannelStats {
    pub state: WorkerState,
    pub counter: Counter,
    pub sink_errors: usize,
    pub exit: Option<ExitCode>,
}

impl Default for ChannelStats {
    fn default() -> Self {
        Self {
            state: WorkerState::Init,
            counter: Counter::new(),
            sink_errors: 0,
            exit: None,
        }
    }
}

/// Per-channel view of the run built from [`MonitorEvent`]s.
#[derive(Debug, Default)]
pub struct RunStats {
    pub channels: BTreeMap<usize, ChannelStats>,
}

impl RunStats {
    pub fn new(channels: impl IntoIterator<Item = usize>) -> Self {
        Self {
            channels: channels
                .into_iter()
                .map(|ch| (ch, ChannelStats::default()))
                .collect(),
        }
    }

    pub fn apply(&mut self, event: &MonitorEvent) {
        match *event {
            MonitorEvent::State { channel, state } => self.entry(channel).state = state,
            MonitorEvent::Drained { channel, bytes } => self.entry(channel).counter.increment(bytes),
            MonitorEvent::SinkError { channel } => self.entry(channel).sink_errors += 1,
            MonitorEvent::Finished { channel, code } => self.entry(channel).exit = Some(code),
        }
    }

    fn entry(&mut self, channel: usize) -> &mut ChannelStats {
        self.channels.entry(channel).or_default()
    }

    pub fn total_rate(&self) -> f64 {
        self.channels.values().map(|c| c.counter.rate()).sum()
    }

    pub fn all_finished(&self) -> bool {
        self.channels.values().all(|c| c.exit.is_some())
    }
}
