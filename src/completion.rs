use crate::{ChannelError, Hardware, HardwareError};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("timed out waiting for DMA completion")]
    TimedOut,
    #[error("completion interrupt was disabled")]
    Disconnected,
}

/// Per-channel counting completion signals.
///
/// The table lock is the process-wide interrupt lock: registration,
/// hardware interrupt enable/disable and every dispatch take it, so an
/// interrupt can never be disabled while its dispatch is half done.
pub struct CompletionEvents {
    table: Mutex<Vec<Option<Sender<()>>>>,
}

impl CompletionEvents {
    pub fn new(channels: usize) -> Arc<Self> {
        Arc::new(Self {
            table: Mutex::new(vec![None; channels]),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Option<Sender<()>>>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create the channel's completion signal and enable its interrupt.
    pub fn register(
        self: &Arc<Self>,
        channel: usize,
        hw: &dyn Hardware,
    ) -> Result<CompletionWaiter, ChannelError> {
        let mut table = self.lock();
        let entry = table.get_mut(channel).ok_or(ChannelError::InterruptEnable(
            HardwareError::ChannelUnavailable(channel),
        ))?;
        if entry.is_some() {
            return Err(ChannelError::AlreadyRegistered(channel));
        }
        let (tx, rx) = unbounded();
        let poster = CompletionPoster {
            events: Arc::clone(self),
            channel,
        };
        hw.enable_interrupt(channel, poster)
            .map_err(ChannelError::InterruptEnable)?;
        *entry = Some(tx);
        Ok(CompletionWaiter { channel, rx })
    }

    /// Disable the channel's interrupt and drop its signal. Returns false if
    /// nothing was registered.
    pub fn unregister(&self, channel: usize, hw: &dyn Hardware) -> bool {
        let mut table = self.lock();
        match table.get_mut(channel).and_then(Option::take) {
            Some(_) => {
                hw.disable_interrupt(channel);
                true
            }
            None => false,
        }
    }

    /// Interrupt path: count one completion for `channel`. Dropped (and
    /// `false`) when the channel has no live registration.
    pub fn post(&self, channel: usize) -> bool {
        let table = self.lock();
        match table.get(channel) {
            Some(Some(tx)) => tx.send(()).is_ok(),
            _ => false,
        }
    }

    pub fn is_registered(&self, channel: usize) -> bool {
        matches!(self.lock().get(channel), Some(Some(_)))
    }
}

/// Handle given to the hardware so its interrupt path can post completions.
#[derive(Clone)]
pub struct CompletionPoster {
    events: Arc<CompletionEvents>,
    channel: usize,
}

impl CompletionPoster {
    pub fn channel(&self) -> usize {
        self.channel
    }

    pub fn post(&self) -> bool {
        self.events.post(self.channel)
    }
}

impl fmt::Debug for CompletionPoster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionPoster")
            .field("channel", &self.channel)
            .finish()
    }
}

/// The single consumer side of one channel's completion signal.
pub struct CompletionWaiter {
    channel: usize,
    rx: Receiver<()>,
}

impl CompletionWaiter {
    pub fn channel(&self) -> usize {
        self.channel
    }

    /// Consume one completion, blocking up to `timeout`.
    pub fn wait(&self, timeout: Duration) -> Result<(), WaitError> {
        match self.rx.recv_timeout(timeout) {
            Ok(()) => Ok(()),
            Err(RecvTimeoutError::Timeout) => Err(WaitError::TimedOut),
            Err(RecvTimeoutError::Disconnected) => Err(WaitError::Disconnected),
        }
    }

    /// Completions posted but not yet consumed.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}
