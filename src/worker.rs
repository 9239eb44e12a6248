use crate::{
    regdump, Channel, ChannelError, CompletionEvents, CompletionWaiter, DmaEngine, ExitCode,
    Hardware, MonitorEvent, ReadyBarrier, Ring, RunConfig, RunState, SampleSink, SinkFactory,
    TriggerDescriptor, ViewControl, ViewerLink, WaitError, WorkerReport,
};
use crossbeam_channel::Sender;
use log::{debug, error, info, warn};
use std::{
    io,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

/// How often a blocked completion wait checks whether the run was cancelled.
const CANCEL_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Init,
    TriggerConfigured,
    DmaConfigured,
    Ready,
    Running,
    Done,
    Failed,
}

/// Everything a worker shares with the rest of the run.
#[derive(Clone)]
pub struct WorkerContext {
    pub config: Arc<RunConfig>,
    pub hw: Arc<dyn Hardware>,
    pub events: Arc<CompletionEvents>,
    pub barrier: Arc<ReadyBarrier>,
    pub run: Arc<RunState>,
    pub sinks: Arc<dyn SinkFactory>,
    pub monitor: Option<Sender<MonitorEvent>>,
}

/// Drives one channel from trigger setup through the last drained slot.
pub struct ChannelWorker {
    channel: Channel,
    ctx: WorkerContext,
    state: WorkerState,
    code: ExitCode,
    sink: Option<Box<dyn SampleSink>>,
    viewer: Option<Box<dyn ViewerLink>>,
    control: Option<ViewControl>,
    view_block: usize,
    dma: Option<Arc<dyn DmaEngine>>,
    ring: Option<Ring>,
    waiter: Option<CompletionWaiter>,
    signalled_ready: bool,
    torn_down: bool,
    reported: bool,
    transfers: u64,
    bytes_written: u64,
    sink_errors: u64,
}

impl ChannelWorker {
    /// `viewer` is only used when the channel is the live-view channel.
    pub fn new(channel: Channel, ctx: WorkerContext, viewer: Option<Box<dyn ViewerLink>>) -> Self {
        let view_block = ctx.config.viewer.as_ref().map_or(0, |v| v.block_size);
        let viewer = viewer.filter(|_| channel.viewer);
        let control = viewer.as_ref().map(|_| {
            ViewControl::for_channel(
                ctx.hw.board_id(),
                &channel,
                &ctx.config.global,
                view_block,
            )
        });
        Self {
            channel,
            ctx,
            state: WorkerState::Init,
            code: ExitCode::Done,
            sink: None,
            viewer,
            control,
            view_block,
            dma: None,
            ring: None,
            waiter: None,
            signalled_ready: false,
            torn_down: false,
            reported: false,
            transfers: 0,
            bytes_written: 0,
            sink_errors: 0,
        }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn code(&self) -> ExitCode {
        self.code
    }

    pub fn transfers(&self) -> u64 {
        self.transfers
    }

    pub fn sink_errors(&self) -> u64 {
        self.sink_errors
    }

    /// Run on a thread named `ddc-chN`; the thread hands the worker back so
    /// the coordinator can release its buffers and DMA engine in order. A
    /// panic inside the run still tears the channel down and reports
    /// `ThreadError`.
    pub fn spawn(mut self) -> io::Result<JoinHandle<ChannelWorker>> {
        thread::Builder::new()
            .name(format!("ddc-ch{}", self.channel.number()))
            .spawn(move || {
                if panic::catch_unwind(AssertUnwindSafe(|| self.run())).is_err() {
                    error!("Channel {}: worker panicked", self.channel.number());
                    self.fail(ChannelError::Panicked.exit_code());
                    self.finish();
                }
                self
            })
    }

    /// Acquire until the loop count is exhausted or the channel fails, then
    /// tear down and report. Always reports exactly once.
    pub fn run(&mut self) -> ExitCode {
        let n = self.channel.number();
        info!("Channel {}: starting acquisition", n);

        match self.acquire() {
            Ok(()) => {
                self.set_state(WorkerState::Done);
                info!(
                    "Channel {}: done, {} transfers, {} bytes written",
                    n, self.transfers, self.bytes_written
                );
            }
            Err(e) => {
                error!("Channel {}: {}", n, e);
                self.fail(e.exit_code());
            }
        }
        self.finish();
        self.code
    }

    fn fail(&mut self, code: ExitCode) {
        self.code = code;
        self.ctx.run.set_abort();
        self.set_state(WorkerState::Failed);
    }

    fn finish(&mut self) {
        if self.reported {
            return;
        }
        self.reported = true;
        if !self.signalled_ready {
            self.ctx.barrier.withdraw(self.channel.index);
        }
        self.teardown();

        self.ctx.run.report(WorkerReport {
            channel: self.channel.index,
            code: self.code,
            error: (!self.code.is_success()).then(|| self.code.message().to_string()),
            transfers: self.transfers,
            bytes_written: self.bytes_written,
            sink_errors: self.sink_errors,
        });
        self.notify(MonitorEvent::Finished {
            channel: self.channel.index,
            code: self.code,
        });
    }

    fn acquire(&mut self) -> Result<(), ChannelError> {
        self.setup()?;
        self.stream()
    }

    fn setup(&mut self) -> Result<(), ChannelError> {
        let hw = Arc::clone(&self.ctx.hw);
        let config = Arc::clone(&self.ctx.config);
        let index = self.channel.index;

        self.sink = Some(self.ctx.sinks.open(index).map_err(ChannelError::SinkOpen)?);

        let descriptor = TriggerDescriptor::for_ring(
            self.channel.trigger_delay,
            config.ring_depth,
            config.bytes_per_slot,
        );
        hw.arm_trigger(index, &descriptor)
            .map_err(ChannelError::Trigger)?;
        self.set_state(WorkerState::TriggerConfigured);

        let dma = hw.open_dma(index).map_err(ChannelError::DmaOpen)?;
        self.dma = Some(Arc::clone(&dma));
        let ring = Ring::allocate(&dma, config.ring_depth, config.bytes_per_slot)?;
        let regions = ring.regions();
        self.ring = Some(ring);
        dma.load_chain(&regions).map_err(ChannelError::DmaStart)?;
        self.set_state(WorkerState::DmaConfigured);

        self.waiter = Some(self.ctx.events.register(index, &*hw)?);

        regdump::log_channel(&*hw, index, "before DMA start");
        dma.start().map_err(ChannelError::DmaStart)?;
        regdump::log_channel(&*hw, index, "after DMA start");

        self.ctx.barrier.signal_ready(index);
        self.signalled_ready = true;
        self.set_state(WorkerState::Ready);
        Ok(())
    }

    fn stream(&mut self) -> Result<(), ChannelError> {
        let (mut remaining, step) = self.ctx.run.loop_plan();
        let depth = self.ctx.config.ring_depth;
        self.set_state(WorkerState::Running);

        while remaining > 0 {
            for slot in 0..depth {
                self.wait_completion(slot)?;
                self.drain(slot)?;
            }
            remaining -= step;
        }
        Ok(())
    }

    fn wait_completion(&self, slot: usize) -> Result<(), ChannelError> {
        let waiter = self
            .waiter
            .as_ref()
            .ok_or(ChannelError::CompletionLost { slot })?;
        let timeout = self.ctx.config.dma_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                let flag = self.ctx.hw.read_interrupt_flag(self.channel.index);
                warn!(
                    "Channel {}: no completion for slot {}, interrupt flag 0x{:x}",
                    self.channel.number(),
                    slot,
                    flag
                );
                return Err(ChannelError::DmaTimeout { slot, timeout });
            }
            match waiter.wait(left.min(CANCEL_POLL)) {
                Ok(()) => return Ok(()),
                Err(WaitError::TimedOut) => {
                    if self.ctx.run.is_cancelled() {
                        return Err(ChannelError::Cancelled);
                    }
                }
                Err(WaitError::Disconnected) => return Err(ChannelError::CompletionLost { slot }),
            }
        }
    }

    fn drain(&mut self, slot: usize) -> Result<(), ChannelError> {
        let region = self
            .ring
            .as_ref()
            .and_then(|ring| ring.slot(slot))
            .cloned()
            .ok_or(ChannelError::SlotOwnership { slot })?;
        let filled = region
            .sync_for_cpu()
            .map_err(|_| ChannelError::SlotOwnership { slot })?;
        let unit = self.ctx.config.bytes_per_transfer_unit.min(filled.len());
        let data = &filled[..unit];

        if let Some(sink) = self.sink.as_mut() {
            match sink.write(data) {
                Ok(()) => self.bytes_written += unit as u64,
                Err(e) => {
                    warn!(
                        "Channel {}: failure writing slot {} to file: {}",
                        self.channel.number(),
                        slot,
                        e
                    );
                    self.sink_errors += 1;
                    self.code = ExitCode::FileWrite;
                    self.notify(MonitorEvent::SinkError {
                        channel: self.channel.index,
                    });
                }
            }
        }

        if let (Some(viewer), Some(control)) = (self.viewer.as_mut(), self.control.as_ref()) {
            viewer
                .send(data, self.view_block, control)
                .map_err(ChannelError::ViewerSend)?;
        }

        filled.recycle();
        self.transfers += 1;
        self.ctx.run.record_drain(self.channel.index);
        self.notify(MonitorEvent::Drained {
            channel: self.channel.index,
            bytes: unit,
        });
        Ok(())
    }

    /// Stop the channel and close its endpoints. Safe to call more than once.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        let hw = Arc::clone(&self.ctx.hw);
        let index = self.channel.index;

        hw.clear_trigger(index);
        if let Some(dma) = &self.dma {
            dma.abort();
        }
        if self.waiter.take().is_some() {
            self.ctx.events.unregister(index, &*hw);
        }
        if let Some(mut sink) = self.sink.take() {
            if let Err(e) = sink.close() {
                warn!("Channel {}: closing output file: {}", index + 1, e);
                self.sink_errors += 1;
                if self.code.is_success() {
                    self.code = ExitCode::FileWrite;
                }
                self.notify(MonitorEvent::SinkError { channel: index });
            }
        }
        if let Some(mut viewer) = self.viewer.take() {
            viewer.close();
        }
        debug!("Channel {}: torn down", index + 1);
    }

    /// Release the ring's DMA regions. Returns how many were freed.
    pub fn free_buffers(&mut self) -> usize {
        self.ring.take().map_or(0, |mut ring| ring.free())
    }

    /// Close the DMA engine. Returns false if it was already closed.
    pub fn close_dma(&mut self) -> bool {
        match self.dma.take() {
            Some(dma) => {
                dma.close();
                true
            }
            None => false,
        }
    }

    fn set_state(&mut self, state: WorkerState) {
        debug!(
            "Channel {}: {:?} -> {:?}",
            self.channel.number(),
            self.state,
            state
        );
        self.state = state;
        self.notify(MonitorEvent::State {
            channel: self.channel.index,
            state,
        });
    }

    fn notify(&self, event: MonitorEvent) {
        if let Some(monitor) = &self.ctx.monitor {
            let _ = monitor.send(event);
        }
    }
}
