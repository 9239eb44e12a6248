use crate::{
    regdump, ChannelWorker, CompletionEvents, ExitCode, Hardware, MonitorEvent, ReadyBarrier,
    RunConfig, RunState, SinkFactory, TcpViewerLink, ViewerLink, WorkerContext, WorkerReport,
};
use crossbeam_channel::Sender;
use log::{error, info, warn};
use std::{
    path::PathBuf,
    sync::Arc,
    thread::JoinHandle,
};

/// Outcome of a whole run: the coordinator's own code plus one report per
/// channel, in channel order.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub coordinator: ExitCode,
    pub channels: Vec<WorkerReport>,
    /// At least one channel stopped on a fatal error.
    pub aborted: bool,
    escalate_sink_errors: bool,
}

impl RunReport {
    fn new(config: &RunConfig) -> Self {
        Self {
            coordinator: ExitCode::Done,
            channels: Vec::new(),
            aborted: false,
            escalate_sink_errors: config.escalate_sink_errors,
        }
    }

    pub fn channel(&self, index: usize) -> Option<&WorkerReport> {
        self.channels.iter().find(|r| r.channel == index)
    }

    /// One line per nonzero code, coordinator first.
    pub fn lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if !self.coordinator.is_success() {
            lines.push(format!(
                "Coordinator: {} ({})",
                self.coordinator.message(),
                self.coordinator.code()
            ));
        }
        for report in &self.channels {
            if !report.code.is_success() {
                lines.push(format!(
                    "Channel {}: {} ({})",
                    report.channel + 1,
                    report.code.message(),
                    report.code.code()
                ));
            }
        }
        lines
    }

    pub fn log(&self) {
        let lines = self.lines();
        if lines.is_empty() {
            info!("{}", ExitCode::Done.message());
        }
        for line in lines {
            error!("{}", line);
        }
    }

    /// Process exit status. Sink write failures only count when escalation
    /// is enabled.
    pub fn exit_status(&self) -> i32 {
        if !self.coordinator.is_success() {
            return self.coordinator.code();
        }
        if self.escalate_sink_errors && self.channels.iter().any(|r| r.sink_errors > 0) {
            return ExitCode::FileWrite.code();
        }
        ExitCode::Done.code()
    }
}

/// Owns one acquisition run from hardware init to teardown.
pub struct Coordinator {
    config: Arc<RunConfig>,
    hw: Arc<dyn Hardware>,
    sinks: Arc<dyn SinkFactory>,
    viewer_link: Option<Box<dyn ViewerLink>>,
    monitor: Option<Sender<MonitorEvent>>,
    dump_dir: Option<PathBuf>,
}

impl Coordinator {
    pub fn new(config: RunConfig, hw: Arc<dyn Hardware>, sinks: Arc<dyn SinkFactory>) -> Self {
        Self {
            config: Arc::new(config),
            hw,
            sinks,
            viewer_link: None,
            monitor: None,
            dump_dir: None,
        }
    }

    /// Use `link` for live view instead of connecting over TCP.
    pub fn with_viewer_link(mut self, link: Box<dyn ViewerLink>) -> Self {
        self.viewer_link = Some(link);
        self
    }

    pub fn with_monitor(mut self, monitor: Sender<MonitorEvent>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Directory that receives the register dump file.
    pub fn with_dump_dir(mut self, dir: PathBuf) -> Self {
        self.dump_dir = Some(dir);
        self
    }

    pub fn run(mut self) -> RunReport {
        let mut report = RunReport::new(&self.config);
        if let Err(code) = self.execute(&mut report) {
            report.coordinator = code;
        }
        self.hw.shutdown();
        report.log();
        report
    }

    fn execute(&mut self, report: &mut RunReport) -> Result<(), ExitCode> {
        let config = Arc::clone(&self.config);
        let hw = Arc::clone(&self.hw);

        let available = hw.channel_count();
        if available == 0 {
            error!("Board reports no channels");
            return Err(ExitCode::InvalidMaxChannels);
        }
        if let Some(ch) = config.channels.iter().find(|c| c.index >= available) {
            error!(
                "Channel {} requested but the board has {} channels",
                ch.number(),
                available
            );
            return Err(ExitCode::ChannelUnavailable);
        }

        hw.configure(&config.global).map_err(|e| {
            error!("Board init failed: {}", e);
            e.exit_code()
        })?;
        for channel in &config.channels {
            hw.configure_channel(channel, &config.global).map_err(|e| {
                error!("Channel {} configuration failed: {}", channel.number(), e);
                e.exit_code()
            })?;
        }
        if config.reg_dump {
            regdump::log_all(&*hw, &config.channels);
            if let Some(dir) = &self.dump_dir {
                if let Err(e) =
                    regdump::write_dump(dir, &config.sink.file_prefix, &*hw, &config.channels)
                {
                    warn!("Register dump not written: {}", e);
                }
            }
        }

        let viewer = self.connect_viewer()?;
        self.acquire(report, viewer)
    }

    fn connect_viewer(&mut self) -> Result<Option<Box<dyn ViewerLink>>, ExitCode> {
        let Some(target) = &self.config.viewer else {
            return Ok(None);
        };
        if let Some(link) = self.viewer_link.take() {
            return Ok(Some(link));
        }
        match TcpViewerLink::connect(&target.host, target.port) {
            Ok(link) => Ok(Some(Box::new(link))),
            Err(e) => {
                error!("{}", e);
                Err(e.exit_code())
            }
        }
    }

    fn acquire(
        &mut self,
        report: &mut RunReport,
        mut viewer: Option<Box<dyn ViewerLink>>,
    ) -> Result<(), ExitCode> {
        let config = Arc::clone(&self.config);
        let indices: Vec<usize> = config.channels.iter().map(|c| c.index).collect();
        let (run, reports) = RunState::new(config.loop_count, &indices);
        let barrier = Arc::new(ReadyBarrier::new(config.channels.len()));
        let ctx = WorkerContext {
            config: Arc::clone(&config),
            hw: Arc::clone(&self.hw),
            events: CompletionEvents::new(self.hw.channel_count()),
            barrier: Arc::clone(&barrier),
            run: Arc::clone(&run),
            sinks: Arc::clone(&self.sinks),
            monitor: self.monitor.clone(),
        };

        let mut result = Ok(());
        let mut handles: Vec<(usize, JoinHandle<ChannelWorker>)> = Vec::new();
        for channel in &config.channels {
            let link = if channel.viewer { viewer.take() } else { None };
            let worker = ChannelWorker::new(channel.clone(), ctx.clone(), link);
            match worker.spawn() {
                Ok(handle) => handles.push((channel.index, handle)),
                Err(e) => {
                    error!("Channel {}: thread start failed: {}", channel.number(), e);
                    result = Err(ExitCode::ThreadStart);
                    break;
                }
            }
        }

        if result.is_ok() {
            result = self.start_pulse(&barrier);
        }
        if result.is_err() {
            run.cancel();
        }

        let mut workers = Vec::with_capacity(handles.len());
        let mut panicked = Vec::new();
        for (index, handle) in handles {
            match handle.join() {
                Ok(worker) => workers.push(worker),
                Err(_) => {
                    error!("Channel {}: worker thread panicked", index + 1);
                    panicked.push(index);
                }
            }
        }

        report.aborted = run.is_aborted() || !panicked.is_empty();
        if report.aborted {
            warn!("At least one channel stopped early, its data is incomplete");
        }

        let mut channel_reports: Vec<WorkerReport> = reports.try_iter().collect();
        for index in panicked {
            if !channel_reports.iter().any(|r| r.channel == index) {
                channel_reports.push(WorkerReport {
                    channel: index,
                    code: ExitCode::ThreadError,
                    error: Some(ExitCode::ThreadError.message().to_string()),
                    transfers: run.drained(index),
                    bytes_written: 0,
                    sink_errors: 0,
                });
            }
        }
        channel_reports.sort_by_key(|r| r.channel);
        report.channels = channel_reports;

        self.release(&mut workers);
        result
    }

    /// Wait for every worker to resolve at the barrier, then fire the pulse.
    fn start_pulse(&self, barrier: &ReadyBarrier) -> Result<(), ExitCode> {
        let outcome = barrier.wait(self.config.ready_timeout).map_err(|e| {
            error!("{}", e);
            ExitCode::ReadyTimeout
        })?;
        if !outcome.should_pulse() {
            warn!("No channel reached ready, trigger pulse not sent");
            return Ok(());
        }
        self.hw.generate_sync_pulse().map_err(|e| {
            error!("Trigger pulse failed: {}", e);
            e.exit_code()
        })?;
        info!("Trigger pulse sent to {} channel(s)", outcome.ready.len());
        Ok(())
    }

    /// Free every ring before closing any DMA engine.
    fn release(&self, workers: &mut [ChannelWorker]) {
        for worker in workers.iter_mut() {
            worker.teardown();
        }
        let freed: usize = workers.iter_mut().map(|w| w.free_buffers()).sum();
        let closed = workers
            .iter_mut()
            .map(|w| w.close_dma())
            .filter(|&closed| closed)
            .count();
        info!("Released {} buffer(s), closed {} DMA channel(s)", freed, closed);
    }
}
