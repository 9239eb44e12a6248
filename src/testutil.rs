use crate::{
    Channel, DataFormat, DataSource, GlobalParams, RunConfig, SampleSink, SinkFactory,
    SinkSettings, ViewControl, ViewerLink,
};
use std::{
    collections::HashMap,
    io,
    sync::{Arc, Mutex},
    time::Duration,
};

pub fn run_config(channels: usize, ring_depth: usize, loop_count: u32, bytes: usize) -> RunConfig {
    RunConfig {
        global: GlobalParams {
            clock_freq: 200e6,
            board_channels: channels,
        },
        channels: (0..channels)
            .map(|index| Channel {
                index,
                tuning_freq: 10e6,
                decimation: 4,
                data_source: DataSource::Adc1,
                trigger_delay: 10,
                viewer: false,
            })
            .collect(),
        loop_count,
        ring_depth,
        bytes_per_slot: bytes,
        bytes_per_transfer_unit: bytes,
        dma_timeout: Duration::from_secs(5),
        ready_timeout: None,
        sink: SinkSettings {
            output_dir: "unused".into(),
            file_prefix: "test".into(),
            format: DataFormat::Bin,
        },
        viewer: None,
        escalate_sink_errors: false,
        reg_dump: false,
    }
}

#[derive(Default)]
struct Captured {
    blocks: HashMap<usize, Vec<Vec<u8>>>,
    closed: HashMap<usize, bool>,
}

#[derive(Clone, Copy, Default, PartialEq, Eq)]
enum Fault {
    #[default]
    None,
    Write,
    Close,
    PanicOnWrite,
}

/// Keeps every written block in memory, optionally with an injected fault.
#[derive(Clone, Default)]
pub struct MemorySinks {
    captured: Arc<Mutex<Captured>>,
    fault: Fault,
}

impl MemorySinks {
    /// Every write fails.
    pub fn failing() -> Self {
        Self {
            fault: Fault::Write,
            ..Self::default()
        }
    }

    /// Writes succeed, the final flush on close fails.
    pub fn failing_close() -> Self {
        Self {
            fault: Fault::Close,
            ..Self::default()
        }
    }

    /// The first write panics the calling thread.
    pub fn panicking() -> Self {
        Self {
            fault: Fault::PanicOnWrite,
            ..Self::default()
        }
    }

    pub fn blocks(&self, channel: usize) -> Vec<Vec<u8>> {
        let captured = self.captured.lock().unwrap();
        captured.blocks.get(&channel).cloned().unwrap_or_default()
    }

    pub fn is_closed(&self, channel: usize) -> bool {
        let captured = self.captured.lock().unwrap();
        captured.closed.get(&channel).copied().unwrap_or(false)
    }
}

struct MemorySink {
    channel: usize,
    captured: Arc<Mutex<Captured>>,
    fault: Fault,
}

impl SampleSink for MemorySink {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        match self.fault {
            Fault::Write => return Err(io::Error::other("disk full")),
            Fault::PanicOnWrite => panic!("sink for channel {} blew up", self.channel),
            _ => {}
        }
        let mut captured = self.captured.lock().unwrap();
        captured
            .blocks
            .entry(self.channel)
            .or_default()
            .push(data.to_vec());
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        let mut captured = self.captured.lock().unwrap();
        captured.closed.insert(self.channel, true);
        if self.fault == Fault::Close {
            return Err(io::Error::other("flush: disk full"));
        }
        Ok(())
    }
}

impl SinkFactory for MemorySinks {
    fn open(&self, channel: usize) -> io::Result<Box<dyn SampleSink>> {
        let mut captured = self.captured.lock().unwrap();
        captured.closed.insert(channel, false);
        Ok(Box::new(MemorySink {
            channel,
            captured: Arc::clone(&self.captured),
            fault: self.fault,
        }))
    }
}

/// Viewer that accepts `ok_sends` blocks and fails afterwards.
pub struct FlakyViewer {
    pub ok_sends: usize,
    pub sent: Arc<Mutex<Vec<usize>>>,
    pub closed: Arc<Mutex<bool>>,
}

impl FlakyViewer {
    pub fn new(ok_sends: usize) -> Self {
        Self {
            ok_sends,
            sent: Arc::default(),
            closed: Arc::default(),
        }
    }
}

impl ViewerLink for FlakyViewer {
    fn send(&mut self, data: &[u8], block_size: usize, _control: &ViewControl) -> io::Result<()> {
        let mut sent = self.sent.lock().unwrap();
        if sent.len() >= self.ok_sends {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        sent.push(data.len().min(block_size));
        Ok(())
    }

    fn close(&mut self) {
        *self.closed.lock().unwrap() = true;
    }
}

/// Every 32-bit word of a block carries the same stamp; return it.
pub fn block_stamp(block: &[u8]) -> Option<u32> {
    let mut words = block
        .chunks_exact(4)
        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]));
    let first = words.next()?;
    words.all(|w| w == first).then_some(first)
}
