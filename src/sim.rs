//! Software stand-in for the acquisition board.
//!
//! Each channel gets a trigger state machine and a DMA engine thread that
//! fills the loaded descriptor chain once the sync pulse has moved the
//! channel to running. Faults can be injected per channel to drive the
//! error paths of the acquisition core.
use crate::{
    Channel, CompletionPoster, DmaEngine, DmaRegion, GlobalParams, Hardware, HardwareError,
    TriggerDescriptor, TriggerState,
};
use log::{debug, info};
use rand::Rng;
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

pub const SIM_BOARD_ID: u32 = 0x71620;

const POLL: Duration = Duration::from_millis(1);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What the engine writes into a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimPattern {
    /// Every 32-bit word holds the fill's generation number.
    Generation,
    /// Random I/Q words.
    Noise,
}

#[derive(Debug, Clone)]
struct SimOptions {
    channels: usize,
    completion_delay: Duration,
    pattern: SimPattern,
    fail_init: bool,
    fail_filter: HashSet<usize>,
    fail_dma_open: HashSet<usize>,
    fail_alloc: HashMap<usize, usize>,
    fail_interrupt: HashSet<usize>,
    stall: HashSet<usize>,
    stop_after: HashMap<usize, u64>,
    arm_delay: HashMap<usize, Duration>,
}

pub struct SimBoardBuilder {
    opts: SimOptions,
}

impl SimBoardBuilder {
    pub fn completion_delay(mut self, delay: Duration) -> Self {
        self.opts.completion_delay = delay;
        self
    }

    pub fn pattern(mut self, pattern: SimPattern) -> Self {
        self.opts.pattern = pattern;
        self
    }

    pub fn fail_init(mut self) -> Self {
        self.opts.fail_init = true;
        self
    }

    pub fn fail_filter(mut self, channel: usize) -> Self {
        self.opts.fail_filter.insert(channel);
        self
    }

    pub fn fail_dma_open(mut self, channel: usize) -> Self {
        self.opts.fail_dma_open.insert(channel);
        self
    }

    pub fn fail_alloc_at(mut self, channel: usize, slot: usize) -> Self {
        self.opts.fail_alloc.insert(channel, slot);
        self
    }

    pub fn fail_interrupt(mut self, channel: usize) -> Self {
        self.opts.fail_interrupt.insert(channel);
        self
    }

    /// The channel's engine never completes a transfer.
    pub fn stall(mut self, channel: usize) -> Self {
        self.opts.stall.insert(channel);
        self
    }

    /// The channel's engine stops after `completions` transfers.
    pub fn stop_after(mut self, channel: usize, completions: u64) -> Self {
        self.opts.stop_after.insert(channel, completions);
        self
    }

    /// Arming the channel's trigger takes `delay`.
    pub fn arm_delay(mut self, channel: usize, delay: Duration) -> Self {
        self.opts.arm_delay.insert(channel, delay);
        self
    }

    pub fn build(self) -> Arc<SimBoard> {
        let channels = (0..self.opts.channels)
            .map(|index| Arc::new(SimChannel::new(index)))
            .collect();
        Arc::new(SimBoard {
            engines: Mutex::new(vec![None; self.opts.channels]),
            opts: self.opts,
            channels,
            counters: Arc::new(SimCounters::default()),
            pulses: Mutex::new(Vec::new()),
            configured: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        })
    }
}

/// A fired sync pulse and the trigger state each channel was in at that moment.
#[derive(Debug, Clone)]
pub struct PulseRecord {
    pub at: Instant,
    pub states: Vec<TriggerState>,
}

#[derive(Debug, Default)]
struct SimCounters {
    allocs: AtomicUsize,
    frees: AtomicUsize,
    dma_closes: AtomicUsize,
}

struct SimChannel {
    index: usize,
    trigger: Mutex<TriggerState>,
    descriptor: Mutex<Option<TriggerDescriptor>>,
    armed_at: Mutex<Option<Instant>>,
    poster: Mutex<Option<CompletionPoster>>,
    interrupt_flag: AtomicU32,
    tuning_word: AtomicU32,
    decimation: AtomicU32,
    source: AtomicU32,
}

impl SimChannel {
    fn new(index: usize) -> Self {
        Self {
            index,
            trigger: Mutex::new(TriggerState::Reset),
            descriptor: Mutex::new(None),
            armed_at: Mutex::new(None),
            poster: Mutex::new(None),
            interrupt_flag: AtomicU32::new(0),
            tuning_word: AtomicU32::new(0),
            decimation: AtomicU32::new(0),
            source: AtomicU32::new(0),
        }
    }

    fn trigger(&self) -> TriggerState {
        *lock(&self.trigger)
    }
}

pub struct SimBoard {
    opts: SimOptions,
    channels: Vec<Arc<SimChannel>>,
    engines: Mutex<Vec<Option<Arc<SimDma>>>>,
    counters: Arc<SimCounters>,
    pulses: Mutex<Vec<PulseRecord>>,
    configured: AtomicBool,
    shut_down: AtomicBool,
}

impl SimBoard {
    pub fn builder(channels: usize) -> SimBoardBuilder {
        SimBoardBuilder {
            opts: SimOptions {
                channels,
                completion_delay: Duration::ZERO,
                pattern: SimPattern::Generation,
                fail_init: false,
                fail_filter: HashSet::new(),
                fail_dma_open: HashSet::new(),
                fail_alloc: HashMap::new(),
                fail_interrupt: HashSet::new(),
                stall: HashSet::new(),
                stop_after: HashMap::new(),
                arm_delay: HashMap::new(),
            },
        }
    }

    fn channel(&self, channel: usize) -> Result<&Arc<SimChannel>, HardwareError> {
        self.channels
            .get(channel)
            .ok_or(HardwareError::ChannelUnavailable(channel))
    }

    fn engine(&self, channel: usize) -> Option<Arc<SimDma>> {
        lock(&self.engines).get(channel).cloned().flatten()
    }

    pub fn pulses(&self) -> Vec<PulseRecord> {
        lock(&self.pulses).clone()
    }

    pub fn pulse_count(&self) -> usize {
        lock(&self.pulses).len()
    }

    pub fn armed_at(&self, channel: usize) -> Option<Instant> {
        self.channels.get(channel).and_then(|c| *lock(&c.armed_at))
    }

    pub fn descriptor(&self, channel: usize) -> Option<TriggerDescriptor> {
        self.channels.get(channel).and_then(|c| *lock(&c.descriptor))
    }

    pub fn interrupt_enabled(&self, channel: usize) -> bool {
        self.channels
            .get(channel)
            .is_some_and(|c| lock(&c.poster).is_some())
    }

    pub fn is_configured(&self) -> bool {
        self.configured.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn allocated(&self) -> usize {
        self.counters.allocs.load(Ordering::SeqCst)
    }

    pub fn freed(&self) -> usize {
        self.counters.frees.load(Ordering::SeqCst)
    }

    pub fn dma_closes(&self) -> usize {
        self.counters.dma_closes.load(Ordering::SeqCst)
    }

    /// Transfers completed by the channel's engine.
    pub fn completions(&self, channel: usize) -> u64 {
        self.engine(channel)
            .map_or(0, |e| e.shared.completions.load(Ordering::SeqCst))
    }

    /// Times the channel's engine found its next slot still owned by software.
    pub fn overruns(&self, channel: usize) -> u64 {
        self.engine(channel)
            .map_or(0, |e| e.shared.overruns.load(Ordering::SeqCst))
    }
}

impl Hardware for SimBoard {
    fn board_id(&self) -> u32 {
        SIM_BOARD_ID
    }

    fn channel_count(&self) -> usize {
        self.opts.channels
    }

    fn configure(&self, global: &GlobalParams) -> Result<(), HardwareError> {
        if self.opts.fail_init {
            return Err(HardwareError::LibraryInit("simulated init failure".into()));
        }
        info!(
            "Simulated board 0x{:x}: {} channels, clock {} Hz",
            SIM_BOARD_ID, self.opts.channels, global.clock_freq
        );
        self.configured.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn configure_channel(
        &self,
        channel: &Channel,
        global: &GlobalParams,
    ) -> Result<(), HardwareError> {
        let sim = self.channel(channel.index)?;
        if self.opts.fail_filter.contains(&channel.index) {
            return Err(HardwareError::FilterLoad(channel.index));
        }
        sim.tuning_word
            .store(channel.tuning_word(global.clock_freq), Ordering::SeqCst);
        sim.decimation.store(channel.decimation, Ordering::SeqCst);
        sim.source
            .store(channel.data_source.register_value(), Ordering::SeqCst);
        Ok(())
    }

    fn arm_trigger(
        &self,
        channel: usize,
        descriptor: &TriggerDescriptor,
    ) -> Result<(), HardwareError> {
        let sim = self.channel(channel)?;
        if let Some(delay) = self.opts.arm_delay.get(&channel) {
            thread::sleep(*delay);
        }
        *lock(&sim.descriptor) = Some(*descriptor);
        *lock(&sim.trigger) = TriggerState::Armed;
        *lock(&sim.armed_at) = Some(Instant::now());
        Ok(())
    }

    fn clear_trigger(&self, channel: usize) {
        if let Some(sim) = self.channels.get(channel) {
            *lock(&sim.trigger) = TriggerState::Reset;
        }
    }

    fn trigger_state(&self, channel: usize) -> TriggerState {
        self.channels
            .get(channel)
            .map_or(TriggerState::Reset, |c| c.trigger())
    }

    fn open_dma(&self, channel: usize) -> Result<Arc<dyn DmaEngine>, HardwareError> {
        let sim = self.channel(channel)?;
        if self.opts.fail_dma_open.contains(&channel) {
            return Err(HardwareError::DmaOpen(channel));
        }
        let engine = Arc::new(SimDma {
            shared: Arc::new(EngineShared {
                channel: Arc::clone(sim),
                chain: Mutex::new(Vec::new()),
                stop: AtomicBool::new(false),
                completions: AtomicU64::new(0),
                overruns: AtomicU64::new(0),
                completion_delay: self.opts.completion_delay,
                pattern: self.opts.pattern,
                stall: self.opts.stall.contains(&channel),
                stop_after: self.opts.stop_after.get(&channel).copied(),
            }),
            counters: Arc::clone(&self.counters),
            fail_alloc: self.opts.fail_alloc.get(&channel).copied(),
            thread: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        if let Some(slot) = lock(&self.engines).get_mut(channel) {
            *slot = Some(Arc::clone(&engine));
        }
        Ok(engine)
    }

    fn enable_interrupt(
        &self,
        channel: usize,
        poster: CompletionPoster,
    ) -> Result<(), HardwareError> {
        let sim = self.channel(channel)?;
        if self.opts.fail_interrupt.contains(&channel) {
            return Err(HardwareError::InterruptEnable(channel));
        }
        *lock(&sim.poster) = Some(poster);
        Ok(())
    }

    fn disable_interrupt(&self, channel: usize) {
        if let Some(sim) = self.channels.get(channel) {
            *lock(&sim.poster) = None;
        }
    }

    fn read_interrupt_flag(&self, channel: usize) -> u32 {
        self.channels
            .get(channel)
            .map_or(0, |c| c.interrupt_flag.swap(0, Ordering::SeqCst))
    }

    fn generate_sync_pulse(&self) -> Result<(), HardwareError> {
        let mut states = Vec::with_capacity(self.channels.len());
        for sim in &self.channels {
            let mut trigger = lock(&sim.trigger);
            states.push(*trigger);
            if matches!(
                *trigger,
                TriggerState::Armed | TriggerState::WaitingForExternalTrigger
            ) {
                *trigger = TriggerState::Running;
            }
        }
        debug!("Sync pulse, trigger states {:?}", states);
        lock(&self.pulses).push(PulseRecord {
            at: Instant::now(),
            states,
        });
        Ok(())
    }

    fn register_dump(&self, channel: usize) -> Vec<(String, String)> {
        let Some(sim) = self.channels.get(channel) else {
            return Vec::new();
        };
        let descriptor = *lock(&sim.descriptor);
        vec![
            (
                "DDC_TUNE".into(),
                format!("0x{:08x}", sim.tuning_word.load(Ordering::SeqCst)),
            ),
            (
                "DDC_DECIMATION".into(),
                sim.decimation.load(Ordering::SeqCst).to_string(),
            ),
            (
                "DDC_SOURCE".into(),
                format!("0x{:02x}", sim.source.load(Ordering::SeqCst)),
            ),
            ("TRIGGER_STATE".into(), format!("{:?}", sim.trigger())),
            (
                "TRIGGER_DELAY".into(),
                descriptor.map_or("-".into(), |d| d.delay.to_string()),
            ),
            (
                "TRIGGER_LENGTH".into(),
                descriptor.map_or("-".into(), |d| d.length.to_string()),
            ),
            (
                "INTERRUPT_ENABLED".into(),
                lock(&sim.poster).is_some().to_string(),
            ),
        ]
    }

    fn shutdown(&self) {
        let engines: Vec<_> = lock(&self.engines).iter().flatten().cloned().collect();
        for engine in engines {
            engine.abort();
        }
        self.shut_down.store(true, Ordering::SeqCst);
        info!("Simulated board released");
    }
}

struct EngineShared {
    channel: Arc<SimChannel>,
    chain: Mutex<Vec<Arc<DmaRegion>>>,
    stop: AtomicBool,
    completions: AtomicU64,
    overruns: AtomicU64,
    completion_delay: Duration,
    pattern: SimPattern,
    stall: bool,
    stop_after: Option<u64>,
}

impl EngineShared {
    fn idle(&self, generation: u64) -> bool {
        self.channel.trigger() != TriggerState::Running
            || self.stall
            || self.stop_after.is_some_and(|n| generation >= n)
    }

    fn next_region(&self, generation: u64) -> Option<Arc<DmaRegion>> {
        let chain = lock(&self.chain);
        if chain.is_empty() {
            return None;
        }
        let index = (generation % chain.len() as u64) as usize;
        Some(Arc::clone(&chain[index]))
    }

    fn post(&self) {
        self.channel.interrupt_flag.store(1, Ordering::SeqCst);
        let poster = lock(&self.channel.poster).clone();
        if let Some(poster) = poster {
            poster.post();
        }
    }
}

fn fill(buf: &mut [u8], generation: u64, pattern: SimPattern) {
    match pattern {
        SimPattern::Generation => {
            let stamp = (generation as u32).to_le_bytes();
            for word in buf.chunks_exact_mut(4) {
                word.copy_from_slice(&stamp);
            }
        }
        SimPattern::Noise => rand::rng().fill(buf),
    }
}

fn run_engine(shared: Arc<EngineShared>) {
    let mut generation = 0u64;
    let mut delayed = false;
    while !shared.stop.load(Ordering::SeqCst) {
        if shared.idle(generation) {
            thread::sleep(POLL);
            continue;
        }
        let Some(region) = shared.next_region(generation) else {
            thread::sleep(POLL);
            continue;
        };
        if !delayed && !shared.completion_delay.is_zero() {
            thread::sleep(shared.completion_delay);
            delayed = true;
            continue;
        }
        match region.dma_write(|buf| fill(buf, generation, shared.pattern)) {
            Ok(()) => {
                generation += 1;
                delayed = false;
                shared.completions.store(generation, Ordering::SeqCst);
                shared.post();
            }
            Err(_) => {
                shared.overruns.fetch_add(1, Ordering::SeqCst);
                thread::sleep(POLL);
            }
        }
    }
}

struct SimDma {
    shared: Arc<EngineShared>,
    counters: Arc<SimCounters>,
    fail_alloc: Option<usize>,
    thread: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl DmaEngine for SimDma {
    fn channel(&self) -> usize {
        self.shared.channel.index
    }

    fn alloc(&self, slot: usize, len: usize) -> Result<Arc<DmaRegion>, HardwareError> {
        let channel = self.channel();
        if self.fail_alloc == Some(slot) {
            return Err(HardwareError::DmaAlloc { channel, len });
        }
        self.counters.allocs.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(DmaRegion::new(channel, slot, len)))
    }

    fn free(&self, _region: &DmaRegion) {
        self.counters.frees.fetch_add(1, Ordering::SeqCst);
    }

    fn load_chain(&self, regions: &[Arc<DmaRegion>]) -> Result<(), HardwareError> {
        if regions.is_empty() {
            return Err(HardwareError::Register("empty descriptor chain".into()));
        }
        *lock(&self.shared.chain) = regions.to_vec();
        Ok(())
    }

    fn start(&self) -> Result<(), HardwareError> {
        let mut thread = lock(&self.thread);
        if thread.is_some() {
            return Ok(());
        }
        let channel = self.channel();
        self.shared.stop.store(false, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("sim-dma{}", channel))
            .spawn(move || run_engine(shared))
            .map_err(|_| HardwareError::DmaOpen(channel))?;
        *thread = Some(handle);
        Ok(())
    }

    fn abort(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = lock(&self.thread).take() {
            let _ = handle.join();
        }
    }

    fn close(&self) {
        self.abort();
        lock(&self.shared.chain).clear();
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.counters.dma_closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CompletionEvents, SlotState};

    #[test]
    fn pulse_starts_only_armed_channels() {
        let board = SimBoard::builder(3).build();
        let d = TriggerDescriptor::for_ring(10, 1, 64);
        board.arm_trigger(0, &d).unwrap();
        board.arm_trigger(2, &d).unwrap();
        board.generate_sync_pulse().unwrap();

        assert_eq!(board.trigger_state(0), TriggerState::Running);
        assert_eq!(board.trigger_state(1), TriggerState::Reset);
        assert_eq!(board.trigger_state(2), TriggerState::Running);
        let pulses = board.pulses();
        assert_eq!(pulses.len(), 1);
        assert_eq!(
            pulses[0].states,
            vec![TriggerState::Armed, TriggerState::Reset, TriggerState::Armed]
        );
    }

    #[test]
    fn engine_fills_slots_in_order_and_waits_for_recycle() {
        let board = SimBoard::builder(1).build();
        let events = CompletionEvents::new(1);
        let waiter = events.register(0, &*board).unwrap();
        let engine = board.open_dma(0).unwrap();
        let a = engine.alloc(0, 16).unwrap();
        let b = engine.alloc(1, 16).unwrap();
        engine.load_chain(&[a.clone(), b.clone()]).unwrap();
        board
            .arm_trigger(0, &TriggerDescriptor::for_ring(10, 2, 16))
            .unwrap();
        engine.start().unwrap();
        board.generate_sync_pulse().unwrap();

        waiter.wait(Duration::from_secs(2)).unwrap();
        waiter.wait(Duration::from_secs(2)).unwrap();
        assert_eq!(a.state(), SlotState::Filled);
        assert_eq!(b.state(), SlotState::Filled);
        assert_eq!(&a.sync_for_cpu().unwrap()[..4], &0u32.to_le_bytes());
        assert_eq!(&b.sync_for_cpu().unwrap()[..4], &1u32.to_le_bytes());

        // Both slots are with software; the engine must not complete again.
        thread::sleep(Duration::from_millis(20));
        assert_eq!(board.completions(0), 2);
        assert!(board.overruns(0) > 0);

        a.sync_for_cpu().unwrap().recycle();
        waiter.wait(Duration::from_secs(2)).unwrap();
        assert_eq!(&a.sync_for_cpu().unwrap()[..4], &2u32.to_le_bytes());

        engine.close();
        engine.close();
        assert_eq!(board.dma_closes(), 1);
        assert!(board.read_interrupt_flag(0) == 1);
        assert_eq!(board.read_interrupt_flag(0), 0);
    }

    #[test]
    fn injected_faults() {
        let board = SimBoard::builder(2)
            .fail_init()
            .fail_dma_open(1)
            .fail_alloc_at(0, 1)
            .fail_filter(0)
            .build();
        let global = GlobalParams {
            clock_freq: 200e6,
            board_channels: 2,
        };
        assert!(matches!(
            board.configure(&global),
            Err(HardwareError::LibraryInit(_))
        ));
        assert!(matches!(
            board.open_dma(1).err().unwrap(),
            HardwareError::DmaOpen(1)
        ));
        let engine = board.open_dma(0).unwrap();
        assert!(engine.alloc(0, 8).is_ok());
        assert!(engine.alloc(1, 8).is_err());
        assert_eq!(board.allocated(), 1);
        assert!(board.open_dma(5).is_err());
    }

    #[test]
    fn register_dump_reflects_configuration() {
        let board = SimBoard::builder(1).build();
        let global = GlobalParams {
            clock_freq: 200e6,
            board_channels: 1,
        };
        let channel = Channel {
            index: 0,
            tuning_freq: 50e6,
            decimation: 8,
            data_source: crate::DataSource::TestGenComplex,
            trigger_delay: 10,
            viewer: false,
        };
        board.configure_channel(&channel, &global).unwrap();
        let dump: HashMap<_, _> = board.register_dump(0).into_iter().collect();
        assert_eq!(dump["DDC_TUNE"], "0x40000000");
        assert_eq!(dump["DDC_DECIMATION"], "8");
        assert_eq!(dump["DDC_SOURCE"], "0x20");
        assert_eq!(dump["TRIGGER_LENGTH"], "-");
    }
}
