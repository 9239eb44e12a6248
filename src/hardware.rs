use crate::{CompletionPoster, DmaRegion, HardwareError, TriggerDescriptor, TriggerState};
use serde::Deserialize;
use std::sync::Arc;

/// DDC input selector, values as programmed into the input mux.
#[repr(u32)]
#[derive(Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    DefaultAdc = 0x00,
    Adc1 = 0x01,
    Adc2 = 0x02,
    Adc3 = 0x03,
    Adc4 = 0x04,
    TestGenReal = 0x10,
    TestGenComplex = 0x20,
}

impl DataSource {
    pub fn register_value(self) -> u32 {
        self as u32
    }
}

/// Board-wide settings applied once before any channel is touched.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalParams {
    pub clock_freq: f64,
    pub board_channels: usize,
}

/// One physical DDC/ADC acquisition path.
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub index: usize,
    pub tuning_freq: f64,
    pub decimation: u32,
    pub data_source: DataSource,
    pub trigger_delay: u32,
    pub viewer: bool,
}

impl Channel {
    /// One-based number used in file names and log lines.
    pub fn number(&self) -> usize {
        self.index + 1
    }

    /// 32-bit NCO tuning word for the given sample clock.
    pub fn tuning_word(&self, clock_freq: f64) -> u32 {
        let word = 4294967296.0 * (self.tuning_freq / clock_freq);
        word.rem_euclid(4294967296.0) as u32
    }
}

/// The board register collaborator. The acquisition core only calls these
/// operations and never sees register layouts.
pub trait Hardware: Send + Sync {
    /// Identifier reported to the live viewer, e.g. `0x71620`.
    fn board_id(&self) -> u32;

    fn channel_count(&self) -> usize;

    fn configure(&self, global: &GlobalParams) -> Result<(), HardwareError>;

    fn configure_channel(&self, channel: &Channel, global: &GlobalParams)
        -> Result<(), HardwareError>;

    /// Program the trigger descriptor and release the trigger hold.
    fn arm_trigger(&self, channel: usize, descriptor: &TriggerDescriptor)
        -> Result<(), HardwareError>;

    /// Put the channel's trigger state machine back in reset.
    fn clear_trigger(&self, channel: usize);

    fn trigger_state(&self, channel: usize) -> TriggerState;

    fn open_dma(&self, channel: usize) -> Result<Arc<dyn DmaEngine>, HardwareError>;

    /// Route the channel's link-end interrupt to `poster`. Callers hold the
    /// process-wide interrupt lock.
    fn enable_interrupt(&self, channel: usize, poster: CompletionPoster)
        -> Result<(), HardwareError>;

    fn disable_interrupt(&self, channel: usize);

    fn read_interrupt_flag(&self, channel: usize) -> u32;

    /// Issue the single pulse that starts every armed channel.
    fn generate_sync_pulse(&self) -> Result<(), HardwareError>;

    fn register_dump(&self, channel: usize) -> Vec<(String, String)>;

    /// Release board and OS resources. Called last during teardown.
    fn shutdown(&self);
}

/// One channel's DMA engine and its descriptor chain.
pub trait DmaEngine: Send + Sync {
    fn channel(&self) -> usize;

    fn alloc(&self, slot: usize, len: usize) -> Result<Arc<DmaRegion>, HardwareError>;

    fn free(&self, region: &DmaRegion);

    /// Load one descriptor per region; the last links back to the first.
    fn load_chain(&self, regions: &[Arc<DmaRegion>]) -> Result<(), HardwareError>;

    fn start(&self) -> Result<(), HardwareError>;

    fn abort(&self);

    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(tuning_freq: f64) -> Channel {
        Channel {
            index: 2,
            tuning_freq,
            decimation: 4,
            data_source: DataSource::Adc1,
            trigger_delay: 10,
            viewer: false,
        }
    }

    #[test]
    fn tuning_word_scales_with_clock() {
        assert_eq!(channel(50e6).tuning_word(200e6), 0x4000_0000);
        assert_eq!(channel(0.0).tuning_word(200e6), 0);
        // Above Nyquist wraps like the NCO accumulator.
        assert_eq!(channel(250e6).tuning_word(200e6), 0x4000_0000);
    }

    #[test]
    fn numbering_and_mux_values() {
        assert_eq!(channel(1.0).number(), 3);
        assert_eq!(DataSource::TestGenComplex.register_value(), 0x20);
        assert_eq!(DataSource::Adc3.register_value(), 3);
    }
}
