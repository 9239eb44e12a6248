use crate::{Channel, ConfigError, DataFormat, DataSource, GlobalParams};
use confique::Config;
use serde::Deserialize;
use std::{collections::HashMap, path::PathBuf, time::Duration};

/// Bytes in one 32-bit I/Q sample word.
pub const BYTES_PER_WORD: usize = 4;
pub const MIN_DECIMATION: u32 = 2;
pub const MAX_DECIMATION: u32 = 65536;

#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub run_settings: RunSettings,
    #[config(nested)]
    pub board_settings: BoardSettings,
    #[config(nested)]
    pub viewer_settings: ViewerSettings,
}

#[derive(Config, Debug, Clone)]
pub struct RunSettings {
    /// Ring passes per channel, 0 runs until a channel fails.
    #[config(default = 100, env = "DDC_ACQ_LOOP")]
    pub loop_count: u32,
    /// 32-bit words per DMA slot.
    #[config(default = 4096)]
    pub xfer_size: usize,
    /// 32-bit words written to disk per slot; defaults to the whole slot.
    pub samples_per_transfer: Option<usize>,
    #[config(default = 1)]
    pub ring_depth: usize,
    #[config(default = "data", env = "DDC_ACQ_OUTPUT_DIR")]
    pub output_dir: String,
    #[config(default = "ddc_acq")]
    pub file_prefix: String,
    #[config(default = "bin")]
    pub data_format: DataFormat,
    #[config(default = 1000000)]
    pub dma_timeout_ms: u64,
    pub ready_timeout_ms: Option<u64>,
    #[config(default = false)]
    pub escalate_sink_errors: bool,
    #[config(default = false)]
    pub reg_dump: bool,
}

/// Channel numbers in this section start at 1, for the list and the
/// per-channel map keys alike.
#[derive(Config, Debug, Clone)]
pub struct BoardSettings {
    /// `true` for every board channel, or a list of channel numbers.
    #[config(default = true)]
    pub channels: ChannelSelect,
    #[config(default = 4)]
    pub board_channels: usize,
    #[config(default = 200000000.0)]
    pub clock_freq: f64,
    /// Hz, one value or a map keyed by channel number.
    #[config(default = 220000000.0)]
    pub tuning_freq: TuningFreq,
    #[config(default = 2)]
    pub decimation: u32,
    #[config(default = "adc1")]
    pub data_source: DataSource,
    /// Sample clocks, one value or a map keyed by channel number.
    #[config(default = 10)]
    pub trigger_delay: TriggerDelay,
}

#[derive(Config, Debug, Clone)]
pub struct ViewerSettings {
    #[config(default = "localhost")]
    pub host: String,
    pub port: Option<u16>,
    /// Channel number, starting at 1, forwarded to the viewer.
    #[config(default = 1)]
    pub channel: usize,
    #[config(default = 4096)]
    pub block_size: usize,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(untagged)]
pub enum ChannelSelect {
    All(bool),
    List(Vec<usize>),
}

#[derive(Deserialize, Clone, Debug)]
#[serde(untagged)]
pub enum TuningFreq {
    Global(f64),
    PerChannel(HashMap<String, f64>),
}

#[derive(Deserialize, Clone, Debug)]
#[serde(untagged)]
pub enum TriggerDelay {
    Global(u32),
    PerChannel(HashMap<String, u32>),
}

impl Conf {
    pub fn load(path: Option<&PathBuf>) -> Result<Self, confique::Error> {
        let mut builder = Conf::builder().env();
        if let Some(path) = path {
            builder = builder.file(path);
        }
        builder.load()
    }
}

/// Where the live viewer is reached and which channel feeds it.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewerTarget {
    pub host: String,
    pub port: u16,
    pub channel: usize,
    pub block_size: usize,
}

#[derive(Debug, Clone)]
pub struct SinkSettings {
    pub output_dir: PathBuf,
    pub file_prefix: String,
    pub format: DataFormat,
}

/// Everything one acquisition run needs, resolved and checked up front.
/// Nothing in the core re-reads configuration once a run starts.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub global: GlobalParams,
    pub channels: Vec<Channel>,
    pub loop_count: u32,
    pub ring_depth: usize,
    pub bytes_per_slot: usize,
    pub bytes_per_transfer_unit: usize,
    pub dma_timeout: Duration,
    pub ready_timeout: Option<Duration>,
    pub sink: SinkSettings,
    pub viewer: Option<ViewerTarget>,
    pub escalate_sink_errors: bool,
    pub reg_dump: bool,
}

impl RunConfig {
    pub fn from_conf(conf: &Conf) -> Result<Self, ConfigError> {
        let run = &conf.run_settings;
        let board = &conf.board_settings;

        if board.board_channels == 0 {
            return Err(ConfigError::NoChannels);
        }
        if run.xfer_size == 0 {
            return Err(ConfigError::BadArgument("xfer_size must be positive".into()));
        }
        if run.ring_depth == 0 {
            return Err(ConfigError::BadArgument("ring_depth must be at least 1".into()));
        }
        let samples_per_transfer = run.samples_per_transfer.unwrap_or(run.xfer_size);
        if samples_per_transfer == 0 || samples_per_transfer > run.xfer_size {
            return Err(ConfigError::BadArgument(format!(
                "samples_per_transfer {} exceeds slot size of {} words",
                samples_per_transfer, run.xfer_size
            )));
        }
        if !(MIN_DECIMATION..=MAX_DECIMATION).contains(&board.decimation) {
            return Err(ConfigError::BadArgument(format!(
                "decimation {} outside {}..={}",
                board.decimation, MIN_DECIMATION, MAX_DECIMATION
            )));
        }
        if board.clock_freq <= 0.0 {
            return Err(ConfigError::BadArgument("clock_freq must be positive".into()));
        }

        let indices = select_channels(&board.channels, board.board_channels)?;
        let viewer = viewer_target(&conf.viewer_settings, &indices)?;

        let mut channels = Vec::with_capacity(indices.len());
        for index in indices {
            channels.push(Channel {
                index,
                tuning_freq: tuning_freq_for(&board.tuning_freq, index)?,
                decimation: board.decimation,
                data_source: board.data_source,
                trigger_delay: trigger_delay_for(&board.trigger_delay, index)?,
                viewer: viewer.as_ref().is_some_and(|v| v.channel == index),
            });
        }

        Ok(Self {
            global: GlobalParams {
                clock_freq: board.clock_freq,
                board_channels: board.board_channels,
            },
            channels,
            loop_count: run.loop_count,
            ring_depth: run.ring_depth,
            bytes_per_slot: run.xfer_size * BYTES_PER_WORD,
            bytes_per_transfer_unit: samples_per_transfer * BYTES_PER_WORD,
            dma_timeout: Duration::from_millis(run.dma_timeout_ms),
            ready_timeout: run.ready_timeout_ms.map(Duration::from_millis),
            sink: SinkSettings {
                output_dir: PathBuf::from(&run.output_dir),
                file_prefix: run.file_prefix.clone(),
                format: run.data_format,
            },
            viewer,
            escalate_sink_errors: run.escalate_sink_errors,
            reg_dump: run.reg_dump,
        })
    }
}

/// Zero-based index of a channel number.
fn channel_index(number: usize) -> Result<usize, ConfigError> {
    number
        .checked_sub(1)
        .ok_or_else(|| ConfigError::BadArgument("channel numbers start at 1".into()))
}

fn select_channels(select: &ChannelSelect, available: usize) -> Result<Vec<usize>, ConfigError> {
    let mut indices = match select {
        ChannelSelect::All(true) => (0..available).collect(),
        ChannelSelect::All(false) => Vec::new(),
        ChannelSelect::List(list) => list
            .iter()
            .map(|&n| channel_index(n))
            .collect::<Result<Vec<_>, _>>()?,
    };
    indices.sort_unstable();
    indices.dedup();
    if indices.is_empty() {
        return Err(ConfigError::NoChannels);
    }
    if let Some(&index) = indices.iter().find(|&&c| c >= available) {
        return Err(ConfigError::ChannelUnavailable {
            channel: index + 1,
            available,
        });
    }
    Ok(indices)
}

fn viewer_target(
    viewer: &ViewerSettings,
    channels: &[usize],
) -> Result<Option<ViewerTarget>, ConfigError> {
    let Some(port) = viewer.port else {
        return Ok(None);
    };
    if port == 0 {
        return Err(ConfigError::ViewerParam("port 0".into()));
    }
    if viewer.host.is_empty() {
        return Err(ConfigError::ViewerParam("empty host".into()));
    }
    if viewer.block_size == 0 {
        return Err(ConfigError::ViewerParam("block_size must be positive".into()));
    }
    let channel = channel_index(viewer.channel)
        .ok()
        .filter(|c| channels.contains(c))
        .ok_or_else(|| {
            ConfigError::ViewerParam(format!("channel {} is not acquired", viewer.channel))
        })?;
    Ok(Some(ViewerTarget {
        host: viewer.host.clone(),
        port,
        channel,
        block_size: viewer.block_size,
    }))
}

/// Per-channel map keys are channel numbers; returns the index.
fn parse_channel_key(key: &str) -> Result<usize, ConfigError> {
    let number = key
        .trim()
        .parse()
        .map_err(|_| ConfigError::BadArgument(format!("bad channel key {:?}", key)))?;
    channel_index(number)
}

fn tuning_freq_for(freq: &TuningFreq, index: usize) -> Result<f64, ConfigError> {
    match freq {
        TuningFreq::Global(f) => Ok(*f),
        TuningFreq::PerChannel(map) => {
            for (chan, f) in map {
                if parse_channel_key(chan)? == index {
                    return Ok(*f);
                }
            }
            Err(ConfigError::BadArgument(format!(
                "no tuning frequency for channel {}",
                index + 1
            )))
        }
    }
}

fn trigger_delay_for(delay: &TriggerDelay, index: usize) -> Result<u32, ConfigError> {
    match delay {
        TriggerDelay::Global(d) => Ok(*d),
        TriggerDelay::PerChannel(map) => {
            for (chan, d) in map {
                if parse_channel_key(chan)? == index {
                    return Ok(*d);
                }
            }
            Ok(crate::MIN_TRIGGER_DELAY)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ExitCode;

    fn conf() -> Conf {
        Conf {
            run_settings: RunSettings {
                loop_count: 3,
                xfer_size: 256,
                samples_per_transfer: None,
                ring_depth: 2,
                output_dir: "out".into(),
                file_prefix: "test".into(),
                data_format: DataFormat::Bin,
                dma_timeout_ms: 500,
                ready_timeout_ms: None,
                escalate_sink_errors: false,
                reg_dump: false,
            },
            board_settings: BoardSettings {
                channels: ChannelSelect::All(true),
                board_channels: 4,
                clock_freq: 200e6,
                tuning_freq: TuningFreq::Global(20e6),
                decimation: 8,
                data_source: DataSource::Adc1,
                trigger_delay: TriggerDelay::Global(12),
            },
            viewer_settings: ViewerSettings {
                host: "localhost".into(),
                port: None,
                channel: 1,
                block_size: 4096,
            },
        }
    }

    #[test]
    fn resolves_all_channels() {
        let run = RunConfig::from_conf(&conf()).unwrap();
        assert_eq!(run.channels.len(), 4);
        assert_eq!(run.bytes_per_slot, 1024);
        assert_eq!(run.bytes_per_transfer_unit, 1024);
        assert!(run.viewer.is_none());
        assert!(run.channels.iter().all(|c| !c.viewer && c.trigger_delay == 12));
    }

    #[test]
    fn per_channel_values_and_viewer() {
        let mut c = conf();
        c.board_settings.channels = ChannelSelect::List(vec![3, 1, 3]);
        c.board_settings.tuning_freq =
            TuningFreq::PerChannel(HashMap::from([("1".into(), 1e6), ("3".into(), 3e6)]));
        c.board_settings.trigger_delay = TriggerDelay::PerChannel(HashMap::from([("3".into(), 40)]));
        c.viewer_settings.port = Some(3223);
        c.viewer_settings.channel = 3;
        c.run_settings.samples_per_transfer = Some(100);

        let run = RunConfig::from_conf(&c).unwrap();
        let idx: Vec<_> = run.channels.iter().map(|ch| ch.index).collect();
        assert_eq!(idx, vec![0, 2]);
        assert_eq!(run.channels[1].tuning_freq, 3e6);
        assert_eq!(run.channels[1].trigger_delay, 40);
        assert_eq!(run.channels[0].trigger_delay, crate::MIN_TRIGGER_DELAY);
        assert!(run.channels[1].viewer);
        assert!(!run.channels[0].viewer);
        assert_eq!(run.bytes_per_transfer_unit, 400);
        assert_eq!(run.viewer.unwrap().channel, 2);
    }

    #[test]
    fn rejects_bad_values() {
        let mut c = conf();
        c.board_settings.decimation = 1;
        let err = RunConfig::from_conf(&c).unwrap_err();
        assert_eq!(err.exit_code(), ExitCode::BadArgument);

        let mut c = conf();
        c.run_settings.samples_per_transfer = Some(257);
        assert_eq!(
            RunConfig::from_conf(&c).unwrap_err().exit_code(),
            ExitCode::BadArgument
        );

        let mut c = conf();
        c.board_settings.channels = ChannelSelect::List(vec![5]);
        assert_eq!(
            RunConfig::from_conf(&c).unwrap_err().exit_code(),
            ExitCode::ChannelUnavailable
        );

        let mut c = conf();
        c.board_settings.channels = ChannelSelect::List(vec![0, 1]);
        assert_eq!(
            RunConfig::from_conf(&c).unwrap_err().exit_code(),
            ExitCode::BadArgument
        );

        let mut c = conf();
        c.board_settings.tuning_freq = TuningFreq::PerChannel(HashMap::from([("0".into(), 1e6)]));
        assert_eq!(
            RunConfig::from_conf(&c).unwrap_err().exit_code(),
            ExitCode::BadArgument
        );

        let mut c = conf();
        c.board_settings.channels = ChannelSelect::All(false);
        assert_eq!(
            RunConfig::from_conf(&c).unwrap_err().exit_code(),
            ExitCode::InvalidMaxChannels
        );

        let mut c = conf();
        c.board_settings.channels = ChannelSelect::List(vec![2]);
        c.viewer_settings.port = Some(9000);
        c.viewer_settings.channel = 1;
        assert_eq!(
            RunConfig::from_conf(&c).unwrap_err().exit_code(),
            ExitCode::ViewerParam
        );
    }

    #[test]
    fn loads_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[run_settings]
loop_count = 7
ring_depth = 3
data_format = "ascii"

[board_settings]
channels = [1, 2]
tuning_freq = { "1" = 10e6, "2" = 11e6 }

[viewer_settings]
port = 4000
"#,
        )
        .unwrap();

        let conf = Conf::load(Some(&path)).unwrap();
        let run = RunConfig::from_conf(&conf).unwrap();
        assert_eq!(run.ring_depth, 3);
        assert_eq!(run.sink.format, DataFormat::Ascii);
        assert_eq!(run.channels.len(), 2);
        assert_eq!(run.channels[1].tuning_freq, 11e6);
        assert_eq!(run.viewer.unwrap().port, 4000);
    }
}
