use crate::{Channel, Hardware};
use log::{debug, info, log_enabled, Level};
use std::{fmt::Write as _, fs, io, path::Path};

fn channel_block(hw: &dyn Hardware, channel: &Channel) -> String {
    let mut block = String::new();
    let _ = writeln!(block, "    Initial conditions:");
    let _ = writeln!(block, "        Tuning Frequency = {:.6}", channel.tuning_freq);
    let _ = writeln!(block, "        Total Decimation = {}", channel.decimation);
    let _ = writeln!(block, "        Data Source = {:?}", channel.data_source);
    for (name, value) in hw.register_dump(channel.index) {
        let _ = writeln!(block, "    {}: {}", name, value);
    }
    block
}

/// Log every configured channel's registers at info level.
pub fn log_all(hw: &dyn Hardware, channels: &[Channel]) {
    for channel in channels {
        let mut block = channel_block(hw, channel);
        if block.ends_with('\n') {
            block.pop();
        }
        info!(
            "Board 0x{:x} channel {} registers:\n{}",
            hw.board_id(),
            channel.number(),
            block
        );
    }
}

/// Debug-level dump taken by a worker around DMA start.
pub fn log_channel(hw: &dyn Hardware, index: usize, stage: &str) {
    if !log_enabled!(Level::Debug) {
        return;
    }
    let regs: Vec<String> = hw
        .register_dump(index)
        .into_iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect();
    debug!("Channel {} {}: {}", index + 1, stage, regs.join(" "));
}

/// Write `<prefix>_regs.txt` into `dir`.
pub fn write_dump(
    dir: &Path,
    prefix: &str,
    hw: &dyn Hardware,
    channels: &[Channel],
) -> io::Result<()> {
    let mut text = format!("[{}] Debug Register Dump\n", prefix);
    for channel in channels {
        let _ = writeln!(text, "Channel {}", channel.number());
        text.push_str(&channel_block(hw, channel));
    }
    let path = dir.join(format!("{}_regs.txt", prefix));
    fs::write(&path, text)?;
    info!("Register dump written to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DataSource, GlobalParams, SimBoard};

    #[test]
    fn dump_file_lists_each_channel() {
        let board = SimBoard::builder(2).build();
        let global = GlobalParams {
            clock_freq: 200e6,
            board_channels: 2,
        };
        let channels: Vec<_> = (0..2)
            .map(|index| Channel {
                index,
                tuning_freq: 25e6,
                decimation: 32,
                data_source: DataSource::Adc2,
                trigger_delay: 10,
                viewer: false,
            })
            .collect();
        for c in &channels {
            board.configure_channel(c, &global).unwrap();
        }

        let tmp = tempfile::tempdir().unwrap();
        write_dump(tmp.path(), "acq", &*board, &channels).unwrap();
        let text = fs::read_to_string(tmp.path().join("acq_regs.txt")).unwrap();
        assert!(text.starts_with("[acq] Debug Register Dump\n"));
        assert!(text.contains("Channel 2\n"));
        assert!(text.contains("Total Decimation = 32"));
        assert!(text.contains("DDC_TUNE: 0x20000000"));
    }
}
