use anyhow::{Context, Result};
use simplelog::{
    ColorChoice, CombinedLogger, Config, ConfigBuilder, LevelFilter, SharedLogger, TermLogger,
    TerminalMode, WriteLogger,
};
use std::{fs::File, path::Path};
use time::macros::format_description;

fn log_config() -> Config {
    ConfigBuilder::new()
        .set_time_format_custom(format_description!(
            "[hour]:[minute]:[second].[subsecond digits:3]"
        ))
        .set_thread_level(LevelFilter::Error)
        .set_target_level(LevelFilter::Off)
        .build()
}

/// Install the process logger: stderr unless the terminal belongs to the
/// status panel, plus the log file when one is given.
pub fn init(level: LevelFilter, log_file: Option<&Path>, terminal: bool) -> Result<()> {
    let mut loggers: Vec<Box<dyn SharedLogger>> = Vec::new();
    if terminal {
        loggers.push(TermLogger::new(
            level,
            log_config(),
            TerminalMode::Stderr,
            ColorChoice::Auto,
        ));
    }
    if let Some(path) = log_file {
        let file = File::create(path)
            .with_context(|| format!("creating log file {}", path.display()))?;
        loggers.push(WriteLogger::new(level, log_config(), file));
    }
    CombinedLogger::init(loggers).context("installing logger")?;
    Ok(())
}
