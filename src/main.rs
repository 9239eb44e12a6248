use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossbeam_channel::unbounded;
use ddc_acq::*;
use log::{error, warn};
use simplelog::LevelFilter;
use std::{path::PathBuf, process, sync::Arc, thread, time::Duration};

#[derive(Parser, Debug)]
#[command(version, about = "Multi-channel DDC acquisition")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Comma separated channel numbers, starting at 1
    #[arg(long, value_delimiter = ',')]
    channels: Option<Vec<usize>>,

    /// 32-bit words per DMA transfer
    #[arg(long)]
    xfersize: Option<usize>,

    /// Ring passes per channel, 0 runs until a channel fails
    #[arg(long = "loop")]
    loop_count: Option<u32>,

    /// DDC tuning frequency in Hz, applied to every channel
    #[arg(long)]
    tune_freq: Option<f64>,

    #[arg(long)]
    decim: Option<u32>,

    #[arg(long, value_enum)]
    datformat: Option<DataFormat>,

    /// Live viewer port; enables live view
    #[arg(long)]
    vport: Option<u16>,

    #[arg(long)]
    vhost: Option<String>,

    #[arg(long)]
    output_dir: Option<String>,

    /// Show the status panel instead of logging to the terminal
    #[arg(long)]
    tui: bool,

    #[arg(long, default_value = "ddc_acq.log")]
    log_file: PathBuf,

    #[arg(long, default_value = "info")]
    log_level: LevelFilter,

    /// Simulated time per DMA transfer
    #[arg(long, default_value_t = 100)]
    sim_delay_us: u64,

    /// Fill simulated transfers with random I/Q data
    #[arg(long)]
    sim_noise: bool,
}

fn apply_overrides(conf: &mut Conf, cli: &Cli) {
    if let Some(channels) = &cli.channels {
        conf.board_settings.channels = ChannelSelect::List(channels.clone());
    }
    if let Some(xfer) = cli.xfersize {
        conf.run_settings.xfer_size = xfer;
    }
    if let Some(loop_count) = cli.loop_count {
        conf.run_settings.loop_count = loop_count;
    }
    if let Some(freq) = cli.tune_freq {
        conf.board_settings.tuning_freq = TuningFreq::Global(freq);
    }
    if let Some(decim) = cli.decim {
        conf.board_settings.decimation = decim;
    }
    if let Some(format) = cli.datformat {
        conf.run_settings.data_format = format;
    }
    if let Some(port) = cli.vport {
        conf.viewer_settings.port = Some(port);
    }
    if let Some(host) = &cli.vhost {
        conf.viewer_settings.host = host.clone();
    }
    if let Some(dir) = &cli.output_dir {
        conf.run_settings.output_dir = dir.clone();
    }
}

fn load_config(cli: &Cli) -> Result<RunConfig, ExitCode> {
    let path = cli.config.exists().then_some(&cli.config);
    if path.is_none() {
        warn!(
            "{} not found, using defaults and environment",
            cli.config.display()
        );
    }
    let mut conf = Conf::load(path).map_err(|e| {
        error!("Configuration: {}", e);
        ExitCode::BadArgument
    })?;
    apply_overrides(&mut conf, cli);
    RunConfig::from_conf(&conf).map_err(|e| {
        error!("{}", e);
        e.exit_code()
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    ddc_acq::logging::init(cli.log_level, Some(&cli.log_file), !cli.tui)?;

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(code) => {
            eprintln!("{}", code.message());
            process::exit(code.code());
        }
    };

    let pattern = if cli.sim_noise {
        SimPattern::Noise
    } else {
        SimPattern::Generation
    };
    let board = SimBoard::builder(config.global.board_channels)
        .completion_delay(Duration::from_micros(cli.sim_delay_us))
        .pattern(pattern)
        .build();
    let factory = match FileSinkFactory::new(&config.sink) {
        Ok(factory) => Arc::new(factory),
        Err(e) => {
            error!("Creating run directory: {}", e);
            process::exit(ExitCode::FileWrite.code());
        }
    };

    let indices: Vec<usize> = config.channels.iter().map(|c| c.index).collect();
    let coordinator = Coordinator::new(config, board.clone(), factory.clone())
        .with_dump_dir(factory.run_dir().to_path_buf());

    let report = if cli.tui {
        let (tx, rx) = unbounded();
        let coordinator = coordinator.with_monitor(tx);
        let handle = thread::Builder::new()
            .name("coordinator".into())
            .spawn(move || coordinator.run())
            .context("starting coordinator")?;

        let mut terminal = ratatui::init();
        let shown = Monitor::new(board.board_id(), indices).run(&mut terminal, &rx);
        ratatui::restore();
        drop(rx);
        shown?;

        let report = handle
            .join()
            .map_err(|_| anyhow!("coordinator thread panicked"))?;
        for line in report.lines() {
            eprintln!("{}", line);
        }
        report
    } else {
        coordinator.run()
    };

    process::exit(report.exit_status());
}
