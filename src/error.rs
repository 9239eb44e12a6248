use std::{io, time::Duration};

/// Exit codes reported by the coordinator and by every channel worker.
///
/// Values 0 through 17 match the legacy acquisition tooling and must not be
/// renumbered.
#[repr(i32)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Debug)]
pub enum ExitCode {
    Done = 0,
    LibraryInit = 1,
    DeviceOpen = 2,
    BadArgument = 3,
    InvalidMaxChannels = 4,
    BufferAlloc = 5,
    ChannelUnavailable = 6,
    FilterLoad = 7,
    SemaphoreCreate = 8,
    ThreadStart = 9,
    ViewerParam = 10,
    ViewerConnect = 11,
    ViewerSend = 12,
    ThreadError = 13,
    FileWrite = 14,
    InterruptEnable = 15,
    DmaOpen = 16,
    DmaTimeout = 17,
    ReadyTimeout = 18,
    Undefined = 19,
}

impl From<i32> for ExitCode {
    fn from(value: i32) -> Self {
        match value {
            0 => Self::Done,
            1 => Self::LibraryInit,
            2 => Self::DeviceOpen,
            3 => Self::BadArgument,
            4 => Self::InvalidMaxChannels,
            5 => Self::BufferAlloc,
            6 => Self::ChannelUnavailable,
            7 => Self::FilterLoad,
            8 => Self::SemaphoreCreate,
            9 => Self::ThreadStart,
            10 => Self::ViewerParam,
            11 => Self::ViewerConnect,
            12 => Self::ViewerSend,
            13 => Self::ThreadError,
            14 => Self::FileWrite,
            15 => Self::InterruptEnable,
            16 => Self::DmaOpen,
            17 => Self::DmaTimeout,
            18 => Self::ReadyTimeout,
            _ => Self::Undefined,
        }
    }
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn is_success(self) -> bool {
        self == Self::Done
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::Done => "program done",
            Self::LibraryInit => "Error: driver library init failed",
            Self::DeviceOpen => "Error: device failed to open",
            Self::BadArgument => "Error: invalid command line argument(s)",
            Self::InvalidMaxChannels => "Error: invalid maximum number of channels",
            Self::BufferAlloc => "Error: buffer allocation failed",
            Self::ChannelUnavailable => "Error: requested channel not available",
            Self::FilterLoad => "Error: filter table load failed",
            Self::SemaphoreCreate => "Error: semaphore creation failed",
            Self::ThreadStart => "Error: thread start failed",
            Self::ViewerParam => "Error: invalid Signal Analyzer parameter",
            Self::ViewerConnect => "Error: cannot connect to Signal Analyzer",
            Self::ViewerSend => "Error: sending data to Signal Analyzer failed",
            Self::ThreadError => "Error: Thread Error",
            Self::FileWrite => "Error: Failure writing to file",
            Self::InterruptEnable => "Error: Failure Enabling interrupt",
            Self::DmaOpen => "Error: DMA channel failed to open",
            Self::DmaTimeout => "Error: DMA complete timeout",
            Self::ReadyTimeout => "Error: channels not ready before timeout",
            Self::Undefined => "Error: undefined error",
        }
    }
}

/// Failures reported by the board collaborator.
#[derive(Debug, thiserror::Error)]
pub enum HardwareError {
    #[error("driver library failed to initialize: {0}")]
    LibraryInit(String),

    #[error("no acquisition board found")]
    DeviceNotFound,

    #[error("channel {0} is not available on this board")]
    ChannelUnavailable(usize),

    #[error("filter table load failed on channel {0}")]
    FilterLoad(usize),

    #[error("DMA channel {0} failed to open")]
    DmaOpen(usize),

    #[error("DMA allocation of {len} bytes failed on channel {channel}")]
    DmaAlloc { channel: usize, len: usize },

    #[error("enabling interrupt failed on channel {0}")]
    InterruptEnable(usize),

    #[error("register access failed: {0}")]
    Register(String),
}

impl HardwareError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::LibraryInit(_) => ExitCode::LibraryInit,
            Self::DeviceNotFound => ExitCode::DeviceOpen,
            Self::ChannelUnavailable(_) => ExitCode::ChannelUnavailable,
            Self::FilterLoad(_) => ExitCode::FilterLoad,
            Self::DmaOpen(_) => ExitCode::DmaOpen,
            Self::DmaAlloc { .. } => ExitCode::BufferAlloc,
            Self::InterruptEnable(_) => ExitCode::InterruptEnable,
            Self::Register(_) => ExitCode::Undefined,
        }
    }
}

/// Errors that end one channel worker. Siblings keep running.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("output file failed to open: {0}")]
    SinkOpen(#[source] io::Error),

    #[error("trigger programming failed: {0}")]
    Trigger(#[source] HardwareError),

    #[error("DMA channel failed to open: {0}")]
    DmaOpen(#[source] HardwareError),

    #[error("buffer allocation failed for slot {slot}: {source}")]
    BufferAlloc { slot: usize, source: HardwareError },

    #[error("completion event for channel {0} is already registered")]
    AlreadyRegistered(usize),

    #[error("failure enabling interrupt: {0}")]
    InterruptEnable(#[source] HardwareError),

    #[error("DMA start failed: {0}")]
    DmaStart(#[source] HardwareError),

    #[error("DMA complete timeout on slot {slot} after {timeout:?}")]
    DmaTimeout { slot: usize, timeout: Duration },

    #[error("slot {slot} signalled complete but was not filled")]
    SlotOwnership { slot: usize },

    #[error("completion interrupt went away while waiting on slot {slot}")]
    CompletionLost { slot: usize },

    #[error("run cancelled before the trigger pulse")]
    Cancelled,

    #[error("sending data to signal analyzer failed: {0}")]
    ViewerSend(#[source] io::Error),

    #[error("worker thread panicked")]
    Panicked,
}

impl ChannelError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::SinkOpen(_) => ExitCode::FileWrite,
            Self::Trigger(e) => e.exit_code(),
            Self::DmaOpen(_) => ExitCode::DmaOpen,
            Self::BufferAlloc { .. } => ExitCode::BufferAlloc,
            Self::AlreadyRegistered(_) => ExitCode::SemaphoreCreate,
            Self::InterruptEnable(_) => ExitCode::InterruptEnable,
            Self::DmaStart(_) => ExitCode::DmaOpen,
            Self::DmaTimeout { .. } => ExitCode::DmaTimeout,
            Self::SlotOwnership { .. } | Self::CompletionLost { .. } | Self::Panicked => {
                ExitCode::ThreadError
            }
            Self::Cancelled => ExitCode::ReadyTimeout,
            Self::ViewerSend(_) => ExitCode::ViewerSend,
        }
    }
}

/// Configuration that cannot describe a valid run.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid argument: {0}")]
    BadArgument(String),

    #[error("no channels selected")]
    NoChannels,

    #[error("channel {channel} requested but the board has {available} channels")]
    ChannelUnavailable { channel: usize, available: usize },

    #[error("invalid viewer parameter: {0}")]
    ViewerParam(String),
}

impl ConfigError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::BadArgument(_) => ExitCode::BadArgument,
            Self::NoChannels => ExitCode::InvalidMaxChannels,
            Self::ChannelUnavailable { .. } => ExitCode::ChannelUnavailable,
            Self::ViewerParam(_) => ExitCode::ViewerParam,
        }
    }
}
