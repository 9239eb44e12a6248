pub mod buffer;
pub mod completion;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod regdump;
pub mod run_state;
pub mod sim;
pub mod sink;
pub mod stats;
pub mod trigger;
pub mod tui;
pub mod viewer;
pub mod worker;

#[cfg(test)]
mod testutil;

pub use buffer::*;
pub use completion::*;
pub use config::*;
pub use coordinator::*;
pub use error::*;
pub use hardware::*;
pub use run_state::*;
pub use sim::*;
pub use sink::*;
pub use stats::*;
pub use trigger::*;
pub use tui::*;
pub use viewer::*;
pub use worker::*;
