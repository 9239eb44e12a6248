use crate::{MonitorEvent, RunStats, WorkerState};
use anyhow::Result;
use crossbeam_channel::{tick, Receiver, TryRecvError};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use ratatui::{
    buffer::Buffer,
    layout::Rect,
    style::Stylize,
    symbols::border,
    text::{Line, Text},
    widgets::{Block, Paragraph, Widget},
    DefaultTerminal, Frame,
};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    Quit,
    Finished,
}

/// Live per-channel status panel fed by worker [`MonitorEvent`]s.
#[derive(Debug)]
pub struct Monitor {
    pub stats: RunStats,
    pub board_id: u32,
    pub t_begin: Instant,
    pub exit: Option<MonitorExit>,
}

impl Monitor {
    pub fn new(board_id: u32, channels: impl IntoIterator<Item = usize>) -> Self {
        Self {
            stats: RunStats::new(channels),
            board_id,
            t_begin: Instant::now(),
            exit: None,
        }
    }

    /// Redraw until every channel has finished, the run hangs up, or the user
    /// quits. Quitting only closes the panel; acquisition carries on.
    pub fn run(
        &mut self,
        terminal: &mut DefaultTerminal,
        events: &Receiver<MonitorEvent>,
    ) -> Result<MonitorExit> {
        let ticker = tick(Duration::from_millis(250));
        while self.exit.is_none() {
            let _ = ticker.recv();
            self.drain(events);
            self.handle_events()?;
            if self.stats.all_finished() {
                self.exit = Some(MonitorExit::Finished);
            }
            terminal.draw(|f| self.draw(f))?;
        }
        Ok(self.exit.unwrap_or(MonitorExit::Quit))
    }

    pub fn drain(&mut self, events: &Receiver<MonitorEvent>) {
        loop {
            match events.try_recv() {
                Ok(event) => self.stats.apply(&event),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.exit = Some(MonitorExit::Finished);
                    break;
                }
            }
        }
        let now = Instant::now();
        for channel in self.stats.channels.values_mut() {
            channel.counter.evict(now);
        }
    }

    fn draw(&self, frame: &mut Frame) {
        frame.render_widget(self, frame.area());
    }

    fn handle_events(&mut self) -> Result<()> {
        if event::poll(Duration::ZERO)? {
            if let Event::Key(key_event) = event::read()? {
                if key_event.kind == KeyEventKind::Press {
                    self.handle_key_event(key_event);
                }
            }
        }
        Ok(())
    }

    fn handle_key_event(&mut self, key_event: KeyEvent) {
        if let KeyCode::Char('q') = key_event.code {
            self.exit = Some(MonitorExit::Quit);
        }
    }
}

fn state_label(state: WorkerState) -> String {
    format!("{:?}", state)
}

impl Widget for &Monitor {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let title = Line::from(format!(" Board 0x{:x} Acquisition ", self.board_id).bold());
        let instructions = Line::from(vec![" Close ".into(), "<Q> ".blue().bold()]);
        let block = Block::bordered()
            .title(title.centered())
            .title_bottom(instructions.centered())
            .border_set(border::THICK);

        let mut lines = vec![Line::from(vec![
            "Elapsed time: ".into(),
            self.t_begin.elapsed().as_secs().to_string().yellow(),
            " s".into(),
            " Total rate: ".into(),
            format!("{:.2}", self.stats.total_rate()).yellow(),
            " MB/s".into(),
        ])];
        let now = Instant::now();
        for (index, channel) in &self.stats.channels {
            let exit = match channel.exit {
                Some(code) if !code.is_success() => code.message().red(),
                Some(_) => "ok".green(),
                None => "-".into(),
            };
            lines.push(Line::from(vec![
                format!("Channel {} ", index + 1).bold(),
                state_label(channel.state).cyan(),
                " Transfers: ".into(),
                channel.counter.n_transfers.to_string().yellow(),
                " Rate: ".into(),
                format!("{:.2}", channel.counter.rate()).yellow(),
                " MB/s".into(),
                " Avg: ".into(),
                format!("{:.2}", channel.counter.average_rate(now)).yellow(),
                " MB/s".into(),
                " Sink errors: ".into(),
                channel.sink_errors.to_string().yellow(),
                " Exit: ".into(),
                exit,
            ]));
        }

        Paragraph::new(Text::from(lines))
            .centered()
            .block(block)
            .render(area, buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ExitCode;
    use crossbeam_channel::unbounded;

    fn rendered(monitor: &Monitor) -> String {
        let area = Rect::new(0, 0, 160, 8);
        let mut buf = Buffer::empty(area);
        monitor.render(area, &mut buf);
        buf.content().iter().map(|c| c.symbol()).collect()
    }

    #[test]
    fn panel_shows_each_channel() {
        let (tx, rx) = unbounded();
        let mut monitor = Monitor::new(0x71620, [0, 1]);
        tx.send(MonitorEvent::State {
            channel: 1,
            state: WorkerState::Running,
        })
        .unwrap();
        tx.send(MonitorEvent::Drained {
            channel: 1,
            bytes: 4096,
        })
        .unwrap();
        tx.send(MonitorEvent::Finished {
            channel: 0,
            code: ExitCode::DmaTimeout,
        })
        .unwrap();
        monitor.drain(&rx);

        let text = rendered(&monitor);
        assert!(text.contains("Board 0x71620"));
        assert!(text.contains("Channel 2 Running"));
        assert!(text.contains("Transfers: 1"));
        assert!(text.contains("Avg: "));
        assert!(text.contains("DMA complete timeout"));
        assert!(!monitor.stats.all_finished());
        assert_eq!(monitor.exit, None);

        drop(tx);
        monitor.drain(&rx);
        assert_eq!(monitor.exit, Some(MonitorExit::Finished));
    }
}
