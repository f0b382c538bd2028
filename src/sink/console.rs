//! Terminal sink.

use std::io::Write;

use tracing::warn;

use crate::events::NarrationEvent;
use crate::supervisor::RunOutcome;

use super::{Delivery, EventReceiver, Sink, SinkError};

const TAG: &str = "[saturn-relay]";

/// Writes narration to a terminal (or any writer). Script output is passed
/// through untouched so its own colors survive; relay messages get a tag.
pub struct ConsoleSink<W: Write + Send> {
    out: W,
    color: bool,
}

impl<W: Write + Send> ConsoleSink<W> {
    pub fn new(out: W, color: bool) -> Self {
        Self { out, color }
    }

    /// Print events from `receiver` until the run finishes and return its
    /// outcome. `on_prompt` runs for every detected prompt and must hand the
    /// question off rather than block, so a timeout or cancellation is shown
    /// as soon as it happens.
    pub fn follow(
        &mut self,
        receiver: &EventReceiver,
        mut on_prompt: impl FnMut(&str),
    ) -> Option<RunOutcome> {
        while let Some(event) = receiver.recv() {
            if let Err(e) = self.publish(&event) {
                warn!("terminal output failed: {e}");
            }
            match event {
                NarrationEvent::PromptDetected { text } => on_prompt(&text),
                NarrationEvent::Finished { outcome } => return Some(outcome),
                _ => {}
            }
        }
        None
    }

    fn tagged(&self, color: &str, text: &str) -> String {
        if self.color {
            format!("\x1b[{color}m{TAG}\x1b[0m {text}")
        } else {
            format!("{TAG} {text}")
        }
    }

    fn render(&self, event: &NarrationEvent) -> String {
        match event {
            NarrationEvent::Output { line } => line.clone(),
            NarrationEvent::Started { .. } | NarrationEvent::AnswerSent { .. } => {
                self.tagged("36", &event.summary())
            }
            NarrationEvent::PromptDetected { .. } | NarrationEvent::Warning { .. } => {
                self.tagged("33", &event.summary())
            }
            NarrationEvent::Error { .. } => self.tagged("31", &event.summary()),
            NarrationEvent::Finished { outcome } => {
                let color = if outcome.is_success() { "32" } else { "31" };
                self.tagged(color, &event.summary())
            }
        }
    }
}

impl<W: Write + Send> Sink for ConsoleSink<W> {
    fn name(&self) -> &str {
        "console"
    }

    fn publish(&mut self, event: &NarrationEvent) -> Result<Delivery, SinkError> {
        let rendered = self.render(event);
        writeln!(self.out, "{rendered}")?;
        self.out.flush()?;
        Ok(Delivery::Delivered)
    }
}
