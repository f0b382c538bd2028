//! Sink adapter: fans narration out to independent observers.
//!
//! The supervisor publishes every event once to a `Fanout`, which hands it to
//! each attached sink in order. A sink that fails or overflows is reported
//! once per run as a `Warning` event to the others; it never stops delivery to
//! the remaining sinks and never reaches the supervisor's control flow.

pub mod channel;
pub mod console;

use std::io;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, warn};

use crate::events::NarrationEvent;

pub use channel::{ChannelSink, EventReceiver, RecvError, channel};
pub use console::ConsoleSink;

#[derive(Debug, Error)]
pub enum SinkError {
    /// The consumer behind the sink went away (closed stream, dropped receiver).
    #[error("sink consumer disconnected")]
    Disconnected,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("{0}")]
    Other(String),
}

/// What happened to a published event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Delivered, but the sink's buffer was full and `count` older events
    /// were dropped to make room.
    Dropped { count: usize },
}

/// An observer of narration events.
pub trait Sink: Send {
    /// Short label used in warnings ("console", "log", "stream").
    fn name(&self) -> &str;

    fn publish(&mut self, event: &NarrationEvent) -> Result<Delivery, SinkError>;
}

struct Slot {
    sink: Box<dyn Sink>,
    failure_reported: bool,
    overflow_reported: bool,
}

/// A statically configured set of sinks for one run.
#[derive(Default)]
pub struct Fanout {
    slots: Vec<Slot>,
}

impl Fanout {
    pub fn new(sinks: Vec<Box<dyn Sink>>) -> Self {
        let mut fanout = Self::default();
        for sink in sinks {
            fanout.push(sink);
        }
        fanout
    }

    pub fn push(&mut self, sink: Box<dyn Sink>) {
        self.slots.push(Slot {
            sink,
            failure_reported: false,
            overflow_reported: false,
        });
    }

    /// Builder-style `push`.
    pub fn with(mut self, sink: impl Sink + 'static) -> Self {
        self.push(Box::new(sink));
        self
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Deliver `event` to every sink.
    pub fn publish(&mut self, event: &NarrationEvent) {
        // (index of the sink to skip, message)
        let mut warnings: Vec<(Option<usize>, String)> = Vec::new();

        for (index, slot) in self.slots.iter_mut().enumerate() {
            match slot.sink.publish(event) {
                Ok(Delivery::Delivered) => {}
                Ok(Delivery::Dropped { count }) => {
                    if !slot.overflow_reported {
                        slot.overflow_reported = true;
                        warn!(sink = slot.sink.name(), dropped = count, "sink buffer overflow");
                        warnings.push((
                            None,
                            format!(
                                "{} sink is falling behind; oldest events are being dropped",
                                slot.sink.name()
                            ),
                        ));
                    }
                }
                Err(e) => {
                    if slot.failure_reported {
                        debug!(sink = slot.sink.name(), "sink still failing: {e}");
                    } else {
                        slot.failure_reported = true;
                        warn!(sink = slot.sink.name(), "sink failed: {e}");
                        warnings.push((
                            Some(index),
                            format!("{} sink failed: {e}", slot.sink.name()),
                        ));
                    }
                }
            }
        }

        for (skip, message) in warnings {
            let warning = NarrationEvent::warning(message);
            for (index, slot) in self.slots.iter_mut().enumerate() {
                if skip == Some(index) {
                    continue;
                }
                if let Err(e) = slot.sink.publish(&warning) {
                    debug!(sink = slot.sink.name(), "warning not delivered: {e}");
                }
            }
        }
    }
}

/// Captures events in memory. Cloning shares the same buffer.
#[derive(Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<NarrationEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<NarrationEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Output lines only, in order.
    pub fn lines(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                NarrationEvent::Output { line } => Some(line),
                _ => None,
            })
            .collect()
    }
}

impl Sink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn publish(&mut self, event: &NarrationEvent) -> Result<Delivery, SinkError> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(Delivery::Delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    impl Sink for Failing {
        fn name(&self) -> &str {
            "failing"
        }
        fn publish(&mut self, _event: &NarrationEvent) -> Result<Delivery, SinkError> {
            Err(SinkError::Other("boom".into()))
        }
    }

    struct Overflowing;

    impl Sink for Overflowing {
        fn name(&self) -> &str {
            "overflowing"
        }
        fn publish(&mut self, _event: &NarrationEvent) -> Result<Delivery, SinkError> {
            Ok(Delivery::Dropped { count: 1 })
        }
    }

    fn warnings(events: &[NarrationEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                NarrationEvent::Warning { message } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn every_sink_gets_every_event_in_order() {
        let a = MemorySink::new();
        let b = MemorySink::new();
        let mut fanout = Fanout::default().with(a.clone()).with(b.clone());
        assert_eq!(fanout.len(), 2);

        for line in ["one", "two", "three"] {
            fanout.publish(&NarrationEvent::output(line));
        }
        assert_eq!(a.lines(), vec!["one", "two", "three"]);
        assert_eq!(b.lines(), a.lines());
    }

    #[test]
    fn failing_sink_is_isolated_and_reported_once() {
        let healthy = MemorySink::new();
        let mut fanout = Fanout::default().with(Failing).with(healthy.clone());

        for i in 0..5 {
            fanout.publish(&NarrationEvent::output(format!("line {i}")));
        }

        let events = healthy.events();
        assert_eq!(healthy.lines().len(), 5);
        let warned = warnings(&events);
        assert_eq!(warned.len(), 1);
        assert!(warned[0].contains("failing sink failed"));
    }

    #[test]
    fn overflow_is_reported_once_to_everyone() {
        let healthy = MemorySink::new();
        let mut fanout = Fanout::default().with(Overflowing).with(healthy.clone());

        fanout.publish(&NarrationEvent::output("a"));
        fanout.publish(&NarrationEvent::output("b"));

        let warned = warnings(&healthy.events());
        assert_eq!(warned.len(), 1);
        assert!(warned[0].contains("overflowing"));
    }

    #[test]
    fn empty_fanout_accepts_events() {
        let mut fanout = Fanout::new(vec![]);
        assert!(fanout.is_empty());
        fanout.publish(&NarrationEvent::output("nobody listens"));
    }

    #[test]
    fn channel_sink_feeds_a_receiver_through_the_fanout() {
        let (sink, receiver) = crate::sink::channel("stream", 8);
        let mut fanout = Fanout::default().with(sink);
        fanout.publish(&NarrationEvent::output("hello"));
        assert_eq!(receiver.recv(), Some(NarrationEvent::output("hello")));
    }
}
