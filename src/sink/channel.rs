//! Bounded, drop-oldest event queue between the supervisor worker and a
//! streaming consumer (the HTTP event stream, the interactive terminal).

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::events::NarrationEvent;

use super::{Delivery, Sink, SinkError};

/// Default queue bound per consumer.
pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Queue {
    events: VecDeque<NarrationEvent>,
    capacity: usize,
    sender_done: bool,
    receiver_gone: bool,
}

type Shared = Arc<(Mutex<Queue>, Condvar)>;

fn lock(shared: &Shared) -> MutexGuard<'_, Queue> {
    shared.0.lock().unwrap_or_else(|e| e.into_inner())
}

/// Create a connected sink/receiver pair holding at most `capacity` events.
pub fn channel(name: &str, capacity: usize) -> (ChannelSink, EventReceiver) {
    let shared: Shared = Arc::new((
        Mutex::new(Queue {
            events: VecDeque::new(),
            capacity: capacity.max(1),
            sender_done: false,
            receiver_gone: false,
        }),
        Condvar::new(),
    ));
    (
        ChannelSink {
            name: name.to_string(),
            shared: shared.clone(),
        },
        EventReceiver { shared },
    )
}

/// Producer half, attached to a `Fanout`.
pub struct ChannelSink {
    name: String,
    shared: Shared,
}

impl Sink for ChannelSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn publish(&mut self, event: &NarrationEvent) -> Result<Delivery, SinkError> {
        let mut queue = lock(&self.shared);
        if queue.receiver_gone {
            return Err(SinkError::Disconnected);
        }
        let mut dropped = 0;
        while queue.events.len() >= queue.capacity {
            queue.events.pop_front();
            dropped += 1;
        }
        queue.events.push_back(event.clone());
        drop(queue);
        self.shared.1.notify_all();

        if dropped > 0 {
            Ok(Delivery::Dropped { count: dropped })
        } else {
            Ok(Delivery::Delivered)
        }
    }
}

impl Drop for ChannelSink {
    fn drop(&mut self) {
        lock(&self.shared).sender_done = true;
        self.shared.1.notify_all();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvError {
    Timeout,
    /// The sink was dropped and every queued event has been consumed.
    Closed,
}

/// Consumer half.
pub struct EventReceiver {
    shared: Shared,
}

impl EventReceiver {
    /// Block until an event arrives or the sink is gone.
    pub fn recv(&self) -> Option<NarrationEvent> {
        let mut queue = lock(&self.shared);
        loop {
            if let Some(event) = queue.events.pop_front() {
                return Some(event);
            }
            if queue.sender_done {
                return None;
            }
            queue = self
                .shared
                .1
                .wait(queue)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<NarrationEvent, RecvError> {
        let deadline = Instant::now() + timeout;
        let mut queue = lock(&self.shared);
        loop {
            if let Some(event) = queue.events.pop_front() {
                return Ok(event);
            }
            if queue.sender_done {
                return Err(RecvError::Closed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(RecvError::Timeout);
            }
            queue = self
                .shared
                .1
                .wait_timeout(queue, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    /// Everything queued right now, without waiting.
    pub fn drain(&self) -> Vec<NarrationEvent> {
        lock(&self.shared).events.drain(..).collect()
    }
}

impl Drop for EventReceiver {
    fn drop(&mut self) {
        lock(&self.shared).receiver_gone = true;
    }
}
