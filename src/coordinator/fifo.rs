//! Multi-stream event FIFO shared between producers and the coordinator loop
//!
//! Each pushed event carries a done marker recorded in its stream's
//! timeline. Markers flip to done once the event's writes are queued and
//! committed; `clean` then pops finished markers off the timeline front into
//! the stream's ack counter. Acks are what tells a producer it may recycle
//! its retention queue.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::events::{Event, StreamKind};

/// An event waiting to be handled, with its completion marker
#[derive(Debug)]
pub struct EventEntry {
    pub kind: StreamKind,
    pub event: Event,
    pub done: Arc<AtomicBool>,
}

impl EventEntry {
    pub fn mark_done(&self) {
        self.done.store(true, Ordering::Release);
    }
}

#[derive(Debug, Default)]
struct Stream {
    timeline: VecDeque<Arc<AtomicBool>>,
    acks: usize,
}

/// The producer-facing queue of the coordinator
#[derive(Debug, Default)]
pub struct EventFifo {
    events: VecDeque<EventEntry>,
    streams: [Stream; 2],
}

fn idx(kind: StreamKind) -> usize {
    match kind {
        StreamKind::Sql => 0,
        StreamKind::Storage => 1,
    }
}

impl EventFifo {
    /// Queue an event and return the acks already collectable on its stream
    pub fn push(&mut self, kind: StreamKind, event: Event) -> usize {
        let done = Arc::new(AtomicBool::new(false));
        self.streams[idx(kind)].timeline.push_back(Arc::clone(&done));
        self.events.push_back(EventEntry { kind, event, done });
        self.take_acks(kind)
    }

    /// Move completed markers from the timeline front into the ack counter.
    /// Markers behind an unfinished event stay put so acks never overtake
    /// submission order.
    pub fn clean(&mut self, kind: StreamKind) -> usize {
        let stream = &mut self.streams[idx(kind)];
        let mut cleaned = 0;
        while let Some(front) = stream.timeline.front() {
            if !front.load(Ordering::Acquire) {
                break;
            }
            stream.timeline.pop_front();
            cleaned += 1;
        }
        stream.acks += cleaned;
        cleaned
    }

    /// Collect and reset the ack counter for one stream
    pub fn take_acks(&mut self, kind: StreamKind) -> usize {
        self.clean(kind);
        std::mem::take(&mut self.streams[idx(kind)].acks)
    }

    /// Hand every pending event to the coordinator loop
    pub fn drain_events(&mut self) -> VecDeque<EventEntry> {
        std::mem::take(&mut self.events)
    }

    pub fn push_back_events(&mut self, events: VecDeque<EventEntry>) {
        let mut events = events;
        while let Some(entry) = events.pop_back() {
            self.events.push_front(entry);
        }
    }

    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    pub fn timeline_len(&self, kind: StreamKind) -> usize {
        self.streams[idx(kind)].timeline.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::LogEntry;

    fn log_event() -> Event {
        Event::Log(LogEntry::default())
    }

    #[test]
    fn acks_follow_completion_order() {
        let mut fifo = EventFifo::default();
        fifo.push(StreamKind::Sql, log_event());
        fifo.push(StreamKind::Sql, log_event());
        let entries = fifo.drain_events();
        assert_eq!(entries.len(), 2);

        // Completing the second event first releases nothing.
        entries[1].mark_done();
        assert_eq!(fifo.take_acks(StreamKind::Sql), 0);

        entries[0].mark_done();
        assert_eq!(fifo.take_acks(StreamKind::Sql), 2);
        assert_eq!(fifo.take_acks(StreamKind::Sql), 0);
    }

    #[test]
    fn streams_are_independent() {
        let mut fifo = EventFifo::default();
        fifo.push(StreamKind::Sql, log_event());
        fifo.push(StreamKind::Storage, log_event());
        let entries = fifo.drain_events();
        entries[1].mark_done();

        assert_eq!(fifo.take_acks(StreamKind::Sql), 0);
        assert_eq!(fifo.take_acks(StreamKind::Storage), 1);
        assert_eq!(fifo.timeline_len(StreamKind::Sql), 1);
        assert_eq!(fifo.timeline_len(StreamKind::Storage), 0);
    }

    #[test]
    fn push_reports_collectable_acks() {
        let mut fifo = EventFifo::default();
        assert_eq!(fifo.push(StreamKind::Sql, log_event()), 0);
        fifo.drain_events()[0].mark_done();
        // The next push on the same stream collects the finished event.
        assert_eq!(fifo.push(StreamKind::Sql, log_event()), 1);
    }
}
