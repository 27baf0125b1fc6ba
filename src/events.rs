// Copyright (C) 2025 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
//! Deferred events.
//!
//! Conditions detected on the render thread or the MIDI input thread that need
//! work those threads must not do are packaged as an [Event] and handled, in
//! order, by a single event worker.

use std::{
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::{self as std_thread, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use crate::{
    midi::message::MidiMessage,
    model::{
        actions::Action,
        channel::{ChannelId, ChannelStatus},
    },
    playsync::CancelHandle,
    thread::{self, Role},
};

/// Room for events the render thread produces between two worker wakeups.
pub const RT_QUEUE_CAPACITY: usize = 1024;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Event {
    ChannelStatusChanged {
        channel: ChannelId,
        status: ChannelStatus,
    },
    /// A key press or other action happened while action recording was on.
    ActionRecorded(Action),
    /// The input crossed the record trigger level.
    SignalThresholdReached,
    /// A free input take ran out of room.
    EndOfRecording,
    BpmChanged {
        bpm: f32,
    },
    TransportAboutToStart,
    TransportAboutToStop,
    MidiClockStart,
    MidiClockStop,
    MidiClockChangeBpm {
        bpm: f32,
    },
    MidiClockChangePosition {
        sixteenths: u16,
    },
    /// A message from the MIDI input that is not clock.
    MidiIn(MidiMessage),
}

/// Somewhere events can be pushed.
pub trait EventSink {
    fn push(&mut self, event: Event);
}

/// Consumes events on the event worker.
pub trait EventHandler: Send {
    fn handle(&mut self, event: Event);
}

/// The render thread's end of the queue. Never blocks or allocates; events
/// that don't fit are counted and dropped.
pub struct RtEventSink {
    producer: rtrb::Producer<Event>,
    dropped: Arc<AtomicU64>,
}

impl RtEventSink {
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventSink for RtEventSink {
    fn push(&mut self, event: Event) {
        if self.producer.push(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Sends events from any non-realtime thread.
#[derive(Clone)]
pub struct EventSender {
    sender: Sender<Event>,
}

impl EventSender {
    pub fn send(&self, event: Event) {
        if self.sender.send(event).is_err() {
            debug!(event = ?event, "Event worker is gone, event dropped.");
        }
    }
}

impl EventSink for EventSender {
    fn push(&mut self, event: Event) {
        self.send(event)
    }
}

/// Collects events in order. Used where a sink is needed but nobody drains.
impl EventSink for Vec<Event> {
    fn push(&mut self, event: Event) {
        Vec::push(self, event)
    }
}

/// Both ends of the deferred-event path before the worker starts.
pub struct EventQueue {
    rt_sink: RtEventSink,
    rt_consumer: rtrb::Consumer<Event>,
    sender: Sender<Event>,
    receiver: Receiver<Event>,
    dropped: Arc<AtomicU64>,
}

impl Default for EventQueue {
    fn default() -> EventQueue {
        EventQueue::new()
    }
}

impl EventQueue {
    pub fn new() -> EventQueue {
        let (producer, rt_consumer) = rtrb::RingBuffer::new(RT_QUEUE_CAPACITY);
        let (sender, receiver) = unbounded();
        let dropped = Arc::new(AtomicU64::new(0));
        EventQueue {
            rt_sink: RtEventSink {
                producer,
                dropped: dropped.clone(),
            },
            rt_consumer,
            sender,
            receiver,
            dropped,
        }
    }

    pub fn sender(&self) -> EventSender {
        EventSender {
            sender: self.sender.clone(),
        }
    }

    /// Splits off the render thread's sink and starts the worker.
    pub fn spawn(
        self,
        handler: Box<dyn EventHandler>,
    ) -> Result<(RtEventSink, Dispatcher), io::Error> {
        let EventQueue {
            rt_sink,
            rt_consumer,
            sender,
            receiver,
            dropped,
        } = self;
        let dispatcher = Dispatcher::spawn(rt_consumer, receiver, handler, dropped)?;
        // The worker keeps running for as long as the dispatcher lives, not
        // for as long as senders exist.
        drop(sender);
        Ok((rt_sink, dispatcher))
    }
}

/// The event worker thread.
pub struct Dispatcher {
    cancel_handle: CancelHandle,
    join_handle: Option<JoinHandle<()>>,
}

impl Dispatcher {
    fn spawn(
        mut rt_consumer: rtrb::Consumer<Event>,
        receiver: Receiver<Event>,
        mut handler: Box<dyn EventHandler>,
        dropped: Arc<AtomicU64>,
    ) -> Result<Dispatcher, io::Error> {
        let cancel_handle = CancelHandle::new();
        let join_handle = {
            let cancel_handle = cancel_handle.clone();
            std_thread::Builder::new()
                .name("mloop-events".into())
                .spawn(move || {
                    thread::register(Role::EventWorker, false);
                    info!("Event worker started.");
                    let mut reported = 0;
                    while !cancel_handle.is_cancelled() {
                        while let Ok(event) = rt_consumer.pop() {
                            handler.handle(event);
                        }
                        match receiver.recv_timeout(POLL_INTERVAL) {
                            Ok(event) => handler.handle(event),
                            Err(RecvTimeoutError::Timeout) => {}
                            Err(RecvTimeoutError::Disconnected) => {
                                if cancel_handle.wait_timeout(POLL_INTERVAL) {
                                    break;
                                }
                            }
                        }
                        let now = dropped.load(Ordering::Relaxed);
                        if now != reported {
                            warn!(dropped = now - reported, "Render events were dropped.");
                            reported = now;
                        }
                    }
                    // Whatever the render thread queued last still gets handled.
                    while let Ok(event) = rt_consumer.pop() {
                        handler.handle(event);
                    }
                    info!("Event worker stopped.");
                })?
        };
        Ok(Dispatcher {
            cancel_handle,
            join_handle: Some(join_handle),
        })
    }

    /// Stops the worker and waits for it.
    pub fn stop(&mut self) {
        self.cancel_handle.cancel();
        if let Some(join_handle) = self.join_handle.take() {
            if join_handle.join().is_err() {
                error!("Event worker panicked.");
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::testutil::eventually;

    struct Collect(Arc<Mutex<Vec<Event>>>);

    impl EventHandler for Collect {
        fn handle(&mut self, event: Event) {
            self.0.lock().push(event);
        }
    }

    #[test]
    fn test_events_reach_the_worker_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let queue = EventQueue::new();
        let sender = queue.sender();
        let (mut rt_sink, mut dispatcher) =
            queue.spawn(Box::new(Collect(seen.clone()))).unwrap();

        rt_sink.push(Event::SignalThresholdReached);
        rt_sink.push(Event::EndOfRecording);
        eventually(|| seen.lock().len() == 2, "render events never arrived");

        sender.send(Event::MidiClockStop);
        eventually(|| seen.lock().len() == 3, "sent event never arrived");
        dispatcher.stop();

        assert_eq!(
            *seen.lock(),
            vec![
                Event::SignalThresholdReached,
                Event::EndOfRecording,
                Event::MidiClockStop
            ]
        );
    }

    #[test]
    fn test_full_render_queue_drops() {
        let queue = EventQueue::new();
        let EventQueue { mut rt_sink, .. } = queue;
        for _ in 0..RT_QUEUE_CAPACITY + 3 {
            rt_sink.push(Event::EndOfRecording);
        }
        assert_eq!(rt_sink.dropped(), 3);
    }
}
