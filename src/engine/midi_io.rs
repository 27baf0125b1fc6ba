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
//! MIDI input and output workers.
//!
//! Output: the render thread pushes messages into a ring that a worker drains
//! into the device. Input: a worker turns incoming bytes into events. In slave
//! mode clock messages become transport events; everything else is handed to
//! the event worker as [Event::MidiIn].

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::{self as std_thread, JoinHandle},
    time::{Duration, Instant},
};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::EngineError;
use crate::{
    events::{Event, EventSender},
    midi::{
        self,
        message::MidiMessage,
        sync::{ClockSlave, SyncMode},
    },
    playsync::CancelHandle,
    thread::{self, Role},
};

/// Room for outbound messages between two worker wakeups. A clock master
/// produces 24 per beat.
pub const MIDI_OUT_CAPACITY: usize = 1024;

const INPUT_CAPACITY: usize = 256;
const OUT_POLL_INTERVAL: Duration = Duration::from_micros(500);

pub struct MidiIo {
    device: Arc<dyn midi::Device>,
    cancel_handle: CancelHandle,
    out_join: Option<JoinHandle<()>>,
    in_join: Option<JoinHandle<()>>,
}

impl MidiIo {
    pub fn start(
        device: Arc<dyn midi::Device>,
        outbound: rtrb::Consumer<MidiMessage>,
        dropped: Arc<AtomicU64>,
        sync: SyncMode,
        events: EventSender,
    ) -> Result<MidiIo, EngineError> {
        let cancel_handle = CancelHandle::new();

        let out_join = {
            let device = device.clone();
            let cancel_handle = cancel_handle.clone();
            std_thread::Builder::new()
                .name("mloop-midi-out".into())
                .spawn(move || drain_outbound(device, outbound, dropped, cancel_handle))?
        };

        let (sender, receiver) = mpsc::channel::<Vec<u8>>(INPUT_CAPACITY);
        if let Err(e) = device.watch_events(sender) {
            cancel_handle.cancel();
            let _ = out_join.join();
            return Err(EngineError::Midi(e.to_string()));
        }
        let in_join = std_thread::Builder::new()
            .name("mloop-midi-in".into())
            .spawn(move || watch_inbound(receiver, sync, events));
        let in_join = match in_join {
            Ok(in_join) => in_join,
            Err(e) => {
                device.stop_watch_events();
                cancel_handle.cancel();
                let _ = out_join.join();
                return Err(e.into());
            }
        };

        info!(device = device.name(), sync = ?sync, "MIDI started.");
        Ok(MidiIo {
            device,
            cancel_handle,
            out_join: Some(out_join),
            in_join: Some(in_join),
        })
    }

    pub fn device(&self) -> &Arc<dyn midi::Device> {
        &self.device
    }

    /// Stops both workers. Outbound messages still queued are sent first.
    pub fn stop(&mut self) {
        // Closing the input ends the input worker's receive loop.
        self.device.stop_watch_events();
        if let Some(in_join) = self.in_join.take() {
            if in_join.join().is_err() {
                error!("MIDI input worker panicked.");
            }
        }
        self.cancel_handle.cancel();
        if let Some(out_join) = self.out_join.take() {
            if out_join.join().is_err() {
                error!("MIDI output worker panicked.");
            }
        }
    }
}

impl Drop for MidiIo {
    fn drop(&mut self) {
        self.stop();
    }
}

fn drain_outbound(
    device: Arc<dyn midi::Device>,
    mut outbound: rtrb::Consumer<MidiMessage>,
    dropped: Arc<AtomicU64>,
    cancel_handle: CancelHandle,
) {
    thread::register(Role::Midi, false);
    let mut reported = 0;
    loop {
        while let Ok(message) = outbound.pop() {
            if let Err(e) = device.send(message.as_bytes()) {
                warn!(err = %e, message = ?message, "Unable to send MIDI message.");
            }
        }
        let now = dropped.load(Ordering::Relaxed);
        if now != reported {
            warn!(dropped = now - reported, "Outbound MIDI messages were dropped.");
            reported = now;
        }
        if cancel_handle.wait_timeout(OUT_POLL_INTERVAL) {
            break;
        }
    }
    while let Ok(message) = outbound.pop() {
        let _ = device.send(message.as_bytes());
    }
    debug!("MIDI output worker stopped.");
}

fn watch_inbound(mut receiver: mpsc::Receiver<Vec<u8>>, sync: SyncMode, events: EventSender) {
    thread::register(Role::Midi, false);
    let mut slave = ClockSlave::new();
    while let Some(bytes) = receiver.blocking_recv() {
        if ClockSlave::is_sync_message(&bytes) {
            if sync == SyncMode::Slave {
                if let Some(event) = slave.handle(&bytes, Instant::now()) {
                    events.send(event);
                }
            }
            continue;
        }
        match MidiMessage::from_bytes(&bytes) {
            Some(message) => events.send(Event::MidiIn(message)),
            None => debug!(bytes = ?bytes, "Ignoring MIDI input."),
        }
    }
    debug!("MIDI input worker stopped.");
}
