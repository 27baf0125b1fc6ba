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
use std::{
    error::Error,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Barrier,
    },
    thread::{self, JoinHandle},
};

use parking_lot::Mutex;
use tokio::sync::mpsc::Sender;
use tracing::{debug, error};

/// A mock device. Inputs are injected with [Device::mock_event] and sent
/// messages are kept for inspection.
#[derive(Clone)]
pub struct Device {
    name: String,
    barrier: Arc<Barrier>,
    closed: Arc<AtomicBool>,
    event: Arc<Mutex<Vec<u8>>>,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    event_thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Device {
    /// Gets the given mock device.
    pub fn get(name: &str) -> Device {
        Device {
            name: name.to_string(),
            closed: Arc::new(AtomicBool::new(false)),
            barrier: Arc::new(Barrier::new(2)),
            event: Arc::new(Mutex::new(Vec::new())),
            sent: Arc::new(Mutex::new(Vec::new())),
            event_thread: Arc::new(Mutex::new(None)),
        }
    }

    /// Sends the mock event through to the watcher. Blocks until the watcher
    /// picked it up, so only call it while events are being watched.
    pub fn mock_event(&self, event: &[u8]) {
        *self.event.lock() = event.to_vec();
        // Wait until the thread goes to receive the event.
        self.barrier.wait();
        // Wait until the thread has forwarded it.
        self.barrier.wait();
    }

    /// Every message sent so far.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }
}

impl super::Device for Device {
    fn name(&self) -> String {
        self.name.clone()
    }

    /// Watches MIDI input for events and sends them to the given sender.
    fn watch_events(&self, sender: Sender<Vec<u8>>) -> Result<(), Box<dyn Error>> {
        let mut event_thread = self.event_thread.lock();
        if event_thread.is_some() {
            return Err("Already watching events.".into());
        }

        let barrier = self.barrier.clone();
        let event = self.event.clone();
        let closed = self.closed.clone();
        *event_thread = Some(thread::spawn(move || loop {
            barrier.wait();
            if closed.load(Ordering::Acquire) {
                return;
            }
            let event = event.lock().clone();
            if let Err(e) = sender.blocking_send(event) {
                error!(err = %e, "Mock receiver went away.");
            }
            barrier.wait();
        }));

        Ok(())
    }

    /// Stops watching events.
    fn stop_watch_events(&self) {
        let Some(event_thread) = self.event_thread.lock().take() else {
            return;
        };
        self.closed.store(true, Ordering::Release);
        // Wake the watcher so it sees the flag.
        self.barrier.wait();
        if event_thread.join().is_err() {
            error!("Mock watcher panicked.");
        }
    }

    fn send(&self, message: &[u8]) -> Result<(), Box<dyn Error>> {
        debug!(device = self.name, message = ?message, "Mock send.");
        self.sent.lock().push(message.to_vec());
        Ok(())
    }

    #[cfg(test)]
    fn to_mock(&self) -> Result<Arc<Device>, Box<dyn Error>> {
        Ok(Arc::new(self.clone()))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (Mock)", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::Device as _;

    #[test]
    fn test_mock_round_trip() {
        let device = Device::get("mock-device");
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        device.watch_events(tx).unwrap();
        assert!(device.watch_events(tokio::sync::mpsc::channel(1).0).is_err());

        device.mock_event(&[0x90, 60, 100]);
        assert_eq!(rx.blocking_recv(), Some(vec![0x90, 60, 100]));
        device.stop_watch_events();

        device.send(&[0xF8]).unwrap();
        assert_eq!(device.sent(), vec![vec![0xF8]]);
        assert_eq!(device.to_string(), "mock-device (Mock)");
    }
}
