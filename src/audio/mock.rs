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
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::{self as std_thread, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{error, info, span, Level};

use super::{
    thread_priority::{Scheduling, SchedulingState},
    RenderCallback,
};
use crate::{
    config,
    playsync::CancelHandle,
    thread::{self, Role},
};

/// Names containing this run on their own clock instead of [Device::process].
const CLOCKED: &str = "clocked";

/// A mock device. It doesn't play anything; it runs the callback on its own
/// thread, either when a test asks with [Device::process] or, for devices
/// named "mock-clocked...", once per block period.
#[derive(Clone)]
pub struct Device {
    name: String,
    sample_rate: u32,
    buffer_size: usize,
    has_input: bool,
    /// Interleaved stereo signal fed to the callback in a loop.
    input: Arc<Mutex<Vec<f32>>>,
    output: Arc<Mutex<Vec<f32>>>,
    blocks: Arc<AtomicU64>,
    scheduling: Arc<SchedulingState>,
    running: Arc<Mutex<Option<Running>>>,
}

struct Running {
    ticks: Option<Sender<Sender<()>>>,
    cancel_handle: CancelHandle,
    join_handle: JoinHandle<()>,
}

impl Device {
    /// Gets the given mock device.
    pub fn get(config: &config::Audio) -> Device {
        Device {
            name: config.device().to_string(),
            sample_rate: config.sample_rate(),
            buffer_size: config.buffer_size(),
            has_input: config.input_device().is_some(),
            input: Arc::new(Mutex::new(Vec::new())),
            output: Arc::new(Mutex::new(Vec::new())),
            blocks: Arc::new(AtomicU64::new(0)),
            scheduling: Arc::new(SchedulingState::default()),
            running: Arc::new(Mutex::new(None)),
        }
    }

    fn is_clocked(&self) -> bool {
        self.name.contains(CLOCKED)
    }

    /// Loops the given interleaved stereo signal into the input.
    pub fn set_input(&self, signal: Vec<f32>) {
        *self.input.lock() = signal;
    }

    /// Runs one callback and waits for it. Only for manually clocked devices.
    pub fn process(&self) -> Result<(), Box<dyn Error>> {
        let ticks = match self.running.lock().as_ref() {
            Some(Running {
                ticks: Some(ticks), ..
            }) => ticks.clone(),
            _ => return Err(format!("{} is not running on a manual clock", self.name).into()),
        };
        let (done_tx, done_rx) = bounded(1);
        ticks.send(done_tx)?;
        done_rx.recv()?;
        Ok(())
    }

    /// Runs `blocks` callbacks.
    pub fn process_blocks(&self, blocks: usize) -> Result<(), Box<dyn Error>> {
        for _ in 0..blocks {
            self.process()?;
        }
        Ok(())
    }

    /// The output of the last callback.
    pub fn output(&self) -> Vec<f32> {
        self.output.lock().clone()
    }

    /// Callbacks run so far.
    pub fn blocks(&self) -> u64 {
        self.blocks.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    fn render_loop(
        &self,
        mut callback: RenderCallback,
        ticks: Option<Receiver<Sender<()>>>,
        cancel_handle: CancelHandle,
    ) {
        thread::register(Role::Render, true);
        let samples = self.buffer_size * 2;
        let mut out = vec![0.0f32; samples];
        let mut input = vec![0.0f32; samples];
        let mut input_pos = 0;
        let period =
            Duration::from_secs_f64(self.buffer_size as f64 / self.sample_rate.max(1) as f64);

        loop {
            let done = match &ticks {
                Some(ticks) => match ticks.recv() {
                    Ok(done) => Some(done),
                    Err(_) => return,
                },
                None => {
                    if cancel_handle.wait_timeout(period) {
                        return;
                    }
                    None
                }
            };

            let has_input = self.has_input;
            if has_input {
                let signal = self.input.lock();
                if signal.is_empty() {
                    input.fill(0.0);
                } else {
                    for sample in input.iter_mut() {
                        *sample = signal[input_pos % signal.len()];
                        input_pos += 1;
                    }
                }
            }
            out.fill(0.0);
            callback(&mut out, has_input.then_some(input.as_slice()));
            self.output.lock().clone_from(&out);
            self.blocks.fetch_add(1, Ordering::AcqRel);

            if let Some(done) = done {
                let _ = done.send(());
            }
        }
    }
}

impl super::Device for Device {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn has_input(&self) -> bool {
        self.has_input
    }

    fn start(&self, callback: RenderCallback) -> Result<(), Box<dyn Error>> {
        let span = span!(Level::INFO, "start (mock)");
        let _enter = span.enter();

        let mut running = self.running.lock();
        if running.is_some() {
            return Err(format!("{} is already running", self.name).into());
        }

        let (ticks_tx, ticks_rx) = if self.is_clocked() {
            (None, None)
        } else {
            let (tx, rx) = bounded(0);
            (Some(tx), Some(rx))
        };
        let cancel_handle = CancelHandle::new();
        let join_handle = {
            let device = self.clone();
            let cancel_handle = cancel_handle.clone();
            std_thread::Builder::new()
                .name("mloop-mock-audio".into())
                .spawn(move || device.render_loop(callback, ticks_rx, cancel_handle))?
        };
        self.scheduling.set(Scheduling::Normal);
        *running = Some(Running {
            ticks: ticks_tx,
            cancel_handle,
            join_handle,
        });
        info!(
            device = self.name,
            clocked = self.is_clocked(),
            "Mock device started."
        );
        Ok(())
    }

    fn stop(&self) {
        let Some(mut running) = self.running.lock().take() else {
            return;
        };
        running.cancel_handle.cancel();
        // Dropping the tick sender wakes a manual render loop.
        running.ticks.take();
        if running.join_handle.join().is_err() {
            error!(device = self.name, "Mock render thread panicked.");
        }
        info!(device = self.name, "Mock device stopped.");
    }

    fn scheduling(&self) -> Scheduling {
        self.scheduling.get()
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
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::{audio::Device as _, testutil::eventually};

    fn device(name: &str, input: bool) -> Device {
        let yaml = if input {
            format!(
                "device: {}\ninput_device: mock-in\nbuffer_size: 64\n",
                name
            )
        } else {
            format!("device: {}\nbuffer_size: 64\n", name)
        };
        Device::get(&serde_yml::from_str::<config::Audio>(&yaml).unwrap())
    }

    #[test]
    fn test_manual_clock() {
        let device = device("mock-device", true);
        device.set_input(vec![0.5, -0.5]);
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = calls.clone();
            device
                .start(Box::new(move |out, input| {
                    assert_eq!(thread::current().map(|info| info.role), Some(Role::Render));
                    let input = input.unwrap();
                    assert_eq!(input.len(), out.len());
                    out.copy_from_slice(input);
                    calls.fetch_add(1, Ordering::Relaxed);
                }))
                .unwrap();
        }
        assert!(device.start(Box::new(|_, _| {})).is_err());

        device.process_blocks(3).unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 3);
        assert_eq!(device.blocks(), 3);
        let output = device.output();
        assert_eq!(output.len(), 128);
        assert_eq!(&output[..4], &[0.5, -0.5, 0.5, -0.5]);

        device.stop();
        assert!(!device.is_running());
        assert!(device.process().is_err());
    }

    #[test]
    fn test_clocked_device_runs_by_itself() {
        let device = device("mock-clocked", false);
        assert!(!device.has_input());
        device
            .start(Box::new(|out, input| {
                assert!(input.is_none());
                out.fill(0.25);
            }))
            .unwrap();
        eventually(|| device.blocks() >= 3, "clocked mock never ran");
        assert!(device.process().is_err());
        device.stop();
        assert_eq!(device.output()[0], 0.25);
    }
}
