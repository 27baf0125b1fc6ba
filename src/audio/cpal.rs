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
    sync::Arc,
    thread::{self as std_thread, JoinHandle},
    time::Duration,
};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::bounded;
use parking_lot::Mutex;
use thread_priority::ThreadPriorityValue;
use tracing::{error, info, span, warn, Level};

use super::{
    thread_priority::{
        callback_thread_priority, configure_audio_thread_priority, rt_audio_enabled, Scheduling,
        SchedulingState,
    },
    RenderCallback,
};
use crate::{
    config,
    playsync::CancelHandle,
    thread::{self, Role},
};

/// How much input may queue up between the input and output callbacks.
const INPUT_RING_SECONDS: f32 = 0.2;

/// How long [Device::start] waits for the streams to come up.
const START_TIMEOUT: Duration = Duration::from_secs(5);

/// A small wrapper around a cpal::Device. Output always comes from the
/// callback as stereo and is mapped onto the device's channels.
pub struct Device {
    /// The name of the device.
    name: String,
    /// The maximum number of channels the device supports.
    max_channels: u16,
    /// The host ID of the device.
    host_id: cpal::HostId,
    /// The underlying cpal device.
    device: cpal::Device,
    /// The device input is read from, if any.
    input: Option<cpal::Device>,
    sample_rate: u32,
    buffer_size: usize,
    scheduling: Arc<SchedulingState>,
    /// The thread that owns the streams while running.
    running: Mutex<Option<Running>>,
}

struct Running {
    cancel_handle: CancelHandle,
    join_handle: JoinHandle<()>,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (Channels={}) ({})",
            self.name,
            self.max_channels,
            self.host_id.name()
        )
    }
}

/// Everything the output callback needs, moved onto the audio thread.
struct OutputState {
    callback: RenderCallback,
    input: Option<rtrb::Consumer<f32>>,
    channels: usize,
    frames: usize,
    out: Vec<f32>,
    input_buffer: Vec<f32>,
    priority: Option<ThreadPriorityValue>,
    rt_audio: bool,
    scheduling: Arc<SchedulingState>,
}

impl OutputState {
    fn process<T>(&mut self, data: &mut [T])
    where
        T: cpal::SizedSample + cpal::FromSample<f32>,
    {
        configure_audio_thread_priority(self.priority, self.rt_audio, &self.scheduling);
        thread::ensure(Role::Render, true);

        let OutputState {
            callback,
            input,
            channels,
            frames,
            out,
            input_buffer,
            ..
        } = self;
        let channels = *channels;
        for chunk in data.chunks_mut(*frames * channels) {
            let samples = chunk.len() / channels * 2;
            let out = &mut out[..samples];
            out.fill(0.0);

            let input = match input.as_mut() {
                Some(consumer) => {
                    let input_buffer = &mut input_buffer[..samples];
                    for sample in input_buffer.iter_mut() {
                        // Zero-fill any shortfall
                        *sample = consumer.pop().unwrap_or(0.0);
                    }
                    Some(&*input_buffer)
                }
                None => None,
            };
            callback(out, input);

            for (frame, stereo) in chunk.chunks_exact_mut(channels).zip(out.chunks_exact(2)) {
                if channels == 1 {
                    frame[0] = T::from_sample((stereo[0] + stereo[1]) * 0.5);
                    continue;
                }
                frame[0] = T::from_sample(stereo[0]);
                frame[1] = T::from_sample(stereo[1]);
                for sample in frame[2..].iter_mut() {
                    *sample = T::EQUILIBRIUM;
                }
            }
        }
    }
}

fn build_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut state: OutputState,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: cpal::SizedSample + cpal::FromSample<f32>,
{
    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| state.process(data),
        |err| error!("CPAL output stream error: {}", err),
        None,
    )
}

fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut producer: rtrb::Producer<f32>,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: cpal::SizedSample,
    f32: cpal::FromSample<T>,
{
    let channels = config.channels as usize;
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            for frame in data.chunks_exact(channels) {
                if producer.slots() < 2 {
                    break;
                }
                let left = cpal::Sample::to_sample::<f32>(frame[0]);
                // Mono inputs feed both sides.
                let right = frame
                    .get(1)
                    .map_or(left, |sample| cpal::Sample::to_sample::<f32>(*sample));
                let _ = producer.push(left);
                let _ = producer.push(right);
            }
        },
        |err| error!("CPAL input stream error: {}", err),
        None,
    )
}

impl Device {
    /// Lists cpal devices and produces the Device trait.
    pub fn list() -> Result<Vec<Box<dyn super::Device>>, Box<dyn Error>> {
        Ok(Device::list_cpal_devices()?
            .into_iter()
            .map(|device| {
                let device: Box<dyn super::Device> = Box::new(device);
                device
            })
            .collect())
    }

    /// Lists cpal output devices.
    fn list_cpal_devices() -> Result<Vec<Device>, Box<dyn Error>> {
        let mut devices: Vec<Device> = Vec::new();
        for host_id in cpal::available_hosts() {
            let host_devices = match cpal::host_from_id(host_id)?.devices() {
                Ok(host_devices) => host_devices,
                Err(e) => {
                    error!(
                        err = e.to_string(),
                        host = host_id.name(),
                        "Unable to list devices for host"
                    );
                    continue;
                }
            };

            for device in host_devices {
                let Ok(output_configs) = device.supported_output_configs() else {
                    continue;
                };
                let max_channels = output_configs
                    .map(|config| config.channels())
                    .max()
                    .unwrap_or(0);

                if max_channels > 0 {
                    devices.push(Device {
                        name: device.name()?,
                        max_channels,
                        host_id,
                        device,
                        input: None,
                        sample_rate: 0,
                        buffer_size: 0,
                        scheduling: Arc::new(SchedulingState::default()),
                        running: Mutex::new(None),
                    })
                }
            }
        }

        devices.sort_by_key(|device| device.name.to_string());
        Ok(devices)
    }

    fn find_input(name: &str) -> Result<cpal::Device, Box<dyn Error>> {
        let host = cpal::default_host();
        if name == "default" {
            return host
                .default_input_device()
                .ok_or_else(|| "no default input device".into());
        }
        for device in host.input_devices()? {
            if device.name()?.trim() == name {
                return Ok(device);
            }
        }
        Err(format!("no input device found with name {}", name).into())
    }

    /// Gets the given cpal device.
    pub fn get(config: &config::Audio) -> Result<Device, Box<dyn Error>> {
        let name = config.device();
        let found = if name == "default" {
            let host = cpal::default_host();
            let default_name = host
                .default_output_device()
                .ok_or("no default output device")?
                .name()?;
            Device::list_cpal_devices()?
                .into_iter()
                .find(|device| device.host_id == host.id() && device.name == default_name)
        } else {
            Device::list_cpal_devices()?
                .into_iter()
                .find(|device| device.name.trim() == name)
        };

        match found {
            Some(mut device) => {
                device.sample_rate = config.sample_rate();
                device.buffer_size = config.buffer_size();
                device.input = config.input_device().map(Device::find_input).transpose()?;
                Ok(device)
            }
            None => Err(format!("no device found with name {}", name).into()),
        }
    }

    /// Builds and plays the streams. They live until the cancel handle fires,
    /// on this thread because streams can't move between threads on every
    /// host.
    fn run_streams(
        &self,
        callback: RenderCallback,
        cancel_handle: CancelHandle,
    ) -> Result<Vec<cpal::Stream>, Box<dyn Error>> {
        let channels = self.max_channels.min(2);
        let stream_config = cpal::StreamConfig {
            channels,
            sample_rate: self.sample_rate,
            buffer_size: cpal::BufferSize::Fixed(self.buffer_size as u32),
        };

        let mut streams = Vec::new();
        let mut consumer = None;
        if let Some(input) = &self.input {
            let supported = input.default_input_config()?;
            let input_config = cpal::StreamConfig {
                channels: supported.channels(),
                sample_rate: self.sample_rate,
                buffer_size: cpal::BufferSize::Default,
            };
            let capacity = (self.sample_rate as f32 * INPUT_RING_SECONDS) as usize * 2;
            let (producer, ring_consumer) = rtrb::RingBuffer::new(capacity.max(self.buffer_size * 4));
            let stream = match supported.sample_format() {
                cpal::SampleFormat::F32 => build_input::<f32>(input, &input_config, producer)?,
                cpal::SampleFormat::I16 => build_input::<i16>(input, &input_config, producer)?,
                cpal::SampleFormat::I32 => build_input::<i32>(input, &input_config, producer)?,
                format => return Err(format!("unsupported input sample format {}", format).into()),
            };
            streams.push(stream);
            consumer = Some(ring_consumer);
        }

        let samples = self.buffer_size * 2;
        let state = OutputState {
            callback,
            input: consumer,
            channels: channels as usize,
            frames: self.buffer_size,
            out: vec![0.0; samples],
            input_buffer: vec![0.0; samples],
            priority: callback_thread_priority(),
            rt_audio: rt_audio_enabled(),
            scheduling: self.scheduling.clone(),
        };
        let output = match self.device.default_output_config()?.sample_format() {
            cpal::SampleFormat::F32 => build_output::<f32>(&self.device, &stream_config, state)?,
            cpal::SampleFormat::I16 => build_output::<i16>(&self.device, &stream_config, state)?,
            cpal::SampleFormat::I32 => build_output::<i32>(&self.device, &stream_config, state)?,
            format => return Err(format!("unsupported output sample format {}", format).into()),
        };
        streams.push(output);

        for stream in &streams {
            stream.play()?;
        }
        if cancel_handle.is_cancelled() {
            streams.clear();
        }
        Ok(streams)
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
        self.input.is_some()
    }

    fn start(&self, callback: RenderCallback) -> Result<(), Box<dyn Error>> {
        let span = span!(Level::INFO, "start (cpal)");
        let _enter = span.enter();

        let mut running = self.running.lock();
        if running.is_some() {
            return Err(format!("{} is already running", self.name).into());
        }

        let cancel_handle = CancelHandle::new();
        let (started_tx, started_rx) = bounded::<Result<(), String>>(1);
        let join_handle = {
            let device = Device {
                name: self.name.clone(),
                max_channels: self.max_channels,
                host_id: self.host_id,
                device: self.device.clone(),
                input: self.input.clone(),
                sample_rate: self.sample_rate,
                buffer_size: self.buffer_size,
                scheduling: self.scheduling.clone(),
                running: Mutex::new(None),
            };
            let cancel_handle = cancel_handle.clone();
            std_thread::Builder::new()
                .name("mloop-audio".into())
                .spawn(move || {
                    match device.run_streams(callback, cancel_handle.clone()) {
                        Ok(streams) => {
                            let _ = started_tx.send(Ok(()));
                            // Keep the streams alive until stopped.
                            while !cancel_handle.wait_timeout(Duration::from_millis(100)) {}
                            drop(streams);
                        }
                        Err(e) => {
                            let _ = started_tx.send(Err(e.to_string()));
                        }
                    }
                })?
        };

        let started = started_rx
            .recv_timeout(START_TIMEOUT)
            .map_err(|_| format!("{} did not start in time", self.name))?;
        if let Err(e) = started {
            cancel_handle.cancel();
            let _ = join_handle.join();
            return Err(e.into());
        }

        info!(
            device = self.name,
            sample_rate = self.sample_rate,
            buffer_size = self.buffer_size,
            input = self.input.is_some(),
            "CPAL streams started."
        );
        *running = Some(Running {
            cancel_handle,
            join_handle,
        });
        Ok(())
    }

    fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        running.cancel_handle.cancel();
        if running.join_handle.join().is_err() {
            error!(device = self.name, "Audio thread panicked.");
        }
        match self.scheduling.get() {
            Scheduling::RealtimeRefused => warn!(
                device = self.name,
                "Realtime scheduling was refused for the audio callback thread."
            ),
            scheduling => info!(device = self.name, scheduling = ?scheduling, "CPAL streams stopped."),
        }
    }

    fn scheduling(&self) -> Scheduling {
        self.scheduling.get()
    }

    #[cfg(test)]
    fn to_mock(&self) -> Result<Arc<super::mock::Device>, Box<dyn Error>> {
        Err("not a mock".into())
    }
}
