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
use std::{error::Error, fmt, sync::Arc};

use crate::config;

pub mod buffer;
pub mod cpal;
pub mod mock;
pub mod thread_priority;

use thread_priority::Scheduling;

/// Called once per block on the audio thread with interleaved stereo output
/// and, if the device records, interleaved stereo input of the same length.
pub type RenderCallback = Box<dyn FnMut(&mut [f32], Option<&[f32]>) + Send>;

pub trait Device: fmt::Display + Send + Sync {
    fn name(&self) -> String;

    fn sample_rate(&self) -> u32;

    /// The largest block the callback is ever handed, in frames.
    fn buffer_size(&self) -> usize;

    /// True if the callback receives input.
    fn has_input(&self) -> bool;

    /// Starts calling the callback. Fails if the device is already running.
    fn start(&self, callback: RenderCallback) -> Result<(), Box<dyn Error>>;

    /// Stops calling the callback. The callback is dropped.
    fn stop(&self);

    /// How the callback thread got scheduled.
    fn scheduling(&self) -> Scheduling;

    #[cfg(test)]
    fn to_mock(&self) -> Result<Arc<mock::Device>, Box<dyn Error>>;
}

/// Lists devices known to cpal.
pub fn list_devices() -> Result<Vec<Box<dyn Device>>, Box<dyn Error>> {
    cpal::Device::list()
}

/// Gets the device the config names. Names starting with "mock" give a mock
/// device.
pub fn get_device(config: &config::Audio) -> Result<Arc<dyn Device>, Box<dyn Error>> {
    let device = config.device();
    if device.starts_with("mock") {
        return Ok(Arc::new(mock::Device::get(config)));
    };

    Ok(Arc::new(cpal::Device::get(config)?))
}
