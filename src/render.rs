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
//! Per-channel playback. Everything in here runs on the render thread and
//! works on buffers owned by the model, so nothing allocates.

pub mod fade;
pub mod fill;
pub mod midi;
pub mod resampler;
pub mod sample;

/// Transport and behavior flags sampled once per block and handed to every
/// channel operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PlayContext {
    /// The sequencer is running.
    pub running: bool,
    /// A quantize subdivision is selected.
    pub quantize: bool,
    pub treat_recs_as_loops: bool,
    pub chans_stop_on_seq_halt: bool,
}

impl PlayContext {
    /// True when a press should wait for the next quantizer step.
    pub fn defers_start(&self, do_quantize: bool) -> bool {
        self.quantize && self.running && do_quantize
    }
}
