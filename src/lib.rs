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
//! A realtime loop machine core: sample and MIDI channels driven by a
//! sequencer, rendered on a realtime audio callback that never blocks.

pub mod audio;
pub mod config;
pub mod engine;
pub mod events;
pub mod midi;
pub mod mixer;
pub mod model;
pub mod playsync;
pub mod render;
pub mod sequencer;
pub mod thread;
pub mod util;
pub mod wave;

#[cfg(test)]
pub mod testutil;
