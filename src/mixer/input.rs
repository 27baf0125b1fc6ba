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
use serde::{Deserialize, Serialize};

use crate::{
    audio::buffer::{AudioBuffer, CHANNELS},
    model::Frame,
};

/// How an input take is laid out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InputRecMode {
    /// Records from frame zero until stopped or the buffer is full. The loop
    /// length follows the take.
    Free,
    /// Records into a loop-length buffer at the transport position, summing
    /// over what is already there on every pass.
    #[default]
    Rigid,
}

/// An input take being written by the render thread. The buffer is allocated
/// up front off the render thread and never grows.
#[derive(Debug)]
pub struct Capture {
    mode: InputRecMode,
    data: Vec<f32>,
    written: usize,
    full: bool,
}

impl Capture {
    /// A take of at most `frames` frames.
    pub fn new(mode: InputRecMode, frames: usize) -> Capture {
        Capture {
            mode,
            data: vec![0.0; frames * CHANNELS],
            written: 0,
            full: false,
        }
    }

    pub fn mode(&self) -> InputRecMode {
        self.mode
    }

    pub fn capacity(&self) -> usize {
        self.data.len() / CHANNELS
    }

    /// Frames that hold recorded material.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Writes one block of input. `position` maps a block offset to the loop
    /// frame it plays on and is only consulted in rigid mode. Returns true on
    /// the block a free take runs out of room.
    pub fn write(&mut self, input: &AudioBuffer, position: impl Fn(usize) -> Frame) -> bool {
        let capacity = self.capacity();
        if capacity == 0 {
            return false;
        }
        match self.mode {
            InputRecMode::Rigid => {
                for offset in 0..input.frames() {
                    let at = (position(offset) % capacity) * CHANNELS;
                    let [left, right] = input.frame(offset);
                    self.data[at] += left;
                    self.data[at + 1] += right;
                }
                self.written = capacity;
                false
            }
            InputRecMode::Free => {
                if self.full {
                    return false;
                }
                let frames = input.frames().min(capacity - self.written);
                let from = self.written * CHANNELS;
                self.data[from..from + frames * CHANNELS]
                    .copy_from_slice(&input.as_slice()[..frames * CHANNELS]);
                self.written += frames;
                self.full = self.written == capacity;
                self.full
            }
        }
    }

    /// The recorded samples, trimmed to what was written.
    pub fn into_samples(mut self) -> Vec<f32> {
        self.data.truncate(self.written * CHANNELS);
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(frames: usize, start: f32) -> AudioBuffer {
        let data = (0..frames)
            .flat_map(|i| {
                let v = start + i as f32;
                [v, -v]
            })
            .collect();
        AudioBuffer::from_interleaved(data)
    }

    #[test]
    fn test_free_take_fills_once() {
        let mut capture = Capture::new(InputRecMode::Free, 6);
        assert!(!capture.write(&ramp(4, 1.0), |i| i));
        assert_eq!(capture.written(), 4);
        assert!(capture.write(&ramp(4, 5.0), |i| i));
        // Nothing more is written and the end is reported once.
        assert!(!capture.write(&ramp(4, 9.0), |i| i));
        assert_eq!(capture.written(), 6);
        let samples = capture.into_samples();
        assert_eq!(samples.len(), 12);
        assert_eq!(&samples[8..], &[5.0, -5.0, 6.0, -6.0]);
    }

    #[test]
    fn test_rigid_take_wraps_and_overdubs() {
        let mut capture = Capture::new(InputRecMode::Rigid, 4);
        capture.write(&ramp(3, 1.0), |i| 2 + i);
        capture.write(&ramp(2, 10.0), |i| 2 + i);
        let samples = capture.into_samples();
        // Frame 0 got the wrapped third input frame, frames 2 and 3 got both
        // passes.
        assert_eq!(samples[0], 3.0);
        assert_eq!(samples[4], 11.0);
        assert_eq!(samples[6], 13.0);
        assert_eq!(samples[2], 0.0);
    }

    #[test]
    fn test_partial_free_take_is_trimmed() {
        let mut capture = Capture::new(InputRecMode::Free, 100);
        capture.write(&ramp(10, 0.0), |i| i);
        assert_eq!(capture.into_samples().len(), 20);
    }
}
