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

/// Internal processing is always stereo.
pub const CHANNELS: usize = 2;

/// A preallocated block of interleaved stereo frames.
///
/// The backing storage is sized once for the largest block the engine will
/// render. The active length can shrink and grow within that capacity without
/// touching the allocator, which is what the render thread relies on.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AudioBuffer {
    data: Vec<f32>,
    frames: usize,
}

impl AudioBuffer {
    /// Allocates a silent buffer of the given number of frames.
    pub fn new(frames: usize) -> AudioBuffer {
        AudioBuffer {
            data: vec![0.0; frames * CHANNELS],
            frames,
        }
    }

    /// Wraps already interleaved stereo samples.
    pub fn from_interleaved(data: Vec<f32>) -> AudioBuffer {
        let frames = data.len() / CHANNELS;
        AudioBuffer { data, frames }
    }

    /// The number of active frames.
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// The maximum number of frames this buffer can hold without reallocating.
    pub fn capacity(&self) -> usize {
        self.data.len() / CHANNELS
    }

    /// Changes the active length, clamped to capacity.
    pub fn set_frames(&mut self, frames: usize) {
        self.frames = frames.min(self.capacity());
    }

    pub fn clear(&mut self) {
        self.as_mut_slice().fill(0.0);
    }

    /// Silences every frame from `from` to the end of the active region.
    pub fn clear_from(&mut self, from: usize) {
        if from < self.frames {
            self.data[from * CHANNELS..self.frames * CHANNELS].fill(0.0);
        }
    }

    pub fn frame(&self, index: usize) -> [f32; CHANNELS] {
        let i = index * CHANNELS;
        [self.data[i], self.data[i + 1]]
    }

    pub fn set_frame(&mut self, index: usize, value: [f32; CHANNELS]) {
        let i = index * CHANNELS;
        self.data[i] = value[0];
        self.data[i + 1] = value[1];
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data[..self.frames * CHANNELS]
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data[..self.frames * CHANNELS]
    }

    /// Returns the interleaved samples starting at frame `from`.
    pub fn tail_mut(&mut self, from: usize) -> &mut [f32] {
        let from = from.min(self.frames);
        &mut self.data[from * CHANNELS..self.frames * CHANNELS]
    }

    /// Multiplies every active sample by `gain`.
    pub fn scale(&mut self, gain: f32) {
        if gain != 1.0 {
            self.as_mut_slice().iter_mut().for_each(|s| *s *= gain);
        }
    }

    /// Sums `other` into this buffer with a gain per side.
    pub fn add(&mut self, other: &AudioBuffer, gains: [f32; CHANNELS]) {
        let frames = self.frames.min(other.frames);
        for (dst, src) in self.data[..frames * CHANNELS]
            .chunks_exact_mut(CHANNELS)
            .zip(other.data[..frames * CHANNELS].chunks_exact(CHANNELS))
        {
            dst[0] += src[0] * gains[0];
            dst[1] += src[1] * gains[1];
        }
    }

    /// Peak absolute value of the left side.
    pub fn peak(&self) -> f32 {
        self.as_slice()
            .iter()
            .step_by(CHANNELS)
            .fold(0.0f32, |peak, s| peak.max(s.abs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_frames_never_exceeds_capacity() {
        let mut buffer = AudioBuffer::new(16);
        buffer.set_frames(8);
        assert_eq!(buffer.frames(), 8);
        assert_eq!(buffer.as_slice().len(), 16);
        buffer.set_frames(64);
        assert_eq!(buffer.frames(), 16);
    }

    #[test]
    fn test_clear_from() {
        let mut buffer = AudioBuffer::from_interleaved(vec![1.0; 8]);
        buffer.clear_from(2);
        assert_eq!(buffer.as_slice(), &[1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0]);
        buffer.clear_from(10);
        assert_eq!(buffer.frame(1), [1.0, 1.0]);
    }

    #[test]
    fn test_add_with_gains() {
        let mut dst = AudioBuffer::new(2);
        let src = AudioBuffer::from_interleaved(vec![1.0, 1.0, 0.5, -0.5]);
        dst.add(&src, [0.5, 1.0]);
        assert_eq!(dst.as_slice(), &[0.5, 1.0, 0.25, -0.5]);
        assert_eq!(dst.peak(), 0.5);
    }
}
