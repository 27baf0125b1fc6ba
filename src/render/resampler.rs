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
use std::fmt;

use rubato::{FastFixedOut, PolynomialDegree, Resampler as _};
use tracing::error;

use crate::{
    audio::buffer::CHANNELS,
    model::channel::{MAX_PITCH, MIN_PITCH},
};

/// Output frames produced per rubato call. Longer requests loop.
const MAX_CHUNK: usize = 1024;

/// Streaming pitch shifter used on the render thread.
///
/// Wraps a rubato polynomial resampler with a fixed output chunk. All
/// buffers are allocated up front for the widest pitch range, so changing
/// the pitch or resetting never allocates.
pub struct Resampler {
    inner: Option<FastFixedOut<f32>>,
    /// Output frames per input frame.
    ratio: f64,
    input: Vec<Vec<f32>>,
    output: Vec<Vec<f32>>,
}

impl Default for Resampler {
    fn default() -> Resampler {
        Resampler::new(1.0)
    }
}

impl fmt::Debug for Resampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resampler")
            .field("ratio", &self.ratio)
            .field("ready", &self.inner.is_some())
            .finish()
    }
}

/// Widest ratio change around unity the pitch controls can ask for.
fn max_relative_ratio() -> f64 {
    (1.0 / MIN_PITCH as f64).max(MAX_PITCH as f64)
}

fn clamp_ratio(ratio: f64) -> f64 {
    let max = max_relative_ratio();
    ratio.clamp(1.0 / max, max)
}

impl Resampler {
    pub fn new(ratio: f64) -> Resampler {
        let ratio = clamp_ratio(ratio);
        let inner = match FastFixedOut::<f32>::new(
            1.0,
            max_relative_ratio(),
            PolynomialDegree::Cubic,
            MAX_CHUNK,
            CHANNELS,
        ) {
            Ok(mut inner) => {
                // The ratio is clamped into the range the resampler was built for.
                let _ = inner.set_resample_ratio(ratio, false);
                Some(inner)
            }
            Err(e) => {
                error!(err = %e, "Unable to build the pitch resampler.");
                None
            }
        };
        let (input, output) = match &inner {
            Some(inner) => (
                vec![vec![0.0; inner.input_frames_max()]; CHANNELS],
                vec![vec![0.0; inner.output_frames_max()]; CHANNELS],
            ),
            None => (Vec::new(), Vec::new()),
        };
        Resampler {
            inner,
            ratio,
            input,
            output,
        }
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    /// Clears the interpolation history and applies a new ratio. Called
    /// whenever the wave, the pitch or the read position jumps.
    pub fn reset(&mut self, ratio: f64) {
        if let Some(inner) = self.inner.as_mut() {
            inner.reset();
        }
        self.set_ratio(ratio);
    }

    /// Changes the ratio while keeping the history, for smooth pitch changes
    /// during playback.
    pub fn set_ratio(&mut self, ratio: f64) {
        self.ratio = clamp_ratio(ratio);
        if let Some(inner) = self.inner.as_mut() {
            let _ = inner.set_resample_ratio(self.ratio, false);
        }
    }

    /// Reads interleaved stereo from `input` and writes to `output`.
    /// Returns `(consumed, produced)` in frames. Stops when the output is full
    /// or the input is exhausted. Input too short for a single output frame
    /// counts as consumed.
    pub fn process(&mut self, input: &[f32], output: &mut [f32]) -> (usize, usize) {
        let Some(inner) = self.inner.as_mut() else {
            return (0, 0);
        };
        let in_frames = input.len() / CHANNELS;
        let out_frames = output.len() / CHANNELS;

        let mut consumed = 0;
        let mut produced = 0;
        while produced < out_frames {
            let available = in_frames - consumed;
            let estimate = (available as f64 * self.ratio) as usize;
            let mut chunk = (out_frames - produced).min(MAX_CHUNK).min(estimate);
            while chunk > 0 {
                if inner.set_chunk_size(chunk).is_ok() && inner.input_frames_next() <= available {
                    break;
                }
                chunk -= 1;
            }
            if chunk == 0 {
                consumed = in_frames;
                break;
            }

            let needed = inner.input_frames_next();
            for (i, frame) in input[consumed * CHANNELS..(consumed + needed) * CHANNELS]
                .chunks_exact(CHANNELS)
                .enumerate()
            {
                for (c, sample) in frame.iter().enumerate() {
                    self.input[c][i] = *sample;
                }
            }

            let Ok((used, made)) = inner.process_into_buffer(&self.input, &mut self.output, None)
            else {
                break;
            };
            for i in 0..made {
                for c in 0..CHANNELS {
                    output[(produced + i) * CHANNELS + c] = self.output[c][i];
                }
            }
            consumed += used;
            produced += made;
            if used == 0 && made == 0 {
                break;
            }
        }
        (consumed.min(in_frames), produced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(frames: usize) -> Vec<f32> {
        (0..frames).flat_map(|i| [i as f32, i as f32]).collect()
    }

    #[test]
    fn test_double_pitch_reads_twice_as_much() {
        let input = ramp(4000);
        let mut output = vec![0.0; 2 * 512];
        let mut resampler = Resampler::new(0.5);
        let (consumed, produced) = resampler.process(&input, &mut output);
        assert_eq!(produced, 512);
        assert!((1000..=1040).contains(&consumed), "consumed {}", consumed);
    }

    #[test]
    fn test_half_pitch_reads_half_as_much() {
        let input = ramp(4000);
        let mut output = vec![0.0; 2 * 512];
        let mut resampler = Resampler::new(2.0);
        let (consumed, produced) = resampler.process(&input, &mut output);
        assert_eq!(produced, 512);
        assert!((250..=270).contains(&consumed), "consumed {}", consumed);
    }

    #[test]
    fn test_output_follows_the_input() {
        let input = ramp(4000);
        let mut output = vec![0.0; 2 * 256];
        let mut resampler = Resampler::new(0.5);
        resampler.process(&input, &mut output);
        // Past the interpolator delay a rising input gives a rising output.
        let left: Vec<f32> = output.chunks_exact(2).map(|frame| frame[0]).collect();
        assert!(left[16..].windows(2).all(|pair| pair[1] > pair[0]));
    }

    #[test]
    fn test_exhausted_input() {
        let input = ramp(40);
        let mut output = vec![0.0; 2 * 512];
        let mut resampler = Resampler::new(1.5);
        let (consumed, produced) = resampler.process(&input, &mut output);
        assert_eq!(consumed, 40);
        assert!(produced < 512);

        resampler.reset(1.5);
        assert_eq!(resampler.process(&[], &mut output), (0, 0));
    }

    #[test]
    fn test_ratio_is_clamped_to_the_pitch_range() {
        let mut resampler = Resampler::new(1.0);
        resampler.set_ratio(100.0);
        assert_eq!(resampler.ratio(), max_relative_ratio());
        resampler.reset(0.0);
        assert_eq!(resampler.ratio(), 1.0 / max_relative_ratio());
    }
}
