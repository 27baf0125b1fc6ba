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
use super::resampler::Resampler;
use crate::{audio::buffer::AudioBuffer, model::Frame, wave::Wave};

/// Result of one [fill_buffer] call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Fill {
    /// Wave frames read.
    pub used: Frame,
    /// Buffer frames written, starting at the requested offset.
    pub generated: usize,
}

impl Fill {
    /// Where the range end was crossed inside the buffer, if it was. The
    /// caller loops or stops there and refills the rest of the same buffer.
    pub fn rewind_offset(&self, offset: usize, frames: usize) -> Option<usize> {
        let written = offset + self.generated;
        (written < frames).then_some(written)
    }
}

/// Copies wave frames `[tracker, end)` into `buf` starting at `offset`.
///
/// At unity pitch this is a straight copy of `min(frames - offset, end - tracker)`
/// frames. Otherwise the resampler streams the same range.
pub fn fill_buffer(
    wave: &Wave,
    buf: &mut AudioBuffer,
    tracker: Frame,
    end: Frame,
    offset: usize,
    pitch: f32,
    resampler: &mut Resampler,
) -> Fill {
    let end = end.min(wave.frames());
    if offset >= buf.frames() || tracker >= end {
        return Fill::default();
    }

    if pitch == 1.0 {
        let count = (buf.frames() - offset).min(end - tracker);
        let source = wave.samples(tracker, tracker + count);
        buf.tail_mut(offset)[..source.len()].copy_from_slice(source);
        return Fill {
            used: count,
            generated: count,
        };
    }

    let (used, generated) = resampler.process(wave.samples(tracker, end), buf.tail_mut(offset));
    Fill { used, generated }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting_wave(frames: usize) -> Wave {
        let data = (0..frames).flat_map(|i| [i as f32, -(i as f32)]).collect();
        Wave::logical(1, data, 44100)
    }

    #[test]
    fn test_unity_fill_counts() {
        let wave = counting_wave(100);
        let mut resampler = Resampler::default();
        for (frames, tracker, end) in [(32, 0, 100), (32, 90, 100), (64, 10, 40), (8, 0, 8)] {
            let mut buf = AudioBuffer::new(frames);
            let fill = fill_buffer(&wave, &mut buf, tracker, end, 0, 1.0, &mut resampler);
            let expected = frames.min(end - tracker);
            assert_eq!(fill.generated, expected);
            assert_eq!(fill.used, expected);
            assert_eq!(buf.frame(0), [tracker as f32, -(tracker as f32)]);
        }
    }

    #[test]
    fn test_rewind_offset_mid_buffer() {
        let wave = counting_wave(100);
        let mut buf = AudioBuffer::new(32);
        let mut resampler = Resampler::default();

        let fill = fill_buffer(&wave, &mut buf, 90, 100, 4, 1.0, &mut resampler);
        assert_eq!(fill.generated, 10);
        assert_eq!(fill.rewind_offset(4, 32), Some(14));
        assert_eq!(buf.frame(13), [99.0, -99.0]);
        assert_eq!(buf.frame(14), [0.0, 0.0]);

        let fill = fill_buffer(&wave, &mut buf, 0, 100, 0, 1.0, &mut resampler);
        assert_eq!(fill.rewind_offset(0, 32), None);
    }

    #[test]
    fn test_pitched_fill_reports_consumed_and_produced() {
        let wave = counting_wave(1000);
        let mut buf = AudioBuffer::new(64);
        let mut resampler = Resampler::new(0.5);

        let fill = fill_buffer(&wave, &mut buf, 0, 1000, 0, 2.0, &mut resampler);
        assert_eq!(fill.generated, 64);
        assert!((128..=140).contains(&fill.used), "used {}", fill.used);

        // Close to the range end the input runs out before the buffer does.
        resampler.reset(0.5);
        let fill = fill_buffer(&wave, &mut buf, 960, 1000, 0, 2.0, &mut resampler);
        assert_eq!(fill.used, 40);
        assert!(fill.generated < 64);
        assert_eq!(fill.rewind_offset(0, 64), Some(fill.generated));
    }

    #[test]
    fn test_nothing_left() {
        let wave = counting_wave(10);
        let mut buf = AudioBuffer::new(16);
        let fill = fill_buffer(&wave, &mut buf, 10, 10, 0, 1.0, &mut Resampler::default());
        assert_eq!(fill, Fill::default());
    }
}
