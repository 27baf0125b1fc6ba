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
use std::{fs::File, io::BufReader, path::Path};

use hound::{SampleFormat, WavReader};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use tracing::{debug, info};

use super::{Wave, WaveError, WaveId};
use crate::audio::buffer::CHANNELS;

/// Frames fed to the resampler per call.
const RESAMPLE_CHUNK: usize = 1024;

/// Loads a wave file, converting it to stereo at `target_rate`.
pub fn load(path: &Path, id: WaveId, target_rate: u32) -> Result<Wave, WaveError> {
    let file = File::open(path).map_err(|source| WaveError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let reader = WavReader::new(BufReader::new(file)).map_err(|source| WaveError::Codec {
        path: path.to_path_buf(),
        source,
    })?;
    let spec = reader.spec();
    if spec.channels == 0 || spec.channels as usize > CHANNELS {
        return Err(WaveError::UnsupportedChannels(spec.channels));
    }

    let codec_err = |source| WaveError::Codec {
        path: path.to_path_buf(),
        source,
    };
    let samples: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => {
            if spec.bits_per_sample != 32 {
                return Err(WaveError::UnsupportedFormat(spec.bits_per_sample));
            }
            reader
                .into_samples::<f32>()
                .collect::<Result<_, _>>()
                .map_err(codec_err)?
        }
        SampleFormat::Int => {
            if spec.bits_per_sample == 0 || spec.bits_per_sample > 32 {
                return Err(WaveError::UnsupportedFormat(spec.bits_per_sample));
            }
            let scale = 1.0 / (1u64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|sample| sample.map(|s| s as f32 * scale))
                .collect::<Result<_, _>>()
                .map_err(codec_err)?
        }
    };
    if samples.is_empty() {
        return Err(WaveError::Empty);
    }

    let stereo = to_stereo(samples, spec.channels as usize);
    let data = if spec.sample_rate != target_rate {
        debug!(
            from = spec.sample_rate,
            to = target_rate,
            "Converting sample rate."
        );
        resample(&stereo, spec.sample_rate, target_rate)?
    } else {
        stereo
    };

    let wave = Wave::new(id, data, target_rate, spec.bits_per_sample).with_path(path);
    info!(
        path = %path.display(),
        frames = wave.frames(),
        rate = target_rate,
        "Loaded wave."
    );
    Ok(wave)
}

/// Duplicates mono into both sides. Stereo passes through untouched.
fn to_stereo(samples: Vec<f32>, channels: usize) -> Vec<f32> {
    if channels == CHANNELS {
        return samples;
    }
    samples.iter().flat_map(|s| [*s, *s]).collect()
}

/// Converts interleaved stereo between sample rates. The output has exactly
/// `frames * to / from` frames (rounded up), with the resampler delay removed.
pub fn resample(data: &[f32], from: u32, to: u32) -> Result<Vec<f32>, WaveError> {
    let frames = data.len() / CHANNELS;
    if frames == 0 || from == to {
        return Ok(data.to_vec());
    }

    let ratio = to as f64 / from as f64;
    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 128,
        window: WindowFunction::BlackmanHarris2,
    };
    let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, RESAMPLE_CHUNK, CHANNELS)
        .map_err(|e| WaveError::Resample(e.to_string()))?;

    let planar: Vec<Vec<f32>> = (0..CHANNELS)
        .map(|channel| data.iter().skip(channel).step_by(CHANNELS).copied().collect())
        .collect();

    let expected = (frames as u64 * to as u64).div_ceil(from as u64) as usize;
    let delay = resampler.output_delay();
    let mut output: Vec<Vec<f32>> = vec![Vec::with_capacity(expected + delay); CHANNELS];
    let append = |output: &mut Vec<Vec<f32>>, processed: Vec<Vec<f32>>| {
        for (out, chunk) in output.iter_mut().zip(processed) {
            out.extend_from_slice(&chunk);
        }
    };

    let mut pos = 0;
    while frames - pos >= resampler.input_frames_next() {
        let needed = resampler.input_frames_next();
        let chunk: Vec<&[f32]> = planar.iter().map(|c| &c[pos..pos + needed]).collect();
        let processed = resampler
            .process(&chunk, None)
            .map_err(|e| WaveError::Resample(e.to_string()))?;
        append(&mut output, processed);
        pos += needed;
    }
    if pos < frames {
        let chunk: Vec<&[f32]> = planar.iter().map(|c| &c[pos..]).collect();
        let processed = resampler
            .process_partial(Some(chunk.as_slice()), None)
            .map_err(|e| WaveError::Resample(e.to_string()))?;
        append(&mut output, processed);
    }
    // Flush whatever is still inside the filter.
    while output[0].len() < expected + delay {
        let processed = resampler
            .process_partial::<&[f32]>(None, None)
            .map_err(|e| WaveError::Resample(e.to_string()))?;
        if processed[0].is_empty() {
            break;
        }
        append(&mut output, processed);
    }

    let end = (delay + expected).min(output[0].len());
    let start = delay.min(end);
    let mut interleaved = Vec::with_capacity((end - start) * CHANNELS);
    for i in start..end {
        for channel in &output {
            interleaved.push(channel[i]);
        }
    }
    Ok(interleaved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::write_wav;

    #[test]
    fn test_load_mono_as_stereo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mono.wav");
        write_wav(path.clone(), vec![vec![0.25f32, -0.5, 0.75]], 44100).unwrap();

        let wave = load(&path, 3, 44100).unwrap();
        assert_eq!(wave.id(), 3);
        assert_eq!(wave.frames(), 3);
        assert_eq!(wave.frame(1), [-0.5, -0.5]);
        assert_eq!(wave.path(), Some(path.as_path()));
        assert!(!wave.is_logical());
    }

    #[test]
    fn test_load_int_samples_are_scaled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("int.wav");
        write_wav(path.clone(), vec![vec![i32::MAX, 0], vec![0, i32::MIN]], 48000).unwrap();

        let wave = load(&path, 1, 48000).unwrap();
        assert_eq!(wave.frames(), 2);
        assert!((wave.frame(0)[0] - 1.0).abs() < 1e-6);
        assert!((wave.frame(1)[1] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_missing_file() {
        let err = load(Path::new("/definitely/not/here.wav"), 1, 44100).unwrap_err();
        assert!(err.is_missing());
    }

    #[test]
    fn test_too_many_channels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("multi.wav");
        write_wav(path.clone(), vec![vec![0.0f32; 4]; 4], 44100).unwrap();

        let err = load(&path, 1, 44100).unwrap_err();
        assert!(matches!(err, WaveError::UnsupportedChannels(4)));
        assert!(!err.is_missing());
    }

    #[test]
    fn test_resample_length() {
        let data = vec![0.1f32; 44100 * CHANNELS];
        let out = resample(&data, 44100, 48000).unwrap();
        assert_eq!(out.len() / CHANNELS, 48000);

        let out = resample(&data, 44100, 22050).unwrap();
        assert_eq!(out.len() / CHANNELS, 22050);

        // Partial frames round up.
        let data = vec![0.1f32; 1000 * CHANNELS];
        let out = resample(&data, 44100, 48000).unwrap();
        assert_eq!(out.len() / CHANNELS, 1089);
    }
}
