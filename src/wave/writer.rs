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
use std::path::Path;

use hound::{SampleFormat, WavSpec, WavWriter};
use tracing::info;

use super::{Wave, WaveError};
use crate::audio::buffer::CHANNELS;

/// Writes a wave as 32 bit float stereo.
pub fn save(wave: &Wave, path: &Path) -> Result<(), WaveError> {
    let codec_err = |source| WaveError::Codec {
        path: path.to_path_buf(),
        source,
    };
    let mut writer = WavWriter::create(
        path,
        WavSpec {
            channels: CHANNELS as u16,
            sample_rate: wave.rate(),
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        },
    )
    .map_err(codec_err)?;

    for sample in wave.samples(0, wave.frames()) {
        writer.write_sample(*sample).map_err(codec_err)?;
    }
    writer.finalize().map_err(codec_err)?;

    info!(path = %path.display(), frames = wave.frames(), "Saved wave.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wave::loader;

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("take.wav");
        let wave = Wave::logical(4, vec![0.5, -0.5, 0.25, -0.25], 48000);

        save(&wave, &path).unwrap();
        let reloaded = loader::load(&path, 4, 48000).unwrap();
        assert_eq!(reloaded.frames(), 2);
        assert_eq!(reloaded.frame(1), [0.25, -0.25]);
    }
}
