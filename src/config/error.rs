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

/// Typed error for config and project failures so callers can tell a missing
/// file from a bad value without string matching.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config load/parse error: {0}")]
    Load(#[from] config::ConfigError),
    #[error("unsupported sample rate {0}")]
    InvalidSampleRate(u32),
    #[error("buffer size {0} is outside 8..=4096")]
    InvalidBufferSize(usize),
    #[error("unsupported MIDI timecode rate {0} fps")]
    InvalidMtcFps(u32),
    #[error("project I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("project YAML error: {0}")]
    Yaml(#[from] serde_yml::Error),
}
