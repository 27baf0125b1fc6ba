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
use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::info;

use super::error::ConfigError;
use crate::{
    midi::learn::{ChannelLearn, Lightning},
    model::{
        actions::Action,
        channel::{ChannelId, ChannelType, PlayMode, DEFAULT_PAN, DEFAULT_PITCH, DEFAULT_VOLUME},
        Frame,
    },
    sequencer::{DEFAULT_BARS, DEFAULT_BEATS, DEFAULT_BPM},
};

fn default_bpm() -> f32 {
    DEFAULT_BPM
}

fn default_beats() -> u32 {
    DEFAULT_BEATS
}

fn default_bars() -> u32 {
    DEFAULT_BARS
}

fn default_volume() -> f32 {
    DEFAULT_VOLUME
}

fn default_pan() -> f32 {
    DEFAULT_PAN
}

fn default_pitch() -> f32 {
    DEFAULT_PITCH
}

/// One sample assignment of a channel.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct SceneDescription {
    /// Relative paths are resolved against the project file.
    pub wave: Option<PathBuf>,
    #[serde(default)]
    pub begin: Frame,
    /// Defaults to the end of the wave.
    pub end: Option<Frame>,
    #[serde(default)]
    pub shift: Frame,
    #[serde(default = "default_pitch")]
    pub pitch: f32,
}

impl SceneDescription {
    pub fn new(wave: Option<PathBuf>) -> SceneDescription {
        SceneDescription {
            wave,
            begin: 0,
            end: None,
            shift: 0,
            pitch: DEFAULT_PITCH,
        }
    }
}

/// Everything persisted about a channel.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct ChannelDescription {
    pub id: ChannelId,
    pub name: String,
    pub kind: ChannelType,
    #[serde(default)]
    pub mode: PlayMode,
    #[serde(default)]
    pub group: Option<ChannelId>,
    #[serde(default = "default_volume")]
    pub volume: f32,
    #[serde(default = "default_pan")]
    pub pan: f32,
    #[serde(default = "default_pitch")]
    pub pitch: f32,
    /// dB.
    #[serde(default)]
    pub boost: f32,
    #[serde(default)]
    pub mute: bool,
    #[serde(default)]
    pub solo: bool,
    #[serde(default)]
    pub armed: bool,
    #[serde(default)]
    pub velocity_as_vol: bool,
    #[serde(default)]
    pub read_actions: bool,
    #[serde(default)]
    pub scenes: Vec<SceneDescription>,
    #[serde(default)]
    pub active_scene: usize,
    #[serde(default)]
    pub learn: ChannelLearn,
    #[serde(default)]
    pub lightning: Lightning,
    /// Output channel of MIDI channels, 0-15.
    #[serde(default)]
    pub midi_channel: u8,
}

impl ChannelDescription {
    pub fn new(id: ChannelId, name: &str, kind: ChannelType) -> ChannelDescription {
        ChannelDescription {
            id,
            name: name.to_string(),
            kind,
            mode: PlayMode::default(),
            group: None,
            volume: DEFAULT_VOLUME,
            pan: DEFAULT_PAN,
            pitch: DEFAULT_PITCH,
            boost: 0.0,
            mute: false,
            solo: false,
            armed: false,
            velocity_as_vol: false,
            read_actions: false,
            scenes: Vec::new(),
            active_scene: 0,
            learn: ChannelLearn::default(),
            lightning: Lightning::default(),
            midi_channel: 0,
        }
    }
}

/// A saved session.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Project {
    pub name: String,
    #[serde(default = "default_bpm")]
    pub bpm: f32,
    #[serde(default = "default_beats")]
    pub beats: u32,
    #[serde(default = "default_bars")]
    pub bars: u32,
    #[serde(default)]
    pub quantize: u32,
    #[serde(default)]
    pub metronome: bool,
    /// Master volume.
    #[serde(default = "default_volume")]
    pub volume_out: f32,
    #[serde(default = "default_volume")]
    pub volume_in: f32,
    #[serde(default)]
    pub channels: Vec<ChannelDescription>,
    #[serde(default)]
    pub actions: Vec<Action>,
    /// Sample rate the recorded action frames were taken at.
    #[serde(default)]
    pub sample_rate: Option<u32>,
}

impl Project {
    pub fn new(name: &str) -> Project {
        Project {
            name: name.to_string(),
            bpm: DEFAULT_BPM,
            beats: DEFAULT_BEATS,
            bars: DEFAULT_BARS,
            quantize: 0,
            metronome: false,
            volume_out: DEFAULT_VOLUME,
            volume_in: DEFAULT_VOLUME,
            channels: Vec::new(),
            actions: Vec::new(),
            sample_rate: None,
        }
    }

    /// Reads a project file.
    pub fn deserialize(path: &Path) -> Result<Project, ConfigError> {
        let project = serde_yml::from_str(&fs::read_to_string(path)?)?;
        Ok(project)
    }

    /// Serialize and save the project to a file at the given path.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let serialized = serde_yml::to_string(self)?;
        fs::write(path, serialized)?;
        info!(path = %path.display(), channels = self.channels.len(), "Saved project.");
        Ok(())
    }

    /// Resolves a wave path found in this project.
    pub fn resolve(base: &Path, wave: &Path) -> PathBuf {
        if wave.is_absolute() {
            wave.to_path_buf()
        } else {
            base.join(wave)
        }
    }
}
