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

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use super::error::ConfigError;
use crate::{
    midi::{
        learn::GlobalLearn,
        sync::{MtcFps, SyncMode},
    },
    mixer::{input::InputRecMode, DEFAULT_REC_TRIGGER_LEVEL},
};

const DEFAULT_DEVICE: &str = "default";
const DEFAULT_SAMPLE_RATE: u32 = 44100;
const DEFAULT_BUFFER_SIZE: usize = 1024;

pub const SUPPORTED_SAMPLE_RATES: [u32; 5] = [44100, 48000, 88200, 96000, 192000];
const MIN_BUFFER_SIZE: usize = 8;
const MAX_BUFFER_SIZE: usize = 4096;

/// Prefix of environment variables that override config values, e.g.
/// `MLOOP_AUDIO__SAMPLE_RATE=48000`.
const ENV_PREFIX: &str = "MLOOP";

/// The audio section.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct Audio {
    /// The output device. "default" picks the host default.
    device: Option<String>,

    /// The input device, if any. Input recording needs one.
    input_device: Option<String>,

    /// Sample rate in Hz (default: 44100).
    sample_rate: Option<u32>,

    /// Frames per callback (default: 1024).
    buffer_size: Option<usize>,
}

impl Audio {
    pub fn new(device: &str) -> Audio {
        Audio {
            device: Some(device.to_string()),
            ..Audio::default()
        }
    }

    pub fn device(&self) -> &str {
        self.device.as_deref().unwrap_or(DEFAULT_DEVICE)
    }

    pub fn input_device(&self) -> Option<&str> {
        self.input_device.as_deref()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE)
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !SUPPORTED_SAMPLE_RATES.contains(&self.sample_rate()) {
            return Err(ConfigError::InvalidSampleRate(self.sample_rate()));
        }
        if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&self.buffer_size()) {
            return Err(ConfigError::InvalidBufferSize(self.buffer_size()));
        }
        Ok(())
    }
}

/// The MIDI section.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct Midi {
    device: Option<String>,
    sync: Option<SyncMode>,
    /// Timecode frame rate in MTC master mode: 24, 25 or 30 (default: 25).
    mtc_fps: Option<u32>,
    /// Global MIDI learn bindings.
    learn: Option<GlobalLearn>,
}

impl Midi {
    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    pub fn sync(&self) -> SyncMode {
        self.sync.unwrap_or_default()
    }

    pub fn mtc_fps(&self) -> MtcFps {
        self.mtc_fps
            .and_then(MtcFps::from_fps)
            .unwrap_or_default()
    }

    pub fn learn(&self) -> GlobalLearn {
        self.learn.clone().unwrap_or_default()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self.mtc_fps {
            Some(fps) if MtcFps::from_fps(fps).is_none() => Err(ConfigError::InvalidMtcFps(fps)),
            _ => Ok(()),
        }
    }
}

/// When a requested input recording actually starts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecTriggerMode {
    /// Right away.
    #[default]
    Normal,
    /// When the input crosses the trigger level.
    Signal,
}

/// Engine-wide behavior switches.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Behaviors {
    /// Stopping the sequencer kills looping channels and channels reading
    /// actions.
    pub chans_stop_on_seq_halt: bool,
    /// Toggling recorded actions waits for the next first beat.
    pub treat_recs_as_loops: bool,
    pub rec_trigger_mode: RecTriggerMode,
    /// dB.
    pub rec_trigger_level: f32,
    pub input_rec_mode: InputRecMode,
    pub limit_output: bool,
    pub metronome: bool,
}

impl Default for Behaviors {
    fn default() -> Behaviors {
        Behaviors {
            chans_stop_on_seq_halt: false,
            treat_recs_as_loops: false,
            rec_trigger_mode: RecTriggerMode::Normal,
            rec_trigger_level: DEFAULT_REC_TRIGGER_LEVEL,
            input_rec_mode: InputRecMode::Rigid,
            limit_output: false,
            metronome: false,
        }
    }
}

/// The engine configuration file.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct EngineConfig {
    #[serde(default)]
    audio: Audio,
    #[serde(default)]
    midi: Midi,
    #[serde(default)]
    behaviors: Behaviors,
}

impl EngineConfig {
    pub fn new(audio: Audio, midi: Midi, behaviors: Behaviors) -> EngineConfig {
        EngineConfig {
            audio,
            midi,
            behaviors,
        }
    }

    /// Reads and validates a YAML config file. Environment variables
    /// prefixed with `MLOOP_` override file values.
    pub fn deserialize(path: &Path) -> Result<EngineConfig, ConfigError> {
        let config = Config::builder()
            .add_source(File::from(path))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize::<EngineConfig>()?;
        config.validate()?;
        Ok(config)
    }

    /// Parses and validates YAML text.
    pub fn from_yaml(yaml: &str) -> Result<EngineConfig, ConfigError> {
        let config = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize::<EngineConfig>()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.audio.validate()?;
        self.midi.validate()
    }

    pub fn audio(&self) -> &Audio {
        &self.audio
    }

    pub fn midi(&self) -> &Midi {
        &self.midi
    }

    pub fn behaviors(&self) -> Behaviors {
        self.behaviors
    }
}

#[cfg(test)]
mod tests {
    use std::{env, fs};

    use serial_test::serial;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::from_yaml("audio:\n  device: mock-device\n").unwrap();
        assert_eq!(config.audio().device(), "mock-device");
        assert_eq!(config.audio().sample_rate(), 44100);
        assert_eq!(config.audio().buffer_size(), 1024);
        assert_eq!(config.audio().input_device(), None);
        assert_eq!(config.midi().sync(), SyncMode::None);
        assert_eq!(config.midi().mtc_fps(), MtcFps::Fps25);
        assert_eq!(config.behaviors(), Behaviors::default());
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
audio:
  device: out
  input_device: in
  sample_rate: 48000
  buffer_size: 256
midi:
  device: pads
  sync: master
  learn:
    start_stop:
      status: 144
      data1: 36
behaviors:
  treat_recs_as_loops: true
  rec_trigger_mode: signal
  rec_trigger_level: -20.0
  input_rec_mode: free
  metronome: true
"#;
        let config = EngineConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.audio().input_device(), Some("in"));
        assert_eq!(config.audio().sample_rate(), 48000);
        assert_eq!(config.midi().device(), Some("pads"));
        assert_eq!(config.midi().sync(), SyncMode::Master);
        assert_eq!(config.midi().learn().start_stop.map(|b| b.data1), Some(36));

        let behaviors = config.behaviors();
        assert!(behaviors.treat_recs_as_loops);
        assert!(!behaviors.chans_stop_on_seq_halt);
        assert_eq!(behaviors.rec_trigger_mode, RecTriggerMode::Signal);
        assert_eq!(behaviors.rec_trigger_level, -20.0);
        assert_eq!(behaviors.input_rec_mode, InputRecMode::Free);
        assert!(behaviors.metronome);
    }

    #[test]
    fn test_validation() {
        assert!(matches!(
            EngineConfig::from_yaml("audio:\n  sample_rate: 22050\n"),
            Err(ConfigError::InvalidSampleRate(22050))
        ));
        assert!(matches!(
            EngineConfig::from_yaml("audio:\n  buffer_size: 4\n"),
            Err(ConfigError::InvalidBufferSize(4))
        ));
        assert!(matches!(
            EngineConfig::from_yaml("midi:\n  sync: mtc-master\n  mtc_fps: 29\n"),
            Err(ConfigError::InvalidMtcFps(29))
        ));
        assert!(matches!(
            EngineConfig::from_yaml("audio: [1, 2]\n"),
            Err(ConfigError::Load(_))
        ));
    }

    #[test]
    fn test_timecode_master() {
        let config =
            EngineConfig::from_yaml("midi:\n  sync: mtc-master\n  mtc_fps: 30\n").unwrap();
        assert_eq!(config.midi().sync(), SyncMode::MtcMaster);
        assert_eq!(config.midi().mtc_fps(), MtcFps::Fps30);
    }

    #[test]
    #[serial]
    fn test_environment_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mloop.yaml");
        fs::write(&path, "audio:\n  device: mock-device\n  buffer_size: 512\n").unwrap();

        env::set_var("MLOOP_AUDIO__BUFFER_SIZE", "128");
        let config = EngineConfig::deserialize(&path);
        env::remove_var("MLOOP_AUDIO__BUFFER_SIZE");

        let config = config.unwrap();
        assert_eq!(config.audio().device(), "mock-device");
        assert_eq!(config.audio().buffer_size(), 128);
    }

    #[test]
    fn test_missing_file() {
        let err = EngineConfig::deserialize(Path::new("/not/here/mloop.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)));
    }
}
