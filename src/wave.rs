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
//! Decoded sample data and the store that owns it.

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::audio::buffer::CHANNELS;

pub mod loader;
pub mod writer;

/// Identifies a wave inside a [WaveStore].
pub type WaveId = u32;

#[derive(Debug, thiserror::Error)]
pub enum WaveError {
    #[error("unable to open {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to decode {path}: {source}")]
    Codec {
        path: PathBuf,
        #[source]
        source: hound::Error,
    },
    #[error("{0} channels are not supported")]
    UnsupportedChannels(u16),
    #[error("unsupported sample format: {0} bits")]
    UnsupportedFormat(u16),
    #[error("file contains no audio")]
    Empty,
    #[error("sample rate conversion failed: {0}")]
    Resample(String),
}

impl WaveError {
    /// True when the file could not be found or read at all, as opposed to a
    /// file that exists but holds something we can't play.
    pub fn is_missing(&self) -> bool {
        matches!(self, WaveError::Io { .. })
    }
}

/// Decoded, interleaved stereo PCM at the engine sample rate.
pub struct Wave {
    id: WaveId,
    data: Vec<f32>,
    rate: u32,
    bit_depth: u16,
    path: Option<PathBuf>,
    /// In memory only, e.g. a recorded take that was never saved.
    logical: bool,
    edited: bool,
}

impl Wave {
    pub fn new(id: WaveId, data: Vec<f32>, rate: u32, bit_depth: u16) -> Wave {
        Wave {
            id,
            data,
            rate,
            bit_depth,
            path: None,
            logical: false,
            edited: false,
        }
    }

    /// Creates an in-memory wave, e.g. from an input recording.
    pub fn logical(id: WaveId, data: Vec<f32>, rate: u32) -> Wave {
        Wave {
            logical: true,
            ..Wave::new(id, data, rate, 32)
        }
    }

    pub fn with_path(mut self, path: &Path) -> Wave {
        self.path = Some(path.to_path_buf());
        self
    }

    pub fn id(&self) -> WaveId {
        self.id
    }

    pub fn frames(&self) -> usize {
        self.data.len() / CHANNELS
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn bit_depth(&self) -> u16 {
        self.bit_depth
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_logical(&self) -> bool {
        self.logical
    }

    pub fn is_edited(&self) -> bool {
        self.edited
    }

    pub fn set_edited(&mut self, edited: bool) {
        self.edited = edited;
    }

    /// Marks a logical wave as saved to `path`.
    pub fn set_saved(&mut self, path: &Path) {
        self.path = Some(path.to_path_buf());
        self.logical = false;
    }

    pub fn frame(&self, index: usize) -> [f32; CHANNELS] {
        let i = index * CHANNELS;
        [self.data[i], self.data[i + 1]]
    }

    /// Interleaved samples for the frames in `[from, to)`.
    pub fn samples(&self, from: usize, to: usize) -> &[f32] {
        let to = to.min(self.frames());
        let from = from.min(to);
        &self.data[from * CHANNELS..to * CHANNELS]
    }

    /// A display name, derived from the path when there is one.
    pub fn name(&self) -> String {
        match &self.path {
            Some(path) => crate::util::filename_display(path).to_string(),
            None => format!("take-{}", self.id),
        }
    }
}

impl fmt::Debug for Wave {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wave")
            .field("id", &self.id)
            .field("frames", &self.frames())
            .field("rate", &self.rate)
            .field("bit_depth", &self.bit_depth)
            .field("path", &self.path)
            .field("logical", &self.logical)
            .field("edited", &self.edited)
            .finish()
    }
}

/// Owns every wave in a model. Channels hold clones of the same `Arc`, so a
/// wave stays alive while any scene references it. Unreferenced waves are
/// dropped by [WaveStore::collect_garbage], which only runs during structural
/// edits, so deallocation never happens on the render thread.
#[derive(Clone, Debug, Default)]
pub struct WaveStore {
    waves: HashMap<WaveId, Arc<Wave>>,
    next_id: WaveId,
}

impl WaveStore {
    pub fn new() -> WaveStore {
        WaveStore {
            waves: HashMap::new(),
            next_id: 1,
        }
    }

    /// Reserves an id for a wave that is about to be created.
    pub fn next_id(&mut self) -> WaveId {
        let id = self.next_id.max(1);
        self.next_id = id + 1;
        id
    }

    /// Takes ownership of a wave and returns the shared handle to hand to
    /// channels.
    pub fn insert(&mut self, wave: Wave) -> Arc<Wave> {
        self.next_id = self.next_id.max(wave.id() + 1);
        let wave = Arc::new(wave);
        self.waves.insert(wave.id(), wave.clone());
        wave
    }

    pub fn get(&self, id: WaveId) -> Option<&Arc<Wave>> {
        self.waves.get(&id)
    }

    /// Replaces a wave in place, e.g. after it was saved to disk.
    pub fn replace(&mut self, wave: Wave) -> Arc<Wave> {
        self.insert(wave)
    }

    pub fn len(&self) -> usize {
        self.waves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waves.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Wave>> {
        self.waves.values()
    }

    /// Drops waves no channel refers to anymore. Returns how many were removed.
    pub fn collect_garbage(&mut self) -> usize {
        let before = self.waves.len();
        self.waves.retain(|_, wave| Arc::strong_count(wave) > 1);
        before - self.waves.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_samples_are_clamped_to_range() {
        let wave = Wave::new(1, vec![0.0, 0.0, 1.0, 1.0, 2.0, 2.0], 44100, 16);
        assert_eq!(wave.frames(), 3);
        assert_eq!(wave.samples(1, 10), &[1.0, 1.0, 2.0, 2.0]);
        assert!(wave.samples(5, 2).is_empty());
        assert_eq!(wave.frame(2), [2.0, 2.0]);
    }

    #[test]
    fn test_store_collects_unreferenced_waves() {
        let mut store = WaveStore::new();
        let first = store.next_id();
        let second = store.next_id();
        assert_ne!(first, second);

        let kept = store.insert(Wave::logical(first, vec![0.0; 4], 44100));
        store.insert(Wave::logical(second, vec![0.0; 4], 44100));
        assert_eq!(store.len(), 2);

        assert_eq!(store.collect_garbage(), 1);
        assert!(store.get(first).is_some());
        assert!(store.get(second).is_none());

        drop(kept);
        assert_eq!(store.collect_garbage(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_logical_wave_names() {
        let mut wave = Wave::logical(7, vec![], 48000);
        assert!(wave.is_logical());
        assert_eq!(wave.name(), "take-7");
        wave.set_saved(Path::new("/tmp/take.wav"));
        assert!(!wave.is_logical());
        assert_eq!(wave.name(), "take.wav");
    }
}
