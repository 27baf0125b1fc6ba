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
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
        Arc,
    },
};

use serde::{Deserialize, Serialize};

use super::{atomic::AtomicF32, Frame};
use crate::{
    audio::buffer::AudioBuffer,
    midi::learn::{ChannelLearn, Lightning},
    render::{midi::MidiPlayer, sample::SamplePlayer},
    util,
    wave::{Wave, WaveError},
};

/// Opaque channel identity.
pub type ChannelId = u32;

/// The master bus always exists with this id.
pub const MASTER_ID: ChannelId = 1;
/// The preview channel always exists with this id.
pub const PREVIEW_ID: ChannelId = 2;
/// First id handed out to user channels.
pub const FIRST_USER_ID: ChannelId = 3;

pub const DEFAULT_VOLUME: f32 = 1.0;
pub const DEFAULT_PAN: f32 = 0.5;
pub const DEFAULT_PITCH: f32 = 1.0;
pub const MIN_PITCH: f32 = 0.1;
pub const MAX_PITCH: f32 = 4.0;
pub const MAX_BOOST_DB: f32 = 20.0;

/// Playback status of a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum ChannelStatus {
    /// No wave assigned.
    Empty,
    /// The assigned wave could not be read.
    Missing,
    /// The assigned wave exists but can't be played.
    Wrong,
    Off,
    Play,
    /// Armed, starting at the next boundary.
    Wait,
    /// Playing, stopping at the next boundary.
    Ending,
}

impl ChannelStatus {
    fn from_u8(value: u8) -> ChannelStatus {
        match value {
            0 => ChannelStatus::Empty,
            1 => ChannelStatus::Missing,
            2 => ChannelStatus::Wrong,
            4 => ChannelStatus::Play,
            5 => ChannelStatus::Wait,
            6 => ChannelStatus::Ending,
            _ => ChannelStatus::Off,
        }
    }

    /// True while audio is coming out of the channel.
    pub fn is_playing(self) -> bool {
        matches!(self, ChannelStatus::Play | ChannelStatus::Ending)
    }

    /// True when the channel holds something playable.
    pub fn is_ready(self) -> bool {
        !matches!(
            self,
            ChannelStatus::Empty | ChannelStatus::Missing | ChannelStatus::Wrong
        )
    }
}

impl From<&WaveError> for ChannelStatus {
    fn from(e: &WaveError) -> ChannelStatus {
        if e.is_missing() {
            ChannelStatus::Missing
        } else {
            ChannelStatus::Wrong
        }
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// How a sample channel reacts to presses and boundaries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlayMode {
    #[default]
    SingleBasic,
    SingleBasicPause,
    SinglePress,
    SingleRetrig,
    SingleEndless,
    LoopBasic,
    LoopOnce,
    LoopRepeat,
    LoopOnceBar,
}

impl PlayMode {
    pub fn is_loop(self) -> bool {
        matches!(
            self,
            PlayMode::LoopBasic | PlayMode::LoopOnce | PlayMode::LoopRepeat | PlayMode::LoopOnceBar
        )
    }

    pub fn is_single(self) -> bool {
        !self.is_loop()
    }

    pub const ALL: [PlayMode; 9] = [
        PlayMode::SingleBasic,
        PlayMode::SingleBasicPause,
        PlayMode::SinglePress,
        PlayMode::SingleRetrig,
        PlayMode::SingleEndless,
        PlayMode::LoopBasic,
        PlayMode::LoopOnce,
        PlayMode::LoopRepeat,
        PlayMode::LoopOnceBar,
    ];
}

/// Sub-state of reading recorded actions when recordings are treated as loops.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum RecStatus {
    #[default]
    Stopped,
    Waiting,
    Reading,
    Ending,
}

impl RecStatus {
    fn from_u8(value: u8) -> RecStatus {
        match value {
            1 => RecStatus::Waiting,
            2 => RecStatus::Reading,
            3 => RecStatus::Ending,
            _ => RecStatus::Stopped,
        }
    }
}

/// Scalar controls shared between every thread and the render path.
///
/// Writers store with `Release` and the render thread loads with `Acquire`.
/// Each cell is independent: a value may become visible one callback late
/// and two cells written together may be observed in different callbacks,
/// but a single cell is never torn. The render thread publishes `status`,
/// `rec_status` and `tracker` back the same way for observers.
#[derive(Debug)]
pub struct ChannelShared {
    volume: AtomicF32,
    pan: AtomicF32,
    pitch: AtomicF32,
    boost_db: AtomicF32,
    mute: AtomicBool,
    solo: AtomicBool,
    armed: AtomicBool,
    velocity_as_vol: AtomicBool,

    status: AtomicU8,
    rec_status: AtomicU8,
    read_actions: AtomicBool,
    tracker: AtomicUsize,
}

/// One consistent read of a channel's controls, taken once per callback.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Controls {
    pub volume: f32,
    pub pan: f32,
    pub pitch: f32,
    /// Linear gain.
    pub boost: f32,
    pub mute: bool,
    pub solo: bool,
    pub armed: bool,
    pub velocity_as_vol: bool,
}

impl Default for Controls {
    fn default() -> Controls {
        Controls {
            volume: DEFAULT_VOLUME,
            pan: DEFAULT_PAN,
            pitch: DEFAULT_PITCH,
            boost: 1.0,
            mute: false,
            solo: false,
            armed: false,
            velocity_as_vol: false,
        }
    }
}

impl Default for ChannelShared {
    fn default() -> ChannelShared {
        ChannelShared::new(ChannelStatus::Empty)
    }
}

impl ChannelShared {
    pub fn new(status: ChannelStatus) -> ChannelShared {
        ChannelShared {
            volume: AtomicF32::new(DEFAULT_VOLUME),
            pan: AtomicF32::new(DEFAULT_PAN),
            pitch: AtomicF32::new(DEFAULT_PITCH),
            boost_db: AtomicF32::new(0.0),
            mute: AtomicBool::new(false),
            solo: AtomicBool::new(false),
            armed: AtomicBool::new(false),
            velocity_as_vol: AtomicBool::new(false),
            status: AtomicU8::new(status as u8),
            rec_status: AtomicU8::new(RecStatus::Stopped as u8),
            read_actions: AtomicBool::new(false),
            tracker: AtomicUsize::new(0),
        }
    }

    pub fn controls(&self) -> Controls {
        Controls {
            volume: self.volume(),
            pan: self.pan(),
            pitch: self.pitch(),
            boost: util::db_to_linear(self.boost_db()),
            mute: self.is_muted(),
            solo: self.is_soloed(),
            armed: self.is_armed(),
            velocity_as_vol: self.velocity_as_vol.load(Ordering::Acquire),
        }
    }

    pub fn volume(&self) -> f32 {
        self.volume.load(Ordering::Acquire)
    }

    pub fn set_volume(&self, volume: f32) {
        self.volume.store(volume.clamp(0.0, 1.0), Ordering::Release)
    }

    pub fn pan(&self) -> f32 {
        self.pan.load(Ordering::Acquire)
    }

    pub fn set_pan(&self, pan: f32) {
        self.pan.store(pan.clamp(0.0, 1.0), Ordering::Release)
    }

    pub fn pitch(&self) -> f32 {
        self.pitch.load(Ordering::Acquire)
    }

    pub fn set_pitch(&self, pitch: f32) {
        self.pitch
            .store(pitch.clamp(MIN_PITCH, MAX_PITCH), Ordering::Release)
    }

    pub fn boost_db(&self) -> f32 {
        self.boost_db.load(Ordering::Acquire)
    }

    pub fn set_boost_db(&self, db: f32) {
        self.boost_db
            .store(db.clamp(0.0, MAX_BOOST_DB), Ordering::Release)
    }

    pub fn is_muted(&self) -> bool {
        self.mute.load(Ordering::Acquire)
    }

    pub fn set_mute(&self, mute: bool) {
        self.mute.store(mute, Ordering::Release)
    }

    pub fn is_soloed(&self) -> bool {
        self.solo.load(Ordering::Acquire)
    }

    /// Sets solo and returns the previous value, so the caller can keep the
    /// mixer's solo count in step.
    pub fn swap_solo(&self, solo: bool) -> bool {
        self.solo.swap(solo, Ordering::AcqRel)
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    pub fn set_armed(&self, armed: bool) {
        self.armed.store(armed, Ordering::Release)
    }

    pub fn velocity_as_vol(&self) -> bool {
        self.velocity_as_vol.load(Ordering::Acquire)
    }

    pub fn set_velocity_as_vol(&self, enabled: bool) {
        self.velocity_as_vol.store(enabled, Ordering::Release)
    }

    /// Last status published by the render thread.
    pub fn status(&self) -> ChannelStatus {
        ChannelStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn rec_status(&self) -> RecStatus {
        RecStatus::from_u8(self.rec_status.load(Ordering::Acquire))
    }

    pub fn is_reading_actions(&self) -> bool {
        self.read_actions.load(Ordering::Acquire)
    }

    pub fn tracker(&self) -> Frame {
        self.tracker.load(Ordering::Acquire)
    }

    /// Publishes render state. Returns true if the status changed.
    pub fn publish(
        &self,
        status: ChannelStatus,
        rec_status: RecStatus,
        read_actions: bool,
        tracker: Frame,
    ) -> bool {
        self.tracker.store(tracker, Ordering::Release);
        self.rec_status.store(rec_status as u8, Ordering::Release);
        self.read_actions.store(read_actions, Ordering::Release);
        self.status.swap(status as u8, Ordering::AcqRel) != status as u8
    }
}

/// An alternate sample assignment for a channel slot.
#[derive(Clone, Debug)]
pub struct Scene {
    pub wave: Option<Arc<Wave>>,
    pub begin: Frame,
    pub end: Frame,
    pub shift: Frame,
    pub pitch: f32,
}

impl Default for Scene {
    fn default() -> Scene {
        Scene {
            wave: None,
            begin: 0,
            end: 0,
            shift: 0,
            pitch: DEFAULT_PITCH,
        }
    }
}

impl Scene {
    /// A scene covering the whole wave.
    pub fn with_wave(wave: Arc<Wave>) -> Scene {
        Scene {
            end: wave.frames(),
            wave: Some(wave),
            ..Scene::default()
        }
    }

    /// Clamps the range so that `begin <= end <= frames`.
    pub fn set_range(&mut self, begin: Frame, end: Frame) {
        let frames = self.wave.as_ref().map_or(0, |wave| wave.frames());
        self.end = end.min(frames);
        self.begin = begin.min(self.end);
    }

    pub fn has_wave(&self) -> bool {
        self.wave.is_some()
    }
}

/// The closed set of channel kinds, each carrying its own render state.
pub enum ChannelKind {
    Sample(SamplePlayer),
    Midi(MidiPlayer),
    Master,
    Group,
    Preview(SamplePlayer),
}

/// Persisted tag for [ChannelKind].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelType {
    Sample,
    Midi,
    Master,
    Group,
    Preview,
}

pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    /// The group channel this channel is routed through, if any.
    pub group: Option<ChannelId>,
    pub shared: Arc<ChannelShared>,
    /// Controls as read at the start of the current block.
    pub controls: Controls,
    /// Render target for this channel's contribution to a block.
    pub buffer: AudioBuffer,
    pub kind: ChannelKind,
    pub learn: ChannelLearn,
    pub lightning: Lightning,
}

impl Channel {
    fn with_kind(id: ChannelId, name: &str, frames: usize, kind: ChannelKind) -> Channel {
        let status = match &kind {
            ChannelKind::Sample(player) | ChannelKind::Preview(player) => player.status(),
            _ => ChannelStatus::Off,
        };
        Channel {
            id,
            name: name.to_string(),
            group: None,
            shared: Arc::new(ChannelShared::new(status)),
            controls: Controls::default(),
            buffer: AudioBuffer::new(frames),
            kind,
            learn: ChannelLearn::default(),
            lightning: Lightning::default(),
        }
    }

    pub fn sample(id: ChannelId, name: &str, mode: PlayMode, frames: usize) -> Channel {
        Channel::with_kind(
            id,
            name,
            frames,
            ChannelKind::Sample(SamplePlayer::new(mode, frames)),
        )
    }

    pub fn midi(id: ChannelId, name: &str, midi_channel: u8, frames: usize) -> Channel {
        Channel::with_kind(
            id,
            name,
            frames,
            ChannelKind::Midi(MidiPlayer::new(midi_channel)),
        )
    }

    pub fn group(id: ChannelId, name: &str, frames: usize) -> Channel {
        Channel::with_kind(id, name, frames, ChannelKind::Group)
    }

    pub fn master(frames: usize) -> Channel {
        Channel::with_kind(MASTER_ID, "master", frames, ChannelKind::Master)
    }

    pub fn preview(frames: usize) -> Channel {
        Channel::with_kind(
            PREVIEW_ID,
            "preview",
            frames,
            ChannelKind::Preview(SamplePlayer::new(PlayMode::SingleBasicPause, frames)),
        )
    }

    pub fn channel_type(&self) -> ChannelType {
        match self.kind {
            ChannelKind::Sample(_) => ChannelType::Sample,
            ChannelKind::Midi(_) => ChannelType::Midi,
            ChannelKind::Master => ChannelType::Master,
            ChannelKind::Group => ChannelType::Group,
            ChannelKind::Preview(_) => ChannelType::Preview,
        }
    }

    pub fn sample_player(&self) -> Option<&SamplePlayer> {
        match &self.kind {
            ChannelKind::Sample(player) | ChannelKind::Preview(player) => Some(player),
            _ => None,
        }
    }

    pub fn sample_player_mut(&mut self) -> Option<&mut SamplePlayer> {
        match &mut self.kind {
            ChannelKind::Sample(player) | ChannelKind::Preview(player) => Some(player),
            _ => None,
        }
    }

    /// Publishes the player's state to the shared cells. Returns true if the
    /// status changed.
    pub fn publish(&self) -> bool {
        let (status, rec_status, read_actions, tracker) = match &self.kind {
            ChannelKind::Sample(player) | ChannelKind::Preview(player) => (
                player.status(),
                player.rec_status(),
                player.is_reading_actions(),
                player.tracker(),
            ),
            ChannelKind::Midi(player) => (player.status(), RecStatus::Stopped, false, 0),
            ChannelKind::Master | ChannelKind::Group => return false,
        };
        self.shared
            .publish(status, rec_status, read_actions, tracker)
    }

    /// Resizes render buffers. Only called during structural edits.
    pub fn set_buffer_frames(&mut self, frames: usize) {
        self.buffer = AudioBuffer::new(frames);
        if let Some(player) = self.sample_player_mut() {
            player.set_buffer_frames(frames);
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("type", &self.channel_type())
            .field("group", &self.group)
            .field("status", &self.shared.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_controls_are_clamped() {
        let shared = ChannelShared::default();
        shared.set_pitch(10.0);
        assert_eq!(shared.pitch(), MAX_PITCH);
        shared.set_pitch(0.0);
        assert_eq!(shared.pitch(), MIN_PITCH);
        shared.set_boost_db(40.0);
        assert_eq!(shared.boost_db(), MAX_BOOST_DB);
        shared.set_volume(-1.0);
        assert_eq!(shared.volume(), 0.0);
        shared.set_pan(2.0);
        assert_eq!(shared.pan(), 1.0);
    }

    #[test]
    fn test_publish_reports_changes() {
        let shared = ChannelShared::new(ChannelStatus::Off);
        assert!(shared.publish(ChannelStatus::Play, RecStatus::Stopped, false, 10));
        assert!(!shared.publish(ChannelStatus::Play, RecStatus::Reading, true, 20));
        assert_eq!(shared.status(), ChannelStatus::Play);
        assert_eq!(shared.rec_status(), RecStatus::Reading);
        assert!(shared.is_reading_actions());
        assert_eq!(shared.tracker(), 20);
    }

    #[test]
    fn test_status_round_trips_through_u8() {
        for status in [
            ChannelStatus::Empty,
            ChannelStatus::Missing,
            ChannelStatus::Wrong,
            ChannelStatus::Off,
            ChannelStatus::Play,
            ChannelStatus::Wait,
            ChannelStatus::Ending,
        ] {
            assert_eq!(ChannelStatus::from_u8(status as u8), status);
        }
    }

    #[test]
    fn test_scene_range_is_clamped() {
        let wave = Arc::new(Wave::logical(1, vec![0.0; 20], 44100));
        let mut scene = Scene::with_wave(wave);
        assert_eq!(scene.end, 10);
        scene.set_range(4, 50);
        assert_eq!((scene.begin, scene.end), (4, 10));
        scene.set_range(12, 8);
        assert_eq!((scene.begin, scene.end), (8, 8));
    }

    #[test]
    fn test_mode_families() {
        assert_eq!(PlayMode::ALL.iter().filter(|m| m.is_loop()).count(), 4);
        assert!(PlayMode::SingleEndless.is_single());
    }
}
