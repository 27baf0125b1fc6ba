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
//! Sums channel buffers into the output block and handles the input side.

use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};

use crate::{
    audio::buffer::{AudioBuffer, CHANNELS},
    model::{
        atomic::AtomicF32,
        channel::{Channel, ChannelKind, Controls},
        Frame,
    },
    sequencer::metronome::{Click, Metronome},
    util,
};

pub mod input;

use input::Capture;

pub const DEFAULT_REC_TRIGGER_LEVEL: f32 = -10.0;

/// At most this many clicks are scheduled in one block.
const CLICKS_CAPACITY: usize = 8;

/// Mixer settings and meters shared with every thread.
#[derive(Debug)]
pub struct MixerShared {
    in_volume: AtomicF32,
    peak_in: AtomicF32,
    peak_out: AtomicF32,
    in_to_out: AtomicBool,
    metronome: AtomicBool,
    limit_output: AtomicBool,
    /// Level in dB the input must reach to start a signal-triggered take.
    rec_trigger_level: AtomicF32,
    signal_armed: AtomicBool,
    input_recording: AtomicBool,
    solo_count: AtomicU32,
}

impl Default for MixerShared {
    fn default() -> MixerShared {
        MixerShared {
            in_volume: AtomicF32::new(1.0),
            peak_in: AtomicF32::new(0.0),
            peak_out: AtomicF32::new(0.0),
            in_to_out: AtomicBool::new(false),
            metronome: AtomicBool::new(false),
            limit_output: AtomicBool::new(false),
            rec_trigger_level: AtomicF32::new(DEFAULT_REC_TRIGGER_LEVEL),
            signal_armed: AtomicBool::new(false),
            input_recording: AtomicBool::new(false),
            solo_count: AtomicU32::new(0),
        }
    }
}

impl MixerShared {
    pub fn in_volume(&self) -> f32 {
        self.in_volume.load(Ordering::Acquire)
    }

    pub fn set_in_volume(&self, volume: f32) {
        self.in_volume.store(volume.clamp(0.0, 1.0), Ordering::Release)
    }

    /// Input peak of the last block, linear.
    pub fn peak_in(&self) -> f32 {
        self.peak_in.load(Ordering::Acquire)
    }

    /// Output peak of the last block, linear.
    pub fn peak_out(&self) -> f32 {
        self.peak_out.load(Ordering::Acquire)
    }

    pub fn in_to_out(&self) -> bool {
        self.in_to_out.load(Ordering::Acquire)
    }

    pub fn set_in_to_out(&self, enabled: bool) {
        self.in_to_out.store(enabled, Ordering::Release)
    }

    pub fn metronome(&self) -> bool {
        self.metronome.load(Ordering::Acquire)
    }

    pub fn set_metronome(&self, enabled: bool) {
        self.metronome.store(enabled, Ordering::Release)
    }

    pub fn limit_output(&self) -> bool {
        self.limit_output.load(Ordering::Acquire)
    }

    pub fn set_limit_output(&self, enabled: bool) {
        self.limit_output.store(enabled, Ordering::Release)
    }

    pub fn rec_trigger_level(&self) -> f32 {
        self.rec_trigger_level.load(Ordering::Acquire)
    }

    pub fn set_rec_trigger_level(&self, db: f32) {
        self.rec_trigger_level.store(db.min(0.0), Ordering::Release)
    }

    /// Waits for the input to cross the trigger level.
    pub fn arm_signal(&self, armed: bool) {
        self.signal_armed.store(armed, Ordering::Release)
    }

    pub fn is_signal_armed(&self) -> bool {
        self.signal_armed.load(Ordering::Acquire)
    }

    pub fn is_input_recording(&self) -> bool {
        self.input_recording.load(Ordering::Acquire)
    }

    pub fn set_input_recording(&self, recording: bool) {
        self.input_recording.store(recording, Ordering::Release)
    }

    pub fn solo_count(&self) -> u32 {
        self.solo_count.load(Ordering::Acquire)
    }

    pub fn set_solo_count(&self, count: u32) {
        self.solo_count.store(count, Ordering::Release)
    }

    pub fn add_solo(&self) {
        self.solo_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn remove_solo(&self) {
        let _ = self
            .solo_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            });
    }

    fn publish_peaks(&self, peak_in: f32, peak_out: f32) {
        self.peak_in.store(peak_in, Ordering::Release);
        self.peak_out.store(peak_out, Ordering::Release);
    }
}

/// Pan law: center leaves both sides untouched, otherwise the far side is
/// attenuated linearly.
pub fn pan_gains(pan: f32) -> [f32; CHANNELS] {
    if pan == 0.5 {
        [1.0, 1.0]
    } else {
        [1.0 - pan, pan]
    }
}

fn channel_gains(controls: &Controls) -> [f32; CHANNELS] {
    let gain = controls.volume * controls.boost;
    let [left, right] = pan_gains(controls.pan);
    [left * gain, right * gain]
}

/// Render-side mixer state. Lives in the model.
#[derive(Debug)]
pub struct Mixer {
    shared: Arc<MixerShared>,
    out: AudioBuffer,
    input: AudioBuffer,
    metronome: Metronome,
    clicks: Vec<(usize, Click)>,
    capture: Option<Capture>,
}

impl Mixer {
    pub fn new(frames: usize, shared: Arc<MixerShared>) -> Mixer {
        Mixer {
            shared,
            out: AudioBuffer::new(frames),
            input: AudioBuffer::new(frames),
            metronome: Metronome::default(),
            clicks: Vec::with_capacity(CLICKS_CAPACITY),
            capture: None,
        }
    }

    pub fn shared(&self) -> &Arc<MixerShared> {
        &self.shared
    }

    pub fn set_buffer_frames(&mut self, frames: usize) {
        self.out = AudioBuffer::new(frames);
        self.input = AudioBuffer::new(frames);
    }

    pub fn output(&self) -> &AudioBuffer {
        &self.out
    }

    pub fn input(&self) -> &AudioBuffer {
        &self.input
    }

    /// Installs a take buffer. Structural edits only.
    pub fn set_capture(&mut self, capture: Capture) -> Option<Capture> {
        self.capture.replace(capture)
    }

    pub fn take_capture(&mut self) -> Option<Capture> {
        self.capture.take()
    }

    pub fn has_capture(&self) -> bool {
        self.capture.is_some()
    }

    // Render thread.

    /// Starts a block of `frames` frames.
    pub fn begin(&mut self, frames: usize) {
        self.out.set_frames(frames);
        self.input.set_frames(frames);
        self.out.clear();
        self.input.clear();
        self.clicks.clear();
    }

    /// Copies interleaved stereo input into the input block at input volume.
    /// Returns true when an armed signal trigger fires on this block.
    pub fn read_input(&mut self, input: Option<&[f32]>) -> bool {
        let Some(input) = input else {
            self.shared.publish_peaks(0.0, self.shared.peak_out());
            return false;
        };
        let dst = self.input.as_mut_slice();
        let len = dst.len().min(input.len());
        dst[..len].copy_from_slice(&input[..len]);
        self.input.scale(self.shared.in_volume());

        let peak = self.input.peak();
        self.shared.publish_peaks(peak, self.shared.peak_out());

        let level = util::db_to_linear(self.shared.rec_trigger_level());
        self.shared.is_signal_armed()
            && peak > level
            && self.shared.signal_armed.swap(false, Ordering::AcqRel)
    }

    /// Schedules a metronome click at a block offset.
    pub fn click(&mut self, offset: usize, click: Click) {
        if self.clicks.len() < self.clicks.capacity() {
            self.clicks.push((offset, click));
        }
    }

    /// Sums user channels into groups and groups into the output block.
    /// Audibility under solo is decided here.
    pub fn sum(&mut self, channels: &mut [Channel]) {
        let solos = self.shared.solo_count();

        for index in 0..channels.len() {
            let channel = &channels[index];
            if !matches!(channel.kind, ChannelKind::Sample(_)) {
                continue;
            }
            let group_soloed = channel
                .group
                .and_then(|group| channels.iter().find(|c| c.id == group))
                .is_some_and(|group| group.controls.solo);
            if solos > 0 && !channel.controls.solo && !group_soloed {
                continue;
            }
            let gains = channel_gains(&channel.controls);
            let group = channel.group.and_then(|group| {
                channels
                    .iter()
                    .position(|c| c.id == group && matches!(c.kind, ChannelKind::Group))
            });
            match group {
                Some(group) => {
                    let (source, target) = pair_mut(channels, index, group);
                    target.buffer.add(&source.buffer, gains);
                }
                None => self.out.add(&channels[index].buffer, gains),
            }
        }

        for channel in channels.iter() {
            if matches!(channel.kind, ChannelKind::Group) && !channel.controls.mute {
                self.out.add(&channel.buffer, channel_gains(&channel.controls));
            }
        }
    }

    /// Finishes the output block: monitoring, master volume, limiter, meters,
    /// metronome and finally the preview channel, which skips the master.
    pub fn finish(&mut self, master: &Controls, preview: &Channel) {
        if self.shared.in_to_out() {
            self.out.add(&self.input, [1.0, 1.0]);
        }

        if master.mute {
            self.out.clear();
        } else {
            self.out.scale(master.volume);
        }

        if self.shared.limit_output() {
            for sample in self.out.as_mut_slice() {
                *sample = sample.clamp(-1.0, 1.0);
            }
        }

        self.shared
            .publish_peaks(self.shared.peak_in(), self.out.peak());

        if self.shared.metronome() {
            let mut at = 0;
            for &(offset, click) in &self.clicks {
                self.metronome.render_range(&mut self.out, at, offset);
                self.metronome.trigger(click);
                at = offset;
            }
            let frames = self.out.frames();
            self.metronome.render_range(&mut self.out, at, frames);
        } else {
            self.metronome.reset();
        }

        if !preview.controls.mute {
            self.out.add(&preview.buffer, channel_gains(&preview.controls));
        }
    }

    /// Writes the input block into the installed take, if recording. Returns
    /// true when a free take just filled up.
    pub fn capture(&mut self, position: impl Fn(usize) -> Frame) -> bool {
        if !self.shared.is_input_recording() {
            return false;
        }
        match self.capture.as_mut() {
            Some(capture) => capture.write(&self.input, position),
            None => false,
        }
    }
}

/// Mutable borrows of two distinct channels.
fn pair_mut(channels: &mut [Channel], a: usize, b: usize) -> (&mut Channel, &mut Channel) {
    if a < b {
        let (left, right) = channels.split_at_mut(b);
        (&mut left[a], &mut right[0])
    } else {
        let (left, right) = channels.split_at_mut(a);
        (&mut right[0], &mut left[b])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::channel::PlayMode;

    fn filled(frames: usize, value: f32) -> AudioBuffer {
        AudioBuffer::from_interleaved(vec![value; frames * CHANNELS])
    }

    fn sample(id: u32, value: f32) -> Channel {
        let mut channel = Channel::sample(id, "s", PlayMode::LoopBasic, 4);
        channel.buffer = filled(4, value);
        channel
    }

    fn mixer() -> Mixer {
        let mut mixer = Mixer::new(4, Arc::new(MixerShared::default()));
        mixer.begin(4);
        mixer
    }

    #[test]
    fn test_pan_law() {
        assert_eq!(pan_gains(0.5), [1.0, 1.0]);
        assert_eq!(pan_gains(0.0), [1.0, 0.0]);
        assert_eq!(pan_gains(0.75), [0.25, 0.75]);
    }

    #[test]
    fn test_sum_applies_volume_and_pan() {
        let mut mixer = mixer();
        let mut channels = vec![sample(3, 0.5), sample(4, 0.25)];
        channels[0].controls.volume = 0.5;
        channels[1].controls.pan = 1.0;
        mixer.sum(&mut channels);
        assert_eq!(mixer.output().frame(0), [0.25, 0.5]);
    }

    #[test]
    fn test_solo_silences_the_rest() {
        let mut mixer = mixer();
        let mut channels = vec![sample(3, 0.5), sample(4, 0.25)];
        channels[1].controls.solo = true;
        mixer.shared().add_solo();
        mixer.sum(&mut channels);
        assert_eq!(mixer.output().frame(0), [0.25, 0.25]);
    }

    #[test]
    fn test_groups_sum_children_and_pass_solo_down() {
        let mut mixer = mixer();
        let mut group = Channel::group(5, "group", 4);
        group.controls.volume = 0.5;
        group.controls.solo = true;
        let mut child = sample(3, 0.5);
        child.group = Some(5);
        let mut channels = vec![child, sample(4, 0.25), group];
        mixer.shared().add_solo();
        mixer.sum(&mut channels);
        assert_eq!(channels[2].buffer.frame(0), [0.5, 0.5]);
        assert_eq!(mixer.output().frame(0), [0.25, 0.25]);

        mixer.begin(4);
        channels[2].buffer.clear();
        channels[2].controls.mute = true;
        mixer.sum(&mut channels);
        assert_eq!(mixer.output().frame(0), [0.0, 0.0]);
    }

    #[test]
    fn test_finish_order() {
        let mut mixer = mixer();
        mixer.shared().set_limit_output(true);
        let mut channels = vec![sample(3, 0.9), sample(4, 0.9)];
        mixer.sum(&mut channels);

        let mut preview = Channel::preview(4);
        preview.buffer = filled(4, 0.5);
        let master = Controls::default();
        mixer.finish(&master, &preview);

        // Limited to full scale, then the preview lands on top.
        assert_eq!(mixer.output().frame(0), [1.5, 1.5]);
        assert_eq!(mixer.shared().peak_out(), 1.0);
    }

    #[test]
    fn test_master_mute_keeps_preview() {
        let mut mixer = mixer();
        let mut channels = vec![sample(3, 0.5)];
        mixer.sum(&mut channels);
        let mut preview = Channel::preview(4);
        preview.buffer = filled(4, 0.25);
        let master = Controls {
            mute: true,
            ..Controls::default()
        };
        mixer.finish(&master, &preview);
        assert_eq!(mixer.output().frame(3), [0.25, 0.25]);
    }

    #[test]
    fn test_input_monitoring_and_threshold() {
        let mut mixer = mixer();
        mixer.shared().set_in_volume(0.5);
        mixer.shared().set_in_to_out(true);
        mixer.shared().set_rec_trigger_level(-20.0);

        let quiet = vec![0.05; 8];
        let loud = vec![0.8; 8];
        assert!(!mixer.read_input(Some(&loud)));

        mixer.shared().arm_signal(true);
        assert!(!mixer.read_input(Some(&quiet)));
        assert!(mixer.read_input(Some(&loud)));
        assert!(!mixer.shared().is_signal_armed());
        assert_eq!(mixer.shared().peak_in(), 0.4);

        mixer.finish(&Controls::default(), &Channel::preview(4));
        assert_eq!(mixer.output().frame(0), [0.4, 0.4]);
    }

    #[test]
    fn test_capture_only_while_recording() {
        let mut mixer = mixer();
        mixer.set_capture(Capture::new(input::InputRecMode::Free, 6));
        mixer.read_input(Some(&[0.5; 8]));
        assert!(!mixer.capture(|i| i));
        mixer.shared().set_input_recording(true);
        assert!(!mixer.capture(|i| i));
        assert!(mixer.capture(|i| i));
        let take = mixer.take_capture().unwrap();
        assert_eq!(take.written(), 6);
    }

    #[test]
    fn test_metronome_clicks_at_offsets() {
        let mut mixer = Mixer::new(64, Arc::new(MixerShared::default()));
        mixer.begin(64);
        mixer.shared().set_metronome(true);
        mixer.click(10, Click::Tick);
        mixer.finish(&Controls::default(), &Channel::preview(64));
        assert_eq!(mixer.output().frame(9), [0.0, 0.0]);
        assert_ne!(mixer.output().frame(10), [0.0, 0.0]);
    }

    #[test]
    fn test_solo_count_never_underflows() {
        let shared = MixerShared::default();
        shared.remove_solo();
        assert_eq!(shared.solo_count(), 0);
        shared.add_solo();
        shared.add_solo();
        shared.remove_solo();
        assert_eq!(shared.solo_count(), 1);
    }
}
