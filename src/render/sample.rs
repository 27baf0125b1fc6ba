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
use std::sync::Arc;

use super::{
    fade::{Fade, FadeKind, PostFade},
    fill::fill_buffer,
    resampler::Resampler,
    PlayContext,
};
use crate::{
    audio::buffer::{AudioBuffer, CHANNELS},
    model::{
        actions::ActionKind,
        channel::{
            ChannelStatus, Controls, PlayMode, RecStatus, Scene, DEFAULT_PITCH, MAX_PITCH,
            MIN_PITCH,
        },
        Frame,
    },
    wave::Wave,
};

/// Playback state of a sample channel.
///
/// A block is rendered in three steps. [SamplePlayer::prepare] clears the
/// channel buffer and fills it from the read cursor as if nothing will
/// happen. Commands and sequencer boundaries then land on a frame of the
/// block and overwrite the buffer from that frame on. [SamplePlayer::finish]
/// applies fades, mutes and the internal volume.
///
/// Stopping and restarting keep the audio that was already prefilled past
/// the change as the outgoing tail, so fade-outs and crossfades read the old
/// cursor while the new one starts immediately.
#[derive(Debug)]
pub struct SamplePlayer {
    mode: PlayMode,
    status: ChannelStatus,
    scenes: Vec<Scene>,
    active: usize,
    tracker: Frame,
    paused_at: Option<Frame>,
    /// A start or retrigger is waiting for the next quantizer step.
    quantizing: bool,

    fade: Fade,
    xtracker: Frame,
    xbuffer: AudioBuffer,
    resampler: Resampler,
    xresampler: Resampler,
    /// Channel pitch times the active scene's pitch.
    pitch: f32,

    mute: bool,
    mute_i: bool,
    volume_i: f32,
    velocity_as_vol: bool,

    read_actions: bool,
    rec_status: RecStatus,
    has_actions: bool,
}

impl SamplePlayer {
    pub fn new(mode: PlayMode, frames: usize) -> SamplePlayer {
        SamplePlayer {
            mode,
            status: ChannelStatus::Empty,
            scenes: vec![Scene::default()],
            active: 0,
            tracker: 0,
            paused_at: None,
            quantizing: false,
            fade: Fade::none(),
            xtracker: 0,
            xbuffer: AudioBuffer::new(frames),
            resampler: Resampler::default(),
            xresampler: Resampler::default(),
            pitch: DEFAULT_PITCH,
            mute: false,
            mute_i: false,
            volume_i: 1.0,
            velocity_as_vol: false,
            read_actions: false,
            rec_status: RecStatus::Stopped,
            has_actions: false,
        }
    }

    pub fn mode(&self) -> PlayMode {
        self.mode
    }

    pub fn status(&self) -> ChannelStatus {
        self.status
    }

    pub fn tracker(&self) -> Frame {
        self.tracker
    }

    pub fn begin(&self) -> Frame {
        self.scene().begin
    }

    pub fn end(&self) -> Frame {
        self.scene().end
    }

    pub fn scene(&self) -> &Scene {
        &self.scenes[self.active]
    }

    pub fn scenes(&self) -> &[Scene] {
        &self.scenes
    }

    pub fn active_scene(&self) -> usize {
        self.active
    }

    pub fn wave(&self) -> Option<&Arc<Wave>> {
        self.scene().wave.as_ref()
    }

    pub fn fade(&self) -> &Fade {
        &self.fade
    }

    pub fn is_quantizing(&self) -> bool {
        self.quantizing
    }

    pub fn is_reading_actions(&self) -> bool {
        self.read_actions
    }

    pub fn rec_status(&self) -> RecStatus {
        self.rec_status
    }

    pub fn volume_i(&self) -> f32 {
        self.volume_i
    }

    pub fn is_muted_internally(&self) -> bool {
        self.mute_i
    }

    pub fn has_actions(&self) -> bool {
        self.has_actions
    }

    // Structural edits. These run while the render thread is parked.

    pub fn set_buffer_frames(&mut self, frames: usize) {
        self.xbuffer = AudioBuffer::new(frames);
    }

    pub fn set_mode(&mut self, mode: PlayMode) {
        self.mode = mode;
        self.quantizing = false;
        self.paused_at = None;
        if self.status == ChannelStatus::Wait && !mode.is_loop() {
            self.status = ChannelStatus::Off;
        }
    }

    /// Assigns a wave to the active scene, covering its whole range.
    pub fn set_wave(&mut self, wave: Option<Arc<Wave>>) {
        self.scenes[self.active] = match wave {
            Some(wave) => Scene::with_wave(wave),
            None => Scene::default(),
        };
        self.status = self.idle_status();
        self.rewind_cursor();
    }

    /// Marks the channel as holding an unusable wave.
    pub fn set_error(&mut self, status: ChannelStatus) {
        self.scenes[self.active] = Scene::default();
        self.status = status;
        self.rewind_cursor();
    }

    pub fn set_range(&mut self, begin: Frame, end: Frame) {
        self.scenes[self.active].set_range(begin, end);
        let (begin, end) = (self.begin(), self.end());
        if self.status.is_playing() {
            self.tracker = self.tracker.clamp(begin, end);
        } else {
            self.tracker = begin;
        }
        self.paused_at = None;
    }

    pub fn set_shift(&mut self, shift: Frame) {
        self.scenes[self.active].shift = shift;
    }

    /// Replaces every scene. `active` is clamped to the new scene count.
    pub fn set_scenes(&mut self, scenes: Vec<Scene>, active: usize) {
        self.scenes = if scenes.is_empty() {
            vec![Scene::default()]
        } else {
            scenes
        };
        self.active = active.min(self.scenes.len() - 1);
        self.status = self.idle_status();
        self.rewind_cursor();
    }

    pub fn add_scene(&mut self, scene: Scene) -> usize {
        self.scenes.push(scene);
        self.scenes.len() - 1
    }

    /// Switches to another scene. The channel stops.
    pub fn set_active_scene(&mut self, index: usize) -> bool {
        if index >= self.scenes.len() {
            return false;
        }
        self.active = index;
        self.status = self.idle_status();
        self.rewind_cursor();
        true
    }

    pub fn set_has_actions(&mut self, has_actions: bool) {
        self.has_actions = has_actions;
        if !has_actions {
            self.read_actions = false;
            self.rec_status = RecStatus::Stopped;
        }
    }

    fn idle_status(&self) -> ChannelStatus {
        if self.scene().has_wave() {
            ChannelStatus::Off
        } else {
            ChannelStatus::Empty
        }
    }

    fn ratio(&self) -> f64 {
        1.0 / self.pitch as f64
    }

    /// Where playback starts: `begin` moved forward by the scene shift,
    /// wrapped into the range.
    fn start_frame(&self) -> Frame {
        let scene = self.scene();
        let length = scene.end.saturating_sub(scene.begin);
        if length == 0 {
            scene.begin
        } else {
            scene.begin + scene.shift % length
        }
    }

    fn rewind_cursor(&mut self) {
        self.tracker = self.begin();
        self.paused_at = None;
        self.quantizing = false;
        self.fade = Fade::none();
        self.resampler.reset(self.ratio());
    }

    // Render thread.

    /// Starts a block: applies control changes and prefills the buffer.
    pub fn prepare(&mut self, buf: &mut AudioBuffer, controls: &Controls, ctx: &PlayContext) {
        buf.clear();
        self.xbuffer.set_frames(buf.frames());
        self.velocity_as_vol = controls.velocity_as_vol;

        let pitch = (controls.pitch * self.scene().pitch).clamp(MIN_PITCH, MAX_PITCH);
        if pitch != self.pitch {
            self.pitch = pitch;
            let ratio = self.ratio();
            self.resampler.set_ratio(ratio);
            self.xresampler.set_ratio(ratio);
        }

        if controls.mute != self.mute {
            self.mute = controls.mute;
            if self.status.is_playing() && !self.mute_i {
                self.fade = if self.mute {
                    Fade::fade_out(0, self.remaining(0, buf.frames()), PostFade::Mute)
                } else {
                    Fade::fade_in(0)
                };
            }
        }

        if self.fade.uses_tail() {
            self.fill_tail();
        }
        if self.status.is_playing() {
            self.fill_from(buf, 0, ctx);
        }
    }

    /// A key press at `frame`. `velocity` is in [0, 1].
    pub fn start(
        &mut self,
        buf: &mut AudioBuffer,
        frame: usize,
        do_quantize: bool,
        velocity: f32,
        ctx: &PlayContext,
    ) {
        match self.status {
            ChannelStatus::Off => {
                if self.mode.is_loop() {
                    self.status = ChannelStatus::Wait;
                } else {
                    self.apply_velocity(velocity);
                    if ctx.defers_start(do_quantize) {
                        self.quantizing = true;
                    } else {
                        self.play(buf, frame, ctx);
                    }
                }
            }
            ChannelStatus::Play => match self.mode {
                PlayMode::SingleBasic => self.stop_with_fade(buf, frame, PostFade::HardStop),
                PlayMode::SingleBasicPause => self.stop_with_fade(buf, frame, PostFade::Pause),
                PlayMode::SingleRetrig => {
                    self.apply_velocity(velocity);
                    if ctx.defers_start(do_quantize) {
                        self.quantizing = true;
                    } else {
                        self.restart(buf, frame, ctx);
                    }
                }
                PlayMode::SinglePress => {}
                _ => self.status = ChannelStatus::Ending,
            },
            ChannelStatus::Wait => self.status = ChannelStatus::Off,
            ChannelStatus::Ending => self.status = ChannelStatus::Play,
            _ => {}
        }
    }

    /// A key release. Only meaningful for [PlayMode::SinglePress].
    pub fn stop(&mut self, buf: &mut AudioBuffer, frame: usize) {
        if self.mode != PlayMode::SinglePress {
            return;
        }
        if self.quantizing {
            self.quantizing = false;
        } else if self.status == ChannelStatus::Play {
            self.stop_with_fade(buf, frame, PostFade::HardStop);
        }
    }

    pub fn kill(&mut self, buf: &mut AudioBuffer, frame: usize) {
        match self.status {
            ChannelStatus::Play | ChannelStatus::Ending => {
                self.stop_with_fade(buf, frame, PostFade::HardStop)
            }
            ChannelStatus::Wait => self.hard_stop(buf, frame),
            _ => {}
        }
        self.quantizing = false;
        self.paused_at = None;
    }

    /// Fires a pending start or retrigger. Returns true if one was pending.
    pub fn quantize(&mut self, buf: &mut AudioBuffer, frame: usize, ctx: &PlayContext) -> bool {
        if !self.quantizing {
            return false;
        }
        self.quantizing = false;
        match self.status {
            ChannelStatus::Off => self.play(buf, frame, ctx),
            ChannelStatus::Play => self.restart(buf, frame, ctx),
            _ => {}
        }
        true
    }

    /// The sequencer crossed frame zero of the loop.
    pub fn on_first_beat(&mut self, buf: &mut AudioBuffer, frame: usize, ctx: &PlayContext) {
        match self.status {
            ChannelStatus::Play if self.mode.is_loop() => {
                if ctx.running {
                    self.restart(buf, frame, ctx);
                } else {
                    self.stop_with_fade(buf, frame, PostFade::HardStop);
                }
            }
            ChannelStatus::Wait => self.play(buf, frame, ctx),
            ChannelStatus::Ending if self.mode.is_loop() => {
                self.stop_with_fade(buf, frame, PostFade::HardStop)
            }
            _ => {}
        }

        if ctx.treat_recs_as_loops {
            match self.rec_status {
                RecStatus::Waiting => {
                    self.rec_status = RecStatus::Reading;
                    self.read_actions = true;
                }
                RecStatus::Ending => {
                    self.rec_status = RecStatus::Stopped;
                    self.read_actions = false;
                }
                _ => {}
            }
        }
    }

    pub fn on_bar(&mut self, buf: &mut AudioBuffer, frame: usize, ctx: &PlayContext) {
        match (self.status, self.mode) {
            (ChannelStatus::Play, PlayMode::LoopRepeat) => self.restart(buf, frame, ctx),
            (ChannelStatus::Wait, PlayMode::LoopOnceBar) => self.play(buf, frame, ctx),
            _ => {}
        }
    }

    /// The sequencer was rewound. Loops follow the first beat that comes
    /// with the rewind, so only singles replaying actions restart here.
    pub fn rewind_by_seq(&mut self, buf: &mut AudioBuffer, frame: usize, ctx: &PlayContext) {
        if self.status.is_playing() && self.mode.is_single() && self.read_actions {
            self.restart(buf, frame, ctx);
        }
    }

    /// The sequencer stopped.
    pub fn stop_by_seq(&mut self, buf: &mut AudioBuffer, frame: usize, ctx: &PlayContext) {
        self.quantizing = false;
        if self.status == ChannelStatus::Wait {
            self.status = ChannelStatus::Off;
        } else if self.status.is_playing()
            && ctx.chans_stop_on_seq_halt
            && (self.mode.is_loop() || self.read_actions)
        {
            self.kill(buf, frame);
        }
    }

    /// Replays a recorded action.
    pub fn on_action(
        &mut self,
        buf: &mut AudioBuffer,
        frame: usize,
        kind: ActionKind,
        ctx: &PlayContext,
    ) {
        if !self.read_actions {
            return;
        }
        let single = self.mode.is_single();
        match kind {
            ActionKind::KeyPress if single => match self.status {
                ChannelStatus::Off => self.play(buf, frame, ctx),
                ChannelStatus::Play if self.mode == PlayMode::SingleRetrig => {
                    self.restart(buf, frame, ctx)
                }
                ChannelStatus::Play => self.stop_with_fade(buf, frame, PostFade::HardStop),
                _ => {}
            },
            ActionKind::KeyRelease if self.mode == PlayMode::SinglePress => {
                if self.status == ChannelStatus::Play {
                    self.stop_with_fade(buf, frame, PostFade::HardStop);
                }
            }
            ActionKind::KeyKill if single => self.kill(buf, frame),
            ActionKind::MuteOn => self.set_internal_mute(buf, frame, true),
            ActionKind::MuteOff => self.set_internal_mute(buf, frame, false),
            _ => {}
        }
    }

    /// A key press of this channel was just recorded as an action.
    pub fn on_key_press_recorded(&mut self) {
        if self.mode == PlayMode::SinglePress {
            self.read_actions = false;
        }
    }

    pub fn set_internal_mute(&mut self, buf: &AudioBuffer, frame: usize, mute: bool) {
        let fading_out = self.fade.kind() == FadeKind::FadeOut(PostFade::MuteInternal);
        if mute {
            if self.mute_i || fading_out {
                return;
            }
            if self.status.is_playing() && !self.mute {
                self.fade = Fade::fade_out(
                    frame,
                    self.remaining(frame, buf.frames()),
                    PostFade::MuteInternal,
                );
            } else {
                self.mute_i = true;
            }
        } else {
            if !self.mute_i && !fading_out {
                return;
            }
            self.mute_i = false;
            self.fade = if self.status.is_playing() && !self.mute {
                Fade::fade_in(frame)
            } else {
                Fade::none()
            };
        }
    }

    pub fn toggle_read_actions(&mut self, ctx: &PlayContext) {
        if !self.has_actions {
            return;
        }
        if self.read_actions || self.rec_status == RecStatus::Waiting {
            self.stop_reading_actions(ctx);
        } else {
            self.start_reading_actions(ctx);
        }
    }

    pub fn kill_read_actions(&mut self) {
        self.rec_status = RecStatus::Stopped;
        self.read_actions = false;
    }

    fn start_reading_actions(&mut self, ctx: &PlayContext) {
        if ctx.treat_recs_as_loops {
            self.rec_status = RecStatus::Waiting;
        } else {
            self.rec_status = RecStatus::Reading;
            self.read_actions = true;
        }
    }

    fn stop_reading_actions(&mut self, ctx: &PlayContext) {
        if !ctx.running || !ctx.treat_recs_as_loops {
            self.rec_status = RecStatus::Stopped;
            self.read_actions = false;
            return;
        }
        self.rec_status = match self.rec_status {
            RecStatus::Waiting => RecStatus::Stopped,
            RecStatus::Ending => RecStatus::Reading,
            _ => RecStatus::Ending,
        };
    }

    /// Ends a block: fades, mutes and internal volume.
    pub fn finish(&mut self, buf: &mut AudioBuffer) {
        let frames = buf.frames();
        if (self.mute || self.mute_i) && !self.fade.is_active() {
            buf.clear();
        }

        if self.fade.is_active() {
            let kind = self.fade.kind();
            let start = self.fade.start().min(frames);
            if kind == FadeKind::FadeIn {
                for i in 0..start {
                    buf.set_frame(i, [0.0; CHANNELS]);
                }
            }

            let mut at = start;
            while at < frames {
                let Some(gain) = self.fade.advance() else {
                    break;
                };
                let main = buf.frame(at);
                let tail = self.xbuffer.frame(at);
                let mut out = [0.0; CHANNELS];
                for c in 0..CHANNELS {
                    out[c] = match kind {
                        FadeKind::FadeIn | FadeKind::FadeOut(PostFade::Mute)
                        | FadeKind::FadeOut(PostFade::MuteInternal) => main[c] * gain,
                        FadeKind::FadeOut(_) => main[c] + tail[c] * gain,
                        FadeKind::Crossfade => main[c] * (1.0 - gain) + tail[c] * gain,
                        FadeKind::None => main[c],
                    };
                }
                buf.set_frame(at, out);
                at += 1;
            }

            if self.fade.steps_to_zero() == 0 {
                self.complete_fade(buf, kind, at);
            } else {
                self.fade.next_block();
            }
        }

        if self.volume_i != 1.0 {
            buf.scale(self.volume_i);
        }
    }

    fn complete_fade(&mut self, buf: &mut AudioBuffer, kind: FadeKind, at: usize) {
        match kind {
            FadeKind::FadeOut(PostFade::Mute) => buf.clear_from(at),
            FadeKind::FadeOut(PostFade::MuteInternal) => {
                self.mute_i = true;
                buf.clear_from(at);
            }
            _ => {}
        }
        self.fade = Fade::none();
    }

    fn apply_velocity(&mut self, velocity: f32) {
        if self.velocity_as_vol && self.mode.is_single() {
            self.volume_i = velocity.clamp(0.0, 1.0);
        }
    }

    /// Output frames of material left from buffer frame `frame` on.
    fn remaining(&self, frame: usize, frames: usize) -> usize {
        let ahead = self.end().saturating_sub(self.tracker) as f32 / self.pitch;
        frames.saturating_sub(frame) + ahead as usize
    }

    fn play(&mut self, buf: &mut AudioBuffer, frame: usize, ctx: &PlayContext) {
        self.status = ChannelStatus::Play;
        self.tracker = match self.paused_at.take() {
            Some(paused_at) => paused_at,
            None => self.start_frame(),
        };
        self.resampler.reset(self.ratio());
        buf.clear_from(frame);
        self.fill_from(buf, frame, ctx);
    }

    /// Back to `begin` and refill from `frame`, crossfading unless muted.
    fn restart(&mut self, buf: &mut AudioBuffer, frame: usize, ctx: &PlayContext) {
        if !self.mute && !self.mute_i {
            self.capture_tail(buf, frame);
            self.fade = Fade::crossfade(frame, self.remaining(frame, buf.frames()));
        }
        self.tracker = self.start_frame();
        self.resampler.reset(self.ratio());
        buf.clear_from(frame);
        self.fill_from(buf, frame, ctx);
    }

    /// Stops at `frame`. Unless muted the prefilled audio fades out as a tail.
    fn stop_with_fade(&mut self, buf: &mut AudioBuffer, frame: usize, post: PostFade) {
        if post == PostFade::Pause {
            let behind = ((buf.frames().saturating_sub(frame)) as f32 * self.pitch) as Frame;
            self.paused_at = Some(self.tracker.saturating_sub(behind).max(self.begin()));
        }
        if !self.mute && !self.mute_i && self.status.is_playing() {
            self.capture_tail(buf, frame);
            self.fade = Fade::fade_out(frame, self.remaining(frame, buf.frames()), post);
        }
        let paused_at = self.paused_at;
        self.hard_stop(buf, frame);
        self.paused_at = paused_at;
    }

    fn hard_stop(&mut self, buf: &mut AudioBuffer, frame: usize) {
        self.status = ChannelStatus::Off;
        self.tracker = self.begin();
        self.paused_at = None;
        self.quantizing = false;
        if !self.fade.uses_tail() {
            self.fade = Fade::none();
        }
        self.resampler.reset(self.ratio());
        buf.clear_from(frame);
    }

    fn capture_tail(&mut self, buf: &AudioBuffer, frame: usize) {
        self.xbuffer.set_frames(buf.frames());
        self.xbuffer.clear();
        let frame = frame.min(buf.frames());
        self.xbuffer
            .tail_mut(frame)
            .copy_from_slice(&buf.as_slice()[frame * CHANNELS..]);
        self.xtracker = self.tracker;
        // The tail carries on with the current interpolation history. The
        // main resampler is reset by every caller.
        std::mem::swap(&mut self.resampler, &mut self.xresampler);
    }

    fn fill_tail(&mut self) {
        self.xbuffer.clear();
        let scene = &self.scenes[self.active];
        let Some(wave) = scene.wave.as_deref() else {
            return;
        };
        let fill = fill_buffer(
            wave,
            &mut self.xbuffer,
            self.xtracker,
            scene.end,
            0,
            self.pitch,
            &mut self.xresampler,
        );
        self.xtracker += fill.used;
    }

    /// Fills from `offset` to the end of the block, handling every range end
    /// crossed on the way.
    fn fill_from(&mut self, buf: &mut AudioBuffer, mut offset: usize, ctx: &PlayContext) {
        let frames = buf.frames();
        while offset < frames && self.status.is_playing() {
            let scene = &self.scenes[self.active];
            let Some(wave) = scene.wave.as_deref() else {
                return;
            };
            if scene.begin >= scene.end {
                self.hard_stop(buf, offset);
                return;
            }
            let fill = fill_buffer(
                wave,
                buf,
                self.tracker,
                scene.end,
                offset,
                self.pitch,
                &mut self.resampler,
            );
            self.tracker += fill.used;
            match fill.rewind_offset(offset, frames) {
                Some(rewind) => {
                    offset = rewind;
                    if !self.on_sample_end(buf, offset, ctx) {
                        return;
                    }
                }
                None => return,
            }
        }
    }

    /// The range end was reached at buffer frame `offset`. Returns true if
    /// playback continues from `begin` in the same block.
    ///
    /// Loops only wrap while the sequencer runs. Loop-once modes wait for
    /// the next boundary instead, even when they were ending.
    fn on_sample_end(&mut self, buf: &mut AudioBuffer, offset: usize, ctx: &PlayContext) -> bool {
        let once = matches!(self.mode, PlayMode::LoopOnce | PlayMode::LoopOnceBar);
        match self.status {
            ChannelStatus::Ending if once => {
                self.hard_stop(buf, offset);
                self.status = ChannelStatus::Wait;
                false
            }
            ChannelStatus::Ending => {
                self.hard_stop(buf, offset);
                false
            }
            ChannelStatus::Play if self.mode.is_loop() && !ctx.running => {
                self.hard_stop(buf, offset);
                false
            }
            ChannelStatus::Play if once => {
                self.hard_stop(buf, offset);
                self.status = ChannelStatus::Wait;
                false
            }
            ChannelStatus::Play
                if matches!(
                    self.mode,
                    PlayMode::LoopBasic | PlayMode::LoopRepeat | PlayMode::SingleEndless
                ) =>
            {
                self.tracker = self.begin();
                self.resampler.reset(self.ratio());
                true
            }
            ChannelStatus::Play => {
                self.hard_stop(buf, offset);
                false
            }
            _ => false,
        }
    }
}
