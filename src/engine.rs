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
//! The composition root.
//!
//! [Engine] owns every subsystem: the model store, the command and event
//! queues, the event worker, the MIDI workers and the audio device. All
//! operations live on [Core], which the engine dereferences to and which the
//! event worker shares.
//!
//! Operations fall in three groups. Scalar controls write atomics and never
//! pause playback. Playback and transport operations queue a [Command] for the
//! render thread. Everything that changes the shape of the model is a
//! structural edit through the [ModelStore].

use std::{
    io,
    ops::Deref,
    path::Path,
    sync::{atomic::AtomicU64, Arc},
};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{debug, info, span, warn, Level, Span};

use crate::{
    audio,
    config::{ConfigError, EngineConfig},
    events::{Dispatcher, Event, EventHandler, EventQueue, EventSender},
    midi::{
        self,
        learn::{Binding, ChannelAction, ChannelParam, GlobalAction, GlobalLearn, GlobalParam, Lightning},
        message::MidiMessage,
        sync::SyncMode,
    },
    model::{
        channel::{
            Channel, ChannelId, ChannelKind, ChannelStatus, ChannelType, PlayMode, Scene, MASTER_ID,
            PREVIEW_ID,
        },
        ChannelHandle, Frame, Model, ModelError, ModelStore, Shared,
    },
    mixer::MixerShared,
    render::sample::SamplePlayer,
    sequencer::{SeqStatus, SequencerShared},
    wave::{loader, Wave, WaveError, WaveId},
};

pub mod command;
pub mod midi_io;
pub mod recorder;
pub mod renderer;
mod session;

use command::{Command, CommandSender, QueueFull};
use midi_io::{MidiIo, MIDI_OUT_CAPACITY};
use recorder::{InputStart, Recorder, Take};
use renderer::{MidiOut, Renderer};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("audio device error: {0}")]
    Device(String),
    #[error("MIDI device error: {0}")]
    Midi(String),
    #[error("no channel with id {0}")]
    UnknownChannel(ChannelId),
    #[error("channel {channel} is not a {expected:?} channel")]
    WrongChannelKind {
        channel: ChannelId,
        expected: ChannelType,
    },
    #[error(transparent)]
    Unavailable(#[from] ModelError),
    #[error(transparent)]
    Wave(#[from] WaveError),
    #[error(transparent)]
    QueueFull(#[from] QueueFull),
    #[error("no input device is configured")]
    NoInput,
    #[error("no sample channel is armed for recording")]
    NothingArmed,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// What the next incoming MIDI message gets bound to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LearnTarget {
    Channel(ChannelId, ChannelParam),
    Global(GlobalParam),
}

/// Engine state shared by the caller's thread and the event worker.
pub struct Core {
    config: EngineConfig,
    sample_rate: u32,
    frames: usize,
    has_input: bool,
    store: Arc<ModelStore>,
    shared: Shared,
    commands: CommandSender,
    events: EventSender,
    recorder: Recorder,
    global_learn: ArcSwap<GlobalLearn>,
    learn_target: Mutex<Option<LearnTarget>>,
    midi: Option<Arc<dyn midi::Device>>,
    span: Span,
}

impl Core {
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Frames per render block.
    pub fn buffer_size(&self) -> usize {
        self.frames
    }

    pub fn has_input(&self) -> bool {
        self.has_input
    }

    pub fn store(&self) -> &Arc<ModelStore> {
        &self.store
    }

    pub fn sequencer(&self) -> &SequencerShared {
        &self.shared.sequencer
    }

    pub fn mixer(&self) -> &MixerShared {
        &self.shared.mixer
    }

    pub fn sync_mode(&self) -> SyncMode {
        self.config.midi().sync()
    }

    pub fn handles(&self) -> Arc<Vec<ChannelHandle>> {
        self.store.handles()
    }

    pub fn handle(&self, id: ChannelId) -> Result<ChannelHandle, EngineError> {
        self.store.handle(id).ok_or(EngineError::UnknownChannel(id))
    }

    pub fn status(&self, id: ChannelId) -> Result<ChannelStatus, EngineError> {
        Ok(self.handle(id)?.shared.status())
    }

    pub fn is_running(&self) -> bool {
        self.shared.sequencer.status() == SeqStatus::Running
    }

    // Channels. All structural.

    pub fn add_channel(&self, kind: ChannelType, name: &str) -> Result<ChannelId, EngineError> {
        let frames = self.frames;
        let id = self.store.edit(|model| {
            let id = model.next_channel_id();
            let channel = match kind {
                ChannelType::Sample => Some(Channel::sample(id, name, PlayMode::default(), frames)),
                ChannelType::Midi => Some(Channel::midi(id, name, 0, frames)),
                ChannelType::Group => Some(Channel::group(id, name, frames)),
                ChannelType::Master | ChannelType::Preview => None,
            };
            channel.map(|channel| model.add_channel(channel))
        })?;
        let id = id.ok_or(EngineError::WrongChannelKind {
            channel: 0,
            expected: ChannelType::Sample,
        })?;
        info!(channel = id, kind = ?kind, name, "Added channel.");
        Ok(id)
    }

    pub fn remove_channel(&self, id: ChannelId) -> Result<(), EngineError> {
        let removed = self.store.edit(|model| {
            let removed = model.remove_channel(id);
            model.refresh_has_actions();
            removed
        })?;
        let channel = removed.ok_or(EngineError::UnknownChannel(id))?;
        // Waves the channel held are released by the next collection, which
        // needs the channel gone first.
        drop(channel);
        self.store.edit(|model| model.waves.collect_garbage())?;
        info!(channel = id, "Removed channel.");
        Ok(())
    }

    /// Loads a file into the active scene of a sample channel, or the preview
    /// channel. Decoding happens before the edit. A file that fails to load
    /// leaves the channel MISSING or WRONG and the error is returned.
    pub fn load_wave(&self, id: ChannelId, path: &Path) -> Result<(), EngineError> {
        let _enter = self.span.enter();
        self.expect_sample(id)?;
        let wave_id = self.reserve_wave_id()?;
        match loader::load(path, wave_id, self.sample_rate) {
            Ok(wave) => {
                let frames = wave.frames();
                self.edit_sample_with_wave(id, wave, |player, wave| player.set_wave(Some(wave)))?;
                info!(channel = id, path = %path.display(), frames, "Loaded wave.");
                Ok(())
            }
            Err(e) => {
                let status = ChannelStatus::from(&e);
                warn!(channel = id, err = %e, status = %status, "Unable to load wave.");
                self.edit_sample(id, |player| player.set_error(status))?;
                Err(e.into())
            }
        }
    }

    /// Adds a scene holding the given file. Returns its index.
    pub fn add_scene(&self, id: ChannelId, path: &Path) -> Result<usize, EngineError> {
        self.expect_sample(id)?;
        let wave = loader::load(path, self.reserve_wave_id()?, self.sample_rate)?;
        let index = self.edit_sample_with_wave(id, wave, |player, wave| {
            player.add_scene(Scene::with_wave(wave))
        })?;
        info!(channel = id, scene = index, path = %path.display(), "Added scene.");
        Ok(index)
    }

    /// Switches the active scene. Returns false for an index that doesn't
    /// exist.
    pub fn select_scene(&self, id: ChannelId, index: usize) -> Result<bool, EngineError> {
        self.edit_sample(id, |player| player.set_active_scene(index))
    }

    pub fn set_mode(&self, id: ChannelId, mode: PlayMode) -> Result<(), EngineError> {
        self.edit_sample(id, |player| player.set_mode(mode))
    }

    pub fn set_range(&self, id: ChannelId, begin: Frame, end: Frame) -> Result<(), EngineError> {
        self.edit_sample(id, |player| player.set_range(begin, end))
    }

    pub fn set_shift(&self, id: ChannelId, shift: Frame) -> Result<(), EngineError> {
        self.edit_sample(id, |player| player.set_shift(shift))
    }

    /// Routes a channel through a group channel, or straight to master.
    pub fn set_group(&self, id: ChannelId, group: Option<ChannelId>) -> Result<(), EngineError> {
        if let Some(group) = group {
            if self.handle(group)?.channel_type != ChannelType::Group {
                return Err(EngineError::WrongChannelKind {
                    channel: group,
                    expected: ChannelType::Group,
                });
            }
        }
        self.edit_channel(id, |channel| channel.group = group)
    }

    pub fn set_midi_channel(&self, id: ChannelId, midi_channel: u8) -> Result<(), EngineError> {
        self.store
            .edit(|model| match model.channel_mut(id).map(|channel| &mut channel.kind) {
                Some(ChannelKind::Midi(player)) => {
                    player.set_midi_channel(midi_channel);
                    Ok(())
                }
                Some(_) => Err(EngineError::WrongChannelKind {
                    channel: id,
                    expected: ChannelType::Midi,
                }),
                None => Err(EngineError::UnknownChannel(id)),
            })?
    }

    pub fn set_lightning(&self, id: ChannelId, lightning: Lightning) -> Result<(), EngineError> {
        self.edit_channel(id, |channel| channel.lightning = lightning)
    }

    /// Drops recorded actions of one channel, or of every channel.
    pub fn clear_actions(&self, id: Option<ChannelId>) -> Result<(), EngineError> {
        self.store.edit(|model| {
            match id {
                Some(id) => model.actions.remove_channel(id),
                None => model.actions = Default::default(),
            }
            model.refresh_has_actions();
            for channel in &model.channels {
                channel.publish();
            }
        })?;
        info!(channel = ?id, "Cleared actions.");
        Ok(())
    }

    // Transport settings. Structural, since recorded actions move with them.

    pub fn set_bpm(&self, bpm: f32) -> Result<f32, EngineError> {
        if self.sync_mode() == SyncMode::Slave {
            warn!("Tempo follows the external clock, change ignored.");
            return Ok(self.shared.sequencer.bpm());
        }
        self.apply_bpm(bpm)
    }

    fn apply_bpm(&self, bpm: f32) -> Result<f32, EngineError> {
        let bpm = self.store.edit(|model| {
            model.set_bpm(bpm);
            model.sequencer.bpm()
        })?;
        self.events.send(Event::BpmChanged { bpm });
        Ok(bpm)
    }

    pub fn set_beats(&self, beats: u32, bars: u32) -> Result<(), EngineError> {
        self.store.edit(|model| model.set_beats(beats, bars))?;
        info!(beats, bars, "Loop length changed.");
        Ok(())
    }

    /// Quantize subdivision per beat, 0 to disable.
    pub fn set_quantize(&self, quantize: u32) -> Result<(), EngineError> {
        self.store.edit(|model| model.sequencer.set_quantize(quantize))?;
        Ok(())
    }

    // Scalar controls. Lock free, picked up by the next block.

    pub fn set_volume(&self, id: ChannelId, volume: f32) -> Result<(), EngineError> {
        self.handle(id)?.shared.set_volume(volume);
        Ok(())
    }

    pub fn set_master_volume(&self, volume: f32) -> Result<(), EngineError> {
        self.set_volume(MASTER_ID, volume)
    }

    pub fn set_pan(&self, id: ChannelId, pan: f32) -> Result<(), EngineError> {
        self.handle(id)?.shared.set_pan(pan);
        Ok(())
    }

    pub fn set_pitch(&self, id: ChannelId, pitch: f32) -> Result<(), EngineError> {
        self.handle(id)?.shared.set_pitch(pitch);
        Ok(())
    }

    /// Boost in dB.
    pub fn set_boost(&self, id: ChannelId, db: f32) -> Result<(), EngineError> {
        self.handle(id)?.shared.set_boost_db(db);
        Ok(())
    }

    pub fn set_mute(&self, id: ChannelId, mute: bool) -> Result<(), EngineError> {
        self.handle(id)?.shared.set_mute(mute);
        Ok(())
    }

    /// Solo keeps the mixer's solo count in step.
    pub fn set_solo(&self, id: ChannelId, solo: bool) -> Result<(), EngineError> {
        let handle = self.handle(id)?;
        if handle.shared.swap_solo(solo) != solo {
            if solo {
                self.shared.mixer.add_solo();
            } else {
                self.shared.mixer.remove_solo();
            }
        }
        Ok(())
    }

    pub fn set_armed(&self, id: ChannelId, armed: bool) -> Result<(), EngineError> {
        self.handle(id)?.shared.set_armed(armed);
        Ok(())
    }

    pub fn set_velocity_as_vol(&self, id: ChannelId, enabled: bool) -> Result<(), EngineError> {
        self.handle(id)?.shared.set_velocity_as_vol(enabled);
        Ok(())
    }

    pub fn set_in_volume(&self, volume: f32) {
        self.shared.mixer.set_in_volume(volume);
    }

    pub fn set_in_to_out(&self, enabled: bool) {
        self.shared.mixer.set_in_to_out(enabled);
    }

    pub fn set_metronome(&self, enabled: bool) {
        self.shared.mixer.set_metronome(enabled);
    }

    pub fn set_limit_output(&self, enabled: bool) {
        self.shared.mixer.set_limit_output(enabled);
    }

    // Playback.

    /// `velocity` is in [0, 1] and only matters with velocity as volume.
    pub fn key_press(&self, id: ChannelId, velocity: f32) -> Result<(), EngineError> {
        self.handle(id)?;
        self.commands.send(Command::KeyPress {
            channel: id,
            velocity: velocity.clamp(0.0, 1.0),
            do_quantize: true,
        })?;
        Ok(())
    }

    pub fn key_release(&self, id: ChannelId) -> Result<(), EngineError> {
        self.handle(id)?;
        self.commands.send(Command::KeyRelease { channel: id })?;
        Ok(())
    }

    pub fn kill(&self, id: ChannelId) -> Result<(), EngineError> {
        self.handle(id)?;
        self.commands.send(Command::Kill { channel: id })?;
        Ok(())
    }

    /// Mutes a channel from inside its recorded pass. Recorded as an action
    /// while action recording runs.
    pub fn set_internal_mute(&self, id: ChannelId, mute: bool) -> Result<(), EngineError> {
        self.expect_kind(id, ChannelType::Sample)?;
        self.commands
            .send(Command::SetInternalMute { channel: id, mute })?;
        Ok(())
    }

    pub fn toggle_read_actions(&self, id: ChannelId) -> Result<(), EngineError> {
        self.expect_kind(id, ChannelType::Sample)?;
        self.commands
            .send(Command::ToggleReadActions { channel: id })?;
        Ok(())
    }

    pub fn kill_read_actions(&self, id: ChannelId) -> Result<(), EngineError> {
        self.expect_kind(id, ChannelType::Sample)?;
        self.commands.send(Command::KillReadActions { channel: id })?;
        Ok(())
    }

    /// Loads a file into the preview channel and plays it.
    pub fn preview(&self, path: &Path) -> Result<(), EngineError> {
        self.load_wave(PREVIEW_ID, path)?;
        self.commands.send(Command::KeyPress {
            channel: PREVIEW_ID,
            velocity: 1.0,
            do_quantize: false,
        })?;
        Ok(())
    }

    pub fn stop_preview(&self) -> Result<(), EngineError> {
        self.kill(PREVIEW_ID)
    }

    // Transport. Ignored while following an external clock.

    pub fn start(&self) -> Result<(), EngineError> {
        let _enter = self.span.enter();
        if self.sync_mode() == SyncMode::Slave {
            warn!("Transport follows the external clock, start ignored.");
            return Ok(());
        }
        self.start_transport()
    }

    pub fn stop(&self) -> Result<(), EngineError> {
        let _enter = self.span.enter();
        if self.sync_mode() == SyncMode::Slave {
            warn!("Transport follows the external clock, stop ignored.");
            return Ok(());
        }
        self.stop_transport()
    }

    pub fn rewind(&self) -> Result<(), EngineError> {
        if self.sync_mode() == SyncMode::Slave {
            warn!("Transport follows the external clock, rewind ignored.");
            return Ok(());
        }
        self.commands.send(Command::RewindSequencer)?;
        Ok(())
    }

    fn start_transport(&self) -> Result<(), EngineError> {
        self.events.send(Event::TransportAboutToStart);
        self.commands.send(Command::StartSequencer)?;
        Ok(())
    }

    fn stop_transport(&self) -> Result<(), EngineError> {
        self.events.send(Event::TransportAboutToStop);
        self.commands.send(Command::StopSequencer)?;
        Ok(())
    }

    // Recording.

    pub fn is_action_recording(&self) -> bool {
        self.recorder.is_action_recording()
    }

    /// Starts recording actions, and the transport with it.
    pub fn start_action_rec(&self) -> Result<(), EngineError> {
        self.recorder.start_actions();
        if !self.is_running() {
            self.start()?;
        }
        Ok(())
    }

    /// Stops recording actions and commits them. Returns how many there were.
    pub fn stop_action_rec(&self) -> Result<usize, EngineError> {
        Ok(self.recorder.stop_actions(&self.store)?)
    }

    pub fn is_input_recording(&self) -> bool {
        self.shared.mixer.is_input_recording() || self.shared.mixer.is_signal_armed()
    }

    /// Records the input into every armed sample channel.
    pub fn start_input_rec(&self) -> Result<InputStart, EngineError> {
        if !self.has_input {
            return Err(EngineError::NoInput);
        }
        self.recorder
            .start_input(&self.store, &self.shared.mixer, &self.commands)
    }

    /// Finishes the take and hands it to the armed channels. They start
    /// playing if the transport runs.
    pub fn stop_input_rec(&self) -> Result<Option<Take>, EngineError> {
        let take = self.recorder.finish_input(&self.store, &self.shared.mixer)?;
        if let Some(take) = &take {
            if let Some(bpm) = take.bpm {
                self.events.send(Event::BpmChanged { bpm });
            }
            if take.running {
                for &channel in &take.channels {
                    self.commands.send(Command::KeyPress {
                        channel,
                        velocity: 1.0,
                        do_quantize: false,
                    })?;
                }
            }
        }
        Ok(take)
    }

    // MIDI learn.

    /// Binds the next incoming note or controller to `target`.
    pub fn learn(&self, target: LearnTarget) -> Result<(), EngineError> {
        if let LearnTarget::Channel(id, _) = target {
            self.handle(id)?;
        }
        *self.learn_target.lock() = Some(target);
        info!(learn_target = ?target, "Waiting for a MIDI message to learn.");
        Ok(())
    }

    pub fn cancel_learn(&self) {
        self.learn_target.lock().take();
    }

    pub fn global_learn(&self) -> GlobalLearn {
        GlobalLearn::clone(&self.global_learn.load())
    }

    fn bind(&self, target: LearnTarget, binding: Binding) -> Result<(), EngineError> {
        match target {
            LearnTarget::Global(param) => {
                let mut learn = self.global_learn();
                learn.bind(param, binding);
                self.global_learn.store(Arc::new(learn));
            }
            LearnTarget::Channel(id, param) => {
                self.edit_channel(id, |channel| channel.learn.bind(param, binding))?
            }
        }
        info!(learn_target = ?target, binding = ?binding, "Learned MIDI binding.");
        Ok(())
    }

    fn on_midi_in(&self, message: MidiMessage) -> Result<(), EngineError> {
        let target = self.learn_target.lock().take();
        if let Some(target) = target {
            match Binding::from_message(&message) {
                Some(binding) => return self.bind(target, binding),
                None => {
                    // Not a note or controller. Keep waiting.
                    self.learn_target.lock().get_or_insert(target);
                    return Ok(());
                }
            }
        }

        if let Some(action) = self.global_learn.load().resolve(&message) {
            self.apply_global(action)?;
        }
        for handle in self.store.handles().iter() {
            if let Some(action) = handle.learn.resolve(&message) {
                self.apply_channel(handle, action)?;
            }
        }
        Ok(())
    }

    fn apply_global(&self, action: GlobalAction) -> Result<(), EngineError> {
        debug!(action = ?action, "Global MIDI action.");
        match action {
            GlobalAction::StartStop if self.is_running() => self.stop(),
            GlobalAction::StartStop => self.start(),
            GlobalAction::Rewind => self.rewind(),
            GlobalAction::ToggleActionRec if self.is_action_recording() => {
                self.stop_action_rec().map(|_| ())
            }
            GlobalAction::ToggleActionRec => self.start_action_rec(),
            GlobalAction::ToggleInputRec if self.is_input_recording() => {
                self.stop_input_rec().map(|_| ())
            }
            GlobalAction::ToggleInputRec => self.start_input_rec().map(|_| ()),
            GlobalAction::ToggleMetronome => {
                self.set_metronome(!self.shared.mixer.metronome());
                Ok(())
            }
            GlobalAction::VolumeOut(volume) => self.set_master_volume(volume),
            GlobalAction::VolumeIn(volume) => {
                self.set_in_volume(volume);
                Ok(())
            }
        }
    }

    fn apply_channel(&self, handle: &ChannelHandle, action: ChannelAction) -> Result<(), EngineError> {
        debug!(channel = handle.id, action = ?action, "Channel MIDI action.");
        let id = handle.id;
        let shared = &handle.shared;
        match action {
            ChannelAction::KeyPress { velocity } => self.key_press(id, velocity),
            ChannelAction::KeyRelease => self.key_release(id),
            ChannelAction::Kill => self.kill(id),
            ChannelAction::ToggleMute => self.set_mute(id, !shared.is_muted()),
            ChannelAction::ToggleSolo => self.set_solo(id, !shared.is_soloed()),
            ChannelAction::ToggleArm => self.set_armed(id, !shared.is_armed()),
            ChannelAction::Volume(volume) => self.set_volume(id, volume),
            ChannelAction::Pitch(pitch) => self.set_pitch(id, pitch),
            ChannelAction::ToggleReadActions => self.toggle_read_actions(id),
        }
    }

    // Events, on the event worker.

    fn on_event(&self, event: Event) -> Result<(), EngineError> {
        match event {
            Event::ChannelStatusChanged { channel, status } => {
                debug!(channel, status = %status, "Channel status changed.");
                self.send_lightning(channel, status);
            }
            Event::ActionRecorded(action) => self.recorder.on_action(&self.store, action)?,
            Event::SignalThresholdReached => {
                self.recorder.on_signal(&self.shared.mixer, &self.commands)?
            }
            Event::EndOfRecording => {
                info!("Input take is full.");
                self.stop_input_rec()?;
            }
            Event::BpmChanged { bpm } => info!(bpm, "Tempo changed."),
            Event::TransportAboutToStart => debug!("Transport starting."),
            Event::TransportAboutToStop => debug!("Transport stopping."),
            Event::MidiClockStart => self.start_transport()?,
            Event::MidiClockStop => self.stop_transport()?,
            Event::MidiClockChangeBpm { bpm } => {
                self.apply_bpm(bpm)?;
            }
            Event::MidiClockChangePosition { sixteenths } => {
                let sequencer = &self.shared.sequencer;
                let beat = sequencer.frames_in_loop() / sequencer.beats().max(1) as usize;
                let frame = sixteenths as usize * beat / 4;
                self.commands.send(Command::SetPosition { frame })?;
            }
            Event::MidiIn(message) => self.on_midi_in(message)?,
        }
        Ok(())
    }

    fn send_lightning(&self, id: ChannelId, status: ChannelStatus) {
        let Some(device) = &self.midi else {
            return;
        };
        let Some(message) = self
            .store
            .handle(id)
            .and_then(|handle| handle.lightning.for_status(status))
        else {
            return;
        };
        if let Err(e) = device.send(message.as_bytes()) {
            warn!(channel = id, err = %e, "Unable to send lightning.");
        }
    }

    // Helpers.

    /// Ids come from the model's wave store so files can be decoded outside
    /// an edit.
    fn reserve_wave_id(&self) -> Result<WaveId, EngineError> {
        Ok(self.store.edit(|model| model.waves.next_id())?)
    }

    fn expect_kind(&self, id: ChannelId, expected: ChannelType) -> Result<ChannelHandle, EngineError> {
        let handle = self.handle(id)?;
        if handle.channel_type != expected {
            return Err(EngineError::WrongChannelKind {
                channel: id,
                expected,
            });
        }
        Ok(handle)
    }

    /// Sample and preview channels both hold a sample player.
    fn expect_sample(&self, id: ChannelId) -> Result<(), EngineError> {
        match self.handle(id)?.channel_type {
            ChannelType::Sample | ChannelType::Preview => Ok(()),
            _ => Err(EngineError::WrongChannelKind {
                channel: id,
                expected: ChannelType::Sample,
            }),
        }
    }

    fn edit_channel<R>(
        &self,
        id: ChannelId,
        f: impl FnOnce(&mut Channel) -> R,
    ) -> Result<R, EngineError> {
        self.store
            .edit(|model| model.channel_mut(id).map(f))?
            .ok_or(EngineError::UnknownChannel(id))
    }

    fn edit_sample<R>(
        &self,
        id: ChannelId,
        f: impl FnOnce(&mut SamplePlayer) -> R,
    ) -> Result<R, EngineError> {
        self.store.edit(|model| sample_edit(model, id, f))?
    }

    /// Inserts `wave` into the store and hands it to the channel's player.
    /// Waves no longer referenced afterwards are released.
    fn edit_sample_with_wave<R>(
        &self,
        id: ChannelId,
        wave: Wave,
        f: impl FnOnce(&mut SamplePlayer, Arc<Wave>) -> R,
    ) -> Result<R, EngineError> {
        self.store.edit(|model| {
            let wave = model.waves.insert(wave);
            let result = sample_edit(model, id, |player| f(player, wave));
            model.waves.collect_garbage();
            result
        })?
    }
}

fn sample_edit<R>(
    model: &mut Model,
    id: ChannelId,
    f: impl FnOnce(&mut SamplePlayer) -> R,
) -> Result<R, EngineError> {
    let channel = model
        .channel_mut(id)
        .ok_or(EngineError::UnknownChannel(id))?;
    let player = channel
        .sample_player_mut()
        .ok_or(EngineError::WrongChannelKind {
            channel: id,
            expected: ChannelType::Sample,
        })?;
    let result = f(player);
    channel.publish();
    Ok(result)
}

/// Runs events on the event worker.
struct Handler {
    core: Arc<Core>,
}

impl EventHandler for Handler {
    fn handle(&mut self, event: Event) {
        if let Err(e) = self.core.on_event(event) {
            warn!(err = %e, event = ?event, "Unable to handle event.");
        }
    }
}

/// The running engine.
pub struct Engine {
    core: Arc<Core>,
    audio: Arc<dyn audio::Device>,
    midi_io: Option<MidiIo>,
    dispatcher: Dispatcher,
    stopped: bool,
}

impl Deref for Engine {
    type Target = Core;

    fn deref(&self) -> &Core {
        &self.core
    }
}

impl Engine {
    /// Opens the configured devices and starts the engine.
    pub fn from_config(config: EngineConfig) -> Result<Engine, EngineError> {
        let audio =
            audio::get_device(config.audio()).map_err(|e| EngineError::Device(e.to_string()))?;
        let midi = config
            .midi()
            .device()
            .map(midi::get_device)
            .transpose()
            .map_err(|e| EngineError::Midi(e.to_string()))?;
        Engine::new(config, audio, midi)
    }

    /// Starts the engine on the given devices. The calling thread must be
    /// registered and not realtime.
    pub fn new(
        config: EngineConfig,
        audio: Arc<dyn audio::Device>,
        midi: Option<Arc<dyn midi::Device>>,
    ) -> Result<Engine, EngineError> {
        config.validate()?;
        let span = span!(Level::INFO, "engine");
        let _enter = span.enter();

        let sample_rate = audio.sample_rate();
        let frames = audio.buffer_size();
        let behaviors = config.behaviors();
        let shared = Shared::default();
        shared.mixer.set_metronome(behaviors.metronome);
        shared.mixer.set_limit_output(behaviors.limit_output);
        shared
            .mixer
            .set_rec_trigger_level(behaviors.rec_trigger_level);

        let model = Model::new(sample_rate, frames, behaviors, &shared);
        let store = Arc::new(ModelStore::new(model));
        let (commands, receiver) = command::queue();
        let queue = EventQueue::new();
        let recorder = Recorder::new();
        let recording = recorder.shared();
        let sync = config.midi().sync();
        let mtc_fps = config.midi().mtc_fps();

        let core = Arc::new(Core {
            global_learn: ArcSwap::from_pointee(config.midi().learn()),
            config,
            sample_rate,
            frames,
            has_input: audio.has_input(),
            store: store.clone(),
            shared,
            commands,
            events: queue.sender(),
            recorder,
            learn_target: Mutex::new(None),
            midi: midi.clone(),
            span: span.clone(),
        });

        let (rt_events, dispatcher) = queue.spawn(Box::new(Handler { core: core.clone() }))?;

        let (midi_producer, midi_consumer) = rtrb::RingBuffer::new(MIDI_OUT_CAPACITY);
        let midi_dropped = Arc::new(AtomicU64::new(0));
        let midi_io = match midi {
            Some(device) => Some(MidiIo::start(
                device,
                midi_consumer,
                midi_dropped.clone(),
                sync,
                core.events.clone(),
            )?),
            None => None,
        };

        let mut renderer = Renderer::new(
            store,
            receiver,
            rt_events,
            MidiOut::new(midi_producer, midi_dropped),
            sync,
            recording,
        )
        .with_timecode_fps(mtc_fps);
        audio
            .start(Box::new(move |out, input| renderer.process(out, input)))
            .map_err(|e| EngineError::Device(e.to_string()))?;

        info!(
            device = audio.name(),
            sample_rate,
            frames,
            input = core.has_input,
            sync = ?sync,
            "Engine started."
        );
        Ok(Engine {
            core,
            audio,
            midi_io,
            dispatcher,
            stopped: false,
        })
    }

    pub fn audio(&self) -> &Arc<dyn audio::Device> {
        &self.audio
    }

    pub fn midi(&self) -> Option<&Arc<dyn midi::Device>> {
        self.midi_io.as_ref().map(MidiIo::device)
    }

    /// Stops audio, then the MIDI workers, then the event worker.
    pub fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        let _enter = self.core.span.enter();
        self.audio.stop();
        if let Some(mut midi_io) = self.midi_io.take() {
            midi_io.stop();
        }
        self.dispatcher.stop();
        info!("Engine stopped.");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
