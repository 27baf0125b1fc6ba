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
//! Action and input recording. The render thread only flags what happened;
//! everything that allocates or edits the model happens here, on the event
//! worker or the caller's thread.

use std::{
    mem,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tracing::{debug, info};

use super::{
    command::{Command, CommandSender},
    EngineError,
};
use crate::{
    config::RecTriggerMode,
    mixer::{input::Capture, input::InputRecMode, MixerShared},
    model::{
        actions::Action,
        channel::{Channel, ChannelId, ChannelKind, ChannelType, RecStatus},
        Model, ModelError, ModelStore,
    },
    sequencer::{MAX_BPM, MIN_BPM},
    wave::Wave,
};

/// Recording flags the render thread reads.
#[derive(Debug, Default)]
pub struct RecorderShared {
    action_recording: AtomicBool,
}

impl RecorderShared {
    pub fn is_action_recording(&self) -> bool {
        self.action_recording.load(Ordering::Acquire)
    }

    pub fn set_action_recording(&self, recording: bool) {
        self.action_recording.store(recording, Ordering::Release)
    }
}

/// How an input take started.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputStart {
    Recording,
    /// Waiting for the input to cross the trigger level.
    WaitingForSignal,
}

/// A finished input take.
#[derive(Clone, Debug, PartialEq)]
pub struct Take {
    pub frames: usize,
    /// Armed channels that received the take.
    pub channels: Vec<ChannelId>,
    /// The tempo derived from a free take.
    pub bpm: Option<f32>,
    /// The transport was running when the take was assigned.
    pub running: bool,
}

pub struct Recorder {
    shared: Arc<RecorderShared>,
    pending: Mutex<Vec<Action>>,
}

impl Default for Recorder {
    fn default() -> Recorder {
        Recorder::new()
    }
}

impl Recorder {
    pub fn new() -> Recorder {
        Recorder {
            shared: Arc::new(RecorderShared::default()),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn shared(&self) -> Arc<RecorderShared> {
        self.shared.clone()
    }

    pub fn is_action_recording(&self) -> bool {
        self.shared.is_action_recording()
    }

    pub fn start_actions(&self) {
        self.shared.set_action_recording(true);
        info!("Action recording started.");
    }

    /// Takes an action the render thread recorded. Actions that arrive after
    /// recording stopped are committed on their own.
    pub fn on_action(&self, store: &ModelStore, action: Action) -> Result<(), ModelError> {
        {
            // The flag is only cleared under this lock.
            let mut pending = self.pending.lock();
            if self.shared.is_action_recording() {
                pending.push(action);
                return Ok(());
            }
        }
        debug!(channel = action.channel, frame = action.frame, "Late action.");
        store.edit(|model| commit(model, &[action]))
    }

    /// Stops recording and commits everything collected in one edit.
    /// Returns how many actions were committed.
    pub fn stop_actions(&self, store: &ModelStore) -> Result<usize, ModelError> {
        let pending = {
            let mut pending = self.pending.lock();
            self.shared.set_action_recording(false);
            mem::take(&mut *pending)
        };
        if pending.is_empty() {
            info!("Action recording stopped, nothing recorded.");
            return Ok(0);
        }
        store.edit(|model| commit(model, &pending))?;
        info!(actions = pending.len(), "Action recording committed.");
        Ok(pending.len())
    }

    /// Installs a take buffer and starts recording, or arms the signal
    /// trigger. Needs at least one armed sample channel.
    pub fn start_input(
        &self,
        store: &ModelStore,
        mixer: &MixerShared,
        commands: &CommandSender,
    ) -> Result<InputStart, EngineError> {
        let armed = store
            .handles()
            .iter()
            .any(|handle| handle.channel_type == ChannelType::Sample && handle.shared.is_armed());
        if !armed {
            return Err(EngineError::NothingArmed);
        }

        let (mode, trigger, frames, running) = store.read(|model| {
            let mode = model.behaviors.input_rec_mode;
            let frames = match mode {
                InputRecMode::Rigid => model.sequencer.frames_in_loop(),
                InputRecMode::Free => model.sequencer.max_frames_in_loop(model.sample_rate()),
            };
            (
                mode,
                model.behaviors.rec_trigger_mode,
                frames,
                model.sequencer.is_running(),
            )
        })?;

        // Allocated here so the edit itself stays short.
        let capture = Capture::new(mode, frames);
        let old = store.edit(|model| model.mixer.set_capture(capture))?;
        drop(old);

        if trigger == RecTriggerMode::Signal && !running {
            mixer.arm_signal(true);
            commands.send(Command::WaitSequencer)?;
            info!(mode = ?mode, frames, "Input recording waits for a signal.");
            return Ok(InputStart::WaitingForSignal);
        }

        mixer.set_input_recording(true);
        if !running {
            commands.send(Command::StartSequencer)?;
        }
        info!(mode = ?mode, frames, "Input recording started.");
        Ok(InputStart::Recording)
    }

    /// The armed signal trigger fired.
    pub fn on_signal(&self, mixer: &MixerShared, commands: &CommandSender) -> Result<(), EngineError> {
        mixer.set_input_recording(true);
        commands.send(Command::StartSequencer)?;
        info!("Input signal reached, recording.");
        Ok(())
    }

    /// Stops recording and hands the take to every armed sample channel as
    /// one shared wave. Returns None if nothing was recorded.
    pub fn finish_input(
        &self,
        store: &ModelStore,
        mixer: &MixerShared,
    ) -> Result<Option<Take>, EngineError> {
        mixer.set_input_recording(false);
        mixer.arm_signal(false);

        let taken = store.edit(|model| {
            let capture = model.mixer.take_capture()?;
            let id = model.waves.next_id();
            Some((
                capture,
                id,
                model.sample_rate(),
                model.sequencer.beats(),
            ))
        })?;
        let Some((capture, id, rate, beats)) = taken else {
            debug!("No input take installed.");
            return Ok(None);
        };

        let mode = capture.mode();
        let frames = capture.written();
        if frames == 0 {
            info!("Input take is empty, discarded.");
            return Ok(None);
        }
        let bpm = (mode == InputRecMode::Free).then(|| {
            (rate as f32 * 60.0 * beats as f32 / frames as f32).clamp(MIN_BPM, MAX_BPM)
        });
        let wave = Wave::logical(id, capture.into_samples(), rate);

        let (channels, running) = store.edit(|model| {
            if let Some(bpm) = bpm {
                model.set_bpm(bpm);
            }
            let wave = model.waves.insert(wave);
            let mut channels = Vec::new();
            for channel in model.channels.iter_mut() {
                if !channel.shared.is_armed() {
                    continue;
                }
                if let ChannelKind::Sample(player) = &mut channel.kind {
                    player.set_wave(Some(wave.clone()));
                    channels.push(channel.id);
                }
            }
            model.waves.collect_garbage();
            (channels, model.sequencer.is_running())
        })?;

        info!(
            frames,
            channels = channels.len(),
            bpm = ?bpm,
            "Input take assigned."
        );
        Ok(Some(Take {
            frames,
            channels,
            bpm,
            running,
        }))
    }
}

/// Records actions and turns action reading on for the channels involved.
fn commit(model: &mut Model, actions: &[Action]) {
    for action in actions {
        model.actions.record(*action);
    }
    model.refresh_has_actions();

    let ctx = model.play_context();
    let mut touched: Vec<ChannelId> = actions.iter().map(|action| action.channel).collect();
    touched.sort_unstable();
    touched.dedup();
    for id in touched {
        if let Some(player) = model.channel_mut(id).and_then(Channel::sample_player_mut) {
            if player.rec_status() == RecStatus::Stopped && !player.is_reading_actions() {
                player.toggle_read_actions(&ctx);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Behaviors,
        engine::command,
        model::{actions::ActionKind, channel::PlayMode, Shared},
        testutil,
    };

    fn store_with(behaviors: Behaviors) -> (ModelStore, ChannelId, Arc<MixerShared>) {
        let shared = Shared::default();
        let mut model = Model::new(4800, 64, behaviors, &shared);
        let id = model.next_channel_id();
        model.add_channel(Channel::sample(id, "take", PlayMode::LoopBasic, 64));
        (ModelStore::new(model), id, shared.mixer)
    }

    #[test]
    fn test_actions_commit_on_stop() {
        testutil::register_main();
        let (store, id, _) = store_with(Behaviors::default());
        let recorder = Recorder::new();
        let action = Action {
            channel: id,
            frame: 100,
            kind: ActionKind::KeyPress,
        };

        recorder.start_actions();
        assert!(recorder.shared().is_action_recording());
        recorder.on_action(&store, action).unwrap();
        assert_eq!(store.read(|model| model.actions.len()).unwrap(), 0);

        assert_eq!(recorder.stop_actions(&store).unwrap(), 1);
        assert!(!recorder.is_action_recording());
        let (actions, has_actions) = store
            .read(|model| {
                let player = model.channel(id).and_then(Channel::sample_player);
                (
                    model.actions.at(100).to_vec(),
                    player.map(|player| player.has_actions()),
                )
            })
            .unwrap();
        assert_eq!(actions, vec![action]);
        assert_eq!(has_actions, Some(true));
    }

    #[test]
    fn test_late_actions_commit_directly() {
        testutil::register_main();
        let (store, id, _) = store_with(Behaviors::default());
        let recorder = Recorder::new();
        recorder
            .on_action(
                &store,
                Action {
                    channel: id,
                    frame: 5,
                    kind: ActionKind::MuteOn,
                },
            )
            .unwrap();
        assert_eq!(store.read(|model| model.actions.len()).unwrap(), 1);
        assert_eq!(recorder.stop_actions(&store).unwrap(), 0);
    }

    #[test]
    fn test_input_needs_an_armed_channel() {
        testutil::register_main();
        let (store, _, mixer) = store_with(Behaviors::default());
        let (commands, _receiver) = command::queue();
        let result = Recorder::new().start_input(&store, &mixer, &commands);
        assert!(matches!(result, Err(EngineError::NothingArmed)));
    }

    #[test]
    fn test_signal_trigger_waits() {
        testutil::register_main();
        let behaviors = Behaviors {
            rec_trigger_mode: RecTriggerMode::Signal,
            ..Behaviors::default()
        };
        let (store, id, mixer) = store_with(behaviors);
        store.handle(id).unwrap().shared.set_armed(true);
        let (commands, mut receiver) = command::queue();
        let recorder = Recorder::new();

        let start = recorder.start_input(&store, &mixer, &commands).unwrap();
        assert_eq!(start, InputStart::WaitingForSignal);
        assert!(mixer.is_signal_armed());
        assert!(!mixer.is_input_recording());
        assert_eq!(receiver.recv(), Some(Command::WaitSequencer));

        recorder.on_signal(&mixer, &commands).unwrap();
        assert!(mixer.is_input_recording());
        assert_eq!(receiver.recv(), Some(Command::StartSequencer));
    }

    #[test]
    fn test_free_take_sets_the_tempo() {
        testutil::register_main();
        let behaviors = Behaviors {
            input_rec_mode: InputRecMode::Free,
            ..Behaviors::default()
        };
        let (store, id, mixer) = store_with(behaviors);
        store.handle(id).unwrap().shared.set_armed(true);
        let (commands, _receiver) = command::queue();
        let recorder = Recorder::new();
        recorder.start_input(&store, &mixer, &commands).unwrap();
        assert!(mixer.is_input_recording());

        // Two seconds of input at 4800 Hz over four beats is 120 BPM.
        store
            .edit(|model| {
                let mut capture = model.mixer.take_capture().unwrap();
                let block = crate::audio::buffer::AudioBuffer::from_interleaved(
                    testutil::audio_test_utils::stereo_dc(0.25, 9600),
                );
                capture.write(&block, |offset| offset);
                model.mixer.set_capture(capture);
            })
            .unwrap();

        let take = recorder.finish_input(&store, &mixer).unwrap().unwrap();
        assert_eq!(take.frames, 9600);
        assert_eq!(take.channels, vec![id]);
        assert_eq!(take.bpm, Some(120.0));
        assert!(!take.running);
        assert!(!mixer.is_input_recording());

        let (bpm, frames, logical) = store
            .read(|model| {
                let wave = model
                    .channel(id)
                    .and_then(Channel::sample_player)
                    .and_then(|player| player.wave().cloned());
                (
                    model.sequencer.bpm(),
                    wave.as_ref().map(|wave| wave.frames()),
                    wave.as_ref().map(|wave| wave.is_logical()),
                )
            })
            .unwrap();
        assert_eq!(bpm, 120.0);
        assert_eq!(frames, Some(9600));
        assert_eq!(logical, Some(true));
        assert!(recorder.finish_input(&store, &mixer).unwrap().is_none());
    }
}
