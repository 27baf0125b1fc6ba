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
//! The render callback.
//!
//! One call renders one device block. The model is taken from the store for
//! the whole call and put back at the end; if it isn't there, because an edit
//! holds it, the block is silent. Nothing in here blocks, allocates or logs.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use super::{
    command::{Command, CommandReceiver},
    recorder::RecorderShared,
};
use crate::{
    audio::buffer::CHANNELS,
    events::{Event, EventSink},
    midi::{
        message::MidiMessage,
        sync::{ClockMaster, MtcFps, SyncMode, TimecodeMaster},
    },
    model::{
        actions::{Action, ActionKind},
        channel::{Channel, ChannelId, ChannelKind, PlayMode},
        Frame, Model, ModelStore,
    },
    render::PlayContext,
    sequencer::{metronome::Click, SeqEvent, Sequencer, EVENTS_CAPACITY},
};

/// Outbound MIDI from the render thread. Messages that don't fit are counted
/// and dropped.
pub struct MidiOut {
    producer: rtrb::Producer<MidiMessage>,
    dropped: Arc<AtomicU64>,
}

impl MidiOut {
    pub fn new(producer: rtrb::Producer<MidiMessage>, dropped: Arc<AtomicU64>) -> MidiOut {
        MidiOut { producer, dropped }
    }

    fn send(&mut self, message: MidiMessage) {
        if self.producer.push(message).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn send_opt(&mut self, message: Option<MidiMessage>) {
        if let Some(message) = message {
            self.send(message);
        }
    }
}

pub struct Renderer<E: EventSink> {
    store: Arc<ModelStore>,
    commands: CommandReceiver,
    events: E,
    midi: MidiOut,
    sync: SyncMode,
    clock: ClockMaster,
    timecode: TimecodeMaster,
    recorder: Arc<RecorderShared>,
    seq_events: Vec<SeqEvent>,
}

impl<E: EventSink> Renderer<E> {
    pub fn new(
        store: Arc<ModelStore>,
        commands: CommandReceiver,
        events: E,
        midi: MidiOut,
        sync: SyncMode,
        recorder: Arc<RecorderShared>,
    ) -> Renderer<E> {
        Renderer {
            store,
            commands,
            events,
            midi,
            sync,
            clock: ClockMaster::default(),
            timecode: TimecodeMaster::default(),
            recorder,
            seq_events: Vec::with_capacity(EVENTS_CAPACITY),
        }
    }

    /// Frame rate of the timecode sent in MTC master mode.
    pub fn with_timecode_fps(mut self, fps: MtcFps) -> Renderer<E> {
        self.timecode = TimecodeMaster::new(fps);
        self
    }

    /// Renders interleaved stereo `out`. `input`, when present, has the same
    /// layout and length.
    pub fn process(&mut self, out: &mut [f32], input: Option<&[f32]>) {
        let Some(mut model) = self.store.acquire() else {
            out.fill(0.0);
            return;
        };

        let block = model.frames();
        let frames = out.len() / CHANNELS;
        if block == 0 {
            out.fill(0.0);
        }
        let mut at = 0;
        while block > 0 && at < frames {
            let n = (frames - at).min(block);
            let range = at * CHANNELS..(at + n) * CHANNELS;
            let input = input.and_then(|input| input.get(range.clone()));
            self.render_block(&mut model, n, input);
            out[range].copy_from_slice(model.mixer.output().as_slice());
            at += n;
        }

        self.store.release(model);
    }

    fn render_block(&mut self, model: &mut Model, frames: usize, input: Option<&[f32]>) {
        let mut ctx = model.play_context();

        for channel in model.channels.iter_mut() {
            channel.controls = channel.shared.controls();
            channel.buffer.set_frames(frames);
        }
        model.mixer.begin(frames);
        for channel in model.channels.iter_mut() {
            match &mut channel.kind {
                ChannelKind::Sample(player) | ChannelKind::Preview(player) => {
                    player.prepare(&mut channel.buffer, &channel.controls, &ctx)
                }
                ChannelKind::Master | ChannelKind::Group => channel.buffer.clear(),
                ChannelKind::Midi(_) => {}
            }
        }

        if model.mixer.read_input(input) {
            self.events.push(Event::SignalThresholdReached);
        }

        while let Some(command) = self.commands.recv() {
            self.apply(model, command, &mut ctx);
        }

        self.seq_events.clear();
        self.seq_events
            .extend_from_slice(model.sequencer.advance(frames, &model.actions));
        for index in 0..self.seq_events.len() {
            let event = self.seq_events[index];
            self.on_seq_event(model, event, &ctx);
        }

        for channel in model.channels.iter_mut() {
            self.finish_channel(channel);
        }

        model.mixer.sum(&mut model.channels);
        let (master, preview) = (&model.channels[0], &model.channels[1]);
        model.mixer.finish(&master.controls, preview);

        let sequencer = &model.sequencer;
        if model.mixer.capture(|offset| sequencer.frame_at(offset)) {
            self.events.push(Event::EndOfRecording);
        }

        let midi = &mut self.midi;
        match self.sync {
            SyncMode::Master => {
                self.clock
                    .process(&model.sequencer, frames, |message| midi.send(message))
            }
            SyncMode::MtcMaster => {
                self.timecode
                    .process(&model.sequencer, frames, |message| midi.send(message))
            }
            SyncMode::None | SyncMode::Slave => {}
        }
    }

    fn recording_actions(&self, sequencer: &Sequencer) -> bool {
        sequencer.is_running() && self.recorder.is_action_recording()
    }

    fn record(&mut self, channel: ChannelId, frame: Frame, kind: ActionKind) {
        self.events.push(Event::ActionRecorded(Action {
            channel,
            frame,
            kind,
        }));
    }

    /// Applies one command at the start of the block, before the transport
    /// advances.
    fn apply(&mut self, model: &mut Model, command: Command, ctx: &mut PlayContext) {
        match command {
            Command::KeyPress {
                channel,
                velocity,
                do_quantize,
            } => {
                let recording = self.recording_actions(&model.sequencer);
                let frame = model.sequencer.current_frame();
                let Some(channel) = model.channel_mut(channel) else {
                    return;
                };
                match &mut channel.kind {
                    ChannelKind::Sample(player) => {
                        player.start(&mut channel.buffer, 0, do_quantize, velocity, ctx);
                        // A quantized press is recorded when it fires.
                        if recording && player.mode().is_single() && !player.is_quantizing() {
                            player.on_key_press_recorded();
                            self.record(channel.id, frame, ActionKind::KeyPress);
                        }
                    }
                    ChannelKind::Preview(player) => {
                        player.start(&mut channel.buffer, 0, false, velocity, ctx)
                    }
                    ChannelKind::Midi(player) => player.key_press(),
                    ChannelKind::Master | ChannelKind::Group => {}
                }
            }
            Command::KeyRelease { channel } => {
                let recording = self.recording_actions(&model.sequencer);
                let frame = model.sequencer.current_frame();
                let Some(channel) = model.channel_mut(channel) else {
                    return;
                };
                if let ChannelKind::Sample(player) | ChannelKind::Preview(player) =
                    &mut channel.kind
                {
                    let playing = player.status().is_playing();
                    player.stop(&mut channel.buffer, 0);
                    if recording && playing && player.mode() == PlayMode::SinglePress {
                        self.record(channel.id, frame, ActionKind::KeyRelease);
                    }
                }
            }
            Command::Kill { channel } => {
                let recording = self.recording_actions(&model.sequencer);
                let frame = model.sequencer.current_frame();
                let Some(channel) = model.channel_mut(channel) else {
                    return;
                };
                match &mut channel.kind {
                    ChannelKind::Sample(player) => {
                        player.kill(&mut channel.buffer, 0);
                        if recording && player.mode().is_single() {
                            self.record(channel.id, frame, ActionKind::KeyKill);
                        }
                    }
                    ChannelKind::Preview(player) => player.kill(&mut channel.buffer, 0),
                    ChannelKind::Midi(player) => self.midi.send_opt(player.kill()),
                    ChannelKind::Master | ChannelKind::Group => {}
                }
            }
            Command::SetInternalMute { channel, mute } => {
                let recording = self.recording_actions(&model.sequencer);
                let frame = model.sequencer.current_frame();
                let Some(channel) = model.channel_mut(channel) else {
                    return;
                };
                if let ChannelKind::Sample(player) = &mut channel.kind {
                    player.set_internal_mute(&channel.buffer, 0, mute);
                    if recording {
                        let kind = if mute {
                            ActionKind::MuteOn
                        } else {
                            ActionKind::MuteOff
                        };
                        self.record(channel.id, frame, kind);
                    }
                }
            }
            Command::ToggleReadActions { channel } => {
                if let Some(player) = model
                    .channel_mut(channel)
                    .and_then(Channel::sample_player_mut)
                {
                    player.toggle_read_actions(ctx);
                }
            }
            Command::KillReadActions { channel } => {
                if let Some(player) = model
                    .channel_mut(channel)
                    .and_then(Channel::sample_player_mut)
                {
                    player.kill_read_actions();
                }
            }
            Command::StartSequencer => {
                model.sequencer.start();
                ctx.running = true;
            }
            Command::StopSequencer => {
                model.sequencer.stop();
                ctx.running = false;
                for channel in model.channels.iter_mut() {
                    match &mut channel.kind {
                        ChannelKind::Sample(player) => {
                            player.stop_by_seq(&mut channel.buffer, 0, ctx)
                        }
                        ChannelKind::Midi(player) => self.midi.send_opt(player.stop_by_seq()),
                        _ => {}
                    }
                }
            }
            Command::RewindSequencer => model.sequencer.rewind(),
            Command::WaitSequencer => {
                if !model.sequencer.is_running() {
                    model.sequencer.set_waiting();
                }
            }
            Command::SetPosition { frame } => model.sequencer.set_position(frame),
        }
    }

    fn on_seq_event(&mut self, model: &mut Model, event: SeqEvent, ctx: &PlayContext) {
        match event {
            SeqEvent::Quantize { offset } => {
                let recording = self.recording_actions(&model.sequencer);
                let frame = model.sequencer.frame_at(offset);
                for channel in model.channels.iter_mut() {
                    if let ChannelKind::Sample(player) = &mut channel.kind {
                        let fired = player.quantize(&mut channel.buffer, offset, ctx);
                        if fired && recording && player.mode().is_single() {
                            player.on_key_press_recorded();
                            self.record(channel.id, frame, ActionKind::KeyPress);
                        }
                    }
                }
            }
            SeqEvent::FirstBeat { offset } => {
                for channel in model.channels.iter_mut() {
                    match &mut channel.kind {
                        ChannelKind::Sample(player) => {
                            player.on_first_beat(&mut channel.buffer, offset, ctx)
                        }
                        ChannelKind::Midi(player) => self.midi.send_opt(player.on_first_beat()),
                        _ => {}
                    }
                }
            }
            SeqEvent::Bar { offset } => {
                for channel in model.channels.iter_mut() {
                    if let ChannelKind::Sample(player) = &mut channel.kind {
                        player.on_bar(&mut channel.buffer, offset, ctx);
                    }
                }
            }
            SeqEvent::Beat { offset, beat } => {
                let click = if model.sequencer.is_bar(beat) {
                    Click::Tick
                } else {
                    Click::Tock
                };
                model.mixer.click(offset, click);
            }
            SeqEvent::Rewind { offset } => {
                for channel in model.channels.iter_mut() {
                    match &mut channel.kind {
                        ChannelKind::Sample(player) => {
                            player.rewind_by_seq(&mut channel.buffer, offset, ctx)
                        }
                        ChannelKind::Midi(player) => self.midi.send_opt(player.rewind()),
                        _ => {}
                    }
                }
                let midi = &mut self.midi;
                match self.sync {
                    SyncMode::Master => self.clock.rewind(|message| midi.send(message)),
                    SyncMode::MtcMaster => self.timecode.rewind(|message| midi.send(message)),
                    SyncMode::None | SyncMode::Slave => {}
                }
            }
            SeqEvent::Actions { offset, frame } => {
                let Model {
                    channels, actions, ..
                } = model;
                for action in actions.at(frame) {
                    let Some(channel) = channels.iter_mut().find(|c| c.id == action.channel)
                    else {
                        continue;
                    };
                    match &mut channel.kind {
                        ChannelKind::Sample(player) => {
                            player.on_action(&mut channel.buffer, offset, action.kind, ctx)
                        }
                        ChannelKind::Midi(player) => self
                            .midi
                            .send_opt(player.on_action(action.kind, channel.controls.mute)),
                        _ => {}
                    }
                }
            }
        }
    }

    /// Applies fades and mutes and publishes the channel's state.
    fn finish_channel(&mut self, channel: &mut Channel) {
        if let ChannelKind::Sample(player) | ChannelKind::Preview(player) = &mut channel.kind {
            player.finish(&mut channel.buffer);
        }
        if channel.publish() {
            self.events.push(Event::ChannelStatusChanged {
                channel: channel.id,
                status: channel.shared.status(),
            });
        }
    }
}
