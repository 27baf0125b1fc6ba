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
//! MIDI learn: bindings from incoming messages to engine controls, and
//! lightning feedback sent back to controllers.

use serde::{Deserialize, Serialize};

use super::message::{MidiMessage, CONTROL_CHANGE, NOTE_OFF, NOTE_ON};
use crate::model::channel::{ChannelStatus, MAX_PITCH, MIN_PITCH};

/// Identifies a note or controller on a MIDI channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Binding {
    pub status: u8,
    pub data1: u8,
}

impl Binding {
    /// Binds to whatever produced `message`. Note offs bind as the note on.
    pub fn from_message(message: &MidiMessage) -> Option<Binding> {
        let status = match message.kind() {
            NOTE_ON | NOTE_OFF => NOTE_ON | message.channel()?,
            CONTROL_CHANGE => message.status(),
            _ => return None,
        };
        Some(Binding {
            status,
            data1: message.data1(),
        })
    }

    /// The message presses this binding.
    pub fn pressed_by(&self, message: &MidiMessage) -> bool {
        if message.status() != self.status || message.data1() != self.data1 {
            return false;
        }
        message.is_note_on() || (message.kind() == CONTROL_CHANGE && message.data2() > 0)
    }

    /// The message releases a note binding.
    pub fn released_by(&self, message: &MidiMessage) -> bool {
        message.is_note_off()
            && message.data1() == self.data1
            && Some(self.status & 0x0F) == message.channel()
            && self.status & 0xF0 == NOTE_ON
    }

    /// The message moves this binding. Returns the value in [0, 1].
    pub fn value(&self, message: &MidiMessage) -> Option<f32> {
        (message.status() == self.status && message.data1() == self.data1)
            .then(|| message.data2() as f32 / 127.0)
    }
}

/// What a learned message does to a channel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ChannelAction {
    KeyPress { velocity: f32 },
    KeyRelease,
    Kill,
    ToggleMute,
    ToggleSolo,
    ToggleArm,
    Volume(f32),
    Pitch(f32),
    ToggleReadActions,
}

/// Which channel parameter a learn request binds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelParam {
    KeyPress,
    Kill,
    Mute,
    Solo,
    Arm,
    Volume,
    Pitch,
    ReadActions,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelLearn {
    pub key_press: Option<Binding>,
    pub kill: Option<Binding>,
    pub mute: Option<Binding>,
    pub solo: Option<Binding>,
    pub arm: Option<Binding>,
    pub volume: Option<Binding>,
    pub pitch: Option<Binding>,
    pub read_actions: Option<Binding>,
}

impl ChannelLearn {
    /// Resolves an incoming message against every binding.
    pub fn resolve(&self, message: &MidiMessage) -> Option<ChannelAction> {
        if let Some(binding) = &self.key_press {
            if binding.pressed_by(message) {
                let velocity = message.data2() as f32 / 127.0;
                return Some(ChannelAction::KeyPress { velocity });
            }
            if binding.released_by(message) {
                return Some(ChannelAction::KeyRelease);
            }
        }
        let pressed = |binding: &Option<Binding>| binding.is_some_and(|b| b.pressed_by(message));
        if pressed(&self.kill) {
            return Some(ChannelAction::Kill);
        }
        if pressed(&self.mute) {
            return Some(ChannelAction::ToggleMute);
        }
        if pressed(&self.solo) {
            return Some(ChannelAction::ToggleSolo);
        }
        if pressed(&self.arm) {
            return Some(ChannelAction::ToggleArm);
        }
        if pressed(&self.read_actions) {
            return Some(ChannelAction::ToggleReadActions);
        }
        if let Some(value) = self.volume.and_then(|b| b.value(message)) {
            return Some(ChannelAction::Volume(value));
        }
        if let Some(value) = self.pitch.and_then(|b| b.value(message)) {
            return Some(ChannelAction::Pitch(MIN_PITCH + (MAX_PITCH - MIN_PITCH) * value));
        }
        None
    }

    pub fn bind(&mut self, param: ChannelParam, binding: Binding) {
        let slot = match param {
            ChannelParam::KeyPress => &mut self.key_press,
            ChannelParam::Kill => &mut self.kill,
            ChannelParam::Mute => &mut self.mute,
            ChannelParam::Solo => &mut self.solo,
            ChannelParam::Arm => &mut self.arm,
            ChannelParam::Volume => &mut self.volume,
            ChannelParam::Pitch => &mut self.pitch,
            ChannelParam::ReadActions => &mut self.read_actions,
        };
        *slot = Some(binding);
    }
}

/// What a learned message does to the engine as a whole.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum GlobalAction {
    StartStop,
    Rewind,
    ToggleActionRec,
    ToggleInputRec,
    ToggleMetronome,
    VolumeOut(f32),
    VolumeIn(f32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GlobalParam {
    StartStop,
    Rewind,
    ActionRec,
    InputRec,
    Metronome,
    VolumeOut,
    VolumeIn,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalLearn {
    pub start_stop: Option<Binding>,
    pub rewind: Option<Binding>,
    pub action_rec: Option<Binding>,
    pub input_rec: Option<Binding>,
    pub metronome: Option<Binding>,
    pub volume_out: Option<Binding>,
    pub volume_in: Option<Binding>,
}

impl GlobalLearn {
    pub fn resolve(&self, message: &MidiMessage) -> Option<GlobalAction> {
        let pressed = |binding: &Option<Binding>| binding.is_some_and(|b| b.pressed_by(message));
        if pressed(&self.start_stop) {
            Some(GlobalAction::StartStop)
        } else if pressed(&self.rewind) {
            Some(GlobalAction::Rewind)
        } else if pressed(&self.action_rec) {
            Some(GlobalAction::ToggleActionRec)
        } else if pressed(&self.input_rec) {
            Some(GlobalAction::ToggleInputRec)
        } else if pressed(&self.metronome) {
            Some(GlobalAction::ToggleMetronome)
        } else if let Some(value) = self.volume_out.and_then(|b| b.value(message)) {
            Some(GlobalAction::VolumeOut(value))
        } else {
            self.volume_in
                .and_then(|b| b.value(message))
                .map(GlobalAction::VolumeIn)
        }
    }

    pub fn bind(&mut self, param: GlobalParam, binding: Binding) {
        let slot = match param {
            GlobalParam::StartStop => &mut self.start_stop,
            GlobalParam::Rewind => &mut self.rewind,
            GlobalParam::ActionRec => &mut self.action_rec,
            GlobalParam::InputRec => &mut self.input_rec,
            GlobalParam::Metronome => &mut self.metronome,
            GlobalParam::VolumeOut => &mut self.volume_out,
            GlobalParam::VolumeIn => &mut self.volume_in,
        };
        *slot = Some(binding);
    }
}

/// A message sent back to a controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feedback {
    pub status: u8,
    pub data1: u8,
    pub data2: u8,
}

impl Feedback {
    pub fn message(&self) -> MidiMessage {
        MidiMessage::new(self.status, self.data1, self.data2)
    }
}

/// Feedback per channel status, typically to light pad LEDs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Lightning {
    pub playing: Option<Feedback>,
    pub waiting: Option<Feedback>,
    pub ending: Option<Feedback>,
    pub stopped: Option<Feedback>,
}

impl Lightning {
    pub fn for_status(&self, status: ChannelStatus) -> Option<MidiMessage> {
        let feedback = match status {
            ChannelStatus::Play => self.playing,
            ChannelStatus::Wait => self.waiting,
            ChannelStatus::Ending => self.ending,
            ChannelStatus::Off => self.stopped,
            _ => None,
        };
        feedback.map(|feedback| feedback.message())
    }

    pub fn is_empty(&self) -> bool {
        self.playing.is_none()
            && self.waiting.is_none()
            && self.ending.is_none()
            && self.stopped.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(channel: u8, note: u8, velocity: u8) -> MidiMessage {
        MidiMessage::new(NOTE_ON | channel, note, velocity)
    }

    #[test]
    fn test_bindings_from_messages() {
        let binding = Binding::from_message(&MidiMessage::new(NOTE_OFF | 2, 36, 0)).unwrap();
        assert_eq!(binding, Binding { status: NOTE_ON | 2, data1: 36 });
        assert_eq!(Binding::from_message(&MidiMessage::clock()), None);
    }

    #[test]
    fn test_key_press_and_release() {
        let learn = ChannelLearn {
            key_press: Binding::from_message(&note(1, 36, 100)),
            ..ChannelLearn::default()
        };
        assert_eq!(
            learn.resolve(&note(1, 36, 127)),
            Some(ChannelAction::KeyPress { velocity: 1.0 })
        );
        assert_eq!(learn.resolve(&note(1, 36, 0)), Some(ChannelAction::KeyRelease));
        assert_eq!(
            learn.resolve(&MidiMessage::new(NOTE_OFF | 1, 36, 64)),
            Some(ChannelAction::KeyRelease)
        );
        assert_eq!(learn.resolve(&note(2, 36, 100)), None);
        assert_eq!(learn.resolve(&note(1, 37, 100)), None);
    }

    #[test]
    fn test_controllers_map_to_values() {
        let mut learn = ChannelLearn::default();
        learn.bind(
            ChannelParam::Volume,
            Binding {
                status: CONTROL_CHANGE,
                data1: 7,
            },
        );
        learn.bind(
            ChannelParam::Pitch,
            Binding {
                status: CONTROL_CHANGE,
                data1: 8,
            },
        );
        assert_eq!(
            learn.resolve(&MidiMessage::new(CONTROL_CHANGE, 7, 127)),
            Some(ChannelAction::Volume(1.0))
        );
        assert_eq!(
            learn.resolve(&MidiMessage::new(CONTROL_CHANGE, 8, 0)),
            Some(ChannelAction::Pitch(MIN_PITCH))
        );
    }

    #[test]
    fn test_global_toggles_ignore_releases() {
        let mut learn = GlobalLearn::default();
        learn.bind(
            GlobalParam::Metronome,
            Binding {
                status: CONTROL_CHANGE,
                data1: 20,
            },
        );
        assert_eq!(
            learn.resolve(&MidiMessage::new(CONTROL_CHANGE, 20, 127)),
            Some(GlobalAction::ToggleMetronome)
        );
        assert_eq!(learn.resolve(&MidiMessage::new(CONTROL_CHANGE, 20, 0)), None);
    }

    #[test]
    fn test_lightning_per_status() {
        let lightning = Lightning {
            playing: Some(Feedback {
                status: NOTE_ON,
                data1: 36,
                data2: 127,
            }),
            ..Lightning::default()
        };
        assert_eq!(
            lightning.for_status(ChannelStatus::Play),
            Some(MidiMessage::new(NOTE_ON, 36, 127))
        );
        assert_eq!(lightning.for_status(ChannelStatus::Off), None);
        assert!(!lightning.is_empty());
    }
}
