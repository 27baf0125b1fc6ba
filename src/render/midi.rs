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
use crate::{
    midi::message::MidiMessage,
    model::{actions::ActionKind, channel::ChannelStatus},
};

/// Playback state of a MIDI channel. It renders no audio; while playing it
/// replays its recorded MIDI actions to the MIDI output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MidiPlayer {
    status: ChannelStatus,
    midi_channel: u8,
}

impl MidiPlayer {
    pub fn new(midi_channel: u8) -> MidiPlayer {
        MidiPlayer {
            status: ChannelStatus::Off,
            midi_channel: midi_channel & 0x0F,
        }
    }

    pub fn status(&self) -> ChannelStatus {
        self.status
    }

    pub fn midi_channel(&self) -> u8 {
        self.midi_channel
    }

    pub fn set_midi_channel(&mut self, midi_channel: u8) {
        self.midi_channel = midi_channel & 0x0F;
    }

    /// Presses arm and disarm at the next first beat.
    pub fn key_press(&mut self) {
        self.status = match self.status {
            ChannelStatus::Play => ChannelStatus::Ending,
            ChannelStatus::Ending | ChannelStatus::Wait => ChannelStatus::Off,
            ChannelStatus::Off => ChannelStatus::Wait,
            other => other,
        };
    }

    /// Returns the message that silences hanging notes, if any were playing.
    pub fn kill(&mut self) -> Option<MidiMessage> {
        let playing = self.status.is_playing();
        self.status = ChannelStatus::Off;
        playing.then(|| MidiMessage::all_notes_off(self.midi_channel))
    }

    pub fn on_first_beat(&mut self) -> Option<MidiMessage> {
        match self.status {
            ChannelStatus::Ending => self.kill(),
            ChannelStatus::Wait => {
                self.status = ChannelStatus::Play;
                None
            }
            _ => None,
        }
    }

    /// The sequencer was rewound. Pending changes resolve, and hanging notes
    /// are released only if the channel was already sounding.
    pub fn rewind(&mut self) -> Option<MidiMessage> {
        let was_playing = self.status.is_playing();
        let ended = self.on_first_beat();
        if !was_playing {
            return None;
        }
        ended.or_else(|| Some(MidiMessage::all_notes_off(self.midi_channel)))
    }

    pub fn stop_by_seq(&mut self) -> Option<MidiMessage> {
        self.kill()
    }

    /// The message to send for a recorded action, rewritten to this
    /// channel's MIDI channel. Nothing is sent while stopped or muted.
    pub fn on_action(&self, kind: ActionKind, mute: bool) -> Option<MidiMessage> {
        match kind {
            ActionKind::Midi {
                status,
                data1,
                data2,
            } if self.status.is_playing() && !mute => {
                Some(MidiMessage::new(status, data1, data2).with_channel(self.midi_channel))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::message::NOTE_ON;

    #[test]
    fn test_key_press_cycle() {
        let mut player = MidiPlayer::new(2);
        player.key_press();
        assert_eq!(player.status(), ChannelStatus::Wait);
        assert_eq!(player.on_first_beat(), None);
        assert_eq!(player.status(), ChannelStatus::Play);
        player.key_press();
        assert_eq!(player.status(), ChannelStatus::Ending);
        assert_eq!(
            player.on_first_beat(),
            Some(MidiMessage::all_notes_off(2))
        );
        assert_eq!(player.status(), ChannelStatus::Off);
    }

    #[test]
    fn test_kill_only_flushes_when_playing() {
        let mut player = MidiPlayer::new(0);
        assert_eq!(player.kill(), None);
        player.key_press();
        player.on_first_beat();
        assert!(player.kill().is_some());
        assert_eq!(player.status(), ChannelStatus::Off);
    }

    #[test]
    fn test_actions_are_rechannelled() {
        let mut player = MidiPlayer::new(5);
        let action = ActionKind::Midi {
            status: NOTE_ON,
            data1: 60,
            data2: 90,
        };
        assert_eq!(player.on_action(action, false), None);

        player.key_press();
        player.on_first_beat();
        let message = player.on_action(action, false).unwrap();
        assert_eq!(message.as_bytes(), &[NOTE_ON | 5, 60, 90]);
        assert_eq!(player.on_action(action, true), None);
        assert_eq!(player.on_action(ActionKind::KeyPress, false), None);
    }

    #[test]
    fn test_rewind() {
        let mut player = MidiPlayer::new(0);
        assert_eq!(player.rewind(), None);

        // A waiting channel starts without flushing notes it never played.
        player.key_press();
        assert_eq!(player.rewind(), None);
        assert_eq!(player.status(), ChannelStatus::Play);

        assert_eq!(player.rewind(), Some(MidiMessage::all_notes_off(0)));
        assert_eq!(player.status(), ChannelStatus::Play);

        player.key_press();
        assert_eq!(player.rewind(), Some(MidiMessage::all_notes_off(0)));
        assert_eq!(player.status(), ChannelStatus::Off);
    }
}
