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
use std::fmt;

pub const NOTE_OFF: u8 = 0x80;
pub const NOTE_ON: u8 = 0x90;
pub const CONTROL_CHANGE: u8 = 0xB0;
pub const SYSEX: u8 = 0xF0;
pub const MTC_QUARTER_FRAME: u8 = 0xF1;
pub const SONG_POSITION: u8 = 0xF2;
pub const END_OF_SYSEX: u8 = 0xF7;
pub const CLOCK: u8 = 0xF8;
pub const START: u8 = 0xFA;
pub const CONTINUE: u8 = 0xFB;
pub const STOP: u8 = 0xFC;

const ALL_NOTES_OFF: u8 = 123;

/// Longest message held: an MTC full frame.
const MAX_LEN: usize = 10;

/// A short MIDI message held inline, so the render thread can queue
/// outbound messages without allocating.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MidiMessage {
    bytes: [u8; MAX_LEN],
    len: u8,
}

impl MidiMessage {
    fn with_bytes(bytes: &[u8]) -> MidiMessage {
        let mut message = MidiMessage {
            bytes: [0; MAX_LEN],
            len: bytes.len().min(MAX_LEN) as u8,
        };
        message.bytes[..message.len as usize].copy_from_slice(&bytes[..message.len as usize]);
        message
    }

    pub fn new(status: u8, data1: u8, data2: u8) -> MidiMessage {
        MidiMessage::with_bytes(&[status, data1 & 0x7F, data2 & 0x7F])
    }

    /// A one byte system realtime message.
    pub fn realtime(status: u8) -> MidiMessage {
        MidiMessage::with_bytes(&[status])
    }

    /// One MTC quarter frame. `piece` is 0-7, `value` its nibble.
    pub fn quarter_frame(piece: u8, value: u8) -> MidiMessage {
        MidiMessage::with_bytes(&[MTC_QUARTER_FRAME, ((piece & 0x07) << 4) | (value & 0x0F)])
    }

    /// An MTC full frame sysex, used to cue a receiver. `rate` is the two
    /// bit SMPTE rate code carried with the hours.
    pub fn full_frame(rate: u8, hours: u8, minutes: u8, seconds: u8, frames: u8) -> MidiMessage {
        MidiMessage::with_bytes(&[
            SYSEX,
            0x7F,
            0x7F,
            0x01,
            0x01,
            ((rate & 0x03) << 5) | (hours & 0x1F),
            minutes & 0x3F,
            seconds & 0x3F,
            frames & 0x1F,
            END_OF_SYSEX,
        ])
    }

    pub fn clock() -> MidiMessage {
        MidiMessage::realtime(CLOCK)
    }

    pub fn start() -> MidiMessage {
        MidiMessage::realtime(START)
    }

    pub fn stop() -> MidiMessage {
        MidiMessage::realtime(STOP)
    }

    /// Song position pointer, in sixteenth notes.
    pub fn song_position(sixteenths: u16) -> MidiMessage {
        MidiMessage::new(
            SONG_POSITION,
            (sixteenths & 0x7F) as u8,
            ((sixteenths >> 7) & 0x7F) as u8,
        )
    }

    pub fn all_notes_off(channel: u8) -> MidiMessage {
        MidiMessage::new(CONTROL_CHANGE | (channel & 0x0F), ALL_NOTES_OFF, 0)
    }

    /// Parses up to three bytes. Longer messages (sysex) are not handled.
    pub fn from_bytes(bytes: &[u8]) -> Option<MidiMessage> {
        match bytes {
            [status] if *status >= 0xF8 => Some(MidiMessage::realtime(*status)),
            [status, data1] if *status & 0x80 != 0 => {
                Some(MidiMessage::with_bytes(&[*status, *data1 & 0x7F]))
            }
            [status, data1, data2] if *status & 0x80 != 0 => {
                Some(MidiMessage::new(*status, *data1, *data2))
            }
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn status(&self) -> u8 {
        self.bytes[0]
    }

    /// Status with the channel nibble cleared, for channel messages.
    pub fn kind(&self) -> u8 {
        if self.is_channel_message() {
            self.bytes[0] & 0xF0
        } else {
            self.bytes[0]
        }
    }

    pub fn channel(&self) -> Option<u8> {
        self.is_channel_message().then_some(self.bytes[0] & 0x0F)
    }

    pub fn data1(&self) -> u8 {
        self.bytes[1]
    }

    pub fn data2(&self) -> u8 {
        self.bytes[2]
    }

    pub fn is_channel_message(&self) -> bool {
        (0x80..0xF0).contains(&self.bytes[0])
    }

    /// A note on with velocity zero is a note off.
    pub fn is_note_on(&self) -> bool {
        self.kind() == NOTE_ON && self.data2() > 0
    }

    pub fn is_note_off(&self) -> bool {
        self.kind() == NOTE_OFF || (self.kind() == NOTE_ON && self.data2() == 0)
    }

    /// The same message on another channel.
    pub fn with_channel(&self, channel: u8) -> MidiMessage {
        if !self.is_channel_message() {
            return *self;
        }
        let mut message = *self;
        message.bytes[0] = (self.bytes[0] & 0xF0) | (channel & 0x0F);
        message
    }
}

impl fmt::Debug for MidiMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MidiMessage({:02X?})", self.as_bytes())
    }
}
