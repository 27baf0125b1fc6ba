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
//! Commands for the render thread.
//!
//! Anything that touches playback state the render thread owns, like a key
//! press or a transport change, is queued here and applied at the start of
//! the next block. Any thread may send; only the renderer receives.

use parking_lot::Mutex;

use crate::model::{channel::ChannelId, Frame};

/// Commands that can be pending at once before senders see [QueueFull].
pub const COMMAND_CAPACITY: usize = 512;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Command {
    KeyPress {
        channel: ChannelId,
        /// 0 to 1.
        velocity: f32,
        /// False for presses that must never wait for the quantizer.
        do_quantize: bool,
    },
    KeyRelease {
        channel: ChannelId,
    },
    Kill {
        channel: ChannelId,
    },
    /// Mute an action-reading channel from inside a recorded pass.
    SetInternalMute {
        channel: ChannelId,
        mute: bool,
    },
    ToggleReadActions {
        channel: ChannelId,
    },
    KillReadActions {
        channel: ChannelId,
    },
    StartSequencer,
    StopSequencer,
    RewindSequencer,
    /// Arms the sequencer to start on a signal or an external clock.
    WaitSequencer,
    SetPosition {
        frame: Frame,
    },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("the command queue is full")]
pub struct QueueFull;

/// The sending side. Senders take turns on a short lock; the render thread
/// never touches it.
pub struct CommandSender {
    producer: Mutex<rtrb::Producer<Command>>,
}

impl CommandSender {
    pub fn send(&self, command: Command) -> Result<(), QueueFull> {
        self.producer.lock().push(command).map_err(|_| QueueFull)
    }
}

/// The render thread's end.
pub struct CommandReceiver {
    consumer: rtrb::Consumer<Command>,
}

impl CommandReceiver {
    pub fn recv(&mut self) -> Option<Command> {
        self.consumer.pop().ok()
    }
}

pub fn queue() -> (CommandSender, CommandReceiver) {
    let (producer, consumer) = rtrb::RingBuffer::new(COMMAND_CAPACITY);
    (
        CommandSender {
            producer: Mutex::new(producer),
        },
        CommandReceiver { consumer },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commands_arrive_in_order() {
        let (sender, mut receiver) = queue();
        sender.send(Command::StartSequencer).unwrap();
        sender
            .send(Command::KeyPress {
                channel: 3,
                velocity: 1.0,
                do_quantize: true,
            })
            .unwrap();
        assert_eq!(receiver.recv(), Some(Command::StartSequencer));
        assert!(matches!(
            receiver.recv(),
            Some(Command::KeyPress { channel: 3, .. })
        ));
        assert_eq!(receiver.recv(), None);
    }

    #[test]
    fn test_full_queue_is_reported() {
        let (sender, _receiver) = queue();
        for _ in 0..COMMAND_CAPACITY {
            sender.send(Command::StopSequencer).unwrap();
        }
        assert_eq!(sender.send(Command::StopSequencer), Err(QueueFull));
    }
}
