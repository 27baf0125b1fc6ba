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
use std::{collections::BTreeMap, ops::Range};

use serde::{Deserialize, Serialize};

use super::{channel::ChannelId, Frame};

/// What a recorded action does when the transport reaches it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    KeyPress,
    KeyRelease,
    KeyKill,
    MuteOn,
    MuteOff,
    /// A raw message replayed by MIDI channels.
    Midi { status: u8, data1: u8, data2: u8 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub channel: ChannelId,
    pub frame: Frame,
    pub kind: ActionKind,
}

/// Recorded actions keyed by the loop frame they fire on.
#[derive(Clone, Debug, Default)]
pub struct Actions {
    map: BTreeMap<Frame, Vec<Action>>,
}

impl Actions {
    pub fn new() -> Actions {
        Actions::default()
    }

    pub fn record(&mut self, action: Action) {
        self.map.entry(action.frame).or_default().push(action);
    }

    /// Actions that fire exactly on `frame`.
    pub fn at(&self, frame: Frame) -> &[Action] {
        self.map.get(&frame).map_or(&[], |actions| actions.as_slice())
    }

    /// Frames in `range` that carry at least one action, in order.
    pub fn frames_in(&self, range: Range<Frame>) -> impl Iterator<Item = Frame> + '_ {
        self.map.range(range).map(|(frame, _)| *frame)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Action> {
        self.map.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.map.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn has_actions(&self, channel: ChannelId) -> bool {
        self.iter().any(|action| action.channel == channel)
    }

    pub fn remove_channel(&mut self, channel: ChannelId) {
        self.retain(|action| action.channel != channel);
    }

    /// Drops every action at or past `frames`, e.g. after the loop got shorter.
    pub fn shrink(&mut self, frames: Frame) {
        self.map.split_off(&frames);
    }

    /// Moves every action to `frame * ratio`. Used when the BPM or the sample
    /// rate changes so actions stay on the same musical position.
    pub fn rescale(&mut self, ratio: f64) {
        let old = std::mem::take(&mut self.map);
        for mut action in old.into_values().flatten() {
            action.frame = (action.frame as f64 * ratio).round() as Frame;
            self.record(action);
        }
    }

    fn retain(&mut self, mut keep: impl FnMut(&Action) -> bool) {
        self.map.retain(|_, actions| {
            actions.retain(&mut keep);
            !actions.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn press(channel: ChannelId, frame: Frame) -> Action {
        Action {
            channel,
            frame,
            kind: ActionKind::KeyPress,
        }
    }

    #[test]
    fn test_record_and_lookup() {
        let mut actions = Actions::new();
        actions.record(press(3, 100));
        actions.record(press(4, 100));
        actions.record(press(3, 500));

        assert_eq!(actions.len(), 3);
        assert_eq!(actions.at(100).len(), 2);
        assert!(actions.at(101).is_empty());
        assert_eq!(actions.frames_in(0..500).collect::<Vec<_>>(), vec![100]);
        assert!(actions.has_actions(4));

        actions.remove_channel(4);
        assert!(!actions.has_actions(4));
        assert_eq!(actions.at(100).len(), 1);
    }

    #[test]
    fn test_rescale_round_trip() {
        let mut actions = Actions::new();
        for frame in [0, 1000, 22050, 88199, 123457] {
            actions.record(press(3, frame));
        }
        let original: Vec<Frame> = actions.iter().map(|a| a.frame).collect();

        let (old_bpm, new_bpm) = (120.0f64, 97.0f64);
        actions.rescale(old_bpm / new_bpm);
        for (action, frame) in actions.iter().zip(&original) {
            let expected = *frame as f64 * (old_bpm / new_bpm);
            assert!((action.frame as f64 - expected).abs() <= 0.5);
        }

        actions.rescale(new_bpm / old_bpm);
        for (action, frame) in actions.iter().zip(&original) {
            assert!(action.frame.abs_diff(*frame) <= 1);
        }
    }

    #[test]
    fn test_shrink() {
        let mut actions = Actions::new();
        actions.record(press(3, 10));
        actions.record(press(3, 20));
        actions.shrink(20);
        assert_eq!(actions.len(), 1);
        assert!(actions.at(20).is_empty());
    }
}
