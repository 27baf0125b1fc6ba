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
use crate::audio::buffer::AudioBuffer;

const CLICK_FRAMES: usize = 38;

/// Accented click played on bars.
const TICK: [f32; CLICK_FRAMES] = [
    0.175860, 0.341914, 0.488904, 0.608633, 0.694426, 0.741500, 0.747229, 0.711293, 0.635697,
    0.524656, 0.384362, 0.222636, 0.048496, -0.128348, -0.298035, -0.451105, -0.579021,
    -0.674653, -0.732667, -0.749830, -0.688924, -0.594091, -0.474481, -0.340160, -0.201360,
    -0.067752, 0.052194, 0.151746, 0.226280, 0.273493, 0.293425, 0.288307, 0.262252, 0.220811,
    0.170435, 0.117887, 0.069639, 0.031320,
];

/// Click played on the other beats.
const TOCK: [f32; CLICK_FRAMES] = [
    0.059033, 0.117240, 0.173807, 0.227943, 0.278890, 0.325936, 0.368423, 0.405755, 0.437413,
    0.462951, 0.482013, 0.494333, 0.499738, 0.498153, 0.489598, 0.474195, 0.452159, 0.423798,
    0.389509, 0.349771, 0.289883, 0.230617, 0.173194, 0.118739, 0.068260, 0.022631, -0.017423,
    -0.051339, -0.078721, -0.099345, -0.113163, -0.120295, -0.121028, -0.115804, -0.105209,
    -0.089954, -0.070862, -0.048844,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Click {
    Tick,
    Tock,
}

/// Click generator mixed into the master output.
#[derive(Debug, Default)]
pub struct Metronome {
    playing: Option<(Click, usize)>,
}

impl Metronome {
    /// Starts a click. A tick is never cut short by a tock.
    pub fn trigger(&mut self, click: Click) {
        if let Some((Click::Tick, _)) = self.playing {
            if click == Click::Tock {
                return;
            }
        }
        self.playing = Some((click, 0));
    }

    pub fn is_playing(&self) -> bool {
        self.playing.is_some()
    }

    /// Adds the running click to `buf` from frame `from` on.
    pub fn render(&mut self, buf: &mut AudioBuffer, from: usize) {
        self.render_range(buf, from, buf.frames());
    }

    /// Adds the running click to frames `from..to` of `buf`.
    pub fn render_range(&mut self, buf: &mut AudioBuffer, from: usize, to: usize) {
        let Some((click, mut position)) = self.playing else {
            return;
        };
        let table = match click {
            Click::Tick => &TICK,
            Click::Tock => &TOCK,
        };
        for frame in from..to.min(buf.frames()) {
            if position >= CLICK_FRAMES {
                self.playing = None;
                return;
            }
            let [left, right] = buf.frame(frame);
            let sample = table[position];
            buf.set_frame(frame, [left + sample, right + sample]);
            position += 1;
        }
        self.playing = (position < CLICK_FRAMES).then_some((click, position));
    }

    pub fn reset(&mut self) {
        self.playing = None;
    }
}
