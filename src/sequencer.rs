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
//! Frame accurate transport.

use std::sync::{
    atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering},
    Arc,
};

use crate::model::{actions::Actions, atomic::AtomicF32, Frame};

pub mod metronome;

pub const DEFAULT_BPM: f32 = 120.0;
pub const MIN_BPM: f32 = 20.0;
pub const MAX_BPM: f32 = 999.0;
pub const DEFAULT_BEATS: u32 = 4;
pub const DEFAULT_BARS: u32 = 1;
pub const MAX_BEATS: u32 = 32;
pub const MAX_BARS: u32 = 32;
pub const MAX_QUANTIZE: u32 = 8;

/// Boundary events produced per block never exceed this many.
pub const EVENTS_CAPACITY: usize = 2048;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum SeqStatus {
    #[default]
    Stopped,
    /// Armed, waiting for an external start (record trigger or MIDI clock).
    Waiting,
    Running,
}

impl SeqStatus {
    fn from_u8(value: u8) -> SeqStatus {
        match value {
            1 => SeqStatus::Waiting,
            2 => SeqStatus::Running,
            _ => SeqStatus::Stopped,
        }
    }
}

/// Something that happens on a frame of the current block. `offset` is the
/// frame inside the block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeqEvent {
    FirstBeat { offset: usize },
    Bar { offset: usize },
    Beat { offset: usize, beat: u32 },
    Quantize { offset: usize },
    Rewind { offset: usize },
    /// Recorded actions live on loop frame `frame`.
    Actions { offset: usize, frame: Frame },
}

impl SeqEvent {
    pub fn offset(&self) -> usize {
        match *self {
            SeqEvent::FirstBeat { offset }
            | SeqEvent::Bar { offset }
            | SeqEvent::Beat { offset, .. }
            | SeqEvent::Quantize { offset }
            | SeqEvent::Rewind { offset }
            | SeqEvent::Actions { offset, .. } => offset,
        }
    }
}

/// Transport values readable from any thread. The render thread publishes
/// the position once per block; edits publish the rest.
#[derive(Debug, Default)]
pub struct SequencerShared {
    status: AtomicU8,
    current_frame: AtomicUsize,
    bpm: AtomicF32,
    beats: AtomicU32,
    bars: AtomicU32,
    quantize: AtomicU32,
    frames_in_loop: AtomicUsize,
}

impl SequencerShared {
    pub fn status(&self) -> SeqStatus {
        SeqStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn current_frame(&self) -> Frame {
        self.current_frame.load(Ordering::Acquire)
    }

    pub fn bpm(&self) -> f32 {
        self.bpm.load(Ordering::Acquire)
    }

    pub fn beats(&self) -> u32 {
        self.beats.load(Ordering::Acquire)
    }

    pub fn bars(&self) -> u32 {
        self.bars.load(Ordering::Acquire)
    }

    pub fn quantize(&self) -> u32 {
        self.quantize.load(Ordering::Acquire)
    }

    pub fn frames_in_loop(&self) -> Frame {
        self.frames_in_loop.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub struct Sequencer {
    sample_rate: u32,
    bpm: f32,
    beats: u32,
    bars: u32,
    quantize: u32,

    frames_in_loop: Frame,
    frames_in_bar: Frame,
    frames_in_beat: Frame,
    quantizer_step: Frame,

    current_frame: Frame,
    block_start: Frame,
    /// Offset inside the current block where a quantized rewind happened.
    block_rewind: Option<usize>,
    status: SeqStatus,
    rewind_pending: bool,
    rewound: bool,

    events: Vec<SeqEvent>,
    shared: Arc<SequencerShared>,
}

impl Sequencer {
    pub fn new(sample_rate: u32) -> Sequencer {
        Sequencer::with_shared(sample_rate, Arc::new(SequencerShared::default()))
    }

    /// A sequencer publishing into cells that outlive it.
    pub fn with_shared(sample_rate: u32, shared: Arc<SequencerShared>) -> Sequencer {
        let mut sequencer = Sequencer {
            sample_rate,
            bpm: DEFAULT_BPM,
            beats: DEFAULT_BEATS,
            bars: DEFAULT_BARS,
            quantize: 0,
            frames_in_loop: 0,
            frames_in_bar: 0,
            frames_in_beat: 0,
            quantizer_step: 0,
            current_frame: 0,
            block_start: 0,
            block_rewind: None,
            status: SeqStatus::Stopped,
            rewind_pending: false,
            rewound: false,
            events: Vec::with_capacity(EVENTS_CAPACITY),
            shared,
        };
        sequencer.recompute_frames(sample_rate);
        sequencer
    }

    pub fn shared(&self) -> Arc<SequencerShared> {
        self.shared.clone()
    }

    /// Moves publishing over to `shared` and writes the current settings and
    /// position into it.
    pub fn attach_shared(&mut self, shared: Arc<SequencerShared>) {
        self.shared = shared;
        self.publish_settings();
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn bpm(&self) -> f32 {
        self.bpm
    }

    pub fn beats(&self) -> u32 {
        self.beats
    }

    pub fn bars(&self) -> u32 {
        self.bars
    }

    pub fn quantize(&self) -> u32 {
        self.quantize
    }

    pub fn status(&self) -> SeqStatus {
        self.status
    }

    pub fn is_running(&self) -> bool {
        self.status == SeqStatus::Running
    }

    pub fn current_frame(&self) -> Frame {
        self.current_frame
    }

    pub fn frames_in_loop(&self) -> Frame {
        self.frames_in_loop
    }

    pub fn frames_in_bar(&self) -> Frame {
        self.frames_in_bar
    }

    pub fn frames_in_beat(&self) -> Frame {
        self.frames_in_beat
    }

    pub fn quantizer_step(&self) -> Frame {
        self.quantizer_step
    }

    /// True when starts and rewinds wait for the next quantizer step.
    pub fn can_quantize(&self) -> bool {
        self.quantizer_step > 0 && self.is_running()
    }

    /// Longest loop possible at the slowest tempo, used to size capture
    /// buffers.
    pub fn max_frames_in_loop(&self, sample_rate: u32) -> Frame {
        (sample_rate as f32 * (60.0 / MIN_BPM)) as Frame * self.beats as Frame
    }

    /// Loop frame at offset `offset` of the current block.
    pub fn frame_at(&self, offset: usize) -> Frame {
        if self.frames_in_loop == 0 {
            return 0;
        }
        match self.block_rewind {
            Some(rewind) if offset >= rewind => (offset - rewind) % self.frames_in_loop,
            _ => (self.block_start + offset) % self.frames_in_loop,
        }
    }

    /// Recomputes every length for a new sample rate. The current frame is
    /// rescaled so it stays on the same musical position. Returns the
    /// new-to-old ratio for rescaling recorded actions.
    pub fn recompute_frames(&mut self, sample_rate: u32) -> f64 {
        let ratio = if self.sample_rate == 0 {
            1.0
        } else {
            sample_rate as f64 / self.sample_rate as f64
        };
        self.sample_rate = sample_rate;
        self.frames_in_beat = (sample_rate as f32 * 60.0 / self.bpm) as Frame;
        self.frames_in_loop = self.frames_in_beat * self.beats as Frame;
        self.frames_in_bar = self.frames_in_loop / self.bars.max(1) as Frame;
        self.quantizer_step = if self.quantize > 0 {
            self.frames_in_beat / self.quantize as Frame
        } else {
            0
        };
        self.current_frame = self.rescale_frame(self.current_frame, ratio);
        self.publish_settings();
        ratio
    }

    /// Sets a new tempo. Returns the old-to-new ratio that recorded action
    /// frames must be multiplied by.
    pub fn set_bpm(&mut self, bpm: f32) -> f64 {
        let bpm = bpm.clamp(MIN_BPM, MAX_BPM);
        let ratio = self.bpm as f64 / bpm as f64;
        self.bpm = bpm;
        let current = self.current_frame;
        self.recompute_frames(self.sample_rate);
        self.current_frame = self.rescale_frame(current, ratio);
        self.publish_settings();
        ratio
    }

    /// Sets the loop length. `bars` never exceeds `beats`.
    pub fn set_beats(&mut self, beats: u32, bars: u32) {
        self.beats = beats.clamp(1, MAX_BEATS);
        self.bars = bars.clamp(1, MAX_BARS).min(self.beats);
        self.recompute_frames(self.sample_rate);
    }

    pub fn set_quantize(&mut self, quantize: u32) {
        self.quantize = quantize.min(MAX_QUANTIZE);
        self.recompute_frames(self.sample_rate);
    }

    fn rescale_frame(&self, frame: Frame, ratio: f64) -> Frame {
        let frame = (frame as f64 * ratio).round() as Frame;
        if self.frames_in_loop == 0 {
            0
        } else {
            frame % self.frames_in_loop
        }
    }

    pub fn start(&mut self) {
        self.status = SeqStatus::Running;
        self.publish_position();
    }

    pub fn stop(&mut self) {
        self.status = SeqStatus::Stopped;
        self.rewind_pending = false;
        self.publish_position();
    }

    /// Waits for a signal or an external clock before running.
    pub fn set_waiting(&mut self) {
        self.status = SeqStatus::Waiting;
        self.publish_position();
    }

    /// Goes back to frame zero, at the next quantizer step when quantizing.
    pub fn rewind(&mut self) {
        if self.can_quantize() {
            self.rewind_pending = true;
        } else {
            self.current_frame = 0;
            self.rewound = true;
            self.publish_position();
        }
    }

    /// Moves to an absolute loop frame, e.g. from a song position pointer.
    pub fn set_position(&mut self, frame: Frame) {
        self.current_frame = if self.frames_in_loop == 0 {
            0
        } else {
            frame % self.frames_in_loop
        };
        self.publish_position();
    }

    /// Advances the transport by `frames` and returns the boundaries crossed,
    /// in order. Nothing is produced while the sequencer is not running,
    /// apart from an immediate rewind.
    pub fn advance(&mut self, frames: usize, actions: &Actions) -> &[SeqEvent] {
        self.events.clear();
        self.block_start = self.current_frame;
        self.block_rewind = None;

        if self.rewound {
            self.rewound = false;
            self.push(SeqEvent::Rewind { offset: 0 });
        }
        if !self.is_running() || self.frames_in_loop == 0 {
            return &self.events;
        }

        for offset in 0..frames {
            if self.quantizer_step > 0 && self.current_frame % self.quantizer_step == 0 {
                if self.rewind_pending {
                    self.rewind_pending = false;
                    self.current_frame = 0;
                    self.block_rewind = Some(offset);
                    self.push(SeqEvent::Rewind { offset });
                }
                self.push(SeqEvent::Quantize { offset });
            }

            let frame = self.current_frame;
            if frame == 0 {
                self.push(SeqEvent::FirstBeat { offset });
            } else if self.frames_in_bar > 0 && frame % self.frames_in_bar == 0 {
                self.push(SeqEvent::Bar { offset });
            }
            if self.frames_in_beat > 0 && frame % self.frames_in_beat == 0 {
                let beat = (frame / self.frames_in_beat) as u32;
                self.push(SeqEvent::Beat { offset, beat });
            }
            if !actions.at(frame).is_empty() {
                self.push(SeqEvent::Actions { offset, frame });
            }

            self.current_frame += 1;
            if self.current_frame >= self.frames_in_loop {
                self.current_frame = 0;
            }
        }
        self.publish_position();
        &self.events
    }

    /// Whether the beat falls on a bar line.
    pub fn is_bar(&self, beat: u32) -> bool {
        let beats_in_bar = (self.beats / self.bars.max(1)).max(1);
        beat % beats_in_bar == 0
    }

    fn push(&mut self, event: SeqEvent) {
        // Past capacity events are dropped rather than reallocating.
        if self.events.len() < self.events.capacity() {
            self.events.push(event);
        }
    }

    fn publish_position(&self) {
        self.shared
            .status
            .store(self.status as u8, Ordering::Release);
        self.shared
            .current_frame
            .store(self.current_frame, Ordering::Release);
    }

    fn publish_settings(&self) {
        self.shared.bpm.store(self.bpm, Ordering::Release);
        self.shared.beats.store(self.beats, Ordering::Release);
        self.shared.bars.store(self.bars, Ordering::Release);
        self.shared.quantize.store(self.quantize, Ordering::Release);
        self.shared
            .frames_in_loop
            .store(self.frames_in_loop, Ordering::Release);
        self.publish_position();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::actions::{Action, ActionKind};

    #[test]
    fn test_frame_lengths() {
        let sequencer = Sequencer::new(44100);
        assert_eq!(sequencer.frames_in_beat(), 22050);
        assert_eq!(sequencer.frames_in_loop(), 88200);
        assert_eq!(sequencer.frames_in_bar(), 88200);
        assert_eq!(sequencer.quantizer_step(), 0);
        assert_eq!(sequencer.max_frames_in_loop(44100), 44100 * 3 * 4);
    }

    #[test]
    fn test_quantizer_step() {
        let mut sequencer = Sequencer::new(48000);
        sequencer.set_quantize(4);
        assert_eq!(sequencer.quantizer_step(), 24000 / 4);
        sequencer.set_quantize(100);
        assert_eq!(sequencer.quantize(), MAX_QUANTIZE);
    }

    #[test]
    fn test_set_bpm_rescales_position() {
        let mut sequencer = Sequencer::new(44100);
        sequencer.set_position(44100);
        let ratio = sequencer.set_bpm(60.0);
        assert_eq!(ratio, 2.0);
        assert_eq!(sequencer.frames_in_loop(), 176400);
        assert_eq!(sequencer.current_frame(), 88200);
        assert_eq!(sequencer.shared().bpm(), 60.0);

        sequencer.set_bpm(5000.0);
        assert_eq!(sequencer.bpm(), MAX_BPM);
    }

    #[test]
    fn test_attach_shared_publishes_current_settings() {
        let target = Arc::new(SequencerShared::default());
        let mut sequencer = Sequencer::new(44100);
        sequencer.set_bpm(90.0);
        sequencer.set_quantize(4);
        assert_ne!(target.bpm(), 90.0);

        sequencer.attach_shared(target.clone());
        assert_eq!(target.bpm(), 90.0);
        assert_eq!(target.quantize(), 4);
        assert_eq!(target.frames_in_loop(), sequencer.frames_in_loop());

        sequencer.set_bpm(100.0);
        assert_eq!(target.bpm(), 100.0);
    }

    #[test]
    fn test_bars_never_exceed_beats() {
        let mut sequencer = Sequencer::new(44100);
        sequencer.set_beats(3, 8);
        assert_eq!((sequencer.beats(), sequencer.bars()), (3, 3));
        sequencer.set_beats(0, 0);
        assert_eq!((sequencer.beats(), sequencer.bars()), (1, 1));
    }

    #[test]
    fn test_advance_emits_boundaries() {
        let mut sequencer = Sequencer::new(1000);
        sequencer.set_bpm(600.0);
        sequencer.set_beats(4, 2);
        assert_eq!(sequencer.frames_in_beat(), 100);
        let mut actions = Actions::new();
        actions.record(Action {
            channel: 3,
            frame: 150,
            kind: ActionKind::KeyPress,
        });

        // Nothing happens while stopped.
        assert!(sequencer.advance(64, &actions).is_empty());

        sequencer.start();
        let events = sequencer.advance(400, &actions).to_vec();
        assert_eq!(
            events,
            vec![
                SeqEvent::FirstBeat { offset: 0 },
                SeqEvent::Beat { offset: 0, beat: 0 },
                SeqEvent::Beat { offset: 100, beat: 1 },
                SeqEvent::Actions {
                    offset: 150,
                    frame: 150
                },
                SeqEvent::Bar { offset: 200 },
                SeqEvent::Beat { offset: 200, beat: 2 },
                SeqEvent::Beat { offset: 300, beat: 3 },
            ]
        );
        assert_eq!(sequencer.current_frame(), 0);
        assert_eq!(sequencer.shared().current_frame(), 0);
    }

    #[test]
    fn test_quantized_rewind_waits_for_step() {
        let mut sequencer = Sequencer::new(1000);
        sequencer.set_bpm(600.0);
        sequencer.set_quantize(2);
        sequencer.start();
        sequencer.set_position(120);

        sequencer.rewind();
        assert_eq!(sequencer.current_frame(), 120);
        let events = sequencer.advance(40, &Actions::new()).to_vec();
        assert_eq!(
            events,
            vec![
                SeqEvent::Rewind { offset: 30 },
                SeqEvent::Quantize { offset: 30 },
                SeqEvent::FirstBeat { offset: 30 },
                SeqEvent::Beat { offset: 30, beat: 0 },
            ]
        );
        assert_eq!(sequencer.current_frame(), 10);
        assert_eq!(sequencer.frame_at(29), 149);
        assert_eq!(sequencer.frame_at(35), 5);
    }

    #[test]
    fn test_immediate_rewind() {
        let mut sequencer = Sequencer::new(44100);
        sequencer.set_position(500);
        sequencer.rewind();
        assert_eq!(sequencer.current_frame(), 0);
        assert_eq!(
            sequencer.advance(16, &Actions::new()),
            &[SeqEvent::Rewind { offset: 0 }]
        );
    }

    #[test]
    fn test_frame_at() {
        let mut sequencer = Sequencer::new(44100);
        sequencer.start();
        sequencer.set_position(sequencer.frames_in_loop() - 10);
        sequencer.advance(64, &Actions::new());
        // The block started ten frames before the loop end.
        assert_eq!(sequencer.frame_at(9), sequencer.frames_in_loop() - 1);
        assert_eq!(sequencer.frame_at(10), 0);
    }

    #[test]
    fn test_sample_rate_change_rescales() {
        let mut sequencer = Sequencer::new(44100);
        sequencer.set_position(22050);
        let ratio = sequencer.recompute_frames(88200);
        assert_eq!(ratio, 2.0);
        assert_eq!(sequencer.current_frame(), 44100);
        assert_eq!(sequencer.frames_in_beat(), 44100);
    }
}
