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
//! MIDI clock, in both directions, and MIDI timecode out.

use std::time::Instant;

use midly::live::{LiveEvent, SystemCommon, SystemRealtime};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::message::MidiMessage;
use crate::{
    events::Event,
    sequencer::{Sequencer, MAX_BPM, MIN_BPM},
};

pub const CLOCKS_PER_BEAT: u32 = 24;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    #[default]
    None,
    /// Sends clock to other devices.
    Master,
    /// Follows an external clock.
    Slave,
    /// Sends MIDI timecode to other devices.
    MtcMaster,
}

/// MIDI timecode frame rates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MtcFps {
    Fps24,
    #[default]
    Fps25,
    Fps30,
}

impl MtcFps {
    pub fn from_fps(fps: u32) -> Option<MtcFps> {
        match fps {
            24 => Some(MtcFps::Fps24),
            25 => Some(MtcFps::Fps25),
            30 => Some(MtcFps::Fps30),
            _ => None,
        }
    }

    pub fn fps(self) -> u64 {
        match self {
            MtcFps::Fps24 => 24,
            MtcFps::Fps25 => 25,
            MtcFps::Fps30 => 30,
        }
    }

    /// SMPTE rate code sent with the hours.
    fn rate_code(self) -> u8 {
        match self {
            MtcFps::Fps24 => 0,
            MtcFps::Fps25 => 1,
            MtcFps::Fps30 => 3,
        }
    }
}

/// Produces clock messages from the transport. Runs on the render thread.
#[derive(Debug, Default)]
pub struct ClockMaster {
    was_running: bool,
}

impl ClockMaster {
    /// Emits START or STOP on transport changes and a CLOCK on every 24th of
    /// a beat inside the block. Clock positions are rounded per tick, so a
    /// beat always holds exactly 24 of them.
    pub fn process(
        &mut self,
        sequencer: &Sequencer,
        frames: usize,
        mut send: impl FnMut(MidiMessage),
    ) {
        let running = sequencer.is_running();
        if running != self.was_running {
            self.was_running = running;
            send(if running {
                MidiMessage::start()
            } else {
                MidiMessage::stop()
            });
        }
        if !running {
            return;
        }
        let beat = sequencer.frames_in_beat().max(1) as u64;
        let ticks = CLOCKS_PER_BEAT as u64;
        for offset in 0..frames {
            let frame = sequencer.frame_at(offset) as u64;
            if frame == 0 || frame * ticks / beat != (frame - 1) * ticks / beat {
                send(MidiMessage::clock());
            }
        }
    }

    /// The transport went back to the top.
    pub fn rewind(&self, mut send: impl FnMut(MidiMessage)) {
        send(MidiMessage::song_position(0));
    }
}

/// Produces MIDI timecode from the transport. Runs on the render thread.
///
/// Time counts up from the last rewind while the transport runs, across
/// loop wraps. Quarter frames go out four per timecode frame; each group of
/// eight carries the time latched at its first piece. Starting the transport
/// sends a full frame to cue receivers.
#[derive(Debug, Default)]
pub struct TimecodeMaster {
    fps: MtcFps,
    was_running: bool,
    /// Frames rendered while running since the last rewind.
    elapsed: u64,
}

impl TimecodeMaster {
    pub fn new(fps: MtcFps) -> TimecodeMaster {
        TimecodeMaster {
            fps,
            ..TimecodeMaster::default()
        }
    }

    pub fn process(
        &mut self,
        sequencer: &Sequencer,
        frames: usize,
        mut send: impl FnMut(MidiMessage),
    ) {
        let running = sequencer.is_running();
        let rate = sequencer.sample_rate().max(1) as u64;
        if running && !self.was_running {
            send(self.full_frame(self.elapsed * self.fps.fps() / rate));
        }
        self.was_running = running;
        if !running {
            return;
        }
        let quarters = self.fps.fps() * 4;
        for _ in 0..frames {
            let at = self.elapsed;
            let quarter = at * quarters / rate;
            if at == 0 || quarter != (at - 1) * quarters / rate {
                send(self.quarter_frame(quarter));
            }
            self.elapsed += 1;
        }
    }

    /// The transport went back to the top.
    pub fn rewind(&mut self, mut send: impl FnMut(MidiMessage)) {
        self.elapsed = 0;
        send(self.full_frame(0));
    }

    /// Hours, minutes, seconds and frames of a timecode frame count.
    fn split(&self, frames: u64) -> [u8; 4] {
        let fps = self.fps.fps();
        let seconds = frames / fps;
        [
            ((seconds / 3600) % 24) as u8,
            ((seconds / 60) % 60) as u8,
            (seconds % 60) as u8,
            (frames % fps) as u8,
        ]
    }

    fn full_frame(&self, frames: u64) -> MidiMessage {
        let [hours, minutes, seconds, frames] = self.split(frames);
        MidiMessage::full_frame(self.fps.rate_code(), hours, minutes, seconds, frames)
    }

    fn quarter_frame(&self, quarter: u64) -> MidiMessage {
        let piece = (quarter % 8) as u8;
        let [hours, minutes, seconds, frames] = self.split((quarter - piece as u64) / 4);
        let value = match piece {
            0 => frames & 0x0F,
            1 => frames >> 4,
            2 => seconds & 0x0F,
            3 => seconds >> 4,
            4 => minutes & 0x0F,
            5 => minutes >> 4,
            6 => hours & 0x0F,
            _ => (hours >> 4) | (self.fps.rate_code() << 1),
        };
        MidiMessage::quarter_frame(piece, value)
    }
}

/// Turns an external clock into transport events. Runs on the MIDI input
/// thread; nothing it produces is applied directly.
#[derive(Debug, Default)]
pub struct ClockSlave {
    clocks: u32,
    beat_start: Option<Instant>,
    bpm: Option<f32>,
}

impl ClockSlave {
    pub fn new() -> ClockSlave {
        ClockSlave::default()
    }

    /// Returns true for messages this handles, whether or not they produced
    /// an event.
    pub fn is_sync_message(bytes: &[u8]) -> bool {
        matches!(
            LiveEvent::parse(bytes),
            Ok(LiveEvent::Realtime(
                SystemRealtime::TimingClock
                    | SystemRealtime::Start
                    | SystemRealtime::Continue
                    | SystemRealtime::Stop
            )) | Ok(LiveEvent::Common(SystemCommon::SongPosition(_)))
        )
    }

    pub fn handle(&mut self, bytes: &[u8], now: Instant) -> Option<Event> {
        match LiveEvent::parse(bytes).ok()? {
            LiveEvent::Realtime(SystemRealtime::TimingClock) => self.clock(now),
            LiveEvent::Realtime(SystemRealtime::Start | SystemRealtime::Continue) => {
                self.reset(now);
                Some(Event::MidiClockStart)
            }
            LiveEvent::Realtime(SystemRealtime::Stop) => {
                self.beat_start = None;
                Some(Event::MidiClockStop)
            }
            LiveEvent::Common(SystemCommon::SongPosition(position)) => {
                Some(Event::MidiClockChangePosition {
                    sixteenths: position.as_int(),
                })
            }
            _ => None,
        }
    }

    fn reset(&mut self, now: Instant) {
        self.clocks = 0;
        self.beat_start = Some(now);
    }

    /// Measures a beat every 24 clocks. Only changes of a tenth of a BPM or
    /// more are reported.
    fn clock(&mut self, now: Instant) -> Option<Event> {
        let Some(start) = self.beat_start else {
            self.reset(now);
            return None;
        };
        self.clocks += 1;
        if self.clocks < CLOCKS_PER_BEAT {
            return None;
        }
        self.reset(now);

        let seconds = now.duration_since(start).as_secs_f32();
        if seconds <= 0.0 {
            return None;
        }
        let bpm = ((60.0 / seconds) * 10.0).round() / 10.0;
        let bpm = bpm.clamp(MIN_BPM, MAX_BPM);
        if self.bpm == Some(bpm) {
            return None;
        }
        debug!(bpm, "External clock tempo changed.");
        self.bpm = Some(bpm);
        Some(Event::MidiClockChangeBpm { bpm })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        midi::message::{CLOCK, CONTINUE, SONG_POSITION, START, STOP},
        model::actions::Actions,
    };

    #[test]
    fn test_master_sends_start_clocks_and_stop() {
        let mut sequencer = Sequencer::new(2400);
        sequencer.set_bpm(60.0);
        let mut clock = ClockMaster::default();
        let mut sent = Vec::new();

        clock.process(&sequencer, 200, |m| sent.push(m));
        assert!(sent.is_empty());

        sequencer.start();
        sequencer.advance(200, &Actions::new());
        clock.process(&sequencer, 200, |m| sent.push(m));
        // 2400 frames per beat, a clock every 100 frames.
        assert_eq!(sent[0], MidiMessage::start());
        assert_eq!(&sent[1..], &[MidiMessage::clock(), MidiMessage::clock()]);

        sent.clear();
        sequencer.stop();
        clock.process(&sequencer, 200, |m| sent.push(m));
        assert_eq!(sent, vec![MidiMessage::stop()]);
    }

    #[test]
    fn test_master_sends_exactly_24_clocks_per_beat() {
        // 22050 frames per beat does not divide by 24.
        let mut sequencer = Sequencer::new(44100);
        sequencer.set_bpm(120.0);
        sequencer.start();
        let mut clock = ClockMaster::default();
        let mut clocks = 0;
        let block = 441;
        for _ in 0..sequencer.frames_in_beat() * 4 / block {
            sequencer.advance(block, &Actions::new());
            clock.process(&sequencer, block, |m| {
                if m == MidiMessage::clock() {
                    clocks += 1;
                }
            });
        }
        assert_eq!(sequencer.frames_in_beat(), 22050);
        assert_eq!(clocks, 4 * CLOCKS_PER_BEAT);
    }

    #[test]
    fn test_timecode_quarter_frames() {
        let mut sequencer = Sequencer::new(48000);
        let mut timecode = TimecodeMaster::new(MtcFps::Fps25);
        let mut sent = Vec::new();

        timecode.process(&sequencer, 480, |m| sent.push(m));
        assert!(sent.is_empty());

        sequencer.start();
        // One second: 25 frames, 100 quarter frames.
        for _ in 0..100 {
            sequencer.advance(480, &Actions::new());
            timecode.process(&sequencer, 480, |m| sent.push(m));
        }
        assert_eq!(sent[0], MidiMessage::full_frame(1, 0, 0, 0, 0));
        let quarters: Vec<_> = sent[1..].iter().map(|m| m.as_bytes()[1]).collect();
        assert_eq!(quarters.len(), 100);
        assert_eq!(&quarters[..8], &[0x00, 0x10, 0x20, 0x30, 0x40, 0x50, 0x60, 0x72]);
        // The second group starts at frame 2, the last one at frame 24.
        assert_eq!(quarters[8], 0x02);
        assert_eq!(&quarters[96..98], &[0x08, 0x11]);

        sent.clear();
        timecode.rewind(|m| sent.push(m));
        assert_eq!(sent, vec![MidiMessage::full_frame(1, 0, 0, 0, 0)]);
    }

    #[test]
    fn test_timecode_cues_on_restart() {
        let mut sequencer = Sequencer::new(48000);
        let mut timecode = TimecodeMaster::new(MtcFps::Fps30);
        sequencer.start();
        for _ in 0..200 {
            sequencer.advance(480, &Actions::new());
            timecode.process(&sequencer, 480, |_| {});
        }
        sequencer.stop();
        timecode.process(&sequencer, 480, |_| {});

        let mut sent = Vec::new();
        sequencer.start();
        sequencer.advance(480, &Actions::new());
        timecode.process(&sequencer, 480, |m| sent.push(m));
        // Two seconds were sent before the stop.
        assert_eq!(sent[0], MidiMessage::full_frame(3, 0, 0, 2, 0));
        assert_eq!(MtcFps::from_fps(29), None);
    }

    #[test]
    fn test_slave_measures_tempo() {
        let mut slave = ClockSlave::new();
        let start = Instant::now();
        assert_eq!(slave.handle(&[START], start), Some(Event::MidiClockStart));

        // 24 clocks over half a second is 120 BPM.
        let tick = Duration::from_micros(500_000 / 24);
        let mut last = None;
        for i in 1..=CLOCKS_PER_BEAT {
            last = slave.handle(&[CLOCK], start + tick * i);
        }
        assert_eq!(last, Some(Event::MidiClockChangeBpm { bpm: 120.0 }));

        // The same tempo again is not reported.
        let next = start + tick * CLOCKS_PER_BEAT;
        let mut last = None;
        for i in 1..=CLOCKS_PER_BEAT {
            last = slave.handle(&[CLOCK], next + tick * i);
        }
        assert_eq!(last, None);
    }

    #[test]
    fn test_slave_transport_messages() {
        let mut slave = ClockSlave::new();
        let now = Instant::now();
        assert_eq!(slave.handle(&[CONTINUE], now), Some(Event::MidiClockStart));
        assert_eq!(slave.handle(&[STOP], now), Some(Event::MidiClockStop));
        assert_eq!(
            slave.handle(&[SONG_POSITION, 0x10, 0x01], now),
            Some(Event::MidiClockChangePosition { sixteenths: 0x90 })
        );
        assert!(ClockSlave::is_sync_message(&[CLOCK]));
        assert!(!ClockSlave::is_sync_message(&[0x90, 60, 100]));
    }
}
