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
//! Click-free gain ramps.

use crate::model::Frame;

/// Gain change per frame of a full-length fade.
pub const DEFAULT_FADE_STEP: f32 = 0.01;

/// Length of a full fade, in frames.
pub const FADE_FRAMES: usize = 100;

/// What happens once a fade-out reaches zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PostFade {
    /// The user mute takes over.
    Mute,
    /// The internal (action driven) mute takes over.
    MuteInternal,
    /// The channel was stopped; the fade only plays the outgoing tail.
    HardStop,
    /// Like [PostFade::HardStop], but the read position is remembered.
    Pause,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FadeKind {
    None,
    FadeIn,
    FadeOut(PostFade),
    /// The outgoing tail fades out while the new head fades in.
    Crossfade,
}

/// Per-channel envelope state.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Fade {
    kind: FadeKind,
    step: f32,
    frames: usize,
    frames_left: usize,
    /// First frame of the current block the fade applies to.
    start: usize,
}

impl Default for Fade {
    fn default() -> Fade {
        Fade::none()
    }
}

/// Number of frames a fade-out may last when `remaining` frames are left
/// before the end of the playable range.
pub fn fadeout_frames(remaining: Frame) -> usize {
    remaining.min(FADE_FRAMES)
}

/// Gain step for a fade-out with `remaining` frames left before the range end.
/// Short tails get a steeper ramp so the fade never reads past `end`.
pub fn calc_fadeout_step(remaining: Frame) -> f32 {
    match fadeout_frames(remaining) {
        0 => 1.0,
        FADE_FRAMES => DEFAULT_FADE_STEP,
        frames => 1.0 / frames as f32,
    }
}

impl Fade {
    pub fn none() -> Fade {
        Fade {
            kind: FadeKind::None,
            step: 0.0,
            frames: 0,
            frames_left: 0,
            start: 0,
        }
    }

    pub fn fade_in(start: usize) -> Fade {
        Fade {
            kind: FadeKind::FadeIn,
            step: DEFAULT_FADE_STEP,
            frames: FADE_FRAMES,
            frames_left: FADE_FRAMES,
            start,
        }
    }

    /// A fade-out starting at `start` with `remaining` frames of material left.
    pub fn fade_out(start: usize, remaining: Frame, post: PostFade) -> Fade {
        Fade::ramp_down(FadeKind::FadeOut(post), start, remaining)
    }

    pub fn crossfade(start: usize, remaining: Frame) -> Fade {
        Fade::ramp_down(FadeKind::Crossfade, start, remaining)
    }

    fn ramp_down(kind: FadeKind, start: usize, remaining: Frame) -> Fade {
        let frames = fadeout_frames(remaining);
        if frames == 0 {
            return Fade::none();
        }
        Fade {
            kind,
            step: calc_fadeout_step(remaining),
            frames,
            frames_left: frames,
            start,
        }
    }

    pub fn kind(&self) -> FadeKind {
        self.kind
    }

    pub fn is_active(&self) -> bool {
        self.kind != FadeKind::None
    }

    pub fn step(&self) -> f32 {
        self.step
    }

    /// Frames until the ramp completes.
    pub fn steps_to_zero(&self) -> usize {
        self.frames_left
    }

    pub fn start(&self) -> usize {
        self.start
    }

    /// True for fades that render the outgoing cursor.
    pub fn uses_tail(&self) -> bool {
        matches!(
            self.kind,
            FadeKind::Crossfade
                | FadeKind::FadeOut(PostFade::HardStop)
                | FadeKind::FadeOut(PostFade::Pause)
        )
    }

    /// Returns the gain for the next frame, or None when the ramp is done.
    /// For fade-outs and crossfades this is the gain of the outgoing signal.
    pub fn advance(&mut self) -> Option<f32> {
        if self.frames_left == 0 || self.kind == FadeKind::None {
            return None;
        }
        self.frames_left -= 1;
        let done = (self.frames - self.frames_left) as f32 / self.frames as f32;
        Some(match self.kind {
            FadeKind::FadeIn => done,
            _ => 1.0 - done,
        })
    }

    /// Called at the end of each block: later blocks start at frame zero.
    pub fn next_block(&mut self) {
        self.start = 0;
        if self.frames_left == 0 {
            *self = Fade::none();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fade_out_never_outlasts_range() {
        for remaining in [0, 1, 2, 7, 50, 99, 100, 101, 10_000] {
            let fade = Fade::fade_out(0, remaining, PostFade::HardStop);
            assert!(fade.steps_to_zero() <= remaining);
            if fade.is_active() {
                let total = fade.steps_to_zero() as f32 * fade.step();
                assert!((total - 1.0).abs() < 1e-4, "remaining {}", remaining);
            }
        }
    }

    #[test]
    fn test_default_step() {
        assert_eq!(calc_fadeout_step(1000), DEFAULT_FADE_STEP);
        assert_eq!(calc_fadeout_step(50), 1.0 / 50.0);
        assert_eq!(calc_fadeout_step(0), 1.0);
    }

    #[test]
    fn test_fade_out_reaches_zero() {
        let mut fade = Fade::fade_out(0, 4, PostFade::Mute);
        let gains: Vec<f32> = std::iter::from_fn(|| fade.advance()).collect();
        assert_eq!(gains, vec![0.75, 0.5, 0.25, 0.0]);
        fade.next_block();
        assert!(!fade.is_active());
    }

    #[test]
    fn test_fade_in_reaches_one() {
        let mut fade = Fade::fade_in(3);
        assert_eq!(fade.start(), 3);
        let gains: Vec<f32> = std::iter::from_fn(|| fade.advance()).collect();
        assert_eq!(gains.len(), FADE_FRAMES);
        assert_eq!(*gains.last().unwrap(), 1.0);
        assert!(gains.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_tail_fades() {
        assert!(Fade::crossfade(0, 500).uses_tail());
        assert!(Fade::fade_out(0, 500, PostFade::Pause).uses_tail());
        assert!(!Fade::fade_out(0, 500, PostFade::MuteInternal).uses_tail());
        assert!(!Fade::crossfade(0, 0).is_active());
    }
}
