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
//! Scheduling of the audio callback thread.
//!
//! The callback thread belongs to the audio driver, so its priority is set from
//! inside the first callback. That code must not log; the outcome is kept in a
//! [SchedulingState] for the owning device to report.

use std::sync::atomic::{AtomicU8, Ordering};

use thread_priority::{set_current_thread_priority, ThreadPriority, ThreadPriorityValue};

/// Default priority for the audio callback thread when MLOOP_THREAD_PRIORITY is unset.
const DEFAULT_CALLBACK_THREAD_PRIORITY: u8 = 70;

/// How the callback thread ended up being scheduled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Scheduling {
    /// No callback has run yet.
    Unset,
    /// Raised priority only.
    Normal,
    /// SCHED_FIFO.
    Realtime,
    /// SCHED_FIFO was requested and refused, usually for lack of rtprio.
    RealtimeRefused,
}

impl Scheduling {
    fn from_u8(value: u8) -> Scheduling {
        match value {
            1 => Scheduling::Normal,
            2 => Scheduling::Realtime,
            3 => Scheduling::RealtimeRefused,
            _ => Scheduling::Unset,
        }
    }
}

/// Written once by the callback thread, read by anyone.
#[derive(Debug, Default)]
pub struct SchedulingState(AtomicU8);

impl SchedulingState {
    pub fn get(&self) -> Scheduling {
        Scheduling::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, scheduling: Scheduling) {
        self.0.store(scheduling as u8, Ordering::Release)
    }
}

fn parse_priority(value: &str) -> Option<ThreadPriorityValue> {
    let n = value.trim().parse::<u8>().ok()?;
    if n < 100 {
        ThreadPriorityValue::try_from(n).ok()
    } else {
        None
    }
}

/// Reads MLOOP_THREAD_PRIORITY (0-99) once; used when building the callback so we don't touch env in the hot path.
pub fn callback_thread_priority() -> Option<ThreadPriorityValue> {
    std::env::var("MLOOP_THREAD_PRIORITY")
        .ok()
        .and_then(|v| parse_priority(&v))
        .or_else(|| ThreadPriorityValue::try_from(DEFAULT_CALLBACK_THREAD_PRIORITY).ok())
}

pub(crate) fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| {
            v == "1"
                || v.eq_ignore_ascii_case("true")
                || v.eq_ignore_ascii_case("yes")
                || v.eq_ignore_ascii_case("on")
        })
        .unwrap_or(false)
}

/// Returns whether we should attempt RT (SCHED_FIFO) scheduling for the audio callback thread.
/// Default: enabled. Advanced users can opt out with MLOOP_DISABLE_RT_AUDIO=1.
pub fn rt_audio_enabled() -> bool {
    !env_flag("MLOOP_DISABLE_RT_AUDIO")
}

/// Raises the calling thread's priority once. Later calls return right away.
pub fn configure_audio_thread_priority(
    priority: Option<ThreadPriorityValue>,
    rt_audio: bool,
    state: &SchedulingState,
) {
    if state.get() != Scheduling::Unset {
        return;
    }
    let Some(priority) = priority else {
        state.set(Scheduling::Normal);
        return;
    };
    let tp = ThreadPriority::Crossplatform(priority);
    let _ = set_current_thread_priority(tp);

    let mut scheduling = Scheduling::Normal;
    #[cfg(unix)]
    if rt_audio {
        use thread_priority::unix::{
            set_thread_priority_and_policy, thread_native_id, RealtimeThreadSchedulePolicy,
            ThreadSchedulePolicy,
        };
        let tid = thread_native_id();
        scheduling = match set_thread_priority_and_policy(
            tid,
            tp,
            ThreadSchedulePolicy::Realtime(RealtimeThreadSchedulePolicy::Fifo),
        ) {
            Ok(()) => Scheduling::Realtime,
            Err(_) => Scheduling::RealtimeRefused,
        };
    }
    #[cfg(not(unix))]
    let _ = rt_audio;

    state.set(scheduling);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_priority() {
        assert_eq!(parse_priority("80"), ThreadPriorityValue::try_from(80u8).ok());
        assert_eq!(parse_priority(" 0 "), ThreadPriorityValue::try_from(0u8).ok());
        assert!(parse_priority("100").is_none());
        assert!(parse_priority("high").is_none());
    }

    #[test]
    fn test_configure_runs_once() {
        let state = SchedulingState::default();
        assert_eq!(state.get(), Scheduling::Unset);
        std::thread::spawn(move || {
            configure_audio_thread_priority(None, false, &state);
            assert_eq!(state.get(), Scheduling::Normal);
            // Already configured, nothing changes.
            configure_audio_thread_priority(
                ThreadPriorityValue::try_from(10u8).ok(),
                true,
                &state,
            );
            assert_eq!(state.get(), Scheduling::Normal);
        })
        .join()
        .unwrap();
    }
}
