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
//! Thread registry.
//!
//! Every thread that touches the engine declares its role once. Operations that
//! are only valid on a particular role check it, and a violation aborts the
//! process: running audio code on the wrong thread is a bug that can corrupt the
//! realtime path, so there is no recovery.

use std::{cell::Cell, fmt};

use tracing::error;

/// The logical role a physical thread plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// The thread that owns user interaction and structural edits.
    Main,
    /// The audio callback thread.
    Render,
    /// MIDI input and output workers.
    Midi,
    /// The single consumer of the deferred-event queue.
    EventWorker,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Main => "main",
            Role::Render => "render",
            Role::Midi => "midi",
            Role::EventWorker => "event-worker",
        };
        f.write_str(name)
    }
}

/// What a thread declared at registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadInfo {
    pub role: Role,
    pub realtime: bool,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ThreadError {
    #[error("thread is already registered as {0}")]
    AlreadyRegistered(Role),
    #[error("thread was never registered")]
    Unregistered,
    #[error("expected a {expected} thread, running on a {found} thread")]
    WrongRole { expected: Role, found: Role },
    #[error("operation is not allowed on the realtime thread")]
    Realtime,
}

thread_local! {
    static CURRENT: Cell<Option<ThreadInfo>> = const { Cell::new(None) };
}

/// Registers the calling thread, failing if it was registered before.
pub fn try_register(role: Role, realtime: bool) -> Result<(), ThreadError> {
    CURRENT.with(|current| match current.get() {
        Some(info) => Err(ThreadError::AlreadyRegistered(info.role)),
        None => {
            current.set(Some(ThreadInfo { role, realtime }));
            Ok(())
        }
    })
}

/// Registers the calling thread. A second registration aborts the process.
pub fn register(role: Role, realtime: bool) {
    if let Err(e) = try_register(role, realtime) {
        fatal(e);
    }
}

/// Registers threads we don't spawn ourselves (driver callbacks) on first use.
/// A thread already registered under another role aborts the process.
pub fn ensure(role: Role, realtime: bool) {
    match current() {
        None => register(role, realtime),
        Some(info) if info.role == role => {}
        Some(info) => fatal(ThreadError::WrongRole {
            expected: role,
            found: info.role,
        }),
    }
}

/// Returns the registration of the calling thread, if any.
pub fn current() -> Option<ThreadInfo> {
    CURRENT.with(|current| current.get())
}

/// Returns true if the calling thread is registered as realtime.
pub fn is_realtime() -> bool {
    current().is_some_and(|info| info.realtime)
}

/// Checks the role of the calling thread without aborting.
pub fn check_role(role: Role) -> Result<(), ThreadError> {
    match current() {
        None => Err(ThreadError::Unregistered),
        Some(info) if info.role == role => Ok(()),
        Some(info) => Err(ThreadError::WrongRole {
            expected: role,
            found: info.role,
        }),
    }
}

/// Checks that the calling thread is registered and may block or allocate.
pub fn check_not_realtime() -> Result<(), ThreadError> {
    match current() {
        None => Err(ThreadError::Unregistered),
        Some(info) if info.realtime => Err(ThreadError::Realtime),
        Some(_) => Ok(()),
    }
}

/// Aborts unless the calling thread is registered with the given role.
pub fn assert_role(role: Role) {
    if let Err(e) = check_role(role) {
        fatal(e);
    }
}

/// Aborts unless the calling thread is registered and not realtime.
pub fn assert_not_realtime() {
    if let Err(e) = check_not_realtime() {
        fatal(e);
    }
}

fn fatal(e: ThreadError) -> ! {
    error!(
        error = %e,
        thread = std::thread::current().name().unwrap_or("unnamed"),
        "Thread contract violated, aborting."
    );
    std::process::abort()
}
