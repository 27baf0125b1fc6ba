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
mod audio;
mod polling;

pub use audio::{audio_test_utils, write_wav};
pub use polling::eventually;

use crate::thread::{self, Role};

/// Registers the test thread as the main thread. Test threads are reused by
/// the harness, so a previous registration is fine.
pub fn register_main() {
    let _ = thread::try_register(Role::Main, false);
}
