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
use std::sync::atomic::{AtomicU32, Ordering};

/// An f32 stored as its bit pattern, so loads and stores are never torn.
#[derive(Debug, Default)]
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    pub fn new(value: f32) -> AtomicF32 {
        AtomicF32(AtomicU32::new(value.to_bits()))
    }

    pub fn load(&self, order: Ordering) -> f32 {
        f32::from_bits(self.0.load(order))
    }

    pub fn store(&self, value: f32, order: Ordering) {
        self.0.store(value.to_bits(), order)
    }

    /// Raises the stored value to `value` if it is larger. Used by peak meters.
    pub fn fetch_max(&self, value: f32, order: Ordering) {
        let _ = self
            .0
            .fetch_update(order, Ordering::Relaxed, |bits| {
                (value > f32::from_bits(bits)).then_some(value.to_bits())
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let value = AtomicF32::new(0.5);
        assert_eq!(value.load(Ordering::Acquire), 0.5);
        value.store(-1.25, Ordering::Release);
        assert_eq!(value.load(Ordering::Acquire), -1.25);
    }

    #[test]
    fn test_fetch_max() {
        let value = AtomicF32::new(0.5);
        value.fetch_max(0.25, Ordering::AcqRel);
        assert_eq!(value.load(Ordering::Acquire), 0.5);
        value.fetch_max(0.75, Ordering::AcqRel);
        assert_eq!(value.load(Ordering::Acquire), 0.75);
    }
}
