// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::platform::Platform;

/// Interval used by every poll loop in the crate
pub const POLL_INTERVAL_US: u32 = 1000;

/// A predicate poll with an iteration-derived timeout. This is the only
/// place the crate spins on hardware.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BoundedWait {
    pub interval_us: u32,
    pub attempts: u32,
}

impl BoundedWait {
    pub fn from_millis(timeout_ms: u32, interval_us: u32) -> BoundedWait {
        let interval_us = interval_us.max(1);
        let attempts = (u64::from(timeout_ms) * 1000 / u64::from(interval_us)).max(1);
        BoundedWait {
            interval_us,
            attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        }
    }

    /// Check once and give up immediately.
    pub const fn once() -> BoundedWait {
        BoundedWait {
            interval_us: 0,
            attempts: 0,
        }
    }

    pub fn timeout_us(&self) -> u64 {
        u64::from(self.attempts) * u64::from(self.interval_us)
    }

    /// Poll `done` until it holds or the attempts run out. Returns whether
    /// it held.
    pub fn until<P, F>(&self, platform: &mut P, mut done: F) -> bool
    where
        P: Platform + ?Sized,
        F: FnMut(&mut P) -> bool,
    {
        for _ in 0..self.attempts {
            if done(platform) {
                return true;
            }
            platform.stall_us(self.interval_us);
        }
        done(platform)
    }
}
