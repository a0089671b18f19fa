// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Retry with interface reset, and the fail-safe that shuts a channel
//! down when retrying doesn't help.

use crate::device::Function;
use crate::msg::{Family, Request};
use crate::platform::Platform;
use crate::session::{Notification, Session};
use crate::{Error, Status};
use log::{debug, warn};

/// What the retry loop needs from the channel between attempts
pub trait Recover {
    fn reset(&mut self, function: Function) -> Result<(), Error>;

    /// Ask the controller to drop every interface, ignoring the outcome,
    /// and never use any of them again this boot.
    fn disable_all(&mut self);
}

/// Run `f` up to `max_attempts` times.
///
/// Only a timeout is worth another try, after an interface reset. Every
/// other outcome is returned as is. If the reset itself fails, or every
/// attempt times out, the channel is disabled and the last error returned.
pub fn with_retry<C, T, F>(
    ctx: &mut C,
    function: Function,
    max_attempts: u32,
    mut f: F,
) -> Result<T, Error>
where
    C: Recover,
    F: FnMut(&mut C) -> Result<T, Error>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let result = f(ctx);
        if Status::of(&result) != Status::Timeout {
            return result;
        }

        if attempt == max_attempts {
            warn!("{function}: no response after {max_attempts} attempts, disabling interfaces");
            ctx.disable_all();
            return result;
        }

        debug!("{function}: attempt {attempt} timed out, resetting interface");
        if let Err(e) = ctx.reset(function) {
            warn!("{function}: interface reset failed ({e}), disabling interfaces");
            ctx.disable_all();
            return Err(e);
        }
        attempt += 1;
    }
}

impl<P: Platform> Recover for Session<P> {
    fn reset(&mut self, function: Function) -> Result<(), Error> {
        self.reset_interface(function)
    }

    fn disable_all(&mut self) {
        let family = Family::DisableInterfaces;
        match Request::DisableInterfaces.encode() {
            Ok(bytes) => {
                if let Err(e) = self.post(family.function(), &bytes, family.address()) {
                    debug!("disable request not delivered: {e}");
                }
            }
            Err(e) => debug!("disable request not encoded: {e}"),
        }

        let handles: Vec<_> = self.resolved_handles().collect();
        for handle in handles {
            self.platform.set_fabric_routing(handle.address, false);
            if let Some(h) = self.handle_mut(handle.function) {
                h.enabled = false;
            }
        }
        self.notify(Notification::InterfacesDisabled);
    }
}
