// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Window base guard for the reduced-trust execution context.
//!
//! Once lower-trust code runs it can rewrite the BAR of an interface
//! function and point the register window anywhere. Before the privileged
//! handler touches the window it forces the BAR back to the value recorded
//! while firmware still owned the platform, checks that the write took, and
//! puts back whatever was there on the way out.

use crate::device::Function;
use crate::platform::Platform;
use crate::session::Session;
use crate::Error;
use log::{debug, warn};

/// Window base recorded once per boot. Used only for comparison.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BarSnapshot {
    function: Function,
    base: u64,
}

impl BarSnapshot {
    pub fn function(&self) -> Function {
        self.function
    }

    pub fn base(&self) -> u64 {
        self.base
    }
}

impl<P: Platform> Session<P> {
    /// Record the live window base of `function`. Must happen before the
    /// platform is reachable by lower-trust code, and only once.
    pub fn capture_bar(&mut self, function: Function) -> Result<BarSnapshot, Error> {
        if self.snapshot.is_some() {
            return Err(Error::AlreadyCaptured);
        }
        let handle = self.usable_handle(function)?;
        let base = self.read_bar(handle.address);
        if base == 0 {
            return Err(Error::Unassigned(function));
        }
        let snapshot = BarSnapshot { function, base };
        debug!("{function}: captured window base {base:#x}");
        self.snapshot = Some(snapshot);
        Ok(snapshot)
    }

    pub fn bar_snapshot(&self) -> Option<BarSnapshot> {
        self.snapshot
    }

    /// Run `body` against the captured window, and only if the window
    /// was never moved.
    ///
    /// A BAR that differs from the snapshot on entry is forced back and
    /// re-read to check the rewrite took, but the body never runs. The entry
    /// value is restored whatever happens.
    pub fn guarded<T, F>(&mut self, body: F) -> Result<T, Error>
    where
        F: FnOnce(&mut Session<P>) -> Result<T, Error>,
    {
        let snapshot = self.snapshot.ok_or(Error::NotCaptured)?;
        let handle = self.usable_handle(snapshot.function)?;
        let address = handle.address;

        let entry = self.read_bar(address);
        self.write_bar(address, snapshot.base);
        let found = self.read_bar(address);

        let result = if entry != snapshot.base {
            warn!(
                "{}: window moved to {entry:#x} since capture, refusing access",
                snapshot.function
            );
            if found != snapshot.base {
                debug!("{}: rewrite did not stick ({found:#x})", snapshot.function);
            }
            Err(Error::Tampered {
                expected: snapshot.base,
                found: entry,
            })
        } else if found != snapshot.base {
            warn!(
                "{}: window base reads back {found:#x}, refusing access",
                snapshot.function
            );
            Err(Error::Tampered {
                expected: snapshot.base,
                found,
            })
        } else {
            body(self)
        };

        self.write_bar(address, entry);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::{Request, Response};
    use crate::policy::Policy;
    use crate::session::BootMode;
    use crate::sim::{SimPlatform, DEFAULT_BAR};

    fn captured() -> Session<SimPlatform> {
        let mut s = Session::new(SimPlatform::new(), Policy::default(), BootMode::Normal);
        s.capture_bar(Function::Heci1).unwrap();
        s
    }

    #[test]
    fn capture_happens_once() {
        let mut s = captured();
        assert_eq!(s.bar_snapshot().unwrap().base(), DEFAULT_BAR);
        assert!(matches!(
            s.capture_bar(Function::Heci1),
            Err(Error::AlreadyCaptured)
        ));
    }

    #[test]
    fn guard_needs_a_snapshot() {
        let mut s = Session::new(SimPlatform::new(), Policy::default(), BootMode::Normal);
        let mut ran = false;
        let r = s.guarded(|_| {
            ran = true;
            Ok(())
        });
        assert!(matches!(r, Err(Error::NotCaptured)));
        assert!(!ran);
    }

    #[test]
    fn untouched_window_runs_body() {
        let mut s = captured();
        let r = s.guarded(|s| s.exchange(&Request::EndOfPost));
        assert!(matches!(r, Ok(Response::EndOfPost { .. })));
        assert_eq!(s.platform.bar(Function::Heci1), DEFAULT_BAR);
    }

    #[test]
    fn locked_relocation_never_runs_body() {
        let mut s = captured();
        let moved = 0x7F00_0000;
        s.platform.relocate_bar(Function::Heci1, moved, true);

        let mut ran = false;
        let r = s.guarded(|_| {
            ran = true;
            Ok(())
        });

        assert!(!ran);
        assert!(matches!(
            r,
            Err(Error::Tampered { expected: DEFAULT_BAR, found }) if found == moved
        ));
        assert_eq!(s.platform.bar(Function::Heci1), moved);
        assert!(s.platform.controller.requests.is_empty());
    }

    #[test]
    fn relocated_window_never_runs_body() {
        let mut s = captured();
        let moved = 0x9000_0000;
        s.platform.relocate_bar(Function::Heci1, moved, false);

        let mut ran = false;
        let r = s.guarded(|s| {
            ran = true;
            s.exchange(&Request::EndOfPost).map(|_| ())
        });

        assert!(!ran);
        assert!(matches!(
            r,
            Err(Error::Tampered { expected: DEFAULT_BAR, found }) if found == moved
        ));
        assert_eq!(s.platform.bar(Function::Heci1), moved);
        assert!(s.platform.controller.requests.is_empty());
    }

    #[test]
    fn trusted_exchange_refuses_relocated_window() {
        let mut s = captured();
        s.platform.relocate_bar(Function::Heci1, 0x9000_0000, false);
        assert!(matches!(
            s.trusted_exchange(&Request::EndOfPost),
            Err(Error::Tampered { .. })
        ));
        assert!(s.platform.controller.requests.is_empty());
    }

    #[test]
    fn entry_value_is_restored_when_body_fails() {
        let mut s = captured();
        let r: Result<(), Error> = s.guarded(|_| Err(Error::Unsupported));
        assert!(matches!(r, Err(Error::Unsupported)));
        assert_eq!(s.platform.bar(Function::Heci1), DEFAULT_BAR);
    }
}
