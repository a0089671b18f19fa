// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::device::{Function, Slot};
use crate::guard::BarSnapshot;
use crate::platform::{Platform, ResetType};
use crate::policy::Policy;
use crate::transport::LinkState;
use log::{info, warn};

/// Boot phase reported by the boot-mode collaborator
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, strum_macros::Display)]
pub enum BootMode {
    #[default]
    Normal,
    /// Resuming from a sleep state; the controller kept its context
    Resume,
    Recovery,
}

/// Undrained notifications kept before the oldest are dropped
pub const MAX_NOTIFICATIONS: usize = 32;

/// Events for the reset orchestrator and other feature drivers
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    EndOfPostSent,
    /// The controller asked for a reset; the reset path should honor it
    ResetRequested(ResetType),
    TelemetryPushed { ports: usize },
    /// The fail-safe disable ran. Nothing should try the channel again.
    InterfacesDisabled,
}

/// The boot orchestrator's handle on the channel.
///
/// The window base and ring pointers are shared by every execution
/// context, so all of it sits behind one lock. Code outside the crate can
/// only reach a [`Session`] by holding it.
pub struct Mei<P: Platform> {
    session: spin::Mutex<Session<P>>,
}

impl<P: Platform> Mei<P> {
    pub fn new(platform: P, policy: Policy, boot_mode: BootMode) -> Mei<P> {
        Mei {
            session: spin::Mutex::new(Session::new(platform, policy, boot_mode)),
        }
    }

    /// Take the channel lock for the duration of one or more transactions.
    pub fn lock(&self) -> spin::MutexGuard<'_, Session<P>> {
        self.session.lock()
    }

    #[cfg(test)]
    pub(crate) fn into_inner(self) -> Session<P> {
        self.session.into_inner()
    }
}

/// Long-lived channel state, reachable only under the [`Mei`] lock.
pub struct Session<P: Platform> {
    pub(crate) platform: P,
    pub(crate) policy: Policy,
    pub(crate) boot_mode: BootMode,
    pub(crate) slots: [Slot; Function::COUNT],
    pub(crate) links: [LinkState; Function::COUNT],
    pub(crate) snapshot: Option<BarSnapshot>,
    pending_reset: Option<ResetType>,
    notifications: Vec<Notification>,
}

impl<P: Platform> Session<P> {
    /// Only [`Mei::new`] builds a session outside of tests.
    pub(crate) fn new(platform: P, policy: Policy, boot_mode: BootMode) -> Session<P> {
        Session {
            platform,
            policy,
            boot_mode,
            slots: Default::default(),
            links: Default::default(),
            snapshot: None,
            pending_reset: None,
            notifications: Vec::new(),
        }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn boot_mode(&self) -> BootMode {
        self.boot_mode
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    pub fn link_state(&self, function: Function) -> LinkState {
        self.links[function.index()]
    }

    /// Record that a global reset must happen. Acting on it is the reset
    /// path's job.
    pub fn request_global_reset(&mut self, kind: ResetType) {
        info!("controller requested a {kind} reset; deferring to reset path");
        self.pending_reset = Some(kind);
        self.notify(Notification::ResetRequested(kind));
    }

    pub fn pending_reset(&self) -> Option<ResetType> {
        self.pending_reset
    }

    pub(crate) fn take_pending_reset(&mut self) -> Option<ResetType> {
        self.pending_reset.take()
    }

    pub(crate) fn notify(&mut self, n: Notification) {
        if self.notifications.len() == MAX_NOTIFICATIONS {
            let dropped = self.notifications.remove(0);
            warn!("notification queue full, dropping {dropped:?}");
        }
        self.notifications.push(n);
    }

    /// Hand queued notifications to collaborators. The boot orchestrator
    /// drains these after each boot step; past [`MAX_NOTIFICATIONS`] the
    /// oldest are lost.
    pub fn take_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.notifications)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimPlatform;

    #[test]
    fn lock_gives_exclusive_session() {
        let mei = Mei::new(SimPlatform::new(), Policy::default(), BootMode::Normal);
        {
            let mut s = mei.lock();
            s.request_global_reset(ResetType::Global);
        }
        assert!(mei.session.try_lock().is_some());
        let mut s = mei.into_inner();
        assert_eq!(s.pending_reset(), Some(ResetType::Global));
        assert_eq!(
            s.take_notifications(),
            vec![Notification::ResetRequested(ResetType::Global)]
        );
        assert!(s.take_notifications().is_empty());
    }

    #[test]
    fn second_locker_waits() {
        let mei = Mei::new(SimPlatform::new(), Policy::default(), BootMode::Normal);
        let held = mei.lock();
        assert!(mei.session.try_lock().is_none());
        drop(held);
        assert!(mei.session.try_lock().is_some());
    }

    #[test]
    fn undrained_notifications_are_bounded() {
        let mei = Mei::new(SimPlatform::new(), Policy::default(), BootMode::Normal);
        let mut s = mei.lock();
        s.notify(Notification::EndOfPostSent);
        for _ in 0..MAX_NOTIFICATIONS {
            s.notify(Notification::InterfacesDisabled);
        }
        let queued = s.take_notifications();
        assert_eq!(queued.len(), MAX_NOTIFICATIONS);
        assert!(!queued.contains(&Notification::EndOfPostSent));
    }
}
