// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Boot-phase milestones built on top of the transport.
//!
//! None of these may hold up boot: every step reports its outcome and the
//! caller moves on.

use crate::msg::{Family, LinkFacts, MemoryFacts, PostAction, Request, Response, Telemetry, MAX_PORTS};
use crate::platform::{Platform, ResetType};
use crate::policy::RetryMode;
use crate::session::{BootMode, Notification, Session};
use crate::supervisor::with_retry;
use crate::transport::ReadMode;
use crate::{Error, Fault, Status};
use log::{info, warn};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PostOutcome {
    /// Disabled by policy, or nothing to do in this boot mode
    Skipped,
    Continue,
    /// The controller wants a global reset; it has been handed to the
    /// reset path
    ResetRequested,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Completion {
    Skipped,
    Done,
}

/// What the platform learned during memory and link training
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PlatformFacts {
    pub memory: MemoryFacts,
    pub ports: [Option<LinkFacts>; MAX_PORTS],
}

impl PlatformFacts {
    /// Telemetry record carrying only the ports that trained.
    pub fn telemetry(&self) -> Telemetry {
        Telemetry {
            memory: self.memory,
            ports: self.ports.iter().flatten().copied().collect(),
        }
    }
}

/// How a global reset was carried out. On real hardware the platform reset
/// does not return, so this is only ever seen against a model.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ResetPath {
    pub controller_accepted: bool,
}

/// One exchange under the supervisor. A timeout is retried up to the
/// attempt cap and then shuts the channel down.
fn supervised<P: Platform>(s: &mut Session<P>, request: &Request) -> Result<Response, Error> {
    match s.policy.retry_mode {
        // The channel already retries every exchange
        RetryMode::ChannelWide => s.exchange(request),
        RetryMode::Bounded => {
            let attempts = s.policy.max_attempts;
            with_retry(s, request.family().function(), attempts, |s| {
                s.exchange(request)
            })
        }
    }
}

/// Tell the controller the platform is leaving firmware.
pub fn end_of_post<P: Platform>(s: &mut Session<P>) -> Result<PostOutcome, Error> {
    if !s.policy.end_of_post {
        info!("end-of-post disabled by policy");
        return Ok(PostOutcome::Skipped);
    }
    if s.boot_mode == BootMode::Resume {
        info!("resuming; controller already past end-of-post");
        return Ok(PostOutcome::Skipped);
    }

    let response = supervised(s, &Request::EndOfPost)?;

    let action = match response {
        Response::EndOfPost { action } => action,
        _ => return Err(Fault::NotAResponse.into()),
    };
    s.notify(Notification::EndOfPostSent);
    info!("end-of-post acknowledged");

    match action {
        PostAction::Continue => Ok(PostOutcome::Continue),
        PostAction::GlobalReset => {
            s.request_global_reset(ResetType::Global);
            Ok(PostOutcome::ResetRequested)
        }
    }
}

/// Push memory and link facts in a single transaction sized to the ports
/// that are populated.
pub fn push_telemetry<P: Platform>(
    s: &mut Session<P>,
    facts: &PlatformFacts,
) -> Result<Completion, Error> {
    if !s.policy.telemetry || s.boot_mode == BootMode::Resume {
        return Ok(Completion::Skipped);
    }
    let telemetry = facts.telemetry();
    let ports = telemetry.ports.len();
    supervised(s, &Request::PlatformTelemetry(telemetry))?;
    s.notify(Notification::TelemetryPushed { ports });
    info!("pushed telemetry for {ports} ports");
    Ok(Completion::Done)
}

/// Announce host capabilities. Returns the subset the controller granted.
pub fn push_host_capabilities<P: Platform>(s: &mut Session<P>) -> Result<u32, Error> {
    let requested = s.policy.host_capabilities;
    match supervised(s, &Request::HostCapabilities(requested))? {
        Response::HostCapabilities { granted } => {
            if granted != requested {
                info!("host capabilities {requested:#x} requested, {granted:#x} granted");
            }
            Ok(granted)
        }
        _ => Err(Fault::NotAResponse.into()),
    }
}

/// Point the controller at the platform's bus owner, if policy names one.
pub fn assign_bus_owner<P: Platform>(s: &mut Session<P>) -> Result<Completion, Error> {
    let Some(address) = s.policy.bus_owner else {
        return Ok(Completion::Skipped);
    };
    supervised(s, &Request::SetBusOwner { address })?;
    info!("bus owner set to {address:#06x}");
    Ok(Completion::Done)
}

/// Ask the controller to reset the platform, then reset it ourselves
/// whether or not it agreed.
pub fn global_reset<P: Platform>(s: &mut Session<P>, kind: ResetType) -> ResetPath {
    let ack = ReadMode::Within(s.policy.timeouts.reset_ack());
    let accepted = match s.exchange_with(&Request::GlobalReset(kind), ack) {
        Ok(_) => true,
        Err(e) => {
            warn!("controller did not take the {kind} reset: {e}");
            false
        }
    };

    if accepted {
        let delay_us = s.policy.reset_delay_ms.saturating_mul(1000);
        s.platform.stall_us(delay_us);
        warn!("controller-mediated {kind} reset did not happen, falling back");
    }
    s.platform.hardware_reset(kind);
    ResetPath {
        controller_accepted: accepted,
    }
}

/// Carry out a reset the controller asked for earlier, if any.
pub fn honor_pending_reset<P: Platform>(s: &mut Session<P>) -> Option<ResetPath> {
    let kind = s.take_pending_reset()?;
    Some(global_reset(s, kind))
}

/// Per-step outcome of [`run_boot_phase`]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BootReport {
    pub host_capabilities: Status,
    pub bus_owner: Status,
    pub telemetry: Status,
    pub end_of_post: Status,
    pub reset: Option<ResetPath>,
}

/// The end-of-boot sequence. Failures are logged and the next step runs
/// anyway.
pub fn run_boot_phase<P: Platform>(s: &mut Session<P>, facts: &PlatformFacts) -> BootReport {
    fn step<T>(name: Family, r: Result<T, Error>) -> Status {
        if let Err(e) = &r {
            warn!("{name} failed: {e}");
        }
        Status::of(&r)
    }

    let host_capabilities = if s.policy.host_capabilities != 0 {
        step(Family::HostCapabilities, push_host_capabilities(s))
    } else {
        Status::Success
    };
    let bus_owner = step(Family::SetBusOwner, assign_bus_owner(s));
    let telemetry = step(Family::PlatformTelemetry, push_telemetry(s, facts));
    let end_of_post = step(Family::EndOfPost, end_of_post(s));
    let reset = honor_pending_reset(s);

    BootReport {
        host_capabilities,
        bus_owner,
        telemetry,
        end_of_post,
        reset,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::capability;
    use crate::policy::{Policy, DEFAULT_MAX_ATTEMPTS};
    use crate::sim::{SimEvent, SimPlatform};
    use crate::{Function, Stage};

    fn session_with(sim: SimPlatform, policy: Policy, mode: BootMode) -> Session<SimPlatform> {
        let _ = env_logger::builder().is_test(true).try_init();
        Session::new(sim, policy, mode)
    }

    fn session(sim: SimPlatform) -> Session<SimPlatform> {
        session_with(sim, Policy::default(), BootMode::Normal)
    }

    fn facts(trained: &[u8]) -> PlatformFacts {
        let mut facts = PlatformFacts {
            memory: MemoryFacts {
                ratio: 0x18,
                reference_clock: 133,
                channels: 2,
            },
            ..Default::default()
        };
        for &port in trained {
            facts.ports[usize::from(port)] = Some(LinkFacts {
                port,
                width: 16,
                speed: 4,
            });
        }
        facts
    }

    #[test]
    fn end_of_post_continue() {
        let mut s = session(SimPlatform::new());
        assert_eq!(end_of_post(&mut s).unwrap(), PostOutcome::Continue);
        assert_eq!(s.take_notifications(), vec![Notification::EndOfPostSent]);
        assert_eq!(s.pending_reset(), None);
    }

    #[test]
    fn end_of_post_reset_is_recorded_not_acted_on() {
        let mut sim = SimPlatform::new();
        sim.controller.end_of_post_action = PostAction::GlobalReset;
        let mut s = session(sim);

        assert_eq!(end_of_post(&mut s).unwrap(), PostOutcome::ResetRequested);
        assert_eq!(s.pending_reset(), Some(ResetType::Global));
        assert_eq!(s.platform.hardware_resets, 0);
        assert_eq!(
            s.take_notifications(),
            vec![
                Notification::EndOfPostSent,
                Notification::ResetRequested(ResetType::Global)
            ]
        );
    }

    #[test]
    fn end_of_post_retries_in_bounded_mode() {
        let mut sim = SimPlatform::new();
        sim.faults.drop_responses = 2;
        let mut s = session(sim);
        assert_eq!(end_of_post(&mut s).unwrap(), PostOutcome::Continue);
        assert_eq!(s.platform.controller.resets, 2);
    }

    #[test]
    fn end_of_post_sends_once_in_channel_wide_mode() {
        let mut sim = SimPlatform::new();
        sim.faults.drop_responses = 3;
        let policy = Policy {
            retry_mode: RetryMode::ChannelWide,
            max_attempts: 3,
            ..Policy::default()
        };
        let mut s = session_with(sim, policy, BootMode::Normal);

        assert!(matches!(
            end_of_post(&mut s),
            Err(Error::Timeout(Stage::Receive))
        ));
        // Three attempts from the channel, none stacked on top
        let sent = s
            .platform
            .controller
            .requests
            .iter()
            .filter(|r| **r == Request::EndOfPost)
            .count();
        assert_eq!(sent, 3);
    }

    #[test]
    fn resume_skips_post_and_telemetry() {
        let mut s = session_with(SimPlatform::new(), Policy::default(), BootMode::Resume);
        assert_eq!(end_of_post(&mut s).unwrap(), PostOutcome::Skipped);
        assert_eq!(
            push_telemetry(&mut s, &facts(&[0])).unwrap(),
            Completion::Skipped
        );
        assert_eq!(s.platform.bus_accesses, 0);
    }

    #[test]
    fn policy_can_turn_off_post() {
        let policy = Policy {
            end_of_post: false,
            ..Policy::default()
        };
        let mut s = session_with(SimPlatform::new(), policy, BootMode::Normal);
        assert_eq!(end_of_post(&mut s).unwrap(), PostOutcome::Skipped);
        assert!(s.platform.controller.requests.is_empty());
    }

    #[test]
    fn telemetry_carries_only_trained_ports() {
        let mut s = session(SimPlatform::new());
        let facts = facts(&[1, 4]);
        assert_eq!(push_telemetry(&mut s, &facts).unwrap(), Completion::Done);

        let pushed = s.platform.controller.telemetry.clone().unwrap();
        assert_eq!(pushed.memory, facts.memory);
        assert_eq!(
            pushed.ports.iter().map(|p| p.port).collect::<Vec<_>>(),
            vec![1, 4]
        );
        assert_eq!(s.platform.controller.last_request_len, 16);
        assert_eq!(
            s.take_notifications(),
            vec![Notification::TelemetryPushed { ports: 2 }]
        );
    }

    #[test]
    fn full_telemetry_is_larger() {
        let mut s = session(SimPlatform::new());
        push_telemetry(&mut s, &facts(&[0, 1, 2, 3, 4, 5])).unwrap();
        assert_eq!(s.platform.controller.last_request_len, 32);
    }

    #[test]
    fn host_capabilities_report_grant() {
        let policy = Policy {
            host_capabilities: capability::WATCHDOG | capability::TRUSTED_REGISTER_ACCESS,
            ..Policy::default()
        };
        let mut sim = SimPlatform::new();
        sim.controller.supported_capabilities = capability::WATCHDOG | capability::TELEMETRY;
        let mut s = session_with(sim, policy, BootMode::Normal);
        assert_eq!(push_host_capabilities(&mut s).unwrap(), capability::WATCHDOG);
    }

    #[test]
    fn bus_owner_only_when_configured() {
        let mut s = session(SimPlatform::new());
        assert_eq!(assign_bus_owner(&mut s).unwrap(), Completion::Skipped);

        let policy = Policy {
            bus_owner: Some(0x20),
            ..Policy::default()
        };
        let mut s = session_with(SimPlatform::new(), policy, BootMode::Normal);
        assert_eq!(assign_bus_owner(&mut s).unwrap(), Completion::Done);
        assert_eq!(s.platform.controller.bus_owner, Some(0x20));
    }

    #[test]
    fn accepted_reset_still_falls_back() {
        let mut s = session(SimPlatform::new());
        let start = s.platform.elapsed_us;
        let path = global_reset(&mut s, ResetType::Global);
        assert!(path.controller_accepted);
        assert_eq!(s.platform.controller.accepted_reset, Some(ResetType::Global));
        assert!(s.platform.elapsed_us - start >= 1_000_000);
        assert_eq!(
            s.platform.events.last(),
            Some(&SimEvent::HardwareReset(ResetType::Global))
        );
    }

    #[test]
    fn refused_reset_falls_back_immediately() {
        let mut sim = SimPlatform::new();
        sim.faults.refuse_global_reset = true;
        let mut s = session(sim);
        let start = s.platform.elapsed_us;
        let path = global_reset(&mut s, ResetType::Cold);
        assert!(!path.controller_accepted);
        assert_eq!(s.platform.elapsed_us, start);
        assert_eq!(s.platform.hardware_resets, 1);
    }

    #[test]
    fn silent_controller_gets_a_short_wait() {
        let mut sim = SimPlatform::new();
        sim.faults.drop_responses = 1;
        let mut s = session(sim);
        let start = s.platform.elapsed_us;
        let path = global_reset(&mut s, ResetType::Global);
        assert!(!path.controller_accepted);
        let waited = s.platform.elapsed_us - start;
        assert!(waited >= 100_000);
        assert!(waited < 1_000_000);
        assert_eq!(s.platform.hardware_resets, 1);
    }

    #[test]
    fn absent_controller_still_resets() {
        let mut sim = SimPlatform::new();
        sim.remove_function(Function::Heci1);
        let mut s = session(sim);
        let path = global_reset(&mut s, ResetType::Warm);
        assert!(!path.controller_accepted);
        assert_eq!(
            s.platform.events,
            vec![SimEvent::HardwareReset(ResetType::Warm)]
        );
    }

    #[test]
    fn boot_phase_survives_dead_channel() {
        let mut sim = SimPlatform::new();
        sim.faults.drop_responses = u32::MAX;
        let policy = Policy {
            bus_owner: Some(0x10),
            max_attempts: 2,
            ..Policy::default()
        };
        let mut s = session_with(sim, policy, BootMode::Normal);

        let report = run_boot_phase(&mut s, &facts(&[0]));
        assert_eq!(report.bus_owner, Status::Timeout);
        // Bus owner gave up and shut everything down
        assert_eq!(report.telemetry, Status::Unsupported);
        assert_eq!(report.end_of_post, Status::Unsupported);
        assert_eq!(report.reset, None);

        assert_eq!(
            s.take_notifications(),
            vec![Notification::InterfacesDisabled]
        );
        let bus_owner_sends = s
            .platform
            .controller
            .requests
            .iter()
            .filter(|r| matches!(r, Request::SetBusOwner { .. }))
            .count();
        assert_eq!(bus_owner_sends, 2);
    }

    #[test]
    fn dead_channel_during_telemetry_is_disabled() {
        let mut sim = SimPlatform::new();
        sim.faults.drop_responses = u32::MAX;
        let mut s = session(sim);

        assert!(matches!(
            push_telemetry(&mut s, &facts(&[0, 3])),
            Err(Error::Timeout(Stage::Receive))
        ));
        assert_eq!(s.platform.controller.resets, DEFAULT_MAX_ATTEMPTS - 1);
        assert_eq!(
            s.take_notifications(),
            vec![Notification::InterfacesDisabled]
        );
        assert_eq!(
            s.platform.controller.requests.last(),
            Some(&Request::DisableInterfaces)
        );
        assert!(matches!(
            push_host_capabilities(&mut s),
            Err(Error::Unsupported)
        ));
    }

    #[test]
    fn host_capabilities_retry_after_timeout() {
        let mut sim = SimPlatform::new();
        sim.faults.drop_responses = 1;
        let policy = Policy {
            host_capabilities: capability::WATCHDOG,
            ..Policy::default()
        };
        let mut s = session_with(sim, policy, BootMode::Normal);
        assert_eq!(push_host_capabilities(&mut s).unwrap(), capability::WATCHDOG);
        assert_eq!(s.platform.controller.resets, 1);
        assert!(s.take_notifications().is_empty());
    }

    #[test]
    fn boot_phase_honors_requested_reset() {
        let mut sim = SimPlatform::new();
        sim.controller.end_of_post_action = PostAction::GlobalReset;
        let mut s = session(sim);

        let report = run_boot_phase(&mut s, &facts(&[2]));
        assert_eq!(report.end_of_post, Status::Success);
        assert_eq!(
            report.reset,
            Some(ResetPath {
                controller_accepted: true
            })
        );
        assert_eq!(s.platform.hardware_resets, 1);
        assert_eq!(s.pending_reset(), None);
    }
}
