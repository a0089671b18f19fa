// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Policy values handed to us by the config-block reader.

use crate::wait::{BoundedWait, POLL_INTERVAL_US};
use crate::Error;
use serde::Deserialize;

/// Observed retry cap for a single call
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Which retry discipline owns the channel.
///
/// This is decided once per channel. With `Bounded`, call sites that want
/// retries wrap themselves in [`crate::supervisor::with_retry`]. With
/// `ChannelWide`, every exchange already runs under the supervisor and call
/// sites send once.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RetryMode {
    #[default]
    Bounded,
    ChannelWide,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct Timeouts {
    /// Controller ready after a reset, and before every send
    pub ready_ms: u32,
    /// Ring space for one burst
    pub send_ms: u32,
    /// First burst of a response
    pub receive_ms: u32,
    /// Drain indicator during power-state transitions
    pub power_ms: u32,
    /// Acknowledgement of a controller-mediated reset
    pub reset_ack_ms: u32,
}

impl Default for Timeouts {
    fn default() -> Timeouts {
        Timeouts {
            ready_ms: 2000,
            send_ms: 5000,
            receive_ms: 5000,
            power_ms: 5000,
            reset_ack_ms: 100,
        }
    }
}

impl Timeouts {
    pub fn ready(&self) -> BoundedWait {
        BoundedWait::from_millis(self.ready_ms, POLL_INTERVAL_US)
    }

    pub fn send(&self) -> BoundedWait {
        BoundedWait::from_millis(self.send_ms, POLL_INTERVAL_US)
    }

    pub fn receive(&self) -> BoundedWait {
        BoundedWait::from_millis(self.receive_ms, POLL_INTERVAL_US)
    }

    pub fn power(&self) -> BoundedWait {
        BoundedWait::from_millis(self.power_ms, POLL_INTERVAL_US)
    }

    pub fn reset_ack(&self) -> BoundedWait {
        BoundedWait::from_millis(self.reset_ack_ms, POLL_INTERVAL_US)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct Policy {
    /// Master switch for the channel
    pub enabled: bool,
    pub end_of_post: bool,
    pub telemetry: bool,
    pub retry_mode: RetryMode,
    pub max_attempts: u32,
    pub timeouts: Timeouts,
    /// How long to wait for a controller-mediated reset to take effect
    /// before falling back to the chipset reset
    pub reset_delay_ms: u32,
    /// Bus address of the platform's bus owner, if one should be assigned
    pub bus_owner: Option<u16>,
    pub host_capabilities: u32,
}

impl Default for Policy {
    fn default() -> Policy {
        Policy {
            enabled: true,
            end_of_post: true,
            telemetry: true,
            retry_mode: RetryMode::Bounded,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            timeouts: Timeouts::default(),
            reset_delay_ms: 1000,
            bus_owner: None,
            host_capabilities: 0,
        }
    }
}

impl Policy {
    pub fn from_toml(text: &str) -> Result<Policy, Error> {
        Ok(toml::from_str(text)?)
    }
}
