// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host firmware side of the management controller mailbox.
//!
//! Messages travel over a pair of register-backed circular buffers exposed
//! through a memory-mapped window (see [`mei_regs`]). Everything that
//! touches that window goes through a [`Session`], which can only be
//! reached by taking the single lock held by [`Mei`].

pub mod device;
pub mod guard;
pub mod lifecycle;
pub mod msg;
pub mod platform;
pub mod policy;
pub mod session;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod supervisor;
pub mod transport;
pub mod wait;

pub use device::{DeviceHandle, Function, PowerState};
pub use session::{BootMode, Mei, Notification, Session};

use thiserror::Error;

/// The five outcomes every transaction folds into. The supervisor decides
/// what to do next purely from this value.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum Status {
    Success,
    Timeout,
    DeviceError,
    Unsupported,
    BufferTooSmall,
}

impl Status {
    pub fn of<T>(result: &Result<T, Error>) -> Status {
        match result {
            Ok(_) => Status::Success,
            Err(e) => e.status(),
        }
    }
}

/// Which bounded wait ran out
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum Stage {
    #[strum(serialize = "interface ready")]
    Ready,
    #[strum(serialize = "ring space")]
    Send,
    #[strum(serialize = "response")]
    Receive,
}

/// Errors encountered while talking to the management controller.
#[derive(Debug, Error)]
pub enum Error {
    /// A bounded poll ran out before the hardware got where we needed it.
    #[error("timed out waiting for {0}")]
    Timeout(Stage),

    /// The far end rejected the request or answered with something we
    /// can't accept as a response to it.
    #[error("controller error: {0}")]
    DeviceError(#[from] Fault),

    /// The function is absent, disabled, or the controller is in a mode
    /// that doesn't serve this message family.
    #[error("not supported in the controller's current state")]
    Unsupported,

    /// The response was fully drained from the ring but did not fit.
    #[error("response of {needed} bytes does not fit in {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// Nothing answered at the function's bus address.
    #[error("no controller function present at {0}")]
    NotFound(Function),

    /// The function answered but firmware never gave it a window.
    #[error("{0} has no register window assigned")]
    Unassigned(Function),

    /// Payloads are exchanged in whole ring slots.
    #[error("payload of {0} bytes is not a whole number of transfer units")]
    InvalidLength(usize),

    /// Receive without a send in flight, or a send while the previous
    /// exchange is unfinished or awaiting reset.
    #[error("transport operation out of sequence")]
    OutOfSequence,

    #[error("window base snapshot was already captured this boot")]
    AlreadyCaptured,

    #[error("window base snapshot has not been captured")]
    NotCaptured,

    /// The forced rewrite of the window base did not stick.
    #[error("window base reads {found:#x} after rewrite, snapshot is {expected:#x}")]
    Tampered { expected: u64, found: u64 },

    // NOTE: no #[from] here; pack and unpack share an error type and we
    // want to say which one failed at the call site.
    #[error("packing message record failed")]
    Packing(#[source] packed_struct::PackingError),

    #[error("policy file is malformed")]
    Policy(#[from] toml::de::Error),
}

impl Error {
    pub fn status(&self) -> Status {
        match self {
            Error::Timeout(_) => Status::Timeout,
            Error::Unsupported | Error::NotFound(_) => Status::Unsupported,
            Error::BufferTooSmall { .. } => Status::BufferTooSmall,
            Error::DeviceError(_)
            | Error::Unassigned(_)
            | Error::InvalidLength(_)
            | Error::OutOfSequence
            | Error::AlreadyCaptured
            | Error::NotCaptured
            | Error::Tampered { .. }
            | Error::Packing(_)
            | Error::Policy(_) => Status::DeviceError,
        }
    }
}

/// Ways a response can be malformed or refused.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum Fault {
    #[error("response echoes group {got_group:#04x} command {got_command:#04x}, expected {group:#04x}/{command:#04x}")]
    EchoMismatch {
        group: u8,
        command: u8,
        got_group: u8,
        got_command: u8,
    },

    #[error("message is missing the response flag")]
    NotAResponse,

    #[error("request arrived with the response flag set")]
    UnexpectedResponse,

    #[error("expected a {expected} byte record, got {got}")]
    LengthMismatch { expected: usize, got: usize },

    #[error("zero-length message")]
    ZeroLength,

    #[error("controller rejected request with result {0:#04x}")]
    Rejected(u8),

    #[error("message from client {got_ctrl:#04x}->{got_host:#04x}, expected {ctrl:#04x}->{host:#04x}")]
    AddressMismatch {
        host: u8,
        ctrl: u8,
        got_host: u8,
        got_ctrl: u8,
    },

    #[error("unknown message family group {group:#04x} command {command:#04x}")]
    UnknownFamily { group: u8, command: u8 },

    #[error("controller refused protocol version {major}.{minor}")]
    VersionRefused { major: u8, minor: u8 },

    #[error("burst of {0} slots exceeds the ring")]
    BurstOverrun(usize),

    #[error("ring depth {0} cannot carry a burst")]
    RingTooSmall(u8),

    #[error("record carries {0} ports, more than the structure holds")]
    TooManyPorts(usize),

    #[error("unknown reset type {0}")]
    UnknownResetType(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_fold_taxonomy() {
        assert_eq!(Error::Timeout(Stage::Receive).status(), Status::Timeout);
        assert_eq!(Error::NotFound(Function::Heci2).status(), Status::Unsupported);
        assert_eq!(Error::from(Fault::ZeroLength).status(), Status::DeviceError);
        assert_eq!(
            Error::BufferTooSmall {
                needed: 8,
                available: 4
            }
            .status(),
            Status::BufferTooSmall
        );
        assert_eq!(Status::of::<()>(&Ok(())), Status::Success);
    }
}
