// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! What the transport needs from the platform underneath it.

pub use mei_regs::PciAddress;
use num_derive::{FromPrimitive, ToPrimitive};
use serde::Deserialize;

/// Resets the platform can perform on its own, without the controller.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Deserialize, FromPrimitive, ToPrimitive, strum_macros::Display,
)]
#[serde(rename_all = "kebab-case")]
pub enum ResetType {
    Warm = 0,
    Cold = 1,
    Global = 2,
}

/// Bus, register and timing primitives.
///
/// Reads take `&mut self` because reading a circular buffer window has
/// side effects on the hardware.
pub trait Platform {
    fn pci_read32(&mut self, addr: PciAddress, offset: u16) -> u32;
    fn pci_write32(&mut self, addr: PciAddress, offset: u16, value: u32);

    fn mmio_read32(&mut self, address: u64) -> u32;
    fn mmio_write32(&mut self, address: u64, value: u32);

    /// Busy-wait. There is nothing else to run.
    fn stall_us(&mut self, us: u32);

    /// Tell the bus fabric to start or stop routing transactions to a
    /// function.
    fn set_fabric_routing(&mut self, addr: PciAddress, enabled: bool);

    /// Reset through the chipset's own reset control. On real hardware
    /// this does not return.
    fn hardware_reset(&mut self, kind: ResetType);
}
