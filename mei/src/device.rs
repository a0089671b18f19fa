// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Finding the interface functions and moving them between active and idle.

use crate::platform::{PciAddress, Platform};
use crate::session::Session;
use crate::Error;
use log::{debug, trace, warn};
use mei_regs::{
    D0i3Control, FirmwareStatus, BAR_ADDRESS_MASK, BAR_TYPE_64, BAR_TYPE_MASK, D0I3C, MEI_DEVICE,
    PCI_ALL_ONES, PCI_BAR0_HIGH, PCI_BAR0_LOW, PCI_COMMAND, PCI_COMMAND_BME, PCI_COMMAND_MSE,
    PCI_HFS, PCI_ID, WINDOW_SIZE,
};

/// Interface functions of the management controller
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, strum_macros::Display, strum_macros::EnumIter)]
pub enum Function {
    Heci1,
    Heci2,
    Heci3,
    Heci4,
}

impl Function {
    pub const COUNT: usize = 4;

    pub fn address(self) -> PciAddress {
        let function = match self {
            Function::Heci1 => 0,
            Function::Heci2 => 1,
            Function::Heci3 => 4,
            Function::Heci4 => 5,
        };
        PciAddress::new(0, MEI_DEVICE, function)
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum PowerState {
    Active,
    Quiescent,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeviceHandle {
    pub address: PciAddress,
    pub function: Function,
    pub device_id: u16,
    pub base: u64,
    pub size: u64,
    pub enabled: bool,
    pub power: PowerState,
}

/// What we know about a function. `Absent` is sticky: once the id read
/// came back all-ones we never touch the bus for that function again.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub(crate) enum Slot {
    #[default]
    Unresolved,
    Absent,
    Present(DeviceHandle),
}

impl<P: Platform> Session<P> {
    /// Locate `function`, creating its handle on first use.
    pub fn resolve(&mut self, function: Function) -> Result<DeviceHandle, Error> {
        match self.slots[function.index()] {
            Slot::Present(handle) => return Ok(handle),
            Slot::Absent => return Err(Error::NotFound(function)),
            Slot::Unresolved => {}
        }

        let address = function.address();
        let id = self.platform.pci_read32(address, PCI_ID);
        if id == PCI_ALL_ONES {
            debug!("{function} at {address}: nothing there");
            self.slots[function.index()] = Slot::Absent;
            return Err(Error::NotFound(function));
        }

        let vendor = (id & 0xFFFF) as u16;
        let device_id = (id >> 16) as u16;
        match mei_regs::lookup_device_id(vendor, device_id) {
            Some(known) if known.function == address.function => {}
            _ => warn!("{function} at {address}: unrecognised id {vendor:04x}:{device_id:04x}"),
        }

        let base = self.read_bar(address);
        if base == 0 {
            return Err(Error::Unassigned(function));
        }

        let command = self.platform.pci_read32(address, PCI_COMMAND);
        self.platform.pci_write32(
            address,
            PCI_COMMAND,
            command | PCI_COMMAND_MSE | PCI_COMMAND_BME,
        );

        let d0i3 = D0i3Control::from(self.platform.mmio_read32(base + D0I3C));
        let power = if d0i3.quiesce() {
            PowerState::Quiescent
        } else {
            PowerState::Active
        };

        let handle = DeviceHandle {
            address,
            function,
            device_id,
            base,
            size: WINDOW_SIZE,
            enabled: true,
            power,
        };
        debug!("{function} at {address}: id {device_id:04x}, window {base:#x}, {power}");
        self.slots[function.index()] = Slot::Present(handle);
        Ok(handle)
    }

    /// Handle for a function that may carry traffic. Absent and disabled
    /// functions are `Unsupported`, without touching the bus.
    pub(crate) fn usable_handle(&mut self, function: Function) -> Result<DeviceHandle, Error> {
        if !self.policy.enabled {
            return Err(Error::Unsupported);
        }
        let handle = match self.slots[function.index()] {
            Slot::Absent => return Err(Error::Unsupported),
            Slot::Present(handle) => handle,
            Slot::Unresolved => match self.resolve(function) {
                Ok(handle) => handle,
                Err(Error::NotFound(_)) => return Err(Error::Unsupported),
                Err(e) => return Err(e),
            },
        };
        if !handle.enabled {
            return Err(Error::Unsupported);
        }
        Ok(handle)
    }

    pub(crate) fn handle_mut(&mut self, function: Function) -> Option<&mut DeviceHandle> {
        match &mut self.slots[function.index()] {
            Slot::Present(handle) => Some(handle),
            _ => None,
        }
    }

    pub(crate) fn resolved_handles(&self) -> impl Iterator<Item = DeviceHandle> + '_ {
        self.slots.iter().filter_map(|s| match s {
            Slot::Present(handle) => Some(*handle),
            _ => None,
        })
    }

    pub fn firmware_status(&mut self, function: Function) -> Result<FirmwareStatus, Error> {
        let handle = self.usable_handle(function)?;
        Ok(FirmwareStatus::from(
            self.platform.pci_read32(handle.address, PCI_HFS),
        ))
    }

    /// Move a function between active and idle.
    ///
    /// The fabric stops routing to a function before it is quiesced, and
    /// only starts again once it is back up. A drain indicator that never
    /// clears is logged and ignored; this must not hold up boot.
    pub fn set_power_state(&mut self, function: Function, target: PowerState) -> Result<(), Error> {
        let handle = self.usable_handle(function)?;
        if handle.power == target {
            return Ok(());
        }

        let reg = handle.base + D0I3C;
        let wait = self.policy.timeouts.power();

        if target == PowerState::Quiescent {
            self.platform.set_fabric_routing(handle.address, false);
        }

        if !wait.until(&mut self.platform, |p| {
            !D0i3Control::from(p.mmio_read32(reg)).command_in_progress()
        }) {
            warn!("{function}: drain indicator stuck before {target} transition, proceeding");
        }

        let mut d0i3 = D0i3Control::from(self.platform.mmio_read32(reg));
        d0i3.set_quiesce(target == PowerState::Quiescent);
        // Only ever write back the quiesce request
        d0i3.set_command_in_progress(false);
        trace!("{function}: D0I3C <- {:#x}", u32::from(d0i3));
        self.platform.mmio_write32(reg, d0i3.into());

        if !wait.until(&mut self.platform, |p| {
            !D0i3Control::from(p.mmio_read32(reg)).command_in_progress()
        }) {
            warn!("{function}: {target} transition did not settle, proceeding");
        }

        if let Some(h) = self.handle_mut(function) {
            h.power = target;
        }

        if target == PowerState::Active {
            self.platform.set_fabric_routing(handle.address, true);
        }
        debug!("{function}: now {target}");
        Ok(())
    }

    /// Bring a quiesced function back up before it carries traffic.
    pub(crate) fn ensure_active(&mut self, function: Function) -> Result<DeviceHandle, Error> {
        let handle = self.usable_handle(function)?;
        if handle.power == PowerState::Quiescent {
            self.set_power_state(function, PowerState::Active)?;
        }
        self.usable_handle(function)
    }

    pub(crate) fn read_bar(&mut self, address: PciAddress) -> u64 {
        let low = self.platform.pci_read32(address, PCI_BAR0_LOW);
        let high = if low & BAR_TYPE_MASK == BAR_TYPE_64 {
            self.platform.pci_read32(address, PCI_BAR0_HIGH)
        } else {
            0
        };
        (u64::from(high) << 32) | u64::from(low & BAR_ADDRESS_MASK)
    }

    pub(crate) fn write_bar(&mut self, address: PciAddress, base: u64) {
        let low = self.platform.pci_read32(address, PCI_BAR0_LOW);
        let flags = low & !BAR_ADDRESS_MASK;
        self.platform
            .pci_write32(address, PCI_BAR0_LOW, (base as u32 & BAR_ADDRESS_MASK) | flags);
        if flags & BAR_TYPE_MASK == BAR_TYPE_64 {
            self.platform
                .pci_write32(address, PCI_BAR0_HIGH, (base >> 32) as u32);
        }
    }
}
