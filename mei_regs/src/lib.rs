// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Register layout for the management controller interface functions.
//!
//! Everything here is declarative: PCI configuration offsets, offsets into
//! the memory-mapped register window, and shift/mask accessors for the
//! registers the transport touches. No register is ever accessed through a
//! compiler-laid-out bit-field; every field below is an explicit range over
//! a `u32`.

use bitfield::bitfield;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

/// PCI device number shared by every interface function.
pub const MEI_DEVICE: u8 = 0x16;

pub const VENDOR_INTEL: u16 = 0x8086;

/// Location of a function on the platform bus.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PciAddress {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciAddress {
    pub const fn new(bus: u8, device: u8, function: u8) -> PciAddress {
        PciAddress {
            bus,
            device,
            function,
        }
    }
}

impl std::fmt::Display for PciAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.device, self.function)
    }
}

// PCI configuration space
pub const PCI_ID: u16 = 0x00;
pub const PCI_COMMAND: u16 = 0x04;
pub const PCI_BAR0_LOW: u16 = 0x10;
pub const PCI_BAR0_HIGH: u16 = 0x14;
/// Host firmware status, mirrored by the controller into config space
pub const PCI_HFS: u16 = 0x40;

/// Value read back from config space when nothing decodes the access
pub const PCI_ALL_ONES: u32 = 0xFFFF_FFFF;

/// Memory space enable
pub const PCI_COMMAND_MSE: u32 = 1 << 1;
/// Bus master enable
pub const PCI_COMMAND_BME: u32 = 1 << 2;

/// BAR type field, bits 2:1. `0b10` is a 64-bit memory BAR.
pub const BAR_TYPE_MASK: u32 = 0b110;
pub const BAR_TYPE_64: u32 = 0b100;
pub const BAR_ADDRESS_MASK: u32 = !0xF;

/// Size of the register window decoded by BAR0
pub const WINDOW_SIZE: u64 = 0x1000;

// Offsets into the register window
/// Host circular buffer write window
pub const H_CB_WW: u64 = 0x00;
/// Host control and status
pub const H_CSR: u64 = 0x04;
/// Controller circular buffer read window
pub const ME_CB_RW: u64 = 0x08;
/// Controller control and status, host read access
pub const ME_CSR_HA: u64 = 0x0C;
/// Idle/active power-state control
pub const D0I3C: u64 = 0x800;

/// Size in bytes of one slot of either circular buffer
pub const TRANSFER_UNIT: usize = 4;

bitfield! {
    /// Host side control and status. The read/write pointers and depth are
    /// read-only; writes to them are ignored by hardware.
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct HostCsr(u32);
    impl Debug;
    pub interrupt_enable, set_interrupt_enable: 0;
    /// Write 1 to clear
    pub interrupt_status, set_interrupt_status: 1;
    /// Doorbell: tells the controller there is something to look at
    pub interrupt_generate, set_interrupt_generate: 2;
    pub ready, set_ready: 3;
    pub reset, set_reset: 4;
    pub u8, read_ptr, set_read_ptr: 15, 8;
    pub u8, write_ptr, set_write_ptr: 23, 16;
    pub u8, depth, set_depth: 31, 24;
}

bitfield! {
    /// Controller side control and status, as seen by the host. Same
    /// layout as [`HostCsr`], all of it read-only from our side.
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct MeCsr(u32);
    impl Debug;
    pub interrupt_enable, set_interrupt_enable: 0;
    pub interrupt_status, set_interrupt_status: 1;
    pub interrupt_generate, set_interrupt_generate: 2;
    pub ready, set_ready: 3;
    pub reset, set_reset: 4;
    pub u8, read_ptr, set_read_ptr: 15, 8;
    pub u8, write_ptr, set_write_ptr: 23, 16;
    pub u8, depth, set_depth: 31, 24;
}

/// Number of occupied slots in a ring. The pointers are free-running 8-bit
/// counters so the difference is taken modulo 256.
fn filled(read_ptr: u8, write_ptr: u8) -> u8 {
    write_ptr.wrapping_sub(read_ptr)
}

impl HostCsr {
    /// Slots in the host ring the controller has not consumed yet
    pub fn filled_slots(&self) -> u8 {
        filled(self.read_ptr(), self.write_ptr())
    }

    /// Slots available for the host to write into
    pub fn empty_slots(&self) -> u8 {
        self.depth().saturating_sub(self.filled_slots())
    }
}

impl MeCsr {
    /// Slots the controller has written that the host has not read yet
    pub fn filled_slots(&self) -> u8 {
        filled(self.read_ptr(), self.write_ptr())
    }
}

impl From<u32> for HostCsr {
    fn from(v: u32) -> HostCsr {
        HostCsr(v)
    }
}

impl From<HostCsr> for u32 {
    fn from(r: HostCsr) -> u32 {
        r.0
    }
}

impl From<u32> for MeCsr {
    fn from(v: u32) -> MeCsr {
        MeCsr(v)
    }
}

impl From<MeCsr> for u32 {
    fn from(r: MeCsr) -> u32 {
        r.0
    }
}

bitfield! {
    /// Idle/active control. `command_in_progress` is the drain indicator:
    /// the device is still finishing a previous transition while it is set.
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct D0i3Control(u32);
    impl Debug;
    pub command_in_progress, set_command_in_progress: 0;
    pub interrupt_request, set_interrupt_request: 1;
    /// Quiesce request; set means idle
    pub quiesce, set_quiesce: 2;
    pub restore_required, set_restore_required: 3;
}

impl From<u32> for D0i3Control {
    fn from(v: u32) -> D0i3Control {
        D0i3Control(v)
    }
}

impl From<D0i3Control> for u32 {
    fn from(r: D0i3Control) -> u32 {
        r.0
    }
}

bitfield! {
    /// Leading slot of every burst written to either ring. Length counts
    /// transfer units following the header.
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct BurstHeader(u32);
    impl Debug;
    pub u8, ctrl_addr, set_ctrl_addr: 7, 0;
    pub u8, host_addr, set_host_addr: 15, 8;
    pub u16, length, set_length: 24, 16;
    pub complete, set_complete: 31;
}

/// Largest length the burst header can express
pub const BURST_LENGTH_MAX: u16 = 0x1FF;

impl From<u32> for BurstHeader {
    fn from(v: u32) -> BurstHeader {
        BurstHeader(v)
    }
}

impl From<BurstHeader> for u32 {
    fn from(r: BurstHeader) -> u32 {
        r.0
    }
}

bitfield! {
    /// First host firmware status register
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct FirmwareStatus(u32);
    impl Debug;
    pub u8, working_state_raw, _: 3, 0;
    pub manufacturing_mode, _: 4;
    pub u8, operation_state_raw, _: 8, 6;
    pub init_complete, _: 9;
    pub u8, error_code, _: 15, 12;
    pub u8, operation_mode_raw, _: 19, 16;
}

impl From<u32> for FirmwareStatus {
    fn from(v: u32) -> FirmwareStatus {
        FirmwareStatus(v)
    }
}

impl From<FirmwareStatus> for u32 {
    fn from(r: FirmwareStatus) -> u32 {
        r.0
    }
}

/// FirmwareStatus[3:0]
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, strum_macros::Display)]
pub enum WorkingState {
    Reset = 0,
    Initializing = 1,
    Recovery = 2,
    Test = 3,
    Disabled = 4,
    Normal = 5,
    Wait = 6,
    Transition = 7,
}

/// FirmwareStatus[19:16]
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, strum_macros::Display)]
pub enum OperationMode {
    Normal = 0,
    Debug = 2,
    Disabled = 3,
    OverrideJumper = 4,
    OverrideMei = 5,
}

impl FirmwareStatus {
    pub fn working_state(&self) -> Option<WorkingState> {
        WorkingState::from_u8(self.working_state_raw())
    }

    pub fn operation_mode(&self) -> Option<OperationMode> {
        OperationMode::from_u8(self.operation_mode_raw())
    }

    /// The controller only services the full set of message families when
    /// it is up, in its normal mode, and has no error latched.
    pub fn is_normal(&self) -> bool {
        self.working_state() == Some(WorkingState::Normal)
            && self.operation_mode() == Some(OperationMode::Normal)
            && self.error_code() == 0
    }
}

/// One entry of the device-ID table
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeviceId {
    pub id: u16,
    pub function: u8,
    pub name: &'static str,
}

/// Interface functions known on this silicon generation
pub const DEVICE_IDS: &[DeviceId] = &[
    DeviceId {
        id: 0x51E0,
        function: 0,
        name: "HECI1",
    },
    DeviceId {
        id: 0x51E1,
        function: 1,
        name: "HECI2",
    },
    DeviceId {
        id: 0x51E4,
        function: 4,
        name: "HECI3",
    },
    DeviceId {
        id: 0x51E5,
        function: 5,
        name: "HECI4",
    },
];

pub fn lookup_device_id(vendor: u16, device: u16) -> Option<&'static DeviceId> {
    if vendor != VENDOR_INTEL {
        return None;
    }
    DEVICE_IDS.iter().find(|d| d.id == device)
}
