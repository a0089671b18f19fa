// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Software model of the chipset side: PCI configuration space, the
//! register window with both rings, and a controller that decodes requests
//! with the same framing code the host uses. Faults can be switched on to
//! drive the error paths.

use crate::device::Function;
use crate::msg::{
    ClientAddress, PostAction, Request, Response, Telemetry, VersionMessage, HBM_VERSION_REQUEST,
    HBM_VERSION_RESPONSE, PROTOCOL_MAJOR,
};
use crate::platform::{PciAddress, Platform, ResetType};
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, trace};
use mei_regs::{
    BurstHeader, D0i3Control, HostCsr, MeCsr, BAR_ADDRESS_MASK, BAR_TYPE_64, D0I3C, H_CB_WW,
    H_CSR, ME_CB_RW, ME_CSR_HA, PCI_ALL_ONES, PCI_BAR0_HIGH, PCI_BAR0_LOW, PCI_COMMAND, PCI_HFS,
    PCI_ID, VENDOR_INTEL, WINDOW_SIZE,
};
use std::collections::VecDeque;
use strum::IntoEnumIterator;

/// Window base firmware assigns to the first function
pub const DEFAULT_BAR: u64 = 0x0000_0040_8120_0000;
/// Normal working state, normal mode, init complete
pub const DEFAULT_HFS: u32 = 0x0000_0205;
pub const DEFAULT_DEPTH: u8 = 0x20;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SimEvent {
    Fabric(Function, bool),
    Quiesce(bool),
    HardwareReset(ResetType),
}

#[derive(Clone, Debug, Default)]
struct Ring {
    slots: VecDeque<u32>,
    read_ptr: u8,
    write_ptr: u8,
}

impl Ring {
    fn push(&mut self, v: u32) {
        self.slots.push_back(v);
        self.write_ptr = self.write_ptr.wrapping_add(1);
    }

    fn pop(&mut self) -> Option<u32> {
        let v = self.slots.pop_front()?;
        self.read_ptr = self.read_ptr.wrapping_add(1);
        Some(v)
    }

    fn clear(&mut self) {
        self.slots.clear();
        self.read_ptr = self.write_ptr;
    }
}

/// One interface function
#[derive(Clone, Debug)]
pub struct SimFunction {
    pub vendor: u16,
    pub device_id: u16,
    pub command: u32,
    /// Window base, without the type bits
    pub bar: u64,
    /// BAR writes are dropped
    pub bar_locked: bool,
    pub hfs: u32,
    pub depth: u8,
    d0i3: D0i3Control,
    host_flags: HostCsr,
    me_ready: bool,
    host: Ring,
    me: Ring,
}

impl SimFunction {
    fn new(function: Function) -> SimFunction {
        let address = function.address();
        let device_id = mei_regs::DEVICE_IDS
            .iter()
            .find(|d| d.function == address.function)
            .map_or(0xFFFF, |d| d.id);

        let mut host_flags = HostCsr::default();
        host_flags.set_ready(true);
        SimFunction {
            vendor: VENDOR_INTEL,
            device_id,
            command: 0,
            bar: DEFAULT_BAR + WINDOW_SIZE * function.index() as u64,
            bar_locked: false,
            hfs: DEFAULT_HFS,
            depth: DEFAULT_DEPTH,
            d0i3: D0i3Control::default(),
            host_flags,
            me_ready: true,
            host: Ring::default(),
            me: Ring::default(),
        }
    }

    fn decodes(&self, address: u64) -> bool {
        self.bar != 0 && address >= self.bar && address < self.bar + WINDOW_SIZE
    }

    fn host_csr(&self) -> HostCsr {
        let mut csr = self.host_flags;
        csr.set_read_ptr(self.host.read_ptr);
        csr.set_write_ptr(self.host.write_ptr);
        csr.set_depth(self.depth);
        csr
    }

    fn me_csr(&self) -> MeCsr {
        let mut csr = MeCsr::default();
        csr.set_ready(self.me_ready);
        csr.set_read_ptr(self.me.read_ptr);
        csr.set_write_ptr(self.me.write_ptr);
        csr.set_depth(self.depth);
        csr
    }

    /// Queue `bytes` on the controller ring, split the way the host splits.
    fn reply(&mut self, address: ClientAddress, bytes: &[u8]) {
        let max_burst = usize::from(self.depth.saturating_sub(1)).max(1);
        let units: Vec<u32> = bytes
            .chunks(4)
            .map(|c| {
                let mut unit = [0u8; 4];
                unit[..c.len()].copy_from_slice(c);
                LittleEndian::read_u32(&unit)
            })
            .collect();

        let mut header = BurstHeader::default();
        header.set_ctrl_addr(address.ctrl);
        header.set_host_addr(address.host);
        if units.is_empty() {
            header.set_complete(true);
            self.me.push(header.into());
            return;
        }

        let bursts = units.chunks(max_burst).count();
        for (i, burst) in units.chunks(max_burst).enumerate() {
            header.set_length(burst.len() as u16);
            header.set_complete(i + 1 == bursts);
            self.me.push(header.into());
            for unit in burst {
                self.me.push(*unit);
            }
        }
    }
}

/// Switches for misbehaviour
#[derive(Clone, Debug, Default)]
pub struct Faults {
    /// Swallow this many responses
    pub drop_responses: u32,
    /// Echo this command id instead of the request's
    pub echo_command: Option<u8>,
    pub wrong_address: bool,
    pub zero_length_response: bool,
    pub refuse_global_reset: bool,
    /// The controller never comes back ready after an interface reset
    pub reset_refused: bool,
    pub refuse_version: bool,
    /// Drain indicator never clears
    pub drain_stuck: bool,
    /// The controller stops consuming the host ring
    pub stall_host_ring: bool,
}

/// Controller-side state, for inspection by tests
#[derive(Clone, Debug)]
pub struct SimController {
    pub requests: Vec<Request>,
    /// Byte length of the most recent request
    pub last_request_len: usize,
    pub bursts: usize,
    pub resets: u32,
    pub handshakes: u32,
    pub end_of_post_action: PostAction,
    pub supported_capabilities: u32,
    pub bus_owner: Option<u16>,
    pub telemetry: Option<Telemetry>,
    pub accepted_reset: Option<ResetType>,
    pub disabled: bool,
    inbox: Vec<u8>,
}

impl Default for SimController {
    fn default() -> SimController {
        SimController {
            requests: Vec::new(),
            last_request_len: 0,
            bursts: 0,
            resets: 0,
            handshakes: 0,
            end_of_post_action: PostAction::Continue,
            supported_capabilities: u32::MAX,
            bus_owner: None,
            telemetry: None,
            accepted_reset: None,
            disabled: false,
            inbox: Vec::new(),
        }
    }
}

impl SimController {
    /// Consume every whole burst sitting in the host ring.
    fn service(&mut self, f: &mut SimFunction, faults: &mut Faults) {
        if faults.stall_host_ring {
            return;
        }
        while let Some(&word) = f.host.slots.front() {
            let header = BurstHeader::from(word);
            let len = usize::from(header.length());
            if f.host.slots.len() < len + 1 {
                break;
            }
            f.host.pop();
            for _ in 0..len {
                let unit = f.host.pop().unwrap_or_default();
                self.inbox.extend_from_slice(&unit.to_le_bytes());
            }
            self.bursts += 1;

            if header.complete() {
                let message = std::mem::take(&mut self.inbox);
                let address = ClientAddress::new(header.host_addr(), header.ctrl_addr());
                self.handle(f, faults, address, &message);
            }
        }
    }

    fn handle(
        &mut self,
        f: &mut SimFunction,
        faults: &mut Faults,
        address: ClientAddress,
        message: &[u8],
    ) {
        if address == ClientAddress::BUS {
            let Ok(request) = VersionMessage::decode(message) else {
                return;
            };
            if request.command != HBM_VERSION_REQUEST {
                return;
            }
            self.handshakes += 1;
            let reply = VersionMessage {
                command: HBM_VERSION_RESPONSE,
                supported: !faults.refuse_version && request.major == PROTOCOL_MAJOR,
                minor: request.minor,
                major: request.major,
            };
            if let Ok(bytes) = reply.encode() {
                f.reply(address, &bytes);
            }
            return;
        }

        let request = match Request::decode(message) {
            Ok(request) => request,
            Err(e) => {
                debug!("sim: dropping undecodable request: {e}");
                return;
            }
        };
        trace!("sim: {request:?}");
        self.last_request_len = message.len();
        self.requests.push(request.clone());

        if faults.drop_responses > 0 {
            faults.drop_responses -= 1;
            return;
        }

        let family = request.family();
        let encoded = match request {
            Request::EndOfPost => Response::EndOfPost {
                action: self.end_of_post_action,
            }
            .encode(),
            Request::DisableInterfaces => {
                self.disabled = true;
                Response::DisableInterfaces.encode()
            }
            Request::SetBusOwner { address } => {
                self.bus_owner = Some(address);
                Response::SetBusOwner.encode()
            }
            Request::PlatformTelemetry(t) => {
                self.telemetry = Some(t);
                Response::PlatformTelemetry.encode()
            }
            Request::HostCapabilities(requested) => Response::HostCapabilities {
                granted: requested & self.supported_capabilities,
            }
            .encode(),
            Request::GlobalReset(_) if faults.refuse_global_reset => {
                Response::encode_rejection(family, 0x8A)
            }
            Request::GlobalReset(kind) => {
                self.accepted_reset = Some(kind);
                Response::GlobalReset.encode()
            }
        };
        let Ok(mut bytes) = encoded else {
            return;
        };

        if let Some(command) = faults.echo_command {
            bytes[0] = command;
        }
        if faults.zero_length_response {
            bytes.clear();
        }
        let mut reply_to = address;
        if faults.wrong_address {
            reply_to.ctrl = reply_to.ctrl.wrapping_add(1);
        }
        f.reply(reply_to, &bytes);
    }
}

/// Platform backed entirely by memory
#[derive(Clone, Debug)]
pub struct SimPlatform {
    functions: [Option<SimFunction>; Function::COUNT],
    pub controller: SimController,
    pub faults: Faults,
    /// Register and bus touches, not counting stalls
    pub bus_accesses: u64,
    pub events: Vec<SimEvent>,
    pub elapsed_us: u64,
    pub hardware_resets: u32,
}

impl Default for SimPlatform {
    fn default() -> SimPlatform {
        SimPlatform::new()
    }
}

impl SimPlatform {
    /// Only the first function is present.
    pub fn new() -> SimPlatform {
        SimPlatform {
            functions: [Some(SimFunction::new(Function::Heci1)), None, None, None],
            controller: SimController::default(),
            faults: Faults::default(),
            bus_accesses: 0,
            events: Vec::new(),
            elapsed_us: 0,
            hardware_resets: 0,
        }
    }

    pub fn add_function(&mut self, function: Function) -> &mut SimFunction {
        self.functions[function.index()].insert(SimFunction::new(function))
    }

    pub fn remove_function(&mut self, function: Function) {
        self.functions[function.index()] = None;
    }

    pub fn function_mut(&mut self, function: Function) -> Option<&mut SimFunction> {
        self.functions[function.index()].as_mut()
    }

    pub fn bar(&self, function: Function) -> u64 {
        self.functions[function.index()]
            .as_ref()
            .map_or(0, |f| f.bar)
    }

    /// Move a window the way lower-trust code would. A locked BAR ignores
    /// every later write.
    pub fn relocate_bar(&mut self, function: Function, base: u64, locked: bool) {
        if let Some(f) = self.function_mut(function) {
            f.bar = base;
            f.bar_locked = locked;
        }
    }

    fn at(&mut self, addr: PciAddress) -> Option<&mut SimFunction> {
        let function = Function::iter().find(|f| f.address() == addr)?;
        self.functions[function.index()].as_mut()
    }

    fn window(&self, address: u64) -> Option<(usize, u64)> {
        self.functions.iter().enumerate().find_map(|(i, f)| match f {
            Some(f) if f.decodes(address) => Some((i, address - f.bar)),
            _ => None,
        })
    }
}

impl Platform for SimPlatform {
    fn pci_read32(&mut self, addr: PciAddress, offset: u16) -> u32 {
        self.bus_accesses += 1;
        let Some(f) = self.at(addr) else {
            return PCI_ALL_ONES;
        };
        match offset {
            PCI_ID => u32::from(f.vendor) | (u32::from(f.device_id) << 16),
            PCI_COMMAND => f.command,
            PCI_BAR0_LOW => (f.bar as u32 & BAR_ADDRESS_MASK) | BAR_TYPE_64,
            PCI_BAR0_HIGH => (f.bar >> 32) as u32,
            PCI_HFS => f.hfs,
            _ => 0,
        }
    }

    fn pci_write32(&mut self, addr: PciAddress, offset: u16, value: u32) {
        self.bus_accesses += 1;
        let Some(f) = self.at(addr) else {
            return;
        };
        match offset {
            PCI_COMMAND => f.command = value,
            PCI_BAR0_LOW if !f.bar_locked => {
                f.bar = (f.bar & !0xFFFF_FFFF) | u64::from(value & BAR_ADDRESS_MASK);
            }
            PCI_BAR0_HIGH if !f.bar_locked => {
                f.bar = (f.bar & 0xFFFF_FFFF) | (u64::from(value) << 32);
            }
            _ => {}
        }
    }

    fn mmio_read32(&mut self, address: u64) -> u32 {
        self.bus_accesses += 1;
        let Some((i, offset)) = self.window(address) else {
            return PCI_ALL_ONES;
        };
        let drain_stuck = self.faults.drain_stuck;
        let Some(f) = self.functions[i].as_mut() else {
            return PCI_ALL_ONES;
        };
        match offset {
            H_CSR => f.host_csr().into(),
            ME_CSR_HA => f.me_csr().into(),
            ME_CB_RW => f.me.pop().unwrap_or_default(),
            D0I3C => {
                let mut d0i3 = f.d0i3;
                d0i3.set_command_in_progress(drain_stuck);
                d0i3.into()
            }
            _ => 0,
        }
    }

    fn mmio_write32(&mut self, address: u64, value: u32) {
        self.bus_accesses += 1;
        let Some((i, offset)) = self.window(address) else {
            return;
        };
        let Some(f) = self.functions[i].as_mut() else {
            return;
        };
        match offset {
            H_CB_WW => f.host.push(value),
            H_CSR => {
                let csr = HostCsr::from(value);
                if csr.reset() && !f.host_flags.reset() {
                    f.host.clear();
                    f.me.clear();
                    self.controller.inbox.clear();
                    self.controller.resets += 1;
                    f.me_ready = !self.faults.reset_refused;
                }
                f.host_flags.set_ready(csr.ready());
                f.host_flags.set_reset(csr.reset());
                f.host_flags.set_interrupt_enable(csr.interrupt_enable());
                if csr.interrupt_generate() && !csr.reset() {
                    self.controller.service(f, &mut self.faults);
                }
            }
            D0I3C => {
                let quiesce = D0i3Control::from(value).quiesce();
                if quiesce != f.d0i3.quiesce() {
                    self.events.push(SimEvent::Quiesce(quiesce));
                }
                f.d0i3.set_quiesce(quiesce);
            }
            _ => {}
        }
    }

    fn stall_us(&mut self, us: u32) {
        self.elapsed_us += u64::from(us);
    }

    fn set_fabric_routing(&mut self, addr: PciAddress, enabled: bool) {
        self.bus_accesses += 1;
        if let Some(function) = Function::iter().find(|f| f.address() == addr) {
            self.events.push(SimEvent::Fabric(function, enabled));
        }
    }

    fn hardware_reset(&mut self, kind: ResetType) {
        self.bus_accesses += 1;
        self.hardware_resets += 1;
        self.events.push(SimEvent::HardwareReset(kind));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_first_function_answers() {
        let mut sim = SimPlatform::new();
        assert_ne!(sim.pci_read32(Function::Heci1.address(), PCI_ID), PCI_ALL_ONES);
        assert_eq!(sim.pci_read32(Function::Heci3.address(), PCI_ID), PCI_ALL_ONES);

        sim.add_function(Function::Heci3);
        let id = sim.pci_read32(Function::Heci3.address(), PCI_ID);
        assert_eq!(id >> 16, 0x51E4);
    }

    #[test]
    fn window_decodes_only_inside_bar() {
        let mut sim = SimPlatform::new();
        let csr = MeCsr::from(sim.mmio_read32(DEFAULT_BAR + ME_CSR_HA));
        assert!(csr.ready());
        assert_eq!(csr.depth(), DEFAULT_DEPTH);
        assert_eq!(sim.mmio_read32(DEFAULT_BAR + WINDOW_SIZE), PCI_ALL_ONES);
    }

    #[test]
    fn locked_bar_ignores_writes() {
        let mut sim = SimPlatform::new();
        sim.relocate_bar(Function::Heci1, 0x7000_0000, true);
        sim.pci_write32(Function::Heci1.address(), PCI_BAR0_LOW, 0x1000_0000);
        assert_eq!(sim.bar(Function::Heci1), 0x7000_0000);
    }
}
