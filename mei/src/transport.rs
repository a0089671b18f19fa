// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Moving messages through the circular buffers.
//!
//! A logical message is split into bursts of at most `depth - 1` slots,
//! each led by a [`BurstHeader`]. The host fills its ring through
//! `H_CB_WW` and rings the doorbell after every burst; responses are
//! drained from `ME_CB_RW` and reassembled until a burst with the
//! complete bit arrives.

use crate::device::Function;
use crate::msg::{ClientAddress, Request, Response, VersionMessage, MAX_MESSAGE_LEN};
use crate::platform::Platform;
use crate::policy::RetryMode;
use crate::session::Session;
use crate::supervisor::with_retry;
use crate::wait::BoundedWait;
use crate::{Error, Fault, Stage};
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, trace, warn};
use mei_regs::{
    BurstHeader, HostCsr, MeCsr, BURST_LENGTH_MAX, H_CB_WW, H_CSR, ME_CB_RW, ME_CSR_HA,
    TRANSFER_UNIT,
};

/// Drained responses larger than this are treated as a runaway ring.
const MAX_DRAIN: usize = 4096;

/// Per-function transport state
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Idle,
    Sending,
    AwaitingResponse(ClientAddress),
    /// A failure left the rings in an unknown state; only an interface
    /// reset gets out of here.
    Resetting,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReadMode {
    Blocking,
    /// Look at the ring once. An empty ring is a timeout that leaves the
    /// response pending.
    NonBlocking,
    /// Block, but give up after this wait instead of the policy's
    Within(BoundedWait),
}

/// One request and the buffer its response lands in
pub struct Transaction<'a> {
    pub function: Function,
    pub address: ClientAddress,
    pub request: &'a [u8],
    pub response: &'a mut [u8],
    pub mode: ReadMode,
}

impl<P: Platform> Session<P> {
    fn set_link(&mut self, function: Function, state: LinkState) {
        trace!("{function}: link {:?} -> {state:?}", self.links[function.index()]);
        self.links[function.index()] = state;
    }

    fn host_csr(&mut self, base: u64) -> HostCsr {
        HostCsr::from(self.platform.mmio_read32(base + H_CSR))
    }

    fn me_csr(&mut self, base: u64) -> MeCsr {
        MeCsr::from(self.platform.mmio_read32(base + ME_CSR_HA))
    }

    /// Tell the controller the host ring changed.
    fn ring_doorbell(&mut self, base: u64) {
        let mut csr = self.host_csr(base);
        csr.set_interrupt_generate(true);
        // Writing the status bit back would acknowledge an interrupt
        csr.set_interrupt_status(false);
        self.platform.mmio_write32(base + H_CSR, csr.into());
    }

    pub fn interface_status(&mut self, function: Function) -> Result<(HostCsr, MeCsr), Error> {
        let handle = self.usable_handle(function)?;
        Ok((self.host_csr(handle.base), self.me_csr(handle.base)))
    }

    fn wait_ready(&mut self, base: u64) -> Result<(), Error> {
        let wait = self.policy.timeouts.ready();
        let ready = wait.until(&mut self.platform, |p| {
            HostCsr::from(p.mmio_read32(base + H_CSR)).ready()
                && MeCsr::from(p.mmio_read32(base + ME_CSR_HA)).ready()
        });
        if ready {
            Ok(())
        } else {
            Err(Error::Timeout(Stage::Ready))
        }
    }

    fn write_message(
        &mut self,
        base: u64,
        address: ClientAddress,
        payload: &[u8],
    ) -> Result<(), Error> {
        self.wait_ready(base)?;

        let depth = self.host_csr(base).depth();
        if depth < 2 {
            return Err(Fault::RingTooSmall(depth).into());
        }
        let max_burst = usize::from(u16::from(depth - 1).min(BURST_LENGTH_MAX));

        let units: Vec<u32> = payload
            .chunks_exact(TRANSFER_UNIT)
            .map(LittleEndian::read_u32)
            .collect();
        let bursts = units.chunks(max_burst).count();
        let wait = self.policy.timeouts.send();

        for (i, burst) in units.chunks(max_burst).enumerate() {
            let needed = burst.len() + 1;
            if !wait.until(&mut self.platform, |p| {
                usize::from(HostCsr::from(p.mmio_read32(base + H_CSR)).empty_slots()) >= needed
            }) {
                return Err(Error::Timeout(Stage::Send));
            }

            let mut header = BurstHeader::default();
            header.set_ctrl_addr(address.ctrl);
            header.set_host_addr(address.host);
            header.set_length(burst.len() as u16);
            header.set_complete(i + 1 == bursts);
            trace!("H_CB_WW <- {header:?}");

            self.platform.mmio_write32(base + H_CB_WW, header.into());
            for unit in burst {
                self.platform.mmio_write32(base + H_CB_WW, *unit);
            }
            self.ring_doorbell(base);
        }
        Ok(())
    }

    /// Drain one logical message. The whole message always leaves the ring,
    /// even when it doesn't fit in `buf` or came from the wrong client.
    fn read_message(
        &mut self,
        base: u64,
        address: ClientAddress,
        buf: &mut [u8],
        wait: BoundedWait,
    ) -> Result<usize, Error> {
        let depth = usize::from(self.me_csr(base).depth());
        let mut total = 0;
        let mut mismatch = None;

        loop {
            if !wait.until(&mut self.platform, |p| {
                MeCsr::from(p.mmio_read32(base + ME_CSR_HA)).filled_slots() > 0
            }) {
                return Err(Error::Timeout(Stage::Receive));
            }

            let header = BurstHeader::from(self.platform.mmio_read32(base + ME_CB_RW));
            trace!("ME_CB_RW -> {header:?}");
            let len = usize::from(header.length());
            if len + 1 > depth {
                return Err(Fault::BurstOverrun(len).into());
            }

            if !wait.until(&mut self.platform, |p| {
                usize::from(MeCsr::from(p.mmio_read32(base + ME_CSR_HA)).filled_slots()) >= len
            }) {
                return Err(Error::Timeout(Stage::Receive));
            }
            for _ in 0..len {
                let unit = self.platform.mmio_read32(base + ME_CB_RW);
                if let Some(out) = buf.get_mut(total..total + TRANSFER_UNIT) {
                    LittleEndian::write_u32(out, unit);
                }
                total += TRANSFER_UNIT;
            }
            // The controller may be waiting on the space we just freed
            self.ring_doorbell(base);

            if header.host_addr() != address.host || header.ctrl_addr() != address.ctrl {
                mismatch.get_or_insert(Fault::AddressMismatch {
                    host: address.host,
                    ctrl: address.ctrl,
                    got_host: header.host_addr(),
                    got_ctrl: header.ctrl_addr(),
                });
            }
            if header.complete() {
                break;
            }
            if total > MAX_DRAIN {
                return Err(Fault::BurstOverrun(total / TRANSFER_UNIT).into());
            }
        }

        if let Some(fault) = mismatch {
            return Err(fault.into());
        }
        if total == 0 {
            return Err(Fault::ZeroLength.into());
        }
        if total > buf.len() {
            return Err(Error::BufferTooSmall {
                needed: total,
                available: buf.len(),
            });
        }
        Ok(total)
    }

    /// Start an exchange by writing `payload` to the host ring.
    pub fn send(
        &mut self,
        function: Function,
        payload: &[u8],
        address: ClientAddress,
    ) -> Result<(), Error> {
        self.usable_handle(function)?;
        if payload.is_empty() || payload.len() % TRANSFER_UNIT != 0 {
            return Err(Error::InvalidLength(payload.len()));
        }
        if self.link_state(function) != LinkState::Idle {
            return Err(Error::OutOfSequence);
        }
        let handle = self.ensure_active(function)?;

        self.set_link(function, LinkState::Sending);
        let result = self.write_message(handle.base, address, payload);
        let next = match &result {
            Ok(()) => LinkState::AwaitingResponse(address),
            Err(Error::Timeout(_)) => LinkState::Resetting,
            Err(_) => LinkState::Idle,
        };
        self.set_link(function, next);
        debug!(
            "{function}: sent {} bytes to client {:#04x}: {}",
            payload.len(),
            address.ctrl,
            crate::Status::of(&result)
        );
        result
    }

    /// Collect the response to the preceding [`Session::send`].
    pub fn receive(
        &mut self,
        function: Function,
        mode: ReadMode,
        buf: &mut [u8],
    ) -> Result<usize, Error> {
        let handle = self.usable_handle(function)?;
        let address = match self.link_state(function) {
            LinkState::AwaitingResponse(address) => address,
            _ => return Err(Error::OutOfSequence),
        };

        if mode == ReadMode::NonBlocking && self.me_csr(handle.base).filled_slots() == 0 {
            return Err(Error::Timeout(Stage::Receive));
        }

        let wait = match mode {
            ReadMode::Within(wait) => wait,
            ReadMode::Blocking | ReadMode::NonBlocking => self.policy.timeouts.receive(),
        };
        let result = self.read_message(handle.base, address, buf, wait);
        let next = match &result {
            Err(Error::Timeout(_)) | Err(Error::DeviceError(Fault::BurstOverrun(_))) => {
                LinkState::Resetting
            }
            _ => LinkState::Idle,
        };
        self.set_link(function, next);
        if let Ok(n) = &result {
            debug!("{function}: received {n} bytes from client {:#04x}", address.ctrl);
        }
        result
    }

    /// Send, then receive into the transaction's buffer. A link left
    /// mid-reset by an earlier failure is reset first.
    pub fn transact(&mut self, t: &mut Transaction<'_>) -> Result<usize, Error> {
        if self.link_state(t.function) == LinkState::Resetting {
            debug!("{}: finishing interrupted reset", t.function);
            self.reset_interface(t.function)?;
        }
        self.send(t.function, t.request, t.address)?;
        self.receive(t.function, t.mode, t.response)
    }

    /// Fire-and-forget send that ignores the link state. Only the fail-safe
    /// disable path uses this.
    pub(crate) fn post(
        &mut self,
        function: Function,
        payload: &[u8],
        address: ClientAddress,
    ) -> Result<(), Error> {
        let handle = self.ensure_active(function)?;
        let result = self.write_message(handle.base, address, payload);
        self.set_link(function, LinkState::Idle);
        result
    }

    /// Reset both rings and re-announce the protocol version.
    pub fn reset_interface(&mut self, function: Function) -> Result<(), Error> {
        let handle = self.usable_handle(function)?;
        let base = handle.base;
        self.set_link(function, LinkState::Resetting);

        let mut csr = self.host_csr(base);
        csr.set_reset(true);
        csr.set_interrupt_generate(true);
        csr.set_interrupt_status(false);
        self.platform.mmio_write32(base + H_CSR, csr.into());

        let wait = self.policy.timeouts.ready();
        if !wait.until(&mut self.platform, |p| {
            MeCsr::from(p.mmio_read32(base + ME_CSR_HA)).ready()
        }) {
            warn!("{function}: controller did not come back from interface reset");
            return Err(Error::Timeout(Stage::Ready));
        }

        let mut csr = self.host_csr(base);
        csr.set_reset(false);
        csr.set_ready(true);
        csr.set_interrupt_generate(true);
        csr.set_interrupt_status(false);
        self.platform.mmio_write32(base + H_CSR, csr.into());

        let request = VersionMessage::request();
        self.write_message(base, ClientAddress::BUS, &request.encode()?)?;
        let mut buf = [0u8; 4];
        let wait = self.policy.timeouts.receive();
        let n = self.read_message(base, ClientAddress::BUS, &mut buf, wait)?;
        let response = VersionMessage::decode(&buf[..n])?;
        if !response.supported {
            return Err(Fault::VersionRefused {
                major: request.major,
                minor: request.minor,
            }
            .into());
        }

        self.set_link(function, LinkState::Idle);
        debug!(
            "{function}: interface reset, protocol {}.{}",
            response.major, response.minor
        );
        Ok(())
    }

    /// One request/response exchange with no retries.
    pub fn exchange_once(&mut self, request: &Request) -> Result<Response, Error> {
        self.exchange_with(request, ReadMode::Blocking)
    }

    /// [`Session::exchange_once`] with an explicit read mode.
    pub fn exchange_with(&mut self, request: &Request, mode: ReadMode) -> Result<Response, Error> {
        let family = request.family();
        let function = family.function();

        if family.requires_normal_mode() {
            let hfs = self.firmware_status(function)?;
            if !hfs.is_normal() {
                debug!("{family}: controller not in normal mode ({hfs:?})");
                return Err(Error::Unsupported);
            }
        }

        let bytes = request.encode()?;
        let mut buf = [0u8; MAX_MESSAGE_LEN];
        let mut t = Transaction {
            function,
            address: family.address(),
            request: &bytes,
            response: &mut buf,
            mode,
        };
        let n = self.transact(&mut t)?;
        Response::decode(family, &buf[..n])
    }

    /// Exchange under whichever retry discipline the channel uses.
    pub fn exchange(&mut self, request: &Request) -> Result<Response, Error> {
        match self.policy.retry_mode {
            RetryMode::Bounded => self.exchange_once(request),
            RetryMode::ChannelWide => {
                let attempts = self.policy.max_attempts;
                with_retry(self, request.family().function(), attempts, |s| {
                    s.exchange_once(request)
                })
            }
        }
    }

    /// Exchange from the reduced-trust context, behind the window guard.
    pub fn trusted_exchange(&mut self, request: &Request) -> Result<Response, Error> {
        self.guarded(|s| s.exchange(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::{client, Family, PostAction};
    use crate::policy::Policy;
    use crate::session::BootMode;
    use crate::sim::SimPlatform;
    use crate::Status;

    const MKHI: ClientAddress = ClientAddress::new(0, client::MKHI);

    fn session(sim: SimPlatform) -> Session<SimPlatform> {
        let _ = env_logger::builder().is_test(true).try_init();
        Session::new(sim, Policy::default(), BootMode::Normal)
    }

    fn end_of_post() -> Vec<u8> {
        Request::EndOfPost.encode().unwrap()
    }

    #[test]
    fn send_then_receive() {
        let mut s = session(SimPlatform::new());
        s.send(Function::Heci1, &end_of_post(), MKHI).unwrap();
        assert_eq!(
            s.link_state(Function::Heci1),
            LinkState::AwaitingResponse(MKHI)
        );

        let mut buf = [0u8; 16];
        let n = s
            .receive(Function::Heci1, ReadMode::Blocking, &mut buf)
            .unwrap();
        assert_eq!(n, 8);
        assert_eq!(
            Response::decode(Family::EndOfPost, &buf[..n]).unwrap(),
            Response::EndOfPost {
                action: PostAction::Continue
            }
        );
        assert_eq!(s.link_state(Function::Heci1), LinkState::Idle);
        assert_eq!(s.platform.controller.requests, vec![Request::EndOfPost]);
    }

    #[test]
    fn partial_transfer_units_are_refused() {
        let mut s = session(SimPlatform::new());
        assert!(matches!(
            s.send(Function::Heci1, &[0; 6], MKHI),
            Err(Error::InvalidLength(6))
        ));
        assert!(matches!(
            s.send(Function::Heci1, &[], MKHI),
            Err(Error::InvalidLength(0))
        ));
        assert!(s.platform.controller.requests.is_empty());
    }

    #[test]
    fn receive_needs_a_send() {
        let mut s = session(SimPlatform::new());
        let mut buf = [0u8; 8];
        assert!(matches!(
            s.receive(Function::Heci1, ReadMode::Blocking, &mut buf),
            Err(Error::OutOfSequence)
        ));
    }

    #[test]
    fn second_send_waits_for_receive() {
        let mut s = session(SimPlatform::new());
        s.send(Function::Heci1, &end_of_post(), MKHI).unwrap();
        assert!(matches!(
            s.send(Function::Heci1, &end_of_post(), MKHI),
            Err(Error::OutOfSequence)
        ));
    }

    #[test]
    fn long_messages_are_split_into_bursts() {
        let mut sim = SimPlatform::new();
        // Three slots of payload per burst
        sim.function_mut(Function::Heci1).unwrap().depth = 4;
        let mut s = session(sim);

        let telemetry = crate::msg::Telemetry {
            memory: Default::default(),
            ports: vec![
                crate::msg::LinkFacts {
                    port: 1,
                    width: 4,
                    speed: 3
                };
                5
            ],
        };
        let request = Request::PlatformTelemetry(telemetry);
        let response = s.exchange(&request).unwrap();
        assert_eq!(response, Response::PlatformTelemetry);
        assert_eq!(s.platform.controller.requests, vec![request]);
        // 7 slots of payload at 3 per burst
        assert_eq!(s.platform.controller.bursts, 3);
    }

    #[test]
    fn full_ring_times_out_and_needs_reset() {
        let mut sim = SimPlatform::new();
        sim.faults.stall_host_ring = true;
        sim.function_mut(Function::Heci1).unwrap().depth = 4;
        let mut s = session(sim);

        // Two bursts; the second one never finds room
        let r = s.send(Function::Heci1, &[0; 20], MKHI);
        assert!(matches!(r, Err(Error::Timeout(Stage::Send))));
        assert_eq!(s.link_state(Function::Heci1), LinkState::Resetting);
        assert!(matches!(
            s.send(Function::Heci1, &end_of_post(), MKHI),
            Err(Error::OutOfSequence)
        ));

        s.platform.faults.stall_host_ring = false;
        s.reset_interface(Function::Heci1).unwrap();
        assert_eq!(s.link_state(Function::Heci1), LinkState::Idle);
        assert_eq!(s.platform.controller.resets, 1);
        s.send(Function::Heci1, &end_of_post(), MKHI).unwrap();
    }

    #[test]
    fn missing_response_times_out() {
        let mut sim = SimPlatform::new();
        sim.faults.drop_responses = 1;
        let mut s = session(sim);
        let start = s.platform.elapsed_us;

        let r = s.exchange_once(&Request::EndOfPost);
        assert!(matches!(r, Err(Error::Timeout(Stage::Receive))));
        assert_eq!(Status::of(&r), Status::Timeout);
        assert_eq!(s.platform.elapsed_us - start, 5_000_000);
        assert_eq!(s.link_state(Function::Heci1), LinkState::Resetting);

        // The next transaction resets first and goes through
        assert!(s.exchange_once(&Request::EndOfPost).is_ok());
        assert_eq!(s.platform.controller.resets, 1);
    }

    #[test]
    fn non_blocking_read_leaves_response_pending() {
        let mut sim = SimPlatform::new();
        sim.faults.drop_responses = 1;
        let mut s = session(sim);
        s.send(Function::Heci1, &end_of_post(), MKHI).unwrap();

        let mut buf = [0u8; 8];
        let start = s.platform.elapsed_us;
        assert!(matches!(
            s.receive(Function::Heci1, ReadMode::NonBlocking, &mut buf),
            Err(Error::Timeout(Stage::Receive))
        ));
        assert_eq!(s.platform.elapsed_us, start);
        assert_eq!(
            s.link_state(Function::Heci1),
            LinkState::AwaitingResponse(MKHI)
        );
    }

    #[test]
    fn zero_length_response_is_a_device_error() {
        let mut sim = SimPlatform::new();
        sim.faults.zero_length_response = true;
        let mut s = session(sim);
        let r = s.exchange_once(&Request::EndOfPost);
        assert!(matches!(r, Err(Error::DeviceError(Fault::ZeroLength))));
        assert_eq!(s.link_state(Function::Heci1), LinkState::Idle);
    }

    #[test]
    fn oversized_response_is_drained() {
        let mut s = session(SimPlatform::new());
        s.send(Function::Heci1, &end_of_post(), MKHI).unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(
            s.receive(Function::Heci1, ReadMode::Blocking, &mut buf),
            Err(Error::BufferTooSmall {
                needed: 8,
                available: 4
            })
        ));
        let (_, me) = s.interface_status(Function::Heci1).unwrap();
        assert_eq!(me.filled_slots(), 0);
        // Nothing stale is left for the next exchange
        assert!(s.exchange_once(&Request::EndOfPost).is_ok());
    }

    #[test]
    fn reply_from_wrong_client_is_refused() {
        let mut sim = SimPlatform::new();
        sim.faults.wrong_address = true;
        let mut s = session(sim);
        assert!(matches!(
            s.exchange_once(&Request::EndOfPost),
            Err(Error::DeviceError(Fault::AddressMismatch { .. }))
        ));
    }

    #[test]
    fn refused_reset_times_out() {
        let mut sim = SimPlatform::new();
        sim.faults.reset_refused = true;
        let mut s = session(sim);
        assert!(matches!(
            s.reset_interface(Function::Heci1),
            Err(Error::Timeout(Stage::Ready))
        ));
        assert_eq!(s.link_state(Function::Heci1), LinkState::Resetting);
    }

    #[test]
    fn refused_version_is_a_device_error() {
        let mut sim = SimPlatform::new();
        sim.faults.refuse_version = true;
        let mut s = session(sim);
        assert!(matches!(
            s.reset_interface(Function::Heci1),
            Err(Error::DeviceError(Fault::VersionRefused { major: 2, minor: 0 }))
        ));
    }

    #[test]
    fn abnormal_firmware_limits_families() {
        let mut sim = SimPlatform::new();
        // Recovery working state
        sim.function_mut(Function::Heci1).unwrap().hfs = 0x0000_0202;
        let mut s = session(sim);
        assert!(matches!(
            s.exchange_once(&Request::EndOfPost),
            Err(Error::Unsupported)
        ));
        assert!(s.platform.controller.requests.is_empty());
        assert!(s.exchange_once(&Request::DisableInterfaces).is_ok());
    }

    #[test]
    fn quiesced_function_is_woken_for_traffic() {
        let mut s = session(SimPlatform::new());
        s.set_power_state(Function::Heci1, crate::PowerState::Quiescent)
            .unwrap();
        s.exchange_once(&Request::EndOfPost).unwrap();
        assert_eq!(
            s.resolve(Function::Heci1).unwrap().power,
            crate::PowerState::Active
        );
    }
}
