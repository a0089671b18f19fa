// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed-layout records for each message family we speak.
//!
//! Every record starts with a [`MessageHeader`]. Records are always built
//! in a zeroed buffer of their full size before any field is written, so
//! nothing we did not mean to send crosses to the controller.

use crate::device::Function;
use crate::platform::ResetType;
use crate::{Error, Fault};
use num_traits::{FromPrimitive, ToPrimitive};
use packed_struct::prelude::*;
use serde::Deserialize;

/// Firmware side client address, the same for every family
pub const HOST_CLIENT: u8 = 0x00;

/// Controller side client addresses
pub mod client {
    /// Bus messages: version handshake and friends
    pub const BUS: u8 = 0x00;
    pub const MKHI: u8 = 0x07;
    pub const MCTP: u8 = 0x0A;
    pub const TELEMETRY: u8 = 0x0C;
}

pub mod group {
    pub const CBM: u8 = 0x00;
    pub const FWCAPS: u8 = 0x03;
    pub const MCTP: u8 = 0x11;
    pub const BUP_COMMON: u8 = 0xF0;
    pub const GEN: u8 = 0xFF;
}

/// Host capability bits
pub mod capability {
    pub const WATCHDOG: u32 = 1 << 0;
    pub const DEVICE_POWER_CONTROL: u32 = 1 << 1;
    pub const TELEMETRY: u32 = 1 << 2;
    pub const TRUSTED_REGISTER_ACCESS: u32 = 1 << 3;
}

/// Request origin carried in a global reset request
const RESET_ORIGIN_FIRMWARE: u8 = 0x01;

/// Response value of end-of-post asking for a global reset
pub const POST_ACTION_GLOBAL_RESET: u32 = 1;

/// Upper bound on high-speed ports described by one telemetry record
pub const MAX_PORTS: usize = 6;

pub const HEADER_LEN: usize = 4;

/// Largest logical message either side will produce
pub const MAX_MESSAGE_LEN: usize = 512;

/// The pair of endpoints a transaction runs between
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ClientAddress {
    pub host: u8,
    pub ctrl: u8,
}

impl ClientAddress {
    pub const BUS: ClientAddress = ClientAddress::new(HOST_CLIENT, client::BUS);

    pub const fn new(host: u8, ctrl: u8) -> ClientAddress {
        ClientAddress { host, ctrl }
    }
}

#[derive(PackedStruct, Copy, Clone, Debug, Default, PartialEq, Eq)]
#[packed_struct(size_bytes = "4", bit_numbering = "msb0")]
pub struct MessageHeader {
    #[packed_field(bits = "0..=7")]
    pub command: u8,
    #[packed_field(bits = "8..=15")]
    pub group: u8,
    // Bits 16..=22 are reserved and always zero
    #[packed_field(bits = "23")]
    pub is_response: bool,
    #[packed_field(bits = "24..=31")]
    pub result: u8,
}

impl MessageHeader {
    fn for_family(family: Family, is_response: bool) -> MessageHeader {
        let (group, command) = family.ids();
        MessageHeader {
            command,
            group,
            is_response,
            result: 0,
        }
    }
}

#[derive(PackedStruct, Copy, Clone, Debug, Default, PartialEq, Eq)]
#[packed_struct(size_bytes = "4", bit_numbering = "msb0", endian = "lsb")]
struct WordRecord {
    #[packed_field(bytes = "0..=3")]
    value: u32,
}

#[derive(PackedStruct, Copy, Clone, Debug, Default, PartialEq, Eq)]
#[packed_struct(size_bytes = "4", bit_numbering = "msb0", endian = "lsb")]
struct BusOwnerRecord {
    #[packed_field(bytes = "0..=1")]
    address: u16,
}

#[derive(PackedStruct, Copy, Clone, Debug, Default, PartialEq, Eq)]
#[packed_struct(size_bytes = "4", bit_numbering = "msb0")]
struct GlobalResetRecord {
    #[packed_field(bytes = "0")]
    origin: u8,
    #[packed_field(bytes = "1")]
    reset_type: u8,
}

#[derive(PackedStruct, Copy, Clone, Debug, Default, PartialEq, Eq)]
#[packed_struct(size_bytes = "4", bit_numbering = "msb0")]
struct MemoryRecord {
    #[packed_field(bytes = "0")]
    ratio: u8,
    #[packed_field(bytes = "1")]
    reference_clock: u8,
    #[packed_field(bytes = "2")]
    channels: u8,
    #[packed_field(bytes = "3")]
    port_count: u8,
}

#[derive(PackedStruct, Copy, Clone, Debug, Default, PartialEq, Eq)]
#[packed_struct(size_bytes = "4", bit_numbering = "msb0")]
struct PortRecord {
    #[packed_field(bytes = "0")]
    port: u8,
    #[packed_field(bytes = "1")]
    width: u8,
    #[packed_field(bytes = "2")]
    speed: u8,
}

pub const HBM_VERSION_REQUEST: u8 = 0x01;
pub const HBM_VERSION_RESPONSE: u8 = 0x81;
pub const PROTOCOL_MAJOR: u8 = 2;
pub const PROTOCOL_MINOR: u8 = 0;

/// Bus message announcing (request) or accepting (response) the protocol
/// version after an interface reset
#[derive(PackedStruct, Copy, Clone, Debug, Default, PartialEq, Eq)]
#[packed_struct(size_bytes = "4", bit_numbering = "msb0")]
pub struct VersionMessage {
    #[packed_field(bytes = "0")]
    pub command: u8,
    /// Only meaningful in the response
    #[packed_field(bits = "15")]
    pub supported: bool,
    #[packed_field(bytes = "2")]
    pub minor: u8,
    #[packed_field(bytes = "3")]
    pub major: u8,
}

impl VersionMessage {
    pub fn request() -> VersionMessage {
        VersionMessage {
            command: HBM_VERSION_REQUEST,
            supported: false,
            minor: PROTOCOL_MINOR,
            major: PROTOCOL_MAJOR,
        }
    }

    pub fn encode(&self) -> Result<[u8; 4], Error> {
        let mut out = [0u8; 4];
        pack(self, &mut out)?;
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<VersionMessage, Error> {
        expect_len(bytes, 4)?;
        unpack(bytes)
    }
}

/// Memory parameters negotiated by memory init
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct MemoryFacts {
    pub ratio: u8,
    pub reference_clock: u8,
    pub channels: u8,
}

/// Negotiated state of one high-speed port
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct LinkFacts {
    pub port: u8,
    pub width: u8,
    pub speed: u8,
}

/// Telemetry/configuration push. Only populated ports are carried.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Telemetry {
    pub memory: MemoryFacts,
    pub ports: Vec<LinkFacts>,
}

impl Telemetry {
    pub fn record_len(&self) -> usize {
        HEADER_LEN + 4 + 4 * self.ports.len()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PostAction {
    Continue,
    GlobalReset,
}

impl PostAction {
    fn from_raw(v: u32) -> PostAction {
        if v == POST_ACTION_GLOBAL_RESET {
            PostAction::GlobalReset
        } else {
            PostAction::Continue
        }
    }

    fn raw(self) -> u32 {
        match self {
            PostAction::Continue => 0,
            PostAction::GlobalReset => POST_ACTION_GLOBAL_RESET,
        }
    }
}

/// The closed set of message families
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum_macros::Display, strum_macros::EnumIter)]
pub enum Family {
    EndOfPost,
    DisableInterfaces,
    SetBusOwner,
    PlatformTelemetry,
    HostCapabilities,
    GlobalReset,
}

impl Family {
    /// (group, command)
    pub fn ids(self) -> (u8, u8) {
        match self {
            Family::EndOfPost => (group::GEN, 0x0C),
            Family::DisableInterfaces => (group::BUP_COMMON, 0x03),
            Family::SetBusOwner => (group::MCTP, 0x01),
            Family::PlatformTelemetry => (group::BUP_COMMON, 0x0A),
            Family::HostCapabilities => (group::FWCAPS, 0x05),
            Family::GlobalReset => (group::CBM, 0x0B),
        }
    }

    fn from_ids(group: u8, command: u8) -> Option<Family> {
        use strum::IntoEnumIterator;
        Family::iter().find(|f| f.ids() == (group, command))
    }

    pub fn address(self) -> ClientAddress {
        let ctrl = match self {
            Family::SetBusOwner => client::MCTP,
            Family::PlatformTelemetry => client::TELEMETRY,
            Family::EndOfPost
            | Family::DisableInterfaces
            | Family::HostCapabilities
            | Family::GlobalReset => client::MKHI,
        };
        ClientAddress::new(HOST_CLIENT, ctrl)
    }

    /// Every family is carried by the first interface function.
    pub fn function(self) -> Function {
        Function::Heci1
    }

    /// Disable and reset must get through whatever state the controller
    /// is in; everything else needs it fully up.
    pub fn requires_normal_mode(self) -> bool {
        !matches!(self, Family::DisableInterfaces | Family::GlobalReset)
    }

    pub fn response_len(self) -> usize {
        match self {
            Family::EndOfPost | Family::HostCapabilities => HEADER_LEN + 4,
            Family::DisableInterfaces
            | Family::SetBusOwner
            | Family::PlatformTelemetry
            | Family::GlobalReset => HEADER_LEN,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    EndOfPost,
    DisableInterfaces,
    SetBusOwner { address: u16 },
    PlatformTelemetry(Telemetry),
    HostCapabilities(u32),
    GlobalReset(ResetType),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    EndOfPost { action: PostAction },
    DisableInterfaces,
    SetBusOwner,
    PlatformTelemetry,
    HostCapabilities { granted: u32 },
    GlobalReset,
}

fn pack<S: PackedStructSlice>(s: &S, out: &mut [u8]) -> Result<(), Error> {
    s.pack_to_slice(out).map_err(Error::Packing)
}

fn unpack<S: PackedStructSlice>(bytes: &[u8]) -> Result<S, Error> {
    S::unpack_from_slice(bytes).map_err(Error::Packing)
}

fn expect_len(bytes: &[u8], expected: usize) -> Result<(), Error> {
    if bytes.len() != expected {
        return Err(Fault::LengthMismatch {
            expected,
            got: bytes.len(),
        }
        .into());
    }
    Ok(())
}

fn read_header(bytes: &[u8]) -> Result<MessageHeader, Error> {
    if bytes.len() < HEADER_LEN {
        return Err(Fault::LengthMismatch {
            expected: HEADER_LEN,
            got: bytes.len(),
        }
        .into());
    }
    unpack(&bytes[..HEADER_LEN])
}

impl Request {
    pub fn family(&self) -> Family {
        match self {
            Request::EndOfPost => Family::EndOfPost,
            Request::DisableInterfaces => Family::DisableInterfaces,
            Request::SetBusOwner { .. } => Family::SetBusOwner,
            Request::PlatformTelemetry(_) => Family::PlatformTelemetry,
            Request::HostCapabilities(_) => Family::HostCapabilities,
            Request::GlobalReset(_) => Family::GlobalReset,
        }
    }

    pub fn record_len(&self) -> usize {
        match self {
            Request::EndOfPost | Request::DisableInterfaces => HEADER_LEN,
            Request::SetBusOwner { .. }
            | Request::HostCapabilities(_)
            | Request::GlobalReset(_) => HEADER_LEN + 4,
            Request::PlatformTelemetry(t) => t.record_len(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        if let Request::PlatformTelemetry(t) = self {
            if t.ports.len() > MAX_PORTS {
                return Err(Fault::TooManyPorts(t.ports.len()).into());
            }
        }

        let mut record = vec![0u8; self.record_len()];
        pack(
            &MessageHeader::for_family(self.family(), false),
            &mut record[..HEADER_LEN],
        )?;
        let body = &mut record[HEADER_LEN..];

        match self {
            Request::EndOfPost | Request::DisableInterfaces => {}
            Request::SetBusOwner { address } => {
                pack(&BusOwnerRecord { address: *address }, body)?;
            }
            Request::HostCapabilities(caps) => {
                pack(&WordRecord { value: *caps }, body)?;
            }
            Request::GlobalReset(kind) => {
                let r = GlobalResetRecord {
                    origin: RESET_ORIGIN_FIRMWARE,
                    // Discriminants are all small
                    reset_type: kind.to_u8().unwrap_or_default(),
                };
                pack(&r, body)?;
            }
            Request::PlatformTelemetry(t) => {
                let m = MemoryRecord {
                    ratio: t.memory.ratio,
                    reference_clock: t.memory.reference_clock,
                    channels: t.memory.channels,
                    port_count: t.ports.len() as u8,
                };
                pack(&m, &mut body[..4])?;
                for (port, out) in t.ports.iter().zip(body[4..].chunks_exact_mut(4)) {
                    let p = PortRecord {
                        port: port.port,
                        width: port.width,
                        speed: port.speed,
                    };
                    pack(&p, out)?;
                }
            }
        }
        Ok(record)
    }

    /// Controller-side view of a request.
    pub fn decode(bytes: &[u8]) -> Result<Request, Error> {
        let header = read_header(bytes)?;
        if header.is_response {
            return Err(Fault::UnexpectedResponse.into());
        }
        let family =
            Family::from_ids(header.group, header.command).ok_or(Fault::UnknownFamily {
                group: header.group,
                command: header.command,
            })?;
        let body = &bytes[HEADER_LEN..];

        let request = match family {
            Family::EndOfPost => {
                expect_len(bytes, HEADER_LEN)?;
                Request::EndOfPost
            }
            Family::DisableInterfaces => {
                expect_len(bytes, HEADER_LEN)?;
                Request::DisableInterfaces
            }
            Family::SetBusOwner => {
                expect_len(bytes, HEADER_LEN + 4)?;
                let r: BusOwnerRecord = unpack(body)?;
                Request::SetBusOwner { address: r.address }
            }
            Family::HostCapabilities => {
                expect_len(bytes, HEADER_LEN + 4)?;
                let r: WordRecord = unpack(body)?;
                Request::HostCapabilities(r.value)
            }
            Family::GlobalReset => {
                expect_len(bytes, HEADER_LEN + 4)?;
                let r: GlobalResetRecord = unpack(body)?;
                let kind = ResetType::from_u8(r.reset_type)
                    .ok_or(Fault::UnknownResetType(r.reset_type))?;
                Request::GlobalReset(kind)
            }
            Family::PlatformTelemetry => {
                if body.len() < 4 {
                    return Err(Fault::LengthMismatch {
                        expected: HEADER_LEN + 4,
                        got: bytes.len(),
                    }
                    .into());
                }
                let m: MemoryRecord = unpack(&body[..4])?;
                let count = usize::from(m.port_count);
                if count > MAX_PORTS {
                    return Err(Fault::TooManyPorts(count).into());
                }
                expect_len(bytes, HEADER_LEN + 4 + 4 * count)?;
                let mut ports = Vec::with_capacity(count);
                for chunk in body[4..].chunks_exact(4) {
                    let p: PortRecord = unpack(chunk)?;
                    ports.push(LinkFacts {
                        port: p.port,
                        width: p.width,
                        speed: p.speed,
                    });
                }
                Request::PlatformTelemetry(Telemetry {
                    memory: MemoryFacts {
                        ratio: m.ratio,
                        reference_clock: m.reference_clock,
                        channels: m.channels,
                    },
                    ports,
                })
            }
        };
        Ok(request)
    }
}

impl Response {
    pub fn family(&self) -> Family {
        match self {
            Response::EndOfPost { .. } => Family::EndOfPost,
            Response::DisableInterfaces => Family::DisableInterfaces,
            Response::SetBusOwner => Family::SetBusOwner,
            Response::PlatformTelemetry => Family::PlatformTelemetry,
            Response::HostCapabilities { .. } => Family::HostCapabilities,
            Response::GlobalReset => Family::GlobalReset,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let family = self.family();
        let mut record = vec![0u8; family.response_len()];
        pack(
            &MessageHeader::for_family(family, true),
            &mut record[..HEADER_LEN],
        )?;
        let body = &mut record[HEADER_LEN..];
        match self {
            Response::EndOfPost { action } => pack(&WordRecord { value: action.raw() }, body)?,
            Response::HostCapabilities { granted } => {
                pack(&WordRecord { value: *granted }, body)?
            }
            Response::DisableInterfaces
            | Response::SetBusOwner
            | Response::PlatformTelemetry
            | Response::GlobalReset => {}
        }
        Ok(record)
    }

    /// A bare header refusing `family` with a non-zero result.
    pub fn encode_rejection(family: Family, result: u8) -> Result<Vec<u8>, Error> {
        let mut record = vec![0u8; HEADER_LEN];
        let mut header = MessageHeader::for_family(family, true);
        header.result = result;
        pack(&header, &mut record)?;
        Ok(record)
    }

    /// Decode the answer to a `family` request. The echoed ids and the
    /// response flag are checked before anything else is looked at.
    pub fn decode(family: Family, bytes: &[u8]) -> Result<Response, Error> {
        let header = read_header(bytes)?;
        let (group, command) = family.ids();
        if header.group != group || header.command != command {
            return Err(Fault::EchoMismatch {
                group,
                command,
                got_group: header.group,
                got_command: header.command,
            }
            .into());
        }
        if !header.is_response {
            return Err(Fault::NotAResponse.into());
        }
        if header.result != 0 {
            return Err(Fault::Rejected(header.result).into());
        }
        expect_len(bytes, family.response_len())?;
        let body = &bytes[HEADER_LEN..];

        let response = match family {
            Family::EndOfPost => {
                let r: WordRecord = unpack(body)?;
                Response::EndOfPost {
                    action: PostAction::from_raw(r.value),
                }
            }
            Family::HostCapabilities => {
                let r: WordRecord = unpack(body)?;
                Response::HostCapabilities { granted: r.value }
            }
            Family::DisableInterfaces => Response::DisableInterfaces,
            Family::SetBusOwner => Response::SetBusOwner,
            Family::PlatformTelemetry => Response::PlatformTelemetry,
            Family::GlobalReset => Response::GlobalReset,
        };
        Ok(response)
    }
}
