//! DHCP options as defined in RFC 2132.
//!
//! Every option on the wire is a TLV: one code byte, one length byte and up
//! to 255 bytes of data. Only the options this server consumes or produces
//! get a typed variant; anything else is carried as [`DhcpOption::Unknown`].

use std::fmt;
use std::net::Ipv4Addr;

use crate::error::{Error, Result};

/// Option data is limited by its one-byte length field.
const MAX_OPTION_DATA: usize = u8::MAX as usize;

/// DHCP option codes handled by this server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionCode {
    Pad = 0,
    SubnetMask = 1,
    Router = 3,
    DnsServer = 6,
    Hostname = 12,
    DomainName = 15,
    BroadcastAddress = 28,
    RequestedIpAddress = 50,
    LeaseTime = 51,
    /// Signals that `sname` and/or `file` carry more options.
    OptionOverload = 52,
    MessageType = 53,
    ServerIdentifier = 54,
    /// T1.
    RenewalTime = 58,
    /// T2.
    RebindingTime = 59,
    End = 255,
}

impl TryFrom<u8> for OptionCode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Pad),
            1 => Ok(Self::SubnetMask),
            3 => Ok(Self::Router),
            6 => Ok(Self::DnsServer),
            12 => Ok(Self::Hostname),
            15 => Ok(Self::DomainName),
            28 => Ok(Self::BroadcastAddress),
            50 => Ok(Self::RequestedIpAddress),
            51 => Ok(Self::LeaseTime),
            52 => Ok(Self::OptionOverload),
            53 => Ok(Self::MessageType),
            54 => Ok(Self::ServerIdentifier),
            58 => Ok(Self::RenewalTime),
            59 => Ok(Self::RebindingTime),
            255 => Ok(Self::End),
            other => Err(other),
        }
    }
}

/// DHCP message types carried in option 53 (RFC 2132 §9.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Discover),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Request),
            4 => Ok(Self::Decline),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Nak),
            7 => Ok(Self::Release),
            8 => Ok(Self::Inform),
            other => Err(other),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Discover => "DHCPDISCOVER",
            Self::Offer => "DHCPOFFER",
            Self::Request => "DHCPREQUEST",
            Self::Decline => "DHCPDECLINE",
            Self::Ack => "DHCPACK",
            Self::Nak => "DHCPNAK",
            Self::Release => "DHCPRELEASE",
            Self::Inform => "DHCPINFORM",
        };
        f.pad(name)
    }
}

/// Option overload flags (option 52, RFC 2132 §9.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OverloadFlag {
    File = 1,
    Sname = 2,
    Both = 3,
}

impl OverloadFlag {
    pub fn covers_file(self) -> bool {
        matches!(self, Self::File | Self::Both)
    }

    pub fn covers_sname(self) -> bool {
        matches!(self, Self::Sname | Self::Both)
    }
}

impl TryFrom<u8> for OverloadFlag {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::File),
            2 => Ok(Self::Sname),
            3 => Ok(Self::Both),
            other => Err(other),
        }
    }
}

/// A decoded DHCP option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOption {
    SubnetMask(Ipv4Addr),
    /// First address is the default gateway.
    Router(Vec<Ipv4Addr>),
    DnsServer(Vec<Ipv4Addr>),
    Hostname(String),
    DomainName(String),
    BroadcastAddress(Ipv4Addr),
    RequestedIpAddress(Ipv4Addr),
    /// Seconds.
    LeaseTime(u32),
    OptionOverload(OverloadFlag),
    MessageType(MessageType),
    ServerIdentifier(Ipv4Addr),
    RenewalTime(u32),
    RebindingTime(u32),
    /// Any other option, raw. A message-type option with an unrecognized
    /// code also lands here so the packet can still be routed and logged.
    Unknown(u8, Vec<u8>),
}

fn exact<const N: usize>(data: &[u8], what: &str) -> Result<[u8; N]> {
    data.try_into().map_err(|_| {
        Error::InvalidPacket(format!(
            "Invalid {} length: {} (expected {})",
            what,
            data.len(),
            N
        ))
    })
}

fn ipv4(data: &[u8], what: &str) -> Result<Ipv4Addr> {
    exact::<4>(data, what).map(Ipv4Addr::from)
}

fn seconds(data: &[u8], what: &str) -> Result<u32> {
    exact::<4>(data, what).map(u32::from_be_bytes)
}

fn ipv4_list(data: &[u8], what: &str) -> Result<Vec<Ipv4Addr>> {
    if data.is_empty() || !data.len().is_multiple_of(4) {
        return Err(Error::InvalidPacket(format!(
            "Invalid {} length: {}",
            what,
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(4)
        .map(|chunk| Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]))
        .collect())
}

fn push_tlv(out: &mut Vec<u8>, code: u8, data: &[u8]) {
    let data = &data[..data.len().min(MAX_OPTION_DATA)];
    out.push(code);
    out.push(data.len() as u8);
    out.extend_from_slice(data);
}

fn push_addresses(out: &mut Vec<u8>, code: OptionCode, addresses: &[Ipv4Addr]) {
    let data: Vec<u8> = addresses
        .iter()
        .take(MAX_OPTION_DATA / 4)
        .flat_map(|addr| addr.octets())
        .collect();
    push_tlv(out, code as u8, &data);
}

impl DhcpOption {
    /// Returns the RFC 2132 option code for this option.
    pub fn code(&self) -> u8 {
        let code = match self {
            Self::SubnetMask(_) => OptionCode::SubnetMask,
            Self::Router(_) => OptionCode::Router,
            Self::DnsServer(_) => OptionCode::DnsServer,
            Self::Hostname(_) => OptionCode::Hostname,
            Self::DomainName(_) => OptionCode::DomainName,
            Self::BroadcastAddress(_) => OptionCode::BroadcastAddress,
            Self::RequestedIpAddress(_) => OptionCode::RequestedIpAddress,
            Self::LeaseTime(_) => OptionCode::LeaseTime,
            Self::OptionOverload(_) => OptionCode::OptionOverload,
            Self::MessageType(_) => OptionCode::MessageType,
            Self::ServerIdentifier(_) => OptionCode::ServerIdentifier,
            Self::RenewalTime(_) => OptionCode::RenewalTime,
            Self::RebindingTime(_) => OptionCode::RebindingTime,
            Self::Unknown(code, _) => return *code,
        };
        code as u8
    }

    /// Decodes one option from its code and data bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPacket`] when the data length does not fit the
    /// option (e.g. a subnet mask that is not exactly 4 bytes).
    pub fn parse(code: u8, data: &[u8]) -> Result<Self> {
        let Ok(known) = OptionCode::try_from(code) else {
            return Ok(Self::Unknown(code, data.to_vec()));
        };

        match known {
            OptionCode::SubnetMask => ipv4(data, "subnet mask").map(Self::SubnetMask),
            OptionCode::Router => ipv4_list(data, "router option").map(Self::Router),
            OptionCode::DnsServer => ipv4_list(data, "DNS server option").map(Self::DnsServer),
            OptionCode::Hostname => Ok(Self::Hostname(String::from_utf8_lossy(data).into_owned())),
            OptionCode::DomainName => {
                Ok(Self::DomainName(String::from_utf8_lossy(data).into_owned()))
            }
            OptionCode::BroadcastAddress => {
                ipv4(data, "broadcast address").map(Self::BroadcastAddress)
            }
            OptionCode::RequestedIpAddress => {
                ipv4(data, "requested IP address").map(Self::RequestedIpAddress)
            }
            OptionCode::LeaseTime => seconds(data, "lease time").map(Self::LeaseTime),
            OptionCode::OptionOverload => {
                let [value] = exact::<1>(data, "option overload")?;
                OverloadFlag::try_from(value)
                    .map(Self::OptionOverload)
                    .map_err(|value| {
                        Error::InvalidPacket(format!("Invalid option overload value: {}", value))
                    })
            }
            OptionCode::MessageType => {
                let [value] = exact::<1>(data, "message type")?;
                Ok(MessageType::try_from(value)
                    .map(Self::MessageType)
                    .unwrap_or_else(|_| Self::Unknown(code, data.to_vec())))
            }
            OptionCode::ServerIdentifier => {
                ipv4(data, "server identifier").map(Self::ServerIdentifier)
            }
            OptionCode::RenewalTime => seconds(data, "renewal time").map(Self::RenewalTime),
            OptionCode::RebindingTime => seconds(data, "rebinding time").map(Self::RebindingTime),
            OptionCode::Pad | OptionCode::End => Err(Error::InvalidPacket(
                "Pad/End should not be parsed as options".to_string(),
            )),
        }
    }

    /// Appends the wire form (code, length, data) to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let code = self.code();
        match self {
            Self::SubnetMask(addr)
            | Self::BroadcastAddress(addr)
            | Self::RequestedIpAddress(addr)
            | Self::ServerIdentifier(addr) => push_tlv(out, code, &addr.octets()),
            Self::Router(addrs) => push_addresses(out, OptionCode::Router, addrs),
            Self::DnsServer(addrs) => push_addresses(out, OptionCode::DnsServer, addrs),
            Self::Hostname(name) | Self::DomainName(name) => push_tlv(out, code, name.as_bytes()),
            Self::LeaseTime(secs) | Self::RenewalTime(secs) | Self::RebindingTime(secs) => {
                push_tlv(out, code, &secs.to_be_bytes())
            }
            Self::OptionOverload(flag) => push_tlv(out, code, &[*flag as u8]),
            Self::MessageType(message_type) => push_tlv(out, code, &[*message_type as u8]),
            Self::Unknown(_, data) => push_tlv(out, code, data),
        }
    }

    /// Wire form of a single option.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8);
        self.encode_into(&mut out);
        out
    }
}
