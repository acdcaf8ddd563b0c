//! SOCKS5 wire format (RFC 1928 subset)
//!
//! Shared by the client-facing session and the upstream connector.

use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{RelayError, Result};

pub const VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const CMD_CONNECT: u8 = 0x01;
pub const RESERVED: u8 = 0x00;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Method selection reply: version 5, no authentication
pub const NO_AUTH_REPLY: [u8; 2] = [VERSION, METHOD_NO_AUTH];

/// Reply status codes the relay sends to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl Reply {
    /// Encode a full reply. The relay never exposes a bound address, so it
    /// always reports `0.0.0.0:0`.
    pub fn encode(self) -> [u8; 10] {
        [VERSION, self as u8, RESERVED, ATYP_IPV4, 0, 0, 0, 0, 0, 0]
    }
}

/// Destination host as requested by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Host {
    Ipv4(Ipv4Addr),
    Domain(String),
    Ipv6(Ipv6Addr),
}

impl std::fmt::Display for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Host::Ipv4(ip) => write!(f, "{}", ip),
            Host::Domain(name) => write!(f, "{}", name),
            Host::Ipv6(ip) => write!(f, "{}", ip),
        }
    }
}

/// Destination of a CONNECT request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddr {
    pub host: Host,
    pub port: u16,
}

impl std::fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.host {
            Host::Ipv6(ip) => write!(f, "[{}]:{}", ip, self.port),
            _ => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

/// Read `DST.ADDR` and `DST.PORT` for the given address type
pub async fn read_target<R>(reader: &mut R, atyp: u8) -> Result<TargetAddr>
where
    R: AsyncRead + Unpin,
{
    let host = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            reader.read_exact(&mut octets).await?;
            Host::Ipv4(Ipv4Addr::from(octets))
        }
        ATYP_DOMAIN => {
            let len = reader.read_u8().await? as usize;
            if len == 0 {
                return Err(RelayError::InvalidDomain);
            }
            let mut name = vec![0u8; len];
            reader.read_exact(&mut name).await?;
            let name = String::from_utf8(name).map_err(|_| RelayError::InvalidDomain)?;
            Host::Domain(name)
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            reader.read_exact(&mut octets).await?;
            Host::Ipv6(Ipv6Addr::from(octets))
        }
        other => return Err(RelayError::UnsupportedAddressType(other)),
    };

    let port = reader.read_u16().await?;
    Ok(TargetAddr { host, port })
}

/// Greeting offering only the no-auth method
pub fn encode_greeting() -> [u8; 3] {
    [VERSION, 0x01, METHOD_NO_AUTH]
}

/// CONNECT request carrying the destination as a domain name
pub fn encode_connect_request(host: &str, port: u16) -> Result<Bytes> {
    let len = u8::try_from(host.len())
        .ok()
        .filter(|len| *len > 0)
        .ok_or(RelayError::InvalidDomain)?;

    let mut buf = BytesMut::with_capacity(7 + host.len());
    buf.put_slice(&[VERSION, CMD_CONNECT, RESERVED, ATYP_DOMAIN]);
    buf.put_u8(len);
    buf.put_slice(host.as_bytes());
    buf.put_u16(port);
    Ok(buf.freeze())
}

/// Number of trailing `BND.ADDR` + `BND.PORT` bytes for a fixed-width address type
pub fn bound_address_len(atyp: u8) -> Option<usize> {
    match atyp {
        ATYP_IPV4 => Some(4 + 2),
        ATYP_IPV6 => Some(16 + 2),
        _ => None,
    }
}
