//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Inlet.
//
// Inlet is free software: you can  redistribute it and/or  modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Inlet is distributed  in the hope that  it will  be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Inlet. If not, see <http://www.gnu.org/licenses/>.

//! One-shot parser for the HAProxy PROXY protocol, versions 1 and 2.
//!
//! A listener behind a load balancer consumes exactly one PROXY header
//! before the SMTP banner. The parser never reads past the end of the
//! header, so the SMTP dialogue can continue on the same stream.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use byteorder::{BigEndian, ByteOrder};
use lazy_static::lazy_static;
use regex::bytes::Regex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::support::error::Error;

pub const V2_SIGNATURE: &[u8; 12] = b"\r\n\r\n\0\r\nQUIT\n";

/// A v1 header is at most 107 octets including the CRLF.
const V1_MAX_LENGTH: usize = 107;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyCommand {
    Local,
    Proxy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyFamily {
    Unspec,
    Inet,
    Inet6,
    Unix,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyProtocol {
    Unspec,
    Stream,
    Dgram,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProxyAddr {
    Ip(IpAddr),
    Unix(String),
}

/// The decoded PROXY header.
///
/// `valid()` distinguishes a header that was understood from one that was
/// recognized but malformed; a malformed header carries the parse failure
/// in `error` and must cause the connection to be dropped before any banner
/// is written.
#[derive(Clone, Debug, Default)]
pub struct ProxyInfo {
    /// 1 or 2; `None` if the preamble was not recognized at all.
    pub version: Option<u8>,
    /// The v2 command. v1 has no command concept.
    pub command: Option<ProxyCommand>,
    pub family: Option<ProxyFamily>,
    pub protocol: Option<ProxyProtocol>,
    pub src_addr: Option<ProxyAddr>,
    pub dst_addr: Option<ProxyAddr>,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    /// Bytes following an UNKNOWN (v1) or UNSPEC (v2) header which carry no
    /// defined meaning.
    pub rest: Vec<u8>,
    /// Decoded v2 TLV vectors, keyed by their standard names; unknown types
    /// are keyed `xNN` with NN the hex type byte. The `SSL` vector is
    /// expanded into `SSL` (presence), `SSL_CLIENT`, `SSL_VERIFY`, and its
    /// sub-vectors.
    pub tlv: BTreeMap<String, Vec<u8>>,
    pub error: Option<String>,
}

impl ProxyInfo {
    fn versioned(version: u8) -> Self {
        Self { version: Some(version), ..Self::default() }
    }

    fn with_error(mut self, error: &str) -> Self {
        self.error = Some(error.to_owned());
        self
    }

    pub fn valid(&self) -> bool {
        self.error.is_none()
            && self.version.is_some()
            && self.protocol.is_some()
    }

    /// A description of the proxied source endpoint, for logging.
    pub fn source_description(&self) -> String {
        match (&self.src_addr, self.src_port) {
            (Some(ProxyAddr::Ip(ip)), Some(port)) => format!("{}:{}", ip, port),
            (Some(ProxyAddr::Unix(path)), _) => path.clone(),
            _ => "unknown".to_owned(),
        }
    }

    #[cfg(test)]
    pub(crate) fn local_v2() -> Self {
        Self {
            version: Some(2),
            command: Some(ProxyCommand::Local),
            family: Some(ProxyFamily::Unspec),
            protocol: Some(ProxyProtocol::Unspec),
            ..Self::default()
        }
    }
}

lazy_static! {
    static ref RX_V1: Regex =
        Regex::new(r"^PROXY (TCP4|TCP6|UNKNOWN)(.*)\r\n$").unwrap();
    static ref RX_V1_ADDR: Regex = Regex::new(
        r"^ ([0-9a-fA-F.:]+) ([0-9a-fA-F.:]+) ([1-9][0-9]{0,4}|0) ([1-9][0-9]{0,4}|0)$"
    )
    .unwrap();
}

/// Consumes one PROXY header from the start of `io`.
///
/// Transport-level failures (EOF before the header is complete) surface as
/// `Err`; anything wrong with the header itself is reported through
/// `ProxyInfo::error` so the caller can log it.
pub async fn read_proxy_header<R: AsyncBufRead + Unpin>(
    io: &mut R,
) -> Result<ProxyInfo, Error> {
    let mut signature = [0u8; 5];
    io.read_exact(&mut signature).await?;

    if b"PROXY" == &signature {
        read_v1(io).await
    } else if V2_SIGNATURE[..5] == signature {
        read_v2(io).await
    } else {
        Ok(ProxyInfo::default().with_error("PROXY unrecognized signature"))
    }
}

async fn read_v1<R: AsyncBufRead + Unpin>(
    io: &mut R,
) -> Result<ProxyInfo, Error> {
    let info = ProxyInfo::versioned(1);

    let mut line = b"PROXY".to_vec();
    (&mut *io)
        .take((V1_MAX_LENGTH - 5) as u64)
        .read_until(b'\n', &mut line)
        .await?;
    if !line.ends_with(b"\n") {
        return Ok(info.with_error("PROXYv1 too long"));
    }

    let Some(cap) = RX_V1.captures(&line) else {
        return Ok(info.with_error("PROXYv1 malformed"));
    };

    let proto = cap.get(1).unwrap().as_bytes();
    let addrs = cap.get(2).unwrap().as_bytes();

    if b"UNKNOWN" == proto {
        return Ok(ProxyInfo {
            family: Some(ProxyFamily::Unspec),
            protocol: Some(ProxyProtocol::Unspec),
            rest: addrs.to_vec(),
            ..info
        });
    }

    let Some(cap) = RX_V1_ADDR.captures(addrs) else {
        return Ok(info.with_error("PROXYv1 address malformed"));
    };

    // The captures are known-ASCII by construction.
    let field =
        |ix: usize| std::str::from_utf8(cap.get(ix).unwrap().as_bytes()).unwrap();
    let Ok(src_addr) = field(1).parse::<IpAddr>() else {
        return Ok(info.with_error("PROXYv1 address parse error"));
    };
    let Ok(dst_addr) = field(2).parse::<IpAddr>() else {
        return Ok(info.with_error("PROXYv1 address parse error"));
    };
    // Five digits can exceed the port range.
    let Ok(src_port) = field(3).parse::<u16>() else {
        return Ok(info.with_error("PROXYv1 src port out of bounds"));
    };
    let Ok(dst_port) = field(4).parse::<u16>() else {
        return Ok(info.with_error("PROXYv1 dst port out of bounds"));
    };

    let family = match (proto, &src_addr, &dst_addr) {
        (b"TCP4", IpAddr::V4(..), IpAddr::V4(..)) => ProxyFamily::Inet,
        (b"TCP6", IpAddr::V6(..), IpAddr::V6(..)) => ProxyFamily::Inet6,
        (b"TCP4", ..) => {
            return Ok(info.with_error("PROXYv1 address not IPv4"));
        },
        _ => return Ok(info.with_error("PROXYv1 address not IPv6")),
    };

    Ok(ProxyInfo {
        family: Some(family),
        protocol: Some(ProxyProtocol::Stream),
        src_addr: Some(ProxyAddr::Ip(src_addr)),
        dst_addr: Some(ProxyAddr::Ip(dst_addr)),
        src_port: Some(src_port),
        dst_port: Some(dst_port),
        ..info
    })
}

async fn read_v2<R: AsyncBufRead + Unpin>(
    io: &mut R,
) -> Result<ProxyInfo, Error> {
    let mut info = ProxyInfo::versioned(2);

    let mut sig_rest = [0u8; 7];
    io.read_exact(&mut sig_rest).await?;
    if V2_SIGNATURE[5..] != sig_rest {
        return Ok(info.with_error("PROXYv2 wrong signature"));
    }

    let mut header = [0u8; 4];
    io.read_exact(&mut header).await?;
    let ver_cmd = header[0];
    let fam_proto = header[1];
    let len = BigEndian::read_u16(&header[2..4]) as usize;

    if 0x20 != ver_cmd & 0xF0 {
        return Ok(info.with_error("PROXYv2 illegal version"));
    }

    info.command = match ver_cmd & 0x0F {
        0 => Some(ProxyCommand::Local),
        1 => Some(ProxyCommand::Proxy),
        _ => return Ok(info.with_error("PROXYv2 unsupported command")),
    };

    let family = match fam_proto >> 4 {
        0 => ProxyFamily::Unspec,
        1 => ProxyFamily::Inet,
        2 => ProxyFamily::Inet6,
        3 => ProxyFamily::Unix,
        _ => return Ok(info.with_error("PROXYv2 unsupported family")),
    };
    info.family = Some(family);

    let protocol = match fam_proto & 0x0F {
        0 => ProxyProtocol::Unspec,
        1 => ProxyProtocol::Stream,
        2 => ProxyProtocol::Dgram,
        _ => return Ok(info.with_error("PROXYv2 unsupported protocol")),
    };

    let mut rest = vec![0u8; len];
    io.read_exact(&mut rest).await?;

    // Only decode the address block for a concrete family/protocol pair;
    // anything involving UNSPEC keeps the undecoded payload.
    if ProxyFamily::Unspec == family || ProxyProtocol::Unspec == protocol {
        info.protocol = Some(protocol);
        info.rest = rest;
        return Ok(info);
    }

    let addr_len = match family {
        ProxyFamily::Inet => 12,
        ProxyFamily::Inet6 => 36,
        ProxyFamily::Unix => 216,
        ProxyFamily::Unspec => unreachable!(),
    };
    if rest.len() < addr_len {
        return Ok(info.with_error("PROXYv2 truncated address"));
    }

    match family {
        ProxyFamily::Inet => {
            let mut quad = [0u8; 4];
            quad.copy_from_slice(&rest[0..4]);
            info.src_addr =
                Some(ProxyAddr::Ip(IpAddr::V4(Ipv4Addr::from(quad))));
            quad.copy_from_slice(&rest[4..8]);
            info.dst_addr =
                Some(ProxyAddr::Ip(IpAddr::V4(Ipv4Addr::from(quad))));
            info.src_port = Some(BigEndian::read_u16(&rest[8..10]));
            info.dst_port = Some(BigEndian::read_u16(&rest[10..12]));
        },
        ProxyFamily::Inet6 => {
            let mut a = [0u8; 16];
            a.copy_from_slice(&rest[0..16]);
            info.src_addr = Some(ProxyAddr::Ip(IpAddr::V6(Ipv6Addr::from(a))));
            a.copy_from_slice(&rest[16..32]);
            info.dst_addr = Some(ProxyAddr::Ip(IpAddr::V6(Ipv6Addr::from(a))));
            info.src_port = Some(BigEndian::read_u16(&rest[32..34]));
            info.dst_port = Some(BigEndian::read_u16(&rest[34..36]));
        },
        ProxyFamily::Unix => {
            info.src_addr = Some(ProxyAddr::Unix(unix_path(&rest[0..108])));
            info.dst_addr = Some(ProxyAddr::Unix(unix_path(&rest[108..216])));
        },
        ProxyFamily::Unspec => unreachable!(),
    }
    info.protocol = Some(protocol);

    if let Err(e) = parse_tlvs(&rest[addr_len..], &mut info.tlv) {
        return Ok(info.with_error(&e));
    }

    Ok(info)
}

fn unix_path(raw: &[u8]) -> String {
    let end = memchr::memchr(0, raw).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn tlv_type_name(typ: u8) -> String {
    match typ {
        0x01 => "ALPN".to_owned(),
        0x02 => "AUTHORITY".to_owned(),
        0x03 => "CRC32C".to_owned(),
        0x04 => "NOOP".to_owned(),
        0x05 => "UNIQUE_ID".to_owned(),
        0x20 => "SSL".to_owned(),
        0x21 => "SSL_VERSION".to_owned(),
        0x22 => "SSL_CN".to_owned(),
        0x23 => "SSL_CIPHER".to_owned(),
        0x24 => "SSL_SIG_ALG".to_owned(),
        0x25 => "SSL_KEY_ALG".to_owned(),
        0x30 => "NETNS".to_owned(),
        _ => format!("x{:02X}", typ),
    }
}

fn parse_tlvs(
    data: &[u8],
    map: &mut BTreeMap<String, Vec<u8>>,
) -> Result<(), String> {
    let mut i = 0usize;
    while i < data.len() {
        let typ = data[i];
        if i + 3 > data.len() {
            return Err(format!("TLV 0x{:02X} is malformed", typ));
        }

        let len = BigEndian::read_u16(&data[i + 1..i + 3]) as usize;
        let Some(val) = data.get(i + 3..i + 3 + len) else {
            return Err(format!("TLV 0x{:02X} is malformed", typ));
        };

        let name = tlv_type_name(typ);
        if "SSL" == name {
            if val.len() < 5 {
                return Err("TLV 0x20 is malformed".to_owned());
            }
            map.insert("SSL".to_owned(), vec![1]);
            map.insert("SSL_CLIENT".to_owned(), val[0..1].to_vec());
            map.insert("SSL_VERIFY".to_owned(), val[1..5].to_vec());
            parse_tlvs(&val[5..], map)?;
        } else {
            map.insert(name, val.to_vec());
        }

        i += 3 + len;
    }

    Ok(())
}
