use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::util::{AddressFamily, Cursor};
use crate::{
    Endpoint,
    Error::{self, *},
    Field, ProxiedAddress,
};

pub(crate) const SIGNATURE: &[u8] = b"\r\n\r\n\x00\r\nQUIT\n";

const VERSION: u8 = 0x2;
const CMD_PROXY: u8 = 0x1;
const AF_INET: u8 = 0x1;
const AF_INET6: u8 = 0x2;
const AF_UNIX: u8 = 0x3;
const TRANSPORT_STREAM: u8 = 0x1;

const AF_UNIX_NAME_LEN: usize = 108;
pub(crate) const AF_UNIX_ADDRS_LEN: usize = AF_UNIX_NAME_LEN * 2;

fn parse_addrs<T: AddressFamily>(block: &[u8]) -> Result<ProxiedAddress, Error> {
    let len = T::BYTES * 2 + 4;
    if block.len() < len {
        return Err(AddressBlockTooShort {
            expected: len,
            actual: block.len(),
        });
    }

    let ports = &block[T::BYTES * 2..];
    Ok(ProxiedAddress::inet(
        SocketAddr::new(
            T::from_slice(&block[..T::BYTES]).to_ip_addr(),
            u16::from_be_bytes([ports[0], ports[1]]),
        ),
        SocketAddr::new(
            T::from_slice(&block[T::BYTES..T::BYTES * 2]).to_ip_addr(),
            u16::from_be_bytes([ports[2], ports[3]]),
        ),
    ))
}

fn unix_name(raw: &[u8]) -> Vec<u8> {
    let end = raw.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    raw[..end].to_vec()
}

fn parse_unix_addrs(block: &[u8]) -> Result<ProxiedAddress, Error> {
    if block.len() < AF_UNIX_ADDRS_LEN {
        return Err(AddressBlockTooShort {
            expected: AF_UNIX_ADDRS_LEN,
            actual: block.len(),
        });
    }

    Ok(ProxiedAddress {
        source: Endpoint::Unix(unix_name(&block[..AF_UNIX_NAME_LEN])),
        destination: Endpoint::Unix(unix_name(&block[AF_UNIX_NAME_LEN..AF_UNIX_ADDRS_LEN])),
    })
}

/// Decode the body of a version 2 PROXY header.
///
/// The cursor must be positioned right after the 12 byte signature. On success it is
/// left right after the address block, including any TLV bytes counted in the length
/// field (those are skipped, not decoded).
pub fn decode(cursor: &mut Cursor<'_>) -> Result<ProxiedAddress, Error> {
    let ver_cmd = cursor.read_byte(Field::VersionCommand)?;
    let (version, command) = (ver_cmd >> 4, ver_cmd & 0x0f);
    if version != VERSION {
        return Err(UnsupportedVersion(version));
    }
    // LOCAL (0x0) is rejected along with unknown commands.
    if command != CMD_PROXY {
        return Err(UnsupportedCommand(command));
    }

    let fam_transport = cursor.read_byte(Field::FamilyTransport)?;
    let (family, transport) = (fam_transport >> 4, fam_transport & 0x0f);
    if !matches!(family, AF_INET | AF_INET6 | AF_UNIX) {
        return Err(UnsupportedFamily(family));
    }
    if transport != TRANSPORT_STREAM {
        return Err(UnsupportedTransport(transport));
    }

    let len = cursor.read_exact(2, Field::Length)?;
    let len = u16::from_be_bytes([len[0], len[1]]) as usize;
    let block = cursor.read_exact(len, Field::AddressBlock)?;

    match family {
        AF_INET => parse_addrs::<Ipv4Addr>(block),
        AF_INET6 => parse_addrs::<Ipv6Addr>(block),
        _ => parse_unix_addrs(block),
    }
}
