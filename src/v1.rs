use std::net::IpAddr;
use std::str::{from_utf8, FromStr};

use crate::util::Cursor;
use crate::{
    Error::{self, *},
    Endpoint, Field, ProxiedAddress,
};

pub(crate) const SIGNATURE: &[u8] = b"PROXY ";

fn parse_addr(cursor: &mut Cursor<'_>, field: Field) -> Result<IpAddr, Error> {
    let address = cursor.read_until(b' ', field)?;

    from_utf8(address)
        .ok()
        .and_then(|s| IpAddr::from_str(s).ok())
        .ok_or(InvalidAddress(field))
}

/// Ports are decimal and not limited to 16 bits.
fn parse_port(token: &[u8], field: Field) -> Result<u32, Error> {
    from_utf8(token)
        .ok()
        .and_then(|s| u32::from_str(s).ok())
        .ok_or(InvalidPort(field))
}

/// Decode the body of a version 1 PROXY header.
///
/// The cursor must be positioned right after the `PROXY ` signature. On success it
/// is left right after the terminating CRLF.
pub fn decode(cursor: &mut Cursor<'_>) -> Result<ProxiedAddress, Error> {
    match cursor.read_until(b' ', Field::Protocol)? {
        b"TCP4" | b"TCP6" => {}
        _ => return Err(UnsupportedProtocol),
    }

    // The address family is not cross-checked against the protocol token.
    let src_addr = parse_addr(cursor, Field::SourceAddress)?;
    let dst_addr = parse_addr(cursor, Field::DestinationAddress)?;

    let src_port = cursor.read_until(b' ', Field::SourcePort)?;
    let src_port = parse_port(src_port, Field::SourcePort)?;
    let dst_port = cursor.read_until_seq(b"\r\n", Field::DestinationPort)?;
    let dst_port = parse_port(dst_port, Field::DestinationPort)?;

    Ok(ProxiedAddress {
        source: Endpoint::ip(src_addr, src_port),
        destination: Endpoint::ip(dst_addr, dst_port),
    })
}
