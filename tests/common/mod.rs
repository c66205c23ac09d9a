#![allow(dead_code)]

use std::net::SocketAddr;

const V2_SIGNATURE: &[u8] = b"\r\n\r\n\x00\r\nQUIT\n";

pub fn encode_v1(source: SocketAddr, destination: SocketAddr) -> Vec<u8> {
    let proto = match source {
        SocketAddr::V4(_) => "TCP4",
        SocketAddr::V6(_) => "TCP6",
    };

    format!(
        "PROXY {} {} {} {} {}\r\n",
        proto,
        source.ip(),
        destination.ip(),
        source.port(),
        destination.port()
    )
    .into_bytes()
}

pub fn encode_v2(source: SocketAddr, destination: SocketAddr) -> Vec<u8> {
    let mut block = Vec::new();
    let family = match (source, destination) {
        (SocketAddr::V4(src), SocketAddr::V4(dst)) => {
            block.extend_from_slice(&src.ip().octets());
            block.extend_from_slice(&dst.ip().octets());
            0x11
        }
        (SocketAddr::V6(src), SocketAddr::V6(dst)) => {
            block.extend_from_slice(&src.ip().octets());
            block.extend_from_slice(&dst.ip().octets());
            0x21
        }
        _ => panic!("address family mismatch"),
    };
    block.extend_from_slice(&source.port().to_be_bytes());
    block.extend_from_slice(&destination.port().to_be_bytes());

    with_block(family, &block)
}

pub fn encode_v2_unix(source: &str, destination: &str) -> Vec<u8> {
    let mut block = vec![0u8; 216];
    block[..source.len()].copy_from_slice(source.as_bytes());
    block[108..108 + destination.len()].copy_from_slice(destination.as_bytes());

    with_block(0x31, &block)
}

fn with_block(family: u8, block: &[u8]) -> Vec<u8> {
    let mut buf = V2_SIGNATURE.to_vec();
    buf.extend_from_slice(&[0x21, family]);
    buf.extend_from_slice(&(block.len() as u16).to_be_bytes());
    buf.extend_from_slice(block);
    buf
}

/// Deterministic filler bytes
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 253) as u8).collect()
}
