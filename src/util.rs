use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::{Error, Field};

/// Read cursor over the bytes captured by the single peek read.
///
/// Every method either succeeds and advances the position, or fails with
/// [`Error::BufferTooShort`] and leaves the position untouched.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    /// Returns the bytes before `delim` and moves past the delimiter.
    pub fn read_until(&mut self, delim: u8, field: Field) -> Result<&'a [u8], Error> {
        let rest = self.remaining();
        let Some(i) = rest.iter().position(|&b| b == delim) else {
            return Err(Error::BufferTooShort(field));
        };

        self.pos += i + 1;
        Ok(&rest[..i])
    }

    /// Same as [`read_until`](Self::read_until), with a multi-byte delimiter.
    pub fn read_until_seq(&mut self, delim: &[u8], field: Field) -> Result<&'a [u8], Error> {
        let rest = self.remaining();
        let Some(i) = rest.windows(delim.len()).position(|w| w == delim) else {
            return Err(Error::BufferTooShort(field));
        };

        self.pos += i + delim.len();
        Ok(&rest[..i])
    }

    pub fn read_exact(&mut self, n: usize, field: Field) -> Result<&'a [u8], Error> {
        let rest = self.remaining();
        if rest.len() < n {
            return Err(Error::BufferTooShort(field));
        }

        self.pos += n;
        Ok(&rest[..n])
    }

    pub fn read_byte(&mut self, field: Field) -> Result<u8, Error> {
        self.read_exact(1, field).map(|b| b[0])
    }
}

pub trait AddressFamily {
    const BYTES: usize;

    fn to_ip_addr(self) -> IpAddr;
    fn from_slice(slice: &[u8]) -> Self;
}

impl AddressFamily for Ipv4Addr {
    const BYTES: usize = 4;

    fn to_ip_addr(self) -> IpAddr {
        IpAddr::V4(self)
    }

    fn from_slice(slice: &[u8]) -> Self {
        let arr: [u8; 4] = slice.try_into().expect("slice must be 4 bytes");
        arr.into()
    }
}

impl AddressFamily for Ipv6Addr {
    const BYTES: usize = 16;

    fn to_ip_addr(self) -> IpAddr {
        IpAddr::V6(self)
    }

    fn from_slice(slice: &[u8]) -> Self {
        let arr: [u8; 16] = slice.try_into().expect("slice must be 16 bytes");
        arr.into()
    }
}
