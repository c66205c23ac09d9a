//! Optional PROXY protocol detection for accepted connections
//!
//! This crate wraps a freshly accepted connection and transparently detects, validates and
//! strips a leading [PROXY protocol](https://www.haproxy.org/download/2.8/doc/proxy-protocol.txt)
//! header, if there is one. Load balancers such as HAProxy or Amazon NLB prepend this header
//! to preserve the original client and destination addresses of a proxied TCP connection.
//!
//! Unlike a strict decoder, the header is *optional*: a peer that connects directly (without
//! a proxy in front) sees its connection behave exactly like an unwrapped one, and a header
//! that fails to parse is handed to the application as ordinary data instead of killing the
//! connection.
//!
//! Both the text based version 1 and the binary version 2 (`AF_INET`, `AF_INET6` and `AF_UNIX`
//! address families, `PROXY` command, stream transport) are supported. TLV extensions are
//! skipped, not decoded.
//!
//! # How it works
//!
//! The first read from the stream, or the first address query, performs exactly one read of
//! up to [`PEEK_CAPACITY`] bytes from the underlying connection. The header must arrive within
//! that single read (in practice proxies send it in the first segment). The peeked bytes are
//! then classified:
//!
//! - `PROXY ` prefix: the version 1 parser runs,
//! - the 12 byte binary signature: the version 2 parser runs,
//! - anything else: the connection is passed through untouched.
//!
//! Whatever follows the header in the peeked bytes (or all of them when there was no valid
//! header) is replayed to subsequent reads, after which reads go straight to the underlying
//! connection.
//!
//! # Usage
//!
//! ```no_run
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use std::io::{Read, Write};
//! use dynamic_proxy_header::listener::ProxiedListener;
//!
//! let listener = ProxiedListener::bind("[::]:1234")?;
//!
//! for stream in listener.incoming() {
//!     let mut stream = stream?;
//!
//!     // Either the address from the PROXY header or the socket's peer address
//!     println!("connection from {}", stream.remote_addr()?);
//!
//!     let mut buf = [0u8; 1024];
//!     let n = stream.read(&mut buf)?;
//!     stream.write_all(&buf[..n])?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! The detection step is also available on its own, for buffers that were read by other means:
//!
//! ```
//! use dynamic_proxy_header::{Config, Detection};
//!
//! let buf = b"PROXY TCP4 10.1.1.1 20.2.2.2 1000 2000\r\nping";
//!
//! let (detection, consumed) = Detection::detect(buf, Config::default());
//! let addr = detection.proxied_address().unwrap();
//!
//! assert_eq!(addr.source.to_string(), "10.1.1.1:1000");
//! assert_eq!(&buf[consumed..], b"ping");
//! ```
//!
//! See the [`io`] module for the stream wrapper, including the Tokio flavour.
#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, allow(unused_attributes))]

mod util;
mod v1;
mod v2;

pub mod io;
pub mod listener;

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::util::Cursor;

/// Number of bytes captured by the single detection read
pub const PEEK_CAPACITY: usize = 512;

/// One end of a connection
#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub enum Endpoint {
    /// IPv4 or IPv6 address and port
    Inet(SocketAddr),
    /// IPv4 or IPv6 address with a port that does not fit in 16 bits
    ///
    /// Only version 1 headers produce this, their ports are plain decimal numbers.
    InetWide { ip: IpAddr, port: u32 },
    /// Unix domain socket name, as raw bytes
    ///
    /// For addresses from a PROXY header, this is the 108 byte name with trailing NUL
    /// padding removed. Abstract names keep their leading NUL byte. Unnamed sockets
    /// have an empty name.
    Unix(Vec<u8>),
}

impl Endpoint {
    /// Returns the socket address if this is an `Inet` endpoint
    pub fn as_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Endpoint::Inet(addr) => Some(*addr),
            Endpoint::InetWide { .. } | Endpoint::Unix(_) => None,
        }
    }

    /// IP address and port, widening the port to 32 bits if needed.
    pub(crate) fn ip(ip: IpAddr, port: u32) -> Self {
        match u16::try_from(port) {
            Ok(port) => Endpoint::Inet(SocketAddr::new(ip, port)),
            Err(_) => Endpoint::InetWide { ip, port },
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Endpoint::Inet(addr)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Inet(addr) => fmt::Display::fmt(addr, f),
            Endpoint::InetWide {
                ip: IpAddr::V4(ip),
                port,
            } => write!(f, "{}:{}", ip, port),
            Endpoint::InetWide {
                ip: IpAddr::V6(ip),
                port,
            } => write!(f, "[{}]:{}", ip, port),
            Endpoint::Unix(name) => write!(f, "{}", String::from_utf8_lossy(name).escape_debug()),
        }
    }
}

/// Address information from a PROXY protocol header
#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub struct ProxiedAddress {
    /// Source address (this is the address of the actual client)
    pub source: Endpoint,
    /// Destination address (this is the address of the proxy)
    pub destination: Endpoint,
}

impl ProxiedAddress {
    pub fn inet(source: SocketAddr, destination: SocketAddr) -> Self {
        Self {
            source: Endpoint::Inet(source),
            destination: Endpoint::Inet(destination),
        }
    }
}

/// PROXY protocol version
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum Version {
    V1,
    V2,
}

/// Outcome of inspecting the start of a connection
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Detection {
    /// A valid version 1 header was found and stripped
    V1(ProxiedAddress),
    /// A valid version 2 header was found and stripped
    V2(ProxiedAddress),
    /// No header is used, all bytes belong to the application
    ///
    /// Contains the reason if a signature matched but the header was rejected.
    Bypass(Option<Error>),
}

impl Default for Detection {
    fn default() -> Self {
        Detection::Bypass(None)
    }
}

impl Detection {
    /// Classify the start of a connection and parse the PROXY header, if any.
    ///
    /// Returns the outcome and the number of bytes that belong to the header. Bytes past
    /// that offset are payload. When no header is used (no signature, a disabled version,
    /// or a header that failed to parse) the offset is 0, i.e. the entire buffer, including
    /// any signature bytes, is payload.
    ///
    /// Parsing never looks past the end of `buf`; a header that does not fit is rejected with
    /// [`Error::BufferTooShort`].
    pub fn detect(buf: &[u8], config: Config) -> (Self, usize) {
        let (version, signature) = if buf.starts_with(v1::SIGNATURE) {
            (Version::V1, v1::SIGNATURE)
        } else if buf.starts_with(v2::SIGNATURE) {
            (Version::V2, v2::SIGNATURE)
        } else {
            return (Detection::Bypass(None), 0);
        };

        let allowed = match version {
            Version::V1 => config.allow_v1,
            Version::V2 => config.allow_v2,
        };
        if !allowed {
            tracing::trace!(?version, "PROXY header version disabled, passing through");
            return (Detection::Bypass(None), 0);
        }

        let mut cursor = Cursor::new(buf);
        let res = cursor
            .read_exact(signature.len(), Field::Signature)
            .and_then(|_| match version {
                Version::V1 => v1::decode(&mut cursor).map(Detection::V1),
                Version::V2 => v2::decode(&mut cursor).map(Detection::V2),
            });

        match res {
            Ok(detection) => {
                tracing::trace!(?version, len = cursor.position(), "parsed PROXY header");
                (detection, cursor.position())
            }
            Err(err) => {
                tracing::debug!(?version, error = %err, "malformed PROXY header, passing through");
                (Detection::Bypass(Some(err)), 0)
            }
        }
    }

    /// Version of the header that was stripped, if any
    pub fn version(&self) -> Option<Version> {
        match self {
            Detection::V1(_) => Some(Version::V1),
            Detection::V2(_) => Some(Version::V2),
            Detection::Bypass(_) => None,
        }
    }

    /// Address information from the stripped header
    ///
    /// If `None`, the connection is not proxied (or the header was rejected) and the
    /// addresses of the underlying connection apply.
    pub fn proxied_address(&self) -> Option<&ProxiedAddress> {
        match self {
            Detection::V1(addr) | Detection::V2(addr) => Some(addr),
            Detection::Bypass(_) => None,
        }
    }

    /// Whether the connection is passed through without a header
    pub fn is_bypass(&self) -> bool {
        matches!(self, Detection::Bypass(_))
    }
}

/// Configuration for PROXY protocol detection
#[derive(Debug, Copy, Clone)]
pub struct Config {
    /// Whether to accept V1 headers. If disabled, a V1 header is passed to the application
    /// as ordinary data.
    pub allow_v1: bool,

    /// Whether to accept V2 headers. If disabled, a V2 header is passed to the application
    /// as ordinary data.
    pub allow_v2: bool,

    /// Capacity of the buffer used for the single detection read
    pub peek_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            allow_v1: true,
            allow_v2: true,
            peek_capacity: PEEK_CAPACITY,
        }
    }
}

/// Header field that was being decoded when an error occurred
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum Field {
    Signature,
    Protocol,
    SourceAddress,
    DestinationAddress,
    SourcePort,
    DestinationPort,
    VersionCommand,
    FamilyTransport,
    Length,
    AddressBlock,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Field::*;
        let s = match self {
            Signature => "signature",
            Protocol => "inet protocol and family",
            SourceAddress => "source address",
            DestinationAddress => "destination address",
            SourcePort => "source port",
            DestinationPort => "destination port",
            VersionCommand => "protocol version and command",
            FamilyTransport => "address family and transport",
            Length => "address length",
            AddressBlock => "address block",
        };
        f.write_str(s)
    }
}

/// Reason a PROXY header was rejected
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Error {
    /// The peeked bytes ended before the field was complete
    BufferTooShort(Field),
    /// V1 protocol other than `TCP4` or `TCP6`
    UnsupportedProtocol,
    /// Not a valid IP literal
    InvalidAddress(Field),
    /// Not a valid port number
    InvalidPort(Field),
    /// V2 version nibble other than 2
    UnsupportedVersion(u8),
    /// V2 command other than `PROXY` (including `LOCAL`)
    UnsupportedCommand(u8),
    /// V2 address family other than `AF_INET`, `AF_INET6` or `AF_UNIX`
    UnsupportedFamily(u8),
    /// V2 transport other than `STREAM`
    UnsupportedTransport(u8),
    /// V2 address block is shorter than the address family requires
    AddressBlockTooShort { expected: usize, actual: usize },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Error::*;
        match self {
            BufferTooShort(field) => write!(f, "buffer too short to read {}", field),
            UnsupportedProtocol => write!(f, "unsupported inet protocol and family"),
            InvalidAddress(field) => write!(f, "invalid {}", field),
            InvalidPort(field) => write!(f, "invalid {}", field),
            UnsupportedVersion(v) => {
                write!(f, "unsupported protocol version {}, only 2 is supported", v)
            }
            UnsupportedCommand(0) => write!(f, "LOCAL command is not supported"),
            UnsupportedCommand(c) => write!(f, "unsupported command {}", c),
            UnsupportedFamily(0) => write!(f, "UNSPEC address family is not supported"),
            UnsupportedFamily(a) => write!(f, "unsupported address family {}", a),
            UnsupportedTransport(0) => write!(f, "UNSPEC transport is not supported"),
            UnsupportedTransport(2) => write!(f, "DGRAM transport is not supported"),
            UnsupportedTransport(t) => write!(f, "unsupported transport {}", t),
            AddressBlockTooShort { expected, actual } => write!(
                f,
                "address block too short, expected {} bytes, got {}",
                expected, actual
            ),
        }
    }
}

impl std::error::Error for Error {}
