//! Listener wrapper that hands out [`ProxiedStream`]s.
//!
//! Accepting a connection performs no I/O beyond the inner accept, so a slow or silent
//! client never stalls the accept loop. Detection happens later, on the connection's
//! first read or address query.
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};

use crate::io::ProxiedStream;
use crate::Config;

/// Listener whose accepted streams may start with a PROXY header
#[derive(Debug)]
pub struct ProxiedListener<L = TcpListener> {
    listener: L,
    config: Config,
}

impl<L> ProxiedListener<L> {
    /// Wraps an already bound listener.
    pub fn new(listener: L, config: Config) -> Self {
        Self { listener, config }
    }

    /// Configuration applied to accepted streams.
    pub fn config(&self) -> Config {
        self.config
    }

    /// Gets a reference to the underlying listener.
    pub fn get_ref(&self) -> &L {
        &self.listener
    }

    /// Consumes this wrapper, returning the underlying listener.
    pub fn into_inner(self) -> L {
        self.listener
    }
}

impl ProxiedListener<TcpListener> {
    /// Binds a new listener with the default [`Config`].
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        Ok(Self::new(TcpListener::bind(addr)?, Config::default()))
    }

    /// Accepts a new connection.
    ///
    /// The PROXY header (if any) is not read here, see [`ProxiedStream`].
    pub fn accept(&self) -> io::Result<ProxiedStream<TcpStream>> {
        let (stream, _) = self.listener.accept()?;
        Ok(ProxiedStream::with_config(stream, self.config))
    }

    /// Returns an iterator over accepted connections, see [`TcpListener::incoming`].
    pub fn incoming(&self) -> Incoming<'_> {
        Incoming { listener: self }
    }

    /// Local address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

/// Iterator returned by [`ProxiedListener::incoming`]. Never returns `None`.
#[derive(Debug)]
pub struct Incoming<'a> {
    listener: &'a ProxiedListener<TcpListener>,
}

impl Iterator for Incoming<'_> {
    type Item = io::Result<ProxiedStream<TcpStream>>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.listener.accept())
    }
}

#[cfg(feature = "tokio")]
#[cfg_attr(docsrs, doc(cfg(feature = "tokio")))]
impl ProxiedListener<tokio::net::TcpListener> {
    /// Binds a new Tokio listener with the default [`Config`].
    pub async fn bind_tokio<A: tokio::net::ToSocketAddrs>(addr: A) -> io::Result<Self> {
        Ok(Self::new(
            tokio::net::TcpListener::bind(addr).await?,
            Config::default(),
        ))
    }

    /// Accepts a new connection.
    ///
    /// The PROXY header (if any) is not read here, see [`ProxiedStream`].
    pub async fn accept(&self) -> io::Result<ProxiedStream<tokio::net::TcpStream>> {
        let (stream, _) = self.listener.accept().await?;
        Ok(ProxiedStream::with_config(stream, self.config))
    }

    /// Local address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::thread;

    use super::*;
    use crate::Endpoint;

    #[test]
    fn test_accept_is_lazy() {
        let listener = ProxiedListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = thread::spawn(move || {
            let mut client = TcpStream::connect(addr).unwrap();
            let local = client.local_addr().unwrap();
            client.write_all(b"ping").unwrap();
            local
        });

        let mut stream = listener.accept().unwrap();
        assert!(stream.detection().is_none());

        let client_addr = client.join().unwrap();

        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(stream.remote_addr().unwrap(), Endpoint::Inet(client_addr));
    }

    #[test]
    fn test_config_is_applied() {
        let config = Config {
            allow_v1: false,
            ..Default::default()
        };
        let listener = ProxiedListener::new(TcpListener::bind("127.0.0.1:0").unwrap(), config);
        let addr = listener.local_addr().unwrap();
        let header = b"PROXY TCP4 10.1.1.1 20.2.2.2 1000 2000\r\n";

        let client = thread::spawn(move || {
            let mut client = TcpStream::connect(addr).unwrap();
            client.write_all(header).unwrap();
            client
        });

        let mut stream = listener.incoming().next().unwrap().unwrap();
        let _client = client.join().unwrap();

        let mut buf = [0u8; 40];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, header);
        assert!(stream.detection().unwrap().is_bypass());
        assert!(!listener.config().allow_v1);
    }
}
