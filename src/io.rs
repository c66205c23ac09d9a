//! IO wrapper for connections that may start with a PROXY header.
//!
//! A connection accepted behind a load balancer may or may not carry a PROXY protocol header,
//! depending on whether the peer went through the proxy. [`ProxiedStream`] defers the decision
//! until the stream is first used: the first read (or address query) performs a single read of
//! up to [`Config::peek_capacity`](crate::Config::peek_capacity) bytes from the underlying
//! stream, strips a valid header if there is one, and replays everything else to the caller.
//! Once the peeked bytes are drained, reads go straight to the underlying stream.
//!
//! A header that fails to parse does not fail the connection. Its bytes are delivered to the
//! application as ordinary data and the addresses of the underlying connection are reported.
//! Only a failure of the underlying read itself is returned as an error.
//!
//! The wrapper is usable both with standard streams (anything for which `&IO` implements
//! [`std::io::Read`], such as [`std::net::TcpStream`]) and Tokio streams
//! ([`tokio::io::AsyncRead`]).
//!
//! ## Example (std)
//!
//! ```no_run
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use std::io::Read;
//! use std::net::TcpListener;
//! use dynamic_proxy_header::io::ProxiedStream;
//!
//! let listener = TcpListener::bind("[::]:1234")?;
//! let (socket, _) = listener.accept()?;
//!
//! let mut socket = ProxiedStream::new(socket);
//! println!("client {} connected to {}", socket.remote_addr()?, socket.local_addr()?);
//!
//! let mut buf = Vec::new();
//! socket.read_to_end(&mut buf)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Example (Tokio)
//!
//! ```no_run
//! # #[cfg(feature = "tokio")]
//! # #[tokio::main] async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//! use tokio::net::TcpListener;
//! use dynamic_proxy_header::io::ProxiedStream;
//!
//! let listener = TcpListener::bind("[::]:1234").await?;
//!
//! loop {
//!     let (socket, _) = listener.accept().await?;
//!     tokio::spawn(async move {
//!         let mut socket = ProxiedStream::new(socket);
//!
//!         // Reads the first bytes from the socket if nothing did so yet
//!         let peer = socket.remote_addr_async().await.unwrap();
//!         println!("connection from {}", peer);
//!
//!         let mut buf = vec![0; 1024];
//!         loop {
//!             let n = socket.read(&mut buf).await.unwrap();
//!             if n == 0 {
//!                 return;
//!             }
//!             socket.write_all(&buf[0..n]).await.unwrap();
//!         }
//!     });
//! }
//! # }
//! # #[cfg(not(feature = "tokio"))]
//! # fn main() {}
//! ```
use std::{
    io::{self, Read, Write},
    sync::{
        atomic::{AtomicUsize, Ordering},
        OnceLock,
    },
};

#[cfg(any(unix, target_os = "wasi"))]
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};

#[cfg(feature = "tokio")]
use std::{
    future::poll_fn,
    pin::Pin,
    task::{ready, Context, Poll},
};

#[cfg(feature = "tokio")]
use pin_project_lite::pin_project;

#[cfg(feature = "tokio")]
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::{Config, Detection, Endpoint};

/// Native addresses of a connection
///
/// Used by [`ProxiedStream`] when no PROXY header supplies the addresses.
pub trait Connection {
    /// Local address of the connection
    fn local_endpoint(&self) -> io::Result<Endpoint>;
    /// Address of the remote peer
    fn peer_endpoint(&self) -> io::Result<Endpoint>;
}

impl Connection for std::net::TcpStream {
    fn local_endpoint(&self) -> io::Result<Endpoint> {
        self.local_addr().map(Endpoint::Inet)
    }

    fn peer_endpoint(&self) -> io::Result<Endpoint> {
        self.peer_addr().map(Endpoint::Inet)
    }
}

#[cfg(unix)]
fn unix_endpoint(addr: &std::os::unix::net::SocketAddr) -> Endpoint {
    use std::os::unix::ffi::OsStrExt;

    if let Some(path) = addr.as_pathname() {
        return Endpoint::Unix(path.as_os_str().as_bytes().to_vec());
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        #[cfg(target_os = "android")]
        use std::os::android::net::SocketAddrExt;
        #[cfg(target_os = "linux")]
        use std::os::linux::net::SocketAddrExt;

        // Same encoding as in a PROXY header: a leading NUL marks the abstract namespace
        if let Some(name) = addr.as_abstract_name() {
            let mut raw = Vec::with_capacity(name.len() + 1);
            raw.push(0);
            raw.extend_from_slice(name);
            return Endpoint::Unix(raw);
        }
    }

    Endpoint::Unix(Vec::new())
}

#[cfg(unix)]
impl Connection for std::os::unix::net::UnixStream {
    fn local_endpoint(&self) -> io::Result<Endpoint> {
        self.local_addr().map(|a| unix_endpoint(&a))
    }

    fn peer_endpoint(&self) -> io::Result<Endpoint> {
        self.peer_addr().map(|a| unix_endpoint(&a))
    }
}

#[cfg(feature = "tokio")]
#[cfg_attr(docsrs, doc(cfg(feature = "tokio")))]
impl Connection for tokio::net::TcpStream {
    fn local_endpoint(&self) -> io::Result<Endpoint> {
        self.local_addr().map(Endpoint::Inet)
    }

    fn peer_endpoint(&self) -> io::Result<Endpoint> {
        self.peer_addr().map(Endpoint::Inet)
    }
}

#[cfg(all(feature = "tokio", unix))]
#[cfg_attr(docsrs, doc(cfg(all(feature = "tokio", unix))))]
impl Connection for tokio::net::UnixStream {
    fn local_endpoint(&self) -> io::Result<Endpoint> {
        self.local_addr()
            .map(|a| unix_endpoint(&std::os::unix::net::SocketAddr::from(a)))
    }

    fn peer_endpoint(&self) -> io::Result<Endpoint> {
        self.peer_addr()
            .map(|a| unix_endpoint(&std::os::unix::net::SocketAddr::from(a)))
    }
}

/// Bytes captured by the detection read and what was found in them
#[derive(Debug)]
struct Peeked {
    buf: Box<[u8]>,
    detection: Detection,
}

/// Memoized outcome of the detection read. A failed read is kept so that every
/// subsequent read reports it.
type State = Result<Peeked, io::Error>;

#[cfg(all(feature = "tokio", not(doc)))]
pin_project! {
    #[derive(Debug)]
    pub struct ProxiedStream<IO> {
        #[pin]
        io: IO,
        config: Config,
        state: OnceLock<State>,
        cursor: AtomicUsize,
        scratch: Vec<u8>,
    }
}

/// Wrapper around a stream that may start with a proxy header.
///
/// See [module level documentation](`crate::io`)
#[cfg(any(doc, not(feature = "tokio")))]
#[derive(Debug)]
pub struct ProxiedStream<IO> {
    io: IO,
    config: Config,
    state: OnceLock<State>,
    cursor: AtomicUsize,
    #[cfg(feature = "tokio")]
    scratch: Vec<u8>,
}

fn replay_error(err: &io::Error) -> io::Error {
    io::Error::new(err.kind(), err.to_string())
}

/// Turns the result of the detection read into the memoized state, positioning the
/// replay cursor right after the header (or at 0 if there is none).
fn settle(res: io::Result<Vec<u8>>, config: Config, cursor: &AtomicUsize) -> State {
    let buf = match res {
        Ok(buf) => buf,
        Err(err) => {
            tracing::debug!(error = %err, "failed to read from connection while detecting PROXY header");
            return Err(err);
        }
    };

    let (detection, consumed) = Detection::detect(&buf, config);
    cursor.store(consumed, Ordering::Release);

    Ok(Peeked {
        buf: buf.into_boxed_slice(),
        detection,
    })
}

/// Performs the single detection read. Reads interrupted by a signal are retried.
fn fill_once<R: Read>(mut io: R, capacity: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0; capacity];

    loop {
        match io.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                return Ok(buf);
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
}

impl<IO> ProxiedStream<IO> {
    /// Wraps a freshly accepted stream with the default [`Config`].
    ///
    /// No I/O is performed until the stream is read from or its addresses are queried.
    pub fn new(io: IO) -> Self {
        Self::with_config(io, Config::default())
    }

    /// Wraps a freshly accepted stream.
    pub fn with_config(io: IO, config: Config) -> Self {
        Self {
            io,
            config,
            state: OnceLock::new(),
            cursor: AtomicUsize::new(0),
            #[cfg(feature = "tokio")]
            scratch: Vec::new(),
        }
    }

    /// Create a new proxied stream from a stream that is known not to have a proxy header.
    ///
    /// Detection is skipped entirely. This is useful if you want to use the same stream
    /// type for proxied and unproxied connections.
    pub fn unproxied(io: IO) -> Self {
        let stream = Self::new(io);
        let _ = stream.state.set(Ok(Peeked {
            buf: Box::default(),
            detection: Detection::default(),
        }));
        stream
    }

    /// Get the detection outcome without triggering detection.
    ///
    /// Returns `None` if the stream has not been read from yet, or if the detection read
    /// failed.
    pub fn detection(&self) -> Option<&Detection> {
        match self.state.get() {
            Some(Ok(peeked)) => Some(&peeked.detection),
            _ => None,
        }
    }

    /// Gets a reference to the underlying stream.
    pub fn get_ref(&self) -> &IO {
        &self.io
    }

    /// Gets a mutable reference to the underlying stream.
    ///
    /// Reading from the underlying stream directly skips any peeked bytes that have not
    /// been replayed yet.
    pub fn get_mut(&mut self) -> &mut IO {
        &mut self.io
    }

    /// Gets a pinned mutable reference to the underlying stream.
    #[cfg(feature = "tokio")]
    pub fn get_pin_mut(self: Pin<&mut Self>) -> Pin<&mut IO> {
        self.project().io
    }

    /// Consumes this wrapper, returning the underlying stream.
    ///
    /// Peeked bytes that were not read yet are lost, see [`into_parts`](Self::into_parts).
    pub fn into_inner(self) -> IO {
        self.io
    }

    /// Consumes this wrapper, returning the underlying stream and the peeked bytes that
    /// have not been read yet.
    pub fn into_parts(self) -> (IO, Vec<u8>) {
        let pos = self.cursor.into_inner();
        let rest = match self.state.into_inner() {
            Some(Ok(peeked)) => peeked.buf[pos..].to_vec(),
            _ => Vec::new(),
        };

        (self.io, rest)
    }

    /// Claims up to `buf.len()` peeked bytes that have not been replayed yet.
    ///
    /// Returns `None` once the peeked bytes are exhausted, from then on reads belong
    /// to the underlying stream.
    fn read_buffered(&self, peeked: &[u8], buf: &mut [u8]) -> Option<usize> {
        let mut pos = self.cursor.load(Ordering::Acquire);

        loop {
            if pos >= peeked.len() {
                return None;
            }

            let len = std::cmp::min(peeked.len() - pos, buf.len());
            match self.cursor.compare_exchange_weak(
                pos,
                pos + len,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    buf[..len].copy_from_slice(&peeked[pos..pos + len]);
                    if pos + len == peeked.len() {
                        tracing::trace!("peeked bytes drained, passing reads through");
                    }
                    return Some(len);
                }
                Err(actual) => pos = actual,
            }
        }
    }
}

impl<IO> ProxiedStream<IO>
where
    for<'a> &'a IO: Read,
{
    fn state(&self) -> &State {
        self.state.get_or_init(|| {
            settle(
                fill_once(&self.io, self.config.peek_capacity),
                self.config,
                &self.cursor,
            )
        })
    }

    /// Detects and strips the PROXY header, unless that already happened.
    ///
    /// Performs at most one read from the underlying stream over the lifetime of the
    /// wrapper. Concurrent callers wait for the first one to finish and then observe
    /// the same outcome. An error is only returned if the underlying read fails.
    pub fn detect(&self) -> io::Result<&Detection> {
        match self.state() {
            Ok(peeked) => Ok(&peeked.detection),
            Err(err) => Err(replay_error(err)),
        }
    }
}

impl<IO> ProxiedStream<IO>
where
    for<'a> &'a IO: Read,
    IO: Connection,
{
    /// Local address of the connection.
    ///
    /// This is the destination address from the PROXY header, if one was found, or the
    /// local address of the underlying stream otherwise. Triggers detection.
    pub fn local_addr(&self) -> io::Result<Endpoint> {
        if let Ok(Some(addr)) = self.detect().map(Detection::proxied_address) {
            return Ok(addr.destination.clone());
        }
        self.io.local_endpoint()
    }

    /// Address of the client.
    ///
    /// This is the source address from the PROXY header, if one was found, or the peer
    /// address of the underlying stream otherwise. Triggers detection.
    pub fn remote_addr(&self) -> io::Result<Endpoint> {
        if let Ok(Some(addr)) = self.detect().map(Detection::proxied_address) {
            return Ok(addr.source.clone());
        }
        self.io.peer_endpoint()
    }
}

impl<IO> Read for &ProxiedStream<IO>
where
    for<'a> &'a IO: Read,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let peeked = match self.state() {
            Ok(peeked) => peeked,
            Err(err) => return Err(replay_error(err)),
        };

        if let Some(len) = self.read_buffered(&peeked.buf, buf) {
            return Ok(len);
        }

        (&self.io).read(buf)
    }
}

impl<IO> Read for ProxiedStream<IO>
where
    for<'a> &'a IO: Read,
{
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&*self).read(buf)
    }
}

impl<IO> Write for ProxiedStream<IO>
where
    IO: Write,
{
    #[inline]
    fn write_vectored(&mut self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
        self.io.write_vectored(bufs)
    }

    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.io.write(buf)
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        self.io.flush()
    }
}

impl<IO> Write for &ProxiedStream<IO>
where
    for<'a> &'a IO: Write,
{
    #[inline]
    fn write_vectored(&mut self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
        (&self.io).write_vectored(bufs)
    }

    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&self.io).write(buf)
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        (&self.io).flush()
    }
}

#[cfg(feature = "tokio")]
#[cfg_attr(docsrs, doc(cfg(feature = "tokio")))]
impl<IO> ProxiedStream<IO>
where
    IO: AsyncRead,
{
    /// Polls the detection read, unless detection already happened.
    ///
    /// This is what [`poll_read`](AsyncRead::poll_read) does before handing out any
    /// bytes. The result is memoized, so the underlying stream is read at most once.
    pub fn poll_detect(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = self.project();

        if let Some(state) = me.state.get() {
            return Poll::Ready(state.as_ref().map(|_| ()).map_err(replay_error));
        }

        if me.scratch.len() != me.config.peek_capacity {
            me.scratch.resize(me.config.peek_capacity, 0);
        }

        let mut buf = ReadBuf::new(me.scratch);
        let res = ready!(me.io.poll_read(cx, &mut buf)).map(|()| buf.filled().len());
        let res = res.map(|len| {
            let mut peeked = std::mem::take(me.scratch);
            peeked.truncate(len);
            peeked
        });

        let state = settle(res, *me.config, me.cursor);
        let ret = state.as_ref().map(|_| ()).map_err(replay_error);
        let _ = me.state.set(state);

        Poll::Ready(ret)
    }
}

#[cfg(feature = "tokio")]
#[cfg_attr(docsrs, doc(cfg(feature = "tokio")))]
impl<IO> ProxiedStream<IO>
where
    IO: AsyncRead + Unpin,
{
    /// Detects and strips the PROXY header, unless that already happened.
    ///
    /// Asynchronous counterpart of [`detect`](Self::detect).
    pub async fn detect_async(&mut self) -> io::Result<&Detection> {
        poll_fn(|cx| Pin::new(&mut *self).poll_detect(cx)).await?;

        self.detection().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "PROXY header detection did not complete")
        })
    }
}

#[cfg(feature = "tokio")]
#[cfg_attr(docsrs, doc(cfg(feature = "tokio")))]
impl<IO> ProxiedStream<IO>
where
    IO: AsyncRead + Unpin + Connection,
{
    /// Local address of the connection.
    ///
    /// Asynchronous counterpart of [`local_addr`](Self::local_addr).
    pub async fn local_addr_async(&mut self) -> io::Result<Endpoint> {
        if let Ok(Some(addr)) = self.detect_async().await.map(Detection::proxied_address) {
            return Ok(addr.destination.clone());
        }
        self.io.local_endpoint()
    }

    /// Address of the client.
    ///
    /// Asynchronous counterpart of [`remote_addr`](Self::remote_addr).
    pub async fn remote_addr_async(&mut self) -> io::Result<Endpoint> {
        if let Ok(Some(addr)) = self.detect_async().await.map(Detection::proxied_address) {
            return Ok(addr.source.clone());
        }
        self.io.peer_endpoint()
    }
}

#[cfg(feature = "tokio")]
#[cfg_attr(docsrs, doc(cfg(feature = "tokio")))]
impl<IO> AsyncRead for ProxiedStream<IO>
where
    IO: AsyncRead,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        ready!(self.as_mut().poll_detect(cx))?;

        let me = self.project();

        if let Some(Ok(peeked)) = me.state.get() {
            let pos = me.cursor.get_mut();
            if *pos < peeked.buf.len() {
                let len = std::cmp::min(peeked.buf.len() - *pos, buf.remaining());

                buf.put_slice(&peeked.buf[*pos..*pos + len]);
                *pos += len;

                return Poll::Ready(Ok(()));
            }
        }

        me.io.poll_read(cx, buf)
    }
}

#[cfg(feature = "tokio")]
#[cfg_attr(docsrs, doc(cfg(feature = "tokio")))]
impl<IO> AsyncWrite for ProxiedStream<IO>
where
    IO: AsyncWrite,
{
    #[inline]
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().io.poll_write(cx, buf)
    }

    #[inline]
    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().io.poll_flush(cx)
    }

    #[inline]
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().io.poll_shutdown(cx)
    }

    #[inline]
    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<Result<usize, io::Error>> {
        self.project().io.poll_write_vectored(cx, bufs)
    }

    #[inline]
    fn is_write_vectored(&self) -> bool {
        self.io.is_write_vectored()
    }
}

#[cfg(any(unix, target_os = "wasi"))]
#[cfg_attr(docsrs, doc(cfg(any(unix, target_os = "wasi"))))]
impl<IO> AsRawFd for ProxiedStream<IO>
where
    IO: AsRawFd,
{
    fn as_raw_fd(&self) -> RawFd {
        self.io.as_raw_fd()
    }
}

#[cfg(any(unix, target_os = "wasi"))]
#[cfg_attr(docsrs, doc(cfg(any(unix, target_os = "wasi"))))]
impl<IO> AsFd for ProxiedStream<IO>
where
    IO: AsFd,
{
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.io.as_fd()
    }
}
