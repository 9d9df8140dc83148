use std::{collections::VecDeque, io, io::Read, io::Write};

use mio::{Interest, Registry, Token, event::Event, net::TcpStream};
use tracing::{debug, warn};

use crate::set_socket_buf_size;

pub const RX_BUF_SIZE: usize = 32 * 1024;

/// Result of driving I/O on a [`DuplexStream`].
///
/// `Alive` means the connection is still usable; `Disconnected` means the
/// peer is gone (EOF or fatal error) and the owner must tear the connection
/// down.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ConnState {
    Alive,
    Disconnected,
}

/// Lets [`DuplexStream::close`] shut down whatever concrete transport it
/// wraps without the struct itself being hard-coded to one stream type.
pub trait ShutdownBoth {
    fn shutdown_both(&self);
}

impl ShutdownBoth for TcpStream {
    fn shutdown_both(&self) {
        let _ = self.shutdown(std::net::Shutdown::Both);
    }
}

#[cfg(unix)]
impl ShutdownBoth for mio::net::UnixStream {
    fn shutdown_both(&self) {
        let _ = self.shutdown(std::net::Shutdown::Both);
    }
}

/// A raw, byte-oriented non-blocking duplex socket, generic over any
/// mio-registerable stream (`TcpStream`, `UnixStream`, or a test double).
///
/// Unlike a length-prefixed frame transport, `DuplexStream` has no opinion on
/// message boundaries: callers (ChannelClient, StreamDevice, the WebSocket
/// codec) read whatever bytes are available via [`readable`] and [`consume`]
/// and decide for themselves when a full message has arrived.
///
/// Outbound bytes are written opportunistically; any remainder that would
/// block is queued in `send_backlog` and flushed on the next writable event.
///
/// Invariant: `writable_armed == !send_backlog.is_empty()`.
pub struct DuplexStream<S = TcpStream> {
    stream: S,
    rx_buf: Vec<u8>,
    rx_len: usize,
    rx_pos: usize,
    send_backlog: VecDeque<Vec<u8>>,
    writable_armed: bool,
}

impl<S> DuplexStream<S>
where
    S: Read + Write + mio::event::Source,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            rx_buf: vec![0; RX_BUF_SIZE],
            rx_len: 0,
            rx_pos: 0,
            send_backlog: VecDeque::with_capacity(8),
            writable_armed: false,
        }
    }

    pub fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(&mut self.stream, token, Interest::READABLE)
    }

    /// Reads as many bytes as are currently available into the receive
    /// buffer. Call after a readable event; inspect [`readable`] afterwards.
    pub fn fill_from_socket(&mut self) -> ConnState {
        // compact: drop already-consumed bytes so the buffer doesn't grow
        // unboundedly across many small reads.
        if self.rx_pos > 0 {
            self.rx_buf.copy_within(self.rx_pos..self.rx_len, 0);
            self.rx_len -= self.rx_pos;
            self.rx_pos = 0;
        }

        loop {
            if self.rx_len == self.rx_buf.len() {
                self.rx_buf.resize(self.rx_buf.len() * 2, 0);
            }
            let available = self.rx_buf.len() - self.rx_len;
            match self.stream.read(&mut self.rx_buf[self.rx_len..]) {
                Ok(0) => return ConnState::Disconnected,
                Ok(n) => {
                    self.rx_len += n;
                    if n < available {
                        // short read: socket drained for now
                        return ConnState::Alive;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return ConnState::Alive,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(?err, "duplex: read failed");
                    return ConnState::Disconnected;
                }
            }
        }
    }

    /// Bytes read from the socket but not yet consumed by the caller.
    #[inline]
    pub fn readable(&self) -> &[u8] {
        &self.rx_buf[self.rx_pos..self.rx_len]
    }

    /// Mutable view of [`readable`], for codecs (e.g. the websocket frame
    /// parser) that unmask/transform payloads in place.
    #[inline]
    pub fn readable_mut(&mut self) -> &mut [u8] {
        &mut self.rx_buf[self.rx_pos..self.rx_len]
    }

    /// Marks `n` bytes as consumed from the front of [`readable`].
    #[inline]
    pub fn consume(&mut self, n: usize) {
        self.rx_pos = (self.rx_pos + n).min(self.rx_len);
        if self.rx_pos == self.rx_len {
            self.rx_pos = 0;
            self.rx_len = 0;
            if self.rx_buf.len() > RX_BUF_SIZE {
                self.rx_buf.truncate(RX_BUF_SIZE);
                self.rx_buf.shrink_to_fit();
                self.rx_buf.resize(RX_BUF_SIZE, 0);
            }
        }
    }

    /// Writes `data` immediately if possible, otherwise enqueues the
    /// unwritten remainder and arms `WRITABLE` interest.
    pub fn write_or_enqueue(&mut self, registry: &Registry, token: Token, data: &[u8]) -> ConnState {
        if !self.send_backlog.is_empty() {
            return self.enqueue_back(registry, token, data.to_vec());
        }

        match self.stream.write(data) {
            Ok(0) => {
                warn!("duplex: write returned 0, disconnecting");
                ConnState::Disconnected
            }
            Ok(n) if n == data.len() => ConnState::Alive,
            Ok(n) => self.enqueue_back(registry, token, data[n..].to_vec()),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.enqueue_back(registry, token, data.to_vec())
            }
            Err(err) => {
                warn!(?err, "duplex: write failed");
                ConnState::Disconnected
            }
        }
    }

    /// Flushes queued backlog data. Call on a writable event.
    pub fn drain_backlog(&mut self, registry: &Registry, token: Token) -> ConnState {
        while let Some(front) = self.send_backlog.front_mut() {
            match self.stream.write(front) {
                Ok(0) => return ConnState::Disconnected,
                Ok(n) if n == front.len() => {
                    self.send_backlog.pop_front();
                }
                Ok(n) => {
                    front.drain(..n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    debug!(?err, "duplex: backlog write failed");
                    return ConnState::Disconnected;
                }
            }
        }

        if self.send_backlog.is_empty() && self.writable_armed {
            if let Err(err) = registry.reregister(&mut self.stream, token, Interest::READABLE) {
                debug!(?err, "duplex: reregister drop writable");
                return ConnState::Disconnected;
            }
            self.writable_armed = false;
        }
        ConnState::Alive
    }

    #[inline]
    pub fn has_backlog(&self) -> bool {
        !self.send_backlog.is_empty()
    }

    fn enqueue_back(&mut self, registry: &Registry, token: Token, data: Vec<u8>) -> ConnState {
        self.send_backlog.push_back(data);
        self.arm_writable(registry, token)
    }

    fn arm_writable(&mut self, registry: &Registry, token: Token) -> ConnState {
        if !self.writable_armed {
            if let Err(err) =
                registry.reregister(&mut self.stream, token, Interest::READABLE | Interest::WRITABLE)
            {
                debug!(?err, "duplex: arm writable failed");
                return ConnState::Disconnected;
            }
            self.writable_armed = true;
        }
        ConnState::Alive
    }

    /// Handles a single mio event: drains readable bytes (caller must still
    /// call [`readable`]/[`consume`]) and flushes the write backlog.
    pub fn poll_with(&mut self, registry: &Registry, token: Token, ev: &Event) -> ConnState {
        if ev.is_readable() && self.fill_from_socket() == ConnState::Disconnected {
            return ConnState::Disconnected;
        }
        if ev.is_writable() {
            return self.drain_backlog(registry, token);
        }
        ConnState::Alive
    }
}

impl<S> DuplexStream<S>
where
    S: Read + Write + mio::event::Source + ShutdownBoth,
{
    pub fn close(&mut self, registry: &Registry) {
        let _ = registry.deregister(&mut self.stream);
        self.stream.shutdown_both();
    }
}

impl<S> DuplexStream<S>
where
    S: Read + Write + mio::event::Source + std::os::fd::AsRawFd,
{
    pub fn set_socket_buf_size(&self, size: usize) {
        set_socket_buf_size(self.stream.as_raw_fd(), size);
    }
}

impl DuplexStream<TcpStream> {
    /// TCP-specific constructor: disables Nagle before wrapping, since
    /// small, latency-sensitive protocol frames are the common case.
    pub fn new_tcp(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }
}
