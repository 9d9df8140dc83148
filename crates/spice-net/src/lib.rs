//! Non-blocking I/O plumbing shared by the channel and dispatcher layers.
//!
//! This crate carries no protocol knowledge of its own: it only knows how to
//! read bytes off a socket without blocking, buffer what couldn't be written
//! yet, and tell the caller when a peer is gone. Framing and message
//! semantics live one layer up, in `spice-core`.

mod duplex;
mod socketpair;
mod websocket;

pub use duplex::{ConnState, DuplexStream, RX_BUF_SIZE, ShutdownBoth};
pub use socketpair::{DISPATCHER_ACK, DISPATCHER_CUSTOM_TYPE, DispatcherHeader, SocketPairTransport};
pub use websocket::{FrameOutcome, HandshakeOutcome, OpCode, WebSocketCodec, WriteOutcome, try_handshake};

/// Sets kernel `SO_SNDBUF` and `SO_RCVBUF` on a raw fd-backed socket.
pub(crate) fn set_socket_buf_size(fd: std::os::fd::RawFd, size: usize) {
    let size = size as libc::c_int;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            (&raw const size).cast(),
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            (&raw const size).cast(),
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}
