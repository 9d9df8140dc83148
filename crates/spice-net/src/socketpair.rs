use std::{
    io::{self, Read, Write},
    os::unix::net::UnixStream,
};

/// ACK sentinel written back by the server thread after running an
/// `ack=true` handler. Matches the original `~0u32` value.
pub const DISPATCHER_ACK: u32 = 0xFFFF_FFFF;

/// Pseudo message type meaning "custom: handler pointer travels in the
/// payload rather than being looked up in a fixed table".
pub const DISPATCHER_CUSTOM_TYPE: u32 = 0x7FFF_FFFF;

/// Wire header preceding every dispatcher message.
///
/// `message_type` packs a 31-bit type id and a 1-bit ack flag, matching the
/// original's bitfield layout; we keep them as separate fields on the wire
/// side for clarity and pack/unpack at the edges.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct DispatcherHeader {
    pub handler: u32,
    pub size: u32,
    pub message_type: u32,
    pub ack: bool,
}

const HEADER_WIRE_LEN: usize = 4 + 4 + 4 + 1;

impl DispatcherHeader {
    pub(crate) fn to_wire(self) -> [u8; HEADER_WIRE_LEN] {
        let mut buf = [0u8; HEADER_WIRE_LEN];
        buf[0..4].copy_from_slice(&self.handler.to_le_bytes());
        buf[4..8].copy_from_slice(&self.size.to_le_bytes());
        buf[8..12].copy_from_slice(&self.message_type.to_le_bytes());
        buf[12] = u8::from(self.ack);
        buf
    }

    pub(crate) fn from_wire(buf: &[u8; HEADER_WIRE_LEN]) -> Self {
        Self {
            handler: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            size: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            message_type: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            ack: buf[12] != 0,
        }
    }
}

/// One end of a blocking `AF_UNIX` stream socket-pair used to carry
/// dispatcher traffic between threads.
///
/// Kept in blocking mode, matching the original's `read_safe`/`write_safe`
/// (which take a `block` flag and either poll or block outright). Writers
/// serialize on a mutex in the caller (the `Dispatcher` itself, since the
/// lock must span header+payload for both the send and the optional
/// blocking ack read-back); this type only knows how to shuttle bytes.
pub struct SocketPairTransport {
    stream: UnixStream,
}

impl SocketPairTransport {
    /// Creates a connected pair. `.0` is conventionally the sender-side end
    /// (used by worker threads), `.1` the receiver-side end (driven by the
    /// server thread's event loop via [`drain_pending`]).
    pub fn pair() -> io::Result<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self { stream: a }, Self { stream: b }))
    }

    /// Clones the underlying fd into a `mio`-owned handle suitable for
    /// `Registry::register`. Reads/writes against the clone and the
    /// original observe the same kernel socket buffer.
    pub fn try_clone_for_registration(&self) -> io::Result<mio::net::UnixStream> {
        Ok(mio::net::UnixStream::from_std(self.stream.try_clone()?))
    }

    /// Blocking write of a full header + payload. Used under the dispatcher's
    /// send mutex.
    pub fn write_message(&mut self, header: DispatcherHeader, payload: &[u8]) -> io::Result<()> {
        self.stream.write_all(&header.to_wire())?;
        if !payload.is_empty() {
            self.stream.write_all(payload)?;
        }
        Ok(())
    }

    /// Blocking read of exactly one header.
    pub fn read_header(&mut self) -> io::Result<DispatcherHeader> {
        let mut buf = [0u8; HEADER_WIRE_LEN];
        self.stream.read_exact(&mut buf)?;
        Ok(DispatcherHeader::from_wire(&buf))
    }

    pub fn read_payload(&mut self, size: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; size];
        self.stream.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Blocking read of the 4-byte ack sentinel, retrying on `EINTR`.
    pub fn read_ack(&mut self) -> io::Result<u32> {
        let mut buf = [0u8; 4];
        loop {
            match self.stream.read_exact(&mut buf) {
                Ok(()) => return Ok(u32::from_le_bytes(buf)),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    pub fn write_ack(&mut self) -> io::Result<()> {
        self.stream.write_all(&DISPATCHER_ACK.to_le_bytes())
    }

    /// Non-blocking drain of whatever is currently buffered, invoking
    /// `on_message` for each full header+payload pair. Used by the server
    /// thread's Watch callback, matching the original's "drain everything
    /// pending" loop. Temporarily flips the socket to non-blocking for the
    /// duration of the drain.
    pub fn drain_pending<F: FnMut(DispatcherHeader, Vec<u8>)>(
        &mut self,
        mut on_message: F,
    ) -> io::Result<()> {
        self.stream.set_nonblocking(true)?;
        let result = (|| -> io::Result<()> {
            loop {
                let mut hdr_buf = [0u8; HEADER_WIRE_LEN];
                match self.stream.read_exact(&mut hdr_buf) {
                    Ok(()) => {}
                    Err(ref e)
                        if e.kind() == io::ErrorKind::WouldBlock
                            || e.kind() == io::ErrorKind::UnexpectedEof =>
                    {
                        return Ok(());
                    }
                    Err(err) => return Err(err),
                }
                let header = DispatcherHeader::from_wire(&hdr_buf);
                let payload = self.read_payload(header.size as usize)?;
                on_message(header, payload);
            }
        })();
        self.stream.set_nonblocking(false)?;
        result
    }
}
