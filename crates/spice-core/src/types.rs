//! Shared data-model types used across CharDevice, Channel and the concrete
//! device subclasses: write buffers and pipe items (spec §3).

use std::rc::Rc;

pub type ClientId = u64;

/// Tags a write buffer with who it came from, so a client disconnect can
/// invalidate exactly its own in-flight buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteBufferOrigin {
    None,
    Client(ClientId),
    Server,
    ServerNoToken,
}

/// A byte block destined for the guest device. `used` is the cursor into
/// `data` already handed to the device's `write()`; refcounted because a
/// migration marshaller may hold a second reference while bytes are still
/// queued for write.
pub struct WriteBuffer {
    pub data: Vec<u8>,
    pub used: usize,
    pub origin: WriteBufferOrigin,
    pub token_price: u32,
}

impl WriteBuffer {
    pub fn new(data: Vec<u8>, origin: WriteBufferOrigin, token_price: u32) -> Self {
        Self { data, used: 0, origin, token_price }
    }

    pub fn remaining(&self) -> &[u8] {
        &self.data[self.used..]
    }

    pub fn is_consumed(&self) -> bool {
        self.used >= self.data.len()
    }
}

pub type WriteBufferRef = Rc<WriteBuffer>;

/// A polymorphic outbound unit on a ChannelClient's pipe. Variants cover the
/// base-class items (raw message, migration bookkeeping) plus the
/// subclass-specific payloads named in spec §3/§4.6/§4.7.
pub enum PipeItemKind {
    Message { msg_type: u16, body: Vec<u8> },
    MigrateData(Vec<u8>),
    MigrateFlushMark,
    EmptyAck,
    StreamCreate { stream_id: u32, width: u32, height: u32, codec: u8 },
    StreamActivateReport,
    StreamData { stream_id: u32, mm_time: u32, data: Vec<u8> },
    CursorSet { width: u32, height: u32, hot_x: i32, hot_y: i32, cursor_type: u8, pixels: Vec<u8> },
    CursorMove { x: i32, y: i32 },
    NotifyError { code: u32, message: String },
    SmartcardError { code: u32, reader_id: u32 },
    SmartcardReaderAdd { reader_id: u32 },
    SmartcardAtr { reader_id: u32, atr: Vec<u8> },
    SmartcardApdu { reader_id: u32, data: Vec<u8> },
    VmcData { compressed: bool, uncompressed_size: u32, data: Vec<u8> },
}

pub struct PipeItem {
    pub kind: PipeItemKind,
}

impl PipeItem {
    pub fn new(kind: PipeItemKind) -> PipeItemRef {
        Rc::new(Self { kind })
    }
}

pub type PipeItemRef = Rc<PipeItem>;

/// Error codes referenced by spec §7/S7. `GENERAL_ERROR` is the only one the
/// core names explicitly; subclasses may add their own.
pub const GENERAL_ERROR: u32 = 1;
pub const VSCARD_UNDEFINED_READER_ID: u32 = 0xFFFF_FFFF;
