//! Vmc (spicevmc) character device (spec §4.7): optional LZ4 compression and
//! a queued-byte soft ceiling on reads from the guest.

use std::collections::VecDeque;

use tracing::debug;

use crate::char_device::{DeviceHooks, DeviceIo};
use crate::types::{ClientId, PipeItem, PipeItemKind, PipeItemRef};

pub const QUEUED_DATA_LIMIT: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct VmcConfig {
    pub compress_threshold: usize,
    pub queued_data_limit: usize,
}

impl Default for VmcConfig {
    fn default() -> Self {
        Self { compress_threshold: 256, queued_data_limit: QUEUED_DATA_LIMIT }
    }
}

pub struct VmcState {
    config: VmcConfig,
    peer_supports_lz4: bool,
    queued_bytes: usize,
    suspended: bool,
    read_chunk: usize,
    inbound: VmcInbound,
}

impl VmcState {
    pub fn new(config: VmcConfig) -> Self {
        Self { config, peer_supports_lz4: false, queued_bytes: 0, suspended: false, read_chunk: 4096, inbound: VmcInbound::new() }
    }

    pub fn set_peer_capability_lz4(&mut self, supported: bool) {
        self.peer_supports_lz4 = supported;
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Tracks outbound queued bytes; suspends/resumes reads from the guest
    /// when crossing `queued_data_limit`.
    pub fn on_queue_changed(&mut self, new_total: usize) {
        self.queued_bytes = new_total;
        if !self.suspended && self.queued_bytes >= self.config.queued_data_limit {
            self.suspended = true;
        } else if self.suspended && self.queued_bytes < self.config.queued_data_limit {
            self.suspended = false;
        }
    }

    /// Builds the outbound pipe item for `chunk`, compressing with LZ4 when
    /// the peer advertises the capability and the chunk is large enough to
    /// be worth it; falls back to uncompressed when compression doesn't
    /// shrink the data.
    fn build_item(&self, chunk: Vec<u8>) -> PipeItemRef {
        if self.peer_supports_lz4 && chunk.len() > self.config.compress_threshold {
            let compressed = lz4_flex::compress_prepend_size(&chunk);
            if compressed.len() < chunk.len() {
                return PipeItem::new(PipeItemKind::VmcData {
                    compressed: true,
                    uncompressed_size: chunk.len() as u32,
                    data: compressed,
                });
            }
        }
        PipeItem::new(PipeItemKind::VmcData { compressed: false, uncompressed_size: chunk.len() as u32, data: chunk })
    }

    /// Decompresses an inbound compressed chunk; returns `None` and logs on
    /// a size mismatch rather than trusting a corrupt guest payload.
    pub fn decompress(data: &[u8], expected_size: usize) -> Option<Vec<u8>> {
        match lz4_flex::decompress_size_prepended(data) {
            Ok(out) if out.len() == expected_size => Some(out),
            Ok(out) => {
                debug!(got = out.len(), expected_size, "vmc: decompressed size mismatch");
                None
            }
            Err(err) => {
                debug!(?err, "vmc: decompression error");
                None
            }
        }
    }

    /// Client→guest direction: a `VmcData` message arriving from the client
    /// is decompressed (if flagged) and queued for the device write loop to
    /// pick up via [`VmcState::take_inbound`]. A size-mismatched compressed
    /// payload is dropped rather than forwarded to the guest.
    pub fn handle_client_data(&mut self, compressed: bool, uncompressed_size: u32, data: Vec<u8>) {
        let bytes = if compressed {
            match Self::decompress(&data, uncompressed_size as usize) {
                Some(out) => out,
                None => return,
            }
        } else {
            data
        };
        self.inbound.push(bytes);
    }

    /// Pops the next queued client→guest chunk, if any, for the write loop
    /// to hand to [`crate::char_device::CharDevice::write_buffer_get_client`].
    pub fn take_inbound(&mut self) -> Option<Vec<u8>> {
        self.inbound.pop()
    }
}

impl DeviceHooks for VmcState {
    fn read_one_msg_from_device(&mut self, io: &mut dyn DeviceIo, _event_loop: &mut crate::event_loop::EventLoop) -> Option<PipeItemRef> {
        if self.suspended {
            return None;
        }
        let mut buf = vec![0u8; self.read_chunk];
        let n = io.read(&mut buf);
        if n <= 0 {
            return None;
        }
        buf.truncate(n as usize);
        Some(self.build_item(buf))
    }

    fn send_msg_to_client(&mut self, _client: ClientId, _item: &PipeItemRef) {}

    fn remove_client(&mut self, _client: ClientId) {}

    fn on_free_self_token(&mut self) {}
}

/// Inbound client→device byte queue, kept separate from the `DeviceHooks`
/// read path since it has no message framing of its own (vmc is a raw byte
/// pipe in the client→guest direction). Fed by [`VmcState::handle_client_data`]
/// and drained by [`VmcState::take_inbound`].
struct VmcInbound {
    pending: VecDeque<Vec<u8>>,
}

impl VmcInbound {
    fn new() -> Self {
        Self { pending: VecDeque::new() }
    }

    fn push(&mut self, data: Vec<u8>) {
        self.pending.push_back(data);
    }

    fn pop(&mut self) -> Option<Vec<u8>> {
        self.pending.pop_front()
    }
}
