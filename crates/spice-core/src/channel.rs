//! Per-client pipe of outbound items, ACK/window accounting, capability
//! negotiation (spec §4.5).

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Registry, Token};
use spice_net::{ConnState, DuplexStream, FrameOutcome, HandshakeOutcome, WebSocketCodec, WriteOutcome, try_handshake};
use tracing::warn;

use crate::types::{ClientId, PipeItemKind, PipeItemRef};

/// Channel-wire opcodes common to every channel (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOpCode {
    AckSync,
    Migrate,
    MigrateData,
    SetAck,
}

pub struct ChannelClientConfig {
    pub ack_window: u32,
}

impl Default for ChannelClientConfig {
    fn default() -> Self {
        Self { ack_window: 30 }
    }
}

/// Per-connection websocket framing state (spec §4.3's websocket transport
/// note): the handshake is detected lazily on the first bytes read, then
/// every inbound/outbound message is un/wrapped in RFC 6455 frames.
struct WebSocketLayer {
    handshaked: bool,
    continuation: Vec<u8>,
    write_outcome: WriteOutcome,
}

impl WebSocketLayer {
    fn new() -> Self {
        Self { handshaked: false, continuation: Vec::new(), write_outcome: WriteOutcome::new() }
    }
}

/// Which wire envelope a [`ChannelClient`]'s socket bytes are wrapped in.
enum Transport {
    Raw,
    WebSocket(WebSocketLayer),
}

/// One logical inbound chunk carried out of [`WebSocketLayer::drain`]'s
/// frame loop, decoupled from the buffer it was unmasked in so the caller
/// can still mutate `self.stream` afterwards.
enum DrainedFrame {
    Ignored,
    Data { payload: Vec<u8>, is_final: bool },
}

/// One remote peer's session with a Channel.
pub struct ChannelClient<S = TcpStream> {
    pub client_id: ClientId,
    channel: Weak<RefCell<Channel<S>>>,
    stream: DuplexStream<S>,
    token: Token,
    transport: Transport,
    pipe: VecDeque<PipeItemRef>,
    ack_window: u32,
    ack_generation: u32,
    messages_since_ack: u32,
    blocked: bool,
    waiting_for_migrate_data: bool,
    common_caps: u64,
    channel_caps: u64,
}

impl<S> ChannelClient<S>
where
    S: Read + Write + mio::event::Source,
{
    pub fn new(
        client_id: ClientId,
        channel: Weak<RefCell<Channel<S>>>,
        stream: DuplexStream<S>,
        token: Token,
        config: ChannelClientConfig,
    ) -> Self {
        Self::new_with_transport(client_id, channel, stream, token, config, Transport::Raw)
    }

    /// Like [`ChannelClient::new`], but the connection is expected to open
    /// with an RFC 6455 handshake (the SPICE-over-websocket transport) before
    /// any channel bytes flow.
    pub fn new_websocket(
        client_id: ClientId,
        channel: Weak<RefCell<Channel<S>>>,
        stream: DuplexStream<S>,
        token: Token,
        config: ChannelClientConfig,
    ) -> Self {
        Self::new_with_transport(client_id, channel, stream, token, config, Transport::WebSocket(WebSocketLayer::new()))
    }

    fn new_with_transport(
        client_id: ClientId,
        channel: Weak<RefCell<Channel<S>>>,
        stream: DuplexStream<S>,
        token: Token,
        config: ChannelClientConfig,
        transport: Transport,
    ) -> Self {
        Self {
            client_id,
            channel,
            stream,
            token,
            transport,
            pipe: VecDeque::new(),
            ack_window: config.ack_window,
            ack_generation: 0,
            messages_since_ack: 0,
            blocked: false,
            waiting_for_migrate_data: false,
            common_caps: 0,
            channel_caps: 0,
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    pub fn pipe_len(&self) -> usize {
        self.pipe.len()
    }

    pub fn set_caps(&mut self, common: u64, channel: u64) {
        self.common_caps = common;
        self.channel_caps = channel;
    }

    pub fn has_common_cap(&self, bit: u32) -> bool {
        self.common_caps & (1 << bit) != 0
    }

    pub fn has_channel_cap(&self, bit: u32) -> bool {
        self.channel_caps & (1 << bit) != 0
    }

    /// Whether this client's most recently written websocket frame is still
    /// draining through the socket's write backlog. Always `false` for a raw
    /// (non-websocket) client.
    pub fn is_mid_websocket_frame(&self) -> bool {
        match &self.transport {
            Transport::WebSocket(layer) => layer.write_outcome.is_mid_frame(),
            Transport::Raw => false,
        }
    }

    /// Appends to the tail of the pipe.
    pub fn pipe_add(&mut self, item: PipeItemRef) {
        self.pipe.push_back(item);
    }

    /// Prepends an urgency item (ACK-class frames) ahead of normal traffic.
    pub fn pipe_add_push(&mut self, item: PipeItemRef) {
        self.pipe.push_front(item);
    }

    pub fn ack_set_client_window(&mut self, n: u32) {
        self.ack_window = n;
    }

    /// Pulls newly-arrived bytes off the socket. For a raw client this is
    /// just the next chunk of channel-protocol bytes; for a websocket client
    /// it first completes the HTTP upgrade handshake (replying in place) and
    /// then strips the RFC 6455 frame envelope, coalescing continuations, so
    /// the caller only ever sees raw channel-protocol bytes either way.
    pub fn poll_inbound(&mut self, registry: &Registry) -> (ConnState, Vec<Vec<u8>>) {
        if self.stream.fill_from_socket() == ConnState::Disconnected {
            return (ConnState::Disconnected, Vec::new());
        }

        let layer = match &mut self.transport {
            Transport::Raw => {
                let bytes = self.stream.readable().to_vec();
                let n = bytes.len();
                self.stream.consume(n);
                return (ConnState::Alive, if bytes.is_empty() { Vec::new() } else { vec![bytes] });
            }
            Transport::WebSocket(layer) => layer,
        };

        if !layer.handshaked {
            match try_handshake(self.stream.readable()) {
                HandshakeOutcome::Incomplete => return (ConnState::Alive, Vec::new()),
                HandshakeOutcome::NotAHandshake => return (ConnState::Disconnected, Vec::new()),
                HandshakeOutcome::Complete { consumed, reply } => {
                    self.stream.consume(consumed);
                    layer.handshaked = true;
                    if self.stream.write_or_enqueue(registry, self.token, &reply) == ConnState::Disconnected {
                        return (ConnState::Disconnected, Vec::new());
                    }
                }
            }
        }

        let mut messages = Vec::new();
        loop {
            if self.stream.readable().is_empty() {
                break;
            }
            let drained = match WebSocketCodec::parse_frame(self.stream.readable_mut()) {
                FrameOutcome::Incomplete => break,
                FrameOutcome::Close { consumed } => {
                    self.stream.consume(consumed);
                    return (ConnState::Disconnected, messages);
                }
                FrameOutcome::Ignored { consumed } => {
                    self.stream.consume(consumed);
                    DrainedFrame::Ignored
                }
                FrameOutcome::Data { payload, consumed, is_final } => {
                    let payload = payload.to_vec();
                    self.stream.consume(consumed);
                    DrainedFrame::Data { payload, is_final }
                }
            };
            match drained {
                DrainedFrame::Ignored => {}
                DrainedFrame::Data { payload, is_final } => {
                    let Transport::WebSocket(layer) = &mut self.transport else { unreachable!() };
                    layer.continuation.extend_from_slice(&payload);
                    if is_final {
                        messages.push(std::mem::take(&mut layer.continuation));
                    }
                }
            }
        }
        (ConnState::Alive, messages)
    }

    /// Drains as much of the pipe as the socket accepts. Marshals the next
    /// pending item once the backlog empties; sets `blocked` on would-block.
    pub fn push(&mut self, registry: &Registry) -> ConnState {
        loop {
            if self.stream.drain_backlog(registry, self.token) == ConnState::Disconnected {
                return ConnState::Disconnected;
            }
            if self.stream.has_backlog() {
                self.blocked = true;
                return ConnState::Alive;
            }
            self.blocked = false;

            let Some(item) = self.pipe.pop_front() else { return ConnState::Alive };
            let bytes = marshal_item(&item);
            self.messages_since_ack += 1;
            if self.ack_window > 0 && self.messages_since_ack >= self.ack_window {
                self.messages_since_ack = 0;
            }

            let wire = match &mut self.transport {
                Transport::Raw => bytes,
                Transport::WebSocket(layer) => {
                    let mut framed = WebSocketCodec::binary_frame_header(bytes.len());
                    framed.extend_from_slice(&bytes);
                    layer.write_outcome.set_remainder(framed.len());
                    framed
                }
            };
            if self.stream.write_or_enqueue(registry, self.token, &wire) == ConnState::Disconnected {
                return ConnState::Disconnected;
            }
            if let Transport::WebSocket(layer) = &mut self.transport {
                if !self.stream.has_backlog() {
                    layer.write_outcome.set_remainder(0);
                }
            }
        }
    }

    /// Base-class message dispatch: ACK and migration control frames are
    /// handled here; everything else is returned to the subclass.
    pub fn handle_message(&mut self, opcode: ControlOpCode, body: &[u8]) -> Option<()> {
        match opcode {
            ControlOpCode::AckSync => {
                if body.len() >= 4 {
                    self.ack_generation = u32::from_le_bytes(body[0..4].try_into().unwrap());
                }
                None
            }
            ControlOpCode::Migrate => {
                self.waiting_for_migrate_data = true;
                None
            }
            ControlOpCode::MigrateData => {
                self.waiting_for_migrate_data = false;
                None
            }
            ControlOpCode::SetAck => {
                if body.len() >= 8 {
                    self.ack_generation = u32::from_le_bytes(body[0..4].try_into().unwrap());
                    self.ack_window = u32::from_le_bytes(body[4..8].try_into().unwrap());
                }
                None
            }
        }
    }
}

impl<S> ChannelClient<S>
where
    S: Read + Write + mio::event::Source + spice_net::ShutdownBoth,
{
    pub fn disconnect(&mut self, registry: &Registry) {
        self.pipe.clear();
        self.stream.close(registry);
        if let Some(channel) = self.channel.upgrade() {
            channel.borrow_mut().detach(self.client_id);
        }
    }
}

fn marshal_item(item: &crate::types::PipeItem) -> Vec<u8> {
    marshal_kind(&item.kind)
}

fn marshal_kind(kind: &PipeItemKind) -> Vec<u8> {
    match kind {
        PipeItemKind::Message { msg_type, body } => {
            let mut out = Vec::with_capacity(2 + body.len());
            out.extend_from_slice(&msg_type.to_le_bytes());
            out.extend_from_slice(body);
            out
        }
        PipeItemKind::MigrateData(data) => data.clone(),
        PipeItemKind::MigrateFlushMark | PipeItemKind::EmptyAck => Vec::new(),
        PipeItemKind::StreamCreate { stream_id, width, height, codec } => {
            let mut out = Vec::with_capacity(13);
            out.extend_from_slice(&stream_id.to_le_bytes());
            out.extend_from_slice(&width.to_le_bytes());
            out.extend_from_slice(&height.to_le_bytes());
            out.push(*codec);
            out
        }
        PipeItemKind::StreamActivateReport => Vec::new(),
        PipeItemKind::StreamData { stream_id, mm_time, data } => {
            let mut out = Vec::with_capacity(8 + data.len());
            out.extend_from_slice(&stream_id.to_le_bytes());
            out.extend_from_slice(&mm_time.to_le_bytes());
            out.extend_from_slice(data);
            out
        }
        PipeItemKind::CursorSet { width, height, hot_x, hot_y, cursor_type, pixels } => {
            let mut out = Vec::with_capacity(17 + pixels.len());
            out.extend_from_slice(&width.to_le_bytes());
            out.extend_from_slice(&height.to_le_bytes());
            out.extend_from_slice(&hot_x.to_le_bytes());
            out.extend_from_slice(&hot_y.to_le_bytes());
            out.push(*cursor_type);
            out.extend_from_slice(pixels);
            out
        }
        PipeItemKind::CursorMove { x, y } => {
            let mut out = Vec::with_capacity(8);
            out.extend_from_slice(&x.to_le_bytes());
            out.extend_from_slice(&y.to_le_bytes());
            out
        }
        PipeItemKind::NotifyError { code, message } => {
            let mut out = Vec::with_capacity(4 + message.len() + 1);
            out.extend_from_slice(&code.to_le_bytes());
            out.extend_from_slice(message.as_bytes());
            out.push(0);
            out
        }
        PipeItemKind::SmartcardError { code, reader_id } => {
            crate::smartcard::encode_header(crate::smartcard::VSC_ERROR, *reader_id, &code.to_be_bytes())
        }
        PipeItemKind::SmartcardReaderAdd { reader_id } => {
            crate::smartcard::encode_header(crate::smartcard::VSC_READER_ADD, *reader_id, &[])
        }
        PipeItemKind::SmartcardAtr { reader_id, atr } => {
            crate::smartcard::encode_header(crate::smartcard::VSC_ATR, *reader_id, atr)
        }
        PipeItemKind::SmartcardApdu { reader_id, data } => {
            crate::smartcard::encode_header(crate::smartcard::VSC_APDU, *reader_id, data)
        }
        PipeItemKind::VmcData { data, .. } => data.clone(),
    }
}

/// A (type, id) logical service with its attached ChannelClients.
pub struct Channel<S = TcpStream> {
    pub channel_type: u32,
    pub id: u32,
    local_caps: u64,
    migrating: bool,
    clients: Vec<Rc<RefCell<ChannelClient<S>>>>,
}

impl<S> Channel<S>
where
    S: Read + Write + mio::event::Source + spice_net::ShutdownBoth,
{
    pub fn new(channel_type: u32, id: u32, local_caps: u64) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self { channel_type, id, local_caps, migrating: false, clients: Vec::new() }))
    }

    pub fn local_caps(&self) -> u64 {
        self.local_caps
    }

    /// Must be called on the channel's server thread.
    pub fn add_client(&mut self, client: Rc<RefCell<ChannelClient<S>>>) {
        self.clients.push(client);
    }

    fn detach(&mut self, client_id: ClientId) {
        self.clients.retain(|c| c.borrow().client_id != client_id);
    }

    pub fn clients(&self) -> &[Rc<RefCell<ChannelClient<S>>>] {
        &self.clients
    }

    /// Refs once and appends to every attached client's pipe.
    pub fn pipes_add(&self, item: PipeItemRef) {
        for client in &self.clients {
            client.borrow_mut().pipe_add(item.clone());
        }
    }

    /// Lets a factory build a distinct item per client (e.g. migration data
    /// carrying per-client state).
    pub fn pipes_new_add<F: Fn(&ChannelClient<S>) -> PipeItemRef>(&self, factory: F) {
        for client in &self.clients {
            let item = factory(&client.borrow());
            client.borrow_mut().pipe_add(item);
        }
    }

    /// Polls every client until its pipe is empty or `timeout` elapses;
    /// disconnects laggards on timeout. Matches the original's fixed-sleep
    /// poll loop (spec §5).
    pub fn wait_all_sent(&self, registry: &Registry, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let all_empty = self.clients.iter().all(|c| {
                let mut c = c.borrow_mut();
                c.push(registry);
                c.pipe_len() == 0 && !c.stream.has_backlog()
            });
            if all_empty {
                return true;
            }
            if Instant::now() >= deadline {
                for client in &self.clients {
                    let mut c = client.borrow_mut();
                    if c.pipe_len() > 0 || c.stream.has_backlog() {
                        warn!(channel_type = self.channel_type, channel_id = self.id, "wait_all_sent: disconnecting laggard client");
                        c.disconnect(registry);
                    }
                }
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

#[cfg(test)]
mod test {
    use mio::{Events, Poll};
    use std::os::unix::net::UnixStream as StdUnixStream;

    use crate::types::PipeItem;

    use super::*;

    const TOKEN: Token = Token(0);

    /// Builds a real, connected `ChannelClient` over a loopback socket pair
    /// (no channel attachment needed for these tests).
    fn client_over_loopback() -> (ChannelClient<mio::net::UnixStream>, mio::net::UnixStream, Poll) {
        let (a, b) = StdUnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        let mut stream = DuplexStream::new(mio::net::UnixStream::from_std(a));
        let poll = Poll::new().unwrap();
        stream.register(poll.registry(), TOKEN).unwrap();
        let client = ChannelClient::new(1, Weak::new(), stream, TOKEN, ChannelClientConfig::default());
        (client, mio::net::UnixStream::from_std(b), poll)
    }

    #[test]
    fn ack_window_resets_after_window_messages() {
        let (mut client, mut peer, poll) = client_over_loopback();
        client.ack_set_client_window(3);
        for _ in 0..7 {
            client.pipe_add(PipeItem::new(PipeItemKind::Message { msg_type: 1, body: vec![9] }));
        }
        assert_eq!(client.push(poll.registry()), ConnState::Alive);
        assert_eq!(client.messages_since_ack, 1);

        // drain what actually crossed the real socket, to prove `push` ran
        // the marshal+write path rather than just touching the counter.
        std::thread::sleep(Duration::from_millis(10));
        let mut buf = [0u8; 128];
        let n = peer.read(&mut buf).unwrap();
        assert_eq!(n, 7 * 3); // 7 messages, each 2-byte type + 1-byte body
    }

    #[test]
    fn pipe_add_push_prepends_ahead_of_fifo_items() {
        let (mut client, mut peer, poll) = client_over_loopback();
        client.pipe_add(PipeItem::new(PipeItemKind::Message { msg_type: 1, body: vec![0xAA] }));
        client.pipe_add_push(PipeItem::new(PipeItemKind::Message { msg_type: 2, body: vec![0xBB] }));

        assert_eq!(client.push(poll.registry()), ConnState::Alive);

        std::thread::sleep(Duration::from_millis(10));
        let mut buf = [0u8; 16];
        let n = peer.read(&mut buf).unwrap();
        // the urgent (pushed-front) item's bytes must precede the
        // originally-queued FIFO item's bytes on the wire — proves ordering
        // against the real ChannelClient pipe, not a throwaway VecDeque.
        assert_eq!(&buf[..n], &[2, 0, 0xBB, 1, 0, 0xAA]);
    }

    #[test]
    fn poll_inbound_returns_raw_bytes_as_one_chunk() {
        let (mut client, mut peer, poll) = client_over_loopback();
        peer.write_all(b"hello-channel").unwrap();

        let mut events = Events::with_capacity(4);
        poll.poll(&mut events, Some(Duration::from_secs(1))).unwrap();
        let (state, messages) = client.poll_inbound(poll.registry());
        assert_eq!(state, ConnState::Alive);
        assert_eq!(messages, vec![b"hello-channel".to_vec()]);
    }

    #[test]
    fn websocket_client_completes_handshake_before_surfacing_frames() {
        let (a, b) = StdUnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        let mut stream = DuplexStream::new(mio::net::UnixStream::from_std(a));
        let poll = Poll::new().unwrap();
        stream.register(poll.registry(), TOKEN).unwrap();
        let mut client: ChannelClient<mio::net::UnixStream> =
            ChannelClient::new_websocket(1, Weak::new(), stream, TOKEN, ChannelClientConfig::default());
        let mut peer = mio::net::UnixStream::from_std(b);

        let request = b"GET /ws HTTP/1.1\r\nHost: x\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Protocol: binary\r\n\r\n";
        peer.write_all(request).unwrap();

        let mut events = Events::with_capacity(4);
        poll.poll(&mut events, Some(Duration::from_secs(1))).unwrap();
        let (state, messages) = client.poll_inbound(poll.registry());
        assert_eq!(state, ConnState::Alive);
        assert!(messages.is_empty(), "handshake bytes must not surface as a channel message");

        std::thread::sleep(Duration::from_millis(10));
        let mut reply = vec![0u8; 256];
        let n = peer.read(&mut reply).unwrap();
        let reply_text = String::from_utf8_lossy(&reply[..n]);
        assert!(reply_text.contains("101 Switching Protocols"));

        // a masked binary frame sent by the peer after the handshake arrives
        // as a plain payload, with the websocket envelope fully stripped
        let mask = [0x11, 0x22, 0x33, 0x44];
        let payload = [7u8, 8, 9];
        let mut frame = vec![0x80 | 0x02, 0x80 | payload.len() as u8];
        frame.extend_from_slice(&mask);
        for (i, b) in payload.iter().enumerate() {
            frame.push(b ^ mask[i % 4]);
        }
        peer.write_all(&frame).unwrap();
        poll.poll(&mut events, Some(Duration::from_secs(1))).unwrap();
        let (state, messages) = client.poll_inbound(poll.registry());
        assert_eq!(state, ConnState::Alive);
        assert_eq!(messages, vec![vec![7, 8, 9]]);
    }

    #[test]
    fn websocket_client_frames_outbound_pipe_items() {
        let (a, b) = StdUnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        let mut stream = DuplexStream::new(mio::net::UnixStream::from_std(a));
        let poll = Poll::new().unwrap();
        stream.register(poll.registry(), TOKEN).unwrap();
        let mut client: ChannelClient<mio::net::UnixStream> =
            ChannelClient::new_websocket(1, Weak::new(), stream, TOKEN, ChannelClientConfig::default());
        let mut peer = mio::net::UnixStream::from_std(b);

        client.pipe_add(PipeItem::new(PipeItemKind::Message { msg_type: 5, body: vec![1, 2] }));
        assert_eq!(client.push(poll.registry()), ConnState::Alive);
        assert!(!client.is_mid_websocket_frame());

        std::thread::sleep(Duration::from_millis(10));
        let mut buf = [0u8; 32];
        let n = peer.read(&mut buf).unwrap();
        // FIN+binary opcode, 4-byte unmasked payload (2-byte msg_type + 2-byte body)
        assert_eq!(buf[0], 0x80 | 0x02);
        assert_eq!(buf[1], 4);
        assert_eq!(&buf[2..n], &[5, 0, 1, 2]);
    }
}
