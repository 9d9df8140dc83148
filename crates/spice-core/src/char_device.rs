//! The character-device flow-control core (spec §4.4) — per-device queue
//! pair, token accounting, write-buffer pool and migration serialization.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};

use tracing::warn;

use crate::event_loop::{EventLoop, TimerHandle};
use crate::types::{ClientId, PipeItemRef, WriteBuffer, WriteBufferOrigin, WriteBufferRef};

/// Tunables named in spec §5/§6 — credit window refill threshold, default
/// deferred-queue ceiling, the wait-for-tokens and write-retry timeouts, and
/// the write-retry giveup count.
#[derive(Debug, Clone, Copy)]
pub struct CharDeviceConfig {
    pub client_tokens_interval: u32,
    pub default_max_send_queue_size: usize,
    pub wait_for_tokens_timeout_ms: u64,
    pub write_retry_interval_ms: u64,
    pub max_write_retries: u32,
}

impl Default for CharDeviceConfig {
    fn default() -> Self {
        Self {
            client_tokens_interval: 30,
            default_max_send_queue_size: 30,
            wait_for_tokens_timeout_ms: 30_000,
            write_retry_interval_ms: 100,
            max_write_retries: 10,
        }
    }
}

/// The byte-stream adapter to the actual guest device (spec §6, "CharDevice
/// adapter (consumed)").
pub trait DeviceIo {
    /// Returns bytes written, or a negative value on would-block/error.
    fn write(&mut self, buf: &[u8]) -> i64;
    /// Returns bytes read, 0 on EOF, or a negative value on would-block/error.
    fn read(&mut self, buf: &mut [u8]) -> i64;
    fn set_state(&mut self, connected: bool);
    /// Whether the adapter notifies writability asynchronously; if false the
    /// device falls back to a short retry timer.
    fn notifies_writable(&self) -> bool {
        false
    }
}

/// The capability set a concrete device (Smartcard, Vmc, StreamDevice) must
/// provide. Per the redesign guidance in spec §9, concrete devices are enum
/// variants matched internally rather than a trait-object hierarchy; this
/// trait is the seam an enum wrapper implements once.
pub trait DeviceHooks {
    /// `event_loop` is threaded through so devices whose parsing can raise a
    /// real close-timer (e.g. `StreamDevice`) have access to it from within
    /// the generic read loop; devices with no such need simply ignore it.
    fn read_one_msg_from_device(&mut self, io: &mut dyn DeviceIo, event_loop: &mut EventLoop) -> Option<PipeItemRef>;
    fn send_msg_to_client(&mut self, client: ClientId, item: &PipeItemRef);
    fn remove_client(&mut self, client: ClientId);
    fn on_free_self_token(&mut self);
}

struct DeviceClient {
    id: ClientId,
    flow_control: bool,
    num_client_tokens: u32,
    num_client_tokens_free: u32,
    num_send_tokens: u32,
    send_queue: VecDeque<PipeItemRef>,
    max_send_queue_size: usize,
    wait_for_tokens_timer: Option<TimerHandle>,
}

impl DeviceClient {
    fn send_tokens_available(&self) -> u32 {
        if self.flow_control { self.num_send_tokens } else { u32::MAX }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Stopped,
    Running,
    RunningWaitingMigration,
}

/// Per-device migration snapshot (spec §6 "Migration snapshot format").
pub struct MigrateSnapshot {
    pub connected: bool,
    pub num_client_tokens: u32,
    pub num_send_tokens: u32,
    pub write_num_client_tokens: u32,
    pub write_data: Vec<u8>,
}

pub struct CharDevice<H: DeviceHooks> {
    config: CharDeviceConfig,
    hooks: H,
    io: Box<dyn DeviceIo>,
    self_weak: Weak<RefCell<CharDevice<H>>>,
    clients: HashMap<ClientId, DeviceClient>,
    write_queue: VecDeque<WriteBufferRef>,
    cur_write_buf: Option<WriteBufferRef>,
    num_self_tokens: u32,
    state: DeviceState,
    read_depth: u32,
    read_rerun_pending: bool,
    write_depth: u32,
    write_rerun_pending: bool,
    write_retry_timer: Option<TimerHandle>,
    write_retry_count: u32,
}

impl<H: DeviceHooks> CharDevice<H> {
    /// Builds a device behind `Rc<RefCell<_>>`: the wait-for-tokens and
    /// write-retry timer callbacks only ever receive `&mut EventLoop`, so
    /// they need a `Weak` handle back into this struct's own state to act on
    /// expiry, set up here via the usual self-referential-`Rc` idiom.
    pub fn new(hooks: H, io: Box<dyn DeviceIo>, config: CharDeviceConfig) -> Rc<RefCell<Self>> {
        let instance = Rc::new(RefCell::new(Self {
            config,
            hooks,
            io,
            self_weak: Weak::new(),
            clients: HashMap::new(),
            write_queue: VecDeque::new(),
            cur_write_buf: None,
            num_self_tokens: 0,
            state: DeviceState::Stopped,
            read_depth: 0,
            read_rerun_pending: false,
            write_depth: 0,
            write_rerun_pending: false,
            write_retry_timer: None,
            write_retry_count: 0,
        }));
        instance.borrow_mut().self_weak = Rc::downgrade(&instance);
        instance
    }

    pub fn hooks_mut(&mut self) -> &mut H {
        &mut self.hooks
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    // ---- lifecycle -----------------------------------------------------

    pub fn client_add(
        &mut self,
        client: ClientId,
        flow_control: bool,
        max_queue: usize,
        client_tokens: u32,
        send_tokens: u32,
        wait_migration: bool,
    ) -> Result<(), &'static str> {
        if wait_migration && (self.state != DeviceState::Stopped || !self.clients.is_empty()) {
            return Err("wait_migration requires an inactive device with no prior clients");
        }
        self.clients.insert(
            client,
            DeviceClient {
                id: client,
                flow_control,
                num_client_tokens: client_tokens,
                num_client_tokens_free: 0,
                num_send_tokens: send_tokens,
                send_queue: VecDeque::new(),
                max_send_queue_size: if max_queue == 0 { self.config.default_max_send_queue_size } else { max_queue },
                wait_for_tokens_timer: None,
            },
        );
        if wait_migration {
            self.state = DeviceState::RunningWaitingMigration;
        }
        Ok(())
    }

    /// Detaches `client`: drops its deferred queue, demotes any in-flight
    /// buffer of its origin, and lets the subclass react.
    pub fn client_remove(&mut self, client: ClientId, event_loop: &mut EventLoop) {
        if let Some(mut c) = self.clients.remove(&client) {
            if let Some(t) = c.wait_for_tokens_timer.take() {
                event_loop.remove_timer(t);
            }
            c.send_queue.clear();
        }
        // Queued (not-yet-current) buffers of this client's origin are left
        // as-is: they still represent real bytes to write, and nothing reads
        // their origin again before they become `cur_write_buf` and are
        // handled by the same demotion below.
        if let Some(cur) = &self.cur_write_buf {
            if cur.origin == WriteBufferOrigin::Client(client) {
                // Demotion to origin=None: we cannot mutate a shared Rc in
                // place, so replace with an equivalent buffer carrying the
                // remaining bytes and no origin.
                let remaining = cur.remaining().to_vec();
                self.cur_write_buf = Some(std::rc::Rc::new(WriteBuffer {
                    data: remaining,
                    used: 0,
                    origin: WriteBufferOrigin::None,
                    token_price: 0,
                }));
            }
        }
        self.hooks.remove_client(client);
        if self.clients.is_empty() && self.state == DeviceState::RunningWaitingMigration {
            self.state = DeviceState::Running;
        }
    }

    pub fn start(&mut self) {
        self.state = DeviceState::Running;
    }

    pub fn stop(&mut self) {
        self.state = DeviceState::Stopped;
    }

    pub fn reset(&mut self, event_loop: &mut EventLoop) {
        self.write_queue.clear();
        self.cur_write_buf = None;
        if let Some(t) = self.write_retry_timer.take() {
            event_loop.remove_timer(t);
        }
        self.write_retry_count = 0;
        self.state = DeviceState::Stopped;
    }

    pub fn wakeup(&mut self, event_loop: &mut EventLoop) {
        self.run_read_loop(event_loop);
    }

    // ---- write-buffer pool ---------------------------------------------

    /// Allocates a client-origin buffer, consuming one client token. Returns
    /// `Err` and force-removes the client on credit overflow.
    pub fn write_buffer_get_client(
        &mut self,
        client: ClientId,
        size: usize,
        event_loop: &mut EventLoop,
    ) -> Result<WriteBufferRef, &'static str> {
        let has_credit = match self.clients.get_mut(&client) {
            Some(c) if !c.flow_control => true,
            Some(c) if c.num_client_tokens > 0 => {
                c.num_client_tokens -= 1;
                true
            }
            Some(_) => false,
            None => return Err("no such client"),
        };
        if !has_credit {
            warn!(client, "char-device: client token overflow, removing client");
            self.client_remove(client, event_loop);
            return Err("client token overflow");
        }
        Ok(std::rc::Rc::new(WriteBuffer::new(vec![0; size], WriteBufferOrigin::Client(client), 1)))
    }

    /// Allocates a server-origin buffer. If `use_token`, consumes one
    /// self-token and returns `None` when the device has none left.
    pub fn write_buffer_get_server(&mut self, size: usize, use_token: bool) -> Option<WriteBufferRef> {
        if use_token {
            if self.num_self_tokens == 0 {
                return None;
            }
            self.num_self_tokens -= 1;
        }
        let origin = if use_token { WriteBufferOrigin::Server } else { WriteBufferOrigin::ServerNoToken };
        Some(std::rc::Rc::new(WriteBuffer::new(vec![0; size], origin, if use_token { 1 } else { 0 })))
    }

    pub fn write_buffer_add(&mut self, buf: WriteBufferRef, event_loop: &mut EventLoop) {
        self.write_queue.push_back(buf);
        self.run_write_loop(event_loop);
    }

    /// Drops a buffer without enqueuing it (or after it completed), returning
    /// its token to the originator.
    pub fn write_buffer_release(&mut self, buf: WriteBufferRef) {
        self.release_buffer_tokens(&buf);
    }

    fn release_buffer_tokens(&mut self, buf: &WriteBuffer) {
        match buf.origin {
            WriteBufferOrigin::Client(client) => {
                if let Some(c) = self.clients.get_mut(&client) {
                    c.num_client_tokens_free += 1;
                    if c.num_client_tokens_free >= self.config.client_tokens_interval {
                        let returned = c.num_client_tokens_free;
                        c.num_client_tokens_free = 0;
                        c.num_client_tokens += returned;
                        self.hooks.send_msg_to_client(
                            client,
                            &crate::types::PipeItem::new(crate::types::PipeItemKind::EmptyAck),
                        );
                    }
                }
            }
            WriteBufferOrigin::Server => {
                self.num_self_tokens += 1;
                self.hooks.on_free_self_token();
            }
            WriteBufferOrigin::ServerNoToken | WriteBufferOrigin::None => {}
        }
    }

    // ---- token returns ---------------------------------------------------

    pub fn send_to_client_tokens_add(&mut self, client: ClientId, n: u32, event_loop: &mut EventLoop) {
        if let Some(c) = self.clients.get_mut(&client) {
            c.num_send_tokens = c.num_send_tokens.saturating_add(n);
            if let Some(t) = c.wait_for_tokens_timer.take() {
                event_loop.remove_timer(t);
            }
        }
        self.drain_client_queue(client);
        self.run_read_loop(event_loop);
    }

    pub fn send_to_client_tokens_set(&mut self, client: ClientId, n: u32, event_loop: &mut EventLoop) {
        if let Some(c) = self.clients.get_mut(&client) {
            c.num_send_tokens = n;
        }
        self.drain_client_queue(client);
        self.run_read_loop(event_loop);
    }

    fn drain_client_queue(&mut self, client: ClientId) {
        loop {
            let Some(c) = self.clients.get_mut(&client) else { return };
            if c.send_tokens_available() == 0 {
                return;
            }
            let Some(item) = c.send_queue.pop_front() else { return };
            if c.flow_control {
                c.num_send_tokens -= 1;
            }
            self.hooks.send_msg_to_client(client, &item);
        }
    }

    // ---- read path (spec §4.4.2) ----------------------------------------

    pub fn run_read_loop(&mut self, event_loop: &mut EventLoop) {
        if self.state != DeviceState::Running {
            return;
        }
        if self.read_depth > 0 {
            self.read_rerun_pending = true;
            return;
        }
        self.read_depth += 1;
        loop {
            self.read_rerun_pending = false;
            self.read_loop_body(event_loop);
            if !self.read_rerun_pending {
                break;
            }
        }
        self.read_depth -= 1;
    }

    fn max_send_tokens(&self) -> u32 {
        if self.clients.is_empty() {
            return u32::MAX;
        }
        self.clients
            .values()
            .map(DeviceClient::send_tokens_available)
            .max()
            .unwrap_or(u32::MAX)
    }

    fn read_loop_body(&mut self, event_loop: &mut EventLoop) {
        loop {
            if self.max_send_tokens() == 0 && !self.clients.is_empty() {
                break;
            }
            let Some(item) = self.hooks.read_one_msg_from_device(&mut *self.io, event_loop) else { break };
            self.broadcast(item, event_loop);
            if self.read_rerun_pending {
                break;
            }
        }
    }

    fn broadcast(&mut self, item: PipeItemRef, event_loop: &mut EventLoop) {
        if self.clients.is_empty() {
            return;
        }
        let client_ids: Vec<ClientId> = self.clients.keys().copied().collect();
        let mut overflowed = Vec::new();
        for client in client_ids {
            let Some(c) = self.clients.get_mut(&client) else { continue };
            if c.send_tokens_available() > 0 {
                if c.flow_control {
                    c.num_send_tokens -= 1;
                }
                self.hooks.send_msg_to_client(client, &item);
            } else {
                c.send_queue.push_back(item.clone());
                if c.send_queue.len() > c.max_send_queue_size {
                    overflowed.push(client);
                } else if c.wait_for_tokens_timer.is_none() {
                    let timeout = self.config.wait_for_tokens_timeout_ms;
                    let weak = self.self_weak.clone();
                    let handle = event_loop.add_timer(Box::new(move |el| {
                        if let Some(dev) = weak.upgrade() {
                            dev.borrow_mut().on_wait_for_tokens_timeout(client, el);
                        }
                    }));
                    event_loop.start_timer(handle, timeout);
                    c.wait_for_tokens_timer = Some(handle);
                }
            }
        }
        for client in overflowed {
            warn!(client, "char-device: send-queue overflow, removing client");
            self.client_remove(client, event_loop);
        }
    }

    // ---- write path (spec §4.4.3) ---------------------------------------

    pub fn run_write_loop(&mut self, event_loop: &mut EventLoop) {
        if self.write_depth > 0 {
            self.write_rerun_pending = true;
            return;
        }
        self.write_depth += 1;
        loop {
            self.write_rerun_pending = false;
            self.write_loop_body(event_loop);
            if !self.write_rerun_pending {
                break;
            }
        }
        self.write_depth -= 1;
    }

    fn write_loop_body(&mut self, event_loop: &mut EventLoop) {
        loop {
            if self.cur_write_buf.is_none() {
                let Some(next) = self.write_queue.pop_front() else { break };
                self.cur_write_buf = Some(next);
            }
            let buf = self.cur_write_buf.clone().unwrap();
            let n = self.io.write(buf.remaining());
            if n <= 0 {
                if !self.io.notifies_writable() {
                    self.arm_write_retry_timer(event_loop);
                }
                break;
            }
            self.write_retry_count = 0;
            let n = n as usize;
            // A write buffer is conceptually mutable (cursor advance) but
            // shared via Rc with a possible migration snapshot, so the
            // cursor is tracked alongside rather than inside the Rc.
            let new_used = buf.used + n;
            if new_used >= buf.data.len() {
                self.cur_write_buf = None;
                self.release_buffer_tokens(&buf);
            } else {
                self.cur_write_buf = Some(std::rc::Rc::new(WriteBuffer {
                    data: buf.data.clone(),
                    used: new_used,
                    origin: buf.origin,
                    token_price: buf.token_price,
                }));
            }
        }
    }

    /// Arms (or rearms) the single device-level write-retry timer. Reuses
    /// the existing handle across retries rather than leaking a fresh timer
    /// slot per stalled write.
    fn arm_write_retry_timer(&mut self, event_loop: &mut EventLoop) {
        let interval = self.config.write_retry_interval_ms;
        let handle = match self.write_retry_timer {
            Some(h) => h,
            None => {
                let weak = self.self_weak.clone();
                let h = event_loop.add_timer(Box::new(move |el| {
                    if let Some(dev) = weak.upgrade() {
                        dev.borrow_mut().on_write_retry(el);
                    }
                }));
                self.write_retry_timer = Some(h);
                h
            }
        };
        event_loop.start_timer(handle, interval);
    }

    /// Write-retry timer callback: re-attempts the stalled write, or closes
    /// the device once `max_write_retries` consecutive attempts fail.
    fn on_write_retry(&mut self, event_loop: &mut EventLoop) {
        self.write_retry_count += 1;
        if self.write_retry_count > self.config.max_write_retries {
            warn!("char-device: write retries exhausted, closing device");
            if let Some(t) = self.write_retry_timer.take() {
                event_loop.remove_timer(t);
            }
            self.write_retry_count = 0;
            self.write_queue.clear();
            self.cur_write_buf = None;
            self.io.set_state(false);
            self.state = DeviceState::Stopped;
            return;
        }
        self.run_write_loop(event_loop);
    }

    /// Wait-for-tokens timer callback: force-disconnects `client` if it is
    /// still over its send-token threshold when the timer fires.
    fn on_wait_for_tokens_timeout(&mut self, client: ClientId, event_loop: &mut EventLoop) {
        let Some(c) = self.clients.get_mut(&client) else { return };
        c.wait_for_tokens_timer = None;
        if c.send_tokens_available() == 0 {
            warn!(client, "char-device: wait-for-tokens timeout, force-disconnecting client");
            self.client_remove(client, event_loop);
        }
    }

    // ---- migration (spec §6) ---------------------------------------------

    pub fn migrate_data_marshall(&self) -> MigrateSnapshot {
        let (num_client_tokens, num_send_tokens) = self
            .clients
            .values()
            .next()
            .map(|c| (c.num_client_tokens, c.num_send_tokens))
            .unwrap_or((0, 0));
        let write_data = self
            .cur_write_buf
            .as_ref()
            .map(|b| b.remaining().to_vec())
            .into_iter()
            .chain(self.write_queue.iter().map(|b| b.data.clone()))
            .flatten()
            .collect();
        let write_num_client_tokens = self
            .cur_write_buf
            .as_ref()
            .filter(|b| matches!(b.origin, WriteBufferOrigin::Client(_)))
            .map(|b| b.token_price)
            .unwrap_or(0);
        MigrateSnapshot {
            connected: true,
            num_client_tokens,
            num_send_tokens,
            write_num_client_tokens,
            write_data,
        }
    }

    /// Restores from a snapshot per the formula in spec §6: `num_client_tokens_free
    /// = client_tokens_interval - mig.num_client_tokens - mig.write_num_client_tokens`.
    pub fn restore(&mut self, client: ClientId, snapshot: MigrateSnapshot, event_loop: &mut EventLoop) -> Result<(), &'static str> {
        let free = self
            .config
            .client_tokens_interval
            .saturating_sub(snapshot.num_client_tokens)
            .saturating_sub(snapshot.write_num_client_tokens);
        let Some(c) = self.clients.get_mut(&client) else { return Err("no such client") };
        c.num_client_tokens = snapshot.num_client_tokens;
        c.num_client_tokens_free = free;
        c.num_send_tokens = snapshot.num_send_tokens;

        if !snapshot.write_data.is_empty() {
            let origin = if snapshot.write_num_client_tokens > 0 {
                WriteBufferOrigin::Client(client)
            } else {
                WriteBufferOrigin::Server
            };
            let buf = std::rc::Rc::new(WriteBuffer::new(snapshot.write_data, origin, snapshot.write_num_client_tokens));
            self.write_queue.push_back(buf);
        }

        self.state = DeviceState::Running;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn client_tokens(&self, client: ClientId) -> Option<(u32, u32)> {
        self.clients.get(&client).map(|c| (c.num_client_tokens, c.num_client_tokens_free))
    }

    #[cfg(test)]
    pub(crate) fn send_queue_len(&self, client: ClientId) -> usize {
        self.clients.get(&client).map(|c| c.send_queue.len()).unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn has_client(&self, client: ClientId) -> bool {
        self.clients.contains_key(&client)
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::types::{PipeItem, PipeItemKind};

    use super::*;

    struct NullIo;
    impl DeviceIo for NullIo {
        fn write(&mut self, buf: &[u8]) -> i64 {
            buf.len() as i64
        }
        fn read(&mut self, _buf: &mut [u8]) -> i64 {
            -1
        }
        fn set_state(&mut self, _connected: bool) {}
    }

    /// Write-side I/O double that always reports would-block, so write-retry
    /// timer behavior can be exercised deterministically.
    struct StuckIo {
        notifies_writable: bool,
        writes_attempted: Rc<RefCell<u32>>,
        closed: Rc<RefCell<bool>>,
    }
    impl DeviceIo for StuckIo {
        fn write(&mut self, _buf: &[u8]) -> i64 {
            *self.writes_attempted.borrow_mut() += 1;
            -1
        }
        fn read(&mut self, _buf: &mut [u8]) -> i64 {
            -1
        }
        fn set_state(&mut self, connected: bool) {
            if !connected {
                *self.closed.borrow_mut() = true;
            }
        }
        fn notifies_writable(&self) -> bool {
            self.notifies_writable
        }
    }

    /// A scripted test hook: yields a fixed number of messages from
    /// `pending`, one per `read_one_msg_from_device` call, then nil.
    struct ScriptedHooks {
        pending: VecDeque<PipeItemRef>,
        delivered: Rc<RefCell<Vec<ClientId>>>,
        removed: Rc<RefCell<Vec<ClientId>>>,
    }

    impl DeviceHooks for ScriptedHooks {
        fn read_one_msg_from_device(&mut self, _io: &mut dyn DeviceIo, _event_loop: &mut EventLoop) -> Option<PipeItemRef> {
            self.pending.pop_front()
        }
        fn send_msg_to_client(&mut self, client: ClientId, _item: &PipeItemRef) {
            self.delivered.borrow_mut().push(client);
        }
        fn remove_client(&mut self, client: ClientId) {
            self.removed.borrow_mut().push(client);
        }
        fn on_free_self_token(&mut self) {}
    }

    fn msg() -> PipeItemRef {
        PipeItem::new(PipeItemKind::Message { msg_type: 1, body: vec![] })
    }

    /// S2 — token starvation then recovery.
    #[test]
    fn s2_token_starvation_then_recovery() {
        let delivered = Rc::new(RefCell::new(Vec::new()));
        let removed = Rc::new(RefCell::new(Vec::new()));
        let mut pending = VecDeque::new();
        for _ in 0..5 {
            pending.push_back(msg());
        }
        let hooks = ScriptedHooks { pending, delivered: delivered.clone(), removed: removed.clone() };
        let dev = CharDevice::new(hooks, Box::new(NullIo), CharDeviceConfig::default());
        let mut el = EventLoop::new().unwrap();

        dev.borrow_mut().client_add(1, true, 2, 0, 3, false).unwrap();
        dev.borrow_mut().start();
        dev.borrow_mut().run_read_loop(&mut el);

        assert_eq!(delivered.borrow().len(), 3);
        assert_eq!(dev.borrow().send_queue_len(1), 2);
        assert!(removed.borrow().is_empty());

        dev.borrow_mut().send_to_client_tokens_add(1, 2, &mut el);
        assert_eq!(delivered.borrow().len(), 5);
        assert_eq!(dev.borrow().send_queue_len(1), 0);
    }

    /// S3 — send-queue overflow forces client removal.
    #[test]
    fn s3_send_queue_overflow_removes_client() {
        let delivered = Rc::new(RefCell::new(Vec::new()));
        let removed = Rc::new(RefCell::new(Vec::new()));
        let mut pending = VecDeque::new();
        for _ in 0..10 {
            pending.push_back(msg());
        }
        let hooks = ScriptedHooks { pending, delivered: delivered.clone(), removed: removed.clone() };
        let dev = CharDevice::new(hooks, Box::new(NullIo), CharDeviceConfig::default());
        let mut el = EventLoop::new().unwrap();

        dev.borrow_mut().client_add(1, true, 2, 0, 3, false).unwrap();
        dev.borrow_mut().start();
        dev.borrow_mut().run_read_loop(&mut el);

        assert_eq!(removed.borrow().as_slice(), &[1]);
        assert!(!dev.borrow().has_client(1));
    }

    /// S6 — migration replay: marshall then restore preserves token counters
    /// and pending write-queue bytes.
    #[test]
    fn s6_migration_round_trip() {
        let hooks = ScriptedHooks {
            pending: VecDeque::new(),
            delivered: Rc::new(RefCell::new(Vec::new())),
            removed: Rc::new(RefCell::new(Vec::new())),
        };
        let dev = CharDevice::new(hooks, Box::new(NullIo), CharDeviceConfig::default());
        let mut el = EventLoop::new().unwrap();

        dev.borrow_mut().client_add(1, true, 30, 5, 5, false).unwrap();
        dev.borrow_mut().start();
        let buf1 = dev.borrow_mut().write_buffer_get_client(1, 8, &mut el).unwrap();
        let buf2 = dev.borrow_mut().write_buffer_get_client(1, 4, &mut el).unwrap();
        {
            let mut dev = dev.borrow_mut();
            dev.write_queue.push_back(buf1);
            dev.write_queue.push_back(buf2);
            // consume 3 bytes of the first by popping it into cur_write_buf
            let front = dev.write_queue.pop_front().unwrap();
            dev.cur_write_buf = Some(std::rc::Rc::new(WriteBuffer {
                data: front.data.clone(),
                used: 3,
                origin: front.origin,
                token_price: front.token_price,
            }));
        }

        let snapshot = dev.borrow().migrate_data_marshall();
        assert_eq!(snapshot.num_client_tokens, 3);

        let hooks2 = ScriptedHooks {
            pending: VecDeque::new(),
            delivered: Rc::new(RefCell::new(Vec::new())),
            removed: Rc::new(RefCell::new(Vec::new())),
        };
        let dev2 = CharDevice::new(hooks2, Box::new(NullIo), CharDeviceConfig::default());
        dev2.borrow_mut().client_add(1, true, 30, 0, 0, true).unwrap();
        dev2.borrow_mut().restore(1, snapshot, &mut el).unwrap();

        assert_eq!(dev2.borrow().client_tokens(1).unwrap().0, 3);
        assert_eq!(dev2.borrow().state(), DeviceState::Running);
    }

    /// Write-retry timer: a stalled write is retried on the timer and the
    /// device is closed once retries are exhausted.
    #[test]
    fn write_retry_timer_closes_device_after_max_retries() {
        let hooks = ScriptedHooks {
            pending: VecDeque::new(),
            delivered: Rc::new(RefCell::new(Vec::new())),
            removed: Rc::new(RefCell::new(Vec::new())),
        };
        let writes_attempted = Rc::new(RefCell::new(0));
        let closed = Rc::new(RefCell::new(false));
        let io = StuckIo { notifies_writable: false, writes_attempted: writes_attempted.clone(), closed: closed.clone() };
        let config = CharDeviceConfig { write_retry_interval_ms: 1, max_write_retries: 2, ..CharDeviceConfig::default() };
        let dev = CharDevice::new(hooks, Box::new(io), config);
        let mut el = EventLoop::new().unwrap();

        dev.borrow_mut().start();
        let buf = dev.borrow_mut().write_buffer_get_server(4, false).unwrap();
        dev.borrow_mut().write_buffer_add(buf, &mut el);
        assert_eq!(*writes_attempted.borrow(), 1);
        assert!(!*closed.borrow());

        // let the retry timer fire repeatedly until retries are exhausted
        for _ in 0..4 {
            std::thread::sleep(std::time::Duration::from_millis(5));
            el.run_once().unwrap();
        }

        assert!(*closed.borrow(), "device should be closed once write retries are exhausted");
        assert_eq!(dev.borrow().state(), DeviceState::Stopped);
    }

    /// Wait-for-tokens timer: a client still over threshold when the timer
    /// fires is force-disconnected.
    #[test]
    fn wait_for_tokens_timer_force_disconnects_stalled_client() {
        let delivered = Rc::new(RefCell::new(Vec::new()));
        let removed = Rc::new(RefCell::new(Vec::new()));
        let mut pending = VecDeque::new();
        for _ in 0..3 {
            pending.push_back(msg());
        }
        let hooks = ScriptedHooks { pending, delivered: delivered.clone(), removed: removed.clone() };
        let config = CharDeviceConfig { wait_for_tokens_timeout_ms: 1, ..CharDeviceConfig::default() };
        let dev = CharDevice::new(hooks, Box::new(NullIo), config);
        let mut el = EventLoop::new().unwrap();

        dev.borrow_mut().client_add(1, true, 10, 0, 1, false).unwrap();
        dev.borrow_mut().start();
        dev.borrow_mut().run_read_loop(&mut el);
        assert_eq!(delivered.borrow().len(), 1);
        assert!(dev.borrow().has_client(1));

        std::thread::sleep(std::time::Duration::from_millis(5));
        el.run_once().unwrap();

        assert!(!dev.borrow().has_client(1));
        assert_eq!(removed.borrow().as_slice(), &[1]);
    }
}
