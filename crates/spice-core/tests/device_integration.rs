//! Drives each concrete device (Smartcard, Vmc, StreamDevice) through a real
//! `CharDevice<H>` instance together with its generic token accounting and
//! read/write loops, rather than unit-testing the device parsers in
//! isolation from the generic machinery they're meant to plug into.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use spice_core::char_device::{CharDevice, CharDeviceConfig, DeviceIo};
use spice_core::event_loop::EventLoop;
use spice_core::smartcard::{self, SmartcardState};
use spice_core::stream_device::StreamDevice;
use spice_core::types::PipeItemKind;
use spice_core::vmc::{VmcConfig, VmcState};

/// Replays scripted byte chunks on `read`, and records everything passed to
/// `write`.
struct ScriptedIo {
    chunks: VecDeque<Vec<u8>>,
    writes: Rc<RefCell<Vec<u8>>>,
    reads_attempted: Rc<Cell<u32>>,
}

impl DeviceIo for ScriptedIo {
    fn write(&mut self, buf: &[u8]) -> i64 {
        self.writes.borrow_mut().extend_from_slice(buf);
        buf.len() as i64
    }
    fn read(&mut self, buf: &mut [u8]) -> i64 {
        self.reads_attempted.set(self.reads_attempted.get() + 1);
        let Some(chunk) = self.chunks.pop_front() else { return -1 };
        buf[..chunk.len()].copy_from_slice(&chunk);
        chunk.len() as i64
    }
    fn set_state(&mut self, _connected: bool) {}
}

#[test]
fn char_device_smartcard_reads_a_real_reader_add_message() {
    let wire = smartcard::encode_header(smartcard::VSC_READER_ADD, 0, &[]);
    let io = ScriptedIo {
        chunks: VecDeque::from([wire]),
        writes: Rc::new(RefCell::new(Vec::new())),
        reads_attempted: Rc::new(Cell::new(0)),
    };
    let hooks = SmartcardState::new(1);
    let dev = CharDevice::new(hooks, Box::new(io), CharDeviceConfig::default());
    let mut event_loop = EventLoop::new().unwrap();

    dev.borrow_mut().client_add(1, true, 10, 0, 10, false).unwrap();
    dev.borrow_mut().start();
    dev.borrow_mut().run_read_loop(&mut event_loop);

    // the generic read loop drove the smartcard parser through a real
    // reader-table mutation, not just a mocked return value
    assert_eq!(dev.borrow_mut().hooks_mut().reader_count(), 1);
}

#[test]
fn char_device_smartcard_stops_reading_once_client_runs_out_of_send_tokens() {
    let mut chunks = VecDeque::new();
    for _ in 0..3 {
        chunks.push_back(smartcard::encode_header(smartcard::VSC_READER_ADD, 0, &[]));
    }
    let io = ScriptedIo { chunks, writes: Rc::new(RefCell::new(Vec::new())), reads_attempted: Rc::new(Cell::new(0)) };
    let hooks = SmartcardState::new(1);
    let dev = CharDevice::new(hooks, Box::new(io), CharDeviceConfig::default());
    let mut event_loop = EventLoop::new().unwrap();

    // only one send token: after the first message is delivered the client
    // has none left, so the read loop's token-gated fast path must stop
    // pulling further messages off the device even though two remain
    // buffered in the scripted IO.
    dev.borrow_mut().client_add(1, true, 10, 0, 1, false).unwrap();
    dev.borrow_mut().start();
    dev.borrow_mut().run_read_loop(&mut event_loop);

    assert_eq!(dev.borrow_mut().hooks_mut().reader_count(), 1);
}

#[test]
fn char_device_vmc_suspends_the_generic_read_loop_when_queue_is_full() {
    let mut chunks = VecDeque::new();
    chunks.push_back(vec![1u8, 2, 3, 4]);
    let reads_attempted = Rc::new(Cell::new(0));
    let io = ScriptedIo { chunks, writes: Rc::new(RefCell::new(Vec::new())), reads_attempted: reads_attempted.clone() };
    let mut hooks = VmcState::new(VmcConfig::default());
    hooks.on_queue_changed(VmcConfig::default().queued_data_limit);
    assert!(hooks.is_suspended());

    let dev = CharDevice::new(hooks, Box::new(io), CharDeviceConfig::default());
    let mut event_loop = EventLoop::new().unwrap();
    dev.borrow_mut().client_add(1, true, 10, 0, 10, false).unwrap();
    dev.borrow_mut().start();
    dev.borrow_mut().run_read_loop(&mut event_loop);

    // the device-level suspension is a real gate in front of `io.read`, not
    // just a flag the generic loop ignores
    assert_eq!(reads_attempted.get(), 0);
}

#[test]
fn char_device_vmc_reads_a_real_chunk_through_the_generic_loop() {
    let chunk = vec![0u8; 4096];
    let reads_attempted = Rc::new(Cell::new(0));
    let io = ScriptedIo {
        chunks: VecDeque::from([chunk.clone()]),
        writes: Rc::new(RefCell::new(Vec::new())),
        reads_attempted: reads_attempted.clone(),
    };
    let mut hooks = VmcState::new(VmcConfig { compress_threshold: 8, queued_data_limit: 1024 * 1024 });
    hooks.set_peer_capability_lz4(true);

    let dev = CharDevice::new(hooks, Box::new(io), CharDeviceConfig::default());
    let mut event_loop = EventLoop::new().unwrap();
    dev.borrow_mut().client_add(1, true, 10, 0, 10, false).unwrap();
    dev.borrow_mut().start();
    dev.borrow_mut().run_read_loop(&mut event_loop);

    // one successful read of the scripted chunk, then one failing attempt
    // that ends the generic read loop — proves `io.read` was actually
    // invoked by the generic loop rather than the hook being bypassed
    assert_eq!(reads_attempted.get(), 2);
}

#[test]
fn char_device_vmc_client_sent_bytes_round_trip_through_the_write_path() {
    let writes = Rc::new(RefCell::new(Vec::new()));
    let io = ScriptedIo { chunks: VecDeque::new(), writes: writes.clone(), reads_attempted: Rc::new(Cell::new(0)) };
    let mut hooks = VmcState::new(VmcConfig::default());
    hooks.handle_client_data(false, 0, vec![9, 9, 9]);
    let pending = hooks.take_inbound().expect("queued client data");

    let dev = CharDevice::new(hooks, Box::new(io), CharDeviceConfig::default());
    let mut event_loop = EventLoop::new().unwrap();
    dev.borrow_mut().client_add(1, true, 10, 5, 0, false).unwrap();
    dev.borrow_mut().start();

    let buf = dev.borrow_mut().write_buffer_get_client(1, pending.len(), &mut event_loop).unwrap();
    let buf = Rc::new(spice_core::types::WriteBuffer::new(pending.clone(), buf.origin, buf.token_price));
    dev.borrow_mut().write_buffer_add(buf, &mut event_loop);

    assert_eq!(*writes.borrow(), pending);
}

#[test]
fn char_device_stream_device_write_path_and_real_parser_compose() {
    let writes = Rc::new(RefCell::new(Vec::new()));
    let io = ScriptedIo { chunks: VecDeque::new(), writes: writes.clone(), reads_attempted: Rc::new(Cell::new(0)) };
    let hooks = StreamDevice::new();
    let dev = CharDevice::new(hooks, Box::new(io), CharDeviceConfig::default());
    let mut event_loop = EventLoop::new().unwrap();

    dev.borrow_mut().client_add(1, true, 10, 0, 10, false).unwrap();
    dev.borrow_mut().start();

    // server-origin bytes flow through the generic write path
    let buf = dev.borrow_mut().write_buffer_get_server(4, false).unwrap();
    dev.borrow_mut().write_buffer_add(buf, &mut event_loop);
    assert_eq!(writes.borrow().len(), 4);

    // the device's own real parser (driven externally, as StreamDevice's
    // DeviceHooks::read_one_msg_from_device is a no-op) still runs against
    // the same instance composed into this CharDevice
    let mut msg = vec![1u8, 0];
    msg.extend_from_slice(&1u16.to_le_bytes());
    msg.extend_from_slice(&9u32.to_le_bytes());
    msg.extend_from_slice(&640u32.to_le_bytes());
    msg.extend_from_slice(&480u32.to_le_bytes());
    msg.push(2);

    let mut dev_mut = dev.borrow_mut();
    let stream_dev = dev_mut.hooks_mut();
    stream_dev.port_opened();
    let (_, item) = stream_dev.feed(&msg, &mut event_loop);
    let item = item.expect("expected a StreamCreate event from a complete FORMAT message");
    assert!(matches!(item.kind, PipeItemKind::StreamCreate { width: 640, height: 480, codec: 2, .. }));
}
