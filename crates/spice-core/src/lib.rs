//! Character-device flow-control and channel-dispatch core of a remote
//! desktop protocol server: the cross-thread dispatcher, per-channel client
//! state machines, the streaming-device protocol parser, and the
//! token-based credit scheme coupling guest devices to clients.

pub mod channel;
pub mod char_device;
pub mod dispatcher;
pub mod error;
pub mod event_loop;
pub mod main_dispatcher;
pub mod smartcard;
pub mod stream_device;
pub mod types;
pub mod vmc;

pub use error::{Result, SpiceError};
pub use event_loop::{EventLoop, TimerHandle, WatchHandle};
