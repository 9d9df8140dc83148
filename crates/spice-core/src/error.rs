use thiserror::Error;

/// The error kinds named in the channel/device design: protocol violations,
/// token/credit violations, invariant breaches and migration failures all
/// surface here. Transient I/O (would-block/interrupted) and fatal I/O (peer
/// gone) are intentionally *not* variants of this type — they are
/// represented by `spice_net::ConnState` at the socket layer and never
/// promoted into a `SpiceError`, matching the "not propagated" / "closes the
/// client" handling described for those two kinds.
#[derive(Debug, Error)]
pub enum SpiceError {
    #[error("protocol violation on channel {channel}: {detail}")]
    ProtocolViolation { channel: &'static str, detail: String },

    #[error("token/credit violation for client {client}: {detail}")]
    TokenViolation { client: u64, detail: String },

    /// A should-never-happen condition detected at a typed error site
    /// (rather than via `safe_panic!`/`safe_assert!`, which abort instead of
    /// returning). Kept distinct from `ProtocolViolation` since an invariant
    /// breach is this process's own bug, not a misbehaving peer.
    #[error("invariant breach: {detail}")]
    InvariantBreach { detail: String },

    #[error("migration error: {detail}")]
    MigrationError { detail: String },
}

pub type Result<T> = std::result::Result<T, SpiceError>;
