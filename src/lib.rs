//! # logrelay
//!
//! A three-tier log-routing broker implemented in Rust. Emitting
//! **clients** open a TCP session to a central relay **server**; the
//! server forwards each log to one of the connected **landers**, which
//! persist it to a dated append-only file and, on request, send back an
//! acknowledgement that is correlated to the originating client by the
//! log's fingerprint.

pub mod broker;
pub mod cli;
pub mod client;
pub mod lander;
pub mod logging;
pub mod protocol;
pub mod queue;
pub mod record;
pub mod table;
pub mod utils;

pub use broker::{BrokerConfig, LogServer, StatusReport};
pub use client::{Ack, AckHandle, AckStatus, LogClient};
pub use lander::Lander;
pub use protocol::{FrameHead, LogLevel};
pub use queue::AtomicQueue;
pub use table::SharedTable;

/// The current crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values shared across the fabric.
pub mod defaults {
    use std::time::Duration;

    /// Default relay server port.
    pub const SERVER_PORT: u16 = 8089;

    /// Kernel send/receive buffer size applied to every stream.
    pub const SOCKET_BUFFER_BYTES: usize = 8192;

    /// How long a peer gets to complete the one-frame handshake.
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

    /// Sleep between polls while draining queues at shutdown.
    pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(400);

    /// Drain polls granted to outstanding acknowledgements before a
    /// client disconnect gives up on them (~6 s in total).
    pub const ACK_GRACE_POLLS: u32 = 15;

    /// Server-side pause between a client's `close_head` and the
    /// `close_ret`, letting in-flight replies route out.
    pub const CLIENT_CLOSE_DRAIN: Duration = Duration::from_secs(3);

    /// How long to wait for the peer's half of a close exchange.
    pub const CLOSE_REPLY_TIMEOUT: Duration = Duration::from_secs(4);
}
