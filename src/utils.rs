//! # Shared Helpers
//!
//! Fingerprint derivation, socket tuning and the idle-poll backoff shared
//! by every worker loop in the system.

use socket2::SockRef;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::sleep;

const FINGERPRINT_SEED: u32 = 19299;

static NEXT_STAMP: AtomicU32 = AtomicU32::new(1);

/// Derive the 32-bit fingerprint that correlates a log with its reply.
///
/// A multiply-accumulate hash of the content, offset by a process-wide
/// monotonic stamp so two logs with identical content emitted back to
/// back still get distinct fingerprints. Collisions between concurrent
/// processes remain possible; the reply correlation tolerates them by
/// letting the loser's acknowledgement go unmatched.
pub fn fingerprint(content: &[u8]) -> u32 {
    let mut hash: u32 = 1;
    for &byte in content {
        hash = hash
            .wrapping_mul(FINGERPRINT_SEED)
            .wrapping_mul(byte as u32)
            .wrapping_add(byte as u32);
    }
    let stamp = NEXT_STAMP.fetch_add(1, Ordering::Relaxed);
    hash.wrapping_add(stamp.wrapping_mul(FINGERPRINT_SEED))
}

/// Current UTC time in whole seconds, as carried in log frames.
pub fn now_secs() -> u32 {
    chrono::Utc::now().timestamp() as u32
}

/// Configure a stream for small-frame traffic: no Nagle delay and
/// matching kernel buffer sizes.
pub fn tune_stream(stream: &TcpStream, buffer_size: usize) -> io::Result<()> {
    let socket = SockRef::from(stream);
    socket.set_nodelay(true)?;
    socket.set_recv_buffer_size(buffer_size)?;
    socket.set_send_buffer_size(buffer_size)?;
    Ok(())
}

const EMPTY_DRAWS_BEFORE_COARSE: u32 = 20;
const SHORT_POLL_SLEEP: Duration = Duration::from_millis(5);
const COARSE_POLL_SLEEP: Duration = Duration::from_millis(200);

/// Sleep policy for queue-draining loops: short naps for the first ~20
/// empty draws, then a coarse 200 ms sleep until work shows up again.
pub struct PollBackoff {
    empty_draws: u32,
}

impl PollBackoff {
    pub fn new() -> Self {
        PollBackoff { empty_draws: 0 }
    }

    /// Record a successful draw.
    pub fn reset(&mut self) {
        self.empty_draws = 0;
    }

    /// Record an empty draw and sleep accordingly.
    pub async fn idle(&mut self) {
        self.empty_draws = self.empty_draws.saturating_add(1);
        if self.empty_draws >= EMPTY_DRAWS_BEFORE_COARSE {
            sleep(COARSE_POLL_SLEEP).await;
        } else {
            sleep(SHORT_POLL_SLEEP).await;
        }
    }
}

impl Default for PollBackoff {
    fn default() -> Self {
        Self::new()
    }
}
