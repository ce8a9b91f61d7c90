//! # Log Client
//!
//! The emitter side of the fabric. `tolog` enqueues without blocking and a
//! background send loop ships the frames; a second background task
//! demultiplexes server replies back to per-log completion handles.
//!
//! A log that asks for an acknowledgement returns an [`AckHandle`] the
//! caller can await; the handle resolves `Success` when the lander's
//! write-confirmation comes back, `Failed` when the connection is torn
//! down first, and `TimedOut` when `disconnect`'s grace window closes with
//! the acknowledgement still outstanding.

use crate::defaults;
use crate::protocol::{self, FrameHead, LogFrame, LogLevel, ProtocolError, MAX_LOG_BYTES};
use crate::queue::AtomicQueue;
use crate::table::SharedTable;
use crate::utils::{fingerprint, now_secs, tune_stream, PollBackoff};
use anyhow::{bail, Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Terminal state of an acknowledged log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    /// The lander persisted the record and its confirmation came back.
    Success,
    /// The connection failed (or was never up) before the log was
    /// confirmed.
    Failed,
    /// `disconnect` gave up waiting for the confirmation.
    TimedOut,
}

/// Resolution delivered through an [`AckHandle`].
#[derive(Debug, Clone)]
pub struct Ack {
    pub status: AckStatus,
    /// Reply text relayed from the lander; empty unless the lander
    /// attached one.
    pub message: String,
}

impl Ack {
    fn terminal(status: AckStatus) -> Self {
        Ack {
            status,
            message: String::new(),
        }
    }
}

/// Completion handle for a log sent with [`LogClient::tolog_with_ack`].
pub struct AckHandle {
    rx: oneshot::Receiver<Ack>,
}

impl AckHandle {
    /// Wait for the log's terminal state.
    pub async fn wait(self) -> Ack {
        self.rx
            .await
            .unwrap_or_else(|_| Ack::terminal(AckStatus::Failed))
    }
}

struct PrintRequest {
    time: u32,
    level: LogLevel,
    content: Vec<u8>,
    ack: Option<oneshot::Sender<Ack>>,
}

struct ClientShared {
    connected: AtomicBool,
    send_queue: AtomicQueue<PrintRequest>,
    pending: SharedTable<u32, oneshot::Sender<Ack>>,
    /// Tells the send loop to stop accepting work and drain out.
    sender_stop: CancellationToken,
    /// Cancelled only when the transport has failed; unblocks the
    /// reply monitor.
    failed: CancellationToken,
}

impl ClientShared {
    fn new() -> Self {
        ClientShared {
            connected: AtomicBool::new(false),
            send_queue: AtomicQueue::default(),
            pending: SharedTable::new(),
            sender_stop: CancellationToken::new(),
            failed: CancellationToken::new(),
        }
    }

    /// Declare the connection dead: resolve everything queued or pending
    /// as `Failed` and wake both background tasks.
    fn declare_failed(&self) {
        while let Some(request) = self.send_queue.try_pop() {
            if let Some(tx) = request.ack {
                let _ = tx.send(Ack::terminal(AckStatus::Failed));
            }
        }
        for (_, tx) in self.pending.take_all() {
            let _ = tx.send(Ack::terminal(AckStatus::Failed));
        }
        self.connected.store(false, Ordering::SeqCst);
        self.sender_stop.cancel();
        self.failed.cancel();
    }
}

/// Emitter endpoint; one TCP session to the relay server.
pub struct LogClient {
    shared: Arc<ClientShared>,
    writer: Option<Arc<Mutex<OwnedWriteHalf>>>,
    send_task: Option<JoinHandle<()>>,
    monitor_task: Option<JoinHandle<()>>,
}

impl LogClient {
    /// Construct disconnected; `tolog` calls are discarded until
    /// [`connect`](LogClient::connect) succeeds.
    pub fn new() -> Self {
        LogClient {
            shared: Arc::new(ClientShared::new()),
            writer: None,
            send_task: None,
            monitor_task: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Dial the relay server and authorize as a client.
    ///
    /// On success two background tasks are running: the send loop and the
    /// reply monitor. On any failure the socket is closed (with a
    /// best-effort `close_head`) and no background state remains.
    pub async fn connect(&mut self, host: &str, port: u16) -> Result<()> {
        if self.is_connected() {
            bail!("client is already connected");
        }

        let addr = format!("{host}:{port}");
        let stream = TcpStream::connect(&addr)
            .await
            .with_context(|| format!("cannot connect to relay server at {addr}"))?;
        if let Err(e) = tune_stream(&stream, defaults::SOCKET_BUFFER_BYTES) {
            debug!("socket tuning failed: {e}");
        }
        let (mut reader, mut writer) = stream.into_split();

        writer
            .write_all(&FrameHead::AuthorizeInfo.bare())
            .await
            .context("writing authorize_info failed")?;
        let handshake = timeout(
            defaults::HANDSHAKE_TIMEOUT,
            protocol::expect_head(&mut reader, FrameHead::AuthorizeRet),
        )
        .await;
        match handshake {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = writer.write_all(&FrameHead::CloseHead.bare()).await;
                return Err(e).context("remote peer is not a relay server");
            }
            Err(_) => {
                let _ = writer.write_all(&FrameHead::CloseHead.bare()).await;
                bail!("handshake with {addr} timed out");
            }
        }

        let shared = Arc::new(ClientShared::new());
        shared.connected.store(true, Ordering::SeqCst);
        let writer = Arc::new(Mutex::new(writer));

        let send_task = tokio::spawn(send_loop(Arc::clone(&shared), Arc::clone(&writer)));
        let monitor_task = tokio::spawn(monitor_replies(Arc::clone(&shared), reader));

        self.shared = shared;
        self.writer = Some(writer);
        self.send_task = Some(send_task);
        self.monitor_task = Some(monitor_task);
        info!("connected to relay server at {addr}");
        Ok(())
    }

    /// Queue a log for transmission. Non-blocking; silently discarded
    /// when disconnected.
    pub fn tolog(&self, content: impl Into<Vec<u8>>, level: LogLevel) {
        if !self.is_connected() {
            debug!("not connected; log discarded");
            return;
        }
        self.shared.send_queue.push(PrintRequest {
            time: now_secs(),
            level,
            content: content.into(),
            ack: None,
        });
    }

    /// Queue a log that requests a write acknowledgement from the lander.
    ///
    /// The returned handle resolves exactly once. When disconnected it
    /// resolves immediately as `Failed`.
    pub fn tolog_with_ack(&self, content: impl Into<Vec<u8>>, level: LogLevel) -> AckHandle {
        let (tx, rx) = oneshot::channel();
        if !self.is_connected() {
            debug!("not connected; log discarded");
            let _ = tx.send(Ack::terminal(AckStatus::Failed));
            return AckHandle { rx };
        }
        self.shared.send_queue.push(PrintRequest {
            time: now_secs(),
            level,
            content: content.into(),
            ack: Some(tx),
        });
        AckHandle { rx }
    }

    /// Drain outstanding work, then close the session gracefully.
    ///
    /// Waits for the send queue to empty, gives pending acknowledgements
    /// a bounded grace window (resolving stragglers as `TimedOut`), sends
    /// `close_head` and waits for the server's `close_ret`.
    pub async fn disconnect(&mut self) {
        if !self.is_connected() {
            return;
        }

        let mut patience = 0u32;
        while !self.shared.send_queue.is_empty() {
            patience += 1;
            if patience % 30 == 0 {
                info!(
                    "still draining the send queue ({} logs left)",
                    self.shared.send_queue.len()
                );
            }
            sleep(defaults::DRAIN_POLL_INTERVAL).await;
        }

        self.shared.sender_stop.cancel();
        if let Some(task) = self.send_task.take() {
            let _ = task.await;
        }

        let mut grace = 0u32;
        while !self.shared.pending.is_empty() && grace < defaults::ACK_GRACE_POLLS {
            grace += 1;
            sleep(defaults::DRAIN_POLL_INTERVAL).await;
        }
        let stragglers = self.shared.pending.take_all();
        if !stragglers.is_empty() {
            warn!(
                "{} acknowledgements still outstanding after the grace window; closing anyway",
                stragglers.len()
            );
            for (_, tx) in stragglers {
                let _ = tx.send(Ack::terminal(AckStatus::TimedOut));
            }
        }

        if let Some(writer) = self.writer.take() {
            let mut writer = writer.lock().await;
            if let Err(e) = writer.write_all(&FrameHead::CloseHead.bare()).await {
                debug!("writing close_head failed: {e}");
            }
        }

        if let Some(mut task) = self.monitor_task.take() {
            if timeout(defaults::CLOSE_REPLY_TIMEOUT, &mut task).await.is_err() {
                warn!("no close_ret from the server; dropping the connection");
                task.abort();
            }
        }

        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.failed.cancel();
        info!("disconnected from relay server");
    }
}

impl Default for LogClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Pop print requests and ship them as log frames.
///
/// The pending completion is registered *before* the frame is written so
/// a reply racing the write still finds it.
async fn send_loop(shared: Arc<ClientShared>, writer: Arc<Mutex<OwnedWriteHalf>>) {
    let mut backoff = PollBackoff::new();
    loop {
        let request = match shared.send_queue.try_pop() {
            Some(request) => request,
            None => {
                if shared.sender_stop.is_cancelled() {
                    break;
                }
                backoff.idle().await;
                continue;
            }
        };
        backoff.reset();

        if request.content.len() > MAX_LOG_BYTES {
            warn!(
                "log of {} bytes exceeds the {MAX_LOG_BYTES}-byte limit; dropped",
                request.content.len()
            );
            if let Some(tx) = request.ack {
                let _ = tx.send(Ack::terminal(AckStatus::Failed));
            }
            continue;
        }

        let print_id = fingerprint(&request.content);
        let frame = LogFrame {
            time: request.time,
            level: request.level,
            fingerprint: print_id,
            content: request.content,
            need_reply: request.ack.is_some(),
        };
        if let Some(tx) = request.ack {
            shared.pending.insert(print_id, tx);
        }
        debug!("sending log, fingerprint {print_id}");

        let bytes = frame.encode();
        let mut writer = writer.lock().await;
        let wrote = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        }
        .await;
        drop(writer);
        if let Err(e) = wrote {
            error!("writing a log frame failed: {e}; declaring the connection dead");
            shared.declare_failed();
            break;
        }
    }
}

/// Read server frames and resolve pending acknowledgements.
async fn monitor_replies(shared: Arc<ClientShared>, mut reader: OwnedReadHalf) {
    loop {
        let head = tokio::select! {
            _ = shared.failed.cancelled() => break,
            head = protocol::read_head(&mut reader) => head,
        };
        match head {
            Ok(FrameHead::LogReceiveSuccess) => match protocol::read_reply_body(&mut reader).await
            {
                Ok(reply) => {
                    debug!("reply for fingerprint {}", reply.fingerprint);
                    match shared.pending.remove(&reply.fingerprint) {
                        Some(tx) => {
                            let _ = tx.send(Ack {
                                status: AckStatus::Success,
                                message: String::from_utf8_lossy(&reply.message).into_owned(),
                            });
                        }
                        None => {
                            debug!(
                                "no pending acknowledgement for fingerprint {}",
                                reply.fingerprint
                            );
                        }
                    }
                }
                Err(e) => {
                    error!("malformed reply frame: {e}");
                    shared.declare_failed();
                    break;
                }
            },
            Ok(FrameHead::CloseRet) => {
                info!("server acknowledged the close");
                break;
            }
            Ok(other) => {
                warn!("unexpected frame {other} from the server; skipped");
            }
            Err(ProtocolError::UnknownHead(raw)) => {
                warn!("undefined reply head {raw} from the server");
            }
            Err(e) => {
                debug!("reply stream ended: {e}");
                shared.declare_failed();
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disconnected_client_discards_and_fails_fast() {
        let mut client = LogClient::new();
        client.tolog("dropped", LogLevel::Info);
        let ack = client.tolog_with_ack("also dropped", LogLevel::Error).wait().await;
        assert_eq!(ack.status, AckStatus::Failed);
        client.disconnect().await;
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn connect_refuses_a_wrong_speaker() {
        // A listener that answers the authorize with garbage.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            use tokio::io::AsyncReadExt;
            let _ = socket.read_u16().await;
            let _ = socket.write_u16(4242).await;
        });

        let mut client = LogClient::new();
        let err = client.connect("127.0.0.1", addr.port()).await;
        assert!(err.is_err());
        assert!(!client.is_connected());
    }
}
