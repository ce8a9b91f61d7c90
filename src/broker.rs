//! # Relay Server
//!
//! The control hub of the fabric. One listening socket accepts both peer
//! kinds; a one-frame handshake classifies each connection as a client or
//! a lander, and peer-specific tasks are attached to the socket:
//!
//! - per **client**: a listener that turns log frames into routing
//!   envelopes (and records the reply route first);
//! - per **lander**: a sender draining the shared to-lander queue, plus a
//!   listener handling acknowledgements and lifecycle frames;
//! - one **to-client sender** correlating acknowledgements back to the
//!   originating client by fingerprint.
//!
//! The reply-correlation table is the only state tying an outbound log to
//! a return path; entries are inserted before the log is published to the
//! to-lander queue and consumed by find-and-remove, so a reply can never
//! outrun its route.

use crate::defaults;
use crate::protocol::{self, FrameHead, ProtocolError, ReplyFrame};
use crate::queue::AtomicQueue;
use crate::table::SharedTable;
use crate::utils::{tune_stream, PollBackoff};
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Identifies one accepted connection for the lifetime of the server.
pub type PeerId = u64;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            host: "127.0.0.1".to_string(),
            port: defaults::SERVER_PORT,
        }
    }
}

/// Connected-peer summary for the operator `stat` command.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub clients: Vec<String>,
    pub landers: Vec<String>,
}

struct BrokerState {
    on_listen: CancellationToken,
    next_peer_id: AtomicU64,
    /// In-flight classifier tasks; stop waits for this to reach zero.
    classifiers: AtomicUsize,
    peer_info: SharedTable<PeerId, String>,
    client_writers: SharedTable<PeerId, Arc<Mutex<OwnedWriteHalf>>>,
    client_tasks: SharedTable<PeerId, JoinHandle<()>>,
    /// Per-lander on-send gates; cancelled when the lander asks for
    /// silence (or on forced stop).
    lander_gates: SharedTable<PeerId, CancellationToken>,
    lander_send_tasks: SharedTable<PeerId, JoinHandle<OwnedWriteHalf>>,
    lander_listen_tasks: SharedTable<PeerId, JoinHandle<()>>,
    to_lander: AtomicQueue<protocol::LogFrame>,
    to_client: AtomicQueue<ReplyFrame>,
    /// Reply correlation: fingerprint of a reply-requesting log to the
    /// client that sent it.
    reply_routes: SharedTable<u32, PeerId>,
}

impl BrokerState {
    fn new() -> Self {
        BrokerState {
            on_listen: CancellationToken::new(),
            next_peer_id: AtomicU64::new(1),
            classifiers: AtomicUsize::new(0),
            peer_info: SharedTable::new(),
            client_writers: SharedTable::new(),
            client_tasks: SharedTable::new(),
            lander_gates: SharedTable::new(),
            lander_send_tasks: SharedTable::new(),
            lander_listen_tasks: SharedTable::new(),
            to_lander: AtomicQueue::default(),
            to_client: AtomicQueue::default(),
            reply_routes: SharedTable::new(),
        }
    }
}

/// The routing broker between clients and landers.
pub struct LogServer {
    config: BrokerConfig,
    state: Arc<BrokerState>,
    local_addr: Option<SocketAddr>,
    acceptor: Option<JoinHandle<()>>,
    to_client_task: Option<JoinHandle<()>>,
}

impl LogServer {
    pub fn new(config: BrokerConfig) -> Self {
        LogServer {
            config,
            state: Arc::new(BrokerState::new()),
            local_addr: None,
            acceptor: None,
            to_client_task: None,
        }
    }

    /// Address actually bound, available once [`start`](LogServer::start)
    /// returns; useful when the configured port is 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind the listening socket and launch the acceptor and the
    /// to-client sender.
    pub async fn start(&mut self) -> Result<()> {
        if self.acceptor.is_some() {
            bail!("server is already running");
        }
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("cannot bind the listening socket at {addr}"))?;
        let local_addr = listener.local_addr()?;

        self.state = Arc::new(BrokerState::new());
        self.to_client_task = Some(tokio::spawn(send_to_clients(Arc::clone(&self.state))));
        self.acceptor = Some(tokio::spawn(accept_loop(Arc::clone(&self.state), listener)));
        self.local_addr = Some(local_addr);
        info!("listening on {local_addr}");
        Ok(())
    }

    /// Stop accepting and, peers permitting, shut everything down.
    ///
    /// With `soft` the stop is refused (returns `false`) while any peer
    /// is still registered; the registries are left intact so the
    /// operator can see who is holding things up. Without `soft` every
    /// per-peer task is aborted and all state cleared.
    pub async fn stop(&mut self, soft: bool) -> bool {
        self.state.on_listen.cancel();
        if let Some(task) = self.acceptor.take() {
            let _ = task.await;
        }
        while self.state.classifiers.load(Ordering::SeqCst) != 0 {
            sleep(Duration::from_millis(100)).await;
        }

        if !self.state.peer_info.is_empty() {
            let mut peers = self.state.peer_info.entries();
            peers.sort_by_key(|(id, _)| *id);
            warn!("{} peers have not been closed:", peers.len());
            for (id, info) in &peers {
                warn!("  {id}: {info}");
            }
            if soft {
                return false;
            }

            for (_, task) in self.state.client_tasks.take_all() {
                task.abort();
            }
            for (_, task) in self.state.lander_listen_tasks.take_all() {
                task.abort();
            }
            for (_, gate) in self.state.lander_gates.take_all() {
                gate.cancel();
            }
            for (_, task) in self.state.lander_send_tasks.take_all() {
                task.abort();
            }
            self.state.peer_info.clear();
            self.state.client_writers.clear();
            self.state.reply_routes.clear();
            self.state.to_client.clear();
            self.state.to_lander.clear();
        }

        if let Some(task) = self.to_client_task.take() {
            let _ = task.await;
        }
        info!("server stopped");
        true
    }

    /// Peer summary split by kind.
    pub fn status(&self) -> StatusReport {
        let mut clients = Vec::new();
        let mut landers = Vec::new();
        for (_, info) in self.state.peer_info.entries() {
            if info.starts_with("[Client]") {
                clients.push(info);
            } else {
                landers.push(info);
            }
        }
        StatusReport { clients, landers }
    }
}

/// Accept connections while listening is on; one classifier per socket.
async fn accept_loop(state: Arc<BrokerState>, listener: TcpListener) {
    loop {
        let accepted = tokio::select! {
            _ = state.on_listen.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer_addr)) => {
                if let Err(e) = tune_stream(&stream, defaults::SOCKET_BUFFER_BYTES) {
                    debug!("socket tuning for {peer_addr} failed: {e}");
                }
                state.classifiers.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(classify(Arc::clone(&state), stream, peer_addr));
            }
            Err(e) => {
                warn!("accepting a connection failed: {e}");
                sleep(Duration::from_millis(400)).await;
            }
        }
    }
}

/// Read the one-frame handshake and attach peer-specific tasks.
async fn classify(state: Arc<BrokerState>, stream: TcpStream, peer_addr: SocketAddr) {
    classify_inner(&state, stream, peer_addr).await;
    state.classifiers.fetch_sub(1, Ordering::SeqCst);
}

async fn classify_inner(state: &Arc<BrokerState>, stream: TcpStream, peer_addr: SocketAddr) {
    let (mut reader, mut writer) = stream.into_split();
    let head = match timeout(
        defaults::HANDSHAKE_TIMEOUT,
        protocol::read_head(&mut reader),
    )
    .await
    {
        Ok(Ok(head)) => head,
        Ok(Err(e)) => {
            warn!("handshake from {peer_addr} failed: {e}");
            return;
        }
        Err(_) => {
            warn!("handshake from {peer_addr} timed out");
            return;
        }
    };
    let sockinfo = format!("[IP: {}][PORT: {}]", peer_addr.ip(), peer_addr.port());

    match head {
        FrameHead::AuthorizeInfo => {
            let peer = state.next_peer_id.fetch_add(1, Ordering::Relaxed);
            let writer = Arc::new(Mutex::new(writer));
            state.peer_info.insert(peer, format!("[Client]{sockinfo}"));
            state.client_writers.insert(peer, Arc::clone(&writer));
            let task = tokio::spawn(listen_client(Arc::clone(state), peer, reader));
            state.client_tasks.insert(peer, task);

            let mut writer = writer.lock().await;
            if let Err(e) = writer.write_all(&FrameHead::AuthorizeRet.bare()).await {
                // The listener will observe the broken stream and clean up.
                warn!("sending authorize_ret to {peer_addr} failed: {e}");
            }
            info!("connected to [Client]{sockinfo} as peer {peer}");
        }
        FrameHead::HandshakeInfo => {
            if let Err(e) = writer.write_all(&FrameHead::HandshakeRet.bare()).await {
                warn!("sending handshake_ret to {peer_addr} failed: {e}");
                return;
            }
            let peer = state.next_peer_id.fetch_add(1, Ordering::Relaxed);
            let gate = CancellationToken::new();
            state.peer_info.insert(peer, format!("[Lander]{sockinfo}"));
            state.lander_gates.insert(peer, gate.clone());
            let send_task = tokio::spawn(send_to_lander(Arc::clone(state), gate, writer));
            state.lander_send_tasks.insert(peer, send_task);
            let listen_task = tokio::spawn(listen_lander(Arc::clone(state), peer, reader));
            state.lander_listen_tasks.insert(peer, listen_task);
            info!("connected to [Lander]{sockinfo} as peer {peer}");
        }
        other => {
            warn!("unknown peer type from {peer_addr} (head {other}); closing");
        }
    }
}

/// Per-client listener: logs become routing envelopes, `close_head` runs
/// the graceful goodbye.
async fn listen_client(state: Arc<BrokerState>, peer: PeerId, mut reader: OwnedReadHalf) {
    loop {
        let head = tokio::select! {
            _ = state.on_listen.cancelled() => break,
            head = protocol::read_head(&mut reader) => head,
        };
        match head {
            Ok(head @ (FrameHead::SendLog | FrameHead::SendLogNeedReply)) => {
                let need_reply = head == FrameHead::SendLogNeedReply;
                match protocol::read_log_body(&mut reader, need_reply).await {
                    Ok(frame) => {
                        debug!(
                            "log from client {peer}, fingerprint {}, {} bytes",
                            frame.fingerprint,
                            frame.content.len()
                        );
                        // Route before publish: a reply arriving before
                        // this loop comes back around must find the entry.
                        if need_reply {
                            state.reply_routes.insert(frame.fingerprint, peer);
                        }
                        state.to_lander.push(frame);
                    }
                    Err(e) => error!("malformed log frame from client {peer}: {e}"),
                }
            }
            Ok(FrameHead::CloseHead) => {
                debug!("client {peer} is closing");
                state.peer_info.remove(&peer);
                state.client_tasks.remove(&peer);
                // In-flight replies may still be routing; give them a
                // moment before confirming the close.
                sleep(defaults::CLIENT_CLOSE_DRAIN).await;
                if let Some(writer) = state.client_writers.remove(&peer) {
                    let mut writer = writer.lock().await;
                    let _ = writer.write_all(&FrameHead::CloseRet.bare()).await;
                }
                info!("client {peer} disconnected");
                break;
            }
            Ok(other) => warn!("unsupported frame {other} from client {peer}"),
            Err(ProtocolError::UnknownHead(raw)) => {
                warn!("unsupported head {raw} from client {peer}");
            }
            Err(e) => {
                debug!("client {peer} stream ended: {e}");
                state.peer_info.remove(&peer);
                state.client_writers.remove(&peer);
                state.client_tasks.remove(&peer);
                break;
            }
        }
    }
}

/// The single to-client sender: correlate each reply to its route and
/// deliver it, or drop it silently when the client is gone.
async fn send_to_clients(state: Arc<BrokerState>) {
    let mut backoff = PollBackoff::new();
    loop {
        let reply = match state.to_client.try_pop() {
            Some(reply) => reply,
            None => {
                if state.on_listen.is_cancelled() && state.to_client.is_empty() {
                    break;
                }
                backoff.idle().await;
                continue;
            }
        };
        backoff.reset();

        let Some(peer) = state.reply_routes.remove(&reply.fingerprint) else {
            debug!(
                "no route for fingerprint {}; reply discarded",
                reply.fingerprint
            );
            continue;
        };
        let Some(writer) = state.client_writers.get(&peer) else {
            debug!("client {peer} is gone; reply discarded");
            continue;
        };
        let bytes = reply.encode();
        let mut writer = writer.lock().await;
        match writer.write_all(&bytes).await {
            Ok(()) => {
                let _ = writer.flush().await;
                debug!("delivered reply {} to client {peer}", reply.fingerprint);
            }
            Err(e) => warn!("delivering a reply to client {peer} failed: {e}"),
        }
    }
}

/// Per-lander sender: forward routing envelopes until the lander's send
/// gate closes, then hand the write half back for the lifecycle replies.
async fn send_to_lander(
    state: Arc<BrokerState>,
    gate: CancellationToken,
    mut writer: OwnedWriteHalf,
) -> OwnedWriteHalf {
    let mut backoff = PollBackoff::new();
    loop {
        if gate.is_cancelled() {
            break;
        }
        let frame = match state.to_lander.try_pop() {
            Some(frame) => frame,
            None => {
                if state.on_listen.is_cancelled() && state.to_lander.is_empty() {
                    break;
                }
                backoff.idle().await;
                continue;
            }
        };
        backoff.reset();

        debug!(
            "forwarding log {} ({} bytes) to a lander",
            frame.fingerprint,
            frame.content.len()
        );
        let bytes = frame.encode();
        let wrote = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = wrote {
            error!("forwarding a log to a lander failed: {e}");
        }
    }
    writer
}

/// Per-lander listener: acknowledgements flow to the to-client queue,
/// lifecycle frames run the stop/close exchanges.
async fn listen_lander(state: Arc<BrokerState>, peer: PeerId, mut reader: OwnedReadHalf) {
    // Returned by the sender after the stop exchange; used for the
    // lifecycle replies that must go out on this lander's socket.
    let mut held_writer: Option<OwnedWriteHalf> = None;
    loop {
        let head = tokio::select! {
            _ = state.on_listen.cancelled() => break,
            head = protocol::read_head(&mut reader) => head,
        };
        match head {
            Ok(FrameHead::LogReceiveSuccess) => {
                match protocol::read_reply_body(&mut reader).await {
                    Ok(reply) => {
                        debug!("reply {} from lander {peer}", reply.fingerprint);
                        state.to_client.push(reply);
                    }
                    Err(e) => error!("malformed reply frame from lander {peer}: {e}"),
                }
            }
            Ok(FrameHead::StopSendLog) => {
                debug!("lander {peer} asked for silence");
                if let Some(writer) = reclaim_lander_writer(&state, peer).await {
                    let mut writer = writer;
                    if let Err(e) = writer.write_all(&FrameHead::StopSendLogReply.bare()).await {
                        warn!("sending stop_send_log_reply to lander {peer} failed: {e}");
                    }
                    held_writer = Some(writer);
                }
            }
            Ok(FrameHead::CloseWithLander) => {
                debug!("lander {peer} is closing");
                if held_writer.is_none() {
                    // Close without a preceding stop exchange.
                    held_writer = reclaim_lander_writer(&state, peer).await;
                }
                state.peer_info.remove(&peer);
                state.lander_gates.remove(&peer);
                state.lander_listen_tasks.remove(&peer);
                if let Some(mut writer) = held_writer.take() {
                    let _ = writer
                        .write_all(&FrameHead::CloseWithLanderReply.bare())
                        .await;
                }
                info!("lander {peer} disconnected");
                break;
            }
            Ok(FrameHead::SearchFin) => {
                // Parsed in full to keep the stream in sync; the core has
                // no client-side search route to forward them to.
                match protocol::read_search_results_body(&mut reader).await {
                    Ok(results) => debug!(
                        "search {} from lander {peer} returned {} matches; discarded",
                        results.fingerprint,
                        results.matches.len()
                    ),
                    Err(e) => error!("malformed search results from lander {peer}: {e}"),
                }
            }
            Ok(other) => warn!("unsupported frame {other} from lander {peer}"),
            Err(ProtocolError::UnknownHead(raw)) => {
                warn!("unsupported head {raw} from lander {peer}");
            }
            Err(e) => {
                debug!("lander {peer} stream ended: {e}");
                state.peer_info.remove(&peer);
                if let Some(gate) = state.lander_gates.remove(&peer) {
                    gate.cancel();
                }
                state.lander_send_tasks.remove(&peer);
                state.lander_listen_tasks.remove(&peer);
                break;
            }
        }
    }
}

/// Close a lander's send gate and take its write half back.
async fn reclaim_lander_writer(state: &Arc<BrokerState>, peer: PeerId) -> Option<OwnedWriteHalf> {
    if let Some(gate) = state.lander_gates.get(&peer) {
        gate.cancel();
    }
    match state.lander_send_tasks.remove(&peer) {
        Some(task) => match task.await {
            Ok(writer) => Some(writer),
            Err(e) => {
                error!("the sender task for lander {peer} failed: {e}");
                None
            }
        },
        None => {
            error!("no sender task recorded for lander {peer}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_splits_peers_by_kind() {
        let server = LogServer::new(BrokerConfig::default());
        server
            .state
            .peer_info
            .insert(1, "[Client][IP: 127.0.0.1][PORT: 9000]".to_string());
        server
            .state
            .peer_info
            .insert(2, "[Lander][IP: 127.0.0.1][PORT: 9001]".to_string());
        let report = server.status();
        assert_eq!(report.clients.len(), 1);
        assert_eq!(report.landers.len(), 1);
        assert!(report.landers[0].starts_with("[Lander]"));
    }

    #[tokio::test]
    async fn stop_without_peers_succeeds_softly() {
        let mut server = LogServer::new(BrokerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        });
        server.start().await.unwrap();
        assert!(server.local_addr().is_some());
        assert!(server.stop(true).await);
    }

    #[tokio::test]
    async fn unknown_peer_type_is_dropped() {
        let mut server = LogServer::new(BrokerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        });
        server.start().await.unwrap();
        let addr = server.local_addr().unwrap();

        use tokio::io::AsyncReadExt;
        let mut socket = TcpStream::connect(addr).await.unwrap();
        socket.write_u16(4242).await.unwrap();
        // The server closes without replying; the read sees EOF.
        let mut buf = [0u8; 2];
        let got = socket.read(&mut buf).await.unwrap();
        assert_eq!(got, 0);

        assert!(server.stop(true).await);
    }
}
