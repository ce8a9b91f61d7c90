//! # Lander Ingest Engine
//!
//! The storage agent. A lander dials the relay server, announces itself,
//! and then runs four workers against the session:
//!
//! 1. **monitor**: reads frames and fans them out to the queues;
//! 2. **print worker**: persists each log to the dated file and gates
//!    the acknowledgement on the pending-ack set;
//! 3. **search worker**: scans the dated file for search requests;
//! 4. **send worker**: writes every outbound frame.
//!
//! Shutdown order is load-bearing: stop the inbound side first (so the
//! server stops sending), drain the disk workers, then stop the outbound
//! side, and only then run the final close exchange. No frame is sent
//! after the peer expects silence and no queued record is dropped.

use crate::defaults;
use crate::protocol::{
    self, FrameHead, LogLevel, ProtocolError, ReplyFrame, SearchRequest, SearchResults,
};
use crate::queue::AtomicQueue;
use crate::record::{self, RECORD_TAIL_TAG};
use crate::table::SharedTable;
use crate::utils::{tune_stream, PollBackoff};
use anyhow::{bail, Context, Result};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A log as parsed off the wire, queued for persistence.
struct StoredLog {
    time: u32,
    level: LogLevel,
    fingerprint: u32,
    content: Vec<u8>,
}

/// Frames owed to the server.
enum Outbound {
    Ack(ReplyFrame),
    Results(SearchResults),
    StopSendLog,
}

/// The dated append-only file plus its parallel read handle, behind the
/// file lock. Appends take the lock shared (the kernel serialises the
/// writes themselves); rotation to a new UTC day takes it exclusive.
struct LogSink {
    dir: PathBuf,
    state: RwLock<SinkState>,
}

struct SinkState {
    date: String,
    writer: File,
    reader: File,
}

impl LogSink {
    fn open(dir: &Path) -> std::io::Result<Self> {
        let date = record::current_date();
        let (writer, reader) = Self::open_dated(dir, &date)?;
        Ok(LogSink {
            dir: dir.to_path_buf(),
            state: RwLock::new(SinkState {
                date,
                writer,
                reader,
            }),
        })
    }

    fn open_dated(dir: &Path, date: &str) -> std::io::Result<(File, File)> {
        let path = record::dated_file_name(dir, date);
        let writer = OpenOptions::new().append(true).create(true).open(&path)?;
        let reader = File::open(&path)?;
        Ok((writer, reader))
    }

    /// Append one framed record and flush it.
    fn append(&self, bytes: &[u8]) -> std::io::Result<()> {
        self.rotate_if_needed()?;
        let state = self.state.read();
        let mut writer = &state.writer;
        writer.write_all(bytes)?;
        writer.flush()
    }

    /// Write a lone tail tag so a scanner can restart after a torn write.
    fn append_tail_marker(&self) -> std::io::Result<()> {
        let state = self.state.read();
        let mut writer = &state.writer;
        writer.write_all(&[RECORD_TAIL_TAG])?;
        writer.flush()
    }

    /// Swap to a new dated file when the UTC day has changed.
    fn rotate_if_needed(&self) -> std::io::Result<()> {
        let today = record::current_date();
        if self.state.read().date == today {
            return Ok(());
        }
        let mut state = self.state.write();
        if state.date == today {
            return Ok(());
        }
        info!("rotating log storage to dated file {today}");
        let (writer, reader) = Self::open_dated(&self.dir, &today)?;
        state.writer = writer;
        state.reader = reader;
        state.date = today;
        Ok(())
    }

    /// Read the current dated file front to back through the parallel
    /// read handle.
    fn snapshot(&self) -> std::io::Result<Vec<u8>> {
        let state = self.state.read();
        let mut reader = &state.reader;
        reader.seek(SeekFrom::Start(0))?;
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}

struct LanderShared {
    print_queue: AtomicQueue<StoredLog>,
    search_queue: AtomicQueue<SearchRequest>,
    send_queue: AtomicQueue<Outbound>,
    /// Fingerprints whose disk-write acknowledgement is still owed.
    pending_acks: SharedTable<u32, ()>,
    /// Cancelled when no further inbound frames may be accepted.
    recv: CancellationToken,
    /// Cancelled when no further outbound frames may be queued.
    send_open: CancellationToken,
    sink: LogSink,
}

struct LanderTasks {
    monitor: JoinHandle<OwnedReadHalf>,
    print: JoinHandle<()>,
    search: JoinHandle<()>,
    send: JoinHandle<OwnedWriteHalf>,
}

/// Storage-agent endpoint; one TCP session to the relay server plus the
/// local dated files under `dir`.
pub struct Lander {
    dir: PathBuf,
    shared: Option<Arc<LanderShared>>,
    tasks: Option<LanderTasks>,
}

impl Lander {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Lander {
            dir: dir.into(),
            shared: None,
            tasks: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_some()
    }

    /// Open today's dated file, dial the relay server, handshake, and
    /// start the four session workers.
    pub async fn connect(&mut self, host: &str, port: u16) -> Result<()> {
        if self.is_connected() {
            bail!("lander is already connected");
        }

        let sink = LogSink::open(&self.dir)
            .with_context(|| format!("cannot open the dated log file under {:?}", self.dir))?;

        let addr = format!("{host}:{port}");
        let stream = TcpStream::connect(&addr)
            .await
            .with_context(|| format!("cannot connect to relay server at {addr}"))?;
        if let Err(e) = tune_stream(&stream, defaults::SOCKET_BUFFER_BYTES) {
            debug!("socket tuning failed: {e}");
        }
        let (mut reader, mut writer) = stream.into_split();

        writer
            .write_all(&FrameHead::HandshakeInfo.bare())
            .await
            .context("writing handshake_info failed")?;
        let handshake = timeout(
            defaults::HANDSHAKE_TIMEOUT,
            protocol::expect_head(&mut reader, FrameHead::HandshakeRet),
        )
        .await;
        match handshake {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = writer.write_all(&FrameHead::CloseWithLander.bare()).await;
                return Err(e).context("remote peer is not a relay server");
            }
            Err(_) => {
                let _ = writer.write_all(&FrameHead::CloseWithLander.bare()).await;
                bail!("handshake with {addr} timed out");
            }
        }

        let shared = Arc::new(LanderShared {
            print_queue: AtomicQueue::default(),
            search_queue: AtomicQueue::default(),
            send_queue: AtomicQueue::default(),
            pending_acks: SharedTable::new(),
            recv: CancellationToken::new(),
            send_open: CancellationToken::new(),
            sink,
        });

        let tasks = LanderTasks {
            monitor: tokio::spawn(monitor(Arc::clone(&shared), reader)),
            print: tokio::spawn(print_worker(Arc::clone(&shared))),
            search: tokio::spawn(search_worker(Arc::clone(&shared))),
            send: tokio::spawn(send_worker(Arc::clone(&shared), writer)),
        };

        self.shared = Some(shared);
        self.tasks = Some(tasks);
        info!("connected to relay server at {addr}");
        Ok(())
    }

    /// Stop the session in the safe order and close the socket.
    pub async fn disconnect(&mut self) {
        let (Some(shared), Some(tasks)) = (self.shared.take(), self.tasks.take()) else {
            return;
        };

        // Ask the server to go quiet, then wait for its confirmation to
        // flip the receive side off. A transport failure cancels the
        // token too, so this wait always terminates.
        shared.send_queue.push(Outbound::StopSendLog);
        info!("asked the server to stop sending; waiting for confirmation");
        shared.recv.cancelled().await;

        let reader = tasks.monitor.await;

        // Disk workers drain their queues before exiting.
        let _ = tasks.print.await;
        let _ = tasks.search.await;

        shared.send_open.cancel();
        let writer = tasks.send.await;

        if let (Ok(mut reader), Ok(mut writer)) = (reader, writer) {
            if writer
                .write_all(&FrameHead::CloseWithLander.bare())
                .await
                .is_ok()
            {
                match timeout(
                    defaults::CLOSE_REPLY_TIMEOUT,
                    protocol::expect_head(&mut reader, FrameHead::CloseWithLanderReply),
                )
                .await
                {
                    Ok(Ok(())) => info!("server confirmed the close"),
                    Ok(Err(e)) => warn!("close exchange got a wrong reply: {e}"),
                    Err(_) => warn!("no close confirmation from the server"),
                }
            }
        }
        info!("lander disconnected");
    }
}

/// Read server frames and dispatch them to the worker queues.
async fn monitor(shared: Arc<LanderShared>, mut reader: OwnedReadHalf) -> OwnedReadHalf {
    loop {
        let head = tokio::select! {
            _ = shared.recv.cancelled() => break,
            head = protocol::read_head(&mut reader) => head,
        };
        match head {
            Ok(head @ (FrameHead::SendLog | FrameHead::SendLogNeedReply)) => {
                let need_reply = head == FrameHead::SendLogNeedReply;
                match protocol::read_log_body(&mut reader, need_reply).await {
                    Ok(frame) => {
                        if shared.recv.is_cancelled() {
                            continue;
                        }
                        // The ack gate must be armed before the log is
                        // visible to the print worker.
                        if need_reply {
                            shared.pending_acks.insert(frame.fingerprint, ());
                        }
                        shared.print_queue.push(StoredLog {
                            time: frame.time,
                            level: frame.level,
                            fingerprint: frame.fingerprint,
                            content: frame.content,
                        });
                    }
                    Err(e) => error!("malformed log frame from the server: {e}"),
                }
            }
            Ok(FrameHead::SearchRequest) => match protocol::read_search_body(&mut reader).await {
                Ok(request) => {
                    if !shared.recv.is_cancelled() {
                        shared.search_queue.push(request);
                    }
                }
                Err(e) => error!("malformed search request: {e}"),
            },
            Ok(FrameHead::StopSendLogReply) => {
                debug!("server confirmed it stopped sending");
                shared.recv.cancel();
                break;
            }
            Ok(FrameHead::CloseWithLanderReply) => {
                error!("close_with_lander_reply arrived while still receiving");
                shared.recv.cancel();
                shared.send_open.cancel();
                break;
            }
            Ok(other) => error!("unsupported frame {other} from the server"),
            Err(ProtocolError::UnknownHead(raw)) => {
                error!("unsupported head {raw} from the server");
            }
            Err(e) => {
                error!("server stream failed: {e}");
                shared.recv.cancel();
                shared.send_open.cancel();
                break;
            }
        }
    }
    reader
}

/// Persist queued logs and emit the gated acknowledgements.
async fn print_worker(shared: Arc<LanderShared>) {
    let mut backoff = PollBackoff::new();
    loop {
        let log = match shared.print_queue.try_pop() {
            Some(log) => log,
            None => {
                if shared.recv.is_cancelled() && shared.print_queue.is_empty() {
                    break;
                }
                backoff.idle().await;
                continue;
            }
        };
        backoff.reset();

        let bytes = record::encode_record(log.time, log.level, &log.content);
        if let Err(e) = shared.sink.append(&bytes) {
            error!("writing a {}-byte record failed: {e}", bytes.len());
            // Keep the stream restartable: force a lone tail tag out.
            let mut tries = 0;
            while tries < 5 {
                match shared.sink.append_tail_marker() {
                    Ok(()) => break,
                    Err(_) => {
                        tries += 1;
                        sleep(Duration::from_millis(20)).await;
                    }
                }
            }
        }

        // Persistence (or its failure handling) precedes the ack; a
        // fingerprint absent from the set means no reply was requested.
        if shared.pending_acks.remove(&log.fingerprint).is_some() {
            shared.send_queue.push(Outbound::Ack(ReplyFrame {
                fingerprint: log.fingerprint,
                message: Vec::new(),
            }));
        }
    }
}

/// Scan the dated file for queued search requests.
async fn search_worker(shared: Arc<LanderShared>) {
    let mut backoff = PollBackoff::new();
    loop {
        let request = match shared.search_queue.try_pop() {
            Some(request) => request,
            None => {
                if shared.recv.is_cancelled() && shared.search_queue.is_empty() {
                    break;
                }
                backoff.idle().await;
                continue;
            }
        };
        backoff.reset();

        let matches = match shared.sink.snapshot() {
            Ok(bytes) => run_search(&bytes, &request),
            Err(e) => {
                error!("reading the dated file for search failed: {e}");
                Vec::new()
            }
        };
        debug!(
            "search {} matched {} records",
            request.fingerprint,
            matches.len()
        );
        shared.send_queue.push(Outbound::Results(SearchResults {
            fingerprint: request.fingerprint,
            matches,
        }));
    }
}

/// Filter the recovered records by level, time window and byte query.
fn run_search(bytes: &[u8], request: &SearchRequest) -> Vec<Vec<u8>> {
    record::scan_records(bytes)
        .into_iter()
        .filter(|r| r.level == request.level)
        .filter(|r| r.time >= request.start_time && r.time <= request.end_time)
        .filter(|r| request.query.is_empty() || contains_subslice(&r.content, &request.query))
        .map(|r| r.content)
        .take(u16::MAX as usize)
        .collect()
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

/// Write every outbound frame to the server.
async fn send_worker(shared: Arc<LanderShared>, mut writer: OwnedWriteHalf) -> OwnedWriteHalf {
    let mut backoff = PollBackoff::new();
    loop {
        let outbound = match shared.send_queue.try_pop() {
            Some(outbound) => outbound,
            None => {
                if shared.send_open.is_cancelled() && shared.send_queue.is_empty() {
                    break;
                }
                backoff.idle().await;
                continue;
            }
        };
        backoff.reset();

        let bytes = match outbound {
            Outbound::Ack(reply) => reply.encode(),
            Outbound::Results(results) => results.encode(),
            Outbound::StopSendLog => FrameHead::StopSendLog.bare().to_vec(),
        };
        let wrote = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = wrote {
            error!("writing to the server failed: {e}");
        }
    }
    writer
}
