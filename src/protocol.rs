//! # Wire Protocol
//!
//! Every message on the fabric is a frame: a 16-bit head tag followed by a
//! head-specific payload, all multi-byte integers in network byte order.
//! This module owns the head constants, the level encoding, and the
//! encode/decode of every frame body.
//!
//! Encoders always produce one contiguous buffer including the head, so a
//! frame can be committed to the socket with a single `write_all`.
//! Decoders read exact byte counts and validate sizes before allocating.

use std::fmt;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Longest log content accepted anywhere on the fabric, in bytes.
pub const MAX_LOG_BYTES: usize = 10_000;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("i/o failure on the wire: {0}")]
    Io(#[from] io::Error),

    #[error("unknown frame head {0}")]
    UnknownHead(u16),

    #[error("unknown log level {0}")]
    BadLevel(u16),

    #[error("content of {0} bytes exceeds the {MAX_LOG_BYTES}-byte limit")]
    OversizedContent(usize),

    #[error("expected {expected} frame, peer sent {got}")]
    UnexpectedFrame { expected: FrameHead, got: FrameHead },
}

/// The 16-bit head tag opening every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FrameHead {
    // Client to server.
    AuthorizeInfo = 2560,
    CloseHead = 2561,
    SendLog = 2562,
    SendLogNeedReply = 2563,
    // Server to client.
    AuthorizeRet = 9766,
    CloseRet = 9767,
    /// Also travels lander to server, relayed verbatim.
    LogReceiveSuccess = 9768,
    // Lander to server.
    HandshakeInfo = 1101,
    StopSendLog = 1102,
    CloseWithLander = 1103,
    SearchFin = 1104,
    // Server to lander.
    HandshakeRet = 8455,
    SearchRequest = 8457,
    StopSendLogReply = 8458,
    CloseWithLanderReply = 8459,
}

impl FrameHead {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Head-only frame bytes, for the handshake and lifecycle messages
    /// that carry no payload.
    pub fn bare(self) -> [u8; 2] {
        self.as_u16().to_be_bytes()
    }
}

impl TryFrom<u16> for FrameHead {
    type Error = ProtocolError;

    fn try_from(raw: u16) -> Result<Self, ProtocolError> {
        Ok(match raw {
            2560 => FrameHead::AuthorizeInfo,
            2561 => FrameHead::CloseHead,
            2562 => FrameHead::SendLog,
            2563 => FrameHead::SendLogNeedReply,
            9766 => FrameHead::AuthorizeRet,
            9767 => FrameHead::CloseRet,
            9768 => FrameHead::LogReceiveSuccess,
            1101 => FrameHead::HandshakeInfo,
            1102 => FrameHead::StopSendLog,
            1103 => FrameHead::CloseWithLander,
            1104 => FrameHead::SearchFin,
            8455 => FrameHead::HandshakeRet,
            8457 => FrameHead::SearchRequest,
            8458 => FrameHead::StopSendLogReply,
            8459 => FrameHead::CloseWithLanderReply,
            other => return Err(ProtocolError::UnknownHead(other)),
        })
    }
}

impl fmt::Display for FrameHead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.as_u16())
    }
}

/// Severity carried with each log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u16)]
pub enum LogLevel {
    Info = 0,
    Debug = 1,
    Warning = 2,
    Error = 3,
}

impl LogLevel {
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for LogLevel {
    type Error = ProtocolError;

    fn try_from(raw: u16) -> Result<Self, ProtocolError> {
        Ok(match raw {
            0 => LogLevel::Info,
            1 => LogLevel::Debug,
            2 => LogLevel::Warning,
            3 => LogLevel::Error,
            other => return Err(ProtocolError::BadLevel(other)),
        })
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        };
        f.write_str(name)
    }
}

/// A log travelling client → server → lander.
///
/// Payload layout after the head:
/// `time:u32, level:u16, fingerprint:u32, size:u16, content[size]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFrame {
    /// Originator-assigned UTC seconds.
    pub time: u32,
    pub level: LogLevel,
    pub fingerprint: u32,
    pub content: Vec<u8>,
    /// Selects the `send_log_need_reply` head over `send_log`.
    pub need_reply: bool,
}

impl LogFrame {
    pub fn head(&self) -> FrameHead {
        if self.need_reply {
            FrameHead::SendLogNeedReply
        } else {
            FrameHead::SendLog
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(14 + self.content.len());
        buf.extend_from_slice(&self.head().bare());
        buf.extend_from_slice(&self.time.to_be_bytes());
        buf.extend_from_slice(&self.level.as_u16().to_be_bytes());
        buf.extend_from_slice(&self.fingerprint.to_be_bytes());
        buf.extend_from_slice(&(self.content.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.content);
        buf
    }
}

/// Read a log frame body; the head was already consumed by the caller's
/// dispatch and arrives as `need_reply`.
pub async fn read_log_body<R>(reader: &mut R, need_reply: bool) -> Result<LogFrame, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let time = reader.read_u32().await?;
    let level = LogLevel::try_from(reader.read_u16().await?)?;
    let fingerprint = reader.read_u32().await?;
    let size = reader.read_u16().await? as usize;
    if size > MAX_LOG_BYTES {
        return Err(ProtocolError::OversizedContent(size));
    }
    let mut content = vec![0u8; size];
    reader.read_exact(&mut content).await?;
    Ok(LogFrame {
        time,
        level,
        fingerprint,
        content,
        need_reply,
    })
}

/// The write acknowledgement relayed lander → server → client.
///
/// Payload layout after the head: `fingerprint:u32, size:u16, msg[size]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyFrame {
    pub fingerprint: u32,
    pub message: Vec<u8>,
}

impl ReplyFrame {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.message.len());
        buf.extend_from_slice(&FrameHead::LogReceiveSuccess.bare());
        buf.extend_from_slice(&self.fingerprint.to_be_bytes());
        buf.extend_from_slice(&(self.message.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.message);
        buf
    }
}

pub async fn read_reply_body<R>(reader: &mut R) -> Result<ReplyFrame, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let fingerprint = reader.read_u32().await?;
    let size = reader.read_u16().await? as usize;
    let mut message = vec![0u8; size];
    reader.read_exact(&mut message).await?;
    Ok(ReplyFrame {
        fingerprint,
        message,
    })
}

/// A search job travelling server → lander.
///
/// Payload layout after the head:
/// `level:u16, fingerprint:u32, start:u32, end:u32, size:u16, query[size]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub level: LogLevel,
    pub fingerprint: u32,
    pub start_time: u32,
    pub end_time: u32,
    pub query: Vec<u8>,
}

impl SearchRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(18 + self.query.len());
        buf.extend_from_slice(&FrameHead::SearchRequest.bare());
        buf.extend_from_slice(&self.level.as_u16().to_be_bytes());
        buf.extend_from_slice(&self.fingerprint.to_be_bytes());
        buf.extend_from_slice(&self.start_time.to_be_bytes());
        buf.extend_from_slice(&self.end_time.to_be_bytes());
        buf.extend_from_slice(&(self.query.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.query);
        buf
    }
}

pub async fn read_search_body<R>(reader: &mut R) -> Result<SearchRequest, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let level = LogLevel::try_from(reader.read_u16().await?)?;
    let fingerprint = reader.read_u32().await?;
    let start_time = reader.read_u32().await?;
    let end_time = reader.read_u32().await?;
    let size = reader.read_u16().await? as usize;
    if size > MAX_LOG_BYTES {
        return Err(ProtocolError::OversizedContent(size));
    }
    let mut query = vec![0u8; size];
    reader.read_exact(&mut query).await?;
    Ok(SearchRequest {
        level,
        fingerprint,
        start_time,
        end_time,
        query,
    })
}

/// Search results travelling lander → server.
///
/// Payload layout after the head:
/// `fingerprint:u32, n:u16, n × (size:u16, bytes[size])`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResults {
    pub fingerprint: u32,
    pub matches: Vec<Vec<u8>>,
}

impl SearchResults {
    pub fn encode(&self) -> Vec<u8> {
        let body: usize = self.matches.iter().map(|m| 2 + m.len()).sum();
        let mut buf = Vec::with_capacity(8 + body);
        buf.extend_from_slice(&FrameHead::SearchFin.bare());
        buf.extend_from_slice(&self.fingerprint.to_be_bytes());
        buf.extend_from_slice(&(self.matches.len() as u16).to_be_bytes());
        for entry in &self.matches {
            buf.extend_from_slice(&(entry.len() as u16).to_be_bytes());
            buf.extend_from_slice(entry);
        }
        buf
    }
}

pub async fn read_search_results_body<R>(reader: &mut R) -> Result<SearchResults, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let fingerprint = reader.read_u32().await?;
    let count = reader.read_u16().await? as usize;
    let mut matches = Vec::with_capacity(count);
    for _ in 0..count {
        let size = reader.read_u16().await? as usize;
        let mut entry = vec![0u8; size];
        reader.read_exact(&mut entry).await?;
        matches.push(entry);
    }
    Ok(SearchResults {
        fingerprint,
        matches,
    })
}

/// Read and decode the next frame head.
pub async fn read_head<R>(reader: &mut R) -> Result<FrameHead, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    FrameHead::try_from(reader.read_u16().await?)
}

/// Read a head and require it to be `expected`; used by the handshakes
/// and the final close exchanges.
pub async fn expect_head<R>(reader: &mut R, expected: FrameHead) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let got = read_head(reader).await?;
    if got != expected {
        return Err(ProtocolError::UnexpectedFrame { expected, got });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_frame_layout_matches_the_wire_format() {
        let frame = LogFrame {
            time: 0x0102_0304,
            level: LogLevel::Warning,
            fingerprint: 0xDEAD_BEEF,
            content: b"hello".to_vec(),
            need_reply: false,
        };
        let bytes = frame.encode();
        let mut expected = vec![
            0x0A, 0x02, // head 2562
            0x01, 0x02, 0x03, 0x04, // time
            0x00, 0x02, // level warning
            0xDE, 0xAD, 0xBE, 0xEF, // fingerprint
            0x00, 0x05, // size
        ];
        expected.extend_from_slice(b"hello");
        assert_eq!(bytes, expected);

        let mut body = &bytes[2..];
        let decoded = read_log_body(&mut body, false).await.unwrap();
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn need_reply_selects_the_other_head() {
        let frame = LogFrame {
            time: 1,
            level: LogLevel::Info,
            fingerprint: 2,
            content: Vec::new(),
            need_reply: true,
        };
        assert_eq!(&frame.encode()[..2], &2563u16.to_be_bytes());
    }

    #[tokio::test]
    async fn reply_frame_round_trips() {
        let frame = ReplyFrame {
            fingerprint: 77,
            message: b"stored".to_vec(),
        };
        let bytes = frame.encode();
        assert_eq!(&bytes[..2], &9768u16.to_be_bytes());
        let mut body = &bytes[2..];
        assert_eq!(read_reply_body(&mut body).await.unwrap(), frame);
    }

    #[tokio::test]
    async fn search_frames_round_trip() {
        let request = SearchRequest {
            level: LogLevel::Error,
            fingerprint: 9,
            start_time: 100,
            end_time: 200,
            query: b"disk".to_vec(),
        };
        let bytes = request.encode();
        let mut body = &bytes[2..];
        assert_eq!(read_search_body(&mut body).await.unwrap(), request);

        let results = SearchResults {
            fingerprint: 9,
            matches: vec![b"disk full".to_vec(), b"disk ok".to_vec()],
        };
        let bytes = results.encode();
        assert_eq!(&bytes[..2], &1104u16.to_be_bytes());
        let mut body = &bytes[2..];
        assert_eq!(read_search_results_body(&mut body).await.unwrap(), results);
    }

    #[tokio::test]
    async fn oversized_content_is_rejected_before_allocation() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.extend_from_slice(&0u16.to_be_bytes());
        bytes.extend_from_slice(&2u32.to_be_bytes());
        bytes.extend_from_slice(&u16::MAX.to_be_bytes());
        let mut body = &bytes[..];
        match read_log_body(&mut body, false).await {
            Err(ProtocolError::OversizedContent(n)) => assert_eq!(n, u16::MAX as usize),
            other => panic!("expected oversize rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_head_is_reported() {
        let bytes = 4242u16.to_be_bytes();
        let mut reader = &bytes[..];
        match read_head(&mut reader).await {
            Err(ProtocolError::UnknownHead(4242)) => {}
            other => panic!("expected unknown head, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn expect_head_flags_a_mismatch() {
        let bytes = FrameHead::CloseRet.bare();
        let mut reader = &bytes[..];
        match expect_head(&mut reader, FrameHead::AuthorizeRet).await {
            Err(ProtocolError::UnexpectedFrame { expected, got }) => {
                assert_eq!(expected, FrameHead::AuthorizeRet);
                assert_eq!(got, FrameHead::CloseRet);
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
    }
}
