//! Wire-level pieces of the streaming replication protocol.
//!
//! Regular backend messages are parsed by `postgres-protocol`; this module
//! adds the framing loop, the CopyBothResponse that crate does not know
//! about, and the CopyData sub-protocol used once streaming has started:
//!
//! * `w` XLogData: `start u64, end u64, server time i64, payload`
//! * `k` primary keepalive: `wal end u64, server time i64, reply u8`
//! * `r` standby status update (sent by us): `write u64, flush u64,
//!   apply u64, client time i64, reply u8`

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};
use fallible_iterator::FallibleIterator;
use postgres_protocol::message::backend::{self, ErrorResponseBody, NoticeResponseBody};
use postgres_protocol::message::frontend;
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

use super::types::{LogPosition, WalMessage};
use crate::{Error, Result};

/// Microseconds between the Unix epoch and the PostgreSQL epoch (2000-01-01).
pub const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

const XLOG_DATA_HEADER_LEN: usize = 24;
const KEEPALIVE_LEN: usize = 17;

pub fn pg_time_to_utc(micros: i64) -> DateTime<Utc> {
    micros
        .checked_add(PG_EPOCH_OFFSET_MICROS)
        .and_then(|unix| Utc.timestamp_micros(unix).single())
        .unwrap_or_default()
}

pub fn utc_to_pg_time(time: DateTime<Utc>) -> i64 {
    time.timestamp_micros() - PG_EPOCH_OFFSET_MICROS
}

/// A message received from the server.
pub enum BackendFrame {
    /// `W`: the server entered CopyBoth mode.
    CopyBothResponse,
    Message(backend::Message),
}

// `backend::Message` has no Debug impl; only the variant is printed.
impl fmt::Debug for BackendFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendFrame::CopyBothResponse => f.write_str("CopyBothResponse"),
            BackendFrame::Message(_) => f.write_str("Message(..)"),
        }
    }
}

/// Buffered, cancel-safe reader of backend frames.
///
/// Bytes read from the socket stay in the internal buffer until a complete
/// frame is available, so dropping a pending `next_frame` future (for
/// example in a `select!`) never loses data.
pub struct MessageReader<R> {
    io: R,
    buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(io: R) -> Self {
        Self {
            io,
            buffer: BytesMut::with_capacity(8192),
        }
    }

    pub async fn next_frame(&mut self) -> Result<BackendFrame> {
        loop {
            if let Some(frame) = self.parse_frame()? {
                return Ok(frame);
            }
            let read = self.io.read_buf(&mut self.buffer).await?;
            if read == 0 {
                return Err(Error::Connection(
                    "server closed the connection".to_string(),
                ));
            }
        }
    }

    /// Like [`next_frame`](Self::next_frame) but for phases where CopyBoth
    /// cannot legitimately appear.
    pub async fn next_message(&mut self) -> Result<backend::Message> {
        match self.next_frame().await? {
            BackendFrame::Message(message) => Ok(message),
            BackendFrame::CopyBothResponse => Err(Error::Protocol(
                "unexpected CopyBothResponse".to_string(),
            )),
        }
    }

    fn parse_frame(&mut self) -> Result<Option<BackendFrame>> {
        if self.buffer.len() < 5 {
            return Ok(None);
        }

        let tag = self.buffer[0];
        let len = i32::from_be_bytes([
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
            self.buffer[4],
        ]);
        if len < 4 {
            return Err(Error::Protocol(format!(
                "invalid length {} for message '{}'",
                len, tag as char
            )));
        }

        let total = len as usize + 1;
        if self.buffer.len() < total {
            self.buffer.reserve(total - self.buffer.len());
            return Ok(None);
        }

        if tag == b'W' {
            self.buffer.advance(total);
            return Ok(Some(BackendFrame::CopyBothResponse));
        }

        match backend::Message::parse(&mut self.buffer) {
            Ok(Some(message)) => Ok(Some(BackendFrame::Message(message))),
            Ok(None) => Ok(None),
            Err(e) => Err(Error::Protocol(format!(
                "malformed message '{}': {}",
                tag as char, e
            ))),
        }
    }
}

pub async fn write_all<W: AsyncWrite + Unpin>(io: &mut W, buf: &[u8]) -> Result<()> {
    io.write_all(buf).await?;
    io.flush().await?;
    Ok(())
}

/// Payload of a CopyData message received while streaming.
#[derive(Debug, Clone, PartialEq)]
pub enum CopyDataMessage {
    XLogData(WalMessage),
    PrimaryKeepalive {
        wal_end: LogPosition,
        server_time: DateTime<Utc>,
        reply_requested: bool,
    },
}

pub fn parse_copy_data(mut data: Bytes) -> Result<CopyDataMessage> {
    if data.is_empty() {
        return Err(Error::Protocol("empty CopyData message".to_string()));
    }

    let tag = data.get_u8();
    match tag {
        b'w' => {
            if data.remaining() < XLOG_DATA_HEADER_LEN {
                return Err(Error::Protocol(format!(
                    "XLogData header needs {} bytes, got {}",
                    XLOG_DATA_HEADER_LEN,
                    data.remaining()
                )));
            }
            let wal_start = LogPosition::new(data.get_u64());
            let wal_end = LogPosition::new(data.get_u64());
            let server_time = pg_time_to_utc(data.get_i64());
            Ok(CopyDataMessage::XLogData(WalMessage {
                wal_start,
                wal_end,
                server_time,
                data,
            }))
        }
        b'k' => {
            if data.remaining() < KEEPALIVE_LEN {
                return Err(Error::Protocol(format!(
                    "keepalive needs {} bytes, got {}",
                    KEEPALIVE_LEN,
                    data.remaining()
                )));
            }
            let wal_end = LogPosition::new(data.get_u64());
            let server_time = pg_time_to_utc(data.get_i64());
            let reply_requested = data.get_u8() != 0;
            Ok(CopyDataMessage::PrimaryKeepalive {
                wal_end,
                server_time,
                reply_requested,
            })
        }
        other => Err(Error::Protocol(format!(
            "unknown CopyData message '{}'",
            other as char
        ))),
    }
}

/// Encodes a standby status update wrapped in a CopyData frame.
pub fn encode_status_update(
    write: LogPosition,
    flush: LogPosition,
    apply: LogPosition,
    now: DateTime<Utc>,
    reply_requested: bool,
    out: &mut BytesMut,
) -> Result<()> {
    let mut payload = BytesMut::with_capacity(34);
    payload.put_u8(b'r');
    payload.put_u64(write.as_u64());
    payload.put_u64(flush.as_u64());
    payload.put_u64(apply.as_u64());
    payload.put_i64(utc_to_pg_time(now));
    payload.put_u8(reply_requested as u8);

    frontend::CopyData::new(payload.freeze())?.write(out);
    Ok(())
}

/// Converts an ErrorResponse into [`Error::Server`].
pub fn server_error(body: &ErrorResponseBody) -> Error {
    let (code, message) = error_fields(body.fields());
    Error::Server { code, message }
}

pub fn log_notice(body: &NoticeResponseBody) {
    let (code, message) = error_fields(body.fields());
    warn!(code = %code, "Server notice: {}", message);
}

fn error_fields(mut fields: backend::ErrorFields<'_>) -> (String, String) {
    let mut code = String::new();
    let mut message = String::new();
    while let Ok(Some(field)) = fields.next() {
        match field.type_() {
            b'C' => code = String::from_utf8_lossy(field.value_bytes()).into_owned(),
            b'M' => message = String::from_utf8_lossy(field.value_bytes()).into_owned(),
            _ => {}
        }
    }
    (code, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_frame(tag: u8, body: &[u8]) -> Vec<u8> {
        let mut buf = vec![tag];
        buf.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
        buf.extend_from_slice(body);
        buf
    }

    #[test]
    fn test_pg_time_round_trip() {
        assert_eq!(pg_time_to_utc(0).to_rfc3339(), "2000-01-01T00:00:00+00:00");
        let now = Utc.timestamp_micros(1_697_365_800_123_456).unwrap();
        assert_eq!(pg_time_to_utc(utc_to_pg_time(now)), now);
        // Out of range values degrade instead of panicking.
        let _ = pg_time_to_utc(i64::MAX);
    }

    #[test]
    fn test_parse_xlog_data() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'w');
        buf.put_u64(0x10);
        buf.put_u64(0x20);
        buf.put_i64(0);
        buf.put_slice(b"Bpayload");

        match parse_copy_data(buf.freeze()).unwrap() {
            CopyDataMessage::XLogData(msg) => {
                assert_eq!(msg.wal_start, LogPosition::new(0x10));
                assert_eq!(msg.wal_end, LogPosition::new(0x20));
                assert_eq!(&msg.data[..], b"Bpayload");
            }
            other => panic!("Expected XLogData, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_keepalive() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'k');
        buf.put_u64(0x1_0000_0000);
        buf.put_i64(0);
        buf.put_u8(1);

        match parse_copy_data(buf.freeze()).unwrap() {
            CopyDataMessage::PrimaryKeepalive {
                wal_end,
                reply_requested,
                ..
            } => {
                assert_eq!(wal_end.to_string(), "1/0");
                assert!(reply_requested);
            }
            other => panic!("Expected keepalive, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_copy_data_rejects_garbage() {
        assert!(parse_copy_data(Bytes::new()).is_err());
        assert!(parse_copy_data(Bytes::from_static(b"w\x00\x01")).is_err());
        assert!(parse_copy_data(Bytes::from_static(b"k\x00")).is_err());
        assert!(parse_copy_data(Bytes::from_static(b"z")).is_err());
    }

    #[test]
    fn test_status_update_layout() {
        let mut out = BytesMut::new();
        let now = pg_time_to_utc(42);
        encode_status_update(
            LogPosition::new(300),
            LogPosition::new(200),
            LogPosition::new(200),
            now,
            false,
            &mut out,
        )
        .unwrap();

        assert_eq!(out[0], b'd');
        assert_eq!(i32::from_be_bytes([out[1], out[2], out[3], out[4]]), 4 + 34);
        let mut payload = &out[5..];
        assert_eq!(payload.get_u8(), b'r');
        assert_eq!(payload.get_u64(), 300);
        assert_eq!(payload.get_u64(), 200);
        assert_eq!(payload.get_u64(), 200);
        assert_eq!(payload.get_i64(), 42);
        assert_eq!(payload.get_u8(), 0);
    }

    #[tokio::test]
    async fn test_reader_handles_split_frames_and_copy_both() {
        let mut wire = raw_frame(b'W', &[0, 0, 0]);
        wire.extend(raw_frame(b'Z', b"I"));
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = MessageReader::new(server);

        let writer = tokio::spawn(async move {
            for chunk in wire.chunks(3) {
                client.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
            client
        });

        assert!(matches!(
            reader.next_frame().await.unwrap(),
            BackendFrame::CopyBothResponse
        ));
        assert!(matches!(
            reader.next_message().await.unwrap(),
            backend::Message::ReadyForQuery(_)
        ));

        drop(writer.await.unwrap());
        assert!(matches!(
            reader.next_frame().await,
            Err(Error::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_reader_rejects_bad_length() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&[b'Z', 0, 0, 0, 1]).await.unwrap();
        let mut reader = MessageReader::new(server);
        assert!(matches!(
            reader.next_frame().await,
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_error_response_fields_and_debug_output() {
        let mut body = Vec::new();
        for (field, value) in [(b'S', "ERROR"), (b'C', "55006"), (b'M', "slot is active")] {
            body.push(field);
            body.extend_from_slice(value.as_bytes());
            body.push(0);
        }
        body.push(0);

        let (mut client, server) = tokio::io::duplex(256);
        client.write_all(&raw_frame(b'E', &body)).await.unwrap();
        client.write_all(&raw_frame(b'W', &[0, 0, 0])).await.unwrap();
        let mut reader = MessageReader::new(server);

        let frame = reader.next_frame().await.unwrap();
        assert_eq!(format!("{:?}", frame), "Message(..)");
        match frame {
            BackendFrame::Message(backend::Message::ErrorResponse(body)) => {
                match server_error(&body) {
                    Error::Server { code, message } => {
                        assert_eq!(code, "55006");
                        assert_eq!(message, "slot is active");
                    }
                    other => panic!("Expected server error, got {:?}", other),
                }
            }
            other => panic!("Expected ErrorResponse, got {:?}", other),
        }

        let frame = reader.next_frame().await.unwrap();
        assert_eq!(format!("{:?}", frame), "CopyBothResponse");
    }
}
