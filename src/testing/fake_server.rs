//! A scripted stand-in for a PostgreSQL walsender.
//!
//! Tests drive the server side of the conversation step by step and
//! assert on what the client sent.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};

use crate::postgres::protocol::PG_EPOCH_OFFSET_MICROS;
use crate::postgres::{LogPosition, WalMessage};

pub trait ServerIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> ServerIo for T {}

/// A message sent by the client, as seen by the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Query(String),
    Password(String),
    CopyData(Bytes),
    CopyDone,
    Terminate,
    Other(u8),
}

/// A decoded standby status update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusUpdate {
    pub write: LogPosition,
    pub flush: LogPosition,
    pub apply: LogPosition,
    pub reply: bool,
}

pub struct FakeServer {
    io: Box<dyn ServerIo>,
    buffer: BytesMut,
}

impl FakeServer {
    /// An in-memory client/server pair.
    pub fn pair() -> (DuplexStream, FakeServer) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        (client, FakeServer::from_stream(server))
    }

    pub fn from_stream<S: ServerIo + 'static>(io: S) -> Self {
        Self {
            io: Box::new(io),
            buffer: BytesMut::new(),
        }
    }

    /// Reads the startup packet and returns its parameters.
    pub async fn accept_startup(&mut self) -> HashMap<String, String> {
        let len = self.read_i32().await as usize;
        let mut body = self.read_exact(len - 4).await;
        assert_eq!(body.get_i32(), 196_608, "protocol version 3.0");

        let mut params = HashMap::new();
        let mut parts = body.split(|&b| b == 0).map(|p| String::from_utf8_lossy(p).into_owned());
        while let Some(key) = parts.next() {
            if key.is_empty() {
                break;
            }
            let value = parts.next().unwrap_or_default();
            params.insert(key, value);
        }
        params
    }

    pub async fn request_md5_password(&mut self) {
        let mut body = BytesMut::new();
        body.put_i32(5);
        body.put_slice(b"salt");
        self.send(b'R', &body).await;
    }

    pub async fn expect_password(&mut self) -> String {
        match self.next_client_message().await {
            ClientMessage::Password(password) => password,
            other => panic!("Expected password message, got {:?}", other),
        }
    }

    /// AuthenticationOk, a few ParameterStatus messages and ReadyForQuery.
    pub async fn ready(&mut self) {
        self.send(b'R', &0i32.to_be_bytes()).await;
        self.send(b'S', &cstrings(&["server_version", "16.0"])).await;
        self.send(b'S', &cstrings(&["client_encoding", "UTF8"])).await;
        let mut key_data = BytesMut::new();
        key_data.put_i32(4242);
        key_data.put_i32(1);
        self.send(b'K', &key_data).await;
        self.ready_for_query().await;
    }

    pub async fn ready_for_query(&mut self) {
        self.send(b'Z', b"I").await;
    }

    pub async fn expect_query(&mut self) -> String {
        match self.next_client_message().await {
            ClientMessage::Query(query) => query,
            other => panic!("Expected query, got {:?}", other),
        }
    }

    /// Sends a full result set followed by ReadyForQuery.
    pub async fn send_rows(&mut self, columns: &[&str], rows: &[Vec<Option<&str>>]) {
        let mut description = BytesMut::new();
        description.put_i16(columns.len() as i16);
        for column in columns {
            description.put_slice(column.as_bytes());
            description.put_u8(0);
            description.put_i32(0); // table oid
            description.put_i16(0); // attnum
            description.put_u32(25); // text
            description.put_i16(-1);
            description.put_i32(-1);
            description.put_i16(0); // text format
        }
        self.send(b'T', &description).await;

        for row in rows {
            let mut data = BytesMut::new();
            data.put_i16(row.len() as i16);
            for value in row {
                match value {
                    Some(v) => {
                        data.put_i32(v.len() as i32);
                        data.put_slice(v.as_bytes());
                    }
                    None => data.put_i32(-1),
                }
            }
            self.send(b'D', &data).await;
        }

        self.send(b'C', &cstrings(&[&format!("SELECT {}", rows.len())]))
            .await;
        self.ready_for_query().await;
    }

    pub async fn send_command_complete(&mut self, tag: &str) {
        self.send(b'C', &cstrings(&[tag])).await;
        self.ready_for_query().await;
    }

    /// ErrorResponse followed by ReadyForQuery.
    pub async fn send_error(&mut self, code: &str, message: &str) {
        self.send_error_only(code, message).await;
        self.ready_for_query().await;
    }

    pub async fn send_error_only(&mut self, code: &str, message: &str) {
        let mut body = BytesMut::new();
        for (field, value) in [(b'S', "ERROR"), (b'V', "ERROR"), (b'C', code), (b'M', message)] {
            body.put_u8(field);
            body.put_slice(value.as_bytes());
            body.put_u8(0);
        }
        body.put_u8(0);
        self.send(b'E', &body).await;
    }

    pub async fn start_copy_both(&mut self) {
        self.send(b'W', &[0, 0, 0]).await;
    }

    pub async fn send_xlog(&mut self, start: u64, end: u64, data: &[u8]) {
        let mut body = BytesMut::with_capacity(25 + data.len());
        body.put_u8(b'w');
        body.put_u64(start);
        body.put_u64(end);
        body.put_i64(now_pg_micros());
        body.put_slice(data);
        self.send(b'd', &body).await;
    }

    pub async fn send_wal(&mut self, message: &WalMessage) {
        self.send_xlog(message.wal_start.as_u64(), message.wal_end.as_u64(), &message.data)
            .await;
    }

    pub async fn send_keepalive(&mut self, wal_end: u64, reply_requested: bool) {
        let mut body = BytesMut::with_capacity(18);
        body.put_u8(b'k');
        body.put_u64(wal_end);
        body.put_i64(now_pg_micros());
        body.put_u8(reply_requested as u8);
        self.send(b'd', &body).await;
    }

    /// Ends the CopyBoth phase from the server side after the client's CopyDone.
    pub async fn finish_copy(&mut self) {
        self.send(b'c', &[]).await;
        self.send(b'C', &cstrings(&["COPY 0"])).await;
        self.ready_for_query().await;
    }

    pub async fn expect_status_update(&mut self) -> StatusUpdate {
        match self.next_client_message().await {
            ClientMessage::CopyData(mut data) => {
                assert_eq!(data.get_u8(), b'r', "standby status update");
                let write = LogPosition::new(data.get_u64());
                let flush = LogPosition::new(data.get_u64());
                let apply = LogPosition::new(data.get_u64());
                let _time = data.get_i64();
                let reply = data.get_u8() != 0;
                StatusUpdate {
                    write,
                    flush,
                    apply,
                    reply,
                }
            }
            other => panic!("Expected status update, got {:?}", other),
        }
    }

    pub async fn next_client_message(&mut self) -> ClientMessage {
        let tag = self.read_exact(1).await[0];
        let len = self.read_i32().await as usize;
        let body = self.read_exact(len - 4).await;
        match tag {
            b'Q' => ClientMessage::Query(cstring(&body)),
            b'p' => ClientMessage::Password(cstring(&body)),
            b'd' => ClientMessage::CopyData(body),
            b'c' => ClientMessage::CopyDone,
            b'X' => ClientMessage::Terminate,
            other => ClientMessage::Other(other),
        }
    }

    async fn send(&mut self, tag: u8, body: &[u8]) {
        let mut frame = BytesMut::with_capacity(body.len() + 5);
        frame.put_u8(tag);
        frame.put_i32(body.len() as i32 + 4);
        frame.put_slice(body);
        self.io.write_all(&frame).await.unwrap();
        self.io.flush().await.unwrap();
    }

    async fn read_i32(&mut self) -> i32 {
        self.read_exact(4).await.get_i32()
    }

    async fn read_exact(&mut self, len: usize) -> Bytes {
        while self.buffer.len() < len {
            let read = self.io.read_buf(&mut self.buffer).await.unwrap();
            assert!(read > 0, "client closed the connection");
        }
        self.buffer.split_to(len).freeze()
    }
}

fn cstrings(values: &[&str]) -> Vec<u8> {
    let mut out = Vec::new();
    for value in values {
        out.extend_from_slice(value.as_bytes());
        out.push(0);
    }
    out
}

fn cstring(body: &[u8]) -> String {
    let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
    String::from_utf8_lossy(&body[..end]).into_owned()
}

fn now_pg_micros() -> i64 {
    chrono::Utc::now().timestamp_micros() - PG_EPOCH_OFFSET_MICROS
}
