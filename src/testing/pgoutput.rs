//! Builders for `pgoutput` payloads.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::Utc;

use crate::postgres::{LogPosition, WalMessage};

/// One column value inside TupleData.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Null,
    Unchanged,
    Text(String),
    Binary(Vec<u8>),
}

impl From<&str> for Datum {
    fn from(value: &str) -> Self {
        Datum::Text(value.to_string())
    }
}

impl From<Option<&str>> for Datum {
    fn from(value: Option<&str>) -> Self {
        value.map(Datum::from).unwrap_or(Datum::Null)
    }
}

pub fn text(values: &[&str]) -> Vec<Datum> {
    values.iter().map(|v| Datum::from(*v)).collect()
}

/// Wraps a payload the way XLogData carries it.
pub fn wal(start: u64, data: Bytes) -> WalMessage {
    WalMessage {
        wal_start: LogPosition::new(start),
        wal_end: LogPosition::new(start),
        server_time: Utc::now(),
        data,
    }
}

pub fn begin(final_lsn: u64, xid: u32) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'B');
    buf.put_u64(final_lsn);
    buf.put_i64(750_000_000_000_000); // 2023-10-08 in PostgreSQL epoch micros
    buf.put_u32(xid);
    buf.freeze()
}

pub fn commit(commit_lsn: u64, end_lsn: u64) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'C');
    buf.put_u8(0);
    buf.put_u64(commit_lsn);
    buf.put_u64(end_lsn);
    buf.put_i64(750_000_000_000_000);
    buf.freeze()
}

/// `columns` are `(name, type oid, part of the key)`.
pub fn relation(id: u32, schema: &str, table: &str, identity: u8, columns: &[(&str, u32, bool)]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'R');
    buf.put_u32(id);
    put_cstr(&mut buf, schema);
    put_cstr(&mut buf, table);
    buf.put_u8(identity);
    buf.put_i16(columns.len() as i16);
    for (name, type_id, is_key) in columns {
        buf.put_u8(*is_key as u8);
        put_cstr(&mut buf, name);
        buf.put_u32(*type_id);
        buf.put_i32(-1);
    }
    buf.freeze()
}

pub fn insert(relation_id: u32, values: &[Datum]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'I');
    buf.put_u32(relation_id);
    buf.put_u8(b'N');
    put_tuple(&mut buf, values);
    buf.freeze()
}

/// `old` is the tuple kind (`K` or `O`) with its values.
pub fn update(relation_id: u32, old: Option<(u8, &[Datum])>, new: &[Datum]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'U');
    buf.put_u32(relation_id);
    if let Some((kind, values)) = old {
        buf.put_u8(kind);
        put_tuple(&mut buf, values);
    }
    buf.put_u8(b'N');
    put_tuple(&mut buf, new);
    buf.freeze()
}

pub fn delete(relation_id: u32, kind: u8, old: &[Datum]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'D');
    buf.put_u32(relation_id);
    buf.put_u8(kind);
    put_tuple(&mut buf, old);
    buf.freeze()
}

pub fn truncate(relation_ids: &[u32]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'T');
    buf.put_u32(relation_ids.len() as u32);
    buf.put_u8(0);
    for id in relation_ids {
        buf.put_u32(*id);
    }
    buf.freeze()
}

pub fn logical_message(prefix: &str, content: &[u8]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'M');
    buf.put_u8(1);
    buf.put_u64(0);
    put_cstr(&mut buf, prefix);
    buf.put_i32(content.len() as i32);
    buf.put_slice(content);
    buf.freeze()
}

/// Id of the relation described by [`users_relation`].
pub const USERS: u32 = 16384;

/// `public.users (id int4 key, name text, bio text)`.
pub fn users_relation() -> Bytes {
    relation(
        USERS,
        "public",
        "users",
        b'd',
        &[("id", 23, true), ("name", 25, false), ("bio", 25, false)],
    )
}

/// Builds a committed transaction on `public.users` as a WAL message
/// sequence, one insert per name.
///
/// Positions are laid out from `begin_at`: the BEGIN record sits there,
/// each change 0x10 further, and the commit ends at the returned
/// transaction's last message plus 0x10.
pub struct TransactionScript {
    xid: u32,
    begin_at: u64,
    rows: Vec<Bytes>,
    with_relation: bool,
}

impl TransactionScript {
    pub fn new(xid: u32, begin_at: u64) -> Self {
        Self {
            xid,
            begin_at,
            rows: Vec::new(),
            with_relation: true,
        }
    }

    pub fn without_relation(mut self) -> Self {
        self.with_relation = false;
        self
    }

    pub fn insert(mut self, id: i32, name: &str) -> Self {
        let id = id.to_string();
        self.rows
            .push(insert(USERS, &[Datum::from(id.as_str()), Datum::from(name), Datum::Null]));
        self
    }

    pub fn change(mut self, payload: Bytes) -> Self {
        self.rows.push(payload);
        self
    }

    pub fn commit_lsn(&self) -> u64 {
        self.begin_at + 0x10 * (self.rows.len() as u64 + 1)
    }

    /// The position confirmed once this transaction is delivered.
    pub fn end_lsn(&self) -> u64 {
        self.commit_lsn() + 0x10
    }

    pub fn build(&self) -> Vec<WalMessage> {
        let mut messages = Vec::with_capacity(self.rows.len() + 3);
        let commit_lsn = self.commit_lsn();
        if self.with_relation {
            messages.push(wal(self.begin_at, users_relation()));
        }
        messages.push(wal(self.begin_at, begin(commit_lsn, self.xid)));
        for (i, row) in self.rows.iter().enumerate() {
            messages.push(wal(self.begin_at + 0x10 * (i as u64 + 1), row.clone()));
        }
        messages.push(wal(commit_lsn, commit(commit_lsn, self.end_lsn())));
        messages
    }
}

fn put_cstr(buf: &mut BytesMut, value: &str) {
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
}

fn put_tuple(buf: &mut BytesMut, values: &[Datum]) {
    buf.put_i16(values.len() as i16);
    for value in values {
        match value {
            Datum::Null => buf.put_u8(b'n'),
            Datum::Unchanged => buf.put_u8(b'u'),
            Datum::Text(text) => {
                buf.put_u8(b't');
                buf.put_i32(text.len() as i32);
                buf.put_slice(text.as_bytes());
            }
            Datum::Binary(data) => {
                buf.put_u8(b'b');
                buf.put_i32(data.len() as i32);
                buf.put_slice(data);
            }
        }
    }
}
