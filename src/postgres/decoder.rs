use bytes::{Buf, Bytes};
use std::collections::HashMap;
use tracing::{debug, trace};

use super::protocol::pg_time_to_utc;
use super::types::{
    BeginMarker, ChangeEvent, ChangeOperation, Column, ColumnValue, CommitMarker, LogPosition,
    OldImageKind, RowImage, WalMessage,
};
use crate::{Error, Result};

/// PostgreSQL type OIDs with a typed mapping.
pub mod oid {
    pub const BOOL: u32 = 16;
    pub const BYTEA: u32 = 17;
    pub const NAME: u32 = 19;
    pub const INT8: u32 = 20;
    pub const INT2: u32 = 21;
    pub const INT4: u32 = 23;
    pub const TEXT: u32 = 25;
    pub const OID: u32 = 26;
    pub const JSON: u32 = 114;
    pub const FLOAT4: u32 = 700;
    pub const FLOAT8: u32 = 701;
    pub const BPCHAR: u32 = 1042;
    pub const VARCHAR: u32 = 1043;
    pub const JSONB: u32 = 3802;
}

#[derive(Debug, Clone)]
pub struct RelationInfo {
    pub id: u32,
    pub schema: String,
    pub table: String,
    pub replica_identity: u8,
    pub columns: Vec<ColumnInfo>,
}

#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub name: String,
    pub type_id: u32,
    pub is_key: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodedMessage {
    Begin(BeginMarker),
    Commit(CommitMarker),
    Change(ChangeEvent),
    /// One event per truncated relation.
    Truncate(Vec<ChangeEvent>),
    /// Relation metadata was cached; nothing to deliver.
    Relation { id: u32, schema: String, table: String },
    /// Type, origin and logical decoding messages.
    Ignored(char),
}

/// Decodes `pgoutput` (protocol version 1) payloads.
///
/// Keeps the relation cache the server builds up with `R` messages; row
/// messages for a relation that was never described are an error.
#[derive(Debug, Default)]
pub struct PgOutputDecoder {
    relations: HashMap<u32, RelationInfo>,
}

impl PgOutputDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn relation(&self, id: u32) -> Option<&RelationInfo> {
        self.relations.get(&id)
    }

    pub fn decode(&mut self, message: &WalMessage) -> Result<DecodedMessage> {
        let mut cursor = Cursor {
            buf: message.data.clone(),
            position: message.wal_start,
        };

        let msg_type = cursor.u8("message type")?;
        match msg_type {
            b'B' => self.decode_begin(cursor),
            b'C' => self.decode_commit(cursor),
            b'R' => self.decode_relation(cursor),
            b'I' => self.decode_insert(cursor),
            b'U' => self.decode_update(cursor),
            b'D' => self.decode_delete(cursor),
            b'T' => self.decode_truncate(cursor),
            b'Y' | b'O' | b'M' => {
                trace!("Skipping pgoutput message '{}'", msg_type as char);
                Ok(DecodedMessage::Ignored(msg_type as char))
            }
            other => Err(cursor.error(format!(
                "unknown pgoutput message type '{}'",
                other as char
            ))),
        }
    }

    fn decode_begin(&mut self, mut cursor: Cursor) -> Result<DecodedMessage> {
        let final_lsn = LogPosition::new(cursor.u64("BEGIN final LSN")?);
        let commit_time = pg_time_to_utc(cursor.i64("BEGIN timestamp")?);
        let xid = cursor.u32("BEGIN xid")?;

        trace!("BEGIN: final_lsn={}, xid={}", final_lsn, xid);
        Ok(DecodedMessage::Begin(BeginMarker {
            xid,
            final_lsn,
            commit_time,
            position: cursor.position,
        }))
    }

    fn decode_commit(&mut self, mut cursor: Cursor) -> Result<DecodedMessage> {
        let _flags = cursor.u8("COMMIT flags")?;
        let commit_lsn = LogPosition::new(cursor.u64("COMMIT LSN")?);
        let end_lsn = LogPosition::new(cursor.u64("COMMIT end LSN")?);
        let commit_time = pg_time_to_utc(cursor.i64("COMMIT timestamp")?);

        trace!("COMMIT: commit_lsn={}, end_lsn={}", commit_lsn, end_lsn);
        Ok(DecodedMessage::Commit(CommitMarker {
            commit_lsn,
            end_lsn,
            commit_time,
        }))
    }

    fn decode_relation(&mut self, mut cursor: Cursor) -> Result<DecodedMessage> {
        let id = cursor.u32("relation id")?;
        let mut schema = cursor.cstr("namespace")?;
        if schema.is_empty() {
            schema = "pg_catalog".to_string();
        }
        let table = cursor.cstr("relation name")?;
        let replica_identity = cursor.u8("replica identity")?;
        let num_columns = cursor.i16("column count")?;
        if num_columns < 0 {
            return Err(cursor.error(format!("negative column count {}", num_columns)));
        }

        let mut columns = Vec::with_capacity(num_columns as usize);
        for _ in 0..num_columns {
            let flags = cursor.u8("column flags")?;
            let name = cursor.cstr("column name")?;
            let type_id = cursor.u32("column type")?;
            let _type_modifier = cursor.i32("column type modifier")?;
            columns.push(ColumnInfo {
                name,
                type_id,
                is_key: flags & 1 != 0,
            });
        }

        debug!("RELATION: {}={}.{}", id, schema, table);
        self.relations.insert(
            id,
            RelationInfo {
                id,
                schema: schema.clone(),
                table: table.clone(),
                replica_identity,
                columns,
            },
        );

        Ok(DecodedMessage::Relation { id, schema, table })
    }

    fn decode_insert(&mut self, mut cursor: Cursor) -> Result<DecodedMessage> {
        let relation = self.lookup(&mut cursor)?;

        let tuple_type = cursor.u8("INSERT tuple type")?;
        if tuple_type != b'N' {
            return Err(cursor.error(format!(
                "unexpected tuple type '{}' in INSERT",
                tuple_type as char
            )));
        }
        let new = decode_tuple(&mut cursor, relation, false)?;

        Ok(DecodedMessage::Change(ChangeEvent {
            op: ChangeOperation::Insert,
            schema: relation.schema.clone(),
            table: relation.table.clone(),
            old: None,
            old_kind: None,
            new: Some(new),
            position: cursor.position,
        }))
    }

    fn decode_update(&mut self, mut cursor: Cursor) -> Result<DecodedMessage> {
        let relation = self.lookup(&mut cursor)?;

        let mut old = None;
        let mut old_kind = None;
        let mut tuple_type = cursor.u8("UPDATE tuple type")?;

        if let Some(kind) = old_image_kind(tuple_type) {
            old = Some(decode_tuple(&mut cursor, relation, kind == OldImageKind::Key)?);
            old_kind = Some(kind);
            tuple_type = cursor.u8("UPDATE new tuple type")?;
        }

        if tuple_type != b'N' {
            return Err(cursor.error(format!(
                "unexpected tuple type '{}' in UPDATE",
                tuple_type as char
            )));
        }
        let new = decode_tuple(&mut cursor, relation, false)?;

        Ok(DecodedMessage::Change(ChangeEvent {
            op: ChangeOperation::Update,
            schema: relation.schema.clone(),
            table: relation.table.clone(),
            old,
            old_kind,
            new: Some(new),
            position: cursor.position,
        }))
    }

    fn decode_delete(&mut self, mut cursor: Cursor) -> Result<DecodedMessage> {
        let relation = self.lookup(&mut cursor)?;

        let tuple_type = cursor.u8("DELETE tuple type")?;
        let kind = old_image_kind(tuple_type).ok_or_else(|| {
            cursor.error(format!(
                "unexpected tuple type '{}' in DELETE",
                tuple_type as char
            ))
        })?;
        let old = decode_tuple(&mut cursor, relation, kind == OldImageKind::Key)?;

        Ok(DecodedMessage::Change(ChangeEvent {
            op: ChangeOperation::Delete,
            schema: relation.schema.clone(),
            table: relation.table.clone(),
            old: Some(old),
            old_kind: Some(kind),
            new: None,
            position: cursor.position,
        }))
    }

    fn decode_truncate(&mut self, mut cursor: Cursor) -> Result<DecodedMessage> {
        let count = cursor.u32("TRUNCATE relation count")?;
        let _options = cursor.u8("TRUNCATE options")?;

        let mut events = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            let id = cursor.u32("TRUNCATE relation id")?;
            let relation = self
                .relations
                .get(&id)
                .ok_or_else(|| cursor.error(format!("unknown relation id {}", id)))?;
            events.push(ChangeEvent {
                op: ChangeOperation::Truncate,
                schema: relation.schema.clone(),
                table: relation.table.clone(),
                old: None,
                old_kind: None,
                new: None,
                position: cursor.position,
            });
        }

        Ok(DecodedMessage::Truncate(events))
    }

    fn lookup(&self, cursor: &mut Cursor) -> Result<&RelationInfo> {
        let id = cursor.u32("relation id")?;
        self.relations
            .get(&id)
            .ok_or_else(|| cursor.error(format!("unknown relation id {}", id)))
    }
}

fn old_image_kind(tuple_type: u8) -> Option<OldImageKind> {
    match tuple_type {
        b'K' => Some(OldImageKind::Key),
        b'O' => Some(OldImageKind::Full),
        _ => None,
    }
}

/// Reads TupleData. With `key_only`, columns outside the replica identity
/// are consumed but left out of the image.
fn decode_tuple(cursor: &mut Cursor, relation: &RelationInfo, key_only: bool) -> Result<RowImage> {
    let num_columns = cursor.i16("tuple column count")?;
    if num_columns < 0 || num_columns as usize != relation.columns.len() {
        return Err(cursor.error(format!(
            "column count mismatch for {}.{}: {} vs {}",
            relation.schema,
            relation.table,
            num_columns,
            relation.columns.len()
        )));
    }

    let mut columns = Vec::with_capacity(relation.columns.len());
    for column in &relation.columns {
        let value = match cursor.u8("column kind")? {
            b'n' => ColumnValue::Null,
            b'u' => ColumnValue::Unchanged,
            b't' => {
                let data = cursor.sized("text value")?;
                parse_text_value(&String::from_utf8_lossy(&data), column.type_id)
            }
            b'b' => {
                let data = cursor.sized("binary value")?;
                parse_binary_value(&data, column.type_id)
            }
            other => {
                return Err(cursor.error(format!(
                    "unknown column kind '{}' for {}",
                    other as char, column.name
                )))
            }
        };

        if key_only && !column.is_key {
            continue;
        }
        columns.push(Column {
            name: column.name.clone(),
            value,
        });
    }

    Ok(RowImage::new(columns))
}

/// Maps a text-format value to a typed value by its type OID.
///
/// Anything that does not parse as its declared type is kept as text.
pub fn parse_text_value(text: &str, type_id: u32) -> ColumnValue {
    let fallback = || ColumnValue::Text(text.to_string());
    match type_id {
        oid::BOOL => match text {
            "t" => ColumnValue::Bool(true),
            "f" => ColumnValue::Bool(false),
            _ => fallback(),
        },
        oid::INT2 | oid::INT4 | oid::INT8 | oid::OID => {
            text.parse::<i64>().map(ColumnValue::Int).unwrap_or_else(|_| fallback())
        }
        oid::FLOAT4 | oid::FLOAT8 => match text.parse::<f64>() {
            Ok(v) if v.is_finite() => ColumnValue::Float(v),
            _ => fallback(),
        },
        oid::BYTEA => text
            .strip_prefix("\\x")
            .and_then(|hex| hex::decode(hex).ok())
            .map(ColumnValue::Bytes)
            .unwrap_or_else(fallback),
        oid::JSON | oid::JSONB => serde_json::from_str(text)
            .map(ColumnValue::Json)
            .unwrap_or_else(|_| fallback()),
        _ => fallback(),
    }
}

/// Maps a binary-format value (the type's `send` output) to a typed value.
pub fn parse_binary_value(data: &[u8], type_id: u32) -> ColumnValue {
    let raw = || ColumnValue::Bytes(data.to_vec());
    match (type_id, data.len()) {
        (oid::BOOL, 1) => ColumnValue::Bool(data[0] != 0),
        (oid::INT2, 2) => ColumnValue::Int(i16::from_be_bytes([data[0], data[1]]) as i64),
        (oid::INT4, 4) => {
            ColumnValue::Int(i32::from_be_bytes([data[0], data[1], data[2], data[3]]) as i64)
        }
        (oid::OID, 4) => {
            ColumnValue::Int(u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as i64)
        }
        (oid::INT8, 8) => {
            let mut buf = data;
            ColumnValue::Int(buf.get_i64())
        }
        (oid::FLOAT4, 4) => {
            let mut buf = data;
            finite_or_raw(buf.get_f32() as f64, raw)
        }
        (oid::FLOAT8, 8) => {
            let mut buf = data;
            finite_or_raw(buf.get_f64(), raw)
        }
        (oid::TEXT | oid::VARCHAR | oid::BPCHAR | oid::NAME, _) => std::str::from_utf8(data)
            .map(|s| ColumnValue::Text(s.to_string()))
            .unwrap_or_else(|_| raw()),
        (oid::JSON, _) => serde_json::from_slice(data)
            .map(ColumnValue::Json)
            .unwrap_or_else(|_| raw()),
        // jsonb binary format: version byte followed by the text form
        (oid::JSONB, n) if n > 0 && data[0] == 1 => serde_json::from_slice(&data[1..])
            .map(ColumnValue::Json)
            .unwrap_or_else(|_| raw()),
        _ => raw(),
    }
}

fn finite_or_raw(value: f64, raw: impl FnOnce() -> ColumnValue) -> ColumnValue {
    if value.is_finite() {
        ColumnValue::Float(value)
    } else {
        raw()
    }
}

/// Bounds-checked reads over one payload; errors carry the WAL position.
struct Cursor {
    buf: Bytes,
    position: LogPosition,
}

impl Cursor {
    fn error(&self, message: String) -> Error {
        Error::decode(self.position, message)
    }

    fn need(&self, len: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < len {
            Err(self.error(format!(
                "truncated {}: need {} bytes, {} left",
                what,
                len,
                self.buf.remaining()
            )))
        } else {
            Ok(())
        }
    }

    fn u8(&mut self, what: &str) -> Result<u8> {
        self.need(1, what)?;
        Ok(self.buf.get_u8())
    }

    fn i16(&mut self, what: &str) -> Result<i16> {
        self.need(2, what)?;
        Ok(self.buf.get_i16())
    }

    fn u32(&mut self, what: &str) -> Result<u32> {
        self.need(4, what)?;
        Ok(self.buf.get_u32())
    }

    fn i32(&mut self, what: &str) -> Result<i32> {
        self.need(4, what)?;
        Ok(self.buf.get_i32())
    }

    fn u64(&mut self, what: &str) -> Result<u64> {
        self.need(8, what)?;
        Ok(self.buf.get_u64())
    }

    fn i64(&mut self, what: &str) -> Result<i64> {
        self.need(8, what)?;
        Ok(self.buf.get_i64())
    }

    fn cstr(&mut self, what: &str) -> Result<String> {
        let end = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| self.error(format!("unterminated {}", what)))?;
        let value = String::from_utf8_lossy(&self.buf[..end]).into_owned();
        self.buf.advance(end + 1);
        Ok(value)
    }

    /// Int32 length followed by that many bytes.
    fn sized(&mut self, what: &str) -> Result<Bytes> {
        let len = self.i32(what)?;
        if len < 0 {
            return Err(self.error(format!("negative length {} for {}", len, what)));
        }
        self.need(len as usize, what)?;
        Ok(self.buf.split_to(len as usize))
    }
}

#[cfg(test)]
#[path = "decoder_tests.rs"]
mod decoder_tests;

#[cfg(test)]
#[path = "type_parser_tests.rs"]
mod type_parser_tests;
