use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Number, Value};

use crate::postgres::{
    ChangeEvent, ChangeOperation, ColumnValue, LogPosition, OldImageKind, RowImage, Transaction,
};
use crate::Result;

/// Renders transactions as single-line JSON documents.
pub struct JsonSerializer;

#[derive(Serialize)]
struct TransactionRecord<'a> {
    xid: u32,
    commit_lsn: LogPosition,
    commit_position: LogPosition,
    commit_time: DateTime<Utc>,
    changes: Vec<ChangeRecord<'a>>,
}

#[derive(Serialize)]
struct ChangeRecord<'a> {
    op: ChangeOperation,
    schema: &'a str,
    table: &'a str,
    position: LogPosition,
    old_kind: Option<OldImageKind>,
    old: Option<Map<String, Value>>,
    new: Option<Map<String, Value>>,
    /// Columns whose TOASTed value was not sent because it did not change.
    unchanged: Vec<&'a str>,
    /// Same for the old image; omitted when empty.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    old_unchanged: Vec<&'a str>,
}

impl JsonSerializer {
    pub fn serialize(transaction: &Transaction) -> Result<String> {
        serde_json::to_string(&Self::record(transaction)).map_err(Into::into)
    }

    pub fn to_value(transaction: &Transaction) -> Result<Value> {
        serde_json::to_value(Self::record(transaction)).map_err(Into::into)
    }

    fn record(transaction: &Transaction) -> TransactionRecord<'_> {
        TransactionRecord {
            xid: transaction.xid,
            commit_lsn: transaction.commit_lsn,
            commit_position: transaction.commit_position,
            commit_time: transaction.commit_time,
            changes: transaction.events.iter().map(change_record).collect(),
        }
    }
}

fn change_record(event: &ChangeEvent) -> ChangeRecord<'_> {
    let mut unchanged = Vec::new();
    let mut old_unchanged = Vec::new();
    let new = event.new.as_ref().map(|row| row_object(row, &mut unchanged));
    let old = event.old.as_ref().map(|row| row_object(row, &mut old_unchanged));

    ChangeRecord {
        op: event.op,
        schema: &event.schema,
        table: &event.table,
        position: event.position,
        old_kind: event.old_kind,
        old,
        new,
        unchanged,
        old_unchanged,
    }
}

fn row_object<'a>(row: &'a RowImage, unchanged: &mut Vec<&'a str>) -> Map<String, Value> {
    let mut object = Map::with_capacity(row.len());
    for (name, value) in row.iter() {
        if value.is_unchanged() {
            unchanged.push(name);
            continue;
        }
        object.insert(name.to_string(), json_value(value));
    }
    object
}

pub fn json_value(value: &ColumnValue) -> Value {
    match value {
        ColumnValue::Null | ColumnValue::Unchanged => Value::Null,
        ColumnValue::Bool(b) => Value::Bool(*b),
        ColumnValue::Int(i) => Value::Number((*i).into()),
        ColumnValue::Float(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
        ColumnValue::Text(s) => Value::String(s.clone()),
        ColumnValue::Bytes(b) => Value::String(BASE64.encode(b)),
        ColumnValue::Json(v) => v.clone(),
    }
}
