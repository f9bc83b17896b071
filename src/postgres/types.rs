use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A position in the write-ahead log (an LSN).
///
/// Positions are totally ordered and are displayed the way PostgreSQL
/// prints them: the upper and lower 32 bits in hexadecimal separated by a
/// slash (`16/B374D848`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LogPosition(u64);

impl LogPosition {
    /// `0/0`, the invalid LSN. Passed to START_REPLICATION it means "from
    /// the slot's confirmed position".
    pub const ZERO: LogPosition = LogPosition(0);

    pub const fn new(lsn: u64) -> Self {
        LogPosition(lsn)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for LogPosition {
    fn from(lsn: u64) -> Self {
        LogPosition(lsn)
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for LogPosition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = s
            .split_once('/')
            .ok_or_else(|| format!("invalid LSN '{}': expected X/X", s))?;
        let hi = u32::from_str_radix(hi, 16).map_err(|e| format!("invalid LSN '{}': {}", s, e))?;
        let lo = u32::from_str_radix(lo, 16).map_err(|e| format!("invalid LSN '{}': {}", s, e))?;
        Ok(LogPosition(((hi as u64) << 32) | lo as u64))
    }
}

impl TryFrom<String> for LogPosition {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LogPosition> for String {
    fn from(position: LogPosition) -> Self {
        position.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
    Truncate,
}

/// A decoded column value.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    /// The server did not send the value because it is an unchanged TOASTed
    /// datum. This is not the same as `Null`.
    Unchanged,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    pub fn is_unchanged(&self) -> bool {
        matches!(self, ColumnValue::Unchanged)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub value: ColumnValue,
}

/// An ordered row image, in the column order of the relation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowImage {
    columns: Vec<Column>,
}

impl RowImage {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    pub fn get(&self, name: &str) -> Option<&ColumnValue> {
        self.columns.iter().find(|c| c.name == name).map(|c| &c.value)
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ColumnValue)> {
        self.columns.iter().map(|c| (c.name.as_str(), &c.value))
    }
}

/// What an old row image contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OldImageKind {
    /// Only the replica identity (key) columns.
    Key,
    /// Every column (`REPLICA IDENTITY FULL`).
    Full,
}

/// One row mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub op: ChangeOperation,
    pub schema: String,
    pub table: String,
    pub old: Option<RowImage>,
    pub old_kind: Option<OldImageKind>,
    pub new: Option<RowImage>,
    pub position: LogPosition,
}

impl ChangeEvent {
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BeginMarker {
    pub xid: u32,
    /// LSN of the transaction's commit record.
    pub final_lsn: LogPosition,
    pub commit_time: DateTime<Utc>,
    pub position: LogPosition,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommitMarker {
    pub commit_lsn: LogPosition,
    /// End of the commit record; the position to confirm once delivered.
    pub end_lsn: LogPosition,
    pub commit_time: DateTime<Utc>,
}

/// Every change of one source transaction, in the order they were made.
///
/// The unit of delivery: sinks receive whole transactions only.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub xid: u32,
    pub commit_lsn: LogPosition,
    pub commit_position: LogPosition,
    pub commit_time: DateTime<Utc>,
    pub events: Vec<ChangeEvent>,
}

impl Transaction {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// One XLogData payload as received from the server.
#[derive(Debug, Clone, PartialEq)]
pub struct WalMessage {
    pub wal_start: LogPosition,
    pub wal_end: LogPosition,
    pub server_time: DateTime<Utc>,
    pub data: bytes::Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_position_display_and_parse() {
        let pos = LogPosition::new(0x16_B374_D848);
        assert_eq!(pos.to_string(), "16/B374D848");
        assert_eq!("16/B374D848".parse::<LogPosition>().unwrap(), pos);
        assert_eq!("0/0".parse::<LogPosition>().unwrap(), LogPosition::ZERO);
        assert!("16B374D848".parse::<LogPosition>().is_err());
        assert!("x/1".parse::<LogPosition>().is_err());
    }

    #[test]
    fn test_log_position_ordering() {
        let a: LogPosition = "0/FFFFFFFF".parse().unwrap();
        let b: LogPosition = "1/0".parse().unwrap();
        assert!(a < b);
        assert_eq!(b.as_u64() - a.as_u64(), 1);
    }

    #[test]
    fn test_log_position_serde() {
        let json = serde_json::to_string(&LogPosition::new(100)).unwrap();
        assert_eq!(json, "\"0/64\"");
        let back: LogPosition = serde_json::from_str(&json).unwrap();
        assert_eq!(back, LogPosition::new(100));
        assert!(serde_json::from_str::<LogPosition>("\"nope\"").is_err());
    }

    #[test]
    fn test_row_image_lookup_keeps_order() {
        let row = RowImage::new(vec![
            Column {
                name: "id".to_string(),
                value: ColumnValue::Int(1),
            },
            Column {
                name: "bio".to_string(),
                value: ColumnValue::Unchanged,
            },
        ]);
        assert_eq!(row.get("id"), Some(&ColumnValue::Int(1)));
        assert!(row.get("bio").unwrap().is_unchanged());
        assert!(row.get("missing").is_none());
        let names: Vec<&str> = row.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["id", "bio"]);
    }
}
