pub mod connection;
pub mod decoder;
pub mod protocol;
pub mod replication;
pub mod types;

pub use connection::{ConnectOptions, ReplicationConnection, SlotInfo, SystemInfo};
pub use decoder::{ColumnInfo, DecodedMessage, PgOutputDecoder, RelationInfo};
pub use replication::{Acknowledger, ReplicationStream, StreamOptions};
pub use types::*;
