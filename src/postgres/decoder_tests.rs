use super::*;
use crate::testing::pgoutput::{self, text, Datum, USERS};

fn decoder_with_users() -> PgOutputDecoder {
    let mut decoder = PgOutputDecoder::new();
    decoder
        .decode(&pgoutput::wal(0x10, pgoutput::users_relation()))
        .unwrap();
    decoder
}

fn change(decoded: DecodedMessage) -> ChangeEvent {
    match decoded {
        DecodedMessage::Change(event) => event,
        other => panic!("Expected change, got {:?}", other),
    }
}

#[test]
fn test_decode_begin_message() {
    let mut decoder = PgOutputDecoder::new();
    let msg = pgoutput::wal(0x100, pgoutput::begin(0x200, 731));

    match decoder.decode(&msg).unwrap() {
        DecodedMessage::Begin(begin) => {
            assert_eq!(begin.xid, 731);
            assert_eq!(begin.final_lsn, LogPosition::new(0x200));
            assert_eq!(begin.position, LogPosition::new(0x100));
            assert_eq!(begin.commit_time.timestamp(), 946_684_800 + 750_000_000);
        }
        other => panic!("Expected begin, got {:?}", other),
    }
}

#[test]
fn test_decode_commit_message() {
    let mut decoder = PgOutputDecoder::new();
    let msg = pgoutput::wal(0x200, pgoutput::commit(0x200, 0x230));

    match decoder.decode(&msg).unwrap() {
        DecodedMessage::Commit(commit) => {
            assert_eq!(commit.commit_lsn, LogPosition::new(0x200));
            assert_eq!(commit.end_lsn, LogPosition::new(0x230));
        }
        other => panic!("Expected commit, got {:?}", other),
    }
}

#[test]
fn test_decode_relation_message() {
    let decoder = decoder_with_users();
    let relation = decoder.relation(USERS).unwrap();
    assert_eq!(relation.schema, "public");
    assert_eq!(relation.table, "users");
    assert_eq!(relation.replica_identity, b'd');
    let names: Vec<&str> = relation.columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["id", "name", "bio"]);
    assert!(relation.columns[0].is_key);
    assert!(!relation.columns[1].is_key);
    assert_eq!(relation.columns[0].type_id, oid::INT4);
}

#[test]
fn test_relation_message_replaces_cached_definition() {
    let mut decoder = decoder_with_users();
    let altered = pgoutput::relation(
        USERS,
        "public",
        "users",
        b'f',
        &[("id", oid::INT8, true), ("email", oid::TEXT, false)],
    );
    decoder.decode(&pgoutput::wal(0x20, altered)).unwrap();

    let event = change(
        decoder
            .decode(&pgoutput::wal(0x30, pgoutput::insert(USERS, &text(&["1", "a@b.c"]))))
            .unwrap(),
    );
    let new = event.new.unwrap();
    assert_eq!(new.len(), 2);
    assert_eq!(new.get("email"), Some(&ColumnValue::Text("a@b.c".to_string())));
}

#[test]
fn test_decode_insert_message() {
    let mut decoder = decoder_with_users();
    let msg = pgoutput::wal(
        0x120,
        pgoutput::insert(USERS, &[Datum::from("42"), Datum::from("ada"), Datum::Null]),
    );

    let event = change(decoder.decode(&msg).unwrap());
    assert_eq!(event.op, ChangeOperation::Insert);
    assert_eq!(event.qualified_table(), "public.users");
    assert_eq!(event.position, LogPosition::new(0x120));
    assert!(event.old.is_none());

    let new = event.new.unwrap();
    assert_eq!(new.get("id"), Some(&ColumnValue::Int(42)));
    assert_eq!(new.get("name"), Some(&ColumnValue::Text("ada".to_string())));
    assert_eq!(new.get("bio"), Some(&ColumnValue::Null));
}

#[test]
fn test_decode_update_with_full_old_image() {
    let mut decoder = decoder_with_users();
    let old = text(&["1", "before", "same"]);
    let new = text(&["1", "after", "same"]);
    let msg = pgoutput::wal(0x130, pgoutput::update(USERS, Some((b'O', &old)), &new));

    let event = change(decoder.decode(&msg).unwrap());
    assert_eq!(event.op, ChangeOperation::Update);
    assert_eq!(event.old_kind, Some(OldImageKind::Full));
    assert_eq!(
        event.old.unwrap().get("name"),
        Some(&ColumnValue::Text("before".to_string()))
    );
    // The new tuple is read after the old one, not from the start.
    assert_eq!(
        event.new.unwrap().get("name"),
        Some(&ColumnValue::Text("after".to_string()))
    );
}

#[test]
fn test_decode_update_with_key_image_keeps_only_key_columns() {
    let mut decoder = decoder_with_users();
    let key = [Datum::from("7"), Datum::Null, Datum::Null];
    let new = text(&["8", "x", "y"]);
    let msg = pgoutput::wal(0x140, pgoutput::update(USERS, Some((b'K', &key)), &new));

    let event = change(decoder.decode(&msg).unwrap());
    assert_eq!(event.old_kind, Some(OldImageKind::Key));
    let old = event.old.unwrap();
    assert_eq!(old.len(), 1);
    assert_eq!(old.get("id"), Some(&ColumnValue::Int(7)));
    assert_eq!(event.new.unwrap().get("id"), Some(&ColumnValue::Int(8)));
}

#[test]
fn test_unchanged_toast_is_not_null() {
    let mut decoder = decoder_with_users();
    let new = [Datum::from("1"), Datum::Null, Datum::Unchanged];
    let msg = pgoutput::wal(0x150, pgoutput::update(USERS, None, &new));

    let event = change(decoder.decode(&msg).unwrap());
    assert!(event.old.is_none());
    assert!(event.old_kind.is_none());
    let new = event.new.unwrap();
    assert!(new.get("name").unwrap().is_null());
    assert!(new.get("bio").unwrap().is_unchanged());
    assert!(!new.get("bio").unwrap().is_null());
}

#[test]
fn test_decode_delete_message() {
    let mut decoder = decoder_with_users();
    let key = [Datum::from("9"), Datum::Null, Datum::Null];
    let msg = pgoutput::wal(0x160, pgoutput::delete(USERS, b'K', &key));

    let event = change(decoder.decode(&msg).unwrap());
    assert_eq!(event.op, ChangeOperation::Delete);
    assert!(event.new.is_none());
    assert_eq!(event.old_kind, Some(OldImageKind::Key));
    assert_eq!(event.old.unwrap().get("id"), Some(&ColumnValue::Int(9)));
}

#[test]
fn test_decode_truncate_expands_per_relation() {
    let mut decoder = decoder_with_users();
    decoder
        .decode(&pgoutput::wal(
            0x20,
            pgoutput::relation(17000, "audit", "log", b'd', &[("id", oid::INT8, true)]),
        ))
        .unwrap();

    match decoder
        .decode(&pgoutput::wal(0x170, pgoutput::truncate(&[USERS, 17000])))
        .unwrap()
    {
        DecodedMessage::Truncate(events) => {
            let tables: Vec<String> = events.iter().map(|e| e.qualified_table()).collect();
            assert_eq!(tables, vec!["public.users", "audit.log"]);
            assert!(events.iter().all(|e| e.op == ChangeOperation::Truncate));
            assert!(events.iter().all(|e| e.position == LogPosition::new(0x170)));
        }
        other => panic!("Expected truncate, got {:?}", other),
    }
}

#[test]
fn test_binary_tuple_values() {
    let mut decoder = decoder_with_users();
    let values = [
        Datum::Binary(5i32.to_be_bytes().to_vec()),
        Datum::Binary(b"bin".to_vec()),
        Datum::Null,
    ];
    let event = change(
        decoder
            .decode(&pgoutput::wal(0x180, pgoutput::insert(USERS, &values)))
            .unwrap(),
    );
    let new = event.new.unwrap();
    assert_eq!(new.get("id"), Some(&ColumnValue::Int(5)));
    assert_eq!(new.get("name"), Some(&ColumnValue::Text("bin".to_string())));
}

#[test]
fn test_skipped_message_types() {
    let mut decoder = PgOutputDecoder::new();
    let msg = pgoutput::wal(0x10, pgoutput::logical_message("app", b"hello"));
    assert_eq!(decoder.decode(&msg).unwrap(), DecodedMessage::Ignored('M'));
}

#[test]
fn test_unknown_relation_is_an_error() {
    let mut decoder = PgOutputDecoder::new();
    let msg = pgoutput::wal(0x190, pgoutput::insert(99, &text(&["1"])));
    let err = decoder.decode(&msg).unwrap_err();
    match err {
        Error::Decode { position, message } => {
            assert_eq!(position, LogPosition::new(0x190));
            assert!(message.contains("unknown relation id 99"));
        }
        other => panic!("Expected decode error, got {:?}", other),
    }
}

#[test]
fn test_error_handling() {
    let mut decoder = decoder_with_users();

    // Unknown message type
    let msg = pgoutput::wal(0x1, Bytes::from_static(b"Zjunk"));
    assert!(matches!(decoder.decode(&msg), Err(Error::Decode { .. })));

    // Empty payload
    let msg = pgoutput::wal(0x1, Bytes::new());
    assert!(matches!(decoder.decode(&msg), Err(Error::Decode { .. })));

    // Truncated BEGIN
    let msg = pgoutput::wal(0x1, Bytes::from_static(b"B\x00\x00"));
    assert!(matches!(decoder.decode(&msg), Err(Error::Decode { .. })));

    // Column count that does not match the relation
    let msg = pgoutput::wal(0x1, pgoutput::insert(USERS, &text(&["1"])));
    assert!(matches!(decoder.decode(&msg), Err(Error::Decode { .. })));

    // Unterminated relation name
    let msg = pgoutput::wal(0x1, Bytes::from_static(b"R\x00\x00\x00\x01public"));
    assert!(matches!(decoder.decode(&msg), Err(Error::Decode { .. })));

    // Unknown column kind
    let mut payload = pgoutput::insert(USERS, &text(&["1", "a", "b"])).to_vec();
    let kind_at = 1 + 4 + 1 + 2;
    payload[kind_at] = b'?';
    let msg = pgoutput::wal(0x1, Bytes::from(payload));
    assert!(matches!(decoder.decode(&msg), Err(Error::Decode { .. })));
}
