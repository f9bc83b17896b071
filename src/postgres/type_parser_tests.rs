use super::*;

#[test]
fn test_bool_parsing() {
    assert_eq!(parse_text_value("t", oid::BOOL), ColumnValue::Bool(true));
    assert_eq!(parse_text_value("f", oid::BOOL), ColumnValue::Bool(false));
    assert_eq!(
        parse_text_value("invalid", oid::BOOL),
        ColumnValue::Text("invalid".to_string())
    );
}

#[test]
fn test_integer_parsing() {
    assert_eq!(parse_text_value("123", oid::INT2), ColumnValue::Int(123));
    assert_eq!(parse_text_value("-456789", oid::INT4), ColumnValue::Int(-456789));
    assert_eq!(parse_text_value("9876543210", oid::INT8), ColumnValue::Int(9876543210));
    assert_eq!(parse_text_value("4294967295", oid::OID), ColumnValue::Int(4294967295));
    assert_eq!(
        parse_text_value("12a", oid::INT4),
        ColumnValue::Text("12a".to_string())
    );
}

#[test]
fn test_float_parsing() {
    match parse_text_value("3.14", oid::FLOAT4) {
        ColumnValue::Float(v) => assert!((v - 3.14).abs() < 0.001),
        other => panic!("Expected float, got {:?}", other),
    }
    assert_eq!(parse_text_value("2.5", oid::FLOAT8), ColumnValue::Float(2.5));
    // Non-finite values have no JSON number form, so they stay textual.
    assert_eq!(parse_text_value("NaN", oid::FLOAT8), ColumnValue::Text("NaN".to_string()));
    assert_eq!(
        parse_text_value("-Infinity", oid::FLOAT4),
        ColumnValue::Text("-Infinity".to_string())
    );
}

#[test]
fn test_text_like_types_pass_through() {
    assert_eq!(
        parse_text_value("Hello, World!", oid::TEXT),
        ColumnValue::Text("Hello, World!".to_string())
    );
    // numeric keeps its exact textual form
    assert_eq!(
        parse_text_value("123.456789", 1700),
        ColumnValue::Text("123.456789".to_string())
    );
    assert_eq!(
        parse_text_value("2023-10-15 10:30:00+00", 1184),
        ColumnValue::Text("2023-10-15 10:30:00+00".to_string())
    );
    assert_eq!(
        parse_text_value("{1,2,3}", 1007),
        ColumnValue::Text("{1,2,3}".to_string())
    );
}

#[test]
fn test_bytea_hex_parsing() {
    assert_eq!(
        parse_text_value("\\xdeadBEEF", oid::BYTEA),
        ColumnValue::Bytes(vec![0xde, 0xad, 0xbe, 0xef])
    );
    assert_eq!(parse_text_value("\\x", oid::BYTEA), ColumnValue::Bytes(vec![]));
    assert_eq!(
        parse_text_value("\\xabc", oid::BYTEA),
        ColumnValue::Text("\\xabc".to_string())
    );
    // A sign is not a hex digit.
    assert_eq!(
        parse_text_value("\\x+f", oid::BYTEA),
        ColumnValue::Text("\\x+f".to_string())
    );
    assert_eq!(
        parse_text_value("\\xzz", oid::BYTEA),
        ColumnValue::Text("\\xzz".to_string())
    );
    assert_eq!(
        parse_text_value("escape\\000", oid::BYTEA),
        ColumnValue::Text("escape\\000".to_string())
    );
}

#[test]
fn test_json_parsing() {
    let json_text = r#"{"key": "value", "number": 42}"#;
    match parse_text_value(json_text, oid::JSONB) {
        ColumnValue::Json(value) => {
            assert_eq!(value["key"], "value");
            assert_eq!(value["number"], 42);
        }
        other => panic!("Expected json, got {:?}", other),
    }

    let invalid = r#"{"invalid": json"#;
    assert_eq!(
        parse_text_value(invalid, oid::JSON),
        ColumnValue::Text(invalid.to_string())
    );
}

#[test]
fn test_binary_scalars() {
    assert_eq!(parse_binary_value(&[1], oid::BOOL), ColumnValue::Bool(true));
    assert_eq!(parse_binary_value(&[0], oid::BOOL), ColumnValue::Bool(false));
    assert_eq!(
        parse_binary_value(&123i16.to_be_bytes(), oid::INT2),
        ColumnValue::Int(123)
    );
    assert_eq!(
        parse_binary_value(&(-7i32).to_be_bytes(), oid::INT4),
        ColumnValue::Int(-7)
    );
    assert_eq!(
        parse_binary_value(&9876543210i64.to_be_bytes(), oid::INT8),
        ColumnValue::Int(9876543210)
    );
    assert_eq!(
        parse_binary_value(&2.5f64.to_be_bytes(), oid::FLOAT8),
        ColumnValue::Float(2.5)
    );
    assert_eq!(
        parse_binary_value(b"hi", oid::VARCHAR),
        ColumnValue::Text("hi".to_string())
    );
}

#[test]
fn test_binary_jsonb_has_version_prefix() {
    let mut data = vec![1u8];
    data.extend_from_slice(br#"{"a":1}"#);
    match parse_binary_value(&data, oid::JSONB) {
        ColumnValue::Json(value) => assert_eq!(value["a"], 1),
        other => panic!("Expected json, got {:?}", other),
    }
}

#[test]
fn test_binary_fallback_keeps_raw_bytes() {
    // Wrong width for the declared type.
    assert_eq!(parse_binary_value(&[], oid::BOOL), ColumnValue::Bytes(vec![]));
    assert_eq!(
        parse_binary_value(&[0, 1, 2], oid::INT4),
        ColumnValue::Bytes(vec![0, 1, 2])
    );
    assert_eq!(
        parse_binary_value(&f64::NAN.to_be_bytes(), oid::FLOAT8),
        ColumnValue::Bytes(f64::NAN.to_be_bytes().to_vec())
    );
    // uuid has no typed mapping
    assert_eq!(
        parse_binary_value(&[0x55; 16], 2950),
        ColumnValue::Bytes(vec![0x55; 16])
    );
}
