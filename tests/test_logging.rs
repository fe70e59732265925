//! Tests for logging configuration and format parsing

use mqlight::observability::logging::{parse_level, LogFormat};
use tracing::Level;

#[test]
fn test_log_format_parse_json() {
    assert_eq!(LogFormat::parse("json"), LogFormat::Json);
    assert_eq!(LogFormat::parse("JSON"), LogFormat::Json);
}

#[test]
fn test_log_format_parse_pretty_and_compact() {
    assert_eq!(LogFormat::parse("Pretty"), LogFormat::Pretty);
    assert_eq!(LogFormat::parse("compact"), LogFormat::Compact);
}

#[test]
fn test_log_format_parse_invalid_defaults_to_json() {
    for input in ["invalid", "", "xml", "123"] {
        assert_eq!(LogFormat::parse(input), LogFormat::Json, "input {input:?}");
    }
}

#[test]
fn test_log_level_parsing() {
    let cases = [
        ("ERROR", Level::ERROR),
        ("warn", Level::WARN),
        ("INFO", Level::INFO),
        ("Debug", Level::DEBUG),
        ("trace", Level::TRACE),
        ("verbose", Level::INFO),
    ];

    for (input, expected) in cases {
        assert_eq!(parse_level(input), expected, "Failed for input: {input}");
    }
}
