//! Result classification shared by every script backend.

use serde::Serialize;
use std::fmt;

/// The closed set of classifications an evaluation can produce.
///
/// This is the engine's entire observable output surface: compound values are
/// reported by kind only, never decoded.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum TaggedValue {
    /// No value at all.
    None,
    /// Evaluation completed without producing a value.
    Undefined,
    /// The null value.
    Null,
    Bool(bool),
    /// Numbers surface as 64-bit floats.
    Number(f64),
    /// Text, decoded one byte per character.
    String(String),
    Object,
    Buffer,
    Pointer,
    LightFunc,
    Unknown,
}

impl TaggedValue {
    /// Short lowercase name of the classification.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Object => "object",
            Self::Buffer => "buffer",
            Self::Pointer => "pointer",
            Self::LightFunc => "light_func",
            Self::Unknown => "unknown",
        }
    }

    /// Build a `String` value from single-byte encoded text.
    pub fn from_latin1(bytes: &[u8]) -> Self {
        Self::String(decode_latin1(bytes))
    }

    /// The number, if this is a `Number`.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// The text, if this is a `String`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for TaggedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s:?}"),
            other => f.write_str(other.kind()),
        }
    }
}

/// Decode bytes as ISO-8859-1: every byte maps to the code point of equal value.
pub fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Encode text as ISO-8859-1.
///
/// Returns the first character above U+00FF and its char index on failure.
pub fn encode_latin1(text: &str) -> Result<Vec<u8>, (char, usize)> {
    text.chars()
        .enumerate()
        .map(|(i, ch)| u8::try_from(u32::from(ch)).map_err(|_| (ch, i)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latin1_round_trip_high_bytes() {
        let bytes: Vec<u8> = vec![b'c', b'a', b'f', 0xE9];
        let text = decode_latin1(&bytes);
        assert_eq!(text, "café");
        assert_eq!(encode_latin1(&text).unwrap(), bytes);
    }

    #[test]
    fn test_encode_rejects_wide_chars() {
        assert_eq!(encode_latin1("ok €"), Err(('€', 3)));
        assert_eq!(encode_latin1("日本"), Err(('日', 0)));
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(TaggedValue::Null.kind(), "null");
        assert_eq!(TaggedValue::Number(1.0).kind(), "number");
        assert_eq!(TaggedValue::LightFunc.kind(), "light_func");
    }

    #[test]
    fn test_serialized_shape() {
        let json = serde_json::to_value(TaggedValue::Number(4.0)).unwrap();
        assert_eq!(json, serde_json::json!({"type": "number", "value": 4.0}));

        let json = serde_json::to_value(TaggedValue::Null).unwrap();
        assert_eq!(json, serde_json::json!({"type": "null"}));
    }

    #[test]
    fn test_display() {
        assert_eq!(TaggedValue::Bool(true).to_string(), "true");
        assert_eq!(TaggedValue::String("x".into()).to_string(), "\"x\"");
        assert_eq!(TaggedValue::Object.to_string(), "object");
    }
}
