//! Frame encoding: the line-oriented key/value message
//! contract the FCP-style control surface exchanges, independent of
//! whatever socket or HTTP transport ships the bytes (that transport is
//! out of scope here).
//!
//! Wire shape:
//! ```text
//! <Message>
//! Key1=Value1
//! Key2=Value2
//! EndMessage
//! ```

use crate::error::{WotError, WotResult};

const TERMINATOR: &str = "EndMessage";

/// One parsed or to-be-encoded frame: a message name plus an ordered set
/// of key/value fields. Order is preserved (a `Vec`, not a map) so
/// `<Collection>.<i>.<Field>` fields round-trip in insertion order, which
/// matters to a client iterating a collection response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Frame {
    message: String,
    fields: Vec<(String, String)>,
}

impl Frame {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fields: Vec::new(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Sets `key=value`, overwriting a previous value for the same key.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let key = key.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((key, value)),
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Sets `"{collection}.{index}.{field}" = value`.
    pub fn set_indexed(
        &mut self,
        collection: &str,
        index: usize,
        field: &str,
        value: impl Into<String>,
    ) -> &mut Self {
        self.set(format!("{collection}.{index}.{field}"), value)
    }

    /// Sets `"{collection}.Amount" = count`.
    pub fn set_amount(&mut self, collection: &str, count: usize) -> &mut Self {
        self.set(format!("{collection}.Amount"), count.to_string())
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Serializes to the line-oriented wire shape.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = String::new();
        out.push_str(&self.message);
        out.push('\n');
        for (key, value) in &self.fields {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        out.push_str(TERMINATOR);
        out.push('\n');
        out.into_bytes()
    }

    /// Parses one frame from its wire shape. Unrecognized lines without an
    /// `=` before the terminator are a corrupted-data error; a field line
    /// with no `=` separator at all likewise fails to parse.
    pub fn parse(bytes: &[u8]) -> WotResult<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| WotError::CorruptedData(format!("frame is not valid utf-8: {e}")))?;
        let mut lines = text.lines();
        let message = lines
            .next()
            .ok_or_else(|| WotError::CorruptedData("empty frame".into()))?
            .to_string();

        let mut fields = Vec::new();
        for line in lines {
            if line == TERMINATOR {
                return Ok(Self { message, fields });
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                WotError::CorruptedData(format!("frame line missing '=' separator: {line:?}"))
            })?;
            fields.push((key.to_string(), value.to_string()));
        }
        Err(WotError::CorruptedData(format!(
            "frame missing {TERMINATOR} terminator"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_wire_encoding() {
        let mut frame = Frame::new("Identity");
        frame.set("Identity", "AAAA");
        frame.set_indexed("Trusts", 0, "Value", "10");
        frame.set_amount("Trusts", 1);

        let bytes = frame.encode();
        let parsed = Frame::parse(&bytes).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn set_overwrites_existing_key_in_place() {
        let mut frame = Frame::new("Ping");
        frame.set("A", "1");
        frame.set("B", "2");
        frame.set("A", "3");
        assert_eq!(frame.get("A"), Some("3"));
        assert_eq!(frame.fields().collect::<Vec<_>>(), vec![("A", "3"), ("B", "2")]);
    }

    #[test]
    fn parse_rejects_missing_terminator() {
        let err = Frame::parse(b"Ping\nFoo=Bar\n").unwrap_err();
        assert!(matches!(err, WotError::CorruptedData(_)));
    }

    #[test]
    fn parse_rejects_field_without_separator() {
        let err = Frame::parse(b"Ping\nFooBar\nEndMessage\n").unwrap_err();
        assert!(matches!(err, WotError::CorruptedData(_)));
    }
}
