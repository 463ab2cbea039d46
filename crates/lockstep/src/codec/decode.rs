use std::collections::{BTreeMap, BTreeSet};

use super::value::is_canonical_decimal;
use super::{BigInt, CodecError, TypeRegistry, WireObject, WireValue};

/// Deepest container nesting accepted by the decoder.
pub const MAX_DEPTH: usize = 128;

/// Decodes exactly one value; trailing bytes are an error.
pub fn decode(bytes: &[u8], registry: &TypeRegistry) -> Result<WireValue, CodecError> {
    let mut decoder = Decoder::new(bytes, registry);
    let value = decoder.value(0)?;
    if decoder.cursor != bytes.len() {
        return Err(decoder.error("trailing bytes after value"));
    }
    Ok(value)
}

/// Decodes a concatenation of values until the input is exhausted.
pub fn decode_all(bytes: &[u8], registry: &TypeRegistry) -> Result<Vec<WireValue>, CodecError> {
    let mut decoder = Decoder::new(bytes, registry);
    let mut values = Vec::new();
    while decoder.cursor < bytes.len() {
        values.push(decoder.value(0)?);
    }
    Ok(values)
}

struct Decoder<'a> {
    bytes: &'a [u8],
    cursor: usize,
    registry: &'a TypeRegistry,
}

impl<'a> Decoder<'a> {
    fn new(bytes: &'a [u8], registry: &'a TypeRegistry) -> Self {
        Self {
            bytes,
            cursor: 0,
            registry,
        }
    }

    fn value(&mut self, depth: usize) -> Result<WireValue, CodecError> {
        let tag_position = self.cursor;
        let tag = self.next_byte()?;
        if is_container_tag(tag) && depth >= MAX_DEPTH {
            return Err(error_at(tag_position, "nesting too deep"));
        }
        match tag {
            b'n' => Ok(WireValue::Null),
            b'b' => match self.next_byte()? {
                b't' => Ok(WireValue::Bool(true)),
                b'f' => Ok(WireValue::Bool(false)),
                _ => Err(error_at(self.cursor - 1, "invalid bool payload")),
            },
            b'i' => {
                let start = self.cursor;
                let digits = self.signed_digits()?;
                digits
                    .parse::<i64>()
                    .map(WireValue::Int)
                    .map_err(|_| error_at(start, "int out of 64-bit range"))
            }
            b'I' => {
                let digits = self.signed_digits()?;
                Ok(WireValue::BigInt(BigInt::from_canonical(digits)))
            }
            b's' => self.text_body().map(WireValue::Text),
            b'l' => self.elements(depth).map(WireValue::List),
            b't' => self.elements(depth).map(WireValue::Tuple),
            b'z' => self.ordered_set(depth).map(WireValue::Set),
            b'f' => self.ordered_set(depth).map(WireValue::FrozenSet),
            b'd' => self.ordered_map(depth).map(WireValue::Map),
            b'o' => self.object(depth).map(WireValue::Object),
            _ => Err(error_at(tag_position, "unknown type tag")),
        }
    }

    fn elements(&mut self, depth: usize) -> Result<Vec<WireValue>, CodecError> {
        let len = self.length()?;
        let mut items = Vec::with_capacity(len.min(self.remaining()));
        for _ in 0..len {
            items.push(self.value(depth + 1)?);
        }
        Ok(items)
    }

    fn ordered_set(&mut self, depth: usize) -> Result<BTreeSet<WireValue>, CodecError> {
        let len = self.length()?;
        let mut items = BTreeSet::new();
        for _ in 0..len {
            let position = self.cursor;
            let item = self.value(depth + 1)?;
            if items.last().is_some_and(|last| *last >= item) {
                return Err(error_at(position, "set members not in canonical order"));
            }
            items.insert(item);
        }
        Ok(items)
    }

    fn ordered_map(&mut self, depth: usize) -> Result<BTreeMap<WireValue, WireValue>, CodecError> {
        let len = self.length()?;
        let mut entries = BTreeMap::new();
        for _ in 0..len {
            let position = self.cursor;
            let key = self.value(depth + 1)?;
            if entries
                .last_key_value()
                .is_some_and(|(last, _)| *last >= key)
            {
                return Err(error_at(position, "map keys not in canonical order"));
            }
            let entry = self.value(depth + 1)?;
            entries.insert(key, entry);
        }
        Ok(entries)
    }

    fn object(&mut self, depth: usize) -> Result<WireObject, CodecError> {
        let name_position = self.cursor;
        let type_name = self.tagged_text()?;
        let schema = self
            .registry
            .schema(&type_name)
            .ok_or_else(|| CodecError::UnknownType {
                type_name: type_name.clone(),
                position: name_position,
            })?;

        let count_position = self.cursor;
        let len = self.length()?;
        self.expect_byte(b':')?;
        if len != schema.fields.len() {
            return Err(error_at(count_position, "object field count does not match schema"));
        }

        let mut fields = Vec::with_capacity(len);
        for declared in &schema.fields {
            let field_position = self.cursor;
            let name = self.tagged_text()?;
            if name != *declared {
                return Err(error_at(field_position, "object field name does not match schema"));
            }
            let value = self.value(depth + 1)?;
            fields.push((name, value));
        }
        Ok(WireObject { type_name, fields })
    }

    fn tagged_text(&mut self) -> Result<String, CodecError> {
        let position = self.cursor;
        if self.next_byte()? != b's' {
            return Err(error_at(position, "expected text"));
        }
        self.text_body()
    }

    fn text_body(&mut self) -> Result<String, CodecError> {
        let count = self.length()?;
        self.expect_byte(b':')?;
        let start = self.cursor;
        let mut end = start;
        for _ in 0..count {
            let lead = *self
                .bytes
                .get(end)
                .ok_or_else(|| error_at(end, "unexpected end of input"))?;
            let width = utf8_width(lead).ok_or_else(|| error_at(end, "invalid utf-8 in text"))?;
            if end + width > self.bytes.len() {
                return Err(error_at(self.bytes.len(), "unexpected end of input"));
            }
            end += width;
        }
        let text = std::str::from_utf8(&self.bytes[start..end])
            .map_err(|_| error_at(start, "invalid utf-8 in text"))?;
        self.cursor = end;
        Ok(text.to_string())
    }

    fn length(&mut self) -> Result<usize, CodecError> {
        let start = self.cursor;
        let digits = self.digit_run();
        if digits.is_empty() {
            return Err(error_at(start, "expected length digits"));
        }
        if !is_canonical_decimal(digits) {
            return Err(error_at(start, "non-canonical length"));
        }
        digits
            .parse::<usize>()
            .map_err(|_| error_at(start, "length out of range"))
    }

    fn signed_digits(&mut self) -> Result<&'a str, CodecError> {
        let start = self.cursor;
        if self.bytes.get(self.cursor) == Some(&b'-') {
            self.cursor += 1;
        }
        self.digit_run();
        let bytes = self.bytes;
        let text = std::str::from_utf8(&bytes[start..self.cursor])
            .map_err(|_| error_at(start, "invalid number"))?;
        if !is_canonical_decimal(text) {
            return Err(error_at(start, "non-canonical integer"));
        }
        Ok(text)
    }

    fn digit_run(&mut self) -> &'a str {
        let start = self.cursor;
        while self
            .bytes
            .get(self.cursor)
            .is_some_and(|byte| byte.is_ascii_digit())
        {
            self.cursor += 1;
        }
        let bytes = self.bytes;
        // ASCII digits are always valid UTF-8.
        std::str::from_utf8(&bytes[start..self.cursor]).unwrap_or_default()
    }

    fn expect_byte(&mut self, expected: u8) -> Result<(), CodecError> {
        let position = self.cursor;
        if self.next_byte()? != expected {
            return Err(error_at(position, "unexpected delimiter"));
        }
        Ok(())
    }

    fn next_byte(&mut self) -> Result<u8, CodecError> {
        let byte = *self
            .bytes
            .get(self.cursor)
            .ok_or_else(|| error_at(self.cursor, "unexpected end of input"))?;
        self.cursor += 1;
        Ok(byte)
    }

    fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.cursor)
    }

    fn error(&self, reason: &'static str) -> CodecError {
        error_at(self.cursor, reason)
    }
}

fn is_container_tag(tag: u8) -> bool {
    matches!(tag, b'l' | b't' | b'z' | b'f' | b'd' | b'o')
}

fn utf8_width(lead: u8) -> Option<usize> {
    match lead {
        0x00..=0x7F => Some(1),
        0xC2..=0xDF => Some(2),
        0xE0..=0xEF => Some(3),
        0xF0..=0xF4 => Some(4),
        _ => None,
    }
}

fn error_at(position: usize, reason: &'static str) -> CodecError {
    CodecError::Decode { position, reason }
}
