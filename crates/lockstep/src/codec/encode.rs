use super::{CodecError, TypeRegistry, WireObject, WireValue, MAX_DEPTH};

pub fn encode(value: &WireValue, registry: &TypeRegistry) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    encode_into(value, registry, &mut out)?;
    Ok(out)
}

/// Appends the encoding of `value` to `out`. On error `out` may hold a
/// partial encoding.
pub fn encode_into(
    value: &WireValue,
    registry: &TypeRegistry,
    out: &mut Vec<u8>,
) -> Result<(), CodecError> {
    encode_value(value, registry, out, 0)
}

/// Containers nested past `MAX_DEPTH` are refused here exactly as the
/// decoder refuses them.
fn encode_value(
    value: &WireValue,
    registry: &TypeRegistry,
    out: &mut Vec<u8>,
    depth: usize,
) -> Result<(), CodecError> {
    if value.is_container() && depth >= MAX_DEPTH {
        return Err(CodecError::NestingTooDeep { limit: MAX_DEPTH });
    }
    match value {
        WireValue::Null => out.push(b'n'),
        WireValue::Bool(flag) => {
            out.push(b'b');
            out.push(if *flag { b't' } else { b'f' });
        }
        WireValue::Int(number) => {
            out.push(b'i');
            write_decimal(out, *number);
        }
        WireValue::BigInt(number) => {
            out.push(b'I');
            out.extend_from_slice(number.as_decimal().as_bytes());
        }
        WireValue::Text(text) => write_text(out, text),
        WireValue::List(items) => {
            write_sequence(out, b'l', items.iter(), items.len(), registry, depth)?
        }
        WireValue::Tuple(items) => {
            write_sequence(out, b't', items.iter(), items.len(), registry, depth)?
        }
        WireValue::Set(items) => {
            write_sequence(out, b'z', items.iter(), items.len(), registry, depth)?
        }
        WireValue::FrozenSet(items) => {
            write_sequence(out, b'f', items.iter(), items.len(), registry, depth)?
        }
        WireValue::Map(entries) => {
            out.push(b'd');
            write_len(out, entries.len());
            for (key, entry) in entries {
                encode_value(key, registry, out, depth + 1)?;
                encode_value(entry, registry, out, depth + 1)?;
            }
        }
        WireValue::Object(object) => write_object(out, object, registry, depth)?,
    }
    Ok(())
}

fn write_sequence<'a>(
    out: &mut Vec<u8>,
    tag: u8,
    items: impl Iterator<Item = &'a WireValue>,
    len: usize,
    registry: &TypeRegistry,
    depth: usize,
) -> Result<(), CodecError> {
    out.push(tag);
    write_len(out, len);
    for item in items {
        encode_value(item, registry, out, depth + 1)?;
    }
    Ok(())
}

fn write_object(
    out: &mut Vec<u8>,
    object: &WireObject,
    registry: &TypeRegistry,
    depth: usize,
) -> Result<(), CodecError> {
    let schema = registry
        .schema(&object.type_name)
        .ok_or_else(|| CodecError::UnregisteredType {
            type_name: object.type_name.clone(),
        })?;

    out.push(b'o');
    write_text(out, &schema.type_name);
    write_len(out, schema.fields.len());
    out.push(b':');
    for declared in &schema.fields {
        let value = object
            .field(declared)
            .ok_or_else(|| CodecError::MissingField {
                type_name: schema.type_name.clone(),
                field: declared.clone(),
            })?;
        write_text(out, declared);
        encode_value(value, registry, out, depth + 1)?;
    }
    Ok(())
}

fn write_text(out: &mut Vec<u8>, text: &str) {
    out.push(b's');
    write_len(out, text.chars().count());
    out.push(b':');
    out.extend_from_slice(text.as_bytes());
}

fn write_len(out: &mut Vec<u8>, len: usize) {
    out.extend_from_slice(len.to_string().as_bytes());
}

fn write_decimal(out: &mut Vec<u8>, number: i64) {
    out.extend_from_slice(number.to_string().as_bytes());
}
