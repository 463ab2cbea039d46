use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

use crate::atomic_io::write_bytes_atomic;
use crate::codec::{
    decode_all, encode_into, BigInt, CodecError, TypeRegistry, WireEncodable, WireValue,
};
use crate::command::{Command, Tick};
use crate::hashing::{sha256_bytes, DIGEST_LEN};

const MAGIC: &[u8; 4] = b"LSCS";
const HEADER_LEN: usize = MAGIC.len() + 2 + 4 + 4 + DIGEST_LEN;
pub const STREAM_FORMAT_VERSION: u16 = 1;

/// A committed tick as stored in a command stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickRecord {
    pub tick_id: u64,
    pub commands: Vec<Command>,
}

impl From<&Tick> for TickRecord {
    fn from(tick: &Tick) -> Self {
        Self {
            tick_id: tick.id,
            commands: tick.commands.clone(),
        }
    }
}

/// Closes one tick's batch inside a stream payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TickEnd {
    pub tick: u64,
    pub count: u64,
}

impl WireEncodable for TickEnd {
    const TYPE_NAME: &'static str = "TickEnd";
    const FIELDS: &'static [&'static str] = &["tick", "count"];

    fn to_fields(&self) -> Vec<WireValue> {
        vec![wire_u64(self.tick), wire_u64(self.count)]
    }

    fn from_fields(fields: Vec<WireValue>) -> Result<Self, CodecError> {
        let [tick, count]: [WireValue; 2] =
            fields.try_into().map_err(|_| CodecError::TypeMismatch {
                expected: Self::TYPE_NAME,
                found: "wrong field count".to_string(),
            })?;
        Ok(Self {
            tick: expect_u64(&tick, "tick")?,
            count: expect_u64(&count, "count")?,
        })
    }
}

fn wire_u64(value: u64) -> WireValue {
    match i64::try_from(value) {
        Ok(small) => WireValue::Int(small),
        Err(_) => WireValue::BigInt(BigInt::from(u128::from(value))),
    }
}

fn expect_u64(value: &WireValue, field: &'static str) -> Result<u64, CodecError> {
    let parsed = match value {
        WireValue::Int(small) => u64::try_from(*small).ok(),
        WireValue::BigInt(big) => big.as_decimal().parse::<u64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| CodecError::FieldType {
        type_name: TickEnd::TYPE_NAME,
        field,
        expected: "non-negative int",
        found: value.kind(),
    })
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("failed to read/write file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("stream at {path} has an undecodable payload: {source}")]
    Codec {
        path: PathBuf,
        #[source]
        source: CodecError,
    },
    #[error("stream at {path} has invalid format: {message}")]
    InvalidFormat { path: PathBuf, message: String },
}

/// Concatenated `Command` objects, in queue order.
pub fn encode_command_batch(
    commands: &[Command],
    registry: &TypeRegistry,
) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    for command in commands {
        encode_into(&command.to_wire(), registry, &mut out)?;
    }
    Ok(out)
}

pub fn decode_command_batch(
    bytes: &[u8],
    registry: &TypeRegistry,
) -> Result<Vec<Command>, CodecError> {
    decode_all(bytes, registry)?
        .into_iter()
        .map(Command::from_wire)
        .collect()
}

pub fn write_command_stream(
    path: &Path,
    records: &[TickRecord],
    registry: &TypeRegistry,
) -> Result<(), StreamError> {
    let payload = encode_payload(records, registry).map_err(|source| StreamError::Codec {
        path: path.to_path_buf(),
        source,
    })?;
    let tick_count = u32::try_from(records.len())
        .map_err(|_| invalid_format(path, "too many ticks for one stream"))?;
    let payload_len = u32::try_from(payload.len())
        .map_err(|_| invalid_format(path, "payload exceeds 4 GiB"))?;

    let mut bytes = Vec::<u8>::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&STREAM_FORMAT_VERSION.to_le_bytes());
    bytes.extend_from_slice(&tick_count.to_le_bytes());
    bytes.extend_from_slice(&payload_len.to_le_bytes());
    bytes.extend_from_slice(&sha256_bytes(&payload));
    bytes.extend_from_slice(&payload);

    write_bytes_atomic(path, &bytes).map_err(|source| StreamError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    info!(
        path = %path.display(),
        ticks = records.len(),
        payload_bytes = payload.len(),
        "command_stream_written"
    );
    Ok(())
}

pub fn read_command_stream(
    path: &Path,
    registry: &TypeRegistry,
) -> Result<Vec<TickRecord>, StreamError> {
    let bytes = fs::read(path).map_err(|source| StreamError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut cursor = 0usize;

    let magic = read_exact(&bytes, &mut cursor, MAGIC.len(), path)?;
    if magic != MAGIC {
        return Err(invalid_format(path, "invalid magic"));
    }
    let version = read_u16(&bytes, &mut cursor, path)?;
    if version != STREAM_FORMAT_VERSION {
        return Err(invalid_format(
            path,
            &format!("unsupported format version {version}"),
        ));
    }
    let tick_count = read_u32(&bytes, &mut cursor, path)? as usize;
    let payload_len = read_u32(&bytes, &mut cursor, path)? as usize;
    let expected_hash = read_exact(&bytes, &mut cursor, DIGEST_LEN, path)?;
    let payload = read_exact(&bytes, &mut cursor, payload_len, path)?;
    if cursor != bytes.len() {
        return Err(invalid_format(path, "unexpected trailing bytes"));
    }
    if expected_hash != sha256_bytes(payload) {
        return Err(invalid_format(path, "payload hash mismatch"));
    }

    let records = decode_payload(payload, registry, path)?;
    if records.len() != tick_count {
        return Err(invalid_format(path, "tick count does not match header"));
    }
    info!(
        path = %path.display(),
        ticks = records.len(),
        "command_stream_read"
    );
    Ok(records)
}

fn encode_payload(records: &[TickRecord], registry: &TypeRegistry) -> Result<Vec<u8>, CodecError> {
    let mut payload = Vec::new();
    for record in records {
        for command in &record.commands {
            encode_into(&command.to_wire(), registry, &mut payload)?;
        }
        let marker = TickEnd {
            tick: record.tick_id,
            count: record.commands.len() as u64,
        };
        encode_into(&marker.to_wire(), registry, &mut payload)?;
    }
    Ok(payload)
}

fn decode_payload(
    payload: &[u8],
    registry: &TypeRegistry,
    path: &Path,
) -> Result<Vec<TickRecord>, StreamError> {
    let codec_error = |source: CodecError| StreamError::Codec {
        path: path.to_path_buf(),
        source,
    };
    let values = decode_all(payload, registry).map_err(codec_error)?;

    let mut records = Vec::<TickRecord>::new();
    let mut pending = Vec::<Command>::new();
    for value in values {
        let is_marker = value
            .as_object()
            .is_some_and(|object| object.type_name == TickEnd::TYPE_NAME);
        if !is_marker {
            pending.push(Command::from_wire(value).map_err(codec_error)?);
            continue;
        }

        let marker = TickEnd::from_wire(value).map_err(codec_error)?;
        if marker.count != pending.len() as u64 {
            return Err(invalid_format(
                path,
                &format!(
                    "tick {} declares {} commands but carries {}",
                    marker.tick,
                    marker.count,
                    pending.len()
                ),
            ));
        }
        if let Some(previous) = records.last() {
            if marker.tick <= previous.tick_id {
                return Err(invalid_format(path, "tick ids are not increasing"));
            }
        }
        records.push(TickRecord {
            tick_id: marker.tick,
            commands: std::mem::take(&mut pending),
        });
    }
    if !pending.is_empty() {
        return Err(invalid_format(path, "commands after the last tick marker"));
    }
    Ok(records)
}

fn read_u16(bytes: &[u8], cursor: &mut usize, path: &Path) -> Result<u16, StreamError> {
    let raw = read_exact(bytes, cursor, 2, path)?;
    Ok(u16::from_le_bytes([raw[0], raw[1]]))
}

fn read_u32(bytes: &[u8], cursor: &mut usize, path: &Path) -> Result<u32, StreamError> {
    let raw = read_exact(bytes, cursor, 4, path)?;
    Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

fn read_exact<'a>(
    bytes: &'a [u8],
    cursor: &mut usize,
    len: usize,
    path: &Path,
) -> Result<&'a [u8], StreamError> {
    let end = cursor.saturating_add(len);
    if end > bytes.len() {
        return Err(invalid_format(path, "unexpected end of file"));
    }
    let out = &bytes[*cursor..end];
    *cursor = end;
    Ok(out)
}

fn invalid_format(path: &Path, message: &str) -> StreamError {
    StreamError::InvalidFormat {
        path: path.to_path_buf(),
        message: message.to_string(),
    }
}
