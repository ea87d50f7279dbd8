//! JRTP: a JSON document with embedded binary attachments, framed as one buffer.
//!
//! Layout: `[u32 big-endian JSON length][UTF-8 JSON][binary segments]`.
//!
//! Every binary leaf of the packed tree is replaced in the JSON region by a
//! `{"type": "Buffer", "index": i, "length": n}` marker. A non-empty list made
//! only of binaries uses `"BufferArray"` markers instead. Segments are stored
//! after the JSON region in ascending `index` order.
//!
//! The marker shape is reserved: a map that looks like a marker cannot be
//! packed, since it would come back as binary.

use std::collections::BTreeMap;

use serde_json::{Map, Number, Value};
use thiserror::Error;
use tokio_util::bytes::{BufMut, Bytes, BytesMut};

const BUFFER: &str = "Buffer";
const BUFFER_ARRAY: &str = "BufferArray";
const HEADER_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum JrtpError {
    #[error("frame truncated: need {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },
    #[error("metadata is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("metadata region of {0} bytes exceeds the u32 length prefix")]
    TooLarge(usize),
    #[error("binary segment markers are inconsistent: {0}")]
    Segment(String),
    #[error("{0} trailing bytes after the last binary segment")]
    TrailingBytes(usize),
    #[error("binary value cannot be represented as plain JSON")]
    UnexpectedBinary,
    #[error("unexpected payload shape: {0}")]
    Schema(String),
    #[error("map has the reserved binary marker shape")]
    ReservedMarker,
}

/// A JSON-like tree whose leaves may also be raw binary.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Binary(Vec<u8>),
    List(Vec<Payload>),
    Map(BTreeMap<String, Payload>),
}

impl Payload {
    pub fn get(&self, key: &str) -> Option<&Payload> {
        match self {
            Payload::Map(map) => map.get(key),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Payload::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Payload::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Payload::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Payload::Number(n) => n.as_u64(),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Payload::Binary(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Payload]> {
        match self {
            Payload::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Payload>> {
        match self {
            Payload::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Converts back to plain JSON, failing if any binary leaf is present.
    pub fn into_json(self) -> Result<Value, JrtpError> {
        Ok(match self {
            Payload::Null => Value::Null,
            Payload::Bool(b) => Value::Bool(b),
            Payload::Number(n) => Value::Number(n),
            Payload::String(s) => Value::String(s),
            Payload::Binary(_) => return Err(JrtpError::UnexpectedBinary),
            Payload::List(items) => Value::Array(
                items
                    .into_iter()
                    .map(Payload::into_json)
                    .collect::<Result<_, _>>()?,
            ),
            Payload::Map(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| Ok((k, v.into_json()?)))
                    .collect::<Result<Map<_, _>, JrtpError>>()?,
            ),
        })
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Payload::Null,
            Value::Bool(b) => Payload::Bool(b),
            Value::Number(n) => Payload::Number(n),
            Value::String(s) => Payload::String(s),
            Value::Array(items) => Payload::List(items.into_iter().map(Payload::from).collect()),
            Value::Object(map) => {
                Payload::Map(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Binary(bytes)
    }
}

/// Packs `data` into a single JRTP frame.
pub fn pack(data: &Payload) -> Result<Bytes, JrtpError> {
    let mut segments = Vec::new();
    let meta = extract(data, &mut segments)?;
    let json = serde_json::to_vec(&meta)?;
    let json_len = u32::try_from(json.len()).map_err(|_| JrtpError::TooLarge(json.len()))?;

    let binary_len: usize = segments.iter().map(|s| s.len()).sum();
    let mut frame = BytesMut::with_capacity(HEADER_LEN + json.len() + binary_len);
    frame.put_u32(json_len);
    frame.put_slice(&json);
    for segment in segments {
        frame.put_slice(segment);
    }

    Ok(frame.freeze())
}

/// Unpacks a JRTP frame produced by [`pack`].
pub fn unpack(frame: &[u8]) -> Result<Payload, JrtpError> {
    if frame.len() < HEADER_LEN {
        return Err(JrtpError::Truncated {
            needed: HEADER_LEN,
            actual: frame.len(),
        });
    }
    let json_len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    let json_end = HEADER_LEN + json_len;
    if frame.len() < json_end {
        return Err(JrtpError::Truncated {
            needed: json_end,
            actual: frame.len(),
        });
    }

    let meta: Value = serde_json::from_slice(&frame[HEADER_LEN..json_end])?;

    let mut markers = Vec::new();
    collect_markers(&meta, &mut markers);
    markers.sort_by_key(|m| m.index);

    let mut segments = Vec::with_capacity(markers.len());
    let mut offset = json_end;
    for (expected, marker) in markers.iter().enumerate() {
        if marker.index != expected {
            return Err(JrtpError::Segment(format!(
                "expected segment index {expected}, found {}",
                marker.index
            )));
        }
        let end = offset.checked_add(marker.length).ok_or_else(|| {
            JrtpError::Segment(format!(
                "segment {} length {} overflows the frame",
                marker.index, marker.length
            ))
        })?;
        if frame.len() < end {
            return Err(JrtpError::Truncated {
                needed: end,
                actual: frame.len(),
            });
        }
        segments.push(&frame[offset..end]);
        offset = end;
    }
    if offset != frame.len() {
        return Err(JrtpError::TrailingBytes(frame.len() - offset));
    }

    Ok(rebuild(meta, &segments))
}

#[derive(Debug)]
struct Marker {
    index: usize,
    length: usize,
}

fn marker<'a>(kind: &str, bytes: &'a [u8], segments: &mut Vec<&'a [u8]>) -> Value {
    let index = segments.len();
    segments.push(bytes);
    serde_json::json!({ "type": kind, "index": index, "length": bytes.len() })
}

fn extract<'a>(node: &'a Payload, segments: &mut Vec<&'a [u8]>) -> Result<Value, JrtpError> {
    Ok(match node {
        Payload::Null => Value::Null,
        Payload::Bool(b) => Value::Bool(*b),
        Payload::Number(n) => Value::Number(n.clone()),
        Payload::String(s) => Value::String(s.clone()),
        Payload::Binary(bytes) => marker(BUFFER, bytes, segments),
        Payload::List(items) => {
            let homogeneous =
                !items.is_empty() && items.iter().all(|i| matches!(i, Payload::Binary(_)));
            let kind = if homogeneous { BUFFER_ARRAY } else { BUFFER };
            Value::Array(
                items
                    .iter()
                    .map(|item| match item {
                        Payload::Binary(bytes) => Ok(marker(kind, bytes, segments)),
                        other => extract(other, segments),
                    })
                    .collect::<Result<_, _>>()?,
            )
        }
        Payload::Map(map) => {
            let object = Value::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), extract(v, segments)?)))
                    .collect::<Result<Map<_, _>, JrtpError>>()?,
            );
            if as_marker(&object).is_some() {
                return Err(JrtpError::ReservedMarker);
            }
            object
        }
    })
}

fn as_marker(value: &Value) -> Option<Marker> {
    let object = value.as_object()?;
    if object.len() != 3 {
        return None;
    }
    let kind = object.get("type")?.as_str()?;
    if kind != BUFFER && kind != BUFFER_ARRAY {
        return None;
    }
    Some(Marker {
        index: usize::try_from(object.get("index")?.as_u64()?).ok()?,
        length: usize::try_from(object.get("length")?.as_u64()?).ok()?,
    })
}

fn collect_markers(value: &Value, markers: &mut Vec<Marker>) {
    if let Some(m) = as_marker(value) {
        markers.push(m);
        return;
    }
    match value {
        Value::Array(items) => items.iter().for_each(|i| collect_markers(i, markers)),
        Value::Object(map) => map.values().for_each(|v| collect_markers(v, markers)),
        _ => {}
    }
}

// Indices were validated against `segments` by `unpack`.
fn rebuild(value: Value, segments: &[&[u8]]) -> Payload {
    if let Some(m) = as_marker(&value) {
        return Payload::Binary(segments[m.index].to_vec());
    }
    match value {
        Value::Array(items) => {
            Payload::List(items.into_iter().map(|i| rebuild(i, segments)).collect())
        }
        Value::Object(map) => Payload::Map(
            map.into_iter()
                .map(|(k, v)| (k, rebuild(v, segments)))
                .collect(),
        ),
        scalar => Payload::from(scalar),
    }
}
