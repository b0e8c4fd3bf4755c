// Copyright The LwM2M-rs Authors
// SPDX-License-Identifier: Apache-2.0

//! Pluggable notify payload writers.
//!
//! A writer consumes batch entries one at a time and appends encoded bytes to
//! an output buffer; the serialization cursor pumps it on demand as the
//! exchange layer asks for payload chunks. Formats: plain text, opaque,
//! LwM2M TLV, SenML JSON and SenML CBOR.

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use lwm2m_coap::ContentFormat;
use lwm2m_core::{BatchEntry, Path, Value};
use std::fmt::Write as _;

/// Errors produced while encoding notify payloads.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SerializeError {
    /// The selected format cannot represent this value or path layout.
    #[error("{format:?} cannot represent {what}")]
    Unrepresentable {
        /// The offending format.
        format: ContentFormat,
        /// What could not be expressed.
        what: String,
    },
    /// The underlying encoder failed.
    #[error("encoder failure: {detail}")]
    Backend {
        /// Encoder-provided detail.
        detail: String,
    },
}

/// A format-specific output context bound to one value's root path.
pub trait OutputContext {
    /// Consumes one batch entry, appending any produced bytes to `out`.
    fn entry(&mut self, entry: &BatchEntry, out: &mut Vec<u8>) -> Result<(), SerializeError>;

    /// Flushes whatever the format holds back until the end (closing
    /// delimiters, buffered structures).
    fn finish(&mut self, out: &mut Vec<u8>) -> Result<(), SerializeError>;
}

/// Creates the output context for `format`, rooted at `root`.
pub fn output_context(
    format: ContentFormat,
    root: Path,
) -> Result<Box<dyn OutputContext>, SerializeError> {
    match format {
        ContentFormat::PlainText => Ok(Box::new(PlainTextContext { written: false })),
        ContentFormat::Opaque => Ok(Box::new(OpaqueContext { written: false })),
        ContentFormat::Tlv => {
            if root.oid().is_none() {
                return Err(SerializeError::Unrepresentable {
                    format,
                    what: "a rootless (composite) value".to_owned(),
                });
            }
            Ok(Box::new(TlvContext {
                root,
                entries: Vec::new(),
            }))
        }
        ContentFormat::SenmlJson => Ok(Box::new(SenmlJsonContext { root, first: true })),
        ContentFormat::SenmlCbor => Ok(Box::new(SenmlCborContext {
            root,
            records: Vec::new(),
        })),
    }
}

fn relative_name(root: &Path, path: &Path) -> String {
    let mut name = String::new();
    for level in root.len()..path.len() {
        if let Some(id) = path.id(level) {
            let _ = write!(name, "/{id}");
        }
    }
    name
}

struct PlainTextContext {
    written: bool,
}

impl OutputContext for PlainTextContext {
    fn entry(&mut self, entry: &BatchEntry, out: &mut Vec<u8>) -> Result<(), SerializeError> {
        if self.written || matches!(entry.value, Value::StartAggregate) {
            return Err(SerializeError::Unrepresentable {
                format: ContentFormat::PlainText,
                what: "more than one value".to_owned(),
            });
        }
        self.written = true;
        let text = match &entry.value {
            Value::Str(text) => text.clone(),
            Value::Int(value) => value.to_string(),
            Value::Uint(value) => value.to_string(),
            Value::Double(value) => value.to_string(),
            Value::Bool(value) => if *value { "1" } else { "0" }.to_owned(),
            Value::Objlnk { oid, iid } => format!("{oid}:{iid}"),
            Value::Bytes(bytes) => STANDARD.encode(bytes),
            Value::StartAggregate => unreachable!("rejected above"),
        };
        out.extend_from_slice(text.as_bytes());
        Ok(())
    }

    fn finish(&mut self, _out: &mut Vec<u8>) -> Result<(), SerializeError> {
        Ok(())
    }
}

struct OpaqueContext {
    written: bool,
}

impl OutputContext for OpaqueContext {
    fn entry(&mut self, entry: &BatchEntry, out: &mut Vec<u8>) -> Result<(), SerializeError> {
        match (&entry.value, self.written) {
            (Value::Bytes(bytes), false) => {
                self.written = true;
                out.extend_from_slice(bytes);
                Ok(())
            }
            _ => Err(SerializeError::Unrepresentable {
                format: ContentFormat::Opaque,
                what: "anything but a single opaque value".to_owned(),
            }),
        }
    }

    fn finish(&mut self, _out: &mut Vec<u8>) -> Result<(), SerializeError> {
        Ok(())
    }
}

struct SenmlJsonContext {
    root: Path,
    first: bool,
}

impl OutputContext for SenmlJsonContext {
    fn entry(&mut self, entry: &BatchEntry, out: &mut Vec<u8>) -> Result<(), SerializeError> {
        // Aggregate markers carry no value of their own in SenML.
        if matches!(entry.value, Value::StartAggregate) {
            return Ok(());
        }
        let mut record = serde_json::Map::new();
        if self.first && !self.root.is_empty() {
            let _ = record.insert(
                "bn".to_owned(),
                serde_json::Value::String(self.root.to_string()),
            );
        }
        let name = relative_name(&self.root, &entry.path);
        if !name.is_empty() {
            let _ = record.insert("n".to_owned(), serde_json::Value::String(name));
        }
        let (key, value) = match &entry.value {
            Value::Int(value) => ("v", serde_json::json!(value)),
            Value::Uint(value) => ("v", serde_json::json!(value)),
            Value::Double(value) => ("v", serde_json::json!(value)),
            Value::Bool(value) => ("vb", serde_json::json!(value)),
            Value::Str(text) => ("vs", serde_json::json!(text)),
            Value::Bytes(bytes) => ("vd", serde_json::json!(URL_SAFE_NO_PAD.encode(bytes))),
            Value::Objlnk { oid, iid } => ("vlo", serde_json::json!(format!("{oid}:{iid}"))),
            Value::StartAggregate => return Ok(()),
        };
        let _ = record.insert(key.to_owned(), value);
        if let Some(timestamp) = entry.timestamp {
            let _ = record.insert("t".to_owned(), serde_json::json!(timestamp));
        }

        out.push(if self.first { b'[' } else { b',' });
        self.first = false;
        let encoded = serde_json::to_vec(&serde_json::Value::Object(record)).map_err(|err| {
            SerializeError::Backend {
                detail: err.to_string(),
            }
        })?;
        out.extend_from_slice(&encoded);
        Ok(())
    }

    fn finish(&mut self, out: &mut Vec<u8>) -> Result<(), SerializeError> {
        if self.first {
            out.extend_from_slice(b"[]");
            self.first = false;
        } else {
            out.push(b']');
        }
        Ok(())
    }
}

struct SenmlCborContext {
    root: Path,
    records: Vec<ciborium::Value>,
}

impl OutputContext for SenmlCborContext {
    fn entry(&mut self, entry: &BatchEntry, _out: &mut Vec<u8>) -> Result<(), SerializeError> {
        if matches!(entry.value, Value::StartAggregate) {
            return Ok(());
        }
        let mut pairs: Vec<(ciborium::Value, ciborium::Value)> = Vec::new();
        if self.records.is_empty() && !self.root.is_empty() {
            // SenML CBOR label -2: base name
            pairs.push((
                ciborium::Value::Integer((-2).into()),
                self.root.to_string().into(),
            ));
        }
        let name = relative_name(&self.root, &entry.path);
        if !name.is_empty() {
            // label 0: name
            pairs.push((ciborium::Value::Integer(0.into()), name.into()));
        }
        let pair = match &entry.value {
            // label 2: numeric value
            Value::Int(value) => (ciborium::Value::Integer(2.into()), (*value).into()),
            Value::Uint(value) => (
                ciborium::Value::Integer(2.into()),
                ciborium::Value::Integer((*value).into()),
            ),
            Value::Double(value) => (ciborium::Value::Integer(2.into()), (*value).into()),
            // label 4: boolean value
            Value::Bool(value) => (ciborium::Value::Integer(4.into()), (*value).into()),
            // label 3: string value
            Value::Str(text) => (ciborium::Value::Integer(3.into()), text.clone().into()),
            // label 8: data value
            Value::Bytes(bytes) => (
                ciborium::Value::Integer(8.into()),
                ciborium::Value::Bytes(bytes.to_vec()),
            ),
            // objlnk has no numeric SenML label
            Value::Objlnk { oid, iid } => (
                ciborium::Value::Text("vlo".to_owned()),
                format!("{oid}:{iid}").into(),
            ),
            Value::StartAggregate => return Ok(()),
        };
        pairs.push(pair);
        if let Some(timestamp) = entry.timestamp {
            // label 6: time
            pairs.push((ciborium::Value::Integer(6.into()), timestamp.into()));
        }
        self.records.push(ciborium::Value::Map(pairs));
        Ok(())
    }

    fn finish(&mut self, out: &mut Vec<u8>) -> Result<(), SerializeError> {
        let records = ciborium::Value::Array(std::mem::take(&mut self.records));
        ciborium::ser::into_writer(&records, out).map_err(|err| SerializeError::Backend {
            detail: err.to_string(),
        })
    }
}

const TLV_OBJECT_INSTANCE: u8 = 0b00;
const TLV_RESOURCE_INSTANCE: u8 = 0b01;
const TLV_MULTIPLE_RESOURCE: u8 = 0b10;
const TLV_RESOURCE: u8 = 0b11;

struct TlvContext {
    root: Path,
    entries: Vec<BatchEntry>,
}

fn tlv_value_bytes(value: &Value) -> Vec<u8> {
    fn minimal_int(value: i64) -> Vec<u8> {
        if let Ok(v) = i8::try_from(value) {
            v.to_be_bytes().to_vec()
        } else if let Ok(v) = i16::try_from(value) {
            v.to_be_bytes().to_vec()
        } else if let Ok(v) = i32::try_from(value) {
            v.to_be_bytes().to_vec()
        } else {
            value.to_be_bytes().to_vec()
        }
    }
    match value {
        Value::Bytes(bytes) => bytes.to_vec(),
        Value::Str(text) => text.as_bytes().to_vec(),
        Value::Int(v) => minimal_int(*v),
        Value::Uint(v) => i64::try_from(*v)
            .map(minimal_int)
            .unwrap_or_else(|_| v.to_be_bytes().to_vec()),
        Value::Double(v) => v.to_be_bytes().to_vec(),
        Value::Bool(v) => vec![u8::from(*v)],
        Value::Objlnk { oid, iid } => {
            let mut bytes = oid.to_be_bytes().to_vec();
            bytes.extend_from_slice(&iid.to_be_bytes());
            bytes
        }
        Value::StartAggregate => Vec::new(),
    }
}

fn tlv_emit(kind: u8, id: u16, payload: &[u8], out: &mut Vec<u8>) {
    let id_wide = id > 0xff;
    let len = payload.len();
    let len_bytes: &[u8] = &len.to_be_bytes();
    let len_field_size: u8 = if len < 8 {
        0
    } else if len <= 0xff {
        1
    } else if len <= 0xffff {
        2
    } else {
        3
    };
    let mut header = kind << 6;
    if id_wide {
        header |= 1 << 5;
    }
    header |= len_field_size << 3;
    if len_field_size == 0 {
        header |= len as u8;
    }
    out.push(header);
    if id_wide {
        out.extend_from_slice(&id.to_be_bytes());
    } else {
        out.push(id as u8);
    }
    if len_field_size > 0 {
        out.extend_from_slice(&len_bytes[len_bytes.len() - usize::from(len_field_size)..]);
    }
    out.extend_from_slice(payload);
}

impl TlvContext {
    /// Encodes one object instance's worth of entries into resource TLVs.
    fn encode_instance(entries: &[BatchEntry], out: &mut Vec<u8>) -> Result<(), SerializeError> {
        let mut index = 0;
        while index < entries.len() {
            let entry = &entries[index];
            let rid = entry.path.rid().ok_or_else(|| SerializeError::Unrepresentable {
                format: ContentFormat::Tlv,
                what: format!("non-resource entry at {}", entry.path),
            })?;
            if matches!(entry.value, Value::StartAggregate) {
                // Gather the resource instances that follow.
                let mut nested = Vec::new();
                index += 1;
                while index < entries.len() && entries[index].path.rid() == Some(rid) {
                    let child = &entries[index];
                    let riid =
                        child
                            .path
                            .riid()
                            .ok_or_else(|| SerializeError::Unrepresentable {
                                format: ContentFormat::Tlv,
                                what: format!("aggregate child without riid at {}", child.path),
                            })?;
                    tlv_emit(
                        TLV_RESOURCE_INSTANCE,
                        riid,
                        &tlv_value_bytes(&child.value),
                        &mut nested,
                    );
                    index += 1;
                }
                tlv_emit(TLV_MULTIPLE_RESOURCE, rid, &nested, out);
            } else if let Some(riid) = entry.path.riid() {
                tlv_emit(
                    TLV_RESOURCE_INSTANCE,
                    riid,
                    &tlv_value_bytes(&entry.value),
                    out,
                );
                index += 1;
            } else {
                tlv_emit(TLV_RESOURCE, rid, &tlv_value_bytes(&entry.value), out);
                index += 1;
            }
        }
        Ok(())
    }
}

impl OutputContext for TlvContext {
    fn entry(&mut self, entry: &BatchEntry, _out: &mut Vec<u8>) -> Result<(), SerializeError> {
        // TLV length prefixes require whole-structure knowledge; buffer until
        // finish.
        self.entries.push(entry.clone());
        Ok(())
    }

    fn finish(&mut self, out: &mut Vec<u8>) -> Result<(), SerializeError> {
        let entries = std::mem::take(&mut self.entries);
        if self.root.iid().is_some() {
            return TlvContext::encode_instance(&entries, out);
        }
        // Object-level root: wrap each instance's resources.
        let mut index = 0;
        while index < entries.len() {
            let iid = entries[index]
                .path
                .iid()
                .ok_or_else(|| SerializeError::Unrepresentable {
                    format: ContentFormat::Tlv,
                    what: format!("non-instance entry at {}", entries[index].path),
                })?;
            let start = index;
            while index < entries.len() && entries[index].path.iid() == Some(iid) {
                index += 1;
            }
            let mut nested = Vec::new();
            TlvContext::encode_instance(&entries[start..index], &mut nested)?;
            tlv_emit(TLV_OBJECT_INSTANCE, iid, &nested, out);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn run(
        format: ContentFormat,
        root: Path,
        entries: &[BatchEntry],
    ) -> Result<Vec<u8>, SerializeError> {
        let mut ctx = output_context(format, root)?;
        let mut out = Vec::new();
        for entry in entries {
            ctx.entry(entry, &mut out)?;
        }
        ctx.finish(&mut out)?;
        Ok(out)
    }

    #[test]
    fn plain_text_single_scalar() {
        let out = run(
            ContentFormat::PlainText,
            Path::resource(42, 69, 4),
            &[BatchEntry::new(Path::resource(42, 69, 4), Value::Int(514))],
        )
        .expect("encoded");
        assert_eq!(out, b"514");
    }

    #[test]
    fn plain_text_rejects_multiple_values() {
        let entries = [
            BatchEntry::new(Path::resource(3, 0, 1), Value::Int(1)),
            BatchEntry::new(Path::resource(3, 0, 2), Value::Int(2)),
        ];
        assert!(run(ContentFormat::PlainText, Path::instance(3, 0), &entries).is_err());
    }

    #[test]
    fn senml_json_instance() {
        let entries = [
            BatchEntry::new(Path::resource(3, 0, 0), Value::Str("ACME".into())),
            BatchEntry::new(Path::resource(3, 0, 9), Value::Int(95)),
        ];
        let out = run(ContentFormat::SenmlJson, Path::instance(3, 0), &entries).expect("encoded");
        let parsed: serde_json::Value = serde_json::from_slice(&out).expect("valid json");
        assert_eq!(
            parsed,
            serde_json::json!([
                {"bn": "/3/0", "n": "/0", "vs": "ACME"},
                {"n": "/9", "v": 95}
            ])
        );
    }

    #[test]
    fn senml_json_empty_batch() {
        let out = run(ContentFormat::SenmlJson, Path::instance(3, 0), &[]).expect("encoded");
        assert_eq!(out, b"[]");
    }

    #[test]
    fn senml_cbor_round_trips_through_ciborium() {
        let entries = [BatchEntry::new(Path::resource(3, 0, 9), Value::Int(95))];
        let out =
            run(ContentFormat::SenmlCbor, Path::resource(3, 0, 9), &entries).expect("encoded");
        let decoded: ciborium::Value =
            ciborium::de::from_reader(out.as_slice()).expect("valid cbor");
        let records = decoded.as_array().expect("array");
        assert_eq!(records.len(), 1);
        assert!(records[0].is_map());
    }

    #[test]
    fn tlv_single_resource() {
        let out = run(
            ContentFormat::Tlv,
            Path::resource(3, 0, 9),
            &[BatchEntry::new(Path::resource(3, 0, 9), Value::Int(95))],
        )
        .expect("encoded");
        // type=resource-with-value, 1-byte id, 1-byte length
        assert_eq!(out, vec![0b1100_0001, 9, 95]);
    }

    #[test]
    fn tlv_multi_instance_resource() {
        let entries = [
            BatchEntry::new(Path::resource(3, 0, 11), Value::StartAggregate),
            BatchEntry::new(Path::resource_instance(3, 0, 11, 0), Value::Int(1)),
            BatchEntry::new(Path::resource_instance(3, 0, 11, 1), Value::Int(2)),
        ];
        let out = run(ContentFormat::Tlv, Path::instance(3, 0), &entries).expect("encoded");
        assert_eq!(
            out,
            vec![
                0b1000_0110, // multiple resource, 6 bytes of nested payload
                11,
                0b0100_0001, // resource instance 0, 1 byte
                0,
                1,
                0b0100_0001, // resource instance 1, 1 byte
                1,
                2,
            ]
        );
    }

    #[test]
    fn tlv_rejects_composite_root() {
        assert!(output_context(ContentFormat::Tlv, Path::ROOT).is_err());
    }
}
