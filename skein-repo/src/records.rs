//! Record encoding: canonical DAG-CBOR, CID computation, and the JSON
//! boundary mapping used by the HTTP facade.
//!
//! Records cross the API boundary as JSON. Two JSON shapes are reserved:
//! `{"$link": "<cid>"}` decodes to an IPLD link and `{"$bytes": "<base64>"}`
//! to raw bytes; everything else maps structurally. Floats are not part of
//! the record data model and are rejected.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use cid::Cid;
use libipld::cbor::DagCborCodec;
use libipld::codec::Codec;
use libipld::Ipld;
use multihash::{Code, MultihashDigest};
use serde_json::Value;

use crate::error::RepoError;

/// Multicodec code for DAG-CBOR.
pub const DAG_CBOR: u64 = 0x71;

/// Encodes a record as canonical DAG-CBOR. Map keys serialise in
/// `BTreeMap` order, so the same record always yields the same bytes.
pub fn encode(record: &Ipld) -> Result<Vec<u8>, RepoError> {
    Ok(DagCborCodec.encode(record)?)
}

/// Decodes DAG-CBOR bytes back into a record.
pub fn decode(bytes: &[u8]) -> Result<Ipld, RepoError> {
    Ok(DagCborCodec.decode(bytes)?)
}

/// Returns the CIDv1 (SHA2-256, DAG-CBOR codec) for encoded bytes.
pub fn cid_for_cbor(bytes: &[u8]) -> Cid {
    Cid::new_v1(DAG_CBOR, Code::Sha2_256.digest(bytes))
}

/// Parses a JSON record into IPLD, requiring a map at the top level.
pub fn parse_record(value: &Value) -> Result<Ipld, RepoError> {
    match from_json(value)? {
        record @ Ipld::Map(_) => Ok(record),
        _ => Err(RepoError::InvalidRecord(
            "record must be a JSON object".to_string(),
        )),
    }
}

/// Converts a JSON value into IPLD, resolving `$link` and `$bytes`.
pub fn from_json(value: &Value) -> Result<Ipld, RepoError> {
    match value {
        Value::Null => Ok(Ipld::Null),
        Value::Bool(b) => Ok(Ipld::Bool(*b)),
        Value::Number(n) => {
            let n = n
                .as_i64()
                .ok_or_else(|| RepoError::InvalidRecord(format!("unsupported number: {n}")))?;
            Ok(Ipld::Integer(n as i128))
        }
        Value::String(s) => Ok(Ipld::String(s.clone())),
        Value::Array(items) => Ok(Ipld::List(
            items.iter().map(from_json).collect::<Result<_, _>>()?,
        )),
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(Value::String(link)) = map.get("$link") {
                    let cid = Cid::try_from(link.as_str()).map_err(|e| {
                        RepoError::InvalidRecord(format!("bad $link {link:?}: {e}"))
                    })?;
                    return Ok(Ipld::Link(cid));
                }
                if let Some(Value::String(b64)) = map.get("$bytes") {
                    let bytes = BASE64.decode(b64).map_err(|e| {
                        RepoError::InvalidRecord(format!("bad $bytes: {e}"))
                    })?;
                    return Ok(Ipld::Bytes(bytes));
                }
            }
            let mut out = BTreeMap::new();
            for (key, val) in map {
                out.insert(key.clone(), from_json(val)?);
            }
            Ok(Ipld::Map(out))
        }
    }
}

/// Converts IPLD back into the JSON shape `from_json` accepts.
pub fn to_json(ipld: &Ipld) -> Result<Value, RepoError> {
    match ipld {
        Ipld::Null => Ok(Value::Null),
        Ipld::Bool(b) => Ok(Value::Bool(*b)),
        Ipld::Integer(n) => {
            let n = i64::try_from(*n)
                .map_err(|_| RepoError::InvalidRecord(format!("integer out of range: {n}")))?;
            Ok(Value::from(n))
        }
        Ipld::Float(f) => Ok(Value::from(*f)),
        Ipld::String(s) => Ok(Value::String(s.clone())),
        Ipld::Bytes(bytes) => Ok(serde_json::json!({ "$bytes": BASE64.encode(bytes) })),
        Ipld::List(items) => Ok(Value::Array(
            items.iter().map(to_json).collect::<Result<_, _>>()?,
        )),
        Ipld::Map(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, val) in map {
                out.insert(key.clone(), to_json(val)?);
            }
            Ok(Value::Object(out))
        }
        Ipld::Link(cid) => Ok(serde_json::json!({ "$link": cid.to_string() })),
    }
}

/// Validates a collection name: dotted, non-empty segments of
/// alphanumerics and hyphens (e.g. `app.bsky.feed.post`).
pub fn ensure_valid_collection(collection: &str) -> Result<(), RepoError> {
    let valid = !collection.is_empty()
        && collection.len() <= 317
        && collection.contains('.')
        && collection.split('.').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-')
        });
    if !valid {
        return Err(RepoError::InvalidRecord(format!(
            "invalid collection: {collection:?}"
        )));
    }
    Ok(())
}

/// Validates a record key: 1–512 chars from the URL-safe set, no `/`.
pub fn ensure_valid_rkey(rkey: &str) -> Result<(), RepoError> {
    let valid = !rkey.is_empty()
        && rkey.len() <= 512
        && rkey
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':' | '~'));
    if !valid {
        return Err(RepoError::InvalidRecord(format!("invalid rkey: {rkey:?}")));
    }
    Ok(())
}
