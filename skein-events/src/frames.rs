//! Firehose wire frames.
//!
//! A frame is two concatenated DAG-CBOR objects: the header
//! `{"op": 1, "t": "#commit"}` and the commit message body. The event log
//! stores the body *without* its `seq` field; replay decodes the stored
//! payload, splices in the database-assigned sequence number, and
//! re-encodes the full frame, so stored payloads never go stale against
//! re-sequencing.

use std::collections::BTreeMap;
use std::io::Cursor;

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use cid::Cid;
use libipld::cbor::DagCborCodec;
use libipld::codec::{Decode, Encode};
use libipld::Ipld;

use skein_repo::{CommitResult, RepoOp};

use crate::error::EventError;

/// Frame header `op` for a message (as opposed to an error).
const FRAME_OP_MESSAGE: i128 = 1;

/// Everything needed to build one firehose commit event.
#[derive(Debug, Clone)]
pub struct CommitInfo {
    pub did: String,
    pub rev: String,
    pub prev_rev: Option<String>,
    pub commit_cid: Cid,
    pub prev_data: Option<Cid>,
    pub diff_car: Bytes,
    pub ops: Vec<RepoOp>,
    pub time: DateTime<Utc>,
}

impl CommitInfo {
    pub fn from_result(did: &str, result: &CommitResult, time: DateTime<Utc>) -> Self {
        Self {
            did: did.to_string(),
            rev: result.rev.clone(),
            prev_rev: result.prev_rev.clone(),
            commit_cid: result.commit_cid,
            prev_data: result.prev_data,
            diff_car: result.diff_car.clone(),
            ops: result.ops.clone(),
            time,
        }
    }
}

fn optional_link(cid: Option<Cid>) -> Ipld {
    match cid {
        Some(cid) => Ipld::Link(cid),
        None => Ipld::Null,
    }
}

fn op_ipld(op: &RepoOp) -> Ipld {
    let mut map = BTreeMap::new();
    map.insert(
        "action".to_string(),
        Ipld::String(op.action.as_str().to_string()),
    );
    map.insert("path".to_string(), Ipld::String(op.path.clone()));
    map.insert("cid".to_string(), optional_link(op.cid));
    map.insert("prev".to_string(), optional_link(op.prev));
    Ipld::Map(map)
}

/// Encodes the commit message body without a `seq` field — the form the
/// event log stores.
pub fn encode_commit_payload(info: &CommitInfo) -> Result<Vec<u8>, EventError> {
    let mut body = BTreeMap::new();
    body.insert("rebase".to_string(), Ipld::Bool(false));
    body.insert("tooBig".to_string(), Ipld::Bool(false));
    body.insert("repo".to_string(), Ipld::String(info.did.clone()));
    body.insert("commit".to_string(), Ipld::Link(info.commit_cid));
    body.insert("rev".to_string(), Ipld::String(info.rev.clone()));
    body.insert(
        "since".to_string(),
        match &info.prev_rev {
            Some(rev) => Ipld::String(rev.clone()),
            None => Ipld::Null,
        },
    );
    body.insert("blocks".to_string(), Ipld::Bytes(info.diff_car.to_vec()));
    body.insert(
        "ops".to_string(),
        Ipld::List(info.ops.iter().map(op_ipld).collect()),
    );
    body.insert("blobs".to_string(), Ipld::List(Vec::new()));
    body.insert("prevData".to_string(), optional_link(info.prev_data));
    body.insert(
        "time".to_string(),
        Ipld::String(info.time.to_rfc3339_opts(SecondsFormat::Secs, true)),
    );

    let mut bytes = Vec::new();
    Ipld::Map(body).encode(DagCborCodec, &mut bytes)?;
    Ok(bytes)
}

/// Builds the full wire frame for a stored payload: decode, splice in
/// `seq`, prepend the header.
pub fn frame_from_payload(seq: i64, payload: &[u8]) -> Result<Vec<u8>, EventError> {
    let mut cursor = Cursor::new(payload);
    let body = Ipld::decode(DagCborCodec, &mut cursor)
        .map_err(|e| EventError::MalformedPayload {
            seq,
            reason: e.to_string(),
        })?;
    let Ipld::Map(mut body) = body else {
        return Err(EventError::MalformedPayload {
            seq,
            reason: "payload is not a map".to_string(),
        });
    };
    body.insert("seq".to_string(), Ipld::Integer(seq as i128));

    let mut header = BTreeMap::new();
    header.insert("op".to_string(), Ipld::Integer(FRAME_OP_MESSAGE));
    header.insert("t".to_string(), Ipld::String("#commit".to_string()));

    let mut frame = Vec::new();
    Ipld::Map(header).encode(DagCborCodec, &mut frame)?;
    Ipld::Map(body).encode(DagCborCodec, &mut frame)?;
    Ok(frame)
}

/// Splits a frame back into its header and body. Used by replay-side
/// consumers and tests.
pub fn decode_frame(frame: &[u8]) -> Result<(Ipld, Ipld), EventError> {
    let mut cursor = Cursor::new(frame);
    let header = Ipld::decode(DagCborCodec, &mut cursor)?;
    let body = Ipld::decode(DagCborCodec, &mut cursor)?;
    Ok((header, body))
}

#[cfg(test)]
mod tests {
    use skein_repo::OpAction;

    use super::*;

    fn cid_of(data: &[u8]) -> Cid {
        skein_repo::records::cid_for_cbor(data)
    }

    fn info() -> CommitInfo {
        CommitInfo {
            did: "did:plc:abc".to_string(),
            rev: "3lb2222222222".to_string(),
            prev_rev: Some("3lb1111111111".to_string()),
            commit_cid: cid_of(b"commit"),
            prev_data: Some(cid_of(b"prev tree")),
            diff_car: Bytes::from_static(b"car bytes"),
            ops: vec![RepoOp {
                action: OpAction::Create,
                path: "app.bsky.feed.post/3kabc".to_string(),
                cid: Some(cid_of(b"record")),
                prev: None,
            }],
            time: DateTime::parse_from_rfc3339("2026-02-08T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        }
    }

    #[test]
    fn payload_has_no_seq_until_framed() {
        let info = info();
        let payload = encode_commit_payload(&info).unwrap();

        let mut cursor = Cursor::new(payload.as_slice());
        let Ipld::Map(body) = Ipld::decode(DagCborCodec, &mut cursor).unwrap() else {
            panic!("expected map");
        };
        assert!(!body.contains_key("seq"));
        assert_eq!(body.get("repo"), Some(&Ipld::String(info.did.clone())));
        assert_eq!(body.get("commit"), Some(&Ipld::Link(info.commit_cid)));

        let frame = frame_from_payload(7, &payload).unwrap();
        let (header, body) = decode_frame(&frame).unwrap();
        let Ipld::Map(header) = header else {
            panic!("expected map header");
        };
        assert_eq!(header.get("op"), Some(&Ipld::Integer(1)));
        assert_eq!(header.get("t"), Some(&Ipld::String("#commit".to_string())));
        let Ipld::Map(body) = body else {
            panic!("expected map body");
        };
        assert_eq!(body.get("seq"), Some(&Ipld::Integer(7)));
        assert_eq!(body.get("rebase"), Some(&Ipld::Bool(false)));
        assert_eq!(body.get("time"), Some(&Ipld::String("2026-02-08T00:00:00Z".to_string())));
        assert!(!body.contains_key("prev"));
    }

    #[test]
    fn ops_carry_action_path_and_links() {
        let info = info();
        let payload = encode_commit_payload(&info).unwrap();
        let frame = frame_from_payload(1, &payload).unwrap();
        let (_, body) = decode_frame(&frame).unwrap();

        let Ipld::Map(body) = body else { panic!() };
        let Some(Ipld::List(ops)) = body.get("ops") else {
            panic!("missing ops")
        };
        assert_eq!(ops.len(), 1);
        let Ipld::Map(op) = &ops[0] else { panic!() };
        assert_eq!(op.get("action"), Some(&Ipld::String("create".to_string())));
        assert_eq!(
            op.get("path"),
            Some(&Ipld::String("app.bsky.feed.post/3kabc".to_string()))
        );
        assert_eq!(op.get("cid"), Some(&Ipld::Link(cid_of(b"record"))));
        assert_eq!(op.get("prev"), Some(&Ipld::Null));
    }

    #[test]
    fn malformed_payload_is_rejected() {
        assert!(matches!(
            frame_from_payload(3, b"not cbor at all"),
            Err(EventError::MalformedPayload { seq: 3, .. })
        ));
    }
}
