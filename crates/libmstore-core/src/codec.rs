//! Block codec: canonical DAG-CBOR encoding and CID computation
//!
//! Every block is addressed by a CIDv1 whose multihash is sha2-256 over the
//! exact stored bytes. Structural blocks (tree nodes, commits) always use the
//! dag-cbor codec; record payloads that are not DAG-CBOR use the raw codec.

use cid::multihash::Multihash;
use cid::Cid;
use ipld_core::ipld::Ipld;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{decode_err, encode_err, RepoError};

/// Multicodec code for DAG-CBOR blocks
pub const DAG_CBOR: u64 = 0x71;

/// Multicodec code for raw byte blocks
pub const RAW: u64 = 0x55;

/// Multihash code for sha2-256
pub const SHA2_256: u64 = 0x12;

/// Encode a value as canonical DAG-CBOR
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, RepoError> {
    serde_ipld_dagcbor::to_vec(value).map_err(encode_err)
}

/// Decode a DAG-CBOR block into a value
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, RepoError> {
    serde_ipld_dagcbor::from_slice(bytes).map_err(decode_err)
}

/// Compute the CID of `bytes` under the given codec
pub fn cid_for_bytes(codec: u64, bytes: &[u8]) -> Result<Cid, RepoError> {
    let digest = Sha256::digest(bytes);
    let mh = Multihash::<64>::wrap(SHA2_256, digest.as_slice())
        .map_err(|e| RepoError::Internal(format!("multihash: {}", e)))?;
    Ok(Cid::new_v1(codec, mh))
}

/// CID of an already-encoded DAG-CBOR block
pub fn cid_for_cbor(bytes: &[u8]) -> Result<Cid, RepoError> {
    cid_for_bytes(DAG_CBOR, bytes)
}

/// Encode a value and compute its CID in one step
pub fn cid_for_value<T: Serialize + ?Sized>(value: &T) -> Result<(Cid, Vec<u8>), RepoError> {
    let bytes = encode(value)?;
    let cid = cid_for_cbor(&bytes)?;
    Ok((cid, bytes))
}

/// CID for an opaque record payload.
///
/// Payloads that parse as DAG-CBOR get the dag-cbor codec so their links
/// stay traversable; anything else is addressed as raw bytes.
pub fn cid_for_record(bytes: &[u8]) -> Result<Cid, RepoError> {
    if serde_ipld_dagcbor::from_slice::<Ipld>(bytes).is_ok() {
        cid_for_bytes(DAG_CBOR, bytes)
    } else {
        cid_for_bytes(RAW, bytes)
    }
}

/// Recompute the hash of `bytes` and compare it with `cid`
pub fn verify_block(cid: &Cid, bytes: &[u8]) -> Result<(), RepoError> {
    let code = cid.hash().code();
    if code != SHA2_256 {
        return Err(RepoError::UnsupportedHash(code));
    }
    let computed = cid_for_bytes(cid.codec(), bytes)?;
    if computed.hash().digest() != cid.hash().digest() {
        return Err(RepoError::HashMismatch { cid: *cid, computed });
    }
    Ok(())
}

/// All CIDs linked from a block, in encounter order
pub fn block_links(cid: &Cid, bytes: &[u8]) -> Result<Vec<Cid>, RepoError> {
    if cid.codec() != DAG_CBOR {
        return Ok(Vec::new());
    }
    let ipld: Ipld = serde_ipld_dagcbor::from_slice(bytes).map_err(|e| RepoError::MalformedBlock {
        cid: *cid,
        reason: e.to_string(),
    })?;
    let mut links = Vec::new();
    collect_links(&ipld, &mut links);
    Ok(links)
}

fn collect_links(ipld: &Ipld, out: &mut Vec<Cid>) {
    match ipld {
        Ipld::Link(cid) => out.push(*cid),
        Ipld::List(items) => items.iter().for_each(|item| collect_links(item, out)),
        Ipld::Map(map) => map.values().for_each(|item| collect_links(item, out)),
        _ => {}
    }
}

/// Encode a JSON document as a DAG-CBOR record payload
pub fn json_to_record(json: &serde_json::Value) -> Result<Vec<u8>, RepoError> {
    encode(json)
}

/// Render a record payload as JSON.
///
/// Links become `{"$link": "<cid>"}` and byte strings `{"$bytes": "<hex>"}`.
/// Raw payloads render as a single `$bytes` object.
pub fn record_to_json(bytes: &[u8]) -> serde_json::Value {
    match serde_ipld_dagcbor::from_slice::<Ipld>(bytes) {
        Ok(ipld) => ipld_to_json(&ipld),
        Err(_) => serde_json::json!({ "$bytes": hex::encode(bytes) }),
    }
}

fn ipld_to_json(ipld: &Ipld) -> serde_json::Value {
    use serde_json::Value;
    match ipld {
        Ipld::Null => Value::Null,
        Ipld::Bool(b) => Value::Bool(*b),
        Ipld::Integer(i) => match i64::try_from(*i) {
            Ok(n) => Value::from(n),
            Err(_) => Value::String(i.to_string()),
        },
        Ipld::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Ipld::String(s) => Value::String(s.clone()),
        Ipld::Bytes(b) => serde_json::json!({ "$bytes": hex::encode(b) }),
        Ipld::List(items) => Value::Array(items.iter().map(ipld_to_json).collect()),
        Ipld::Map(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), ipld_to_json(v)))
                .collect(),
        ),
        Ipld::Link(cid) => serde_json::json!({ "$link": cid.to_string() }),
    }
}
