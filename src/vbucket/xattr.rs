//! Extended-attribute blob surgery for the delete paths.
//!
//! A value with the xattr datatype bit starts with a 4-byte big-endian
//! length followed by length-prefixed `key\0value\0` pairs; the document
//! body follows the blob. System xattrs are the pairs whose key starts
//! with an underscore. Soft deletes keep system xattrs only: user pairs
//! and the body are dropped.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{EngineError, Result};
use crate::types::datatype;

/// One parsed xattr pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XattrPair {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl XattrPair {
    /// System xattrs survive soft deletion.
    pub fn is_system(&self) -> bool {
        self.key.first() == Some(&b'_')
    }
}

fn inflate_if_snappy(body: &[u8], dt: u8) -> Result<(Vec<u8>, u8)> {
    if datatype::is_snappy(dt) {
        let inflated = snap::raw::Decoder::new()
            .decompress_vec(body)
            .map_err(|e| EngineError::Serialization(format!("snappy inflate failed: {e}")))?;
        Ok((inflated, dt & !datatype::SNAPPY))
    } else {
        Ok((body.to_vec(), dt))
    }
}

/// Splits an xattr-bearing value into its pairs and trailing body.
pub fn parse(body: &[u8]) -> Result<(Vec<XattrPair>, Vec<u8>)> {
    let corrupt = || EngineError::Serialization("xattr blob truncated".into());
    if body.len() < 4 {
        return Err(corrupt());
    }
    let blob_len = u32::from_be_bytes(body[..4].try_into().unwrap()) as usize;
    if body.len() < 4 + blob_len {
        return Err(corrupt());
    }
    let mut blob = &body[4..4 + blob_len];
    let rest = body[4 + blob_len..].to_vec();
    let mut pairs = Vec::new();
    while !blob.is_empty() {
        if blob.len() < 4 {
            return Err(corrupt());
        }
        let pair_len = u32::from_be_bytes(blob[..4].try_into().unwrap()) as usize;
        if blob.len() < 4 + pair_len {
            return Err(corrupt());
        }
        let pair = &blob[4..4 + pair_len];
        blob = &blob[4 + pair_len..];
        let mut split = pair.splitn(2, |&b| b == 0);
        let key = split.next().ok_or_else(corrupt)?.to_vec();
        let value_region = split.next().ok_or_else(corrupt)?;
        let value = value_region
            .strip_suffix(&[0u8])
            .ok_or_else(corrupt)?
            .to_vec();
        pairs.push(XattrPair { key, value });
    }
    Ok((pairs, rest))
}

/// Assembles an xattr-bearing value from pairs and a body.
pub fn build(pairs: &[XattrPair], body: &[u8]) -> Bytes {
    let mut blob = BytesMut::new();
    for pair in pairs {
        let pair_len = pair.key.len() + 1 + pair.value.len() + 1;
        blob.put_u32(pair_len as u32);
        blob.put_slice(&pair.key);
        blob.put_u8(0);
        blob.put_slice(&pair.value);
        blob.put_u8(0);
    }
    let mut out = BytesMut::with_capacity(4 + blob.len() + body.len());
    out.put_u32(blob.len() as u32);
    out.put_slice(&blob);
    out.put_slice(body);
    out.freeze()
}

/// Computes the value a soft delete retains: system xattrs only, no
/// body. Returns `(None, RAW)` when nothing survives.
pub fn prune_for_deletion(body: &[u8], dt: u8) -> Result<(Option<Bytes>, u8)> {
    if !datatype::is_xattr(dt) {
        return Ok((None, datatype::RAW));
    }
    let (inflated, dt) = inflate_if_snappy(body, dt)?;
    let (pairs, _) = parse(&inflated)?;
    let system: Vec<XattrPair> = pairs.into_iter().filter(XattrPair::is_system).collect();
    if system.is_empty() {
        return Ok((None, datatype::RAW));
    }
    Ok((Some(build(&system, &[])), dt & datatype::XATTR))
}
