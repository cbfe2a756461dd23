// Copyright 2022-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Snapshot payload codec: the full map as a self-describing JSON object.

use std::collections::BTreeMap;

/// Possible errors turning snapshot bytes back into a map.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("malformed snapshot: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Serialize the map as a JSON object, `{"key": "value", ...}`.
pub fn encode(map: &BTreeMap<String, String>) -> Result<Vec<u8>, SnapshotError> {
    Ok(serde_json::to_vec(map)?)
}

/// Decode a snapshot produced by [`encode`].
pub fn decode(bytes: &[u8]) -> Result<BTreeMap<String, String>, SnapshotError> {
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use quickcheck_macros::quickcheck;

    use super::{decode, encode};

    #[test]
    fn empty_map_is_an_empty_object() {
        let bytes = encode(&BTreeMap::new()).unwrap();
        assert_eq!(bytes, b"{}");
    }

    #[test]
    fn decode_rejects_non_objects() {
        assert!(decode(b"[1, 2]").is_err());
        assert!(decode(b"").is_err());
    }

    #[quickcheck]
    fn roundtrip(map: BTreeMap<String, String>) -> bool {
        decode(&encode(&map).unwrap()).unwrap() == map
    }
}
