//! Content-addressing for the object store.
//!
//! Every blob is identified by the lowercase hex SHA-256 of its raw bytes.
//! Unlike the teacher crate's `ObjectHash`, which supports a pluggable
//! SHA-1/SHA-256 selector for Git object-format compatibility, this store has
//! no legacy format to support, so `ContentHash` is always SHA-256.

use std::{fmt, io, str::FromStr};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A SHA-256 content hash identifying an object in the store.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub const HEX_LEN: usize = 64;

    /// Compute the hash of `data`.
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Read a hash from a stream of exactly 32 bytes.
    pub fn from_stream(r: &mut impl io::Read) -> io::Result<Self> {
        let mut buf = [0u8; 32];
        r.read_exact(&mut buf)?;
        Ok(Self(buf))
    }

    /// Wrap a raw 32-byte digest.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Split the hex form into the two-char shard prefix and the remaining
    /// 62 chars, matching the `files/<hh>/<rest>` layout.
    pub fn shard(&self) -> (String, String) {
        let hex = self.to_hex();
        (hex[..2].to_string(), hex[2..].to_string())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for ContentHash {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != Self::HEX_LEN {
            return Err(format!(
                "invalid hash length: got {}, expected {}",
                s.len(),
                Self::HEX_LEN
            ));
        }
        let bytes = hex::decode(s).map_err(|e| e.to_string())?;
        let mut h = [0u8; 32];
        h.copy_from_slice(&bytes);
        Ok(Self(h))
    }
}

impl TryFrom<String> for ContentHash {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ContentHash> for String {
    fn from(value: ContentHash) -> Self {
        value.to_hex()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hashing "Hello, world!" should match the known SHA-256 value.
    #[test]
    fn hashes_known_value() {
        let hash = ContentHash::of(b"Hello, world!");
        assert_eq!(
            hash.to_hex(),
            "315f5bdb76d078c43b8ac0064e4a0164612b1fce77c869345bfc94c75894edd3"
        );
    }

    /// Hex round-trips through Display/FromStr.
    #[test]
    fn round_trips_through_hex() {
        let hash = ContentHash::of(b"round trip me");
        let hex = hash.to_string();
        let parsed: ContentHash = hex.parse().unwrap();
        assert_eq!(hash, parsed);
    }

    /// Shard splits into a 2-char prefix and 62-char remainder.
    #[test]
    fn shards_into_prefix_and_rest() {
        let hash = ContentHash::of(b"shard me");
        let (prefix, rest) = hash.shard();
        assert_eq!(prefix.len(), 2);
        assert_eq!(rest.len(), 62);
        assert_eq!(format!("{prefix}{rest}"), hash.to_hex());
    }

    /// Equal content hashes to the same value (dedup precondition).
    #[test]
    fn equal_content_hashes_equal() {
        assert_eq!(ContentHash::of(b"same"), ContentHash::of(b"same"));
    }

    /// From_str rejects the wrong length.
    #[test]
    fn rejects_wrong_length() {
        assert!("deadbeef".parse::<ContentHash>().is_err());
    }
}
