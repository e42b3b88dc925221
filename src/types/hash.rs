//! 32-byte Keccak-256 content hashes.

use crate::types::encoding::EncodeSink;
use crate::types::{HexError, decode_fixed};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};
use std::fmt;
use std::str::FromStr;
use tinychain_derive::Codec;

/// Hash length in bytes.
pub const HASH_LEN: usize = 32;

/// Fixed-size 32-byte content hash.
///
/// `Copy` on purpose: hashes are compared and passed constantly during block
/// validation and mining, and 32 stack bytes beat heap indirection.
///
/// Rendered as lowercase hex without a prefix; the all-zero hash is the
/// "no parent" sentinel used by the first block and by sync requests that
/// start from the beginning of the chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Codec)]
pub struct Hash(pub [u8; HASH_LEN]);

impl Hash {
    /// The all-zero sentinel hash.
    pub const fn zero() -> Hash {
        Hash([0u8; HASH_LEN])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; HASH_LEN]
    }

    pub const fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn from_slice(slice: &[u8]) -> Option<Hash> {
        let bytes: [u8; HASH_LEN] = slice.try_into().ok()?;
        Some(Hash(bytes))
    }

    /// Starts an incremental Keccak-256 computation.
    pub fn keccak() -> HashBuilder {
        HashBuilder {
            hasher: Keccak256::new(),
        }
    }

    /// Number of leading zero hex characters in the rendering of this hash.
    ///
    /// This is the quantity a block's difficulty constrains.
    pub fn leading_zero_nibbles(&self) -> u64 {
        let mut count = 0;
        for byte in &self.0 {
            if byte >> 4 != 0 {
                return count;
            }
            count += 1;
            if byte & 0x0F != 0 {
                return count;
            }
            count += 1;
        }
        count
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for Hash {
    type Err = HexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_fixed(s).map(Hash)
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Incremental Keccak-256 builder.
///
/// Implements [`EncodeSink`], so any `Encode` type can be hashed by encoding
/// straight into the hasher with no intermediate buffer.
pub struct HashBuilder {
    hasher: Keccak256,
}

impl HashBuilder {
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize(self) -> Hash {
        Hash(self.hasher.finalize().into())
    }
}

impl EncodeSink for HashBuilder {
    fn write(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::encoding::Encode;

    #[test]
    fn keccak_known_vector() {
        // keccak256("") is a fixed, well-known digest.
        let hash = Hash::keccak().finalize();
        assert_eq!(
            hash.to_string(),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn display_parse_roundtrip() {
        let mut builder = Hash::keccak();
        builder.update(b"tinychain");
        let hash = builder.finalize();

        let parsed: Hash = hash.to_string().parse().unwrap();
        assert_eq!(parsed, hash);
    }

    #[test]
    fn parse_accepts_prefix() {
        let hash = Hash::zero();
        let with_prefix = format!("0x{hash}");
        assert_eq!(with_prefix.parse::<Hash>().unwrap(), hash);
    }

    #[test]
    fn zero_is_zero() {
        assert!(Hash::zero().is_zero());
        assert_eq!(Hash::zero().to_string(), "0".repeat(64));
    }

    #[test]
    fn hashing_through_sink_matches_buffered_encoding() {
        let value = vec![1u64, 2, 3];

        let mut sink = Hash::keccak();
        value.encode(&mut sink);
        let streamed = sink.finalize();

        let mut buffered = Hash::keccak();
        buffered.update(&value.to_bytes());
        assert_eq!(streamed, buffered.finalize());
    }

    #[test]
    fn leading_zero_nibbles_counts_hex_chars() {
        assert_eq!(Hash([0xFF; 32]).leading_zero_nibbles(), 0);

        let mut one_nibble = [0xFF; 32];
        one_nibble[0] = 0x0F;
        assert_eq!(Hash(one_nibble).leading_zero_nibbles(), 1);

        let mut two_nibbles = [0xFF; 32];
        two_nibbles[0] = 0x00;
        assert_eq!(Hash(two_nibbles).leading_zero_nibbles(), 2);

        let mut three_nibbles = [0xFF; 32];
        three_nibbles[0] = 0x00;
        three_nibbles[1] = 0x0F;
        assert_eq!(Hash(three_nibbles).leading_zero_nibbles(), 3);

        assert_eq!(Hash::zero().leading_zero_nibbles(), 64);
    }

    #[test]
    fn serde_is_bare_lowercase_hex() {
        let mut builder = Hash::keccak();
        builder.update(b"x");
        let hash = builder.finalize();

        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{hash}\""));
        let back: Hash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }
}
