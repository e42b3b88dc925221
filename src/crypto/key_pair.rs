//! Recoverable ECDSA key pairs on secp256k1.
//!
//! Transactions carry a 65-byte (r, s, v) signature over the canonical hash
//! of their payload. Verification never needs the public key: the signer's
//! address is recovered from the signature and compared against the declared
//! sender. Wallet key storage lives outside the node; this module only covers
//! what the core needs — signing a hash and recovering an address.

use crate::types::address::{ADDRESS_LEN, Address};
use crate::types::encoding::EncodeSink;
use crate::types::hash::Hash;
use crate::types::{HexError, decode_fixed};
use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, SigningKey, VerifyingKey};
use rand_core::OsRng;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use tinychain_derive::Error;
use zeroize::Zeroizing;

/// Signature length in bytes: 32 (r) + 32 (s) + 1 (recovery byte).
pub const SIGNATURE_LEN: usize = 65;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SignatureError {
    /// The r/s/v bytes do not form a well-formed signature.
    #[error("malformed signature")]
    Malformed,
    /// No public key can be recovered for this hash/signature pair.
    #[error("signature recovery failed")]
    Recovery,
    /// Signing failed (invalid key material).
    #[error("signing failed")]
    Signing,
}

/// Private signing key.
///
/// Never serialized; key material is zeroized when exported as raw bytes.
#[derive(Clone)]
pub struct PrivateKey {
    key: SigningKey,
}

impl PrivateKey {
    /// Generates a key from OS entropy.
    pub fn new() -> Self {
        Self {
            key: SigningKey::random(&mut OsRng),
        }
    }

    /// Builds a key from raw scalar bytes.
    ///
    /// Returns `None` when the bytes are not a valid secp256k1 scalar.
    pub fn from_bytes(bytes: &[u8; 32]) -> Option<Self> {
        SigningKey::from_slice(bytes).ok().map(|key| Self { key })
    }

    /// Exports the raw scalar, zeroized on drop.
    pub fn to_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.key.to_bytes().into())
    }

    /// The account address controlled by this key.
    pub fn address(&self) -> Address {
        address_of(self.key.verifying_key())
    }

    /// Signs a 32-byte content hash, producing a recoverable signature.
    pub fn sign_hash(&self, hash: Hash) -> Result<Signature, SignatureError> {
        let (sig, recovery_id) = self
            .key
            .sign_prehash_recoverable(hash.as_slice())
            .map_err(|_| SignatureError::Signing)?;

        let mut bytes = [0u8; SIGNATURE_LEN];
        bytes[..64].copy_from_slice(&sig.to_bytes());
        bytes[64] = recovery_id.to_byte();
        Ok(Signature(bytes))
    }
}

impl Default for PrivateKey {
    fn default() -> Self {
        Self::new()
    }
}

/// 65-byte recoverable signature, laid out as r ‖ s ‖ v.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; SIGNATURE_LEN]);

impl Signature {
    /// Recovers the signer's address for the given content hash.
    pub fn recover(&self, hash: Hash) -> Result<Address, SignatureError> {
        let recovery_id =
            RecoveryId::from_byte(self.0[64]).ok_or(SignatureError::Malformed)?;
        let sig =
            EcdsaSignature::from_slice(&self.0[..64]).map_err(|_| SignatureError::Malformed)?;
        let key = VerifyingKey::recover_from_prehash(hash.as_slice(), &sig, recovery_id)
            .map_err(|_| SignatureError::Recovery)?;
        Ok(address_of(&key))
    }
}

/// Address derivation: Keccak-256 over the uncompressed public key (without
/// the 0x04 tag byte), keeping the last 20 bytes.
fn address_of(key: &VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    let mut hasher = Hash::keccak();
    hasher.update(&point.as_bytes()[1..]);
    let digest = hasher.finalize();

    let mut addr = [0u8; ADDRESS_LEN];
    addr.copy_from_slice(&digest.as_slice()[32 - ADDRESS_LEN..]);
    Address(addr)
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({self})")
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for Signature {
    type Err = HexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_fixed(s).map(Signature)
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

// The canonical encoding of a signature is its 65 raw bytes.
impl crate::types::encoding::Encode for Signature {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        out.write(&self.0);
    }
}

impl crate::types::encoding::Decode for Signature {
    fn decode(input: &mut &[u8]) -> Result<Self, crate::types::encoding::DecodeError> {
        Ok(Signature(<[u8; SIGNATURE_LEN]>::decode(input)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content_hash(data: &[u8]) -> Hash {
        let mut h = Hash::keccak();
        h.update(data);
        h.finalize()
    }

    #[test]
    fn sign_then_recover_yields_signer_address() {
        let key = PrivateKey::new();
        let hash = content_hash(b"pay alice 100");

        let sig = key.sign_hash(hash).unwrap();
        assert_eq!(sig.recover(hash).unwrap(), key.address());
    }

    #[test]
    fn recover_over_different_hash_is_not_the_signer() {
        let key = PrivateKey::new();
        let sig = key.sign_hash(content_hash(b"original")).unwrap();

        // Recovery over a different hash either fails or produces some other
        // key's address; it must never produce the signer's.
        match sig.recover(content_hash(b"tampered")) {
            Ok(addr) => assert_ne!(addr, key.address()),
            Err(_) => {}
        }
    }

    #[test]
    fn recover_rejects_bad_recovery_byte() {
        let key = PrivateKey::new();
        let hash = content_hash(b"data");
        let mut sig = key.sign_hash(hash).unwrap();
        sig.0[64] = 0xFF;

        assert_eq!(sig.recover(hash), Err(SignatureError::Malformed));
    }

    #[test]
    fn from_bytes_roundtrip() {
        let key = PrivateKey::new();
        let restored = PrivateKey::from_bytes(&key.to_bytes()).unwrap();
        assert_eq!(restored.address(), key.address());
    }

    #[test]
    fn from_bytes_rejects_zero_scalar() {
        assert!(PrivateKey::from_bytes(&[0u8; 32]).is_none());
    }

    #[test]
    fn deterministic_key_has_stable_address() {
        let a = PrivateKey::from_bytes(&[7u8; 32]).unwrap();
        let b = PrivateKey::from_bytes(&[7u8; 32]).unwrap();
        assert_eq!(a.address(), b.address());
    }

    #[test]
    fn signature_serde_roundtrip() {
        let key = PrivateKey::new();
        let sig = key.sign_hash(content_hash(b"serde")).unwrap();

        let json = serde_json::to_string(&sig).unwrap();
        let back: Signature = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sig);
    }
}
