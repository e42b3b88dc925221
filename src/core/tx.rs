//! Signed value-transfer transactions.

use crate::crypto::key_pair::{PrivateKey, Signature, SignatureError};
use crate::types::address::Address;
use crate::types::encoding::Encode;
use crate::types::hash::Hash;
use serde::{Deserialize, Serialize};
use tinychain_derive::Codec;

/// Flat fee debited from the sender on top of the transferred value.
///
/// The fee is not credited anywhere; it leaves circulation.
pub const TX_FEE: u64 = 50;

/// Data tag marking a self-transfer as a reward mint.
pub const REWARD_DATA: &str = "reward";

/// An unsigned transfer of `value` tokens from `from` to `to`.
///
/// `nonce` is the sender's replay counter: the first transaction an account
/// ever submits carries nonce 1. `data` is an opaque short tag; its only
/// protocol meaning is marking reward transactions.
#[derive(Clone, Debug, PartialEq, Eq, Codec, Serialize, Deserialize)]
pub struct Tx {
    pub from: Address,
    pub to: Address,
    pub value: u64,
    pub nonce: u64,
    pub data: String,
}

impl Tx {
    pub fn new(from: Address, to: Address, value: u64, nonce: u64, data: &str) -> Self {
        Self {
            from,
            to,
            value,
            nonce,
            data: data.to_string(),
        }
    }

    /// A reward mints `value` to its recipient, skipping funds and fee checks.
    pub fn is_reward(&self) -> bool {
        self.from == self.to && self.data == REWARD_DATA
    }

    /// Total the sender must hold: value plus fee, or just value for rewards.
    ///
    /// `None` when value + fee overflows, which no balance can cover anyway.
    pub fn cost(&self) -> Option<u64> {
        if self.is_reward() {
            Some(self.value)
        } else {
            self.value.checked_add(TX_FEE)
        }
    }

    /// The signing hash: Keccak-256 over the canonical encoding of the
    /// unsigned fields.
    pub fn hash(&self) -> Hash {
        let mut h = Hash::keccak();
        self.encode(&mut h);
        h.finalize()
    }

    /// Signs this transaction with the given key.
    pub fn sign(self, key: &PrivateKey) -> Result<SignedTx, SignatureError> {
        let sig = key.sign_hash(self.hash())?;
        Ok(SignedTx { tx: self, sig })
    }
}

/// A transaction plus its recoverable signature.
///
/// The canonical encoding is the unsigned fields followed by the 65 signature
/// bytes; JSON keeps the fields flat next to `signature`.
#[derive(Clone, Debug, PartialEq, Eq, Codec, Serialize, Deserialize)]
pub struct SignedTx {
    #[serde(flatten)]
    pub tx: Tx,
    #[serde(rename = "signature")]
    pub sig: Signature,
}

impl SignedTx {
    /// Content hash over the full signed encoding.
    ///
    /// This is the mempool and archive key: two identical payloads signed by
    /// different keys hash differently.
    pub fn hash(&self) -> Hash {
        let mut h = Hash::keccak();
        self.encode(&mut h);
        h.finalize()
    }

    /// True when the signature recovers to the declared sender.
    pub fn is_authentic(&self) -> bool {
        match self.sig.recover(self.tx.hash()) {
            Ok(addr) => addr == self.tx.from,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::encoding::Decode;

    fn signer() -> PrivateKey {
        PrivateKey::from_bytes(&[3u8; 32]).unwrap()
    }

    fn transfer(key: &PrivateKey, value: u64, nonce: u64) -> SignedTx {
        Tx::new(key.address(), Address([9u8; 20]), value, nonce, "")
            .sign(key)
            .unwrap()
    }

    #[test]
    fn signed_tx_is_authentic() {
        let tx = transfer(&signer(), 100, 1);
        assert!(tx.is_authentic());
    }

    #[test]
    fn forged_sender_is_not_authentic() {
        let mut tx = transfer(&signer(), 100, 1);
        tx.tx.from = Address([1u8; 20]);
        assert!(!tx.is_authentic());
    }

    #[test]
    fn tampered_value_is_not_authentic() {
        let mut tx = transfer(&signer(), 100, 1);
        tx.tx.value = 1_000_000;
        assert!(!tx.is_authentic());
    }

    #[test]
    fn reward_requires_self_transfer_and_tag() {
        let key = signer();
        let me = key.address();

        assert!(Tx::new(me, me, 10, 1, REWARD_DATA).is_reward());
        assert!(!Tx::new(me, me, 10, 1, "").is_reward());
        assert!(!Tx::new(me, Address([9u8; 20]), 10, 1, REWARD_DATA).is_reward());
    }

    #[test]
    fn cost_includes_fee_except_for_rewards() {
        let key = signer();
        let me = key.address();

        assert_eq!(Tx::new(me, Address([9u8; 20]), 100, 1, "").cost(), Some(150));
        assert_eq!(Tx::new(me, me, 100, 1, REWARD_DATA).cost(), Some(100));
        assert_eq!(Tx::new(me, Address([9u8; 20]), u64::MAX, 1, "").cost(), None);
    }

    #[test]
    fn canonical_roundtrip() {
        let tx = transfer(&signer(), 42, 7);
        let bytes = tx.to_bytes();
        let decoded = SignedTx::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, tx);
        assert!(decoded.is_authentic());
    }

    #[test]
    fn hash_covers_the_signature() {
        let key = signer();
        let unsigned = Tx::new(key.address(), Address([9u8; 20]), 5, 1, "");
        let a = unsigned.clone().sign(&key).unwrap();
        let mut b = a.clone();
        b.sig.0[10] ^= 0xFF;

        assert_eq!(a.tx.hash(), b.tx.hash());
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn hash_is_deterministic() {
        let tx = transfer(&signer(), 42, 7);
        assert_eq!(tx.hash(), tx.hash());
    }

    #[test]
    fn json_is_flat_with_signature_field() {
        let tx = transfer(&signer(), 42, 7);
        let json = serde_json::to_string(&tx).unwrap();
        assert!(json.contains("\"from\""));
        assert!(json.contains("\"signature\""));

        let back: SignedTx = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tx);
    }
}
