//! Cryptography: recoverable ECDSA key pairs and signatures on secp256k1.

pub mod key_pair;
