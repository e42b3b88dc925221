//! Derive macros for the tinychain node.
//!
//! Provides:
//! - `#[derive(Codec)]` - canonical binary encoding used for hashing and the wire
//! - `#[derive(Error)]` - error type boilerplate (thiserror replacement)

mod codec;
mod error;

use proc_macro::TokenStream;

/// Implements the `Encode` and `Decode` traits for deterministic binary serialization.
#[proc_macro_derive(Codec)]
pub fn derive_codec(input: TokenStream) -> TokenStream {
    codec::expand(input)
}

/// Implements `Display` and `Error` from `#[error("...")]` variant attributes.
#[proc_macro_derive(Error, attributes(error))]
pub fn derive_error(input: TokenStream) -> TokenStream {
    error::expand(input)
}
