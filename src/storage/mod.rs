//! Persistence: the append-only block log.

pub mod block_store;
