//! Shared helpers for ledger tests.
