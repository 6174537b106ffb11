#![warn(missing_docs)]
//! Haystack scan engine
//!
//! Finds every ledger transaction that references a holder's one-time output keys, either as a
//! created output or as a ring member, and keeps an encrypted resume cache between runs.
//!
//! Entrypoint: [`crate::sync::scan_session`]

pub mod cache;
pub mod client;
pub mod error;
pub mod match_index;
pub mod primitives;
pub mod resume;
pub mod scan;
pub mod sync;
pub mod traits;
pub mod vault;
pub mod window;
