//! # vmnet-id
//!
//! Opaque identifiers handed out with each provisioned bridge.
//!
//! ## Format
//!
//! A user ID is exactly five characters drawn from `[a-zA-Z0-9]`, e.g.
//! `aZ3kQ`. IDs carry no structure; they only label an allocation so callers
//! can correlate a bridge with whoever asked for it.
//!
//! IDs are generated from a caller-owned random source so that a process can
//! seed one generator at startup and share it, rather than reseeding per call.

mod error;
mod types;

pub use error::IdError;
pub use types::*;
