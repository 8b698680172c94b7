//! vmnet network daemon library.
//!
//! This crate primarily ships a `netd` binary, but we expose a small library
//! surface to enable integration testing and reuse.

pub mod api;
pub mod config;
pub mod network;
pub mod state;
