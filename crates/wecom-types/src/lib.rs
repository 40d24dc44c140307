//! Core types for the WeCom webhook callback bridge.
//!
//! This crate defines the shared data structures used by the callback core and
//! the CLI: error taxonomy, configuration and the decrypted message shapes. It
//! contains no business logic.

pub mod config;
pub mod error;
pub mod message;
