//! Wire protocol for talking to an ADB host server.
//!
//! Two incompatible framings share one TCP connection. Host mode prefixes
//! payloads with four hex digits ([`codec`]); sync mode uses 4-byte tags
//! with u32 little-endian integers ([`sync`]). The two must never be mixed
//! on the same exchange.
//!
//! Everything here operates on plain [`std::io::Read`]/[`std::io::Write`]
//! streams so it can be exercised against in-memory buffers.

pub mod codec;
mod error;
pub mod sync;

pub use error::{Error, Result};
