//! Shared primitives for the hajimi crates: content hashes, chunk checksums
//! and the windowed buffer helpers used by the streaming paths.
pub mod buf;
pub mod hash;
