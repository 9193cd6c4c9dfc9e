//! Hajimi: binary diff and patch over the HCTX `.hdiff` container.
//!
//! The container itself lives in the `hdiff` crate and the hash primitives in
//! `hcore`. This crate builds and applies patches, damages them on purpose
//! and benchmarks them against reference tools.
pub mod bench;
pub mod cli;
pub mod corrupt;
pub mod mem;
pub mod patch;
