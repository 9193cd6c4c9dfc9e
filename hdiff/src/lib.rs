//! HCTX `.hdiff` container: fixed header, index table, chunk data and a
//! footer that seals the file with BLAKE3 and xxHash64.
pub mod codec;
pub mod golden;
pub mod hctx;

pub use hctx::error::{HdiffError, IntegrityError, StructuralError};
pub use hctx::flags::{EntryFlags, Importance};
pub use hctx::{VersionPolicy, FORMAT_VERSION};
