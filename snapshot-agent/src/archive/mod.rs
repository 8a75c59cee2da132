//! Plain tar codec.
//!
//! Entries are framed as 512-byte ustar header blocks followed by the payload
//! padded to the block size; the archive ends with two zero blocks. No
//! compression layer is applied.

pub mod entry;
pub mod header;
pub mod reader;
pub mod writer;

pub use entry::{entry_name, ArchiveEntry, EntryKind};
pub use reader::ArchiveReader;
pub use writer::ArchiveWriter;
