//! Streaming tar writer.

use super::entry::{ArchiveEntry, EntryKind};
use super::header::{
    self, RawHeader, BLOCK_SIZE, GNU_LONG_LINK_NAME, TYPE_DIRECTORY, TYPE_GNU_LONG_LINK,
    TYPE_GNU_LONG_NAME, TYPE_REGULAR, TYPE_SYMLINK,
};
use crate::utils::errors::{Result, SnapshotError};
use std::io::Write;
use std::path::Path;

const ZERO_BLOCK: [u8; BLOCK_SIZE] = [0u8; BLOCK_SIZE];

/// Serializes entries into tar framing on an output stream.
///
/// Entries are written in the order they are appended. [`finalize`] must be
/// called exactly once after the last entry; until then the output is not a
/// complete archive.
///
/// [`finalize`]: ArchiveWriter::finalize
pub struct ArchiveWriter<W: Write> {
    inner: W,
    finalized: bool,
    bytes_written: u64,
    entries_written: u64,
}

impl<W: Write> ArchiveWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            finalized: false,
            bytes_written: 0,
            entries_written: 0,
        }
    }

    /// Append one entry: header block(s), then the padded payload for files.
    pub fn append(&mut self, entry: &ArchiveEntry) -> Result<()> {
        if self.finalized {
            return Err(SnapshotError::InvalidState(format!(
                "cannot append '{}' after finalize",
                entry.name
            )));
        }

        let name = wire_name(entry)?;
        let (type_flag, link_name, payload): (u8, &[u8], &[u8]) = match entry.kind {
            EntryKind::File => (
                TYPE_REGULAR,
                &[],
                entry.payload.as_deref().unwrap_or_default(),
            ),
            EntryKind::Directory => (TYPE_DIRECTORY, &[], &[]),
            EntryKind::Symlink => {
                let target = entry.link_target.as_deref().ok_or_else(|| {
                    SnapshotError::InvalidState(format!("symlink '{}' has no target", entry.name))
                })?;
                (TYPE_SYMLINK, target.as_bytes(), &[])
            }
        };

        if header::needs_long_name(name.as_bytes()) {
            self.write_long_record(TYPE_GNU_LONG_NAME, name.as_bytes())?;
        }
        if header::needs_long_link(link_name) {
            self.write_long_record(TYPE_GNU_LONG_LINK, link_name)?;
        }

        let raw = RawHeader {
            name: name.into_bytes(),
            type_flag,
            mode: entry.attributes.permissions,
            size: payload.len() as u64,
            mtime: entry.attributes.modified_at,
            link_name: link_name.to_vec(),
        };
        self.write_all(&raw.encode())?;
        self.write_padded(payload)?;

        self.entries_written += 1;
        Ok(())
    }

    /// Read the object at `path` and append it as `name`. Returns the payload size.
    pub fn append_path(&mut self, path: &Path, name: &str) -> Result<u64> {
        let entry = ArchiveEntry::from_path(path, name)?;
        self.append(&entry)?;
        Ok(entry.size())
    }

    /// Write the end-of-archive marker (two zero blocks) and flush.
    pub fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Err(SnapshotError::InvalidState(
                "archive already finalized".to_string(),
            ));
        }
        self.write_all(&ZERO_BLOCK)?;
        self.write_all(&ZERO_BLOCK)?;
        self.inner.flush()?;
        self.finalized = true;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn entries_written(&self) -> u64 {
        self.entries_written
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    fn write_long_record(&mut self, type_flag: u8, value: &[u8]) -> Result<()> {
        let mut data = value.to_vec();
        data.push(0);
        let raw = RawHeader {
            name: GNU_LONG_LINK_NAME.as_bytes().to_vec(),
            type_flag,
            mode: Some(0),
            size: data.len() as u64,
            mtime: Some(0),
            link_name: Vec::new(),
        };
        self.write_all(&raw.encode())?;
        self.write_padded(&data)
    }

    fn write_padded(&mut self, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Ok(());
        }
        self.write_all(payload)?;
        let padding = header::padding_for(payload.len() as u64);
        self.write_all(&ZERO_BLOCK[..padding])
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(bytes)?;
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }
}

/// Directories carry a trailing `/` on the wire.
fn wire_name(entry: &ArchiveEntry) -> Result<String> {
    let trimmed = entry.name.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(SnapshotError::InvalidState(
            "cannot archive an entry with an empty name".to_string(),
        ));
    }
    Ok(match entry.kind {
        EntryKind::Directory => format!("{}/", trimmed),
        _ => trimmed.to_string(),
    })
}
