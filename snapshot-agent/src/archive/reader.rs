//! Streaming tar reader.

use super::entry::{ArchiveEntry, EntryKind};
use super::header::{
    self, Block, RawHeader, BLOCK_SIZE, TYPE_CONTIGUOUS, TYPE_DIRECTORY, TYPE_GNU_LONG_LINK,
    TYPE_GNU_LONG_NAME, TYPE_PAX_EXTENDED, TYPE_PAX_GLOBAL, TYPE_REGULAR, TYPE_REGULAR_OLD,
    TYPE_SYMLINK,
};
use crate::fs::metadata::EntryAttributes;
use crate::utils::errors::{Result, SnapshotError};
use std::io::{self, Read};
use std::ops::ControlFlow;
use tracing::{debug, warn};

/// Overrides collected from GNU long-name and pax records for the next header.
#[derive(Debug, Default)]
struct PendingOverrides {
    name: Option<Vec<u8>>,
    link_name: Option<Vec<u8>>,
    mtime: Option<i64>,
    size: Option<u64>,
}

impl PendingOverrides {
    fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.link_name.is_none()
            && self.mtime.is_none()
            && self.size.is_none()
    }
}

/// Decodes a tar stream into entries, one header at a time.
///
/// The sequence is forward-only. After the end marker or the first error the
/// reader is exhausted and keeps returning `Ok(None)`.
pub struct ArchiveReader<R: Read> {
    inner: R,
    finished: bool,
    position: u64,
    entries_read: u64,
}

impl<R: Read> ArchiveReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            finished: false,
            position: 0,
            entries_read: 0,
        }
    }

    /// Next entry, or `Ok(None)` at the end of the archive.
    pub fn next_entry(&mut self) -> Result<Option<ArchiveEntry>> {
        if self.finished {
            return Ok(None);
        }
        let result = self.read_entry();
        match &result {
            Ok(Some(_)) => self.entries_read += 1,
            Ok(None) | Err(_) => self.finished = true,
        }
        result
    }

    /// Drive the reader with a callback until the archive ends or the
    /// callback breaks. Returns `true` when the end of the archive was reached.
    pub fn for_each_entry<F>(&mut self, mut f: F) -> Result<bool>
    where
        F: FnMut(ArchiveEntry) -> Result<ControlFlow<()>>,
    {
        while let Some(entry) = self.next_entry()? {
            if f(entry)?.is_break() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Bytes consumed from the underlying stream so far
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn entries_read(&self) -> u64 {
        self.entries_read
    }

    fn read_entry(&mut self) -> Result<Option<ArchiveEntry>> {
        let mut pending = PendingOverrides::default();

        loop {
            let header = match self.read_header_block()? {
                Some(block) => RawHeader::decode(&block)?,
                None => None,
            };
            let header = match header {
                Some(header) => header,
                None if !pending.is_empty() => {
                    return Err(SnapshotError::CorruptArchive(format!(
                        "archive ends after an extension header at offset {}",
                        self.position
                    )));
                }
                None => {
                    self.consume_second_end_block()?;
                    return Ok(None);
                }
            };

            match header.type_flag {
                TYPE_GNU_LONG_NAME => {
                    pending.name = Some(trim_trailing_nul(self.read_payload(header.size)?));
                }
                TYPE_GNU_LONG_LINK => {
                    pending.link_name = Some(trim_trailing_nul(self.read_payload(header.size)?));
                }
                TYPE_PAX_EXTENDED => {
                    let data = self.read_payload(header.size)?;
                    parse_pax_records(&data, &mut pending)?;
                }
                TYPE_PAX_GLOBAL => {
                    debug!("Ignoring pax global header");
                    self.skip_payload(header.size)?;
                }
                TYPE_REGULAR | TYPE_REGULAR_OLD | TYPE_CONTIGUOUS => {
                    let size = pending.size.unwrap_or(header.size);
                    let payload = self.read_payload(size)?;
                    return Ok(Some(build_entry(header, pending, EntryKind::File, Some(payload))));
                }
                TYPE_DIRECTORY => {
                    self.skip_payload(pending.size.unwrap_or(header.size))?;
                    return Ok(Some(build_entry(header, pending, EntryKind::Directory, None)));
                }
                TYPE_SYMLINK => {
                    self.skip_payload(pending.size.unwrap_or(header.size))?;
                    return Ok(Some(build_entry(header, pending, EntryKind::Symlink, None)));
                }
                other => {
                    let name = pending.name.take().unwrap_or(header.name);
                    warn!(
                        "Skipping unsupported tar entry type {:?} for {}",
                        other as char,
                        String::from_utf8_lossy(&name)
                    );
                    // Hard links carry no payload whatever the size field says.
                    let size = if other == header::TYPE_HARD_LINK {
                        0
                    } else {
                        pending.size.unwrap_or(header.size)
                    };
                    self.skip_payload(size)?;
                    pending = PendingOverrides::default();
                }
            }
        }
    }

    /// A clean EOF on a block boundary ends the archive; a short block is corrupt.
    fn read_header_block(&mut self) -> Result<Option<Block>> {
        let mut block = [0u8; BLOCK_SIZE];
        let filled = self.fill(&mut block)?;
        match filled {
            0 => Ok(None),
            BLOCK_SIZE => Ok(Some(block)),
            n => Err(SnapshotError::CorruptArchive(format!(
                "truncated header block at offset {} ({} of {} bytes)",
                self.position - n as u64,
                n,
                BLOCK_SIZE
            ))),
        }
    }

    /// The second zero block is optional on read.
    fn consume_second_end_block(&mut self) -> Result<()> {
        let mut block = [0u8; BLOCK_SIZE];
        self.fill(&mut block)?;
        Ok(())
    }

    fn read_payload(&mut self, size: u64) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        let read = (&mut self.inner).take(size).read_to_end(&mut payload)?;
        self.position += read as u64;
        if (read as u64) < size {
            return Err(SnapshotError::CorruptArchive(format!(
                "truncated payload: expected {} bytes, found {}",
                size, read
            )));
        }
        self.skip_padding(size)?;
        Ok(payload)
    }

    fn skip_payload(&mut self, size: u64) -> Result<()> {
        let skipped = io::copy(&mut (&mut self.inner).take(size), &mut io::sink())?;
        self.position += skipped;
        if skipped < size {
            return Err(SnapshotError::CorruptArchive(format!(
                "truncated payload: expected {} bytes, found {}",
                size, skipped
            )));
        }
        self.skip_padding(size)
    }

    /// Padding after the final payload may be missing; that is not an error.
    fn skip_padding(&mut self, size: u64) -> Result<()> {
        let padding = header::padding_for(size);
        if padding > 0 {
            let mut buf = [0u8; BLOCK_SIZE];
            self.fill(&mut buf[..padding])?;
        }
        Ok(())
    }

    /// Read until `buf` is full or EOF; returns the number of bytes read.
    fn fill(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.position += filled as u64;
        Ok(filled)
    }
}

impl<R: Read> Iterator for ArchiveReader<R> {
    type Item = Result<ArchiveEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

fn build_entry(
    header: RawHeader,
    pending: PendingOverrides,
    kind: EntryKind,
    payload: Option<Vec<u8>>,
) -> ArchiveEntry {
    let name = pending.name.unwrap_or(header.name);
    let name = String::from_utf8_lossy(&name)
        .trim_end_matches('/')
        .to_string();

    let link_target = match kind {
        EntryKind::Symlink => {
            let link = pending.link_name.unwrap_or(header.link_name);
            Some(String::from_utf8_lossy(&link).into_owned())
        }
        _ => None,
    };

    ArchiveEntry {
        name,
        kind,
        attributes: EntryAttributes {
            permissions: header.mode.map(|m| m & 0o7777),
            modified_at: pending.mtime.or(header.mtime),
        },
        link_target,
        payload,
    }
}

fn trim_trailing_nul(mut data: Vec<u8>) -> Vec<u8> {
    while data.last() == Some(&0) {
        data.pop();
    }
    data
}

/// Parse pax records of the form `"<len> <key>=<value>\n"`.
fn parse_pax_records(data: &[u8], pending: &mut PendingOverrides) -> Result<()> {
    let mut rest = data;
    while !rest.is_empty() && rest[0] != 0 {
        let space = rest
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| corrupt_pax("missing length"))?;
        let len: usize = std::str::from_utf8(&rest[..space])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| corrupt_pax("invalid length"))?;
        if len <= space + 1 || len > rest.len() || rest[len - 1] != b'\n' {
            return Err(corrupt_pax("record length out of bounds"));
        }

        let record = &rest[space + 1..len - 1];
        let eq = record
            .iter()
            .position(|&b| b == b'=')
            .ok_or_else(|| corrupt_pax("missing '='"))?;
        let (key, value) = (&record[..eq], &record[eq + 1..]);

        match key {
            b"path" => pending.name = Some(value.to_vec()),
            b"linkpath" => pending.link_name = Some(value.to_vec()),
            b"mtime" => {
                let text = String::from_utf8_lossy(value);
                let seconds = text.split('.').next().unwrap_or_default();
                pending.mtime = Some(seconds.parse().map_err(|_| corrupt_pax("invalid mtime"))?);
            }
            b"size" => {
                let text = String::from_utf8_lossy(value);
                pending.size = Some(text.parse().map_err(|_| corrupt_pax("invalid size"))?);
            }
            _ => debug!("Ignoring pax key {}", String::from_utf8_lossy(key)),
        }

        rest = &rest[len..];
    }
    Ok(())
}

fn corrupt_pax(reason: &str) -> SnapshotError {
    SnapshotError::CorruptArchive(format!("malformed pax record: {}", reason))
}
