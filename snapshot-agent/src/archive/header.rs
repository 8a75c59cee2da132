//! Tar header block codec.
//!
//! Encodes and decodes single 512-byte POSIX ustar header blocks, including
//! the checksum, octal/base-256 numeric fields and the ustar name prefix.
//! Multi-block constructs (GNU long names, pax records) are assembled by the
//! writer and reader on top of this module.

use crate::utils::errors::{Result, SnapshotError};

/// Size of one tar block; headers and payload padding are aligned to it.
pub const BLOCK_SIZE: usize = 512;

pub type Block = [u8; BLOCK_SIZE];

pub const TYPE_REGULAR: u8 = b'0';
pub const TYPE_REGULAR_OLD: u8 = b'\0';
pub const TYPE_HARD_LINK: u8 = b'1';
pub const TYPE_SYMLINK: u8 = b'2';
pub const TYPE_DIRECTORY: u8 = b'5';
pub const TYPE_CONTIGUOUS: u8 = b'7';
pub const TYPE_GNU_LONG_NAME: u8 = b'L';
pub const TYPE_GNU_LONG_LINK: u8 = b'K';
pub const TYPE_PAX_EXTENDED: u8 = b'x';
pub const TYPE_PAX_GLOBAL: u8 = b'g';

/// Name used for GNU long-name and long-link records.
pub const GNU_LONG_LINK_NAME: &str = "././@LongLink";

const NAME: (usize, usize) = (0, 100);
const MODE: (usize, usize) = (100, 8);
const UID: (usize, usize) = (108, 8);
const GID: (usize, usize) = (116, 8);
const SIZE: (usize, usize) = (124, 12);
const MTIME: (usize, usize) = (136, 12);
const CHECKSUM: (usize, usize) = (148, 8);
const TYPE_FLAG: usize = 156;
const LINK_NAME: (usize, usize) = (157, 100);
const MAGIC: (usize, usize) = (257, 6);
const VERSION: (usize, usize) = (263, 2);
const PREFIX: (usize, usize) = (345, 155);

const USTAR_MAGIC: &[u8; 6] = b"ustar\0";
const USTAR_VERSION: &[u8; 2] = b"00";

/// Field values carried by one header block.
///
/// `name` and `link_name` hold the full decoded strings; on encode they are
/// truncated to what the block can carry, so callers that need more must
/// emit a long-name record first (see [`needs_long_name`]).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawHeader {
    pub name: Vec<u8>,
    pub type_flag: u8,
    pub mode: Option<u32>,
    pub size: u64,
    pub mtime: Option<i64>,
    pub link_name: Vec<u8>,
}

/// True when `name` fits neither the name field nor a ustar prefix split.
pub fn needs_long_name(name: &[u8]) -> bool {
    name.len() > NAME.1 && split_ustar_name(name).is_none()
}

/// True when a link target does not fit the link name field.
pub fn needs_long_link(link: &[u8]) -> bool {
    link.len() > LINK_NAME.1
}

/// Split a long name at a `/` so the head fits `prefix` and the tail fits `name`.
fn split_ustar_name(name: &[u8]) -> Option<(&[u8], &[u8])> {
    if name.len() > PREFIX.1 + 1 + NAME.1 {
        return None;
    }
    // Prefer the longest prefix so the name field keeps the short tail.
    let upper = name.len().min(PREFIX.1 + 1);
    (1..upper)
        .rev()
        .filter(|&i| name[i] == b'/')
        .map(|i| (&name[..i], &name[i + 1..]))
        .find(|(prefix, rest)| prefix.len() <= PREFIX.1 && !rest.is_empty() && rest.len() <= NAME.1)
}

impl RawHeader {
    pub fn encode(&self) -> Block {
        let mut block = [0u8; BLOCK_SIZE];

        if self.name.len() <= NAME.1 {
            put_bytes(&mut block, NAME, &self.name);
        } else if let Some((prefix, rest)) = split_ustar_name(&self.name) {
            put_bytes(&mut block, PREFIX, prefix);
            put_bytes(&mut block, NAME, rest);
        } else {
            put_bytes(&mut block, NAME, &self.name[..NAME.1]);
        }

        if let Some(mode) = self.mode {
            encode_numeric(field_mut(&mut block, MODE), i128::from(mode & 0o7777777));
        }
        encode_numeric(field_mut(&mut block, UID), 0);
        encode_numeric(field_mut(&mut block, GID), 0);
        encode_numeric(field_mut(&mut block, SIZE), i128::from(self.size));
        if let Some(mtime) = self.mtime {
            encode_numeric(field_mut(&mut block, MTIME), i128::from(mtime));
        }

        block[TYPE_FLAG] = self.type_flag;
        let link_len = self.link_name.len().min(LINK_NAME.1);
        put_bytes(&mut block, LINK_NAME, &self.link_name[..link_len]);
        put_bytes(&mut block, MAGIC, USTAR_MAGIC);
        put_bytes(&mut block, VERSION, USTAR_VERSION);

        let sum = checksum(&block).0;
        let digits = format!("{:06o}\0 ", sum);
        put_bytes(&mut block, CHECKSUM, digits.as_bytes());

        block
    }

    /// Decode one block. `Ok(None)` means an all-zero end-of-archive block.
    pub fn decode(block: &Block) -> Result<Option<Self>> {
        if block.iter().all(|&b| b == 0) {
            return Ok(None);
        }

        let stored = decode_numeric(field(block, CHECKSUM))?
            .ok_or_else(|| SnapshotError::CorruptArchive("header has no checksum".to_string()))?;
        let (unsigned, signed) = checksum(block);
        if stored != i128::from(unsigned) && stored != i128::from(signed) {
            return Err(SnapshotError::CorruptArchive(format!(
                "header checksum mismatch (stored {:o}, computed {:o})",
                stored, unsigned
            )));
        }

        let mut name = Vec::new();
        if field(block, MAGIC) == USTAR_MAGIC {
            let prefix = trim_nul(field(block, PREFIX));
            if !prefix.is_empty() {
                name.extend_from_slice(prefix);
                name.push(b'/');
            }
        }
        name.extend_from_slice(trim_nul(field(block, NAME)));

        let mode = decode_numeric(field(block, MODE))?
            .map(|m| u32::try_from(m).map_err(|_| corrupt_field("mode", m)))
            .transpose()?;
        let size = match decode_numeric(field(block, SIZE))? {
            Some(s) => u64::try_from(s).map_err(|_| corrupt_field("size", s))?,
            None => 0,
        };
        let mtime = decode_numeric(field(block, MTIME))?
            .map(|t| i64::try_from(t).map_err(|_| corrupt_field("mtime", t)))
            .transpose()?;

        Ok(Some(Self {
            name,
            type_flag: block[TYPE_FLAG],
            mode,
            size,
            mtime,
            link_name: trim_nul(field(block, LINK_NAME)).to_vec(),
        }))
    }
}

/// Number of zero bytes that pad `size` payload bytes to a block boundary.
pub fn padding_for(size: u64) -> usize {
    let rem = (size % BLOCK_SIZE as u64) as usize;
    if rem == 0 {
        0
    } else {
        BLOCK_SIZE - rem
    }
}

fn field(block: &Block, (offset, len): (usize, usize)) -> &[u8] {
    &block[offset..offset + len]
}

fn field_mut(block: &mut Block, (offset, len): (usize, usize)) -> &mut [u8] {
    &mut block[offset..offset + len]
}

fn put_bytes(block: &mut Block, (offset, len): (usize, usize), bytes: &[u8]) {
    let n = bytes.len().min(len);
    block[offset..offset + n].copy_from_slice(&bytes[..n]);
}

fn trim_nul(bytes: &[u8]) -> &[u8] {
    match bytes.iter().position(|&b| b == 0) {
        Some(end) => &bytes[..end],
        None => bytes,
    }
}

fn corrupt_field(name: &str, value: i128) -> SnapshotError {
    SnapshotError::CorruptArchive(format!("{} field out of range: {}", name, value))
}

/// Sum of all header bytes with the checksum field read as spaces, computed
/// both unsigned (POSIX) and signed (historic implementations).
fn checksum(block: &Block) -> (u32, i32) {
    let mut unsigned = 0u32;
    let mut signed = 0i32;
    for (i, &b) in block.iter().enumerate() {
        let b = if (CHECKSUM.0..CHECKSUM.0 + CHECKSUM.1).contains(&i) { b' ' } else { b };
        unsigned += u32::from(b);
        signed += i32::from(b as i8);
    }
    (unsigned, signed)
}

/// Octal with a trailing NUL when the value fits, GNU base-256 otherwise.
fn encode_numeric(field: &mut [u8], value: i128) {
    let digits = field.len() - 1;
    if value >= 0 && value < 1i128 << (3 * digits) {
        let text = format!("{:0width$o}", value, width = digits);
        field[..digits].copy_from_slice(text.as_bytes());
        field[digits] = 0;
    } else {
        let mut v = value;
        for byte in field.iter_mut().rev() {
            *byte = (v & 0xff) as u8;
            v >>= 8;
        }
        field[0] |= 0x80;
    }
}

/// `Ok(None)` for an empty field (all NULs or spaces).
fn decode_numeric(field: &[u8]) -> Result<Option<i128>> {
    if field[0] & 0x80 != 0 {
        let negative = field[0] & 0x40 != 0;
        let mut value: i128 = if negative { -1 } else { 0 };
        for (i, &b) in field.iter().enumerate() {
            let b = if i == 0 && !negative { b & 0x7f } else { b };
            value = (value << 8) | i128::from(b);
        }
        return Ok(Some(value));
    }

    let text: Vec<u8> = field
        .iter()
        .copied()
        .skip_while(|&b| b == b' ' || b == 0)
        .take_while(|&b| b != b' ' && b != 0)
        .collect();
    if text.is_empty() {
        return Ok(None);
    }

    let mut value: i128 = 0;
    for b in text {
        if !(b'0'..=b'7').contains(&b) {
            return Err(SnapshotError::CorruptArchive(format!(
                "invalid octal digit {:?} in numeric field",
                b as char
            )));
        }
        value = (value << 3) | i128::from(b - b'0');
    }
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(name: &str) -> RawHeader {
        RawHeader {
            name: name.as_bytes().to_vec(),
            type_flag: TYPE_REGULAR,
            mode: Some(0o644),
            size: 10,
            mtime: Some(1_700_000_000),
            link_name: Vec::new(),
        }
    }

    #[test]
    fn test_encode_decode_header() {
        let original = header("Documents/note.txt");
        let block = original.encode();

        assert_eq!(&block[257..263], b"ustar\0");
        assert_eq!(&block[100..108], b"0000644\0");
        assert_eq!(&block[124..136], b"00000000012\0");

        let decoded = RawHeader::decode(&block).unwrap().unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_zero_block_is_end_marker() {
        let block = [0u8; BLOCK_SIZE];
        assert!(RawHeader::decode(&block).unwrap().is_none());
    }

    #[test]
    fn test_checksum_mismatch_is_corrupt() {
        let mut block = header("Documents/note.txt").encode();
        block[0] ^= 0x01;

        let err = RawHeader::decode(&block).unwrap_err();
        assert!(matches!(err, SnapshotError::CorruptArchive(_)));
    }

    #[test]
    fn test_absent_mode_and_mtime_stay_absent() {
        let mut original = header("Library/cache");
        original.type_flag = TYPE_DIRECTORY;
        original.size = 0;
        original.mode = None;
        original.mtime = None;

        let decoded = RawHeader::decode(&original.encode()).unwrap().unwrap();
        assert_eq!(decoded.mode, None);
        assert_eq!(decoded.mtime, None);
    }

    #[test]
    fn test_long_name_uses_ustar_prefix() {
        let dir = "Library/Application Support/".to_string() + &"nested/".repeat(12);
        let name = format!("{}file.dat", dir);
        assert!(name.len() > 100);
        assert!(!needs_long_name(name.as_bytes()));

        let block = header(&name).encode();
        assert_ne!(block[345], 0);

        let decoded = RawHeader::decode(&block).unwrap().unwrap();
        assert_eq!(decoded.name, name.as_bytes());
    }

    #[test]
    fn test_unsplittable_name_needs_long_record() {
        let name = format!("Documents/{}", "x".repeat(150));
        assert!(needs_long_name(name.as_bytes()));
        assert!(needs_long_link("y".repeat(101).as_bytes()));
        assert!(!needs_long_link("y".repeat(100).as_bytes()));
    }

    #[test]
    fn test_base256_for_large_size_and_negative_mtime() {
        let mut original = header("tmp/huge.bin");
        original.size = 9 * 1024 * 1024 * 1024;
        original.mtime = Some(-86_400);

        let block = original.encode();
        assert_eq!(block[124] & 0x80, 0x80);
        assert_eq!(block[136], 0xff);

        let decoded = RawHeader::decode(&block).unwrap().unwrap();
        assert_eq!(decoded.size, original.size);
        assert_eq!(decoded.mtime, Some(-86_400));
    }

    #[test]
    fn test_padding_for() {
        assert_eq!(padding_for(0), 0);
        assert_eq!(padding_for(10), 502);
        assert_eq!(padding_for(512), 0);
        assert_eq!(padding_for(513), 511);
    }
}
