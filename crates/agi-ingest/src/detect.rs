//! Content sniffing
//!
//! Classifies a file from its first bytes: archive containers by magic
//! number, text by a UTF-8 / control-character heuristic. Log files that open
//! with zero-filled blocks (preallocated then truncated) are sniffed from the
//! first non-zero block instead.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Bytes inspected for classification and the zero-block stride
pub const SNIFF_LEN: usize = 4096;

pub const OCTET_STREAM: &str = "application/octet-stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchiveKind {
    Gzip,
    Bzip2,
    Xz,
    Zip,
    Tar,
    Rar,
    SevenZ,
}

impl ArchiveKind {
    pub fn content_type(self) -> &'static str {
        match self {
            ArchiveKind::Gzip => "application/gzip",
            ArchiveKind::Bzip2 => "application/x-bzip2",
            ArchiveKind::Xz => "application/x-xz",
            ArchiveKind::Zip => "application/zip",
            ArchiveKind::Tar => "application/x-tar",
            ArchiveKind::Rar => "application/x-rar-compressed",
            ArchiveKind::SevenZ => "application/x-7z-compressed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextKind {
    Plain,
    Json,
    NdJson,
    Tsv,
}

impl TextKind {
    const ALL: [TextKind; 4] = [TextKind::Plain, TextKind::Json, TextKind::NdJson, TextKind::Tsv];

    /// Inverse of [`TextKind::content_type`]
    pub fn from_content_type(content_type: &str) -> Option<TextKind> {
        Self::ALL.into_iter().find(|kind| kind.content_type() == content_type)
    }

    pub fn content_type(self) -> &'static str {
        match self {
            TextKind::Plain => "text/plain",
            TextKind::Json => "application/json",
            TextKind::NdJson => "application/x-ndjson",
            TextKind::Tsv => "text/tab-separated-values",
        }
    }

    pub fn is_json(self) -> bool {
        matches!(self, TextKind::Json | TextKind::NdJson)
    }
}

/// Result of sniffing one buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sniffed {
    Archive(ArchiveKind),
    Text(TextKind),
    Binary,
}

impl Sniffed {
    pub fn content_type(self) -> &'static str {
        match self {
            Sniffed::Archive(kind) => kind.content_type(),
            Sniffed::Text(kind) => kind.content_type(),
            Sniffed::Binary => OCTET_STREAM,
        }
    }
}

/// Classification of a whole file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detection {
    pub sniffed: Sniffed,
    pub start_at: u64,
}

pub fn sniff(buf: &[u8]) -> Sniffed {
    if let Some(kind) = archive_magic(buf) {
        return Sniffed::Archive(kind);
    }
    match text_kind(buf) {
        Some(kind) => Sniffed::Text(kind),
        None => Sniffed::Binary,
    }
}

pub fn archive_magic(buf: &[u8]) -> Option<ArchiveKind> {
    match buf {
        [0x1F, 0x8B, ..] => Some(ArchiveKind::Gzip),
        [b'B', b'Z', b'h', ..] => Some(ArchiveKind::Bzip2),
        [0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00, ..] => Some(ArchiveKind::Xz),
        [0x50, 0x4B, 0x03, 0x04, ..] | [0x50, 0x4B, 0x05, 0x06, ..] => Some(ArchiveKind::Zip),
        [b'R', b'a', b'r', b'!', 0x1A, 0x07, ..] => Some(ArchiveKind::Rar),
        [0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C, ..] => Some(ArchiveKind::SevenZ),
        _ if is_tar_header(buf) => Some(ArchiveKind::Tar),
        _ => None,
    }
}

/// POSIX and GNU tar both carry `ustar` at offset 257
pub fn is_tar_header(buf: &[u8]) -> bool {
    buf.len() >= 263 && &buf[257..262] == b"ustar"
}

fn text_kind(buf: &[u8]) -> Option<TextKind> {
    if buf.is_empty() {
        return None;
    }
    let text = match std::str::from_utf8(buf) {
        Ok(text) => text,
        // A multi-byte character cut by the buffer end is still text.
        Err(e) if e.error_len().is_none() => std::str::from_utf8(&buf[..e.valid_up_to()]).ok()?,
        Err(_) => return None,
    };
    if text
        .chars()
        .any(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t' | '\x0c'))
    {
        return None;
    }

    let trimmed = text.trim_start();
    if trimmed.starts_with('{') {
        let json_lines = trimmed
            .lines()
            .filter(|l| !l.trim().is_empty())
            .take(2)
            .filter(|l| l.trim_start().starts_with('{'))
            .count();
        return Some(if json_lines > 1 {
            TextKind::NdJson
        } else {
            TextKind::Json
        });
    }
    if trimmed.starts_with('[') && trimmed.trim_end().ends_with(']') {
        return Some(TextKind::Json);
    }
    let first_line = text.lines().next().unwrap_or_default();
    if first_line.contains('\t') {
        return Some(TextKind::Tsv);
    }
    Some(TextKind::Plain)
}

/// Sniff a file, skipping any leading zero-filled blocks
pub fn detect_file(path: &Path) -> io::Result<Detection> {
    let mut file = File::open(path)?;
    let mut buf = vec![0u8; SNIFF_LEN];
    let mut start_at = 0u64;

    loop {
        let read = read_full(&mut file, &mut buf)?;
        let block = &buf[..read];
        if read == SNIFF_LEN && block.iter().all(|b| *b == 0) {
            start_at += read as u64;
            continue;
        }
        if read > 0 && block.iter().all(|b| *b == 0) {
            // Trailing partial block of zeros, nothing readable.
            return Ok(Detection {
                sniffed: Sniffed::Binary,
                start_at: 0,
            });
        }
        return Ok(Detection {
            sniffed: sniff(block),
            start_at,
        });
    }
}

/// Fill `buf` as far as the reader allows
pub fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_archive_magic() {
        assert_eq!(archive_magic(&[0x1F, 0x8B, 0x08, 0x00]), Some(ArchiveKind::Gzip));
        assert_eq!(archive_magic(b"BZh91AY&SY"), Some(ArchiveKind::Bzip2));
        assert_eq!(
            archive_magic(&[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00, 0x00]),
            Some(ArchiveKind::Xz)
        );
        assert_eq!(archive_magic(&[0x50, 0x4B, 0x03, 0x04, 0x14]), Some(ArchiveKind::Zip));
        assert_eq!(archive_magic(b"Rar!\x1A\x07\x01\x00"), Some(ArchiveKind::Rar));
        assert_eq!(
            archive_magic(&[0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C, 0x00, 0x04]),
            Some(ArchiveKind::SevenZ)
        );

        let mut tar = [0u8; 512];
        tar[257..263].copy_from_slice(b"ustar\0");
        assert_eq!(archive_magic(&tar), Some(ArchiveKind::Tar));
        assert_eq!(archive_magic(b"plain words"), None);
    }

    #[test]
    fn test_text_kinds() {
        assert_eq!(
            sniff(b"Jan 01 2024 00:00:00 GMT: INFO (as): starting\n"),
            Sniffed::Text(TextKind::Plain)
        );
        assert_eq!(
            sniff(b"{\"log\":\"a\"}\n{\"log\":\"b\"}\n"),
            Sniffed::Text(TextKind::NdJson)
        );
        assert_eq!(sniff(b"{\"log\": \"a\"}"), Sniffed::Text(TextKind::Json));
        assert_eq!(
            sniff(b"2024-01-01\tnode1\tpayload\n"),
            Sniffed::Text(TextKind::Tsv)
        );
        assert_eq!(sniff(&[0x00, 0x01, 0x02, 0xFF]), Sniffed::Binary);
    }

    #[test]
    fn test_json_kinds_from_recorded_content_type() {
        assert_eq!(TextKind::from_content_type("application/x-ndjson"), Some(TextKind::NdJson));
        assert!(TextKind::from_content_type("application/json").is_some_and(TextKind::is_json));
        assert!(!TextKind::Tsv.is_json());
        assert_eq!(TextKind::from_content_type("application/gzip"), None);
    }

    #[test]
    fn test_truncated_utf8_is_still_text() {
        let mut buf = b"caf".to_vec();
        buf.push(0xC3);
        assert_eq!(sniff(&buf), Sniffed::Text(TextKind::Plain));
    }

    #[test]
    fn test_leading_zero_blocks_are_skipped() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&vec![0u8; SNIFF_LEN * 2]).unwrap();
        file.write_all(b"Jan 01 2024 00:00:00 GMT: INFO (as): hello\n").unwrap();
        file.flush().unwrap();

        let detection = detect_file(file.path()).unwrap();
        assert_eq!(detection.sniffed, Sniffed::Text(TextKind::Plain));
        assert_eq!(detection.start_at, (SNIFF_LEN * 2) as u64);
    }
}
