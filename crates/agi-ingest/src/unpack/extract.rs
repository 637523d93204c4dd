//! Archive extraction
//!
//! Every format extracts into a caller supplied output directory. Multi-file
//! containers keep their internal layout; single-stream codecs produce one
//! file named after the archive with the codec suffix removed.
//!
//! # Supported Formats
//!
//! - **Tar** (+ gzip / bzip2 in one pass): `tar`, `flate2`, `bzip2`
//! - **Gzip / Bzip2 / Xz** single streams: `flate2`, `bzip2`, `xz2`
//! - **Zip**: `zip`
//! - **Rar**: `unrar`
//! - **7z**: `sevenz-rust`

use anyhow::{anyhow, Context, Result};
use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::debug;
use xz2::read::XzDecoder;

use crate::detect::ArchiveKind;

/// How to open one archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveSpec {
    pub kind: ArchiveKind,
    /// The compressed stream holds a tar (`.tar.gz`, `.tar.bz2`)
    pub tar_wrapped: bool,
}

/// Extract `archive` into `out_dir`, creating it
pub fn extract(archive: &Path, spec: ArchiveSpec, out_dir: &Path) -> Result<()> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;
    let open = || -> Result<BufReader<File>> {
        File::open(archive)
            .map(BufReader::new)
            .with_context(|| format!("Failed to open {}", archive.display()))
    };

    match (spec.kind, spec.tar_wrapped) {
        (ArchiveKind::Gzip, true) => unpack_tar(GzDecoder::new(open()?), out_dir),
        (ArchiveKind::Bzip2, true) => unpack_tar(BzDecoder::new(open()?), out_dir),
        (ArchiveKind::Tar, _) => unpack_tar(open()?, out_dir),
        (ArchiveKind::Gzip, false) => write_stream(GzDecoder::new(open()?), archive, out_dir, spec.kind),
        (ArchiveKind::Bzip2, false) => write_stream(BzDecoder::new(open()?), archive, out_dir, spec.kind),
        (ArchiveKind::Xz, _) => write_stream(XzDecoder::new(open()?), archive, out_dir, spec.kind),
        (ArchiveKind::Zip, _) => {
            let mut zip = zip::ZipArchive::new(open()?).context("Failed to read zip archive")?;
            zip.extract(out_dir).context("Failed to extract zip archive")
        },
        (ArchiveKind::Rar, _) => extract_rar(archive, out_dir),
        (ArchiveKind::SevenZ, _) => sevenz_rust::decompress_file(archive, out_dir)
            .map_err(|e| anyhow!("Failed to extract 7z archive: {}", e)),
    }?;

    debug!(archive = %archive.display(), out = %out_dir.display(), "Extracted");
    Ok(())
}

fn unpack_tar<R: Read>(reader: R, out_dir: &Path) -> Result<()> {
    // Entries with absolute or `..` paths are refused by `unpack`.
    tar::Archive::new(reader)
        .unpack(out_dir)
        .context("Failed to unpack tar archive")
}

fn write_stream<R: Read>(mut reader: R, archive: &Path, out_dir: &Path, kind: ArchiveKind) -> Result<()> {
    let target = out_dir.join(stream_output_name(archive, kind));
    let mut out =
        File::create(&target).with_context(|| format!("Failed to create {}", target.display()))?;
    io::copy(&mut reader, &mut out).context("Failed to decompress stream")?;
    Ok(())
}

fn extract_rar(archive: &Path, out_dir: &Path) -> Result<()> {
    let mut rar = unrar::Archive::new(archive)
        .open_for_processing()
        .map_err(|e| anyhow!("Failed to open rar archive: {}", e))?;
    while let Some(header) = rar
        .read_header()
        .map_err(|e| anyhow!("Failed to read rar header: {}", e))?
    {
        rar = if header.entry().is_file() {
            header
                .extract_with_base(out_dir)
                .map_err(|e| anyhow!("Failed to extract rar entry: {}", e))?
        } else {
            header
                .skip()
                .map_err(|e| anyhow!("Failed to skip rar entry: {}", e))?
        };
    }
    Ok(())
}

/// File name produced by a single-stream codec
///
/// `.gz` is dropped and `.tgz` becomes `.tar`; `.xz` is dropped; bzip2
/// suffixes (`.bzip2`, `.bz2`, `.bzip`, `.bz`) are dropped. A name without a
/// known suffix is kept as is.
pub fn stream_output_name(archive: &Path, kind: ArchiveKind) -> PathBuf {
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "stream".to_string());

    let stripped = match kind {
        ArchiveKind::Gzip => {
            if let Some(stem) = name.strip_suffix(".tgz") {
                Some(format!("{}.tar", stem))
            } else {
                name.strip_suffix(".gz").map(str::to_string)
            }
        },
        ArchiveKind::Xz => name.strip_suffix(".xz").map(str::to_string),
        ArchiveKind::Bzip2 => [".bzip2", ".bz2", ".bzip", ".bz"]
            .iter()
            .find_map(|suffix| name.strip_suffix(suffix))
            .map(str::to_string),
        _ => None,
    };

    PathBuf::from(stripped.filter(|s| !s.is_empty()).unwrap_or(name))
}
