//! Archive codec: unpack an EPUB into a working directory and pack it back.
//!
//! Packing always writes `mimetype` first and uncompressed, then every other
//! file deflated. Reading systems reject packages that break this layout, so
//! entry order and per-entry compression are controlled explicitly.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use crate::error::ArchiveError;
use crate::security::{self, SecurityLimits};

pub const MIMETYPE: &str = "application/epub+zip";
pub const MIMETYPE_ENTRY: &str = "mimetype";

fn extraction_err(path: &Path, detail: impl ToString) -> ArchiveError {
    ArchiveError::Extraction {
        path: path.to_path_buf(),
        detail: detail.to_string(),
    }
}

fn compression_err(path: &Path, detail: impl ToString) -> ArchiveError {
    ArchiveError::Compression {
        path: path.to_path_buf(),
        detail: detail.to_string(),
    }
}

/// Extract `archive_path` into `dest_dir`, clearing it first.
pub fn extract(
    archive_path: &Path,
    dest_dir: &Path,
    limits: &SecurityLimits,
) -> Result<(), ArchiveError> {
    if dest_dir.exists() {
        std::fs::remove_dir_all(dest_dir)
            .map_err(|e| extraction_err(dest_dir, format!("cannot clear directory: {e}")))?;
    }
    std::fs::create_dir_all(dest_dir)
        .map_err(|e| extraction_err(dest_dir, format!("cannot create directory: {e}")))?;

    let file = File::open(archive_path).map_err(|e| extraction_err(archive_path, e))?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| extraction_err(archive_path, format!("Invalid ZIP archive: {e}")))?;

    security::check_file_count(archive.len() as u64, limits)?;

    let mut declared: u64 = 0;
    for i in 0..archive.len() {
        let entry = archive
            .by_index_raw(i)
            .map_err(|e| extraction_err(archive_path, e))?;
        declared = declared.saturating_add(entry.size());
    }
    security::check_total_size(declared, limits)?;

    let mut written: u64 = 0;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| extraction_err(archive_path, e))?;
        let name = entry.name().to_string();
        let out_path = dest_dir.join(security::safe_entry_path(&name)?);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Declared sizes can lie; cap what is actually inflated.
        let remaining = limits.max_total_size_bytes.saturating_sub(written);
        let mut out = File::create(&out_path)?;
        let copied = io::copy(&mut (&mut entry).take(remaining.saturating_add(1)), &mut out)?;
        written = written.saturating_add(copied);
        security::check_total_size(written, limits)?;

        tracing::debug!("Extracted {} ({} bytes)", name, copied);
    }

    tracing::info!(
        "Extracted {} entries from {} into {}",
        archive.len(),
        archive_path.display(),
        dest_dir.display()
    );
    Ok(())
}

/// Pack `source_dir` into `dest_path` as an EPUB.
///
/// A fresh `mimetype` file is written into `source_dir` and added first,
/// stored. Every other file follows, deflated, under its path relative to
/// `source_dir`. Any existing file at `dest_path` is replaced. Returns `true`
/// once the archive is finished and synced to disk.
pub fn compress(dest_path: &Path, source_dir: &Path) -> Result<bool, ArchiveError> {
    std::fs::write(source_dir.join(MIMETYPE_ENTRY), MIMETYPE)
        .map_err(|e| compression_err(dest_path, format!("cannot write mimetype: {e}")))?;

    if dest_path.exists() {
        std::fs::remove_file(dest_path).map_err(|e| compression_err(dest_path, e))?;
    }
    if let Some(parent) = dest_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| compression_err(dest_path, e))?;
    }

    let file = File::create(dest_path).map_err(|e| compression_err(dest_path, e))?;
    let mut zip = zip::ZipWriter::new(file);

    let opts_store: zip::write::FileOptions<'_, ()> = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Stored);
    let opts_deflate: zip::write::FileOptions<'_, ()> = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    // Pass 1: mimetype alone.
    zip.start_file(MIMETYPE_ENTRY, opts_store)
        .map_err(|e| compression_err(dest_path, e))?;
    zip.write_all(MIMETYPE.as_bytes())
        .map_err(|e| compression_err(dest_path, e))?;

    // Pass 2: everything else.
    let mut count = 1usize;
    for path in crate::fsutil::walk_files(source_dir) {
        let Some(name) = crate::fsutil::relative_slash_path(&path, source_dir) else {
            continue;
        };
        if name == MIMETYPE_ENTRY {
            continue;
        }
        zip.start_file(name.as_str(), opts_deflate)
            .map_err(|e| compression_err(dest_path, e))?;
        let mut input = File::open(&path).map_err(|e| compression_err(&path, e))?;
        io::copy(&mut input, &mut zip).map_err(|e| compression_err(&path, e))?;
        count += 1;
    }

    let file = zip.finish().map_err(|e| compression_err(dest_path, e))?;
    file.sync_all().map_err(|e| compression_err(dest_path, e))?;

    tracing::info!("Packed {} entries into {}", count, dest_path.display());
    Ok(true)
}
