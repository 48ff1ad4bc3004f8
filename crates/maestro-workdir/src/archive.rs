//! Archive encoding and decoding.
//!
//! Files are written in sorted relpath order; the manifest mirrors that
//! order exactly, so the same workdir always produces the same manifest.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use maestro_core::{Compression, ManifestEntry};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{WorkdirError, WorkdirResult};

/// Result of archiving a workdir.
#[derive(Debug, Clone)]
pub struct ArchiveOutput {
    /// Where the blob was written.
    pub path: PathBuf,
    /// Blob size in bytes.
    pub size_bytes: u64,
    /// Manifest in sorted relpath order.
    pub manifest: Vec<ManifestEntry>,
}

/// Collect regular files under `root` as `(relpath, absolute)` pairs,
/// sorted by relpath.
fn collect_files(root: &Path) -> WorkdirResult<Vec<(String, PathBuf)>> {
    fn walk(
        root: &Path,
        dir: &Path,
        out: &mut Vec<(String, PathBuf)>,
    ) -> WorkdirResult<()> {
        for entry in std::fs::read_dir(dir).map_err(|e| WorkdirError::io(dir, e))? {
            let entry = entry.map_err(|e| WorkdirError::io(dir, e))?;
            let path = entry.path();
            let file_type = entry
                .file_type()
                .map_err(|e| WorkdirError::io(&path, e))?;
            if file_type.is_dir() {
                walk(root, &path, out)?;
            } else if file_type.is_file() {
                let rel = path
                    .strip_prefix(root)
                    .map_err(|e| WorkdirError::Archive(format!("bad relpath: {e}")))?
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                out.push((rel, path));
            }
        }
        Ok(())
    }

    let mut files = Vec::new();
    walk(root, root, &mut files)?;
    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

fn hash_file(path: &Path) -> WorkdirResult<(u64, String)> {
    let mut file = File::open(path).map_err(|e| WorkdirError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size: u64 = 0;
    loop {
        let n = file.read(&mut buf).map_err(|e| WorkdirError::io(path, e))?;
        if n == 0 {
            break;
        }
        size += n as u64;
        hasher.update(&buf[..n]);
    }
    Ok((size, format!("{:x}", hasher.finalize())))
}

/// Write the archive blob for `workdir` at `blob`, returning the manifest.
pub(crate) fn write_archive(
    workdir: &Path,
    blob: &Path,
    compression: Compression,
) -> WorkdirResult<ArchiveOutput> {
    let files = collect_files(workdir)?;
    let mut manifest = Vec::with_capacity(files.len());
    for (rel, abs) in &files {
        let (size, sha256) = hash_file(abs)?;
        manifest.push(ManifestEntry {
            relpath: rel.clone(),
            size,
            sha256,
        });
    }

    let out = File::create(blob).map_err(|e| WorkdirError::io(blob, e))?;
    match compression {
        Compression::Gzip => {
            let encoder = GzEncoder::new(out, flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);
            append_all(&mut builder, &files)?;
            builder
                .into_inner()
                .and_then(GzEncoder::finish)
                .map_err(|e| WorkdirError::Archive(e.to_string()))?;
        },
        Compression::Tar => {
            let mut builder = tar::Builder::new(out);
            append_all(&mut builder, &files)?;
            builder
                .finish()
                .map_err(|e| WorkdirError::Archive(e.to_string()))?;
        },
        Compression::Zip => {
            let mut writer = zip::ZipWriter::new(out);
            let options = zip::write::SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated);
            for (rel, abs) in &files {
                writer
                    .start_file(rel.as_str(), options)
                    .map_err(|e| WorkdirError::Archive(e.to_string()))?;
                let mut src = File::open(abs).map_err(|e| WorkdirError::io(abs, e))?;
                std::io::copy(&mut src, &mut writer)
                    .map_err(|e| WorkdirError::io(abs, e))?;
            }
            writer
                .finish()
                .map_err(|e| WorkdirError::Archive(e.to_string()))?;
        },
    }

    let size_bytes = std::fs::metadata(blob)
        .map_err(|e| WorkdirError::io(blob, e))?
        .len();
    Ok(ArchiveOutput {
        path: blob.to_path_buf(),
        size_bytes,
        manifest,
    })
}

fn append_all<W: Write>(
    builder: &mut tar::Builder<W>,
    files: &[(String, PathBuf)],
) -> WorkdirResult<()> {
    for (rel, abs) in files {
        builder
            .append_path_with_name(abs, rel)
            .map_err(|e| WorkdirError::io(abs, e))?;
    }
    Ok(())
}

/// Extract an archive blob into `dst` (created if missing).
pub(crate) fn extract_archive(
    blob: &Path,
    compression: Compression,
    dst: &Path,
) -> WorkdirResult<()> {
    std::fs::create_dir_all(dst).map_err(|e| WorkdirError::io(dst, e))?;
    let file = File::open(blob).map_err(|e| WorkdirError::io(blob, e))?;
    match compression {
        Compression::Gzip => {
            let mut archive = tar::Archive::new(GzDecoder::new(file));
            archive
                .unpack(dst)
                .map_err(|e| WorkdirError::Archive(e.to_string()))?;
        },
        Compression::Tar => {
            let mut archive = tar::Archive::new(file);
            archive
                .unpack(dst)
                .map_err(|e| WorkdirError::Archive(e.to_string()))?;
        },
        Compression::Zip => {
            let mut archive = zip::ZipArchive::new(file)
                .map_err(|e| WorkdirError::Archive(e.to_string()))?;
            archive
                .extract(dst)
                .map_err(|e| WorkdirError::Archive(e.to_string()))?;
        },
    }
    Ok(())
}
