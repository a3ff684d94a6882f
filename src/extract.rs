use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use flate2::read::GzDecoder;
use tar::Archive;
use tracing::debug;

use crate::error::SkyDataError;
use crate::progress::{ExtractionProgress, Throttle};
use crate::task::CancelToken;

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractOutcome {
    Completed { files: usize, bytes_written: u64 },
    Cancelled,
}

struct CountingReader<R> {
    inner: R,
    consumed: Arc<AtomicU64>,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = self.inner.read(buf)?;
        self.consumed.fetch_add(count as u64, Ordering::Relaxed);
        Ok(count)
    }
}

pub struct ArchiveExtractor;

impl ArchiveExtractor {
    /// Unpacks a `.tar.gz` into `destination`. Only the paths named by the
    /// archive are written; nothing is rolled back on failure.
    pub fn extract(
        archive_path: &Path,
        destination: &Path,
        cancel: &CancelToken,
        on_progress: &mut dyn FnMut(ExtractionProgress),
    ) -> Result<ExtractOutcome, SkyDataError> {
        let file = File::open(archive_path).map_err(|err| {
            SkyDataError::Extraction(format!("open {}: {err}", archive_path.display()))
        })?;
        let compressed_total = file
            .metadata()
            .map_err(|err| SkyDataError::Extraction(err.to_string()))?
            .len();
        let consumed = Arc::new(AtomicU64::new(0));
        let reader = CountingReader {
            inner: BufReader::new(file),
            consumed: consumed.clone(),
        };
        let mut archive = Archive::new(GzDecoder::new(reader));

        let mut throttle = Throttle::default();
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut files = 0usize;
        let mut bytes_written = 0u64;

        let entries = archive
            .entries()
            .map_err(|err| SkyDataError::Extraction(err.to_string()))?;
        for entry in entries {
            if cancel.is_cancelled() {
                return Ok(ExtractOutcome::Cancelled);
            }
            let mut entry = entry.map_err(|err| SkyDataError::Extraction(err.to_string()))?;
            let entry_type = entry.header().entry_type();
            if entry_type.is_dir() {
                continue;
            }
            let relative = entry
                .path()
                .map_err(|err| SkyDataError::Extraction(err.to_string()))?
                .into_owned();
            if !entry_type.is_file() {
                debug!("skipping non-regular entry {}", relative.display());
                continue;
            }
            let target = destination.join(enclosed_path(&relative)?);

            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|err| {
                    SkyDataError::Extraction(format!("create {}: {err}", parent.display()))
                })?;
            }
            let mut output = File::create(&target).map_err(|err| {
                SkyDataError::Extraction(format!("create {}: {err}", target.display()))
            })?;

            loop {
                if cancel.is_cancelled() {
                    return Ok(ExtractOutcome::Cancelled);
                }
                let count = match entry.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(count) => count,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        return Err(SkyDataError::Extraction(format!(
                            "read {}: {err}",
                            relative.display()
                        )));
                    }
                };
                output.write_all(&buffer[..count]).map_err(|err| {
                    SkyDataError::Extraction(format!("write {}: {err}", target.display()))
                })?;
                bytes_written += count as u64;
                if throttle.ready() {
                    let read = consumed.load(Ordering::Relaxed).min(compressed_total);
                    on_progress(ExtractionProgress::new(read, compressed_total));
                }
            }
            output
                .flush()
                .map_err(|err| SkyDataError::Extraction(err.to_string()))?;
            files += 1;
        }

        on_progress(ExtractionProgress::new(compressed_total, compressed_total));
        Ok(ExtractOutcome::Completed {
            files,
            bytes_written,
        })
    }
}

/// Rejects absolute paths and parent traversal inside archive entries.
fn enclosed_path(path: &Path) -> Result<PathBuf, SkyDataError> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(SkyDataError::Extraction(format!(
                    "archive entry escapes destination: {}",
                    path.display()
                )));
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(SkyDataError::Extraction("archive entry has empty path".to_string()));
    }
    Ok(clean)
}
