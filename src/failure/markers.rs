//! Marker files a worker drops into its own directory for the agent to pick
//! up. Markers are written to a temporary name and renamed into place so a
//! scan never observes a partial file.
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ProcessError;

pub const EXCEPTION_MARKER_SUFFIX: &str = "exception";
pub const OOME_MARKER: &str = "worker.oome";
const TEMP_SUFFIX: &str = "tmp";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionMarker {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerKind {
    Exception(ExceptionMarker),
    Oom,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    pub path: PathBuf,
    pub kind: MarkerKind,
}

/// Numbers exception markers `1.exception`, `2.exception`, ... within one
/// worker directory. Numbering continues after any marker already present,
/// and a number taken on disk is never reused.
#[derive(Debug)]
pub struct MarkerWriter {
    directory: PathBuf,
    next: AtomicU64,
}

impl MarkerWriter {
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        let directory = directory.into();
        let next = highest_marker_number(&directory).saturating_add(1);
        Self {
            directory,
            next: AtomicU64::new(next),
        }
    }

    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// # Errors
    ///
    /// Returns an error if the marker cannot be serialized, written, or
    /// renamed into place.
    pub fn write_exception(&self, marker: &ExceptionMarker) -> Result<PathBuf, ProcessError> {
        let body = serde_json::to_vec(marker).map_err(|err| ProcessError::WriteMarker {
            path: self.directory.clone(),
            source: std::io::Error::new(ErrorKind::InvalidData, err),
        })?;
        loop {
            let number = self.next.fetch_add(1, Ordering::Relaxed);
            let name = format!("{}.{}", number, EXCEPTION_MARKER_SUFFIX);
            if self.directory.join(&name).exists() {
                continue;
            }
            return write_atomically(&self.directory, &name, &body);
        }
    }

    /// # Errors
    ///
    /// Returns an error if the marker cannot be written.
    pub fn write_oome(&self) -> Result<PathBuf, ProcessError> {
        write_atomically(&self.directory, OOME_MARKER, b"")
    }
}

fn write_atomically(directory: &Path, name: &str, body: &[u8]) -> Result<PathBuf, ProcessError> {
    let target = directory.join(name);
    let temp = directory.join(format!("{}.{}.{}", name, std::process::id(), TEMP_SUFFIX));
    fs::write(&temp, body).map_err(|source| ProcessError::WriteMarker {
        path: temp.clone(),
        source,
    })?;
    fs::rename(&temp, &target).map_err(|source| ProcessError::WriteMarker {
        path: target.clone(),
        source,
    })?;
    Ok(target)
}

fn marker_number(name: &str) -> Option<u64> {
    name.strip_suffix(EXCEPTION_MARKER_SUFFIX)
        .and_then(|stem| stem.strip_suffix('.'))
        .and_then(|stem| stem.parse::<u64>().ok())
}

fn highest_marker_number(directory: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(directory) else {
        return 0;
    };
    entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().to_str().and_then(marker_number))
        .max()
        .unwrap_or(0)
}

/// Lists the markers currently in `directory`, exception markers ordered by
/// number. A missing directory has no markers.
///
/// # Errors
///
/// Returns an error if the directory exists but cannot be listed. Markers
/// that cannot be read are logged and left for the next scan.
pub fn scan_markers(directory: &Path) -> Result<Vec<Marker>, std::io::Error> {
    let entries = match fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    let mut numbered: Vec<(u64, Marker)> = Vec::new();
    let mut oome: Option<Marker> = None;
    for entry in entries {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if name == OOME_MARKER {
            oome = Some(Marker {
                path,
                kind: MarkerKind::Oom,
            });
            continue;
        }
        let Some(number) = marker_number(name) else {
            continue;
        };
        match read_exception(&path) {
            Ok(exception) => {
                let kind = MarkerKind::Exception(exception);
                numbered.push((number, Marker { path, kind }));
            }
            // Consumed between listing and reading.
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!("Skipping unreadable marker {}: {}", path.display(), err),
        }
    }
    numbered.sort_by_key(|(number, _)| *number);
    let mut markers: Vec<Marker> = numbered.into_iter().map(|(_, marker)| marker).collect();
    markers.extend(oome);
    Ok(markers)
}

fn read_exception(path: &Path) -> Result<ExceptionMarker, std::io::Error> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw).unwrap_or_else(|_| ExceptionMarker {
        test_index: None,
        phase: None,
        message: raw.trim().to_owned(),
    }))
}

/// Deletes a consumed marker. Returns `false` when it was already gone.
///
/// # Errors
///
/// Returns an error for any failure other than the file being missing.
pub fn remove_marker(path: &Path) -> Result<bool, std::io::Error> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}
