//! Model artifact format detection.

use crate::error::{ServeError, ServeResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Packed single-file extension.
pub const PACKED_EXTENSION: &str = "gguf";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFormat {
    /// Quantized single-file weights
    Packed,
    /// Directory of full-precision weights plus tokenizer
    FullPrecision,
}

impl std::fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelFormat::Packed => write!(f, "packed"),
            ModelFormat::FullPrecision => write!(f, "full-precision"),
        }
    }
}

/// A located model on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub format: ModelFormat,
    /// For packed models, the `.gguf` file itself
    pub path: PathBuf,
    pub size_bytes: u64,
}

impl ModelArtifact {
    pub fn size_gb(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    }
}

fn is_packed_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case(PACKED_EXTENSION))
        .unwrap_or(false)
}

/// First `.gguf` file in `dir`, by name.
fn find_packed_in(dir: &Path) -> ServeResult<Option<PathBuf>> {
    let mut found: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && is_packed_file(p))
        .collect();
    found.sort();
    Ok(found.into_iter().next())
}

fn dir_size(dir: &Path) -> u64 {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter_map(|e| e.metadata().ok())
                .filter(|m| m.is_file())
                .map(|m| m.len())
                .sum()
        })
        .unwrap_or(0)
}

/// Classify `path`: a `.gguf` file, or a directory containing one, is packed;
/// anything else is full-precision.
pub fn detect_format(path: &Path) -> ServeResult<ModelArtifact> {
    if !path.exists() {
        return Err(ServeError::ModelNotFound(path.display().to_string()));
    }

    if path.is_dir() {
        if let Some(file) = find_packed_in(path)? {
            let size_bytes = std::fs::metadata(&file)?.len();
            return Ok(ModelArtifact {
                format: ModelFormat::Packed,
                path: file,
                size_bytes,
            });
        }
        return Ok(ModelArtifact {
            format: ModelFormat::FullPrecision,
            path: path.to_path_buf(),
            size_bytes: dir_size(path),
        });
    }

    let size_bytes = std::fs::metadata(path)?.len();
    let format = if is_packed_file(path) {
        ModelFormat::Packed
    } else {
        ModelFormat::FullPrecision
    };
    Ok(ModelArtifact {
        format,
        path: path.to_path_buf(),
        size_bytes,
    })
}
