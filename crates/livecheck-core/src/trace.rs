//! Recorded oracle traces.
//!
//! A trace is a JSON-lines file, one oracle result per line:
//!
//! ```text
//! {"kind":"no_face"}
//! {"kind":"face","confidence":0.93,"bbox":{...},"expressions":{"happy":0.91}}
//! {"kind":"error","message":"model not loaded"}
//! ```
//!
//! Blank lines and lines starting with `#` are skipped.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::types::FaceObservation;

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("failed to read trace {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid trace record on line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("trace contains no records")]
    Empty,
}

/// One recorded oracle result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceRecord {
    Face(FaceObservation),
    NoFace,
    /// The oracle failed for this frame.
    Error { message: String },
}

impl TraceRecord {
    /// Split into the oracle's view: `Ok(Some)` face, `Ok(None)` no face,
    /// `Err` detection failure.
    pub fn as_detection(&self) -> Result<Option<&FaceObservation>, &str> {
        match self {
            Self::Face(face) => Ok(Some(face)),
            Self::NoFace => Ok(None),
            Self::Error { message } => Err(message),
        }
    }
}

pub fn parse_trace(contents: &str) -> Result<Vec<TraceRecord>, TraceError> {
    let mut records = Vec::new();
    for (i, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let record = serde_json::from_str(line).map_err(|source| TraceError::Parse {
            line: i + 1,
            source,
        })?;
        records.push(record);
    }
    if records.is_empty() {
        return Err(TraceError::Empty);
    }
    Ok(records)
}

pub fn load_trace(path: &Path) -> Result<Vec<TraceRecord>, TraceError> {
    let contents = std::fs::read_to_string(path).map_err(|source| TraceError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_trace(&contents)
}
