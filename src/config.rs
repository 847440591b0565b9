//! Session options and commit hints

use crate::error::{CdfError, Result};
use crate::io::{BackendKind, IoOptions, DEFAULT_CHUNK_SIZE};
use crate::types::{FillMode, FormatVariant};
use serde::{Deserialize, Serialize};
use std::env;

/// Options fixed when a dataset is created or opened
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetOptions {
    /// Storage medium
    pub backend: BackendKind,

    /// Requested buffering granularity in bytes; clamped by the backend
    pub chunk_size_hint: usize,

    /// Initial fill mode
    pub fill_mode: FillMode,

    /// On-disk size variant for new datasets; ignored on open
    pub format: FormatVariant,

    /// Open for writing. New datasets are always writable.
    pub write: bool,

    /// Refuse to create over an existing file
    pub no_clobber: bool,

    /// In-memory backend only: write the image back to the path
    pub persist: bool,
}

impl Default for DatasetOptions {
    fn default() -> Self {
        Self {
            backend: BackendKind::PlainFile,
            chunk_size_hint: DEFAULT_CHUNK_SIZE,
            fill_mode: FillMode::Fill,
            format: FormatVariant::Classic,
            write: false,
            no_clobber: false,
            persist: false,
        }
    }
}

impl DatasetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_chunk_size_hint(mut self, hint: usize) -> Self {
        self.chunk_size_hint = hint;
        self
    }

    pub fn with_fill_mode(mut self, mode: FillMode) -> Self {
        self.fill_mode = mode;
        self
    }

    pub fn with_format(mut self, format: FormatVariant) -> Self {
        self.format = format;
        self
    }

    pub fn with_write(mut self, write: bool) -> Self {
        self.write = write;
        self
    }

    pub fn with_no_clobber(mut self, no_clobber: bool) -> Self {
        self.no_clobber = no_clobber;
        self
    }

    pub fn with_persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    /// Parse options from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Overlay `CDF_CHUNK_SIZE`, `CDF_FILL` and `CDF_BACKEND` from the
    /// environment.
    pub fn from_env(self) -> Result<Self> {
        self.apply_vars(|key| env::var(key).ok())
    }

    fn apply_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(value) = var("CDF_CHUNK_SIZE") {
            self.chunk_size_hint = value
                .trim()
                .parse()
                .map_err(|_| CdfError::Configuration(format!("CDF_CHUNK_SIZE={}", value)))?;
        }
        if let Some(value) = var("CDF_FILL") {
            self.fill_mode = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "fill" | "on" => FillMode::Fill,
                "0" | "false" | "nofill" | "off" => FillMode::NoFill,
                _ => return Err(CdfError::Configuration(format!("CDF_FILL={}", value))),
            };
        }
        if let Some(value) = var("CDF_BACKEND") {
            self.backend = BackendKind::from_name(value.trim())
                .ok_or_else(|| CdfError::Configuration(format!("CDF_BACKEND={}", value)))?;
        }
        Ok(self)
    }

    pub(crate) fn to_io_options(&self, writable: bool) -> IoOptions {
        IoOptions {
            kind: self.backend,
            chunk_size_hint: self.chunk_size_hint,
            writable,
            no_clobber: self.no_clobber,
            persist: self.persist,
        }
    }
}

/// Alignment of the start of a variable section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Alignment {
    /// The session's effective chunk size
    #[default]
    Chunk,
    /// A fixed number of bytes; 0 and 1 both mean unaligned
    Bytes(u64),
}

impl Alignment {
    pub(crate) fn resolve(self, chunk: usize) -> u64 {
        match self {
            Alignment::Chunk => chunk as u64,
            Alignment::Bytes(n) => n.max(1),
        }
    }
}

/// Layout hints applied when definitions are committed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitHints {
    /// Free space reserved after the header
    pub header_pad: u64,
    /// Alignment of the first non-record variable
    pub variable_align: Alignment,
    /// Free space reserved after the non-record variables
    pub variable_pad: u64,
    /// Alignment of the first record variable
    pub record_align: Alignment,
}

impl CommitHints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header_pad(mut self, pad: u64) -> Self {
        self.header_pad = pad;
        self
    }

    pub fn with_variable_align(mut self, align: Alignment) -> Self {
        self.variable_align = align;
        self
    }

    pub fn with_variable_pad(mut self, pad: u64) -> Self {
        self.variable_pad = pad;
        self
    }

    pub fn with_record_align(mut self, align: Alignment) -> Self {
        self.record_align = align;
        self
    }

    /// Pack everything with no alignment or reserve
    pub fn packed() -> Self {
        Self {
            header_pad: 0,
            variable_align: Alignment::Bytes(4),
            variable_pad: 0,
            record_align: Alignment::Bytes(4),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let options = DatasetOptions::default();
        assert_eq!(options.backend, BackendKind::PlainFile);
        assert_eq!(options.chunk_size_hint, DEFAULT_CHUNK_SIZE);
        assert_eq!(options.fill_mode, FillMode::Fill);
        assert!(!options.write);
        assert_eq!(CommitHints::default().variable_align, Alignment::Chunk);
    }

    #[test]
    fn test_from_json_partial() {
        let options =
            DatasetOptions::from_json(r#"{"backend":"InMemory","fill_mode":"NoFill"}"#).unwrap();
        assert_eq!(options.backend, BackendKind::InMemory);
        assert_eq!(options.fill_mode, FillMode::NoFill);
        assert_eq!(options.chunk_size_hint, DEFAULT_CHUNK_SIZE);

        assert!(matches!(
            DatasetOptions::from_json("{not json"),
            Err(CdfError::Serialization(_))
        ));
    }

    #[test]
    fn test_env_overlay() {
        let vars: HashMap<&str, &str> = [
            ("CDF_CHUNK_SIZE", "8192"),
            ("CDF_FILL", "off"),
            ("CDF_BACKEND", "mmap"),
        ]
        .into_iter()
        .collect();
        let options = DatasetOptions::new()
            .apply_vars(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(options.chunk_size_hint, 8192);
        assert_eq!(options.fill_mode, FillMode::NoFill);
        assert_eq!(options.backend, BackendKind::MemoryMapped);

        let bad = DatasetOptions::new().apply_vars(|key| {
            (key == "CDF_CHUNK_SIZE").then(|| "lots".to_string())
        });
        assert!(matches!(bad, Err(CdfError::Configuration(_))));
    }

    #[test]
    fn test_alignment_resolve() {
        assert_eq!(Alignment::Chunk.resolve(4096), 4096);
        assert_eq!(Alignment::Bytes(0).resolve(4096), 1);
        assert_eq!(Alignment::Bytes(512).resolve(4096), 512);
    }
}
