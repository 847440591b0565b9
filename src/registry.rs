//! Table of open sessions addressed by id

use crate::config::DatasetOptions;
use crate::dataset::Dataset;
use crate::error::{CdfError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use tracing::debug;

/// Handle of a dataset held by a [`Registry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatasetId(usize);

impl DatasetId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Owns open datasets so callers can refer to them by id. Ids are never
/// reused within one registry.
#[derive(Default)]
pub struct Registry {
    sessions: HashMap<DatasetId, Dataset>,
    next_id: usize,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Take ownership of an already open dataset.
    pub fn insert(&mut self, dataset: Dataset) -> DatasetId {
        let id = DatasetId(self.next_id);
        self.next_id += 1;
        self.sessions.insert(id, dataset);
        debug!(%id, open = self.sessions.len(), "registered dataset");
        id
    }

    pub fn create(&mut self, path: impl AsRef<Path>, options: &DatasetOptions) -> Result<DatasetId> {
        let dataset = Dataset::create(path, options)?;
        Ok(self.insert(dataset))
    }

    pub fn open(&mut self, path: impl AsRef<Path>, options: &DatasetOptions) -> Result<DatasetId> {
        let dataset = Dataset::open(path, options)?;
        Ok(self.insert(dataset))
    }

    pub fn get(&self, id: DatasetId) -> Result<&Dataset> {
        self.sessions.get(&id).ok_or(CdfError::UnknownDataset(id.0))
    }

    pub fn get_mut(&mut self, id: DatasetId) -> Result<&mut Dataset> {
        self.sessions.get_mut(&id).ok_or(CdfError::UnknownDataset(id.0))
    }

    /// Remove the dataset without closing it.
    pub fn take(&mut self, id: DatasetId) -> Result<Dataset> {
        self.sessions.remove(&id).ok_or(CdfError::UnknownDataset(id.0))
    }

    pub fn close(&mut self, id: DatasetId) -> Result<()> {
        self.take(id)?.close()
    }

    pub fn abort(&mut self, id: DatasetId) -> Result<()> {
        self.take(id)?.abort()
    }

    /// Close every dataset, returning the first failure.
    pub fn close_all(&mut self) -> Result<()> {
        let mut ids: Vec<DatasetId> = self.sessions.keys().copied().collect();
        ids.sort();
        let mut first = Ok(());
        for id in ids {
            let result = self.close(id);
            if first.is_ok() {
                first = result;
            }
        }
        first
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::BackendKind;
    use tempfile::TempDir;

    #[test]
    fn test_ids_are_not_reused() {
        let temp_dir = TempDir::new().unwrap();
        let options = DatasetOptions::new().with_backend(BackendKind::PlainFile);
        let mut registry = Registry::new();

        let a = registry.create(temp_dir.path().join("a.nc"), &options).unwrap();
        let b = registry.create(temp_dir.path().join("b.nc"), &options).unwrap();
        assert_ne!(a, b);
        registry.close(a).unwrap();
        assert!(matches!(registry.get(a), Err(CdfError::UnknownDataset(_))));
        assert!(matches!(registry.close(a), Err(CdfError::UnknownDataset(_))));

        let c = registry
            .open(temp_dir.path().join("a.nc"), &options)
            .unwrap();
        assert!(c.index() > b.index());
        assert_eq!(registry.len(), 2);
        registry.close_all().unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_abort_new_dataset_removes_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("scratch.nc");
        let mut registry = Registry::new();
        let id = registry.create(&path, &DatasetOptions::default()).unwrap();
        registry
            .get_mut(id)
            .unwrap()
            .define_dimension("x", 4)
            .unwrap();
        registry.abort(id).unwrap();
        assert!(!path.exists());
    }
}
