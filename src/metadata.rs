//! Descriptive views of a dataset, serializable as JSON

use crate::catalog::{Attribute, Catalog, Dimension, Variable};
use crate::types::{ElementType, FormatVariant, UNLIMITED};
use serde::{Deserialize, Serialize};

/// Whether a session is accepting definitions or data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionMode {
    Define,
    Data,
}

/// Dataset-wide counts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetInfo {
    pub format: FormatVariant,
    pub mode: SessionMode,
    pub num_dimensions: usize,
    pub num_variables: usize,
    pub num_global_attributes: usize,
    /// Id of the record dimension
    pub unlimited_dimension: Option<usize>,
    pub record_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionInfo {
    pub name: String,
    /// Current length; the record count for the record dimension
    pub len: usize,
    pub unlimited: bool,
}

impl DimensionInfo {
    pub(crate) fn new(dim: &Dimension, numrecs: usize) -> Self {
        Self {
            name: dim.name().to_string(),
            len: if dim.is_unlimited() { numrecs } else { dim.len() },
            unlimited: dim.is_unlimited(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeInfo {
    pub name: String,
    pub element_type: ElementType,
    pub len: usize,
}

impl From<&Attribute> for AttributeInfo {
    fn from(attr: &Attribute) -> Self {
        Self {
            name: attr.name().to_string(),
            element_type: attr.element_type(),
            len: attr.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableInfo {
    pub name: String,
    pub element_type: ElementType,
    pub dimension_ids: Vec<usize>,
    /// Current shape, with the record count in place of the record dimension
    pub shape: Vec<usize>,
    pub record: bool,
    pub attributes: Vec<AttributeInfo>,
}

impl VariableInfo {
    pub(crate) fn new(var: &Variable, numrecs: usize) -> Self {
        Self {
            name: var.name().to_string(),
            element_type: var.element_type(),
            dimension_ids: var.dimension_ids().to_vec(),
            shape: var
                .shape()
                .iter()
                .map(|&len| if len == UNLIMITED { numrecs } else { len })
                .collect(),
            record: var.is_record(),
            attributes: var.attributes().iter().map(AttributeInfo::from).collect(),
        }
    }
}

/// Complete structural description of a dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogSummary {
    pub dataset: DatasetInfo,
    pub dimensions: Vec<DimensionInfo>,
    pub global_attributes: Vec<AttributeInfo>,
    pub variables: Vec<VariableInfo>,
}

impl CatalogSummary {
    pub(crate) fn new(catalog: &Catalog, dataset: DatasetInfo) -> Self {
        let numrecs = dataset.record_count;
        Self {
            dimensions: catalog
                .dimensions()
                .iter()
                .map(|d| DimensionInfo::new(d, numrecs))
                .collect(),
            global_attributes: catalog
                .global_attributes()
                .iter()
                .map(AttributeInfo::from)
                .collect(),
            variables: catalog
                .variables()
                .iter()
                .map(|v| VariableInfo::new(v, numrecs))
                .collect(),
            dataset,
        }
    }
}
