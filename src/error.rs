//! Error types for dataset operations

use thiserror::Error;

/// Main error type for dataset operations
#[derive(Error, Debug)]
pub enum CdfError {
    /// Underlying storage failure, carried unchanged from the I/O backend.
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not a dataset: {0}")]
    NotADataset(String),

    #[error("Truncated or corrupt header: {0}")]
    TruncatedOrCorrupt(String),

    #[error("Malformed catalog: {0}")]
    MalformedCatalog(String),

    #[error("Name already in use: {0}")]
    NameInUse(String),

    #[error("Invalid name: {0:?}")]
    InvalidName(String),

    #[error("Unknown dimension or variable: {0}")]
    UnknownDimensionOrVariable(String),

    #[error("Attribute not found: {0}")]
    AttributeNotFound(String),

    #[error("Variable too large: {0}")]
    VariableTooLarge(String),

    #[error("Operation not allowed in data mode: {0}")]
    OperationNotAllowedInDataMode(String),

    #[error("Operation requires define mode: {0}")]
    OperationRequiresDefineMode(String),

    #[error("Operation not allowed in define mode: {0}")]
    OperationNotAllowedInDefineMode(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// Some values did not fit the target type. The call still converted
    /// every value it could.
    #[error("{0} value(s) out of range for the target type")]
    Range(usize),

    #[error("Char values cannot be converted to or from numbers: {0}")]
    CharConversion(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Out of bounds: {0}")]
    OutOfBounds(String),

    #[error("Dataset is damaged by an earlier I/O failure and can only be closed")]
    Damaged,

    #[error("Unknown dataset id: {0}")]
    UnknownDataset(usize),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Specialized Result type for dataset operations
pub type Result<T> = std::result::Result<T, CdfError>;

impl CdfError {
    /// OS error code of an underlying I/O failure, if any.
    pub fn io_code(&self) -> Option<i32> {
        match self {
            CdfError::Io(err) => err.raw_os_error(),
            _ => None,
        }
    }

    /// True when the error came from the storage medium.
    pub fn is_io(&self) -> bool {
        matches!(self, CdfError::Io(_))
    }
}

impl From<serde_json::Error> for CdfError {
    fn from(err: serde_json::Error) -> Self {
        CdfError::Serialization(err.to_string())
    }
}
