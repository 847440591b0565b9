//! cdfcore - classic self-describing array datasets
//!
//! A pure Rust engine for the classic CDF container format: named
//! dimensions, typed n-dimensional variables and attributes, stored as a
//! big-endian header followed by fixed-size and record-oriented data.
//!
//! # Features
//!
//! - Classic (32-bit offset) and large-offset variants of the format
//! - Define/data mode sessions with safe relocation of existing data when
//!   the header grows or shrinks
//! - Fill values, unlimited record dimension, typed hyperslab access
//! - Plain file, memory-mapped and in-memory storage backends
//!
//! # Example
//!
//! ```rust,no_run
//! use cdfcore::{Dataset, DatasetOptions, ElementType, UNLIMITED};
//!
//! # fn example() -> cdfcore::Result<()> {
//! let mut ds = Dataset::create("example.nc", &DatasetOptions::default())?;
//! let time = ds.define_dimension("time", UNLIMITED)?;
//! let x = ds.define_dimension("x", 4)?;
//! let temp = ds.define_variable("temp", ElementType::Float, &[time, x])?;
//! ds.enddef()?;
//!
//! ds.put_vara(temp, &[0, 0], &[1, 4], &[1.0f32, 2.0, 3.0, 4.0])?;
//! ds.close()?;
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod codec;
pub mod config;
pub mod dataset;
pub mod error;
pub mod header;
pub mod io;
pub mod layout;
pub mod metadata;
pub mod name;
pub mod registry;
pub mod types;
pub mod utils;

// Re-exports
pub use catalog::{Attribute, Catalog, Dimension, Variable};
pub use codec::Element;
pub use config::{Alignment, CommitHints, DatasetOptions};
pub use dataset::Dataset;
pub use error::{CdfError, Result};
pub use io::{BackendKind, MemoryImage, RegionIo};
pub use layout::Layout;
pub use metadata::{AttributeInfo, CatalogSummary, DatasetInfo, DimensionInfo, SessionMode, VariableInfo};
pub use name::{validate_name, StringCell};
pub use registry::{DatasetId, Registry};
pub use types::{AttrOwner, ElementType, FillMode, FormatVariant, UNLIMITED};

/// Version of this implementation
pub const CDFCORE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Magic number at the start of every dataset
pub const CDF_MAGIC: &[u8; 3] = b"CDF";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!CDFCORE_VERSION.is_empty());
    }
}
