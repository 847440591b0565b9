//! Core data types shared by the catalog, the header codec and the session

use serde::{Deserialize, Serialize};
use std::fmt;

/// Length given to [`crate::Dataset::define_dimension`] for the record dimension.
pub const UNLIMITED: usize = usize::MAX;

/// Largest number of dimensions a single variable may reference.
pub const MAX_VAR_DIMS: usize = 1024;

/// Longest name, in bytes, accepted for dimensions, variables and attributes.
pub const MAX_NAME_LEN: usize = 256;

/// Attribute that overrides a variable's default fill value
pub const FILL_VALUE_ATTR: &str = "_FillValue";

/// External element types of the classic format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum ElementType {
    /// Signed 8-bit integer
    Byte = 1,
    /// 8-bit character
    Char = 2,
    /// Signed 16-bit integer
    Short = 3,
    /// Signed 32-bit integer
    Int = 4,
    /// 32-bit IEEE float
    Float = 5,
    /// 64-bit IEEE float
    Double = 6,
}

impl ElementType {
    /// Get the type from its on-disk tag
    pub fn from_tag(tag: i32) -> Option<Self> {
        match tag {
            1 => Some(ElementType::Byte),
            2 => Some(ElementType::Char),
            3 => Some(ElementType::Short),
            4 => Some(ElementType::Int),
            5 => Some(ElementType::Float),
            6 => Some(ElementType::Double),
            _ => None,
        }
    }

    /// On-disk tag
    pub fn tag(&self) -> i32 {
        *self as i32
    }

    /// Size in bytes of one element in the external representation
    pub fn size_in_bytes(&self) -> usize {
        match self {
            ElementType::Byte | ElementType::Char => 1,
            ElementType::Short => 2,
            ElementType::Int | ElementType::Float => 4,
            ElementType::Double => 8,
        }
    }

    /// Default fill value, big-endian, one element long.
    pub fn default_fill(&self) -> Vec<u8> {
        match self {
            ElementType::Byte => (-127i8).to_be_bytes().to_vec(),
            ElementType::Char => vec![0],
            ElementType::Short => (-32767i16).to_be_bytes().to_vec(),
            ElementType::Int => (-2147483647i32).to_be_bytes().to_vec(),
            ElementType::Float => 9.969_209_968_386_869e36_f32.to_be_bytes().to_vec(),
            ElementType::Double => 9.969_209_968_386_869e36_f64.to_be_bytes().to_vec(),
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElementType::Byte => "byte",
            ElementType::Char => "char",
            ElementType::Short => "short",
            ElementType::Int => "int",
            ElementType::Float => "float",
            ElementType::Double => "double",
        };
        f.write_str(name)
    }
}

/// On-disk size variant, selected by the fourth magic byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FormatVariant {
    /// 4-byte variable offsets
    #[default]
    Classic,
    /// 8-byte variable offsets
    LargeOffset,
}

impl FormatVariant {
    pub fn from_version_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(FormatVariant::Classic),
            2 => Some(FormatVariant::LargeOffset),
            _ => None,
        }
    }

    pub fn version_byte(&self) -> u8 {
        match self {
            FormatVariant::Classic => 1,
            FormatVariant::LargeOffset => 2,
        }
    }

    /// Width of a variable's `begin` field
    pub fn offset_width(&self) -> usize {
        match self {
            FormatVariant::Classic => 4,
            FormatVariant::LargeOffset => 8,
        }
    }

    /// Largest byte length a single variable may declare before it must be
    /// stored open-ended.
    pub fn max_variable_len(&self) -> u64 {
        match self {
            FormatVariant::Classic => i32::MAX as u64 - 3,
            FormatVariant::LargeOffset => u32::MAX as u64 - 3,
        }
    }

    /// Largest fixed dimension length.
    pub fn max_dimension_len(&self) -> u64 {
        self.max_variable_len()
    }

    /// Largest value a `begin` field can carry.
    pub fn max_offset(&self) -> u64 {
        match self {
            FormatVariant::Classic => i32::MAX as u64,
            FormatVariant::LargeOffset => i64::MAX as u64,
        }
    }
}

/// Whether newly allocated variable storage is pre-written with fill values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FillMode {
    #[default]
    Fill,
    NoFill,
}

/// Owner of an attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttrOwner {
    Global,
    Variable(usize),
}

impl fmt::Display for AttrOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrOwner::Global => f.write_str("global"),
            AttrOwner::Variable(id) => write!(f, "variable {}", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_sizes() {
        let sizes: Vec<usize> = (1..=6)
            .map(|tag| ElementType::from_tag(tag).unwrap().size_in_bytes())
            .collect();
        assert_eq!(sizes, vec![1, 1, 2, 4, 4, 8]);
        assert_eq!(ElementType::from_tag(7), None);
        assert_eq!(ElementType::from_tag(0), None);
    }

    #[test]
    fn test_default_fill_width() {
        for tag in 1..=6 {
            let ty = ElementType::from_tag(tag).unwrap();
            assert_eq!(ty.default_fill().len(), ty.size_in_bytes());
        }
        assert_eq!(ElementType::Short.default_fill(), vec![0x80, 0x01]);
    }

    #[test]
    fn test_format_variants() {
        assert_eq!(FormatVariant::from_version_byte(1), Some(FormatVariant::Classic));
        assert_eq!(FormatVariant::from_version_byte(2), Some(FormatVariant::LargeOffset));
        assert_eq!(FormatVariant::from_version_byte(5), None);
        assert_eq!(FormatVariant::Classic.offset_width(), 4);
        assert_eq!(FormatVariant::LargeOffset.offset_width(), 8);
        assert_eq!(FormatVariant::Classic.max_variable_len(), (1u64 << 31) - 4);
        assert_eq!(FormatVariant::LargeOffset.max_variable_len(), (1u64 << 32) - 4);
    }
}
