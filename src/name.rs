//! Counted name cells and the naming rules of the classic format

use crate::error::{CdfError, Result};
use crate::types::MAX_NAME_LEN;
use crate::utils::pad4;
use std::fmt;

/// Counted, immutable-length name buffer owned by a catalog entry.
///
/// Outside define mode a cell can only be rewritten with a name that is not
/// longer than the current one, so the encoded header never grows.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StringCell {
    text: Box<str>,
}

impl StringCell {
    /// Build a cell from a name that follows the naming rules.
    pub fn new(name: &str) -> Result<Self> {
        validate_name(name)?;
        Ok(Self { text: name.into() })
    }

    /// Build a cell from bytes read out of a header. Only UTF-8 is checked,
    /// files written by other producers are accepted as they are.
    pub(crate) fn from_header_bytes(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| CdfError::MalformedCatalog("name is not valid UTF-8".to_string()))?;
        Ok(Self { text: text.into() })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Bytes this cell occupies in a header: count plus padded text.
    pub fn encoded_len(&self) -> usize {
        4 + pad4(self.text.len())
    }

    /// Rewrite in place with a name no longer than the current one.
    pub fn overwrite_shorter(&mut self, name: &str) -> Result<()> {
        validate_name(name)?;
        if name.len() > self.text.len() {
            return Err(CdfError::OperationNotAllowedInDataMode(format!(
                "renaming {:?} to the longer {:?} requires define mode",
                self.text, name
            )));
        }
        self.text = name.into();
        Ok(())
    }
}

impl fmt::Display for StringCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Check a dimension, variable or attribute name.
///
/// A name is 1 to [`MAX_NAME_LEN`] bytes, starts with an ASCII letter, a
/// digit, `_` or a multi-byte character, contains no `/` or control
/// characters and has no trailing whitespace.
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = || CdfError::InvalidName(name.to_string());

    let first = name.chars().next().ok_or_else(invalid)?;
    if name.len() > MAX_NAME_LEN {
        return Err(invalid());
    }
    if !(first.is_ascii_alphanumeric() || first == '_' || !first.is_ascii()) {
        return Err(invalid());
    }
    if name.chars().any(|c| c == '/' || c.is_ascii_control()) {
        return Err(invalid());
    }
    if name.ends_with(|c: char| c.is_ascii_whitespace()) {
        return Err(invalid());
    }
    Ok(())
}
