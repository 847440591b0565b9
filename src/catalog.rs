//! In-memory catalog: dimensions, attributes and variables
//!
//! Each array keeps its entries in definition order, which is also the order
//! they are laid out on disk. Names are unique among siblings: dimensions
//! among dimensions, variables among variables and attributes under the same
//! owner. Dimensions and variables live in separate namespaces.

use crate::codec::{self, Element};
use crate::error::{CdfError, Result};
use crate::name::StringCell;
use crate::types::{AttrOwner, ElementType, FormatVariant, FILL_VALUE_ATTR, UNLIMITED};
use crate::utils::pad4;

/// A named axis. The record dimension has length [`UNLIMITED`]; its
/// effective length is the dataset's record count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dimension {
    name: StringCell,
    len: usize,
}

impl Dimension {
    pub fn new(name: StringCell, len: usize) -> Self {
        Self { name, len }
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Declared length, [`UNLIMITED`] for the record dimension
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_unlimited(&self) -> bool {
        self.len == UNLIMITED
    }

    pub(crate) fn name_cell(&self) -> &StringCell {
        &self.name
    }

    pub(crate) fn encoded_len(&self) -> usize {
        self.name.encoded_len() + 4
    }
}

/// A typed, named value attached to a variable or to the dataset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    name: StringCell,
    ty: ElementType,
    nelems: usize,
    /// Values in external (big-endian) representation, unpadded
    value: Vec<u8>,
}

impl Attribute {
    /// Build from raw external bytes; `value.len()` must be
    /// `nelems * ty.size_in_bytes()`.
    pub(crate) fn from_raw(name: StringCell, ty: ElementType, nelems: usize, value: Vec<u8>) -> Self {
        debug_assert_eq!(value.len(), nelems * ty.size_in_bytes());
        Self {
            name,
            ty,
            nelems,
            value,
        }
    }

    /// Convert `values` to `ty`. Returns the attribute and the number of
    /// values that did not fit and were stored as the type's fill.
    pub fn from_values<T: Element>(
        name: StringCell,
        ty: ElementType,
        values: &[T],
    ) -> Result<(Self, usize)> {
        let mut value = vec![0u8; values.len() * ty.size_in_bytes()];
        let failures = codec::encode_values(ty, values, &mut value)?;
        Ok((Self::from_raw(name, ty, values.len(), value), failures))
    }

    pub fn from_text(name: StringCell, text: &str) -> Self {
        let bytes = text.as_bytes().to_vec();
        Self::from_raw(name, ElementType::Char, bytes.len(), bytes)
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn element_type(&self) -> ElementType {
        self.ty
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.nelems
    }

    pub fn is_empty(&self) -> bool {
        self.nelems == 0
    }

    /// Raw external bytes, without padding
    pub fn raw(&self) -> &[u8] {
        &self.value
    }

    /// Padded size of the value block in a header
    pub fn value_len(&self) -> usize {
        pad4(self.value.len())
    }

    /// Decode the values into `out`, which must hold `len()` elements.
    pub fn read_values<T: Element>(&self, out: &mut [T]) -> Result<usize> {
        codec::decode_values(self.ty, &self.value, out)
    }

    /// The value of a char attribute as text
    pub fn text(&self) -> Result<String> {
        if self.ty != ElementType::Char {
            return Err(CdfError::CharConversion(format!(
                "attribute {} has type {}",
                self.name, self.ty
            )));
        }
        Ok(String::from_utf8_lossy(&self.value).into_owned())
    }

    pub(crate) fn name_cell(&self) -> &StringCell {
        &self.name
    }

    pub(crate) fn name_cell_mut(&mut self) -> &mut StringCell {
        &mut self.name
    }

    pub(crate) fn encoded_len(&self) -> usize {
        self.name.encoded_len() + 4 + 4 + self.value_len()
    }
}

/// Ordered attributes of one owner
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeArray {
    items: Vec<Attribute>,
}

impl AttributeArray {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Attribute> {
        self.items.iter()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.items.iter().position(|a| a.name() == name)
    }

    pub fn get(&self, name: &str) -> Option<&Attribute> {
        self.items.iter().find(|a| a.name() == name)
    }

    pub fn by_index(&self, index: usize) -> Option<&Attribute> {
        self.items.get(index)
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut Attribute> {
        self.items.iter_mut().find(|a| a.name() == name)
    }

    /// Replace an attribute of the same name in place, or append.
    pub(crate) fn upsert(&mut self, attr: Attribute) -> usize {
        match self.position(attr.name()) {
            Some(index) => {
                self.items[index] = attr;
                index
            }
            None => {
                self.items.push(attr);
                self.items.len() - 1
            }
        }
    }

    /// Append during decoding, rejecting duplicates.
    pub(crate) fn push_unique(&mut self, attr: Attribute) -> Result<()> {
        if self.position(attr.name()).is_some() {
            return Err(CdfError::MalformedCatalog(format!(
                "duplicate attribute {}",
                attr.name()
            )));
        }
        self.items.push(attr);
        Ok(())
    }

    pub(crate) fn remove(&mut self, name: &str) -> Option<Attribute> {
        let index = self.position(name)?;
        Some(self.items.remove(index))
    }

    pub(crate) fn encoded_len(&self) -> usize {
        8 + self.items.iter().map(Attribute::encoded_len).sum::<usize>()
    }
}

/// A typed n-dimensional array bound to catalog dimensions.
///
/// `shape`, `dsizes`, `len` and `begin` are derived by the layout code and
/// recomputed whenever the catalog changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    name: StringCell,
    ty: ElementType,
    dimids: Vec<usize>,
    attrs: AttributeArray,
    pub(crate) shape: Vec<usize>,
    /// `dsizes[i]` is the element count of one step along dimension `i - 1`,
    /// i.e. the product of `shape[i..]`, leaving out the record dimension.
    pub(crate) dsizes: Vec<u64>,
    pub(crate) record: bool,
    /// Byte length of the variable, or of one record of it; may exceed what
    /// the header can express, in which case it is written open-ended.
    pub(crate) len: u64,
    pub(crate) begin: u64,
}

impl Variable {
    pub fn new(name: StringCell, ty: ElementType, dimids: Vec<usize>) -> Self {
        Self {
            name,
            ty,
            dimids,
            attrs: AttributeArray::default(),
            shape: Vec::new(),
            dsizes: Vec::new(),
            record: false,
            len: 0,
            begin: 0,
        }
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn element_type(&self) -> ElementType {
        self.ty
    }

    pub fn dimension_ids(&self) -> &[usize] {
        &self.dimids
    }

    pub fn rank(&self) -> usize {
        self.dimids.len()
    }

    pub fn attributes(&self) -> &AttributeArray {
        &self.attrs
    }

    /// Per-dimension lengths; the record dimension shows as [`UNLIMITED`]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// True when the leading dimension is the record dimension
    pub fn is_record(&self) -> bool {
        self.record
    }

    /// External element size in bytes
    pub fn element_size(&self) -> usize {
        self.ty.size_in_bytes()
    }

    /// Elements in the variable, or in one record of a record variable
    pub fn element_count(&self) -> u64 {
        self.dsizes.first().copied().unwrap_or(1)
    }

    /// Byte length (per record for record variables), padded to 4 bytes
    pub fn byte_len(&self) -> u64 {
        self.len
    }

    /// File offset of the first byte
    pub fn begin(&self) -> u64 {
        self.begin
    }

    pub(crate) fn name_cell(&self) -> &StringCell {
        &self.name
    }

    pub(crate) fn name_cell_mut(&mut self) -> &mut StringCell {
        &mut self.name
    }

    pub(crate) fn attrs_mut(&mut self) -> &mut AttributeArray {
        &mut self.attrs
    }

    pub(crate) fn set_attributes(&mut self, attrs: AttributeArray) {
        self.attrs = attrs;
    }

    /// Fill pattern for one element: a `_FillValue` attribute of the
    /// variable's own type with one element, else the type default.
    pub fn fill_value(&self) -> Vec<u8> {
        match self.attrs.get(FILL_VALUE_ATTR) {
            Some(attr) if attr.element_type() == self.ty && attr.len() == 1 => attr.raw().to_vec(),
            _ => self.ty.default_fill(),
        }
    }

    pub(crate) fn encoded_len(&self, format: FormatVariant) -> usize {
        self.name.encoded_len()
            + 4
            + 4 * self.dimids.len()
            + self.attrs.encoded_len()
            + 4
            + 4
            + format.offset_width()
    }
}

/// Ordered dimensions; at most one is unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DimensionArray {
    items: Vec<Dimension>,
}

impl DimensionArray {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Dimension> {
        self.items.iter()
    }

    pub fn get(&self, id: usize) -> Option<&Dimension> {
        self.items.get(id)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.items.iter().position(|d| d.name() == name)
    }

    /// Id of the record dimension, if one is defined
    pub fn unlimited(&self) -> Option<usize> {
        self.items.iter().position(Dimension::is_unlimited)
    }

    /// Append a dimension, enforcing unique names and a single unlimited
    /// dimension.
    pub(crate) fn push(&mut self, dim: Dimension) -> Result<usize> {
        if self.position(dim.name()).is_some() {
            return Err(CdfError::NameInUse(dim.name().to_string()));
        }
        if dim.is_unlimited() {
            if let Some(existing) = self.unlimited() {
                return Err(CdfError::MalformedCatalog(format!(
                    "dimension {} would be a second unlimited dimension after {}",
                    dim.name(),
                    self.items[existing].name()
                )));
            }
        }
        self.items.push(dim);
        Ok(self.items.len() - 1)
    }

    pub(crate) fn name_cell_mut(&mut self, id: usize) -> Option<&mut StringCell> {
        self.items.get_mut(id).map(|d| &mut d.name)
    }

    pub(crate) fn encoded_len(&self) -> usize {
        8 + self.items.iter().map(Dimension::encoded_len).sum::<usize>()
    }
}

/// Ordered variables
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariableArray {
    items: Vec<Variable>,
}

impl VariableArray {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Variable> {
        self.items.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> std::slice::IterMut<'_, Variable> {
        self.items.iter_mut()
    }

    pub fn get(&self, id: usize) -> Option<&Variable> {
        self.items.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: usize) -> Option<&mut Variable> {
        self.items.get_mut(id)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.items.iter().position(|v| v.name() == name)
    }

    pub(crate) fn push(&mut self, var: Variable) -> Result<usize> {
        if self.position(var.name()).is_some() {
            return Err(CdfError::NameInUse(var.name().to_string()));
        }
        self.items.push(var);
        Ok(self.items.len() - 1)
    }

    #[cfg(test)]
    pub(crate) fn pop(&mut self) -> Option<Variable> {
        self.items.pop()
    }

    pub(crate) fn encoded_len(&self, format: FormatVariant) -> usize {
        8 + self
            .items
            .iter()
            .map(|v| v.encoded_len(format))
            .sum::<usize>()
    }
}

/// Complete structural description of a dataset
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    pub(crate) dims: DimensionArray,
    pub(crate) gatts: AttributeArray,
    pub(crate) vars: VariableArray,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dimensions(&self) -> &DimensionArray {
        &self.dims
    }

    pub fn global_attributes(&self) -> &AttributeArray {
        &self.gatts
    }

    pub fn variables(&self) -> &VariableArray {
        &self.vars
    }

    /// Attributes of `owner`
    pub fn attributes(&self, owner: AttrOwner) -> Result<&AttributeArray> {
        match owner {
            AttrOwner::Global => Ok(&self.gatts),
            AttrOwner::Variable(id) => self
                .vars
                .get(id)
                .map(Variable::attributes)
                .ok_or_else(|| unknown_variable(id)),
        }
    }

    pub(crate) fn attributes_mut(&mut self, owner: AttrOwner) -> Result<&mut AttributeArray> {
        match owner {
            AttrOwner::Global => Ok(&mut self.gatts),
            AttrOwner::Variable(id) => self
                .vars
                .get_mut(id)
                .map(Variable::attrs_mut)
                .ok_or_else(|| unknown_variable(id)),
        }
    }

    /// Check the structural invariants: valid dimension ids, the record
    /// dimension only in leading position, unique names.
    pub fn validate(&self) -> Result<()> {
        let unlimited = self.dims.unlimited();
        for (index, dim) in self.dims.iter().enumerate() {
            if self.dims.position(dim.name()) != Some(index) {
                return Err(CdfError::MalformedCatalog(format!(
                    "duplicate dimension {}",
                    dim.name()
                )));
            }
            if dim.is_unlimited() && unlimited != Some(index) {
                return Err(CdfError::MalformedCatalog(format!(
                    "second unlimited dimension {}",
                    dim.name()
                )));
            }
        }
        for (index, var) in self.vars.iter().enumerate() {
            if self.vars.position(var.name()) != Some(index) {
                return Err(CdfError::MalformedCatalog(format!(
                    "duplicate variable {}",
                    var.name()
                )));
            }
            check_dimension_ids(&self.dims, var.name(), var.dimension_ids())?;
        }
        Ok(())
    }

    /// Encoded header size for `format`
    pub fn header_len(&self, format: FormatVariant) -> u64 {
        (4 + 4 + self.dims.encoded_len() + self.gatts.encoded_len() + self.vars.encoded_len(format))
            as u64
    }
}

/// Dimension ids of a variable must exist, and the record dimension may
/// only appear first.
pub(crate) fn check_dimension_ids(dims: &DimensionArray, var: &str, dimids: &[usize]) -> Result<()> {
    for (position, &id) in dimids.iter().enumerate() {
        let dim = dims.get(id).ok_or_else(|| {
            CdfError::MalformedCatalog(format!("variable {} refers to dimension id {}", var, id))
        })?;
        if dim.is_unlimited() && position != 0 {
            return Err(CdfError::MalformedCatalog(format!(
                "variable {} uses unlimited dimension {} in position {}",
                var,
                dim.name(),
                position
            )));
        }
    }
    Ok(())
}

pub(crate) fn unknown_variable(id: usize) -> CdfError {
    CdfError::UnknownDimensionOrVariable(format!("variable id {}", id))
}

pub(crate) fn unknown_dimension(id: usize) -> CdfError {
    CdfError::UnknownDimensionOrVariable(format!("dimension id {}", id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(name: &str) -> StringCell {
        StringCell::new(name).unwrap()
    }

    #[test]
    fn test_dimension_names_are_unique() {
        let mut dims = DimensionArray::default();
        assert_eq!(dims.push(Dimension::new(cell("x"), 10)).unwrap(), 0);
        assert!(matches!(
            dims.push(Dimension::new(cell("x"), 5)),
            Err(CdfError::NameInUse(_))
        ));
        assert_eq!(dims.len(), 1);
    }

    #[test]
    fn test_single_unlimited_dimension() {
        let mut dims = DimensionArray::default();
        dims.push(Dimension::new(cell("time"), UNLIMITED)).unwrap();
        assert!(matches!(
            dims.push(Dimension::new(cell("time2"), UNLIMITED)),
            Err(CdfError::MalformedCatalog(_))
        ));
        assert_eq!(dims.unlimited(), Some(0));
    }

    #[test]
    fn test_attribute_upsert_keeps_position() {
        let mut attrs = AttributeArray::default();
        attrs.upsert(Attribute::from_text(cell("units"), "K"));
        attrs.upsert(Attribute::from_text(cell("long_name"), "temperature"));
        let index = attrs.upsert(Attribute::from_text(cell("units"), "degC"));
        assert_eq!(index, 0);
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs.get("units").unwrap().text().unwrap(), "degC");
        // name(8) + type(4) + count(4) + "degC"(4), then name(12) + 4 + 4 + 12
        assert_eq!(attrs.encoded_len(), 8 + 20 + 20 + 12 + 4);
    }

    #[test]
    fn test_numeric_attribute_values() {
        let (attr, failures) =
            Attribute::from_values(cell("valid_range"), ElementType::Short, &[-10i32, 40_000]).unwrap();
        assert_eq!(failures, 1);
        assert_eq!(attr.len(), 2);
        assert_eq!(attr.raw().len(), 4);
        assert_eq!(attr.value_len(), 4);
        let mut out = [0f64; 2];
        attr.read_values(&mut out).unwrap();
        assert_eq!(out, [-10.0, -32767.0]);
        assert!(attr.text().is_err());
    }

    #[test]
    fn test_fill_value_override() {
        let mut var = Variable::new(cell("t"), ElementType::Int, vec![]);
        assert_eq!(var.fill_value(), ElementType::Int.default_fill());
        let (fill, _) = Attribute::from_values(cell("_FillValue"), ElementType::Int, &[7i32]).unwrap();
        var.attrs_mut().upsert(fill);
        assert_eq!(var.fill_value(), 7i32.to_be_bytes().to_vec());

        // A fill of the wrong type is ignored.
        let (fill, _) = Attribute::from_values(cell("_FillValue"), ElementType::Double, &[7.0]).unwrap();
        var.attrs_mut().upsert(fill);
        assert_eq!(var.fill_value(), ElementType::Int.default_fill());
    }

    #[test]
    fn test_validate_catches_dangling_and_misplaced_dimensions() {
        let mut catalog = Catalog::new();
        catalog.dims.push(Dimension::new(cell("x"), 3)).unwrap();
        catalog.dims.push(Dimension::new(cell("time"), UNLIMITED)).unwrap();
        catalog
            .vars
            .push(Variable::new(cell("ok"), ElementType::Float, vec![1, 0]))
            .unwrap();
        assert!(catalog.validate().is_ok());

        catalog
            .vars
            .push(Variable::new(cell("dangling"), ElementType::Float, vec![7]))
            .unwrap();
        assert!(matches!(catalog.validate(), Err(CdfError::MalformedCatalog(_))));
        catalog.vars.pop();

        catalog
            .vars
            .push(Variable::new(cell("inner"), ElementType::Float, vec![0, 1]))
            .unwrap();
        assert!(matches!(catalog.validate(), Err(CdfError::MalformedCatalog(_))));
    }

    #[test]
    fn test_header_len_empty() {
        let catalog = Catalog::new();
        assert_eq!(catalog.header_len(FormatVariant::Classic), 32);
        assert_eq!(catalog.header_len(FormatVariant::LargeOffset), 32);
    }
}
