//! Variable shapes and file layout
//!
//! Derives each variable's shape, per-dimension element strides and byte
//! length from the dimensions it uses, then assigns file offsets. Non-record
//! variables are packed, in definition order, from `begin_var`; the record
//! variables of one record are packed from `begin_rec + r * recsize`.

use crate::catalog::{check_dimension_ids, Catalog, DimensionArray, Variable};
use crate::config::CommitHints;
use crate::error::{CdfError, Result};
use crate::types::{FormatVariant, UNLIMITED};
use crate::utils::round_up;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Offsets shared by all variables of a committed catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Layout {
    /// Encoded header length
    pub header_size: u64,
    /// Offset of the first non-record variable
    pub begin_var: u64,
    /// Offset of the first record
    pub begin_rec: u64,
    /// Distance between consecutive records
    pub recsize: u64,
}

/// One contiguous byte range to move during relocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Move {
    pub from: u64,
    pub to: u64,
    pub len: u64,
}

fn too_large(var: &Variable) -> CdfError {
    CdfError::VariableTooLarge(var.name().to_string())
}

/// Fill in shape, strides and byte length of `var`.
pub(crate) fn resolve_shape(var: &mut Variable, dims: &DimensionArray) -> Result<()> {
    check_dimension_ids(dims, var.name(), var.dimension_ids())?;
    let shape: Vec<usize> = var
        .dimension_ids()
        .iter()
        .filter_map(|&id| dims.get(id).map(|d| d.len()))
        .collect();
    let record = shape.first() == Some(&UNLIMITED);

    let mut dsizes = vec![0u64; shape.len()];
    let mut product: u64 = 1;
    for i in (0..shape.len()).rev() {
        if !(i == 0 && record) {
            product = product
                .checked_mul(shape[i] as u64)
                .ok_or_else(|| too_large(var))?;
        }
        dsizes[i] = product;
    }
    let bytes = product
        .checked_mul(var.element_size() as u64)
        .ok_or_else(|| too_large(var))?;

    var.shape = shape;
    var.dsizes = dsizes;
    var.record = record;
    var.len = round_up(bytes, 4);
    Ok(())
}

/// Resolve every variable and check the per-variable size limit. Only the
/// last non-record variable may exceed it.
pub(crate) fn resolve_shapes(catalog: &mut Catalog, format: FormatVariant) -> Result<()> {
    let dims = &catalog.dims;
    for var in catalog.vars.iter_mut() {
        resolve_shape(var, dims)?;
    }

    let last_fixed = catalog.vars.iter().rposition(|v| !v.is_record());
    let limit = format.max_variable_len();
    for (id, var) in catalog.vars.iter().enumerate() {
        if var.byte_len() > limit && Some(id) != last_fixed {
            return Err(too_large(var));
        }
    }
    Ok(())
}

/// Bytes of real data in a variable, or in one record of it
pub(crate) fn data_len(var: &Variable) -> u64 {
    var.element_count() * var.element_size() as u64
}

impl Layout {
    /// Resolve shapes and assign fresh offsets to every variable.
    ///
    /// The result depends only on the catalog and the hints, so committing
    /// the same catalog twice yields the same layout.
    pub fn compute(
        catalog: &mut Catalog,
        format: FormatVariant,
        hints: &CommitHints,
        chunk: usize,
    ) -> Result<Self> {
        resolve_shapes(catalog, format)?;
        let header_size = catalog.header_len(format);
        if catalog.vars.is_empty() {
            return Ok(Self {
                header_size,
                begin_var: header_size,
                begin_rec: header_size,
                recsize: 0,
            });
        }

        let v_align = hints.variable_align.resolve(chunk);
        let r_align = hints.record_align.resolve(chunk);
        let max_offset = format.max_offset();

        let mut begin_var = round_up(header_size, v_align);
        if begin_var < header_size + hints.header_pad {
            begin_var = round_up(header_size + hints.header_pad, v_align);
        }

        let mut index = begin_var;
        for var in catalog.vars.iter_mut().filter(|v| !v.is_record()) {
            if index > max_offset {
                return Err(too_large(var));
            }
            var.begin = index;
            index = index.checked_add(var.byte_len()).ok_or_else(|| too_large(var))?;
        }

        let mut begin_rec = round_up(index, r_align);
        if begin_rec < index + hints.variable_pad {
            begin_rec = round_up(index + hints.variable_pad, r_align);
        }

        let mut index = begin_rec;
        let mut recsize: u64 = 0;
        let mut records = 0usize;
        let mut last_record_len = 0;
        for var in catalog.vars.iter_mut().filter(|v| v.is_record()) {
            if index > max_offset {
                return Err(too_large(var));
            }
            var.begin = index;
            index += var.byte_len();
            recsize += var.byte_len();
            records += 1;
            last_record_len = data_len(var);
        }
        // A lone record variable is stored without inter-record padding.
        if records == 1 {
            recsize = last_record_len;
        }

        let layout = Self {
            header_size,
            begin_var,
            begin_rec,
            recsize,
        };
        debug!(?layout, variables = catalog.vars.len(), "computed layout");
        Ok(layout)
    }

    /// Derive the layout of a catalog read from a file, whose variables
    /// already carry their stored offsets.
    pub fn from_committed(catalog: &mut Catalog, format: FormatVariant, header_size: u64) -> Result<Self> {
        resolve_shapes(catalog, format)?;
        let corrupt = |what: String| CdfError::TruncatedOrCorrupt(what);

        let mut begin_var = None;
        let mut begin_rec = None;
        let mut fixed_end = header_size;
        let mut last_fixed = header_size;
        let mut last_record = 0;
        let mut recsize: u64 = 0;
        let mut records = 0usize;
        let mut last_record_len = 0;

        for var in catalog.vars.iter() {
            if var.begin() < header_size {
                return Err(corrupt(format!(
                    "variable {} starts at {} inside the {} byte header",
                    var.name(),
                    var.begin(),
                    header_size
                )));
            }
            if var.is_record() {
                if var.begin() < last_record {
                    return Err(corrupt(format!("record variable {} out of order", var.name())));
                }
                begin_rec.get_or_insert(var.begin());
                last_record = var.begin();
                recsize += var.byte_len();
                records += 1;
                last_record_len = data_len(var);
            } else {
                if var.begin() < last_fixed {
                    return Err(corrupt(format!("variable {} out of order", var.name())));
                }
                begin_var.get_or_insert(var.begin());
                last_fixed = var.begin();
                fixed_end = var.begin().saturating_add(var.byte_len());
            }
        }
        if records == 1 {
            recsize = last_record_len;
        }

        let begin_var = begin_var.or(begin_rec).unwrap_or(header_size);
        let begin_rec = begin_rec.unwrap_or(fixed_end);
        if begin_rec < last_fixed {
            return Err(corrupt(format!(
                "records start at {} before non-record data at {}",
                begin_rec, last_fixed
            )));
        }
        Ok(Self {
            header_size,
            begin_var,
            begin_rec,
            recsize,
        })
    }

    /// Byte offset of the element at `coord`. `coord` must be in range.
    pub fn offset_of(&self, var: &Variable, coord: &[usize]) -> u64 {
        let rank = var.rank();
        debug_assert_eq!(coord.len(), rank);
        let skip = usize::from(var.is_record());
        let mut index: u64 = 0;
        for i in skip..rank {
            let step = if i + 1 < rank { var.dsizes[i + 1] } else { 1 };
            index += coord[i] as u64 * step;
        }
        let mut offset = var.begin() + index * var.element_size() as u64;
        if var.is_record() {
            offset += coord[0] as u64 * self.recsize;
        }
        offset
    }

    /// Offset of record `record` of a record variable
    pub fn record_offset(&self, var: &Variable, record: usize) -> u64 {
        var.begin() + record as u64 * self.recsize
    }

    /// Length the file must have to hold all data with `numrecs` records.
    pub fn file_size(&self, catalog: &Catalog, numrecs: usize) -> u64 {
        if catalog.vars.is_empty() {
            return self.header_size;
        }
        let last_fixed = catalog.vars.iter().filter(|v| !v.is_record()).last();
        match last_fixed {
            Some(var) if numrecs == 0 => var.begin() + var.byte_len(),
            _ => self.begin_rec + numrecs as u64 * self.recsize,
        }
    }
}

/// Moves that carry existing data from `old` offsets to `new` offsets.
///
/// Variables are matched by id; only ids present in both catalogs move.
/// Blocks that stay in place are left out. The result is sorted by source.
pub(crate) fn relocation_plan(
    old: &Catalog,
    old_layout: &Layout,
    new: &Catalog,
    new_layout: &Layout,
    numrecs: usize,
) -> Vec<Move> {
    let mut moves = Vec::new();
    for (before, after) in old.vars.iter().zip(new.vars.iter()) {
        let len = data_len(before);
        if len == 0 {
            continue;
        }
        if before.is_record() {
            for r in 0..numrecs {
                let from = old_layout.record_offset(before, r);
                let to = new_layout.record_offset(after, r);
                if from != to {
                    moves.push(Move { from, to, len });
                }
            }
        } else if before.begin() != after.begin() {
            moves.push(Move {
                from: before.begin(),
                to: after.begin(),
                len,
            });
        }
    }
    moves.sort_by_key(|m| m.from);
    moves
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Dimension;
    use crate::name::StringCell;
    use crate::types::ElementType;

    fn cell(name: &str) -> StringCell {
        StringCell::new(name).unwrap()
    }

    fn catalog(dims: &[(&str, usize)], vars: &[(&str, ElementType, Vec<usize>)]) -> Catalog {
        let mut catalog = Catalog::new();
        for (name, len) in dims {
            catalog.dims.push(Dimension::new(cell(name), *len)).unwrap();
        }
        for (name, ty, dimids) in vars {
            catalog
                .vars
                .push(Variable::new(cell(name), *ty, dimids.clone()))
                .unwrap();
        }
        catalog
    }

    #[test]
    fn test_shape_and_strides() {
        let mut c = catalog(
            &[("time", UNLIMITED), ("y", 3), ("x", 5)],
            &[
                ("grid", ElementType::Short, vec![1, 2]),
                ("series", ElementType::Double, vec![0, 1, 2]),
                ("scalar", ElementType::Byte, vec![]),
            ],
        );
        resolve_shapes(&mut c, FormatVariant::Classic).unwrap();

        let grid = c.vars.get(0).unwrap();
        assert_eq!(grid.shape(), &[3, 5]);
        assert_eq!(grid.dsizes, vec![15, 5]);
        assert!(!grid.is_record());
        assert_eq!(grid.byte_len(), 32); // 30 rounded to 4

        let series = c.vars.get(1).unwrap();
        assert_eq!(series.shape(), &[UNLIMITED, 3, 5]);
        assert_eq!(series.dsizes, vec![15, 15, 5]);
        assert!(series.is_record());
        assert_eq!(series.byte_len(), 120);

        let scalar = c.vars.get(2).unwrap();
        assert_eq!(scalar.element_count(), 1);
        assert_eq!(scalar.byte_len(), 4);
    }

    #[test]
    fn test_packed_begins() {
        let mut c = catalog(
            &[("x", 3), ("time", UNLIMITED)],
            &[
                ("a", ElementType::Int, vec![0]),
                ("b", ElementType::Byte, vec![0]),
                ("r1", ElementType::Float, vec![1, 0]),
                ("r2", ElementType::Short, vec![1]),
            ],
        );
        let layout = Layout::compute(&mut c, FormatVariant::Classic, &CommitHints::packed(), 4096).unwrap();
        let header = c.header_len(FormatVariant::Classic);
        assert_eq!(layout.header_size, header);
        assert_eq!(layout.begin_var, header);
        assert_eq!(c.vars.get(0).unwrap().begin(), header);
        assert_eq!(c.vars.get(1).unwrap().begin(), header + 12);
        assert_eq!(layout.begin_rec, header + 16);
        assert_eq!(c.vars.get(2).unwrap().begin(), header + 16);
        assert_eq!(c.vars.get(3).unwrap().begin(), header + 28);
        // Two record variables: padded lengths summed.
        assert_eq!(layout.recsize, 12 + 4);
    }

    #[test]
    fn test_single_record_variable_recsize() {
        let mut c = catalog(
            &[("time", UNLIMITED), ("x", 3)],
            &[("r", ElementType::Short, vec![0, 1])],
        );
        let layout = Layout::compute(&mut c, FormatVariant::Classic, &CommitHints::packed(), 4096).unwrap();
        // Unpadded 3 * 2 bytes rather than the padded 8.
        assert_eq!(c.vars.get(0).unwrap().byte_len(), 8);
        assert_eq!(layout.recsize, 6);

        c.vars
            .push(Variable::new(cell("s"), ElementType::Short, vec![0, 1]))
            .unwrap();
        let layout = Layout::compute(&mut c, FormatVariant::Classic, &CommitHints::packed(), 4096).unwrap();
        assert_eq!(layout.recsize, 16);
    }

    #[test]
    fn test_alignment_and_reserve() {
        let mut c = catalog(&[("x", 10)], &[("v", ElementType::Double, vec![0])]);
        let hints = CommitHints::default().with_header_pad(5000);
        let layout = Layout::compute(&mut c, FormatVariant::Classic, &hints, 4096).unwrap();
        assert_eq!(layout.begin_var, 8192);
        assert_eq!(layout.begin_rec, 8192 + 4096);

        let layout = Layout::compute(&mut c, FormatVariant::Classic, &CommitHints::default(), 4096).unwrap();
        assert_eq!(layout.begin_var, 4096);
    }

    #[test]
    fn test_empty_catalog_layout() {
        let mut c = Catalog::new();
        let layout = Layout::compute(&mut c, FormatVariant::Classic, &CommitHints::default(), 4096).unwrap();
        assert_eq!(layout.begin_var, 32);
        assert_eq!(layout.begin_rec, 32);
        assert_eq!(layout.file_size(&c, 0), 32);
    }

    #[test]
    fn test_offset_of_matches_strides() {
        let mut c = catalog(
            &[("time", UNLIMITED), ("y", 2), ("x", 3)],
            &[
                ("fixed", ElementType::Int, vec![1, 2]),
                ("rec", ElementType::Float, vec![0, 1, 2]),
                ("other", ElementType::Double, vec![0]),
            ],
        );
        let layout = Layout::compute(&mut c, FormatVariant::Classic, &CommitHints::packed(), 4096).unwrap();
        let fixed = c.vars.get(0).unwrap();
        assert_eq!(layout.offset_of(fixed, &[1, 2]), fixed.begin() + 5 * 4);

        let rec = c.vars.get(1).unwrap();
        assert_eq!(layout.recsize, 24 + 8);
        for t in 0..3 {
            for y in 0..2 {
                for x in 0..3 {
                    let expected = rec.begin() + t as u64 * layout.recsize + ((y * 3 + x) as u64) * 4;
                    assert_eq!(layout.offset_of(rec, &[t, y, x]), expected);
                }
            }
        }
        let other = c.vars.get(2).unwrap();
        assert_eq!(layout.offset_of(other, &[4]), other.begin() + 4 * layout.recsize);
    }

    #[test]
    fn test_classic_overflow_boundary() {
        // 2^29 ints = 2^31 bytes, above the classic limit of 2^31 - 4.
        let big = 1usize << 29;
        let mut last_ok = catalog(
            &[("small", 4), ("big", big)],
            &[
                ("a", ElementType::Int, vec![0]),
                ("huge", ElementType::Int, vec![1]),
            ],
        );
        assert!(Layout::compute(&mut last_ok, FormatVariant::Classic, &CommitHints::packed(), 4096).is_ok());

        let mut not_last = catalog(
            &[("small", 4), ("big", big)],
            &[
                ("huge", ElementType::Int, vec![1]),
                ("a", ElementType::Int, vec![0]),
            ],
        );
        assert!(matches!(
            Layout::compute(&mut not_last, FormatVariant::Classic, &CommitHints::packed(), 4096),
            Err(CdfError::VariableTooLarge(_))
        ));
    }

    #[test]
    fn test_from_committed_rejects_overlap_with_header() {
        let mut c = catalog(&[("x", 2)], &[("v", ElementType::Int, vec![0])]);
        let layout = Layout::compute(&mut c, FormatVariant::Classic, &CommitHints::packed(), 4096).unwrap();
        let again = Layout::from_committed(&mut c, FormatVariant::Classic, layout.header_size).unwrap();
        assert_eq!(again, layout);

        c.vars.get_mut(0).unwrap().begin = 8;
        assert!(matches!(
            Layout::from_committed(&mut c, FormatVariant::Classic, layout.header_size),
            Err(CdfError::TruncatedOrCorrupt(_))
        ));
    }

    #[test]
    fn test_relocation_plan_sorted_by_source() {
        let mut old = catalog(
            &[("time", UNLIMITED), ("x", 2)],
            &[
                ("f", ElementType::Int, vec![1]),
                ("r", ElementType::Int, vec![0, 1]),
            ],
        );
        let old_layout = Layout::compute(&mut old, FormatVariant::Classic, &CommitHints::packed(), 4096).unwrap();
        let mut new = old.clone();
        new.gatts.upsert(crate::catalog::Attribute::from_text(cell("title"), "moved"));
        let new_layout = Layout::compute(&mut new, FormatVariant::Classic, &CommitHints::packed(), 4096).unwrap();
        let shift = new_layout.header_size - old_layout.header_size;

        let plan = relocation_plan(&old, &old_layout, &new, &new_layout, 3);
        assert_eq!(plan.len(), 4);
        assert!(plan.windows(2).all(|w| w[0].from < w[1].from));
        assert!(plan.iter().all(|m| m.to == m.from + shift && m.len == 8));
    }
}
