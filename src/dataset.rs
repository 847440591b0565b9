//! Dataset sessions: the define/data mode protocol and variable I/O
//!
//! A session starts in define mode when it creates a dataset and in data
//! mode when it opens one. Structure can only change in define mode;
//! committing the definitions recomputes the layout, moves existing data to
//! its new offsets, rewrites the header and fills new variables. Values can
//! only be read and written in data mode.

use crate::catalog::{unknown_dimension, unknown_variable, Attribute, Catalog, Dimension, Variable};
use crate::codec::{decode_values, encode_values, fill_with, range_result, Element};
use crate::config::{CommitHints, DatasetOptions};
use crate::error::{CdfError, Result};
use crate::header::{patch_numrecs, read_header, write_header, DecodedHeader, STREAMING_NUMRECS};
use crate::io::{
    create_region_io, effective_chunk_size, open_region_io, MemoryImage, MemoryIo, Region, RegionIo,
};
use crate::layout::{data_len, relocation_plan, resolve_shape, Layout, Move};
use crate::metadata::{AttributeInfo, CatalogSummary, DatasetInfo, DimensionInfo, SessionMode, VariableInfo};
use crate::name::StringCell;
use crate::types::{AttrOwner, ElementType, FillMode, FormatVariant, FILL_VALUE_ATTR, MAX_VAR_DIMS, UNLIMITED};
use ndarray::{ArrayD, IxDyn};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// An open dataset
pub struct Dataset {
    path: Option<PathBuf>,
    io: Option<Box<dyn RegionIo>>,
    format: FormatVariant,
    catalog: Catalog,
    layout: Layout,
    numrecs: usize,
    mode: SessionMode,
    /// Created by this session and never committed
    creating: bool,
    writable: bool,
    fill_mode: FillMode,
    /// Catalog and layout as of `redefine`, restored on abort
    shadow: Option<(Catalog, Layout)>,
    numrecs_dirty: bool,
    damaged: bool,
}

fn handle(io: &mut Option<Box<dyn RegionIo>>) -> Result<&mut dyn RegionIo> {
    match io {
        Some(io) => Ok(io.as_mut()),
        None => Err(CdfError::Damaged),
    }
}

impl Dataset {
    /// Create a new dataset at `path` and enter define mode.
    pub fn create(path: impl AsRef<Path>, options: &DatasetOptions) -> Result<Self> {
        let path = path.as_ref();
        let io = create_region_io(path, &options.to_io_options(true), 0)?;
        debug!(path = %path.display(), backend = ?options.backend, format = ?options.format, "creating dataset");
        Ok(Self::new_session(Some(path.to_path_buf()), io, options))
    }

    /// Create a new dataset inside `image`, replacing whatever it holds once
    /// the definitions are committed.
    pub fn create_in_image(image: &MemoryImage, options: &DatasetOptions) -> Result<Self> {
        let chunk = effective_chunk_size(options.chunk_size_hint);
        let io = Box::new(MemoryIo::create_in(image.clone(), chunk));
        debug!(chunk, format = ?options.format, "creating dataset in memory image");
        Ok(Self::new_session(None, io, options))
    }

    fn new_session(path: Option<PathBuf>, io: Box<dyn RegionIo>, options: &DatasetOptions) -> Self {
        let catalog = Catalog::new();
        let format = options.format;
        let layout = Layout {
            header_size: catalog.header_len(format),
            ..Layout::default()
        };
        Self {
            path,
            io: Some(io),
            format,
            catalog,
            layout,
            numrecs: 0,
            mode: SessionMode::Define,
            creating: true,
            writable: true,
            fill_mode: options.fill_mode,
            shadow: None,
            numrecs_dirty: false,
            damaged: false,
        }
    }

    /// Open an existing dataset in data mode. It is writable when
    /// `options.write` is set.
    pub fn open(path: impl AsRef<Path>, options: &DatasetOptions) -> Result<Self> {
        let path = path.as_ref();
        let io = open_region_io(path, &options.to_io_options(options.write))?;
        let dataset = Self::load(Some(path.to_path_buf()), io, options)?;
        debug!(
            path = %path.display(),
            writable = options.write,
            numrecs = dataset.numrecs,
            variables = dataset.catalog.vars.len(),
            "opened dataset"
        );
        Ok(dataset)
    }

    /// Open the dataset held in `image`.
    pub fn open_image(image: &MemoryImage, options: &DatasetOptions) -> Result<Self> {
        let chunk = effective_chunk_size(options.chunk_size_hint);
        let io = Box::new(MemoryIo::with_image(image.clone(), options.write, chunk));
        Self::load(None, io, options)
    }

    fn load(path: Option<PathBuf>, mut io: Box<dyn RegionIo>, options: &DatasetOptions) -> Result<Self> {
        let decoded = match Self::read_committed(io.as_mut()) {
            Ok(decoded) => decoded,
            Err(e) => {
                if let Err(close_err) = io.close(false) {
                    warn!(error = %close_err, "failed to close after a bad header");
                }
                return Err(e);
            }
        };
        let (
            DecodedHeader {
                catalog,
                format,
                numrecs,
                ..
            },
            layout,
            file_size,
        ) = decoded;
        let writable = options.write && io.is_writable();

        let (numrecs, streaming) = match numrecs {
            Some(n) => (n, false),
            None => {
                let n = if layout.recsize == 0 {
                    0
                } else {
                    (file_size.saturating_sub(layout.begin_rec) / layout.recsize) as usize
                };
                debug!(numrecs = n, file_size, "derived record count from file size");
                (n, true)
            }
        };

        Ok(Self {
            path,
            io: Some(io),
            format,
            catalog,
            layout,
            numrecs,
            mode: SessionMode::Data,
            creating: false,
            writable,
            fill_mode: options.fill_mode,
            shadow: None,
            numrecs_dirty: streaming && writable,
            damaged: false,
        })
    }

    fn read_committed(io: &mut dyn RegionIo) -> Result<(DecodedHeader, Layout, u64)> {
        let mut decoded = read_header(io)?;
        let layout = Layout::from_committed(&mut decoded.catalog, decoded.format, decoded.header_size)?;
        let file_size = io.file_size()?;
        Ok((decoded, layout, file_size))
    }

    // ----- accessors -----

    /// Path of the dataset; `None` for an in-memory image
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn format(&self) -> FormatVariant {
        self.format
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// True after an I/O failure; only `close` and `abort` remain usable.
    pub fn is_damaged(&self) -> bool {
        self.damaged
    }

    pub fn fill_mode(&self) -> FillMode {
        self.fill_mode
    }

    pub fn record_count(&self) -> usize {
        self.numrecs
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Committed layout. In define mode it describes the file as it was
    /// before the pending definitions.
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Effective buffering granularity of the backend
    pub fn chunk_size(&self) -> usize {
        self.io.as_ref().map_or(0, |io| io.chunk_size())
    }

    // ----- guards -----

    fn check_usable(&self) -> Result<()> {
        if self.damaged || self.io.is_none() {
            return Err(CdfError::Damaged);
        }
        Ok(())
    }

    fn check_writable(&self, op: &str) -> Result<()> {
        if !self.writable {
            return Err(CdfError::PermissionDenied(format!("{} on a read-only dataset", op)));
        }
        Ok(())
    }

    fn require_define(&self, op: &str) -> Result<()> {
        self.check_usable()?;
        self.check_writable(op)?;
        if self.mode != SessionMode::Define {
            return Err(CdfError::OperationNotAllowedInDataMode(op.to_string()));
        }
        Ok(())
    }

    fn require_data(&self, op: &str) -> Result<()> {
        self.check_usable()?;
        if self.mode != SessionMode::Data {
            return Err(CdfError::OperationNotAllowedInDefineMode(op.to_string()));
        }
        Ok(())
    }

    /// Mark the session damaged when `result` carries an I/O failure.
    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_io() && !self.damaged {
                warn!(error = %e, "I/O failure, dataset is now damaged");
                self.damaged = true;
            }
        }
        result
    }

    fn variable(&self, varid: usize) -> Result<&Variable> {
        self.catalog.vars.get(varid).ok_or_else(|| unknown_variable(varid))
    }

    // ----- definitions -----

    /// Add a dimension; `len` is [`UNLIMITED`] for the record dimension.
    pub fn define_dimension(&mut self, name: &str, len: usize) -> Result<usize> {
        self.require_define("define_dimension")?;
        let cell = StringCell::new(name)?;
        if len != UNLIMITED && (len == 0 || len as u64 > self.format.max_dimension_len()) {
            return Err(CdfError::InvalidArgument(format!(
                "dimension {} length {} outside 1..={}",
                name,
                len,
                self.format.max_dimension_len()
            )));
        }
        let id = self.catalog.dims.push(Dimension::new(cell, len))?;
        debug!(name, len, id, "defined dimension");
        Ok(id)
    }

    /// Add a variable over existing dimensions. A record variable names the
    /// record dimension first.
    pub fn define_variable(&mut self, name: &str, ty: ElementType, dimids: &[usize]) -> Result<usize> {
        self.require_define("define_variable")?;
        let cell = StringCell::new(name)?;
        if dimids.len() > MAX_VAR_DIMS {
            return Err(CdfError::InvalidArgument(format!(
                "variable {} has {} dimensions, at most {} allowed",
                name,
                dimids.len(),
                MAX_VAR_DIMS
            )));
        }
        if let Some(&id) = dimids.iter().find(|&&id| self.catalog.dims.get(id).is_none()) {
            return Err(unknown_dimension(id));
        }
        if self.catalog.vars.position(name).is_some() {
            return Err(CdfError::NameInUse(name.to_string()));
        }
        let mut var = Variable::new(cell, ty, dimids.to_vec());
        resolve_shape(&mut var, &self.catalog.dims)?;
        let id = self.catalog.vars.push(var)?;
        debug!(name, ?ty, ?dimids, id, "defined variable");
        Ok(id)
    }

    pub fn rename_dimension(&mut self, dimid: usize, new_name: &str) -> Result<()> {
        self.check_usable()?;
        self.check_writable("rename_dimension")?;
        if self.catalog.dims.get(dimid).is_none() {
            return Err(unknown_dimension(dimid));
        }
        if self.catalog.dims.position(new_name).is_some() {
            return Err(CdfError::NameInUse(new_name.to_string()));
        }
        let define = self.mode == SessionMode::Define;
        let cell = self
            .catalog
            .dims
            .name_cell_mut(dimid)
            .ok_or_else(|| unknown_dimension(dimid))?;
        if define {
            *cell = StringCell::new(new_name)?;
            Ok(())
        } else {
            cell.overwrite_shorter(new_name)?;
            self.rewrite_header()
        }
    }

    pub fn rename_variable(&mut self, varid: usize, new_name: &str) -> Result<()> {
        self.check_usable()?;
        self.check_writable("rename_variable")?;
        self.variable(varid)?;
        if self.catalog.vars.position(new_name).is_some() {
            return Err(CdfError::NameInUse(new_name.to_string()));
        }
        let define = self.mode == SessionMode::Define;
        let var = self
            .catalog
            .vars
            .get_mut(varid)
            .ok_or_else(|| unknown_variable(varid))?;
        if define {
            *var.name_cell_mut() = StringCell::new(new_name)?;
            Ok(())
        } else {
            var.name_cell_mut().overwrite_shorter(new_name)?;
            self.rewrite_header()
        }
    }

    // ----- attributes -----

    /// Store numeric values as an attribute of type `ty`, converting each
    /// value. Values out of range for `ty` are stored as the type's fill and
    /// reported as [`CdfError::Range`] after the attribute is stored.
    pub fn put_attribute<T: Element>(
        &mut self,
        owner: AttrOwner,
        name: &str,
        ty: ElementType,
        values: &[T],
    ) -> Result<()> {
        let (attr, failures) = Attribute::from_values(StringCell::new(name)?, ty, values)?;
        self.store_attribute(owner, attr)?;
        range_result(failures)
    }

    /// Store text as a char attribute.
    pub fn put_attribute_text(&mut self, owner: AttrOwner, name: &str, text: &str) -> Result<()> {
        let attr = Attribute::from_text(StringCell::new(name)?, text);
        self.store_attribute(owner, attr)
    }

    fn store_attribute(&mut self, owner: AttrOwner, attr: Attribute) -> Result<()> {
        self.check_usable()?;
        self.check_writable("put_attribute")?;
        if let AttrOwner::Variable(varid) = owner {
            if attr.name() == FILL_VALUE_ATTR {
                let ty = self.variable(varid)?.element_type();
                if attr.element_type() != ty || attr.len() != 1 {
                    return Err(CdfError::InvalidArgument(format!(
                        "{} of variable {} must be a single {:?} value",
                        FILL_VALUE_ATTR, varid, ty
                    )));
                }
            }
        }
        let define = self.mode == SessionMode::Define;
        let attrs = self.catalog.attributes_mut(owner)?;
        if define {
            attrs.upsert(attr);
            return Ok(());
        }

        // Data mode: only a rewrite that does not grow the header.
        let existing = attrs.get_mut(attr.name()).ok_or_else(|| {
            CdfError::OperationNotAllowedInDataMode(format!("adding attribute {} to {}", attr.name(), owner))
        })?;
        if attr.value_len() > existing.value_len() {
            return Err(CdfError::OperationNotAllowedInDataMode(format!(
                "growing attribute {} of {}",
                attr.name(),
                owner
            )));
        }
        *existing = attr;
        self.rewrite_header()
    }

    fn attribute(&self, owner: AttrOwner, name: &str) -> Result<&Attribute> {
        self.check_usable()?;
        self.catalog
            .attributes(owner)?
            .get(name)
            .ok_or_else(|| CdfError::AttributeNotFound(format!("{} of {}", name, owner)))
    }

    /// Numeric attribute values converted to `T`
    pub fn get_attribute<T: Element>(&self, owner: AttrOwner, name: &str) -> Result<Vec<T>> {
        let attr = self.attribute(owner, name)?;
        let mut out = vec![T::default(); attr.len()];
        let failures = attr.read_values(&mut out)?;
        range_result(failures)?;
        Ok(out)
    }

    /// Convert attribute values into `out`, which must hold exactly the
    /// attribute's element count. Values that do not fit are left at
    /// `T::default()` and reported as [`CdfError::Range`].
    pub fn get_attribute_into<T: Element>(&self, owner: AttrOwner, name: &str, out: &mut [T]) -> Result<()> {
        let attr = self.attribute(owner, name)?;
        if out.len() != attr.len() {
            return Err(CdfError::InvalidArgument(format!(
                "attribute {} has {} values, buffer holds {}",
                name,
                attr.len(),
                out.len()
            )));
        }
        range_result(attr.read_values(out)?)
    }

    pub fn get_attribute_text(&self, owner: AttrOwner, name: &str) -> Result<String> {
        self.attribute(owner, name)?.text()
    }

    pub fn inquire_attribute(&self, owner: AttrOwner, name: &str) -> Result<AttributeInfo> {
        Ok(AttributeInfo::from(self.attribute(owner, name)?))
    }

    /// Name of the attribute at `index` in definition order
    pub fn attribute_name(&self, owner: AttrOwner, index: usize) -> Result<String> {
        self.check_usable()?;
        self.catalog
            .attributes(owner)?
            .by_index(index)
            .map(|a| a.name().to_string())
            .ok_or_else(|| CdfError::AttributeNotFound(format!("index {} of {}", index, owner)))
    }

    /// Remove an attribute. Define mode only.
    pub fn delete_attribute(&mut self, owner: AttrOwner, name: &str) -> Result<()> {
        self.require_define("delete_attribute")?;
        self.catalog
            .attributes_mut(owner)?
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| CdfError::AttributeNotFound(format!("{} of {}", name, owner)))
    }

    pub fn rename_attribute(&mut self, owner: AttrOwner, name: &str, new_name: &str) -> Result<()> {
        self.check_usable()?;
        self.check_writable("rename_attribute")?;
        let define = self.mode == SessionMode::Define;
        let attrs = self.catalog.attributes_mut(owner)?;
        if attrs.get(new_name).is_some() {
            return Err(CdfError::NameInUse(new_name.to_string()));
        }
        let attr = attrs
            .get_mut(name)
            .ok_or_else(|| CdfError::AttributeNotFound(format!("{} of {}", name, owner)))?;
        if define {
            *attr.name_cell_mut() = StringCell::new(new_name)?;
            Ok(())
        } else {
            attr.name_cell_mut().overwrite_shorter(new_name)?;
            self.rewrite_header()
        }
    }

    /// Data-mode header patch after a rename or attribute rewrite.
    fn rewrite_header(&mut self) -> Result<()> {
        let io = handle(&mut self.io)?;
        let result = write_header(io, &self.catalog, self.format, self.numrecs);
        let len = self.track(result)?;
        self.layout.header_size = len;
        self.numrecs_dirty = false;
        Ok(())
    }

    // ----- mode transitions -----

    /// Re-enter define mode, keeping a snapshot to restore on abort.
    pub fn redefine(&mut self) -> Result<()> {
        self.check_usable()?;
        self.check_writable("redefine")?;
        if self.mode == SessionMode::Define {
            return Err(CdfError::OperationNotAllowedInDefineMode("redefine".to_string()));
        }
        self.sync()?;
        self.shadow = Some((self.catalog.clone(), self.layout));
        self.mode = SessionMode::Define;
        debug!("entered define mode");
        Ok(())
    }

    /// Commit with default hints.
    pub fn enddef(&mut self) -> Result<()> {
        self.commit_definitions(&CommitHints::default())
    }

    /// Commit pending definitions and return to data mode.
    ///
    /// Existing data is moved to the offsets of the new layout before the new
    /// header is written. In fill mode new non-record variables are filled,
    /// and new record variables are filled in every existing record.
    pub fn commit_definitions(&mut self, hints: &CommitHints) -> Result<()> {
        self.check_usable()?;
        if self.mode != SessionMode::Define {
            return Err(CdfError::OperationRequiresDefineMode("commit_definitions".to_string()));
        }
        let chunk = self.chunk_size();
        let layout = Layout::compute(&mut self.catalog, self.format, hints, chunk)?;
        let result = self.apply_commit(&layout);
        self.track(result)?;

        self.layout = layout;
        self.shadow = None;
        self.creating = false;
        self.numrecs_dirty = false;
        self.mode = SessionMode::Data;
        debug!(
            header_size = layout.header_size,
            begin_var = layout.begin_var,
            begin_rec = layout.begin_rec,
            recsize = layout.recsize,
            "committed definitions"
        );
        Ok(())
    }

    fn apply_commit(&mut self, layout: &Layout) -> Result<()> {
        let io = handle(&mut self.io)?;
        let old_vars = match &self.shadow {
            Some((old, old_layout)) => {
                let moves = relocation_plan(old, old_layout, &self.catalog, layout, self.numrecs);
                if !moves.is_empty() {
                    debug!(moves = moves.len(), "relocating variable data");
                }
                apply_moves(io, &moves)?;
                old.vars.len()
            }
            None => 0,
        };

        write_header(io, &self.catalog, self.format, self.numrecs)?;

        if self.fill_mode == FillMode::Fill {
            for var in self.catalog.vars.iter().skip(old_vars) {
                if var.is_record() {
                    for r in 0..self.numrecs {
                        fill_variable(io, var, layout.record_offset(var, r))?;
                    }
                } else {
                    fill_variable(io, var, var.begin())?;
                }
            }
        }
        io.grow_to(layout.file_size(&self.catalog, self.numrecs))?;
        io.sync()
    }

    /// Leave define mode without committing, restoring the catalog as of
    /// `redefine`. The session stays open in data mode.
    pub fn cancel_definitions(&mut self) -> Result<()> {
        self.check_usable()?;
        if self.mode != SessionMode::Define {
            return Err(CdfError::OperationRequiresDefineMode("cancel_definitions".to_string()));
        }
        let (catalog, layout) = self.shadow.take().ok_or_else(|| {
            CdfError::InvalidArgument("a new dataset has no committed definitions to return to".to_string())
        })?;
        self.catalog = catalog;
        self.layout = layout;
        self.mode = SessionMode::Data;
        Ok(())
    }

    /// Switch fill mode, returning the previous one.
    pub fn set_fill(&mut self, mode: FillMode) -> Result<FillMode> {
        self.check_usable()?;
        self.check_writable("set_fill")?;
        Ok(std::mem::replace(&mut self.fill_mode, mode))
    }

    /// Make all writes durable: patch the record count, pad the file to its
    /// computed size and flush the backend. A no-op on read-only datasets.
    pub fn sync(&mut self) -> Result<()> {
        self.check_usable()?;
        if self.mode == SessionMode::Define {
            return Err(CdfError::OperationNotAllowedInDefineMode("sync".to_string()));
        }
        if !self.writable {
            return Ok(());
        }
        let result = self.sync_inner();
        self.track(result)
    }

    fn sync_inner(&mut self) -> Result<()> {
        let size = self.layout.file_size(&self.catalog, self.numrecs);
        let io = handle(&mut self.io)?;
        if self.numrecs_dirty {
            patch_numrecs(io, self.numrecs)?;
        }
        io.grow_to(size)?;
        io.sync()?;
        self.numrecs_dirty = false;
        Ok(())
    }

    /// Close the session. Pending definitions are committed first; if that
    /// fails the session is aborted instead. The backend is always released.
    pub fn close(mut self) -> Result<()> {
        self.close_inner()
    }

    /// Discard pending definitions and close. A dataset that was never
    /// committed is deleted.
    pub fn abort(mut self) -> Result<()> {
        self.abort_inner()
    }

    fn close_inner(&mut self) -> Result<()> {
        if self.io.is_none() {
            return Ok(());
        }
        if !self.damaged {
            if self.mode == SessionMode::Define {
                if let Err(e) = self.enddef() {
                    warn!(error = %e, "implicit commit on close failed, aborting");
                    if let Err(abort_err) = self.abort_inner() {
                        warn!(error = %abort_err, "abort after failed commit also failed");
                    }
                    return Err(e);
                }
            } else if self.writable {
                if let Err(e) = self.sync() {
                    if let Err(close_err) = self.release(false) {
                        warn!(error = %close_err, "release after failed sync also failed");
                    }
                    return Err(e);
                }
            }
        }
        debug!(path = ?self.path, numrecs = self.numrecs, "closing dataset");
        self.release(false)
    }

    fn abort_inner(&mut self) -> Result<()> {
        if self.io.is_none() {
            return Ok(());
        }
        if self.creating {
            debug!(path = ?self.path, "aborting new dataset");
            return self.release(true);
        }
        let mut first = Ok(());
        if let Some((catalog, layout)) = self.shadow.take() {
            debug!("discarding pending definitions");
            self.catalog = catalog;
            self.layout = layout;
            self.mode = SessionMode::Data;
        } else if self.writable && !self.damaged {
            first = self.sync();
        }
        let released = self.release(false);
        first.and(released)
    }

    fn release(&mut self, unlink: bool) -> Result<()> {
        match self.io.take() {
            Some(io) => io.close(unlink),
            None => Ok(()),
        }
    }

    // ----- inquiry -----

    pub fn inquire_dataset(&self) -> DatasetInfo {
        DatasetInfo {
            format: self.format,
            mode: self.mode,
            num_dimensions: self.catalog.dims.len(),
            num_variables: self.catalog.vars.len(),
            num_global_attributes: self.catalog.gatts.len(),
            unlimited_dimension: self.catalog.dims.unlimited(),
            record_count: self.numrecs,
        }
    }

    pub fn inquire_dimension(&self, dimid: usize) -> Result<DimensionInfo> {
        self.catalog
            .dims
            .get(dimid)
            .map(|d| DimensionInfo::new(d, self.numrecs))
            .ok_or_else(|| unknown_dimension(dimid))
    }

    pub fn inquire_variable(&self, varid: usize) -> Result<VariableInfo> {
        Ok(VariableInfo::new(self.variable(varid)?, self.numrecs))
    }

    pub fn dimension_id(&self, name: &str) -> Result<usize> {
        self.catalog
            .dims
            .position(name)
            .ok_or_else(|| CdfError::UnknownDimensionOrVariable(format!("dimension {}", name)))
    }

    pub fn variable_id(&self, name: &str) -> Result<usize> {
        self.catalog
            .vars
            .position(name)
            .ok_or_else(|| CdfError::UnknownDimensionOrVariable(format!("variable {}", name)))
    }

    pub fn unlimited_dimension(&self) -> Option<usize> {
        self.catalog.dims.unlimited()
    }

    /// File offset of the element at `coord` of a committed variable
    pub fn element_offset(&self, varid: usize, coord: &[usize]) -> Result<u64> {
        let var = self.variable(varid)?;
        if coord.len() != var.rank() {
            return Err(CdfError::InvalidArgument(format!(
                "{} coordinates for rank {}",
                coord.len(),
                var.rank()
            )));
        }
        Ok(self.layout.offset_of(var, coord))
    }

    pub fn summary(&self) -> CatalogSummary {
        CatalogSummary::new(&self.catalog, self.inquire_dataset())
    }

    /// The catalog summary as pretty-printed JSON
    pub fn summary_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.summary())?)
    }

    // ----- variable data -----

    /// Validate a hyperslab and return its element count.
    fn check_slab(&self, var: &Variable, start: &[usize], count: &[usize], write: bool) -> Result<usize> {
        let rank = var.rank();
        if start.len() != rank || count.len() != rank {
            return Err(CdfError::InvalidArgument(format!(
                "variable {} has rank {}, got {} start and {} count entries",
                var.name(),
                rank,
                start.len(),
                count.len()
            )));
        }
        let mut total: usize = 1;
        for (i, (&s, &c)) in start.iter().zip(count).enumerate() {
            let end = s
                .checked_add(c)
                .ok_or_else(|| CdfError::OutOfBounds(format!("{} + {} overflows", s, c)))?;
            if var.is_record() && i == 0 {
                if write {
                    if end >= STREAMING_NUMRECS as usize {
                        return Err(CdfError::InvalidArgument(format!(
                            "record {} exceeds the record limit",
                            end
                        )));
                    }
                } else if end > self.numrecs {
                    return Err(CdfError::OutOfBounds(format!(
                        "records {}..{} of {} with {} records",
                        s,
                        end,
                        var.name(),
                        self.numrecs
                    )));
                }
            } else if end > var.shape()[i] {
                return Err(CdfError::OutOfBounds(format!(
                    "{}..{} along dimension {} of {} (length {})",
                    s,
                    end,
                    i,
                    var.name(),
                    var.shape()[i]
                )));
            }
            total = total
                .checked_mul(c)
                .ok_or_else(|| CdfError::OutOfBounds("slab too large".to_string()))?;
        }
        Ok(total)
    }

    /// Extend the record count to `records`, filling the new records of
    /// every record variable in fill mode.
    fn grow_records(&mut self, records: usize) -> Result<()> {
        if records <= self.numrecs {
            return Ok(());
        }
        if self.fill_mode == FillMode::Fill {
            let io = handle(&mut self.io)?;
            for r in self.numrecs..records {
                for var in self.catalog.vars.iter().filter(|v| v.is_record()) {
                    fill_variable(io, var, self.layout.record_offset(var, r))?;
                }
            }
        }
        self.numrecs = records;
        self.numrecs_dirty = true;
        Ok(())
    }

    fn write_slab(
        &mut self,
        varid: usize,
        start: &[usize],
        count: &[usize],
        len: usize,
        encode: impl FnMut(usize, &mut [u8]) -> Result<usize>,
    ) -> Result<()> {
        self.require_data("write")?;
        self.check_writable("write")?;
        let var = self.variable(varid)?;
        let total = self.check_slab(var, start, count, true)?;
        if len != total {
            return Err(CdfError::InvalidArgument(format!(
                "{} values for a slab of {} elements",
                len, total
            )));
        }
        if total == 0 {
            return Ok(());
        }
        let records = if var.is_record() { start[0] + count[0] } else { 0 };

        let previous = (self.numrecs, self.numrecs_dirty);
        let result = self.grow_records(records);
        self.track(result)?;
        let result = self.write_runs(varid, start, count, encode);
        if result.is_err() {
            (self.numrecs, self.numrecs_dirty) = previous;
        }
        let failures = self.track(result)?;
        range_result(failures)
    }

    fn write_runs(
        &mut self,
        varid: usize,
        start: &[usize],
        count: &[usize],
        mut encode: impl FnMut(usize, &mut [u8]) -> Result<usize>,
    ) -> Result<usize> {
        let var = self.catalog.vars.get(varid).ok_or_else(|| unknown_variable(varid))?;
        let io = handle(&mut self.io)?;
        let xsz = var.element_size();
        let per_region = (io.chunk_size() / xsz).max(1);
        let mut failures = 0;
        for_each_run(&self.layout, var, start, count, |offset, first, run| {
            let mut done = 0;
            while done < run {
                let n = per_region.min(run - done);
                let mut region = Region::acquire(&mut *io, offset + (done * xsz) as u64, n * xsz, true)?;
                failures += encode(first + done, &mut region)?;
                done += n;
            }
            Ok(())
        })?;
        Ok(failures)
    }

    fn read_slab(
        &mut self,
        varid: usize,
        start: &[usize],
        count: &[usize],
        len: usize,
        mut decode: impl FnMut(usize, &[u8]) -> Result<usize>,
    ) -> Result<()> {
        self.require_data("read")?;
        let var = self.variable(varid)?;
        let total = self.check_slab(var, start, count, false)?;
        if len != total {
            return Err(CdfError::InvalidArgument(format!(
                "buffer of {} for a slab of {} elements",
                len, total
            )));
        }
        let var = self.catalog.vars.get(varid).ok_or_else(|| unknown_variable(varid))?;
        let io = handle(&mut self.io)?;
        let xsz = var.element_size();
        let per_region = (io.chunk_size() / xsz).max(1);
        let mut failures = 0;
        let result = for_each_run(&self.layout, var, start, count, |offset, first, run| {
            let mut done = 0;
            while done < run {
                let n = per_region.min(run - done);
                let region = Region::acquire(&mut *io, offset + (done * xsz) as u64, n * xsz, false)?;
                failures += decode(first + done, &region)?;
                done += n;
            }
            Ok(())
        });
        self.track(result)?;
        range_result(failures)
    }

    /// Element count of a slab that may be read, checked before any buffer
    /// is sized from it.
    fn readable_len(&self, varid: usize, start: &[usize], count: &[usize]) -> Result<usize> {
        self.require_data("read")?;
        self.check_slab(self.variable(varid)?, start, count, false)
    }

    fn numeric_type(&self, varid: usize) -> Result<ElementType> {
        let ty = self.variable(varid)?.element_type();
        if ty == ElementType::Char {
            return Err(CdfError::CharConversion(format!(
                "variable {} holds char data",
                varid
            )));
        }
        Ok(ty)
    }

    /// Write a hyperslab of numeric values in row-major order. Writing past
    /// the last record extends the record dimension.
    pub fn put_vara<T: Element>(&mut self, varid: usize, start: &[usize], count: &[usize], values: &[T]) -> Result<()> {
        let ty = self.numeric_type(varid)?;
        let width = ty.size_in_bytes();
        self.write_slab(varid, start, count, values.len(), |first, dst| {
            let n = dst.len() / width;
            encode_values(ty, &values[first..first + n], dst)
        })
    }

    /// Read a hyperslab converted to `T`.
    pub fn get_vara<T: Element>(&mut self, varid: usize, start: &[usize], count: &[usize]) -> Result<Vec<T>> {
        self.numeric_type(varid)?;
        let total = self.readable_len(varid, start, count)?;
        let mut out = vec![T::default(); total];
        self.get_vara_into(varid, start, count, &mut out)?;
        Ok(out)
    }

    /// Read a hyperslab into `out`. Values that do not fit `T` are left at
    /// `T::default()` and reported as [`CdfError::Range`] once the whole
    /// slab has been read.
    pub fn get_vara_into<T: Element>(
        &mut self,
        varid: usize,
        start: &[usize],
        count: &[usize],
        out: &mut [T],
    ) -> Result<()> {
        let ty = self.numeric_type(varid)?;
        let width = ty.size_in_bytes();
        let len = out.len();
        self.read_slab(varid, start, count, len, |first, src| {
            let n = src.len() / width;
            decode_values(ty, src, &mut out[first..first + n])
        })
    }

    /// Write raw bytes into a char variable.
    pub fn put_vara_text(&mut self, varid: usize, start: &[usize], count: &[usize], text: &[u8]) -> Result<()> {
        self.char_variable(varid)?;
        self.write_slab(varid, start, count, text.len(), |first, dst| {
            dst.copy_from_slice(&text[first..first + dst.len()]);
            Ok(0)
        })
    }

    /// Read raw bytes from a char variable.
    pub fn get_vara_text(&mut self, varid: usize, start: &[usize], count: &[usize]) -> Result<Vec<u8>> {
        self.char_variable(varid)?;
        let total = self.readable_len(varid, start, count)?;
        let mut out = vec![0u8; total];
        self.read_slab(varid, start, count, total, |first, src| {
            out[first..first + src.len()].copy_from_slice(src);
            Ok(0)
        })?;
        Ok(out)
    }

    fn char_variable(&self, varid: usize) -> Result<()> {
        if self.variable(varid)?.element_type() != ElementType::Char {
            return Err(CdfError::CharConversion(format!(
                "variable {} is not a char variable",
                varid
            )));
        }
        Ok(())
    }

    /// Write one element.
    pub fn put_var1<T: Element>(&mut self, varid: usize, index: &[usize], value: T) -> Result<()> {
        let count = vec![1; index.len()];
        self.put_vara(varid, index, &count, &[value])
    }

    /// Read one element.
    pub fn get_var1<T: Element>(&mut self, varid: usize, index: &[usize]) -> Result<T> {
        let count = vec![1; index.len()];
        let mut out = [T::default()];
        self.get_vara_into(varid, index, &count, &mut out)?;
        Ok(out[0])
    }

    /// Current extent of a variable, with the record count in place of the
    /// record dimension.
    pub fn variable_extent(&self, varid: usize) -> Result<Vec<usize>> {
        Ok(self.inquire_variable(varid)?.shape)
    }

    /// Read a whole variable as an n-dimensional array.
    pub fn get_array<T: Element>(&mut self, varid: usize) -> Result<ArrayD<T>> {
        let shape = self.variable_extent(varid)?;
        let start = vec![0; shape.len()];
        let values = self.get_vara(varid, &start, &shape)?;
        ArrayD::from_shape_vec(IxDyn(&shape), values)
            .map_err(|e| CdfError::InvalidArgument(e.to_string()))
    }

    /// Write an n-dimensional array with its origin at `start`.
    pub fn put_array<T: Element>(&mut self, varid: usize, start: &[usize], array: &ArrayD<T>) -> Result<()> {
        let values: Vec<T> = array.iter().copied().collect();
        self.put_vara(varid, start, array.shape(), &values)
    }
}

impl Drop for Dataset {
    fn drop(&mut self) {
        if self.io.is_some() {
            if let Err(e) = self.close_inner() {
                warn!(path = ?self.path, error = %e, "closing dropped dataset failed");
            }
        }
    }
}

/// Call `f(offset, first_element, elements)` for every contiguous run of a
/// hyperslab, in row-major order.
fn for_each_run(
    layout: &Layout,
    var: &Variable,
    start: &[usize],
    count: &[usize],
    mut f: impl FnMut(u64, usize, usize) -> Result<()>,
) -> Result<()> {
    if count.iter().any(|&c| c == 0) {
        return Ok(());
    }
    let rank = var.rank();
    if rank == 0 {
        return f(var.begin(), 0, 1);
    }

    // Trailing dimensions covered completely merge into one run. Records
    // are never contiguous with each other.
    let floor = usize::from(var.is_record());
    let shape = var.shape();
    let mut k = rank - 1;
    while k > floor && start[k] == 0 && count[k] == shape[k] {
        k -= 1;
    }
    let k = k.max(floor);
    let run: usize = count[k..].iter().product();

    let mut coord = start.to_vec();
    let mut first = 0;
    loop {
        f(layout.offset_of(var, &coord), first, run)?;
        first += run;
        let mut i = k;
        loop {
            if i == 0 {
                return Ok(());
            }
            i -= 1;
            coord[i] += 1;
            if coord[i] < start[i] + count[i] {
                break;
            }
            coord[i] = start[i];
        }
    }
}

/// Write the fill pattern over one variable, or one record of it.
fn fill_variable(io: &mut dyn RegionIo, var: &Variable, offset: u64) -> Result<()> {
    let pattern = var.fill_value();
    let total = data_len(var);
    let piece = (io.chunk_size() / pattern.len()).max(1) * pattern.len();
    let mut done: u64 = 0;
    while done < total {
        let n = (total - done).min(piece as u64) as usize;
        let mut region = Region::acquire(io, offset + done, n, true)?;
        fill_with(&pattern, &mut region);
        done += n as u64;
    }
    Ok(())
}

/// Apply a relocation plan sorted by source offset: blocks moving down in
/// ascending order, then blocks moving up in descending order, so no block
/// overwrites a source that has not moved yet.
fn apply_moves(io: &mut dyn RegionIo, moves: &[Move]) -> Result<()> {
    for m in moves.iter().filter(|m| m.to <= m.from) {
        io.move_bytes(m.to, m.from, m.len)?;
    }
    for m in moves.iter().rev().filter(|m| m.to > m.from) {
        io.move_bytes(m.to, m.from, m.len)?;
    }
    Ok(())
}
