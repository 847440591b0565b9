//! Binary header encoding and decoding
//!
//! All integers are big-endian. The header is
//!
//! ```text
//! magic "CDF" | version | numrecs | dim_list | gatt_list | var_list
//! ```
//!
//! where each list is `tag count element*`, or `0 0` when empty.

use crate::catalog::{Attribute, AttributeArray, Catalog, Dimension, Variable};
use crate::error::{CdfError, Result};
use crate::io::{write_all_at, Region, RegionIo};
use crate::name::StringCell;
use crate::types::{ElementType, FormatVariant, MAX_VAR_DIMS, UNLIMITED};
use crate::utils::pad4;
use crate::CDF_MAGIC;
use bytes::{Buf, BufMut, BytesMut};
use tracing::{debug, trace};

pub const TAG_ABSENT: u32 = 0;
pub const TAG_DIMENSION: u32 = 10;
pub const TAG_VARIABLE: u32 = 11;
pub const TAG_ATTRIBUTE: u32 = 12;

/// Stored size of the unlimited dimension
pub const UNLIMITED_MARKER: u32 = u32::MAX;

/// `vsize` of a variable too large for the field
pub const OPEN_ENDED_VSIZE: u32 = u32::MAX;

/// `numrecs` of a file still being written by a streaming producer
pub const STREAMING_NUMRECS: u32 = u32::MAX;

/// File offset of the `numrecs` field
pub const NUMRECS_OFFSET: u64 = 4;

/// Encode the complete header for `catalog`. Variable offsets must already
/// be assigned.
pub fn encode_header(catalog: &Catalog, format: FormatVariant, numrecs: usize) -> Result<BytesMut> {
    let numrecs = u32::try_from(numrecs)
        .ok()
        .filter(|&n| n != STREAMING_NUMRECS)
        .ok_or_else(|| CdfError::InvalidArgument(format!("record count {} too large", numrecs)))?;

    let size = catalog.header_len(format) as usize;
    let mut buf = BytesMut::with_capacity(size);
    buf.put_slice(CDF_MAGIC);
    buf.put_u8(format.version_byte());
    buf.put_u32(numrecs);

    put_list_head(&mut buf, TAG_DIMENSION, catalog.dims.len());
    for dim in catalog.dims.iter() {
        put_name(&mut buf, dim.name_cell());
        let len = if dim.is_unlimited() {
            UNLIMITED_MARKER
        } else {
            dim.len() as u32
        };
        buf.put_u32(len);
    }

    put_attributes(&mut buf, &catalog.gatts);

    put_list_head(&mut buf, TAG_VARIABLE, catalog.vars.len());
    for var in catalog.vars.iter() {
        put_name(&mut buf, var.name_cell());
        buf.put_u32(var.rank() as u32);
        for &id in var.dimension_ids() {
            buf.put_u32(id as u32);
        }
        put_attributes(&mut buf, var.attributes());
        buf.put_u32(var.element_type().tag() as u32);
        let vsize = if var.byte_len() > format.max_variable_len() {
            OPEN_ENDED_VSIZE
        } else {
            var.byte_len() as u32
        };
        buf.put_u32(vsize);
        match format {
            FormatVariant::Classic => {
                let begin = u32::try_from(var.begin())
                    .map_err(|_| CdfError::VariableTooLarge(var.name().to_string()))?;
                buf.put_u32(begin);
            }
            FormatVariant::LargeOffset => buf.put_u64(var.begin()),
        }
    }

    debug_assert_eq!(buf.len(), size);
    Ok(buf)
}

fn put_list_head(buf: &mut BytesMut, tag: u32, count: usize) {
    if count == 0 {
        buf.put_u32(TAG_ABSENT);
        buf.put_u32(0);
    } else {
        buf.put_u32(tag);
        buf.put_u32(count as u32);
    }
}

fn put_name(buf: &mut BytesMut, name: &StringCell) {
    let bytes = name.as_str().as_bytes();
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
    buf.put_bytes(0, pad4(bytes.len()) - bytes.len());
}

fn put_attributes(buf: &mut BytesMut, attrs: &AttributeArray) {
    put_list_head(buf, TAG_ATTRIBUTE, attrs.len());
    for attr in attrs.iter() {
        put_name(buf, attr.name_cell());
        buf.put_u32(attr.element_type().tag() as u32);
        buf.put_u32(attr.len() as u32);
        buf.put_slice(attr.raw());
        buf.put_bytes(0, attr.value_len() - attr.raw().len());
    }
}

/// Encode and write the header at offset 0.
pub fn write_header(io: &mut dyn RegionIo, catalog: &Catalog, format: FormatVariant, numrecs: usize) -> Result<u64> {
    let bytes = encode_header(catalog, format, numrecs)?;
    write_all_at(io, 0, &bytes)?;
    debug!(len = bytes.len(), numrecs, "wrote header");
    Ok(bytes.len() as u64)
}

/// Rewrite only the record count.
pub fn patch_numrecs(io: &mut dyn RegionIo, numrecs: usize) -> Result<()> {
    let numrecs = u32::try_from(numrecs)
        .ok()
        .filter(|&n| n != STREAMING_NUMRECS)
        .ok_or_else(|| CdfError::InvalidArgument(format!("record count {} too large", numrecs)))?;
    let mut region = Region::acquire(io, NUMRECS_OFFSET, 4, true)?;
    region.copy_from_slice(&numrecs.to_be_bytes());
    Ok(())
}

/// A header read back from a file
#[derive(Debug, Clone)]
pub struct DecodedHeader {
    pub catalog: Catalog,
    pub format: FormatVariant,
    /// `None` when the file carries the streaming marker
    pub numrecs: Option<usize>,
    /// Bytes consumed
    pub header_size: u64,
}

/// Pulls the header through the region interface one chunk at a time.
struct HeaderReader<'a> {
    io: &'a mut dyn RegionIo,
    buf: BytesMut,
    next: u64,
    end: u64,
    consumed: u64,
}

impl<'a> HeaderReader<'a> {
    fn new(io: &'a mut dyn RegionIo) -> Result<Self> {
        let end = io.file_size()?;
        Ok(Self {
            io,
            buf: BytesMut::new(),
            next: 0,
            end,
            consumed: 0,
        })
    }

    /// Make at least `n` unread bytes available.
    fn ensure(&mut self, n: usize) -> Result<()> {
        while self.buf.len() < n {
            let extent = (self.end - self.next).min(self.io.chunk_size() as u64) as usize;
            if extent == 0 {
                return Err(CdfError::TruncatedOrCorrupt(format!(
                    "header ends early at byte {} of {}",
                    self.consumed + self.buf.len() as u64,
                    self.end
                )));
            }
            let region = Region::acquire(&mut *self.io, self.next, extent, false)?;
            self.buf.extend_from_slice(&region);
            drop(region);
            trace!(offset = self.next, extent, "fetched header chunk");
            self.next += extent as u64;
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<BytesMut> {
        self.ensure(n)?;
        self.consumed += n as u64;
        Ok(self.buf.split_to(n))
    }

    fn u32(&mut self) -> Result<u32> {
        self.ensure(4)?;
        self.consumed += 4;
        Ok(self.buf.get_u32())
    }

    fn u64(&mut self) -> Result<u64> {
        self.ensure(8)?;
        self.consumed += 8;
        Ok(self.buf.get_u64())
    }

    fn skip_padding(&mut self, len: usize) -> Result<()> {
        let pad = pad4(len) - len;
        if pad > 0 {
            self.take(pad)?;
        }
        Ok(())
    }

    /// Byte count that must still fit in the file
    fn check_remaining(&self, n: u64) -> Result<()> {
        let available = self.end - self.consumed;
        if n > available {
            return Err(CdfError::TruncatedOrCorrupt(format!(
                "header claims {} more bytes but only {} remain",
                n, available
            )));
        }
        Ok(())
    }

    fn name(&mut self) -> Result<StringCell> {
        let len = self.u32()? as usize;
        self.check_remaining(pad4(len) as u64)?;
        let bytes = self.take(len)?;
        self.skip_padding(len)?;
        StringCell::from_header_bytes(&bytes)
    }

    fn list_head(&mut self, tag: u32, what: &str) -> Result<usize> {
        let found = self.u32()?;
        let count = self.u32()? as usize;
        if found == tag || (found == TAG_ABSENT && count == 0) {
            Ok(count)
        } else {
            Err(CdfError::MalformedCatalog(format!(
                "expected {} list, found tag {} with {} entries",
                what, found, count
            )))
        }
    }

    fn element_type(&mut self) -> Result<ElementType> {
        let tag = self.u32()?;
        i32::try_from(tag)
            .ok()
            .and_then(ElementType::from_tag)
            .ok_or_else(|| CdfError::MalformedCatalog(format!("unknown type tag {}", tag)))
    }

    fn attributes(&mut self) -> Result<AttributeArray> {
        let count = self.list_head(TAG_ATTRIBUTE, "attribute")?;
        let mut attrs = AttributeArray::default();
        for _ in 0..count {
            let name = self.name()?;
            let ty = self.element_type()?;
            let nelems = self.u32()? as usize;
            let len = nelems
                .checked_mul(ty.size_in_bytes())
                .ok_or_else(|| CdfError::MalformedCatalog(format!("attribute {} too long", name)))?;
            self.check_remaining(pad4(len) as u64)?;
            let value = self.take(len)?;
            self.skip_padding(len)?;
            attrs.push_unique(Attribute::from_raw(name, ty, nelems, value.to_vec()))?;
        }
        Ok(attrs)
    }
}

/// Read and validate the header at the start of `io`.
pub fn read_header(io: &mut dyn RegionIo) -> Result<DecodedHeader> {
    let mut reader = HeaderReader::new(io)?;

    let magic = reader.take(4).map_err(|e| match e {
        CdfError::TruncatedOrCorrupt(_) => CdfError::NotADataset("file shorter than the magic number".into()),
        other => other,
    })?;
    if &magic[..3] != CDF_MAGIC {
        return Err(CdfError::NotADataset("bad magic number".into()));
    }
    let format = FormatVariant::from_version_byte(magic[3])
        .ok_or_else(|| CdfError::NotADataset(format!("unsupported version byte {}", magic[3])))?;

    let numrecs = match reader.u32()? {
        STREAMING_NUMRECS => None,
        n => Some(n as usize),
    };

    let mut catalog = Catalog::new();
    let ndims = reader.list_head(TAG_DIMENSION, "dimension")?;
    for _ in 0..ndims {
        let name = reader.name()?;
        let len = match reader.u32()? {
            // Older producers store the record dimension as 0.
            UNLIMITED_MARKER | 0 => UNLIMITED,
            n => n as usize,
        };
        catalog.dims.push(Dimension::new(name, len)).map_err(|e| match e {
            CdfError::NameInUse(name) => CdfError::MalformedCatalog(format!("duplicate dimension {}", name)),
            other => other,
        })?;
    }

    catalog.gatts = reader.attributes()?;

    let nvars = reader.list_head(TAG_VARIABLE, "variable")?;
    for _ in 0..nvars {
        let name = reader.name()?;
        let rank = reader.u32()? as usize;
        if rank > MAX_VAR_DIMS {
            return Err(CdfError::MalformedCatalog(format!(
                "variable {} has {} dimensions",
                name, rank
            )));
        }
        let mut dimids = Vec::with_capacity(rank);
        for _ in 0..rank {
            dimids.push(reader.u32()? as usize);
        }
        let attrs = reader.attributes()?;
        let ty = reader.element_type()?;
        let _vsize = reader.u32()?;
        let begin = match format {
            FormatVariant::Classic => reader.u32()? as u64,
            FormatVariant::LargeOffset => reader.u64()?,
        };

        let mut var = Variable::new(name, ty, dimids);
        var.set_attributes(attrs);
        var.begin = begin;
        catalog.vars.push(var).map_err(|e| match e {
            CdfError::NameInUse(name) => CdfError::MalformedCatalog(format!("duplicate variable {}", name)),
            other => other,
        })?;
    }

    catalog.validate()?;
    let header_size = reader.consumed;
    debug!(?format, ?numrecs, header_size, ndims, nvars, "decoded header");
    Ok(DecodedHeader {
        catalog,
        format,
        numrecs,
        header_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{MemoryImage, MemoryIo};

    fn cell(name: &str) -> StringCell {
        StringCell::new(name).unwrap()
    }

    fn reader_for(bytes: Vec<u8>) -> MemoryIo {
        MemoryIo::with_image(MemoryImage::from_bytes(bytes), false, 256)
    }

    #[test]
    fn test_empty_header_bytes() {
        let bytes = encode_header(&Catalog::new(), FormatVariant::Classic, 0).unwrap();
        let mut expected = b"CDF\x01".to_vec();
        expected.extend_from_slice(&[0; 28]);
        assert_eq!(&bytes[..], &expected[..]);
    }

    #[test]
    fn test_round_trip_through_region_io() {
        let mut catalog = Catalog::new();
        catalog.dims.push(Dimension::new(cell("time"), UNLIMITED)).unwrap();
        catalog.dims.push(Dimension::new(cell("x"), 7)).unwrap();
        catalog.gatts.upsert(Attribute::from_text(cell("title"), "a test"));
        let mut var = Variable::new(cell("v"), ElementType::Short, vec![0, 1]);
        var.attrs_mut()
            .upsert(Attribute::from_values(cell("scale"), ElementType::Float, &[0.5f32]).unwrap().0);
        var.begin = 1024;
        catalog.vars.push(var).unwrap();

        for format in [FormatVariant::Classic, FormatVariant::LargeOffset] {
            let bytes = encode_header(&catalog, format, 3).unwrap();
            let mut io = reader_for(bytes.to_vec());
            let decoded = read_header(&mut io).unwrap();
            assert_eq!(decoded.format, format);
            assert_eq!(decoded.numrecs, Some(3));
            assert_eq!(decoded.header_size, bytes.len() as u64);
            assert_eq!(decoded.catalog.dims, catalog.dims);
            assert_eq!(decoded.catalog.gatts, catalog.gatts);
            let v = decoded.catalog.vars.get(0).unwrap();
            assert_eq!(v.begin(), 1024);
            assert_eq!(v.attributes(), catalog.vars.get(0).unwrap().attributes());
        }
    }

    #[test]
    fn test_bad_magic_and_version() {
        let mut io = reader_for(b"HDF\x01\0\0\0\0".to_vec());
        assert!(matches!(read_header(&mut io), Err(CdfError::NotADataset(_))));
        let mut io = reader_for(b"CDF\x05\0\0\0\0".to_vec());
        assert!(matches!(read_header(&mut io), Err(CdfError::NotADataset(_))));
        let mut io = reader_for(b"CD".to_vec());
        assert!(matches!(read_header(&mut io), Err(CdfError::NotADataset(_))));
    }

    #[test]
    fn test_truncated_header() {
        let mut catalog = Catalog::new();
        catalog.gatts.upsert(Attribute::from_text(cell("history"), "x".repeat(600).as_str()));
        let bytes = encode_header(&catalog, FormatVariant::Classic, 0).unwrap();
        for cut in [9, 20, 300, bytes.len() - 1] {
            let mut io = reader_for(bytes[..cut].to_vec());
            assert!(
                matches!(read_header(&mut io), Err(CdfError::TruncatedOrCorrupt(_))),
                "cut at {}",
                cut
            );
        }
    }

    #[test]
    fn test_second_unlimited_rejected() {
        let mut buf = BytesMut::new();
        buf.put_slice(b"CDF\x01");
        buf.put_u32(0);
        buf.put_u32(TAG_DIMENSION);
        buf.put_u32(2);
        for name in [b"a", b"b"] {
            buf.put_u32(1);
            buf.put_slice(name);
            buf.put_bytes(0, 3);
            buf.put_u32(UNLIMITED_MARKER);
        }
        buf.put_bytes(0, 16);
        let mut io = reader_for(buf.to_vec());
        assert!(matches!(read_header(&mut io), Err(CdfError::MalformedCatalog(_))));
    }

    #[test]
    fn test_streaming_marker() {
        let mut bytes = encode_header(&Catalog::new(), FormatVariant::Classic, 0).unwrap().to_vec();
        bytes[4..8].copy_from_slice(&STREAMING_NUMRECS.to_be_bytes());
        let mut io = reader_for(bytes);
        assert_eq!(read_header(&mut io).unwrap().numrecs, None);
    }

    #[test]
    fn test_patch_numrecs() {
        let image = MemoryImage::from_bytes(encode_header(&Catalog::new(), FormatVariant::Classic, 0).unwrap().to_vec());
        let mut io = MemoryIo::with_image(image.clone(), true, 256);
        patch_numrecs(&mut io, 42).unwrap();
        io.sync().unwrap();
        assert_eq!(&image.snapshot()[4..8], &42u32.to_be_bytes());
        assert!(patch_numrecs(&mut io, u32::MAX as usize).is_err());
    }
}
