//! Buffered region I/O over the different storage media
//!
//! Every backend exposes the file as a sequence of regions: a caller acquires
//! `[offset, offset + extent)`, reads or edits the bytes in place, and
//! releases the region, flagging whether it was modified. Modified regions
//! reach the medium at the latest on the next [`RegionIo::sync`].
//!
//! Each handle has a single region slot. [`Region`] is the scoped guard used
//! throughout the crate; it holds the handle mutably and releases on drop, so
//! two regions can never alias.

mod file;
mod memory;
mod mmap;

pub use file::FileIo;
pub use memory::{MemoryImage, MemoryIo};
pub use mmap::MmapIo;

use crate::error::{CdfError, Result};
use crate::utils::align_to_power_of_2;
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};
use std::path::Path;
use tracing::trace;

/// Smallest buffering granularity a backend accepts
pub const MIN_BLOCK_SIZE: usize = 256;

/// Largest buffering granularity a backend accepts
pub const MAX_BLOCK_SIZE: usize = 256 * 1024 * 1024;

/// Buffering granularity used when the caller gives no hint
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Storage media a dataset can live on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackendKind {
    /// Positioned reads and writes through a page-aligned buffer
    #[default]
    PlainFile,
    /// The file mapped into memory
    MemoryMapped,
    /// A whole-file image held in memory
    InMemory,
}

impl BackendKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "file" | "plain" | "plainfile" => Some(BackendKind::PlainFile),
            "mmap" | "memorymapped" => Some(BackendKind::MemoryMapped),
            "memory" | "inmemory" | "diskless" => Some(BackendKind::InMemory),
            _ => None,
        }
    }
}

/// How a backend handle is opened
#[derive(Debug, Clone)]
pub struct IoOptions {
    pub kind: BackendKind,
    pub chunk_size_hint: usize,
    pub writable: bool,
    /// Fail `create` when the path already exists
    pub no_clobber: bool,
    /// In-memory only: write the image back to the path on sync and close
    pub persist: bool,
}

impl Default for IoOptions {
    fn default() -> Self {
        Self {
            kind: BackendKind::PlainFile,
            chunk_size_hint: DEFAULT_CHUNK_SIZE,
            writable: true,
            no_clobber: false,
            persist: false,
        }
    }
}

/// Clamp a buffering hint into the supported range.
pub fn effective_chunk_size(hint: usize) -> usize {
    align_to_power_of_2(hint.clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE), 8)
}

/// Byte-addressable medium behind the acquire/release region protocol.
pub trait RegionIo {
    /// Which medium this handle uses
    fn kind(&self) -> BackendKind;

    /// Effective buffering granularity
    fn chunk_size(&self) -> usize;

    fn is_writable(&self) -> bool;

    /// Make `[offset, offset + extent)` addressable. Bytes past the end of
    /// the medium read as zero. Asking for write access on a read-only
    /// handle fails with [`CdfError::PermissionDenied`].
    fn acquire(&mut self, offset: u64, extent: usize, want_write: bool) -> Result<()>;

    /// Bytes of the acquired region
    fn current(&self) -> &[u8];

    /// Mutable bytes of the acquired region
    fn current_mut(&mut self) -> &mut [u8];

    /// Give the region back. A modified region is written out no later than
    /// the next `sync`.
    fn release(&mut self, modified: bool);

    /// `memmove` within the medium; ranges may overlap and may be larger
    /// than any single region.
    fn move_bytes(&mut self, to: u64, from: u64, len: u64) -> Result<()>;

    /// Push every released, modified region to the medium.
    fn sync(&mut self) -> Result<()>;

    /// Current length of the medium, including released but unflushed writes
    fn file_size(&self) -> Result<u64>;

    /// Extend the medium to at least `len` bytes with zeros. Never shrinks.
    fn grow_to(&mut self, len: u64) -> Result<()>;

    /// Flush and release the medium, deleting it when `unlink` is set.
    fn close(self: Box<Self>, unlink: bool) -> Result<()>;
}

/// Scoped region of a [`RegionIo`] handle, released on drop.
pub struct Region<'a> {
    io: &'a mut dyn RegionIo,
    offset: u64,
    modified: bool,
}

impl<'a> Region<'a> {
    pub fn acquire(
        io: &'a mut dyn RegionIo,
        offset: u64,
        extent: usize,
        want_write: bool,
    ) -> Result<Self> {
        trace!(offset, extent, want_write, "acquire region");
        io.acquire(offset, extent, want_write)?;
        Ok(Self {
            io,
            offset,
            modified: false,
        })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl Deref for Region<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.io.current()
    }
}

impl DerefMut for Region<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.modified = true;
        self.io.current_mut()
    }
}

impl Drop for Region<'_> {
    fn drop(&mut self) {
        trace!(offset = self.offset, modified = self.modified, "release region");
        self.io.release(self.modified);
    }
}

/// Write `data` at `offset` in pieces no larger than the handle's chunk size.
pub fn write_all_at(io: &mut dyn RegionIo, offset: u64, data: &[u8]) -> Result<()> {
    let piece = io.chunk_size();
    let mut pos = offset;
    for chunk in data.chunks(piece) {
        let mut region = Region::acquire(io, pos, chunk.len(), true)?;
        region.copy_from_slice(chunk);
        pos += chunk.len() as u64;
    }
    Ok(())
}

/// Read `out.len()` bytes from `offset` in chunk-sized pieces.
pub fn read_exact_at(io: &mut dyn RegionIo, offset: u64, out: &mut [u8]) -> Result<()> {
    let piece = io.chunk_size();
    let mut pos = offset;
    for chunk in out.chunks_mut(piece) {
        let region = Region::acquire(io, pos, chunk.len(), false)?;
        chunk.copy_from_slice(&region);
        pos += chunk.len() as u64;
    }
    Ok(())
}

/// Create a new medium at `path`, grown to `initial_size` bytes.
pub fn create_region_io(
    path: &Path,
    options: &IoOptions,
    initial_size: u64,
) -> Result<Box<dyn RegionIo>> {
    let chunk = effective_chunk_size(options.chunk_size_hint);
    let mut io: Box<dyn RegionIo> = match options.kind {
        BackendKind::PlainFile => Box::new(FileIo::create(path, options.no_clobber, chunk)?),
        BackendKind::MemoryMapped => Box::new(MmapIo::create(path, options.no_clobber, chunk)?),
        BackendKind::InMemory => Box::new(MemoryIo::create(
            path,
            options.no_clobber,
            options.persist,
            chunk,
        )?),
    };
    if initial_size > 0 {
        io.grow_to(initial_size)?;
    }
    Ok(io)
}

/// Open an existing medium at `path`.
pub fn open_region_io(path: &Path, options: &IoOptions) -> Result<Box<dyn RegionIo>> {
    let chunk = effective_chunk_size(options.chunk_size_hint);
    let io: Box<dyn RegionIo> = match options.kind {
        BackendKind::PlainFile => Box::new(FileIo::open(path, options.writable, chunk)?),
        BackendKind::MemoryMapped => Box::new(MmapIo::open(path, options.writable, chunk)?),
        BackendKind::InMemory => Box::new(MemoryIo::open(
            path,
            options.writable,
            options.persist,
            chunk,
        )?),
    };
    Ok(io)
}

/// Translate an OS-level create failure, keeping other errors unchanged.
pub(crate) fn map_create_error(err: std::io::Error, path: &Path) -> CdfError {
    if err.kind() == std::io::ErrorKind::AlreadyExists {
        CdfError::AlreadyExists(path.display().to_string())
    } else {
        CdfError::Io(err)
    }
}

pub(crate) fn read_only_error(offset: u64) -> CdfError {
    CdfError::PermissionDenied(format!("write access at offset {} on a read-only handle", offset))
}
