//! Memory-mapped backend

use super::{map_create_error, read_only_error, BackendKind, RegionIo};
use crate::error::Result;
use memmap2::{Mmap, MmapMut};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

enum Mapping {
    Empty,
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

impl Mapping {
    fn bytes(&self) -> &[u8] {
        match self {
            Mapping::Empty => &[],
            Mapping::ReadOnly(map) => &map[..],
            Mapping::ReadWrite(map) => &map[..],
        }
    }
}

#[derive(Clone, Copy)]
enum Window {
    /// Region lies inside the mapping
    Mapped { start: usize, extent: usize },
    /// Region reaches past the end of a read-only mapping and was copied
    Scratch { extent: usize },
}

/// The whole file mapped into memory. Regions inside the file are served
/// straight from the mapping; writes past the end grow the file and remap.
pub struct MmapIo {
    file: File,
    path: PathBuf,
    writable: bool,
    chunk: usize,
    map: Mapping,
    len: u64,
    scratch: Vec<u8>,
    window: Option<Window>,
    dirty: bool,
}

impl MmapIo {
    pub fn create(path: &Path, no_clobber: bool, chunk: usize) -> Result<Self> {
        let mut options = OpenOptions::new();
        options.read(true).write(true);
        if no_clobber {
            options.create_new(true);
        } else {
            options.create(true).truncate(true);
        }
        let file = options.open(path).map_err(|e| map_create_error(e, path))?;
        debug!(path = %path.display(), chunk, "created memory-mapped file");
        Ok(Self::new(file, path, true, chunk, Mapping::Empty, 0))
    }

    pub fn open(path: &Path, writable: bool, chunk: usize) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(writable).open(path)?;
        let len = file.metadata()?.len();
        let map = Self::map_file(&file, writable, len)?;
        debug!(path = %path.display(), writable, chunk, len, "mapped file");
        Ok(Self::new(file, path, writable, chunk, map, len))
    }

    fn new(file: File, path: &Path, writable: bool, chunk: usize, map: Mapping, len: u64) -> Self {
        Self {
            file,
            path: path.to_path_buf(),
            writable,
            chunk,
            map,
            len,
            scratch: Vec::new(),
            window: None,
            dirty: false,
        }
    }

    fn map_file(file: &File, writable: bool, len: u64) -> Result<Mapping> {
        if len == 0 {
            return Ok(Mapping::Empty);
        }
        // SAFETY: a session owns its file exclusively; nothing else truncates
        // it while the mapping is alive.
        let map = if writable {
            Mapping::ReadWrite(unsafe { MmapMut::map_mut(file)? })
        } else {
            Mapping::ReadOnly(unsafe { Mmap::map(file)? })
        };
        Ok(map)
    }

    fn flush_map(&mut self) -> Result<()> {
        if self.dirty {
            if let Mapping::ReadWrite(map) = &self.map {
                map.flush()?;
            }
            self.dirty = false;
        }
        Ok(())
    }

    fn remap(&mut self, len: u64) -> Result<()> {
        self.flush_map()?;
        self.map = Mapping::Empty;
        self.file.set_len(len)?;
        self.len = len;
        self.map = Self::map_file(&self.file, self.writable, len)?;
        Ok(())
    }

    fn map_mut(&mut self) -> &mut [u8] {
        match &mut self.map {
            Mapping::ReadWrite(map) => &mut map[..],
            _ => &mut [],
        }
    }
}

impl RegionIo for MmapIo {
    fn kind(&self) -> BackendKind {
        BackendKind::MemoryMapped
    }

    fn chunk_size(&self) -> usize {
        self.chunk
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn acquire(&mut self, offset: u64, extent: usize, want_write: bool) -> Result<()> {
        if want_write && !self.writable {
            return Err(read_only_error(offset));
        }
        debug_assert!(self.window.is_none(), "region slot already in use");

        let end = offset + extent as u64;
        if end > self.len && want_write {
            self.remap(end)?;
        }
        let window = if end <= self.len {
            Window::Mapped {
                start: offset as usize,
                extent,
            }
        } else {
            self.scratch.clear();
            self.scratch.resize(extent, 0);
            if offset < self.len {
                let available = &self.map.bytes()[offset as usize..];
                self.scratch[..available.len()].copy_from_slice(available);
            }
            Window::Scratch { extent }
        };
        self.window = Some(window);
        Ok(())
    }

    fn current(&self) -> &[u8] {
        match self.window {
            Some(Window::Mapped { start, extent }) => &self.map.bytes()[start..start + extent],
            Some(Window::Scratch { extent }) => &self.scratch[..extent],
            None => &[],
        }
    }

    fn current_mut(&mut self) -> &mut [u8] {
        match (&mut self.map, self.window) {
            (Mapping::ReadWrite(map), Some(Window::Mapped { start, extent })) => {
                &mut map[start..start + extent]
            }
            (map, Some(Window::Mapped { start, extent })) => {
                // Read-only mapping: edits land in scratch and are dropped.
                self.scratch = map.bytes()[start..start + extent].to_vec();
                &mut self.scratch[..]
            }
            (_, Some(Window::Scratch { extent })) => &mut self.scratch[..extent],
            (_, None) => &mut [],
        }
    }

    fn release(&mut self, modified: bool) {
        if let Some(Window::Mapped { .. }) = self.window.take() {
            if modified && self.writable {
                self.dirty = true;
            }
        }
    }

    fn move_bytes(&mut self, to: u64, from: u64, len: u64) -> Result<()> {
        if !self.writable {
            return Err(read_only_error(to));
        }
        if len == 0 || to == from {
            return Ok(());
        }
        let available = self.len.saturating_sub(from).min(len);
        if to + len > self.len {
            self.remap(to + len)?;
        }
        let (to, from, available, len) = (to as usize, from as usize, available as usize, len as usize);
        let map = self.map_mut();
        if available > 0 {
            map.copy_within(from..from + available, to);
        }
        map[to + available..to + len].fill(0);
        self.dirty = true;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.flush_map()
    }

    fn file_size(&self) -> Result<u64> {
        Ok(self.len)
    }

    fn grow_to(&mut self, len: u64) -> Result<()> {
        if len <= self.len {
            return Ok(());
        }
        if !self.writable {
            return Err(read_only_error(len));
        }
        self.remap(len)
    }

    fn close(mut self: Box<Self>, unlink: bool) -> Result<()> {
        let flushed = if unlink { Ok(()) } else { self.flush_map() };
        let path = self.path.clone();
        drop(self);
        if unlink {
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to unlink on close");
                return Err(e.into());
            }
        }
        flushed
    }
}
