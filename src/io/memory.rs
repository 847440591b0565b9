//! In-memory backend

use super::{read_only_error, BackendKind, RegionIo};
use crate::error::{CdfError, Result};
use parking_lot::RwLock;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Shared whole-file image.
///
/// A dataset created or opened on an image writes its bytes back into it on
/// every sync and on close, so the caller can keep the image after the
/// session is gone or open it again.
#[derive(Debug, Clone, Default)]
pub struct MemoryImage {
    bytes: Arc<RwLock<Vec<u8>>>,
}

impl MemoryImage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(RwLock::new(bytes)),
        }
    }

    /// Copy of the current contents
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.read().clone()
    }

    pub fn len(&self) -> usize {
        self.bytes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn store(&self, data: &[u8]) {
        let mut bytes = self.bytes.write();
        bytes.clear();
        bytes.extend_from_slice(data);
    }
}

#[derive(Clone, Copy)]
enum Window {
    Direct { start: usize, extent: usize },
    Scratch { extent: usize },
}

/// Whole-file image held in memory, optionally tied to a path it is loaded
/// from and persisted to.
pub struct MemoryIo {
    data: Vec<u8>,
    image: Option<MemoryImage>,
    path: Option<PathBuf>,
    persist: bool,
    writable: bool,
    chunk: usize,
    scratch: Vec<u8>,
    window: Option<Window>,
    dirty: bool,
}

impl MemoryIo {
    pub fn create(path: &Path, no_clobber: bool, persist: bool, chunk: usize) -> Result<Self> {
        if no_clobber && path.exists() {
            return Err(CdfError::AlreadyExists(path.display().to_string()));
        }
        debug!(path = %path.display(), persist, chunk, "created in-memory dataset");
        let mut io = Self::new(Vec::new(), None, Some(path), persist, true, chunk);
        // A new dataset reaches its path on the first sync even if empty.
        io.dirty = true;
        Ok(io)
    }

    pub fn open(path: &Path, writable: bool, persist: bool, chunk: usize) -> Result<Self> {
        let data = fs::read(path)?;
        debug!(path = %path.display(), len = data.len(), "loaded file into memory");
        Ok(Self::new(data, None, Some(path), persist && writable, writable, chunk))
    }

    /// Start a new dataset in `image`, replacing its contents on the first
    /// sync.
    pub fn create_in(image: MemoryImage, chunk: usize) -> Self {
        let mut io = Self::new(Vec::new(), Some(image), None, false, true, chunk);
        io.dirty = true;
        io
    }

    /// Work on a shared image. The image is updated on sync and close.
    pub fn with_image(image: MemoryImage, writable: bool, chunk: usize) -> Self {
        let data = image.snapshot();
        Self::new(data, Some(image), None, false, writable, chunk)
    }

    fn new(
        data: Vec<u8>,
        image: Option<MemoryImage>,
        path: Option<&Path>,
        persist: bool,
        writable: bool,
        chunk: usize,
    ) -> Self {
        Self {
            data,
            image,
            path: path.map(Path::to_path_buf),
            persist,
            writable,
            chunk,
            scratch: Vec::new(),
            window: None,
            dirty: false,
        }
    }

    /// Zero-extend the image to `len` bytes, failing instead of aborting when
    /// the allocation cannot be made.
    fn extend_to(&mut self, len: usize) -> Result<()> {
        let additional = len.saturating_sub(self.data.len());
        self.data
            .try_reserve(additional)
            .map_err(|e| CdfError::OutOfMemory(format!("growing image to {} bytes: {}", len, e)))?;
        self.data.resize(len, 0);
        Ok(())
    }

    fn write_back(&mut self) -> Result<()> {
        if !self.dirty || !self.writable {
            return Ok(());
        }
        if let Some(image) = &self.image {
            image.store(&self.data);
        }
        if self.persist {
            if let Some(path) = &self.path {
                fs::write(path, &self.data)?;
            }
        }
        self.dirty = false;
        Ok(())
    }
}

impl RegionIo for MemoryIo {
    fn kind(&self) -> BackendKind {
        BackendKind::InMemory
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

        let start = usize::try_from(offset)
            .map_err(|_| CdfError::OutOfMemory(format!("offset {} exceeds memory", offset)))?;
        let end = start
            .checked_add(extent)
            .ok_or_else(|| CdfError::OutOfMemory(format!("region at {} exceeds memory", offset)))?;
        if end > self.data.len() && want_write {
            self.extend_to(end)?;
        }
        let window = if end <= self.data.len() {
            Window::Direct { start, extent }
        } else {
            self.scratch.clear();
            self.scratch.resize(extent, 0);
            if start < self.data.len() {
                let available = &self.data[start..];
                self.scratch[..available.len()].copy_from_slice(available);
            }
            Window::Scratch { extent }
        };
        self.window = Some(window);
        Ok(())
    }

    fn current(&self) -> &[u8] {
        match self.window {
            Some(Window::Direct { start, extent }) => &self.data[start..start + extent],
            Some(Window::Scratch { extent }) => &self.scratch[..extent],
            None => &[],
        }
    }

    fn current_mut(&mut self) -> &mut [u8] {
        match self.window {
            Some(Window::Direct { start, extent }) => &mut self.data[start..start + extent],
            Some(Window::Scratch { extent }) => &mut self.scratch[..extent],
            None => &mut [],
        }
    }

    fn release(&mut self, modified: bool) {
        if let Some(Window::Direct { .. }) = self.window.take() {
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
        let (to, from, len) = (to as usize, from as usize, len as usize);
        let available = self.data.len().saturating_sub(from).min(len);
        let end = to
            .checked_add(len)
            .ok_or_else(|| CdfError::OutOfMemory(format!("move to {} exceeds memory", to)))?;
        if end > self.data.len() {
            self.extend_to(end)?;
        }
        if available > 0 {
            self.data.copy_within(from..from + available, to);
        }
        self.data[to + available..to + len].fill(0);
        self.dirty = true;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.write_back()
    }

    fn file_size(&self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn grow_to(&mut self, len: u64) -> Result<()> {
        if len <= self.data.len() as u64 {
            return Ok(());
        }
        if !self.writable {
            return Err(read_only_error(len));
        }
        let len = usize::try_from(len)
            .map_err(|_| CdfError::OutOfMemory(format!("{} bytes exceed memory", len)))?;
        self.extend_to(len)?;
        self.dirty = true;
        Ok(())
    }

    fn close(mut self: Box<Self>, unlink: bool) -> Result<()> {
        if !unlink {
            return self.write_back();
        }
        if self.persist {
            if let Some(path) = &self.path {
                if path.exists() {
                    if let Err(e) = fs::remove_file(path) {
                        warn!(path = %path.display(), error = %e, "failed to unlink on close");
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreachable_growth_is_an_error() {
        let mut io = MemoryIo::create_in(MemoryImage::new(), 256);
        let past_memory = isize::MAX as u64 + 1;

        assert!(matches!(io.grow_to(u64::MAX - 1), Err(CdfError::OutOfMemory(_))));
        assert!(matches!(
            io.acquire(past_memory, 4, true),
            Err(CdfError::OutOfMemory(_))
        ));
        assert!(matches!(
            io.acquire(u64::MAX - 2, 8, true),
            Err(CdfError::OutOfMemory(_))
        ));
        assert!(matches!(
            io.move_bytes(past_memory, 0, 4),
            Err(CdfError::OutOfMemory(_))
        ));
        assert_eq!(io.file_size().unwrap(), 0);

        io.grow_to(16).unwrap();
        assert_eq!(io.file_size().unwrap(), 16);
    }
}
