//! Plain file backend: positioned reads and writes through one page-aligned buffer

use super::{map_create_error, read_only_error, BackendKind, RegionIo};
use crate::error::Result;
use crate::utils::round_up;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Plain file I/O with a single write-back buffer.
///
/// The buffer always covers whole chunks. Released writes are remembered as a
/// dirty byte range inside the buffer and written before the buffer is reused
/// for another part of the file, or on `sync`.
pub struct FileIo {
    file: File,
    path: PathBuf,
    writable: bool,
    chunk: usize,
    buf: Vec<u8>,
    buf_offset: u64,
    buf_valid: bool,
    dirty: Option<(usize, usize)>,
    window: Option<(usize, usize)>,
    size: u64,
}

impl FileIo {
    pub fn create(path: &Path, no_clobber: bool, chunk: usize) -> Result<Self> {
        let mut options = OpenOptions::new();
        options.read(true).write(true);
        if no_clobber {
            options.create_new(true);
        } else {
            options.create(true).truncate(true);
        }
        let file = options.open(path).map_err(|e| map_create_error(e, path))?;
        debug!(path = %path.display(), chunk, "created plain file");
        Ok(Self::new(file, path, true, chunk, 0))
    }

    pub fn open(path: &Path, writable: bool, chunk: usize) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(writable).open(path)?;
        let size = file.metadata()?.len();
        debug!(path = %path.display(), writable, chunk, size, "opened plain file");
        Ok(Self::new(file, path, writable, chunk, size))
    }

    fn new(file: File, path: &Path, writable: bool, chunk: usize, size: u64) -> Self {
        Self {
            file,
            path: path.to_path_buf(),
            writable,
            chunk,
            buf: Vec::new(),
            buf_offset: 0,
            buf_valid: false,
            dirty: None,
            window: None,
            size,
        }
    }

    /// Read into `out` from `offset`, zero-filling past the end of file.
    fn read_at(&mut self, offset: u64, out: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < out.len() {
            match self.file.read(&mut out[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        out[filled..].fill(0);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn flush_buffer(&mut self) -> Result<()> {
        if let Some((lo, hi)) = self.dirty.take() {
            let offset = self.buf_offset + lo as u64;
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.write_all(&self.buf[lo..hi])?;
        }
        Ok(())
    }

    fn covers(&self, lo: u64, hi: u64) -> bool {
        self.buf_valid && self.buf_offset <= lo && hi <= self.buf_offset + self.buf.len() as u64
    }
}

impl RegionIo for FileIo {
    fn kind(&self) -> BackendKind {
        BackendKind::PlainFile
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

        let chunk = self.chunk as u64;
        let lo = offset / chunk * chunk;
        let hi = round_up(offset + extent as u64, chunk).max(lo + chunk);
        if !self.covers(lo, hi) {
            self.flush_buffer()?;
            self.buf_valid = false;
            let mut buf = std::mem::take(&mut self.buf);
            buf.resize((hi - lo) as usize, 0);
            self.read_at(lo, &mut buf)?;
            self.buf = buf;
            self.buf_offset = lo;
            self.buf_valid = true;
        }
        let start = (offset - self.buf_offset) as usize;
        self.window = Some((start, extent));
        Ok(())
    }

    fn current(&self) -> &[u8] {
        match self.window {
            Some((start, extent)) => &self.buf[start..start + extent],
            None => &[],
        }
    }

    fn current_mut(&mut self) -> &mut [u8] {
        match self.window {
            Some((start, extent)) => &mut self.buf[start..start + extent],
            None => &mut [],
        }
    }

    fn release(&mut self, modified: bool) {
        let Some((start, extent)) = self.window.take() else {
            return;
        };
        if modified && self.writable && extent > 0 {
            let end = start + extent;
            self.dirty = Some(match self.dirty {
                Some((lo, hi)) => (lo.min(start), hi.max(end)),
                None => (start, end),
            });
            self.size = self.size.max(self.buf_offset + end as u64);
        }
    }

    fn move_bytes(&mut self, to: u64, from: u64, len: u64) -> Result<()> {
        if !self.writable {
            return Err(read_only_error(to));
        }
        if len == 0 || to == from {
            return Ok(());
        }
        self.flush_buffer()?;
        self.buf_valid = false;

        let piece = self.chunk as u64;
        let mut scratch = vec![0u8; self.chunk];
        if to > from {
            // Copy from the tail so the source is read before it is overwritten.
            let mut remaining = len;
            while remaining > 0 {
                let n = remaining.min(piece);
                remaining -= n;
                let part = &mut scratch[..n as usize];
                self.read_at(from + remaining, part)?;
                self.write_at(to + remaining, part)?;
            }
        } else {
            let mut done = 0;
            while done < len {
                let n = (len - done).min(piece);
                let part = &mut scratch[..n as usize];
                self.read_at(from + done, part)?;
                self.write_at(to + done, part)?;
                done += n;
            }
        }
        self.size = self.size.max(to + len);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        if self.writable {
            self.flush_buffer()?;
            self.file.flush()?;
        }
        Ok(())
    }

    fn file_size(&self) -> Result<u64> {
        Ok(self.size)
    }

    fn grow_to(&mut self, len: u64) -> Result<()> {
        if len <= self.size {
            return Ok(());
        }
        if !self.writable {
            return Err(read_only_error(len));
        }
        self.flush_buffer()?;
        self.file.set_len(len)?;
        self.size = len;
        Ok(())
    }

    fn close(mut self: Box<Self>, unlink: bool) -> Result<()> {
        let flushed = if unlink { Ok(()) } else { self.sync() };
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
