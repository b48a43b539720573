#![forbid(unsafe_code)]
//! Positional file I/O. Readers and the flush worker share one descriptor;
//! all access goes through offsets, never a seek cursor.

use std::{fs::File, fs::OpenOptions, io, path::Path, sync::Arc};

use crate::types::{EstriaError, Result};

pub trait FileIo: Send + Sync + 'static {
    /// Reads up to `dst.len()` bytes at `off`. Returns the number of bytes
    /// actually read; 0 means `off` is at or past end of file.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<usize>;
    /// Reads exactly `dst.len()` bytes at `off` or fails with `ShortRead`.
    fn read_exact_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        let read = self.read_at(off, dst)?;
        if read != dst.len() {
            return Err(EstriaError::ShortRead);
        }
        Ok(())
    }
    /// Writes all of `src` at `off` or fails with `ShortWrite`.
    fn write_all_at(&self, off: u64, src: &[u8]) -> Result<()>;
    fn sync_all(&self) -> Result<()>;
    fn len(&self) -> Result<u64>;
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    fn truncate(&self, len: u64) -> Result<()>;
}

#[derive(Clone)]
pub struct StdFileIo {
    inner: Arc<File>,
}

impl StdFileIo {
    pub fn new(file: File) -> Self {
        Self {
            inner: Arc::new(file),
        }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(EstriaError::from)?;
        Ok(Self::new(file))
    }

    fn file(&self) -> &File {
        &self.inner
    }
}

// Fills `dst` from `off`, tolerating partial reads from the kernel but
// stopping cleanly at end of file.
fn read_upto(file: &File, mut off: u64, dst: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0usize;
    while filled < dst.len() {
        let read = positional::read_at(file, off, &mut dst[filled..])?;
        if read == 0 {
            break;
        }
        filled += read;
        off += read as u64;
    }
    Ok(filled)
}

fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
    while !src.is_empty() {
        let written = positional::write_at(file, off, src)?;
        if written == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "write_at wrote zero bytes",
            ));
        }
        src = &src[written..];
        off += written as u64;
    }
    Ok(())
}

#[cfg(unix)]
mod positional {
    use std::{fs::File, io, os::unix::fs::FileExt};

    pub fn read_at(file: &File, off: u64, dst: &mut [u8]) -> io::Result<usize> {
        file.read_at(dst, off)
    }

    pub fn write_at(file: &File, off: u64, src: &[u8]) -> io::Result<usize> {
        file.write_at(src, off)
    }
}

#[cfg(windows)]
mod positional {
    use std::{fs::File, io, os::windows::fs::FileExt};

    pub fn read_at(file: &File, off: u64, dst: &mut [u8]) -> io::Result<usize> {
        file.seek_read(dst, off)
    }

    pub fn write_at(file: &File, off: u64, src: &[u8]) -> io::Result<usize> {
        file.seek_write(src, off)
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<usize> {
        read_upto(self.file(), off, dst).map_err(EstriaError::from)
    }

    fn write_all_at(&self, off: u64, src: &[u8]) -> Result<()> {
        write_all(self.file(), off, src).map_err(EstriaError::from)
    }

    fn sync_all(&self) -> Result<()> {
        self.file().sync_all().map_err(EstriaError::from)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file().metadata().map_err(EstriaError::from)?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.file().set_len(len).map_err(EstriaError::from)
    }
}
