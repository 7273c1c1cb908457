//! Byte-range sources behind the file reader
//!
//! A reader never touches `std::fs` directly: it asks a [`ByteSource`] for ranges. The
//! source can be a plain file, a memory map or a fully loaded copy, and can be swapped
//! at runtime (see `TsspFileReader::load_into_memory`).

use crate::{Result, TsspError};
use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver};
use memmap2::{Mmap, MmapOptions};
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

/// Positioned reads over an immutable byte range
pub trait ByteSource: Send + Sync {
    fn path(&self) -> &Path;

    /// Total size in bytes
    fn size(&self) -> u64;

    /// Read exactly `len` bytes at `offset`.
    fn read_at(&self, offset: u64, len: usize) -> Result<Bytes>;

    /// Short name for logs
    fn kind(&self) -> &'static str;

    /// Bytes held in process memory
    fn memory_size(&self) -> usize {
        0
    }
}

fn check_range(size: u64, offset: u64, len: usize) -> Result<()> {
    let end = offset.checked_add(len as u64);
    if end.map_or(true, |end| end > size) {
        return Err(TsspError::ShortRead {
            offset,
            want: len,
            got: size.saturating_sub(offset) as usize,
        });
    }
    Ok(())
}

/// Buffered positioned reads through a file descriptor
pub struct DiskSource {
    path: PathBuf,
    file: Mutex<File>,
    size: u64,
}

impl DiskSource {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| TsspError::io_with_path("open", path, e))?;
        let size = file
            .metadata()
            .map_err(|e| TsspError::io_with_path("stat", path, e))?
            .len();
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            size,
        })
    }
}

impl ByteSource for DiskSource {
    fn path(&self) -> &Path {
        &self.path
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&self, offset: u64, len: usize) -> Result<Bytes> {
        check_range(self.size, offset, len)?;
        let mut buf = vec![0u8; len];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.read_exact(&mut buf))
            .map_err(|e| TsspError::io_with_path("read", &self.path, e))?;
        Ok(Bytes::from(buf))
    }

    fn kind(&self) -> &'static str {
        "disk"
    }
}

/// Read-only memory map of the whole file
pub struct MmapSource {
    path: PathBuf,
    mmap: Mmap,
}

impl MmapSource {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| TsspError::io_with_path("open", path, e))?;
        let len = file
            .metadata()
            .map_err(|e| TsspError::io_with_path("stat", path, e))?
            .len() as usize;
        // SAFETY: sealed TSSP files are never modified in place; they are only replaced
        // by rename or removed once every reader has released them.
        let mmap = unsafe { MmapOptions::new().len(len).map(&file) }
            .map_err(|e| TsspError::io_with_path("mmap", path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            mmap,
        })
    }
}

impl ByteSource for MmapSource {
    fn path(&self) -> &Path {
        &self.path
    }

    fn size(&self) -> u64 {
        self.mmap.len() as u64
    }

    fn read_at(&self, offset: u64, len: usize) -> Result<Bytes> {
        check_range(self.size(), offset, len)?;
        let start = offset as usize;
        Ok(Bytes::copy_from_slice(&self.mmap[start..start + len]))
    }

    fn kind(&self) -> &'static str {
        "mmap"
    }
}

/// Whole file loaded into memory
pub struct MemorySource {
    path: PathBuf,
    data: Bytes,
}

impl MemorySource {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path).map_err(|e| TsspError::io_with_path("read", path, e))?;
        Ok(Self::from_bytes(path, Bytes::from(data)))
    }

    pub fn from_bytes(path: &Path, data: Bytes) -> Self {
        Self {
            path: path.to_path_buf(),
            data,
        }
    }
}

impl ByteSource for MemorySource {
    fn path(&self) -> &Path {
        &self.path
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&self, offset: u64, len: usize) -> Result<Bytes> {
        check_range(self.size(), offset, len)?;
        let start = offset as usize;
        Ok(self.data.slice(start..start + len))
    }

    fn kind(&self) -> &'static str {
        "memory"
    }

    fn memory_size(&self) -> usize {
        self.data.len()
    }
}

/// Open the default source for `path`
pub fn open_source(path: &Path, enable_mmap: bool) -> Result<Arc<dyn ByteSource>> {
    if enable_mmap {
        Ok(Arc::new(MmapSource::open(path)?))
    } else {
        Ok(Arc::new(DiskSource::open(path)?))
    }
}

/// Read `ranges` on a background thread, delivering `(offset, bytes)` in request order.
///
/// The reader thread stops at the first error or as soon as the receiver is dropped.
pub fn stream_read_batch(
    source: Arc<dyn ByteSource>,
    ranges: Vec<(u64, usize)>,
    capacity: usize,
) -> Receiver<Result<(u64, Bytes)>> {
    let (tx, rx) = bounded(capacity.max(1));
    thread::spawn(move || {
        for (offset, len) in ranges {
            let res = source.read_at(offset, len).map(|b| (offset, b));
            let failed = res.is_err();
            if tx.send(res).is_err() || failed {
                break;
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("data.bin");
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn test_sources_agree() {
        let dir = TempDir::new().unwrap();
        let path = sample(&dir);
        let sources: Vec<Arc<dyn ByteSource>> = vec![
            Arc::new(DiskSource::open(&path).unwrap()),
            Arc::new(MmapSource::open(&path).unwrap()),
            Arc::new(MemorySource::load(&path).unwrap()),
        ];
        for src in &sources {
            assert_eq!(src.size(), 1000, "{}", src.kind());
            assert_eq!(&src.read_at(254, 4).unwrap()[..], &[254, 255, 0, 1]);
            let err = src.read_at(998, 4).unwrap_err();
            assert!(
                matches!(err, TsspError::ShortRead { offset: 998, want: 4, got: 2 }),
                "{}",
                src.kind()
            );
        }
        assert_eq!(sources[2].memory_size(), 1000);
        assert_eq!(sources[0].memory_size(), 0);
    }

    #[test]
    fn test_stream_read_batch() {
        let dir = TempDir::new().unwrap();
        let path = sample(&dir);
        let src = open_source(&path, false).unwrap();

        let rx = stream_read_batch(src.clone(), vec![(0, 2), (500, 3), (999, 1)], 1);
        let got: Vec<(u64, Bytes)> = rx.iter().map(|r| r.unwrap()).collect();
        assert_eq!(got.len(), 3);
        assert_eq!(got[1].0, 500);
        assert_eq!(&got[2].1[..], &[(999 % 256) as u8]);

        let rx = stream_read_batch(src, vec![(0, 2), (990, 20), (0, 1)], 4);
        let results: Vec<_> = rx.iter().collect();
        assert_eq!(results.len(), 2);
        assert!(results[1].as_ref().unwrap_err().is_corruption());
    }
}
