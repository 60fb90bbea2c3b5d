//! Random-access storages
//!
//! Everything the XCI parser touches is a [`Storage`]: a sized blob that can
//! be read at arbitrary offsets. Storages are shared through [`SharedStorage`]
//! so that sub-storages can be cheap range-restricted views over the same
//! underlying file, the way the gamecard body is carved into partitions.

use crate::error::Error;
use crate::utils::{align_down, align_up};
use snafu::{Backtrace, GenerateImplicitData};
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Arc, Mutex};

pub trait Storage: Send + Sync {
    /// Fills `buf` with the bytes at `offset`. Reading past the end of the
    /// storage is an `UnexpectedEof` error.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    fn size(&self) -> io::Result<u64>;
}

pub type SharedStorage = Arc<dyn Storage>;

impl fmt::Debug for dyn Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.size() {
            Ok(size) => write!(f, "Storage({:#x} bytes)", size),
            Err(_) => f.write_str("Storage(?)"),
        }
    }
}

fn check_bounds(offset: u64, len: usize, size: u64) -> io::Result<()> {
    match offset.checked_add(len as u64) {
        Some(end) if end <= size => Ok(()),
        _ => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!(
                "read of {:#x} bytes at {:#x} is past the end of the storage ({:#x})",
                len, offset, size
            ),
        )),
    }
}

#[derive(Debug)]
pub struct FileStorage {
    file: Mutex<File>,
    size: u64,
}

impl FileStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<FileStorage, Error> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|err| (err, path))?;
        FileStorage::from_file(file).map_err(|err| (err, path).into())
    }

    pub fn from_file(file: File) -> io::Result<FileStorage> {
        let size = file.metadata()?.len();
        Ok(FileStorage {
            file: Mutex::new(file),
            size,
        })
    }
}

impl Storage for FileStorage {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        check_bounds(offset, buf.len(), self.size)?;
        let mut file = self
            .file
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "file storage lock poisoned"))?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.size)
    }
}

/// A storage backed by an in-memory buffer.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage(Vec<u8>);

impl MemoryStorage {
    pub fn new(data: Vec<u8>) -> MemoryStorage {
        MemoryStorage(data)
    }
}

impl From<Vec<u8>> for MemoryStorage {
    fn from(data: Vec<u8>) -> MemoryStorage {
        MemoryStorage(data)
    }
}

impl Storage for MemoryStorage {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        check_bounds(offset, buf.len(), self.0.len() as u64)?;
        let start = offset as usize;
        buf.copy_from_slice(&self.0[start..start + buf.len()]);
        Ok(())
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.0.len() as u64)
    }
}

/// A window of `size` bytes starting at `offset` in another storage.
pub struct SubStorage {
    inner: SharedStorage,
    offset: u64,
    size: u64,
}

impl SubStorage {
    pub fn new(inner: SharedStorage, offset: u64, size: u64) -> Result<SubStorage, Error> {
        let storage_size = inner.size()?;
        match offset.checked_add(size) {
            Some(end) if end <= storage_size => Ok(SubStorage {
                inner,
                offset,
                size,
            }),
            _ => Err(Error::OutOfRange {
                offset,
                size,
                storage_size,
                backtrace: Backtrace::generate(),
            }),
        }
    }

    /// The window from `offset` to the end of `inner`.
    pub fn from_offset(inner: SharedStorage, offset: u64) -> Result<SubStorage, Error> {
        let storage_size = inner.size()?;
        let size = storage_size.checked_sub(offset).ok_or_else(|| Error::OutOfRange {
            offset,
            size: 0,
            storage_size,
            backtrace: Backtrace::generate(),
        })?;
        SubStorage::new(inner, offset, size)
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl Storage for SubStorage {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        check_bounds(offset, buf.len(), self.size)?;
        self.inner.read_at(self.offset + offset, buf)
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.size)
    }
}

/// Rounds every read out to `alignment`-sized blocks of the inner storage.
///
/// Gamecard media can only be read in whole pages, so the root partition is
/// read through this adapter.
pub struct AlignmentMatchingStorage {
    inner: SharedStorage,
    alignment: u64,
}

impl AlignmentMatchingStorage {
    pub fn new(inner: SharedStorage, alignment: u64) -> AlignmentMatchingStorage {
        assert!(alignment.is_power_of_two(), "alignment must be a power of two");
        AlignmentMatchingStorage { inner, alignment }
    }
}

impl Storage for AlignmentMatchingStorage {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let size = self.inner.size()?;
        check_bounds(offset, buf.len(), size)?;
        if buf.is_empty() {
            return Ok(());
        }

        let aligned_start = align_down(offset, self.alignment);
        // The tail of an unaligned storage is read as a partial block.
        let aligned_end = align_up(offset + buf.len() as u64, self.alignment).min(size);
        if aligned_start == offset && aligned_end == offset + buf.len() as u64 {
            return self.inner.read_at(offset, buf);
        }

        let mut bulk = vec![0; (aligned_end - aligned_start) as usize];
        self.inner.read_at(aligned_start, &mut bulk)?;
        let skip = (offset - aligned_start) as usize;
        buf.copy_from_slice(&bulk[skip..skip + buf.len()]);
        Ok(())
    }

    fn size(&self) -> io::Result<u64> {
        self.inner.size()
    }
}

/// Sequential `Read + Seek` access to a storage, for use with `io::copy`
/// and friends.
pub struct StorageReader {
    storage: SharedStorage,
    pos: u64,
}

impl StorageReader {
    pub fn new(storage: SharedStorage) -> StorageReader {
        StorageReader { storage, pos: 0 }
    }
}

impl Read for StorageReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let size = self.storage.size()?;
        let remaining = size.saturating_sub(self.pos);
        let len = (buf.len() as u64).min(remaining) as usize;
        self.storage.read_at(self.pos, &mut buf[..len])?;
        self.pos += len as u64;
        Ok(len)
    }
}

impl Seek for StorageReader {
    fn seek(&mut self, from: SeekFrom) -> io::Result<u64> {
        let base = match from {
            SeekFrom::Start(val) => {
                self.pos = val;
                return Ok(self.pos);
            }
            SeekFrom::Current(val) => (self.pos, val),
            SeekFrom::End(val) => (self.storage.size()?, val),
        };
        let new_pos = if base.1 < 0 {
            base.0.checked_sub(base.1.unsigned_abs())
        } else {
            base.0.checked_add(base.1 as u64)
        };
        match new_pos {
            Some(pos) => {
                self.pos = pos;
                Ok(pos)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Seek before position 0",
            )),
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    /// Records every read made against a memory storage.
    pub(crate) struct RecordingStorage {
        pub(crate) inner: MemoryStorage,
        pub(crate) reads: Mutex<Vec<(u64, usize)>>,
    }

    impl RecordingStorage {
        pub(crate) fn new(data: Vec<u8>) -> RecordingStorage {
            RecordingStorage {
                inner: MemoryStorage::new(data),
                reads: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn reads(&self) -> Vec<(u64, usize)> {
            self.reads.lock().unwrap().clone()
        }
    }

    impl Storage for RecordingStorage {
        fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
            self.reads.lock().unwrap().push((offset, buf.len()));
            self.inner.read_at(offset, buf)
        }

        fn size(&self) -> io::Result<u64> {
            self.inner.size()
        }
    }

    fn counting(len: usize) -> Vec<u8> {
        (0..len).map(|i| i as u8).collect()
    }

    #[test]
    fn sub_storage_rejects_out_of_range_windows() {
        let base: SharedStorage = Arc::new(MemoryStorage::new(counting(0x100)));
        assert!(SubStorage::new(base.clone(), 0x80, 0x80).is_ok());
        assert!(matches!(
            SubStorage::new(base.clone(), 0x81, 0x80),
            Err(Error::OutOfRange { .. })
        ));
        assert!(matches!(
            SubStorage::from_offset(base, 0x101),
            Err(Error::OutOfRange { .. })
        ));
    }

    #[test]
    fn sub_storage_reads_are_relative() {
        let base: SharedStorage = Arc::new(MemoryStorage::new(counting(0x100)));
        let sub = SubStorage::new(base, 0x10, 0x20).unwrap();
        let mut buf = [0; 4];
        sub.read_at(2, &mut buf).unwrap();
        assert_eq!(buf, [0x12, 0x13, 0x14, 0x15]);
        assert!(sub.read_at(0x1E, &mut buf).is_err());
    }

    #[test]
    fn aligned_reads_hit_whole_blocks() {
        let recorder = Arc::new(RecordingStorage::new(counting(0x500)));
        let aligned = AlignmentMatchingStorage::new(recorder.clone(), 0x200);
        let mut buf = [0; 8];
        aligned.read_at(0x1FC, &mut buf).unwrap();
        assert_eq!(buf, [0xFC, 0xFD, 0xFE, 0xFF, 0x00, 0x01, 0x02, 0x03]);
        assert_eq!(recorder.reads(), vec![(0, 0x400)]);
    }

    #[test]
    fn aligned_reads_clamp_to_unaligned_tail() {
        let recorder = Arc::new(RecordingStorage::new(counting(0x210)));
        let aligned = AlignmentMatchingStorage::new(recorder.clone(), 0x200);
        let mut buf = [0; 4];
        aligned.read_at(0x20C, &mut buf).unwrap();
        assert_eq!(buf, [0x0C, 0x0D, 0x0E, 0x0F]);
        assert_eq!(recorder.reads(), vec![(0x200, 0x10)]);
    }

    #[test]
    fn reader_stops_at_end() {
        let base: SharedStorage = Arc::new(MemoryStorage::new(counting(10)));
        let mut reader = StorageReader::new(base);
        reader.seek(SeekFrom::Start(6)).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, vec![6, 7, 8, 9]);
        assert!(reader.seek(SeekFrom::Current(-11)).is_err());
    }
}
