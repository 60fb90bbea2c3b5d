//! Hashed partition filesystem (HFS0).
//!
//! The flat filesystem used for every partition of a gamecard. The header
//! is followed by a table of file entries, each carrying the SHA-256 of the
//! start of its file, then a string table with the file names and finally
//! the file data.
//!
//! ```text
//! 0x00  "HFS0"
//! 0x04  u32 file_count
//! 0x08  u32 string_table_size
//! 0x0C  u32 reserved
//! 0x10  file_count x 0x40 entries
//!       string table
//!       data
//! ```

use crate::error::Error;
use crate::impl_debug_deserialize_serialize_hexstring;
use crate::storage::{SharedStorage, StorageReader, SubStorage};
use crate::utils::align_up;
use byteorder::{ByteOrder, LE};
use serde_derive::Serialize;
use sha2::{Digest, Sha256};
use snafu::{Backtrace, GenerateImplicitData};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Component, Path};
use std::sync::Arc;

const HFS0_MAGIC: &[u8; 4] = b"HFS0";
const HEADER_SIZE: usize = 0x10;
const ENTRY_SIZE: usize = 0x40;

/// A SHA-256 digest.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Hash(pub [u8; 0x20]);

impl_debug_deserialize_serialize_hexstring!(Hash);

impl Hash {
    pub fn of(data: &[u8]) -> Hash {
        let mut hash = Hash::default();
        hash.0.copy_from_slice(&Sha256::digest(data));
        hash
    }
}

/// SHA-256 of the filesystem metadata, followed by the salt byte when
/// there is one.
pub fn metadata_hash(metadata: &[u8], salt: Option<u8>) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(metadata);
    if let Some(salt) = salt {
        hasher.update([salt]);
    }
    let mut hash = Hash::default();
    hash.0.copy_from_slice(&hasher.finalize());
    hash
}

#[derive(Debug, Clone, Serialize)]
pub struct Hfs0Entry {
    pub name: String,
    /// Offset of the file from the start of the data region.
    pub offset: u64,
    pub size: u64,
    /// How many bytes from the start of the file `hash` covers.
    pub hashed_size: u32,
    pub hash: Hash,
}

/// Return value of the [`DirectoryVisitor`] hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Walk {
    Continue,
    Stop,
}

/// Depth-first traversal of a filesystem.
pub trait DirectoryVisitor {
    fn enter_directory(&mut self, _path: &str) -> Walk {
        Walk::Continue
    }

    fn leave_directory(&mut self, _path: &str) -> Walk {
        Walk::Continue
    }

    fn visit_file(&mut self, dir: &str, entry: &Hfs0Entry) -> Walk;
}

pub struct Hfs0 {
    storage: SharedStorage,
    entries: Vec<Hfs0Entry>,
    data_offset: u64,
    header_hash: Hash,
}

impl std::fmt::Debug for Hfs0 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hfs0")
            .field("entries", &self.entries)
            .field("data_offset", &self.data_offset)
            .field("header_hash", &self.header_hash)
            .finish()
    }
}

impl Hfs0 {
    /// Parses the filesystem metadata at the start of `storage`.
    ///
    /// With an `expected_hash`, the metadata (salted with `salt`, if any)
    /// must hash to it.
    pub fn mount(storage: SharedStorage, expected_hash: Option<&Hash>, salt: Option<u8>) -> Result<Hfs0, Error> {
        let storage_size = storage.size()?;
        if storage_size < HEADER_SIZE as u64 {
            return Err(Error::invalid_hfs0("header is truncated"));
        }

        let mut header = [0; HEADER_SIZE];
        storage.read_at(0, &mut header)?;
        if &header[..4] != HFS0_MAGIC {
            return Err(Error::invalid_hfs0("magic is wrong"));
        }
        let file_count = LE::read_u32(&header[4..8]) as u64;
        let string_table_size = LE::read_u32(&header[8..12]) as u64;

        let string_table_offset = HEADER_SIZE as u64 + file_count * ENTRY_SIZE as u64;
        let data_offset = string_table_offset + string_table_size;
        if data_offset > storage_size {
            return Err(Error::invalid_hfs0("file table is truncated"));
        }

        let mut metadata = vec![0; data_offset as usize];
        storage.read_at(0, &mut metadata)?;

        let header_hash = metadata_hash(&metadata, salt);
        if let Some(expected) = expected_hash {
            if *expected != header_hash {
                return Err(Error::HashMismatch {
                    expected: expected.to_string(),
                    actual: header_hash.to_string(),
                    backtrace: Backtrace::generate(),
                });
            }
        }

        let string_table = &metadata[string_table_offset as usize..];
        let mut entries = Vec::with_capacity(file_count as usize);
        for raw in metadata[HEADER_SIZE..string_table_offset as usize].chunks_exact(ENTRY_SIZE) {
            let offset = LE::read_u64(&raw[0x00..0x08]);
            let size = LE::read_u64(&raw[0x08..0x10]);
            let name_offset = LE::read_u32(&raw[0x10..0x14]) as usize;
            let hashed_size = LE::read_u32(&raw[0x14..0x18]);
            let mut hash = Hash::default();
            hash.0.copy_from_slice(&raw[0x20..0x40]);

            let name = string_table
                .get(name_offset..)
                .ok_or_else(|| Error::invalid_hfs0("file name is outside of the string table"))?;
            let name_len = name
                .iter()
                .position(|&c| c == 0)
                .ok_or_else(|| Error::invalid_hfs0("file name is not terminated"))?;
            let name = String::from_utf8(name[..name_len].to_vec())?;

            match data_offset.checked_add(offset).and_then(|start| start.checked_add(size)) {
                Some(end) if end <= storage_size => (),
                _ => {
                    return Err(Error::OutOfRange {
                        offset: data_offset.saturating_add(offset),
                        size,
                        storage_size,
                        backtrace: Backtrace::generate(),
                    })
                }
            }

            entries.push(Hfs0Entry {
                name,
                offset,
                size,
                hashed_size,
                hash,
            });
        }

        tracing::debug!("Mounted HFS0 with {} files", entries.len());
        Ok(Hfs0 {
            storage,
            entries,
            data_offset,
            header_hash,
        })
    }

    pub fn entries(&self) -> &[Hfs0Entry] {
        &self.entries
    }

    /// Hash of the metadata as computed at mount time (salt included).
    pub fn header_hash(&self) -> &Hash {
        &self.header_hash
    }

    pub fn find(&self, name: &str) -> Option<&Hfs0Entry> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    pub fn open_entry(&self, entry: &Hfs0Entry) -> Result<SharedStorage, Error> {
        let storage = SubStorage::new(self.storage.clone(), self.data_offset + entry.offset, entry.size)?;
        Ok(Arc::new(storage))
    }

    pub fn open_file(&self, name: &str) -> Result<SharedStorage, Error> {
        let entry = self.find(name).ok_or_else(|| Error::MissingFile {
            name: name.to_string(),
            backtrace: Backtrace::generate(),
        })?;
        self.open_entry(entry)
    }

    /// Checks the hash of the hashed region of a file.
    pub fn verify_file(&self, entry: &Hfs0Entry) -> Result<(), Error> {
        let hashed_size = u64::from(entry.hashed_size).min(entry.size);
        let mut data = vec![0; hashed_size as usize];
        self.open_entry(entry)?.read_at(0, &mut data)?;
        let actual = Hash::of(&data);
        if actual != entry.hash {
            return Err(Error::HashMismatch {
                expected: entry.hash.to_string(),
                actual: actual.to_string(),
                backtrace: Backtrace::generate(),
            });
        }
        Ok(())
    }

    /// Walks the filesystem. HFS0 has no subdirectories, so this is the
    /// root followed by every file in table order.
    pub fn walk<V: DirectoryVisitor + ?Sized>(&self, visitor: &mut V) -> Walk {
        if visitor.enter_directory("/") == Walk::Stop {
            return Walk::Stop;
        }
        for entry in &self.entries {
            if visitor.visit_file("/", entry) == Walk::Stop {
                return Walk::Stop;
            }
        }
        visitor.leave_directory("/")
    }

    /// Writes every file to `dir`.
    ///
    /// Nothing is written unless every name is a single plain path
    /// component, so the files can't land outside of `dir`.
    pub fn extract_to(&self, dir: &Path) -> Result<(), Error> {
        if let Some(entry) = self.entries.iter().find(|entry| !is_plain_file_name(&entry.name)) {
            return Err(Error::UnsafeFileName {
                name: entry.name.clone(),
                backtrace: Backtrace::generate(),
            });
        }

        std::fs::create_dir_all(dir).map_err(|err| (err, dir))?;
        for entry in &self.entries {
            let path = dir.join(&entry.name);
            tracing::info!("Extracting {} ({:#x} bytes)", path.display(), entry.size);
            let mut reader = StorageReader::new(self.open_entry(entry)?);
            let mut file = File::create(&path).map_err(|err| (err, &path))?;
            io::copy(&mut reader, &mut file).map_err(|err| (err, &path))?;
        }
        Ok(())
    }
}

fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Lays out an HFS0 image in memory.
#[doc(hidden)]
#[derive(Debug, Default, Clone)]
pub struct Hfs0Builder {
    files: Vec<(String, Vec<u8>)>,
}

/// A built HFS0 image.
#[doc(hidden)]
#[derive(Debug, Clone)]
pub struct Hfs0Image {
    pub data: Vec<u8>,
    pub metadata_size: usize,
}

impl Hfs0Image {
    pub fn header_hash(&self, salt: Option<u8>) -> Hash {
        metadata_hash(&self.data[..self.metadata_size], salt)
    }
}

impl Hfs0Builder {
    pub fn new() -> Hfs0Builder {
        Hfs0Builder::default()
    }

    pub fn add_file(&mut self, name: &str, data: &[u8]) -> &mut Hfs0Builder {
        self.files.push((name.to_string(), data.to_vec()));
        self
    }

    pub fn build(&self) -> Hfs0Image {
        let mut string_table = Vec::new();
        let mut name_offsets = Vec::with_capacity(self.files.len());
        for (name, _) in &self.files {
            name_offsets.push(string_table.len() as u32);
            string_table.extend_from_slice(name.as_bytes());
            string_table.push(0);
        }
        string_table.resize(align_up(string_table.len(), 0x20), 0);

        let mut data = Vec::new();
        data.extend_from_slice(HFS0_MAGIC);
        data.extend_from_slice(&(self.files.len() as u32).to_le_bytes());
        data.extend_from_slice(&(string_table.len() as u32).to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());

        let mut offset = 0u64;
        for ((_, contents), name_offset) in self.files.iter().zip(name_offsets) {
            data.extend_from_slice(&offset.to_le_bytes());
            data.extend_from_slice(&(contents.len() as u64).to_le_bytes());
            data.extend_from_slice(&name_offset.to_le_bytes());
            data.extend_from_slice(&(contents.len() as u32).to_le_bytes());
            data.extend_from_slice(&0u64.to_le_bytes());
            data.extend_from_slice(&Hash::of(contents).0);
            offset += contents.len() as u64;
        }
        data.extend_from_slice(&string_table);
        let metadata_size = data.len();

        for (_, contents) in &self.files {
            data.extend_from_slice(contents);
        }
        Hfs0Image { data, metadata_size }
    }
}

/// Reads a whole storage into memory.
pub fn read_all(storage: &SharedStorage) -> Result<Vec<u8>, Error> {
    let mut data = Vec::new();
    StorageReader::new(storage.clone()).read_to_end(&mut data)?;
    Ok(data)
}
