//! Gamecard images (XCI).
//!
//! An XCI is an optional 0x1000 byte key area followed by the card body.
//! The body starts with the card header, and holds a root HFS0 partition
//! whose entries are themselves HFS0 partitions (`update`, `logo`, `normal`
//! and `secure`).
//!
//! Opening an image is best effort. Only failing to read the fixed-position
//! structures is an error. Anything past that (an undecryptable header, a
//! partition that doesn't mount) is recorded in [`Xci::diagnostics`] and the
//! rest of the image is still processed.

mod crypto;
mod structures;

pub use self::crypto::{CardHeaderCipher, HeaderCrypto};
pub use self::structures::*;

use crate::diag::{Diagnostics, Warning};
use crate::error::Error;
use crate::format::hfs0::{DirectoryVisitor, Hfs0, Hfs0Entry, Walk};
use crate::storage::{AlignmentMatchingStorage, SharedStorage, SubStorage};
use serde_derive::Serialize;
use snafu::{Backtrace, GenerateImplicitData};
use std::fmt;
use std::sync::Arc;

pub const KEY_AREA_SIZE: u64 = 0x1000;
pub const ROOT_PARTITION_ALIGNMENT: u64 = 0x200;
pub const T1_CERTIFICATE_OFFSET: u64 = 0x7000;
const BODY_HEADER_SIZE: usize = 0x800;

/// Splits an image into its key area and body.
///
/// The key area is only assumed present when a card header with a valid
/// magic sits right after it. Images smaller than a key area are all body
/// and aren't read at all.
pub fn split_key_area(storage: &SharedStorage) -> Result<(Option<SharedStorage>, SharedStorage), Error> {
    let size = storage.size()?;
    if size >= KEY_AREA_SIZE {
        let mut header = [0; CardHeaderWithSignature::SIZE];
        storage.read_at(KEY_AREA_SIZE, &mut header)?;
        if CardHeaderWithSignature(header).has_valid_magic() {
            tracing::debug!("Found a key area");
            let key_area: SharedStorage = Arc::new(SubStorage::new(storage.clone(), 0, KEY_AREA_SIZE)?);
            let body: SharedStorage = Arc::new(SubStorage::from_offset(storage.clone(), KEY_AREA_SIZE)?);
            return Ok((Some(key_area), body));
        }
    }
    Ok((None, storage.clone()))
}

/// The partitions a gamecard root partition may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionKind {
    Update,
    Logo,
    Normal,
    Secure,
}

impl PartitionKind {
    pub const ALL: [PartitionKind; 4] = [
        PartitionKind::Update,
        PartitionKind::Logo,
        PartitionKind::Normal,
        PartitionKind::Secure,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PartitionKind::Update => "update",
            PartitionKind::Logo => "logo",
            PartitionKind::Normal => "normal",
            PartitionKind::Secure => "secure",
        }
    }

    /// Matches a root partition entry name. Case sensitive.
    pub fn from_name(name: &str) -> Option<PartitionKind> {
        PartitionKind::ALL.into_iter().find(|kind| kind.name() == name)
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for PartitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A partition storage, and its filesystem if it mounted.
#[derive(Debug, Default)]
pub struct Partition {
    pub storage: Option<SharedStorage>,
    pub fs: Option<Hfs0>,
}

impl Partition {
    pub fn is_mounted(&self) -> bool {
        self.fs.is_some()
    }
}

/// The fixed structures of a card.
#[derive(Debug)]
pub struct CardData {
    /// Present only when the image has a key area.
    pub initial_data: Option<CardInitialData>,
    pub header: Arc<CardHeaderWithSignature>,
    pub decrypted_header: Arc<CardHeaderWithSignature>,
    /// The header covered by the CA10 signature. Same allocation as
    /// `header` when the card has no such header.
    pub header_for_hash: Arc<CardHeaderWithSignature>,
    pub decrypted_header_for_hash: Arc<CardHeaderWithSignature>,
    pub ca10_certificate: Option<Ca10Certificate>,
    pub t1_certificate: T1Certificate,
}

pub struct Xci {
    storage: SharedStorage,
    key_area: Option<SharedStorage>,
    body: SharedStorage,
    body_size: u64,
    card_data: CardData,
    root_partition: Partition,
    partitions: [Partition; 4],
    diagnostics: Diagnostics,
}

/// Decrypts a copy of `header`, falling back to the raw bytes.
fn decrypt_header(
    header: &CardHeaderWithSignature,
    cipher: &dyn CardHeaderCipher,
    diags: &mut Diagnostics,
) -> CardHeaderWithSignature {
    let mut decrypted = header.clone();
    if let Err(error) = cipher.decrypt_card_header(&mut decrypted) {
        decrypted = header.clone();
        diags.push(Warning::HeaderNotDecrypted { error });
    }
    decrypted
}

struct PartitionCollector<'a> {
    root: &'a Hfs0,
    partitions: [Partition; 4],
    diags: &'a mut Diagnostics,
}

impl<'a> DirectoryVisitor for PartitionCollector<'a> {
    fn visit_file(&mut self, _dir: &str, entry: &Hfs0Entry) -> Walk {
        let kind = match PartitionKind::from_name(&entry.name) {
            Some(kind) => kind,
            None => {
                self.diags.push(Warning::UnrecognizedPartition {
                    name: entry.name.clone(),
                });
                return Walk::Continue;
            }
        };

        // A later entry with the same name replaces everything an earlier
        // one filled in, even when it fails to open or mount.
        let partition = &mut self.partitions[kind.index()];
        *partition = Partition::default();
        let storage = match self.root.open_entry(entry) {
            Ok(storage) => storage,
            Err(error) => {
                self.diags.push(Warning::PartitionOpen {
                    name: entry.name.clone(),
                    error,
                });
                return Walk::Continue;
            }
        };
        partition.storage = Some(storage.clone());
        match Hfs0::mount(storage, None, None) {
            Ok(fs) => {
                tracing::debug!("Mounted the {} partition", kind);
                partition.fs = Some(fs);
            }
            Err(error) => self.diags.push(Warning::PartitionMount {
                name: entry.name.clone(),
                error,
            }),
        }
        Walk::Continue
    }
}

impl Xci {
    /// Opens a gamecard image.
    ///
    /// Fails only if one of the fixed structures can't be read.
    pub fn open(storage: SharedStorage, cipher: &dyn CardHeaderCipher) -> Result<Xci, Error> {
        let mut diags = Diagnostics::new();

        let (key_area, body) = split_key_area(&storage)?;
        let body_size = body.size()?;

        let initial_data = match &key_area {
            Some(key_area) => {
                let mut data = [0; CardInitialData::SIZE];
                key_area.read_at(0, &mut data)?;
                Some(CardInitialData(data))
            }
            None => None,
        };

        let mut body_header = [0; BODY_HEADER_SIZE];
        body.read_at(0, &mut body_header)?;

        let header = Arc::new(CardHeaderWithSignature::from_bytes(&body_header[0x000..0x200]));
        let decrypted_header = Arc::new(decrypt_header(&header, cipher, &mut diags));

        let (header_for_hash, decrypted_header_for_hash, ca10_certificate) = if header.flags().has_header_sign2() {
            let header_for_hash = CardHeaderWithSignature::from_bytes(&body_header[0x200..0x400]);
            let decrypted_header_for_hash = decrypt_header(&header_for_hash, cipher, &mut diags);
            let mut ca10_certificate = [0; 0x400];
            ca10_certificate.copy_from_slice(&body_header[0x400..0x800]);
            (
                Arc::new(header_for_hash),
                Arc::new(decrypted_header_for_hash),
                Some(Ca10Certificate(ca10_certificate)),
            )
        } else {
            (header.clone(), decrypted_header.clone(), None)
        };

        let mut t1_certificate = [0; 0x200];
        body.read_at(T1_CERTIFICATE_OFFSET, &mut t1_certificate)?;

        let card_data = CardData {
            initial_data,
            header,
            decrypted_header,
            header_for_hash,
            decrypted_header_for_hash,
            ca10_certificate,
            t1_certificate: T1Certificate(t1_certificate),
        };

        let root_partition = Xci::mount_root_partition(&body, &card_data.decrypted_header, &mut diags);

        let mut partitions: [Partition; 4] = Default::default();
        if let Some(root) = &root_partition.fs {
            let mut collector = PartitionCollector {
                root,
                partitions,
                diags: &mut diags,
            };
            root.walk(&mut collector);
            partitions = collector.partitions;
        }

        Ok(Xci {
            storage,
            key_area,
            body,
            body_size,
            card_data,
            root_partition,
            partitions,
            diagnostics: diags,
        })
    }

    fn mount_root_partition(
        body: &SharedStorage,
        header: &CardHeaderWithSignature,
        diags: &mut Diagnostics,
    ) -> Partition {
        let aligned: SharedStorage = Arc::new(AlignmentMatchingStorage::new(body.clone(), ROOT_PARTITION_ALIGNMENT));
        let storage: SharedStorage = match SubStorage::from_offset(aligned, header.partition_fs_header_address()) {
            Ok(storage) => Arc::new(storage),
            Err(error) => {
                diags.push(Warning::RootPartitionMount { error });
                return Partition::default();
            }
        };

        let expected_hash = header.partition_fs_header_hash();
        let salt = header.card_info().partition_hash_salt();
        let fs = match Hfs0::mount(storage.clone(), Some(&expected_hash), salt) {
            Ok(fs) => Some(fs),
            Err(error) => {
                diags.push(Warning::RootPartitionMount { error });
                None
            }
        };
        Partition {
            storage: Some(storage),
            fs,
        }
    }

    pub fn storage(&self) -> &SharedStorage {
        &self.storage
    }

    pub fn key_area(&self) -> Option<&SharedStorage> {
        self.key_area.as_ref()
    }

    pub fn body(&self) -> &SharedStorage {
        &self.body
    }

    pub fn card_data(&self) -> &CardData {
        &self.card_data
    }

    pub fn root_partition(&self) -> &Partition {
        &self.root_partition
    }

    pub fn partition(&self, kind: PartitionKind) -> &Partition {
        &self.partitions[kind.index()]
    }

    /// The filesystem of a partition, failing if it is absent or didn't
    /// mount.
    pub fn mounted_partition(&self, kind: PartitionKind) -> Result<&Hfs0, Error> {
        self.partition(kind)
            .fs
            .as_ref()
            .ok_or_else(|| Error::PartitionNotMounted {
                name: kind.name().to_string(),
                backtrace: Backtrace::generate(),
            })
    }

    /// Everything that went wrong while opening the image.
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn info(&self) -> XciInfo {
        let partition_info = |name: &str, partition: &Partition| PartitionInfo {
            name: name.to_string(),
            size: partition.storage.as_ref().and_then(|storage| storage.size().ok()),
            mounted: partition.is_mounted(),
            files: partition
                .fs
                .as_ref()
                .map(|fs| fs.entries().to_vec())
                .unwrap_or_default(),
        };

        let mut partitions = vec![partition_info("root", &self.root_partition)];
        partitions.extend(
            PartitionKind::ALL
                .iter()
                .map(|kind| partition_info(kind.name(), self.partition(*kind))),
        );

        XciInfo {
            has_key_area: self.key_area.is_some(),
            body_size: self.body_size,
            initial_data: self.card_data.initial_data.as_ref().map(InitialDataInfo::from),
            header: CardHeaderInfo::from(&*self.card_data.decrypted_header),
            has_ca10_certificate: self.card_data.ca10_certificate.is_some(),
            partitions,
            warnings: self.diagnostics.iter().map(|warning| warning.to_string()).collect(),
        }
    }
}

/// Summary of an opened image.
#[derive(Debug, Serialize)]
pub struct XciInfo {
    pub has_key_area: bool,
    pub body_size: u64,
    pub initial_data: Option<InitialDataInfo>,
    pub header: CardHeaderInfo,
    pub has_ca10_certificate: bool,
    pub partitions: Vec<PartitionInfo>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct PartitionInfo {
    pub name: String,
    pub size: Option<u64>,
    pub mounted: bool,
    pub files: Vec<Hfs0Entry>,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::test::RecordingStorage;
    use crate::storage::MemoryStorage;

    #[test]
    fn small_images_are_all_body() {
        let recorder = Arc::new(RecordingStorage::new(vec![0; 0xFFF]));
        let (key_area, body) = split_key_area(&(recorder.clone() as SharedStorage)).unwrap();
        assert!(key_area.is_none());
        assert_eq!(body.size().unwrap(), 0xFFF);
        assert!(recorder.reads().is_empty());
    }

    #[test]
    fn magic_after_key_area_splits_the_image() {
        let mut data = vec![0; 0x1400];
        data[0x1100..0x1104].copy_from_slice(b"HEAD");
        let storage: SharedStorage = Arc::new(MemoryStorage::new(data));
        let (key_area, body) = split_key_area(&storage).unwrap();
        assert_eq!(key_area.unwrap().size().unwrap(), 0x1000);
        assert_eq!(body.size().unwrap(), 0x400);
    }

    #[test]
    fn magic_is_the_only_criterion() {
        let mut data = vec![0; 0x1400];
        data[0x1100..0x1104].copy_from_slice(b"HEAD");
        data[0x110F] = 0x80;
        for byte in 0x1100..0x1104 {
            let mut data = data.clone();
            data[byte] ^= 0x20;
            let storage: SharedStorage = Arc::new(MemoryStorage::new(data));
            let (key_area, body) = split_key_area(&storage).unwrap();
            assert!(key_area.is_none());
            assert_eq!(body.size().unwrap(), 0x1400);
        }
    }

    #[test]
    fn partition_names_match_exactly() {
        assert_eq!(PartitionKind::from_name("secure"), Some(PartitionKind::Secure));
        assert_eq!(PartitionKind::from_name("Secure"), None);
        assert_eq!(PartitionKind::from_name("secure "), None);
        assert_eq!(PartitionKind::from_name("/secure"), None);
    }
}
