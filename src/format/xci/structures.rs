//! On-disk gamecard structures.
//!
//! Everything is kept as raw bytes, with little-endian accessors for the
//! fields. The header is decrypted in place, so the raw and decrypted copies
//! share one type.

use crate::format::hfs0::Hash;
use crate::impl_debug_deserialize_serialize_hexstring;
use crate::utils::Hexstring;
use bit_field::BitField;
use byteorder::{ByteOrder, LE};
use serde_derive::Serialize;

/// `"HEAD"`, little endian.
pub const CARD_HEADER_MAGIC: u32 = 0x4441_4548;

/// Offset of the header proper within [`CardHeaderWithSignature`].
const HEADER_OFFSET: usize = 0x100;
pub(crate) const ENCRYPTED_DATA_OFFSET: usize = HEADER_OFFSET + 0x90;
pub(crate) const ENCRYPTED_DATA_SIZE: usize = 0x70;

#[derive(Clone, PartialEq, Eq)]
pub struct CardHeaderWithSignature(pub [u8; 0x200]);
#[derive(Clone, PartialEq, Eq)]
pub struct Ca10Certificate(pub [u8; 0x400]);
#[derive(Clone, PartialEq, Eq)]
pub struct T1Certificate(pub [u8; 0x200]);
#[derive(Clone, PartialEq, Eq)]
pub struct CardInitialData(pub [u8; 0x200]);

impl_debug_deserialize_serialize_hexstring!(CardHeaderWithSignature);
impl_debug_deserialize_serialize_hexstring!(Ca10Certificate);
impl_debug_deserialize_serialize_hexstring!(T1Certificate);
impl_debug_deserialize_serialize_hexstring!(CardInitialData);

impl CardHeaderWithSignature {
    pub const SIZE: usize = 0x200;

    pub fn from_bytes(bytes: &[u8]) -> CardHeaderWithSignature {
        let mut header = [0; 0x200];
        header.copy_from_slice(&bytes[..0x200]);
        CardHeaderWithSignature(header)
    }

    fn field(&self, offset: usize, len: usize) -> &[u8] {
        &self.0[HEADER_OFFSET + offset..HEADER_OFFSET + offset + len]
    }

    pub fn signature(&self) -> &[u8] {
        &self.0[..HEADER_OFFSET]
    }

    pub fn magic(&self) -> u32 {
        LE::read_u32(self.field(0x00, 4))
    }

    pub fn has_valid_magic(&self) -> bool {
        self.magic() == CARD_HEADER_MAGIC
    }

    pub fn rom_area_start_page(&self) -> u32 {
        LE::read_u32(self.field(0x04, 4))
    }

    pub fn backup_area_start_page(&self) -> u32 {
        LE::read_u32(self.field(0x08, 4))
    }

    /// Index of the key used to decrypt the title key area (low nibble) and
    /// of the key encryption key (high nibble).
    pub fn key_index(&self) -> u8 {
        self.0[HEADER_OFFSET + 0x0C]
    }

    pub fn rom_size(&self) -> RomSize {
        RomSize::from(self.0[HEADER_OFFSET + 0x0D])
    }

    pub fn version(&self) -> u8 {
        self.0[HEADER_OFFSET + 0x0E]
    }

    pub fn flags(&self) -> CardFlags {
        CardFlags(self.0[HEADER_OFFSET + 0x0F])
    }

    pub fn package_id(&self) -> u64 {
        LE::read_u64(self.field(0x10, 8))
    }

    pub fn valid_data_end_page(&self) -> u32 {
        LE::read_u32(self.field(0x18, 4))
    }

    pub fn iv(&self) -> [u8; 0x10] {
        let mut iv = [0; 0x10];
        iv.copy_from_slice(self.field(0x20, 0x10));
        iv
    }

    pub fn partition_fs_header_address(&self) -> u64 {
        LE::read_u64(self.field(0x30, 8))
    }

    pub fn partition_fs_header_size(&self) -> u64 {
        LE::read_u64(self.field(0x38, 8))
    }

    pub fn partition_fs_header_hash(&self) -> Hash {
        let mut hash = Hash::default();
        hash.0.copy_from_slice(self.field(0x40, 0x20));
        hash
    }

    pub fn initial_data_hash(&self) -> Hash {
        let mut hash = Hash::default();
        hash.0.copy_from_slice(self.field(0x60, 0x20));
        hash
    }

    pub fn sel_sec(&self) -> u32 {
        LE::read_u32(self.field(0x80, 4))
    }

    pub fn sel_t1_key(&self) -> u32 {
        LE::read_u32(self.field(0x84, 4))
    }

    pub fn sel_key(&self) -> u32 {
        LE::read_u32(self.field(0x88, 4))
    }

    pub fn lim_area(&self) -> u32 {
        LE::read_u32(self.field(0x8C, 4))
    }

    pub fn encrypted_data(&self) -> &[u8] {
        &self.0[ENCRYPTED_DATA_OFFSET..ENCRYPTED_DATA_OFFSET + ENCRYPTED_DATA_SIZE]
    }

    pub fn encrypted_data_mut(&mut self) -> &mut [u8] {
        &mut self.0[ENCRYPTED_DATA_OFFSET..ENCRYPTED_DATA_OFFSET + ENCRYPTED_DATA_SIZE]
    }

    /// Typed view of the encrypted region. Only meaningful on a decrypted
    /// header.
    pub fn card_info(&self) -> CardInfo {
        CardInfo::parse(self.encrypted_data())
    }
}

/// Header flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CardFlags(pub u8);

impl CardFlags {
    pub fn auto_boot(&self) -> bool {
        self.0.get_bit(0)
    }

    pub fn history_erase(&self) -> bool {
        self.0.get_bit(1)
    }

    pub fn repair_tool(&self) -> bool {
        self.0.get_bit(2)
    }

    pub fn different_region_cup_to_terra_device(&self) -> bool {
        self.0.get_bit(3)
    }

    pub fn different_region_cup_to_global_device(&self) -> bool {
        self.0.get_bit(4)
    }

    /// The body carries a second header, signed with the CA10 certificate.
    pub fn has_header_sign2(&self) -> bool {
        self.0.get_bit(7)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RomSize {
    #[serde(rename = "1GB")]
    Size1GB,
    #[serde(rename = "2GB")]
    Size2GB,
    #[serde(rename = "4GB")]
    Size4GB,
    #[serde(rename = "8GB")]
    Size8GB,
    #[serde(rename = "16GB")]
    Size16GB,
    #[serde(rename = "32GB")]
    Size32GB,
    Unknown(u8),
}

impl From<u8> for RomSize {
    fn from(value: u8) -> RomSize {
        match value {
            0xFA => RomSize::Size1GB,
            0xF8 => RomSize::Size2GB,
            0xF0 => RomSize::Size4GB,
            0xE0 => RomSize::Size8GB,
            0xE1 => RomSize::Size16GB,
            0xE2 => RomSize::Size32GB,
            other => RomSize::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CompatibilityType {
    Normal,
    Terra,
    Unknown(u8),
}

impl From<u8> for CompatibilityType {
    fn from(value: u8) -> CompatibilityType {
        match value {
            0 => CompatibilityType::Normal,
            1 => CompatibilityType::Terra,
            other => CompatibilityType::Unknown(other),
        }
    }
}

/// Contents of the encrypted region of the card header.
#[derive(Debug, Clone, Serialize)]
pub struct CardInfo {
    pub firmware_version: u64,
    pub access_control: u32,
    pub read_wait_time: u32,
    pub read_wait_time2: u32,
    pub write_wait_time: u32,
    pub write_wait_time2: u32,
    pub firmware_mode: u32,
    /// Version of the system update bundled on the card.
    pub upp_version: u32,
    pub compatibility_type: u8,
    pub upp_hash: u64,
    pub upp_id: u64,
}

impl CardInfo {
    fn parse(data: &[u8]) -> CardInfo {
        CardInfo {
            firmware_version: LE::read_u64(&data[0x00..]),
            access_control: LE::read_u32(&data[0x08..]),
            read_wait_time: LE::read_u32(&data[0x0C..]),
            read_wait_time2: LE::read_u32(&data[0x10..]),
            write_wait_time: LE::read_u32(&data[0x14..]),
            write_wait_time2: LE::read_u32(&data[0x18..]),
            firmware_mode: LE::read_u32(&data[0x1C..]),
            upp_version: LE::read_u32(&data[0x20..]),
            compatibility_type: data[0x24],
            upp_hash: LE::read_u64(&data[0x28..]),
            upp_id: LE::read_u64(&data[0x30..]),
        }
    }

    pub fn compatibility(&self) -> CompatibilityType {
        CompatibilityType::from(self.compatibility_type)
    }

    /// Salt of the root partition hash. Normal cards have none.
    pub fn partition_hash_salt(&self) -> Option<u8> {
        match self.compatibility() {
            CompatibilityType::Normal => None,
            _ => Some(self.compatibility_type),
        }
    }
}

impl CardInitialData {
    pub const SIZE: usize = 0x200;

    pub fn package_id(&self) -> u64 {
        LE::read_u64(&self.0[0x00..0x08])
    }

    pub fn auth_data(&self) -> &[u8] {
        &self.0[0x10..0x20]
    }

    pub fn auth_mac(&self) -> &[u8] {
        &self.0[0x20..0x30]
    }

    pub fn auth_nonce(&self) -> &[u8] {
        &self.0[0x30..0x3C]
    }
}

/// Printable summary of [`CardInitialData`].
#[derive(Debug, Clone, Serialize)]
pub struct InitialDataInfo {
    pub package_id: String,
    pub auth_data: String,
    pub auth_mac: String,
    pub auth_nonce: String,
}

impl From<&CardInitialData> for InitialDataInfo {
    fn from(data: &CardInitialData) -> InitialDataInfo {
        InitialDataInfo {
            package_id: format!("{:016x}", data.package_id()),
            auth_data: Hexstring(data.auth_data()).to_string(),
            auth_mac: Hexstring(data.auth_mac()).to_string(),
            auth_nonce: Hexstring(data.auth_nonce()).to_string(),
        }
    }
}

/// Printable summary of a card header.
#[derive(Debug, Clone, Serialize)]
pub struct CardHeaderInfo {
    pub magic_valid: bool,
    pub rom_area_start_page: u32,
    pub backup_area_start_page: u32,
    pub key_index: u8,
    pub rom_size: RomSize,
    pub version: u8,
    pub flags: CardFlags,
    pub has_header_sign2: bool,
    pub package_id: String,
    pub valid_data_end_page: u32,
    pub partition_fs_header_address: u64,
    pub partition_fs_header_size: u64,
    pub partition_fs_header_hash: Hash,
    pub initial_data_hash: Hash,
    pub sel_sec: u32,
    pub sel_t1_key: u32,
    pub sel_key: u32,
    pub lim_area: u32,
    pub card_info: CardInfo,
}

impl From<&CardHeaderWithSignature> for CardHeaderInfo {
    fn from(header: &CardHeaderWithSignature) -> CardHeaderInfo {
        CardHeaderInfo {
            magic_valid: header.has_valid_magic(),
            rom_area_start_page: header.rom_area_start_page(),
            backup_area_start_page: header.backup_area_start_page(),
            key_index: header.key_index(),
            rom_size: header.rom_size(),
            version: header.version(),
            flags: header.flags(),
            has_header_sign2: header.flags().has_header_sign2(),
            package_id: format!("{:016x}", header.package_id()),
            valid_data_end_page: header.valid_data_end_page(),
            partition_fs_header_address: header.partition_fs_header_address(),
            partition_fs_header_size: header.partition_fs_header_size(),
            partition_fs_header_hash: header.partition_fs_header_hash(),
            initial_data_hash: header.initial_data_hash(),
            sel_sec: header.sel_sec(),
            sel_t1_key: header.sel_t1_key(),
            sel_key: header.sel_key(),
            lim_area: header.lim_area(),
            card_info: header.card_info(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_fields_are_little_endian() {
        let mut raw = [0; 0x200];
        raw[0x100..0x104].copy_from_slice(b"HEAD");
        raw[0x10D] = 0xE0;
        raw[0x10F] = 0x80;
        raw[0x130..0x138].copy_from_slice(&0x1234_5678u64.to_le_bytes());
        raw[0x190 + 0x24] = 1;
        raw[0x190 + 0x20..0x190 + 0x24].copy_from_slice(&0x0C00u32.to_le_bytes());
        let header = CardHeaderWithSignature(raw);

        assert!(header.has_valid_magic());
        assert_eq!(header.rom_size(), RomSize::Size8GB);
        assert!(header.flags().has_header_sign2());
        assert!(!header.flags().auto_boot());
        assert_eq!(header.partition_fs_header_address(), 0x1234_5678);

        let info = header.card_info();
        assert_eq!(info.upp_version, 0x0C00);
        assert_eq!(info.compatibility(), CompatibilityType::Terra);
        assert_eq!(info.partition_hash_salt(), Some(1));
    }

    #[test]
    fn normal_cards_have_no_salt() {
        let header = CardHeaderWithSignature([0; 0x200]);
        assert!(!header.has_valid_magic());
        assert_eq!(header.card_info().partition_hash_salt(), None);
    }

    #[test]
    fn initial_data_fields() {
        let mut raw = [0; 0x200];
        raw[..8].copy_from_slice(&0xAABBu64.to_le_bytes());
        raw[0x30..0x3C].copy_from_slice(&[0x11; 0xC]);
        let data = CardInitialData(raw);
        assert_eq!(data.package_id(), 0xAABB);
        assert_eq!(data.auth_nonce(), &[0x11; 0xC][..]);
        assert_eq!(InitialDataInfo::from(&data).package_id, "000000000000aabb");
    }
}
