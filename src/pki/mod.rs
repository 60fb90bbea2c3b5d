//! Console key material.
//!
//! [`Keys`] holds every secret the gamecard pipeline knows about, by name.
//! A slot is all-zero until something fills it, either a key file through
//! [`Keys::ingest`] or the derivation cascade in [`Keys::derive_keys`].

mod derive;
pub mod names;

pub use self::derive::generate_kek;
pub use self::names::{CatalogEntry, Shape, UnknownKeyName};

use crate::diag::{Diagnostics, Warning};
use crate::error::Error;
use crate::impl_debug_deserialize_serialize_hexstring;
use crate::utils::{decode_hex_lossy, is_hexstring, is_zero};
use aes::Aes128;
use cipher::generic_array::GenericArray;
use cipher::{BlockDecrypt, BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use cmac::{Cmac, Mac};
use snafu::{Backtrace, GenerateImplicitData};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Aes128Key([u8; 0x10]);
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct AesXtsKey([u8; 0x20]);
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedKeyblob([u8; 0xB0]);
#[derive(Clone, PartialEq, Eq)]
pub struct Keyblob([u8; 0x90]);
#[derive(Clone, PartialEq, Eq)]
pub struct Modulus([u8; 0x100]);
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RightsId([u8; 0x10]);
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct TitleKey([u8; 0x10]);

impl_debug_deserialize_serialize_hexstring!(Aes128Key);
impl_debug_deserialize_serialize_hexstring!(AesXtsKey);
impl_debug_deserialize_serialize_hexstring!(EncryptedKeyblob);
impl_debug_deserialize_serialize_hexstring!(Keyblob);
impl_debug_deserialize_serialize_hexstring!(Modulus);
impl_debug_deserialize_serialize_hexstring!(RightsId);
impl_debug_deserialize_serialize_hexstring!(TitleKey);

macro_rules! impl_key_bytes {
    ($($ty:ident: $size:expr),* $(,)?) => {
        $(
            impl $ty {
                pub const SIZE: usize = $size;

                pub fn as_bytes(&self) -> &[u8] {
                    &self.0
                }

                pub fn as_bytes_mut(&mut self) -> &mut [u8] {
                    &mut self.0
                }

                pub fn is_set(&self) -> bool {
                    !is_zero(&self.0)
                }
            }

            impl From<[u8; $size]> for $ty {
                fn from(bytes: [u8; $size]) -> $ty {
                    $ty(bytes)
                }
            }
        )*
    };
}

impl_key_bytes! {
    Aes128Key: 0x10,
    AesXtsKey: 0x20,
    EncryptedKeyblob: 0xB0,
    Keyblob: 0x90,
    Modulus: 0x100,
    RightsId: 0x10,
    TitleKey: 0x10,
}

impl Default for EncryptedKeyblob {
    fn default() -> EncryptedKeyblob {
        EncryptedKeyblob([0; 0xB0])
    }
}

impl Default for Keyblob {
    fn default() -> Keyblob {
        Keyblob([0; 0x90])
    }
}

impl Default for Modulus {
    fn default() -> Modulus {
        Modulus([0; 0x100])
    }
}

impl EncryptedKeyblob {
    /// Checks the CMAC of the keyblob and decrypts its payload.
    pub fn decrypt(
        &self,
        key: &Aes128Key,
        mac_key: &Aes128Key,
        keyblob_id: usize,
    ) -> Result<Keyblob, Error> {
        let mut keyblob = [0; 0x90];
        keyblob.copy_from_slice(&self.0[0x20..]);

        let mut cmac = <Cmac<Aes128> as Mac>::new(GenericArray::from_slice(&mac_key.0));
        cmac.update(&self.0[0x10..]);
        cmac.verify_slice(&self.0[..0x10])
            .map_err(|err| (keyblob_id, err))?;

        let mut crypter = Aes128Ctr::new(
            GenericArray::from_slice(&key.0),
            GenericArray::from_slice(&self.0[0x10..0x20]),
        );
        crypter.apply_keystream(&mut keyblob);

        Ok(Keyblob(keyblob))
    }
}

impl Keyblob {
    #[cfg(test)]
    pub(crate) fn encrypt(&self, key: &Aes128Key, mac_key: &Aes128Key, ctr: &[u8; 0x10]) -> EncryptedKeyblob {
        let mut encrypted_keyblob = [0; 0xB0];
        encrypted_keyblob[0x10..0x20].copy_from_slice(ctr);
        encrypted_keyblob[0x20..].copy_from_slice(&self.0);

        let mut crypter = Aes128Ctr::new(GenericArray::from_slice(&key.0), GenericArray::from_slice(ctr));
        crypter.apply_keystream(&mut encrypted_keyblob[0x20..]);

        let mut cmac = <Cmac<Aes128> as Mac>::new(GenericArray::from_slice(&mac_key.0));
        cmac.update(&encrypted_keyblob[0x10..]);
        encrypted_keyblob[..0x10].copy_from_slice(&cmac.finalize().into_bytes());
        EncryptedKeyblob(encrypted_keyblob)
    }

    pub fn master_kek(&self) -> Aes128Key {
        let mut key = [0; 0x10];
        key.copy_from_slice(&self.0[0x00..0x10]);
        Aes128Key(key)
    }

    pub fn package1_key(&self) -> Aes128Key {
        let mut key = [0; 0x10];
        key.copy_from_slice(&self.0[0x80..0x90]);
        Aes128Key(key)
    }
}

impl Aes128Key {
    /// Unwraps `source` with this key (single-block ECB decrypt).
    pub fn derive_key(&self, source: &[u8; 0x10]) -> Aes128Key {
        let mut newkey = *source;

        let crypter = Aes128::new(GenericArray::from_slice(&self.0));
        crypter.decrypt_block(GenericArray::from_mut_slice(&mut newkey));

        Aes128Key(newkey)
    }

    pub fn encrypt_key(&self, source: &[u8; 0x10]) -> Aes128Key {
        let mut newkey = *source;

        let crypter = Aes128::new(GenericArray::from_slice(&self.0));
        crypter.encrypt_block(GenericArray::from_mut_slice(&mut newkey));

        Aes128Key(newkey)
    }

    pub fn derive_xts_key(&self, source: &[u8; 0x20]) -> AesXtsKey {
        let mut newkey = *source;

        let crypter = Aes128::new(GenericArray::from_slice(&self.0));
        crypter.decrypt_block(GenericArray::from_mut_slice(&mut newkey[0x00..0x10]));
        crypter.decrypt_block(GenericArray::from_mut_slice(&mut newkey[0x10..0x20]));

        AesXtsKey(newkey)
    }

    /// The key itself, or `None` when it was never filled in.
    pub fn nonzero(&self) -> Option<&Aes128Key> {
        if self.is_set() {
            Some(self)
        } else {
            None
        }
    }

    pub(crate) fn bytes(&self) -> &[u8; 0x10] {
        &self.0
    }
}

impl AesXtsKey {
    pub fn nonzero(&self) -> Option<&AesXtsKey> {
        if self.is_set() {
            Some(self)
        } else {
            None
        }
    }

    pub(crate) fn bytes(&self) -> &[u8; 0x20] {
        &self.0
    }
}

/// Declares the key catalog.
///
/// Every entry becomes a field of [`Keys`], a [`KeyName`] variant and a
/// catalog entry used to parse key file names.
macro_rules! key_set {
    (
        scalars {
            $( $(#[$smeta:meta])* $sfield:ident: $sty:ident => $svariant:ident, )*
        }
        generational {
            $( $(#[$gmeta:meta])* $gfield:ident: [$gty:ident; $glen:expr]
                => $gvariant:ident($gname:literal, $gstart:literal..$gend:literal), )*
        }
    ) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum KeyName {
            $( $svariant, )*
            $( $gvariant(u8), )*
        }

        impl KeyName {
            pub fn base_name(&self) -> &'static str {
                match self {
                    $( KeyName::$svariant => stringify!($sfield), )*
                    $( KeyName::$gvariant(_) => $gname, )*
                }
            }

            pub fn generation(&self) -> Option<u8> {
                match *self {
                    $( KeyName::$gvariant(gen) => Some(gen), )*
                    _ => None,
                }
            }

            /// Whether the name is part of the catalog. Generational names
            /// are only valid within their base's generation range.
            pub fn is_known(&self) -> bool {
                match *self {
                    $( KeyName::$gvariant(gen) => ($gstart..$gend).contains(&gen), )*
                    _ => true,
                }
            }

            pub fn catalog() -> &'static [CatalogEntry] {
                static KEY_CATALOG: &[CatalogEntry] = &[
                    $( CatalogEntry {
                        name: stringify!($sfield),
                        shape: Shape::Scalar(KeyName::$svariant),
                    }, )*
                    $( CatalogEntry {
                        name: $gname,
                        shape: Shape::Generational {
                            generations: $gstart..$gend,
                            make: KeyName::$gvariant,
                        },
                    }, )*
                ];
                KEY_CATALOG
            }
        }

        #[derive(Debug, Default, Clone, PartialEq, Eq)]
        pub struct Keys {
            $( $(#[$smeta])* $sfield: $sty, )*
            $( $(#[$gmeta])* $gfield: [$gty; $glen], )*
        }

        impl Keys {
            $(
                pub fn $sfield(&self) -> &$sty {
                    &self.$sfield
                }
            )*
            $(
                pub fn $gfield(&self) -> &[$gty; $glen] {
                    &self.$gfield
                }
            )*

            fn slot(&self, name: KeyName) -> Option<&[u8]> {
                if !name.is_known() {
                    return None;
                }
                match name {
                    $( KeyName::$svariant => Some(self.$sfield.as_bytes()), )*
                    $( KeyName::$gvariant(gen) => {
                        self.$gfield.get(usize::from(gen)).map(|key| key.as_bytes())
                    } )*
                }
            }

            fn slot_mut(&mut self, name: KeyName) -> Option<&mut [u8]> {
                if !name.is_known() {
                    return None;
                }
                match name {
                    $( KeyName::$svariant => Some(self.$sfield.as_bytes_mut()), )*
                    $( KeyName::$gvariant(gen) => {
                        self.$gfield.get_mut(usize::from(gen)).map(|key| key.as_bytes_mut())
                    } )*
                }
            }
        }
    };
}

key_set! {
    scalars {
        secure_boot_key: Aes128Key => SecureBootKey,
        tsec_key: Aes128Key => TsecKey,
        /// Per-console key, unwrapped from `per_console_key_source` with the
        /// first keyblob key.
        device_key: Aes128Key => DeviceKey,
        keyblob_mac_key_source: Aes128Key => KeyblobMacKeySource,
        per_console_key_source: Aes128Key => PerConsoleKeySource,
        master_key_source: Aes128Key => MasterKeySource,
        mariko_kek: Aes128Key => MarikoKek,
        mariko_bek: Aes128Key => MarikoBek,
        /// TSEC root key encryption key, used for 6.2.0+ firmware.
        tsec_root_kek: Aes128Key => TsecRootKek,
        package1_mac_kek: Aes128Key => Package1MacKek,
        package1_kek: Aes128Key => Package1Kek,
        aes_kek_generation_source: Aes128Key => AesKekGenerationSource,
        aes_key_generation_source: Aes128Key => AesKeyGenerationSource,
        key_area_key_application_source: Aes128Key => KeyAreaKeyApplicationSource,
        key_area_key_ocean_source: Aes128Key => KeyAreaKeyOceanSource,
        key_area_key_system_source: Aes128Key => KeyAreaKeySystemSource,
        titlekek_source: Aes128Key => TitlekekSource,
        header_kek_source: Aes128Key => HeaderKekSource,
        header_key_source: AesXtsKey => HeaderKeySource,
        /// NCA header key.
        header_key: AesXtsKey => HeaderKey,
        package2_key_source: Aes128Key => Package2KeySource,
        /// Gamecard header key. Decrypts the encrypted region of the XCI
        /// header.
        xci_header_key: Aes128Key => XciHeaderKey,
        sd_card_kek_source: Aes128Key => SdCardKekSource,
        sd_card_nca_key_source: AesXtsKey => SdCardNcaKeySource,
        sd_card_save_key_source: AesXtsKey => SdCardSaveKeySource,
        save_mac_kek_source: Aes128Key => SaveMacKekSource,
        save_mac_key_source: Aes128Key => SaveMacKeySource,
        save_mac_key: Aes128Key => SaveMacKey,
        sd_card_nca_key: AesXtsKey => SdCardNcaKey,
        sd_card_save_key: AesXtsKey => SdCardSaveKey,
        nca_hdr_fixed_key_modulus: Modulus => NcaHdrFixedKeyModulus,
        acid_fixed_key_modulus: Modulus => AcidFixedKeyModulus,
        package2_fixed_key_modulus: Modulus => Package2FixedKeyModulus,
    }
    generational {
        keyblob_key_sources: [Aes128Key; 0x06]
            => KeyblobKeySource("keyblob_key_source", 0x00..0x06),
        keyblob_keys: [Aes128Key; 0x06] => KeyblobKey("keyblob_key", 0x00..0x06),
        keyblob_mac_keys: [Aes128Key; 0x06] => KeyblobMacKey("keyblob_mac_key", 0x00..0x06),
        encrypted_keyblobs: [EncryptedKeyblob; 0x06]
            => EncryptedKeyblob("encrypted_keyblob", 0x00..0x06),
        /// Decrypted keyblobs. Carry the master kek and package1 key of
        /// pre-6.2.0 generations.
        keyblobs: [Keyblob; 0x06] => Keyblob("keyblob", 0x00..0x06),
        mariko_master_kek_sources: [Aes128Key; 0x20]
            => MarikoMasterKekSource("mariko_master_kek_source", 0x00..0x20),
        /// Indexed by generation - 6.
        tsec_auth_signatures: [Aes128Key; 0x1A]
            => TsecAuthSignature("tsec_auth_signature", 0x00..0x1A),
        /// Indexed by generation - 6.
        tsec_root_keys: [Aes128Key; 0x1A] => TsecRootKey("tsec_root_key", 0x00..0x1A),
        master_kek_sources: [Aes128Key; 0x20]
            => MasterKekSource("master_kek_source", 0x06..0x20),
        package1_mac_keys: [Aes128Key; 0x20] => Package1MacKey("package1_mac_key", 0x06..0x20),
        mariko_aes_class_keys: [Aes128Key; 0x0C]
            => MarikoAesClassKey("mariko_aes_class_key", 0x00..0x0C),
        master_keks: [Aes128Key; 0x20] => MasterKek("master_kek", 0x00..0x20),
        master_keys: [Aes128Key; 0x20] => MasterKey("master_key", 0x00..0x20),
        package1_keys: [Aes128Key; 0x20] => Package1Key("package1_key", 0x00..0x20),
        package2_keys: [Aes128Key; 0x20] => Package2Key("package2_key", 0x00..0x20),
        titlekeks: [Aes128Key; 0x20] => Titlekek("titlekek", 0x00..0x20),
        key_area_key_application: [Aes128Key; 0x20]
            => KeyAreaKeyApplication("key_area_key_application", 0x00..0x20),
        key_area_key_ocean: [Aes128Key; 0x20]
            => KeyAreaKeyOcean("key_area_key_ocean", 0x00..0x20),
        key_area_key_system: [Aes128Key; 0x20]
            => KeyAreaKeySystem("key_area_key_system", 0x00..0x20),
    }
}

/// Number of key generations that have a keyblob (everything before 6.2.0).
pub const KEYBLOB_GENERATIONS: usize = 6;
pub const MAX_KEY_GENERATION: usize = 0x20;

pub fn key_file_name(dev: bool) -> &'static str {
    if dev {
        "dev.keys"
    } else {
        "prod.keys"
    }
}

pub const TITLE_KEY_FILE_NAME: &str = "title.keys";

/// Places a key file is looked for when none is given explicitly.
pub fn default_key_paths(file_name: &str) -> Vec<PathBuf> {
    [
        dirs_next::config_dir().map(|dir| dir.join("switch")),
        dirs_next::home_dir().map(|dir| dir.join(".switch")),
    ]
    .into_iter()
    .flatten()
    .map(|dir| dir.join(file_name))
    .collect()
}

/// Opens `path`, or the first default location holding `default_name`, and
/// hands it to `read`.
///
/// An explicit path that can't be opened is an error. Not finding the file
/// in any default location is only a warning.
fn read_key_file<F>(path: Option<&Path>, default_name: &str, mut read: F) -> Result<Diagnostics, Error>
where
    F: FnMut(&mut File) -> Result<Diagnostics, Error>,
{
    if let Some(path) = path {
        tracing::debug!("Loading {}", path.display());
        let mut file = File::open(path).map_err(|err| (err, path))?;
        return read(&mut file);
    }

    for path in default_key_paths(default_name) {
        match File::open(&path) {
            Ok(mut file) => {
                tracing::debug!("Loading {}", path.display());
                return read(&mut file);
            }
            Err(ref err) if err.kind() == ErrorKind::NotFound => (),
            Err(err) => tracing::warn!("Failed to open {}: {}", path.display(), err),
        }
    }

    let mut diags = Diagnostics::new();
    diags.push(Warning::KeyFileNotFound {
        file_name: default_name.to_string(),
    });
    Ok(diags)
}

impl Keys {
    pub fn new() -> Keys {
        Keys::default()
    }

    /// The raw bytes of a slot. All-zero when the key is unset. `None` for
    /// names outside the catalog.
    pub fn get(&self, name: KeyName) -> Option<&[u8]> {
        self.slot(name)
    }

    /// Stores `bytes` into a slot. The length must match the slot exactly.
    pub fn register(&mut self, name: KeyName, bytes: &[u8]) -> Result<(), Error> {
        let slot = self.slot_mut(name).ok_or_else(|| Error::UnknownKeySlot {
            key_name: name,
            backtrace: Backtrace::generate(),
        })?;
        if slot.len() != bytes.len() {
            return Err(Error::key_length(name, slot.len(), bytes.len()));
        }
        slot.copy_from_slice(bytes);
        Ok(())
    }

    /// Fetches an AES-128 key, failing if it was never set.
    pub fn get_key(&self, name: KeyName) -> Result<Aes128Key, Error> {
        let bytes = self.slot(name).ok_or_else(|| Error::missing_key(name))?;
        if bytes.len() != Aes128Key::SIZE {
            return Err(Error::key_length(name, Aes128Key::SIZE, bytes.len()));
        }
        let mut key = Aes128Key::default();
        key.0.copy_from_slice(bytes);
        key.nonzero().copied().ok_or_else(|| Error::missing_key(name))
    }

    pub fn get_xts_key(&self, name: KeyName) -> Result<AesXtsKey, Error> {
        let bytes = self.slot(name).ok_or_else(|| Error::missing_key(name))?;
        if bytes.len() != AesXtsKey::SIZE {
            return Err(Error::key_length(name, AesXtsKey::SIZE, bytes.len()));
        }
        let mut key = AesXtsKey::default();
        key.0.copy_from_slice(bytes);
        key.nonzero().copied().ok_or_else(|| Error::missing_key(name))
    }

    /// Applies one `name = hex` pair from a key file.
    ///
    /// Returns the warning the pair caused, if any. Malformed values leave
    /// the slot untouched. A value of the wrong size is still decoded, zero
    /// padded or truncated to fit.
    pub fn ingest(&mut self, name: &str, value: &str) -> Option<Warning> {
        let name = name.to_ascii_lowercase();

        if value.len() % 2 != 0 {
            return Some(Warning::OddLengthValue { key: name });
        }
        if !is_hexstring(value) {
            return Some(Warning::NonHexValue { key: name });
        }

        let slot = match name.parse::<KeyName>().ok().and_then(|key| self.slot_mut(key)) {
            Some(slot) => slot,
            None => {
                return Some(Warning::UnknownKey {
                    key: name,
                    value: value.to_string(),
                })
            }
        };

        let warning = if value.len() != slot.len() * 2 {
            Some(Warning::KeyLengthMismatch {
                length: value.len() / 2,
                expected: slot.len(),
                key: name,
            })
        } else {
            None
        };
        decode_hex_lossy(slot, value);
        warning
    }

    pub fn ingest_all<'a, I>(&mut self, pairs: I) -> Diagnostics
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut diags = Diagnostics::new();
        diags.extend(pairs.into_iter().filter_map(|(name, value)| self.ingest(name, value)));
        diags
    }

    pub fn read_from_ini<R: Read>(&mut self, reader: &mut R) -> Result<Diagnostics, Error> {
        let config = ini::Ini::read_from(reader)?;
        Ok(self.ingest_all(config.general_section().iter()))
    }

    /// Reads a key file, from `path` or the default locations.
    pub fn load(&mut self, path: Option<&Path>, dev: bool) -> Result<Diagnostics, Error> {
        read_key_file(path, key_file_name(dev), |file| self.read_from_ini(file))
    }

    /// Every set slot, in catalog order.
    pub fn iter_set(&self) -> impl Iterator<Item = (KeyName, &[u8])> + '_ {
        KeyName::catalog()
            .iter()
            .flat_map(|entry| entry.names())
            .filter_map(move |name| {
                self.slot(name)
                    .filter(|bytes| !is_zero(bytes))
                    .map(|bytes| (name, bytes))
            })
    }
}

/// Title keys, by rights id.
#[derive(Debug, Default, Clone)]
pub struct TitleKeys {
    keys: BTreeMap<RightsId, TitleKey>,
}

impl TitleKeys {
    pub fn new() -> TitleKeys {
        TitleKeys::default()
    }

    /// Applies one `rights_id = title_key` pair.
    pub fn ingest(&mut self, rights_id: &str, value: &str) -> Option<Warning> {
        let malformed = |reason| {
            Some(Warning::MalformedRightsId {
                rights_id: rights_id.to_string(),
                reason,
            })
        };
        if rights_id.len() % 2 != 0 {
            return malformed("odd number of characters");
        }
        if rights_id.len() != RightsId::SIZE * 2 {
            return malformed("wrong number of characters");
        }
        if !is_hexstring(rights_id) {
            return malformed("not hexadecimal");
        }

        let warning = if value.len() != TitleKey::SIZE * 2 {
            Some(Warning::MalformedTitleKey {
                rights_id: rights_id.to_string(),
            })
        } else {
            None
        };

        let mut id = RightsId::default();
        decode_hex_lossy(&mut id.0, rights_id);
        let mut key = TitleKey::default();
        decode_hex_lossy(&mut key.0, value);
        self.keys.insert(id, key);
        warning
    }

    pub fn ingest_all<'a, I>(&mut self, pairs: I) -> Diagnostics
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut diags = Diagnostics::new();
        diags.extend(pairs.into_iter().filter_map(|(id, value)| self.ingest(id, value)));
        diags
    }

    pub fn read_from_ini<R: Read>(&mut self, reader: &mut R) -> Result<Diagnostics, Error> {
        let config = ini::Ini::read_from(reader)?;
        Ok(self.ingest_all(config.general_section().iter()))
    }

    pub fn load(&mut self, path: Option<&Path>) -> Result<Diagnostics, Error> {
        read_key_file(path, TITLE_KEY_FILE_NAME, |file| self.read_from_ini(file))
    }

    pub fn get(&self, rights_id: &RightsId) -> Option<&TitleKey> {
        self.keys.get(rights_id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RightsId, &TitleKey)> {
        self.keys.iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const KEY_A: &str = "000102030405060708090a0b0c0d0e0f";

    #[test]
    fn ingest_stores_value() {
        let mut keys = Keys::new();
        assert!(keys.ingest("master_key_00", KEY_A).is_none());
        assert_eq!(
            keys.get(KeyName::MasterKey(0)).unwrap(),
            &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15][..]
        );
    }

    #[test]
    fn ingest_lowercases_names() {
        let mut keys = Keys::new();
        assert!(keys.ingest("XCI_Header_Key", KEY_A).is_none());
        assert!(keys.xci_header_key().is_set());
    }

    #[test]
    fn odd_length_value_leaves_slot_unset() {
        for entry in KeyName::catalog() {
            for name in entry.names() {
                let mut keys = Keys::new();
                let warning = keys.ingest(&name.to_string(), "abc");
                assert!(matches!(warning, Some(Warning::OddLengthValue { .. })), "{}", name);
                assert!(is_zero(keys.get(name).unwrap()), "{}", name);
            }
        }
    }

    #[test]
    fn non_hex_value_is_dropped() {
        let mut keys = Keys::new();
        let warning = keys.ingest("tsec_key", "zz0102030405060708090a0b0c0d0e0f");
        assert!(matches!(warning, Some(Warning::NonHexValue { .. })));
        assert!(!keys.tsec_key().is_set());
    }

    #[test]
    fn unknown_name_is_reported() {
        let mut keys = Keys::new();
        let warning = keys.ingest("master_key_20", KEY_A);
        assert!(matches!(warning, Some(Warning::UnknownKey { .. })));
        assert_eq!(keys, Keys::new());
    }

    #[test]
    fn short_value_is_zero_padded() {
        let mut keys = Keys::new();
        let warning = keys.ingest("tsec_key", "aabb");
        assert!(matches!(
            warning,
            Some(Warning::KeyLengthMismatch {
                length: 2,
                expected: 0x10,
                ..
            })
        ));
        let mut expected = [0; 0x10];
        expected[..2].copy_from_slice(&[0xAA, 0xBB]);
        assert_eq!(keys.tsec_key().as_bytes(), &expected[..]);
    }

    #[test]
    fn long_value_is_truncated() {
        let mut keys = Keys::new();
        let value = format!("{}{}", KEY_A, "ffff");
        assert!(keys.ingest("tsec_key", &value).is_some());
        assert_eq!(keys.tsec_key().as_bytes()[0xF], 0x0F);
    }

    #[test]
    fn ingest_all_reports_one_warning_per_bad_pair() {
        let mut keys = Keys::new();
        let diags = keys.ingest_all(vec![
            ("master_key_00", KEY_A),
            ("master_key_01", "123"),
            ("bogus", KEY_A),
            ("header_key", "00"),
        ]);
        assert_eq!(diags.len(), 3);
        assert!(keys.master_keys()[0].is_set());
    }

    #[test]
    fn read_from_ini_ingests_general_section() {
        let mut keys = Keys::new();
        let file = format!("tsec_key = {}\nsecure_boot_key = {}\n", KEY_A, KEY_A);
        let diags = keys
            .read_from_ini(&mut std::io::Cursor::new(file.as_bytes()))
            .unwrap();
        assert!(diags.is_empty());
        assert!(keys.tsec_key().is_set());
        assert!(keys.secure_boot_key().is_set());
    }

    #[test]
    fn register_requires_exact_length() {
        let mut keys = Keys::new();
        assert!(keys.register(KeyName::HeaderKey, &[1; 0x20]).is_ok());
        assert!(matches!(
            keys.register(KeyName::HeaderKey, &[1; 0x10]),
            Err(Error::KeyLength { expected: 0x20, actual: 0x10, .. })
        ));
        assert_eq!(keys.get_xts_key(KeyName::HeaderKey).unwrap().as_bytes(), &[1; 0x20][..]);
        assert!(matches!(
            keys.get_key(KeyName::HeaderKey),
            Err(Error::KeyLength { expected: 0x10, actual: 0x20, .. })
        ));
    }

    #[test]
    fn register_rejects_names_outside_the_catalog() {
        let mut keys = Keys::new();
        assert!(matches!(
            keys.register(KeyName::KeyblobKey(6), &[1; 0x10]),
            Err(Error::UnknownKeySlot { key_name: KeyName::KeyblobKey(6), .. })
        ));
        assert!(matches!(
            keys.register(KeyName::MasterKekSource(5), &[1; 0x10]),
            Err(Error::UnknownKeySlot { .. })
        ));
    }

    #[test]
    fn get_key_reports_missing_keys() {
        let keys = Keys::new();
        assert!(matches!(
            keys.get_key(KeyName::MasterKey(0)),
            Err(Error::MissingKey {
                key_name: KeyName::MasterKey(0),
                ..
            })
        ));
    }

    #[test]
    fn iter_set_lists_only_filled_slots() {
        let mut keys = Keys::new();
        keys.register(KeyName::MasterKey(3), &[7; 0x10]).unwrap();
        keys.register(KeyName::TsecKey, &[1; 0x10]).unwrap();
        let set: Vec<KeyName> = keys.iter_set().map(|(name, _)| name).collect();
        assert_eq!(set, vec![KeyName::TsecKey, KeyName::MasterKey(3)]);
    }

    #[test]
    fn keyblob_round_trips_through_cmac_and_ctr() {
        let key = Aes128Key([0x11; 0x10]);
        let mac_key = Aes128Key([0x22; 0x10]);
        let mut plain = [0; 0x90];
        plain[..0x10].copy_from_slice(&[0x33; 0x10]);
        let keyblob = Keyblob(plain);

        let encrypted = keyblob.encrypt(&key, &mac_key, &[0x44; 0x10]);
        let decrypted = encrypted.decrypt(&key, &mac_key, 0).unwrap();
        assert_eq!(decrypted, keyblob);
        assert_eq!(decrypted.master_kek(), Aes128Key([0x33; 0x10]));

        let mut tampered = encrypted.clone();
        tampered.0[0x40] ^= 1;
        assert!(matches!(
            tampered.decrypt(&key, &mac_key, 3),
            Err(Error::MacError { id: 3, .. })
        ));
    }

    #[test]
    fn derive_and_encrypt_are_inverse() {
        let kek = Aes128Key([0x5A; 0x10]);
        let source = [0xA5; 0x10];
        let derived = kek.derive_key(&source);
        assert_eq!(kek.encrypt_key(&derived.0), Aes128Key(source));
    }

    #[test]
    fn title_keys_validate_rights_ids() {
        let mut title_keys = TitleKeys::new();
        assert!(matches!(
            title_keys.ingest("010000000000100", KEY_A),
            Some(Warning::MalformedRightsId { reason: "odd number of characters", .. })
        ));
        assert!(matches!(
            title_keys.ingest("0100", KEY_A),
            Some(Warning::MalformedRightsId { reason: "wrong number of characters", .. })
        ));
        assert!(matches!(
            title_keys.ingest("0100000000001000000000000000000g", KEY_A),
            Some(Warning::MalformedRightsId { reason: "not hexadecimal", .. })
        ));
        assert!(title_keys.is_empty());

        assert!(title_keys
            .ingest("01000000000010000000000000000000", KEY_A)
            .is_none());
        assert!(matches!(
            title_keys.ingest("01000000000020000000000000000000", "aabb"),
            Some(Warning::MalformedTitleKey { .. })
        ));
        assert_eq!(title_keys.len(), 2);

        let mut id = RightsId::default();
        id.0[0] = 1;
        id.0[6] = 0x10;
        assert_eq!(title_keys.get(&id).unwrap().as_bytes()[1], 1);
    }
}
