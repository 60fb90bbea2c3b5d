//! One run of the tool: load keys, derive, then open images.

use crate::diag::{Diagnostics, Warning};
use crate::error::Error;
use crate::format::xci::{HeaderCrypto, Xci};
use crate::keyslot::{KeySlotSink, KeySlotTable};
use crate::pki::{Keys, TitleKeys};
use crate::storage::{FileStorage, SharedStorage};
use std::path::Path;
use std::sync::Arc;

pub struct Session {
    dev: bool,
    keys: Keys,
    title_keys: TitleKeys,
    key_slots: KeySlotTable,
    header_crypto: HeaderCrypto,
}

impl Session {
    /// A session with no keys. `dev` selects development key files and
    /// key slots.
    pub fn new(dev: bool) -> Session {
        Session {
            dev,
            keys: Keys::new(),
            title_keys: TitleKeys::new(),
            key_slots: KeySlotTable::new(),
            header_crypto: HeaderCrypto::new(),
        }
    }

    pub fn is_dev(&self) -> bool {
        self.dev
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    pub fn keys_mut(&mut self) -> &mut Keys {
        &mut self.keys
    }

    pub fn title_keys(&self) -> &TitleKeys {
        &self.title_keys
    }

    pub fn key_slots(&self) -> &KeySlotTable {
        &self.key_slots
    }

    pub fn header_crypto(&self) -> &HeaderCrypto {
        &self.header_crypto
    }

    /// Reads `prod.keys` (or `dev.keys`) from `path` or the default
    /// locations.
    pub fn load_keys(&mut self, path: Option<&Path>) -> Result<Diagnostics, Error> {
        self.keys.load(path, self.dev)
    }

    pub fn load_title_keys(&mut self, path: Option<&Path>) -> Result<Diagnostics, Error> {
        self.title_keys.load(path)
    }

    /// Derives everything derivable, installs the master keys and seeds
    /// the gamecard header cipher.
    pub fn preset_internal_keys(&mut self) -> Diagnostics {
        let mut key_slots = std::mem::take(&mut self.key_slots);
        let diags = self.preset_internal_keys_with(&mut key_slots);
        self.key_slots = key_slots;
        diags
    }

    /// Same as [`preset_internal_keys`](Session::preset_internal_keys), but
    /// installs master keys into `sink` instead of the session's table.
    pub fn preset_internal_keys_with<S: KeySlotSink + ?Sized>(&mut self, sink: &mut S) -> Diagnostics {
        let mut diags = self.keys.derive_keys();

        for (generation, master_key) in self.keys.master_keys().iter().enumerate() {
            if master_key.is_set() {
                sink.install_key(master_key, generation, self.dev);
            }
        }

        if let Err(error) = self.header_crypto.seed(&self.keys) {
            diags.push(Warning::HeaderCipherUnavailable { error });
        }
        diags
    }

    pub fn open_xci(&self, storage: SharedStorage) -> Result<Xci, Error> {
        Xci::open(storage, &self.header_crypto)
    }

    pub fn open_xci_file(&self, path: &Path) -> Result<Xci, Error> {
        let storage = FileStorage::open(path)?;
        self.open_xci(Arc::new(storage))
    }
}
