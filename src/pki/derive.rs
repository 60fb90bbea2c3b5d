//! The key derivation cascade.
//!
//! Each stage only runs for the generations whose inputs are all set. A
//! missing input is not an error, the outputs simply stay unset.

use super::{Aes128Key, Keys, KEYBLOB_GENERATIONS, MAX_KEY_GENERATION};
use crate::diag::{Diagnostics, Warning};

/// Unwraps `src` through the master key based key generation chain.
///
/// The final unwrap with `key_seed` is skipped when there is none.
pub fn generate_kek(
    src: &Aes128Key,
    master_key: &Aes128Key,
    kek_seed: &Aes128Key,
    key_seed: Option<&Aes128Key>,
) -> Aes128Key {
    let kek = master_key.derive_key(kek_seed.bytes());
    let src_kek = kek.derive_key(src.bytes());
    match key_seed {
        Some(key_seed) => src_kek.derive_key(key_seed.bytes()),
        None => src_kek,
    }
}

impl Keys {
    /// Fills in every key that can be computed from the ones already set.
    ///
    /// Running it again on the result changes nothing.
    pub fn derive_keys(&mut self) -> Diagnostics {
        let mut diags = Diagnostics::new();

        self.derive_keyblob_keys();
        self.decrypt_keyblobs(&mut diags);
        self.derive_tsec_keys();
        self.derive_mariko_master_keks();
        self.derive_master_keys();
        self.derive_per_generation_keys();
        self.derive_common_keys();

        diags
    }

    fn derive_keyblob_keys(&mut self) {
        for i in 0..KEYBLOB_GENERATIONS {
            /* Derive the keyblob_keys */
            match (
                self.secure_boot_key.nonzero(),
                self.tsec_key.nonzero(),
                self.keyblob_key_sources[i].nonzero(),
            ) {
                (Some(sbk), Some(tsec_key), Some(keyblob_key_source)) => {
                    let tmp = tsec_key.derive_key(keyblob_key_source.bytes());
                    self.keyblob_keys[i] = sbk.derive_key(tmp.bytes());
                }
                _ => continue,
            }
        }
        for i in 0..KEYBLOB_GENERATIONS {
            /* Derive the keyblob mac keys */
            if let (Some(keyblob_key), Some(keyblob_mac_key_source)) = (
                self.keyblob_keys[i].nonzero(),
                self.keyblob_mac_key_source.nonzero(),
            ) {
                self.keyblob_mac_keys[i] = keyblob_key.derive_key(keyblob_mac_key_source.bytes());
            }
        }
        if let (Some(keyblob_key), Some(per_console_key_source)) = (
            self.keyblob_keys[0].nonzero(),
            self.per_console_key_source.nonzero(),
        ) {
            self.device_key = keyblob_key.derive_key(per_console_key_source.bytes());
        }
    }

    fn decrypt_keyblobs(&mut self, diags: &mut Diagnostics) {
        for i in 0..KEYBLOB_GENERATIONS {
            if !self.encrypted_keyblobs[i].is_set() {
                continue;
            }
            let (keyblob_key, keyblob_mac_key) =
                match (self.keyblob_keys[i].nonzero(), self.keyblob_mac_keys[i].nonzero()) {
                    (Some(key), Some(mac_key)) => (*key, *mac_key),
                    _ => continue,
                };
            match self.encrypted_keyblobs[i].decrypt(&keyblob_key, &keyblob_mac_key, i) {
                Ok(keyblob) => self.keyblobs[i] = keyblob,
                Err(error) => diags.push(Warning::KeyblobVerification {
                    generation: i,
                    error,
                }),
            }
        }
        for i in 0..KEYBLOB_GENERATIONS {
            /* set package1_key and master_kek as relevant */
            let package1_key = self.keyblobs[i].package1_key();
            if package1_key.is_set() {
                self.package1_keys[i] = package1_key;
            }
            let master_kek = self.keyblobs[i].master_kek();
            if master_kek.is_set() {
                self.master_keks[i] = master_kek;
            }
        }
    }

    fn derive_tsec_keys(&mut self) {
        for i in KEYBLOB_GENERATIONS..MAX_KEY_GENERATION {
            /* Do keygen for 6.2.0+ */
            let tsec_idx = i - KEYBLOB_GENERATIONS;
            let signature = match self.tsec_auth_signatures[tsec_idx].nonzero() {
                Some(signature) => *signature.bytes(),
                None => continue,
            };
            if let Some(tsec_root_kek) = self.tsec_root_kek.nonzero() {
                self.tsec_root_keys[tsec_idx] = tsec_root_kek.encrypt_key(&signature);
            }
            if let Some(package1_mac_kek) = self.package1_mac_kek.nonzero() {
                self.package1_mac_keys[i] = package1_mac_kek.encrypt_key(&signature);
            }
            if let Some(package1_kek) = self.package1_kek.nonzero() {
                self.package1_keys[i] = package1_kek.encrypt_key(&signature);
            }
        }
        for i in KEYBLOB_GENERATIONS..MAX_KEY_GENERATION {
            match (
                self.tsec_root_keys[i - KEYBLOB_GENERATIONS].nonzero(),
                self.master_kek_sources[i].nonzero(),
            ) {
                (Some(tsec_root_key), Some(master_kek_source)) => {
                    self.master_keks[i] = tsec_root_key.derive_key(master_kek_source.bytes());
                }
                _ => continue,
            }
        }
    }

    fn derive_mariko_master_keks(&mut self) {
        for i in 0..MAX_KEY_GENERATION {
            /* Mariko keys take precedence over keyblob and TSEC ones */
            if let (Some(mariko_kek), Some(mariko_master_kek_source)) = (
                self.mariko_kek.nonzero(),
                self.mariko_master_kek_sources[i].nonzero(),
            ) {
                self.master_keks[i] = mariko_kek.derive_key(mariko_master_kek_source.bytes());
            }
        }
    }

    fn derive_master_keys(&mut self) {
        for i in 0..MAX_KEY_GENERATION {
            /* Derive the master keys! */
            match (self.master_key_source.nonzero(), self.master_keks[i].nonzero()) {
                (Some(master_key_source), Some(master_kek)) => {
                    self.master_keys[i] = master_kek.derive_key(master_key_source.bytes());
                }
                _ => continue,
            }
        }
    }

    fn derive_per_generation_keys(&mut self) {
        let kek_seed = self.aes_kek_generation_source.nonzero().copied();
        let key_seed = self.aes_key_generation_source.nonzero().copied();

        for i in 0..MAX_KEY_GENERATION {
            let master_key = match self.master_keys[i].nonzero() {
                Some(master_key) => *master_key,
                None => continue,
            };

            /* Derive key area encryption keys */
            if let (Some(kek_seed), Some(key_seed)) = (&kek_seed, &key_seed) {
                let sources = [
                    self.key_area_key_application_source,
                    self.key_area_key_ocean_source,
                    self.key_area_key_system_source,
                ];
                let targets = [
                    &mut self.key_area_key_application[i],
                    &mut self.key_area_key_ocean[i],
                    &mut self.key_area_key_system[i],
                ];
                for (source, target) in sources.iter().zip(targets) {
                    if let Some(source) = source.nonzero() {
                        *target = generate_kek(source, &master_key, kek_seed, Some(key_seed));
                    }
                }
            }

            /* Derive titlekek */
            if let Some(titlekek_source) = self.titlekek_source.nonzero() {
                self.titlekeks[i] = master_key.derive_key(titlekek_source.bytes());
            }

            /* Derive Package2 key */
            if let Some(package2_key_source) = self.package2_key_source.nonzero() {
                self.package2_keys[i] = master_key.derive_key(package2_key_source.bytes());
            }
        }
    }

    /// Keys that only come from the first master key.
    fn derive_common_keys(&mut self) {
        let master_key = match self.master_keys[0].nonzero() {
            Some(master_key) => *master_key,
            None => return,
        };
        let kek_seed = match self.aes_kek_generation_source.nonzero() {
            Some(kek_seed) => *kek_seed,
            None => return,
        };
        let key_seed = self.aes_key_generation_source.nonzero().copied();

        /* Derive Header Key */
        if let (Some(key_seed), Some(header_kek_source), Some(header_key_source)) = (
            &key_seed,
            self.header_kek_source.nonzero(),
            self.header_key_source.nonzero(),
        ) {
            let header_kek = generate_kek(header_kek_source, &master_key, &kek_seed, Some(key_seed));
            self.header_key = header_kek.derive_xts_key(header_key_source.bytes());
        }

        /* Derive SD Card keys */
        if let (Some(key_seed), Some(sd_card_kek_source)) = (&key_seed, self.sd_card_kek_source.nonzero()) {
            let sd_kek = generate_kek(sd_card_kek_source, &master_key, &kek_seed, Some(key_seed));
            if let Some(sd_card_save_key_source) = self.sd_card_save_key_source.nonzero() {
                self.sd_card_save_key = sd_kek.derive_xts_key(sd_card_save_key_source.bytes());
            }
            if let Some(sd_card_nca_key_source) = self.sd_card_nca_key_source.nonzero() {
                self.sd_card_nca_key = sd_kek.derive_xts_key(sd_card_nca_key_source.bytes());
            }
        }

        /* Derive the save MAC key */
        if let (Some(save_mac_kek_source), Some(save_mac_key_source)) = (
            self.save_mac_kek_source.nonzero(),
            self.save_mac_key_source.nonzero(),
        ) {
            let save_mac_kek = generate_kek(save_mac_kek_source, &master_key, &kek_seed, None);
            self.save_mac_key = save_mac_kek.derive_key(save_mac_key_source.bytes());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pki::{EncryptedKeyblob, KeyName, Keyblob};

    fn key(byte: u8) -> [u8; 0x10] {
        [byte; 0x10]
    }

    fn keyblob_keys() -> Keys {
        let mut keys = Keys::new();
        keys.register(KeyName::SecureBootKey, &key(0x01)).unwrap();
        keys.register(KeyName::TsecKey, &key(0x02)).unwrap();
        keys.register(KeyName::KeyblobMacKeySource, &key(0x03)).unwrap();
        keys.register(KeyName::MasterKeySource, &key(0x04)).unwrap();
        for i in 0..KEYBLOB_GENERATIONS as u8 {
            keys.register(KeyName::KeyblobKeySource(i), &key(0x10 + i)).unwrap();
        }
        keys
    }

    /// Encrypts a keyblob holding `master_kek` the way the bootloader stores it.
    fn with_keyblob(keys: &mut Keys, generation: usize, master_kek: [u8; 0x10]) {
        let mut derived = keys.clone();
        derived.derive_keys();
        let mut plain = [0; 0x90];
        plain[..0x10].copy_from_slice(&master_kek);
        plain[0x80..].copy_from_slice(&key(0xEE));
        let encrypted = Keyblob::from(plain).encrypt(
            &derived.keyblob_keys[generation],
            &derived.keyblob_mac_keys[generation],
            &key(0x99),
        );
        keys.encrypted_keyblobs[generation] = encrypted;
    }

    #[test]
    fn keyblob_keys_need_every_input() {
        let full = {
            let mut keys = keyblob_keys();
            keys.derive_keys();
            keys
        };
        assert!(full.keyblob_keys.iter().all(|key| key.is_set()));
        assert!(full.keyblob_mac_keys.iter().all(|key| key.is_set()));

        for missing in [KeyName::SecureBootKey, KeyName::TsecKey, KeyName::KeyblobKeySource(2)] {
            let mut keys = keyblob_keys();
            keys.register(missing, &[0; 0x10]).unwrap();
            keys.derive_keys();
            assert!(!keys.keyblob_keys[2].is_set(), "{}", missing);
            assert!(!keys.keyblob_mac_keys[2].is_set(), "{}", missing);
        }
    }

    #[test]
    fn keyblob_key_matches_two_step_unwrap() {
        let mut keys = keyblob_keys();
        keys.derive_keys();
        let expected = Aes128Key::from(key(0x01))
            .derive_key(Aes128Key::from(key(0x02)).derive_key(&key(0x13)).bytes());
        assert_eq!(keys.keyblob_keys[3], expected);
    }

    #[test]
    fn device_key_comes_from_first_keyblob_key() {
        let mut keys = keyblob_keys();
        keys.register(KeyName::PerConsoleKeySource, &key(0x05)).unwrap();
        keys.derive_keys();
        assert_eq!(keys.device_key, keys.keyblob_keys[0].derive_key(&key(0x05)));
    }

    #[test]
    fn valid_keyblob_feeds_master_kek_and_package1_key() {
        let mut keys = keyblob_keys();
        with_keyblob(&mut keys, 1, key(0x42));
        let diags = keys.derive_keys();
        assert!(diags.is_empty());
        assert_eq!(keys.master_keks[1], Aes128Key::from(key(0x42)));
        assert_eq!(keys.package1_keys[1], Aes128Key::from(key(0xEE)));
        assert_eq!(keys.master_keys[1], Aes128Key::from(key(0x42)).derive_key(&key(0x04)));
    }

    #[test]
    fn tampered_keyblob_warns_and_stays_unset() {
        let mut keys = keyblob_keys();
        with_keyblob(&mut keys, 1, key(0x42));
        let mut tampered = keys.encrypted_keyblobs[1].as_bytes().to_vec();
        tampered[0x50] ^= 0xFF;
        keys.register(KeyName::EncryptedKeyblob(1), &tampered).unwrap();

        let diags = keys.derive_keys();
        assert_eq!(diags.len(), 1);
        assert!(matches!(
            diags.warnings()[0],
            Warning::KeyblobVerification { generation: 1, .. }
        ));
        assert_eq!(keys.keyblobs[1], Keyblob::default());
        assert!(!keys.master_keks[1].is_set());
    }

    #[test]
    fn zero_keyblob_contents_do_not_clobber_master_kek() {
        let mut keys = keyblob_keys();
        with_keyblob(&mut keys, 0, [0; 0x10]);
        keys.register(KeyName::MasterKek(0), &key(0x77)).unwrap();
        keys.derive_keys();
        assert_eq!(keys.master_keks[0], Aes128Key::from(key(0x77)));
    }

    #[test]
    fn tsec_path_derives_post_620_master_keks() {
        let mut keys = Keys::new();
        keys.register(KeyName::TsecRootKek, &key(0x21)).unwrap();
        keys.register(KeyName::Package1MacKek, &key(0x22)).unwrap();
        keys.register(KeyName::Package1Kek, &key(0x23)).unwrap();
        keys.register(KeyName::TsecAuthSignature(2), &key(0x24)).unwrap();
        keys.register(KeyName::MasterKekSource(8), &key(0x25)).unwrap();
        keys.derive_keys();

        let tsec_root_key = Aes128Key::from(key(0x21)).encrypt_key(&key(0x24));
        assert_eq!(keys.tsec_root_keys[2], tsec_root_key);
        assert_eq!(keys.package1_mac_keys[8], Aes128Key::from(key(0x22)).encrypt_key(&key(0x24)));
        assert_eq!(keys.package1_keys[8], Aes128Key::from(key(0x23)).encrypt_key(&key(0x24)));
        assert_eq!(keys.master_keks[8], tsec_root_key.derive_key(&key(0x25)));
        assert!(!keys.master_keks[7].is_set());
        assert!(!keys.master_keks[9].is_set());
    }

    #[test]
    fn mariko_master_kek_wins() {
        let mut keys = keyblob_keys();
        with_keyblob(&mut keys, 2, key(0x42));
        keys.register(KeyName::MarikoKek, &key(0x31)).unwrap();
        keys.register(KeyName::MarikoMasterKekSource(2), &key(0x32)).unwrap();
        keys.derive_keys();

        let mariko = Aes128Key::from(key(0x31)).derive_key(&key(0x32));
        assert_ne!(mariko, Aes128Key::from(key(0x42)));
        assert_eq!(keys.master_keks[2], mariko);
        assert_eq!(keys.master_keys[2], mariko.derive_key(&key(0x04)));
    }

    #[test]
    fn derivation_is_idempotent() {
        let mut keys = keyblob_keys();
        with_keyblob(&mut keys, 0, key(0x42));
        for (name, value) in [
            (KeyName::PerConsoleKeySource, 0x05),
            (KeyName::AesKekGenerationSource, 0x06),
            (KeyName::AesKeyGenerationSource, 0x07),
            (KeyName::KeyAreaKeyApplicationSource, 0x08),
            (KeyName::TitlekekSource, 0x09),
            (KeyName::Package2KeySource, 0x0A),
            (KeyName::SaveMacKekSource, 0x0B),
            (KeyName::SaveMacKeySource, 0x0C),
            (KeyName::MarikoKek, 0x0D),
            (KeyName::MarikoMasterKekSource(0x0A), 0x0E),
        ] {
            keys.register(name, &key(value)).unwrap();
        }

        keys.derive_keys();
        let once = keys.clone();
        keys.derive_keys();
        assert_eq!(keys, once);
    }

    #[test]
    fn further_keygen_follows_master_keys() {
        let mut keys = Keys::new();
        keys.register(KeyName::MasterKey(0), &key(0x40)).unwrap();
        keys.register(KeyName::MasterKey(5), &key(0x45)).unwrap();
        keys.register(KeyName::AesKekGenerationSource, &key(0x06)).unwrap();
        keys.register(KeyName::AesKeyGenerationSource, &key(0x07)).unwrap();
        keys.register(KeyName::KeyAreaKeyOceanSource, &key(0x08)).unwrap();
        keys.register(KeyName::TitlekekSource, &key(0x09)).unwrap();
        keys.register(KeyName::HeaderKekSource, &key(0x0A)).unwrap();
        keys.register(KeyName::HeaderKeySource, &[0x0B; 0x20]).unwrap();
        keys.register(KeyName::SaveMacKekSource, &key(0x0C)).unwrap();
        keys.register(KeyName::SaveMacKeySource, &key(0x0D)).unwrap();
        keys.derive_keys();

        let mk5 = Aes128Key::from(key(0x45));
        let seed = Aes128Key::from(key(0x06));
        assert_eq!(
            keys.key_area_key_ocean[5],
            generate_kek(&Aes128Key::from(key(0x08)), &mk5, &seed, Some(&Aes128Key::from(key(0x07))))
        );
        assert!(!keys.key_area_key_application[5].is_set());
        assert!(!keys.key_area_key_ocean[4].is_set());
        assert_eq!(keys.titlekeks[5], mk5.derive_key(&key(0x09)));
        assert!(!keys.package2_keys[5].is_set());

        assert!(keys.header_key.is_set());
        assert!(!keys.sd_card_nca_key.is_set());
        let save_mac_kek = generate_kek(&Aes128Key::from(key(0x0C)), &Aes128Key::from(key(0x40)), &seed, None);
        assert_eq!(keys.save_mac_key, save_mac_kek.derive_key(&key(0x0D)));
    }

    #[test]
    fn empty_store_derives_nothing() {
        let mut keys = Keys::new();
        assert!(keys.derive_keys().is_empty());
        assert_eq!(keys, Keys::new());
        assert_eq!(keys.encrypted_keyblobs[0], EncryptedKeyblob::default());
    }
}
