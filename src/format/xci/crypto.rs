use crate::error::Error;
use crate::format::xci::structures::CardHeaderWithSignature;
use crate::pki::{Aes128Key, KeyName, Keys};
use aes::Aes128;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use snafu::{Backtrace, GenerateImplicitData};

type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes128CbcEnc = cbc::Encryptor<Aes128>;

/// Decrypts the encrypted region of a gamecard header in place.
pub trait CardHeaderCipher {
    fn decrypt_card_header(&self, header: &mut CardHeaderWithSignature) -> Result<(), Error>;
}

/// The card header cipher, keyed with `xci_header_key`.
#[derive(Debug, Default, Clone)]
pub struct HeaderCrypto {
    key: Option<Aes128Key>,
}

/// The header stores the IV byte-reversed.
fn header_iv(header: &CardHeaderWithSignature) -> [u8; 0x10] {
    let mut iv = header.iv();
    iv.reverse();
    iv
}

impl HeaderCrypto {
    /// A cipher with no key. Every decryption fails until it is seeded.
    pub fn new() -> HeaderCrypto {
        HeaderCrypto::default()
    }

    pub fn with_key(key: Aes128Key) -> HeaderCrypto {
        HeaderCrypto { key: Some(key) }
    }

    pub fn seed(&mut self, keys: &Keys) -> Result<(), Error> {
        self.key = Some(keys.get_key(KeyName::XciHeaderKey)?);
        Ok(())
    }

    pub fn is_seeded(&self) -> bool {
        self.key.is_some()
    }

    fn key(&self) -> Result<&Aes128Key, Error> {
        self.key
            .as_ref()
            .ok_or_else(|| Error::missing_key(KeyName::XciHeaderKey))
    }

    /// Encrypts the header region, the inverse of
    /// [`decrypt_card_header`](CardHeaderCipher::decrypt_card_header).
    #[doc(hidden)]
    pub fn encrypt_card_header(&self, header: &mut CardHeaderWithSignature) -> Result<(), Error> {
        let key = self.key()?;
        let iv = header_iv(header);
        let data = header.encrypted_data_mut();
        let len = data.len();
        Aes128CbcEnc::new(key.bytes().into(), &iv.into())
            .encrypt_padded_mut::<NoPadding>(data, len)
            .map_err(|err| Error::Crypto {
                error: err.to_string(),
                backtrace: Backtrace::generate(),
            })?;
        Ok(())
    }
}

impl CardHeaderCipher for HeaderCrypto {
    fn decrypt_card_header(&self, header: &mut CardHeaderWithSignature) -> Result<(), Error> {
        let key = self.key()?;
        let iv = header_iv(header);
        Aes128CbcDec::new(key.bytes().into(), &iv.into())
            .decrypt_padded_mut::<NoPadding>(header.encrypted_data_mut())
            .map_err(|err| Error::Crypto {
                error: err.to_string(),
                backtrace: Backtrace::generate(),
            })?;
        Ok(())
    }
}
