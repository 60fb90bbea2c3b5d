//! Non-fatal problems.
//!
//! Missing keys, odd key files and broken partitions don't stop processing.
//! They are recorded as [`Warning`]s on whatever is being built, and logged
//! as they happen.

use crate::error::Error;
use derive_more::Display;

#[derive(Debug, Display)]
pub enum Warning {
    #[display(fmt = "Key {} has malformed value (odd number of characters)", key)]
    OddLengthValue { key: String },
    #[display(fmt = "Key {} has malformed value (not hexadecimal)", key)]
    NonHexValue { key: String },
    #[display(fmt = "Failed to match key \"{}\", (value \"{}\")", key, value)]
    UnknownKey { key: String, value: String },
    #[display(
        fmt = "Encountered malformed value for {} (length {} != expected {})",
        key,
        length,
        expected
    )]
    KeyLengthMismatch {
        key: String,
        length: usize,
        expected: usize,
    },
    #[display(fmt = "Rights Id {} has malformed id ({})", rights_id, reason)]
    MalformedRightsId {
        rights_id: String,
        reason: &'static str,
    },
    #[display(
        fmt = "Rights Id {} has malformed value (wrong number of characters)",
        rights_id
    )]
    MalformedTitleKey { rights_id: String },
    #[display(fmt = "No {} found in the default locations", file_name)]
    KeyFileNotFound { file_name: String },
    #[display(fmt = "Keyblob {:02x} failed verification: {}", generation, error)]
    KeyblobVerification { generation: usize, error: Error },
    #[display(
        fmt = "Failed to preset the gamecard header key: {}. Is xci_header_key correct?",
        error
    )]
    HeaderCipherUnavailable { error: Error },
    #[display(fmt = "Failed to decrypt the gamecard header: {}", error)]
    HeaderNotDecrypted { error: Error },
    #[display(fmt = "Failed to mount the game card root partition: {}", error)]
    RootPartitionMount { error: Error },
    #[display(fmt = "Found unrecognized game card partition ({})", name)]
    UnrecognizedPartition { name: String },
    #[display(fmt = "Failed to open game card partition ({}): {}", name, error)]
    PartitionOpen { name: String, error: Error },
    #[display(fmt = "Failed to mount game card partition ({}): {}", name, error)]
    PartitionMount { name: String, error: Error },
}

/// An ordered list of warnings.
#[derive(Debug, Default)]
pub struct Diagnostics {
    warnings: Vec<Warning>,
}

impl Diagnostics {
    pub fn new() -> Diagnostics {
        Diagnostics::default()
    }

    pub fn push(&mut self, warning: Warning) {
        tracing::warn!("{}", warning);
        self.warnings.push(warning);
    }

    /// Appends warnings that were already logged when first recorded.
    pub fn append(&mut self, mut other: Diagnostics) {
        self.warnings.append(&mut other.warnings);
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn len(&self) -> usize {
        self.warnings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Warning> {
        self.warnings.iter()
    }
}

impl<'a> IntoIterator for &'a Diagnostics {
    type Item = &'a Warning;
    type IntoIter = std::slice::Iter<'a, Warning>;

    fn into_iter(self) -> Self::IntoIter {
        self.warnings.iter()
    }
}

impl Extend<Warning> for Diagnostics {
    fn extend<T: IntoIterator<Item = Warning>>(&mut self, iter: T) {
        for warning in iter {
            self.push(warning);
        }
    }
}
