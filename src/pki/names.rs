//! Key names as they appear in key files.
//!
//! Scalar keys are matched by their exact name. Per-generation keys are
//! written `<base>_<gen>` where `<gen>` is a two digit lowercase hex index,
//! e.g. `master_key_0a`. Which generations a base accepts is part of the
//! catalog, so `master_kek_source_00` is not a key while
//! `master_kek_source_06` is.

use crate::pki::KeyName;
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub enum Shape {
    Scalar(KeyName),
    Generational {
        generations: Range<u8>,
        make: fn(u8) -> KeyName,
    },
}

#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub name: &'static str,
    pub shape: Shape,
}

impl CatalogEntry {
    /// Every key name this entry accepts.
    pub fn names(&self) -> impl Iterator<Item = KeyName> + '_ {
        let (scalar, generations, make) = match &self.shape {
            Shape::Scalar(name) => (Some(*name), 0..0, None),
            Shape::Generational { generations, make } => (None, generations.clone(), Some(*make)),
        };
        scalar
            .into_iter()
            .chain(generations.filter_map(move |gen| make.map(|make| make(gen))))
    }
}

fn parse_generation(suffix: &str) -> Option<u8> {
    if suffix.len() != 2 || !suffix.bytes().all(|c| matches!(c, b'0'..=b'9' | b'a'..=b'f')) {
        return None;
    }
    u8::from_str_radix(suffix, 16).ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownKeyName;

impl FromStr for KeyName {
    type Err = UnknownKeyName;

    fn from_str(name: &str) -> Result<KeyName, UnknownKeyName> {
        for entry in KeyName::catalog() {
            if let Shape::Scalar(key) = entry.shape {
                if entry.name == name {
                    return Ok(key);
                }
            }
        }

        let (base, suffix) = name.rsplit_once('_').ok_or(UnknownKeyName)?;
        let gen = parse_generation(suffix).ok_or(UnknownKeyName)?;
        KeyName::catalog()
            .iter()
            .find_map(|entry| match &entry.shape {
                Shape::Generational { generations, make }
                    if entry.name == base && generations.contains(&gen) =>
                {
                    Some(make(gen))
                }
                _ => None,
            })
            .ok_or(UnknownKeyName)
    }
}

impl fmt::Display for KeyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.generation() {
            Some(gen) => write!(f, "{}_{:02x}", self.base_name(), gen),
            None => f.write_str(self.base_name()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn scalar_names_parse() {
        assert_eq!("tsec_key".parse::<KeyName>(), Ok(KeyName::TsecKey));
        assert_eq!("xci_header_key".parse::<KeyName>(), Ok(KeyName::XciHeaderKey));
        assert_eq!(
            "key_area_key_ocean_source".parse::<KeyName>(),
            Ok(KeyName::KeyAreaKeyOceanSource)
        );
    }

    #[test]
    fn generation_suffix_is_lowercase_hex() {
        assert_eq!("master_key_0a".parse::<KeyName>(), Ok(KeyName::MasterKey(0x0A)));
        assert_eq!("master_key_0A".parse::<KeyName>(), Err(UnknownKeyName));
        assert_eq!("master_key_a".parse::<KeyName>(), Err(UnknownKeyName));
        assert_eq!("master_key_00a".parse::<KeyName>(), Err(UnknownKeyName));
    }

    #[test]
    fn generation_ranges_are_enforced() {
        assert_eq!("keyblob_key_05".parse::<KeyName>(), Ok(KeyName::KeyblobKey(5)));
        assert_eq!("keyblob_key_06".parse::<KeyName>(), Err(UnknownKeyName));
        assert_eq!("master_kek_source_05".parse::<KeyName>(), Err(UnknownKeyName));
        assert_eq!("master_kek_source_06".parse::<KeyName>(), Ok(KeyName::MasterKekSource(6)));
        assert_eq!("mariko_aes_class_key_0b".parse::<KeyName>(), Ok(KeyName::MarikoAesClassKey(0xB)));
        assert_eq!("mariko_aes_class_key_0c".parse::<KeyName>(), Err(UnknownKeyName));
        assert_eq!("tsec_root_key_00".parse::<KeyName>(), Ok(KeyName::TsecRootKey(0)));
    }

    #[test]
    fn display_round_trips_through_the_catalog() {
        for entry in KeyName::catalog() {
            for name in entry.names() {
                assert_eq!(name.to_string().parse::<KeyName>(), Ok(name), "{}", name);
            }
        }
    }

    #[test]
    fn unknown_names_are_rejected() {
        assert_eq!("not_a_key".parse::<KeyName>(), Err(UnknownKeyName));
        assert_eq!("master_key".parse::<KeyName>(), Err(UnknownKeyName));
        assert_eq!("".parse::<KeyName>(), Err(UnknownKeyName));
    }
}
