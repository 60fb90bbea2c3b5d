//! Destination for derived master keys.
//!
//! Once derivation is done, every master key is handed to a [`KeySlotSink`],
//! one call per generation. [`KeySlotTable`] keeps them in memory so later
//! stages can look them up.

use crate::pki::{Aes128Key, MAX_KEY_GENERATION};

pub trait KeySlotSink {
    fn install_key(&mut self, key: &Aes128Key, generation: usize, is_dev: bool);
}

#[derive(Debug, Clone)]
pub struct KeySlotTable {
    slots: [Option<Aes128Key>; MAX_KEY_GENERATION],
    is_dev: bool,
}

impl Default for KeySlotTable {
    fn default() -> KeySlotTable {
        KeySlotTable {
            slots: [None; MAX_KEY_GENERATION],
            is_dev: false,
        }
    }
}

impl KeySlotTable {
    pub fn new() -> KeySlotTable {
        KeySlotTable::default()
    }

    pub fn get(&self, generation: usize) -> Option<&Aes128Key> {
        self.slots.get(generation).and_then(Option::as_ref)
    }

    /// Whether the installed keys are development keys.
    pub fn is_dev(&self) -> bool {
        self.is_dev
    }

    /// Generations with a key installed.
    pub fn installed(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(generation, _)| generation)
    }
}

impl KeySlotSink for KeySlotTable {
    fn install_key(&mut self, key: &Aes128Key, generation: usize, is_dev: bool) {
        match self.slots.get_mut(generation) {
            Some(slot) => {
                tracing::debug!("Installing master key {:02x}", generation);
                *slot = Some(*key);
                self.is_dev = is_dev;
            }
            None => tracing::warn!("Ignoring master key for unknown generation {:02x}", generation),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn installs_by_generation() {
        let mut table = KeySlotTable::new();
        table.install_key(&Aes128Key::from([1; 0x10]), 3, true);
        table.install_key(&Aes128Key::from([2; 0x10]), MAX_KEY_GENERATION, false);
        assert_eq!(table.get(3), Some(&Aes128Key::from([1; 0x10])));
        assert_eq!(table.installed().collect::<Vec<_>>(), vec![3]);
        assert!(table.is_dev());
    }
}
