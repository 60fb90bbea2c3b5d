use core::ops::{BitAnd, Not};
use num_traits::Num;

pub struct Hexstring<'a>(pub &'a [u8]);

impl<'a> core::fmt::Debug for Hexstring<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for byte in self.0 {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

impl<'a> core::fmt::Display for Hexstring<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(self, f)
    }
}

/// Value of a single hexadecimal digit, if it is one.
pub fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        b'0'..=b'9' => Some(c - b'0'),
        _ => None,
    }
}

pub fn is_hexstring(s: &str) -> bool {
    s.bytes().all(|c| hex_digit(c).is_some())
}

/// Decodes as many whole bytes of `src` as fit into `dst`. Bytes of `dst`
/// that `src` doesn't cover are zeroed, and non-hex digits decode as 0.
pub fn decode_hex_lossy(dst: &mut [u8], src: &str) {
    let src = src.as_bytes();
    for (idx, byte) in dst.iter_mut().enumerate() {
        let hi = src.get(idx * 2).copied().and_then(hex_digit).unwrap_or(0);
        let lo = src.get(idx * 2 + 1).copied().and_then(hex_digit).unwrap_or(0);
        *byte = (hi << 4) | lo;
    }
}

pub fn is_zero(data: &[u8]) -> bool {
    data.iter().all(|&b| b == 0)
}

#[macro_export]
macro_rules! impl_debug_deserialize_serialize_hexstring {
    ($for:ident) => {
        impl std::fmt::Debug for $for {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_tuple(stringify!($for))
                    .field(&$crate::utils::Hexstring(&self.0[..]))
                    .finish()
            }
        }

        impl std::fmt::Display for $for {
            fn fmt(&self, f: &mut core::fmt::Formatter) -> std::fmt::Result {
                std::fmt::Debug::fmt(&$crate::utils::Hexstring(&self.0[..]), f)
            }
        }

        impl<'de> serde::Deserialize<'de> for $for {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                struct StrVisitor;
                impl<'de> serde::de::Visitor<'de> for StrVisitor {
                    type Value = $for;

                    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                        formatter.write_str("a character hexstring")
                    }

                    fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
                    where
                        E: serde::de::Error,
                    {
                        let mut value = [0; std::mem::size_of::<$for>()];
                        if s.len() != std::mem::size_of::<$for>() * 2 {
                            return Err(E::invalid_length(s.len(), &self));
                        }
                        if !$crate::utils::is_hexstring(s) {
                            return Err(E::invalid_value(serde::de::Unexpected::Str(s), &self));
                        }
                        $crate::utils::decode_hex_lossy(&mut value, s);
                        Ok($for(value))
                    }
                }

                deserializer.deserialize_str(StrVisitor)
            }
        }

        impl serde::Serialize for $for {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.collect_str(self)
            }
        }
    };
}

pub fn align_down<T: Num + Not<Output = T> + BitAnd<Output = T> + Copy>(addr: T, align: T) -> T {
    addr & !(align - T::one())
}

pub fn align_up<T: Num + Not<Output = T> + BitAnd<Output = T> + Copy>(addr: T, align: T) -> T {
    align_down(addr + (align - T::one()), align)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lossy_decode_zero_fills_short_input() {
        let mut buf = [0xFF; 4];
        decode_hex_lossy(&mut buf, "a1B2");
        assert_eq!(buf, [0xA1, 0xB2, 0, 0]);
    }

    #[test]
    fn lossy_decode_truncates_long_input() {
        let mut buf = [0; 2];
        decode_hex_lossy(&mut buf, "0102030405");
        assert_eq!(buf, [1, 2]);
    }

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_down(0x3FFu64, 0x200), 0x200);
        assert_eq!(align_up(0x201u64, 0x200), 0x400);
        assert_eq!(align_up(0x400u64, 0x200), 0x400);
    }
}
