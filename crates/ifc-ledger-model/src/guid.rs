//! IFC `GlobalId` generation: 128 bits packed into 22 characters of the
//! IFC base-64 alphabet.

use ulid::Ulid;

const ALPHABET: &[u8; 64] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz_$";

/// Fresh identifier for instances created during write-back.
#[must_use]
pub fn new_ifc_guid() -> String {
    compress_guid(u128::from(Ulid::new()))
}

/// The leading character carries the top 2 bits, the remaining 21 carry
/// 6 bits each.
#[must_use]
pub fn compress_guid(value: u128) -> String {
    (0..22)
        .rev()
        .map(|group| {
            let digit = (value >> (6 * group)) & 0x3f;
            char::from(ALPHABET[usize::try_from(digit).unwrap_or_default()])
        })
        .collect()
}

#[must_use]
pub fn expand_guid(encoded: &str) -> Option<u128> {
    if encoded.len() != 22 {
        return None;
    }
    let mut value = 0_u128;
    for (index, byte) in encoded.bytes().enumerate() {
        let digit = ALPHABET.iter().position(|candidate| *candidate == byte)?;
        if index == 0 && digit > 3 {
            return None;
        }
        value = (value << 6) | u128::try_from(digit).ok()?;
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_values_compress() {
        assert_eq!(compress_guid(0), "0000000000000000000000");
        assert_eq!(compress_guid(u128::MAX), "3$$$$$$$$$$$$$$$$$$$$$");
    }

    #[test]
    fn generated_guids_are_well_formed_and_distinct() {
        let first = new_ifc_guid();
        let second = new_ifc_guid();
        assert_eq!(first.len(), 22);
        assert_ne!(first, second);
        assert!(expand_guid(&first).is_some());
    }

    #[test]
    fn expand_inverts_compress() {
        let value = 0x0123_4567_89ab_cdef_fedc_ba98_7654_3210_u128;
        assert_eq!(expand_guid(&compress_guid(value)), Some(value));
        assert_eq!(expand_guid("4000000000000000000000"), None);
        assert_eq!(expand_guid("short"), None);
    }
}
