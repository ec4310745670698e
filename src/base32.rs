//! RFC 4648 base32 codec for TOTP shared secrets.
//!
//! Decoding is case-insensitive and ignores whitespace, so secrets copied
//! from a grouped display (`JBSW Y3DP ...`) decode as-is. Padding is
//! optional, but when present it has to complete the last group. Unused
//! trailing bits must be zero, so every byte string has exactly one
//! encoding.

use data_encoding::{DecodeError, DecodeKind, BASE32, BASE32_NOPAD};
use thiserror::Error;

const PAD: char = '=';

/// Base32 decoding failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Base32Error {
    /// Character outside `A-Z2-7`
    #[error("invalid character {character:?} at position {position}")]
    InvalidCharacter { character: char, position: usize },

    /// Number of symbols cannot come from whole bytes
    #[error("invalid length: {0} symbols")]
    InvalidLength(usize),

    /// Padding in the wrong place or of the wrong size
    #[error("inconsistent padding")]
    InvalidPadding,

    /// Leftover bits of the last symbol are not zero
    #[error("non-canonical trailing bits at position {0}")]
    TrailingBits(usize),
}

/// Encode bytes, padding the output to a multiple of 8 characters.
pub fn encode(input: &[u8]) -> String {
    BASE32.encode(input)
}

/// Encode bytes without trailing `=`, as authenticator apps expect.
pub fn encode_unpadded(input: &[u8]) -> String {
    BASE32_NOPAD.encode(input)
}

/// Decode a base32 string.
pub fn decode(input: &str) -> Result<Vec<u8>, Base32Error> {
    let cleaned: String = input
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect();

    let encoding = if cleaned.contains(PAD) { &BASE32 } else { &BASE32_NOPAD };
    encoding
        .decode(cleaned.as_bytes())
        .map_err(|e| decode_error(&cleaned, e))
}

fn decode_error(cleaned: &str, error: DecodeError) -> Base32Error {
    match error.kind {
        DecodeKind::Symbol => Base32Error::InvalidCharacter {
            character: cleaned
                .get(error.position..)
                .and_then(|rest| rest.chars().next())
                .unwrap_or(char::REPLACEMENT_CHARACTER),
            position: error.position,
        },
        DecodeKind::Trailing => Base32Error::TrailingBits(error.position),
        DecodeKind::Padding => Base32Error::InvalidPadding,
        _ => Base32Error::InvalidLength(cleaned.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    #[test]
    fn test_rfc4648_vectors() {
        let vectors = [
            ("", ""),
            ("f", "MY======"),
            ("fo", "MZXQ===="),
            ("foo", "MZXW6==="),
            ("foob", "MZXW6YQ="),
            ("fooba", "MZXW6YTB"),
            ("foobar", "MZXW6YTBOI======"),
        ];

        for (plain, encoded) in vectors {
            assert_eq!(encode(plain.as_bytes()), encoded);
            assert_eq!(decode(encoded).unwrap(), plain.as_bytes());
        }
    }

    #[test]
    fn test_known_secret() {
        let bytes = decode("JBSWY3DPEHPK3PXP").unwrap();
        assert_eq!(bytes, b"Hello!\xde\xad\xbe\xef");
        assert_eq!(encode_unpadded(&bytes), "JBSWY3DPEHPK3PXP");
    }

    #[test]
    fn test_decode_is_lenient_about_case_and_spacing() {
        assert_eq!(decode("jbsw y3dp ehpk 3pxp").unwrap(), decode("JBSWY3DPEHPK3PXP").unwrap());
        assert_eq!(decode("MZXW6").unwrap(), b"foo");
        assert_eq!(decode("mzxw6===").unwrap(), b"foo");
    }

    #[test]
    fn test_invalid_character() {
        assert_eq!(
            decode("JBSWY1DP"),
            Err(Base32Error::InvalidCharacter {
                character: '1',
                position: 5
            })
        );
        assert_eq!(
            decode("MZü"),
            Err(Base32Error::InvalidCharacter {
                character: 'ü',
                position: 2
            })
        );
    }

    #[test]
    fn test_invalid_length() {
        assert_eq!(decode("MZX"), Err(Base32Error::InvalidLength(3)));
        assert_eq!(decode("A"), Err(Base32Error::InvalidLength(1)));
        // five symbols need three pad characters, not two
        assert_eq!(decode("MZXW6=="), Err(Base32Error::InvalidLength(7)));
    }

    #[test]
    fn test_bad_padding_is_rejected() {
        // data after padding
        assert!(decode("MY=====A").is_err());
        // padding after a full group
        assert!(decode("MZXW6YTB========").is_err());
    }

    #[test]
    fn test_trailing_bits_must_be_zero() {
        // "MZ" carries two stray bits after the byte "f"
        assert_eq!(decode("MY").unwrap(), b"f");
        assert!(matches!(decode("MZ"), Err(Base32Error::TrailingBits(_))));
        assert!(matches!(decode("MZ======"), Err(Base32Error::TrailingBits(_))));
    }

    #[test]
    fn test_round_trip_lengths() {
        let mut rng = rand::thread_rng();
        for len in 10..=64 {
            let mut bytes = vec![0u8; len];
            rng.fill_bytes(&mut bytes);

            assert_eq!(decode(&encode(&bytes)).unwrap(), bytes);
            assert_eq!(decode(&encode_unpadded(&bytes)).unwrap(), bytes);
            assert_eq!(encode(&bytes).len() % 8, 0);
        }
    }
}
