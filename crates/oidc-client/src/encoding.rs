//! base64url and random-string helpers.

use crate::error::{OidcError, Result};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand_core::{OsRng, TryRngCore as _};

/// RFC 4648 §5 base64url without padding.
#[must_use]
pub fn base64url_encode(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// Decode base64url, tolerating inputs that kept their `=` padding.
pub fn base64url_decode(input: &str) -> Result<Vec<u8>> {
    let trimmed = input.trim_end_matches('=');
    URL_SAFE_NO_PAD
        .decode(trimmed)
        .map_err(|source| OidcError::Decode { source })
}

/// `len` bytes from the operating system CSPRNG.
pub fn random_bytes(len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    OsRng.try_fill_bytes(&mut buf).map_err(|e| OidcError::Encode {
        message: format!("system RNG failure: {e}"),
    })?;
    Ok(buf)
}

/// Hex-encode `length` random bytes. `length` must be in `[1, 1024]`.
pub fn generate_random_string(length: usize) -> Result<String> {
    if length == 0 {
        return Err(OidcError::InvalidLength);
    }
    if length > 1024 {
        return Err(OidcError::LengthExceeded);
    }
    Ok(hex::encode(random_bytes(length)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64url_round_trips_arbitrary_bytes() {
        for data in [
            &b""[..],
            &b"f"[..],
            &b"fo"[..],
            &b"foo"[..],
            &[0xff, 0x00, 0x7f, 0x80][..],
            &[0u8; 57][..],
        ] {
            let encoded = base64url_encode(data);
            assert!(!encoded.contains('='));
            assert_eq!(base64url_decode(&encoded).expect("decode"), data);
        }
    }

    #[test]
    fn decode_accepts_padded_input() {
        // "fo" encodes as "Zm8" unpadded, "Zm8=" padded.
        assert_eq!(base64url_decode("Zm8=").expect("decode"), b"fo");
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = base64url_decode("not base64url!").unwrap_err();
        assert_eq!(err.code(), "DECODE_ERROR");
    }

    #[test]
    fn random_string_length_bounds() {
        assert_eq!(generate_random_string(0).unwrap_err().code(), "INVALID_LENGTH");
        assert_eq!(
            generate_random_string(1025).unwrap_err().code(),
            "LENGTH_EXCEEDED"
        );
        let s = generate_random_string(32).expect("generate");
        assert_eq!(s.len(), 64);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
