//! Secure password generation for master and per-app credentials.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use crate::error::{PoolError, PoolResult};

pub const MIN_PASSWORD_LENGTH: usize = 8;
pub const MAX_PASSWORD_LENGTH: usize = 128;

/// Generate a URL-safe random secret of exactly `length` characters.
///
/// Draws `ceil(length * 3 / 4)` bytes plus a little slack from the OS
/// entropy source, base64url-encodes them, and truncates.
pub fn generate_secure_password(length: usize) -> PoolResult<String> {
    if !(MIN_PASSWORD_LENGTH..=MAX_PASSWORD_LENGTH).contains(&length) {
        return Err(PoolError::InvalidParameter(format!(
            "password length {length} outside {MIN_PASSWORD_LENGTH}..={MAX_PASSWORD_LENGTH}"
        )));
    }

    let mut buf = vec![0u8; (length * 3).div_ceil(4) + 3];
    getrandom::getrandom(&mut buf).map_err(|e| PoolError::GenerationFailed(e.to_string()))?;

    let mut encoded = URL_SAFE_NO_PAD.encode(&buf);
    if encoded.len() < length {
        return Err(PoolError::EncodingTooShort {
            wanted: length,
            got: encoded.len(),
        });
    }
    encoded.truncate(length);
    Ok(encoded)
}
