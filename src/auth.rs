//! SAS token derivation for the broker session.
//!
//! The device authenticates with a short-lived SharedAccessSignature derived
//! from its base64 shared key instead of a static password. Signing is a pure
//! function of its inputs: given the same resource, device id, key, ttl and
//! clock reading it always produces the same token, which keeps it trivially
//! testable and callable without any network access.
//!
//! The caller is responsible for only signing once wall-clock time is valid;
//! a token stamped with an unsynchronized clock carries a bogus expiry and the
//! broker will reject the session.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum SigningError {
    /// The shared key was not valid base64.
    #[error("device key is not valid base64: {0}")]
    InvalidKeyEncoding(#[from] base64::DecodeError),

    /// The HMAC primitive rejected the key material.
    #[error("HMAC-SHA256 failure: {0}")]
    SigningFailure(String),
}

/// Percent-encodes a string for use inside the signature.
///
/// Alphanumerics and `-_.~` pass through untouched; every other byte becomes
/// `%XX` with uppercase hex digits.
pub fn percent_encode(input: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(input.len());
    for &b in input.as_bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(b as char);
        } else {
            out.push('%');
            out.push(HEX[(b >> 4) as usize] as char);
            out.push(HEX[(b & 0x0F) as usize] as char);
        }
    }
    out
}

/// Builds a SharedAccessSignature for `resource_uri` scoped to `device_id`.
///
/// The signable string is `percent_encode(resource) + "\n" + expiry`, keyed by
/// the base64-decoded shared key, MACed with HMAC-SHA256. The resource is the
/// lowercased `{resource_uri}/devices/{device_id}`.
pub fn sign(
    resource_uri: &str,
    device_id: &str,
    base64_key: &str,
    ttl_seconds: u64,
    now_epoch_seconds: u64,
) -> Result<String, SigningError> {
    let resource = format!("{}/devices/{}", resource_uri, device_id).to_lowercase();
    let expiry = now_epoch_seconds + ttl_seconds;
    let to_sign = format!("{}\n{}", percent_encode(&resource), expiry);

    let key = BASE64.decode(base64_key)?;
    let mut mac = HmacSha256::new_from_slice(&key)
        .map_err(|e| SigningError::SigningFailure(e.to_string()))?;
    mac.update(to_sign.as_bytes());
    let signature = percent_encode(&BASE64.encode(mac.finalize().into_bytes()));

    debug!(resource = %resource, expiry, "signed session token");

    Ok(format!(
        "SharedAccessSignature sr={}&sig={}&se={}",
        percent_encode(&resource),
        signature,
        expiry
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "c3VwZXIgc2VjcmV0IGRldmljZSBrZXkgMTIzNA==";

    #[test]
    fn percent_encoding_passes_unreserved_and_escapes_the_rest() {
        assert_eq!(percent_encode("abc-XYZ_0.9~"), "abc-XYZ_0.9~");
        assert_eq!(percent_encode("a/b c+d"), "a%2Fb%20c%2Bd");
        assert_eq!(percent_encode("="), "%3D");
    }

    #[test]
    fn sign_matches_pinned_vector() {
        let token = sign(
            "Example-Hub.azure-devices.net",
            "pir-node-01",
            KEY,
            3600,
            1_700_000_000,
        )
        .unwrap();
        assert_eq!(
            token,
            "SharedAccessSignature sr=example-hub.azure-devices.net%2Fdevices%2Fpir-node-01\
             &sig=i3oCbp0Vw%2FkftIkvboaHVkYIyeKyCEjM51w8vkDRYis%3D&se=1700003600"
        );
    }

    #[test]
    fn sign_is_deterministic_for_fixed_now() {
        let a = sign("hub.example.net", "dev", KEY, 600, 1_700_000_000).unwrap();
        let b = sign("hub.example.net", "dev", KEY, 600, 1_700_000_000).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn sign_rejects_non_base64_key() {
        let err = sign("hub.example.net", "dev", "not base64!!", 600, 1_700_000_000);
        assert!(matches!(err, Err(SigningError::InvalidKeyEncoding(_))));
    }
}
