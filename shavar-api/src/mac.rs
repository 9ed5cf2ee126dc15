//! Response authentication
//!
//! Update responses and redirect payloads can carry an HMAC-SHA1 digest
//! keyed by the per-client key from `newkey`. Digests travel as web-safe
//! base64 with trailing padding.

use base64::engine::general_purpose::URL_SAFE as BASE64_URL_SAFE;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// Compute the web-safe base64 HMAC-SHA1 digest of a payload.
pub fn mac_digest(client_key: &[u8], payload: &[u8]) -> String {
    // HMAC accepts keys of any length, so new_from_slice cannot fail.
    let mut mac = HmacSha1::new_from_slice(client_key).expect("HMAC accepts any key length");
    mac.update(payload);
    BASE64_URL_SAFE.encode(mac.finalize().into_bytes())
}

/// Check a payload against the digest the server sent for it.
pub fn verify_mac(client_key: &[u8], payload: &[u8], digest: &str) -> bool {
    mac_digest(client_key, payload) == digest.trim()
}
