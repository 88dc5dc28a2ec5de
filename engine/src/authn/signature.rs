//! HMAC-SHA256 request signatures
//!
//! Header format: `sha256=<lowercase hex digest of the raw body>`.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::errors::ShipyardError;
use crate::utils::hex;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-shipyard-signature";
const SCHEME: &str = "sha256=";

fn mac(secret: &[u8]) -> Result<HmacSha256, ShipyardError> {
    HmacSha256::new_from_slice(secret)
        .map_err(|e| ShipyardError::SignatureError(format!("invalid key: {}", e)))
}

/// Signature header value for `body`
pub fn sign(secret: &[u8], body: &[u8]) -> Result<String, ShipyardError> {
    let mut mac = mac(secret)?;
    mac.update(body);
    Ok(format!("{}{}", SCHEME, hex::encode(mac.finalize().into_bytes())))
}

/// Check a signature header against `body` in constant time
pub fn verify(secret: &[u8], body: &[u8], header: &str) -> Result<(), ShipyardError> {
    let digest = header
        .trim()
        .strip_prefix(SCHEME)
        .and_then(hex::decode)
        .ok_or_else(|| ShipyardError::SignatureError("malformed signature header".to_string()))?;
    let mut mac = mac(secret)?;
    mac.update(body);
    mac.verify_slice(&digest)
        .map_err(|_| ShipyardError::SignatureError("signature mismatch".to_string()))
}
