// ─────────────────────────────────────────────────────────────────────────────
// signing.rs — Request authentication
//
// Every private REST call carries three headers:
//   X-Api-Key    : the account's API key
//   X-Timestamp  : unix milliseconds at signing time
//   X-Signature  : hex(HMAC-SHA256(signing_key, "{ts}\n{method}\n{path}\n{body}"))
//
// The signing key arrives as a hex string from the environment.
// ─────────────────────────────────────────────────────────────────────────────
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub enum SigningError {
    BadKey(String),
}

impl std::fmt::Display for SigningError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SigningError::BadKey(s) => write!(f, "Bad signing key: {}", s),
        }
    }
}

/// Canonical string covered by the signature. Query strings are part of `path`.
fn canonical_payload(ts_ms: u64, method: &str, path: &str, body: &str) -> String {
    format!("{}\n{}\n{}\n{}", ts_ms, method, path, body)
}

/// Computes the hex signature for one request.
pub fn sign_request(
    signing_key_hex: &str,
    ts_ms: u64,
    method: &str,
    path: &str,
    body: &str,
) -> Result<String, SigningError> {
    let key = hex::decode(signing_key_hex.trim_start_matches("0x"))
        .map_err(|e| SigningError::BadKey(e.to_string()))?;
    if key.is_empty() {
        return Err(SigningError::BadKey("empty key".to_string()));
    }
    let mut mac = HmacSha256::new_from_slice(&key)
        .map_err(|e| SigningError::BadKey(e.to_string()))?;
    mac.update(canonical_payload(ts_ms, method, path, body).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_is_stable() {
        let a = sign_request("deadbeef", 1_700_000_000_000, "POST", "/orders", "{}").unwrap();
        let b = sign_request("deadbeef", 1_700_000_000_000, "POST", "/orders", "{}").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64); // 32 bytes hex
    }

    #[test]
    fn test_signature_covers_every_field() {
        let base = sign_request("deadbeef", 1, "POST", "/orders", "{}").unwrap();
        assert_ne!(base, sign_request("deadbeef", 2, "POST", "/orders", "{}").unwrap());
        assert_ne!(base, sign_request("deadbeef", 1, "GET", "/orders", "{}").unwrap());
        assert_ne!(base, sign_request("deadbeef", 1, "POST", "/positions", "{}").unwrap());
        assert_ne!(base, sign_request("deadbeef", 1, "POST", "/orders", "{\"a\":1}").unwrap());
    }

    #[test]
    fn test_0x_prefix_accepted() {
        let plain = sign_request("deadbeef", 1, "GET", "/p", "").unwrap();
        let prefixed = sign_request("0xdeadbeef", 1, "GET", "/p", "").unwrap();
        assert_eq!(plain, prefixed);
    }

    #[test]
    fn test_bad_key_rejected() {
        assert!(sign_request("not-hex", 1, "GET", "/p", "").is_err());
        assert!(sign_request("", 1, "GET", "/p", "").is_err());
    }
}
