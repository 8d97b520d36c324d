//! Encoding of a request blob into a URL path.
//!
//! AMP caches only relay GETs, so the poll request rides in the path:
//! a `'0'` format version, a random cache-breaker segment (caches key on
//! the full URL, and a stable path would pin every client to one stale
//! response), then the blob itself, base64url without padding.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::error::{ClientError, Result};

pub fn encode_path(data: &[u8]) -> String {
    let cache_breaker: [u8; 8] = rand::random();
    format!(
        "0{}/{}",
        URL_SAFE_NO_PAD.encode(cache_breaker),
        URL_SAFE_NO_PAD.encode(data)
    )
}

pub fn decode_path(path: &str) -> Result<Vec<u8>> {
    let (head, payload) = path
        .split_once('/')
        .ok_or_else(|| ClientError::Rendezvous("encoded path has no separator".to_string()))?;
    if !head.starts_with('0') {
        return Err(ClientError::Rendezvous(format!(
            "unknown path encoding version {:?}",
            head.chars().next()
        )));
    }
    URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| ClientError::Rendezvous(format!("path payload is not base64url: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let blob = b"1.0\n{\"offer\":\"...\"}";
        let path = encode_path(blob);
        assert!(path.starts_with('0'));
        assert_eq!(decode_path(&path).expect("decode"), blob);
    }

    #[test]
    fn cache_breaker_varies() {
        let a = encode_path(b"same");
        let b = encode_path(b"same");
        assert_ne!(a, b);
        // Only the cache breaker differs; the payload segment matches.
        assert_eq!(a.rsplit('/').next(), b.rsplit('/').next());
    }

    #[test]
    fn rejects_bad_version_and_shape() {
        assert!(decode_path("no-separator").is_err());
        assert!(decode_path("1abc/AAAA").is_err());
    }
}
