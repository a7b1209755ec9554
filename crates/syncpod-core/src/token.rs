//! Session token verification.
//!
//! The edge relay authenticates users and issues each session an opaque
//! token; the pod only re-checks the HMAC signature against the shared
//! secret and extracts the user id. The edge is trusted for identity.
//!
//! Token layout (ASCII): `user_id.expires_unix_ms.mac_hex` where `mac` is
//! HMAC-SHA256 over `user_id.expires_unix_ms`.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Why a token was rejected.
///
/// All variants surface to the client as `Error(code=Unauthorized)`; the
/// distinction exists for logging and counters only.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// Token did not have the `user.expiry.mac` shape.
    #[error("malformed token")]
    Malformed,

    /// Signature did not verify against the shared secret.
    #[error("bad token signature")]
    BadSignature,

    /// Token expiry is in the past.
    #[error("token expired at {expires_ms}")]
    Expired {
        /// Expiry carried by the token (unix ms).
        expires_ms: u64,
    },
}

/// Verified claims extracted from a session token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    /// Authenticated user id.
    pub user_id: String,
    /// Expiry (unix ms).
    pub expires_ms: u64,
}

/// Verify a session token and extract its claims.
///
/// Verification order: shape, signature, expiry. The signature check uses
/// the `Mac` API's constant-time comparison.
///
/// # Errors
///
/// See [`TokenError`].
pub fn verify(token: &str, secret: &[u8], now_wall_ms: u64) -> Result<TokenClaims, TokenError> {
    let mut parts = token.rsplitn(2, '.');
    let mac_hex = parts.next().ok_or(TokenError::Malformed)?;
    let signed = parts.next().ok_or(TokenError::Malformed)?;

    let (user_id, expires_str) = signed.rsplit_once('.').ok_or(TokenError::Malformed)?;
    if user_id.is_empty() {
        return Err(TokenError::Malformed);
    }
    let expires_ms: u64 = expires_str.parse().map_err(|_| TokenError::Malformed)?;

    let mac_bytes = hex_decode(mac_hex).ok_or(TokenError::Malformed)?;

    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| TokenError::BadSignature)?;
    mac.update(signed.as_bytes());
    mac.verify_slice(&mac_bytes).map_err(|_| TokenError::BadSignature)?;

    if expires_ms <= now_wall_ms {
        return Err(TokenError::Expired { expires_ms });
    }

    Ok(TokenClaims { user_id: user_id.to_string(), expires_ms })
}

/// Mint a token the way the edge does.
///
/// The pod never mints tokens in production; this exists for tests and
/// local development against a pod without an edge in front of it.
#[must_use]
pub fn mint(user_id: &str, expires_ms: u64, secret: &[u8]) -> String {
    let signed = format!("{user_id}.{expires_ms}");

    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(signed.as_bytes());
    let tag = mac.finalize().into_bytes();

    format!("{signed}.{}", hex_encode(&tag))
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

fn hex_decode(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"test-shared-secret";

    #[test]
    fn mint_then_verify() {
        let token = mint("u1", 10_000, SECRET);
        let claims = verify(&token, SECRET, 5_000).unwrap();
        assert_eq!(claims.user_id, "u1");
        assert_eq!(claims.expires_ms, 10_000);
    }

    #[test]
    fn user_id_may_contain_dots() {
        let token = mint("org.example.u1", 10_000, SECRET);
        let claims = verify(&token, SECRET, 0).unwrap();
        assert_eq!(claims.user_id, "org.example.u1");
    }

    #[test]
    fn wrong_secret_rejected() {
        let token = mint("u1", 10_000, SECRET);
        assert_eq!(verify(&token, b"other-secret", 0), Err(TokenError::BadSignature));
    }

    #[test]
    fn tampered_user_rejected() {
        let token = mint("u1", 10_000, SECRET);
        let tampered = token.replacen("u1", "u2", 1);
        assert_eq!(verify(&tampered, SECRET, 0), Err(TokenError::BadSignature));
    }

    #[test]
    fn expired_rejected() {
        let token = mint("u1", 10_000, SECRET);
        assert_eq!(verify(&token, SECRET, 10_000), Err(TokenError::Expired { expires_ms: 10_000 }));
    }

    #[test]
    fn malformed_shapes_rejected() {
        for bad in ["", "u1", "u1.123", "u1.notanumber.abcd", ".123.abcd", "u1.123.zzzz"] {
            let err = verify(bad, SECRET, 0).unwrap_err();
            assert!(
                matches!(err, TokenError::Malformed | TokenError::BadSignature),
                "{bad:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn hex_round_trip() {
        let bytes = [0x00, 0x0f, 0xab, 0xff];
        assert_eq!(hex_decode(&hex_encode(&bytes)).unwrap(), bytes);
    }
}
