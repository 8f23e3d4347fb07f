use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::errors::{FsError, FsResult};

type HmacSha256 = Hmac<Sha256>;

/// Signed, optionally-expiring access tokens over a virtual path.
///
/// Token layout: base64url("<path>:<expiry>:<base64url(sig)>") with
/// `sig = HMAC-SHA256(secret, "<path>:<expiry>")` and `expiry = "0"` for a
/// permanent link. Rotating the secret invalidates every outstanding token.
pub fn generate(secret: &[u8], path: &str, expires_in: i64) -> String {
    let expiry = if expires_in <= 0 {
        "0".to_string()
    } else {
        (chrono::Utc::now().timestamp() + expires_in).to_string()
    };
    let message = format!("{}:{}", path, expiry);
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    let signature = mac.finalize().into_bytes();

    let token_data = format!("{}:{}", message, URL_SAFE.encode(signature));
    URL_SAFE.encode(token_data)
}

/// Validate a token and return the path it grants. Expiry is checked before
/// the signature so an expired link reads as 410, not 400; the HMAC
/// comparison itself is constant-time.
pub fn verify(secret: &[u8], token: &str) -> FsResult<String> {
    let invalid = || FsError::InvalidArgument("invalid token format".into());

    let decoded = URL_SAFE.decode(token).map_err(|_| invalid())?;
    let decoded = String::from_utf8(decoded).map_err(|_| invalid())?;

    let (rest, signature_b64) = decoded.rsplit_once(':').ok_or_else(invalid)?;
    let (path, expiry) = rest.rsplit_once(':').ok_or_else(invalid)?;
    let signature = URL_SAFE.decode(signature_b64).map_err(|_| invalid())?;

    if expiry != "0" {
        let expiry_ts: i64 = expiry.parse().map_err(|_| invalid())?;
        if chrono::Utc::now().timestamp() > expiry_ts {
            return Err(FsError::Expired);
        }
    }

    let message = format!("{}:{}", path, expiry);
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| FsError::InvalidArgument("invalid signature".into()))?;

    Ok(path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"unit-test-secret";

    #[test]
    fn round_trip() {
        let token = generate(SECRET, "/a/b.txt", 60);
        assert_eq!(verify(SECRET, &token).unwrap(), "/a/b.txt");
    }

    #[test]
    fn permanent_links_never_expire() {
        let token = generate(SECRET, "/a/b", 0);
        assert_eq!(verify(SECRET, &token).unwrap(), "/a/b");
        let token = generate(SECRET, "/a/b", -5);
        assert_eq!(verify(SECRET, &token).unwrap(), "/a/b");
    }

    #[test]
    fn expired_links_read_as_expired() {
        // Forge an already-expired token with a valid signature.
        let expiry = (chrono::Utc::now().timestamp() - 10).to_string();
        let message = format!("/a/b:{}", expiry);
        let mut mac = HmacSha256::new_from_slice(SECRET).unwrap();
        mac.update(message.as_bytes());
        let sig = URL_SAFE.encode(mac.finalize().into_bytes());
        let token = URL_SAFE.encode(format!("{}:{}", message, sig));

        assert!(matches!(verify(SECRET, &token), Err(FsError::Expired)));
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let token = generate(SECRET, "/a/b", 60);
        let mut decoded = URL_SAFE.decode(&token).unwrap();
        let last = decoded.len() - 1;
        decoded[last] ^= 0x01;
        let tampered = URL_SAFE.encode(decoded);

        assert!(matches!(
            verify(SECRET, &tampered),
            Err(FsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = generate(SECRET, "/a/b", 60);
        assert!(verify(b"another-secret", &token).is_err());
    }

    #[test]
    fn paths_with_colons_survive() {
        let token = generate(SECRET, "/odd:name/file:1.txt", 0);
        assert_eq!(verify(SECRET, &token).unwrap(), "/odd:name/file:1.txt");
    }

    #[test]
    fn garbage_tokens_are_invalid_not_expired() {
        assert!(matches!(
            verify(SECRET, "not-base64!!!"),
            Err(FsError::InvalidArgument(_))
        ));
        let no_colons = URL_SAFE.encode("plainstring");
        assert!(matches!(
            verify(SECRET, &no_colons),
            Err(FsError::InvalidArgument(_))
        ));
    }
}
