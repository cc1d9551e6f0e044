use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::AuthenticationError;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Verify a GitHub-style HMAC signature over the raw request body.
/// Expects header value like "sha256=<hex>".
pub fn verify_signature(
    secret: &str,
    body: &[u8],
    signature_header: Option<&str>,
) -> Result<(), AuthenticationError> {
    if secret.is_empty() {
        return Err(AuthenticationError::MissingSecret);
    }
    let header = signature_header.ok_or(AuthenticationError::MissingSignature)?;

    let expected = header
        .strip_prefix(SIGNATURE_PREFIX)
        .and_then(|h| hex::decode(h).ok())
        .ok_or(AuthenticationError::SignatureMismatch)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| AuthenticationError::MissingSecret)?;
    mac.update(body);

    // verify_slice compares in constant time.
    mac.verify_slice(&expected)
        .map_err(|_| AuthenticationError::SignatureMismatch)
}

/// Compute the header value GitHub would send for `body`.
#[cfg(test)]
pub fn sign(secret: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length.
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac key");
    mac.update(body);
    format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "It's a Secret to Everybody";
    const BODY: &[u8] = b"Hello, World!";

    #[test]
    fn accepts_documented_github_vector() {
        // Test vector from GitHub's webhook validation docs.
        let header = "sha256=757107ea0eb2509fc211221cce984b8a37570b6d7586c22c46f4379c8b043e17";
        assert_eq!(verify_signature(SECRET, BODY, Some(header)), Ok(()));
        assert_eq!(sign(SECRET, BODY), header);
    }

    #[test]
    fn rejects_flipped_body_bit() {
        let header = sign(SECRET, BODY);
        let mut body = BODY.to_vec();
        for i in 0..body.len() * 8 {
            body[i / 8] ^= 1 << (i % 8);
            assert_eq!(
                verify_signature(SECRET, &body, Some(&header)),
                Err(AuthenticationError::SignatureMismatch)
            );
            body[i / 8] ^= 1 << (i % 8);
        }
    }

    #[test]
    fn rejects_flipped_secret_bit() {
        let header = sign(SECRET, BODY);
        let mut secret = SECRET.as_bytes().to_vec();
        secret[0] ^= 0x01;
        let secret = String::from_utf8(secret).unwrap();
        assert_eq!(
            verify_signature(&secret, BODY, Some(&header)),
            Err(AuthenticationError::SignatureMismatch)
        );
    }

    #[test]
    fn rejects_missing_inputs() {
        assert_eq!(
            verify_signature("", BODY, Some("sha256=00")),
            Err(AuthenticationError::MissingSecret)
        );
        assert_eq!(
            verify_signature(SECRET, BODY, None),
            Err(AuthenticationError::MissingSignature)
        );
    }

    #[test]
    fn rejects_wrong_prefix_and_bad_hex() {
        let hex_only = sign(SECRET, BODY).trim_start_matches(SIGNATURE_PREFIX).to_string();
        assert!(verify_signature(SECRET, BODY, Some(&hex_only)).is_err());
        assert!(verify_signature(SECRET, BODY, Some(&format!("sha1={hex_only}"))).is_err());
        assert!(verify_signature(SECRET, BODY, Some("sha256=zz")).is_err());
    }
}
