//! Key agreement and request signing primitives
//!
//! Wraps the P-256 ECDH exchange used during pairing, the HMAC-SHA256
//! request signatures used on every peer request afterwards, and the
//! 6-digit confirmation code both devices show during pairing.

use crate::error::{AgentError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{ecdh, PublicKey, SecretKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Number of decimal digits in a pairing confirmation code
pub const CONFIRM_CODE_DIGITS: usize = 6;

/// An EC P-256 key pair owned by this device.
///
/// The public half is exchanged during pairing as base64 of the
/// uncompressed SEC1 point; the private half never leaves the device.
pub struct KeyPair {
    secret: SecretKey,
}

impl KeyPair {
    /// Generate a fresh key pair
    pub fn generate() -> Self {
        Self {
            secret: SecretKey::random(&mut OsRng),
        }
    }

    /// Restore a key pair from its base64-encoded scalar bytes
    pub fn from_b64(encoded: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| AgentError::Crypto(format!("invalid private key encoding: {}", e)))?;
        let secret = SecretKey::from_slice(&bytes)
            .map_err(|e| AgentError::Crypto(format!("invalid private key: {}", e)))?;
        Ok(Self { secret })
    }

    /// Serialize the private scalar as base64 for persistence
    pub fn to_b64(&self) -> String {
        BASE64.encode(self.secret.to_bytes())
    }

    /// The public key as raw uncompressed SEC1 point bytes
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.secret
            .public_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec()
    }

    /// The public key in the wire encoding (base64 of the SEC1 point)
    pub fn public_key_b64(&self) -> String {
        BASE64.encode(self.public_key_bytes())
    }

    /// Perform ECDH against a peer public key (wire encoding) and
    /// digest the raw agreement into the 32-byte shared secret.
    ///
    /// Both sides derive the same bytes.
    pub fn shared_secret(&self, peer_public_b64: &str) -> Result<[u8; 32]> {
        let peer_bytes = decode_public_key(peer_public_b64)?;
        let peer = PublicKey::from_sec1_bytes(&peer_bytes)
            .map_err(|e| AgentError::Crypto(format!("invalid peer public key: {}", e)))?;

        let agreement = ecdh::diffie_hellman(self.secret.to_nonzero_scalar(), peer.as_affine());

        let mut hasher = Sha256::new();
        hasher.update(agreement.raw_secret_bytes());
        Ok(hasher.finalize().into())
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the private scalar
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key_b64())
            .finish()
    }
}

/// Decode a wire-encoded (base64 SEC1) public key into raw point bytes
pub fn decode_public_key(encoded: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(encoded)
        .map_err(|e| AgentError::Crypto(format!("invalid public key encoding: {}", e)))
}

/// Sign a message with HMAC-SHA256, returning lowercase hex
pub fn hmac_sign(secret: &[u8], message: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|_| AgentError::Crypto("invalid HMAC key".to_string()))?;
    mac.update(message.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verify an HMAC-SHA256 signature (lowercase hex) in constant time
pub fn hmac_verify(secret: &[u8], message: &str, signature_hex: &str) -> bool {
    let signature = match hex::decode(signature_hex) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(message.as_bytes());
    mac.verify_slice(&signature).is_ok()
}

/// Derive the pairing confirmation code from two public keys.
///
/// The keys are ordered lexicographically by raw bytes so both devices
/// compute the same code regardless of who initiated. A human compares
/// the codes out-of-band to detect a man-in-the-middle.
pub fn confirm_code(pub_a: &[u8], pub_b: &[u8]) -> String {
    let (first, second) = if pub_a <= pub_b {
        (pub_a, pub_b)
    } else {
        (pub_b, pub_a)
    };

    let mut hasher = Sha256::new();
    hasher.update(first);
    hasher.update(b"|");
    hasher.update(second);
    let digest = hasher.finalize();

    let n = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    format!("{:06}", n % 1_000_000)
}

/// SHA-256 of a byte slice as lowercase hex
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_roundtrip() {
        let pair = KeyPair::generate();
        let restored = KeyPair::from_b64(&pair.to_b64()).unwrap();
        assert_eq!(pair.public_key_b64(), restored.public_key_b64());
    }

    #[test]
    fn test_public_key_is_uncompressed_point() {
        let pair = KeyPair::generate();
        let bytes = pair.public_key_bytes();
        // Uncompressed SEC1: 0x04 || x || y
        assert_eq!(bytes.len(), 65);
        assert_eq!(bytes[0], 0x04);
    }

    #[test]
    fn test_ecdh_both_sides_agree() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();

        let secret_a = alice.shared_secret(&bob.public_key_b64()).unwrap();
        let secret_b = bob.shared_secret(&alice.public_key_b64()).unwrap();

        assert_eq!(secret_a, secret_b);
        assert_eq!(secret_a.len(), 32);
    }

    #[test]
    fn test_ecdh_rejects_garbage_key() {
        let pair = KeyPair::generate();
        assert!(pair.shared_secret("not-base64!!!").is_err());
        assert!(pair.shared_secret(&BASE64.encode([1u8; 10])).is_err());
    }

    #[test]
    fn test_hmac_sign_verify() {
        let secret = [7u8; 32];
        let signature = hmac_sign(&secret, "GET|/api/ping|1700000000000").unwrap();

        assert!(hmac_verify(&secret, "GET|/api/ping|1700000000000", &signature));
        assert!(!hmac_verify(&secret, "GET|/api/ping|1700000000001", &signature));
    }

    #[test]
    fn test_hmac_is_lowercase_hex() {
        let signature = hmac_sign(&[1u8; 32], "message").unwrap();
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_hmac_verify_rejects_tampered_signature() {
        let secret = [9u8; 32];
        let mut signature = hmac_sign(&secret, "message").unwrap();
        // Flip one hex digit
        let flipped = if signature.ends_with('0') { '1' } else { '0' };
        signature.pop();
        signature.push(flipped);
        assert!(!hmac_verify(&secret, "message", &signature));
    }

    #[test]
    fn test_hmac_verify_rejects_non_hex() {
        assert!(!hmac_verify(&[1u8; 32], "message", "zzzz"));
    }

    #[test]
    fn test_confirm_code_symmetry() {
        let a = KeyPair::generate().public_key_bytes();
        let b = KeyPair::generate().public_key_bytes();

        assert_eq!(confirm_code(&a, &b), confirm_code(&b, &a));
    }

    #[test]
    fn test_confirm_code_format() {
        let a = KeyPair::generate().public_key_bytes();
        let b = KeyPair::generate().public_key_bytes();

        let code = confirm_code(&a, &b);
        assert_eq!(code.len(), CONFIRM_CODE_DIGITS);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_confirm_code_depends_on_keys() {
        let a = KeyPair::generate().public_key_bytes();
        let b = KeyPair::generate().public_key_bytes();
        let c = KeyPair::generate().public_key_bytes();

        // Different key pairs should (overwhelmingly) give different codes
        let same = confirm_code(&a, &b) == confirm_code(&a, &c)
            && confirm_code(&a, &b) == confirm_code(&b, &c);
        assert!(!same);
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
