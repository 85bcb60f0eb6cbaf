// Versioned private-key encryption, spec §6 / §9 "Key material". Two formats, distinguished by
// a literal prefix so the parser can reject anything it doesn't recognize rather than guess:
//
//   enc:v2:<salt>:<iv>:<tag>:<ct>   password-derived key, for a user's own imported key
//   enc:v3:<iv>:<tag>:<ct>          JWT_SECRET-derived key, for server-managed/admin keys
//
// Both use AES-256-GCM; v2 additionally carries a random salt because each user's passphrase
// produces a different derived key, while v3's "passphrase" is the single process-wide
// JWT_SECRET, so there's nothing per-record to salt against beyond the IV itself.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine as _;
use rand::RngCore;
use sha2::{Digest, Sha256};

const V2_PREFIX: &str = "enc:v2:";
const V3_PREFIX: &str = "enc:v3:";

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("unrecognized key encoding prefix")]
    UnknownFormat,
    #[error("malformed encrypted key: {0}")]
    Malformed(String),
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("JWT_SECRET is required to decrypt or encrypt v3 keys")]
    MissingJwtSecret,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFormat {
    V2,
    V3,
}

pub fn detect_format(encoded: &str) -> Result<KeyFormat, CryptoError> {
    if encoded.starts_with(V2_PREFIX) {
        Ok(KeyFormat::V2)
    } else if encoded.starts_with(V3_PREFIX) {
        Ok(KeyFormat::V3)
    } else {
        Err(CryptoError::UnknownFormat)
    }
}

/// Encrypt `plaintext` (a PEM private key) under a key derived from `passphrase`, producing the
/// `enc:v2:...` form. A fresh random salt and IV are generated for every call.
pub fn encrypt_v2(plaintext: &[u8], passphrase: &str) -> Result<String, CryptoError> {
    let mut salt = [0u8; 16];
    OsRng.fill_bytes(&mut salt);
    let key_bytes = derive_key(passphrase.as_bytes(), &salt);
    let (iv, tag, ct) = seal(&key_bytes, plaintext)?;
    Ok(format!(
        "{V2_PREFIX}{}:{}:{}:{}",
        b64(&salt),
        b64(&iv),
        b64(&tag),
        b64(&ct)
    ))
}

pub fn decrypt_v2(encoded: &str, passphrase: &str) -> Result<Vec<u8>, CryptoError> {
    let rest = encoded
        .strip_prefix(V2_PREFIX)
        .ok_or(CryptoError::UnknownFormat)?;
    let parts: Vec<&str> = rest.split(':').collect();
    let [salt, iv, tag, ct] = parts[..] else {
        return Err(CryptoError::Malformed("expected salt:iv:tag:ct".to_string()));
    };
    let salt = unb64(salt)?;
    let key_bytes = derive_key(passphrase.as_bytes(), &salt);
    open(&key_bytes, &unb64(iv)?, &unb64(tag)?, &unb64(ct)?)
}

/// Encrypt under a key derived from `JWT_SECRET` with a fixed, crate-wide salt (spec's Open
/// Question §9: rotating `JWT_SECRET` invalidates every v3-encrypted key; there is no migration
/// path, operators must re-import keys after a rotation).
pub fn encrypt_v3(plaintext: &[u8], jwt_secret: &str) -> Result<String, CryptoError> {
    let key_bytes = derive_key(jwt_secret.as_bytes(), FIXED_V3_SALT);
    let (iv, tag, ct) = seal(&key_bytes, plaintext)?;
    Ok(format!("{V3_PREFIX}{}:{}:{}", b64(&iv), b64(&tag), b64(&ct)))
}

pub fn decrypt_v3(encoded: &str, jwt_secret: &str) -> Result<Vec<u8>, CryptoError> {
    let rest = encoded
        .strip_prefix(V3_PREFIX)
        .ok_or(CryptoError::UnknownFormat)?;
    let parts: Vec<&str> = rest.split(':').collect();
    let [iv, tag, ct] = parts[..] else {
        return Err(CryptoError::Malformed("expected iv:tag:ct".to_string()));
    };
    let key_bytes = derive_key(jwt_secret.as_bytes(), FIXED_V3_SALT);
    open(&key_bytes, &unb64(iv)?, &unb64(tag)?, &unb64(ct)?)
}

const FIXED_V3_SALT: &[u8] = b"hpc-ide-gateway-v3-key-derivation";

fn derive_key(secret: &[u8], salt: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(secret);
    hasher.finalize().into()
}

fn seal(key_bytes: &[u8; 32], plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>), CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key_bytes));
    let mut iv_bytes = [0u8; 12];
    OsRng.fill_bytes(&mut iv_bytes);
    let nonce = Nonce::from_slice(&iv_bytes);
    let mut ct_and_tag = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::DecryptionFailed)?;
    // aes-gcm appends the 16-byte tag to the ciphertext; split it out so the wire format keeps
    // tag and ciphertext as separate fields, matching the documented layout.
    let tag = ct_and_tag.split_off(ct_and_tag.len() - 16);
    Ok((iv_bytes.to_vec(), tag, ct_and_tag))
}

fn open(key_bytes: &[u8; 32], iv: &[u8], tag: &[u8], ct: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if iv.len() != 12 {
        return Err(CryptoError::Malformed("iv must be 12 bytes".to_string()));
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key_bytes));
    let nonce = Nonce::from_slice(iv);
    let mut combined = Vec::with_capacity(ct.len() + tag.len());
    combined.extend_from_slice(ct);
    combined.extend_from_slice(tag);
    cipher
        .decrypt(nonce, combined.as_ref())
        .map_err(|_| CryptoError::DecryptionFailed)
}

fn b64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn unb64(s: &str) -> Result<Vec<u8>, CryptoError> {
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|e| CryptoError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v2_round_trips() {
        let encoded = encrypt_v2(b"-----BEGIN KEY-----", "hunter2").unwrap();
        assert!(encoded.starts_with(V2_PREFIX));
        let decoded = decrypt_v2(&encoded, "hunter2").unwrap();
        assert_eq!(decoded, b"-----BEGIN KEY-----");
    }

    #[test]
    fn v2_wrong_passphrase_fails() {
        let encoded = encrypt_v2(b"secret bytes", "hunter2").unwrap();
        assert!(decrypt_v2(&encoded, "wrong").is_err());
    }

    #[test]
    fn v3_round_trips() {
        let encoded = encrypt_v3(b"admin key material", "jwt-secret-value").unwrap();
        assert!(encoded.starts_with(V3_PREFIX));
        let decoded = decrypt_v3(&encoded, "jwt-secret-value").unwrap();
        assert_eq!(decoded, b"admin key material");
    }

    #[test]
    fn formats_are_distinguished_by_prefix() {
        let v2 = encrypt_v2(b"x", "p").unwrap();
        let v3 = encrypt_v3(b"x", "s").unwrap();
        assert_eq!(detect_format(&v2).unwrap(), KeyFormat::V2);
        assert_eq!(detect_format(&v3).unwrap(), KeyFormat::V3);
        assert!(detect_format("enc:v1:whatever").is_err());
    }
}
