//! Credential-blob encryption at rest.
//!
//! Account credentials are stored as `enc:<base64(nonce || ciphertext)>`
//! (AES-256-GCM, key derived via SHA-256 of the env secret). With no key
//! configured, blobs pass through as plaintext; legacy plaintext rows
//! decrypt as themselves either way.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256};

const ENCRYPTED_PREFIX: &str = "enc:";

fn encryption_key() -> Option<[u8; 32]> {
    let raw = std::env::var("SUB2API_CREDENTIAL_KEY")
        .or_else(|_| std::env::var("AUTH_SECRET"))
        .ok()
        .filter(|s| !s.is_empty())?;

    let hash = Sha256::digest(raw.as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(&hash);
    Some(key)
}

/// Encrypt a credential for storage. Plaintext passthrough when no key.
pub fn encrypt_secret(plaintext: &str) -> String {
    let Some(key_bytes) = encryption_key() else {
        return plaintext.to_string();
    };

    use aes_gcm::aead::{Aead, KeyInit, OsRng};
    use aes_gcm::{AeadCore, Aes256Gcm};

    let cipher = Aes256Gcm::new_from_slice(&key_bytes).expect("AES-256-GCM key is exactly 32 bytes");
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    match cipher.encrypt(&nonce, plaintext.as_bytes()) {
        Ok(ciphertext) => {
            let mut combined = nonce.to_vec();
            combined.extend_from_slice(&ciphertext);
            format!("{}{}", ENCRYPTED_PREFIX, STANDARD.encode(&combined))
        }
        Err(e) => {
            tracing::error!("credential encryption failed: {e} — storing plaintext");
            plaintext.to_string()
        }
    }
}

/// Decrypt a stored credential. Handles legacy plaintext rows.
pub fn decrypt_secret(stored: &str) -> Option<String> {
    if !stored.starts_with(ENCRYPTED_PREFIX) {
        return Some(stored.to_string());
    }

    let key_bytes = encryption_key()?;
    let combined = STANDARD.decode(&stored[ENCRYPTED_PREFIX.len()..]).ok()?;
    if combined.len() < 12 {
        tracing::error!("credential decryption: data too short");
        return None;
    }

    use aes_gcm::aead::{Aead, KeyInit};
    use aes_gcm::{Aes256Gcm, Nonce};

    let (nonce_bytes, ciphertext) = combined.split_at(12);
    let nonce = Nonce::from_slice(nonce_bytes);
    let cipher = Aes256Gcm::new_from_slice(&key_bytes).expect("AES-256-GCM key is exactly 32 bytes");

    match cipher.decrypt(nonce, ciphertext) {
        Ok(plaintext) => String::from_utf8(plaintext).ok(),
        Err(e) => {
            tracing::error!("credential decryption failed: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plaintext_round_trips_without_key() {
        // Tests run without SUB2API_CREDENTIAL_KEY in the environment.
        if encryption_key().is_some() {
            return;
        }
        let stored = encrypt_secret("sk-test-123");
        assert_eq!(stored, "sk-test-123");
        assert_eq!(decrypt_secret(&stored).as_deref(), Some("sk-test-123"));
    }

    #[test]
    fn legacy_plaintext_decrypts_as_itself() {
        assert_eq!(decrypt_secret("sk-legacy").as_deref(), Some("sk-legacy"));
    }
}
