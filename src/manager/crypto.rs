//! Encryption of secret values at rest.
//!
//! Values are encrypted to an X25519 age recipient and stored base64
//! encoded. The identity string travels in the security section of
//! snapshots so another manager can decrypt restored secrets.

use age::secrecy::ExposeSecret;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::io::{Read, Write};

use crate::error::{Result, StateError};

/// Encrypts and decrypts secret values.
#[derive(Clone)]
pub struct SecretCipher {
    identity: age::x25519::Identity,
    recipient: age::x25519::Recipient,
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCipher")
            .field("recipient", &self.recipient.to_string())
            .finish_non_exhaustive()
    }
}

impl SecretCipher {
    /// Creates a cipher with a fresh identity.
    #[must_use]
    pub fn generate() -> Self {
        let identity = age::x25519::Identity::generate();
        let recipient = identity.to_public();
        Self {
            identity,
            recipient,
        }
    }

    /// Creates a cipher from an `AGE-SECRET-KEY-...` string.
    ///
    /// # Errors
    ///
    /// Returns a cipher error if the key cannot be parsed.
    pub fn from_key(key: &str) -> Result<Self> {
        let identity = key
            .trim()
            .parse::<age::x25519::Identity>()
            .map_err(|e| StateError::cipher(format!("invalid encryption key: {e}")))?;
        let recipient = identity.to_public();
        Ok(Self {
            identity,
            recipient,
        })
    }

    /// Returns the identity string.
    #[must_use]
    pub fn key(&self) -> String {
        self.identity.to_string().expose_secret().clone()
    }

    /// Encrypts a value, returning base64 text.
    ///
    /// # Errors
    ///
    /// Returns a cipher error if encryption fails.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let encryptor = age::Encryptor::with_recipients(vec![Box::new(self.recipient.clone())])
            .ok_or_else(|| StateError::cipher("no valid encryption recipients"))?;

        let mut encrypted = vec![];
        let mut writer = encryptor
            .wrap_output(&mut encrypted)
            .map_err(|e| StateError::cipher(e.to_string()))?;
        writer
            .write_all(plaintext.as_bytes())
            .map_err(|e| StateError::cipher(e.to_string()))?;
        writer
            .finish()
            .map_err(|e| StateError::cipher(e.to_string()))?;

        Ok(STANDARD.encode(encrypted))
    }

    /// Decrypts a value produced by [`Self::encrypt`].
    ///
    /// # Errors
    ///
    /// Returns a cipher error if the text is not valid ciphertext for this
    /// identity.
    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let ciphertext = STANDARD
            .decode(encoded.trim())
            .map_err(|e| StateError::cipher(format!("invalid base64: {e}")))?;

        let age::Decryptor::Recipients(decryptor) = age::Decryptor::new(ciphertext.as_slice())
            .map_err(|e| StateError::cipher(e.to_string()))?
        else {
            return Err(StateError::cipher("unexpected decryptor type").into());
        };

        let identity: &dyn age::Identity = &self.identity;
        let mut reader = decryptor
            .decrypt(std::iter::once(identity))
            .map_err(|e| StateError::cipher(e.to_string()))?;

        let mut decrypted = vec![];
        reader
            .read_to_end(&mut decrypted)
            .map_err(|e| StateError::cipher(e.to_string()))?;

        String::from_utf8(decrypted)
            .map_err(|e| StateError::cipher(format!("decrypted value is not UTF-8: {e}")).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ciphertext_hides_value() {
        let cipher = SecretCipher::generate();
        let encrypted = cipher.encrypt("hunter2").unwrap();
        assert!(!encrypted.contains("hunter2"));
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), "hunter2");
    }

    #[test]
    fn test_key_reload() {
        let cipher = SecretCipher::generate();
        let encrypted = cipher.encrypt("value").unwrap();

        let reloaded = SecretCipher::from_key(&cipher.key()).unwrap();
        assert_eq!(reloaded.decrypt(&encrypted).unwrap(), "value");
    }

    #[test]
    fn test_wrong_key_fails() {
        let encrypted = SecretCipher::generate().encrypt("value").unwrap();
        assert!(SecretCipher::generate().decrypt(&encrypted).is_err());
        assert!(SecretCipher::from_key("not-a-key").is_err());
    }
}
