use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use tstream_types::{Error, Result, Secret, SecretVault};

/// Vault for devices whose cipher-text is the platform's base64-wrapped
/// secure-vault format. Decryption happens on demand; callers hold the
/// plaintext only for the lifetime of the worker that needs it.
pub struct LocalVault;

impl SecretVault for LocalVault {
    fn decrypt(&self, secret: &Secret) -> Result<String> {
        let decoded = STANDARD
            .decode(secret.cipher_text())
            .map_err(|e| Error::Secret(format!("cipher-text is not valid base64: {}", e)))?;
        String::from_utf8(decoded)
            .map_err(|e| Error::Secret(format!("decrypted secret is not UTF-8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decrypt_round_trip() {
        let vault = LocalVault;
        let secret = Secret::Inline(STANDARD.encode("hunter2"));
        assert_eq!(vault.decrypt(&secret).unwrap(), "hunter2");
    }

    #[test]
    fn test_bad_cipher_text_rejected() {
        let vault = LocalVault;
        let secret = Secret::Inline("!!! not base64 !!!".to_string());
        assert!(vault.decrypt(&secret).is_err());
    }
}
