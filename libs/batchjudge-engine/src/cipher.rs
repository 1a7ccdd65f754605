// Secret decryption boundary. Stored credentials only carry the encrypted
// form; the orchestrator decrypts right before a submission.

use batchjudge_common::types::Credential;

use crate::error::CipherError;

pub trait SecretCipher: Send + Sync {
    fn decrypt(&self, credential: &Credential) -> Result<String, CipherError>;
}

/// Identity cipher for key files that hold plain secrets
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainCipher;

impl SecretCipher for PlainCipher {
    fn decrypt(&self, credential: &Credential) -> Result<String, CipherError> {
        let secret = credential.encrypted_secret.trim();
        if secret.is_empty() {
            return Err(CipherError::Decrypt(credential.id.to_string()));
        }
        Ok(secret.to_string())
    }
}
