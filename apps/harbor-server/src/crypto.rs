//! Opaque byte-transform collaborator for message bodies. The real
//! encryption-at-rest implementation lives outside this service; the store
//! only ever sees ciphertext.

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("ciphertext is not valid utf-8 after decryption")]
    InvalidPlaintext,
}

pub trait MessageCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Vec<u8>;
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError>;
}

/// Identity transform used in dev and tests.
pub struct PassthroughCipher;

impl MessageCipher for PassthroughCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        plaintext.to_vec()
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        Ok(ciphertext.to_vec())
    }
}
