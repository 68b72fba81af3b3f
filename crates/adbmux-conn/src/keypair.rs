//! The signing seam.
//!
//! Key generation, storage and the RSA primitive live outside this crate;
//! the handshake only needs something that can sign a challenge token and
//! hand out the public key in the device's expected encoding.

/// Error returned by a key pair that could not produce a signature.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct SignError(pub String);

/// A client key pair as seen by the handshake.
pub trait AdbKeyPair: Send + Sync {
    /// Sign the challenge token sent by the device.
    fn sign(&self, token: &[u8]) -> Result<Vec<u8>, SignError>;

    /// Public key bytes sent when the device rejects the signature.
    ///
    /// Opaque to the protocol layer; `adbd` expects the base64 key followed
    /// by a space, a user@host comment and a trailing NUL.
    fn public_key_bytes(&self) -> Vec<u8>;
}

impl<K: AdbKeyPair + ?Sized> AdbKeyPair for std::sync::Arc<K> {
    fn sign(&self, token: &[u8]) -> Result<Vec<u8>, SignError> {
        (**self).sign(token)
    }

    fn public_key_bytes(&self) -> Vec<u8> {
        (**self).public_key_bytes()
    }
}
