//! DEK wrapping under a key held by the token.
//!
//! The default mechanism is AES-CBC-PAD with an all-zero IV. Wrapping is
//! therefore deterministic per (key, plaintext) and offers no protection
//! against correlating repeated plaintexts. Stored ciphertexts depend on
//! this IV, so changing it breaks every blob already written.

use crate::error::{CryptoOp, EnvelopeError, Result};
use crate::session::Session;
use crate::token::{KeyHandle, Mechanism, Token, TokenError, TokenResult, AES_BLOCK_LEN};
use tracing::debug;
use zeroize::Zeroizing;

pub const ZERO_IV: [u8; AES_BLOCK_LEN] = [0u8; AES_BLOCK_LEN];

/// Length query, exact allocation, then fill. The result is cut to the
/// length the fill call reports.
pub(crate) fn two_phase<F>(mut call: F) -> TokenResult<Vec<u8>>
where
    F: FnMut(Option<&mut [u8]>) -> TokenResult<usize>,
{
    let required = call(None)?;
    let mut buf = vec![0u8; required];
    let written = call(Some(&mut buf))?;
    buf.truncate(written);
    Ok(buf)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrapCipher {
    mechanism: Mechanism,
}

impl Default for WrapCipher {
    fn default() -> Self {
        Self::new(Mechanism::AesCbcPad { iv: ZERO_IV })
    }
}

impl WrapCipher {
    pub fn new(mechanism: Mechanism) -> Self {
        Self { mechanism }
    }

    pub fn wrap<T: Token>(&self, session: &Session<'_, T>, key: KeyHandle, plaintext: &[u8]) -> Result<Vec<u8>> {
        let token = session.token();
        let handle = session.handle();
        token
            .encrypt_init(handle, &self.mechanism, key)
            .map_err(|source| EnvelopeError::Crypto {
                op: CryptoOp::WrapInit,
                source,
            })?;
        let ciphertext = two_phase(|out| token.encrypt(handle, plaintext, out)).map_err(|source| {
            EnvelopeError::Crypto {
                op: CryptoOp::Wrap,
                source,
            }
        })?;
        debug!(key = key.object().0, plaintext = plaintext.len(), ciphertext = ciphertext.len(), "wrapped");
        Ok(ciphertext)
    }

    pub fn unwrap<T: Token>(
        &self,
        session: &Session<'_, T>,
        key: KeyHandle,
        ciphertext: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>> {
        let token = session.token();
        let handle = session.handle();
        token
            .decrypt_init(handle, &self.mechanism, key)
            .map_err(|source| EnvelopeError::Crypto {
                op: CryptoOp::UnwrapInit,
                source,
            })?;
        let plaintext = two_phase(|out| token.decrypt(handle, ciphertext, out))
            .map(Zeroizing::new)
            .map_err(|source| match source {
                TokenError::EncryptedDataInvalid | TokenError::EncryptedDataLenRange => {
                    EnvelopeError::Integrity(source)
                }
                source => EnvelopeError::Crypto {
                    op: CryptoOp::Unwrap,
                    source,
                },
            })?;
        debug!(key = key.object().0, ciphertext = ciphertext.len(), plaintext = plaintext.len(), "unwrapped");
        Ok(plaintext)
    }
}
