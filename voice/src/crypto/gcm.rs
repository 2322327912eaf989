use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use concord_protocol::io::Cursor;

use super::nonce::{NonceGenerator, PacketNonce, LITE_SUFFIX_LEN};
use super::KEY_LEN;

const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

pub(crate) const OVERHEAD: usize = TAG_LEN + LITE_SUFFIX_LEN;

/// AES-256-GCM encryptor. The 4-byte counter suffix is zero-padded to the
/// 12-byte IV; the RTP header travels as authenticated data.
pub(crate) struct GcmSealer {
    cipher: Aes256Gcm,
    nonce: NonceGenerator,
}

impl GcmSealer {
    pub(crate) fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
            nonce: NonceGenerator::lite(IV_LEN),
        }
    }

    pub(crate) fn generate_nonce(&mut self) -> PacketNonce {
        self.nonce.next()
    }

    pub(crate) fn seal(
        &self,
        plaintext: &[u8],
        dst: &mut Cursor<'_>,
        aad: &[u8],
        nonce: &PacketNonce,
    ) -> bool {
        let payload = Payload { msg: plaintext, aad };
        match self.cipher.encrypt(Nonce::from_slice(nonce.cipher_bytes()), payload) {
            Ok(ciphertext) => dst.write_bytes(&ciphertext).is_ok(),
            Err(_) => false,
        }
    }
}

/// AES-256-GCM decryptor, initialized for decryption only.
pub(crate) struct GcmOpener {
    cipher: Aes256Gcm,
}

impl GcmOpener {
    pub(crate) fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    pub(crate) fn strip_nonce(&self, payload: &[u8]) -> Option<(PacketNonce, usize)> {
        let ciphertext_len = payload.len().checked_sub(LITE_SUFFIX_LEN)?;
        let nonce = PacketNonce::from_wire(&payload[ciphertext_len..], IV_LEN);
        Some((nonce, ciphertext_len))
    }

    pub(crate) fn open(
        &self,
        ciphertext: &[u8],
        dst: &mut Cursor<'_>,
        aad: &[u8],
        nonce: &PacketNonce,
    ) -> bool {
        let payload = Payload { msg: ciphertext, aad };
        match self.cipher.decrypt(Nonce::from_slice(nonce.cipher_bytes()), payload) {
            Ok(plaintext) => dst.write_bytes(&plaintext).is_ok(),
            Err(_) => false,
        }
    }
}
