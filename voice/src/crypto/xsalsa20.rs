use concord_protocol::io::Cursor;
use crypto_secretbox::aead::{Aead, KeyInit};
use crypto_secretbox::{Key, Nonce, XSalsa20Poly1305};

use super::nonce::{NonceGenerator, NonceStrategyKind, PacketNonce, MAX_NONCE_LEN, LITE_SUFFIX_LEN};
use super::KEY_LEN;

const TAG_LEN: usize = 16;

pub(crate) fn overhead(strategy: NonceStrategyKind) -> usize {
    TAG_LEN
        + match strategy {
            NonceStrategyKind::Lite => LITE_SUFFIX_LEN,
            NonceStrategyKind::Suffix => MAX_NONCE_LEN,
        }
}

/// XSalsa20-Poly1305 encryptor with a pluggable nonce strategy. Secretbox
/// carries no authenticated data; the RTP header is only bound implicitly by
/// staying in front of the ciphertext.
pub(crate) struct XSalsaSealer {
    cipher: XSalsa20Poly1305,
    nonce: NonceGenerator,
}

impl XSalsaSealer {
    pub(crate) fn new(key: &[u8; KEY_LEN], strategy: NonceStrategyKind) -> Self {
        let nonce = match strategy {
            NonceStrategyKind::Lite => NonceGenerator::lite(MAX_NONCE_LEN),
            NonceStrategyKind::Suffix => NonceGenerator::Suffix,
        };
        Self {
            cipher: XSalsa20Poly1305::new(Key::from_slice(key)),
            nonce,
        }
    }

    pub(crate) fn generate_nonce(&mut self) -> PacketNonce {
        self.nonce.next()
    }

    pub(crate) fn seal(&self, plaintext: &[u8], dst: &mut Cursor<'_>, nonce: &PacketNonce) -> bool {
        match self.cipher.encrypt(Nonce::from_slice(nonce.cipher_bytes()), plaintext) {
            Ok(ciphertext) => dst.write_bytes(&ciphertext).is_ok(),
            Err(_) => false,
        }
    }
}

/// XSalsa20-Poly1305 decryptor.
pub(crate) struct XSalsaOpener {
    cipher: XSalsa20Poly1305,
    strategy: NonceStrategyKind,
}

impl XSalsaOpener {
    pub(crate) fn new(key: &[u8; KEY_LEN], strategy: NonceStrategyKind) -> Self {
        Self {
            cipher: XSalsa20Poly1305::new(Key::from_slice(key)),
            strategy,
        }
    }

    pub(crate) fn strip_nonce(&self, payload: &[u8]) -> Option<(PacketNonce, usize)> {
        let suffix_len = match self.strategy {
            NonceStrategyKind::Lite => LITE_SUFFIX_LEN,
            NonceStrategyKind::Suffix => MAX_NONCE_LEN,
        };
        let ciphertext_len = payload.len().checked_sub(suffix_len)?;
        let nonce = PacketNonce::from_wire(&payload[ciphertext_len..], MAX_NONCE_LEN);
        Some((nonce, ciphertext_len))
    }

    pub(crate) fn open(&self, ciphertext: &[u8], dst: &mut Cursor<'_>, nonce: &PacketNonce) -> bool {
        match self.cipher.decrypt(Nonce::from_slice(nonce.cipher_bytes()), ciphertext) {
            Ok(plaintext) => dst.write_bytes(&plaintext).is_ok(),
            Err(_) => false,
        }
    }
}
