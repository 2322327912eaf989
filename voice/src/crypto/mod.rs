//! Interchangeable authenticated-encryption schemes for voice packets.
//!
//! Outbound packet layout, for every scheme:
//!
//! ```text
//! [12-byte RTP header][ciphertext][auth tag][nonce suffix]
//! ```
//!
//! A [`Sealer`]/[`Opener`] pair is bound to one 32-byte session key and one
//! nonce strategy instance; key rotation replaces the pair.

mod gcm;
mod nonce;
mod xsalsa20;

use concord_protocol::io::Cursor;

use gcm::{GcmOpener, GcmSealer};
pub use nonce::{NonceStrategyKind, PacketNonce};
use xsalsa20::{XSalsaOpener, XSalsaSealer};

/// Session keys are always 32 bytes.
pub const KEY_LEN: usize = 32;

/// Encryption mode identifiers as negotiated over the signaling gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionMode {
    AeadAes256Gcm,
    XSalsa20Poly1305Lite,
    XSalsa20Poly1305Suffix,
}

impl EncryptionMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EncryptionMode::AeadAes256Gcm => "aead_aes256_gcm",
            EncryptionMode::XSalsa20Poly1305Lite => "xsalsa20_poly1305_lite",
            EncryptionMode::XSalsa20Poly1305Suffix => "xsalsa20_poly1305_suffix",
        }
    }
}

impl std::fmt::Display for EncryptionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The scheme used for a connection's audio packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceEncryption {
    AeadAes256Gcm,
    XSalsa20Poly1305(NonceStrategyKind),
}

impl Default for VoiceEncryption {
    fn default() -> Self {
        Self::AeadAes256Gcm
    }
}

impl VoiceEncryption {
    #[must_use]
    pub fn mode(&self) -> EncryptionMode {
        match self {
            Self::AeadAes256Gcm => EncryptionMode::AeadAes256Gcm,
            Self::XSalsa20Poly1305(NonceStrategyKind::Lite) => {
                EncryptionMode::XSalsa20Poly1305Lite
            }
            Self::XSalsa20Poly1305(NonceStrategyKind::Suffix) => {
                EncryptionMode::XSalsa20Poly1305Suffix
            }
        }
    }

    /// Cipher nonce length in bytes (before wire framing).
    #[must_use]
    pub fn nonce_length(&self) -> usize {
        match self {
            Self::AeadAes256Gcm => 12,
            Self::XSalsa20Poly1305(_) => 24,
        }
    }

    #[must_use]
    pub fn create_sealer(&self, key: &[u8; KEY_LEN]) -> Sealer {
        let inner = match self {
            Self::AeadAes256Gcm => SealerInner::Gcm(GcmSealer::new(key)),
            Self::XSalsa20Poly1305(strategy) => {
                SealerInner::XSalsa(XSalsaSealer::new(key, *strategy), *strategy)
            }
        };
        Sealer { inner }
    }

    #[must_use]
    pub fn create_opener(&self, key: &[u8; KEY_LEN]) -> Opener {
        let inner = match self {
            Self::AeadAes256Gcm => OpenerInner::Gcm(GcmOpener::new(key)),
            Self::XSalsa20Poly1305(strategy) => {
                OpenerInner::XSalsa(XSalsaOpener::new(key, *strategy))
            }
        };
        Opener { inner }
    }
}

enum SealerInner {
    Gcm(GcmSealer),
    XSalsa(XSalsaSealer, NonceStrategyKind),
}

/// Encrypting half of a session key binding; stateful (the Lite counter
/// advances with every nonce).
pub struct Sealer {
    inner: SealerInner,
}

impl Sealer {
    /// Ciphertext expansion in bytes: authentication tag plus wire nonce
    /// suffix.
    #[must_use]
    pub fn overhead(&self) -> usize {
        match &self.inner {
            SealerInner::Gcm(_) => gcm::OVERHEAD,
            SealerInner::XSalsa(_, strategy) => xsalsa20::overhead(*strategy),
        }
    }

    /// Produces the nonce for the next packet.
    pub fn generate_nonce(&mut self) -> PacketNonce {
        match &mut self.inner {
            SealerInner::Gcm(sealer) => sealer.generate_nonce(),
            SealerInner::XSalsa(sealer, _) => sealer.generate_nonce(),
        }
    }

    /// Encrypts `plaintext` into `dst`. Returns `false` when encryption (or
    /// the destination write) fails; the caller treats that as a fatal send
    /// error for this frame.
    pub fn apply(
        &self,
        plaintext: &[u8],
        dst: &mut Cursor<'_>,
        aad: &[u8],
        nonce: &PacketNonce,
    ) -> bool {
        match &self.inner {
            SealerInner::Gcm(sealer) => sealer.seal(plaintext, dst, aad, nonce),
            SealerInner::XSalsa(sealer, _) => sealer.seal(plaintext, dst, nonce),
        }
    }

    /// Appends the visible nonce suffix after the ciphertext and tag.
    pub fn append_nonce(&self, nonce: &PacketNonce, dst: &mut Cursor<'_>) -> bool {
        dst.write_bytes(nonce.wire_bytes()).is_ok()
    }
}

enum OpenerInner {
    Gcm(GcmOpener),
    XSalsa(XSalsaOpener),
}

/// Decrypting half of a session key binding.
pub struct Opener {
    inner: OpenerInner,
}

impl Opener {
    /// Splits a received RTP payload into its nonce and the length of the
    /// true ciphertext (payload minus the wire suffix). Returns `None` for
    /// payloads too short to carry a suffix.
    #[must_use]
    pub fn strip_nonce(&self, payload: &[u8]) -> Option<(PacketNonce, usize)> {
        match &self.inner {
            OpenerInner::Gcm(opener) => opener.strip_nonce(payload),
            OpenerInner::XSalsa(opener) => opener.strip_nonce(payload),
        }
    }

    /// Decrypts `ciphertext` into `dst`. Returns `false` when authentication
    /// fails; the caller drops the packet and continues.
    pub fn apply(
        &self,
        ciphertext: &[u8],
        dst: &mut Cursor<'_>,
        aad: &[u8],
        nonce: &PacketNonce,
    ) -> bool {
        match &self.inner {
            OpenerInner::Gcm(opener) => opener.open(ciphertext, dst, aad, nonce),
            OpenerInner::XSalsa(opener) => opener.open(ciphertext, dst, nonce),
        }
    }
}
