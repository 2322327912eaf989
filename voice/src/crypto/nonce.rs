use rand::RngCore;

/// Longest cipher nonce across the supported schemes (XSalsa20).
pub(crate) const MAX_NONCE_LEN: usize = 24;

/// Length of the visible wire suffix used by the Lite strategy and by
/// AES-256-GCM framing.
pub(crate) const LITE_SUFFIX_LEN: usize = 4;

/// How the per-packet nonce is produced and framed for XSalsa20-Poly1305.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NonceStrategyKind {
    /// A 4-byte big-endian incrementing counter, zero-padded to the cipher
    /// nonce length and appended verbatim after the authentication tag.
    #[default]
    Lite,
    /// 24 random bytes appended whole after the authentication tag.
    Suffix,
}

/// A single packet's nonce: the padded form fed to the cipher plus the
/// (possibly shorter) suffix that travels on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketNonce {
    bytes: [u8; MAX_NONCE_LEN],
    cipher_len: usize,
    wire_len: usize,
}

impl PacketNonce {
    pub(crate) fn lite(counter: u32, cipher_len: usize) -> Self {
        let mut bytes = [0u8; MAX_NONCE_LEN];
        bytes[..LITE_SUFFIX_LEN].copy_from_slice(&counter.to_be_bytes());
        Self { bytes, cipher_len, wire_len: LITE_SUFFIX_LEN }
    }

    pub(crate) fn suffix(random: [u8; MAX_NONCE_LEN]) -> Self {
        Self { bytes: random, cipher_len: MAX_NONCE_LEN, wire_len: MAX_NONCE_LEN }
    }

    /// Rebuilds the padded nonce from a wire suffix stripped off a received
    /// packet.
    pub(crate) fn from_wire(suffix: &[u8], cipher_len: usize) -> Self {
        debug_assert!(suffix.len() <= MAX_NONCE_LEN);
        let mut bytes = [0u8; MAX_NONCE_LEN];
        bytes[..suffix.len()].copy_from_slice(suffix);
        Self { bytes, cipher_len, wire_len: suffix.len() }
    }

    /// The zero-padded form fed to the cipher.
    #[must_use]
    pub fn cipher_bytes(&self) -> &[u8] {
        &self.bytes[..self.cipher_len]
    }

    /// The suffix appended to the packet after the authentication tag.
    #[must_use]
    pub fn wire_bytes(&self) -> &[u8] {
        &self.bytes[..self.wire_len]
    }
}

/// Per-sealer nonce source. The Lite counter is owned by exactly one sealer,
/// so nonces never repeat under a fixed key.
#[derive(Debug)]
pub(crate) enum NonceGenerator {
    Lite { count: u32, cipher_len: usize },
    Suffix,
}

impl NonceGenerator {
    pub(crate) fn lite(cipher_len: usize) -> Self {
        Self::Lite { count: 0, cipher_len }
    }

    pub(crate) fn next(&mut self) -> PacketNonce {
        match self {
            Self::Lite { count, cipher_len } => {
                *count = count.wrapping_add(1);
                PacketNonce::lite(*count, *cipher_len)
            }
            Self::Suffix => {
                let mut bytes = [0u8; MAX_NONCE_LEN];
                rand::thread_rng().fill_bytes(&mut bytes);
                PacketNonce::suffix(bytes)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lite_counter_is_monotonic_and_unique() {
        let mut generator = NonceGenerator::lite(MAX_NONCE_LEN);
        let mut previous = 0u32;
        for _ in 0..1000 {
            let nonce = generator.next();
            let counter = u32::from_be_bytes(nonce.wire_bytes().try_into().unwrap());
            assert!(counter > previous, "counter must increase: {} -> {}", previous, counter);
            previous = counter;
        }
    }

    #[test]
    fn lite_nonce_is_zero_padded() {
        let mut generator = NonceGenerator::lite(12);
        let nonce = generator.next();
        assert_eq!(nonce.cipher_bytes().len(), 12);
        assert_eq!(&nonce.cipher_bytes()[..4], &1u32.to_be_bytes());
        assert!(nonce.cipher_bytes()[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn wire_roundtrip_restores_cipher_bytes() {
        let mut generator = NonceGenerator::lite(24);
        let nonce = generator.next();
        let restored = PacketNonce::from_wire(nonce.wire_bytes(), 24);
        assert_eq!(restored.cipher_bytes(), nonce.cipher_bytes());
    }
}
