// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Stream ciphers built on `digest512` and `lcg_prng` (`light_cipher`,
//! `strong_cipher`, C3).
//!
//! Both are symmetric XOR keystream ciphers: encryption and decryption are
//! the same operation.

use crate::digest512::Digest512;
use crate::key::Key512;
use crate::lcg_prng::LcgPrng;

/// XOR keystream drawn from `digest512`'s own rolling state.
pub struct LightCipher {
    digest: Digest512,
    ring: [u8; 64],
    ring_pos: usize,
}

impl LightCipher {
    pub fn new(key: Key512) -> Self {
        let digest = Digest512::from_key(&key);
        let ring = digest.state_bytes();
        LightCipher {
            digest,
            ring,
            ring_pos: 0,
        }
    }

    fn next_byte(&mut self) -> u8 {
        if self.ring_pos == self.ring.len() {
            let state = self.ring;
            self.digest.rekey_with(&state);
            self.ring = self.digest.state_bytes();
            self.ring_pos = 0;
        }
        let b = self.ring[self.ring_pos];
        self.ring_pos += 1;
        b
    }

    /// Encrypt/decrypt `data` in place; the same call performs both
    /// directions since this is a plain XOR stream cipher.
    pub fn apply(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            *byte ^= self.next_byte();
        }
    }
}

/// XOR keystream drawn from `lcg_prng`, one 64-bit word (8 little-endian
/// bytes) at a time.
pub struct StrongCipher {
    prng: LcgPrng,
    word: [u8; 8],
    word_pos: usize,
}

impl StrongCipher {
    pub fn new(key: Key512) -> Self {
        let mut prng = LcgPrng::new(key.as_slice());
        let word = prng.next().to_le_bytes();
        StrongCipher {
            prng,
            word,
            word_pos: 0,
        }
    }

    fn next_byte(&mut self) -> u8 {
        if self.word_pos == 8 {
            self.word = self.prng.next().to_le_bytes();
            self.word_pos = 0;
        }
        let b = self.word[self.word_pos];
        self.word_pos += 1;
        b
    }

    pub fn apply(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            *byte ^= self.next_byte();
        }
    }
}

/// Tagged variant so the session layer can hold either cipher (or none)
/// behind one type, per the "session/cipher coupling" design note.
pub enum Cipher {
    None,
    Light(LightCipher),
    Strong(StrongCipher),
}

impl Cipher {
    pub fn apply(&mut self, data: &mut [u8]) {
        match self {
            Cipher::None => {}
            Cipher::Light(c) => c.apply(data),
            Cipher::Strong(c) => c.apply(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn random_key() -> Key512 {
        let mut bytes = [0u8; 64];
        rand::thread_rng().fill_bytes(&mut bytes);
        Key512(bytes)
    }

    #[test]
    fn light_cipher_is_involutive() {
        let key = random_key();
        let mut rng = rand::thread_rng();

        for len in [0usize, 1, 63, 64, 65, 513, 4096 + 37] {
            let mut plaintext = vec![0u8; len];
            rng.fill_bytes(&mut plaintext);

            let mut enc = LightCipher::new(key);
            let mut ciphertext = plaintext.clone();
            enc.apply(&mut ciphertext);

            let mut dec = LightCipher::new(key);
            let mut roundtrip = ciphertext.clone();
            dec.apply(&mut roundtrip);

            assert_eq!(plaintext, roundtrip, "len={len}");
            if len > 0 {
                assert_ne!(plaintext, ciphertext);
            }
        }
    }

    #[test]
    fn strong_cipher_is_involutive() {
        let key = random_key();
        let mut rng = rand::thread_rng();

        for len in [0usize, 1, 7, 8, 9, 1024 + 3] {
            let mut plaintext = vec![0u8; len];
            rng.fill_bytes(&mut plaintext);

            let mut enc = StrongCipher::new(key);
            let mut ciphertext = plaintext.clone();
            enc.apply(&mut ciphertext);

            let mut dec = StrongCipher::new(key);
            let mut roundtrip = ciphertext.clone();
            dec.apply(&mut roundtrip);

            assert_eq!(plaintext, roundtrip, "len={len}");
        }
    }
}
