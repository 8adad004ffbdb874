// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! 512-bit mixing digest (`digest512`, C1).
//!
//! The shuffle network and initial constants are transcribed bit-for-bit from
//! the original `cdc512` implementation; per the specification's design notes
//! (§9), a reimplementation that changes either is a distinct, non-
//! interoperable protocol version.

use crate::key::Key512;
use std::time::{SystemTime, UNIX_EPOCH};

/// The eight 64-bit lanes mixed by `shuffle`.
#[derive(Clone, Copy, Default)]
struct State {
    a: u64,
    b: u64,
    c: u64,
    d: u64,
    e: u64,
    f: u64,
    g: u64,
    h: u64,
}

impl State {
    const INIT: State = State {
        a: 0x46F8_7CB1_B3EB_6319,
        b: 0x7D7E_6884_8EA8_773A,
        c: 0x18EE_E716_38D8_563A,
        d: 0xD5DB_16BC_FDF2_D51D,
        e: 0x4A87_8FB7_B746_3866,
        f: 0xF8ED_636B_F755_D298,
        g: 0x2FF1_91FF_6979_8254,
        h: 0x8D3F_9964_239E_6334,
    };

    fn from_bytes(bytes: &[u8; 64]) -> State {
        let w = |i: usize| u64::from_le_bytes(bytes[i * 8..i * 8 + 8].try_into().unwrap());
        State {
            a: w(0),
            b: w(1),
            c: w(2),
            d: w(3),
            e: w(4),
            f: w(5),
            g: w(6),
            h: w(7),
        }
    }

    fn to_bytes(self) -> [u8; 64] {
        let mut out = [0u8; 64];
        for (i, word) in [
            self.a, self.b, self.c, self.d, self.e, self.f, self.g, self.h,
        ]
        .into_iter()
        .enumerate()
        {
            out[i * 8..i * 8 + 8].copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    /// Shuffle `self` against an external, unchanging operand `v` (the
    /// two-argument `shuffle(v)` of the original).
    fn shuffle_with(&mut self, v: &State) {
        self.a = self.a.wrapping_sub(v.e);
        self.f ^= v.h >> 9;
        self.h = self.h.wrapping_add(v.a);

        self.b = self.b.wrapping_sub(v.f);
        self.g ^= v.a << 9;
        self.a = self.a.wrapping_add(v.b);

        self.c = self.c.wrapping_sub(v.g);
        self.h ^= v.b >> 23;
        self.b = self.b.wrapping_add(v.c);

        self.d = self.d.wrapping_sub(v.h);
        self.a ^= v.c << 15;
        self.c = self.c.wrapping_add(v.d);

        self.e = self.e.wrapping_sub(v.a);
        self.b ^= v.d >> 14;
        self.d = self.d.wrapping_add(v.e);

        self.f = self.f.wrapping_sub(v.b);
        self.c ^= v.e << 20;
        self.e = self.e.wrapping_add(v.f);

        self.g = self.g.wrapping_sub(v.c);
        self.d ^= v.f >> 17;
        self.f = self.f.wrapping_add(v.g);

        self.h = self.h.wrapping_sub(v.d);
        self.e ^= v.g << 14;
        self.g = self.g.wrapping_add(v.h);
    }

    /// Self-shuffle (the zero-argument `shuffle()`): every read sees the
    /// mutations made earlier in the same pass.
    fn shuffle_self(&mut self) {
        self.a = self.a.wrapping_sub(self.e);
        self.f ^= self.h >> 9;
        self.h = self.h.wrapping_add(self.a);

        self.b = self.b.wrapping_sub(self.f);
        self.g ^= self.a << 9;
        self.a = self.a.wrapping_add(self.b);

        self.c = self.c.wrapping_sub(self.g);
        self.h ^= self.b >> 23;
        self.b = self.b.wrapping_add(self.c);

        self.d = self.d.wrapping_sub(self.h);
        self.a ^= self.c << 15;
        self.c = self.c.wrapping_add(self.d);

        self.e = self.e.wrapping_sub(self.a);
        self.b ^= self.d >> 14;
        self.d = self.d.wrapping_add(self.e);

        self.f = self.f.wrapping_sub(self.b);
        self.c ^= self.e << 20;
        self.e = self.e.wrapping_add(self.f);

        self.g = self.g.wrapping_sub(self.c);
        self.d ^= self.f >> 17;
        self.f = self.f.wrapping_add(self.g);

        self.h = self.h.wrapping_sub(self.d);
        self.e ^= self.g << 14;
        self.g = self.g.wrapping_add(self.h);
    }
}

/// Streaming digest512 hasher: absorbs bytes in 64-byte blocks, keystream
/// source for `light_cipher`, and content digest for files/blocks (§3).
///
/// A sub-64-byte remainder is buffered across calls rather than padded and
/// absorbed immediately, so `digest(bytes) == digest(chunks)` for any
/// chunking of `bytes` (cf. `original_source/src/cdc512.cpp`'s buffering).
#[derive(Clone)]
pub struct Digest512 {
    state: State,
    /// total bytes absorbed so far, folded into `finish()`.
    count: u64,
    buf: [u8; 64],
    buf_len: usize,
}

impl Default for Digest512 {
    fn default() -> Self {
        Self::new()
    }
}

impl Digest512 {
    pub fn new() -> Self {
        Digest512 {
            state: State::INIT,
            count: 0,
            buf: [0u8; 64],
            buf_len: 0,
        }
    }

    /// Load `key` directly as the 64-byte state, with no hashing round (the
    /// raw `cdc512::operator=(key)` assignment, not `update`). Used by
    /// `light_cipher` to key its keystream ring from a `Key512` (§4.2: "the
    /// 64-byte state is the Key512").
    pub(crate) fn from_key(key: &Key512) -> Self {
        Digest512 {
            state: State::from_bytes(key.as_bytes()),
            count: 0,
            buf: [0u8; 64],
            buf_len: 0,
        }
    }

    /// Raw 64-byte internal state, used directly as the `light_cipher`
    /// keystream ring.
    pub(crate) fn state_bytes(&self) -> [u8; 64] {
        self.state.to_bytes()
    }

    pub(crate) fn rekey_with(&mut self, data: &[u8; 64]) {
        let block = State::from_bytes(data);
        self.state.shuffle_with(&block);
        self.state.shuffle_self();
    }

    pub fn update(&mut self, data: &[u8]) {
        self.count = self.count.wrapping_add(data.len() as u64);
        let mut data = data;

        if self.buf_len > 0 {
            let need = 64 - self.buf_len;
            let take = need.min(data.len());
            self.buf[self.buf_len..self.buf_len + take].copy_from_slice(&data[..take]);
            self.buf_len += take;
            data = &data[take..];
            if self.buf_len < 64 {
                return;
            }
            let block = self.buf;
            self.rekey_with(&block);
            self.buf_len = 0;
        }

        let mut chunks = data.chunks_exact(64);
        for chunk in &mut chunks {
            let block: [u8; 64] = chunk.try_into().unwrap();
            self.rekey_with(&block);
        }

        let rem = chunks.remainder();
        if !rem.is_empty() {
            self.buf[..rem.len()].copy_from_slice(rem);
            self.buf_len = rem.len();
        }
    }

    /// Absorb the final length-block and return the resulting 512-bit digest.
    pub fn finish(mut self) -> Key512 {
        if self.buf_len > 0 {
            let mut pad = [0u8; 64];
            pad[..self.buf_len].copy_from_slice(&self.buf[..self.buf_len]);
            self.rekey_with(&pad);
            self.buf_len = 0;
        }
        if self.count != 0 {
            let p = self.count;
            let pad = State {
                a: p,
                b: p,
                c: p,
                d: p,
                e: p,
                f: p,
                g: p,
                h: p,
            };
            self.state.shuffle_with(&pad);
            self.state.shuffle_self();
        }
        Key512(self.state.to_bytes())
    }
}

/// Digest a single byte slice in one call.
pub fn digest(bytes: &[u8]) -> Key512 {
    let mut d = Digest512::new();
    d.update(bytes);
    d.finish()
}

/// Digest the concatenation of already-computed chunk digests, i.e. a file
/// digest built from its block digests (§3 `DirectoryEntry.digest`).
pub fn digest_of_digests<'a>(chunks: impl IntoIterator<Item = &'a Key512>) -> Key512 {
    let mut d = Digest512::new();
    for chunk in chunks {
        d.update(chunk.as_slice());
    }
    d.finish()
}

/// A fast, non-cryptographic 64-bit entropy word derived from monotonic wall
/// time, used by the indexer to force the root digest to advance (§4.1 step
/// 5) even when no block content changed.
pub fn entropy_word() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let mut d = Digest512::new();
    d.update(&now.as_nanos().to_le_bytes());
    let bytes = d.finish();
    u64::from_le_bytes(bytes.as_bytes()[0..8].try_into().unwrap())
}

/// Gathers a fresh 512 bits of entropy by digesting monotonic time together
/// with the OS random source. Used to mint host identity keys and session
/// keys (§3 `Key512` domain roles).
pub fn generate_entropy() -> Key512 {
    use std::cell::Cell;
    thread_local! {
        static COUNTER: Cell<u64> = Cell::new(0);
    }
    let counter = COUNTER.with(|c| {
        let v = c.get();
        c.set(v.wrapping_add(1));
        v
    });

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    let mut d = Digest512::new();
    d.update(&now.as_nanos().to_le_bytes());
    d.update(&counter.to_le_bytes());
    d.update(&(&d as *const _ as usize).to_le_bytes());
    d.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    #[test]
    fn digest_equality_across_chunking() {
        let mut rng = rand::thread_rng();
        let mut data = vec![0u8; 10_000];
        rng.fill_bytes(&mut data);

        let whole = digest(&data);

        for split_count in [1usize, 2, 3, 7, 16] {
            let mut d = Digest512::new();
            let chunk_len = (data.len() / split_count).max(1);
            for chunk in data.chunks(chunk_len) {
                d.update(chunk);
            }
            assert_eq!(whole, d.finish(), "split_count={split_count}");
        }
    }

    #[test]
    fn empty_input_is_deterministic() {
        assert_eq!(digest(b""), digest(b""));
    }

    #[test]
    fn single_bit_flip_changes_most_output_bytes() {
        let mut rng = rand::thread_rng();
        let mut total_changed = 0u64;
        let mut total_bytes = 0u64;
        const TRIALS: usize = 200;

        for _ in 0..TRIALS {
            let mut data = vec![0u8; 128];
            rng.fill_bytes(&mut data);
            let base = digest(&data);

            let bit = rng.next_u32() as usize % (data.len() * 8);
            data[bit / 8] ^= 1 << (bit % 8);
            let flipped = digest(&data);

            let changed = base
                .as_bytes()
                .iter()
                .zip(flipped.as_bytes().iter())
                .filter(|(a, b)| a != b)
                .count();
            total_changed += changed as u64;
            total_bytes += 64;
        }

        let fraction = total_changed as f64 / total_bytes as f64;
        assert!(
            fraction > 0.3,
            "avalanche too weak: {fraction} of bytes changed"
        );
    }

    #[test]
    fn entropy_word_is_not_constant() {
        let a = entropy_word();
        std::thread::sleep(std::time::Duration::from_millis(1));
        let b = entropy_word();
        assert_ne!(a, b);
    }
}
