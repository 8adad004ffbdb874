// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Hash and symmetric-cipher primitives shared by every other Homeostas
//! crate: the 512-bit mixing digest, the lagged-Fibonacci generator, and the
//! two stream ciphers built on them (C1–C3 of the specification).

mod cipher;
mod digest512;
mod key;
mod lcg_prng;

pub use cipher::{Cipher, LightCipher, StrongCipher};
pub use digest512::{digest, digest_of_digests, entropy_word, generate_entropy, Digest512};
pub use key::Key512;
pub use lcg_prng::LcgPrng;
