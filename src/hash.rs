//! Hashing: SHA-256 for commitments and program identity, and the MiMC field
//! hash that gives runtime values their content hash.
//!
//! Composite values are hashed inside the field so the AIR can check the hash
//! of every string, array and object the program touches. A composite of
//! kind `k` with items `v_0..v_{n-1}` hashes to `H(k·2^32 + n, v_0, ...)`,
//! where `H` chains Miyaguchi-Preneel compressions of a 112-round MiMC-5
//! permutation from a zero key.

use std::fmt;

use ark_bls12_381::Fr;
use ark_ff::{BigInt, BigInteger, Field, PrimeField, Zero};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

pub fn digest_sha2(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Rounds of the MiMC permutation. Round `r` maps `x` to `(x + k + c_r)^5`,
/// a permutation because `gcd(5, p - 1) = 1` for the BLS12-381 scalar field.
pub const MIMC_ROUNDS: usize = 112;

static ROUND_CONSTANTS: Lazy<Vec<Fr>> = Lazy::new(|| {
    (0..MIMC_ROUNDS as u32)
        .map(|round| {
            let mut seed = b"toyni-contracts-mimc-".to_vec();
            seed.extend_from_slice(&round.to_le_bytes());
            Fr::from_le_bytes_mod_order(&digest_sha2(&seed))
        })
        .collect()
});

pub fn round_constants() -> &'static [Fr] {
    &ROUND_CONSTANTS
}

pub fn pow5(x: Fr) -> Fr {
    x.square().square() * x
}

/// Intermediate states `x_0 = message, ..., x_ROUNDS` of the keyed
/// permutation.
pub fn mimc_states(key: Fr, message: Fr) -> Vec<Fr> {
    let mut states = Vec::with_capacity(MIMC_ROUNDS + 1);
    let mut x = message;
    states.push(x);
    for c in round_constants() {
        x = pow5(x + key + c);
        states.push(x);
    }
    states
}

/// `E_key(message) + key + message`.
pub fn mimc_compress(key: Fr, message: Fr) -> Fr {
    let mut x = message;
    for c in round_constants() {
        x = pow5(x + key + c);
    }
    x + key + message
}

/// Leading element of a composite: its kind and length.
pub fn composite_tag(kind: u64, len: usize) -> Fr {
    Fr::from(kind) * Fr::from(1u64 << 32) + Fr::from(len as u64)
}

/// Field hash of a composite value.
pub fn composite_hash(kind: u64, items: &[Fr]) -> Fr {
    let tag = composite_tag(kind, items.len());
    items
        .iter()
        .fold(mimc_compress(Fr::zero(), tag), |key, &item| {
            mimc_compress(key, item)
        })
}

/// A 32-byte digest: SHA-256 output or a field element in big-endian form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    pub fn of(data: &[u8]) -> Self {
        Self(digest_sha2(data))
    }

    /// Canonical big-endian encoding of a field element.
    pub fn from_field(value: Fr) -> Self {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&value.into_bigint().to_bytes_be());
        Self(bytes)
    }

    /// The field element this digest encodes, if it is canonical.
    pub fn to_field(&self) -> Option<Fr> {
        let mut limbs = [0u64; 4];
        for (limb, chunk) in limbs.iter_mut().rev().zip(self.0.chunks_exact(8)) {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            *limb = u64::from_be_bytes(word);
        }
        Fr::from_bigint(BigInt::new(limbs))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The digest as eight big-endian 32-bit words, widened to `u64`.
    pub fn to_words(&self) -> [u64; 8] {
        let mut words = [0u64; 8];
        for (word, chunk) in words.iter_mut().zip(self.0.chunks_exact(4)) {
            *word = u64::from(u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
        words
    }

    /// Inverse of [`Digest::to_words`]. Rejects anything but eight words
    /// below `2^32`.
    pub fn from_words(words: &[u64]) -> Option<Self> {
        if words.len() != 8 {
            return None;
        }
        let mut bytes = [0u8; 32];
        for (chunk, &word) in bytes.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&u32::try_from(word).ok()?.to_be_bytes());
        }
        Some(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        assert_eq!(
            Digest::of(b"abc").to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_words_are_big_endian() {
        let words = Digest::of(b"abc").to_words();
        assert_eq!(words[0], 0xba7816bf);
        assert_eq!(words[7], 0xf20015ad);
        assert_eq!(Digest::from_words(&words), Some(Digest::of(b"abc")));
        assert_eq!(Digest::from_words(&words[1..]), None);
        let mut wide = words;
        wide[3] = 1 << 32;
        assert_eq!(Digest::from_words(&wide), None);
    }

    #[test]
    fn test_field_digests() {
        let value = Fr::from(0x0102_0304u64);
        let digest = Digest::from_field(value);
        assert_eq!(digest.to_words(), [0, 0, 0, 0, 0, 0, 0, 0x0102_0304]);
        assert_eq!(digest.to_field(), Some(value));
        assert_eq!(Digest([0xff; 32]).to_field(), None);
        let hashed = composite_hash(1, &[Fr::from(104u64), Fr::from(105u64)]);
        assert_eq!(Digest::from_field(hashed).to_field(), Some(hashed));
    }

    #[test]
    fn test_compress_matches_states() {
        let (key, message) = (Fr::from(3u64), Fr::from(5u64));
        let states = mimc_states(key, message);
        assert_eq!(states.len(), MIMC_ROUNDS + 1);
        assert_eq!(states[MIMC_ROUNDS] + key + message, mimc_compress(key, message));
    }

    #[test]
    fn test_composite_hash_binds_kind_and_length() {
        let items = [Fr::from(1u64), Fr::from(2u64)];
        assert_ne!(composite_hash(1, &items), composite_hash(2, &items));
        assert_ne!(composite_hash(2, &items), composite_hash(2, &items[..1]));
        assert_ne!(composite_hash(2, &[]), composite_hash(3, &[]));
        assert_eq!(composite_hash(2, &items), composite_hash(2, &items));
    }
}
