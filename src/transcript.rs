use std::collections::HashSet;

use ark_bls12_381::Fr;
use ark_ff::{BigInteger, PrimeField};

use crate::hash::digest_sha2;

/// Fiat-Shamir transcript for deriving verifier challenges deterministically.
/// Prover and verifier absorb the same messages in the same order and so
/// squeeze the same challenges.
pub struct FiatShamirTranscript {
    state: Vec<u8>,
}

impl Default for FiatShamirTranscript {
    fn default() -> Self {
        Self::new()
    }
}

impl FiatShamirTranscript {
    pub fn new() -> Self {
        Self {
            state: b"toyni-contracts-stark-v1".to_vec(),
        }
    }

    pub fn absorb(&mut self, data: &[u8]) {
        self.state.extend_from_slice(data);
    }

    pub fn absorb_u64(&mut self, value: u64) {
        self.absorb(&value.to_le_bytes());
    }

    /// Absorbs a length-prefixed list of words.
    pub fn absorb_words(&mut self, words: &[u64]) {
        self.absorb_u64(words.len() as u64);
        for &word in words {
            self.absorb_u64(word);
        }
    }

    pub fn absorb_field(&mut self, value: Fr) {
        self.absorb(&value.into_bigint().to_bytes_le());
    }

    /// Absorbs a Merkle root.
    pub fn absorb_commitment(&mut self, root: &[u8; 32]) {
        self.absorb(root);
    }

    fn squeeze(&mut self) -> [u8; 32] {
        let hash = digest_sha2(&self.state);
        // Chain the state so consecutive squeezes differ.
        self.state = hash.to_vec();
        hash
    }

    pub fn squeeze_challenge(&mut self) -> Fr {
        Fr::from_le_bytes_mod_order(&self.squeeze())
    }

    pub fn squeeze_challenges(&mut self, count: usize) -> Vec<Fr> {
        (0..count).map(|_| self.squeeze_challenge()).collect()
    }

    /// Squeezes `count` distinct indices in `[0, max)`. Returns fewer only if
    /// `max < count`.
    pub fn squeeze_indices(&mut self, count: usize, max: usize) -> Vec<usize> {
        let count = count.min(max);
        let mut indices = Vec::with_capacity(count);
        let mut seen = HashSet::new();
        while indices.len() < count {
            let hash = self.squeeze();
            let mut word = [0u8; 8];
            word.copy_from_slice(&hash[..8]);
            let index = (u64::from_le_bytes(word) % max as u64) as usize;
            if seen.insert(index) {
                indices.push(index);
            }
        }
        indices
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_messages_same_challenges() {
        let mut a = FiatShamirTranscript::new();
        let mut b = FiatShamirTranscript::new();
        a.absorb_words(&[1, 2, 3]);
        b.absorb_words(&[1, 2, 3]);
        assert_eq!(a.squeeze_challenge(), b.squeeze_challenge());
        assert_ne!(a.squeeze_challenge(), a.squeeze_challenge());
    }

    #[test]
    fn test_messages_change_challenges() {
        let mut a = FiatShamirTranscript::new();
        let mut b = FiatShamirTranscript::new();
        a.absorb_words(&[1, 2]);
        b.absorb_words(&[1, 2, 0]);
        assert_ne!(a.squeeze_challenge(), b.squeeze_challenge());
    }

    #[test]
    fn test_indices_are_distinct_and_bounded() {
        let mut transcript = FiatShamirTranscript::new();
        let indices = transcript.squeeze_indices(32, 64);
        assert_eq!(indices.len(), 32);
        assert!(indices.iter().all(|&i| i < 64));
        assert_eq!(indices.iter().collect::<HashSet<_>>().len(), 32);
        assert_eq!(transcript.squeeze_indices(10, 4).len(), 4);
    }
}
