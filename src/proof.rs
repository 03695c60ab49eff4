//! Proof artifacts: the public program descriptor and the STARK proof, with
//! their canonical binary encoding.

use ark_bls12_381::Fr;
use ark_ff::{BigInt, BigInteger, PrimeField};
use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::compiler::CompiledProgram;
use crate::compiler::program::ProgramCode;
use crate::hash::Digest;
use crate::merkle::Hash;
use crate::transcript::FiatShamirTranscript;

/// Parameter bounds, enforced by the prover on its config and by the
/// verifier on the proof header.
pub const MIN_BLOWUP: usize = 4;
pub const MAX_BLOWUP: usize = 256;
pub const MIN_QUERIES: usize = 16;
pub const MAX_QUERIES: usize = 256;

/// Canonical little-endian encoding of a field element.
pub type FieldBytes = [u8; 32];

pub fn encode_field(value: Fr) -> FieldBytes {
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&value.into_bigint().to_bytes_le());
    bytes
}

/// Decodes a field element, rejecting values at or above the modulus.
pub fn decode_field(bytes: &FieldBytes) -> Option<Fr> {
    let mut limbs = [0u64; 4];
    for (limb, chunk) in limbs.iter_mut().zip(bytes.chunks_exact(8)) {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        *limb = u64::from_le_bytes(word);
    }
    Fr::from_bigint(BigInt::new(limbs))
}

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    options().serialize(value)
}

fn from_bytes<'de, T: Deserialize<'de>>(bytes: &'de [u8]) -> Result<T, bincode::Error> {
    options().with_limit(bytes.len() as u64).deserialize(bytes)
}

/// Public description of the program a proof is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramInfo {
    /// Hash of `code`; verifiers reject a descriptor where they differ.
    pub program_hash: Digest,
    /// The instruction stream the AIR checks every executed step against.
    pub code: ProgramCode,
    pub contract: Option<String>,
    pub entry: String,
    /// Names of the public `this` fields, in declaration order.
    pub public_fields: Vec<String>,
    pub num_args: u64,
}

impl ProgramInfo {
    pub fn from_program(program: &CompiledProgram) -> Self {
        let code = program.code();
        Self {
            program_hash: code.hash(),
            code,
            contract: program.contract.clone(),
            entry: program.entry_name.clone(),
            public_fields: program.public_field_names(),
            num_args: program.params.len() as u64,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        to_bytes(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        from_bytes(bytes)
    }

    /// Number of public input words: one digest per public field and
    /// argument.
    pub fn input_words(&self) -> usize {
        8 * (self.public_fields.len() + self.num_args as usize)
    }
}

/// A row of a committed matrix with its authentication path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowOpening {
    pub values: Vec<FieldBytes>,
    pub path: Vec<Hash>,
}

/// The pair `f(x), f(-x)` of a FRI layer with its authentication path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriOpening {
    pub pair: [FieldBytes; 2],
    pub path: Vec<Hash>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryProof {
    /// Main rows at `q`, `q + blowup`, `q + N/2` and `q + N/2 + blowup`.
    pub main: Vec<RowOpening>,
    /// Auxiliary rows at the same positions.
    pub aux: Vec<RowOpening>,
    /// One opening per committed FRI layer.
    pub fri: Vec<FriOpening>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StarkProof {
    pub blowup_factor: u64,
    pub num_queries: u64,
    pub trace_len: u64,
    pub main_root: Hash,
    pub aux_root: Hash,
    pub fri_roots: Vec<Hash>,
    pub fri_final: FieldBytes,
    pub queries: Vec<QueryProof>,
}

impl StarkProof {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        to_bytes(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        from_bytes(bytes)
    }
}

/// Opening positions of a query on an LDE of `lde_size` rows.
pub fn opening_rows(query: usize, lde_size: usize, blowup: usize) -> [usize; 4] {
    let half = lde_size / 2;
    [
        query,
        (query + blowup) % lde_size,
        query + half,
        (query + half + blowup) % lde_size,
    ]
}

/// Public statement absorbed before any commitment.
pub struct Statement<'a> {
    pub program_info: &'a ProgramInfo,
    pub blowup_factor: u64,
    pub num_queries: u64,
    pub trace_len: u64,
    pub stack_inputs: &'a [u64],
    pub output_stack: &'a [u64],
    pub overflow_addrs: &'a [u64],
}

impl Statement<'_> {
    pub fn transcript(&self) -> Result<FiatShamirTranscript, bincode::Error> {
        let mut transcript = FiatShamirTranscript::new();
        transcript.absorb(&self.program_info.to_bytes()?);
        transcript.absorb_u64(self.blowup_factor);
        transcript.absorb_u64(self.num_queries);
        transcript.absorb_u64(self.trace_len);
        transcript.absorb_words(self.stack_inputs);
        transcript.absorb_words(self.output_stack);
        transcript.absorb_words(self.overflow_addrs);
        Ok(transcript)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::program::Instruction;
    use ark_ff::Field;

    #[test]
    fn test_field_encoding_is_canonical() {
        let value = Fr::from(123456789u64).inverse().unwrap();
        assert_eq!(decode_field(&encode_field(value)), Some(value));
        // p - 1 decodes, p does not.
        let max = encode_field(-Fr::from(1u64));
        assert!(decode_field(&max).is_some());
        let modulus = Fr::MODULUS.to_bytes_le();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&modulus);
        assert!(decode_field(&bytes).is_none());
        assert!(decode_field(&[0xff; 32]).is_none());
    }

    #[test]
    fn test_program_info_bytes() {
        let code = ProgramCode {
            instructions: vec![Instruction::Halt],
            stack_base: 1,
        };
        let info = ProgramInfo {
            program_hash: code.hash(),
            code,
            contract: Some("Account".to_string()),
            entry: "main".to_string(),
            public_fields: vec!["id".to_string()],
            num_args: 0,
        };
        let bytes = info.to_bytes().unwrap();
        assert_eq!(ProgramInfo::from_bytes(&bytes).unwrap(), info);
        let mut longer = bytes.clone();
        longer.push(0);
        assert!(ProgramInfo::from_bytes(&longer).is_err());
        assert_eq!(info.input_words(), 8);
    }

    #[test]
    fn test_opening_rows_wrap() {
        assert_eq!(opening_rows(3, 64, 4), [3, 7, 35, 39]);
        assert_eq!(opening_rows(30, 64, 4), [30, 34, 62, 2]);
    }
}
