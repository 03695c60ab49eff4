//! STARK prover for execution traces.
//!
//! Commits to the blinded low-degree extensions of the main and auxiliary
//! trace columns, combines every constraint quotient into one composition
//! polynomial and proves its degree with FRI. Fixed columns are extended
//! but never committed: the verifier derives them from the program. All randomness comes from the
//! Fiat-Shamir transcript or from a ChaCha20 stream seeded by the trace, so
//! proving the same run twice gives identical bytes.

use std::collections::HashMap;

use ark_bls12_381::Fr;
use ark_ff::{BigInteger, PrimeField, batch_inversion};
use rand_chacha::ChaCha20Rng;
use rand_core::{RngCore, SeedableRng};
use sha2::{Digest as _, Sha256};
use tracing::{debug, info, instrument};

use crate::error::ProofError;
use crate::math::domain::{coset_offset, coset_points, fold_domain_points};
use crate::math::fri::{fri_fold, fri_rounds};
use crate::math::polynomial::{Polynomial, vanishing_at};
use crate::merkle::{MerkleTree, hash_leaf};
use crate::proof::{
    FriOpening, MAX_BLOWUP, MAX_QUERIES, MIN_BLOWUP, MIN_QUERIES, ProgramInfo, QueryProof,
    RowOpening, StarkProof, Statement, encode_field, opening_rows,
};
use crate::vm::constraints::{
    Challenges, ConstraintSystem, Divisor, Frame, PublicInputs, PublicValues, blinding_degree,
    trace_len,
};
use crate::vm::matrix::{FixedColumns, aux_trace, main_trace};
use crate::vm::trace::ExecutionTrace;

/// Proving parameters. The verifier reads them back from the proof and
/// enforces the same bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProverConfig {
    pub blowup_factor: usize,
    pub num_queries: usize,
    /// Largest padded trace the prover accepts.
    pub max_trace_len: usize,
}

impl Default for ProverConfig {
    fn default() -> Self {
        Self {
            blowup_factor: 16,
            num_queries: 32,
            max_trace_len: 1 << 20,
        }
    }
}

impl ProverConfig {
    pub fn validate(&self) -> Result<(), ProofError> {
        if !self.blowup_factor.is_power_of_two()
            || !(MIN_BLOWUP..=MAX_BLOWUP).contains(&self.blowup_factor)
        {
            return Err(failure(format!(
                "blowup factor {} must be a power of two in [{}, {}]",
                self.blowup_factor,
                MIN_BLOWUP,
                MAX_BLOWUP
            )));
        }
        if !(MIN_QUERIES..=MAX_QUERIES).contains(&self.num_queries) {
            return Err(failure(format!(
                "query count {} must be in [{}, {}]",
                self.num_queries,
                MIN_QUERIES,
                MAX_QUERIES
            )));
        }
        Ok(())
    }
}

fn failure(message: impl Into<String>) -> ProofError {
    ProofError::GenerationFailure(message.into())
}

/// Low-degree extension of a set of columns, plus its row commitment.
struct Committed {
    columns: Vec<Vec<Fr>>,
    tree: MerkleTree,
}

impl Committed {
    fn row(&self, index: usize) -> Vec<Fr> {
        self.columns.iter().map(|column| column[index]).collect()
    }

    fn open(&self, index: usize) -> Result<RowOpening, ProofError> {
        let proof = self
            .tree
            .get_proof(index)
            .ok_or_else(|| failure("row opening out of range"))?;
        Ok(RowOpening {
            values: self.row(index).into_iter().map(encode_field).collect(),
            path: proof.path,
        })
    }
}

struct Extender {
    trace_len: usize,
    lde_size: usize,
    blinding: usize,
    rng: ChaCha20Rng,
}

impl Extender {
    fn random_field(&mut self) -> Fr {
        let mut bytes = [0u8; 64];
        self.rng.fill_bytes(&mut bytes);
        Fr::from_le_bytes_mod_order(&bytes)
    }

    /// Interpolates every column, adds `Z_H · R` for a fresh random `R` and
    /// evaluates on the LDE coset.
    fn extend(&mut self, columns: &[Vec<Fr>]) -> Result<Committed, ProofError> {
        let mut extended = Vec::with_capacity(columns.len());
        for column in columns {
            let poly = Polynomial::interpolate(column)
                .ok_or_else(|| failure("trace length is not a power of two"))?;
            let mask = Polynomial::new((0..self.blinding).map(|_| self.random_field()).collect());
            let blinded = poly.add(&mask.mul_by_vanishing(self.trace_len));
            extended.push(
                blinded
                    .coset_evaluations(coset_offset(), self.lde_size)
                    .ok_or_else(|| failure("blinded trace does not fit the LDE domain"))?,
            );
        }
        let leaves = (0..self.lde_size)
            .map(|i| hash_leaf(&extended.iter().map(|column| column[i]).collect::<Vec<_>>()))
            .collect();
        Ok(Committed {
            columns: extended,
            tree: MerkleTree::new(leaves),
        })
    }
}

/// Seed for the blinding stream: the program and the full private trace.
fn blinding_seed(info: &ProgramInfo, main: &[Vec<Fr>]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(info.program_hash.as_bytes());
    for column in main {
        for value in column {
            hasher.update(value.into_bigint().to_bytes_le());
        }
    }
    hasher.finalize().into()
}

/// Evaluations of a set of columns on the LDE coset, unblinded.
fn extend_fixed(columns: &[Vec<Fr>], lde_size: usize) -> Result<Vec<Vec<Fr>>, ProofError> {
    columns
        .iter()
        .map(|column| {
            Polynomial::interpolate(column)
                .and_then(|poly| poly.coset_evaluations(coset_offset(), lde_size))
                .ok_or_else(|| failure("fixed column does not fit the LDE domain"))
        })
        .collect()
}

/// Inverse divisors at every LDE point: one vector per distinct divisor,
/// and the index of each constraint's divisor.
fn inverse_divisors(system: &ConstraintSystem, xs: &[Fr]) -> (Vec<Vec<Fr>>, Vec<usize>) {
    let n = system.trace_len();
    let mut vanishing: Vec<Fr> = xs.iter().map(|&x| vanishing_at(x, n)).collect();
    batch_inversion(&mut vanishing);

    let last = system.row_point(n - 1);
    let mut divisors: Vec<Vec<Fr>> = Vec::new();
    let mut seen: HashMap<Divisor, usize> = HashMap::new();
    let of = system
        .constraints
        .iter()
        .map(|constraint| {
            *seen.entry(constraint.divisor).or_insert_with(|| {
                divisors.push(match constraint.divisor {
                    Divisor::EveryRow => vanishing.clone(),
                    Divisor::AllButLast => xs
                        .iter()
                        .zip(&vanishing)
                        .map(|(&x, &z)| (x - last) * z)
                        .collect(),
                    Divisor::Row(row) => {
                        let point = system.row_point(row);
                        let mut values: Vec<Fr> = xs.iter().map(|&x| x - point).collect();
                        batch_inversion(&mut values);
                        values
                    }
                });
                divisors.len() - 1
            })
        })
        .collect();
    (divisors, of)
}

/// Proves `trace` under `config`. Fails only on invalid parameters, a trace
/// of another program, a trace longer than `config.max_trace_len`, or a
/// trace that violates the AIR.
#[instrument(skip_all, fields(cycles = trace.cycle_count()))]
pub fn prove(
    trace: &ExecutionTrace,
    program_info: &ProgramInfo,
    config: &ProverConfig,
) -> Result<Vec<u8>, ProofError> {
    if program_info.code.rom() != trace.rom || program_info.code.stack_base != trace.stack_base {
        return Err(failure("trace was not produced by this program"));
    }
    prove_trace(trace, program_info, config, true)
}

/// The proving pipeline. With `check_air` unset a violating trace is
/// proved anyway and the final FRI layer is sent as is; only tests do that.
fn prove_trace(
    trace: &ExecutionTrace,
    program_info: &ProgramInfo,
    config: &ProverConfig,
    check_air: bool,
) -> Result<Vec<u8>, ProofError> {
    config.validate()?;
    let n = trace_len(trace.height(), config.num_queries);
    if n > config.max_trace_len {
        return Err(failure(format!(
            "trace of {n} rows exceeds the maximum of {}",
            config.max_trace_len
        )));
    }
    let blowup = config.blowup_factor;
    let lde_size = n * blowup;
    let half = lde_size / 2;
    let overflow_addrs = trace.overflow_addrs();
    let public = PublicInputs {
        stack_inputs: &trace.stack_inputs,
        output_stack: &trace.output_stack,
        overflow_addrs: &overflow_addrs,
    };
    let values = PublicValues::decode(trace.stack_base, program_info.public_fields.len(), &public)
        .map_err(failure)?;
    let statement = Statement {
        program_info,
        blowup_factor: blowup as u64,
        num_queries: config.num_queries as u64,
        trace_len: n as u64,
        stack_inputs: &trace.stack_inputs,
        output_stack: &trace.output_stack,
        overflow_addrs: &overflow_addrs,
    };
    let mut transcript = statement
        .transcript()
        .map_err(|err| failure(err.to_string()))?;

    let fixed = FixedColumns::new(trace.rom.clone(), n)
        .ok_or_else(|| failure("program does not fit the trace"))?
        .columns();
    let fixed_lde = extend_fixed(&fixed, lde_size)?;
    let main = main_trace(trace, n);
    let mut extender = Extender {
        trace_len: n,
        lde_size,
        blinding: blinding_degree(config.num_queries),
        rng: ChaCha20Rng::from_seed(blinding_seed(program_info, &main)),
    };
    let main_lde = extender.extend(&main)?;
    transcript.absorb_commitment(&main_lde.tree.root());

    let challenges = Challenges::new(
        transcript.squeeze_challenge(),
        transcript.squeeze_challenge(),
    );
    let aux = aux_trace(&main, &fixed, &values, &challenges)
        .ok_or_else(|| failure("challenge collides with a fingerprint"))?;
    let aux_lde = extender.extend(&aux)?;
    transcript.absorb_commitment(&aux_lde.tree.root());

    let system = ConstraintSystem::for_execution(n, &values, &challenges)
        .ok_or_else(|| failure("no evaluation domain for the trace"))?;
    if check_air {
        if let Some((name, row)) = system.first_violation(&main, &aux, &fixed) {
            return Err(failure(format!("constraint `{name}` fails at row {row}")));
        }
    }
    let alphas = transcript.squeeze_challenges(system.len());
    debug!(trace_len = n, lde_size, constraints = system.len(), "committed trace");

    // Composition polynomial on the LDE coset.
    let xs = coset_points(lde_size).ok_or_else(|| failure("no LDE domain"))?;
    let (divisors, divisor_of) = inverse_divisors(&system, &xs);
    let fixed_row = |i: usize| -> Vec<Fr> { fixed_lde.iter().map(|column| column[i]).collect() };
    let composition: Vec<Fr> = (0..lde_size)
        .map(|i| {
            let next = (i + blowup) % lde_size;
            let (cur_main, cur_aux, cur_fixed) = (main_lde.row(i), aux_lde.row(i), fixed_row(i));
            let (next_main, next_aux) = (main_lde.row(next), aux_lde.row(next));
            let frame = Frame {
                main: &cur_main,
                aux: &cur_aux,
                fixed: &cur_fixed,
                next_main: &next_main,
                next_aux: &next_aux,
            };
            system
                .evaluate(&frame)
                .into_iter()
                .zip(&alphas)
                .zip(&divisor_of)
                .map(|((numerator, alpha), &d)| *alpha * numerator * divisors[d][i])
                .sum()
        })
        .collect();

    // FRI commit phase. Layer 0 is checked against the trace openings, the
    // later layers are committed as (f(x), f(-x)) pairs.
    let rounds = fri_rounds(n);
    let mut layer = composition;
    let mut points = xs;
    let mut fri_layers: Vec<(Vec<Fr>, MerkleTree)> = Vec::with_capacity(rounds);
    for round in 0..rounds {
        if round > 0 {
            let pairs = layer.len() / 2;
            let leaves = (0..pairs)
                .map(|j| hash_leaf(&[layer[j], layer[j + pairs]]))
                .collect();
            let tree = MerkleTree::new(leaves);
            transcript.absorb_commitment(&tree.root());
            fri_layers.push((layer.clone(), tree));
        }
        let beta = transcript.squeeze_challenge();
        layer = fri_fold(&layer, &points, beta);
        points = fold_domain_points(&points);
    }
    let fri_final = layer.first().copied().unwrap_or_default();
    if check_air && layer.iter().any(|value| *value != fri_final) {
        return Err(failure("composition polynomial exceeds its degree bound"));
    }
    transcript.absorb_field(fri_final);

    // Query phase.
    let queries = transcript
        .squeeze_indices(config.num_queries, half)
        .into_iter()
        .map(|query| {
            let rows = opening_rows(query, lde_size, blowup);
            let main: Vec<RowOpening> = rows
                .iter()
                .map(|&row| main_lde.open(row))
                .collect::<Result<_, _>>()?;
            let aux: Vec<RowOpening> = rows
                .iter()
                .map(|&row| aux_lde.open(row))
                .collect::<Result<_, _>>()?;
            let fri: Vec<FriOpening> = fri_layers
                .iter()
                .map(|(values, tree)| {
                    let pairs = values.len() / 2;
                    let j = query % pairs;
                    let proof = tree
                        .get_proof(j)
                        .ok_or_else(|| failure("FRI opening out of range"))?;
                    Ok(FriOpening {
                        pair: [encode_field(values[j]), encode_field(values[j + pairs])],
                        path: proof.path,
                    })
                })
                .collect::<Result<_, ProofError>>()?;
            Ok(QueryProof { main, aux, fri })
        })
        .collect::<Result<Vec<_>, ProofError>>()?;

    let proof = StarkProof {
        blowup_factor: blowup as u64,
        num_queries: config.num_queries as u64,
        trace_len: n as u64,
        main_root: main_lde.tree.root(),
        aux_root: aux_lde.tree.root(),
        fri_roots: fri_layers.iter().map(|(_, tree)| tree.root()).collect(),
        fri_final: encode_field(fri_final),
        queries,
    };
    let bytes = proof.to_bytes().map_err(|err| failure(err.to_string()))?;
    info!(trace_len = n, bytes = bytes.len(), "proof generated");
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile_source;
    use crate::vm::run;

    #[test]
    fn test_config_validation() {
        assert!(ProverConfig::default().validate().is_ok());
        let bad_blowup = ProverConfig {
            blowup_factor: 6,
            ..ProverConfig::default()
        };
        assert!(bad_blowup.validate().is_err());
        let few_queries = ProverConfig {
            num_queries: 8,
            ..ProverConfig::default()
        };
        assert!(few_queries.validate().is_err());
    }

    fn execution(source: &str) -> (ExecutionTrace, ProgramInfo) {
        let program = compile_source(source, None, "main").unwrap();
        let (output, trace) = run(&program, None, vec![]).unwrap();
        (trace, output.program_info)
    }

    fn fast() -> ProverConfig {
        ProverConfig {
            blowup_factor: 8,
            num_queries: 20,
            ..ProverConfig::default()
        }
    }

    #[test]
    fn test_trace_past_the_limit_fails() {
        let (trace, info) = execution("function main(): u32 { return 1; }");
        let config = ProverConfig {
            max_trace_len: 128,
            ..ProverConfig::default()
        };
        assert!(matches!(
            prove(&trace, &info, &config),
            Err(ProofError::GenerationFailure(_))
        ));
    }

    #[test]
    fn test_foreign_trace_is_refused() {
        let (trace, _) = execution("function main(): u32 { return 1; }");
        let (_, info) = execution("function main(): u32 { return 2; }");
        assert!(prove(&trace, &info, &fast()).is_err());
    }

    #[test]
    fn test_violating_trace_is_refused() {
        let (mut trace, info) = execution("function main(): u32 { return 3 + 4; }");
        trace.output_stack[10] += 1;
        assert!(prove(&trace, &info, &fast()).is_err());
    }

    #[test]
    fn test_fabricated_outputs_do_not_verify() {
        let source = "function main(): u32 { return 3 + 4; }";
        let (trace, info) = execution(source);
        let honest = prove(&trace, &info, &fast()).unwrap();
        let verify = |trace: &ExecutionTrace, proof: &[u8]| {
            crate::verifier::verify(
                proof,
                &info,
                &trace.stack_inputs,
                &trace.output_stack,
                &trace.overflow_addrs(),
            )
        };
        assert!(verify(&trace, &honest));

        // Claim 8 instead of 7, keeping the rest of the execution.
        let mut forged = trace.clone();
        forged.output_stack[10] = 8;
        let proof = prove_trace(&forged, &info, &fast(), false).unwrap();
        assert!(!verify(&forged, &proof));
    }
}
