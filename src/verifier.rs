//! Independent proof verification.
//!
//! The verifier rebuilds the AIR from the program code and the public values
//! alone, replays the Fiat-Shamir transcript and checks every query: trace
//! openings against their commitments, the composition value they imply
//! together with the fixed columns it derives itself, and the FRI folding
//! chain down to the final constant. Any failure is a `false`, never a panic.

use ark_bls12_381::Fr;
use ark_ff::Field;
use ark_std::log2;
use tracing::{debug, instrument};

use crate::math::domain::coset_point;
use crate::math::fri::{fold_pair, fri_rounds};
use crate::merkle::{Hash, MerkleProof, hash_leaf, verify_merkle_proof};
use crate::proof::{
    MAX_BLOWUP, MAX_QUERIES, MIN_BLOWUP, MIN_QUERIES, ProgramInfo, QueryProof, RowOpening,
    StarkProof, Statement, decode_field, opening_rows,
};
use crate::vm::constraints::{
    AUX_WIDTH, Challenges, ConstraintSystem, Frame, MAIN_WIDTH, MAX_TRACE_LEN, PublicInputs,
    PublicValues, trace_len,
};
use crate::vm::matrix::FixedColumns;
use crate::vm::trace;

/// Largest cycle count a verifier accepts before sizing the trace.
const MAX_CYCLES: u64 = 1 << 32;

type Check = Result<(), String>;

fn ensure(condition: bool, reason: impl FnOnce() -> String) -> Check {
    if condition { Ok(()) } else { Err(reason()) }
}

/// Verifies `proof` for a run of the program described by `program_info`
/// with the given public inputs and outputs.
#[instrument(skip_all, fields(bytes = proof.len()))]
pub fn verify(
    proof: &[u8],
    program_info: &ProgramInfo,
    stack_inputs: &[u64],
    output_stack: &[u64],
    overflow_addrs: &[u64],
) -> bool {
    let public = PublicInputs {
        stack_inputs,
        output_stack,
        overflow_addrs,
    };
    match check(proof, program_info, &public) {
        Ok(()) => {
            debug!("proof accepted");
            true
        }
        Err(reason) => {
            debug!(%reason, "proof rejected");
            false
        }
    }
}

/// Shape of the proof once its parameters are validated.
struct Params {
    blowup: usize,
    num_queries: usize,
    trace_len: usize,
    lde_size: usize,
    rounds: usize,
}

fn check(bytes: &[u8], info: &ProgramInfo, public: &PublicInputs<'_>) -> Check {
    let proof = StarkProof::from_bytes(bytes).map_err(|err| format!("malformed proof: {err}"))?;
    let canonical = proof
        .to_bytes()
        .map_err(|err| format!("proof does not re-encode: {err}"))?;
    ensure(canonical == bytes, || "non-canonical proof encoding".into())?;

    let values = check_public(info, public)?;
    let rom = info.code.rom();
    let params = check_params(&proof, &values, rom.len())?;
    let fixed = FixedColumns::new(rom, params.trace_len)
        .ok_or_else(|| "program does not fit the trace".to_string())?;

    let statement = Statement {
        program_info: info,
        blowup_factor: proof.blowup_factor,
        num_queries: proof.num_queries,
        trace_len: proof.trace_len,
        stack_inputs: public.stack_inputs,
        output_stack: public.output_stack,
        overflow_addrs: public.overflow_addrs,
    };
    let mut transcript = statement
        .transcript()
        .map_err(|err| format!("statement does not encode: {err}"))?;
    transcript.absorb_commitment(&proof.main_root);
    let challenges = Challenges::new(
        transcript.squeeze_challenge(),
        transcript.squeeze_challenge(),
    );
    transcript.absorb_commitment(&proof.aux_root);
    let system = ConstraintSystem::for_execution(params.trace_len, &values, &challenges)
        .ok_or_else(|| "no evaluation domain for the trace".to_string())?;
    let alphas = transcript.squeeze_challenges(system.len());

    let mut betas = Vec::with_capacity(params.rounds);
    for round in 0..params.rounds {
        if round > 0 {
            transcript.absorb_commitment(&proof.fri_roots[round - 1]);
        }
        betas.push(transcript.squeeze_challenge());
    }
    let fri_final =
        decode_field(&proof.fri_final).ok_or_else(|| "FRI constant out of range".to_string())?;
    transcript.absorb_field(fri_final);
    let indices = transcript.squeeze_indices(params.num_queries, params.lde_size / 2);

    for (query, opening) in indices.into_iter().zip(&proof.queries) {
        let composition = check_trace_openings(
            &proof,
            &params,
            &system,
            &fixed,
            &alphas,
            query,
            &opening.main,
            &opening.aux,
        )?;
        check_fri_chain(&proof, &params, &betas, fri_final, query, composition, opening)
            .map_err(|reason| format!("query {query}: {reason}"))?;
    }
    Ok(())
}

fn check_public(info: &ProgramInfo, public: &PublicInputs<'_>) -> Result<PublicValues, String> {
    ensure(info.code.hash() == info.program_hash, || {
        "program hash does not match the code".into()
    })?;
    ensure(public.stack_inputs.len() == info.input_words(), || {
        format!(
            "expected {} input words, found {}",
            info.input_words(),
            public.stack_inputs.len()
        )
    })?;
    let values = PublicValues::decode(info.code.stack_base, info.public_fields.len(), public)?;
    ensure(values.cycles < MAX_CYCLES, || {
        format!("cycle count {} out of range", values.cycles)
    })?;
    let expected = trace::overflow_addrs(public.output_stack.len());
    ensure(public.overflow_addrs == expected.as_slice(), || {
        "overflow addresses do not match the output stack".into()
    })?;
    Ok(values)
}

/// Trace length bounds: a power of two past the public cycles and the
/// program, no shorter than the prover pads to.
fn check_params(
    proof: &StarkProof,
    public: &PublicValues,
    program_len: usize,
) -> Result<Params, String> {
    let blowup = usize::try_from(proof.blowup_factor).unwrap_or(usize::MAX);
    ensure(
        blowup.is_power_of_two()
            && (MIN_BLOWUP..=MAX_BLOWUP).contains(&blowup),
        || format!("invalid blowup factor {blowup}"),
    )?;
    let num_queries = usize::try_from(proof.num_queries).unwrap_or(usize::MAX);
    ensure(
        (MIN_QUERIES..=MAX_QUERIES).contains(&num_queries),
        || format!("invalid query count {num_queries}"),
    )?;
    let n = usize::try_from(proof.trace_len).unwrap_or(usize::MAX);
    let cycles = usize::try_from(public.cycles).unwrap_or(usize::MAX);
    let shortest = trace_len(program_len.max(cycles.saturating_add(1)), num_queries);
    ensure(
        n.is_power_of_two() && (shortest..=MAX_TRACE_LEN).contains(&n),
        || format!("trace length {n} out of range [{shortest}, {MAX_TRACE_LEN}]"),
    )?;
    let lde_size = n
        .checked_mul(blowup)
        .ok_or_else(|| "LDE size overflows".to_string())?;
    let rounds = fri_rounds(n);
    ensure(proof.queries.len() == num_queries, || {
        format!("expected {num_queries} queries, found {}", proof.queries.len())
    })?;
    ensure(proof.fri_roots.len() + 1 == rounds, || {
        format!("expected {} FRI layers, found {}", rounds - 1, proof.fri_roots.len())
    })?;
    Ok(Params {
        blowup,
        num_queries,
        trace_len: n,
        lde_size,
        rounds,
    })
}

/// Decodes an opened row and checks it against `root`.
fn open_row(
    opening: &RowOpening,
    width: usize,
    index: usize,
    depth: usize,
    root: &Hash,
) -> Result<Vec<Fr>, String> {
    ensure(opening.values.len() == width, || {
        format!("row {index} has {} values", opening.values.len())
    })?;
    ensure(opening.path.len() == depth, || {
        format!("row {index} has a path of length {}", opening.path.len())
    })?;
    let values = opening
        .values
        .iter()
        .map(decode_field)
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| format!("row {index} holds a value out of range"))?;
    let proof = MerkleProof {
        path: opening.path.clone(),
    };
    ensure(verify_merkle_proof(&hash_leaf(&values), index, &proof, root), || {
        format!("row {index} is not in the commitment")
    })?;
    Ok(values)
}

/// Checks the trace rows of one query and returns the composition values at
/// `x` and `-x`.
fn check_trace_openings(
    proof: &StarkProof,
    params: &Params,
    system: &ConstraintSystem,
    fixed: &FixedColumns,
    alphas: &[Fr],
    query: usize,
    main: &[RowOpening],
    aux: &[RowOpening],
) -> Result<[Fr; 2], String> {
    ensure(main.len() == 4 && aux.len() == 4, || {
        format!("query {query} does not open four rows")
    })?;
    let depth = log2(params.lde_size) as usize;
    let rows = opening_rows(query, params.lde_size, params.blowup);
    let mut main_rows = Vec::with_capacity(4);
    let mut aux_rows = Vec::with_capacity(4);
    for (i, &row) in rows.iter().enumerate() {
        main_rows.push(open_row(&main[i], MAIN_WIDTH, row, depth, &proof.main_root)?);
        aux_rows.push(open_row(&aux[i], AUX_WIDTH, row, depth, &proof.aux_root)?);
    }

    let x = coset_point(params.lde_size, query).ok_or_else(|| "no LDE domain".to_string())?;
    let mut values = [Fr::from(0u64); 2];
    for (side, point) in [x, -x].into_iter().enumerate() {
        let fixed_row = fixed
            .evaluate(point)
            .ok_or_else(|| format!("query {query} sits on the trace domain"))?;
        let frame = Frame {
            main: &main_rows[2 * side],
            aux: &aux_rows[2 * side],
            fixed: &fixed_row,
            next_main: &main_rows[2 * side + 1],
            next_aux: &aux_rows[2 * side + 1],
        };
        values[side] = system
            .composition_at(point, &frame, alphas)
            .ok_or_else(|| format!("query {query} sits on the trace domain"))?;
    }
    Ok(values)
}

fn check_fri_chain(
    proof: &StarkProof,
    params: &Params,
    betas: &[Fr],
    fri_final: Fr,
    query: usize,
    composition: [Fr; 2],
    opening: &QueryProof,
) -> Check {
    ensure(opening.fri.len() + 1 == params.rounds, || {
        format!("{} FRI openings", opening.fri.len())
    })?;
    let x = coset_point(params.lde_size, query).ok_or_else(|| "no LDE domain".to_string())?;
    let mut folded = fold_pair(composition[0], composition[1], x, betas[0])
        .ok_or_else(|| "degenerate fold".to_string())?;

    for (k, layer) in opening.fri.iter().enumerate().map(|(i, layer)| (i + 1, layer)) {
        let size = params.lde_size >> k;
        let half = size / 2;
        let index = query % size;
        let j = index % half;
        let pair = [
            decode_field(&layer.pair[0]).ok_or_else(|| format!("layer {k} value out of range"))?,
            decode_field(&layer.pair[1]).ok_or_else(|| format!("layer {k} value out of range"))?,
        ];
        ensure(layer.path.len() == log2(half) as usize, || {
            format!("layer {k} path has length {}", layer.path.len())
        })?;
        let path = MerkleProof {
            path: layer.path.clone(),
        };
        ensure(
            verify_merkle_proof(&hash_leaf(&pair), j, &path, &proof.fri_roots[k - 1]),
            || format!("layer {k} pair is not in the commitment"),
        )?;
        let expected = if index < half { pair[0] } else { pair[1] };
        ensure(expected == folded, || format!("layer {k} does not match the fold"))?;

        let base = coset_point(params.lde_size, j).ok_or_else(|| "no LDE domain".to_string())?;
        let point = (0..k).fold(base, |acc, _| acc.square());
        folded = fold_pair(pair[0], pair[1], point, betas[k])
            .ok_or_else(|| "degenerate fold".to_string())?;
    }
    ensure(folded == fri_final, || "final layer is not the committed constant".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::program::{Instruction, ProgramCode};

    fn info() -> ProgramInfo {
        let code = ProgramCode {
            instructions: vec![Instruction::Halt],
            stack_base: 0,
        };
        ProgramInfo {
            program_hash: code.hash(),
            code,
            contract: None,
            entry: "main".to_string(),
            public_fields: Vec::new(),
            num_args: 0,
        }
    }

    #[test]
    fn test_garbage_is_rejected() {
        let outputs = vec![0u64; 12];
        assert!(!verify(&[], &info(), &[], &outputs, &[]));
        assert!(!verify(&[1, 2, 3, 4], &info(), &[], &outputs, &[]));
    }

    #[test]
    fn test_public_shape_is_checked() {
        let outputs = vec![0u64; 12];
        let public = PublicInputs {
            stack_inputs: &[],
            output_stack: &outputs,
            overflow_addrs: &[],
        };
        assert!(check_public(&info(), &public).is_ok());

        let short = PublicInputs {
            output_stack: &outputs[..11],
            ..public
        };
        assert!(check_public(&info(), &short).is_err());

        let extra_input = PublicInputs {
            stack_inputs: &[1],
            ..public
        };
        assert!(check_public(&info(), &extra_input).is_err());

        // One log makes 20 outputs, four past the 16-word stack top.
        let mut long = vec![0u64; 20];
        long[1] = 1;
        let addrs: Vec<u64> = (16..20).collect();
        let overflowing = PublicInputs {
            stack_inputs: &[],
            output_stack: &long,
            overflow_addrs: &addrs,
        };
        assert!(check_public(&info(), &overflowing).is_ok());
        let wrong = PublicInputs {
            overflow_addrs: &addrs[1..],
            ..overflowing
        };
        assert!(check_public(&info(), &wrong).is_err());
    }

    #[test]
    fn test_code_must_match_its_hash() {
        let mut info = info();
        info.code.stack_base = 3;
        let outputs = vec![0u64; 12];
        let public = PublicInputs {
            stack_inputs: &[],
            output_stack: &outputs,
            overflow_addrs: &[],
        };
        assert!(check_public(&info, &public).is_err());
    }
}
