//! Trace matrix: the main, auxiliary and fixed columns of the AIR in
//! [`super::constraints`].

use std::collections::HashMap;

use ark_bls12_381::Fr;
use ark_ff::{Field, One, Zero, batch_inversion};
use ark_poly::EvaluationDomain;

use super::constraints::{
    AUX_WIDTH, Challenges, FIXED_WIDTH, LIMBS, MAIN_WIDTH, MIN_TRACE_LEN, PublicValues,
    ROUNDS_PER_ROW, aux, byte_fingerprint, bus_step, col, fixed, heap_fingerprint,
    heap_table_fingerprint, heap_use, io_fingerprint, io_use, lane_fingerprint,
    limb_column, memory_fingerprint, rom_fingerprint, rom_table_fingerprint, slot_use,
};
use super::trace::{BLOCK_ROWS, BYTE_ROWS, ExecutionTrace};
use crate::compiler::program::Opcode;
use crate::hash::{MIMC_ROUNDS, composite_hash, composite_tag, mimc_states, round_constants};
use crate::math::domain::get_domain;

/// Column-major main trace of `trace_len` rows.
pub fn main_trace(trace: &ExecutionTrace, trace_len: usize) -> Vec<Vec<Fr>> {
    let mut columns = vec![vec![Fr::zero(); trace_len]; MAIN_WIDTH];
    let mut bytes = ByteCounter::default();
    fill_cpu(&mut columns, trace, &mut bytes);
    fill_memory(&mut columns, trace, &mut bytes);
    fill_hashes(&mut columns, trace, trace_len);
    for (byte, count) in bytes.finish(trace_len).into_iter().enumerate() {
        columns[col::BMULT][byte] = Fr::from(count);
    }
    columns
}

/// Byte limbs written so far; every other limb cell is zero.
#[derive(Default)]
struct ByteCounter {
    counts: Vec<u64>,
    written: u64,
}

impl ByteCounter {
    fn write(&mut self, columns: &mut [Vec<Fr>], first: usize, row: usize, value: u64, limbs: usize) {
        if self.counts.is_empty() {
            self.counts = vec![0; BYTE_ROWS];
        }
        for (i, byte) in value.to_le_bytes().into_iter().take(limbs).enumerate() {
            columns[first + i][row] = Fr::from(byte);
            self.counts[usize::from(byte)] += 1;
            self.written += 1;
        }
    }

    fn finish(mut self, trace_len: usize) -> Vec<u64> {
        if self.counts.is_empty() {
            self.counts = vec![0; BYTE_ROWS];
        }
        self.counts[0] += (LIMBS * trace_len) as u64 - self.written;
        self.counts
    }
}

fn fill_cpu(columns: &mut [Vec<Fr>], trace: &ExecutionTrace, bytes: &mut ByteCounter) {
    let n = columns[0].len();
    let (mut logs, mut auths, mut destructed) = (0u64, 0u64, false);
    let mut executions = vec![0u64; trace.rom.len()];

    for (row, step) in trace.steps.iter().enumerate() {
        let mut set = |column: usize, value: Fr| columns[column][row] = value;
        set(col::ACT, Fr::one());
        set(col::CLK, Fr::from(row as u64));
        set(col::PC, Fr::from(step.pc as u64));
        set(col::SP, Fr::from(step.sp));
        set(col::FP, Fr::from(step.fp));
        set(col::OPC, Fr::from(step.opcode.code()));
        set(col::A1, step.operands[0]);
        set(col::A2, step.operands[1]);
        set(col::A3, step.operands[2]);
        set(col::HELPER, step.helper);
        set(col::LOGC, Fr::from(logs));
        set(col::AUTHC, Fr::from(auths));
        set(col::SDF, Fr::from(destructed));
        set(col::S_BASE + step.opcode.index(), Fr::one());
        for (slot, access) in step.accesses.iter().enumerate() {
            if let Some(access) = access {
                set(col::addr(slot), Fr::from(access.addr));
                set(col::val(slot), access.value);
            }
        }
        for (slot, &value) in step.ranges.iter().enumerate() {
            bytes.write(columns, col::rc(slot, 0), row, value, 8);
        }

        if let Some(count) = executions.get_mut(step.pc) {
            *count += 1;
        }
        match step.opcode {
            Opcode::Log => logs += 1,
            Opcode::CheckAuth | Opcode::RequireAuth => auths += 1,
            Opcode::SelfDestruct => destructed = true,
            _ => {}
        }
    }

    // Idle rows keep the registers `Halt` left behind.
    let last = trace.steps.last();
    for row in trace.steps.len()..n {
        columns[col::CLK][row] = Fr::from(trace.cycle_count());
        columns[col::PC][row] = Fr::from(last.map_or(0, |step| step.pc as u64));
        columns[col::SP][row] = Fr::from(last.map_or(trace.stack_base, |step| step.sp));
        columns[col::FP][row] = Fr::from(last.map_or(trace.stack_base, |step| step.fp));
        columns[col::LOGC][row] = Fr::from(logs);
        columns[col::AUTHC][row] = Fr::from(auths);
        columns[col::SDF][row] = Fr::from(destructed);
    }
    for (row, count) in executions.into_iter().enumerate() {
        columns[col::RMULT][row] = Fr::from(count);
    }
}

fn fill_memory(columns: &mut [Vec<Fr>], trace: &ExecutionTrace, bytes: &mut ByteCounter) {
    let mut accesses: Vec<(u64, u64, Fr, bool)> = trace
        .steps
        .iter()
        .enumerate()
        .flat_map(|(row, step)| {
            step.accesses.iter().enumerate().filter_map(move |(slot, access)| {
                access.map(|a| (a.addr, 4 * row as u64 + slot as u64, a.value, a.write))
            })
        })
        .collect();
    accesses.sort_unstable_by_key(|&(addr, time, _, _)| (addr, time));

    let mut previous: Option<(u64, u64)> = None;
    for (row, &(addr, time, value, write)) in accesses.iter().enumerate() {
        let new = !matches!(previous, Some((prev, _)) if prev == addr);
        columns[col::MA][row] = Fr::from(addr);
        columns[col::MT][row] = Fr::from(time);
        columns[col::MV][row] = value;
        columns[col::MW][row] = Fr::from(write);
        columns[col::MON][row] = Fr::one();
        columns[col::MN][row] = Fr::from(new);
        columns[col::MRD][row] = Fr::from(!new && !write);
        let gap = match previous {
            Some((prev, _)) if new => addr - prev - 1,
            Some((_, prev_time)) => time - prev_time - 1,
            None => 0,
        };
        bytes.write(columns, col::DM, row, gap, 4);
        previous = Some((addr, time));
    }
}

/// Absorbs every composite the run looked into, then pads with empty
/// kind-0 composites nobody looks up.
fn fill_hashes(columns: &mut [Vec<Fr>], trace: &ExecutionTrace, trace_len: usize) {
    let mut lookups: HashMap<(Fr, u64, bool), u64> = HashMap::new();
    for key in trace.steps.iter().filter_map(|step| step.heap) {
        *lookups.entry((key.reference, key.index, key.tag)).or_default() += 1;
    }

    let mut row = 0;
    for object in &trace.heap {
        let multiplicity =
            |index: u64, tag: bool| lookups.get(&(object.reference, index, tag)).copied().unwrap_or(0);
        row = absorb(columns, row, object.reference, object.kind.code(), &object.items, multiplicity);
    }
    let padding = composite_hash(0, &[]);
    while row < trace_len {
        row = absorb(columns, row, padding, 0, &[], |_, _| 0);
    }
}

fn absorb(
    columns: &mut [Vec<Fr>],
    start: usize,
    reference: Fr,
    kind: u64,
    items: &[Fr],
    multiplicity: impl Fn(u64, bool) -> u64,
) -> usize {
    let constants = round_constants();
    let mut key = Fr::zero();
    let mut row = start;
    for block in 0..=items.len() {
        let (message, index, tag) = match block {
            0 => (composite_tag(kind, items.len()), 0, true),
            _ => (items[block - 1], block as u64 - 1, false),
        };
        let states = mimc_states(key, message);
        let count = Fr::from(multiplicity(index, tag));
        for t in 0..BLOCK_ROWS {
            let mut set = |column: usize, value: Fr| columns[column][row] = value;
            for j in 0..=ROUNDS_PER_ROW {
                set(col::X + j, states[ROUNDS_PER_ROW * t + j]);
            }
            for j in 0..ROUNDS_PER_ROW {
                let round = ROUNDS_PER_ROW * t + j;
                set(col::SQ + j, (states[round] + key + constants[round]).square());
            }
            set(col::K, key);
            set(col::M, message);
            set(col::IDX, Fr::from(index));
            set(col::ISTAG, Fr::from(tag));
            set(col::LAST, Fr::from(block == items.len()));
            set(col::LEN, Fr::from(items.len() as u64));
            set(col::KB0, Fr::from(kind & 1));
            set(col::KB1, Fr::from((kind >> 1) & 1));
            set(col::REF, reference);
            set(col::HMULT, count);
            row += 1;
        }
        key = states[MIMC_ROUNDS] + key + message;
    }
    debug_assert_eq!(key, reference);
    row
}

/// Auxiliary columns: bus inverses and the running bus sum. `None` if a
/// challenge hits a fingerprint.
pub fn aux_trace(
    main: &[Vec<Fr>],
    fixed_columns: &[Vec<Fr>],
    public: &PublicValues,
    ch: &Challenges,
) -> Option<Vec<Vec<Fr>>> {
    let n = main.first()?.len();
    let row_of = |columns: &[Vec<Fr>], i: usize| -> Vec<Fr> {
        columns.iter().map(|column| column[i]).collect()
    };

    // Every inverse column is `numerator / denominator`, inverted in one batch.
    let mut numerators = vec![vec![Fr::zero(); n]; aux::ACC];
    let mut denominators = vec![vec![Fr::one(); n]; aux::ACC];
    for i in 0..n {
        let m = row_of(main, i);
        let fx = row_of(fixed_columns, i);
        let mut set = |column: usize, numerator: Fr, fingerprint: Fr| {
            numerators[column][i] = numerator;
            denominators[column][i] = ch.gamma - fingerprint;
        };
        for slot in 0..4 {
            set(aux::MINV + slot, slot_use(&m, slot), memory_fingerprint(ch, &m, slot));
        }
        set(aux::HINV, heap_use(&m), heap_fingerprint(ch, &m));
        set(aux::RINV, m[col::ACT], rom_fingerprint(ch, &m));
        set(aux::RTINV, Fr::one(), rom_table_fingerprint(ch, &fx));
        set(aux::IOINV, io_use(&m), io_fingerprint(ch, &m));
        set(aux::MLINV, m[col::MON], lane_fingerprint(ch, &m));
        set(aux::BTINV, Fr::one(), byte_fingerprint(ch, fx[fixed::BYTE]));
        set(aux::HTINV, Fr::one(), heap_table_fingerprint(ch, &m));
        for pair in 0..LIMBS / 2 {
            let lo = ch.gamma - byte_fingerprint(ch, m[limb_column(2 * pair)]);
            let hi = ch.gamma - byte_fingerprint(ch, m[limb_column(2 * pair + 1)]);
            numerators[aux::BINV + pair][i] = lo + hi;
            denominators[aux::BINV + pair][i] = lo * hi;
        }
    }

    let mut columns = Vec::with_capacity(AUX_WIDTH);
    for (mut inverses, numerators) in denominators.into_iter().zip(numerators) {
        if inverses.iter().any(Zero::is_zero) {
            return None;
        }
        batch_inversion(&mut inverses);
        columns.push(
            inverses
                .into_iter()
                .zip(numerators)
                .map(|(inverse, numerator)| inverse * numerator)
                .collect::<Vec<_>>(),
        );
    }

    let balance = public.balance(ch)? * Fr::from(n as u64).inverse()?;
    let mut acc = vec![Fr::zero(); n];
    for i in 0..n - 1 {
        let (m, a, fx) = (row_of(main, i), row_of(&columns, i), row_of(fixed_columns, i));
        acc[i + 1] = acc[i] + bus_step(&m, &a, &fx) - balance;
    }
    columns.push(acc);
    Some(columns)
}

/// Columns fixed by the trace length and the program: block markers, round
/// constants and the byte table repeat with a period; the program sits on
/// the first rows.
#[derive(Debug, Clone)]
pub struct FixedColumns {
    trace_len: usize,
    /// Values over one period, and their coefficients in `x^(n/period)`.
    periodic: Vec<(Vec<Fr>, Vec<Fr>)>,
    rom: Vec<[Fr; 5]>,
}

impl FixedColumns {
    pub fn new(rom: Vec<[Fr; 5]>, trace_len: usize) -> Option<Self> {
        if trace_len < MIN_TRACE_LEN || rom.len() > trace_len {
            return None;
        }
        if !trace_len.is_power_of_two() {
            return None;
        }
        let constants = round_constants();
        let mut start = vec![Fr::zero(); BLOCK_ROWS];
        start[0] = Fr::one();
        let mut end = vec![Fr::zero(); BLOCK_ROWS];
        end[BLOCK_ROWS - 1] = Fr::one();
        let mut values = vec![start, end];
        for j in 0..ROUNDS_PER_ROW {
            values.push(
                (0..BLOCK_ROWS)
                    .map(|t| constants[ROUNDS_PER_ROW * t + j])
                    .collect(),
            );
        }
        values.push((0..BYTE_ROWS as u64).map(Fr::from).collect());

        let periodic = values
            .into_iter()
            .map(|values| {
                let coefficients = get_domain(values.len())?.ifft(&values);
                Some((values, coefficients))
            })
            .collect::<Option<Vec<_>>>()?;
        Some(Self { trace_len, periodic, rom })
    }

    /// All columns over the trace domain, for the prover.
    pub fn columns(&self) -> Vec<Vec<Fr>> {
        let n = self.trace_len;
        let mut columns: Vec<Vec<Fr>> = self
            .periodic
            .iter()
            .map(|(values, _)| (0..n).map(|row| values[row % values.len()]).collect())
            .collect();
        for j in 0..5 {
            let mut column = vec![Fr::zero(); n];
            for (row, instruction) in self.rom.iter().enumerate() {
                column[row] = instruction[j];
            }
            columns.push(column);
        }
        debug_assert_eq!(columns.len(), FIXED_WIDTH);
        columns
    }

    /// All columns at a point off the trace domain, for the verifier.
    pub fn evaluate(&self, x: Fr) -> Option<Vec<Fr>> {
        let n = self.trace_len;
        let mut row: Vec<Fr> = self
            .periodic
            .iter()
            .map(|(values, coefficients)| {
                let y = x.pow([(n / values.len()) as u64]);
                coefficients.iter().rev().fold(Fr::zero(), |acc, c| acc * y + c)
            })
            .collect();

        // Lagrange basis: L_i(x) = (ω^i / n)·(x^n - 1)/(x - ω^i).
        let domain = get_domain(n)?;
        let vanishing = x.pow([n as u64]) - Fr::one();
        if vanishing.is_zero() {
            return None;
        }
        let points: Vec<Fr> = domain.elements().take(self.rom.len()).collect();
        let mut inverses: Vec<Fr> = points.iter().map(|w| x - w).collect();
        batch_inversion(&mut inverses);
        let scale = vanishing * domain.size_inv();
        let mut rom = [Fr::zero(); 5];
        for ((instruction, w), inverse) in self.rom.iter().zip(&points).zip(&inverses) {
            let basis = scale * w * inverse;
            for (sum, value) in rom.iter_mut().zip(instruction) {
                *sum += basis * value;
            }
        }
        row.extend(rom);
        Some(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile_source;
    use crate::math::domain::coset_point;
    use crate::math::polynomial::Polynomial;
    use crate::vm::run;

    fn trace_of(source: &str) -> ExecutionTrace {
        let program = compile_source(source, None, "main").unwrap();
        run(&program, None, vec![]).unwrap().1
    }

    #[test]
    fn test_fixed_columns_evaluate_like_their_interpolants() {
        let trace = trace_of("function main(): u32 { return 40 + 2; }");
        let fixed = FixedColumns::new(trace.rom.clone(), 256).unwrap();
        let columns = fixed.columns();
        let x = coset_point(1024, 5).unwrap();
        let row = fixed.evaluate(x).unwrap();
        assert_eq!(row.len(), FIXED_WIDTH);
        for (column, value) in columns.iter().zip(row) {
            assert_eq!(Polynomial::interpolate(column).unwrap().evaluate(x), value);
        }
        assert!(fixed.evaluate(Fr::one()).is_none());
    }

    #[test]
    fn test_fixed_columns_need_room() {
        assert!(FixedColumns::new(vec![], 128).is_none());
        assert!(FixedColumns::new(vec![[Fr::zero(); 5]; 300], 256).is_none());
    }

    #[test]
    fn test_memory_lane_is_sorted() {
        let trace = trace_of(
            "function main(): u32 { let a = 1; let b = a + 2; return b * a; }",
        );
        let main = main_trace(&trace, 256);
        let active = main[col::MON].iter().take_while(|on| on.is_one()).count();
        assert_eq!(active, trace.access_count());
        for row in 1..active {
            let key = |r: usize| (main[col::MA][r], main[col::MT][r]);
            assert!(key(row - 1) != key(row));
            if main[col::MN][row].is_zero() {
                assert_eq!(main[col::MA][row], main[col::MA][row - 1]);
            }
        }
    }

    #[test]
    fn test_hash_lane_ends_on_a_composite() {
        let trace = trace_of(r#"function main(): string { return "ab" + "c"; }"#);
        assert!(!trace.heap.is_empty());
        let n = 512;
        let main = main_trace(&trace, n);
        assert!(main[col::LAST][n - 1].is_one());
        let first = &trace.heap[0];
        assert_eq!(main[col::REF][0], first.reference);
        assert_eq!(main[col::M][0], first.tag());
    }

    #[test]
    fn test_byte_multiplicities_cover_every_limb() {
        let trace = trace_of("function main(): u64 { return 300 * 7; }");
        let n = 256;
        let main = main_trace(&trace, n);
        let total: Fr = main[col::BMULT].iter().sum();
        assert_eq!(total, Fr::from((LIMBS * n) as u64));
    }
}
