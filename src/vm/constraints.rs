//! Constraint system (AIR) over execution traces.
//!
//! The matrix runs four lanes side by side over the same rows:
//!
//! - the CPU lane, one row per executed instruction and idle rows after
//!   `Halt`;
//! - the memory lane, every memory access sorted by address, then time;
//! - the hash lane, sixteen rows per MiMC compression of every composite
//!   the run looked into;
//! - byte multiplicities for the 8-bit range checks.
//!
//! Lanes talk over logarithmic-derivative buses. A lookup of fingerprint `f`
//! adds `1/(γ - f)` to one cyclic running sum, a table entry with
//! multiplicity `m` subtracts `m/(γ - f)`, and the public inputs and outputs
//! close the sum. Constraints are named closures over the current and next
//! row, each attached to the set of rows it must vanish on.

use ark_bls12_381::Fr;
use ark_ff::{Field, One, Zero};
use ark_poly::{EvaluationDomain, GeneralEvaluationDomain};

use crate::compiler::program::{Opcode, OutputTag};
use crate::hash::Digest;

/// Main trace columns.
pub mod col {
    pub const ACT: usize = 0;
    pub const CLK: usize = 1;
    pub const PC: usize = 2;
    pub const SP: usize = 3;
    pub const FP: usize = 4;
    pub const OPC: usize = 5;
    pub const A1: usize = 6;
    pub const A2: usize = 7;
    pub const A3: usize = 8;
    pub const HELPER: usize = 9;
    pub const LOGC: usize = 10;
    pub const AUTHC: usize = 11;
    pub const SDF: usize = 12;
    /// Executions of the instruction whose index is this row.
    pub const RMULT: usize = 13;
    pub const ACCESS: usize = 14;
    /// One selector per opcode, by index.
    pub const S_BASE: usize = 22;
    /// Little-endian byte limbs of the three range-checked values.
    pub const RC: usize = 60;

    pub const MA: usize = 84;
    pub const MT: usize = 85;
    pub const MV: usize = 86;
    pub const MW: usize = 87;
    pub const MON: usize = 88;
    /// First access of an address.
    pub const MN: usize = 89;
    /// A read of an address seen before.
    pub const MRD: usize = 90;
    /// Limbs of the gap to the previous lane row.
    pub const DM: usize = 91;

    pub const BMULT: usize = 95;

    /// MiMC states `x_{7t}..x_{7t+7}` of block row `t`.
    pub const X: usize = 96;
    pub const SQ: usize = 104;
    pub const K: usize = 111;
    pub const M: usize = 112;
    pub const IDX: usize = 113;
    pub const ISTAG: usize = 114;
    pub const LAST: usize = 115;
    pub const LEN: usize = 116;
    pub const KB0: usize = 117;
    pub const KB1: usize = 118;
    pub const REF: usize = 119;
    pub const HMULT: usize = 120;

    pub const fn addr(slot: usize) -> usize {
        ACCESS + 2 * slot
    }

    pub const fn val(slot: usize) -> usize {
        ACCESS + 2 * slot + 1
    }

    pub const fn rc(slot: usize, limb: usize) -> usize {
        RC + 8 * slot + limb
    }
}

/// Auxiliary columns, built once the bus challenges are known.
pub mod aux {
    pub const MINV: usize = 0;
    pub const HINV: usize = 4;
    pub const RINV: usize = 5;
    pub const RTINV: usize = 6;
    pub const IOINV: usize = 7;
    pub const MLINV: usize = 8;
    /// One column per pair of byte limbs.
    pub const BINV: usize = 9;
    pub const BTINV: usize = 23;
    pub const HTINV: usize = 24;
    pub const ACC: usize = 25;
}

/// Columns both sides derive from public data.
pub mod fixed {
    pub const P_START: usize = 0;
    pub const P_END: usize = 1;
    pub const RC: usize = 2;
    pub const BYTE: usize = 9;
    /// `pc, opcode, a1, a2, a3` of the program, zero past its end.
    pub const ROM: usize = 10;
}

/// Bus identifiers, the constant term of every fingerprint.
pub mod bus {
    pub const ROM: u64 = 1;
    pub const MEMORY: u64 = 2;
    pub const HEAP: u64 = 3;
    pub const BYTE: u64 = 4;
    pub const INPUT: u64 = 5;
    pub const OUTPUT: u64 = 6;
}

pub const MAIN_WIDTH: usize = 121;
pub const AUX_WIDTH: usize = 26;
pub const FIXED_WIDTH: usize = 15;

/// MiMC rounds per hash lane row.
pub const ROUNDS_PER_ROW: usize = 7;

/// Byte limbs per row: eight per range-checked value, four for the memory
/// lane gap.
pub const LIMBS: usize = 28;

/// Smallest padded trace length.
pub const MIN_TRACE_LEN: usize = 256;

/// Largest trace length a verifier accepts.
pub const MAX_TRACE_LEN: usize = 1 << 22;

/// Degree of the blinding polynomial for `num_queries` queries: every query
/// opens each column at four points.
pub fn blinding_degree(num_queries: usize) -> usize {
    4 * num_queries
}

/// Padded trace length for a trace of `height` rows.
pub fn trace_len(height: usize, num_queries: usize) -> usize {
    MIN_TRACE_LEN
        .max(height.next_power_of_two())
        .max((2 * blinding_degree(num_queries)).next_power_of_two())
}

/// Column of byte limb `i` of a row.
pub fn limb_column(i: usize) -> usize {
    if i < 24 { col::RC + i } else { col::DM + i - 24 }
}

/// Public data the constraints are bound to.
#[derive(Debug, Clone, Copy)]
pub struct PublicInputs<'a> {
    pub stack_inputs: &'a [u64],
    pub output_stack: &'a [u64],
    pub overflow_addrs: &'a [u64],
}

impl PublicInputs<'_> {
    /// Number of executed cycles, the first output word.
    pub fn cycle_count(&self) -> u64 {
        self.output_stack.first().copied().unwrap_or_default()
    }
}

/// Public words decoded into field values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicValues {
    pub stack_base: u64,
    pub cycles: u64,
    pub log_count: u64,
    pub auth_count: u64,
    pub self_destructed: bool,
    pub inputs: Vec<Fr>,
    /// `(tag, sequence, value)` of everything the run publishes.
    pub outputs: Vec<(OutputTag, u64, Fr)>,
}

impl PublicValues {
    /// Output words: cycles, log count, auth count, the result digest, one
    /// digest per public field, one per log, then the auth bits and the
    /// self-destruct flag.
    pub fn decode(
        stack_base: u64,
        public_fields: usize,
        public: &PublicInputs<'_>,
    ) -> Result<Self, String> {
        let field = |words: &[u64]| {
            Digest::from_words(words)
                .and_then(|digest| digest.to_field())
                .ok_or_else(|| "word group is not a field element".to_string())
        };

        if public.stack_inputs.len() % 8 != 0 {
            return Err("stack inputs are not whole digests".into());
        }
        let inputs = public
            .stack_inputs
            .chunks(8)
            .map(field)
            .collect::<Result<Vec<_>, _>>()?;

        let out = public.output_stack;
        let [cycles, log_count, auth_count] = match out.get(..3) {
            Some(&[c, l, a]) => [c, l, a],
            _ => return Err("output stack too short".into()),
        };
        let logs = usize::try_from(log_count).map_err(|_| "log count too large")?;
        let auths = usize::try_from(auth_count).map_err(|_| "auth count too large")?;
        let expected = public_fields
            .checked_add(logs)
            .and_then(|digests| digests.checked_add(1)?.checked_mul(8))
            .and_then(|words| words.checked_add(auths)?.checked_add(4));
        if expected != Some(out.len()) {
            return Err(format!(
                "output stack has {} words, expected {expected:?}",
                out.len()
            ));
        }

        let mut outputs = Vec::with_capacity(1 + public_fields + logs + auths);
        let mut at = 3;
        outputs.push((OutputTag::Result, 0, field(&out[at..at + 8])?));
        at += 8;
        for k in 0..public_fields {
            outputs.push((OutputTag::Field, k as u64, field(&out[at..at + 8])?));
            at += 8;
        }
        for i in 0..logs {
            outputs.push((OutputTag::Log, i as u64, field(&out[at..at + 8])?));
            at += 8;
        }
        for i in 0..auths {
            let bit = out[at + i];
            if bit > 1 {
                return Err("auth word is not a bit".into());
            }
            outputs.push((OutputTag::Auth, i as u64, Fr::from(bit)));
        }
        let self_destructed = match out[out.len() - 1] {
            0 => false,
            1 => true,
            _ => return Err("self-destruct word is not a bit".into()),
        };

        Ok(Self {
            stack_base,
            cycles,
            log_count,
            auth_count,
            self_destructed,
            inputs,
            outputs,
        })
    }

    /// `Σ 1/(γ - output) - Σ 1/(γ - input)`, what the bus sum must reach.
    pub fn balance(&self, challenges: &Challenges) -> Option<Fr> {
        let mut sum = Fr::zero();
        for (k, &value) in self.inputs.iter().enumerate() {
            let f = challenges.fingerprint(bus::INPUT, &[Fr::from(k as u64), value]);
            sum -= (challenges.gamma - f).inverse()?;
        }
        for &(tag, seq, value) in &self.outputs {
            let f = challenges.fingerprint(
                bus::OUTPUT,
                &[Fr::from(tag.code()), Fr::from(seq), value],
            );
            sum += (challenges.gamma - f).inverse()?;
        }
        Some(sum)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Challenges {
    pub alpha: Fr,
    pub gamma: Fr,
    powers: [Fr; 5],
}

impl Challenges {
    pub fn new(alpha: Fr, gamma: Fr) -> Self {
        let mut powers = [alpha; 5];
        for i in 1..powers.len() {
            powers[i] = powers[i - 1] * alpha;
        }
        Self { alpha, gamma, powers }
    }

    /// `bus + α·items[0] + α²·items[1] + ...`, at most five items.
    pub fn fingerprint(&self, bus: u64, items: &[Fr]) -> Fr {
        items
            .iter()
            .zip(&self.powers)
            .fold(Fr::from(bus), |acc, (item, power)| acc + *item * power)
    }
}

/// Row-major view of the current and next row.
pub struct Frame<'a> {
    pub main: &'a [Fr],
    pub aux: &'a [Fr],
    pub fixed: &'a [Fr],
    pub next_main: &'a [Fr],
    pub next_aux: &'a [Fr],
}

/// Rows a constraint must vanish on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Divisor {
    EveryRow,
    /// Every row but the last, for constraints that look at the next row.
    AllButLast,
    Row(usize),
}

type Evaluator = Box<dyn Fn(&Frame<'_>) -> Fr + Send + Sync>;

pub struct Constraint {
    pub name: String,
    pub divisor: Divisor,
    pub evaluate: Evaluator,
}

// Row expressions, shared by the constraints and the aux column builder.

/// Opcodes taking two stack operands and leaving one result.
const BINARY: [Opcode; 14] = [
    Opcode::Add,
    Opcode::Sub,
    Opcode::Mul,
    Opcode::Div,
    Opcode::Rem,
    Opcode::WrappingAdd,
    Opcode::WrappingSub,
    Opcode::WrappingMul,
    Opcode::Eq,
    Opcode::Ne,
    Opcode::Lt,
    Opcode::Le,
    Opcode::Gt,
    Opcode::Ge,
];

const WRAPPING: [Opcode; 3] = [Opcode::WrappingAdd, Opcode::WrappingSub, Opcode::WrappingMul];

/// Opcodes reading their single operand at `SP - 1` into slot 0.
const TOP_READ: [Opcode; 12] = [
    Opcode::Dup,
    Opcode::StoreLocal,
    Opcode::StoreField,
    Opcode::Alloc,
    Opcode::Length,
    Opcode::Not,
    Opcode::JumpIfFalse,
    Opcode::Return,
    Opcode::Log,
    Opcode::CheckAuth,
    Opcode::RequireAuth,
    Opcode::Output,
];

const PUSHES: [Opcode; 5] = [
    Opcode::Push,
    Opcode::Dup,
    Opcode::LoadLocal,
    Opcode::LoadField,
    Opcode::Input,
];

const POPS: [Opcode; 8] = [
    Opcode::Pop,
    Opcode::StoreLocal,
    Opcode::StoreField,
    Opcode::Index,
    Opcode::JumpIfFalse,
    Opcode::Log,
    Opcode::RequireAuth,
    Opcode::Output,
];

const PUBLISHES: [Opcode; 4] = [
    Opcode::Output,
    Opcode::Log,
    Opcode::CheckAuth,
    Opcode::RequireAuth,
];

const HEAP_OPS: [Opcode; 4] = [Opcode::Alloc, Opcode::Fill, Opcode::Index, Opcode::Length];

fn s(m: &[Fr], op: Opcode) -> Fr {
    m[col::S_BASE + op.index()]
}

fn any(m: &[Fr], ops: &[Opcode]) -> Fr {
    ops.iter().map(|&op| s(m, op)).sum()
}

fn value(m: &[Fr], slot: usize) -> Fr {
    m[col::val(slot)]
}

fn bit(x: Fr) -> Fr {
    x * (x - Fr::one())
}

fn two32() -> Fr {
    Fr::from(1u64 << 32)
}

fn recompose(m: &[Fr], start: usize, limbs: usize) -> Fr {
    let base = Fr::from(256u64);
    (0..limbs).rev().fold(Fr::zero(), |acc, i| acc * base + m[start + i])
}

/// Range-checked value of `slot`, below `2^64`.
fn range(m: &[Fr], slot: usize) -> Fr {
    recompose(m, col::rc(slot, 0), 8)
}

/// Gap to the previous memory lane row, below `2^32`.
fn gap(m: &[Fr]) -> Fr {
    recompose(m, col::DM, 4)
}

/// Whether a step uses memory slot `slot`.
pub(crate) fn slot_use(m: &[Fr], slot: usize) -> Fr {
    let binary = any(m, &BINARY);
    match slot {
        0 => {
            any(m, &TOP_READ)
                + any(m, &[Opcode::LoadLocal, Opcode::LoadField, Opcode::Fill, Opcode::Index])
                + s(m, Opcode::Call)
                + binary
        }
        1 => any(m, &[Opcode::Fill, Opcode::Index, Opcode::Call, Opcode::Return]) + binary,
        2 => any(m, &[Opcode::Fill, Opcode::Return]),
        _ => {
            any(m, &PUSHES)
                + any(
                    m,
                    &[
                        Opcode::StoreLocal,
                        Opcode::StoreField,
                        Opcode::Alloc,
                        Opcode::Length,
                        Opcode::Not,
                        Opcode::Index,
                        Opcode::Return,
                    ],
                )
                + binary
        }
    }
}

/// Address a step must access in memory slot `slot`, zero when unused.
fn slot_address(m: &[Fr], slot: usize) -> Fr {
    let (sp, fp, a1, a2, a3) = (m[col::SP], m[col::FP], m[col::A1], m[col::A2], m[col::A3]);
    let one = Fr::one();
    let two_operand = s(m, Opcode::Index) + any(m, &BINARY);
    let saved = sp - a2 + a3;
    match slot {
        0 => {
            any(m, &TOP_READ) * (sp - one)
                + s(m, Opcode::LoadLocal) * (fp + a1)
                + s(m, Opcode::LoadField) * a1
                + s(m, Opcode::Fill) * (sp - Fr::from(3u64))
                + two_operand * (sp - Fr::from(2u64))
                + s(m, Opcode::Call) * saved
        }
        1 => {
            s(m, Opcode::Fill) * (sp - Fr::from(2u64))
                + two_operand * (sp - one)
                + s(m, Opcode::Call) * (saved + one)
                + s(m, Opcode::Return) * (fp + a1)
        }
        2 => s(m, Opcode::Fill) * (sp - one) + s(m, Opcode::Return) * (fp + a1 + one),
        _ => {
            any(m, &PUSHES) * sp
                + s(m, Opcode::StoreLocal) * (fp + a1)
                + s(m, Opcode::StoreField) * a1
                + any(m, &[Opcode::Alloc, Opcode::Length, Opcode::Not]) * (sp - one)
                + two_operand * (sp - Fr::from(2u64))
                + s(m, Opcode::Return) * fp
        }
    }
}

fn pc_delta(m: &[Fr]) -> Fr {
    let (pc, a1) = (m[col::PC], m[col::A1]);
    let one = Fr::one();
    let sequential = m[col::ACT]
        - any(
            m,
            &[
                Opcode::Jump,
                Opcode::JumpIfFalse,
                Opcode::Call,
                Opcode::Return,
                Opcode::Halt,
            ],
        );
    sequential
        + any(m, &[Opcode::Jump, Opcode::Call]) * (a1 - pc)
        + s(m, Opcode::Return) * (value(m, 1) - pc)
        + s(m, Opcode::JumpIfFalse) * (one + (one - value(m, 0)) * (a1 - pc - one))
}

fn sp_delta(m: &[Fr]) -> Fr {
    any(m, &PUSHES) - any(m, &POPS) - any(m, &BINARY)
        - Fr::from(2u64) * s(m, Opcode::Fill)
        + s(m, Opcode::Call) * (m[col::A3] - m[col::A2] + Fr::from(2u64))
        + s(m, Opcode::Return) * (m[col::FP] + Fr::one() - m[col::SP])
}

fn fp_delta(m: &[Fr]) -> Fr {
    s(m, Opcode::Call) * (m[col::SP] - m[col::A2] - m[col::FP])
        + s(m, Opcode::Return) * (value(m, 2) - m[col::FP])
}

pub(crate) fn memory_fingerprint(ch: &Challenges, m: &[Fr], slot: usize) -> Fr {
    let time = Fr::from(4u64) * m[col::CLK] + Fr::from(slot as u64);
    let write = match slot {
        0 | 1 => s(m, Opcode::Call),
        2 => Fr::zero(),
        _ => Fr::one(),
    };
    ch.fingerprint(bus::MEMORY, &[m[col::addr(slot)], time, value(m, slot), write])
}

pub(crate) fn lane_fingerprint(ch: &Challenges, m: &[Fr]) -> Fr {
    ch.fingerprint(bus::MEMORY, &[m[col::MA], m[col::MT], m[col::MV], m[col::MW]])
}

pub(crate) fn heap_use(m: &[Fr]) -> Fr {
    any(m, &HEAP_OPS)
}

/// Heap lookup of the step, zero when it makes none.
pub(crate) fn heap_fingerprint(ch: &Challenges, m: &[Fr]) -> Fr {
    let fh = |items: [Fr; 4]| ch.fingerprint(bus::HEAP, &items);
    let (zero, one) = (Fr::zero(), Fr::one());
    let tag = |len: Fr| m[col::A1] * two32() + len;
    s(m, Opcode::Alloc) * fh([value(m, 3), zero, tag(value(m, 0)), one])
        + s(m, Opcode::Fill) * fh([value(m, 0), value(m, 1), value(m, 2), zero])
        + s(m, Opcode::Index) * fh([value(m, 0), value(m, 1), value(m, 3), zero])
        + s(m, Opcode::Length) * fh([value(m, 0), zero, tag(value(m, 3)), one])
}

pub(crate) fn heap_table_fingerprint(ch: &Challenges, m: &[Fr]) -> Fr {
    ch.fingerprint(
        bus::HEAP,
        &[m[col::REF], m[col::IDX], m[col::M], m[col::ISTAG]],
    )
}

pub(crate) fn rom_fingerprint(ch: &Challenges, m: &[Fr]) -> Fr {
    ch.fingerprint(
        bus::ROM,
        &[m[col::PC], m[col::OPC], m[col::A1], m[col::A2], m[col::A3]],
    )
}

pub(crate) fn rom_table_fingerprint(ch: &Challenges, fx: &[Fr]) -> Fr {
    ch.fingerprint(bus::ROM, &fx[fixed::ROM..fixed::ROM + 5])
}

pub(crate) fn io_use(m: &[Fr]) -> Fr {
    any(m, &PUBLISHES) + s(m, Opcode::Input)
}

/// Input or output of the step, zero when it has none.
pub(crate) fn io_fingerprint(ch: &Challenges, m: &[Fr]) -> Fr {
    let published = value(m, 0);
    let tag = |t: OutputTag| Fr::from(t.code());
    s(m, Opcode::Input) * ch.fingerprint(bus::INPUT, &[m[col::A1], value(m, 3)])
        + s(m, Opcode::Output)
            * ch.fingerprint(bus::OUTPUT, &[m[col::A1], m[col::A2], published])
        + s(m, Opcode::Log)
            * ch.fingerprint(bus::OUTPUT, &[tag(OutputTag::Log), m[col::LOGC], published])
        + any(m, &[Opcode::CheckAuth, Opcode::RequireAuth])
            * ch.fingerprint(bus::OUTPUT, &[tag(OutputTag::Auth), m[col::AUTHC], published])
}

pub(crate) fn byte_fingerprint(ch: &Challenges, byte: Fr) -> Fr {
    ch.fingerprint(bus::BYTE, &[byte])
}

/// What one row adds to the bus sum.
pub(crate) fn bus_step(m: &[Fr], a: &[Fr], fx: &[Fr]) -> Fr {
    let memory: Fr = (0..4).map(|slot| a[aux::MINV + slot]).sum();
    let bytes: Fr = (0..LIMBS / 2).map(|pair| a[aux::BINV + pair]).sum();
    memory - a[aux::MLINV]
        + a[aux::HINV]
        - fx[fixed::P_START] * m[col::HMULT] * a[aux::HTINV]
        + a[aux::RINV]
        - m[col::RMULT] * a[aux::RTINV]
        + a[aux::IOINV] * (any(m, &PUBLISHES) - s(m, Opcode::Input))
        + bytes
        - m[col::BMULT] * a[aux::BTINV]
}

pub struct ConstraintSystem {
    pub constraints: Vec<Constraint>,
    trace_len: usize,
    domain: GeneralEvaluationDomain<Fr>,
}

impl ConstraintSystem {
    /// Empty system over a trace of `trace_len` rows, a power of two.
    pub fn new(trace_len: usize) -> Option<Self> {
        let domain = GeneralEvaluationDomain::<Fr>::new(trace_len)?;
        (domain.size() == trace_len).then_some(Self {
            constraints: Vec::new(),
            trace_len,
            domain,
        })
    }

    pub fn trace_len(&self) -> usize {
        self.trace_len
    }

    pub fn len(&self) -> usize {
        self.constraints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    pub fn add_row_constraint(
        &mut self,
        name: &str,
        evaluate: impl Fn(&Frame<'_>) -> Fr + Send + Sync + 'static,
    ) {
        self.push(name, Divisor::EveryRow, evaluate);
    }

    pub fn add_transition_constraint(
        &mut self,
        name: &str,
        evaluate: impl Fn(&Frame<'_>) -> Fr + Send + Sync + 'static,
    ) {
        self.push(name, Divisor::AllButLast, evaluate);
    }

    pub fn add_boundary_constraint(
        &mut self,
        name: &str,
        row: usize,
        evaluate: impl Fn(&Frame<'_>) -> Fr + Send + Sync + 'static,
    ) {
        self.push(name, Divisor::Row(row), evaluate);
    }

    fn push(
        &mut self,
        name: &str,
        divisor: Divisor,
        evaluate: impl Fn(&Frame<'_>) -> Fr + Send + Sync + 'static,
    ) {
        self.constraints.push(Constraint {
            name: name.to_string(),
            divisor,
            evaluate: Box::new(evaluate),
        });
    }

    /// The AIR of a run with the given public values. Transition
    /// constraints have degree at most three, boundary constraints two.
    pub fn for_execution(
        trace_len: usize,
        public: &PublicValues,
        challenges: &Challenges,
    ) -> Option<Self> {
        let mut system = Self::new(trace_len)?;
        let balance = public.balance(challenges)? * Fr::from(trace_len as u64).inverse()?;
        system.add_cpu_constraints(*challenges);
        system.add_alu_constraints();
        system.add_memory_constraints(*challenges);
        system.add_hash_constraints(*challenges);
        system.add_bus_constraints(*challenges, balance);
        system.add_boundaries(public);
        Some(system)
    }

    fn add_cpu_constraints(&mut self, ch: Challenges) {
        self.add_row_constraint("active_is_bit", |f| bit(f.main[col::ACT]));
        for op in Opcode::ALL {
            self.add_row_constraint(&format!("selector_{op:?}_is_bit"), move |f| {
                bit(s(f.main, op))
            });
        }
        self.add_row_constraint("one_opcode_when_active", |f| {
            any(f.main, &Opcode::ALL) - f.main[col::ACT]
        });
        self.add_row_constraint("opcode_matches_selector", |f| {
            let code: Fr = Opcode::ALL
                .iter()
                .map(|&op| Fr::from(op.code()) * s(f.main, op))
                .sum();
            f.main[col::OPC] - code
        });
        self.add_row_constraint("instruction_in_program", move |f| {
            f.aux[aux::RINV] * (ch.gamma - rom_fingerprint(&ch, f.main)) - f.main[col::ACT]
        });
        self.add_row_constraint("program_table", move |f| {
            f.aux[aux::RTINV] * (ch.gamma - rom_table_fingerprint(&ch, f.fixed)) - Fr::one()
        });

        self.add_transition_constraint("halt", |f| {
            f.next_main[col::ACT] - f.main[col::ACT] + s(f.main, Opcode::Halt)
        });
        self.add_transition_constraint("clock", |f| {
            f.next_main[col::CLK] - f.main[col::CLK] - f.main[col::ACT]
        });
        self.add_transition_constraint("pc", |f| {
            f.next_main[col::PC] - f.main[col::PC] - pc_delta(f.main)
        });
        self.add_transition_constraint("sp", |f| {
            f.next_main[col::SP] - f.main[col::SP] - sp_delta(f.main)
        });
        self.add_transition_constraint("fp", |f| {
            f.next_main[col::FP] - f.main[col::FP] - fp_delta(f.main)
        });
        self.add_transition_constraint("log_counter", |f| {
            f.next_main[col::LOGC] - f.main[col::LOGC] - s(f.main, Opcode::Log)
        });
        self.add_transition_constraint("auth_counter", |f| {
            f.next_main[col::AUTHC]
                - f.main[col::AUTHC]
                - any(f.main, &[Opcode::CheckAuth, Opcode::RequireAuth])
        });
        self.add_transition_constraint("self_destruct_flag", |f| {
            let flag = f.main[col::SDF];
            f.next_main[col::SDF] - flag - s(f.main, Opcode::SelfDestruct) * (Fr::one() - flag)
        });

        for slot in 0..4 {
            self.add_row_constraint(&format!("slot_{slot}_address"), move |f| {
                f.main[col::addr(slot)] - slot_address(f.main, slot)
            });
            self.add_row_constraint(&format!("slot_{slot}_lookup"), move |f| {
                f.aux[aux::MINV + slot] * (ch.gamma - memory_fingerprint(&ch, f.main, slot))
                    - slot_use(f.main, slot)
            });
        }

        self.add_row_constraint("push_value", |f| {
            s(f.main, Opcode::Push) * (value(f.main, 3) - f.main[col::A1])
        });
        self.add_row_constraint("copy_value", |f| {
            let copies = any(
                f.main,
                &[
                    Opcode::Dup,
                    Opcode::LoadLocal,
                    Opcode::LoadField,
                    Opcode::StoreLocal,
                    Opcode::StoreField,
                    Opcode::Return,
                ],
            );
            copies * (value(f.main, 3) - value(f.main, 0))
        });
        self.add_row_constraint("call_saves_pc", |f| {
            s(f.main, Opcode::Call) * (value(f.main, 0) - f.main[col::PC] - Fr::one())
        });
        self.add_row_constraint("call_saves_fp", |f| {
            s(f.main, Opcode::Call) * (value(f.main, 1) - f.main[col::FP])
        });
        self.add_row_constraint("condition_is_bit", |f| {
            let tests = any(f.main, &[Opcode::Not, Opcode::JumpIfFalse, Opcode::CheckAuth]);
            tests * bit(value(f.main, 0))
        });
        self.add_row_constraint("not", |f| {
            s(f.main, Opcode::Not) * (value(f.main, 3) + value(f.main, 0) - Fr::one())
        });
        self.add_row_constraint("required_auth", |f| {
            s(f.main, Opcode::RequireAuth) * (value(f.main, 0) - Fr::one())
        });
        self.add_row_constraint("length_fits", |f| {
            s(f.main, Opcode::Length) * (range(f.main, 0) - value(f.main, 3))
        });

        self.add_row_constraint("heap_lookup", move |f| {
            f.aux[aux::HINV] * (ch.gamma - heap_fingerprint(&ch, f.main)) - heap_use(f.main)
        });
        self.add_row_constraint("io_lookup", move |f| {
            f.aux[aux::IOINV] * (ch.gamma - io_fingerprint(&ch, f.main)) - io_use(f.main)
        });
    }

    /// Arithmetic on operands in `[0, 2^w)`, with `A1 = 2^w` from the
    /// program. Results and witnesses are bound by byte range checks.
    fn add_alu_constraints(&mut self) {
        let one = Fr::one;
        let terms = |f: &Frame<'_>| {
            (
                value(f.main, 0),
                value(f.main, 1),
                value(f.main, 3),
                f.main[col::HELPER],
                f.main[col::A1],
            )
        };

        self.add_row_constraint("add", move |f| {
            let (a, b, r, _, _) = terms(f);
            s(f.main, Opcode::Add) * (r - a - b)
        });
        self.add_row_constraint("sub", move |f| {
            let (a, b, r, _, _) = terms(f);
            s(f.main, Opcode::Sub) * (r - a + b)
        });
        self.add_row_constraint("mul", move |f| {
            let (a, b, r, _, _) = terms(f);
            s(f.main, Opcode::Mul) * (r - a * b)
        });
        self.add_row_constraint("checked_below_modulus", move |f| {
            let (_, _, r, _, modulus) = terms(f);
            any(f.main, &[Opcode::Add, Opcode::Mul]) * (range(f.main, 0) - modulus + one() + r)
        });
        self.add_row_constraint("sub_no_underflow", move |f| {
            let (_, _, r, _, _) = terms(f);
            s(f.main, Opcode::Sub) * (range(f.main, 0) - r)
        });

        self.add_row_constraint("div", move |f| {
            let (a, b, q, rem, _) = terms(f);
            s(f.main, Opcode::Div) * (a - q * b - rem)
        });
        self.add_row_constraint("rem", move |f| {
            let (a, b, rem, q, _) = terms(f);
            s(f.main, Opcode::Rem) * (a - q * b - rem)
        });
        self.add_row_constraint("div_remainder", move |f| {
            let (_, b, _, rem, _) = terms(f);
            s(f.main, Opcode::Div) * (range(f.main, 0) - rem)
                + s(f.main, Opcode::Div) * (range(f.main, 1) - b + one() + rem)
        });
        self.add_row_constraint("div_quotient", move |f| {
            let (_, _, q, _, _) = terms(f);
            s(f.main, Opcode::Div) * (range(f.main, 2) - q)
        });
        self.add_row_constraint("rem_remainder", move |f| {
            let (_, b, rem, _, _) = terms(f);
            s(f.main, Opcode::Rem) * (range(f.main, 0) - rem)
                + s(f.main, Opcode::Rem) * (range(f.main, 1) - b + one() + rem)
        });
        self.add_row_constraint("rem_quotient", move |f| {
            let (_, _, _, q, _) = terms(f);
            s(f.main, Opcode::Rem) * (range(f.main, 2) - q)
        });

        self.add_row_constraint("carry_is_bit", move |f| {
            let (_, _, _, carry, _) = terms(f);
            any(f.main, &[Opcode::WrappingAdd, Opcode::WrappingSub]) * bit(carry)
        });
        self.add_row_constraint("wrapping_add", move |f| {
            let (a, b, r, carry, modulus) = terms(f);
            s(f.main, Opcode::WrappingAdd) * (a + b - r - carry * modulus)
        });
        self.add_row_constraint("wrapping_sub", move |f| {
            let (a, b, r, borrow, modulus) = terms(f);
            s(f.main, Opcode::WrappingSub) * (a - b + borrow * modulus - r)
        });
        self.add_row_constraint("wrapping_mul", move |f| {
            let (a, b, r, high, modulus) = terms(f);
            s(f.main, Opcode::WrappingMul) * (a * b - high * modulus - r)
        });
        self.add_row_constraint("wrapping_low", move |f| {
            let (_, _, r, _, _) = terms(f);
            any(f.main, &WRAPPING) * (range(f.main, 0) - r)
        });
        self.add_row_constraint("wrapping_below_modulus", move |f| {
            let (_, _, r, _, modulus) = terms(f);
            any(f.main, &WRAPPING) * (range(f.main, 1) - modulus + one() + r)
        });
        self.add_row_constraint("wrapping_high", move |f| {
            let (_, _, _, high, _) = terms(f);
            s(f.main, Opcode::WrappingMul) * (range(f.main, 2) - high)
        });

        self.add_row_constraint("eq", move |f| {
            let (a, b, r, inverse, _) = terms(f);
            s(f.main, Opcode::Eq) * ((a - b) * inverse - one() + r)
        });
        self.add_row_constraint("eq_differs", move |f| {
            let (a, b, r, _, _) = terms(f);
            s(f.main, Opcode::Eq) * (a - b) * r
        });
        self.add_row_constraint("ne", move |f| {
            let (a, b, r, inverse, _) = terms(f);
            s(f.main, Opcode::Ne) * ((a - b) * inverse - r)
        });
        self.add_row_constraint("ne_equal", move |f| {
            let (a, b, r, _, _) = terms(f);
            s(f.main, Opcode::Ne) * (a - b) * (one() - r)
        });

        self.add_row_constraint("ordered_is_bit", move |f| {
            let (_, _, r, _, _) = terms(f);
            any(f.main, &[Opcode::Lt, Opcode::Le, Opcode::Gt, Opcode::Ge]) * bit(r)
        });
        // For each ordered compare, the gap the result claims is range
        // checked: `high - low - strict` when true, the reverse otherwise.
        for (name, op, strict) in [
            ("lt", Opcode::Lt, true),
            ("le", Opcode::Le, false),
            ("gt", Opcode::Gt, true),
            ("ge", Opcode::Ge, false),
        ] {
            let below = matches!(op, Opcode::Lt | Opcode::Le);
            self.add_row_constraint(name, move |f| {
                let (a, b, r, _, _) = terms(f);
                let (low, high) = if below { (a, b) } else { (b, a) };
                let (when_true, when_false) = if strict {
                    (high - low - one(), low - high)
                } else {
                    (high - low, low - high - one())
                };
                s(f.main, op) * (range(f.main, 0) - r * when_true - (one() - r) * when_false)
            });
        }
    }

    /// Memory lane: a permutation of the CPU accesses sorted by address,
    /// then time, where every address starts with a write and every read
    /// sees the value before it.
    fn add_memory_constraints(&mut self, ch: Challenges) {
        for (name, column) in [
            ("lane_active_is_bit", col::MON),
            ("lane_new_is_bit", col::MN),
            ("lane_write_is_bit", col::MW),
        ] {
            self.add_row_constraint(name, move |f| bit(f.main[column]));
        }
        self.add_transition_constraint("lane_stays_off", |f| {
            (Fr::one() - f.main[col::MON]) * f.next_main[col::MON]
        });
        self.add_row_constraint("lane_read_flag", |f| {
            let m = f.main;
            m[col::MRD] - m[col::MON] * (Fr::one() - m[col::MN]) * (Fr::one() - m[col::MW])
        });
        self.add_row_constraint("lane_new_address_is_written", |f| {
            f.main[col::MN] * (Fr::one() - f.main[col::MW])
        });
        self.add_transition_constraint("lane_same_address", |f| {
            let n = f.next_main;
            n[col::MON] * (Fr::one() - n[col::MN]) * (n[col::MA] - f.main[col::MA])
        });
        self.add_transition_constraint("lane_sorted", |f| {
            let (m, n) = (f.main, f.next_main);
            let one = Fr::one();
            let step = n[col::MN] * (n[col::MA] - m[col::MA] - one)
                + (one - n[col::MN]) * (n[col::MT] - m[col::MT] - one);
            n[col::MON] * (step - gap(n))
        });
        self.add_transition_constraint("lane_read_value", |f| {
            f.next_main[col::MRD] * (f.next_main[col::MV] - f.main[col::MV])
        });
        self.add_row_constraint("lane_lookup", move |f| {
            f.aux[aux::MLINV] * (ch.gamma - lane_fingerprint(&ch, f.main)) - f.main[col::MON]
        });
    }

    /// Hash lane: blocks of sixteen rows, seven MiMC rounds per row. Each
    /// composite is its tag block followed by one block per item, chained
    /// Miyaguchi-Preneel style from a zero key.
    fn add_hash_constraints(&mut self, ch: Challenges) {
        for j in 0..ROUNDS_PER_ROW {
            self.add_row_constraint(&format!("round_{j}_square"), move |f| {
                let m = f.main;
                let t = m[col::X + j] + m[col::K] + f.fixed[fixed::RC + j];
                m[col::SQ + j] - t.square()
            });
            self.add_row_constraint(&format!("round_{j}"), move |f| {
                let m = f.main;
                let t = m[col::X + j] + m[col::K] + f.fixed[fixed::RC + j];
                m[col::X + j + 1] - m[col::SQ + j].square() * t
            });
        }

        let end = |f: &Frame<'_>| f.fixed[fixed::P_END];
        let start = |f: &Frame<'_>| f.fixed[fixed::P_START];
        let output = |f: &Frame<'_>| f.main[col::X + 7] + f.main[col::K] + f.main[col::M];

        self.add_transition_constraint("rounds_chain", move |f| {
            (Fr::one() - end(f)) * (f.next_main[col::X] - f.main[col::X + 7])
        });
        for (name, column) in [
            ("block_key", col::K),
            ("block_message", col::M),
            ("block_index", col::IDX),
            ("block_tag", col::ISTAG),
        ] {
            self.add_transition_constraint(name, move |f| {
                (Fr::one() - end(f)) * (f.next_main[column] - f.main[column])
            });
        }
        self.add_row_constraint("block_absorbs_message", move |f| {
            start(f) * (f.main[col::X] - f.main[col::M])
        });
        self.add_row_constraint("tag_block_key", move |f| {
            start(f) * f.main[col::ISTAG] * f.main[col::K]
        });
        self.add_row_constraint("tag_block_index", move |f| {
            start(f) * f.main[col::ISTAG] * f.main[col::IDX]
        });
        self.add_row_constraint("tag", move |f| {
            let m = f.main;
            let kind = m[col::KB0] + Fr::from(2u64) * m[col::KB1];
            start(f) * m[col::ISTAG] * (m[col::M] - kind * two32() - m[col::LEN])
        });

        let continues = move |f: &Frame<'_>| end(f) * (Fr::one() - f.main[col::LAST]);
        self.add_transition_constraint("key_chain", move |f| {
            continues(f) * (f.next_main[col::K] - output(f))
        });
        self.add_transition_constraint("item_follows", move |f| {
            continues(f) * f.next_main[col::ISTAG]
        });
        self.add_transition_constraint("index_follows", move |f| {
            let m = f.main;
            continues(f) * (f.next_main[col::IDX] - m[col::IDX] - Fr::one() + m[col::ISTAG])
        });

        let finishes = move |f: &Frame<'_>| end(f) * f.main[col::LAST];
        self.add_row_constraint("object_hash", move |f| {
            finishes(f) * (f.main[col::REF] - output(f))
        });
        self.add_row_constraint("object_length", move |f| {
            let m = f.main;
            finishes(f) * (m[col::IDX] + Fr::one() - m[col::ISTAG] - m[col::LEN])
        });
        self.add_transition_constraint("object_starts_with_tag", move |f| {
            finishes(f) * (Fr::one() - f.next_main[col::ISTAG])
        });
        for (name, column) in [
            ("object_ref", col::REF),
            ("object_len", col::LEN),
            ("object_kind_low", col::KB0),
            ("object_kind_high", col::KB1),
        ] {
            self.add_transition_constraint(name, move |f| {
                (Fr::one() - finishes(f)) * (f.next_main[column] - f.main[column])
            });
        }
        for (name, column) in [
            ("istag_is_bit", col::ISTAG),
            ("last_is_bit", col::LAST),
            ("kind_low_is_bit", col::KB0),
            ("kind_high_is_bit", col::KB1),
        ] {
            self.add_row_constraint(name, move |f| bit(f.main[column]));
        }
        self.add_row_constraint("heap_table", move |f| {
            f.aux[aux::HTINV] * (ch.gamma - heap_table_fingerprint(&ch, f.main)) - Fr::one()
        });
    }

    fn add_bus_constraints(&mut self, ch: Challenges, balance: Fr) {
        for pair in 0..LIMBS / 2 {
            self.add_row_constraint(&format!("byte_pair_{pair}"), move |f| {
                let lo = ch.gamma - byte_fingerprint(&ch, f.main[limb_column(2 * pair)]);
                let hi = ch.gamma - byte_fingerprint(&ch, f.main[limb_column(2 * pair + 1)]);
                f.aux[aux::BINV + pair] * lo * hi - lo - hi
            });
        }
        self.add_row_constraint("byte_table", move |f| {
            f.aux[aux::BTINV] * (ch.gamma - byte_fingerprint(&ch, f.fixed[fixed::BYTE]))
                - Fr::one()
        });
        // Cyclic: the sum over all rows must come back to where it started.
        self.add_row_constraint("bus_balance", move |f| {
            f.next_aux[aux::ACC] - f.aux[aux::ACC] - bus_step(f.main, f.aux, f.fixed) + balance
        });
    }

    fn add_boundaries(&mut self, public: &PublicValues) {
        let last = self.trace_len - 1;
        let base = Fr::from(public.stack_base);
        let one = Fr::one();

        self.add_boundary_constraint("starts_active", 0, move |f| f.main[col::ACT] - one);
        for (name, column) in [
            ("clock_starts_at_zero", col::CLK),
            ("pc_starts_at_zero", col::PC),
            ("logs_start_at_zero", col::LOGC),
            ("auths_start_at_zero", col::AUTHC),
            ("not_destructed_at_start", col::SDF),
        ] {
            self.add_boundary_constraint(name, 0, move |f| f.main[column]);
        }
        self.add_boundary_constraint("sp_starts_at_stack_base", 0, move |f| {
            f.main[col::SP] - base
        });
        self.add_boundary_constraint("fp_starts_at_stack_base", 0, move |f| {
            f.main[col::FP] - base
        });
        self.add_boundary_constraint("lane_starts_with_write", 0, move |f| {
            f.main[col::MW] - one
        });
        self.add_boundary_constraint("hash_lane_starts_with_tag", 0, move |f| {
            f.main[col::ISTAG] - one
        });

        self.add_boundary_constraint("halted", last, |f| f.main[col::ACT]);
        self.add_boundary_constraint("hash_lane_ends_an_object", last, move |f| {
            f.main[col::LAST] - one
        });
        for (name, column, expected) in [
            ("cycle_count", col::CLK, Fr::from(public.cycles)),
            ("log_count", col::LOGC, Fr::from(public.log_count)),
            ("auth_count", col::AUTHC, Fr::from(public.auth_count)),
            ("self_destructed", col::SDF, Fr::from(public.self_destructed)),
        ] {
            self.add_boundary_constraint(name, last, move |f| f.main[column] - expected);
        }
    }

    /// `g^row` on the trace domain.
    pub fn row_point(&self, row: usize) -> Fr {
        self.domain.element(row)
    }

    /// Value of a divisor at a point outside the trace domain.
    pub fn divisor_at(&self, divisor: Divisor, x: Fr) -> Option<Fr> {
        let vanishing = x.pow([self.trace_len as u64]) - Fr::one();
        match divisor {
            Divisor::EveryRow => Some(vanishing),
            Divisor::AllButLast => {
                let last = x - self.row_point(self.trace_len - 1);
                Some(vanishing * last.inverse()?)
            }
            Divisor::Row(row) => Some(x - self.row_point(row)),
        }
    }

    /// Constraint numerators for one frame, in declaration order.
    pub fn evaluate(&self, frame: &Frame<'_>) -> Vec<Fr> {
        self.constraints
            .iter()
            .map(|constraint| (constraint.evaluate)(frame))
            .collect()
    }

    /// Random linear combination of the constraint quotients at `x`.
    pub fn composition_at(&self, x: Fr, frame: &Frame<'_>, alphas: &[Fr]) -> Option<Fr> {
        let every_row = self.divisor_at(Divisor::EveryRow, x)?.inverse()?;
        let all_but_last = self.divisor_at(Divisor::AllButLast, x)?.inverse()?;
        let mut sum = Fr::zero();
        for ((constraint, numerator), alpha) in
            self.constraints.iter().zip(self.evaluate(frame)).zip(alphas)
        {
            let inverse = match constraint.divisor {
                Divisor::EveryRow => every_row,
                Divisor::AllButLast => all_but_last,
                row => self.divisor_at(row, x)?.inverse()?,
            };
            sum += *alpha * numerator * inverse;
        }
        Some(sum)
    }

    /// Checks every constraint on the rows it applies to. Columns are given
    /// column-major, `trace_len` values each.
    pub fn is_satisfied(
        &self,
        main: &[Vec<Fr>],
        aux_columns: &[Vec<Fr>],
        fixed_columns: &[Vec<Fr>],
    ) -> bool {
        self.first_violation(main, aux_columns, fixed_columns).is_none()
    }

    /// Name and row of the first violated constraint.
    pub fn first_violation(
        &self,
        main: &[Vec<Fr>],
        aux_columns: &[Vec<Fr>],
        fixed_columns: &[Vec<Fr>],
    ) -> Option<(String, usize)> {
        let n = self.trace_len;
        let row_of = |columns: &[Vec<Fr>], i: usize| -> Vec<Fr> {
            columns.iter().map(|column| column[i]).collect()
        };
        let mut cur_main = row_of(main, 0);
        let mut cur_aux = row_of(aux_columns, 0);
        for i in 0..n {
            let next = (i + 1) % n;
            let (next_main, next_aux) = (row_of(main, next), row_of(aux_columns, next));
            let cur_fixed = row_of(fixed_columns, i);
            let frame = Frame {
                main: &cur_main,
                aux: &cur_aux,
                fixed: &cur_fixed,
                next_main: &next_main,
                next_aux: &next_aux,
            };
            for constraint in &self.constraints {
                let applies = match constraint.divisor {
                    Divisor::EveryRow => true,
                    Divisor::AllButLast => i != n - 1,
                    Divisor::Row(row) => i == row,
                };
                if applies && !(constraint.evaluate)(&frame).is_zero() {
                    return Some((constraint.name.clone(), i));
                }
            }
            cur_main = next_main;
            cur_aux = next_aux;
        }
        None
    }
}
