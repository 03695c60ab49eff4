//! Deterministic word machine that runs a compiled program and records its
//! trace.
//!
//! Every value is one field element: scalars stand for themselves and
//! composites for their content hash. A composite under construction is
//! named by a placeholder word until `Seal` fixes its hash; placeholders are
//! replaced throughout the recorded trace once the run ends.

use std::collections::{HashMap, HashSet};

use ark_bls12_381::Fr;
use ark_ff::{Field, PrimeField, Zero};
use tracing::{debug, trace};

use super::ExecutionOutput;
use super::trace::{Access, ExecutionTrace, HeapKey, HeapObject, Step};
use super::value::Value;
use crate::compiler::program::{
    ArithOp, CompareOp, CompiledProgram, Instruction, Kind, Literal, OutputTag, ValueType,
    WrapOp,
};
use crate::error::{RuntimeError, RuntimeErrorKind};
use crate::hash::{Digest, composite_hash, composite_tag};
use crate::lang::Width;
use crate::proof::ProgramInfo;

/// Runs the entry point of `program`. `this` must be present exactly when the
/// entry belongs to a contract and match its declared layout; `args` must
/// match the entry parameters. Both are checked before the first cycle.
pub fn run(
    program: &CompiledProgram,
    this: Option<Value>,
    args: Vec<Value>,
) -> Result<(ExecutionOutput, ExecutionTrace), RuntimeError> {
    let initial_fields = validate(program, this.as_ref(), &args)?;
    let inputs: Vec<Value> = initial_fields.into_iter().chain(args).collect();

    let mut stack_inputs = Vec::with_capacity(8 * inputs.len());
    for value in &inputs {
        stack_inputs.extend(value.content_hash().to_words());
    }

    let rom = program.code().rom();
    let mut machine = Machine::new(program);
    let words: Vec<Fr> = inputs.iter().map(|value| machine.intern(value)).collect();
    machine.inputs = words;
    machine.execute(&rom)?;

    let result_word = machine.result.ok_or_else(|| machine.fault())?;
    let result = match &program.returns {
        Some(ty) => machine
            .decode(result_word, ty)
            .ok_or_else(|| machine.fault())?,
        None => Value::Null,
    };
    let this_snapshot = match program.this_type {
        Some(_) => Some(machine.public_this()?),
        None => None,
    };
    let result_hash = Digest::from_field(result_word);
    let hashes: Vec<Digest> = machine.fields.iter().map(|&word| Digest::from_field(word)).collect();

    let cycles = machine.cycle;
    let mut output_stack = vec![
        cycles,
        machine.logs.len() as u64,
        machine.read_auth.len() as u64,
    ];
    output_stack.extend(result_hash.to_words());
    for hash in &hashes {
        output_stack.extend(hash.to_words());
    }
    for &word in &machine.log_words {
        output_stack.extend(Digest::from_field(word).to_words());
    }
    output_stack.extend(machine.read_auth.iter().map(|&ok| u64::from(ok)));
    output_stack.push(u64::from(machine.self_destructed));

    debug!(
        entry = %program.entry_name,
        cycles,
        logs = machine.logs.len(),
        composites = machine.heap.len(),
        "run finished"
    );

    let logs = std::mem::take(&mut machine.logs);
    let read_auth = std::mem::take(&mut machine.read_auth);
    let self_destructed = machine.self_destructed;
    let (steps, heap) = machine.finish();
    let trace = ExecutionTrace {
        steps,
        rom,
        heap,
        stack_base: program.stack_base(),
        stack_inputs,
        output_stack,
    };

    let output = ExecutionOutput {
        proof: None,
        program_info: ProgramInfo::from_program(program),
        cycle_count: cycles,
        this: this_snapshot,
        result,
        result_hash,
        logs,
        hashes,
        read_auth,
        self_destructed,
        stack_inputs: trace.stack_inputs.clone(),
        output_stack: trace.output_stack.clone(),
        overflow_addrs: trace.overflow_addrs(),
    };
    Ok((output, trace))
}

/// Checks the run inputs and returns the initial values of the public fields.
fn validate(
    program: &CompiledProgram,
    this: Option<&Value>,
    args: &[Value],
) -> Result<Vec<Value>, RuntimeError> {
    let mismatch = |message: String| RuntimeError::type_mismatch(message, 0);
    let public = match (&program.this_type, this) {
        (Some(ty), Some(this)) => {
            this.check(ty).map_err(|err| mismatch(format!("this: {err}")))?;
            match this {
                Value::Object(fields) => program
                    .public_fields
                    .iter()
                    .filter_map(|&index| fields.get(index).map(|(_, v)| v.clone()))
                    .collect(),
                _ => Vec::new(),
            }
        }
        (None, None) => Vec::new(),
        (Some(_), None) => return Err(mismatch("contract entry point requires `this`".into())),
        (None, Some(_)) => return Err(mismatch("free function does not take `this`".into())),
    };
    if args.len() != program.params.len() {
        return Err(mismatch(format!(
            "expected {} arguments, found {}",
            program.params.len(),
            args.len()
        )));
    }
    for (i, (arg, ty)) in args.iter().zip(&program.params).enumerate() {
        arg.check(ty)
            .map_err(|err| mismatch(format!("argument {i}: {err}")))?;
    }
    Ok(public)
}

/// The word as an integer, if it is below `2^64`.
pub(crate) fn small(word: Fr) -> Option<u64> {
    let limbs = word.into_bigint().0;
    limbs[1..].iter().all(|&limb| limb == 0).then_some(limbs[0])
}

struct Pending {
    kind: Kind,
    items: Vec<Option<Fr>>,
}

struct Machine<'p> {
    program: &'p CompiledProgram,
    /// Word-addressed memory: `this` slots, then the stack.
    memory: Vec<Option<Fr>>,
    pc: usize,
    sp: u64,
    fp: u64,
    cycle: u64,
    inputs: Vec<Fr>,
    heap: HashMap<Fr, HeapObject>,
    pending: HashMap<Fr, Pending>,
    /// Placeholder to sealed reference.
    sealed: HashMap<Fr, Fr>,
    placeholders: u64,
    result: Option<Fr>,
    fields: Vec<Fr>,
    logs: Vec<Value>,
    log_words: Vec<Fr>,
    read_auth: Vec<bool>,
    self_destructed: bool,
    steps: Vec<Step>,
}

impl<'p> Machine<'p> {
    fn new(program: &'p CompiledProgram) -> Self {
        let base = program.stack_base();
        Self {
            program,
            memory: Vec::new(),
            pc: 0,
            sp: base,
            fp: base,
            cycle: 0,
            inputs: Vec::new(),
            heap: HashMap::new(),
            pending: HashMap::new(),
            sealed: HashMap::new(),
            placeholders: 0,
            result: None,
            fields: Vec::new(),
            logs: Vec::new(),
            log_words: Vec::new(),
            read_auth: Vec::new(),
            self_destructed: false,
            steps: Vec::new(),
        }
    }

    fn error(&self, kind: RuntimeErrorKind) -> RuntimeError {
        RuntimeError::new(kind, self.cycle)
    }

    /// A broken internal invariant of the compiled program.
    fn fault(&self) -> RuntimeError {
        self.error(RuntimeErrorKind::StackUnderflow)
    }

    fn type_error(&self, expected: &str, word: Fr) -> RuntimeError {
        RuntimeError::type_mismatch(format!("expected {expected}, found word {word}"), self.cycle)
    }

    fn below(&self, top: u64, n: u64) -> Result<u64, RuntimeError> {
        top.checked_sub(n).ok_or_else(|| self.fault())
    }

    fn uint(&self, word: Fr) -> Result<u64, RuntimeError> {
        small(word).ok_or_else(|| self.type_error("an integer", word))
    }

    fn boolean(&self, word: Fr) -> Result<bool, RuntimeError> {
        match small(word) {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(self.type_error("a boolean", word)),
        }
    }

    fn read(&self, step: &mut Step, slot: usize, addr: u64) -> Result<Fr, RuntimeError> {
        let value = usize::try_from(addr)
            .ok()
            .and_then(|index| self.memory.get(index).copied().flatten())
            .ok_or_else(|| self.fault())?;
        step.accesses[slot] = Some(Access {
            addr,
            value,
            write: false,
        });
        Ok(value)
    }

    fn write(&mut self, step: &mut Step, slot: usize, addr: u64, value: Fr) -> Result<(), RuntimeError> {
        let index = u32::try_from(addr).map_err(|_| self.fault())? as usize;
        if index >= self.memory.len() {
            self.memory.resize(index + 1, None);
        }
        self.memory[index] = Some(value);
        step.accesses[slot] = Some(Access {
            addr,
            value,
            write: true,
        });
        Ok(())
    }

    fn resolve(&self, word: Fr) -> Fr {
        self.sealed.get(&word).copied().unwrap_or(word)
    }

    fn insert(&mut self, kind: Kind, items: Vec<Fr>) -> Fr {
        let reference = composite_hash(kind.code(), &items);
        self.heap.entry(reference).or_insert_with(|| HeapObject {
            reference,
            kind,
            items,
        });
        reference
    }

    /// Puts `value` and its parts on the heap, returning its word.
    fn intern(&mut self, value: &Value) -> Fr {
        let (kind, items) = match value {
            Value::Null | Value::Boolean(_) | Value::UInt(..) => return value.content_ref(),
            Value::String(s) => (
                Kind::String,
                s.chars().map(|c| Fr::from(u64::from(u32::from(c)))).collect(),
            ),
            Value::Array(items) => (
                Kind::Array,
                items.iter().map(|item| self.intern(item)).collect(),
            ),
            Value::Object(fields) => (
                Kind::Object,
                fields.iter().map(|(_, field)| self.intern(field)).collect(),
            ),
        };
        self.insert(kind, items)
    }

    fn object(&self, word: Fr) -> Result<&HeapObject, RuntimeError> {
        self.heap
            .get(&self.resolve(word))
            .ok_or_else(|| self.type_error("a composite", word))
    }

    fn allocate(&mut self, kind: Kind, len: usize) -> Fr {
        self.placeholders += 1;
        let placeholder = -Fr::from(self.placeholders);
        self.pending.insert(
            placeholder,
            Pending {
                kind,
                items: vec![None; len],
            },
        );
        placeholder
    }

    fn fill(&mut self, placeholder: Fr, index: Fr, value: Fr) -> Result<(), RuntimeError> {
        let value = self.resolve(value);
        let fault = self.fault();
        let slot = small(index)
            .and_then(|index| usize::try_from(index).ok())
            .and_then(|index| {
                self.pending
                    .get_mut(&placeholder)
                    .and_then(|pending| pending.items.get_mut(index))
            })
            .ok_or(fault)?;
        *slot = Some(value);
        Ok(())
    }

    fn seal(&mut self, placeholder: Fr) -> Result<Fr, RuntimeError> {
        let Pending { kind, items } = self
            .pending
            .remove(&placeholder)
            .ok_or_else(|| self.fault())?;
        let items: Vec<Fr> = items
            .into_iter()
            .collect::<Option<_>>()
            .ok_or_else(|| self.fault())?;
        let reference = self.insert(kind, items);
        self.sealed.insert(placeholder, reference);
        Ok(reference)
    }

    fn item(&self, composite: Fr, index: Fr) -> Result<Fr, RuntimeError> {
        let object = self.object(composite)?;
        let index = self.uint(index)?;
        usize::try_from(index)
            .ok()
            .and_then(|i| object.items.get(i).copied())
            .ok_or_else(|| {
                self.error(RuntimeErrorKind::IndexOutOfBounds {
                    index,
                    len: object.items.len(),
                })
            })
    }

    /// Rebuilds the value a word stands for.
    fn decode(&self, word: Fr, ty: &ValueType) -> Option<Value> {
        let word = self.resolve(word);
        let items = |kind: Kind| {
            self.heap
                .get(&word)
                .filter(|object| object.kind == kind)
                .map(|object| object.items.as_slice())
        };
        Some(match ty {
            ValueType::Boolean => match small(word)? {
                0 => Value::Boolean(false),
                1 => Value::Boolean(true),
                _ => return None,
            },
            ValueType::UInt(width) => {
                let v = small(word).filter(|&v| width.fits(v))?;
                Value::UInt(*width, v)
            }
            ValueType::String => Value::String(
                items(Kind::String)?
                    .iter()
                    .map(|&c| {
                        small(c)
                            .and_then(|c| u32::try_from(c).ok())
                            .and_then(char::from_u32)
                    })
                    .collect::<Option<String>>()?,
            ),
            ValueType::Array(inner) => Value::Array(
                items(Kind::Array)?
                    .iter()
                    .map(|&item| self.decode(item, inner))
                    .collect::<Option<_>>()?,
            ),
            ValueType::Object(fields) => {
                let values = items(Kind::Object)?;
                if values.len() != fields.len() {
                    return None;
                }
                Value::Object(
                    fields
                        .iter()
                        .zip(values)
                        .map(|((name, field_ty), &value)| {
                            Some((name.clone(), self.decode(value, field_ty)?))
                        })
                        .collect::<Option<_>>()?,
                )
            }
        })
    }

    /// Final values of the public fields, as the program published them.
    fn public_this(&self) -> Result<Value, RuntimeError> {
        let layout = &self.program.layout;
        if self.fields.len() != self.program.public_fields.len() {
            return Err(self.fault());
        }
        let mut fields = Vec::with_capacity(self.fields.len());
        for (&index, &word) in self.program.public_fields.iter().zip(&self.fields) {
            let node = layout
                .fields()
                .get(index)
                .and_then(|&node| layout.nodes.get(node))
                .ok_or_else(|| self.fault())?;
            let value = self.decode(word, &node.ty).ok_or_else(|| self.fault())?;
            fields.push((node.name.clone(), value));
        }
        Ok(Value::Object(fields))
    }

    fn execute(&mut self, rom: &[[Fr; 5]]) -> Result<(), RuntimeError> {
        let program = self.program;
        loop {
            let pc = self.pc;
            let (instruction, row) = program
                .instructions
                .get(pc)
                .zip(rom.get(pc))
                .ok_or_else(|| self.fault())?;
            self.cycle += 1;
            let (sp, fp) = (self.sp, self.fp);
            let mut step = Step {
                pc,
                opcode: instruction.opcode(),
                operands: [row[2], row[3], row[4]],
                sp,
                fp,
                accesses: [None; 4],
                helper: Fr::zero(),
                ranges: [0; 3],
                heap: None,
            };
            let mut next = pc + 1;

            match instruction {
                Instruction::Push(literal) => {
                    if let Literal::String(s) = literal {
                        self.intern(&Value::String(s.clone()));
                    }
                    self.write(&mut step, 3, sp, row[2])?;
                    self.sp = sp + 1;
                }
                Instruction::Pop => self.sp = self.below(sp, 1)?,
                Instruction::Dup => {
                    let value = self.read(&mut step, 0, self.below(sp, 1)?)?;
                    self.write(&mut step, 3, sp, value)?;
                    self.sp = sp + 1;
                }
                Instruction::LoadLocal(k) => {
                    let value = self.read(&mut step, 0, fp + *k as u64)?;
                    self.write(&mut step, 3, sp, value)?;
                    self.sp = sp + 1;
                }
                Instruction::StoreLocal(k) => {
                    let value = self.read(&mut step, 0, self.below(sp, 1)?)?;
                    self.write(&mut step, 3, fp + *k as u64, value)?;
                    self.sp = sp - 1;
                }
                Instruction::LoadField(slot) => {
                    let value = self.read(&mut step, 0, *slot as u64)?;
                    self.write(&mut step, 3, sp, value)?;
                    self.sp = sp + 1;
                }
                Instruction::StoreField(slot) => {
                    let value = self.read(&mut step, 0, self.below(sp, 1)?)?;
                    self.write(&mut step, 3, *slot as u64, value)?;
                    self.sp = sp - 1;
                }
                Instruction::Alloc(kind) => {
                    let top = self.below(sp, 1)?;
                    let len = self.read(&mut step, 0, top)?;
                    let n = small(len)
                        .and_then(|n| u32::try_from(n).ok())
                        .ok_or_else(|| self.error(RuntimeErrorKind::Overflow))?;
                    let placeholder = self.allocate(*kind, n as usize);
                    self.write(&mut step, 3, top, placeholder)?;
                    step.heap = Some(HeapKey {
                        reference: placeholder,
                        index: 0,
                        value: composite_tag(kind.code(), n as usize),
                        tag: true,
                    });
                }
                Instruction::Fill => {
                    let target = self.read(&mut step, 0, self.below(sp, 3)?)?;
                    let index = self.read(&mut step, 1, sp - 2)?;
                    let value = self.read(&mut step, 2, sp - 1)?;
                    self.fill(target, index, value)?;
                    step.heap = Some(HeapKey {
                        reference: target,
                        index: self.uint(index)?,
                        value,
                        tag: false,
                    });
                    self.sp = sp - 2;
                }
                Instruction::Seal => {
                    // Rewrites the top word in place; the trace sees the
                    // sealed reference once placeholders are replaced.
                    let top = usize::try_from(self.below(sp, 1)?).map_err(|_| self.fault())?;
                    let placeholder = self
                        .memory
                        .get(top)
                        .copied()
                        .flatten()
                        .ok_or_else(|| self.fault())?;
                    let reference = self.seal(placeholder)?;
                    self.memory[top] = Some(reference);
                }
                Instruction::Index => {
                    let composite = self.read(&mut step, 0, self.below(sp, 2)?)?;
                    let index = self.read(&mut step, 1, sp - 1)?;
                    let value = self.item(composite, index)?;
                    self.write(&mut step, 3, sp - 2, value)?;
                    step.heap = Some(HeapKey {
                        reference: composite,
                        index: self.uint(index)?,
                        value,
                        tag: false,
                    });
                    self.sp = sp - 1;
                }
                Instruction::Length(kind) => {
                    let top = self.below(sp, 1)?;
                    let composite = self.read(&mut step, 0, top)?;
                    let object = self.object(composite)?;
                    if object.kind != *kind {
                        return Err(self.type_error("a composite of the expected kind", composite));
                    }
                    let n = object.items.len();
                    let len = u32::try_from(n).map_err(|_| self.error(RuntimeErrorKind::Overflow))?;
                    self.write(&mut step, 3, top, Fr::from(len))?;
                    step.ranges[0] = u64::from(len);
                    step.heap = Some(HeapKey {
                        reference: composite,
                        index: 0,
                        value: composite_tag(kind.code(), n),
                        tag: true,
                    });
                }
                Instruction::Arith(op, width) => {
                    let (a, b) = self.operands(&mut step, sp)?;
                    let (r, helper, ranges) = self.checked(*op, *width, a, b)?;
                    self.write(&mut step, 3, sp - 2, Fr::from(r))?;
                    step.helper = helper;
                    step.ranges = ranges;
                    self.sp = sp - 1;
                }
                Instruction::Wrapping(op, width) => {
                    let (a, b) = self.operands(&mut step, sp)?;
                    let (r, helper, ranges) = wrapping(*op, *width, a, b);
                    self.write(&mut step, 3, sp - 2, Fr::from(r))?;
                    step.helper = helper;
                    step.ranges = ranges;
                    self.sp = sp - 1;
                }
                Instruction::Compare(op) => {
                    let a = self.read(&mut step, 0, self.below(sp, 2)?)?;
                    let b = self.read(&mut step, 1, sp - 1)?;
                    let result = match op {
                        CompareOp::Eq | CompareOp::Ne => {
                            let diff = self.resolve(a) - self.resolve(b);
                            step.helper = diff.inverse().unwrap_or_else(Fr::zero);
                            diff.is_zero() == (*op == CompareOp::Eq)
                        }
                        _ => {
                            let (a, b) = (self.uint(a)?, self.uint(b)?);
                            let (result, gap) = ordered(*op, a, b);
                            step.ranges[0] = gap;
                            result
                        }
                    };
                    self.write(&mut step, 3, sp - 2, Fr::from(result))?;
                    self.sp = sp - 1;
                }
                Instruction::Not => {
                    let top = self.below(sp, 1)?;
                    let value = self.read(&mut step, 0, top)?;
                    let b = self.boolean(value)?;
                    self.write(&mut step, 3, top, Fr::from(!b))?;
                }
                Instruction::Jump(target) => next = *target,
                Instruction::JumpIfFalse(target) => {
                    let value = self.read(&mut step, 0, self.below(sp, 1)?)?;
                    if !self.boolean(value)? {
                        next = *target;
                    }
                    self.sp = sp - 1;
                }
                Instruction::Call { entry, argc, frame } => {
                    let new_fp = self.below(sp, *argc as u64)?;
                    let saved = new_fp + *frame as u64;
                    self.write(&mut step, 0, saved, Fr::from(pc as u64 + 1))?;
                    self.write(&mut step, 1, saved + 1, Fr::from(fp))?;
                    self.fp = new_fp;
                    self.sp = saved + 2;
                    next = *entry;
                }
                Instruction::Return { frame } => {
                    let value = self.read(&mut step, 0, self.below(sp, 1)?)?;
                    let saved = fp + *frame as u64;
                    let return_pc = self.read(&mut step, 1, saved)?;
                    let caller_fp = self.read(&mut step, 2, saved + 1)?;
                    self.write(&mut step, 3, fp, value)?;
                    self.sp = fp + 1;
                    self.fp = small(caller_fp).ok_or_else(|| self.fault())?;
                    next = small(return_pc)
                        .and_then(|pc| usize::try_from(pc).ok())
                        .ok_or_else(|| self.fault())?;
                }
                Instruction::Log(ty) => {
                    let word = self.read(&mut step, 0, self.below(sp, 1)?)?;
                    let word = self.resolve(word);
                    let value = self.decode(word, ty).ok_or_else(|| self.fault())?;
                    self.logs.push(value);
                    self.log_words.push(word);
                    self.sp = sp - 1;
                }
                Instruction::CheckAuth => {
                    let value = self.read(&mut step, 0, self.below(sp, 1)?)?;
                    let ok = self.boolean(value)?;
                    self.read_auth.push(ok);
                }
                Instruction::RequireAuth => {
                    let value = self.read(&mut step, 0, self.below(sp, 1)?)?;
                    let ok = self.boolean(value)?;
                    self.read_auth.push(ok);
                    if !ok {
                        trace!(cycle = self.cycle, pc, "authorization denied");
                        return Err(self.error(RuntimeErrorKind::AuthorizationDenied));
                    }
                    self.sp = sp - 1;
                }
                Instruction::SelfDestruct => self.self_destructed = true,
                Instruction::Input(k) => {
                    let value = self.inputs.get(*k).copied().ok_or_else(|| self.fault())?;
                    self.write(&mut step, 3, sp, value)?;
                    self.sp = sp + 1;
                }
                Instruction::Output(tag, _) => {
                    let word = self.read(&mut step, 0, self.below(sp, 1)?)?;
                    let word = self.resolve(word);
                    match tag {
                        OutputTag::Result => self.result = Some(word),
                        OutputTag::Field => self.fields.push(word),
                        OutputTag::Log | OutputTag::Auth => return Err(self.fault()),
                    }
                    self.sp = sp - 1;
                }
                Instruction::Halt => {
                    self.steps.push(step);
                    return Ok(());
                }
            }

            self.steps.push(step);
            self.pc = next;
        }
    }

    /// Reads the two integer operands `[a, b]` on top of the stack.
    fn operands(&self, step: &mut Step, sp: u64) -> Result<(u64, u64), RuntimeError> {
        let a = self.read(step, 0, self.below(sp, 2)?)?;
        let b = self.read(step, 1, sp - 1)?;
        Ok((self.uint(a)?, self.uint(b)?))
    }

    /// Checked arithmetic: the result, the helper word and the values whose
    /// range pins the result down.
    fn checked(
        &self,
        op: ArithOp,
        width: Width,
        a: u64,
        b: u64,
    ) -> Result<(u64, Fr, [u64; 3]), RuntimeError> {
        let overflow = || self.error(RuntimeErrorKind::Overflow);
        let in_range = |r: Option<u64>| r.filter(|&r| width.fits(r)).ok_or_else(overflow);
        let max = width.max();
        Ok(match op {
            ArithOp::Add => {
                let r = in_range(a.checked_add(b))?;
                (r, Fr::zero(), [max - r, 0, 0])
            }
            ArithOp::Sub => {
                let r = in_range(a.checked_sub(b))?;
                (r, Fr::zero(), [r, 0, 0])
            }
            ArithOp::Mul => {
                let r = in_range(a.checked_mul(b))?;
                (r, Fr::zero(), [max - r, 0, 0])
            }
            ArithOp::Div | ArithOp::Rem if b == 0 => {
                return Err(self.error(RuntimeErrorKind::DivisionByZero));
            }
            ArithOp::Div => {
                let (q, m) = (a / b, a % b);
                (q, Fr::from(m), [m, b - 1 - m, q])
            }
            ArithOp::Rem => {
                let (q, m) = (a / b, a % b);
                (m, Fr::from(q), [m, b - 1 - m, q])
            }
        })
    }

    /// Replaces placeholders with sealed references and collects the
    /// composites the steps looked into.
    fn finish(self) -> (Vec<Step>, Vec<HeapObject>) {
        let Machine {
            mut steps,
            heap,
            sealed,
            ..
        } = self;
        let resolve = |word: Fr| sealed.get(&word).copied().unwrap_or(word);
        let mut seen = HashSet::new();
        let mut used = Vec::new();
        for step in &mut steps {
            for access in step.accesses.iter_mut().flatten() {
                access.value = resolve(access.value);
            }
            if let Some(key) = &mut step.heap {
                key.reference = resolve(key.reference);
                key.value = resolve(key.value);
                if seen.insert(key.reference) {
                    if let Some(object) = heap.get(&key.reference) {
                        used.push(object.clone());
                    }
                }
            }
        }
        (steps, used)
    }
}

/// Ordered comparison of integers, with the gap that proves it: the
/// distance between the operands, less one on the strict side.
fn ordered(op: CompareOp, a: u64, b: u64) -> (bool, u64) {
    let (result, low, high, strict) = match op {
        CompareOp::Lt => (a < b, a, b, true),
        CompareOp::Le => (a <= b, a, b, false),
        CompareOp::Gt => (a > b, b, a, true),
        CompareOp::Ge => (a >= b, b, a, false),
        CompareOp::Eq | CompareOp::Ne => return (false, 0),
    };
    let gap = if result {
        high - low - u64::from(strict)
    } else {
        low - high - u64::from(!strict)
    };
    (result, gap)
}

/// Arithmetic modulo `2^width`. Never traps. The helper is the carry, the
/// borrow or the high part of the product.
fn wrapping(op: WrapOp, width: Width, a: u64, b: u64) -> (u64, Fr, [u64; 3]) {
    let modulus = 1u128 << width.bits();
    let max = width.max();
    let (a128, b128) = (u128::from(a), u128::from(b));
    let (r, helper, high) = match op {
        WrapOp::Add => {
            let sum = a128 + b128;
            let carry = sum >= modulus;
            let r = if carry { sum - modulus } else { sum };
            (r as u64, Fr::from(carry), 0)
        }
        WrapOp::Sub => {
            let borrow = a128 < b128;
            let r = if borrow { a128 + modulus - b128 } else { a128 - b128 };
            (r as u64, Fr::from(borrow), 0)
        }
        WrapOp::Mul => {
            let product = a128 * b128;
            let high = (product >> width.bits()) as u64;
            ((product % modulus) as u64, Fr::from(high), high)
        }
    };
    (r, helper, [r, max - r, high])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile_source;
    use crate::compiler::program::{Opcode, string_ref};
    use ark_ff::One;

    fn exec(source: &str, entry: &str, args: Vec<Value>) -> Result<Value, RuntimeError> {
        let program = compile_source(source, None, entry).unwrap();
        run(&program, None, args).map(|(output, _)| output.result)
    }

    fn u32v(v: u64) -> Value {
        Value::UInt(Width::U32, v)
    }

    #[test]
    fn test_wrapping_helpers() {
        let (r, carry, ranges) = wrapping(WrapOp::Add, Width::U32, u32::MAX as u64, 1);
        assert_eq!(r, 0);
        assert!(carry.is_one());
        assert_eq!(ranges, [0, u32::MAX as u64, 0]);
        let (r, borrow, _) = wrapping(WrapOp::Sub, Width::U8, 1, 2);
        assert_eq!(r, 255);
        assert!(borrow.is_one());
        let (r, _, _) = wrapping(WrapOp::Add, Width::U64, u64::MAX, 2);
        assert_eq!(r, 1);
        let (r, high, ranges) = wrapping(WrapOp::Mul, Width::U16, 300, 300);
        assert_eq!(r, 90000 % 65536);
        assert_eq!(high, Fr::from(1u64));
        assert_eq!(ranges[2], 1);
    }

    #[test]
    fn test_ordered_gaps() {
        assert_eq!(ordered(CompareOp::Lt, 2, 5), (true, 2));
        assert_eq!(ordered(CompareOp::Lt, 5, 5), (false, 0));
        assert_eq!(ordered(CompareOp::Le, 5, 5), (true, 0));
        assert_eq!(ordered(CompareOp::Le, 6, 5), (false, 0));
        assert_eq!(ordered(CompareOp::Gt, 9, 5), (true, 3));
        assert_eq!(ordered(CompareOp::Ge, 4, 5), (false, 0));
    }

    #[test]
    fn test_checked_arithmetic_traps() {
        let add = "function main(a: u32, b: u32): u32 { return a + b; }";
        assert_eq!(exec(add, "main", vec![u32v(2), u32v(3)]).unwrap(), u32v(5));
        let err = exec(add, "main", vec![u32v(u32::MAX as u64), u32v(1)]).unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::Overflow);
        assert!(err.cycle > 0);

        let div = "function main(a: u32, b: u32): u32 { return a / b; }";
        let err = exec(div, "main", vec![u32v(1), u32v(0)]).unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::DivisionByZero);
        assert_eq!(exec(div, "main", vec![u32v(17), u32v(5)]).unwrap(), u32v(3));
    }

    #[test]
    fn test_index_out_of_bounds() {
        let source = "function main(xs: u32[], i: u32): u32 { return xs[i]; }";
        let err = exec(
            source,
            "main",
            vec![Value::Array(vec![u32v(1)]), u32v(3)],
        )
        .unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::IndexOutOfBounds { index: 3, len: 1 });
    }

    #[test]
    fn test_arguments_are_validated_before_running() {
        let source = "function main(a: u32): u32 { return a; }";
        let err = exec(source, "main", vec![Value::String("x".into())]).unwrap_err();
        assert!(matches!(err.kind, RuntimeErrorKind::TypeMismatch(_)));
        assert_eq!(err.cycle, 0);
        let err = exec(source, "main", vec![]).unwrap_err();
        assert_eq!(err.cycle, 0);
    }

    #[test]
    fn test_short_circuit_and_calls() {
        let source = "
            function check(a: u32): boolean { return a > 2; }
            function main(a: u32): boolean { return a != 0 && check(a); }
        ";
        assert_eq!(exec(source, "main", vec![u32v(0)]).unwrap(), Value::Boolean(false));
        assert_eq!(exec(source, "main", vec![u32v(1)]).unwrap(), Value::Boolean(false));
        assert_eq!(exec(source, "main", vec![u32v(3)]).unwrap(), Value::Boolean(true));
    }

    #[test]
    fn test_nested_array_assignment() {
        let source = "
            function main(): u32[] {
                let grid: u32[][] = [[1, 2], [3, 4]];
                grid[1][0] = 9;
                let i: u32 = 0;
                grid[i][i] += 10;
                return grid[1];
            }
        ";
        assert_eq!(
            exec(source, "main", vec![]).unwrap(),
            Value::Array(vec![u32v(9), u32v(4)])
        );
    }

    #[test]
    fn test_require_auth() {
        let source = "function main(ok: boolean) { requireAuth(ok); }";
        let program = compile_source(source, None, "main").unwrap();
        let (output, _) = run(&program, None, vec![Value::Boolean(true)]).unwrap();
        assert_eq!(output.read_auth, vec![true]);
        assert_eq!(output.result, Value::Null);
        let err = run(&program, None, vec![Value::Boolean(false)]).unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::AuthorizationDenied);
    }

    #[test]
    fn test_trace_records_witnesses() {
        let source = "function main(a: u32, b: u32): u32 { return a.wrappingAdd(b) - 1; }";
        let program = compile_source(source, None, "main").unwrap();
        let (output, trace) = run(&program, None, vec![u32v(u32::MAX as u64), u32v(2)]).unwrap();
        assert_eq!(output.result, u32v(0));
        let add = trace
            .steps
            .iter()
            .find(|step| step.opcode == Opcode::WrappingAdd)
            .unwrap();
        assert!(add.helper.is_one());
        assert_eq!(add.value(3), Some(Fr::from(1u64)));
        let sub = trace.steps.iter().find(|step| step.opcode == Opcode::Sub).unwrap();
        assert_eq!(
            (sub.value(0), sub.value(1), sub.value(3)),
            (Some(Fr::from(1u64)), Some(Fr::from(1u64)), Some(Fr::zero()))
        );
        assert_eq!(trace.cycle_count(), output.cycle_count);
        assert_eq!(trace.steps.last().map(|step| step.opcode), Some(Opcode::Halt));
        assert_eq!(trace.stack_inputs.len(), 16);
        assert_eq!(trace.output_stack[0], output.cycle_count);
        assert_eq!(trace.rom.len(), program.instructions.len());
    }

    #[test]
    fn test_memory_reads_see_the_last_write() {
        let source = "
            function fib(n: u32): u32 {
                if (n < 2) { return n; }
                return fib(n - 1) + fib(n - 2);
            }
            function main(n: u32): u32 { return fib(n); }
        ";
        let program = compile_source(source, None, "main").unwrap();
        let (output, trace) = run(&program, None, vec![u32v(7)]).unwrap();
        assert_eq!(output.result, u32v(13));
        let mut memory = HashMap::new();
        for step in &trace.steps {
            for access in step.accesses.iter().flatten() {
                if access.write {
                    memory.insert(access.addr, access.value);
                } else {
                    assert_eq!(memory.get(&access.addr), Some(&access.value));
                }
            }
        }
    }

    #[test]
    fn test_heap_lookups_name_sealed_composites() {
        let source = "function main(a: string): string { return a + \"!\"; }";
        let program = compile_source(source, None, "main").unwrap();
        let (output, trace) = run(&program, None, vec![Value::String("hi".into())]).unwrap();
        assert_eq!(output.result, Value::String("hi!".into()));
        assert_eq!(output.result_hash, Digest::from_field(string_ref("hi!")));
        let references: HashSet<Fr> = trace.heap.iter().map(|object| object.reference).collect();
        assert!(references.contains(&string_ref("hi")));
        assert!(references.contains(&string_ref("hi!")));
        for key in trace.steps.iter().filter_map(|step| step.heap) {
            assert!(references.contains(&key.reference));
        }
        for object in &trace.heap {
            assert_eq!(
                object.reference,
                composite_hash(object.kind.code(), &object.items)
            );
        }
    }
}
