//! The compiled program: a linear instruction stream plus the metadata the
//! executor and prover need.
//!
//! Every instruction encodes to one row `(opcode, a1, a2, a3)` of field
//! elements. The rows, indexed by program counter, form the read-only
//! memory the AIR looks every executed instruction up in.

use std::fs;
use std::io;
use std::path::Path;

use ark_bls12_381::Fr;
use ark_ff::Zero;
use serde::{Deserialize, Serialize};

use crate::hash::{Digest, composite_hash};
use crate::lang::Width;
use crate::lang::typed::{BinaryOp, WrappingOp};

/// Runtime type descriptor, used to validate inputs and rebuild records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    String,
    Boolean,
    UInt(Width),
    Array(Box<ValueType>),
    Object(Vec<(String, ValueType)>),
}

/// Composite shapes on the heap. The code is part of every composite hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    /// Items are the Unicode scalar values.
    String,
    Array,
    /// Items are the field values in declaration order.
    Object,
}

impl Kind {
    pub fn code(self) -> u64 {
        match self {
            Kind::String => 1,
            Kind::Array => 2,
            Kind::Object => 3,
        }
    }
}

/// Field reference of a string: the hash of its characters.
pub fn string_ref(s: &str) -> Fr {
    let chars: Vec<Fr> = s.chars().map(|c| Fr::from(u64::from(u32::from(c)))).collect();
    composite_hash(Kind::String.code(), &chars)
}

/// Constant operand of `Push`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Literal {
    Null,
    Boolean(bool),
    String(String),
    UInt(Width, u64),
}

impl Literal {
    /// The machine word the literal pushes.
    pub fn to_field(&self) -> Fr {
        match self {
            Literal::Null => Fr::zero(),
            Literal::Boolean(b) => Fr::from(*b),
            Literal::String(s) => string_ref(s),
            Literal::UInt(_, v) => Fr::from(*v),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl ArithOp {
    pub fn from_binary(op: BinaryOp) -> Option<Self> {
        Some(match op {
            BinaryOp::Add => ArithOp::Add,
            BinaryOp::Sub => ArithOp::Sub,
            BinaryOp::Mul => ArithOp::Mul,
            BinaryOp::Div => ArithOp::Div,
            BinaryOp::Rem => ArithOp::Rem,
            _ => return None,
        })
    }
}

impl CompareOp {
    pub fn from_binary(op: BinaryOp) -> Option<Self> {
        Some(match op {
            BinaryOp::Eq => CompareOp::Eq,
            BinaryOp::Ne => CompareOp::Ne,
            BinaryOp::Lt => CompareOp::Lt,
            BinaryOp::Le => CompareOp::Le,
            BinaryOp::Gt => CompareOp::Gt,
            BinaryOp::Ge => CompareOp::Ge,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WrapOp {
    Add,
    Sub,
    Mul,
}

impl From<WrappingOp> for WrapOp {
    fn from(op: WrappingOp) -> Self {
        match op {
            WrappingOp::Add => WrapOp::Add,
            WrappingOp::Sub => WrapOp::Sub,
            WrappingOp::Mul => WrapOp::Mul,
        }
    }
}

/// Public channels a run writes to, in the order the verifier expects them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputTag {
    Result,
    /// Final value of a public field, sequenced by field position.
    Field,
    Log,
    Auth,
}

impl OutputTag {
    pub fn code(self) -> u64 {
        match self {
            OutputTag::Result => 1,
            OutputTag::Field => 2,
            OutputTag::Log => 3,
            OutputTag::Auth => 4,
        }
    }
}

/// Opcodes as recorded in the trace. Codes start at 1 so an idle row is
/// all zeros.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Push = 1,
    Pop,
    Dup,
    LoadLocal,
    StoreLocal,
    LoadField,
    StoreField,
    Alloc,
    Fill,
    Seal,
    Index,
    Length,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    WrappingAdd,
    WrappingSub,
    WrappingMul,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Not,
    Jump,
    JumpIfFalse,
    Call,
    Return,
    Log,
    CheckAuth,
    RequireAuth,
    SelfDestruct,
    Input,
    Output,
    Halt,
}

impl Opcode {
    pub const COUNT: usize = Opcode::Halt as usize;

    /// Every opcode, by code.
    pub const ALL: [Opcode; Opcode::COUNT] = [
        Opcode::Push,
        Opcode::Pop,
        Opcode::Dup,
        Opcode::LoadLocal,
        Opcode::StoreLocal,
        Opcode::LoadField,
        Opcode::StoreField,
        Opcode::Alloc,
        Opcode::Fill,
        Opcode::Seal,
        Opcode::Index,
        Opcode::Length,
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
        Opcode::Not,
        Opcode::Jump,
        Opcode::JumpIfFalse,
        Opcode::Call,
        Opcode::Return,
        Opcode::Log,
        Opcode::CheckAuth,
        Opcode::RequireAuth,
        Opcode::SelfDestruct,
        Opcode::Input,
        Opcode::Output,
        Opcode::Halt,
    ];

    pub fn code(self) -> u64 {
        self as u64
    }

    /// Position of the opcode's selector column.
    pub fn index(self) -> usize {
        self as usize - 1
    }
}

/// One VM instruction. The machine keeps every value, the return address
/// and the caller's frame pointer in a single word-addressed memory: `this`
/// slots first, the stack from `stack_base` up. Jump and call targets are
/// absolute instruction indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instruction {
    Push(Literal),
    Pop,
    Dup,
    LoadLocal(usize),
    StoreLocal(usize),
    /// Reads a leaf slot of `this`.
    LoadField(usize),
    StoreField(usize),
    /// `[len] -> [ref]`: reserves a composite of `len` items.
    Alloc(Kind),
    /// `[ref, index, value] -> [ref]`
    Fill,
    /// Completes the composite on top of the stack, fixing its reference.
    Seal,
    /// `[composite, index] -> [item]`
    Index,
    /// `[composite] -> [len]`
    Length(Kind),
    Arith(ArithOp, Width),
    Wrapping(WrapOp, Width),
    Compare(CompareOp),
    Not,
    Jump(usize),
    JumpIfFalse(usize),
    /// Calls the function at `entry` with the top `argc` words as its first
    /// locals. The return address and frame pointer go right above its
    /// `frame` local slots.
    Call {
        entry: usize,
        argc: usize,
        frame: usize,
    },
    Return {
        frame: usize,
    },
    Log(ValueType),
    CheckAuth,
    RequireAuth,
    SelfDestruct,
    /// Pushes public input `k`.
    Input(usize),
    Output(OutputTag, usize),
    Halt,
}

impl Instruction {
    pub fn opcode(&self) -> Opcode {
        match self {
            Instruction::Push(_) => Opcode::Push,
            Instruction::Pop => Opcode::Pop,
            Instruction::Dup => Opcode::Dup,
            Instruction::LoadLocal(_) => Opcode::LoadLocal,
            Instruction::StoreLocal(_) => Opcode::StoreLocal,
            Instruction::LoadField(_) => Opcode::LoadField,
            Instruction::StoreField(_) => Opcode::StoreField,
            Instruction::Alloc(_) => Opcode::Alloc,
            Instruction::Fill => Opcode::Fill,
            Instruction::Seal => Opcode::Seal,
            Instruction::Index => Opcode::Index,
            Instruction::Length(_) => Opcode::Length,
            Instruction::Arith(op, _) => match op {
                ArithOp::Add => Opcode::Add,
                ArithOp::Sub => Opcode::Sub,
                ArithOp::Mul => Opcode::Mul,
                ArithOp::Div => Opcode::Div,
                ArithOp::Rem => Opcode::Rem,
            },
            Instruction::Wrapping(op, _) => match op {
                WrapOp::Add => Opcode::WrappingAdd,
                WrapOp::Sub => Opcode::WrappingSub,
                WrapOp::Mul => Opcode::WrappingMul,
            },
            Instruction::Compare(op) => match op {
                CompareOp::Eq => Opcode::Eq,
                CompareOp::Ne => Opcode::Ne,
                CompareOp::Lt => Opcode::Lt,
                CompareOp::Le => Opcode::Le,
                CompareOp::Gt => Opcode::Gt,
                CompareOp::Ge => Opcode::Ge,
            },
            Instruction::Not => Opcode::Not,
            Instruction::Jump(_) => Opcode::Jump,
            Instruction::JumpIfFalse(_) => Opcode::JumpIfFalse,
            Instruction::Call { .. } => Opcode::Call,
            Instruction::Return { .. } => Opcode::Return,
            Instruction::Log(_) => Opcode::Log,
            Instruction::CheckAuth => Opcode::CheckAuth,
            Instruction::RequireAuth => Opcode::RequireAuth,
            Instruction::SelfDestruct => Opcode::SelfDestruct,
            Instruction::Input(_) => Opcode::Input,
            Instruction::Output(..) => Opcode::Output,
            Instruction::Halt => Opcode::Halt,
        }
    }

    /// Immediate operands `a1, a2, a3`. Arithmetic carries `2^width`.
    pub fn operands(&self) -> [Fr; 3] {
        let int = |v: usize| Fr::from(v as u64);
        let modulus = |width: &Width| Fr::from(1u128 << width.bits());
        let zero = Fr::zero();
        match self {
            Instruction::Push(literal) => [literal.to_field(), zero, zero],
            Instruction::LoadLocal(k)
            | Instruction::StoreLocal(k)
            | Instruction::LoadField(k)
            | Instruction::StoreField(k)
            | Instruction::Jump(k)
            | Instruction::JumpIfFalse(k)
            | Instruction::Input(k) => [int(*k), zero, zero],
            Instruction::Alloc(kind) | Instruction::Length(kind) => {
                [Fr::from(kind.code()), zero, zero]
            }
            Instruction::Arith(_, width) | Instruction::Wrapping(_, width) => {
                [modulus(width), zero, zero]
            }
            Instruction::Call { entry, argc, frame } => [int(*entry), int(*argc), int(*frame)],
            Instruction::Return { frame } => [int(*frame), zero, zero],
            Instruction::Output(tag, seq) => [Fr::from(tag.code()), int(*seq), zero],
            _ => [zero; 3],
        }
    }
}

/// What a proof is bound to: the instruction stream and the first stack
/// address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramCode {
    pub instructions: Vec<Instruction>,
    pub stack_base: u64,
}

impl ProgramCode {
    /// SHA-256 of the serialized code.
    pub fn hash(&self) -> Digest {
        Digest::of(&bincode::serialize(self).unwrap_or_default())
    }

    /// `(pc, opcode, a1, a2, a3)` of every instruction.
    pub fn rom(&self) -> Vec<[Fr; 5]> {
        self.instructions
            .iter()
            .enumerate()
            .map(|(pc, instruction)| {
                let [a1, a2, a3] = instruction.operands();
                [
                    Fr::from(pc as u64),
                    Fr::from(instruction.opcode().code()),
                    a1,
                    a2,
                    a3,
                ]
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionInfo {
    pub name: String,
    /// Index of the first instruction.
    pub entry: usize,
    pub arity: usize,
    /// Number of local slots, parameters and temporaries included.
    pub frame_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutNode {
    pub name: String,
    pub ty: ValueType,
    pub first_slot: usize,
    pub slot_count: usize,
    pub children: Vec<usize>,
}

impl LayoutNode {
    pub fn is_record(&self) -> bool {
        matches!(self.ty, ValueType::Object(_))
    }
}

/// Flattened memory layout of `this`. Node 0 is `this` itself, every leaf
/// field owns exactly one slot and records own the range of their leaves.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ThisLayout {
    pub nodes: Vec<LayoutNode>,
    pub slot_count: usize,
}

impl ThisLayout {
    pub const ROOT: usize = 0;

    /// Top-level fields of `this`, as node ids in declaration order.
    pub fn fields(&self) -> &[usize] {
        self.nodes
            .get(Self::ROOT)
            .map(|root| root.children.as_slice())
            .unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledProgram {
    pub instructions: Vec<Instruction>,
    /// Compiled functions. The entry point comes first, followed by what it
    /// calls and the built-in routines.
    pub functions: Vec<FunctionInfo>,
    /// Index into `functions`.
    pub entry: usize,
    pub entry_name: String,
    pub contract: Option<String>,
    pub params: Vec<ValueType>,
    pub returns: Option<ValueType>,
    /// Declared type of `this` for contract entry points.
    pub this_type: Option<ValueType>,
    pub layout: ThisLayout,
    /// Indices of the top-level `this` fields the emitted code touches.
    pub public_fields: Vec<usize>,
}

impl CompiledProgram {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    pub fn stack_base(&self) -> u64 {
        self.layout.slot_count as u64
    }

    pub fn code(&self) -> ProgramCode {
        ProgramCode {
            instructions: self.instructions.clone(),
            stack_base: self.stack_base(),
        }
    }

    /// Hash of the executable code.
    pub fn hash(&self) -> Digest {
        self.code().hash()
    }

    pub fn public_field_names(&self) -> Vec<String> {
        let fields = self.layout.fields();
        self.public_fields
            .iter()
            .filter_map(|&index| fields.get(index).and_then(|&node| self.layout.nodes.get(node)))
            .map(|node| node.name.clone())
            .collect()
    }

    pub fn save(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let bytes = self
            .to_bytes()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        fs::write(path, bytes)
    }

    pub fn load(path: impl AsRef<Path>) -> io::Result<Self> {
        let bytes = fs::read(path)?;
        Self::from_bytes(&bytes).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }
}
