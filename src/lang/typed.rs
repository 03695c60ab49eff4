//! Type-annotated program produced by the resolver.
//!
//! Every identifier is bound: locals are numbered per function, fields are
//! referenced by index, calls by function id. `for` loops and compound
//! assignments are already desugared.

use std::fmt;

use serde::{Deserialize, Serialize};

pub use super::ast::BinaryOp;
use crate::error::Span;

pub type ContractId = usize;
pub type FunctionId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(pub usize);

/// Bit width of an unsigned integer type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Width {
    U8,
    U16,
    U32,
    U64,
}

impl Width {
    pub fn bits(self) -> u32 {
        match self {
            Width::U8 => 8,
            Width::U16 => 16,
            Width::U32 => 32,
            Width::U64 => 64,
        }
    }

    pub fn max(self) -> u64 {
        match self {
            Width::U64 => u64::MAX,
            other => (1u64 << other.bits()) - 1,
        }
    }

    pub fn fits(self, value: u64) -> bool {
        value <= self.max()
    }
}

impl fmt::Display for Width {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "u{}", self.bits())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    String,
    Boolean,
    UInt(Width),
    Array(Box<Type>),
    Contract(ContractId),
    /// Result of a call to a function without a return type.
    Void,
}

impl Type {
    pub fn is_uint(&self) -> bool {
        matches!(self, Type::UInt(_))
    }
}

#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub ty: Type,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct ContractDef {
    pub name: String,
    pub fields: Vec<FieldDef>,
    pub constructor: Option<FunctionId>,
    pub methods: Vec<(String, FunctionId)>,
    pub span: Span,
}

impl ContractDef {
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|field| field.name == name)
    }

    pub fn method(&self, name: &str) -> Option<FunctionId> {
        self.methods
            .iter()
            .find(|(method, _)| method == name)
            .map(|(_, id)| *id)
    }
}

#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub name: String,
    pub contract: Option<ContractId>,
    pub params: Vec<LocalId>,
    pub return_type: Option<Type>,
    /// Type of every local, indexed by `LocalId`. Parameters come first.
    pub locals: Vec<Type>,
    pub body: Vec<TStmt>,
    pub span: Span,
}

impl FunctionDef {
    pub fn param_types(&self) -> impl Iterator<Item = &Type> {
        self.params.iter().map(|local| &self.locals[local.0])
    }
}

#[derive(Debug, Clone)]
pub struct TypedProgram {
    pub contracts: Vec<ContractDef>,
    pub functions: Vec<FunctionDef>,
}

impl TypedProgram {
    pub fn contract_by_name(&self, name: &str) -> Option<ContractId> {
        self.contracts.iter().position(|contract| contract.name == name)
    }

    /// Looks up a free function (`contract == None`), a method or a
    /// constructor.
    pub fn entry_point(&self, contract: Option<ContractId>, name: &str) -> Option<FunctionId> {
        match contract {
            Some(id) => {
                let def = &self.contracts[id];
                if name == "constructor" {
                    def.constructor
                } else {
                    def.method(name)
                }
            }
            None => self
                .functions
                .iter()
                .position(|function| function.contract.is_none() && function.name == name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrappingOp {
    Add,
    Sub,
    Mul,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TExpr {
    pub kind: TExprKind,
    pub ty: Type,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TExprKind {
    UInt(u64),
    Str(String),
    Bool(bool),
    Array(Vec<TExpr>),
    Local(LocalId),
    This,
    Field {
        object: Box<TExpr>,
        index: usize,
    },
    Index {
        array: Box<TExpr>,
        index: Box<TExpr>,
    },
    /// Length of an array or a string, as `u32`.
    Length(Box<TExpr>),
    Not(Box<TExpr>),
    /// Checked arithmetic, comparisons and short-circuit logic.
    Binary {
        op: BinaryOp,
        lhs: Box<TExpr>,
        rhs: Box<TExpr>,
    },
    Concat(Box<TExpr>, Box<TExpr>),
    Wrapping {
        op: WrappingOp,
        lhs: Box<TExpr>,
        rhs: Box<TExpr>,
    },
    Call {
        function: FunctionId,
        args: Vec<TExpr>,
    },
    CheckAuth(Box<TExpr>),
}

impl TExpr {
    /// Direct subexpressions, in evaluation order.
    pub fn children(&self) -> Vec<&TExpr> {
        match &self.kind {
            TExprKind::UInt(_)
            | TExprKind::Str(_)
            | TExprKind::Bool(_)
            | TExprKind::Local(_)
            | TExprKind::This => Vec::new(),
            TExprKind::Array(items) => items.iter().collect(),
            TExprKind::Call { args, .. } => args.iter().collect(),
            TExprKind::Field { object, .. } => vec![&**object],
            TExprKind::Length(inner) | TExprKind::Not(inner) | TExprKind::CheckAuth(inner) => {
                vec![&**inner]
            }
            TExprKind::Index { array, index } => vec![&**array, &**index],
            TExprKind::Binary { lhs, rhs, .. }
            | TExprKind::Concat(lhs, rhs)
            | TExprKind::Wrapping { lhs, rhs, .. } => vec![&**lhs, &**rhs],
        }
    }

    /// Visits this expression and every subexpression, parents first.
    pub fn walk(&self, visit: &mut impl FnMut(&TExpr)) {
        visit(self);
        for child in self.children() {
            child.walk(visit);
        }
    }

    /// Whether evaluating the expression is observable beyond its value.
    /// Checked arithmetic and indexing count: they may trap.
    pub fn has_effects(&self) -> bool {
        let mut effects = false;
        self.walk(&mut |expr| match &expr.kind {
            TExprKind::Call { .. } | TExprKind::CheckAuth(_) | TExprKind::Index { .. } => {
                effects = true;
            }
            TExprKind::Binary { op, .. } if op.may_trap() => effects = true,
            _ => {}
        });
        effects
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlaceRoot {
    Local(LocalId),
    This,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlaceStep {
    Field(usize),
    Index(TExpr),
}

/// Assignable location: a local or `this`, followed by field/index steps.
#[derive(Debug, Clone, PartialEq)]
pub struct Place {
    pub root: PlaceRoot,
    pub path: Vec<PlaceStep>,
    pub ty: Type,
}

impl Place {
    pub fn index_exprs(&self) -> impl Iterator<Item = &TExpr> {
        self.path.iter().filter_map(|step| match step {
            PlaceStep::Index(expr) => Some(expr),
            PlaceStep::Field(_) => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TStmt {
    pub kind: TStmtKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TStmtKind {
    Let {
        local: LocalId,
        value: TExpr,
    },
    Assign {
        place: Place,
        value: TExpr,
    },
    Push {
        place: Place,
        value: TExpr,
    },
    If {
        cond: TExpr,
        then_body: Vec<TStmt>,
        else_body: Vec<TStmt>,
    },
    While {
        cond: TExpr,
        body: Vec<TStmt>,
    },
    Return(Option<TExpr>),
    Log(TExpr),
    RequireAuth(TExpr),
    SelfDestruct,
    Expr(TExpr),
}
