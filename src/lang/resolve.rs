//! Name resolution and type checking.

use std::collections::HashMap;

use tracing::debug;

use super::ast::{self, AssignOp, BinaryOp, ExprKind, StmtKind, TypeExpr, UnaryOp};
use super::typed::*;
use crate::error::{Span, TypeError, TypeErrorKind};

type Result<T> = std::result::Result<T, TypeError>;

const STATEMENT_BUILTINS: [&str; 3] = ["log", "requireAuth", "selfdestruct"];

fn unresolved(span: Span, message: impl Into<String>) -> TypeError {
    TypeError::new(TypeErrorKind::UnresolvedReference, span, message)
}

fn mismatch(span: Span, message: impl Into<String>) -> TypeError {
    TypeError::new(TypeErrorKind::TypeMismatch, span, message)
}

/// Resolves every name in `program` and assigns a type to every expression.
pub fn resolve(program: &ast::Program) -> Result<TypedProgram> {
    let mut resolver = Resolver::default();
    let sources = resolver.declare(program)?;
    resolver.check_acyclic()?;

    for (id, source) in sources.iter().enumerate() {
        let (body, locals) = {
            let function = &resolver.functions[id];
            let mut body_resolver = BodyResolver {
                contracts: &resolver.contracts,
                functions: &resolver.functions,
                free_functions: &resolver.free_functions,
                contract: function.contract,
                return_type: function.return_type.clone(),
                locals: function.locals.clone(),
                scopes: vec![
                    source
                        .params
                        .iter()
                        .zip(&function.params)
                        .map(|(param, local)| (param.name.clone(), *local))
                        .collect(),
                ],
            };
            let body = body_resolver.block(&source.body)?;
            if function.return_type.is_some() && !always_returns(&body) {
                return Err(mismatch(
                    source.span,
                    format!("function `{}` does not return a value on every path", source.name),
                ));
            }
            (body, body_resolver.locals)
        };
        let function = &mut resolver.functions[id];
        function.body = body;
        function.locals = locals;
    }

    debug!(
        contracts = resolver.contracts.len(),
        functions = resolver.functions.len(),
        "resolved program"
    );

    Ok(TypedProgram {
        contracts: resolver.contracts,
        functions: resolver.functions,
    })
}

fn always_returns(stmts: &[TStmt]) -> bool {
    stmts.iter().any(|stmt| match &stmt.kind {
        TStmtKind::Return(_) => true,
        TStmtKind::If {
            then_body,
            else_body,
            ..
        } => always_returns(then_body) && always_returns(else_body),
        _ => false,
    })
}

/// `number` is an alias of `u32`.
fn resolve_type(contracts: &[ContractDef], ty: &TypeExpr) -> Result<Type> {
    match ty {
        TypeExpr::Array(inner) => Ok(Type::Array(Box::new(resolve_type(contracts, inner)?))),
        TypeExpr::Named(name, span) => Ok(match name.as_str() {
            "string" => Type::String,
            "boolean" => Type::Boolean,
            "number" | "u32" => Type::UInt(Width::U32),
            "u8" => Type::UInt(Width::U8),
            "u16" => Type::UInt(Width::U16),
            "u64" => Type::UInt(Width::U64),
            other => match contracts.iter().position(|c| c.name == other) {
                Some(id) => Type::Contract(id),
                None => return Err(unresolved(*span, format!("unknown type `{other}`"))),
            },
        }),
    }
}

/// Human readable type name for diagnostics.
fn describe(contracts: &[ContractDef], ty: &Type) -> String {
    match ty {
        Type::String => "string".to_string(),
        Type::Boolean => "boolean".to_string(),
        Type::UInt(width) => width.to_string(),
        Type::Array(inner) => format!("{}[]", describe(contracts, inner)),
        Type::Contract(id) => contracts[*id].name.clone(),
        Type::Void => "void".to_string(),
    }
}

#[derive(Default)]
struct Resolver {
    contracts: Vec<ContractDef>,
    functions: Vec<FunctionDef>,
    free_functions: HashMap<String, FunctionId>,
}

impl Resolver {
    /// Registers contracts, fields and function signatures. Returns the
    /// source of every function, indexed by `FunctionId`.
    fn declare<'a>(&mut self, program: &'a ast::Program) -> Result<Vec<&'a ast::Function>> {
        let mut contract_ids = HashMap::new();
        for item in &program.items {
            if let ast::Item::Contract(contract) = item {
                if contract_ids
                    .insert(contract.name.clone(), self.contracts.len())
                    .is_some()
                {
                    return Err(mismatch(
                        contract.span,
                        format!("contract `{}` is declared twice", contract.name),
                    ));
                }
                self.contracts.push(ContractDef {
                    name: contract.name.clone(),
                    fields: Vec::new(),
                    constructor: None,
                    methods: Vec::new(),
                    span: contract.span,
                });
            }
        }

        for item in &program.items {
            if let ast::Item::Contract(contract) = item {
                let id = contract_ids[&contract.name];
                let mut fields: Vec<FieldDef> = Vec::new();
                for field in &contract.fields {
                    if fields.iter().any(|existing| existing.name == field.name) {
                        return Err(mismatch(
                            field.span,
                            format!("field `{}` is declared twice", field.name),
                        ));
                    }
                    fields.push(FieldDef {
                        name: field.name.clone(),
                        ty: self.resolve_type(&field.type_)?,
                        span: field.span,
                    });
                }
                self.contracts[id].fields = fields;
            }
        }

        let mut sources = Vec::new();
        for item in &program.items {
            match item {
                ast::Item::Contract(contract) => {
                    let id = contract_ids[&contract.name];
                    if let Some(constructor) = &contract.constructor {
                        let function = self.signature(constructor, Some(id))?;
                        self.contracts[id].constructor = Some(function);
                        sources.push(constructor);
                    }
                    for method in &contract.methods {
                        if self.contracts[id].method(&method.name).is_some() {
                            return Err(mismatch(
                                method.span,
                                format!("method `{}` is declared twice", method.name),
                            ));
                        }
                        let function = self.signature(method, Some(id))?;
                        self.contracts[id].methods.push((method.name.clone(), function));
                        sources.push(method);
                    }
                }
                ast::Item::Function(function) => {
                    if STATEMENT_BUILTINS.contains(&function.name.as_str())
                        || function.name == "checkAuth"
                    {
                        return Err(mismatch(
                            function.span,
                            format!("`{}` is a builtin and cannot be redefined", function.name),
                        ));
                    }
                    let id = self.signature(function, None)?;
                    if self.free_functions.insert(function.name.clone(), id).is_some() {
                        return Err(mismatch(
                            function.span,
                            format!("function `{}` is declared twice", function.name),
                        ));
                    }
                    sources.push(function);
                }
            }
        }

        Ok(sources)
    }

    fn signature(&mut self, function: &ast::Function, contract: Option<ContractId>) -> Result<FunctionId> {
        let mut locals = Vec::with_capacity(function.params.len());
        let mut params = Vec::with_capacity(function.params.len());
        for (index, param) in function.params.iter().enumerate() {
            if function.params[..index].iter().any(|p| p.name == param.name) {
                return Err(mismatch(
                    param.span,
                    format!("parameter `{}` is declared twice", param.name),
                ));
            }
            locals.push(self.resolve_type(&param.type_)?);
            params.push(LocalId(index));
        }
        let return_type = function
            .return_type
            .as_ref()
            .map(|ty| self.resolve_type(ty))
            .transpose()?;

        self.functions.push(FunctionDef {
            name: function.name.clone(),
            contract,
            params,
            return_type,
            locals,
            body: Vec::new(),
            span: function.span,
        });
        Ok(self.functions.len() - 1)
    }

    fn resolve_type(&self, ty: &TypeExpr) -> Result<Type> {
        resolve_type(&self.contracts, ty)
    }

    /// Contract types must not contain themselves, directly, through other
    /// contracts or through arrays.
    fn check_acyclic(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            Active,
            Done,
        }

        fn referenced(ty: &Type) -> Option<ContractId> {
            match ty {
                Type::Contract(id) => Some(*id),
                Type::Array(inner) => referenced(inner),
                _ => None,
            }
        }

        fn visit(contracts: &[ContractDef], marks: &mut [Mark], id: ContractId) -> Result<()> {
            marks[id] = Mark::Active;
            for field in &contracts[id].fields {
                let Some(next) = referenced(&field.ty) else {
                    continue;
                };
                match marks[next] {
                    Mark::Active => {
                        return Err(TypeError::new(
                            TypeErrorKind::CyclicType,
                            field.span,
                            format!(
                                "field `{}` of `{}` makes `{}` contain itself",
                                field.name, contracts[id].name, contracts[next].name
                            ),
                        ));
                    }
                    Mark::New => visit(contracts, marks, next)?,
                    Mark::Done => {}
                }
            }
            marks[id] = Mark::Done;
            Ok(())
        }

        let mut marks = vec![Mark::New; self.contracts.len()];
        for id in 0..self.contracts.len() {
            if marks[id] == Mark::New {
                visit(&self.contracts, &mut marks, id)?;
            }
        }
        Ok(())
    }
}

struct BodyResolver<'p> {
    contracts: &'p [ContractDef],
    functions: &'p [FunctionDef],
    free_functions: &'p HashMap<String, FunctionId>,
    contract: Option<ContractId>,
    return_type: Option<Type>,
    locals: Vec<Type>,
    scopes: Vec<HashMap<String, LocalId>>,
}

impl BodyResolver<'_> {
    fn describe(&self, ty: &Type) -> String {
        describe(self.contracts, ty)
    }

    fn expect(&self, expr: &TExpr, ty: &Type) -> Result<()> {
        if expr.ty == *ty {
            Ok(())
        } else {
            Err(mismatch(
                expr.span,
                format!("expected `{}`, found `{}`", self.describe(ty), self.describe(&expr.ty)),
            ))
        }
    }

    fn expect_value(&self, expr: &TExpr) -> Result<()> {
        if expr.ty == Type::Void {
            Err(mismatch(expr.span, "expression does not produce a value"))
        } else {
            Ok(())
        }
    }

    fn this_contract(&self, span: Span) -> Result<ContractId> {
        self.contract.ok_or_else(|| {
            unresolved(
                span,
                "`this` is only available inside contract methods and constructors",
            )
        })
    }

    fn declare_local(&mut self, name: &str, ty: Type) -> LocalId {
        let id = LocalId(self.locals.len());
        self.locals.push(ty);
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), id);
        }
        id
    }

    fn lookup(&self, name: &str) -> Option<LocalId> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name).copied())
    }

    fn block(&mut self, stmts: &[ast::Stmt]) -> Result<Vec<TStmt>> {
        self.scopes.push(HashMap::new());
        let mut out = Vec::new();
        for stmt in stmts {
            out.extend(self.stmt(stmt)?);
        }
        self.scopes.pop();
        Ok(out)
    }

    fn scoped_stmt(&mut self, stmt: &ast::Stmt) -> Result<Vec<TStmt>> {
        self.block(std::slice::from_ref(stmt))
    }

    fn stmt(&mut self, stmt: &ast::Stmt) -> Result<Vec<TStmt>> {
        let span = stmt.span;
        let kind = match &stmt.kind {
            StmtKind::Let { name, type_, value } => {
                let declared = type_.as_ref().map(|ty| self.resolve_type(ty)).transpose()?;
                let value = self.expr(value, declared.as_ref())?;
                self.expect_value(&value)?;
                if let Some(declared) = &declared {
                    self.expect(&value, declared)?;
                }
                let local = self.declare_local(name, value.ty.clone());
                TStmtKind::Let { local, value }
            }
            StmtKind::Assign { target, op, value } => {
                let place = self.place(target)?;
                let value = match op {
                    AssignOp::Set => {
                        let value = self.expr(value, Some(&place.ty))?;
                        self.expect(&value, &place.ty)?;
                        value
                    }
                    AssignOp::Add | AssignOp::Sub => {
                        let current = self.place_expr(&place, target.span);
                        let rhs = self.expr(value, Some(&place.ty))?;
                        self.expect(&rhs, &place.ty)?;
                        let kind = match (&place.ty, op) {
                            (Type::String, AssignOp::Add) => {
                                TExprKind::Concat(Box::new(current), Box::new(rhs))
                            }
                            (Type::UInt(_), _) => TExprKind::Binary {
                                op: if *op == AssignOp::Add {
                                    BinaryOp::Add
                                } else {
                                    BinaryOp::Sub
                                },
                                lhs: Box::new(current),
                                rhs: Box::new(rhs),
                            },
                            (ty, _) => {
                                return Err(mismatch(
                                    span,
                                    format!(
                                        "compound assignment is not defined for `{}`",
                                        self.describe(ty)
                                    ),
                                ));
                            }
                        };
                        TExpr {
                            kind,
                            ty: place.ty.clone(),
                            span,
                        }
                    }
                };
                TStmtKind::Assign { place, value }
            }
            StmtKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let cond = self.condition(cond)?;
                let then_body = self.scoped_stmt(then_branch)?;
                let else_body = match else_branch {
                    Some(branch) => self.scoped_stmt(branch)?,
                    None => Vec::new(),
                };
                TStmtKind::If {
                    cond,
                    then_body,
                    else_body,
                }
            }
            StmtKind::While { cond, body } => {
                let cond = self.condition(cond)?;
                let body = self.block(body)?;
                TStmtKind::While { cond, body }
            }
            StmtKind::For {
                init,
                cond,
                step,
                body,
            } => {
                self.scopes.push(HashMap::new());
                let mut out = match init {
                    Some(init) => self.stmt(init)?,
                    None => Vec::new(),
                };
                let cond = match cond {
                    Some(cond) => self.condition(cond)?,
                    None => TExpr {
                        kind: TExprKind::Bool(true),
                        ty: Type::Boolean,
                        span,
                    },
                };
                let mut body = self.block(body)?;
                if let Some(step) = step {
                    body.extend(self.stmt(step)?);
                }
                self.scopes.pop();
                out.push(TStmt {
                    kind: TStmtKind::While { cond, body },
                    span,
                });
                return Ok(out);
            }
            StmtKind::Return(value) => match (value, self.return_type.clone()) {
                (None, None) => TStmtKind::Return(None),
                (Some(value), Some(expected)) => {
                    let value = self.expr(value, Some(&expected))?;
                    self.expect(&value, &expected)?;
                    TStmtKind::Return(Some(value))
                }
                (Some(value), None) => {
                    return Err(mismatch(
                        value.span,
                        "function without a return type cannot return a value",
                    ));
                }
                (None, Some(_)) => return Err(mismatch(span, "missing return value")),
            },
            StmtKind::Block(stmts) => return self.block(stmts),
            StmtKind::Expr(expr) => self.expr_stmt(expr)?,
        };
        Ok(vec![TStmt { kind, span }])
    }

    fn condition(&mut self, cond: &ast::Expr) -> Result<TExpr> {
        let cond = self.expr(cond, Some(&Type::Boolean))?;
        self.expect(&cond, &Type::Boolean)?;
        Ok(cond)
    }

    /// Statement-only builtins: `log`, `requireAuth`, `selfdestruct` and
    /// `array.push`.
    fn expr_stmt(&mut self, expr: &ast::Expr) -> Result<TStmtKind> {
        if let ExprKind::Call { callee, args } = &expr.kind {
            match &callee.kind {
                ExprKind::Ident(name) if STATEMENT_BUILTINS.contains(&name.as_str()) => {
                    return self.statement_builtin(name, args, expr.span);
                }
                ExprKind::Member { object, name } if name == "push" => {
                    let [value] = args.as_slice() else {
                        return Err(arity(expr.span, "push", 1, args.len()));
                    };
                    let place = self.place(object)?;
                    let Type::Array(element) = place.ty.clone() else {
                        return Err(mismatch(
                            object.span,
                            format!("`push` is not defined for `{}`", self.describe(&place.ty)),
                        ));
                    };
                    let value = self.expr(value, Some(&element))?;
                    self.expect(&value, &element)?;
                    return Ok(TStmtKind::Push { place, value });
                }
                _ => {}
            }
        }
        Ok(TStmtKind::Expr(self.expr(expr, None)?))
    }

    fn statement_builtin(&mut self, name: &str, args: &[ast::Expr], span: Span) -> Result<TStmtKind> {
        match name {
            "log" => {
                let [value] = args else {
                    return Err(arity(span, name, 1, args.len()));
                };
                let value = self.expr(value, None)?;
                self.expect_value(&value)?;
                Ok(TStmtKind::Log(value))
            }
            "requireAuth" => {
                let [value] = args else {
                    return Err(arity(span, name, 1, args.len()));
                };
                Ok(TStmtKind::RequireAuth(self.condition(value)?))
            }
            _ => {
                if !args.is_empty() {
                    return Err(arity(span, name, 0, args.len()));
                }
                self.this_contract(span)?;
                Ok(TStmtKind::SelfDestruct)
            }
        }
    }

    fn resolve_type(&self, ty: &TypeExpr) -> Result<Type> {
        resolve_type(&self.contracts, ty)
    }

    fn place(&mut self, target: &ast::Expr) -> Result<Place> {
        let place = self.place_path(target)?;
        if place.root == PlaceRoot::This && place.path.is_empty() {
            return Err(mismatch(target.span, "cannot assign to `this`"));
        }
        Ok(place)
    }

    fn place_path(&mut self, target: &ast::Expr) -> Result<Place> {
        match &target.kind {
            ExprKind::Ident(name) => {
                let local = self
                    .lookup(name)
                    .ok_or_else(|| unresolved(target.span, format!("unknown variable `{name}`")))?;
                Ok(Place {
                    root: PlaceRoot::Local(local),
                    path: Vec::new(),
                    ty: self.locals[local.0].clone(),
                })
            }
            ExprKind::This => {
                let contract = self.this_contract(target.span)?;
                Ok(Place {
                    root: PlaceRoot::This,
                    path: Vec::new(),
                    ty: Type::Contract(contract),
                })
            }
            ExprKind::Member { object, name } => {
                let mut place = self.place_path(object)?;
                let Type::Contract(contract) = place.ty else {
                    return Err(mismatch(
                        target.span,
                        format!("`{name}` is not an assignable field"),
                    ));
                };
                let def = &self.contracts[contract];
                let index = def.field_index(name).ok_or_else(|| {
                    unresolved(target.span, format!("`{}` has no field `{name}`", def.name))
                })?;
                place.path.push(PlaceStep::Field(index));
                place.ty = def.fields[index].ty.clone();
                Ok(place)
            }
            ExprKind::Index { object, index } => {
                let mut place = self.place_path(object)?;
                let Type::Array(element) = place.ty.clone() else {
                    return Err(mismatch(
                        object.span,
                        format!("cannot index into `{}`", self.describe(&place.ty)),
                    ));
                };
                let index = self.index_expr(index)?;
                place.path.push(PlaceStep::Index(index));
                place.ty = *element;
                Ok(place)
            }
            _ => Err(mismatch(target.span, "invalid assignment target")),
        }
    }

    /// Expression reading the current value of `place`.
    fn place_expr(&self, place: &Place, span: Span) -> TExpr {
        let mut expr = match place.root {
            PlaceRoot::Local(local) => TExpr {
                kind: TExprKind::Local(local),
                ty: self.locals[local.0].clone(),
                span,
            },
            PlaceRoot::This => TExpr {
                kind: TExprKind::This,
                ty: self.contract.map(Type::Contract).unwrap_or(Type::Void),
                span,
            },
        };
        for step in &place.path {
            expr = match (step, &expr.ty) {
                (PlaceStep::Field(index), Type::Contract(contract)) => {
                    let ty = self.contracts[*contract].fields[*index].ty.clone();
                    TExpr {
                        kind: TExprKind::Field {
                            object: Box::new(expr),
                            index: *index,
                        },
                        ty,
                        span,
                    }
                }
                (PlaceStep::Index(index), Type::Array(element)) => {
                    let ty = (**element).clone();
                    TExpr {
                        kind: TExprKind::Index {
                            array: Box::new(expr),
                            index: Box::new(index.clone()),
                        },
                        ty,
                        span,
                    }
                }
                _ => unreachable!("place steps are checked when the place is resolved"),
            };
        }
        expr
    }

    fn index_expr(&mut self, index: &ast::Expr) -> Result<TExpr> {
        let index = self.expr(index, Some(&Type::UInt(Width::U32)))?;
        if !index.ty.is_uint() {
            return Err(mismatch(
                index.span,
                format!("array index must be an unsigned integer, found `{}`", self.describe(&index.ty)),
            ));
        }
        Ok(index)
    }

    fn expr(&mut self, expr: &ast::Expr, hint: Option<&Type>) -> Result<TExpr> {
        let span = expr.span;
        let (kind, ty) = match &expr.kind {
            ExprKind::Number(value) => {
                let width = match hint {
                    Some(Type::UInt(width)) => *width,
                    _ => Width::U32,
                };
                if !width.fits(*value) {
                    return Err(mismatch(span, format!("literal {value} does not fit in `{width}`")));
                }
                (TExprKind::UInt(*value), Type::UInt(width))
            }
            ExprKind::String(value) => (TExprKind::Str(value.clone()), Type::String),
            ExprKind::Bool(value) => (TExprKind::Bool(*value), Type::Boolean),
            ExprKind::Array(items) => {
                let element_hint = match hint {
                    Some(Type::Array(element)) => Some((**element).clone()),
                    _ => None,
                };
                let Some((first, rest)) = items.split_first() else {
                    let Some(element) = element_hint else {
                        return Err(mismatch(span, "cannot infer the element type of an empty array"));
                    };
                    return Ok(TExpr {
                        kind: TExprKind::Array(Vec::new()),
                        ty: Type::Array(Box::new(element)),
                        span,
                    });
                };
                let first = self.expr(first, element_hint.as_ref())?;
                self.expect_value(&first)?;
                let element = first.ty.clone();
                let mut resolved = vec![first];
                for item in rest {
                    let item = self.expr(item, Some(&element))?;
                    self.expect(&item, &element)?;
                    resolved.push(item);
                }
                (TExprKind::Array(resolved), Type::Array(Box::new(element)))
            }
            ExprKind::Ident(name) => match self.lookup(name) {
                Some(local) => (TExprKind::Local(local), self.locals[local.0].clone()),
                None if self.free_functions.contains_key(name) => {
                    return Err(mismatch(span, format!("function `{name}` must be called")));
                }
                None => return Err(unresolved(span, format!("unknown variable `{name}`"))),
            },
            ExprKind::This => {
                let contract = self.this_contract(span)?;
                (TExprKind::This, Type::Contract(contract))
            }
            ExprKind::Member { object, name } => {
                let object = self.expr(object, None)?;
                match &object.ty {
                    Type::Contract(contract) => {
                        let def = &self.contracts[*contract];
                        let index = def.field_index(name).ok_or_else(|| {
                            unresolved(span, format!("`{}` has no field `{name}`", def.name))
                        })?;
                        let ty = def.fields[index].ty.clone();
                        (
                            TExprKind::Field {
                                object: Box::new(object),
                                index,
                            },
                            ty,
                        )
                    }
                    Type::Array(_) | Type::String if name == "length" => {
                        (TExprKind::Length(Box::new(object)), Type::UInt(Width::U32))
                    }
                    other => {
                        return Err(unresolved(
                            span,
                            format!("`{}` has no field `{name}`", self.describe(other)),
                        ));
                    }
                }
            }
            ExprKind::Index { object, index } => {
                let array = self.expr(object, None)?;
                let Type::Array(element) = array.ty.clone() else {
                    return Err(mismatch(
                        span,
                        format!("cannot index into `{}`", self.describe(&array.ty)),
                    ));
                };
                let index = self.index_expr(index)?;
                (
                    TExprKind::Index {
                        array: Box::new(array),
                        index: Box::new(index),
                    },
                    *element,
                )
            }
            ExprKind::Call { callee, args } => return self.call(callee, args, span, hint),
            ExprKind::Unary { op, operand } => match op {
                UnaryOp::Not => {
                    let operand = self.condition(operand)?;
                    (TExprKind::Not(Box::new(operand)), Type::Boolean)
                }
                UnaryOp::Neg => {
                    return Err(mismatch(span, "negation is not defined for unsigned integers"));
                }
            },
            ExprKind::Binary { op, lhs, rhs } => return self.binary(*op, lhs, rhs, span, hint),
        };
        Ok(TExpr { kind, ty, span })
    }

    /// Resolves both operands so that an untyped integer literal on either
    /// side takes the width of the other side.
    fn operands(
        &mut self,
        lhs: &ast::Expr,
        rhs: &ast::Expr,
        hint: Option<&Type>,
    ) -> Result<(TExpr, TExpr)> {
        let literal = |expr: &ast::Expr| matches!(expr.kind, ExprKind::Number(_));
        let (lhs, rhs) = if literal(lhs) && !literal(rhs) {
            let rhs = self.expr(rhs, hint)?;
            let lhs = self.expr(lhs, Some(&rhs.ty))?;
            (lhs, rhs)
        } else {
            let lhs = self.expr(lhs, hint)?;
            let rhs = self.expr(rhs, Some(&lhs.ty))?;
            (lhs, rhs)
        };
        self.expect_value(&lhs)?;
        self.expect(&rhs, &lhs.ty)?;
        Ok((lhs, rhs))
    }

    fn binary(
        &mut self,
        op: BinaryOp,
        lhs: &ast::Expr,
        rhs: &ast::Expr,
        span: Span,
        hint: Option<&Type>,
    ) -> Result<TExpr> {
        let binary = |lhs: TExpr, rhs: TExpr, ty: Type| TExpr {
            kind: TExprKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            ty,
            span,
        };

        match op {
            BinaryOp::And | BinaryOp::Or => {
                let lhs = self.condition(lhs)?;
                let rhs = self.condition(rhs)?;
                Ok(binary(lhs, rhs, Type::Boolean))
            }
            BinaryOp::Eq | BinaryOp::Ne => {
                let (lhs, rhs) = self.operands(lhs, rhs, None)?;
                Ok(binary(lhs, rhs, Type::Boolean))
            }
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                let (lhs, rhs) = self.operands(lhs, rhs, None)?;
                if !lhs.ty.is_uint() {
                    return Err(mismatch(
                        span,
                        format!("cannot order values of type `{}`", self.describe(&lhs.ty)),
                    ));
                }
                Ok(binary(lhs, rhs, Type::Boolean))
            }
            _ => {
                let (lhs, rhs) = self.operands(lhs, rhs, hint)?;
                self.arithmetic(op, lhs, rhs, span)
            }
        }
    }

    fn arithmetic(&self, op: BinaryOp, lhs: TExpr, rhs: TExpr, span: Span) -> Result<TExpr> {
        let ty = lhs.ty.clone();
        let kind = match (&ty, op) {
            (Type::String, BinaryOp::Add) => TExprKind::Concat(Box::new(lhs), Box::new(rhs)),
            (Type::UInt(_), _) => TExprKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            _ => {
                return Err(mismatch(
                    span,
                    format!("operator {op:?} is not defined for `{}`", self.describe(&ty)),
                ));
            }
        };
        Ok(TExpr { kind, ty, span })
    }

    fn call(
        &mut self,
        callee: &ast::Expr,
        args: &[ast::Expr],
        span: Span,
        hint: Option<&Type>,
    ) -> Result<TExpr> {
        match &callee.kind {
            ExprKind::Ident(name) if STATEMENT_BUILTINS.contains(&name.as_str()) => Err(mismatch(
                span,
                format!("`{name}` can only be used as a statement"),
            )),
            ExprKind::Ident(name) if name == "checkAuth" => {
                let [value] = args else {
                    return Err(arity(span, name, 1, args.len()));
                };
                let value = self.condition(value)?;
                Ok(TExpr {
                    kind: TExprKind::CheckAuth(Box::new(value)),
                    ty: Type::Boolean,
                    span,
                })
            }
            ExprKind::Ident(name) => match self.free_functions.get(name) {
                Some(&function) => self.user_call(function, args, span),
                None if self.lookup(name).is_some() => {
                    Err(mismatch(span, format!("`{name}` is not a function")))
                }
                None => Err(unresolved(span, format!("unknown function `{name}`"))),
            },
            ExprKind::Member { object, name } if matches!(object.kind, ExprKind::This) => {
                let contract = self.this_contract(object.span)?;
                let def = &self.contracts[contract];
                let function = def.method(name).ok_or_else(|| {
                    unresolved(span, format!("`{}` has no method `{name}`", def.name))
                })?;
                self.user_call(function, args, span)
            }
            ExprKind::Member { object, name } => {
                let op = match name.as_str() {
                    "wrappingAdd" => WrappingOp::Add,
                    "wrappingSub" => WrappingOp::Sub,
                    "wrappingMul" => WrappingOp::Mul,
                    "push" => {
                        return Err(mismatch(span, "`push` can only be used as a statement"));
                    }
                    _ => return Err(unresolved(span, format!("unknown method `{name}`"))),
                };
                let [arg] = args else {
                    return Err(arity(span, name, 1, args.len()));
                };
                let receiver_hint = hint.filter(|ty| ty.is_uint());
                let receiver = self.expr(object, receiver_hint)?;
                if !receiver.ty.is_uint() {
                    return Err(mismatch(
                        object.span,
                        format!("`{name}` is not defined for `{}`", self.describe(&receiver.ty)),
                    ));
                }
                let arg = self.expr(arg, Some(&receiver.ty))?;
                self.expect(&arg, &receiver.ty)?;
                Ok(TExpr {
                    ty: receiver.ty.clone(),
                    kind: TExprKind::Wrapping {
                        op,
                        lhs: Box::new(receiver),
                        rhs: Box::new(arg),
                    },
                    span,
                })
            }
            _ => Err(mismatch(span, "expression is not callable")),
        }
    }

    fn user_call(&mut self, function: FunctionId, args: &[ast::Expr], span: Span) -> Result<TExpr> {
        let def = &self.functions[function];
        if def.params.len() != args.len() {
            return Err(arity(span, &def.name, def.params.len(), args.len()));
        }
        let params: Vec<Type> = def.param_types().cloned().collect();
        let ty = def.return_type.clone().unwrap_or(Type::Void);

        let mut resolved = Vec::with_capacity(args.len());
        for (arg, param) in args.iter().zip(&params) {
            let arg = self.expr(arg, Some(param))?;
            self.expect(&arg, param)?;
            resolved.push(arg);
        }
        Ok(TExpr {
            kind: TExprKind::Call {
                function,
                args: resolved,
            },
            ty,
            span,
        })
    }
}

fn arity(span: Span, name: &str, expected: usize, found: usize) -> TypeError {
    TypeError::new(
        TypeErrorKind::ArityMismatch,
        span,
        format!("`{name}` expects {expected} argument(s), found {found}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::parser::parse;

    fn check(source: &str) -> Result<TypedProgram> {
        resolve(&parse(source).expect("source should parse"))
    }

    fn error_kind(source: &str) -> TypeErrorKind {
        check(source).expect_err("source should not type check").kind
    }

    #[test]
    fn test_number_is_u32() {
        let program = check(
            "contract Reverse { elements: number[]; function first(): u32 { return this.elements[0]; } }",
        )
        .unwrap();
        assert_eq!(
            program.contracts[0].fields[0].ty,
            Type::Array(Box::new(Type::UInt(Width::U32)))
        );
    }

    #[test]
    fn test_literal_takes_context_width() {
        let program = check("function f(a: u64): u64 { return a + 5000000000; }").unwrap();
        let TStmtKind::Return(Some(value)) = &program.functions[0].body[0].kind else {
            panic!("expected return");
        };
        let TExprKind::Binary { rhs, .. } = &value.kind else {
            panic!("expected binary expression");
        };
        assert_eq!(rhs.ty, Type::UInt(Width::U64));
    }

    #[test]
    fn test_literal_out_of_range() {
        assert_eq!(error_kind("function f(a: u8): u8 { return a + 256; }"), TypeErrorKind::TypeMismatch);
    }

    #[test]
    fn test_width_mismatch_is_rejected() {
        assert_eq!(
            error_kind("function f(a: u32, b: u64): u64 { return a + b; }"),
            TypeErrorKind::TypeMismatch
        );
    }

    #[test]
    fn test_unresolved_reference() {
        assert_eq!(error_kind("function f() { log(missing); }"), TypeErrorKind::UnresolvedReference);
        assert_eq!(error_kind("contract A { b: Missing; }"), TypeErrorKind::UnresolvedReference);
    }

    #[test]
    fn test_this_outside_contract() {
        assert_eq!(error_kind("function f() { log(this); }"), TypeErrorKind::UnresolvedReference);
    }

    #[test]
    fn test_arity_mismatch() {
        assert_eq!(
            error_kind("function g(a: u32): u32 { return a; } function f() { log(g(1, 2)); }"),
            TypeErrorKind::ArityMismatch
        );
    }

    #[test]
    fn test_cyclic_contracts() {
        let err = check("contract A { b: B; } contract B { items: A[]; }").unwrap_err();
        assert_eq!(err.kind, TypeErrorKind::CyclicType);
        assert_eq!(err.location.line, 1);
    }

    #[test]
    fn test_nested_contracts_forward_reference() {
        let program = check(
            "contract City { country: Country; } contract Country { id: string; }",
        )
        .unwrap();
        assert_eq!(program.contracts[0].fields[0].ty, Type::Contract(1));
    }

    #[test]
    fn test_for_loop_is_desugared() {
        let program = check("function f(p: u32) { for (let i: u32 = 0; i < p; i++) { log(i); } }").unwrap();
        let body = &program.functions[0].body;
        assert_eq!(body.len(), 2);
        assert!(matches!(body[0].kind, TStmtKind::Let { .. }));
        let TStmtKind::While { body: loop_body, .. } = &body[1].kind else {
            panic!("expected while loop");
        };
        assert!(matches!(loop_body[0].kind, TStmtKind::Log(_)));
        assert!(matches!(loop_body[1].kind, TStmtKind::Assign { .. }));
    }

    #[test]
    fn test_shadowing_allocates_new_locals() {
        let program = check("function f(a: u32) { let a: string = 'x'; log(a); }").unwrap();
        let function = &program.functions[0];
        assert_eq!(function.locals, vec![Type::UInt(Width::U32), Type::String]);
    }

    #[test]
    fn test_missing_return() {
        assert_eq!(
            error_kind("function f(a: boolean): u32 { if (a) { return 1; } }"),
            TypeErrorKind::TypeMismatch
        );
        assert!(check("function f(a: boolean): u32 { if (a) { return 1; } else { return 2; } }").is_ok());
    }

    #[test]
    fn test_string_concatenation() {
        let program = check("function f(x: string): string { return 'x: ' + x; }").unwrap();
        let TStmtKind::Return(Some(value)) = &program.functions[0].body[0].kind else {
            panic!("expected return");
        };
        assert!(matches!(value.kind, TExprKind::Concat(..)));
    }

    #[test]
    fn test_wrapping_add_on_literal_receiver() {
        let program = check("function f(): u32 { return 4294967295.wrappingAdd(1); }").unwrap();
        let TStmtKind::Return(Some(value)) = &program.functions[0].body[0].kind else {
            panic!("expected return");
        };
        assert!(matches!(value.kind, TExprKind::Wrapping { op: WrappingOp::Add, .. }));
    }

    #[test]
    fn test_push_requires_array() {
        assert_eq!(error_kind("function f(a: u32) { a.push(1); }"), TypeErrorKind::TypeMismatch);
        assert!(check("function f(a: u32[]) { a.push(1); }").is_ok());
    }
}
