//! Lowers the typed program into a linear instruction stream.
//!
//! The stream starts with a bootstrap that reads the public inputs, calls
//! the entry point and writes the public outputs. Composite values are built
//! item by item on the heap; updates of strings, arrays and records go
//! through generated routines that copy the composite with one item changed.

use std::collections::{BTreeSet, HashMap, VecDeque};

use tracing::{debug, trace};

use super::liveness;
use super::program::*;
use crate::error::CompileError;
use crate::lang::Width;
use crate::lang::typed::{
    BinaryOp, ContractId, FunctionId, Place, PlaceRoot, PlaceStep, TExpr, TExprKind, TStmt,
    TStmtKind, Type, TypedProgram,
};

/// Compiles the entry point `entry` of `contract` (or the free function
/// `entry` when `contract` is `None`) and everything it can reach.
pub fn generate(
    program: &TypedProgram,
    contract: Option<&str>,
    entry: &str,
) -> Result<CompiledProgram, CompileError> {
    let contract_id = contract
        .map(|name| {
            program
                .contract_by_name(name)
                .ok_or_else(|| CompileError::UnknownEntry(format!("contract `{name}`")))
        })
        .transpose()?;
    let entry_id = program.entry_point(contract_id, entry).ok_or_else(|| {
        CompileError::UnknownEntry(match contract {
            Some(name) => format!("{name}.{entry}"),
            None => entry.to_string(),
        })
    })?;

    let layout = match contract_id {
        Some(id) => build_layout(program, id),
        None => ThisLayout::default(),
    };

    // Prune bodies, then discover reachable functions in call order.
    let mut order = vec![entry_id];
    let mut index_of = HashMap::from([(entry_id, 0usize)]);
    let mut bodies = Vec::new();
    let mut queue = VecDeque::from([entry_id]);
    while let Some(id) = queue.pop_front() {
        let body = liveness::prune(&program.functions[id]);
        for callee in callees(&body) {
            if !index_of.contains_key(&callee) {
                index_of.insert(callee, order.len());
                order.push(callee);
                queue.push_back(callee);
            }
        }
        bodies.push(body);
    }

    let mut touched = BTreeSet::new();
    if contract_id.is_some() {
        for body in &bodies {
            touched_fields(body, layout.fields().len(), &mut touched);
        }
    }
    let public_fields: Vec<usize> = touched.into_iter().collect();
    let entry_def = &program.functions[entry_id];

    let mut code = Code::default();
    let mut routines = Vec::new();
    FunctionEmitter::new(program, &layout, &index_of, &mut code, &mut routines, 0)
        .bootstrap(&public_fields, entry_def.params.len());

    let mut functions = Vec::with_capacity(order.len());
    for (id, body) in order.iter().zip(&bodies) {
        let function = &program.functions[*id];
        let entry = code.instructions.len();
        let mut emitter = FunctionEmitter::new(
            program,
            &layout,
            &index_of,
            &mut code,
            &mut routines,
            function.locals.len(),
        );
        emitter.block(body);
        emitter.emit(Instruction::Push(Literal::Null));
        emitter.ret();
        let frame_size = emitter.finish();
        trace!(function = %function.name, entry, frame_size, "emitted function");
        functions.push(FunctionInfo {
            name: function.name.clone(),
            entry,
            arity: function.params.len(),
            frame_size,
        });
    }
    for &routine in &routines {
        let entry = code.instructions.len();
        let frame_size = routine.emit(&mut code);
        trace!(routine = routine.name(), entry, frame_size, "emitted routine");
        functions.push(FunctionInfo {
            name: routine.name().to_string(),
            entry,
            arity: routine.arity(),
            frame_size,
        });
    }
    let instructions = code.finish(&functions);

    let compiled = CompiledProgram {
        instructions,
        functions,
        entry: 0,
        entry_name: entry.to_string(),
        contract: contract.map(str::to_string),
        params: entry_def
            .param_types()
            .map(|ty| value_type(program, ty))
            .collect(),
        returns: entry_def.return_type.as_ref().map(|ty| value_type(program, ty)),
        this_type: contract_id.map(|id| value_type(program, &Type::Contract(id))),
        layout,
        public_fields,
    };

    debug!(
        entry = %compiled.entry_name,
        instructions = compiled.instructions.len(),
        functions = compiled.functions.len(),
        public_fields = ?compiled.public_field_names(),
        "generated program"
    );
    Ok(compiled)
}

/// Runtime descriptor of a resolved type. Contract types are expanded, which
/// terminates because the resolver rejects cyclic contracts.
pub fn value_type(program: &TypedProgram, ty: &Type) -> ValueType {
    match ty {
        Type::String | Type::Void => ValueType::String,
        Type::Boolean => ValueType::Boolean,
        Type::UInt(width) => ValueType::UInt(*width),
        Type::Array(inner) => ValueType::Array(Box::new(value_type(program, inner))),
        Type::Contract(id) => ValueType::Object(
            program.contracts[*id]
                .fields
                .iter()
                .map(|field| (field.name.clone(), value_type(program, &field.ty)))
                .collect(),
        ),
    }
}

fn build_layout(program: &TypedProgram, contract: ContractId) -> ThisLayout {
    fn add(program: &TypedProgram, layout: &mut ThisLayout, name: String, ty: &Type) -> usize {
        let id = layout.nodes.len();
        layout.nodes.push(LayoutNode {
            name,
            ty: value_type(program, ty),
            first_slot: layout.slot_count,
            slot_count: 0,
            children: Vec::new(),
        });
        match ty {
            Type::Contract(contract) => {
                let children = program.contracts[*contract]
                    .fields
                    .iter()
                    .map(|field| add(program, layout, field.name.clone(), &field.ty))
                    .collect();
                layout.nodes[id].children = children;
            }
            _ => layout.slot_count += 1,
        }
        layout.nodes[id].slot_count = layout.slot_count - layout.nodes[id].first_slot;
        id
    }

    let mut layout = ThisLayout::default();
    add(program, &mut layout, "this".to_string(), &Type::Contract(contract));
    layout
}

fn callees(body: &[TStmt]) -> Vec<FunctionId> {
    let mut out = Vec::new();
    for_each_expr(body, &mut |expr| {
        expr.walk(&mut |expr| {
            if let TExprKind::Call { function, .. } = expr.kind {
                out.push(function);
            }
        })
    });
    out
}

/// Visits every top-level expression of a statement list, nested bodies
/// included.
fn for_each_expr(body: &[TStmt], visit: &mut impl FnMut(&TExpr)) {
    for stmt in body {
        match &stmt.kind {
            TStmtKind::Let { value, .. }
            | TStmtKind::Log(value)
            | TStmtKind::RequireAuth(value)
            | TStmtKind::Expr(value)
            | TStmtKind::Return(Some(value)) => visit(value),
            TStmtKind::Assign { place, value } | TStmtKind::Push { place, value } => {
                place.index_exprs().for_each(&mut *visit);
                visit(value);
            }
            TStmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                visit(cond);
                for_each_expr(then_body, visit);
                for_each_expr(else_body, visit);
            }
            TStmtKind::While { cond, body } => {
                visit(cond);
                for_each_expr(body, visit);
            }
            TStmtKind::Return(None) | TStmtKind::SelfDestruct => {}
        }
    }
}

/// Collects the top-level `this` fields read or written by `body`.
fn touched_fields(body: &[TStmt], field_count: usize, out: &mut BTreeSet<usize>) {
    fn visit(expr: &TExpr, field_count: usize, out: &mut BTreeSet<usize>) {
        match &expr.kind {
            TExprKind::This => out.extend(0..field_count),
            TExprKind::Field { object, index } if object.kind == TExprKind::This => {
                out.insert(*index);
            }
            _ => expr
                .children()
                .into_iter()
                .for_each(|child| visit(child, field_count, out)),
        }
    }

    for_each_expr(body, &mut |expr| visit(expr, field_count, out));

    fn places(body: &[TStmt], out: &mut BTreeSet<usize>) {
        for stmt in body {
            match &stmt.kind {
                TStmtKind::Assign { place, .. } | TStmtKind::Push { place, .. } => {
                    if let (PlaceRoot::This, Some(PlaceStep::Field(index))) =
                        (&place.root, place.path.first())
                    {
                        out.insert(*index);
                    }
                }
                TStmtKind::If {
                    then_body,
                    else_body,
                    ..
                } => {
                    places(then_body, out);
                    places(else_body, out);
                }
                TStmtKind::While { body, .. } => places(body, out),
                _ => {}
            }
        }
    }
    places(body, out);
}

#[derive(Default)]
struct Code {
    instructions: Vec<Instruction>,
    labels: Vec<Option<usize>>,
    /// Instructions whose jump operand is still a label id.
    fixups: Vec<usize>,
    /// Calls whose `entry` is still an index into the function table.
    calls: Vec<usize>,
}

impl Code {
    fn emit(&mut self, instruction: Instruction) {
        self.instructions.push(instruction);
    }

    fn new_label(&mut self) -> usize {
        self.labels.push(None);
        self.labels.len() - 1
    }

    fn bind(&mut self, label: usize) {
        self.labels[label] = Some(self.instructions.len());
    }

    fn jump(&mut self, label: usize, conditional: bool) {
        self.fixups.push(self.instructions.len());
        self.instructions.push(if conditional {
            Instruction::JumpIfFalse(label)
        } else {
            Instruction::Jump(label)
        });
    }

    fn call(&mut self, function: usize, argc: usize) {
        self.calls.push(self.instructions.len());
        self.instructions.push(Instruction::Call {
            entry: function,
            argc,
            frame: 0,
        });
    }

    fn push_u32(&mut self, value: usize) {
        self.emit(Instruction::Push(Literal::UInt(Width::U32, value as u64)));
    }

    /// Replaces label ids with absolute instruction indices and function
    /// indices with entry points and frame sizes.
    fn finish(self, functions: &[FunctionInfo]) -> Vec<Instruction> {
        let Code {
            mut instructions,
            labels,
            fixups,
            calls,
        } = self;
        let end = instructions.len();
        let target = |label: usize| labels[label].unwrap_or(end);
        for at in fixups {
            match &mut instructions[at] {
                Instruction::Jump(label) | Instruction::JumpIfFalse(label) => {
                    *label = target(*label);
                }
                _ => {}
            }
        }
        for at in calls {
            if let Instruction::Call { entry, frame, .. } = &mut instructions[at] {
                if let Some(function) = functions.get(*entry) {
                    *entry = function.entry;
                    *frame = function.frame_size;
                }
            }
        }
        instructions
    }
}

/// Built-in functions over heap composites, emitted once per program that
/// needs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Routine {
    /// `(a, b) -> a + b` on strings.
    Concat,
    /// `(composite, index, value)`: a copy with one item replaced.
    Set(Kind),
    /// `(array, value)`: a copy with `value` appended.
    Push,
}

impl Routine {
    fn name(self) -> &'static str {
        match self {
            Routine::Concat => "concat",
            Routine::Set(Kind::Object) => "set_member",
            Routine::Set(_) => "set_index",
            Routine::Push => "push",
        }
    }

    fn arity(self) -> usize {
        match self {
            Routine::Concat | Routine::Push => 2,
            Routine::Set(_) => 3,
        }
    }

    /// Emits the body and returns its frame size.
    fn emit(self, code: &mut Code) -> usize {
        use Instruction::*;
        let add = || Arith(ArithOp::Add, Width::U32);
        match self {
            Routine::Concat => {
                // a, b, len(a), len(b), result, i
                let frame = 6;
                code.emit(LoadLocal(0));
                code.emit(Length(Kind::String));
                code.emit(StoreLocal(2));
                code.emit(LoadLocal(1));
                code.emit(Length(Kind::String));
                code.emit(StoreLocal(3));
                code.emit(LoadLocal(2));
                code.emit(LoadLocal(3));
                code.emit(add());
                code.emit(Alloc(Kind::String));
                code.emit(StoreLocal(4));
                copy_items(code, 0, 2, 4, 5, None);
                copy_items(code, 1, 3, 4, 5, Some(2));
                code.emit(LoadLocal(4));
                code.emit(Seal);
                code.emit(Return { frame });
                frame
            }
            Routine::Set(kind) => {
                // composite, index, value, len, result, i
                let frame = 6;
                // Out-of-bounds indices trap before anything is built.
                code.emit(LoadLocal(0));
                code.emit(LoadLocal(1));
                code.emit(Index);
                code.emit(Pop);
                code.emit(LoadLocal(0));
                code.emit(Length(kind));
                code.emit(StoreLocal(3));
                code.emit(LoadLocal(3));
                code.emit(Alloc(kind));
                code.emit(StoreLocal(4));
                code.push_u32(0);
                code.emit(StoreLocal(5));
                let (head, copy, fill, end) =
                    (code.new_label(), code.new_label(), code.new_label(), code.new_label());
                code.bind(head);
                code.emit(LoadLocal(5));
                code.emit(LoadLocal(3));
                code.emit(Compare(CompareOp::Lt));
                code.jump(end, true);
                code.emit(LoadLocal(4));
                code.emit(LoadLocal(5));
                code.emit(LoadLocal(5));
                code.emit(LoadLocal(1));
                code.emit(Compare(CompareOp::Eq));
                code.jump(copy, true);
                code.emit(LoadLocal(2));
                code.jump(fill, false);
                code.bind(copy);
                code.emit(LoadLocal(0));
                code.emit(LoadLocal(5));
                code.emit(Index);
                code.bind(fill);
                code.emit(Fill);
                code.emit(StoreLocal(4));
                increment(code, 5);
                code.jump(head, false);
                code.bind(end);
                code.emit(LoadLocal(4));
                code.emit(Seal);
                code.emit(Return { frame });
                frame
            }
            Routine::Push => {
                // array, value, len, result, i
                let frame = 5;
                code.emit(LoadLocal(0));
                code.emit(Length(Kind::Array));
                code.emit(StoreLocal(2));
                code.emit(LoadLocal(2));
                code.push_u32(1);
                code.emit(add());
                code.emit(Alloc(Kind::Array));
                code.emit(StoreLocal(3));
                copy_items(code, 0, 2, 3, 4, None);
                code.emit(LoadLocal(3));
                code.emit(LoadLocal(2));
                code.emit(LoadLocal(1));
                code.emit(Fill);
                code.emit(Seal);
                code.emit(Return { frame });
                frame
            }
        }
    }
}

/// `local += 1` on a `u32` counter.
fn increment(code: &mut Code, local: usize) {
    code.emit(Instruction::LoadLocal(local));
    code.push_u32(1);
    code.emit(Instruction::Arith(ArithOp::Add, Width::U32));
    code.emit(Instruction::StoreLocal(local));
}

/// Copies the `len` items of `source` into `target`, at positions shifted by
/// the value of local `offset` if given.
fn copy_items(
    code: &mut Code,
    source: usize,
    len: usize,
    target: usize,
    counter: usize,
    offset: Option<usize>,
) {
    use Instruction::*;
    code.push_u32(0);
    code.emit(StoreLocal(counter));
    let (head, end) = (code.new_label(), code.new_label());
    code.bind(head);
    code.emit(LoadLocal(counter));
    code.emit(LoadLocal(len));
    code.emit(Compare(CompareOp::Lt));
    code.jump(end, true);
    code.emit(LoadLocal(target));
    code.emit(LoadLocal(counter));
    if let Some(offset) = offset {
        code.emit(LoadLocal(offset));
        code.emit(Arith(ArithOp::Add, Width::U32));
    }
    code.emit(LoadLocal(source));
    code.emit(LoadLocal(counter));
    code.emit(Index);
    code.emit(Fill);
    code.emit(StoreLocal(target));
    increment(code, counter);
    code.jump(head, false);
    code.bind(end);
}

/// One step of an assignable path, with index expressions already
/// evaluated into local temporaries.
#[derive(Debug, Clone, Copy)]
enum PathStep {
    Field(usize),
    Index(usize),
}

struct FunctionEmitter<'a> {
    program: &'a TypedProgram,
    layout: &'a ThisLayout,
    index_of: &'a HashMap<FunctionId, usize>,
    code: &'a mut Code,
    routines: &'a mut Vec<Routine>,
    frame_size: usize,
    /// `Return` instructions waiting for the final frame size.
    returns: Vec<usize>,
}

impl<'a> FunctionEmitter<'a> {
    fn new(
        program: &'a TypedProgram,
        layout: &'a ThisLayout,
        index_of: &'a HashMap<FunctionId, usize>,
        code: &'a mut Code,
        routines: &'a mut Vec<Routine>,
        frame_size: usize,
    ) -> Self {
        Self {
            program,
            layout,
            index_of,
            code,
            routines,
            frame_size,
            returns: Vec::new(),
        }
    }

    fn emit(&mut self, instruction: Instruction) {
        self.code.emit(instruction);
    }

    fn temp(&mut self) -> usize {
        self.frame_size += 1;
        self.frame_size - 1
    }

    fn ret(&mut self) {
        self.returns.push(self.code.instructions.len());
        self.emit(Instruction::Return { frame: 0 });
    }

    /// Patches every `Return` with the final frame size and returns it.
    fn finish(self) -> usize {
        for &at in &self.returns {
            if let Some(Instruction::Return { frame }) = self.code.instructions.get_mut(at) {
                *frame = self.frame_size;
            }
        }
        self.frame_size
    }

    /// Calls a built-in routine, requesting its emission.
    fn call_routine(&mut self, routine: Routine) {
        let position = match self.routines.iter().position(|r| *r == routine) {
            Some(position) => position,
            None => {
                self.routines.push(routine);
                self.routines.len() - 1
            }
        };
        let function = self.index_of.len() + position;
        self.code.call(function, routine.arity());
    }

    /// Loads public fields and arguments, runs the entry point and publishes
    /// its result and the final public fields.
    fn bootstrap(&mut self, public_fields: &[usize], argc: usize) {
        let fields = self.layout.fields();
        let nodes: Vec<usize> = public_fields
            .iter()
            .filter_map(|&index| fields.get(index).copied())
            .collect();
        for (k, &node) in nodes.iter().enumerate() {
            self.emit(Instruction::Input(k));
            self.spread(node);
        }
        for i in 0..argc {
            self.emit(Instruction::Input(nodes.len() + i));
        }
        self.code.call(0, argc);
        self.emit(Instruction::Output(OutputTag::Result, 0));
        for (k, &node) in nodes.iter().enumerate() {
            self.load_node(node);
            self.emit(Instruction::Output(OutputTag::Field, k));
        }
        self.emit(Instruction::Halt);
    }

    fn block(&mut self, body: &[TStmt]) {
        for stmt in body {
            self.stmt(stmt);
        }
    }

    fn stmt(&mut self, stmt: &TStmt) {
        match &stmt.kind {
            TStmtKind::Let { local, value } => {
                self.expr(value);
                self.emit(Instruction::StoreLocal(local.0));
            }
            TStmtKind::Assign { place, value } => {
                let steps = self.index_temps(place);
                self.expr(value);
                self.store_place(place, &steps);
            }
            TStmtKind::Push { place, value } => {
                let steps = self.index_temps(place);
                self.load_place(place, &steps);
                self.expr(value);
                self.call_routine(Routine::Push);
                self.store_place(place, &steps);
            }
            TStmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                let otherwise = self.code.new_label();
                let end = self.code.new_label();
                self.expr(cond);
                self.code.jump(otherwise, true);
                self.block(then_body);
                self.code.jump(end, false);
                self.code.bind(otherwise);
                self.block(else_body);
                self.code.bind(end);
            }
            TStmtKind::While { cond, body } => {
                let start = self.code.new_label();
                let end = self.code.new_label();
                self.code.bind(start);
                self.expr(cond);
                self.code.jump(end, true);
                self.block(body);
                self.code.jump(start, false);
                self.code.bind(end);
            }
            TStmtKind::Return(value) => {
                match value {
                    Some(value) => self.expr(value),
                    None => self.emit(Instruction::Push(Literal::Null)),
                }
                self.ret();
            }
            TStmtKind::Log(value) => {
                self.expr(value);
                self.emit(Instruction::Log(value_type(self.program, &value.ty)));
            }
            TStmtKind::RequireAuth(value) => {
                self.expr(value);
                self.emit(Instruction::RequireAuth);
            }
            TStmtKind::SelfDestruct => self.emit(Instruction::SelfDestruct),
            TStmtKind::Expr(value) => {
                self.expr(value);
                self.emit(Instruction::Pop);
            }
        }
    }

    /// Evaluates every index of `place` once, in order, into temporaries.
    fn index_temps(&mut self, place: &Place) -> Vec<PathStep> {
        place
            .path
            .iter()
            .map(|step| match step {
                PlaceStep::Index(index) => {
                    self.expr(index);
                    let temp = self.temp();
                    self.emit(Instruction::StoreLocal(temp));
                    PathStep::Index(temp)
                }
                PlaceStep::Field(index) => PathStep::Field(*index),
            })
            .collect()
    }

    /// Follows leading field steps of a `this` place through the layout.
    /// Returns the node reached and the number of steps consumed.
    fn this_prefix(&self, steps: &[PathStep]) -> (usize, usize) {
        let mut node = ThisLayout::ROOT;
        let mut consumed = 0;
        for step in steps {
            match step {
                PathStep::Field(index) if self.layout.nodes[node].is_record() => {
                    node = self.layout.nodes[node].children[*index];
                    consumed += 1;
                }
                _ => break,
            }
        }
        (node, consumed)
    }

    /// `[] -> [value]` for a layout node, rebuilding records from their
    /// leaf slots.
    fn load_node(&mut self, node: usize) {
        let layout = self.layout;
        let entry = &layout.nodes[node];
        if !entry.is_record() {
            self.emit(Instruction::LoadField(entry.first_slot));
            return;
        }
        self.code.push_u32(entry.children.len());
        self.emit(Instruction::Alloc(Kind::Object));
        for (j, &child) in entry.children.iter().enumerate() {
            self.code.push_u32(j);
            self.load_node(child);
            self.emit(Instruction::Fill);
        }
        self.emit(Instruction::Seal);
    }

    /// `[value] -> []`, writing every leaf of a record to its slot.
    fn spread(&mut self, node: usize) {
        let layout = self.layout;
        let entry = &layout.nodes[node];
        if !entry.is_record() {
            self.emit(Instruction::StoreField(entry.first_slot));
            return;
        }
        let Some(last) = entry.children.len().checked_sub(1) else {
            self.emit(Instruction::Pop);
            return;
        };
        for (j, &child) in entry.children.iter().enumerate() {
            if j < last {
                self.emit(Instruction::Dup);
            }
            self.code.push_u32(j);
            self.emit(Instruction::Index);
            self.spread(child);
        }
    }

    /// `[container] -> [item]`
    fn get_step(&mut self, step: PathStep) {
        match step {
            PathStep::Field(index) => self.code.push_u32(index),
            PathStep::Index(temp) => self.emit(Instruction::LoadLocal(temp)),
        }
        self.emit(Instruction::Index);
    }

    /// `[container] -> [container']` with the item at `step` replaced by the
    /// value of local `child`.
    fn set_step(&mut self, step: PathStep, child: usize) {
        let kind = match step {
            PathStep::Field(index) => {
                self.code.push_u32(index);
                Kind::Object
            }
            PathStep::Index(temp) => {
                self.emit(Instruction::LoadLocal(temp));
                Kind::Array
            }
        };
        self.emit(Instruction::LoadLocal(child));
        self.call_routine(Routine::Set(kind));
    }

    fn load_place(&mut self, place: &Place, steps: &[PathStep]) {
        let start = match place.root {
            PlaceRoot::Local(local) => {
                self.emit(Instruction::LoadLocal(local.0));
                0
            }
            PlaceRoot::This => {
                let (node, consumed) = self.this_prefix(steps);
                self.load_node(node);
                consumed
            }
        };
        for &step in &steps[start..] {
            self.get_step(step);
        }
    }

    /// Stores the value on top of the stack into `place`.
    fn store_place(&mut self, place: &Place, steps: &[PathStep]) {
        match place.root {
            PlaceRoot::Local(local) if steps.is_empty() => {
                self.emit(Instruction::StoreLocal(local.0));
            }
            PlaceRoot::Local(local) => {
                let value = self.temp();
                self.emit(Instruction::StoreLocal(value));
                self.emit(Instruction::LoadLocal(local.0));
                self.update(steps, value);
                self.emit(Instruction::StoreLocal(local.0));
            }
            PlaceRoot::This => {
                let (node, consumed) = self.this_prefix(steps);
                if consumed == steps.len() {
                    self.spread(node);
                } else {
                    let slot = self.layout.nodes[node].first_slot;
                    let value = self.temp();
                    self.emit(Instruction::StoreLocal(value));
                    self.emit(Instruction::LoadField(slot));
                    self.update(&steps[consumed..], value);
                    self.emit(Instruction::StoreField(slot));
                }
            }
        }
    }

    /// `[container] -> [container']` with the value held in local `value`
    /// written at `steps`.
    fn update(&mut self, steps: &[PathStep], value: usize) {
        let Some((&step, rest)) = steps.split_first() else {
            return;
        };
        let child = if rest.is_empty() {
            value
        } else {
            self.emit(Instruction::Dup);
            self.get_step(step);
            self.update(rest, value);
            let child = self.temp();
            self.emit(Instruction::StoreLocal(child));
            child
        };
        self.set_step(step, child);
    }

    /// Layout node of a `this.a.b` chain, if `expr` is one.
    fn this_node(&self, expr: &TExpr) -> Option<usize> {
        match &expr.kind {
            TExprKind::This => Some(ThisLayout::ROOT),
            TExprKind::Field { object, index } => {
                let parent = self.this_node(object)?;
                self.layout.nodes.get(parent)?.children.get(*index).copied()
            }
            _ => None,
        }
    }

    fn width(ty: &Type) -> Width {
        match ty {
            Type::UInt(width) => *width,
            _ => Width::U32,
        }
    }

    fn expr(&mut self, expr: &TExpr) {
        if let Some(node) = self.this_node(expr) {
            self.load_node(node);
            return;
        }
        match &expr.kind {
            TExprKind::UInt(value) => self.emit(Instruction::Push(Literal::UInt(
                Self::width(&expr.ty),
                *value,
            ))),
            TExprKind::Str(value) => self.emit(Instruction::Push(Literal::String(value.clone()))),
            TExprKind::Bool(value) => self.emit(Instruction::Push(Literal::Boolean(*value))),
            TExprKind::Array(items) => {
                self.code.push_u32(items.len());
                self.emit(Instruction::Alloc(Kind::Array));
                for (j, item) in items.iter().enumerate() {
                    self.code.push_u32(j);
                    self.expr(item);
                    self.emit(Instruction::Fill);
                }
                self.emit(Instruction::Seal);
            }
            TExprKind::Local(local) => self.emit(Instruction::LoadLocal(local.0)),
            TExprKind::This => self.load_node(ThisLayout::ROOT),
            TExprKind::Field { object, index } => {
                self.expr(object);
                self.code.push_u32(*index);
                self.emit(Instruction::Index);
            }
            TExprKind::Index { array, index } => {
                self.expr(array);
                self.expr(index);
                self.emit(Instruction::Index);
            }
            TExprKind::Length(inner) => {
                self.expr(inner);
                let kind = match inner.ty {
                    Type::String => Kind::String,
                    _ => Kind::Array,
                };
                self.emit(Instruction::Length(kind));
            }
            TExprKind::Not(inner) => {
                self.expr(inner);
                self.emit(Instruction::Not);
            }
            TExprKind::Binary { op, lhs, rhs } => self.binary(*op, lhs, rhs),
            TExprKind::Concat(lhs, rhs) => {
                self.expr(lhs);
                self.expr(rhs);
                self.call_routine(Routine::Concat);
            }
            TExprKind::Wrapping { op, lhs, rhs } => {
                self.expr(lhs);
                self.expr(rhs);
                self.emit(Instruction::Wrapping((*op).into(), Self::width(&expr.ty)));
            }
            TExprKind::Call { function, args } => {
                args.iter().for_each(|arg| self.expr(arg));
                self.code.call(self.index_of[function], args.len());
            }
            TExprKind::CheckAuth(inner) => {
                self.expr(inner);
                self.emit(Instruction::CheckAuth);
            }
        }
    }

    fn binary(&mut self, op: BinaryOp, lhs: &TExpr, rhs: &TExpr) {
        match op {
            BinaryOp::And | BinaryOp::Or => {
                // Short circuit: the left value stays on the stack when it
                // decides the result.
                let end = self.code.new_label();
                self.expr(lhs);
                self.emit(Instruction::Dup);
                if op == BinaryOp::Or {
                    self.emit(Instruction::Not);
                }
                self.code.jump(end, true);
                self.emit(Instruction::Pop);
                self.expr(rhs);
                self.code.bind(end);
            }
            _ => {
                self.expr(lhs);
                self.expr(rhs);
                if let Some(compare) = CompareOp::from_binary(op) {
                    self.emit(Instruction::Compare(compare));
                } else if let Some(arith) = ArithOp::from_binary(op) {
                    self.emit(Instruction::Arith(arith, Self::width(&lhs.ty)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::{parse, resolve};

    fn compile(source: &str, contract: Option<&str>, entry: &str) -> CompiledProgram {
        let typed = resolve(&parse(source).unwrap()).unwrap();
        generate(&typed, contract, entry).unwrap()
    }

    const CITY: &str = "
        contract City {
            id: string;
            name: string;
            country: Country;

            constructor(id: string, name: string, country: Country) {
                this.id = id;
                this.name = name;
                this.country = country;
            }
        }

        contract Country {
            id: string;
            name: string;
        }
    ";

    #[test]
    fn test_nested_layout_is_flattened() {
        let program = compile(CITY, Some("City"), "constructor");
        let layout = &program.layout;
        assert_eq!(layout.slot_count, 4);
        let country = layout.fields()[2];
        assert_eq!(layout.nodes[country].first_slot, 2);
        assert_eq!(layout.nodes[country].slot_count, 2);
        // Assigning the record spreads it over the two leaf slots.
        assert!(program.instructions.contains(&Instruction::StoreField(2)));
        assert!(program.instructions.contains(&Instruction::StoreField(3)));
        assert_eq!(program.public_fields, vec![0, 1, 2]);
    }

    #[test]
    fn test_bootstrap_reads_inputs_and_writes_outputs() {
        let program = compile(CITY, Some("City"), "constructor");
        let code = &program.instructions;
        assert_eq!(code[0], Instruction::Input(0));
        let entry = program.functions[program.entry].entry;
        let call = code
            .iter()
            .position(|i| matches!(i, Instruction::Call { entry: e, argc: 3, .. } if *e == entry))
            .unwrap();
        assert!(code[..call].contains(&Instruction::Input(5)));
        assert_eq!(code[call + 1], Instruction::Output(OutputTag::Result, 0));
        assert_eq!(code[entry - 1], Instruction::Halt);
        let outputs: Vec<_> = code[..entry]
            .iter()
            .filter(|i| matches!(i, Instruction::Output(OutputTag::Field, _)))
            .collect();
        assert_eq!(outputs.len(), 3);
    }

    #[test]
    fn test_unknown_entry() {
        let typed = resolve(&parse(CITY).unwrap()).unwrap();
        assert!(matches!(
            generate(&typed, Some("City"), "missing"),
            Err(CompileError::UnknownEntry(_))
        ));
        assert!(matches!(
            generate(&typed, Some("Town"), "constructor"),
            Err(CompileError::UnknownEntry(_))
        ));
        assert!(matches!(
            generate(&typed, None, "main"),
            Err(CompileError::UnknownEntry(_))
        ));
    }

    #[test]
    fn test_dead_field_read_leaves_public_layout() {
        let with_log = compile(
            "contract Account { id: string; function main() { let x = this.id; log(x); } }",
            Some("Account"),
            "main",
        );
        let without_log = compile(
            "contract Account { id: string; function main() { let x = this.id; } }",
            Some("Account"),
            "main",
        );
        assert_eq!(with_log.public_field_names(), vec!["id".to_string()]);
        assert!(without_log.public_fields.is_empty());
        assert!(!without_log.instructions.contains(&Instruction::LoadField(0)));
    }

    #[test]
    fn test_jumps_and_calls_are_resolved() {
        let program = compile(
            "function main(n: u32): string {
                let s: string = '';
                let i: u32 = 0;
                while (i < n) { s = s + 'a'; i = i + 1; }
                return s;
            }",
            None,
            "main",
        );
        let len = program.instructions.len();
        for instruction in &program.instructions {
            match instruction {
                Instruction::Jump(target) | Instruction::JumpIfFalse(target) => {
                    assert!(*target < len)
                }
                Instruction::Call { entry, frame, .. } => {
                    let function = program
                        .functions
                        .iter()
                        .find(|f| f.entry == *entry)
                        .unwrap();
                    assert_eq!(*frame, function.frame_size);
                }
                _ => {}
            }
        }
    }

    #[test]
    fn test_only_needed_routines_are_emitted() {
        let program = compile(
            "function unused(): u32 { return 1; }
             function helper(a: u32): u32 { return a + 1; }
             function main(a: u32): u32 { return helper(a); }",
            None,
            "main",
        );
        let names: Vec<_> = program.functions.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["main", "helper"]);

        let program = compile(
            "function main(xs: u32[], s: string): u32[] {
                xs[0] = 1;
                xs.push(2);
                log(s + '!');
                return xs;
            }",
            None,
            "main",
        );
        let names: Vec<_> = program.functions.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["main", "set_index", "push", "concat"]);
    }
}
