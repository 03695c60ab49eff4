//! Liveness-based dead code elimination over typed function bodies.
//!
//! Roots are `return`, `log`, authorization checks, `selfdestruct`, writes
//! to `this`, loops and anything that may trap or contains a call. Loops are
//! kept whole: their iteration count shows in the cycle count. A write to a
//! local survives only if the local is read by surviving code. Liveness of
//! locals is computed per function, flow-insensitively, to a fixpoint.

use std::collections::BTreeSet;

use crate::lang::typed::{FunctionDef, Place, PlaceRoot, TExpr, TExprKind, TStmt, TStmtKind};

type LiveSet = BTreeSet<usize>;

/// Returns the body of `function` with every dead statement removed.
pub fn prune(function: &FunctionDef) -> Vec<TStmt> {
    let mut live = LiveSet::new();
    loop {
        let before = live.len();
        mark(&function.body, &mut live);
        if live.len() == before {
            break;
        }
    }
    filter(&function.body, &live)
}

fn mark(stmts: &[TStmt], live: &mut LiveSet) {
    for stmt in stmts {
        match &stmt.kind {
            TStmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                mark(then_body, live);
                mark(else_body, live);
                if is_live(stmt, live) {
                    reads(cond, live);
                }
            }
            TStmtKind::While { cond, body } => {
                reads(cond, live);
                block_reads(body, live);
            }
            _ => {
                if is_live(stmt, live) {
                    stmt_reads(stmt, live);
                }
            }
        }
    }
}

fn is_live(stmt: &TStmt, live: &LiveSet) -> bool {
    match &stmt.kind {
        TStmtKind::Let { local, value } => live.contains(&local.0) || value.has_effects(),
        TStmtKind::Assign { place, value } | TStmtKind::Push { place, value } => {
            let target_live = match place.root {
                PlaceRoot::This => true,
                PlaceRoot::Local(local) => live.contains(&local.0),
            };
            // Index steps trap when out of bounds.
            target_live || value.has_effects() || place.index_exprs().next().is_some()
        }
        TStmtKind::If {
            cond,
            then_body,
            else_body,
        } => {
            cond.has_effects()
                || then_body.iter().any(|s| is_live(s, live))
                || else_body.iter().any(|s| is_live(s, live))
        }
        TStmtKind::While { .. }
        | TStmtKind::Return(_)
        | TStmtKind::Log(_)
        | TStmtKind::RequireAuth(_)
        | TStmtKind::SelfDestruct => true,
        TStmtKind::Expr(expr) => expr.has_effects(),
    }
}

fn reads(expr: &TExpr, live: &mut LiveSet) {
    expr.walk(&mut |expr| {
        if let TExprKind::Local(local) = expr.kind {
            live.insert(local.0);
        }
    });
}

fn place_reads(place: &Place, live: &mut LiveSet) {
    place.index_exprs().for_each(|index| reads(index, live));
    // Partial updates read the old value of the root.
    if let PlaceRoot::Local(local) = place.root {
        if !place.path.is_empty() {
            live.insert(local.0);
        }
    }
}

fn stmt_reads(stmt: &TStmt, live: &mut LiveSet) {
    match &stmt.kind {
        TStmtKind::Let { value, .. } | TStmtKind::Log(value) | TStmtKind::RequireAuth(value) => {
            reads(value, live)
        }
        TStmtKind::Expr(value) => reads(value, live),
        TStmtKind::Assign { place, value } => {
            place_reads(place, live);
            reads(value, live);
        }
        TStmtKind::Push { place, value } => {
            place_reads(place, live);
            if let PlaceRoot::Local(local) = place.root {
                live.insert(local.0);
            }
            reads(value, live);
        }
        TStmtKind::Return(value) => {
            if let Some(value) = value {
                reads(value, live);
            }
        }
        TStmtKind::If { cond, .. } | TStmtKind::While { cond, .. } => reads(cond, live),
        TStmtKind::SelfDestruct => {}
    }
}

/// Every read of a block that is emitted unfiltered.
fn block_reads(stmts: &[TStmt], live: &mut LiveSet) {
    for stmt in stmts {
        stmt_reads(stmt, live);
        match &stmt.kind {
            TStmtKind::If {
                then_body,
                else_body,
                ..
            } => {
                block_reads(then_body, live);
                block_reads(else_body, live);
            }
            TStmtKind::While { body, .. } => block_reads(body, live),
            _ => {}
        }
    }
}

fn filter(stmts: &[TStmt], live: &LiveSet) -> Vec<TStmt> {
    stmts
        .iter()
        .filter(|stmt| is_live(stmt, live))
        .map(|stmt| {
            let kind = match &stmt.kind {
                TStmtKind::If {
                    cond,
                    then_body,
                    else_body,
                } => TStmtKind::If {
                    cond: cond.clone(),
                    then_body: filter(then_body, live),
                    else_body: filter(else_body, live),
                },
                other => other.clone(),
            };
            TStmt {
                kind,
                span: stmt.span,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::{parse, resolve};

    fn pruned(source: &str) -> Vec<TStmt> {
        let program = resolve(&parse(source).unwrap()).unwrap();
        prune(&program.functions[0])
    }

    #[test]
    fn test_unused_field_read_is_removed() {
        let body = pruned("contract Account { id: string; function main() { let x = this.id; } }");
        assert!(body.is_empty());
    }

    #[test]
    fn test_logged_field_read_is_kept() {
        let body = pruned(
            "contract Account { id: string; function main() { let x = this.id; log(x); } }",
        );
        assert_eq!(body.len(), 2);
    }

    #[test]
    fn test_loop_in_void_function_is_kept_whole() {
        let body = pruned(
            "function main(p: u32, a: u32, b: u32) {
                for (let i: u32 = 0; i < p; i++) {
                    let c = a.wrappingAdd(b);
                    a = b;
                    b = c;
                }
            }",
        );
        assert_eq!(body.len(), 2);
        let TStmtKind::While { body: loop_body, .. } = &body[1].kind else {
            panic!("expected the loop to survive");
        };
        // `let c`, both swaps and the increment.
        assert_eq!(loop_body.len(), 4);
    }

    #[test]
    fn test_trapping_arithmetic_is_kept() {
        let body = pruned("function main(a: u32): u32 { let x: u32 = a + 1; return a; }");
        assert_eq!(body.len(), 2);
        let body = pruned("function main(a: u32): u32 { let x: u32 = a.wrappingAdd(1); return a; }");
        assert_eq!(body.len(), 1);
        let body = pruned("function main(xs: u32[]): u32 { let x = xs[3]; return 0; }");
        assert_eq!(body.len(), 2);
    }

    #[test]
    fn test_loop_feeding_return_is_kept() {
        let body = pruned(
            "function main(p: u32, a: u32, b: u32): u32 {
                let unused: u32 = 7;
                for (let i: u32 = 0; i < p; i++) {
                    let c = a.wrappingAdd(b);
                    a = b;
                    b = c;
                }
                return b;
            }",
        );
        // `unused` goes, `let i`, the loop and the return stay.
        assert_eq!(body.len(), 3);
        let TStmtKind::While { body: loop_body, .. } = &body[1].kind else {
            panic!("expected the loop to survive");
        };
        assert_eq!(loop_body.len(), 4);
    }

    #[test]
    fn test_push_keeps_array_alive() {
        let body = pruned(
            "function main(): u32[] {
                let out: u32[] = [];
                out.push(1);
                return out;
            }",
        );
        assert_eq!(body.len(), 3);
    }

    #[test]
    fn test_check_auth_is_a_root() {
        let body = pruned("function main(a: boolean) { let ok = checkAuth(a); }");
        assert_eq!(body.len(), 1);
    }
}
