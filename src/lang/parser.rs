//! PEG parser (`grammar.pest`) and Pratt-based expression builder.

use once_cell::sync::Lazy;
use pest::Parser;
use pest::error::LineColLocation;
use pest::iterators::Pair;
use pest::pratt_parser::{Assoc, Op, PrattParser};

use super::ast::*;
use crate::error::{Span, SyntaxError};

#[derive(pest_derive::Parser)]
#[grammar = "lang/grammar.pest"]
struct ContractParser;

static PRATT: Lazy<PrattParser<Rule>> = Lazy::new(|| {
    PrattParser::new()
        .op(Op::infix(Rule::or_op, Assoc::Left))
        .op(Op::infix(Rule::and_op, Assoc::Left))
        .op(Op::infix(Rule::eq_op, Assoc::Left) | Op::infix(Rule::ne_op, Assoc::Left))
        .op(Op::infix(Rule::lt_op, Assoc::Left)
            | Op::infix(Rule::le_op, Assoc::Left)
            | Op::infix(Rule::gt_op, Assoc::Left)
            | Op::infix(Rule::ge_op, Assoc::Left))
        .op(Op::infix(Rule::add_op, Assoc::Left) | Op::infix(Rule::sub_op, Assoc::Left))
        .op(Op::infix(Rule::mul_op, Assoc::Left)
            | Op::infix(Rule::div_op, Assoc::Left)
            | Op::infix(Rule::rem_op, Assoc::Left))
        .op(Op::prefix(Rule::not_op) | Op::prefix(Rule::neg_op))
        .op(Op::postfix(Rule::member) | Op::postfix(Rule::call) | Op::postfix(Rule::index))
});

type ParseResult<T> = Result<T, SyntaxError>;

/// Parses a whole source unit.
pub fn parse(source: &str) -> ParseResult<Program> {
    let mut pairs = ContractParser::parse(Rule::program, source).map_err(from_pest)?;
    let program = pairs
        .next()
        .ok_or_else(|| error_at(Span::new(1, 1), "empty input"))?;

    let mut items = Vec::new();
    for pair in children(program) {
        match pair.as_rule() {
            Rule::contract => items.push(Item::Contract(parse_contract(pair)?)),
            Rule::function => items.push(Item::Function(parse_function(pair)?)),
            Rule::EOI => {}
            rule => return Err(unexpected(&pair, rule)),
        }
    }
    Ok(Program { items })
}

/// Parses a single expression; used by tests and diagnostics.
pub fn parse_expression(source: &str) -> ParseResult<Expr> {
    let mut pairs = ContractParser::parse(Rule::expr, source).map_err(from_pest)?;
    let pair = pairs
        .next()
        .ok_or_else(|| error_at(Span::new(1, 1), "expected an expression"))?;
    if pair.as_str().len() != source.trim_end().len() {
        let span = Span::new(1, pair.as_str().len() + 1);
        return Err(error_at(span, "unexpected trailing input"));
    }
    parse_expr(pair)
}

fn from_pest(err: pest::error::Error<Rule>) -> SyntaxError {
    let (line, column) = match err.line_col {
        LineColLocation::Pos(pos) => pos,
        LineColLocation::Span(start, _) => start,
    };
    SyntaxError {
        line,
        column,
        message: err.variant.message().into_owned(),
    }
}

fn error_at(span: Span, message: impl Into<String>) -> SyntaxError {
    SyntaxError {
        line: span.line,
        column: span.column,
        message: message.into(),
    }
}

fn unexpected(pair: &Pair<'_, Rule>, rule: Rule) -> SyntaxError {
    error_at(span_of(pair), format!("unexpected {rule:?}"))
}

fn span_of(pair: &Pair<'_, Rule>) -> Span {
    let (line, column) = pair.as_span().start_pos().line_col();
    Span::new(line, column)
}

/// Inner pairs with keyword tokens removed.
fn children<'a>(pair: Pair<'a, Rule>) -> impl Iterator<Item = Pair<'a, Rule>> {
    pair.into_inner().filter(|p| {
        !matches!(
            p.as_rule(),
            Rule::kw_contract
                | Rule::kw_function
                | Rule::kw_constructor
                | Rule::kw_let
                | Rule::kw_if
                | Rule::kw_else
                | Rule::kw_while
                | Rule::kw_for
                | Rule::kw_return
        )
    })
}

fn next_inner<'a>(
    inner: &mut impl Iterator<Item = Pair<'a, Rule>>,
    span: Span,
    what: &str,
) -> ParseResult<Pair<'a, Rule>> {
    inner
        .next()
        .ok_or_else(|| error_at(span, format!("expected {what}")))
}

fn parse_contract(pair: Pair<'_, Rule>) -> ParseResult<Contract> {
    let span = span_of(&pair);
    let mut inner = children(pair);
    let name = next_inner(&mut inner, span, "contract name")?.as_str().to_string();

    let mut contract = Contract {
        name,
        fields: Vec::new(),
        constructor: None,
        methods: Vec::new(),
        span,
    };

    for item in inner {
        match item.as_rule() {
            Rule::field => {
                let field_span = span_of(&item);
                let mut parts = children(item);
                let name = next_inner(&mut parts, field_span, "field name")?.as_str().to_string();
                let type_ = parse_type(next_inner(&mut parts, field_span, "field type")?)?;
                contract.fields.push(Field {
                    name,
                    type_,
                    span: field_span,
                });
            }
            Rule::constructor => {
                let ctor_span = span_of(&item);
                if contract.constructor.is_some() {
                    return Err(error_at(ctor_span, "a contract may declare only one constructor"));
                }
                let mut parts = children(item);
                let params = parse_params(next_inner(&mut parts, ctor_span, "parameters")?)?;
                let body = parse_block(next_inner(&mut parts, ctor_span, "constructor body")?)?;
                contract.constructor = Some(Function {
                    name: "constructor".to_string(),
                    params,
                    return_type: None,
                    body,
                    span: ctor_span,
                });
            }
            Rule::function => contract.methods.push(parse_function(item)?),
            rule => return Err(unexpected(&item, rule)),
        }
    }

    Ok(contract)
}

fn parse_function(pair: Pair<'_, Rule>) -> ParseResult<Function> {
    let span = span_of(&pair);
    let mut inner = children(pair);
    let name = next_inner(&mut inner, span, "function name")?.as_str().to_string();
    let params = parse_params(next_inner(&mut inner, span, "parameters")?)?;

    let mut return_type = None;
    let mut next = next_inner(&mut inner, span, "function body")?;
    if next.as_rule() == Rule::return_type {
        let ty = next_inner(&mut children(next), span, "return type")?;
        return_type = Some(parse_type(ty)?);
        next = next_inner(&mut inner, span, "function body")?;
    }
    let body = parse_block(next)?;

    Ok(Function {
        name,
        params,
        return_type,
        body,
        span,
    })
}

fn parse_params(pair: Pair<'_, Rule>) -> ParseResult<Vec<Param>> {
    children(pair)
        .map(|param| {
            let span = span_of(&param);
            let mut parts = children(param);
            let name = next_inner(&mut parts, span, "parameter name")?.as_str().to_string();
            let type_ = parse_type(next_inner(&mut parts, span, "parameter type")?)?;
            Ok(Param { name, type_, span })
        })
        .collect()
}

fn parse_type(pair: Pair<'_, Rule>) -> ParseResult<TypeExpr> {
    let span = span_of(&pair);
    let mut inner = children(pair);
    let name = next_inner(&mut inner, span, "type name")?.as_str().to_string();
    let mut ty = TypeExpr::Named(name, span);
    for _ in inner {
        ty = TypeExpr::Array(Box::new(ty));
    }
    Ok(ty)
}

fn parse_block(pair: Pair<'_, Rule>) -> ParseResult<Vec<Stmt>> {
    children(pair).map(parse_stmt).collect()
}

fn parse_stmt(pair: Pair<'_, Rule>) -> ParseResult<Stmt> {
    let span = span_of(&pair);
    let kind = match pair.as_rule() {
        Rule::let_decl => {
            let mut inner = children(pair);
            let name = next_inner(&mut inner, span, "variable name")?.as_str().to_string();
            let mut next = next_inner(&mut inner, span, "initializer")?;
            let mut type_ = None;
            if next.as_rule() == Rule::type_expr {
                type_ = Some(parse_type(next)?);
                next = next_inner(&mut inner, span, "initializer")?;
            }
            StmtKind::Let {
                name,
                type_,
                value: parse_expr(next)?,
            }
        }
        Rule::assign_stmt => {
            let mut inner = children(pair);
            let target = parse_expr(next_inner(&mut inner, span, "assignment target")?)?;
            let op = match next_inner(&mut inner, span, "assignment operator")?.as_str() {
                "+=" => AssignOp::Add,
                "-=" => AssignOp::Sub,
                _ => AssignOp::Set,
            };
            let value = parse_expr(next_inner(&mut inner, span, "assigned value")?)?;
            StmtKind::Assign { target, op, value }
        }
        Rule::incdec_stmt => {
            let mut inner = children(pair);
            let target = parse_expr(next_inner(&mut inner, span, "increment target")?)?;
            let op = match next_inner(&mut inner, span, "`++` or `--`")?.as_str() {
                "++" => AssignOp::Add,
                _ => AssignOp::Sub,
            };
            let one = Expr {
                kind: ExprKind::Number(1),
                span,
            };
            StmtKind::Assign {
                target,
                op,
                value: one,
            }
        }
        Rule::expr_stmt => {
            let expr = next_inner(&mut children(pair), span, "expression")?;
            StmtKind::Expr(parse_expr(expr)?)
        }
        Rule::if_stmt => {
            let mut inner = children(pair);
            let cond = parse_expr(next_inner(&mut inner, span, "condition")?)?;
            let then_branch = Box::new(parse_stmt(next_inner(&mut inner, span, "statement")?)?);
            let else_branch = inner.next().map(parse_stmt).transpose()?.map(Box::new);
            StmtKind::If {
                cond,
                then_branch,
                else_branch,
            }
        }
        Rule::while_stmt => {
            let mut inner = children(pair);
            let cond = parse_expr(next_inner(&mut inner, span, "condition")?)?;
            let body = parse_block(next_inner(&mut inner, span, "loop body")?)?;
            StmtKind::While { cond, body }
        }
        Rule::for_stmt => {
            let mut inner = children(pair);
            let init = next_inner(&mut inner, span, "loop initializer")?
                .into_inner()
                .next()
                .map(parse_stmt)
                .transpose()?
                .map(Box::new);
            let cond = next_inner(&mut inner, span, "loop condition")?
                .into_inner()
                .next()
                .map(parse_expr)
                .transpose()?;
            let step = next_inner(&mut inner, span, "loop step")?
                .into_inner()
                .next()
                .map(parse_stmt)
                .transpose()?
                .map(Box::new);
            let body = parse_block(next_inner(&mut inner, span, "loop body")?)?;
            StmtKind::For {
                init,
                cond,
                step,
                body,
            }
        }
        Rule::return_stmt => {
            let value = children(pair).next().map(parse_expr).transpose()?;
            StmtKind::Return(value)
        }
        Rule::block => StmtKind::Block(parse_block(pair)?),
        rule => return Err(unexpected(&pair, rule)),
    };
    Ok(Stmt { kind, span })
}

fn parse_expr(pair: Pair<'_, Rule>) -> ParseResult<Expr> {
    PRATT
        .map_primary(parse_primary)
        .map_prefix(|op, operand| {
            let operand = operand?;
            let op_kind = match op.as_rule() {
                Rule::not_op => UnaryOp::Not,
                _ => UnaryOp::Neg,
            };
            Ok(Expr {
                span: span_of(&op),
                kind: ExprKind::Unary {
                    op: op_kind,
                    operand: Box::new(operand),
                },
            })
        })
        .map_postfix(|object, op| {
            let object = object?;
            let span = object.span;
            let kind = match op.as_rule() {
                Rule::member => {
                    let op_span = span_of(&op);
                    let name = next_inner(&mut children(op), op_span, "member name")?
                        .as_str()
                        .to_string();
                    ExprKind::Member {
                        object: Box::new(object),
                        name,
                    }
                }
                Rule::call => ExprKind::Call {
                    callee: Box::new(object),
                    args: children(op).map(parse_expr).collect::<ParseResult<_>>()?,
                },
                _ => {
                    let op_span = span_of(&op);
                    let index = parse_expr(next_inner(&mut children(op), op_span, "index")?)?;
                    ExprKind::Index {
                        object: Box::new(object),
                        index: Box::new(index),
                    }
                }
            };
            Ok(Expr { kind, span })
        })
        .map_infix(|lhs, op, rhs| {
            let lhs = lhs?;
            let rhs = rhs?;
            let op = match op.as_rule() {
                Rule::or_op => BinaryOp::Or,
                Rule::and_op => BinaryOp::And,
                Rule::eq_op => BinaryOp::Eq,
                Rule::ne_op => BinaryOp::Ne,
                Rule::lt_op => BinaryOp::Lt,
                Rule::le_op => BinaryOp::Le,
                Rule::gt_op => BinaryOp::Gt,
                Rule::ge_op => BinaryOp::Ge,
                Rule::add_op => BinaryOp::Add,
                Rule::sub_op => BinaryOp::Sub,
                Rule::mul_op => BinaryOp::Mul,
                Rule::div_op => BinaryOp::Div,
                _ => BinaryOp::Rem,
            };
            Ok(Expr {
                span: lhs.span,
                kind: ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
            })
        })
        .parse(pair.into_inner())
}

fn parse_primary(pair: Pair<'_, Rule>) -> ParseResult<Expr> {
    let span = span_of(&pair);
    let kind = match pair.as_rule() {
        Rule::number => {
            let value = pair
                .as_str()
                .parse::<u64>()
                .map_err(|_| error_at(span, "failed to parse number"))?;
            ExprKind::Number(value)
        }
        Rule::string => {
            let raw = next_inner(&mut children(pair), span, "string contents")?;
            ExprKind::String(unescape(raw.as_str()))
        }
        Rule::boolean => ExprKind::Bool(pair.as_str() == "true"),
        Rule::this_kw => ExprKind::This,
        Rule::ident => ExprKind::Ident(pair.as_str().to_string()),
        Rule::array_lit => {
            ExprKind::Array(children(pair).map(parse_expr).collect::<ParseResult<_>>()?)
        }
        Rule::expr => return parse_expr(pair),
        rule => return Err(unexpected(&pair, rule)),
    };
    Ok(Expr { kind, span })
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_contract() {
        let program = parse("contract Test {}").unwrap();
        assert_eq!(program.items.len(), 1);
        assert!(matches!(
            &program.items[0],
            Item::Contract(Contract { name, fields, constructor: None, methods, .. })
                if name == "Test" && fields.is_empty() && methods.is_empty()
        ));
    }

    #[test]
    fn test_contract_with_fields_and_methods() {
        let program = parse(
            "
            contract Account {
                id: string;
                balance: u64;
                tags: string[];

                constructor (id: string) {
                    this.id = id;
                }

                function deposit(amount: u64): u64 {
                    this.balance += amount;
                    return this.balance;
                }
            }
            ",
        )
        .unwrap();

        let Item::Contract(contract) = &program.items[0] else {
            panic!("expected contract");
        };
        assert_eq!(contract.fields.len(), 3);
        assert_eq!(contract.fields[1].name, "balance");
        assert_eq!(
            contract.fields[2].type_,
            TypeExpr::Array(Box::new(TypeExpr::Named("string".into(), Span::new(5, 23))))
        );
        assert!(contract.constructor.is_some());
        assert_eq!(contract.methods.len(), 1);
        assert_eq!(contract.methods[0].params.len(), 1);
        assert!(contract.methods[0].return_type.is_some());
        assert_eq!(contract.fields[0].span, Span::new(3, 17));
    }

    #[test]
    fn test_operator_precedence() {
        let expr = parse_expression("1 + 2 * 3 == 7 && !done").unwrap();
        let ExprKind::Binary { op: BinaryOp::And, lhs, rhs } = expr.kind else {
            panic!("expected &&");
        };
        assert!(matches!(rhs.kind, ExprKind::Unary { op: UnaryOp::Not, .. }));
        let ExprKind::Binary { op: BinaryOp::Eq, lhs: sum, .. } = lhs.kind else {
            panic!("expected ==");
        };
        let ExprKind::Binary { op: BinaryOp::Add, rhs: product, .. } = sum.kind else {
            panic!("expected +");
        };
        assert!(matches!(product.kind, ExprKind::Binary { op: BinaryOp::Mul, .. }));
    }

    #[test]
    fn test_postfix_chain() {
        let expr = parse_expression("this.elements[idx].wrappingAdd(b)").unwrap();
        let ExprKind::Call { callee, args } = expr.kind else {
            panic!("expected call");
        };
        assert_eq!(args.len(), 1);
        let ExprKind::Member { object, name } = callee.kind else {
            panic!("expected member");
        };
        assert_eq!(name, "wrappingAdd");
        assert!(matches!(object.kind, ExprKind::Index { .. }));
    }

    #[test]
    fn test_strings() {
        let single = parse_expression("'hello\" world'").unwrap();
        assert_eq!(single.kind, ExprKind::String("hello\" world".into()));
        let double = parse_expression("\"it's\\n\"").unwrap();
        assert_eq!(double.kind, ExprKind::String("it's\n".into()));
    }

    #[test]
    fn test_for_loop_and_increment() {
        let program = parse(
            "function main(p: u32) { for (let i: u32 = 0; i < p; i++) { log(i); } }",
        )
        .unwrap();
        let Item::Function(function) = &program.items[0] else {
            panic!("expected function");
        };
        let StmtKind::For { init, cond, step, body } = &function.body[0].kind else {
            panic!("expected for loop");
        };
        assert!(matches!(init.as_deref(), Some(Stmt { kind: StmtKind::Let { .. }, .. })));
        assert!(cond.is_some());
        assert!(matches!(
            step.as_deref(),
            Some(Stmt { kind: StmtKind::Assign { op: AssignOp::Add, .. }, .. })
        ));
        assert_eq!(body.len(), 1);
    }

    #[test]
    fn test_compound_assignment_is_not_an_operator() {
        let program = parse("function f(a: u32) { a += 2; a -= 1; a = a - 1; }").unwrap();
        let Item::Function(function) = &program.items[0] else {
            panic!("expected function");
        };
        let ops: Vec<_> = function
            .body
            .iter()
            .map(|stmt| match &stmt.kind {
                StmtKind::Assign { op, .. } => *op,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(ops, vec![AssignOp::Add, AssignOp::Sub, AssignOp::Set]);
    }

    #[test]
    fn test_syntax_error_location() {
        let err = parse("function main() {\n  let x = ;\n}").unwrap_err();
        assert_eq!(err.line, 2);
        assert_eq!(err.column, 11);
    }

    #[test]
    fn test_keywords_are_not_identifiers() {
        assert!(parse("function while() {}").is_err());
        assert!(parse("function whileLoop() {}").is_ok());
    }
}
