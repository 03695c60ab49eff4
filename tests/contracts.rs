#[cfg(test)]
mod tests {
    use serde_json::json;
    use toyni_contracts::error::{RuntimeErrorKind, TypeErrorKind};
    use toyni_contracts::{CompileError, Error, Program, Value, compile, init};
    use tracing_subscriber::EnvFilter;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        init();
    }

    fn runtime_error(
        program: &Program,
        this: serde_json::Value,
        args: serde_json::Value,
    ) -> RuntimeErrorKind {
        match program.run(&this, &args, false) {
            Err(Error::Runtime(err)) => err.kind,
            other => panic!("expected a runtime error, got {other:?}"),
        }
    }

    fn type_error(source: &str) -> TypeErrorKind {
        match compile(source, None, "main") {
            Err(CompileError::Type(err)) => err.kind,
            other => panic!("expected a type error, got {other:?}"),
        }
    }

    const REVERSE: &str = "
        contract ReverseArray {
            elements: number[];

            constructor (elements: number[]) {
                this.elements = elements;
            }

            function reverse(): number[] {
                let reversed: u32[] = [];
                let i: u32 = 0;
                let one: u32 = 1;
                let len: u32 = this.elements.length;

                while (i < len) {
                    let idx: u32 = len - i - one;
                    reversed.push(this.elements[idx]);
                    i = i + one;
                }

                return reversed;
            }
        }
    ";

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

            constructor (id: string, name: string) {
                this.id = id;
                this.name = name;
            }
        }
    ";

    const FIBONACCI: &str = "
        function main(p: u32, a: u32, b: u32): u32 {
            for (let i: u32 = 0; i < p; i++) {
                let c = a.wrappingAdd(b);
                a = b;
                b = c;
            }
            return b;
        }
    ";

    const VOID_FIBONACCI: &str = "
        function main(p: u32, a: u32, b: u32) {
            for (let i: u32 = 0; i < p; i++) {
                let c = a.wrappingAdd(b);
                a = b;
                b = c;
            }
        }
    ";

    #[test]
    fn test_free_function_logs_and_returns() {
        init_tracing();
        let program = compile(
            "function main(x: string): string { log(x); return 'x: ' + x; }",
            None,
            "main",
        )
        .unwrap();
        let output = program.run(&json!(null), &json!(["hello world"]), false).unwrap();
        assert_eq!(output.result().to_json(), json!("x: hello world"));
        assert_eq!(output.logs(), &[Value::String("hello world".into())]);
        assert!(output.this().is_none());
        assert!(output.hashes().is_empty());
        assert_eq!(output.result_hash(), output.result().content_hash());
        assert_eq!(output.stack_inputs().len(), 8);
    }

    #[test]
    fn test_logged_field_joins_the_public_layout() {
        init_tracing();
        let with_log = compile(
            "contract Account { id: string; function main() { log(this.id); } }",
            Some("Account"),
            "main",
        )
        .unwrap();
        let without_log = compile(
            "contract Account { id: string; function main() { let x = this.id; } }",
            Some("Account"),
            "main",
        )
        .unwrap();
        let this = json!({ "id": "test" });

        let logged = with_log.run(&this, &json!([]), false).unwrap();
        assert_eq!(logged.logs(), &[Value::String("test".into())]);
        assert_eq!(logged.hashes().len(), 1);
        assert_eq!(logged.this().unwrap().to_json(), json!({ "id": "test" }));
        assert_eq!(logged.program_info().public_fields, vec!["id".to_string()]);

        let silent = without_log.run(&this, &json!([]), false).unwrap();
        assert!(silent.logs().is_empty());
        assert!(silent.hashes().is_empty());
        assert!(silent.program_info().public_fields.is_empty());
        assert_eq!(silent.result(), logged.result());
        assert!(silent.cycle_count() < logged.cycle_count());
    }

    #[test]
    fn test_array_reversal() {
        init_tracing();
        let program = compile(REVERSE, Some("ReverseArray"), "reverse").unwrap();
        let output = program
            .run(&json!({ "elements": [1, 2, 3, 4, 5] }), &json!([]), false)
            .unwrap();
        assert_eq!(output.result().to_json(), json!([5, 4, 3, 2, 1]));
        assert_eq!(
            output.this().unwrap().to_json(),
            json!({ "elements": [1, 2, 3, 4, 5] })
        );
    }

    #[test]
    fn test_nested_construction() {
        init_tracing();
        let program = compile(CITY, Some("City"), "constructor").unwrap();
        let output = program
            .run(
                &json!({ "id": "", "name": "", "country": { "id": "", "name": "" } }),
                &json!(["boston", "BOSTON", { "id": "usa", "name": "USA" }]),
                false,
            )
            .unwrap();
        assert_eq!(
            output.this().unwrap().to_json(),
            json!({ "id": "boston", "name": "BOSTON", "country": { "id": "usa", "name": "USA" } })
        );
        assert_eq!(output.hashes().len(), 3);
        assert_eq!(*output.result(), Value::Null);
    }

    #[test]
    fn test_null_this_starts_from_the_layout_defaults() {
        init_tracing();
        let city = compile(CITY, Some("City"), "constructor").unwrap();
        let output = city
            .run(
                &json!(null),
                &json!(["boston", "BOSTON", { "id": "usa", "name": "USA" }]),
                false,
            )
            .unwrap();
        assert_eq!(
            output.this().unwrap().to_json(),
            json!({ "id": "boston", "name": "BOSTON", "country": { "id": "usa", "name": "USA" } })
        );

        let reverse = compile(REVERSE, Some("ReverseArray"), "reverse").unwrap();
        let output = reverse.run(&json!(null), &json!([]), false).unwrap();
        assert_eq!(output.result().to_json(), json!([]));
        assert_eq!(output.this().unwrap().to_json(), json!({ "elements": [] }));
    }

    #[test]
    fn test_wrapping_and_checked_addition() {
        init_tracing();
        let wrapping = compile(
            "function main(a: u32, b: u32): u32 { return a.wrappingAdd(b); }",
            None,
            "main",
        )
        .unwrap();
        let output = wrapping.run(&json!(null), &json!([4294967295u64, 1]), false).unwrap();
        assert_eq!(output.result().to_json(), json!(0));

        let checked = compile("function main(a: u32, b: u32): u32 { return a + b; }", None, "main")
            .unwrap();
        assert_eq!(
            runtime_error(&checked, json!(null), json!([4294967295u64, 1])),
            RuntimeErrorKind::Overflow
        );
    }

    #[test]
    fn test_fibonacci_is_deterministic() {
        init_tracing();
        let program = compile(FIBONACCI, None, "main").unwrap();
        let expected = (0..30).fold((1u32, 1u32), |(a, b), _| (b, a.wrapping_add(b))).1;

        let first = program.run(&json!(null), &json!([30, 1, 1]), false).unwrap();
        let second = program.run(&json!(null), &json!([30, 1, 1]), false).unwrap();
        assert_eq!(first.result().to_json(), json!(expected));
        assert_eq!(first.result(), second.result());
        assert_eq!(first.cycle_count(), second.cycle_count());
        assert_eq!(first.output_stack(), second.output_stack());

        // The cycle count depends on the bound only.
        let other_start = program.run(&json!(null), &json!([30, 5, 8]), false).unwrap();
        assert_eq!(other_start.cycle_count(), first.cycle_count());
        let longer = program.run(&json!(null), &json!([31, 1, 1]), false).unwrap();
        assert!(longer.cycle_count() > first.cycle_count());

        // Large bounds wrap instead of trapping.
        let wrapped = program.run(&json!(null), &json!([100, 1, 1]), false).unwrap();
        let expected = (0..100).fold((1u32, 1u32), |(a, b), _| (b, a.wrapping_add(b))).1;
        assert_eq!(wrapped.result().to_json(), json!(expected));
    }

    #[test]
    fn test_void_fibonacci_runs_every_iteration() {
        init_tracing();
        let program = compile(VOID_FIBONACCI, None, "main").unwrap();
        let thirty = program.run(&json!(null), &json!([30, 1, 1]), false).unwrap();
        let again = program.run(&json!(null), &json!([30, 1, 1]), false).unwrap();
        let thirty_one = program.run(&json!(null), &json!([31, 1, 1]), false).unwrap();
        assert_eq!(thirty.result(), &Value::Null);
        assert_eq!(thirty.cycle_count(), again.cycle_count());
        assert_ne!(thirty.cycle_count(), thirty_one.cycle_count());
        let none = program.run(&json!(null), &json!([0, 1, 1]), false).unwrap();
        assert!(none.cycle_count() < thirty.cycle_count());
    }

    #[test]
    fn test_unused_checked_arithmetic_still_traps() {
        init_tracing();
        let program = compile(
            "function main(a: u32): u32 { let x: u32 = a + 1; return a; }",
            None,
            "main",
        )
        .unwrap();
        assert_eq!(
            runtime_error(&program, json!(null), json!([4294967295u64])),
            RuntimeErrorKind::Overflow
        );
        let output = program.run(&json!(null), &json!([7]), false).unwrap();
        assert_eq!(output.result().to_json(), json!(7));
    }

    #[test]
    fn test_runtime_error_kinds() {
        init_tracing();
        let index = compile(
            "contract Items { items: u32[]; function main(i: u32): u32 { return this.items[i]; } }",
            Some("Items"),
            "main",
        )
        .unwrap();
        assert_eq!(
            runtime_error(&index, json!({ "items": [1, 2] }), json!([2])),
            RuntimeErrorKind::IndexOutOfBounds { index: 2, len: 2 }
        );
        assert!(matches!(
            runtime_error(&index, json!({ "items": ["a"] }), json!([0])),
            RuntimeErrorKind::TypeMismatch(_)
        ));
        assert!(matches!(
            runtime_error(&index, json!({}), json!([0])),
            RuntimeErrorKind::TypeMismatch(_)
        ));

        let div = compile("function main(a: u32, b: u32): u32 { return a / b; }", None, "main")
            .unwrap();
        assert_eq!(
            runtime_error(&div, json!(null), json!([1, 0])),
            RuntimeErrorKind::DivisionByZero
        );
        assert!(matches!(
            runtime_error(&div, json!(null), json!([1])),
            RuntimeErrorKind::TypeMismatch(_)
        ));

        let auth = compile("function main(ok: boolean) { requireAuth(ok); }", None, "main")
            .unwrap();
        assert_eq!(
            runtime_error(&auth, json!(null), json!([false])),
            RuntimeErrorKind::AuthorizationDenied
        );
        let output = auth.run(&json!(null), &json!([true]), false).unwrap();
        assert_eq!(output.read_auth(), &[true]);
    }

    #[test]
    fn test_runtime_errors_carry_the_cycle() {
        init_tracing();
        let program = compile(
            "function main(a: u32): u32 { let b: u32 = a + 1; return b / (a - a); }",
            None,
            "main",
        )
        .unwrap();
        match program.run(&json!(null), &json!([3]), false) {
            Err(Error::Runtime(err)) => {
                assert_eq!(err.kind, RuntimeErrorKind::DivisionByZero);
                assert!(err.cycle > 0);
            }
            other => panic!("expected division by zero, got {other:?}"),
        }
    }

    #[test]
    fn test_selfdestruct_is_reported() {
        init_tracing();
        let program = compile(
            "contract Vault { owner: string; function close() { selfdestruct(); } }",
            Some("Vault"),
            "close",
        )
        .unwrap();
        let output = program.run(&json!({ "owner": "me" }), &json!([]), false).unwrap();
        assert!(output.self_destructed());
        assert_eq!(output.output_stack().last(), Some(&1));
    }

    #[test]
    fn test_syntax_errors_have_a_location() {
        init_tracing();
        let err = compile("function main() {\n    let x = ;\n}", None, "main").unwrap_err();
        let CompileError::Syntax(err) = err else {
            panic!("expected a syntax error, got {err:?}");
        };
        assert_eq!(err.line, 2);
        assert!(err.column > 1);
    }

    #[test]
    fn test_type_error_kinds() {
        init_tracing();
        assert_eq!(
            type_error("function main() { log(missing); }"),
            TypeErrorKind::UnresolvedReference
        );
        assert_eq!(
            type_error("function main(a: u32, b: u64): u64 { return a + b; }"),
            TypeErrorKind::TypeMismatch
        );
        assert_eq!(
            type_error("function g(a: u32): u32 { return a; } function main() { log(g()); }"),
            TypeErrorKind::ArityMismatch
        );
        assert_eq!(
            type_error("contract A { b: B; } contract B { a: A; } function main() {}"),
            TypeErrorKind::CyclicType
        );
    }

    #[test]
    fn test_unknown_entry() {
        init_tracing();
        assert!(matches!(
            compile(CITY, Some("City"), "destroy"),
            Err(CompileError::UnknownEntry(_))
        ));
        assert!(matches!(
            compile(CITY, Some("Town"), "constructor"),
            Err(CompileError::UnknownEntry(_))
        ));
    }

    #[test]
    fn test_program_runs_concurrently() {
        init_tracing();
        let program = compile(FIBONACCI, None, "main").unwrap();
        let baseline = program.run(&json!(null), &json!([20, 1, 1]), false).unwrap();
        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let program = program.clone();
                    scope.spawn(move || program.run(&json!(null), &json!([20, 1, 1]), false))
                })
                .collect();
            for handle in handles {
                let output = handle.join().unwrap().unwrap();
                assert_eq!(output, baseline);
            }
        });
    }
}
