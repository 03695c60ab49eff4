#[cfg(test)]
mod tests {
    use serde_json::json;
    use toyni_contracts::error::ProofError;
    use toyni_contracts::{
        Error, ExecutionOutput, Program, ProgramInfo, ProverConfig, compile, init, verify,
    };
    use tracing_subscriber::EnvFilter;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        init();
    }

    fn small_config() -> ProverConfig {
        ProverConfig {
            blowup_factor: 4,
            num_queries: 16,
            ..ProverConfig::default()
        }
    }

    fn verifies(output: &ExecutionOutput) -> bool {
        verify(
            output.proof().unwrap(),
            output.program_info(),
            output.stack_inputs(),
            output.output_stack(),
            output.overflow_addrs(),
        )
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

    fn just_main() -> Program {
        compile(
            "function main(x: string): string { log(x); return 'x: ' + x; }",
            None,
            "main",
        )
        .unwrap()
    }

    #[test]
    fn test_valid_proof() {
        init_tracing();
        let output = just_main()
            .run(&json!(null), &json!(["hello world"]), true)
            .unwrap();
        assert!(!output.proof().unwrap().is_empty());
        // Three counters, the result and log digests and the self-destruct
        // flag: 20 words, four past the stack top.
        assert_eq!(output.output_stack().len(), 20);
        assert_eq!(output.overflow_addrs().len(), 4);
        assert!(verifies(&output));
    }

    #[test]
    fn test_contract_proofs_verify() {
        init_tracing();
        let account = compile(
            "contract Account { id: string; function main() { log(this.id); } }",
            Some("Account"),
            "main",
        )
        .unwrap();
        let output = account
            .run_with_config(&json!({ "id": "test" }), &json!([]), &small_config())
            .unwrap();
        assert!(verifies(&output));

        let counter = compile(
            "contract Counter {
                count: u8;
                function bump(by: u8): u8 {
                    this.count = this.count.wrappingAdd(by);
                    requireAuth(this.count > 0);
                    return this.count - 1;
                }
            }",
            Some("Counter"),
            "bump",
        )
        .unwrap();
        let output = counter
            .run_with_config(&json!({ "count": 250 }), &json!([10]), &small_config())
            .unwrap();
        assert_eq!(output.result().to_json(), json!(3));
        assert_eq!(output.read_auth(), &[true]);
        assert!(verifies(&output));
    }

    #[test]
    fn test_loop_proof_verifies() {
        init_tracing();
        let program = compile(
            "function main(p: u32, a: u32, b: u32): u32 {
                for (let i: u32 = 0; i < p; i++) {
                    let c = a.wrappingAdd(b);
                    a = b;
                    b = c;
                }
                return b;
            }",
            None,
            "main",
        )
        .unwrap();
        let output = program
            .run_with_config(&json!(null), &json!([30, 1, 1]), &small_config())
            .unwrap();
        assert!(verifies(&output));
    }

    #[test]
    fn test_proofs_are_deterministic() {
        init_tracing();
        let program = just_main();
        let first = program
            .run_with_config(&json!(null), &json!(["hello"]), &small_config())
            .unwrap();
        let second = program
            .run_with_config(&json!(null), &json!(["hello"]), &small_config())
            .unwrap();
        assert_eq!(first.proof(), second.proof());
        assert_eq!(first.hashes(), second.hashes());
        assert_eq!(first.logs(), second.logs());

        let other = program
            .run_with_config(&json!(null), &json!(["world"]), &small_config())
            .unwrap();
        assert_ne!(first.proof(), other.proof());
    }

    #[test]
    fn test_flipped_bytes_are_rejected() {
        init_tracing();
        let program = compile("function main(): u32 { return 7; }", None, "main").unwrap();
        let output = program
            .run_with_config(&json!(null), &json!([]), &small_config())
            .unwrap();
        let proof = output.proof().unwrap();
        let positions = (0..256).chain((256..proof.len()).step_by(97)).chain([proof.len() - 1]);
        for position in positions {
            let mut tampered = proof.to_vec();
            tampered[position] ^= 0x01;
            assert!(
                !verify(
                    &tampered,
                    output.program_info(),
                    output.stack_inputs(),
                    output.output_stack(),
                    output.overflow_addrs(),
                ),
                "flipping byte {position} was accepted"
            );
        }

        let mut longer = proof.to_vec();
        longer.push(0);
        assert!(!verify(
            &longer,
            output.program_info(),
            output.stack_inputs(),
            output.output_stack(),
            output.overflow_addrs(),
        ));
        assert!(!verify(
            &proof[..proof.len() - 1],
            output.program_info(),
            output.stack_inputs(),
            output.output_stack(),
            output.overflow_addrs(),
        ));
    }

    #[test]
    fn test_other_public_values_are_rejected() {
        init_tracing();
        let output = just_main()
            .run_with_config(&json!(null), &json!(["hello world"]), &small_config())
            .unwrap();
        let proof = output.proof().unwrap();

        let mut outputs = output.output_stack().to_vec();
        outputs[1] ^= 1;
        assert!(!verify(
            proof,
            output.program_info(),
            output.stack_inputs(),
            &outputs,
            output.overflow_addrs(),
        ));

        let mut inputs = output.stack_inputs().to_vec();
        inputs[0] ^= 1;
        assert!(!verify(
            proof,
            output.program_info(),
            &inputs,
            output.output_stack(),
            output.overflow_addrs(),
        ));

        let mut cycles = output.output_stack().to_vec();
        cycles[0] += 1;
        assert!(!verify(
            proof,
            output.program_info(),
            output.stack_inputs(),
            &cycles,
            output.overflow_addrs(),
        ));

        let info = ProgramInfo {
            entry: "other".to_string(),
            ..output.program_info().clone()
        };
        assert!(!verify(
            proof,
            &info,
            output.stack_inputs(),
            output.output_stack(),
            output.overflow_addrs(),
        ));

        assert!(!verify(
            proof,
            output.program_info(),
            output.stack_inputs(),
            output.output_stack(),
            &output.overflow_addrs()[1..],
        ));
    }

    #[test]
    fn test_array_reversal_proof_verifies() {
        init_tracing();
        let program = compile(REVERSE, Some("ReverseArray"), "reverse").unwrap();
        let output = program
            .run_with_config(&json!({ "elements": [1, 2, 3] }), &json!([]), &small_config())
            .unwrap();
        assert_eq!(output.result().to_json(), json!([3, 2, 1]));
        assert!(verifies(&output));

        let other = program
            .run(&json!({ "elements": [1, 2, 4] }), &json!([]), false)
            .unwrap();
        assert!(!verify(
            output.proof().unwrap(),
            output.program_info(),
            output.stack_inputs(),
            other.output_stack(),
            other.overflow_addrs(),
        ));
    }

    #[test]
    fn test_nested_construction_proof_verifies() {
        init_tracing();
        let program = compile(CITY, Some("City"), "constructor").unwrap();
        let output = program
            .run_with_config(
                &json!(null),
                &json!(["nyc", "NYC", { "id": "us", "name": "US" }]),
                &small_config(),
            )
            .unwrap();
        assert_eq!(
            output.this().unwrap().to_json(),
            json!({ "id": "nyc", "name": "NYC", "country": { "id": "us", "name": "US" } })
        );
        assert!(verifies(&output));

        // Every field digest is bound: claim another city name.
        let mut outputs = output.output_stack().to_vec();
        let name_word = 3 + 8 + 8 + 7;
        outputs[name_word] ^= 1;
        assert!(!verify(
            output.proof().unwrap(),
            output.program_info(),
            output.stack_inputs(),
            &outputs,
            output.overflow_addrs(),
        ));
    }

    #[test]
    fn test_trace_limit_is_a_proof_error() {
        init_tracing();
        let config = ProverConfig {
            max_trace_len: 64,
            ..small_config()
        };
        let result = just_main().run_with_config(&json!(null), &json!(["x"]), &config);
        assert!(matches!(
            result,
            Err(Error::Proof(ProofError::GenerationFailure(_)))
        ));
    }

    #[test]
    fn test_unsafe_parameters_are_refused() {
        init_tracing();
        let config = ProverConfig {
            num_queries: 2,
            ..ProverConfig::default()
        };
        assert!(just_main().run_with_config(&json!(null), &json!(["x"]), &config).is_err());
    }
}
