//! Compiler, tracing VM and STARK prover/verifier for a small typed contract
//! language.
//!
//! ```text
//! source --compile--> Program --run--> ExecutionOutput (+ proof) --verify--> bool
//! ```

use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::{debug, info};

pub mod compiler;
pub mod error;
pub mod hash;
pub mod lang;
pub mod math;
pub mod merkle;
pub mod proof;
pub mod prover;
pub mod transcript;
pub mod verifier;
pub mod vm;

pub use compiler::CompiledProgram;
pub use error::{CompileError, Error, ProofError, RuntimeError, SyntaxError, TypeError};
pub use hash::Digest;
pub use proof::ProgramInfo;
pub use prover::ProverConfig;
pub use verifier::verify;
pub use vm::{ExecutionOutput, Value};

static DEFAULT_CONFIG: OnceCell<ProverConfig> = OnceCell::new();

/// Materializes the default proving parameters. Safe to call any number of
/// times from any thread.
pub fn init() {
    DEFAULT_CONFIG.get_or_init(|| {
        debug!("initialized default prover parameters");
        ProverConfig::default()
    });
}

fn default_config() -> &'static ProverConfig {
    DEFAULT_CONFIG.get_or_init(ProverConfig::default)
}

/// Compiles `entry` of `contract` (or a free function when `contract` is
/// `None`).
pub fn compile(source: &str, contract: Option<&str>, entry: &str) -> Result<Program, CompileError> {
    let compiled = compiler::compile_source(source, contract, entry)?;
    info!(
        entry,
        instructions = compiled.instructions.len(),
        "compiled program"
    );
    Ok(Program::new(compiled))
}

/// A compiled entry point. Cheap to clone and shareable across threads.
#[derive(Debug, Clone)]
pub struct Program {
    compiled: Arc<CompiledProgram>,
    info: Arc<ProgramInfo>,
}

impl Program {
    pub fn new(compiled: CompiledProgram) -> Self {
        let info = ProgramInfo::from_program(&compiled);
        Self {
            compiled: Arc::new(compiled),
            info: Arc::new(info),
        }
    }

    pub fn compiled(&self) -> &CompiledProgram {
        &self.compiled
    }

    pub fn program_info(&self) -> &ProgramInfo {
        &self.info
    }

    /// Runs with `this` (JSON `null` for free functions) and a JSON array of
    /// arguments, proving the run under the default parameters if asked.
    pub fn run(
        &self,
        this: &serde_json::Value,
        args: &serde_json::Value,
        generate_proof: bool,
    ) -> Result<ExecutionOutput, Error> {
        let config = generate_proof.then(default_config);
        self.execute(this, args, config)
    }

    /// Runs and proves with explicit parameters.
    pub fn run_with_config(
        &self,
        this: &serde_json::Value,
        args: &serde_json::Value,
        config: &ProverConfig,
    ) -> Result<ExecutionOutput, Error> {
        self.execute(this, args, Some(config))
    }

    fn execute(
        &self,
        this: &serde_json::Value,
        args: &serde_json::Value,
        config: Option<&ProverConfig>,
    ) -> Result<ExecutionOutput, Error> {
        let (mut output, trace) = vm::run_json(&self.compiled, this, args)?;
        if let Some(config) = config {
            output.proof = Some(prover::prove(&trace, &self.info, config)?);
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_program_is_shareable() {
        assert_send_sync::<Program>();
        init();
        init();
        assert_eq!(default_config(), &ProverConfig::default());
    }

    #[test]
    fn test_run_without_proof() {
        let program = compile("function main(a: u8): u8 { return a + 1; }", None, "main").unwrap();
        let output = program.run(&json!(null), &json!([41]), false).unwrap();
        assert!(output.proof().is_none());
        assert_eq!(output.result().to_json(), json!(42));
    }
}
