//! Virtual machine for compiled contract programs.
//!
//! Runs are deterministic and traceable: the executor records every step
//! into an [`trace::ExecutionTrace`] which the AIR in [`constraints`] turns
//! into the matrix the prover commits to.

pub mod constraints;
pub mod executor;
pub mod matrix;
pub mod trace;
pub mod value;

pub use executor::run;
pub use value::Value;

use crate::compiler::program::CompiledProgram;
use crate::error::RuntimeError;
use crate::hash::Digest;
use crate::proof::ProgramInfo;

/// Everything a successful run exposes. Proof bytes are attached only when
/// proving was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutput {
    pub(crate) proof: Option<Vec<u8>>,
    pub(crate) program_info: ProgramInfo,
    pub(crate) cycle_count: u64,
    pub(crate) this: Option<Value>,
    pub(crate) result: Value,
    pub(crate) result_hash: Digest,
    pub(crate) logs: Vec<Value>,
    pub(crate) hashes: Vec<Digest>,
    pub(crate) read_auth: Vec<bool>,
    pub(crate) self_destructed: bool,
    pub(crate) stack_inputs: Vec<u64>,
    pub(crate) output_stack: Vec<u64>,
    pub(crate) overflow_addrs: Vec<u64>,
}

impl ExecutionOutput {
    pub fn proof(&self) -> Option<&[u8]> {
        self.proof.as_deref()
    }

    pub fn cycle_count(&self) -> u64 {
        self.cycle_count
    }

    /// Final `this`, restricted to the public fields. `None` for free
    /// functions.
    pub fn this(&self) -> Option<&Value> {
        self.this.as_ref()
    }

    pub fn result(&self) -> &Value {
        &self.result
    }

    pub fn result_hash(&self) -> Digest {
        self.result_hash
    }

    pub fn logs(&self) -> &[Value] {
        &self.logs
    }

    /// Content hash of every public field of the final `this`.
    pub fn hashes(&self) -> &[Digest] {
        &self.hashes
    }

    pub fn read_auth(&self) -> &[bool] {
        &self.read_auth
    }

    pub fn self_destructed(&self) -> bool {
        self.self_destructed
    }

    pub fn program_info(&self) -> &ProgramInfo {
        &self.program_info
    }

    pub fn stack_inputs(&self) -> &[u64] {
        &self.stack_inputs
    }

    pub fn output_stack(&self) -> &[u64] {
        &self.output_stack
    }

    pub fn overflow_addrs(&self) -> &[u64] {
        &self.overflow_addrs
    }
}

/// Converts the JSON run inputs against the entry signature and runs. A
/// contract entry given a JSON `null` for `this` runs on a default instance.
pub fn run_json(
    program: &CompiledProgram,
    this: &serde_json::Value,
    args: &serde_json::Value,
) -> Result<(ExecutionOutput, trace::ExecutionTrace), RuntimeError> {
    let mismatch = |message: String| RuntimeError::type_mismatch(message, 0);
    let this = match (&program.this_type, this) {
        // A fresh contract starts from the zero value of its layout.
        (Some(ty), serde_json::Value::Null) => Some(Value::default_of(ty)),
        (None, serde_json::Value::Null) => None,
        (Some(ty), json) => {
            Some(Value::from_json(json, ty).map_err(|err| mismatch(format!("this: {err}")))?)
        }
        (None, _) => return Err(mismatch("free function does not take `this`".into())),
    };
    let serde_json::Value::Array(items) = args else {
        return Err(mismatch("arguments must be a JSON array".into()));
    };
    if items.len() != program.params.len() {
        return Err(mismatch(format!(
            "expected {} arguments, found {}",
            program.params.len(),
            items.len()
        )));
    }
    let args = items
        .iter()
        .zip(&program.params)
        .enumerate()
        .map(|(i, (json, ty))| {
            Value::from_json(json, ty).map_err(|err| mismatch(format!("argument {i}: {err}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    run(program, this, args)
}
