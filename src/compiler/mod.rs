//! Code generation: typed program to a linear stack machine program.

pub mod codegen;
pub mod liveness;
pub mod program;

pub use codegen::generate;
pub use program::{CompiledProgram, Instruction, ThisLayout, ValueType};

use crate::error::CompileError;

/// Parses, resolves and generates code for one entry point.
pub fn compile_source(
    source: &str,
    contract: Option<&str>,
    entry: &str,
) -> Result<CompiledProgram, CompileError> {
    let ast = crate::lang::parse(source)?;
    let typed = crate::lang::resolve(&ast)?;
    generate(&typed, contract, entry)
}
