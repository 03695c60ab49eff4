//! Front end of the contract language: grammar, syntax tree, resolver.

pub mod ast;
pub mod parser;
pub mod resolve;
pub mod typed;

pub use parser::parse;
pub use resolve::resolve;
pub use typed::{TypedProgram, Width};
