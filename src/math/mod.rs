//! Field arithmetic helpers for the STARK: polynomials, evaluation domains
//! and FRI folding over the BLS12-381 scalar field.

pub mod domain;
pub mod fri;
pub mod polynomial;
