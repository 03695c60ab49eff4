//! Basic polynomial operations over the BLS12-381 scalar field.

use ark_bls12_381::Fr;
use ark_ff::{Field, Zero};
use ark_poly::{EvaluationDomain, GeneralEvaluationDomain};

use super::domain::get_domain;

/// Polynomial with finite field coefficients.
///
/// Coefficients are stored in ascending order of power, so `[1, 2, 3]` is
/// `3x² + 2x + 1`. The vector never has trailing zeros.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Polynomial {
    pub coefficients: Vec<Fr>,
}

impl Polynomial {
    /// Creates a polynomial, dropping trailing zero coefficients.
    pub fn new(mut coefficients: Vec<Fr>) -> Self {
        while coefficients.last().is_some_and(|x| x.is_zero()) {
            coefficients.pop();
        }
        Self { coefficients }
    }

    /// Interpolates `values` over the multiplicative subgroup of their size.
    pub fn interpolate(values: &[Fr]) -> Option<Self> {
        let domain: GeneralEvaluationDomain<Fr> = get_domain(values.len())?;
        Some(Self::new(domain.ifft(values)))
    }

    /// The zero polynomial has degree 0.
    pub fn degree(&self) -> usize {
        self.coefficients.len().saturating_sub(1)
    }

    pub fn is_zero(&self) -> bool {
        self.coefficients.is_empty()
    }

    pub fn add(&self, other: &Polynomial) -> Polynomial {
        let len = self.coefficients.len().max(other.coefficients.len());
        let mut result = vec![Fr::zero(); len];
        for (i, coeff) in self.coefficients.iter().enumerate() {
            result[i] += coeff;
        }
        for (i, coeff) in other.coefficients.iter().enumerate() {
            result[i] += coeff;
        }
        Polynomial::new(result)
    }

    /// `self · (xⁿ - 1)`, the product with the vanishing polynomial of the
    /// size-`n` subgroup.
    pub fn mul_by_vanishing(&self, n: usize) -> Polynomial {
        if self.is_zero() {
            return self.clone();
        }
        let mut result = vec![Fr::zero(); self.coefficients.len() + n];
        for (i, coeff) in self.coefficients.iter().enumerate() {
            result[i + n] += coeff;
            result[i] -= coeff;
        }
        Polynomial::new(result)
    }

    /// Evaluates using Horner's method.
    pub fn evaluate(&self, x: Fr) -> Fr {
        self.coefficients
            .iter()
            .rev()
            .fold(Fr::zero(), |acc, &coeff| acc * x + coeff)
    }

    /// Evaluations on the coset `offset · H` of the subgroup `H` of order
    /// `size`. Returns `None` if the degree does not fit the domain.
    pub fn coset_evaluations(&self, offset: Fr, size: usize) -> Option<Vec<Fr>> {
        if self.coefficients.len() > size {
            return None;
        }
        let domain: GeneralEvaluationDomain<Fr> = get_domain(size)?;
        let mut power = Fr::from(1u64);
        let scaled: Vec<Fr> = self
            .coefficients
            .iter()
            .map(|coeff| {
                let term = *coeff * power;
                power *= offset;
                term
            })
            .collect();
        let mut evals = domain.fft(&scaled);
        evals.resize(size, Fr::zero());
        Some(evals)
    }
}

/// `xⁿ - 1` at `x`.
pub fn vanishing_at(x: Fr, n: usize) -> Fr {
    x.pow([n as u64]) - Fr::from(1u64)
}
