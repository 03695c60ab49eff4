//! FRI folding over the shifted evaluation domain.

use ark_bls12_381::Fr;
use ark_ff::{AdditiveGroup, Field, batch_inversion};

/// Folds evaluations of `f` on `xs ∪ -xs` into evaluations of
/// `f'(x²) = (f(x) + f(-x))/2 + β·(f(x) - f(-x))/(2x)`.
///
/// `evals[i]` and `evals[i + half]` are `f(xᵢ)` and `f(-xᵢ)`; only the first
/// half of `xs` is read.
pub fn fri_fold(evals: &[Fr], xs: &[Fr], beta: Fr) -> Vec<Fr> {
    let half = evals.len() / 2;
    let mut inverses: Vec<Fr> = xs[..half].iter().map(|x| x.double()).collect();
    batch_inversion(&mut inverses);
    let half_inv = Fr::from(2u64).inverse().unwrap_or_default();

    (0..half)
        .map(|i| {
            let (a, b) = (evals[i], evals[i + half]);
            (a + b) * half_inv + (a - b) * beta * inverses[i]
        })
        .collect()
}

/// One folded value, as the verifier recomputes it.
pub fn fold_pair(a: Fr, b: Fr, x: Fr, beta: Fr) -> Option<Fr> {
    let half_inv = Fr::from(2u64).inverse()?;
    Some((a + b) * half_inv + (a - b) * beta * x.double().inverse()?)
}

/// Number of folds that take a polynomial of degree below `4 · trace_len`
/// to a constant.
pub fn fri_rounds(trace_len: usize) -> usize {
    ark_std::log2(4 * trace_len) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::domain::{coset_points, fold_domain_points};
    use crate::math::polynomial::Polynomial;

    #[test]
    fn test_folding_halves_degree() {
        // f(x) = 1 + 2x + 3x² + 4x³, so f'(y) = (1 + 3y) + β(2 + 4y).
        let f = Polynomial::new((1..=4u64).map(Fr::from).collect());
        let xs = coset_points(16).unwrap();
        let evals: Vec<Fr> = xs.iter().map(|&x| f.evaluate(x)).collect();
        let beta = Fr::from(5u64);

        let folded = fri_fold(&evals, &xs, beta);
        let ys = fold_domain_points(&xs);
        let expected = Polynomial::new(vec![Fr::from(11u64), Fr::from(23u64)]);
        for (value, y) in folded.iter().zip(&ys) {
            assert_eq!(*value, expected.evaluate(*y));
        }
        assert_eq!(
            fold_pair(evals[3], evals[11], xs[3], beta),
            Some(folded[3])
        );
    }

    #[test]
    fn test_round_count() {
        assert_eq!(fri_rounds(256), 10);
        assert_eq!((16 * 256) >> fri_rounds(256), 4);
    }
}
