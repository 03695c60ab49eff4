//! Evaluation domains: the trace subgroup and the shifted LDE coset.

use ark_bls12_381::Fr;
use ark_ff::Field;
use ark_poly::{EvaluationDomain, GeneralEvaluationDomain};

/// Shift of the low-degree extension coset. Not in any power-of-two
/// subgroup, so the coset never meets the trace domain.
pub const COSET_OFFSET: u64 = 7;

pub fn coset_offset() -> Fr {
    Fr::from(COSET_OFFSET)
}

/// Multiplicative subgroup of order `size`, a power of two.
pub fn get_domain(size: usize) -> Option<GeneralEvaluationDomain<Fr>> {
    GeneralEvaluationDomain::<Fr>::new(size).filter(|domain| domain.size() == size)
}

/// All points `offset · ωⁱ` of the LDE coset of order `size`.
pub fn coset_points(size: usize) -> Option<Vec<Fr>> {
    let offset = coset_offset();
    Some(get_domain(size)?.elements().map(|w| offset * w).collect())
}

/// The `index`-th point of the LDE coset of order `size`.
pub fn coset_point(size: usize, index: usize) -> Option<Fr> {
    Some(coset_offset() * get_domain(size)?.element(index))
}

/// Squares the first half of the points, giving the domain of the next FRI
/// layer.
pub fn fold_domain_points(domain_points: &[Fr]) -> Vec<Fr> {
    domain_points
        .iter()
        .take(domain_points.len() / 2)
        .map(|x| x.square())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extended_domain_contains_trace_domain() {
        let blowup_factor = 8;
        let domain = get_domain(4).unwrap();
        let extended_domain = get_domain(4 * blowup_factor).unwrap();
        assert_eq!(extended_domain.size(), 4 * blowup_factor);

        let extended_points: Vec<Fr> = extended_domain.elements().collect();
        for (i, point) in domain.elements().enumerate() {
            assert_eq!(point, extended_points[i * blowup_factor]);
        }
    }

    #[test]
    fn test_coset_halves_are_negations() {
        let points = coset_points(16).unwrap();
        for i in 0..8 {
            assert_eq!(points[i + 8], -points[i]);
        }
        assert_eq!(coset_point(16, 3), Some(points[3]));
        let folded = fold_domain_points(&points);
        assert_eq!(folded.len(), 8);
        assert_eq!(folded[4], -folded[0]);
    }

    #[test]
    fn test_non_power_of_two_is_rejected() {
        assert!(get_domain(12).is_none());
    }
}
