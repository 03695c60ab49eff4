#[cfg(test)]
mod tests {
    use ark_bls12_381::Fr;
    use ark_poly::EvaluationDomain;
    use toyni_contracts::math::{
        domain::{coset_point, coset_points, fold_domain_points, get_domain},
        fri::{fold_pair, fri_fold, fri_rounds},
        polynomial::Polynomial,
    };
    use toyni_contracts::merkle::{MerkleTree, hash_leaf, verify_merkle_proof};

    fn poly(degree: u64) -> Polynomial {
        Polynomial::new((0..=degree).map(|i| Fr::from(i * i + 3)).collect())
    }

    /// Folds evaluations of `p` on the coset of `size` points `rounds` times.
    fn fold_all(p: &Polynomial, size: usize, rounds: usize) -> Vec<Fr> {
        let mut xs = coset_points(size).unwrap();
        let mut layer: Vec<Fr> = xs.iter().map(|&x| p.evaluate(x)).collect();
        for round in 0..rounds {
            layer = fri_fold(&layer, &xs, Fr::from(round as u64 + 11));
            xs = fold_domain_points(&xs);
        }
        layer
    }

    #[test]
    fn test_extended_domain_contains_trace_domain() {
        let blowup_factor = 8;
        let domain = get_domain(4).unwrap();
        let extended: Vec<Fr> = get_domain(4 * blowup_factor).unwrap().elements().collect();
        for (i, point) in domain.elements().enumerate() {
            assert_eq!(point, extended[i * blowup_factor]);
        }
    }

    #[test]
    fn test_low_degree_folds_to_a_constant() {
        // A trace of 8 rows allows degree below 32.
        let rounds = fri_rounds(8);
        assert_eq!(rounds, 5);
        let last = fold_all(&poly(31), 128, rounds);
        assert_eq!(last.len(), 4);
        assert!(last.iter().all(|value| *value == last[0]));
    }

    #[test]
    fn test_high_degree_does_not_fold_to_a_constant() {
        let last = fold_all(&poly(32), 128, fri_rounds(8));
        assert!(last.iter().any(|value| *value != last[0]));
    }

    #[test]
    fn test_committed_layer_openings() {
        let size = 64;
        let xs = coset_points(size).unwrap();
        let p = poly(9);
        let layer: Vec<Fr> = xs.iter().map(|&x| p.evaluate(x)).collect();
        let half = size / 2;
        let tree = MerkleTree::new(
            (0..half)
                .map(|j| hash_leaf(&[layer[j], layer[j + half]]))
                .collect(),
        );
        let beta = Fr::from(5u64);
        let folded = fri_fold(&layer, &xs, beta);
        for j in [0, 7, half - 1] {
            let proof = tree.get_proof(j).unwrap();
            let leaf = hash_leaf(&[layer[j], layer[j + half]]);
            assert!(verify_merkle_proof(&leaf, j, &proof, &tree.root()));
            let x = coset_point(size, j).unwrap();
            assert_eq!(fold_pair(layer[j], layer[j + half], x, beta), Some(folded[j]));
        }
    }
}
