//! Seeded train/test and k-fold index splits

use rand::seq::SliceRandom;
use rand::Rng;

/// Row indices for one side of a split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Stratified holdout on outcome quantiles.
///
/// Rows are ordered by outcome and cut into `n_test` contiguous strata of
/// near-equal size; one row is drawn from each stratum into the test side.
/// Every index lands on exactly one side.
pub fn stratified_split<R: Rng>(outcomes: &[f64], test_ratio: f64, rng: &mut R) -> Split {
    let n = outcomes.len();
    if n < 2 {
        return Split {
            train: (0..n).collect(),
            test: Vec::new(),
        };
    }
    let n_test = ((n as f64 * test_ratio).round() as usize).clamp(1, n - 1);

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| outcomes[a].total_cmp(&outcomes[b]).then(a.cmp(&b)));

    let mut in_test = vec![false; n];
    for stratum in 0..n_test {
        let start = stratum * n / n_test;
        let end = (stratum + 1) * n / n_test;
        let pick = rng.gen_range(start..end);
        in_test[order[pick]] = true;
    }

    let (test, train): (Vec<usize>, Vec<usize>) = (0..n).partition(|&i| in_test[i]);
    Split { train, test }
}

/// Shuffled k-fold partition of `0..n`. Fold `f` validates on every k-th
/// shuffled position starting at `f`.
pub fn k_fold<R: Rng>(n: usize, k: usize, rng: &mut R) -> Vec<Split> {
    let mut shuffled: Vec<usize> = (0..n).collect();
    shuffled.shuffle(rng);

    (0..k)
        .map(|fold| {
            let mut train = Vec::with_capacity(n - n / k);
            let mut test = Vec::with_capacity(n / k + 1);
            for (pos, &idx) in shuffled.iter().enumerate() {
                if pos % k == fold {
                    test.push(idx);
                } else {
                    train.push(idx);
                }
            }
            train.sort_unstable();
            test.sort_unstable();
            Split { train, test }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_stratified_split_is_a_partition() {
        let y: Vec<f64> = (0..51).map(|i| ((i * 37) % 51) as f64).collect();
        let split = stratified_split(&y, 0.2, &mut ChaCha8Rng::seed_from_u64(7));

        assert_eq!(split.test.len(), 10);
        assert_eq!(split.train.len(), 41);
        let mut all: Vec<usize> = split.train.iter().chain(&split.test).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..51).collect::<Vec<_>>());
    }

    #[test]
    fn test_stratified_split_covers_outcome_range() {
        // outcome equals index: every tenth of the range gets one test row
        let y: Vec<f64> = (0..50).map(|i| i as f64).collect();
        let split = stratified_split(&y, 0.2, &mut ChaCha8Rng::seed_from_u64(1));
        for (stratum, &idx) in split.test.iter().enumerate() {
            assert_eq!(idx / 5, stratum);
        }
    }

    #[test]
    fn test_split_is_seeded() {
        let y: Vec<f64> = (0..30).map(|i| (i as f64).sin()).collect();
        let a = stratified_split(&y, 0.2, &mut ChaCha8Rng::seed_from_u64(3));
        let b = stratified_split(&y, 0.2, &mut ChaCha8Rng::seed_from_u64(3));
        assert_eq!(a, b);
    }

    #[test]
    fn test_k_fold_validates_each_index_once() {
        let folds = k_fold(23, 5, &mut ChaCha8Rng::seed_from_u64(11));
        assert_eq!(folds.len(), 5);
        let mut seen = vec![0; 23];
        for fold in &folds {
            assert_eq!(fold.train.len() + fold.test.len(), 23);
            for &i in &fold.test {
                seen[i] += 1;
            }
        }
        assert!(seen.iter().all(|&c| c == 1));
    }
}
