//! Regression trees and the two ensembles built from them

use rand::seq::index::sample;
use rand::Rng;
use serde::{Deserialize, Serialize};

const MIN_GAIN: f64 = 1e-12;

#[derive(Debug, Clone, Copy)]
pub struct TreeParams {
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    /// Features considered per split; `None` means all of them.
    pub max_features: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Node {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

/// CART regression tree grown by squared-error reduction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    nodes: Vec<Node>,
    /// Total squared-error reduction attributed to each feature.
    gains: Vec<f64>,
}

struct Grower<'a, R> {
    x: &'a [Vec<f64>],
    y: &'a [f64],
    params: TreeParams,
    rng: &'a mut R,
    nodes: Vec<Node>,
    gains: Vec<f64>,
}

struct BestSplit {
    feature: usize,
    threshold: f64,
    gain: f64,
}

fn sse(sum: f64, sum_sq: f64, n: f64) -> f64 {
    sum_sq - sum * sum / n
}

impl<'a, R: Rng> Grower<'a, R> {
    fn grow(&mut self, idx: &mut [usize], depth: usize) -> usize {
        let n = idx.len() as f64;
        let sum: f64 = idx.iter().map(|&i| self.y[i]).sum();
        let leaf = Node::Leaf { value: sum / n };

        if depth >= self.params.max_depth || idx.len() < 2 * self.params.min_samples_leaf {
            return self.push(leaf);
        }
        let Some(best) = self.best_split(idx) else {
            return self.push(leaf);
        };

        self.gains[best.feature] += best.gain;
        let slot = self.push(leaf);

        idx.sort_by(|&a, &b| self.x[a][best.feature].total_cmp(&self.x[b][best.feature]));
        let cut = idx.partition_point(|&i| self.x[i][best.feature] <= best.threshold);
        let (left_idx, right_idx) = idx.split_at_mut(cut);
        let left = self.grow(left_idx, depth + 1);
        let right = self.grow(right_idx, depth + 1);

        self.nodes[slot] = Node::Split {
            feature: best.feature,
            threshold: best.threshold,
            left,
            right,
        };
        slot
    }

    fn push(&mut self, node: Node) -> usize {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    fn candidate_features(&mut self) -> Vec<usize> {
        let width = self.gains.len();
        match self.params.max_features {
            Some(k) if k < width => {
                let mut picked = sample(&mut *self.rng, width, k.max(1)).into_vec();
                picked.sort_unstable();
                picked
            }
            _ => (0..width).collect(),
        }
    }

    fn best_split(&mut self, idx: &[usize]) -> Option<BestSplit> {
        let n = idx.len();
        let min_leaf = self.params.min_samples_leaf.max(1);
        let total: f64 = idx.iter().map(|&i| self.y[i]).sum();
        let total_sq: f64 = idx.iter().map(|&i| self.y[i] * self.y[i]).sum();
        let parent = sse(total, total_sq, n as f64);

        let mut best: Option<BestSplit> = None;
        let mut order = idx.to_vec();
        for feature in self.candidate_features() {
            order.sort_by(|&a, &b| self.x[a][feature].total_cmp(&self.x[b][feature]));

            let (mut left_sum, mut left_sq) = (0.0, 0.0);
            for k in 0..n - 1 {
                let yi = self.y[order[k]];
                left_sum += yi;
                left_sq += yi * yi;

                let left_n = k + 1;
                let right_n = n - left_n;
                if left_n < min_leaf || right_n < min_leaf {
                    continue;
                }
                let here = self.x[order[k]][feature];
                let next = self.x[order[k + 1]][feature];
                if next <= here {
                    continue;
                }

                let children = sse(left_sum, left_sq, left_n as f64)
                    + sse(total - left_sum, total_sq - left_sq, right_n as f64);
                let gain = parent - children;
                if gain > MIN_GAIN && best.as_ref().map_or(true, |b| gain > b.gain) {
                    best = Some(BestSplit {
                        feature,
                        threshold: (here + next) / 2.0,
                        gain,
                    });
                }
            }
        }
        best
    }
}

impl RegressionTree {
    /// Grow a tree on the rows listed in `idx` (duplicates allowed).
    pub fn fit<R: Rng>(
        x: &[Vec<f64>],
        y: &[f64],
        idx: &[usize],
        params: TreeParams,
        rng: &mut R,
    ) -> Self {
        let width = x.first().map(Vec::len).unwrap_or(0);
        let mut grower = Grower {
            x,
            y,
            params,
            rng,
            nodes: Vec::new(),
            gains: vec![0.0; width],
        };
        let mut rows = idx.to_vec();
        if rows.is_empty() {
            grower.push(Node::Leaf { value: 0.0 });
        } else {
            grower.grow(&mut rows, 0);
        }
        Self {
            nodes: grower.nodes,
            gains: grower.gains,
        }
    }

    pub fn predict_one(&self, x: &[f64]) -> f64 {
        let mut at = 0;
        loop {
            match &self.nodes[at] {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    at = if x[*feature] <= *threshold { *left } else { *right };
                }
            }
        }
    }

    pub fn gains(&self) -> &[f64] {
        &self.gains
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], at: usize) -> usize {
            match &nodes[at] {
                Node::Leaf { .. } => 0,
                Node::Split { left, right, .. } => 1 + walk(nodes, *left).max(walk(nodes, *right)),
            }
        }
        walk(&self.nodes, 0)
    }
}

/// Bagged trees with per-split feature subsampling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    trees: Vec<RegressionTree>,
}

impl RandomForest {
    pub fn fit<R: Rng>(
        x: &[Vec<f64>],
        y: &[f64],
        n_trees: usize,
        params: TreeParams,
        rng: &mut R,
    ) -> Self {
        let n = x.len();
        let trees = (0..n_trees.max(1))
            .map(|_| {
                let bootstrap: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
                RegressionTree::fit(x, y, &bootstrap, params, &mut *rng)
            })
            .collect();
        Self { trees }
    }

    pub fn predict_one(&self, x: &[f64]) -> f64 {
        self.trees.iter().map(|t| t.predict_one(x)).sum::<f64>() / self.trees.len() as f64
    }

    pub fn gains(&self) -> Vec<f64> {
        sum_gains(self.trees.iter())
    }

    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }

    pub fn max_depth(&self) -> usize {
        max_depth(&self.trees)
    }
}

/// Least-squares gradient boosting with shrinkage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradientBoosting {
    base: f64,
    learning_rate: f64,
    trees: Vec<RegressionTree>,
}

impl GradientBoosting {
    pub fn fit<R: Rng>(
        x: &[Vec<f64>],
        y: &[f64],
        rounds: usize,
        learning_rate: f64,
        params: TreeParams,
        rng: &mut R,
    ) -> Self {
        let n = y.len();
        let base = y.iter().sum::<f64>() / n.max(1) as f64;
        let all: Vec<usize> = (0..n).collect();
        let mut fitted = vec![base; n];
        let mut trees = Vec::with_capacity(rounds);

        for _ in 0..rounds {
            let residual: Vec<f64> = y.iter().zip(&fitted).map(|(t, f)| t - f).collect();
            let tree = RegressionTree::fit(x, &residual, &all, params, &mut *rng);
            for (f, row) in fitted.iter_mut().zip(x) {
                *f += learning_rate * tree.predict_one(row);
            }
            trees.push(tree);
        }

        Self {
            base,
            learning_rate,
            trees,
        }
    }

    pub fn predict_one(&self, x: &[f64]) -> f64 {
        self.base
            + self.learning_rate * self.trees.iter().map(|t| t.predict_one(x)).sum::<f64>()
    }

    pub fn gains(&self) -> Vec<f64> {
        sum_gains(self.trees.iter())
    }

    pub fn base(&self) -> f64 {
        self.base
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }

    pub fn max_depth(&self) -> usize {
        max_depth(&self.trees)
    }
}

fn max_depth(trees: &[RegressionTree]) -> usize {
    trees.iter().map(RegressionTree::depth).max().unwrap_or(0)
}

fn sum_gains<'a>(trees: impl Iterator<Item = &'a RegressionTree>) -> Vec<f64> {
    let mut total: Vec<f64> = Vec::new();
    for tree in trees {
        if total.is_empty() {
            total = vec![0.0; tree.gains().len()];
        }
        for (t, g) in total.iter_mut().zip(tree.gains()) {
            *t += g;
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn step_data() -> (Vec<Vec<f64>>, Vec<f64>) {
        let x: Vec<Vec<f64>> = (0..40).map(|i| vec![i as f64, (i % 3) as f64]).collect();
        let y = x.iter().map(|r| if r[0] < 20.0 { 1.0 } else { 5.0 }).collect();
        (x, y)
    }

    fn params(max_depth: usize) -> TreeParams {
        TreeParams {
            max_depth,
            min_samples_leaf: 2,
            max_features: None,
        }
    }

    #[test]
    fn test_stump_finds_step() {
        let (x, y) = step_data();
        let all: Vec<usize> = (0..40).collect();
        let tree = RegressionTree::fit(&x, &y, &all, params(1), &mut ChaCha8Rng::seed_from_u64(0));

        assert_eq!(tree.depth(), 1);
        assert_eq!(tree.predict_one(&[3.0, 0.0]), 1.0);
        assert_eq!(tree.predict_one(&[30.0, 0.0]), 5.0);
        assert!(tree.gains()[0] > 0.0);
        assert_eq!(tree.gains()[1], 0.0);
    }

    #[test]
    fn test_depth_and_leaf_size_limits() {
        let x: Vec<Vec<f64>> = (0..10).map(|i| vec![i as f64]).collect();
        let y: Vec<f64> = (0..10).map(|i| (i * i) as f64).collect();
        let all: Vec<usize> = (0..10).collect();
        let tree = RegressionTree::fit(
            &x,
            &y,
            &all,
            TreeParams {
                max_depth: 10,
                min_samples_leaf: 5,
                max_features: None,
            },
            &mut ChaCha8Rng::seed_from_u64(0),
        );
        assert_eq!(tree.depth(), 1);
    }

    #[test]
    fn test_forest_and_boosting_fit_step() {
        let (x, y) = step_data();
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let forest = RandomForest::fit(&x, &y, 30, params(3), &mut rng);
        assert!((forest.predict_one(&[2.0, 1.0]) - 1.0).abs() < 0.5);
        assert!((forest.predict_one(&[38.0, 1.0]) - 5.0).abs() < 0.5);

        let boosting = GradientBoosting::fit(&x, &y, 50, 0.1, params(2), &mut rng);
        assert!((boosting.predict_one(&[2.0, 1.0]) - 1.0).abs() < 0.1);
        assert!((boosting.predict_one(&[38.0, 1.0]) - 5.0).abs() < 0.1);
        assert!(boosting.gains()[0] > boosting.gains()[1]);
    }

    #[test]
    fn test_forest_is_seeded() {
        let (x, y) = step_data();
        let a = RandomForest::fit(&x, &y, 5, params(3), &mut ChaCha8Rng::seed_from_u64(4));
        let b = RandomForest::fit(&x, &y, 5, params(3), &mut ChaCha8Rng::seed_from_u64(4));
        assert_eq!(a, b);
        assert_eq!(a.tree_count(), 5);
        assert!(a.max_depth() <= 3);
    }
}
