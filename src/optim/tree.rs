//! CART regression tree (squared error) used as a boosting base learner

use rand::seq::index;
use rand::Rng;

#[derive(Debug, Clone)]
enum Node {
    Leaf(f64),
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

/// A fitted regression tree
#[derive(Debug, Clone)]
pub struct RegressionTree {
    nodes: Vec<Node>,
}

/// Growth limits for [`RegressionTree::fit`]
#[derive(Debug, Clone, Copy)]
pub struct TreeParams {
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    /// Features examined per split (`None` = all)
    pub max_features: Option<usize>,
}

impl Default for TreeParams {
    fn default() -> Self {
        Self {
            max_depth: 3,
            min_samples_leaf: 1,
            max_features: None,
        }
    }
}

struct SplitChoice {
    feature: usize,
    threshold: f64,
    gain: f64,
}

impl RegressionTree {
    /// Fit on rows `x` (all the same width) and targets `y`
    pub fn fit<R: Rng>(x: &[Vec<f64>], y: &[f64], params: TreeParams, rng: &mut R) -> Self {
        let mut tree = Self { nodes: Vec::new() };
        let rows: Vec<usize> = (0..x.len().min(y.len())).collect();
        tree.grow(x, y, &rows, 0, params, rng);
        tree
    }

    pub fn predict(&self, row: &[f64]) -> f64 {
        let mut i = 0;
        loop {
            match &self.nodes[i] {
                Node::Leaf(value) => return *value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    let v = row.get(*feature).copied().unwrap_or(0.0);
                    i = if v <= *threshold { *left } else { *right };
                }
            }
        }
    }

    pub fn n_leaves(&self) -> usize {
        self.nodes.iter().filter(|n| matches!(n, Node::Leaf(_))).count()
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], i: usize) -> usize {
            match &nodes[i] {
                Node::Leaf(_) => 0,
                Node::Split { left, right, .. } => 1 + walk(nodes, *left).max(walk(nodes, *right)),
            }
        }
        if self.nodes.is_empty() {
            0
        } else {
            walk(&self.nodes, 0)
        }
    }

    fn grow<R: Rng>(
        &mut self,
        x: &[Vec<f64>],
        y: &[f64],
        rows: &[usize],
        depth: usize,
        params: TreeParams,
        rng: &mut R,
    ) -> usize {
        let id = self.nodes.len();
        let mean = if rows.is_empty() {
            0.0
        } else {
            rows.iter().map(|&r| y[r]).sum::<f64>() / rows.len() as f64
        };
        self.nodes.push(Node::Leaf(mean));

        if depth >= params.max_depth || rows.len() < 2 * params.min_samples_leaf.max(1) {
            return id;
        }

        let Some(split) = best_split(x, y, rows, params, rng) else {
            return id;
        };

        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
            .iter()
            .partition(|&&r| x[r][split.feature] <= split.threshold);

        let left = self.grow(x, y, &left_rows, depth + 1, params, rng);
        let right = self.grow(x, y, &right_rows, depth + 1, params, rng);
        self.nodes[id] = Node::Split {
            feature: split.feature,
            threshold: split.threshold,
            left,
            right,
        };
        id
    }
}

/// Best variance-reducing split over a (possibly sampled) feature subset
fn best_split<R: Rng>(
    x: &[Vec<f64>],
    y: &[f64],
    rows: &[usize],
    params: TreeParams,
    rng: &mut R,
) -> Option<SplitChoice> {
    let n_features = x.first().map(Vec::len).unwrap_or(0);
    if n_features == 0 {
        return None;
    }
    let features: Vec<usize> = match params.max_features {
        Some(k) if k < n_features => index::sample(rng, n_features, k.max(1)).into_vec(),
        _ => (0..n_features).collect(),
    };

    let min_leaf = params.min_samples_leaf.max(1);
    let n = rows.len();
    let total: f64 = rows.iter().map(|&r| y[r]).sum();
    let parent_score = total * total / n as f64;

    let mut best: Option<SplitChoice> = None;
    let mut order: Vec<usize> = rows.to_vec();
    for feature in features {
        order.sort_by(|&a, &b| x[a][feature].total_cmp(&x[b][feature]));

        let mut left_sum = 0.0;
        for k in 0..n - 1 {
            left_sum += y[order[k]];
            let n_left = k + 1;
            let n_right = n - n_left;
            if n_left < min_leaf || n_right < min_leaf {
                continue;
            }
            let here = x[order[k]][feature];
            let next = x[order[k + 1]][feature];
            if here >= next {
                continue;
            }
            let right_sum = total - left_sum;
            // SSE reduction up to a constant
            let score = left_sum * left_sum / n_left as f64 + right_sum * right_sum / n_right as f64;
            let gain = score - parent_score;
            if gain > 1e-12 && best.as_ref().map_or(true, |b| gain > b.gain) {
                best = Some(SplitChoice {
                    feature,
                    threshold: 0.5 * (here + next),
                    gain,
                });
            }
        }
    }
    best
}
