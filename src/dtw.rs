//! Dynamic time warping against recorded templates — the recogniser we had before the HMMs, kept
//! because it needs no training pass and makes a good baseline when debugging the front end.
//!
//! An input is aligned frame by frame against a template under the usual monotone constraint:
//! each template index may be reached from the same, the previous, or the one-before-previous
//! index in the prior input column, so a template can stretch or compress by up to a factor of
//! two. Node costs are pluggable through [`NodeCost`]; the stock implementation is Euclidean
//! distance normalised by template length so long templates don't lose just for being long.
use ndarray::{Array2, ArrayView1};

/// Pruning threshold that maximised accuracy on the isolated digit set.
pub const BEST_PRUNING_THRESHOLD: f32 = 13.0;

/// Cost of aligning an input frame with one frame of a template.
pub trait NodeCost {
    fn node_cost(&self, input_frame: ArrayView1<f32>, template_frame_index: usize) -> f32;
}

/// Euclidean distance to the template frame, normalised by template length.
pub struct EuclideanNodeCost<'a> {
    template: &'a Array2<f32>,
}

impl<'a> EuclideanNodeCost<'a> {
    pub fn new(template: &'a Array2<f32>) -> Self {
        Self { template }
    }
}

impl NodeCost for EuclideanNodeCost<'_> {
    fn node_cost(&self, input_frame: ArrayView1<f32>, template_frame_index: usize) -> f32 {
        euclidean_distance(input_frame, self.template.row(template_frame_index))
            / self.template.nrows() as f32
    }
}

pub fn euclidean_distance(x: ArrayView1<f32>, y: ArrayView1<f32>) -> f32 {
    assert_eq!(x.len(), y.len());
    x.iter()
        .zip(y.iter())
        .map(|(a, b)| (a - b) * (a - b))
        .sum::<f32>()
        .sqrt()
}

/// Growable cost matrix for one template, advanced one input frame at a time.
pub struct DtwCosts<C: NodeCost> {
    template_len: usize,
    node_cost: C,
    column: Vec<f32>,
    n_columns: usize,
    min_cost: f32,
}

impl<C: NodeCost> DtwCosts<C> {
    pub fn new(template_len: usize, node_cost: C) -> Self {
        assert!(template_len > 0, "empty template");
        Self {
            template_len,
            node_cost,
            column: vec![f32::INFINITY; template_len],
            n_columns: 0,
            min_cost: f32::INFINITY,
        }
    }

    /// Best cost in the most recent column.
    pub fn min_cost(&self) -> f32 {
        self.min_cost
    }

    /// Add an input frame; returns the total path cost whenever the end of the template is
    /// reachable in this column.
    pub fn add_input(&mut self, input_frame: ArrayView1<f32>) -> Option<f32> {
        if self.n_columns == 0 {
            // Alignments start at the template's first frame.
            let first = self.node_cost.node_cost(input_frame, 0);
            self.column[0] = first;
            self.min_cost = first;
            self.n_columns = 1;
            return None;
        }

        let mut new_column = vec![f32::INFINITY; self.template_len];
        let mut min_cost = f32::INFINITY;
        for template_index in 0..self.template_len {
            let lower = template_index.saturating_sub(2);
            let min_prev = self.column[lower..=template_index]
                .iter()
                .copied()
                .fold(f32::INFINITY, f32::min);
            if min_prev < f32::INFINITY {
                let cost = min_prev + self.node_cost.node_cost(input_frame, template_index);
                new_column[template_index] = cost;
                min_cost = min_cost.min(cost);
            }
        }
        self.column = new_column;
        self.min_cost = min_cost;
        self.n_columns += 1;

        let total = self.column[self.template_len - 1];
        total.is_finite().then_some(total)
    }

    /// Remove everything in the current column above `threshold`.
    pub fn prune(&mut self, threshold: f32) {
        for cost in self.column.iter_mut() {
            if *cost > threshold {
                *cost = f32::INFINITY;
            }
        }
    }
}

/// Align `input` against one template, returning the total cost each time the template end was
/// reached.
pub fn single_dtw_search(template: &Array2<f32>, input: &Array2<f32>) -> Vec<f32> {
    let mut costs = DtwCosts::new(template.nrows(), EuclideanNodeCost::new(template));
    let mut finish_costs = vec![];
    for frame in input.rows() {
        if let Some(total) = costs.add_input(frame) {
            finish_costs.push(total);
        }
    }
    finish_costs
}

/// Time-synchronous search over many templates at once, with cross-template beam pruning: after
/// each input frame every template whose best cost trails the round minimum by more than
/// `pruning_threshold` is dropped for good. Returns the lowest finishing cost seen and the label
/// of the template that produced it.
pub fn time_sync_dtw_search<T: Clone>(
    templates: &[(Array2<f32>, T)],
    input: &Array2<f32>,
    pruning_threshold: f32,
) -> (f32, Option<T>) {
    let mut searches: Vec<_> = templates
        .iter()
        .map(|(template, label)| {
            (
                DtwCosts::new(template.nrows(), EuclideanNodeCost::new(template)),
                label,
            )
        })
        .collect();
    let mut pruned = vec![false; searches.len()];

    let mut global_min = f32::INFINITY;
    let mut best_label: Option<T> = None;

    for frame in input.rows() {
        let mut round_min = f32::INFINITY;
        for ((costs, label), pruned) in searches.iter_mut().zip(pruned.iter()) {
            if *pruned {
                continue;
            }
            if let Some(total) = costs.add_input(frame) {
                if total < global_min {
                    global_min = total;
                    best_label = Some((*label).clone());
                }
            }
            round_min = round_min.min(costs.min_cost());
        }

        let threshold = round_min + pruning_threshold;
        for ((costs, _), pruned) in searches.iter_mut().zip(pruned.iter_mut()) {
            if *pruned {
                continue;
            }
            if costs.min_cost() > threshold {
                *pruned = true;
            } else {
                costs.prune(threshold);
            }
        }
    }
    (global_min, best_label)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn template_of(values: &[f32]) -> Array2<f32> {
        Array2::from_shape_fn((values.len(), 2), |(i, _)| values[i])
    }

    #[test]
    fn identical_sequences_align_at_near_zero_cost() {
        let template = template_of(&[0.0, 1.0, 2.0, 3.0]);
        let finishes = single_dtw_search(&template, &template);
        assert!(!finishes.is_empty());
        assert!(finishes.last().unwrap() < &1e-6);
    }

    #[test]
    fn warped_sequence_still_finishes() {
        let template = template_of(&[0.0, 1.0, 2.0, 3.0]);
        // Input at half speed: every template frame repeated.
        let input = template_of(&[0.0, 0.0, 1.0, 1.0, 2.0, 2.0, 3.0, 3.0]);
        let finishes = single_dtw_search(&template, &input);
        assert!(!finishes.is_empty());
        assert!(finishes.last().unwrap() < &1e-6);
    }

    #[test]
    fn time_sync_search_picks_the_closer_template() {
        let low = template_of(&[0.0, 0.0, 0.0, 0.0]);
        let high = template_of(&[5.0, 5.0, 5.0, 5.0]);
        let input = template_of(&[0.1, 0.0, 0.1, 0.0]);
        let (cost, label) =
            time_sync_dtw_search(&[(low, "low"), (high, "high")], &input, BEST_PRUNING_THRESHOLD);
        assert_eq!(label, Some("low"));
        assert!(cost < 1.0);
    }

    #[test]
    fn empty_input_finds_nothing() {
        let template = template_of(&[0.0, 1.0]);
        let input = Array2::<f32>::zeros((0, 2));
        let (cost, label) = time_sync_dtw_search(&[(template, 0u8)], &input, 10.0);
        assert!(cost.is_infinite());
        assert_eq!(label, None);
    }
}
