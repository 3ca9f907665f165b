//! Segmental K-means training for one chain model.
//!
//! Hard-EM in its simplest clothes: assign every frame to a state, fit each state's Gaussians to
//! its frames, re-estimate the transitions from how long the frames sat in each state, then
//! re-assign the frames by Viterbi-aligning each example against the new model. When the
//! assignment stops moving the model has converged at the current mixture size, so the mixtures
//! are split — every component seeded twice, scaled by 0.9 and 1.1 — and the loop continues at
//! double the size until the requested count is reached.
//!
//! The K-means inside each state is deterministic on purpose: the first pass seeds from the
//! state's mean, later passes from the previous model's components, so training the same data
//! twice gives the same model down to the bit.
use super::{chain_graph, decode, DigitHmm, GaussianMixture, ModelLabel};
use ndarray::{Array1, Array2, Axis};
use tracing::debug;

/// States per digit chain.
pub const DEFAULT_N_STATES: usize = 5;
/// Mixture components per state once splitting finishes.
pub const DEFAULT_N_GAUSSIANS: usize = 4;

/// Added to every covariance diagonal entry; keeps the Gaussians from collapsing onto a
/// dimension the cepstra barely move in.
const VARIANCE_OFFSET: f32 = 0.1;
/// Hard cap on re-estimation rounds in case alignment oscillates.
const MAX_TRAINING_ITERATIONS: usize = 50;

/// Train one chain model on `examples` (each a T×39 feature matrix) with `n_states` states and
/// up to `n_gaussians` mixture components per state.
pub fn train_digit_hmm(
    label: ModelLabel,
    examples: &[Array2<f32>],
    n_states: usize,
    n_gaussians: usize,
) -> DigitHmm {
    assert!(!examples.is_empty(), "no training examples");
    assert!(n_states > 0 && n_gaussians > 0);
    for example in examples {
        assert!(
            example.nrows() >= n_states,
            "example shorter than the state chain"
        );
    }

    // Uniform initial partition: every example split into n_states equal slices.
    let mut boundaries: Vec<Vec<usize>> = examples
        .iter()
        .map(|example| uniform_boundaries(example.nrows(), n_states))
        .collect();

    let mut model: Option<DigitHmm> = None;
    let mut components = 1;
    let mut iterations = 0;
    loop {
        let candidate = reestimate(
            label,
            examples,
            &boundaries,
            n_states,
            components,
            model.as_ref(),
        );

        let graph = chain_graph(&candidate);
        let realigned: Vec<Vec<usize>> = examples
            .iter()
            .zip(boundaries.iter())
            .map(|(example, old)| match decode::align(&graph, example, 0.0) {
                Some(alignment) => boundaries_from_path(
                    &alignment
                        .path
                        .iter()
                        .map(|&(_, ordinal)| ordinal)
                        .collect::<Vec<_>>(),
                ),
                // Degenerate alignment: keep the previous partition.
                None => old.clone(),
            })
            .collect();

        iterations += 1;
        let converged = realigned == boundaries;
        boundaries = realigned;
        model = Some(candidate);

        if converged {
            components *= 2;
            if components > n_gaussians {
                break;
            }
            debug!("{label}: alignment stable, splitting mixtures to {components}");
        }
        if iterations >= MAX_TRAINING_ITERATIONS {
            debug!("{label}: stopping after {iterations} rounds without full convergence");
            break;
        }
    }
    model.expect("at least one re-estimation round ran")
}

/// `n_states + 1` boundary indexes splitting `len` frames as evenly as integers allow.
fn uniform_boundaries(len: usize, n_states: usize) -> Vec<usize> {
    (0..=n_states).map(|i| i * len / n_states).collect()
}

/// Boundary indexes from a per-frame state path: the positions where the state changes.
fn boundaries_from_path(path: &[usize]) -> Vec<usize> {
    let mut boundaries = vec![0];
    for (index, pair) in path.windows(2).enumerate() {
        if pair[0] != pair[1] {
            boundaries.push(index + 1);
        }
    }
    boundaries.push(path.len());
    boundaries
}

/// One re-estimation pass: fit mixtures and transitions to the current partition. `previous`
/// seeds each state's K-means so mixture splitting continues from where the last round ended.
fn reestimate(
    label: ModelLabel,
    examples: &[Array2<f32>],
    boundaries: &[Vec<usize>],
    n_states: usize,
    components: usize,
    previous: Option<&DigitHmm>,
) -> DigitHmm {
    let n_examples = examples.len();
    let mut states = Vec::with_capacity(n_states);
    let mut self_loops = Vec::with_capacity(n_states);
    let mut forwards = Vec::with_capacity(n_states - 1);
    let mut exit_probability = 0.0;

    for state in 0..n_states {
        let mut rows: Vec<Array1<f32>> = vec![];
        for (example, bounds) in examples.iter().zip(boundaries.iter()) {
            let (from, to) = (bounds[state], bounds[state + 1]);
            for row in example.slice(ndarray::s![from..to, ..]).rows() {
                rows.push(row.to_owned());
            }
        }
        assert!(!rows.is_empty(), "state {state} of {label} has no frames");
        let total = rows.len();

        let seed = previous.map(|hmm| &hmm.states[state]);
        states.push(fit_mixture(&rows, components, seed, state, label));

        // Occupancy-derived transitions: of the `total` frames that sat in this state, one per
        // example moved on.
        let total = total as f64;
        let n = n_examples as f64;
        self_loops.push((total - n).max(0.0) / total);
        if state + 1 < n_states {
            forwards.push(n / total);
        } else {
            exit_probability = (n / total).min(1.0);
        }
    }

    DigitHmm {
        label,
        states,
        self_loops,
        forwards,
        exit_probability,
    }
}

/// Fit one state's mixture by K-means over its frames. Seeding: with no prior mixture, the
/// frames' mean; with a prior of the same size, its means; with a prior of half the size, each
/// prior mean split into a 0.9× and a 1.1× copy.
fn fit_mixture(
    rows: &[Array1<f32>],
    components: usize,
    seed: Option<&GaussianMixture>,
    state: usize,
    label: ModelLabel,
) -> GaussianMixture {
    let dim = rows[0].len();
    let mut data = Array2::<f32>::zeros((rows.len(), dim));
    for (i, row) in rows.iter().enumerate() {
        data.row_mut(i).assign(row);
    }
    // A state can end up with fewer frames than requested components; cap rather than abort the
    // whole training run.
    let components = components.min(rows.len());

    let mut centers: Vec<Array1<f32>> = match seed {
        Some(mixture) if mixture.n_components() == components => mixture.means.clone(),
        Some(mixture) if mixture.n_components() * 2 == components => mixture
            .means
            .iter()
            .flat_map(|m| [m.mapv(|x| x * 0.9), m.mapv(|x| x * 1.1)])
            .collect(),
        _ => vec![data.mean_axis(Axis(0)).expect("state has frames")],
    };
    // Splitting from a single seed until enough centres exist covers restarts at higher counts.
    while centers.len() < components {
        centers = centers
            .iter()
            .flat_map(|c| [c.mapv(|x| x * 0.9), c.mapv(|x| x * 1.1)])
            .collect();
    }
    centers.truncate(components);

    let assignments = kmeans(&data, &mut centers);
    let counts: Vec<usize> = (0..components)
        .map(|k| assignments.iter().filter(|&&a| a == k).count())
        .collect();

    let mut means = Vec::with_capacity(components);
    let mut variances = Vec::with_capacity(components);
    let mut weights = Vec::with_capacity(components);
    for k in 0..components {
        let count = counts[k];
        assert!(count > 0, "empty cluster in state {state} of {label}");
        let mut mean = Array1::<f64>::zeros(dim);
        for (row, _) in data
            .rows()
            .into_iter()
            .zip(assignments.iter())
            .filter(|(_, &a)| a == k)
        {
            for (m, &x) in mean.iter_mut().zip(row.iter()) {
                *m += x as f64;
            }
        }
        mean.mapv_inplace(|m| m / count as f64);

        let variance = if count == 1 {
            // A one-frame cluster has no spread to estimate; fall back to identity.
            Array1::<f32>::ones(dim)
        } else {
            let mut sums = Array1::<f64>::zeros(dim);
            for (row, _) in data
                .rows()
                .into_iter()
                .zip(assignments.iter())
                .filter(|(_, &a)| a == k)
            {
                for ((s, &x), &m) in sums.iter_mut().zip(row.iter()).zip(mean.iter()) {
                    let diff = x as f64 - m;
                    *s += diff * diff;
                }
            }
            // Sample covariance diagonal plus the offset.
            Array1::from_iter(
                sums.iter()
                    .map(|&s| (s / (count - 1) as f64) as f32 + VARIANCE_OFFSET),
            )
        };

        means.push(mean.mapv(|m| m as f32));
        variances.push(variance);
        weights.push(count as f64 / data.nrows() as f64);
    }

    GaussianMixture {
        means,
        variances,
        weights,
    }
}

/// Lloyd's algorithm from the given seed centres. Returns the cluster assignment per row;
/// `centers` is updated in place. An emptied cluster is reseeded from the point furthest from
/// its current centre so clusters never die.
fn kmeans(data: &Array2<f32>, centers: &mut Vec<Array1<f32>>) -> Vec<usize> {
    let (n, dim) = data.dim();
    let k = centers.len();
    assert!(n >= k && k > 0);

    let distance = |row: ndarray::ArrayView1<f32>, center: &Array1<f32>| -> f32 {
        row.iter()
            .zip(center.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum()
    };

    let mut assignments = vec![0usize; n];
    for _ in 0..100 {
        let mut changed = false;
        for (i, row) in data.rows().into_iter().enumerate() {
            let mut best = 0;
            let mut best_distance = f32::INFINITY;
            for (cluster, center) in centers.iter().enumerate() {
                let d = distance(row, center);
                if d < best_distance {
                    best_distance = d;
                    best = cluster;
                }
            }
            if assignments[i] != best {
                assignments[i] = best;
                changed = true;
            }
        }

        let mut sums = vec![Array1::<f64>::zeros(dim); k];
        let mut counts = vec![0usize; k];
        for (row, &a) in data.rows().into_iter().zip(assignments.iter()) {
            counts[a] += 1;
            for (s, &x) in sums[a].iter_mut().zip(row.iter()) {
                *s += x as f64;
            }
        }
        for cluster in 0..k {
            if counts[cluster] == 0 {
                let (farthest, _) = data
                    .rows()
                    .into_iter()
                    .enumerate()
                    .map(|(i, row)| (i, distance(row, &centers[assignments[i]])))
                    .max_by(|a, b| a.1.total_cmp(&b.1))
                    .expect("non-empty data");
                assignments[farthest] = cluster;
                centers[cluster] = data.row(farthest).to_owned();
                changed = true;
                continue;
            }
            centers[cluster] = Array1::from_iter(
                sums[cluster]
                    .iter()
                    .map(|&s| (s / counts[cluster] as f64) as f32),
            );
        }

        if !changed {
            break;
        }
    }
    assignments
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two clearly separated phases with a little deterministic jitter.
    fn two_phase_example(len: usize, low: f32, high: f32) -> Array2<f32> {
        Array2::from_shape_fn((len, 2), |(t, d)| {
            let base = if t < len / 2 { low } else { high };
            base + ((t * 3 + d * 7) % 5) as f32 * 0.01
        })
    }

    #[test]
    fn uniform_boundaries_cover_the_example() {
        assert_eq!(uniform_boundaries(10, 5), vec![0, 2, 4, 6, 8, 10]);
        assert_eq!(uniform_boundaries(7, 5), vec![0, 1, 2, 4, 5, 7]);
    }

    #[test]
    fn boundaries_from_path_mark_state_changes() {
        assert_eq!(boundaries_from_path(&[0, 0, 1, 1, 1, 2]), vec![0, 2, 5, 6]);
        assert_eq!(boundaries_from_path(&[0, 0, 0]), vec![0, 3]);
    }

    #[test]
    fn trained_model_separates_the_phases() {
        let examples: Vec<Array2<f32>> = (0..4).map(|_| two_phase_example(20, 0.0, 8.0)).collect();
        let model = train_digit_hmm(ModelLabel::Digit(2), &examples, 2, 1);

        assert_eq!(model.n_states(), 2);
        // First state near the low phase, second near the high phase.
        assert!(model.states[0].means[0][0] < 1.0);
        assert!(model.states[1].means[0][0] > 7.0);
    }

    #[test]
    fn transition_probabilities_carry_the_full_mass() {
        let examples: Vec<Array2<f32>> = (0..3).map(|_| two_phase_example(24, -2.0, 2.0)).collect();
        let model = train_digit_hmm(ModelLabel::Digit(5), &examples, 2, 2);

        // Inner state: self loop plus forward sums to one.
        assert!((model.self_loops[0] + model.forwards[0] - 1.0).abs() < 1e-12);
        // Last state: the residual beyond the self loop is exactly the exit probability,
        // i.e. exp(-exit_loss).
        let last = model.n_states() - 1;
        assert!((model.self_loops[last] + model.exit_probability - 1.0).abs() < 1e-12);
        assert!((model.exit_loss() - (-model.exit_probability.ln())).abs() < 1e-12);
        assert!(((-model.exit_loss()).exp() - model.exit_probability).abs() < 1e-12);
    }

    #[test]
    fn mixture_splitting_reaches_the_requested_count() {
        // Each phase itself is bimodal, so two components per state have signal to latch onto.
        let examples: Vec<Array2<f32>> = (0..4)
            .map(|i| {
                Array2::from_shape_fn((24, 2), |(t, d)| {
                    let base = if t < 12 { 0.0 } else { 10.0 };
                    let mode = if (t + i) % 2 == 0 { -1.0 } else { 1.0 };
                    base + mode + (d as f32) * 0.01
                })
            })
            .collect();
        let model = train_digit_hmm(ModelLabel::Digit(8), &examples, 2, 2);
        for state in &model.states {
            assert_eq!(state.n_components(), 2);
            let weight_sum: f64 = state.weights.iter().sum();
            assert!((weight_sum - 1.0).abs() < 1e-9);
            for variance in &state.variances {
                assert!(variance.iter().all(|&v| v > 0.0));
            }
        }
    }

    #[test]
    fn single_frame_states_get_identity_covariance() {
        // One example, two states, two frames: each state sees exactly one frame.
        let example = Array2::from_shape_fn((2, 3), |(t, _)| t as f32 * 5.0);
        let model = train_digit_hmm(ModelLabel::Digit(1), &[example], 2, 1);
        for state in &model.states {
            assert!(state.variances[0].iter().all(|&v| v == 1.0));
        }
    }

    #[test]
    fn silence_models_train_as_single_state_chains() {
        let examples: Vec<Array2<f32>> =
            (0..3).map(|_| two_phase_example(10, 0.1, 0.1)).collect();
        let model = train_digit_hmm(ModelLabel::Silence, &examples, 1, 2);
        assert_eq!(model.n_states(), 1);
        assert!(model.forwards.is_empty());
        assert!(model.exit_probability > 0.0);
    }

    #[test]
    fn kmeans_separates_two_obvious_clusters() {
        let data = Array2::from_shape_fn((10, 2), |(i, _)| if i < 5 { 0.0 } else { 10.0 });
        let mut centers = vec![
            Array1::from_elem(2, 4.0f32),
            Array1::from_elem(2, 6.0f32),
        ];
        let assignments = kmeans(&data, &mut centers);
        assert!(assignments[..5].iter().all(|&a| a == assignments[0]));
        assert!(assignments[5..].iter().all(|&a| a == assignments[5]));
        assert_ne!(assignments[0], assignments[5]);
    }
}
