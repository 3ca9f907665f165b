//! Embedded retraining: improving isolated-digit models with continuous speech.
//!
//! Isolated recordings are clean but unrepresentative — nobody pauses between digits when
//! reading a number out. Given utterances with known digit sequences, each one is aligned
//! against a linear graph of its own labels (silence, the digits, silence), the utterance's
//! frames are carved up by which digit claimed them, and every digit's model is retrained on its
//! isolated examples plus all the segments carved out of the continuous speech. New models give
//! new alignments, so the whole thing iterates until the frame labelling stops moving.
use super::graph::SequenceCosts;
use super::{decode, sequence_graph, train_digit_hmm, DigitHmm, ModelLabel};
use ndarray::{s, Array2};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Knobs for [`retrain_from_sequences`]. The defaults match how the digit models are trained in
/// the first place.
#[derive(Debug, Clone, Copy)]
pub struct EmbeddedConfig {
    pub n_states: usize,
    pub n_gaussians: usize,
    /// Alignment beam; zero disables pruning.
    pub beam: f64,
    /// Extra transition losses inside the sequence graphs.
    pub sequence_costs: SequenceCosts,
    /// Stop once fewer than this fraction of frames change their (digit, state) label.
    pub churn_tolerance: f64,
    pub max_iterations: usize,
}

impl Default for EmbeddedConfig {
    fn default() -> Self {
        Self {
            n_states: super::train::DEFAULT_N_STATES,
            n_gaussians: super::train::DEFAULT_N_GAUSSIANS,
            beam: 0.0,
            sequence_costs: SequenceCosts::default(),
            churn_tolerance: 0.05,
            max_iterations: 20,
        }
    }
}

/// A labelled continuous-speech utterance: its digit string and the features of each take.
pub struct LabelledSequence {
    pub digits: String,
    pub takes: Vec<Array2<f32>>,
}

/// Retrain per-digit models from continuous speech, bootstrapping with `isolated` examples.
/// `isolated` maps each digit 0–9 to its isolated feature matrices; the silence model is taken
/// as fixed. Returns the retrained models keyed by digit.
pub fn retrain_from_sequences(
    isolated: &BTreeMap<u8, Vec<Array2<f32>>>,
    sequences: &[LabelledSequence],
    silence: &DigitHmm,
    config: EmbeddedConfig,
) -> BTreeMap<u8, DigitHmm> {
    assert!(!isolated.is_empty(), "no isolated examples to bootstrap from");

    let mut models: BTreeMap<u8, DigitHmm> = BTreeMap::new();
    // Per-utterance-take frame labels from the previous iteration, for the churn measure.
    let mut previous_labels: Vec<Vec<(ModelLabel, usize)>> = vec![];
    let mut pooled: BTreeMap<u8, Vec<Array2<f32>>> = isolated.clone();

    for iteration in 0..config.max_iterations {
        models = pooled
            .iter()
            .map(|(&digit, examples)| {
                (
                    digit,
                    train_digit_hmm(
                        ModelLabel::Digit(digit),
                        examples,
                        config.n_states,
                        config.n_gaussians,
                    ),
                )
            })
            .collect();
        let digit_models: Vec<DigitHmm> = (0..10)
            .map(|d| {
                models
                    .get(&d)
                    .cloned()
                    .unwrap_or_else(|| panic!("no model for digit {d}"))
            })
            .collect();

        // Re-segment every take and pool the segments with the isolated data.
        pooled = isolated.clone();
        let mut labels: Vec<Vec<(ModelLabel, usize)>> = vec![];
        for sequence in sequences {
            let graph = sequence_graph(
                &sequence.digits,
                &digit_models,
                silence,
                config.sequence_costs,
            );
            for take in &sequence.takes {
                match decode::align(&graph, take, config.beam) {
                    Some(alignment) => {
                        for (digit, from, to) in digit_segments(&alignment.path) {
                            // A segment shorter than the chain cannot be an example on its own.
                            if to - from >= config.n_states {
                                pooled
                                    .entry(digit)
                                    .or_default()
                                    .push(take.slice(s![from..to, ..]).to_owned());
                            }
                        }
                        labels.push(alignment.path);
                    }
                    None => {
                        warn!(
                            "no alignment for a take of `{}`; skipping it this round",
                            sequence.digits
                        );
                        labels.push(vec![]);
                    }
                }
            }
        }

        let churn = label_churn(&previous_labels, &labels);
        info!(
            "embedded retraining round {}: frame label churn {:.2?}",
            iteration + 1,
            churn
        );
        if let Some(churn) = churn {
            if churn < config.churn_tolerance {
                break;
            }
        }
        previous_labels = labels;
    }
    models
}

/// Contiguous runs of digit-labelled frames in an alignment path, as (digit, from, to).
fn digit_segments(path: &[(ModelLabel, usize)]) -> Vec<(u8, usize, usize)> {
    let mut segments = vec![];
    let mut current: Option<(u8, usize)> = None;
    for (index, &(label, _)) in path.iter().enumerate() {
        let digit = match label {
            ModelLabel::Digit(d) => Some(d),
            ModelLabel::Silence => None,
        };
        match (current, digit) {
            (Some((d, from)), Some(next)) if d != next => {
                segments.push((d, from, index));
                current = Some((next, index));
            }
            (Some((d, from)), None) => {
                segments.push((d, from, index));
                current = None;
            }
            (None, Some(next)) => current = Some((next, index)),
            _ => {}
        }
    }
    if let Some((d, from)) = current {
        segments.push((d, from, path.len()));
    }
    segments
}

/// Fraction of frames whose (label, state) changed between iterations; `None` until two
/// comparable labellings exist.
fn label_churn(
    previous: &[Vec<(ModelLabel, usize)>],
    current: &[Vec<(ModelLabel, usize)>],
) -> Option<f64> {
    if previous.is_empty() || previous.len() != current.len() {
        return None;
    }
    let mut total = 0usize;
    let mut changed = 0usize;
    for (old, new) in previous.iter().zip(current.iter()) {
        if old.len() != new.len() {
            // A take dropped in or out of alignment; count it as fully churned.
            total += old.len().max(new.len());
            changed += old.len().max(new.len());
            continue;
        }
        total += old.len();
        changed += old.iter().zip(new.iter()).filter(|(a, b)| a != b).count();
    }
    (total > 0).then(|| changed as f64 / total as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    /// A synthetic "digit" as a block of frames around a per-digit value.
    fn digit_block(digit: u8, len: usize) -> Array2<f32> {
        Array2::from_shape_fn((len, 2), |(t, d)| {
            digit as f32 * 4.0 + ((t + d) % 3) as f32 * 0.05
        })
    }

    fn silence_block(len: usize) -> Array2<f32> {
        Array2::from_shape_fn((len, 2), |(t, d)| -10.0 + ((t + d) % 2) as f32 * 0.05)
    }

    fn concat(blocks: &[Array2<f32>]) -> Array2<f32> {
        let total: usize = blocks.iter().map(|b| b.nrows()).sum();
        let mut out = Array2::<f32>::zeros((total, 2));
        let mut offset = 0;
        for block in blocks {
            out.slice_mut(s![offset..offset + block.nrows(), ..])
                .assign(block);
            offset += block.nrows();
        }
        out
    }

    #[test]
    fn digit_segments_split_on_label_changes() {
        use ModelLabel::*;
        let path = vec![
            (Silence, 0),
            (Digit(1), 0),
            (Digit(1), 1),
            (Digit(2), 0),
            (Silence, 0),
        ];
        assert_eq!(digit_segments(&path), vec![(1, 1, 3), (2, 3, 4)]);
    }

    #[test]
    fn churn_counts_changed_frames() {
        use ModelLabel::*;
        let a = vec![vec![(Digit(1), 0), (Digit(1), 1)]];
        let b = vec![vec![(Digit(1), 0), (Digit(2), 0)]];
        assert_eq!(label_churn(&a, &b), Some(0.5));
        assert_eq!(label_churn(&[], &b), None);
    }

    #[test]
    fn retraining_converges_on_synthetic_sequences() {
        // Isolated examples for digits 0 and 1, well separated in feature space.
        let mut isolated = BTreeMap::new();
        for digit in 0..10u8 {
            isolated.insert(digit, vec![digit_block(digit, 12), digit_block(digit, 10)]);
        }
        let silence = train_digit_hmm(
            ModelLabel::Silence,
            &[silence_block(10), silence_block(8)],
            1,
            1,
        );

        let sequences = vec![LabelledSequence {
            digits: "01".into(),
            takes: vec![concat(&[
                silence_block(6),
                digit_block(0, 10),
                digit_block(1, 10),
                silence_block(6),
            ])],
        }];

        let config = EmbeddedConfig {
            n_states: 2,
            n_gaussians: 1,
            ..Default::default()
        };
        let models = retrain_from_sequences(&isolated, &sequences, &silence, config);
        assert_eq!(models.len(), 10);
        // Digit 0's model must still sit near its feature value after pooling.
        let mean = models[&0].states[0].means[0][0];
        assert!(mean.abs() < 1.0, "digit 0 mean drifted to {mean}");
    }
}
