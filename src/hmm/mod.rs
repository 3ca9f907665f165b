//! Hidden Markov models over boosted MFCC features, and the state graphs composed from them.
//!
//! Each digit gets a left-to-right chain of five emitting states, every state a small diagonal
//! covariance Gaussian mixture. Only self-loops and forward-by-one transitions exist inside a
//! chain, so a digit is forced to move through its states in order, lingering where the evidence
//! says to linger. Training ([`train`]) is segmental K-means; recognition composes trained
//! chains into a grammar graph ([`graph`]) and runs token-passing Viterbi over it ([`decode`]);
//! [`embedded`] re-trains the chains from continuous speech.
//!
//! Graphs keep their states in a flat arena and refer to each other by index. The unrestricted
//! digit grammar is cyclic (every digit loops back through one connector) and parent/child
//! ownership across a cycle is exactly the fight with the borrow checker nobody wins; indices
//! sidestep it and make cloning a graph a `Vec` copy.
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod decode;
pub mod embedded;
pub mod graph;
pub mod train;

pub use decode::{align, decode, Alignment, Recognition};
pub use graph::{chain_graph, isolated_graph, sequence_graph, telephone_graph, unrestricted_graph};
pub use train::train_digit_hmm;

/// What a state (or a whole model) stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ModelLabel {
    /// A spoken digit; 0–9 in the grammar graphs, 10 meaning "ten" for isolated recognition.
    Digit(u8),
    Silence,
}

impl fmt::Display for ModelLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelLabel::Digit(d) => write!(f, "{d}"),
            ModelLabel::Silence => write!(f, "sil"),
        }
    }
}

/// A diagonal-covariance Gaussian mixture, the emission distribution of one state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GaussianMixture {
    /// Component means, one 39-vector each.
    pub means: Vec<Array1<f32>>,
    /// Diagonals of the component covariances, parallel to `means`. Strictly positive.
    pub variances: Vec<Array1<f32>>,
    /// Component weights, positive and summing to one.
    pub weights: Vec<f64>,
}

impl GaussianMixture {
    pub fn n_components(&self) -> usize {
        self.means.len()
    }

    /// Emission loss of a frame: the best single component's negative log density, weighted.
    /// Using the best component instead of the mixture sum keeps everything in plain log space
    /// with no overflow guard; with well separated components the difference is a rounding
    /// error.
    pub fn emission_loss(&self, frame: ArrayView1<f32>) -> f64 {
        assert!(!self.means.is_empty(), "emission loss of a non-emitting state");
        let mut best = f64::INFINITY;
        for ((mean, variance), &weight) in
            self.means.iter().zip(self.variances.iter()).zip(self.weights.iter())
        {
            if weight <= 0.0 {
                continue;
            }
            let loss = -log_density_diag(frame, mean, variance) - weight.ln();
            if loss < best {
                best = loss;
            }
        }
        best
    }
}

/// Log density of a diagonal-covariance Gaussian, accumulated in f64.
fn log_density_diag(x: ArrayView1<f32>, mean: &Array1<f32>, variance: &Array1<f32>) -> f64 {
    debug_assert_eq!(x.len(), mean.len());
    let d = x.len() as f64;
    let mut log_det = 0.0f64;
    let mut exponent = 0.0f64;
    for ((&x, &mu), &var) in x.iter().zip(mean.iter()).zip(variance.iter()) {
        let var = var as f64;
        log_det += var.ln();
        let diff = x as f64 - mu as f64;
        exponent += diff * diff / var;
    }
    -0.5 * (d * (2.0 * std::f64::consts::PI).ln() + log_det) - 0.5 * exponent
}

/// A trained left-to-right chain model for one label. Transition quantities are stored as
/// probabilities (losses are derived on demand) so the model serializes cleanly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigitHmm {
    pub label: ModelLabel,
    /// Emission mixtures, one per state in chain order.
    pub states: Vec<GaussianMixture>,
    /// Self-loop probability per state.
    pub self_loops: Vec<f64>,
    /// Forward-by-one probability per state; one shorter than `states`.
    pub forwards: Vec<f64>,
    /// Probability that the last state exits the model instead of looping.
    pub exit_probability: f64,
}

impl DigitHmm {
    pub fn n_states(&self) -> usize {
        self.states.len()
    }

    /// Negative log probability of leaving the model from its last state.
    pub fn exit_loss(&self) -> f64 {
        neg_ln(self.exit_probability)
    }
}

/// Negative natural log, with zero probability mapping to an infinite loss.
pub(crate) fn neg_ln(probability: f64) -> f64 {
    if probability > 0.0 {
        -probability.ln()
    } else {
        f64::INFINITY
    }
}

/// An incoming transition of a graph state.
#[derive(Debug, Clone)]
pub struct Edge {
    pub from: usize,
    pub loss: f64,
    /// A label recorded in the decoder's back-pointer chain when this edge is taken; set on the
    /// model-exit edges of grammar graphs.
    pub emit: Option<ModelLabel>,
}

/// One state of a composed graph: either an emitting state cloned out of a [`DigitHmm`], or a
/// non-emitting connector that consumes no observation.
#[derive(Debug, Clone)]
pub struct GraphState {
    /// `None` marks a non-emitting connector.
    pub emission: Option<GaussianMixture>,
    /// Incoming edges, in insertion order. Ties in the decoder go to the earliest entry.
    pub entries: Vec<Edge>,
    pub label: Option<ModelLabel>,
    /// Position of the state within its source chain; 0 for connectors.
    pub ordinal: usize,
}

impl GraphState {
    pub fn is_non_emitting(&self) -> bool {
        self.emission.is_none()
    }
}

/// A recognition graph: states in a flat arena, one start and one end connector. Building a
/// graph deep-clones the mixtures out of the source models, so graphs can be built and thrown
/// away freely without ever touching a trained [`DigitHmm`].
#[derive(Debug, Clone, Default)]
pub struct Graph {
    pub states: Vec<GraphState>,
    pub start: usize,
    pub end: usize,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a non-emitting connector.
    pub fn add_connector(&mut self) -> usize {
        self.states.push(GraphState {
            emission: None,
            entries: vec![],
            label: None,
            ordinal: 0,
        });
        self.states.len() - 1
    }

    pub fn add_edge(&mut self, from: usize, to: usize, loss: f64, emit: Option<ModelLabel>) {
        self.states[to].entries.push(Edge { from, loss, emit });
    }

    /// Clone a model's chain into the arena, wiring `entry → first state` with `entry_loss` and
    /// the self-loop/forward structure inside the chain. Returns the first and last state
    /// indexes; the exit edge is the caller's business.
    pub fn add_model(&mut self, hmm: &DigitHmm, entry: usize, entry_loss: f64) -> (usize, usize) {
        assert!(hmm.n_states() > 0, "model with no states");
        let first = self.states.len();
        for (ordinal, mixture) in hmm.states.iter().enumerate() {
            self.states.push(GraphState {
                emission: Some(mixture.clone()),
                entries: vec![],
                label: Some(hmm.label),
                ordinal,
            });
        }
        let last = self.states.len() - 1;

        self.add_edge(entry, first, entry_loss, None);
        for (offset, &probability) in hmm.self_loops.iter().enumerate() {
            let state = first + offset;
            self.add_edge(state, state, neg_ln(probability), None);
        }
        for (offset, &probability) in hmm.forwards.iter().enumerate() {
            let from = first + offset;
            self.add_edge(from, from + 1, neg_ln(probability), None);
        }
        (first, last)
    }

    /// Indexes of the non-emitting connectors in insertion order.
    pub fn non_emitting(&self) -> impl Iterator<Item = usize> + '_ {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_non_emitting())
            .map(|(i, _)| i)
    }

    /// A structural fingerprint: per-state label, ordinal and incoming shape. Two graphs built
    /// the same way compare equal here even though mixtures don't implement `Eq`.
    pub fn topology(&self) -> Vec<String> {
        self.states
            .iter()
            .map(|state| {
                let label = state
                    .label
                    .map(|l| l.to_string())
                    .unwrap_or_else(|| "-".into());
                let entries: Vec<String> = state
                    .entries
                    .iter()
                    .map(|e| format!("{}{}", e.from, e.emit.map(|l| l.to_string()).unwrap_or_default()))
                    .collect();
                format!(
                    "{label}/{}:{}<-{}",
                    state.ordinal,
                    if state.is_non_emitting() { "c" } else { "e" },
                    entries.join(",")
                )
            })
            .collect()
    }
}
