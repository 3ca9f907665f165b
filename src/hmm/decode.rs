//! Token-passing Viterbi over a composed graph.
//!
//! One token per state: the best loss of any path ending there, plus a back-pointer into an
//! arena of word ends. Each frame the non-emitting connectors are settled first — they consume
//! nothing, so transitions through them are applied until no token improves — then every
//! emitting state takes its best incoming token plus transition and emission loss. Tokens
//! further than the beam width above the frame's best are dropped. Back-pointers only point
//! backwards in time, so the arena grows monotonically during a pass and is dropped whole at the
//! end.
//!
//! All updates are strict improvements over predecessors visited in insertion order, so a tie
//! keeps the earliest-inserted predecessor and runs are deterministic.
use super::{Graph, ModelLabel};
use ndarray::Array2;
use tracing::{debug, warn};

/// The decoder's per-state element: accumulated loss, the last word end on the path, and the
/// emitting state that consumed the most recent frame.
#[derive(Debug, Clone, Copy)]
struct Token {
    loss: f64,
    word_end: Option<usize>,
    origin: Option<usize>,
}

/// An arena record of one recognised label and the word end preceding it.
#[derive(Debug, Clone, Copy)]
struct WordEnd {
    label: ModelLabel,
    prev: Option<usize>,
}

/// The label sequence read off the best path, with its total loss. An unreachable end state
/// yields no labels and an infinite loss.
#[derive(Debug, Clone, PartialEq)]
pub struct Recognition {
    pub labels: Vec<ModelLabel>,
    pub loss: f64,
}

impl Recognition {
    pub fn no_path() -> Self {
        Self {
            labels: vec![],
            loss: f64::INFINITY,
        }
    }

    /// The recognised digits as a string, e.g. `"8743021"`.
    pub fn digits_string(&self) -> String {
        self.labels
            .iter()
            .filter_map(|label| match label {
                ModelLabel::Digit(d) => Some(d.to_string()),
                ModelLabel::Silence => None,
            })
            .collect()
    }
}

/// A per-frame state path through a graph, for training alignments.
#[derive(Debug, Clone, PartialEq)]
pub struct Alignment {
    /// For every frame, the label and within-chain ordinal of the state that consumed it.
    pub path: Vec<(ModelLabel, usize)>,
    pub loss: f64,
}

/// Apply every non-emitting transition until no token improves. Connectors are few and mostly
/// feed forward, so this settles in one or two rounds; a cycle through emitting states never
/// enters here.
fn settle_connectors(graph: &Graph, tokens: &mut [Option<Token>], arena: &mut Vec<WordEnd>) {
    loop {
        let mut changed = false;
        for index in graph.non_emitting() {
            let mut best = tokens[index];
            for edge in &graph.states[index].entries {
                let Some(source) = tokens[edge.from] else {
                    continue;
                };
                let loss = source.loss + edge.loss;
                if !loss.is_finite() {
                    continue;
                }
                if best.map_or(true, |b| loss < b.loss) {
                    let word_end = match edge.emit {
                        Some(label) => {
                            arena.push(WordEnd {
                                label,
                                prev: source.word_end,
                            });
                            Some(arena.len() - 1)
                        }
                        None => source.word_end,
                    };
                    best = Some(Token {
                        loss,
                        word_end,
                        origin: source.origin,
                    });
                    changed = true;
                }
            }
            tokens[index] = best;
        }
        if !changed {
            break;
        }
    }
}

/// Best incoming token for one state, before emission.
fn best_entry(
    graph: &Graph,
    tokens: &[Option<Token>],
    index: usize,
    arena: &mut Vec<WordEnd>,
) -> Option<Token> {
    let mut best: Option<Token> = None;
    for edge in &graph.states[index].entries {
        let Some(source) = tokens[edge.from] else {
            continue;
        };
        let loss = source.loss + edge.loss;
        if !loss.is_finite() {
            continue;
        }
        if best.map_or(true, |b| loss < b.loss) {
            let word_end = match edge.emit {
                Some(label) => {
                    arena.push(WordEnd {
                        label,
                        prev: source.word_end,
                    });
                    Some(arena.len() - 1)
                }
                None => source.word_end,
            };
            best = Some(Token {
                loss,
                word_end,
                origin: source.origin,
            });
        }
    }
    best
}

/// Decode `features` against `graph` with token passing. `beam` bounds how far a token may
/// trail the frame's best before it is dropped; zero or negative disables pruning entirely and
/// the result is the exact trellis minimum.
pub fn decode(graph: &Graph, features: &Array2<f32>, beam: f64) -> Recognition {
    let n = graph.states.len();
    let mut arena: Vec<WordEnd> = vec![];
    let mut tokens: Vec<Option<Token>> = vec![None; n];
    tokens[graph.start] = Some(Token {
        loss: 0.0,
        word_end: None,
        origin: None,
    });

    for frame in features.rows() {
        settle_connectors(graph, &mut tokens, &mut arena);

        let mut new_tokens: Vec<Option<Token>> = vec![None; n];
        let mut round_min = f64::INFINITY;
        for index in 0..n {
            let Some(emission) = &graph.states[index].emission else {
                continue;
            };
            if let Some(mut token) = best_entry(graph, &tokens, index, &mut arena) {
                let emission_loss = emission.emission_loss(frame);
                if !emission_loss.is_finite() {
                    // Underflowed emission: this state cannot be entered on this frame.
                    continue;
                }
                token.loss += emission_loss;
                token.origin = Some(index);
                round_min = round_min.min(token.loss);
                new_tokens[index] = Some(token);
            }
        }

        if beam > 0.0 {
            let threshold = round_min + beam;
            for token in new_tokens.iter_mut() {
                if token.map_or(false, |t| t.loss > threshold) {
                    *token = None;
                }
            }
        }
        tokens = new_tokens;
    }

    settle_connectors(graph, &mut tokens, &mut arena);

    let Some(final_token) = tokens[graph.end] else {
        warn!("no path through the graph; over-pruned or mismatched input");
        return Recognition::no_path();
    };

    let mut reversed = vec![];
    let mut current = final_token.word_end;
    while let Some(index) = current {
        reversed.push(arena[index].label);
        current = arena[index].prev;
    }
    reversed.reverse();
    debug!("decoded {} labels at loss {:.1}", reversed.len(), final_token.loss);
    Recognition {
        labels: reversed,
        loss: final_token.loss,
    }
}

/// Viterbi alignment with full traceback: which state consumed every frame. Used by training,
/// where the per-frame (label, state) partition is the product. Returns `None` when no complete
/// path exists (over-pruning, or fewer frames than the graph's shortest path).
pub fn align(graph: &Graph, features: &Array2<f32>, beam: f64) -> Option<Alignment> {
    let n = graph.states.len();
    let n_frames = features.nrows();
    if n_frames == 0 {
        return None;
    }
    let mut arena: Vec<WordEnd> = vec![];
    let mut tokens: Vec<Option<Token>> = vec![None; n];
    tokens[graph.start] = Some(Token {
        loss: 0.0,
        word_end: None,
        origin: None,
    });

    // back_pointers[t][s]: the emitting state that consumed frame t-1 on the best path into
    // state s at frame t.
    let mut back_pointers: Vec<Vec<Option<usize>>> = Vec::with_capacity(n_frames);

    for frame in features.rows() {
        settle_connectors(graph, &mut tokens, &mut arena);

        let mut new_tokens: Vec<Option<Token>> = vec![None; n];
        let mut pointers: Vec<Option<usize>> = vec![None; n];
        let mut round_min = f64::INFINITY;
        for index in 0..n {
            let Some(emission) = &graph.states[index].emission else {
                continue;
            };
            if let Some(mut token) = best_entry(graph, &tokens, index, &mut arena) {
                let emission_loss = emission.emission_loss(frame);
                if !emission_loss.is_finite() {
                    continue;
                }
                pointers[index] = token.origin;
                token.loss += emission_loss;
                token.origin = Some(index);
                round_min = round_min.min(token.loss);
                new_tokens[index] = Some(token);
            }
        }

        if beam > 0.0 {
            let threshold = round_min + beam;
            for token in new_tokens.iter_mut() {
                if token.map_or(false, |t| t.loss > threshold) {
                    *token = None;
                }
            }
        }
        back_pointers.push(pointers);
        tokens = new_tokens;
    }

    settle_connectors(graph, &mut tokens, &mut arena);
    let final_token = tokens[graph.end]?;

    let mut states = vec![0usize; n_frames];
    let mut current = final_token.origin?;
    for t in (0..n_frames).rev() {
        states[t] = current;
        if t > 0 {
            current = back_pointers[t][current]?;
        }
    }

    let path = states
        .iter()
        .map(|&s| {
            let state = &graph.states[s];
            (
                state.label.expect("emitting states carry labels"),
                state.ordinal,
            )
        })
        .collect();
    Some(Alignment {
        path,
        loss: final_token.loss,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hmm::graph::{chain_graph, isolated_graph, unrestricted_graph};
    use crate::hmm::tests::unit_mixture;
    use crate::hmm::{DigitHmm, ModelLabel};
    use ndarray::Array2;

    fn two_state_model(label: u8, low: f32, high: f32) -> DigitHmm {
        DigitHmm {
            label: ModelLabel::Digit(label),
            states: vec![unit_mixture(&[low, low]), unit_mixture(&[high, high])],
            self_loops: vec![0.5, 0.5],
            forwards: vec![0.5],
            exit_probability: 0.5,
        }
    }

    fn frames(values: &[f32]) -> Array2<f32> {
        Array2::from_shape_fn((values.len(), 2), |(i, _)| values[i])
    }

    /// Exhaustive minimum path loss, for checking the decoder against. Only safe on tiny
    /// graphs.
    fn brute_force_min_loss(graph: &Graph, features: &Array2<f32>) -> f64 {
        let mut outgoing: Vec<Vec<(usize, f64)>> = vec![vec![]; graph.states.len()];
        for (to, state) in graph.states.iter().enumerate() {
            for edge in &state.entries {
                outgoing[edge.from].push((to, edge.loss));
            }
        }
        let mut best = f64::INFINITY;
        walk(graph, &outgoing, features, graph.start, 0, 0.0, &mut best);
        best
    }

    fn walk(
        graph: &Graph,
        outgoing: &[Vec<(usize, f64)>],
        features: &Array2<f32>,
        state: usize,
        frame: usize,
        loss: f64,
        best: &mut f64,
    ) {
        if loss >= *best {
            return;
        }
        if state == graph.end && frame == features.nrows() {
            *best = loss;
            return;
        }
        for &(to, edge_loss) in &outgoing[state] {
            match &graph.states[to].emission {
                None => {
                    // Connector: consumes nothing. The grammar graphs have no epsilon cycles.
                    walk(graph, outgoing, features, to, frame, loss + edge_loss, best);
                }
                Some(emission) => {
                    if frame < features.nrows() {
                        let step = emission.emission_loss(features.row(frame));
                        walk(graph, outgoing, features, to, frame + 1, loss + edge_loss + step, best);
                    }
                }
            }
        }
    }

    #[test]
    fn unpruned_decode_matches_brute_force() {
        let models = vec![two_state_model(0, 0.0, 1.0), two_state_model(1, 4.0, 5.0)];
        let graph = isolated_graph(&models);
        let input = frames(&[0.1, 0.4, 0.9, 1.1]);

        let recognition = decode(&graph, &input, 0.0);
        let brute = brute_force_min_loss(&graph, &input);
        assert!((recognition.loss - brute).abs() < 1e-9);
        assert_eq!(recognition.labels, vec![ModelLabel::Digit(0)]);
    }

    #[test]
    fn isolated_decode_picks_the_nearer_model() {
        let models = vec![two_state_model(0, 0.0, 1.0), two_state_model(1, 4.0, 5.0)];
        let graph = isolated_graph(&models);
        let near_one = frames(&[4.1, 4.0, 4.9, 5.2]);
        assert_eq!(decode(&graph, &near_one, 0.0).labels, vec![ModelLabel::Digit(1)]);
    }

    #[test]
    fn unrestricted_decode_matches_brute_force_and_reads_sequence() {
        let models = vec![two_state_model(0, 0.0, 1.0), two_state_model(1, 4.0, 5.0)];
        let graph = unrestricted_graph(&models, 0.1);
        // Digit 0 then digit 1, two frames each state.
        let input = frames(&[0.0, 1.0, 4.0, 5.0]);

        let recognition = decode(&graph, &input, 0.0);
        let brute = brute_force_min_loss(&graph, &input);
        assert!((recognition.loss - brute).abs() < 1e-9);
        assert_eq!(recognition.digits_string(), "01");
    }

    #[test]
    fn generous_beam_agrees_with_exact_decode() {
        let models = vec![two_state_model(0, 0.0, 1.0), two_state_model(1, 4.0, 5.0)];
        let graph = unrestricted_graph(&models, 0.5);
        let input = frames(&[0.0, 0.9, 4.1, 5.0, 0.2, 1.1]);
        let exact = decode(&graph, &input, 0.0);
        let pruned = decode(&graph, &input, 4000.0);
        assert_eq!(exact.labels, pruned.labels);
        assert!((exact.loss - pruned.loss).abs() < 1e-9);
    }

    #[test]
    fn empty_input_yields_empty_recognition() {
        let models = vec![two_state_model(0, 0.0, 1.0)];
        let graph = isolated_graph(&models);
        let recognition = decode(&graph, &Array2::<f32>::zeros((0, 2)), 0.0);
        assert!(recognition.labels.is_empty());
    }

    #[test]
    fn too_few_frames_is_no_path() {
        // Two emitting states but only one frame: the end connector is unreachable.
        let models = vec![two_state_model(0, 0.0, 1.0)];
        let graph = isolated_graph(&models);
        let recognition = decode(&graph, &frames(&[0.0]), 0.0);
        assert_eq!(recognition, Recognition::no_path());
    }

    #[test]
    fn alignment_reports_per_frame_states() {
        let model = two_state_model(7, 0.0, 1.0);
        let graph = chain_graph(&model);
        let input = frames(&[0.0, 0.1, 0.9, 1.0]);
        let alignment = align(&graph, &input, 0.0).unwrap();
        assert_eq!(alignment.path.len(), 4);
        assert_eq!(alignment.path[0], (ModelLabel::Digit(7), 0));
        assert_eq!(alignment.path[3], (ModelLabel::Digit(7), 1));
        // Ordinals never decrease in a left-to-right chain.
        for pair in alignment.path.windows(2) {
            assert!(pair[0].1 <= pair[1].1);
        }
    }

    #[test]
    fn single_frame_aligns_to_the_start_state() {
        let model = DigitHmm {
            label: ModelLabel::Silence,
            states: vec![unit_mixture(&[0.0, 0.0])],
            self_loops: vec![0.5],
            forwards: vec![],
            exit_probability: 0.5,
        };
        let graph = chain_graph(&model);
        let alignment = align(&graph, &frames(&[0.2]), 0.0).unwrap();
        assert_eq!(alignment.path, vec![(ModelLabel::Silence, 0)]);
    }
}
