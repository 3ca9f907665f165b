//! Composing trained chains into recognition graphs.
//!
//! Every grammar here is a handful of non-emitting connectors with digit chains strung between
//! them. A connector consumes no observation, so it can fan a single point of the grammar out
//! into ten parallel digit models and collect them again on the far side. Model exit edges carry
//! the digit label for the decoder's back-pointer chain; silence exits carry nothing.
use super::{DigitHmm, Graph, ModelLabel};

/// Negative log probability of a half — the default loss for re-entering the digit loop.
pub const HALF_LOSS: f64 = std::f64::consts::LN_2;

/// A single model between two connectors, for training alignments and per-model scoring.
pub fn chain_graph(hmm: &DigitHmm) -> Graph {
    let mut graph = Graph::new();
    graph.start = graph.add_connector();
    graph.end = graph.add_connector();
    let (_, last) = graph.add_model(hmm, graph.start, 0.0);
    graph.add_edge(last, graph.end, hmm.exit_loss(), Some(hmm.label));
    graph
}

/// The isolated-word grammar: all models in parallel between the start and end connectors. The
/// decoded label sequence is the single best-scoring model.
pub fn isolated_graph(hmms: &[DigitHmm]) -> Graph {
    let mut graph = Graph::new();
    graph.start = graph.add_connector();
    graph.end = graph.add_connector();
    for hmm in hmms {
        let (_, last) = graph.add_model(hmm, graph.start, 0.0);
        graph.add_edge(last, graph.end, hmm.exit_loss(), Some(hmm.label));
    }
    graph
}

/// The telephone-number grammar: eight connectors in a row with one digit model per allowed
/// digit between each neighbouring pair. The first position excludes 0 and 1 (no such area
/// codes), a silence arm loops at the fourth connector so a pause after the area code costs
/// nothing but silence, and an epsilon jump from the first connector to the fourth lets 4-digit
/// numbers skip the area code entirely.
///
/// `digit_hmms` must hold the models for digits 0–9 in order.
pub fn telephone_graph(digit_hmms: &[DigitHmm], silence: &DigitHmm) -> Graph {
    assert_eq!(digit_hmms.len(), 10, "expected one model per digit");
    let mut graph = Graph::new();
    let connectors: Vec<usize> = (0..8).map(|_| graph.add_connector()).collect();
    graph.start = connectors[0];
    graph.end = connectors[7];

    // Jumping over the three area-code digits.
    graph.add_edge(connectors[0], connectors[3], 0.0, None);

    // A pause after the area code: silence in and out of the same connector.
    let (_, silence_last) = graph.add_model(silence, connectors[3], 0.0);
    graph.add_edge(silence_last, connectors[3], silence.exit_loss(), None);

    for position in 0..7 {
        for hmm in digit_hmms {
            if position == 0 {
                if let ModelLabel::Digit(d) = hmm.label {
                    if d < 2 {
                        continue;
                    }
                }
            }
            let (_, last) = graph.add_model(hmm, connectors[position], 0.0);
            graph.add_edge(last, connectors[position + 1], hmm.exit_loss(), Some(hmm.label));
        }
    }
    graph
}

/// The unrestricted digit-string grammar: one connector, every digit looping through it. The
/// `insertion_penalty` is added to each re-entry; too low and the decoder invents digits, too
/// high and it swallows them, so it is swept empirically. [`HALF_LOSS`] is a sane default.
pub fn unrestricted_graph(digit_hmms: &[DigitHmm], insertion_penalty: f64) -> Graph {
    let mut graph = Graph::new();
    let hub = graph.add_connector();
    graph.start = hub;
    graph.end = hub;
    for hmm in digit_hmms {
        let (_, last) = graph.add_model(hmm, hub, 0.0);
        graph.add_edge(
            last,
            hub,
            hmm.exit_loss() + insertion_penalty,
            Some(hmm.label),
        );
    }
    graph
}

/// Extra transition losses for [`sequence_graph`], on top of each model's own exit loss.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequenceCosts {
    pub silence_to_digit: f64,
    pub digit_to_digit: f64,
}

/// A linear graph for one labelled utterance: silence, then each digit of `sequence` in order,
/// then silence again. Used by embedded retraining, where the digit sequence is known and only
/// the frame boundaries are in question.
pub fn sequence_graph(
    sequence: &str,
    digit_hmms: &[DigitHmm],
    silence: &DigitHmm,
    costs: SequenceCosts,
) -> Graph {
    assert!(!sequence.is_empty(), "empty digit sequence");
    let mut graph = Graph::new();
    graph.start = graph.add_connector();

    let (_, mut previous_last) = graph.add_model(silence, graph.start, 0.0);
    let mut previous_exit = silence.exit_loss();
    let mut previous_label = None;

    for digit in sequence.chars() {
        let digit = digit.to_digit(10).expect("sequences are decimal digits") as usize;
        let hmm = &digit_hmms[digit];
        let connector = graph.add_connector();
        graph.add_edge(previous_last, connector, previous_exit, previous_label);
        let extra = if previous_label.is_none() {
            costs.silence_to_digit
        } else {
            costs.digit_to_digit
        };
        let (_, last) = graph.add_model(hmm, connector, extra);
        previous_last = last;
        previous_exit = hmm.exit_loss();
        previous_label = Some(hmm.label);
    }

    let connector = graph.add_connector();
    graph.add_edge(previous_last, connector, previous_exit, previous_label);
    let (_, silence_last) = graph.add_model(silence, connector, costs.silence_to_digit);
    let end = graph.add_connector();
    graph.add_edge(silence_last, end, silence.exit_loss(), None);
    graph.end = end;
    graph
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hmm::tests::unit_mixture;

    fn model(label: ModelLabel) -> DigitHmm {
        DigitHmm {
            label,
            states: vec![unit_mixture(&[0.0, 0.0]), unit_mixture(&[1.0, 1.0])],
            self_loops: vec![0.5, 0.5],
            forwards: vec![0.5],
            exit_probability: 0.5,
        }
    }

    fn digit_models() -> Vec<DigitHmm> {
        (0..10).map(|d| model(ModelLabel::Digit(d))).collect()
    }

    #[test]
    fn rebuilding_a_graph_preserves_topology() {
        let models = digit_models();
        let silence = model(ModelLabel::Silence);
        let first = telephone_graph(&models, &silence);
        let second = telephone_graph(&models, &silence);
        assert_eq!(first.topology(), second.topology());

        let cloned = first.clone();
        assert_eq!(cloned.topology(), first.topology());
    }

    #[test]
    fn telephone_graph_restricts_the_first_position() {
        let models = digit_models();
        let silence = model(ModelLabel::Silence);
        let graph = telephone_graph(&models, &silence);
        // 8 connectors + silence arm + 8 models in slot 0 + 10 in the other six slots.
        let n_states = graph.states.len();
        let expected = 8 + 2 + (8 + 6 * 10) * 2;
        assert_eq!(n_states, expected);
        // The end connector collects one exit edge per model in the last slot.
        assert_eq!(graph.states[graph.end].entries.len(), 10);
        // The fourth connector: epsilon jump, silence return, and ten slot-three exits.
        assert_eq!(graph.states[3].entries.len(), 12);
    }

    #[test]
    fn unrestricted_graph_loops_through_one_hub() {
        let models = digit_models();
        let graph = unrestricted_graph(&models, HALF_LOSS);
        assert_eq!(graph.start, graph.end);
        assert_eq!(graph.states[graph.start].entries.len(), 10);
        for entry in &graph.states[graph.start].entries {
            assert!(entry.emit.is_some());
            // Exit loss −ln 0.5 plus the insertion penalty.
            assert!((entry.loss - 2.0 * HALF_LOSS).abs() < 1e-12);
        }
    }

    #[test]
    fn sequence_graph_is_linear_in_the_labels() {
        let models = digit_models();
        let silence = model(ModelLabel::Silence);
        let graph = sequence_graph("102", &models, &silence, SequenceCosts::default());
        // Labelled exit edges appear once per digit, in order.
        let mut labels = vec![];
        for state in &graph.states {
            for edge in &state.entries {
                if let Some(label) = edge.emit {
                    labels.push(label);
                }
            }
        }
        assert_eq!(
            labels,
            vec![
                ModelLabel::Digit(1),
                ModelLabel::Digit(0),
                ModelLabel::Digit(2)
            ]
        );
    }
}
