use clap::{Parser, Subcommand};
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};
use xd_asr::lexicon::{self, word_sequence_diff, MatchCosts, BOOSTED_SEGMENTATION_BEAM};

#[derive(Parser, Debug)]
pub struct Args {
    #[command(subcommand)]
    command: Commands,
    /// Dictionary file, one lowercase word per line
    #[clap(short, long, default_value = "data/dict_1.txt")]
    dictionary: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Spellcheck a story word by word
    Check {
        /// Story with typos, whitespace separated words
        #[clap(short, long, default_value = "data/typos.txt")]
        input: PathBuf,
        /// Location to save the corrected story
        #[clap(short, long, default_value = "typos_correction.txt")]
        output: PathBuf,
        /// The correct story, to score against
        #[clap(long)]
        correct: Option<PathBuf>,
        #[clap(short, long, default_value_t = 3)]
        beam: u32,
    },
    /// Segment unspaced lines into dictionary words, fixing typos along the way
    Segment {
        /// Unsegmented text, one run-on line per story line
        #[clap(short, long, default_value = "data/unsegmented.txt")]
        input: PathBuf,
        #[clap(short, long, default_value = "segmented.txt")]
        output: PathBuf,
        #[clap(long)]
        correct: Option<PathBuf>,
        #[clap(short, long, default_value_t = BOOSTED_SEGMENTATION_BEAM)]
        beam: u32,
        /// Use unit edit costs instead of the boosted segmentation costs
        #[clap(long)]
        plain_costs: bool,
    },
}

fn main() -> anyhow::Result<()> {
    xd_asr::setup_logging();
    let args = Args::parse();

    let mut trie = lexicon::dictionary_trie(&args.dictionary)?;
    info!("dictionary size (words): {}", trie.len());

    match &args.command {
        Commands::Check {
            input,
            output,
            correct,
            beam,
        } => {
            let typo_lines = lexicon::read_word_lines(input)?;
            let checked: Vec<Vec<String>> = typo_lines
                .iter()
                .map(|line| {
                    line.iter()
                        .map(|word| match trie.match_word_single(word, *beam) {
                            Some((corrected, _)) => corrected,
                            None => {
                                warn!("`{word}` has no dictionary word within the beam");
                                word.clone()
                            }
                        })
                        .collect()
                })
                .collect();
            write_split_lines(output, &checked)?;

            if let Some(correct) = correct {
                let correct_lines = lexicon::read_word_lines(correct)?;
                let mut n_total = 0usize;
                let mut n_correct = 0usize;
                for (correct_line, checked_line) in correct_lines.iter().zip(checked.iter()) {
                    for (correct, checked) in correct_line.iter().zip(checked_line.iter()) {
                        n_total += 1;
                        if correct == checked {
                            n_correct += 1;
                        }
                    }
                }
                println!(
                    "accuracy: {:.2}%",
                    n_correct as f64 * 100.0 / n_total as f64
                );
            }
        }
        Commands::Segment {
            input,
            output,
            correct,
            beam,
            plain_costs,
        } => {
            if !plain_costs {
                trie.costs = MatchCosts::boosted();
            }
            let lines = lexicon::read_lines_stripped(input)?;
            let segmented: Vec<Vec<String>> = lines
                .iter()
                .map(|line| {
                    if line.is_empty() {
                        return vec![];
                    }
                    match trie.match_words(line, *beam) {
                        Some((words, _)) => words,
                        None => {
                            warn!("no segmentation within the beam for `{line}`");
                            vec![line.clone()]
                        }
                    }
                })
                .collect();
            write_split_lines(output, &segmented)?;

            if let Some(correct) = correct {
                let correct_lines = lexicon::read_word_lines(correct)?;
                let mut inaccuracy = 0usize;
                for (correct_line, segmented_line) in correct_lines.iter().zip(segmented.iter())
                {
                    if correct_line != segmented_line {
                        info!(
                            "{} !=\n{}",
                            correct_line.join(" "),
                            segmented_line.join(" ")
                        );
                        inaccuracy += word_sequence_diff(correct_line, segmented_line);
                    }
                }
                println!("inaccuracy: {inaccuracy}");
            }
        }
    }
    Ok(())
}

fn write_split_lines(path: &PathBuf, lines: &[Vec<String>]) -> anyhow::Result<()> {
    let content: String = lines
        .iter()
        .map(|line| line.join(" "))
        .collect::<Vec<_>>()
        .join("\n");
    fs::write(path, content)?;
    Ok(())
}
