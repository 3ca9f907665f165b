use anyhow::Context;
use clap::{Parser, Subcommand};
use ndarray::Array2;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::info;
use xd_asr::cache::{self, FeatureStore, ModelSet};
use xd_asr::features::N_FILTER_BANKS;
use xd_asr::hmm::embedded::{retrain_from_sequences, EmbeddedConfig, LabelledSequence};
use xd_asr::hmm::{train_digit_hmm, ModelLabel};
use xd_asr::task;

#[derive(Parser, Debug)]
pub struct Args {
    #[command(subcommand)]
    command: Commands,
    /// Number of gaussians for each state
    #[clap(short, long, default_value_t = 4)]
    n_gaussians: usize,
    /// States per digit chain
    #[clap(long, default_value_t = 5)]
    n_states: usize,
    /// Use hard mode datasets
    #[clap(short = 'm', long)]
    hard_mode: bool,
    /// Directory for the feature extraction cache
    #[clap(long, default_value = "cache/features")]
    feature_cache: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Train one model per digit word from the isolated recordings
    Isolated {
        /// Location to save the trained model set
        #[clap(short, long, default_value = "models/digits.json")]
        output: PathBuf,
    },
    /// Train the silence model from the silence recordings
    Silence {
        #[clap(short, long, default_value = "models/silence.json")]
        output: PathBuf,
        /// How many silence recordings exist
        #[clap(long, default_value_t = 10)]
        n_recordings: usize,
    },
    /// Retrain the digit models from the continuous digit-sequence recordings, bootstrapping
    /// from the isolated data
    Embedded {
        #[clap(short, long, default_value = "models/digits_embedded.json")]
        output: PathBuf,
        /// Trained silence model to pad the sequence graphs with
        #[clap(long, default_value = "models/silence.json")]
        silence_models: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    xd_asr::setup_logging();
    let args = Args::parse();
    let mut store = FeatureStore::new(&args.feature_cache, N_FILTER_BANKS);

    match &args.command {
        Commands::Isolated { output } => {
            let indexes: Vec<usize> = if args.hard_mode {
                task::hard_template_indexes().collect()
            } else {
                task::template_indexes().collect()
            };
            let mut models = vec![];
            for (digit, word) in task::DIGIT_WORDS.iter().enumerate() {
                info!("training `{word}`");
                let examples: Vec<Array2<f32>> = indexes
                    .iter()
                    .map(|&i| store.boosted(task::isolated_recording(word, i)))
                    .collect::<anyhow::Result<_>>()?;
                models.push(train_digit_hmm(
                    ModelLabel::Digit(digit as u8),
                    &examples,
                    args.n_states,
                    args.n_gaussians,
                ));
            }
            let set = ModelSet::new(args.n_states, args.n_gaussians, models);
            cache::save_models(output, &set)?;
            info!("saved {} models to {}", set.models.len(), output.display());
        }
        Commands::Silence {
            output,
            n_recordings,
        } => {
            let examples: Vec<Array2<f32>> = (0..*n_recordings)
                .map(|i| store.boosted(task::silence_recording(i)))
                .collect::<anyhow::Result<_>>()?;
            // Silence gets a single looping state.
            let model = train_digit_hmm(ModelLabel::Silence, &examples, 1, args.n_gaussians);
            let set = ModelSet::new(1, args.n_gaussians, vec![model]);
            cache::save_models(output, &set)?;
            info!("saved silence model to {}", output.display());
        }
        Commands::Embedded {
            output,
            silence_models,
        } => {
            let silence_set = cache::load_models(silence_models, 1, args.n_gaussians)
                .with_context(|| {
                    format!(
                        "no silence model at {}; run `trainer silence` first",
                        silence_models.display()
                    )
                })?;
            let silence = silence_set
                .model(ModelLabel::Silence)
                .context("model set has no silence model")?;

            let mut isolated: BTreeMap<u8, Vec<Array2<f32>>> = BTreeMap::new();
            for digit in 0..10u8 {
                let word = task::DIGIT_WORDS[digit as usize];
                let examples: Vec<Array2<f32>> = task::all_training_indexes()
                    .map(|i| store.boosted(task::isolated_recording(word, i)))
                    .collect::<anyhow::Result<_>>()?;
                isolated.insert(digit, examples);
            }

            let mut sequences = vec![];
            for digits in task::TRAINING_SEQUENCES {
                let takes: Vec<Array2<f32>> = (0..task::SEQUENCE_TAKES)
                    .map(|i| store.boosted(task::sequence_recording(digits, i)))
                    .collect::<anyhow::Result<_>>()?;
                sequences.push(LabelledSequence {
                    digits: digits.to_string(),
                    takes,
                });
            }

            let config = EmbeddedConfig {
                n_states: args.n_states,
                n_gaussians: args.n_gaussians,
                ..Default::default()
            };
            let models = retrain_from_sequences(&isolated, &sequences, silence, config);
            let set = ModelSet::new(
                args.n_states,
                args.n_gaussians,
                models.into_values().collect(),
            );
            cache::save_models(output, &set)?;
            info!("saved retrained models to {}", output.display());
        }
    }
    Ok(())
}
