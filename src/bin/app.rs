use anyhow::Context;
use clap::{Parser, Subcommand};
use ndarray::Array2;
use std::path::PathBuf;
use tracing::{error, info};
use xd_asr::cache::{self, FeatureStore};
use xd_asr::dtw::{time_sync_dtw_search, BEST_PRUNING_THRESHOLD};
use xd_asr::features::N_FILTER_BANKS;
use xd_asr::hmm::graph::HALF_LOSS;
use xd_asr::hmm::{
    decode, isolated_graph, telephone_graph, unrestricted_graph, DigitHmm, ModelLabel,
};
use xd_asr::lexicon::levenshtein_distance;
use xd_asr::task;

#[derive(Parser, Debug)]
pub struct Args {
    #[command(subcommand)]
    command: Commands,
    /// Decoder beam width in log units; 0 disables pruning
    #[clap(short = 't', long, default_value_t = 4000.0)]
    pruning_threshold: f64,
    /// Number of gaussians the models were trained with
    #[clap(short, long, default_value_t = 4)]
    n_gaussians: usize,
    /// States per digit chain the models were trained with
    #[clap(long, default_value_t = 5)]
    n_states: usize,
    /// Trained digit models
    #[clap(long, default_value = "models/digits.json")]
    models: PathBuf,
    /// Trained silence model
    #[clap(long, default_value = "models/silence.json")]
    silence_models: PathBuf,
    /// Directory for the feature extraction cache
    #[clap(long, default_value = "cache/features")]
    feature_cache: PathBuf,
    /// Saves the extracted features as .npy for debugging purposes
    #[clap(long)]
    output_features: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Recognise a single spoken digit word
    Isolated {
        /// Recording to recognise
        input: PathBuf,
    },
    /// Recognise a 4 or 7 digit telephone number over the fixed grammar
    Phone {
        input: PathBuf,
        /// The spoken number, to score the recognition against
        #[clap(short, long)]
        expected: Option<String>,
    },
    /// Recognise an unrestricted digit string
    Digits {
        input: PathBuf,
        #[clap(short, long)]
        expected: Option<String>,
        /// Loss added per digit boundary; raise to fight insertions
        #[clap(long, default_value_t = HALF_LOSS)]
        insertion_penalty: f64,
    },
    /// Sweep the insertion penalty over the digit-string test set and report accuracy
    Sweep,
    /// Recognise a single digit word by dynamic time warping against the raw templates
    Dtw {
        input: PathBuf,
        /// Use hard mode datasets
        #[clap(short = 'm', long)]
        hard_mode: bool,
    },
}

fn load_digit_models(args: &Args) -> anyhow::Result<Vec<DigitHmm>> {
    let set = cache::load_models(&args.models, args.n_states, args.n_gaussians).with_context(
        || {
            format!(
                "no model set at {} for {} states / {} gaussians; run `trainer isolated` first",
                args.models.display(),
                args.n_states,
                args.n_gaussians
            )
        },
    )?;
    set.digit_models()
        .context("model set is missing some of digits 0-9")
}

fn load_silence_model(args: &Args) -> anyhow::Result<DigitHmm> {
    let set = cache::load_models(&args.silence_models, 1, args.n_gaussians).with_context(|| {
        format!(
            "no silence model at {}; run `trainer silence` first",
            args.silence_models.display()
        )
    })?;
    set.model(ModelLabel::Silence)
        .cloned()
        .context("model set has no silence model")
}

fn maybe_dump_features(args: &Args, features: &Array2<f32>) {
    if let Some(path) = &args.output_features {
        if let Err(e) = xd_asr::features::write_features_npy(path, features) {
            error!("failed to write features to '{}': {e}", path.display());
        }
    }
}

fn report_against_expected(recognised: &str, expected: &str) {
    let distance = levenshtein_distance(expected, recognised);
    let word_accuracy = (expected.len().saturating_sub(distance)) as f64 * 100.0
        / expected.len() as f64;
    info!("expected `{expected}`: distance {distance}, word accuracy {word_accuracy:.2}%");
}

fn main() -> anyhow::Result<()> {
    xd_asr::setup_logging();
    let args = Args::parse();
    let mut store = FeatureStore::new(&args.feature_cache, N_FILTER_BANKS);

    match &args.command {
        Commands::Isolated { input } => {
            let set = cache::load_models(&args.models, args.n_states, args.n_gaussians)
                .context("no trained models; run `trainer isolated` first")?;
            let graph = isolated_graph(&set.models);
            let features = store.boosted(input)?;
            maybe_dump_features(&args, &features);
            let recognition = decode(&graph, &features, args.pruning_threshold);
            match recognition.labels.first() {
                Some(ModelLabel::Digit(d)) => {
                    println!("{}", task::DIGIT_WORDS[*d as usize]);
                }
                _ => println!("no path"),
            }
        }
        Commands::Phone { input, expected } => {
            let digit_models = load_digit_models(&args)?;
            let silence = load_silence_model(&args)?;
            let graph = telephone_graph(&digit_models, &silence);
            let features = store.boosted(input)?;
            maybe_dump_features(&args, &features);
            let recognition = decode(&graph, &features, args.pruning_threshold);
            let digits = recognition.digits_string();
            println!("{digits}");
            if let Some(expected) = expected {
                report_against_expected(&digits, expected);
            }
        }
        Commands::Digits {
            input,
            expected,
            insertion_penalty,
        } => {
            let digit_models = load_digit_models(&args)?;
            let graph = unrestricted_graph(&digit_models, *insertion_penalty);
            let features = store.boosted(input)?;
            maybe_dump_features(&args, &features);
            let recognition = decode(&graph, &features, args.pruning_threshold);
            let digits = recognition.digits_string();
            println!("{digits}");
            if let Some(expected) = expected {
                report_against_expected(&digits, expected);
            }
        }
        Commands::Sweep => {
            let digit_models = load_digit_models(&args)?;
            let features: Vec<(String, Array2<f32>)> = task::DIGIT_STRINGS
                .iter()
                .map(|&digits| {
                    Ok((
                        digits.to_string(),
                        store.boosted(task::number_recording(digits))?,
                    ))
                })
                .collect::<anyhow::Result<_>>()?;

            let mut best: Option<(f64, f64, f64)> = None;
            for step in 0..11 {
                // From a ten-thousandth of the default loss up to 100× it, evenly spread.
                let penalty = HALF_LOSS / 10_000.0 * (1.0 + step as f64 * 99_999.9);
                let graph = unrestricted_graph(&digit_models, penalty);
                let mut n_correct = 0usize;
                let mut error_rates = vec![];
                for (digits, feature) in &features {
                    let recognised =
                        decode(&graph, feature, args.pruning_threshold).digits_string();
                    let distance = levenshtein_distance(digits, &recognised);
                    if distance == 0 {
                        n_correct += 1;
                    }
                    error_rates.push(distance as f64 * 100.0 / digits.len() as f64);
                }
                let sentence_accuracy = n_correct as f64 * 100.0 / features.len() as f64;
                let word_error_rate =
                    error_rates.iter().sum::<f64>() / error_rates.len() as f64;
                println!(
                    "penalty {penalty:9.3}: sentence accuracy {sentence_accuracy:6.2}%, \
                     word error rate {word_error_rate:6.2}%"
                );
                if best.map_or(true, |(_, _, wer)| word_error_rate < wer) {
                    best = Some((penalty, sentence_accuracy, word_error_rate));
                }
            }
            if let Some((penalty, sentence_accuracy, word_error_rate)) = best {
                println!(
                    "best penalty {penalty:.3}: sentence accuracy {sentence_accuracy:.2}%, \
                     word error rate {word_error_rate:.2}%"
                );
            }
        }
        Commands::Dtw { input, hard_mode } => {
            let indexes: Vec<usize> = if *hard_mode {
                task::hard_template_indexes().collect()
            } else {
                task::template_indexes().collect()
            };
            let mut templates = vec![];
            for word in task::DIGIT_WORDS {
                for &i in &indexes {
                    templates.push((store.boosted(task::isolated_recording(word, i))?, word));
                }
            }
            let features = store.boosted(input)?;
            maybe_dump_features(&args, &features);
            let (cost, prediction) =
                time_sync_dtw_search(&templates, &features, BEST_PRUNING_THRESHOLD);
            match prediction {
                Some(word) => {
                    info!("best template cost {cost:.2}");
                    println!("{word}");
                }
                None => println!("no match"),
            }
        }
    }
    Ok(())
}
