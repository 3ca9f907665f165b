use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use xd_asr::endpoint::capture_endpointed_audio;
use xd_asr::{audio, SAMPLES_PER_CHUNK, SAMPLE_RATE};

/// Endpoint a recording: keep the speech, drop the surrounding silence.
#[derive(Parser, Debug)]
pub struct Args {
    /// Input WAV to endpoint (16 kHz mono)
    input: PathBuf,
    /// Location to save the output audio file
    #[clap(short, long, default_value = "output.wav")]
    output: PathBuf,
    /// Treat the input as headerless 16-bit little-endian PCM instead of WAV
    #[clap(long)]
    raw: bool,
    /// Discard the first few chunks; wanted when the input came straight off a freshly opened
    /// capture device
    #[clap(long)]
    discard_warmup: bool,
}

fn main() -> anyhow::Result<()> {
    xd_asr::setup_logging();
    let args = Args::parse();

    let samples = if args.raw {
        audio::bytes_to_samples(&std::fs::read(&args.input)?)
    } else {
        audio::read_wav_samples(&args.input)?
    };
    info!(
        "endpointing {} ({:.2} s)",
        args.input.display(),
        samples.len() as f64 / SAMPLE_RATE as f64
    );
    let chunks: Vec<Vec<i16>> = samples
        .chunks(SAMPLES_PER_CHUNK)
        .map(|chunk| chunk.to_vec())
        .collect();

    let mut writer = audio::create_wav_writer(&args.output)?;
    let written = capture_endpointed_audio(chunks, &mut writer, args.discard_warmup)?;
    writer.finalize()?;

    info!(
        "wrote {written} samples ({:.2} s) to {}",
        written as f64 / SAMPLE_RATE as f64,
        args.output.display()
    );
    Ok(())
}
