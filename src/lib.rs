#![doc = include_str!("../README.md")]
use hound::{SampleFormat, WavSpec};
use std::env;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::{Layer, Registry};

pub mod audio;
pub mod cache;
pub mod dtw;
pub mod endpoint;
pub mod features;
pub mod hmm;
pub mod lexicon;
pub mod signal;
pub mod task;

pub use features::FeatureExtractor;
pub use lexicon::Trie;

/// Audio sampling rate in frames per second.
pub const SAMPLE_RATE: u32 = 16_000;
/// Duration of one capture chunk in milliseconds.
pub const CHUNK_MS: usize = 20;
/// Number of samples in one capture chunk (and one analysis window).
pub const SAMPLES_PER_CHUNK: usize = SAMPLE_RATE as usize * CHUNK_MS / 1000;
/// Hop between successive analysis windows, half a chunk for 50% overlap.
pub const FRAME_HOP: usize = SAMPLES_PER_CHUNK / 2;

pub const WAV_SPEC: WavSpec = WavSpec {
    channels: 1,
    sample_rate: SAMPLE_RATE,
    bits_per_sample: 16,
    sample_format: SampleFormat::Int,
};

/// Convenience function to setup logging for any binaries I create. Automatically sets all
/// binaries and the recogniser library crate to `info` logging by default.
pub fn setup_logging() {
    let filter = match env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_env("RUST_LOG"),
        _ => EnvFilter::new("xd_asr=info,app=info,trainer=info,record=info,spellcheck=info"),
    };

    let fmt = tracing_subscriber::fmt::Layer::default();

    let subscriber = filter.and_then(fmt).with_subscriber(Registry::default());

    tracing::subscriber::set_global_default(subscriber).unwrap();
}
