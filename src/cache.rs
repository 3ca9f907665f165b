//! On-disk caches for the expensive artifacts: trained model sets and extracted features.
//!
//! Training a full digit set takes minutes of K-means and Viterbi; MFCC extraction is cheaper
//! but adds up over a few hundred recordings. Both cache as JSON keyed by the hyperparameters
//! that shaped them, with a format version so stale caches from an older front end read as
//! misses instead of silently poisoning an experiment.
use crate::features::{FeatureExtractor, N_CEPSTRA};
use crate::hmm::{DigitHmm, ModelLabel};
use anyhow::Context;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Bumped whenever feature extraction or the model format changes shape.
pub const CACHE_VERSION: u8 = 1;

/// A trained set of models and the hyperparameters they were trained with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSet {
    version: u8,
    pub n_states: usize,
    pub n_gaussians: usize,
    pub models: Vec<DigitHmm>,
}

impl ModelSet {
    pub fn new(n_states: usize, n_gaussians: usize, models: Vec<DigitHmm>) -> Self {
        Self {
            version: CACHE_VERSION,
            n_states,
            n_gaussians,
            models,
        }
    }

    pub fn model(&self, label: ModelLabel) -> Option<&DigitHmm> {
        self.models.iter().find(|m| m.label == label)
    }

    /// The models for digits 0–9 in order, when all ten are present.
    pub fn digit_models(&self) -> Option<Vec<DigitHmm>> {
        (0..10u8)
            .map(|d| self.model(ModelLabel::Digit(d)).cloned())
            .collect()
    }
}

/// Write a model set as pretty JSON.
pub fn save_models(path: impl AsRef<Path>, models: &ModelSet) -> anyhow::Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(models)?;
    fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// Load a model set, treating a missing file, an unreadable one, or a version/hyperparameter
/// mismatch as a cache miss.
pub fn load_models(
    path: impl AsRef<Path>,
    n_states: usize,
    n_gaussians: usize,
) -> Option<ModelSet> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).ok()?;
    let set: ModelSet = match serde_json::from_str(&content) {
        Ok(set) => set,
        Err(e) => {
            warn!("ignoring unreadable model cache {}: {e}", path.display());
            return None;
        }
    };
    if set.version != CACHE_VERSION {
        warn!(
            "model cache {} is format version {}, want {CACHE_VERSION}",
            path.display(),
            set.version
        );
        return None;
    }
    if set.n_states != n_states || set.n_gaussians != n_gaussians {
        debug!(
            "model cache {} trained with {} states / {} gaussians, want {n_states}/{n_gaussians}",
            path.display(),
            set.n_states,
            set.n_gaussians
        );
        return None;
    }
    Some(set)
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedFeatures {
    version: u8,
    n_banks: usize,
    features: Array2<f32>,
}

/// Extracts boosted MFCC features with a sidecar cache directory, keyed by recording stem and
/// filterbank count.
pub struct FeatureStore {
    dir: PathBuf,
    n_banks: usize,
    extractor: FeatureExtractor,
}

impl FeatureStore {
    pub fn new(dir: impl Into<PathBuf>, n_banks: usize) -> Self {
        Self {
            dir: dir.into(),
            n_banks,
            extractor: FeatureExtractor::new(n_banks, N_CEPSTRA),
        }
    }

    /// Features for a recording, from cache when possible.
    pub fn boosted(&mut self, wav: impl AsRef<Path>) -> anyhow::Result<Array2<f32>> {
        let wav = wav.as_ref();
        let cache_path = self.cache_path(wav);
        if let Some(features) = self.load(&cache_path) {
            return Ok(features);
        }

        debug!("extracting features for {}", wav.display());
        let samples = crate::audio::read_wav_samples(wav)?;
        let features = self.extractor.extract(&samples);

        let entry = CachedFeatures {
            version: CACHE_VERSION,
            n_banks: self.n_banks,
            features: features.clone(),
        };
        let written: anyhow::Result<()> = (|| {
            fs::create_dir_all(&self.dir)?;
            fs::write(&cache_path, serde_json::to_string(&entry)?)?;
            Ok(())
        })();
        if let Err(e) = written {
            warn!("could not write feature cache {}: {e}", cache_path.display());
        }
        Ok(features)
    }

    fn cache_path(&self, wav: &Path) -> PathBuf {
        let stem = wav
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".into());
        self.dir.join(format!("{stem}.{}.json", self.n_banks))
    }

    fn load(&self, cache_path: &Path) -> Option<Array2<f32>> {
        let content = fs::read_to_string(cache_path).ok()?;
        let entry: CachedFeatures = serde_json::from_str(&content).ok()?;
        (entry.version == CACHE_VERSION && entry.n_banks == self.n_banks)
            .then_some(entry.features)
    }
}
