//! The perceptual half of the front end, turning power spectra into the 39-dimensional boosted
//! MFCC vectors every recogniser in this crate consumes.
//!
//! The pipeline per frame is: mel filterbank → natural log → DCT-II, keeping 13 cepstral
//! coefficients. Per utterance the 13-wide cepstra matrix is "boosted" by appending first and
//! second time differences (delta and delta-delta), then normalised to zero mean and unit
//! variance per coefficient. Mean subtraction removes stationary channel colouration (the
//! microphone and room live in the cepstral mean), variance normalisation stops any one
//! coefficient dominating the Gaussians downstream.
//!
//! The mel scale here is the classic piecewise one: linear below 1 kHz at 200/3 Hz per mel, and
//! logarithmic above with a step of exp(ln 6.4 / 27) per mel. Filterbank matrices and Hann
//! windows are process-lifetime immutables cached by their structural parameters.
use crate::{audio, signal, FRAME_HOP, SAMPLES_PER_CHUNK, SAMPLE_RATE};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use once_cell::sync::Lazy;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Cepstral coefficients kept per frame.
pub const N_CEPSTRA: usize = 13;
/// Default number of mel filter banks. 25 and 30 are also sensible.
pub const N_FILTER_BANKS: usize = 40;
/// Dimension of a boosted feature vector: cepstra, deltas and delta-deltas.
pub const BOOSTED_DIM: usize = 3 * N_CEPSTRA;

/// Floor applied to power and mel values before taking logs.
const LOG_FLOOR: f32 = 1e-10;

const F_SP: f32 = 200.0 / 3.0;
const BREAK_FREQUENCY: f32 = 1000.0;
const BREAK_POINT: f32 = BREAK_FREQUENCY / F_SP;

fn log_step() -> f32 {
    (6.4f32.ln() / 27.0).exp()
}

/// Convert a frequency in Hz to the mel scale.
pub fn hz_to_mel(f: f32) -> f32 {
    if f < BREAK_FREQUENCY {
        f / F_SP
    } else {
        BREAK_POINT + (f / BREAK_FREQUENCY).ln() / log_step().ln()
    }
}

/// Convert a mel-scale value back to Hz.
pub fn mel_to_hz(z: f32) -> f32 {
    if z < BREAK_POINT {
        z * F_SP
    } else {
        BREAK_FREQUENCY * (log_step().ln() * (z - BREAK_POINT)).exp()
    }
}

type FilterBankKey = (usize, u32, usize);

static FILTER_BANKS: Lazy<Mutex<HashMap<FilterBankKey, Arc<Array2<f32>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// The mel filterbank for converting a power spectrum into a mel spectrum: `n_banks` triangular
/// filters equally spaced on the mel scale between 0 and the Nyquist frequency, each row
/// normalised to sum to one. Shape is `n_banks × (fft_size/2 + 1)`; memoized per parameter set.
pub fn mel_filterbank(fft_size: usize, sample_rate: u32, n_banks: usize) -> Arc<Array2<f32>> {
    assert!(fft_size.is_power_of_two() && n_banks > 0);
    let mut cache = FILTER_BANKS.lock().unwrap();
    cache
        .entry((fft_size, sample_rate, n_banks))
        .or_insert_with(|| Arc::new(build_filterbank(fft_size, sample_rate, n_banks)))
        .clone()
}

fn build_filterbank(fft_size: usize, sample_rate: u32, n_banks: usize) -> Array2<f32> {
    let n_useful = (fft_size >> 1) + 1;
    let frequencies: Vec<f32> = (0..n_useful)
        .map(|i| i as f32 / fft_size as f32 * sample_rate as f32)
        .collect();

    let max_mel = hz_to_mel(sample_rate as f32 / 2.0);
    let mel_frequencies: Vec<f32> = (0..n_banks + 2)
        .map(|i| mel_to_hz(i as f32 / (n_banks + 1) as f32 * max_mel))
        .collect();

    let mut banks = Array2::<f32>::zeros((n_banks, n_useful));
    for (i, mut row) in banks.axis_iter_mut(Axis(0)).enumerate() {
        let [lo, centre, hi] = [
            mel_frequencies[i],
            mel_frequencies[i + 1],
            mel_frequencies[i + 2],
        ];
        for (weight, &f) in row.iter_mut().zip(frequencies.iter()) {
            let lo_slope = (f - lo) / (centre - lo);
            let hi_slope = (hi - f) / (hi - centre);
            *weight = lo_slope.min(hi_slope).max(0.0);
        }
        let sum = row.sum();
        if sum > 0.0 {
            row.mapv_inplace(|w| w / sum);
        }
    }
    banks
}

/// Apply a filterbank to a power spectrum.
pub fn mel_spectrum(power: &[f32], banks: &Array2<f32>) -> Array1<f32> {
    assert_eq!(power.len(), banks.ncols());
    let power = ArrayView1::from(power);
    banks.dot(&power)
}

/// Cepstrum of a mel spectrum: orthonormal DCT-II of the log energies, truncated to `n_cepstra`
/// coefficients. Zero energies are floored before the log so silence stays finite.
pub fn cepstrum(mel_spec: &Array1<f32>, n_cepstra: usize) -> Array1<f32> {
    let k = mel_spec.len();
    assert!(k >= n_cepstra, "more cepstra requested than mel banks");
    let log_spec: Vec<f32> = mel_spec.iter().map(|&m| m.max(LOG_FLOOR).ln()).collect();
    let scale = (2.0 / k as f32).sqrt();
    Array1::from_iter((0..n_cepstra).map(|i| {
        let sum: f32 = log_spec
            .iter()
            .enumerate()
            .map(|(j, &l)| l * (std::f32::consts::PI * i as f32 * (2 * j + 1) as f32 / (2 * k) as f32).cos())
            .sum();
        let coefficient = scale * sum;
        if i == 0 {
            coefficient / 2.0f32.sqrt()
        } else {
            coefficient
        }
    }))
}

/// Boost a `T×13` cepstra matrix to `T×39` by appending first and second time differences.
/// Differences use edge padding: `δ[t] = c[t+1] - c[t-1]` with the first and last frames standing
/// in for their missing neighbours, and the delta-deltas are differences of the deltas.
pub fn boost(cepstra: &Array2<f32>) -> Array2<f32> {
    let (t, d) = cepstra.dim();
    let deltas = time_differences(cepstra);
    let delta_deltas = time_differences(&deltas);
    let mut boosted = Array2::<f32>::zeros((t, 3 * d));
    for frame in 0..t {
        for i in 0..d {
            boosted[[frame, i]] = cepstra[[frame, i]];
            boosted[[frame, d + i]] = deltas[[frame, i]];
            boosted[[frame, 2 * d + i]] = delta_deltas[[frame, i]];
        }
    }
    boosted
}

fn time_differences(m: &Array2<f32>) -> Array2<f32> {
    let (t, d) = m.dim();
    let mut out = Array2::<f32>::zeros((t, d));
    for frame in 0..t {
        let next = (frame + 1).min(t - 1);
        let prev = frame.saturating_sub(1);
        for i in 0..d {
            out[[frame, i]] = m[[next, i]] - m[[prev, i]];
        }
    }
    out
}

/// Normalise each column of `m` to zero mean and unit variance, in place. Constant columns are
/// left mean-subtracted only.
pub fn normalize_mean_variance(m: &mut Array2<f32>) {
    let t = m.nrows();
    if t == 0 {
        return;
    }
    for mut column in m.axis_iter_mut(Axis(1)) {
        let mean = column.sum() / t as f32;
        let variance = column.iter().map(|x| (x - mean) * (x - mean)).sum::<f32>() / t as f32;
        let std = variance.sqrt();
        let std = if std > 0.0 { std } else { 1.0 };
        column.mapv_inplace(|x| (x - mean) / std);
    }
}

/// Welford-style running mean and variance per coefficient, for normalising features that have
/// to be emitted before the utterance ends.
#[derive(Debug, Clone)]
pub struct RunningMoments {
    count: u64,
    mean: Vec<f64>,
    m2: Vec<f64>,
}

impl RunningMoments {
    pub fn new(dim: usize) -> Self {
        Self {
            count: 0,
            mean: vec![0.0; dim],
            m2: vec![0.0; dim],
        }
    }

    pub fn push(&mut self, frame: ArrayView1<f32>) {
        assert_eq!(frame.len(), self.mean.len());
        self.count += 1;
        for (i, &x) in frame.iter().enumerate() {
            let x = x as f64;
            let delta = x - self.mean[i];
            self.mean[i] += delta / self.count as f64;
            self.m2[i] += delta * (x - self.mean[i]);
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self, i: usize) -> f64 {
        self.mean[i]
    }

    pub fn variance(&self, i: usize) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.m2[i] / self.count as f64
        }
    }

    /// Normalise a frame with the moments seen so far.
    pub fn normalize(&self, frame: ArrayView1<f32>) -> Array1<f32> {
        Array1::from_iter(frame.iter().enumerate().map(|(i, &x)| {
            let std = self.variance(i).sqrt();
            let std = if std > 0.0 { std } else { 1.0 };
            ((x as f64 - self.mean[i]) / std) as f32
        }))
    }
}

/// Runs the whole front end: samples in, normalised boosted MFCC matrix out. Owns an FFT planner
/// so repeated extractions share their plans.
pub struct FeatureExtractor {
    n_banks: usize,
    n_cepstra: usize,
    planner: FftPlanner<f32>,
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new(N_FILTER_BANKS, N_CEPSTRA)
    }
}

impl FeatureExtractor {
    pub fn new(n_banks: usize, n_cepstra: usize) -> Self {
        Self {
            n_banks,
            n_cepstra,
            planner: FftPlanner::new(),
        }
    }

    /// Extract a `T×39` boosted, normalised feature matrix from raw samples. An utterance of
    /// `L ≥ 320` samples yields `⌈(L-320)/160⌉ + 1` frames; shorter input yields zero frames.
    pub fn extract(&mut self, samples: &[i16]) -> Array2<f32> {
        assert!(!samples.is_empty(), "cannot extract features from an empty signal");
        let emphasized = signal::pre_emphasize(samples, signal::PRE_EMPHASIS);

        let mut segmenter = signal::Segmenter::new(SAMPLES_PER_CHUNK, FRAME_HOP);
        segmenter.push(&emphasized);

        let fft_size = signal::fft_size(SAMPLES_PER_CHUNK);
        let fft = self.planner.plan_fft_forward(fft_size);
        let banks = mel_filterbank(fft_size, SAMPLE_RATE, self.n_banks);

        let mut rows: Vec<Array1<f32>> = vec![];
        while let Some(frame) = segmenter.next_frame() {
            let windowed = signal::window(&frame);
            let mut buffer: Vec<Complex<f32>> = windowed
                .iter()
                .map(|&x| Complex::new(x, 0.0))
                .chain(std::iter::repeat(Complex::new(0.0, 0.0)))
                .take(fft_size)
                .collect();
            fft.process(&mut buffer);
            let powers = signal::power_spectrum(&buffer);
            let mel = mel_spectrum(&powers, &banks);
            rows.push(cepstrum(&mel, self.n_cepstra));
        }

        let mut cepstra = Array2::<f32>::zeros((rows.len(), self.n_cepstra));
        for (i, row) in rows.iter().enumerate() {
            cepstra.row_mut(i).assign(row);
        }
        let mut boosted = boost(&cepstra);
        normalize_mean_variance(&mut boosted);
        boosted
    }
}

/// Read a recording and extract its boosted MFCC features with the default configuration.
pub fn boosted_mfcc_from_wav(path: impl AsRef<Path>) -> anyhow::Result<Array2<f32>> {
    let samples = audio::read_wav_samples(path)?;
    Ok(FeatureExtractor::default().extract(&samples))
}

/// Dump a feature matrix as `.npy` for offline inspection.
pub fn write_features_npy(path: impl AsRef<Path>, features: &Array2<f32>) -> anyhow::Result<()> {
    ndarray_npy::write_npy(path.as_ref(), features)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mel_scale_round_trips() {
        for f in [125.0f32, 500.0, 999.0, 1000.0, 4000.0, 7999.0] {
            let back = mel_to_hz(hz_to_mel(f));
            assert!((back - f).abs() < 0.5, "{f} -> {back}");
        }
    }

    #[test]
    fn filterbank_rows_sum_to_one() {
        let banks = mel_filterbank(512, SAMPLE_RATE, N_FILTER_BANKS);
        for row in banks.axis_iter(Axis(0)) {
            assert!((row.sum() - 1.0).abs() < 1e-4);
        }
        // Cached per parameter set.
        assert!(Arc::ptr_eq(
            &banks,
            &mel_filterbank(512, SAMPLE_RATE, N_FILTER_BANKS)
        ));
    }

    #[test]
    fn cepstrum_of_flat_spectrum_is_energy_only() {
        let flat = Array1::from_elem(N_FILTER_BANKS, 2.0f32);
        let cep = cepstrum(&flat, N_CEPSTRA);
        assert!(cep[0].abs() > 1e-3);
        for c in cep.iter().skip(1) {
            assert!(c.abs() < 1e-4);
        }
    }

    #[test]
    fn boost_shapes_and_edge_padding() {
        // A ramp in time: delta is the slope doubled in the middle, single at the edges.
        let mut cepstra = Array2::<f32>::zeros((4, 2));
        for t in 0..4 {
            cepstra[[t, 0]] = t as f32;
        }
        let boosted = boost(&cepstra);
        assert_eq!(boosted.dim(), (4, 6));
        assert_eq!(boosted[[0, 2]], 1.0);
        assert_eq!(boosted[[1, 2]], 2.0);
        assert_eq!(boosted[[2, 2]], 2.0);
        assert_eq!(boosted[[3, 2]], 1.0);
    }

    #[test]
    fn normalization_zeroes_constant_columns() {
        let mut m = Array2::<f32>::from_elem((5, 3), 7.5);
        normalize_mean_variance(&mut m);
        assert!(m.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn feature_shape_is_deterministic() {
        let samples = vec![0i16; 16_000];
        let features = FeatureExtractor::default().extract(&samples);
        // ceil((16000 - 320) / 160) + 1 frames of 39 coefficients.
        assert_eq!(features.dim(), (99, BOOSTED_DIM));
        assert!(features.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn short_input_yields_no_frames() {
        let features = FeatureExtractor::default().extract(&[0i16; 100]);
        assert_eq!(features.dim(), (0, BOOSTED_DIM));
    }

    #[test]
    fn features_from_wav_match_direct_extraction() {
        let dir = std::env::temp_dir().join(format!("xd-asr-mfcc-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tone.wav");
        let mut writer = hound::WavWriter::create(&path, crate::WAV_SPEC).unwrap();
        let samples: Vec<i16> = (0..8000)
            .map(|i| ((i as f32 * 0.1).sin() * 3000.0) as i16)
            .collect();
        for &sample in &samples {
            writer.write_sample(sample).unwrap();
        }
        writer.finalize().unwrap();

        let from_wav = boosted_mfcc_from_wav(&path).unwrap();
        let direct = FeatureExtractor::default().extract(&samples);
        assert_eq!(from_wav, direct);
    }

    #[test]
    fn running_moments_match_batch_statistics() {
        let data = Array2::from_shape_fn((10, 3), |(t, d)| (t * 3 + d) as f32 * 0.25);
        let mut moments = RunningMoments::new(3);
        for row in data.axis_iter(Axis(0)) {
            moments.push(row);
        }
        for d in 0..3 {
            let column: Vec<f64> = data.column(d).iter().map(|&x| x as f64).collect();
            let mean = column.iter().sum::<f64>() / column.len() as f64;
            let variance =
                column.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / column.len() as f64;
            assert!((moments.mean(d) - mean).abs() < 1e-9);
            assert!((moments.variance(d) - variance).abs() < 1e-9);
        }
    }
}
