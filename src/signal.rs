//! The time-domain half of the front end: pre-emphasis, framing and windowing, the FFT and the
//! power spectrum. Everything here is deliberately boring signal processing; the interesting
//! perceptual work (mel warping, cepstra) lives in [`crate::features`].
//!
//! Frames are 320 samples (20 ms at 16 kHz) advanced by 160, so consecutive frames overlap by
//! half. The FFT is zero padded to the next power of two, 512 points for our frame size, and only
//! the first M/2+1 bins of the power spectrum are kept since the input is real.
use once_cell::sync::Lazy;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Pre-emphasis coefficient. High frequencies in speech carry less energy than low ones; the
/// first-difference filter `y[n] = x[n] - α·x[n-1]` flattens the spectral tilt.
pub const PRE_EMPHASIS: f32 = 0.95;

/// Apply pre-emphasis to the input signal. `y[0] = x[0]` so output length matches input length.
pub fn pre_emphasize(samples: &[i16], alpha: f32) -> Vec<f32> {
    assert!(!samples.is_empty(), "cannot pre-emphasize an empty signal");
    let mut out = Vec::with_capacity(samples.len());
    out.push(samples[0] as f32);
    for pair in samples.windows(2) {
        out.push(pair[1] as f32 - alpha * pair[0] as f32);
    }
    out
}

/// Splits a stream of samples into fixed-size overlapping frames. Samples can be pushed in
/// arbitrary sized pieces; frames are only emitted once a full window is available and the
/// residual is retained, so a segmenter can be fed chunk by chunk as audio arrives.
#[derive(Debug, Clone)]
pub struct Segmenter {
    window_size: usize,
    hop: usize,
    buffer: Vec<f32>,
}

impl Segmenter {
    pub fn new(window_size: usize, hop: usize) -> Self {
        assert!(window_size > 0 && hop > 0 && hop <= window_size);
        Self {
            window_size,
            hop,
            buffer: Vec::new(),
        }
    }

    /// Add samples to be segmented.
    pub fn push(&mut self, samples: &[f32]) {
        self.buffer.extend_from_slice(samples);
    }

    /// The next full frame, or `None` until enough samples have been pushed.
    pub fn next_frame(&mut self) -> Option<Vec<f32>> {
        if self.buffer.len() < self.window_size {
            return None;
        }
        let frame = self.buffer[..self.window_size].to_vec();
        self.buffer.drain(..self.hop);
        Some(frame)
    }
}

static HANN_WINDOWS: Lazy<Mutex<HashMap<usize, Arc<Vec<f32>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// The Hann window for the first `m` points, memoized per size. The periodic form
/// `0.5 - 0.5·cos(2πn/m)` is used, matching the analysis hop rather than the symmetric form
/// filter designers prefer.
pub fn hann_window(m: usize) -> Arc<Vec<f32>> {
    assert!(m > 0, "zero-length window");
    let mut cache = HANN_WINDOWS.lock().unwrap();
    cache
        .entry(m)
        .or_insert_with(|| {
            let window = (0..m)
                .map(|n| 0.5 - 0.5 * (2.0 * std::f32::consts::PI * n as f32 / m as f32).cos())
                .collect();
            Arc::new(window)
        })
        .clone()
}

/// Hann-windowed copy of `frame`.
pub fn window(frame: &[f32]) -> Vec<f32> {
    let hann = hann_window(frame.len());
    frame.iter().zip(hann.iter()).map(|(x, w)| x * w).collect()
}

/// FFT length for a frame: the smallest power of two that fits it.
pub fn fft_size(frame_len: usize) -> usize {
    assert!(frame_len > 0, "zero-length frame");
    frame_len.next_power_of_two()
}

/// Complex spectrum of `frame`, zero padded to a power-of-two length.
pub fn fft(frame: &[f32]) -> Vec<Complex<f32>> {
    let m = fft_size(frame.len());
    let mut buffer: Vec<Complex<f32>> = frame
        .iter()
        .map(|&x| Complex::new(x, 0.0))
        .chain(std::iter::repeat(Complex::new(0.0, 0.0)))
        .take(m)
        .collect();
    let mut planner = FftPlanner::new();
    planner.plan_fft_forward(m).process(&mut buffer);
    buffer
}

/// Power spectrum of an FFT output: the first M/2+1 squared magnitudes scaled by 1/M. Only the
/// non-negative frequencies are kept, the rest mirror them for a real input.
pub fn power_spectrum(transformed: &[Complex<f32>]) -> Vec<f32> {
    let m = transformed.len();
    assert!(m.is_power_of_two(), "expected a power-of-two FFT output");
    let n_useful = (m >> 1) + 1;
    transformed[..n_useful]
        .iter()
        .map(|c| (c.re * c.re + c.im * c.im) / m as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pre_emphasis_of_constant_leaves_residual() {
        let out = pre_emphasize(&[1000; 8], PRE_EMPHASIS);
        assert_eq!(out[0], 1000.0);
        for y in &out[1..] {
            assert!((y - 1000.0 * (1.0 - PRE_EMPHASIS)).abs() < 1e-3);
        }
    }

    #[test]
    fn segmenter_emits_overlapping_frames() {
        let mut segmenter = Segmenter::new(320, 160);
        // 800 samples gives ceil((800 - 320) / 160) + 1 = 4 frames.
        let samples: Vec<f32> = (0..800).map(|i| i as f32).collect();
        segmenter.push(&samples);
        let mut frames = vec![];
        while let Some(frame) = segmenter.next_frame() {
            frames.push(frame);
        }
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0][0], 0.0);
        assert_eq!(frames[1][0], 160.0);
        assert_eq!(frames[3][0], 480.0);
        // The residual is retained for the next push.
        segmenter.push(&[0.0; 160]);
        assert!(segmenter.next_frame().is_some());
    }

    #[test]
    fn segmenter_holds_partial_windows() {
        let mut segmenter = Segmenter::new(320, 160);
        segmenter.push(&[0.0; 319]);
        assert!(segmenter.next_frame().is_none());
        segmenter.push(&[0.0; 1]);
        assert!(segmenter.next_frame().is_some());
        assert!(segmenter.next_frame().is_none());
    }

    #[test]
    fn hann_window_endpoints_and_midpoint() {
        let w = hann_window(320);
        assert!(w[0].abs() < 1e-6);
        assert!((w[160] - 1.0).abs() < 1e-6);
        // Cached instance is shared.
        assert!(Arc::ptr_eq(&w, &hann_window(320)));
    }

    #[test]
    fn fft_pads_to_power_of_two() {
        let spectrum = fft(&[1.0; 320]);
        assert_eq!(spectrum.len(), 512);
        let powers = power_spectrum(&spectrum);
        assert_eq!(powers.len(), 257);
    }

    #[test]
    fn impulse_has_flat_power_spectrum() {
        let mut frame = vec![0.0f32; 64];
        frame[0] = 1.0;
        let powers = power_spectrum(&fft(&frame));
        for p in powers {
            assert!((p - 1.0 / 64.0).abs() < 1e-6);
        }
    }

    #[test]
    fn zero_input_is_zero_throughout() {
        let powers = power_spectrum(&fft(&[0.0; 320]));
        assert!(powers.iter().all(|&p| p == 0.0));
    }
}
