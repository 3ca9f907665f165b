//! Energy based endpointing: deciding where speech starts and stops in a stream of 20 ms PCM
//! chunks so recordings contain the utterance and not the surrounding room tone.
//!
//! Two layers. [`SpeechClassifier`] labels each chunk speech or silence by comparing a smoothed
//! energy level against adaptive background and foreground trackers. [`Endpointer`] turns that
//! per-chunk signal into an utterance: it back-tracks a little pre-speech audio so plosive onsets
//! aren't clipped, rides out pauses shorter than the hangover window while keeping the paused
//! audio verbatim, and stops once silence outlasts the window.
//!
//! The capture pipeline at the bottom mirrors how a live device feeds this: a producer thread
//! pushes chunks into a bounded queue and the consumer drains it through the endpointer into a
//! WAV sink, with an end-of-stream sentinel so both sides shut down cleanly.
use crate::{CHUNK_MS, SAMPLE_RATE};
use hound::WavWriter;
use std::collections::VecDeque;
use std::io::{Seek, Write};
use std::sync::mpsc::{sync_channel, RecvTimeoutError};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Forgetting factor for the smoothed `level` energy.
pub const FORGET_FACTOR: f64 = 1.2;
/// Threshold over background in decibels for speech to start.
pub const STARTING_THRESHOLD_DB: f64 = 15.0;
/// Threshold over background in decibels for speech to continue.
pub const CONTINUING_THRESHOLD_DB: f64 = 2.0;
/// Threshold under foreground in decibels at which speech stops.
pub const STOPPING_THRESHOLD_DB: f64 = -20.0;
const WEAK_ADJUSTMENT: f64 = 0.05;
const STRONG_ADJUSTMENT: f64 = 0.8;

/// Milliseconds of already-discarded audio replayed when speech starts.
pub const BACKTRACK_MS: usize = 200;
/// Maximum pause in milliseconds before the utterance is considered over.
pub const MAX_PAUSE_MS: usize = 2000;
/// Chunks discarded after a capture device opens, they tend to carry warm-up artifacts.
pub const N_WARMUP_CHUNKS: usize = 5;

const BACKTRACK_SAMPLES: usize = SAMPLE_RATE as usize * BACKTRACK_MS / 1000;

/// Energy of an audio chunk in decibels. Samples are widened before the dot product so a full
/// chunk of extreme values cannot overflow. All-zero input comes out as `-inf`.
pub fn sample_decibel_energy(samples: &[i16]) -> f64 {
    assert!(!samples.is_empty(), "energy of an empty chunk");
    let power: i64 = samples.iter().map(|&s| s as i64 * s as i64).sum();
    (power as f64 / samples.len() as f64).log10() * 10.0
}

/// Move `original` toward `updated`, choosing the gain by the direction of the change.
fn adjust_conditionally_on_change(
    original: f64,
    updated: f64,
    adjustment_if_inc: f64,
    adjustment_if_dec: f64,
) -> f64 {
    let diff = updated - original;
    let adjustment = if diff > 0.0 {
        adjustment_if_inc
    } else {
        adjustment_if_dec
    };
    adjustment * diff + original
}

/// Classifies chunks as speech or silence against adaptive energy trackers.
///
/// Speech starts when the smoothed level rises at least [`STARTING_THRESHOLD_DB`] above the
/// background, and continues until the level falls within [`CONTINUING_THRESHOLD_DB`] of the
/// background or more than 20 dB below the foreground. The background tracks the noise floor
/// (eagerly downward, reluctantly upward), the foreground tracks the speech level (the other way
/// around). Both seed from the first chunk's energy directly.
#[derive(Debug, Clone, Default)]
pub struct SpeechClassifier {
    level: Option<f64>,
    background: Option<f64>,
    foreground: f64,
    speaking: bool,
}

impl SpeechClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify one chunk, updating the trackers.
    pub fn classify(&mut self, samples: &[i16]) -> bool {
        let current = sample_decibel_energy(samples);
        let level = self.level.unwrap_or(current);
        let background = self.background.unwrap_or(current);

        let level = (level * FORGET_FACTOR + current) / (FORGET_FACTOR + 1.0);
        let mut background = background;

        debug!(
            "speaking: {}, current: {current:.1}, bg: {background:.1}, fg: {:.1}, level: {level:.1}",
            if self.speaking { 'Y' } else { 'N' },
            self.foreground,
        );

        if self.speaking {
            if level - background < CONTINUING_THRESHOLD_DB
                || level - self.foreground < STOPPING_THRESHOLD_DB
            {
                self.speaking = false;
                background = background.min(level);
            } else {
                self.foreground = adjust_conditionally_on_change(
                    self.foreground,
                    level,
                    STRONG_ADJUSTMENT,
                    WEAK_ADJUSTMENT,
                );
            }
        }
        if !self.speaking {
            if level - background >= STARTING_THRESHOLD_DB {
                self.speaking = true;
                self.foreground = level;
            } else {
                background = adjust_conditionally_on_change(
                    background,
                    level,
                    WEAK_ADJUSTMENT,
                    STRONG_ADJUSTMENT,
                );
            }
        }

        self.level = Some(level);
        self.background = Some(background);
        self.speaking
    }
}

/// Where an [`Endpointer`] is in the life of an utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// No speech heard yet; recent audio is held for the backtrack prefix.
    Pending,
    /// The first speech chunk just arrived.
    Starting,
    /// Inside the utterance (possibly inside a tolerated pause).
    Going,
    /// Silence outlasted the pause window; the utterance is over.
    Stopping,
}

/// Endpoints a stream of chunks, emitting exactly the samples that belong to the utterance.
///
/// While speech is going, emission lags by up to [`MAX_PAUSE_MS`] of buffered audio: a chunk is
/// only flushed once newer audio pushes it past the window. When a pause ends inside the window
/// the paused audio is flushed verbatim with everything else; when the pause outlasts the window
/// the buffered tail is exactly the silence, and it is dropped.
#[derive(Debug)]
pub struct Endpointer {
    classifier: SpeechClassifier,
    state: EndpointState,
    /// Pre-speech audio retained for the backtrack prefix.
    pending: VecDeque<i16>,
    /// In-speech audio younger than the pause window.
    holding: VecDeque<Vec<i16>>,
    held_ms: usize,
    off_ms: usize,
}

impl Default for Endpointer {
    fn default() -> Self {
        Self::new()
    }
}

impl Endpointer {
    pub fn new() -> Self {
        Self {
            classifier: SpeechClassifier::new(),
            state: EndpointState::Pending,
            pending: VecDeque::new(),
            holding: VecDeque::new(),
            held_ms: 0,
            off_ms: 0,
        }
    }

    pub fn state(&self) -> EndpointState {
        self.state
    }

    pub fn finished(&self) -> bool {
        self.state == EndpointState::Stopping
    }

    /// Feed one chunk; any samples now due for output are appended to `out`. Returns the state
    /// after the chunk.
    pub fn push_chunk(&mut self, chunk: &[i16], out: &mut Vec<i16>) -> EndpointState {
        if self.finished() {
            return self.state;
        }
        let is_speech = self.classifier.classify(chunk);

        match self.state {
            EndpointState::Pending | EndpointState::Starting => {
                if is_speech {
                    self.state = EndpointState::Starting;
                    // Replay the tail of what we discarded before speech started.
                    let keep_from = self.pending.len().saturating_sub(BACKTRACK_SAMPLES);
                    out.extend(self.pending.iter().skip(keep_from));
                    self.pending.clear();
                    self.hold(chunk, out);
                    self.state = EndpointState::Going;
                } else {
                    self.pending.extend(chunk.iter().copied());
                    while self.pending.len() > BACKTRACK_SAMPLES {
                        self.pending.pop_front();
                    }
                }
            }
            EndpointState::Going => {
                if is_speech {
                    self.off_ms = 0;
                } else {
                    self.off_ms += CHUNK_MS;
                    if self.off_ms > MAX_PAUSE_MS {
                        // The whole buffer is the silence that ended the utterance.
                        self.holding.clear();
                        self.held_ms = 0;
                        self.state = EndpointState::Stopping;
                        return self.state;
                    }
                }
                self.hold(chunk, out);
            }
            EndpointState::Stopping => {}
        }
        self.state
    }

    fn hold(&mut self, chunk: &[i16], out: &mut Vec<i16>) {
        self.holding.push_back(chunk.to_vec());
        self.held_ms += CHUNK_MS;
        while self.held_ms > MAX_PAUSE_MS {
            let aged = self.holding.pop_front().expect("held_ms tracks holding");
            self.held_ms -= CHUNK_MS;
            out.extend_from_slice(&aged);
        }
    }
}

/// Queue depth between the capture thread and the endpointer.
pub const QUEUE_CAPACITY: usize = 64;
/// How long the consumer waits on an empty queue before checking again.
pub const QUEUE_TIMEOUT: Duration = Duration::from_millis(100);

/// Drive `chunks` through a bounded queue and the endpointer into `writer`. Returns the number
/// of samples written. The producer runs on its own thread and terminates the stream with a
/// sentinel; the consumer gives up once the endpointer reports the utterance is over.
///
/// `discard_warmup` drops the first [`N_WARMUP_CHUNKS`] chunks, wanted when the source is a
/// freshly opened device rather than a file.
pub fn capture_endpointed_audio<I, W>(
    chunks: I,
    writer: &mut WavWriter<W>,
    discard_warmup: bool,
) -> anyhow::Result<u64>
where
    I: IntoIterator<Item = Vec<i16>> + Send,
    W: Write + Seek,
{
    let (sender, receiver) = sync_channel::<Option<Vec<i16>>>(QUEUE_CAPACITY);

    let mut written = 0u64;
    thread::scope(|scope| -> anyhow::Result<()> {
        scope.spawn(move || {
            let mut skipped = 0;
            for chunk in chunks {
                if discard_warmup && skipped < N_WARMUP_CHUNKS {
                    skipped += 1;
                    continue;
                }
                if sender.send(Some(chunk)).is_err() {
                    // Consumer already stopped, nothing left to do.
                    return;
                }
            }
            let _ = sender.send(None);
        });

        // Owned by this closure so dropping it unblocks a producer stuck on a full queue before
        // the scope joins the producer thread.
        let receiver = receiver;
        let mut endpointer = Endpointer::new();
        let mut out = Vec::new();
        loop {
            let message = match receiver.recv_timeout(QUEUE_TIMEOUT) {
                Ok(message) => message,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            let Some(chunk) = message else {
                break;
            };
            out.clear();
            let state = endpointer.push_chunk(&chunk, &mut out);
            for &sample in &out {
                writer.write_sample(sample)?;
                written += 1;
            }
            if state == EndpointState::Stopping {
                info!("utterance complete after {written} samples");
                break;
            }
        }
        drop(receiver);
        if written == 0 {
            warn!("no speech detected in the input");
        }
        Ok(())
    })?;

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SAMPLES_PER_CHUNK;

    fn loud() -> Vec<i16> {
        // A square wave has plenty of energy without overflow concerns.
        (0..SAMPLES_PER_CHUNK)
            .map(|i| if i % 2 == 0 { 8000 } else { -8000 })
            .collect()
    }

    fn quiet() -> Vec<i16> {
        (0..SAMPLES_PER_CHUNK)
            .map(|i| if i % 2 == 0 { 10 } else { -10 })
            .collect()
    }

    #[test]
    fn decibel_energy_of_known_signal() {
        let samples = vec![100i16; 320];
        // 10·log10(100²) = 40 dB.
        assert!((sample_decibel_energy(&samples) - 40.0).abs() < 1e-9);
    }

    #[test]
    fn decibel_energy_survives_extreme_samples() {
        let samples = vec![i16::MIN; 320];
        assert!(sample_decibel_energy(&samples).is_finite());
    }

    #[test]
    fn adjustment_picks_gain_by_direction() {
        assert!((adjust_conditionally_on_change(10.0, 20.0, 0.8, 0.05) - 18.0).abs() < 1e-9);
        assert!((adjust_conditionally_on_change(20.0, 10.0, 0.8, 0.05) - 19.5).abs() < 1e-9);
    }

    #[test]
    fn classifier_follows_speech_onset_and_offset() {
        let mut classifier = SpeechClassifier::new();
        for _ in 0..10 {
            assert!(!classifier.classify(&quiet()));
        }
        // Loud chunks push the level over the background by more than the start threshold.
        let mut speaking = false;
        for _ in 0..10 {
            speaking = classifier.classify(&loud());
        }
        assert!(speaking);
        for _ in 0..40 {
            speaking = classifier.classify(&quiet());
        }
        assert!(!speaking);
    }

    #[test]
    fn endpointer_emits_backtrack_and_speech() {
        let mut endpointer = Endpointer::new();
        let mut out = Vec::new();
        // Plenty of leading silence, more than the backtrack window.
        for _ in 0..20 {
            endpointer.push_chunk(&quiet(), &mut out);
        }
        assert!(out.is_empty());
        assert_eq!(endpointer.state(), EndpointState::Pending);

        let mut speech_chunks = 0;
        while endpointer.state() != EndpointState::Going {
            endpointer.push_chunk(&loud(), &mut out);
            speech_chunks += 1;
            assert!(speech_chunks < 20, "classifier never started");
        }
        // Keep talking until the holding buffer starts flushing.
        for _ in 0..(MAX_PAUSE_MS / CHUNK_MS + 5) {
            endpointer.push_chunk(&loud(), &mut out);
        }
        // The backtrack prefix is bounded by BACKTRACK_MS of audio.
        assert!(!out.is_empty());

        // A long silence ends the utterance and drops the trailing buffer.
        let before = out.len();
        for _ in 0..(MAX_PAUSE_MS / CHUNK_MS + 2) {
            endpointer.push_chunk(&quiet(), &mut out);
            if endpointer.finished() {
                break;
            }
        }
        assert!(endpointer.finished());
        // Some pause audio may flush while the pause is still tolerated, but the tail that aged
        // into the stop decision is gone.
        assert!(out.len() - before <= MAX_PAUSE_MS / 1000 * SAMPLE_RATE as usize);
    }

    #[test]
    fn short_pause_is_retained_verbatim() {
        let mut endpointer = Endpointer::new();
        let mut out = Vec::new();
        // Room tone first so the background tracker settles low.
        for _ in 0..10 {
            endpointer.push_chunk(&quiet(), &mut out);
        }
        while endpointer.state() != EndpointState::Going {
            endpointer.push_chunk(&loud(), &mut out);
        }
        // Pause audio carries a marker value distinct from the quiet chunks so we can spot it.
        let pause = vec![7i16; SAMPLES_PER_CHUNK];
        let pause_chunks = MAX_PAUSE_MS / CHUNK_MS / 4;
        for _ in 0..pause_chunks {
            endpointer.push_chunk(&pause, &mut out);
        }
        assert_eq!(endpointer.state(), EndpointState::Going);
        // Resume speech, then keep going long enough that the pause ages out of the buffer.
        for _ in 0..(2 * MAX_PAUSE_MS / CHUNK_MS) {
            endpointer.push_chunk(&loud(), &mut out);
        }
        assert!(out.iter().any(|&s| s == 7));
    }

    #[test]
    fn capture_pipeline_writes_endpointed_audio() {
        let mut buffer = std::io::Cursor::new(Vec::new());
        let mut writer = WavWriter::new(&mut buffer, crate::WAV_SPEC).unwrap();

        let mut chunks: Vec<Vec<i16>> = vec![quiet(); 10];
        chunks.extend(vec![loud(); 200]);
        chunks.extend(vec![quiet(); MAX_PAUSE_MS / CHUNK_MS + 2]);

        let written = capture_endpointed_audio(chunks, &mut writer, false).unwrap();
        writer.finalize().unwrap();
        assert!(written > 0);
    }

    #[test]
    fn silent_stream_writes_nothing() {
        let mut buffer = std::io::Cursor::new(Vec::new());
        let mut writer = WavWriter::new(&mut buffer, crate::WAV_SPEC).unwrap();
        let chunks: Vec<Vec<i16>> = vec![quiet(); 50];
        let written = capture_endpointed_audio(chunks, &mut writer, true).unwrap();
        assert_eq!(written, 0);
    }
}
