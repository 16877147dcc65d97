//! # Audio Processing
//!
//! Validates client PCM, converts it between byte and sample form, and resamples
//! it from the client rate to the upstream rate.
//!
//! ## Key Functions:
//! - **process_audio_chunk**: pure validate → decode → resample → encode step
//! - **accumulate**: synchronous mode, slices arbitrary writes into `chunk_size` frames
//! - **write / start / stop**: streaming mode, ring buffer drained by a background task
//!
//! ## Pipeline (streaming mode):
//! ```text
//! write() ──► RingBuffer ──► drain task ──► resample ──► output queue ──► Session
//!                                                   └──► error queue (PipelineFull)
//! ```

use crate::audio::buffer::{BufferError, ChunkAccumulator, RingBuffer};
use crate::config::AudioSettings;
use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 16-bit PCM
pub const BYTES_PER_SAMPLE: usize = 2;

/// Format tag carried by every chunk this processor produces.
pub const LINEAR16: &str = "LINEAR16";

/// How long the drain task sleeps when less than a full frame is buffered.
const DRAIN_BACKOFF: Duration = Duration::from_millis(10);

/// Capacity of the output and error queues in streaming mode.
const PIPELINE_QUEUE_CAPACITY: usize = 10;

/// Errors produced while validating or moving audio through the pipeline.
///
/// ## Categories:
/// - **Input validation**: `EmptyChunk`, `InvalidChunkSize`
/// - **Capacity**: `BufferFull`, `PipelineFull` (backpressure, never fatal)
/// - **Lifecycle**: `AlreadyStarted`, `Stopped`
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AudioError {
    #[error("empty audio chunk")]
    EmptyChunk,

    #[error("invalid audio chunk size: {len} bytes (must be multiple of {})", BYTES_PER_SAMPLE)]
    InvalidChunkSize { len: usize },

    #[error("buffer full - applying backpressure")]
    BufferFull,

    #[error("processing pipeline full - dropping chunk")]
    PipelineFull,

    #[error("audio processor already started")]
    AlreadyStarted,

    #[error("audio processor is stopped")]
    Stopped,
}

impl AudioError {
    /// Backpressure signals that callers log and move past.
    pub fn is_capacity(&self) -> bool {
        matches!(self, AudioError::BufferFull | AudioError::PipelineFull)
    }
}

/// A unit of normalized audio ready for upstream transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    /// Little-endian signed 16-bit samples
    pub data: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u16,
    pub format: String,
}

impl AudioChunk {
    pub fn linear16(data: Vec<u8>, sample_rate: u32) -> Self {
        Self {
            data,
            sample_rate,
            channels: 1,
            format: LINEAR16.to_string(),
        }
    }
}

/// Reject input that cannot be split into whole 16-bit samples.
pub fn validate_pcm(data: &[u8]) -> Result<(), AudioError> {
    if data.is_empty() {
        return Err(AudioError::EmptyChunk);
    }
    if data.len() % BYTES_PER_SAMPLE != 0 {
        return Err(AudioError::InvalidChunkSize { len: data.len() });
    }
    Ok(())
}

/// Linear-interpolation resampler.
///
/// ## Algorithm:
/// - `ratio = output_rate / input_rate`, output length `floor(len * ratio)`
/// - output sample `i` sits at input position `p = i / ratio`
/// - past the second-to-last input sample the last sample is repeated
/// - otherwise `s[idx] + (s[idx + 1] - s[idx]) * frac(p)`, truncated toward zero
///
/// The computation is pure, so identical input always gives identical output.
pub fn resample(samples: &[i16], input_rate: u32, output_rate: u32) -> Vec<i16> {
    if samples.is_empty() || input_rate == output_rate {
        return samples.to_vec();
    }

    let ratio = output_rate as f64 / input_rate as f64;
    let output_len = (samples.len() as f64 * ratio) as usize;
    let last = samples.len() - 1;

    (0..output_len)
        .map(|i| {
            let position = i as f64 / ratio;
            let index = position as usize;
            if index >= last {
                return samples[last];
            }
            let fraction = position - index as f64;
            let s1 = samples[index] as f64;
            let s2 = samples[index + 1] as f64;
            (s1 + (s2 - s1) * fraction) as i16
        })
        .collect()
}

/// Decode, resample and re-encode one validated frame.
fn convert(data: &[u8], input_rate: u32, output_rate: u32) -> Result<AudioChunk, AudioError> {
    validate_pcm(data)?;

    let mut samples = vec![0i16; data.len() / BYTES_PER_SAMPLE];
    LittleEndian::read_i16_into(data, &mut samples);

    let samples = resample(&samples, input_rate, output_rate);

    let mut encoded = vec![0u8; samples.len() * BYTES_PER_SAMPLE];
    LittleEndian::write_i16_into(&samples, &mut encoded);

    Ok(AudioChunk::linear16(encoded, output_rate))
}

/// Per-session audio normalizer.
///
/// ## Modes:
/// - **Synchronous** (`streaming = false`): `accumulate` returns complete frames
///   inline; nothing runs in the background.
/// - **Streaming** (`streaming = true`): `write` feeds a bounded ring buffer,
///   `start` spawns the drain task, results arrive on `take_output`.
///
/// ## Rust Concepts:
/// - **Arc<RingBuffer>**: the drain task and the write path share one buffer
/// - **Mutex<Option<Sender>>**: queue ends are handed out once, then `None`
pub struct AudioProcessor {
    input_sample_rate: u32,
    output_sample_rate: u32,
    chunk_size: usize,
    streaming: bool,

    buffer: Arc<RingBuffer>,
    accumulator: Mutex<ChunkAccumulator>,

    output_tx: Mutex<Option<mpsc::Sender<AudioChunk>>>,
    output_rx: Mutex<Option<mpsc::Receiver<AudioChunk>>>,
    errors_tx: Mutex<Option<mpsc::Sender<AudioError>>>,
    errors_rx: Mutex<Option<mpsc::Receiver<AudioError>>>,

    cancel: CancellationToken,
    started: AtomicBool,
}

impl AudioProcessor {
    pub fn new(settings: &AudioSettings) -> Self {
        let (output_tx, output_rx) = mpsc::channel(PIPELINE_QUEUE_CAPACITY);
        let (errors_tx, errors_rx) = mpsc::channel(PIPELINE_QUEUE_CAPACITY);

        Self {
            input_sample_rate: settings.input_sample_rate,
            output_sample_rate: settings.output_sample_rate,
            chunk_size: settings.chunk_size,
            streaming: settings.streaming,
            buffer: Arc::new(RingBuffer::new(settings.buffer_size)),
            accumulator: Mutex::new(ChunkAccumulator::new(settings.chunk_size)),
            output_tx: Mutex::new(Some(output_tx)),
            output_rx: Mutex::new(Some(output_rx)),
            errors_tx: Mutex::new(Some(errors_tx)),
            errors_rx: Mutex::new(Some(errors_rx)),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Validate and resample one complete buffer of input audio.
    ///
    /// ## Returns:
    /// - **Ok(AudioChunk)**: resampled PCM tagged with the output rate, mono, LINEAR16
    /// - **Err(EmptyChunk)** / **Err(InvalidChunkSize)**: input rejected untouched
    pub fn process_audio_chunk(&self, data: &[u8]) -> Result<AudioChunk, AudioError> {
        convert(data, self.input_sample_rate, self.output_sample_rate)
    }

    /// Synchronous mode: add `data` to the pending bytes and process every
    /// complete frame.
    ///
    /// Invalid input is rejected before it reaches the accumulator, so pending
    /// bytes always stay sample-aligned.
    pub fn accumulate(&self, data: &[u8]) -> Result<Vec<AudioChunk>, AudioError> {
        validate_pcm(data)?;

        let frames = self.accumulator.lock().push(data);
        frames
            .iter()
            .map(|frame| self.process_audio_chunk(frame))
            .collect()
    }

    /// Streaming mode: queue `data` for the drain task.
    ///
    /// Tries an all-or-nothing write first; when the buffer is short on space
    /// it waits for the drain task to make room. A write released early by
    /// `stop` reports `BufferFull`.
    pub async fn write(&self, data: &[u8]) -> Result<(), AudioError> {
        validate_pcm(data)?;

        match self.buffer.try_write(data) {
            Ok(_) => Ok(()),
            Err(BufferError::WriterClosed) => Err(AudioError::BufferFull),
            Err(BufferError::WouldBlock) => {
                debug!(bytes = data.len(), "Audio buffer full, waiting for drain");
                let written = self.buffer.write(data).await;
                if written < data.len() {
                    Err(AudioError::BufferFull)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Take exactly `chunk_size` bytes from the ring buffer and resample them.
    ///
    /// `Ok(None)` means not enough audio is buffered yet.
    pub fn read_processed_audio(&self, chunk_size: usize) -> Result<Option<AudioChunk>, AudioError> {
        match self.buffer.read_exact(chunk_size) {
            Some(frame) => self.process_audio_chunk(&frame).map(Some),
            None => Ok(None),
        }
    }

    /// Spawn the drain task that turns buffered bytes into output chunks.
    ///
    /// ## Errors:
    /// - `AlreadyStarted` on a second call
    /// - `Stopped` after `stop`
    pub fn start(&self, chunk_size: usize) -> Result<(), AudioError> {
        if self.cancel.is_cancelled() {
            return Err(AudioError::Stopped);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(AudioError::AlreadyStarted);
        }

        let (Some(output), Some(errors)) = (self.output_tx.lock().take(), self.errors_tx.lock().take()) else {
            return Err(AudioError::Stopped);
        };

        let drain = DrainTask {
            buffer: self.buffer.clone(),
            chunk_size,
            input_sample_rate: self.input_sample_rate,
            output_sample_rate: self.output_sample_rate,
            output,
            errors,
            cancel: self.cancel.clone(),
        };

        info!(chunk_size, "Starting audio drain task");
        tokio::spawn(drain.run());
        Ok(())
    }

    /// Cancel the drain task and close the buffer's write side.
    ///
    /// Blocked writers are released and both queues close once the drain task
    /// (if any) exits.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.buffer.close_writer();
        // Unstarted processors still hold the senders
        self.output_tx.lock().take();
        self.errors_tx.lock().take();
    }

    /// Discard buffered audio in both modes.
    pub fn reset(&self) {
        self.buffer.reset();
        self.accumulator.lock().clear();
    }

    pub fn take_output(&self) -> Option<mpsc::Receiver<AudioChunk>> {
        self.output_rx.lock().take()
    }

    pub fn take_errors(&self) -> Option<mpsc::Receiver<AudioError>> {
        self.errors_rx.lock().take()
    }
}

struct DrainTask {
    buffer: Arc<RingBuffer>,
    chunk_size: usize,
    input_sample_rate: u32,
    output_sample_rate: u32,
    output: mpsc::Sender<AudioChunk>,
    errors: mpsc::Sender<AudioError>,
    cancel: CancellationToken,
}

impl DrainTask {
    async fn run(self) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let frame = match self.buffer.read_exact(self.chunk_size) {
                Some(frame) => frame,
                None => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(DRAIN_BACKOFF) => {}
                    }
                    continue;
                }
            };

            let chunk = match convert(&frame, self.input_sample_rate, self.output_sample_rate) {
                Ok(chunk) => chunk,
                Err(e) => {
                    self.report(e);
                    continue;
                }
            };

            match self.output.try_send(chunk) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Audio output queue full, dropping chunk");
                    self.report(AudioError::PipelineFull);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }

        debug!("Audio drain task stopped");
    }

    fn report(&self, error: AudioError) {
        if self.errors.try_send(error).is_err() {
            debug!("Audio error queue unavailable, error dropped");
        }
    }
}
