//! Audio chunks received from the model
//!
//! Payloads arrive as base64 little-endian 16-bit PCM with the format carried
//! in a mime type such as `audio/l16;rate=48000;channels=2`.

use crate::error::{Result, SteerError};
use base64::Engine;
use std::collections::BTreeMap;
use std::time::Duration;

/// One decoded unit of PCM audio, ready for the ring buffer
#[derive(Clone, Debug, PartialEq)]
pub struct AudioChunk {
    /// Interleaved samples in [-1.0, 1.0]
    pub frames: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Monotonic within a session, assigned when the chunk is accepted
    pub sequence_number: u64,
}

impl AudioChunk {
    pub fn frame_count(&self) -> usize {
        self.frames.len() / usize::from(self.channels.max(1))
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frame_count() as f64 / self.sample_rate as f64)
    }
}

/// Sample format described by a chunk's mime type
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
        }
    }
}

impl PcmFormat {
    /// Parse `audio/l16;rate=..;channels=..`
    ///
    /// Missing parameters fall back to 48 kHz stereo.
    pub fn from_mime(mime: &str) -> Result<Self> {
        let mut parts = mime.split(';').map(str::trim);
        let essence = parts.next().unwrap_or_default().to_ascii_lowercase();
        if essence != "audio/l16" && essence != "audio/pcm" {
            return Err(SteerError::Decode(format!("unsupported mime type {:?}", mime)));
        }

        let mut format = PcmFormat::default();
        for param in parts.filter(|p| !p.is_empty()) {
            let (key, value) = param
                .split_once('=')
                .ok_or_else(|| SteerError::Decode(format!("malformed mime parameter {:?}", param)))?;
            let value = value.trim();
            match key.trim().to_ascii_lowercase().as_str() {
                "rate" => {
                    format.sample_rate = value
                        .parse()
                        .map_err(|_| SteerError::Decode(format!("bad sample rate {:?}", value)))?;
                }
                "channels" => {
                    format.channels = value
                        .parse()
                        .map_err(|_| SteerError::Decode(format!("bad channel count {:?}", value)))?;
                }
                _ => {}
            }
        }

        if format.sample_rate == 0 || format.channels == 0 {
            return Err(SteerError::Decode(format!("degenerate format in {:?}", mime)));
        }
        Ok(format)
    }

    pub fn mime_type(&self) -> String {
        format!("audio/l16;rate={};channels={}", self.sample_rate, self.channels)
    }

    fn frame_bytes(&self) -> usize {
        usize::from(self.channels) * 2
    }
}

/// Decode a base64 PCM16 payload into interleaved f32 samples
pub fn decode_pcm16(payload: &str, format: PcmFormat) -> Result<Vec<f32>> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload)
        .map_err(|e| SteerError::Decode(format!("invalid base64 payload: {}", e)))?;

    if bytes.is_empty() {
        return Err(SteerError::Decode("empty audio payload".into()));
    }
    if bytes.len() % format.frame_bytes() != 0 {
        return Err(SteerError::Decode(format!(
            "payload of {} bytes is not a whole number of {}-channel frames",
            bytes.len(),
            format.channels
        )));
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect())
}

/// Encode interleaved f32 samples as a base64 PCM16 payload
pub fn encode_pcm16(samples: &[f32]) -> String {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let value = (sample.clamp(-1.0, 1.0) * 32767.0).round() as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Change the channel count of interleaved samples
///
/// Mono is duplicated across every output channel; anything else is averaged
/// down to mono first.
pub fn remix(samples: &[f32], from: u16, to: u16) -> Vec<f32> {
    let from = usize::from(from.max(1));
    let to = usize::from(to.max(1));
    if from == to {
        return samples.to_vec();
    }

    let mut output = Vec::with_capacity(samples.len() / from * to);
    for frame in samples.chunks_exact(from) {
        let mono = frame.iter().sum::<f32>() / from as f32;
        output.extend(std::iter::repeat(mono).take(to));
    }
    output
}

/// What happened to a chunk handed to the reorderer
#[derive(Debug, PartialEq)]
pub enum Reordered<T> {
    /// These items can be played now, in order
    Ready(Vec<T>),
    /// Waiting for an earlier sequence number
    Held,
    /// Older than what was already released, or a duplicate
    Dropped,
}

/// Restores upstream order within a bounded window
///
/// The first sequence number seen after a reset becomes the baseline. When
/// more than `window` items are waiting behind a gap, the gap is abandoned and
/// playback resumes from the oldest waiting item.
#[derive(Debug)]
pub struct ChunkReorderer<T> {
    next_expected: Option<u64>,
    /// `None` marks a sequence number that arrived but carries nothing to play
    pending: BTreeMap<u64, Option<T>>,
    window: usize,
    skipped: u64,
}

impl<T> ChunkReorderer<T> {
    pub fn new(window: usize) -> Self {
        Self {
            next_expected: None,
            pending: BTreeMap::new(),
            window: window.max(1),
            skipped: 0,
        }
    }

    pub fn accept(&mut self, sequence: u64, item: T) -> Reordered<T> {
        self.place(sequence, Some(item))
    }

    /// Mark `sequence` as received without anything to play
    ///
    /// Used for chunks that failed to decode, so later chunks are not held
    /// behind them. May release items that were waiting on it.
    pub fn skip(&mut self, sequence: u64) -> Reordered<T> {
        self.place(sequence, None)
    }

    fn place(&mut self, sequence: u64, slot: Option<T>) -> Reordered<T> {
        let expected = *self.next_expected.get_or_insert(sequence);

        if sequence < expected || self.pending.contains_key(&sequence) {
            return Reordered::Dropped;
        }
        self.pending.insert(sequence, slot);

        if sequence != expected && self.pending.len() <= self.window {
            return Reordered::Held;
        }
        if sequence != expected {
            // Window exhausted: give up on the missing sequence numbers
            if let Some(&oldest) = self.pending.keys().next() {
                self.skipped += oldest - expected;
                self.next_expected = Some(oldest);
            }
        }

        Reordered::Ready(self.drain_ready())
    }

    fn drain_ready(&mut self) -> Vec<T> {
        let mut ready = Vec::new();
        while let Some(expected) = self.next_expected {
            match self.pending.remove(&expected) {
                Some(slot) => {
                    ready.extend(slot);
                    self.next_expected = Some(expected + 1);
                }
                None => break,
            }
        }
        ready
    }

    /// Forget ordering state, e.g. after a reconnect
    pub fn reset(&mut self) {
        self.next_expected = None;
        self.pending.clear();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Sequence numbers abandoned because the window filled up
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}
