//! A local stand-in for the music model
//!
//! Synthesises audio that follows the steering parameters closely enough to
//! hear them: the scale picks the root note, density the level, brightness
//! the overtones and bpm the pulse. Used by the demo binary and for running
//! the pipeline without network access.

use super::protocol::{ClientMessage, GenerationConfig, PlaybackControl, ServerMessage};
use super::transport::{in_memory, Connection, ConnectionPeer, Transport};
use crate::audio::chunk::PcmFormat;
use crate::error::Result;
use crate::params::{ParameterSnapshot, WeightedPrompt};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::f32::consts::PI;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Transport that generates audio in-process
#[derive(Clone, Debug)]
pub struct SimulatedTransport {
    format: PcmFormat,
    chunk_duration: Duration,
    /// End every connection after this many chunks
    drop_after: Option<u64>,
    connections: Arc<Mutex<u64>>,
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self {
            format: PcmFormat::default(),
            chunk_duration: Duration::from_millis(100),
            drop_after: None,
            connections: Arc::new(Mutex::new(0)),
        }
    }
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_format(mut self, format: PcmFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_chunk_duration(mut self, duration: Duration) -> Self {
        self.chunk_duration = duration;
        self
    }

    /// Drop each connection after `chunks` chunks to exercise reconnects
    pub fn with_drop_after(mut self, chunks: u64) -> Self {
        self.drop_after = Some(chunks);
        self
    }

    /// Connections opened so far
    pub fn connection_count(&self) -> u64 {
        *self.connections.lock()
    }
}

impl Transport for SimulatedTransport {
    fn connect(&self) -> BoxFuture<'static, Result<Connection>> {
        let model = self.clone();
        Box::pin(async move {
            let (connection, peer) = in_memory(64);
            let id = {
                let mut count = model.connections.lock();
                *count += 1;
                *count
            };
            info!(connection = id, "Simulated model connected");
            tokio::spawn(model.run(id, peer));
            Ok(connection)
        })
    }
}

impl SimulatedTransport {
    async fn run(self, id: u64, mut peer: ConnectionPeer) {
        if !peer.send(ServerMessage::SetupComplete).await {
            return;
        }

        let mut synth = Synth::new(self.format);
        let mut playing = false;
        let mut sequence = 0u64;
        let mut ticker = tokio::time::interval(self.chunk_duration);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let frames = (self.chunk_duration.as_secs_f64() * f64::from(self.format.sample_rate)) as usize;

        loop {
            tokio::select! {
                message = peer.outbound.recv() => match message {
                    Some(ClientMessage::WeightedPrompts { prompts }) => synth.set_prompts(&prompts),
                    Some(ClientMessage::MusicGenerationConfig(config)) => synth.set_config(&config),
                    Some(ClientMessage::PlaybackControl { control }) => match control {
                        PlaybackControl::Play => playing = true,
                        PlaybackControl::Pause | PlaybackControl::Stop => playing = false,
                        PlaybackControl::ResetContext => synth.reset(),
                    },
                    None => break,
                },
                _ = ticker.tick(), if playing => {
                    let samples = synth.render(frames);
                    if !peer.send(ServerMessage::audio(&samples, self.format, Some(sequence))).await {
                        break;
                    }
                    sequence += 1;
                    if self.drop_after.is_some_and(|limit| sequence >= limit) {
                        info!(connection = id, "Simulated model dropping connection");
                        break;
                    }
                }
            }
        }
        debug!(connection = id, chunks = sequence, "Simulated model finished");
    }
}

/// Tone generator driven by the steering parameters
struct Synth {
    format: PcmFormat,
    config: GenerationConfig,
    /// Sum of prompt weights, scales the level
    prompt_energy: f32,
    phase: f32,
    position: u64,
}

impl Synth {
    fn new(format: PcmFormat) -> Self {
        let defaults = ParameterSnapshot::default();
        Self {
            format,
            config: GenerationConfig::from(&defaults),
            prompt_energy: 1.0,
            phase: 0.0,
            position: 0,
        }
    }

    fn set_prompts(&mut self, prompts: &[WeightedPrompt]) {
        self.prompt_energy = prompts.iter().map(|p| p.weight).sum::<f32>().min(1.0);
    }

    fn set_config(&mut self, config: &GenerationConfig) {
        self.config = config.clone();
    }

    fn reset(&mut self) {
        self.phase = 0.0;
        self.position = 0;
    }

    fn render(&mut self, frames: usize) -> Vec<f32> {
        let rate = self.format.sample_rate as f32;
        let channels = usize::from(self.format.channels);
        let frequency = self.config.scale.tonic_hz() / 2.0;
        let step = 2.0 * PI * frequency / rate;
        let beat_frames = (60.0 / f32::from(self.config.bpm.max(1)) * rate).max(1.0);
        let level = 0.1 + 0.3 * self.config.density * self.prompt_energy;
        let overtone = self.config.brightness * 0.5;

        let mut samples = Vec::with_capacity(frames * channels);
        for _ in 0..frames {
            let beat_position = (self.position as f32 % beat_frames) / beat_frames;
            let envelope = (1.0 - beat_position).powi(2);
            let value =
                (self.phase.sin() + overtone * (2.0 * self.phase).sin()) * level * envelope / (1.0 + overtone);
            samples.extend(std::iter::repeat(value).take(channels));

            self.phase = (self.phase + step) % (2.0 * PI);
            self.position += 1;
        }
        samples
    }
}
