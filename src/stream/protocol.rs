//! Messages exchanged with the music model
//!
//! Everything is JSON with a `type` tag in snake_case. Audio arrives as
//! base64 PCM16 with its format in the mime type.

use crate::audio::chunk::{decode_pcm16, encode_pcm16, PcmFormat};
use crate::error::{Result, SteerError};
use crate::params::{GenerationMode, ParameterSnapshot, Scale, WeightedPrompt};
use serde::{Deserialize, Serialize};

/// Transport commands for the model's generator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackControl {
    Play,
    Pause,
    Stop,
    /// Drop the model's musical context and start fresh
    ResetContext,
}

/// Musical knobs, sent as one message
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub bpm: u16,
    pub density: f32,
    pub brightness: f32,
    pub scale: Scale,
    pub guidance: f32,
    pub mute_bass: bool,
    pub mute_drums: bool,
    pub only_bass_and_drums: bool,
    pub music_generation_mode: GenerationMode,
}

impl From<&ParameterSnapshot> for GenerationConfig {
    fn from(snapshot: &ParameterSnapshot) -> Self {
        Self {
            bpm: snapshot.bpm,
            density: snapshot.density,
            brightness: snapshot.brightness,
            scale: snapshot.scale,
            guidance: snapshot.guidance,
            mute_bass: snapshot.mute_bass,
            mute_drums: snapshot.mute_drums,
            only_bass_and_drums: snapshot.only_bass_and_drums,
            music_generation_mode: snapshot.mode,
        }
    }
}

/// Client to model
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    WeightedPrompts { prompts: Vec<WeightedPrompt> },
    MusicGenerationConfig(GenerationConfig),
    PlaybackControl { control: PlaybackControl },
}

impl ClientMessage {
    /// The full steering state as the model expects it: prompts, then config
    pub fn from_snapshot(snapshot: &ParameterSnapshot) -> [ClientMessage; 2] {
        [
            ClientMessage::WeightedPrompts {
                prompts: snapshot.prompts.clone(),
            },
            ClientMessage::MusicGenerationConfig(GenerationConfig::from(snapshot)),
        ]
    }

    pub fn control(control: PlaybackControl) -> Self {
        ClientMessage::PlaybackControl { control }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| SteerError::Channel(format!("Failed to encode message: {}", e)))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| SteerError::Decode(format!("Bad client message: {}", e)))
    }
}

/// Model to client
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The session is set up and will start producing audio
    SetupComplete,
    AudioChunk {
        /// base64 of little-endian PCM16
        data: String,
        mime_type: String,
        /// Upstream ordering, when the model provides it
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence: Option<u64>,
    },
    /// A prompt was rejected by the model's safety filter
    FilteredPrompt { text: String, reason: String },
    Warning { message: String },
}

impl ServerMessage {
    /// Wrap interleaved samples as an audio chunk message
    pub fn audio(samples: &[f32], format: PcmFormat, sequence: Option<u64>) -> Self {
        ServerMessage::AudioChunk {
            data: encode_pcm16(samples),
            mime_type: format.mime_type(),
            sequence,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| SteerError::Channel(format!("Failed to encode message: {}", e)))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| SteerError::Decode(format!("Bad server message: {}", e)))
    }
}

/// Decode an `AudioChunk` payload into its format and interleaved samples
pub fn decode_audio(data: &str, mime_type: &str) -> Result<(PcmFormat, Vec<f32>)> {
    let format = PcmFormat::from_mime(mime_type)?;
    let samples = decode_pcm16(data, format)?;
    Ok((format, samples))
}
