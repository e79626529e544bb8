//! Configuration for the steering core
//!
//! Values are injected by the host application. Nothing here reads files or
//! the environment; the structs derive `Deserialize` so the host can load
//! them however it likes.

use crate::error::{Result, SteerError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Ring buffer sizing and chunk ordering
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Capacity in frames (one sample per channel)
    pub capacity_frames: usize,
    /// How many chunks may wait behind a missing sequence number
    pub reorder_window: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            // One second at 48 kHz
            capacity_frames: 48_000,
            reorder_window: 8,
        }
    }
}

/// Reconnect backoff policy
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the delay added or removed at random, 0.2 = ±20%
    pub jitter: f64,
    /// Consecutive failed attempts before the session is declared lost
    pub max_attempts: u32,
    pub connect_timeout_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            jitter: 0.2,
            max_attempts: 6,
            connect_timeout_ms: 5_000,
        }
    }
}

impl ReconnectConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Output device settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Frames per device callback; sets the pull cadence
    pub buffer_frames: u32,
    /// Consecutive under-filled callbacks before a stall is reported
    pub stall_threshold: u32,
    pub open_timeout_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            // 20 ms at 48 kHz
            buffer_frames: 960,
            stall_threshold: 5,
            open_timeout_ms: 5_000,
        }
    }
}

impl PlaybackConfig {
    /// Time between device callbacks
    pub fn callback_period(&self) -> Duration {
        let nanos = u64::from(self.buffer_frames) * 1_000_000_000;
        Duration::from_nanos(nanos / u64::from(self.sample_rate.max(1)))
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }
}

/// Channel sizing for the model connection
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Inbound messages buffered between the reader and the supervisor
    pub inbound_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self { inbound_capacity: 256 }
    }
}

/// Configuration for the whole steering core
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SteeringConfig {
    pub buffer: BufferConfig,
    pub reconnect: ReconnectConfig,
    pub playback: PlaybackConfig,
    pub stream: StreamConfig,
    /// Parameter changes within this window are sent as one update
    pub debounce_ms: u64,
    /// Handshake attempts made by `start_session` before giving up
    pub start_attempts: u32,
    pub event_capacity: usize,
}

impl Default for SteeringConfig {
    fn default() -> Self {
        Self {
            buffer: BufferConfig::default(),
            reconnect: ReconnectConfig::default(),
            playback: PlaybackConfig::default(),
            stream: StreamConfig::default(),
            debounce_ms: 75,
            start_attempts: 3,
            event_capacity: 256,
        }
    }
}

impl SteeringConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_buffer_capacity(mut self, capacity_frames: usize) -> Self {
        self.buffer.capacity_frames = capacity_frames;
        self
    }

    pub fn with_reorder_window(mut self, window: usize) -> Self {
        self.buffer.reorder_window = window;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_playback(mut self, playback: PlaybackConfig) -> Self {
        self.playback = playback;
        self
    }

    pub fn with_debounce_ms(mut self, debounce_ms: u64) -> Self {
        self.debounce_ms = debounce_ms;
        self
    }

    pub fn with_start_attempts(mut self, attempts: u32) -> Self {
        self.start_attempts = attempts;
        self
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.buffer.capacity_frames == 0 {
            return Err(SteerError::Config("buffer capacity must be non-zero".into()));
        }
        if self.buffer.reorder_window == 0 {
            return Err(SteerError::Config("reorder window must be non-zero".into()));
        }
        if self.playback.sample_rate == 0 || self.playback.channels == 0 {
            return Err(SteerError::Config(
                "playback sample rate and channels must be non-zero".into(),
            ));
        }
        if self.playback.buffer_frames == 0 {
            return Err(SteerError::Config("device buffer size must be non-zero".into()));
        }
        if (self.playback.buffer_frames as usize) > self.buffer.capacity_frames {
            return Err(SteerError::Config(format!(
                "device buffer of {} frames does not fit in a ring buffer of {}",
                self.playback.buffer_frames, self.buffer.capacity_frames
            )));
        }
        if self.reconnect.base_delay_ms > self.reconnect.max_delay_ms {
            return Err(SteerError::Config(
                "reconnect base delay exceeds the maximum delay".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.reconnect.jitter) {
            return Err(SteerError::Config("jitter must be within [0, 1)".into()));
        }
        if self.start_attempts == 0 {
            return Err(SteerError::Config("start attempts must be at least 1".into()));
        }
        if self.stream.inbound_capacity == 0 {
            return Err(SteerError::Config("inbound capacity must be non-zero".into()));
        }
        if self.event_capacity == 0 {
            return Err(SteerError::Config("event capacity must be non-zero".into()));
        }
        Ok(())
    }
}
