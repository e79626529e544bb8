//! Shared fixtures for the integration tests
//!
//! The tests drive a controller from plain threads, so everything here polls
//! with a deadline instead of awaiting.

#![allow(dead_code)]

use lyria_steer::audio::{DeviceConfig, DeviceGuard, OutputDevice, PcmFormat, RenderCallback};
use lyria_steer::error::Result;
use lyria_steer::stream::{ClientMessage, ConnectionPeer, GenerationConfig, ServerMessage};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TryRecvError};

pub const WAIT: Duration = Duration::from_secs(3);

type Slot = Arc<Mutex<Option<RenderCallback>>>;

/// Output device that only renders when the test asks it to
#[derive(Clone, Default)]
pub struct ManualDevice {
    callback: Slot,
    opens: Arc<AtomicU32>,
}

struct ManualGuard {
    config: DeviceConfig,
    callback: Slot,
}

impl DeviceGuard for ManualGuard {
    fn config(&self) -> DeviceConfig {
        self.config
    }
}

impl Drop for ManualGuard {
    fn drop(&mut self) {
        self.callback.lock().take();
    }
}

impl OutputDevice for ManualDevice {
    fn name(&self) -> String {
        "manual".to_string()
    }

    fn open(&self, config: &DeviceConfig, callback: RenderCallback) -> Result<Box<dyn DeviceGuard>> {
        *self.callback.lock() = Some(callback);
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ManualGuard {
            config: *config,
            callback: Arc::clone(&self.callback),
        }))
    }
}

impl ManualDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one callback of `frames` stereo frames; `None` when closed
    pub fn render(&self, frames: usize) -> Option<Vec<f32>> {
        let mut slot = self.callback.lock();
        let callback = slot.as_mut()?;
        let mut out = vec![0.0f32; frames * 2];
        callback(&mut out);
        Some(out)
    }

    pub fn is_open(&self) -> bool {
        self.callback.lock().is_some()
    }

    pub fn open_count(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }
}

/// Poll `check` until it holds or `WAIT` runs out
pub fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    check()
}

/// Next connection the transport hands out
pub fn next_peer(peers: &mut mpsc::UnboundedReceiver<ConnectionPeer>) -> ConnectionPeer {
    let mut found = None;
    let arrived = eventually(|| {
        if found.is_none() {
            found = peers.try_recv().ok();
        }
        found.is_some()
    });
    assert!(arrived, "no connection within {:?}", WAIT);
    found.unwrap()
}

/// Everything the session sent within `window`
pub fn collect_for(peer: &mut ConnectionPeer, window: Duration) -> Vec<ClientMessage> {
    let deadline = Instant::now() + window;
    let mut sent = Vec::new();
    while Instant::now() < deadline {
        match peer.outbound.try_recv() {
            Ok(message) => sent.push(message),
            Err(TryRecvError::Empty) => std::thread::sleep(Duration::from_millis(2)),
            Err(TryRecvError::Disconnected) => break,
        }
    }
    sent
}

pub fn deliver(peer: &ConnectionPeer, message: ServerMessage) {
    assert!(peer.inbound.blocking_send(Ok(message)).is_ok(), "session went away");
}

pub fn stereo_chunk(value: f32, frames: usize, sequence: u64) -> ServerMessage {
    ServerMessage::audio(&vec![value; frames * 2], PcmFormat::default(), Some(sequence))
}

pub fn configs(sent: &[ClientMessage]) -> Vec<GenerationConfig> {
    sent.iter()
        .filter_map(|m| match m {
            ClientMessage::MusicGenerationConfig(config) => Some(config.clone()),
            _ => None,
        })
        .collect()
}
