//! Playback driver: pulls buffered audio on the device cadence
//!
//! The device lives on its own thread for its whole lifetime since some
//! backends hand out streams that cannot cross threads. The driver talks to
//! that thread through two channels: one reporting whether the open worked,
//! one telling it to close.

use super::buffer::AudioRingBuffer;
use super::device::{DeviceConfig, OutputDevice};
use crate::config::PlaybackConfig;
use crate::error::{Result, SteerError};
use crate::status::SessionEvent;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Render callback state
///
/// Runs inside the device callback: it never allocates, never blocks on
/// anything but the buffer's copy lock, and only ever `try_send`s events.
pub struct Renderer {
    buffer: AudioRingBuffer,
    paused: Arc<AtomicBool>,
    events: Sender<SessionEvent>,
    stall_events: Arc<AtomicU64>,
    stall_threshold: u32,
    short_streak: u32,
    stalled: bool,
}

impl Renderer {
    pub fn new(
        buffer: AudioRingBuffer,
        paused: Arc<AtomicBool>,
        events: Sender<SessionEvent>,
        stall_events: Arc<AtomicU64>,
        stall_threshold: u32,
    ) -> Self {
        Self {
            buffer,
            paused,
            events,
            stall_events,
            stall_threshold: stall_threshold.max(1),
            short_streak: 0,
            stalled: false,
        }
    }

    /// Fill one device buffer
    pub fn render(&mut self, out: &mut [f32]) {
        if self.paused.load(Ordering::Relaxed) {
            out.fill(0.0);
            return;
        }

        let wanted = out.len() / usize::from(self.buffer.channels());
        let got = self.buffer.pull_into(out);

        if got < wanted {
            self.short_streak = self.short_streak.saturating_add(1);
            if self.short_streak >= self.stall_threshold && !self.stalled {
                self.stalled = true;
                self.stall_events.fetch_add(1, Ordering::Relaxed);
                let _ = self.events.try_send(SessionEvent::PlaybackStalled {
                    consecutive: self.short_streak,
                });
            }
        } else {
            if self.stalled {
                self.stalled = false;
                let _ = self.events.try_send(SessionEvent::PlaybackRecovered);
            }
            self.short_streak = 0;
        }
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled
    }
}

struct DeviceWorker {
    stop_tx: Sender<()>,
    thread: JoinHandle<()>,
}

/// Owns the output device and feeds it from the ring buffer
pub struct PlaybackDriver {
    buffer: AudioRingBuffer,
    device: Arc<dyn OutputDevice>,
    config: PlaybackConfig,
    events: Sender<SessionEvent>,
    paused: Arc<AtomicBool>,
    stall_events: Arc<AtomicU64>,
    worker: Mutex<Option<DeviceWorker>>,
    opened_config: Mutex<Option<DeviceConfig>>,
}

impl PlaybackDriver {
    pub fn new(
        buffer: AudioRingBuffer,
        device: Arc<dyn OutputDevice>,
        config: PlaybackConfig,
        events: Sender<SessionEvent>,
    ) -> Self {
        Self {
            buffer,
            device,
            config,
            events,
            paused: Arc::new(AtomicBool::new(false)),
            stall_events: Arc::new(AtomicU64::new(0)),
            worker: Mutex::new(None),
            opened_config: Mutex::new(None),
        }
    }

    /// Open the device and start pulling
    ///
    /// Returns once the device is running, or with the open error. Opening
    /// an open driver does nothing.
    pub fn open(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            debug!("Playback already open");
            return Ok(());
        }

        let (ready_tx, ready_rx) = bounded::<Result<DeviceConfig>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let device = Arc::clone(&self.device);
        let device_config = DeviceConfig::from(&self.config);
        let mut renderer = Renderer::new(
            self.buffer.clone(),
            Arc::clone(&self.paused),
            self.events.clone(),
            Arc::clone(&self.stall_events),
            self.config.stall_threshold,
        );

        let thread = std::thread::Builder::new()
            .name("playback-device".into())
            .spawn(move || {
                let callback = Box::new(move |out: &mut [f32]| renderer.render(out));
                match device.open(&device_config, callback) {
                    Ok(guard) => {
                        let _ = ready_tx.send(Ok(guard.config()));
                        // Either a stop signal or the driver going away
                        let _ = stop_rx.recv();
                        drop(guard);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| SteerError::AudioDevice(format!("Failed to spawn device thread: {}", e)))?;

        match ready_rx.recv_timeout(self.config.open_timeout()) {
            Ok(Ok(opened)) => {
                info!(
                    "Playback started on {} ({} Hz, {} channels)",
                    self.device.name(),
                    opened.sample_rate,
                    opened.channels
                );
                *self.opened_config.lock() = Some(opened);
                *worker = Some(DeviceWorker { stop_tx, thread });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(RecvTimeoutError::Timeout) => {
                // The thread closes the device itself if it ever opens
                let _ = stop_tx.send(());
                Err(SteerError::AudioDevice(format!(
                    "Timed out opening {} after {:?}",
                    self.device.name(),
                    self.config.open_timeout()
                )))
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = thread.join();
                Err(SteerError::AudioDevice("Device thread exited during open".into()))
            }
        }
    }

    /// Close the device; does nothing when already closed
    pub fn close(&self) {
        let worker = self.worker.lock().take();
        let Some(worker) = worker else {
            return;
        };

        let _ = worker.stop_tx.send(());
        if worker.thread.join().is_err() {
            warn!("Device thread panicked while closing");
        }
        *self.opened_config.lock() = None;
        info!("Playback stopped");
    }

    pub fn is_open(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Render silence without consuming buffered audio
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Stall episodes reported since creation
    pub fn stall_events(&self) -> u64 {
        self.stall_events.load(Ordering::Relaxed)
    }

    /// Format the device opened with, while open
    pub fn device_config(&self) -> Option<DeviceConfig> {
        *self.opened_config.lock()
    }

    pub fn config(&self) -> &PlaybackConfig {
        &self.config
    }

    pub fn buffer(&self) -> &AudioRingBuffer {
        &self.buffer
    }
}

impl Drop for PlaybackDriver {
    fn drop(&mut self) {
        self.close();
    }
}
