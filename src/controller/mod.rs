//! Steering controller: the one entry point for the UI
//!
//! Owns the parameter state, the session status, the ring buffer, the
//! playback driver and the current stream session. All methods take `&self`
//! and may be called from any thread that is not itself a runtime worker.

pub mod debounce;

use crate::audio::buffer::AudioRingBuffer;
use crate::audio::device::{HeadlessDevice, OutputDevice};
use crate::audio::playback::PlaybackDriver;
use crate::audio::tone::test_tone;
use crate::config::{ReconnectConfig, SteeringConfig};
use crate::error::{Result, SteerError};
use crate::params::{ParameterDelta, ParameterSnapshot, ParameterState, WeightedPrompt};
use crate::status::{SessionEvent, SessionHandle, SessionState, SharedSessionStatus, Telemetry};
use crate::stream::backoff::Backoff;
use crate::stream::protocol::PlaybackControl;
use crate::stream::session::{SessionConfig, StreamSession};
use crate::stream::transport::Transport;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use debounce::Debouncer;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::runtime::Runtime;
use tracing::{debug, error, info, warn};

type SessionSlot = Arc<Mutex<Option<Arc<StreamSession>>>>;

/// Top-level orchestrator for a steering session
pub struct SteeringController {
    config: SteeringConfig,
    transport: Arc<dyn Transport>,
    params: Mutex<ParameterState>,
    status: SharedSessionStatus,
    buffer: AudioRingBuffer,
    playback: Arc<PlaybackDriver>,
    session: SessionSlot,
    debouncer: Debouncer,
    /// Where sessions and playback report
    internal_tx: Sender<SessionEvent>,
    /// What the UI sees, after the monitor has acted on it
    events_rx: Receiver<SessionEvent>,
    monitor_shutdown: Mutex<Option<Sender<()>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    runtime: Runtime,
}

impl SteeringController {
    pub fn builder(transport: Arc<dyn Transport>) -> ControllerBuilder {
        ControllerBuilder::new(transport)
    }

    /// Create a controller; nothing connects until `start_session`
    pub fn new(
        config: SteeringConfig,
        transport: Arc<dyn Transport>,
        device: Arc<dyn OutputDevice>,
        initial: ParameterSnapshot,
    ) -> Result<Self> {
        config.validate()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("steer-runtime")
            .enable_all()
            .build()
            .map_err(|e| SteerError::Config(format!("Failed to create tokio runtime: {}", e)))?;

        let buffer = AudioRingBuffer::new(config.buffer.capacity_frames, config.playback.channels);
        let (internal_tx, internal_rx) = bounded(config.event_capacity);
        let (events_tx, events_rx) = bounded(config.event_capacity);

        let playback = Arc::new(PlaybackDriver::new(
            buffer.clone(),
            device,
            config.playback.clone(),
            internal_tx.clone(),
        ));

        let session: SessionSlot = Arc::new(Mutex::new(None));
        let session_clone = Arc::clone(&session);
        let debouncer = Debouncer::spawn(runtime.handle(), config.debounce(), move |snapshot| {
            if let Some(session) = session_clone.lock().as_ref() {
                session.send_update(snapshot);
            }
        });

        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let monitor = spawn_monitor(internal_rx, shutdown_rx, events_tx, Arc::clone(&playback))?;

        info!("Steering controller ready");
        Ok(Self {
            config,
            transport,
            params: Mutex::new(ParameterState::with_initial(initial)),
            status: SharedSessionStatus::new(),
            buffer,
            playback,
            session,
            debouncer,
            internal_tx,
            events_rx,
            monitor_shutdown: Mutex::new(Some(shutdown_tx)),
            monitor: Mutex::new(Some(monitor)),
            runtime,
        })
    }

    /// Validate and apply a parameter change
    ///
    /// Returns the new revision. Rejected changes leave the state untouched
    /// and send nothing. Accepted changes reach the model after the debounce
    /// window, or with the next `start_session` when nothing is running.
    pub fn update_parameters(&self, delta: ParameterDelta) -> Result<u64> {
        let snapshot = self.params.lock().apply(delta).map_err(|e| {
            debug!("Rejected parameter change: {}", e);
            SteerError::from(e)
        })?;
        let revision = snapshot.revision;
        self.debouncer.submit(snapshot);
        Ok(revision)
    }

    pub fn set_prompts(&self, prompts: Vec<WeightedPrompt>) -> Result<u64> {
        self.update_parameters(ParameterDelta::new().with_prompts(prompts))
    }

    /// Open the device and connect
    ///
    /// Retries the handshake up to `start_attempts` times with the reconnect
    /// backoff. Starting a running session does nothing.
    pub fn start_session(&self) -> Result<()> {
        if self.is_running() {
            debug!("Session already running");
            return Ok(());
        }

        self.playback.open()?;

        let session = Arc::new(StreamSession::new(
            Arc::clone(&self.transport),
            self.buffer.clone(),
            self.status.clone(),
            self.internal_tx.clone(),
            SessionConfig::from(&self.config),
        ));
        *self.session.lock() = Some(Arc::clone(&session));

        let mut backoff = Backoff::new(&ReconnectConfig {
            max_attempts: self.config.start_attempts.saturating_sub(1),
            ..self.config.reconnect.clone()
        });

        let stops = session.stop_count();
        let result = self.runtime.block_on(async {
            loop {
                let snapshot = self.params.lock().snapshot();
                match session.start(snapshot).await {
                    Ok(()) => return Ok(()),
                    // Stopped from another thread; don't come back to life
                    Err(e) if session.stop_count() != stops => return Err(e),
                    Err(e) => match backoff.next_delay() {
                        Some(delay) => {
                            warn!("Session start failed, retrying in {:?}: {}", delay, e);
                            tokio::time::sleep(delay).await;
                            if session.stop_count() != stops {
                                return Err(e);
                            }
                        }
                        None => return Err(e),
                    },
                }
            }
        });

        match result {
            Ok(()) => {
                // Catch anything changed while the handshake was in flight
                session.send_update(self.params.lock().snapshot());
                self.playback.resume();
                Ok(())
            }
            Err(e) => {
                error!("Could not start session: {}", e);
                self.playback.close();
                Err(e)
            }
        }
    }

    /// Stop streaming and close the device; safe to call at any time
    pub fn stop_session(&self) {
        let session = self.session.lock().clone();
        if let Some(session) = session {
            session.stop();
        }
        self.playback.close();
    }

    pub fn is_running(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .map(|session| session.is_running())
            .unwrap_or(false)
    }

    /// Resume generation and playback
    pub fn play(&self) {
        self.send_control(PlaybackControl::Play);
        self.playback.resume();
    }

    /// Pause generation; the device plays silence and keeps buffered audio
    pub fn pause(&self) {
        self.send_control(PlaybackControl::Pause);
        self.playback.pause();
    }

    /// Drop buffered audio and ask the model to start a fresh context
    ///
    /// The session clears the buffer and any chunks it is holding, then
    /// re-sends the current parameters after the reset.
    pub fn reset_context(&self) {
        let session = self.session.lock().clone();
        match session {
            Some(session) if session.is_running() => session.send_control(PlaybackControl::ResetContext),
            // No session writing to the buffer
            _ => self.buffer.clear(),
        }
        info!("Context reset requested");
    }

    /// Queue a 440 Hz tone to check the output path
    ///
    /// Opens the device if needed. With a session running the tone is queued
    /// behind the model audio already received.
    pub fn play_test_tone(&self, duration_secs: f32) -> Result<()> {
        self.playback.open()?;
        self.playback.resume();
        let tone = test_tone(
            duration_secs,
            self.config.playback.sample_rate,
            self.config.playback.channels,
        );
        // A running session owns the buffer; otherwise nothing else writes it
        let session = self.session.lock().clone();
        let queued = session.map_or(false, |session| session.inject_audio(tone.clone()));
        if !queued {
            self.buffer.push_samples(&tone);
        }
        info!("Playing {:.1}s test tone", duration_secs);
        Ok(())
    }

    fn send_control(&self, control: PlaybackControl) {
        match self.session.lock().as_ref() {
            Some(session) => session.send_control(control),
            None => debug!("No session, ignoring {:?}", control),
        }
    }

    pub fn state(&self) -> SessionState {
        self.status.state()
    }

    pub fn status(&self) -> SessionHandle {
        self.status.snapshot()
    }

    pub fn shared_status(&self) -> SharedSessionStatus {
        self.status.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.status.last_error()
    }

    /// Latest accepted parameters
    pub fn snapshot(&self) -> ParameterSnapshot {
        self.params.lock().snapshot()
    }

    /// Events for UI polling
    pub fn events(&self) -> Receiver<SessionEvent> {
        self.events_rx.clone()
    }

    pub fn telemetry(&self) -> Telemetry {
        let stats = self.buffer.stats();
        let session = self.session.lock().clone();
        let (decode_errors, chunks_received) = session
            .map(|s| (s.decode_errors(), s.chunks_received()))
            .unwrap_or((0, 0));

        Telemetry {
            state: self.status.state(),
            fill_level: stats.fill_level,
            fill_ratio: stats.fill_ratio(),
            underrun_count: stats.underrun_count,
            overflow_count: stats.overflow_count,
            dropped_frames: stats.dropped_frames,
            decode_errors,
            stall_events: self.playback.stall_events(),
            chunks_received,
            revision: self.params.lock().revision(),
        }
    }

    /// Shared handle to the ring buffer, for level meters
    pub fn buffer(&self) -> &AudioRingBuffer {
        &self.buffer
    }

    pub fn is_playback_open(&self) -> bool {
        self.playback.is_open()
    }

    pub fn config(&self) -> &SteeringConfig {
        &self.config
    }
}

impl Drop for SteeringController {
    fn drop(&mut self) {
        self.stop_session();
        // Dropping the sender wakes the monitor
        self.monitor_shutdown.lock().take();
        if let Some(monitor) = self.monitor.lock().take() {
            if monitor.join().is_err() {
                warn!("Event monitor panicked");
            }
        }
    }
}

/// Act on session and playback events, then pass them on to the UI
fn spawn_monitor(
    internal_rx: Receiver<SessionEvent>,
    shutdown_rx: Receiver<()>,
    events_tx: Sender<SessionEvent>,
    playback: Arc<PlaybackDriver>,
) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("steer-monitor".into())
        .spawn(move || {
            loop {
                let event = select! {
                    recv(internal_rx) -> event => match event {
                        Ok(event) => event,
                        Err(_) => break,
                    },
                    recv(shutdown_rx) -> _ => break,
                };

                match &event {
                    SessionEvent::SessionLost(reason) => {
                        error!("Session lost, closing audio output: {}", reason);
                        playback.close();
                    }
                    SessionEvent::PlaybackStalled { consecutive } => {
                        warn!("Playback stalled after {} short callbacks", consecutive);
                    }
                    SessionEvent::PlaybackRecovered => info!("Playback recovered"),
                    SessionEvent::StateChanged(state) => debug!("Session state: {}", state),
                    SessionEvent::ModelWarning(_) => {}
                }

                if events_tx.try_send(event).is_err() {
                    debug!("UI event channel full, dropping event");
                }
            }
            debug!("Event monitor stopped");
        })
        .map_err(|e| SteerError::Channel(format!("Failed to spawn event monitor: {}", e)))
}

/// Builder for a `SteeringController`
pub struct ControllerBuilder {
    transport: Arc<dyn Transport>,
    config: SteeringConfig,
    device: Arc<dyn OutputDevice>,
    initial: ParameterSnapshot,
}

impl ControllerBuilder {
    /// Defaults: default config, headless output, default parameters
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            config: SteeringConfig::default(),
            device: Arc::new(HeadlessDevice::new()),
            initial: ParameterSnapshot::default(),
        }
    }

    pub fn with_config(mut self, config: SteeringConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_device(mut self, device: Arc<dyn OutputDevice>) -> Self {
        self.device = device;
        self
    }

    pub fn with_initial_parameters(mut self, initial: ParameterSnapshot) -> Self {
        self.initial = initial;
        self
    }

    pub fn build(self) -> Result<SteeringController> {
        SteeringController::new(self.config, self.transport, self.device, self.initial)
    }
}
