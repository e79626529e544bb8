//! Stream session: one logical conversation with the model
//!
//! Each connection gets a reader task and a writer task. The reader forwards
//! inbound messages, tagged with the connection's epoch, to a single
//! supervisor task; the writer drains the latest parameter snapshot and
//! playback controls. The supervisor decodes and orders audio into the ring
//! buffer, and on a drop runs the reconnect schedule while still draining
//! whatever arrives.

use super::backoff::Backoff;
use super::protocol::{decode_audio, ClientMessage, PlaybackControl, ServerMessage};
use super::transport::{Connection, InboundStream, Transport};
use crate::audio::buffer::AudioRingBuffer;
use crate::audio::chunk::{remix, AudioChunk, ChunkReorderer, PcmFormat, Reordered};
use crate::audio::resampler::StreamResampler;
use crate::config::{ReconnectConfig, SteeringConfig, StreamConfig};
use crate::error::{Result, SteerError};
use crate::params::ParameterSnapshot;
use crate::status::{SessionEvent, SessionState, SharedSessionStatus};
use crossbeam_channel::Sender;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Settings the session needs from the wider configuration
#[derive(Clone, Debug, PartialEq)]
pub struct SessionConfig {
    pub reconnect: ReconnectConfig,
    pub stream: StreamConfig,
    pub reorder_window: usize,
    /// Format audio is converted to before buffering
    pub output: PcmFormat,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&SteeringConfig::default())
    }
}

impl From<&SteeringConfig> for SessionConfig {
    fn from(config: &SteeringConfig) -> Self {
        Self {
            reconnect: config.reconnect.clone(),
            stream: config.stream.clone(),
            reorder_window: config.buffer.reorder_window,
            output: PcmFormat {
                sample_rate: config.playback.sample_rate,
                channels: config.playback.channels,
            },
        }
    }
}

#[derive(Default)]
struct SessionCounters {
    decode_errors: AtomicU64,
    updates_sent: AtomicU64,
    last_sent_revision: AtomicU64,
    chunks_received: AtomicU64,
    reconnects: AtomicU64,
}

/// Abort handles for every task belonging to the session
#[derive(Clone, Default)]
struct TaskRegistry {
    handles: Arc<Mutex<Vec<AbortHandle>>>,
}

impl TaskRegistry {
    fn track<T>(&self, handle: &JoinHandle<T>) {
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle.abort_handle());
    }

    fn abort_all(&self) {
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }
}

/// What a connection's reader or writer reports to the supervisor
#[derive(Debug)]
enum ConnectionEvent {
    Message(ServerMessage),
    Dropped(String),
}

/// Requests from the session handle to its supervisor
#[derive(Debug)]
enum Command {
    Control(PlaybackControl),
    /// Local audio, already in the output format
    Inject(Vec<f32>),
}

#[derive(Debug)]
struct Tagged {
    epoch: u64,
    event: ConnectionEvent,
}

/// Owns the connection to the model for the life of a session
pub struct StreamSession {
    transport: Arc<dyn Transport>,
    buffer: AudioRingBuffer,
    status: SharedSessionStatus,
    events: Sender<SessionEvent>,
    config: SessionConfig,
    counters: Arc<SessionCounters>,
    snapshots: watch::Sender<ParameterSnapshot>,
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    playing: Arc<AtomicBool>,
    tasks: TaskRegistry,
    running: AtomicBool,
    handshake_failures: AtomicU64,
    /// Bumped by every `stop`; held while a started session is wired up
    stops: Mutex<u64>,
}

impl StreamSession {
    pub fn new(
        transport: Arc<dyn Transport>,
        buffer: AudioRingBuffer,
        status: SharedSessionStatus,
        events: Sender<SessionEvent>,
        config: SessionConfig,
    ) -> Self {
        let (snapshots, _) = watch::channel(ParameterSnapshot::default());
        Self {
            transport,
            buffer,
            status,
            events,
            config,
            counters: Arc::new(SessionCounters::default()),
            snapshots,
            commands: Mutex::new(None),
            playing: Arc::new(AtomicBool::new(true)),
            tasks: TaskRegistry::default(),
            running: AtomicBool::new(false),
            handshake_failures: AtomicU64::new(0),
            stops: Mutex::new(0),
        }
    }

    /// Connect and start streaming with `initial` as the steering state
    ///
    /// The state stays `Connecting` until the model acknowledges the setup or
    /// sends audio. Starting a running session does nothing. A failed
    /// handshake leaves the session `Closed`; calling `start` again retries
    /// under the same session id. A `stop` during the handshake wins: the
    /// new connection is dropped and an error returned.
    pub async fn start(&self, initial: ParameterSnapshot) -> Result<()> {
        if self.is_running() {
            debug!("Session already running");
            return Ok(());
        }
        let stops_before = self.stop_count();

        {
            let mut status = self.status.write();
            let began = if self.handshake_failures.load(Ordering::SeqCst) == 0 {
                status.begin()
            } else {
                status.transition(SessionState::Connecting)
            };
            if !began {
                return Err(SteerError::Connect(format!(
                    "cannot start a session from state {}",
                    status.state
                )));
            }
            status.record_attempt();
        }
        self.emit(SessionEvent::StateChanged(SessionState::Connecting));
        self.snapshots.send_replace(initial);

        let timeout = self.config.reconnect.connect_timeout();
        let connected = tokio::time::timeout(timeout, self.transport.connect()).await;

        // Held until the tasks are registered so a concurrent `stop` either
        // sees them or is seen here
        let stops = self.stops.lock();
        if *stops != stops_before {
            debug!("Stopped while connecting, dropping the connection");
            return Err(SteerError::Connect("session stopped while connecting".into()));
        }

        let connection = match connected {
            Ok(Ok(connection)) => connection,
            Ok(Err(SteerError::Connect(reason))) => return Err(self.handshake_failed(reason)),
            Ok(Err(e)) => return Err(self.handshake_failed(e.to_string())),
            Err(_) => return Err(self.handshake_failed(format!("timed out after {:?}", timeout))),
        };

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        *self.commands.lock() = Some(command_tx);
        self.handshake_failures.store(0, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);

        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.stream.inbound_capacity.max(1));
        let mut supervisor = Supervisor::new(self, inbound_tx);
        supervisor.attach(connection);

        let handle = tokio::spawn(supervisor.run(inbound_rx, command_rx));
        self.tasks.track(&handle);
        drop(stops);

        info!(session = %self.status.read().session_id, "Stream session started");
        Ok(())
    }

    fn handshake_failed(&self, reason: String) -> SteerError {
        self.handshake_failures.fetch_add(1, Ordering::SeqCst);
        {
            let mut status = self.status.write();
            status.set_error(reason.clone());
            status.transition(SessionState::Closed);
        }
        self.emit(SessionEvent::StateChanged(SessionState::Closed));
        warn!("Connect failed: {}", reason);
        SteerError::Connect(reason)
    }

    /// Queue `snapshot` for sending
    ///
    /// Never blocks. Only the newest queued snapshot is sent; snapshots
    /// older than the queued one are ignored.
    pub fn send_update(&self, snapshot: ParameterSnapshot) {
        self.snapshots.send_if_modified(|current| {
            if snapshot.revision <= current.revision {
                return false;
            }
            *current = snapshot;
            true
        });
    }

    /// Fire-and-forget playback command
    ///
    /// Dropped when no connection is open; the play/pause intent is still
    /// remembered and re-applied on the next connection.
    pub fn send_control(&self, control: PlaybackControl) {
        match control {
            PlaybackControl::Play => self.playing.store(true, Ordering::SeqCst),
            PlaybackControl::Pause | PlaybackControl::Stop => self.playing.store(false, Ordering::SeqCst),
            PlaybackControl::ResetContext => {}
        }
        if let Some(commands) = self.commands.lock().as_ref() {
            let _ = commands.send(Command::Control(control));
        }
    }

    /// Queue local audio behind whatever the model has sent
    ///
    /// `samples` must already be in the output format. Returns `false` when
    /// the session is not running; the caller then owns the buffer.
    pub fn inject_audio(&self, samples: Vec<f32>) -> bool {
        if !self.is_running() {
            return false;
        }
        match self.commands.lock().as_ref() {
            Some(commands) => commands.send(Command::Inject(samples)).is_ok(),
            None => false,
        }
    }

    /// Tear down without flushing pending sends; safe to call repeatedly
    pub fn stop(&self) {
        let mut stops = self.stops.lock();
        *stops += 1;
        self.tasks.abort_all();
        *self.commands.lock() = None;
        let was_running = self.running.swap(false, Ordering::SeqCst);

        let changed = {
            let mut status = self.status.write();
            status.state != SessionState::Idle && status.transition(SessionState::Closed)
        };
        if changed {
            self.emit(SessionEvent::StateChanged(SessionState::Closed));
        }
        if was_running {
            info!("Stream session stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && self.status.state().is_active()
    }

    pub fn state(&self) -> SessionState {
        self.status.state()
    }

    /// Newest snapshot handed to `start` or `send_update`
    pub fn latest_snapshot(&self) -> ParameterSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn decode_errors(&self) -> u64 {
        self.counters.decode_errors.load(Ordering::Relaxed)
    }

    /// Full snapshots written to a connection
    pub fn updates_sent(&self) -> u64 {
        self.counters.updates_sent.load(Ordering::Relaxed)
    }

    pub fn last_sent_revision(&self) -> u64 {
        self.counters.last_sent_revision.load(Ordering::Relaxed)
    }

    /// Times `stop` has been called
    pub fn stop_count(&self) -> u64 {
        *self.stops.lock()
    }

    /// Chunks pushed into the ring buffer
    pub fn chunks_received(&self) -> u64 {
        self.counters.chunks_received.load(Ordering::Relaxed)
    }

    /// Successful reconnects since start
    pub fn reconnects(&self) -> u64 {
        self.counters.reconnects.load(Ordering::Relaxed)
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.try_send(event);
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.tasks.abort_all();
    }
}

/// Per-connection tasks; aborted when replaced or dropped
struct LiveConnection {
    controls: mpsc::UnboundedSender<PlaybackControl>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Drop for LiveConnection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Supervisor task state
struct Supervisor {
    transport: Arc<dyn Transport>,
    buffer: AudioRingBuffer,
    status: SharedSessionStatus,
    events: Sender<SessionEvent>,
    counters: Arc<SessionCounters>,
    snapshots: watch::Receiver<ParameterSnapshot>,
    playing: Arc<AtomicBool>,
    tasks: TaskRegistry,
    backoff: Backoff,
    connect_timeout: Duration,
    reorderer: ChunkReorderer<(PcmFormat, Vec<f32>)>,
    resampler: Option<StreamResampler>,
    output: PcmFormat,
    inbound_tx: mpsc::Sender<Tagged>,
    /// Bumped whenever a connection is attached or lost
    epoch: u64,
    live: Option<LiveConnection>,
    /// Ordering key for chunks that carry no sequence number
    arrivals: u64,
    next_sequence: u64,
}

impl Supervisor {
    fn new(session: &StreamSession, inbound_tx: mpsc::Sender<Tagged>) -> Self {
        Self {
            transport: Arc::clone(&session.transport),
            buffer: session.buffer.clone(),
            status: session.status.clone(),
            events: session.events.clone(),
            counters: Arc::clone(&session.counters),
            snapshots: session.snapshots.subscribe(),
            playing: Arc::clone(&session.playing),
            tasks: session.tasks.clone(),
            backoff: Backoff::new(&session.config.reconnect),
            connect_timeout: session.config.reconnect.connect_timeout(),
            reorderer: ChunkReorderer::new(session.config.reorder_window),
            resampler: None,
            output: session.config.output,
            inbound_tx,
            epoch: 0,
            live: None,
            arrivals: 0,
            next_sequence: 0,
        }
    }

    async fn run(
        mut self,
        mut inbound: mpsc::Receiver<Tagged>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        let mut retry_at: Option<Instant> = None;
        let mut attempt: Option<JoinHandle<Result<Connection>>> = None;

        loop {
            tokio::select! {
                Some(tagged) = inbound.recv() => {
                    if let Some(reason) = self.handle(tagged) {
                        retry_at = self.connection_lost(reason);
                    }
                }
                Some(command) = commands.recv() => match command {
                    Command::Control(control) => self.forward_control(control),
                    Command::Inject(samples) => self.buffer.push_samples(&samples),
                },
                _ = wait_until(retry_at), if attempt.is_none() => {
                    retry_at = None;
                    attempt = Some(self.spawn_attempt());
                }
                joined = join_attempt(&mut attempt) => {
                    attempt = None;
                    let result = joined
                        .unwrap_or_else(|e| Err(SteerError::Connect(format!("connect task failed: {}", e))));
                    match result {
                        Ok(_) if self.status.state().is_closed() => {
                            debug!("Session closed while reconnecting, dropping the connection");
                        }
                        Ok(connection) => {
                            self.attach(connection);
                            self.reconnected();
                        }
                        Err(e) => retry_at = self.attempt_failed(e),
                    }
                }
            }

            if self.status.state().is_closed() {
                break;
            }
        }
        debug!("Session supervisor finished");
    }

    /// Start reader and writer tasks for a fresh connection
    fn attach(&mut self, connection: Connection) {
        self.epoch += 1;
        self.reorderer.reset();
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }

        let (controls_tx, controls_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(run_reader(self.epoch, connection.inbound, self.inbound_tx.clone()));
        let writer = tokio::spawn(run_writer(Writer {
            epoch: self.epoch,
            outbound: connection.outbound,
            snapshots: self.snapshots.clone(),
            controls: controls_rx,
            playing: Arc::clone(&self.playing),
            counters: Arc::clone(&self.counters),
            report: self.inbound_tx.clone(),
        }));
        self.tasks.track(&reader);
        self.tasks.track(&writer);

        // Replacing the old connection aborts its tasks
        self.live = Some(LiveConnection {
            controls: controls_tx,
            reader,
            writer,
        });
        debug!(epoch = self.epoch, "Connection attached");
    }

    /// Returns the drop reason when the current connection has gone away
    fn handle(&mut self, tagged: Tagged) -> Option<String> {
        if tagged.epoch != self.epoch {
            debug!(epoch = tagged.epoch, current = self.epoch, "Discarding event from a stale connection");
            return None;
        }
        match tagged.event {
            ConnectionEvent::Dropped(reason) => Some(reason),
            ConnectionEvent::Message(message) => {
                self.handle_message(message);
                None
            }
        }
    }

    fn handle_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::SetupComplete => {
                debug!("Model acknowledged setup");
                self.mark_streaming();
            }
            ServerMessage::AudioChunk {
                data,
                mime_type,
                sequence,
            } => self.handle_audio(&data, &mime_type, sequence),
            ServerMessage::FilteredPrompt { text, reason } => {
                warn!("Prompt {:?} was filtered: {}", text, reason);
                self.emit(SessionEvent::ModelWarning(format!(
                    "Prompt \"{}\" was filtered: {}",
                    text, reason
                )));
            }
            ServerMessage::Warning { message } => {
                warn!("Model warning: {}", message);
                self.emit(SessionEvent::ModelWarning(message));
            }
        }
    }

    fn handle_audio(&mut self, data: &str, mime_type: &str, sequence: Option<u64>) {
        let key = sequence.unwrap_or(self.arrivals);
        self.arrivals += 1;

        let placed = match decode_audio(data, mime_type) {
            Ok(decoded) => {
                self.mark_streaming();
                self.reorderer.accept(key, decoded)
            }
            Err(e) => {
                self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                warn!(sequence = key, "Skipping audio chunk: {}", e);
                // Later chunks must not wait for this one
                self.reorderer.skip(key)
            }
        };

        match placed {
            Reordered::Ready(ready) => {
                for (format, samples) in ready {
                    self.buffer_audio(format, samples);
                }
            }
            Reordered::Held => debug!(sequence = key, "Holding chunk until the gap fills"),
            Reordered::Dropped => debug!(sequence = key, "Dropping stale or duplicate chunk"),
        }
    }

    /// Convert to the output format and push into the ring buffer
    fn buffer_audio(&mut self, format: PcmFormat, samples: Vec<f32>) {
        let samples = if format.channels == self.output.channels {
            samples
        } else {
            remix(&samples, format.channels, self.output.channels)
        };

        let samples = if format.sample_rate == self.output.sample_rate {
            samples
        } else {
            match self.resample(format.sample_rate, &samples) {
                Ok(resampled) => resampled,
                Err(e) => {
                    self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("Skipping audio chunk: {}", e);
                    return;
                }
            }
        };
        if samples.is_empty() {
            // Resampler is still filling its first block
            return;
        }

        let chunk = AudioChunk {
            frames: samples,
            sample_rate: self.output.sample_rate,
            channels: self.output.channels,
            sequence_number: self.next_sequence,
        };
        self.next_sequence += 1;
        self.buffer.push(&chunk);
        self.counters.chunks_received.fetch_add(1, Ordering::Relaxed);
    }

    fn resample(&mut self, input_rate: u32, samples: &[f32]) -> Result<Vec<f32>> {
        let stale = self
            .resampler
            .as_ref()
            .map_or(true, |r| r.input_rate() != input_rate);
        if stale {
            info!(
                "Stream rate {} Hz differs from device rate {} Hz, resampling",
                input_rate, self.output.sample_rate
            );
            self.resampler = Some(StreamResampler::new(
                input_rate,
                self.output.sample_rate,
                self.output.channels,
            )?);
        }
        match self.resampler.as_mut() {
            Some(resampler) => resampler.process(samples),
            None => Ok(Vec::new()),
        }
    }

    fn forward_control(&mut self, control: PlaybackControl) {
        if control == PlaybackControl::ResetContext {
            // Nothing queued or held from the old context may play after it
            self.buffer.clear();
            self.reorderer.reset();
            if let Some(resampler) = self.resampler.as_mut() {
                resampler.reset();
            }
        }
        match &self.live {
            Some(live) => {
                let _ = live.controls.send(control);
            }
            None => debug!("No open connection, dropping {:?}", control),
        }
    }

    fn mark_streaming(&mut self) {
        if self.status.state() == SessionState::Connecting && self.transition(SessionState::Streaming) {
            info!("Streaming");
        }
    }

    /// Returns when to try again, if at all
    fn connection_lost(&mut self, reason: String) -> Option<Instant> {
        warn!("Connection dropped: {}", reason);
        self.live = None;
        // Anything still queued from the dead connection is now stale
        self.epoch += 1;
        self.status.write().set_error(reason);
        self.transition(SessionState::Reconnecting);
        self.schedule_retry()
    }

    fn spawn_attempt(&mut self) -> JoinHandle<Result<Connection>> {
        self.status.write().record_attempt();
        let connect = self.transport.connect();
        let timeout = self.connect_timeout;
        let handle = tokio::spawn(async move {
            match tokio::time::timeout(timeout, connect).await {
                Ok(result) => result,
                Err(_) => Err(SteerError::Connect(format!("timed out after {:?}", timeout))),
            }
        });
        self.tasks.track(&handle);
        handle
    }

    fn attempt_failed(&mut self, e: SteerError) -> Option<Instant> {
        warn!(
            attempt = self.backoff.current_attempt(),
            max = self.backoff.max_attempts(),
            "Reconnect failed: {}",
            e
        );
        self.status.write().set_error(e.to_string());
        self.schedule_retry()
    }

    fn reconnected(&mut self) {
        info!(attempts = self.backoff.current_attempt(), "Reconnected");
        self.backoff.reset();
        self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
        self.transition(SessionState::Streaming);
    }

    fn schedule_retry(&mut self) -> Option<Instant> {
        match self.backoff.next_delay() {
            Some(delay) => {
                debug!(attempt = self.backoff.current_attempt(), ?delay, "Scheduling reconnect");
                Some(Instant::now() + delay)
            }
            None => {
                self.lose_session();
                None
            }
        }
    }

    fn lose_session(&mut self) {
        let last = self.status.last_error().unwrap_or_else(|| "unknown error".into());
        let message = format!(
            "gave up after {} reconnect attempts, last error: {}",
            self.backoff.max_attempts(),
            last
        );
        error!("Session lost: {}", message);
        self.status.write().set_error(message.clone());
        self.transition(SessionState::Closed);
        self.emit(SessionEvent::SessionLost(message));
    }

    fn transition(&mut self, next: SessionState) -> bool {
        let changed = self.status.write().transition(next);
        if changed {
            self.emit(SessionEvent::StateChanged(next));
        }
        changed
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.try_send(event).is_err() {
            debug!("Event channel full, dropping event");
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn join_attempt(
    attempt: &mut Option<JoinHandle<Result<Connection>>>,
) -> std::result::Result<Result<Connection>, JoinError> {
    match attempt {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

/// Forward inbound messages until the connection ends
async fn run_reader(epoch: u64, mut inbound: InboundStream, report: mpsc::Sender<Tagged>) {
    let reason = loop {
        match inbound.next().await {
            Some(Ok(message)) => {
                let event = ConnectionEvent::Message(message);
                if report.send(Tagged { epoch, event }).await.is_err() {
                    return;
                }
            }
            Some(Err(e)) => break e.to_string(),
            None => break "stream ended".to_string(),
        }
    };
    let event = ConnectionEvent::Dropped(reason);
    let _ = report.send(Tagged { epoch, event }).await;
}

struct Writer {
    epoch: u64,
    outbound: mpsc::Sender<ClientMessage>,
    snapshots: watch::Receiver<ParameterSnapshot>,
    controls: mpsc::UnboundedReceiver<PlaybackControl>,
    playing: Arc<AtomicBool>,
    counters: Arc<SessionCounters>,
    report: mpsc::Sender<Tagged>,
}

impl Writer {
    async fn send_snapshot(&self, snapshot: &ParameterSnapshot) -> Result<()> {
        for message in ClientMessage::from_snapshot(snapshot) {
            self.send(message).await?;
        }
        self.counters.updates_sent.fetch_add(1, Ordering::Relaxed);
        self.counters
            .last_sent_revision
            .store(snapshot.revision, Ordering::Relaxed);
        debug!(revision = snapshot.revision, "Sent parameters");
        Ok(())
    }

    async fn send(&self, message: ClientMessage) -> Result<()> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| SteerError::Channel("outbound channel closed".into()))
    }

    /// Send the full state, then keep sending whatever is newest
    async fn run(&mut self) -> Result<()> {
        let snapshot = self.snapshots.borrow_and_update().clone();
        self.send_snapshot(&snapshot).await?;
        let mut last_sent = snapshot.revision;

        if self.playing.load(Ordering::SeqCst) {
            self.send(ClientMessage::control(PlaybackControl::Play)).await?;
        }

        loop {
            tokio::select! {
                changed = self.snapshots.changed() => {
                    if changed.is_err() {
                        // Session is gone
                        return Ok(());
                    }
                    let snapshot = self.snapshots.borrow_and_update().clone();
                    if snapshot.revision <= last_sent {
                        continue;
                    }
                    self.send_snapshot(&snapshot).await?;
                    last_sent = snapshot.revision;
                }
                control = self.controls.recv() => {
                    let Some(control) = control else {
                        return Ok(());
                    };
                    self.send(ClientMessage::control(control)).await?;
                    if control == PlaybackControl::ResetContext {
                        // A fresh context starts without prompts
                        let snapshot = self.snapshots.borrow_and_update().clone();
                        self.send_snapshot(&snapshot).await?;
                        last_sent = snapshot.revision;
                    }
                }
            }
        }
    }
}

async fn run_writer(mut writer: Writer) {
    if let Err(e) = writer.run().await {
        let event = ConnectionEvent::Dropped(e.to_string());
        let _ = writer.report.send(Tagged { epoch: writer.epoch, event }).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{ParameterDelta, ParameterState};
    use crate::stream::protocol::GenerationConfig;
    use crate::stream::transport::{ChannelTransport, ConnectionPeer};
    use crossbeam_channel::{bounded, Receiver};
    use tokio::sync::mpsc::error::TryRecvError;

    struct Fixture {
        session: StreamSession,
        transport: Arc<ChannelTransport>,
        peers: mpsc::UnboundedReceiver<ConnectionPeer>,
        buffer: AudioRingBuffer,
        events: Receiver<SessionEvent>,
    }

    fn fixture(reconnect: ReconnectConfig) -> Fixture {
        let (transport, peers) = ChannelTransport::new(64);
        let transport = Arc::new(transport);
        let buffer = AudioRingBuffer::new(48_000, 2);
        let (events_tx, events) = bounded(256);
        let config = SessionConfig {
            reconnect,
            ..Default::default()
        };
        let session = StreamSession::new(
            transport.clone(),
            buffer.clone(),
            SharedSessionStatus::new(),
            events_tx,
            config,
        );
        Fixture {
            session,
            transport,
            peers,
            buffer,
            events,
        }
    }

    fn no_jitter() -> ReconnectConfig {
        ReconnectConfig {
            jitter: 0.0,
            ..Default::default()
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    /// Drain everything the session has sent so far
    fn drain(peer: &mut ConnectionPeer) -> Vec<ClientMessage> {
        let mut sent = Vec::new();
        loop {
            match peer.outbound.try_recv() {
                Ok(message) => sent.push(message),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return sent,
            }
        }
    }

    fn configs(sent: &[ClientMessage]) -> Vec<GenerationConfig> {
        sent.iter()
            .filter_map(|m| match m {
                ClientMessage::MusicGenerationConfig(config) => Some(config.clone()),
                _ => None,
            })
            .collect()
    }

    fn stereo_chunk(value: f32, frames: usize, sequence: u64) -> ServerMessage {
        ServerMessage::audio(&vec![value; frames * 2], PcmFormat::default(), Some(sequence))
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_sends_full_state_then_play() {
        let mut f = fixture(no_jitter());
        f.session.start(ParameterSnapshot::default()).await.unwrap();
        assert_eq!(f.session.state(), SessionState::Connecting);

        let mut peer = f.peers.recv().await.unwrap();
        settle().await;
        let sent = drain(&mut peer);
        assert!(matches!(sent[0], ClientMessage::WeightedPrompts { .. }));
        assert!(matches!(sent[1], ClientMessage::MusicGenerationConfig(_)));
        assert_eq!(sent[2], ClientMessage::control(PlaybackControl::Play));
        assert_eq!(f.session.updates_sent(), 1);

        assert!(peer.send(ServerMessage::SetupComplete).await);
        settle().await;
        assert_eq!(f.session.state(), SessionState::Streaming);
        assert!(f.events.try_iter().any(|e| e == SessionEvent::StateChanged(SessionState::Streaming)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_updates_coalesce_to_latest() {
        let mut f = fixture(no_jitter());
        let mut params = ParameterState::new();
        f.session.start(params.snapshot()).await.unwrap();
        let mut peer = f.peers.recv().await.unwrap();
        settle().await;
        drain(&mut peer);

        for i in 0..10 {
            let snapshot = params.apply(ParameterDelta::new().with_bpm(100 + i)).unwrap();
            f.session.send_update(snapshot);
        }
        settle().await;

        let sent = configs(&drain(&mut peer));
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].bpm, 109);
        assert_eq!(f.session.last_sent_revision(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_older_snapshot_is_ignored() {
        let f = fixture(no_jitter());
        let mut params = ParameterState::new();
        let first = params.apply(ParameterDelta::new().with_bpm(90)).unwrap();
        let second = params.apply(ParameterDelta::new().with_bpm(95)).unwrap();

        f.session.send_update(second);
        f.session.send_update(first);
        assert_eq!(f.session.latest_snapshot().bpm, 95);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_order_chunks_are_buffered_in_order() {
        let mut f = fixture(no_jitter());
        f.session.start(ParameterSnapshot::default()).await.unwrap();
        let peer = f.peers.recv().await.unwrap();

        peer.send(stereo_chunk(0.1, 10, 1)).await;
        peer.send(stereo_chunk(0.3, 10, 3)).await;
        peer.send(stereo_chunk(0.2, 10, 2)).await;
        settle().await;

        assert_eq!(f.session.chunks_received(), 3);
        let pulled = f.buffer.pull(30);
        let firsts: Vec<f32> = pulled.chunks(20).map(|c| (c[0] * 10.0).round() / 10.0).collect();
        assert_eq!(firsts, vec![0.1, 0.2, 0.3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_decode_errors_are_skipped() {
        let mut f = fixture(no_jitter());
        f.session.start(ParameterSnapshot::default()).await.unwrap();
        let peer = f.peers.recv().await.unwrap();

        peer.send(ServerMessage::AudioChunk {
            data: "%%%".into(),
            mime_type: PcmFormat::default().mime_type(),
            sequence: None,
        })
        .await;
        peer.send(ServerMessage::audio(&vec![0.5; 20], PcmFormat::default(), None)).await;
        settle().await;

        assert_eq!(f.session.decode_errors(), 1);
        assert_eq!(f.session.chunks_received(), 1);
        assert_eq!(f.buffer.fill_level(), 10);
    }

    fn corrupt_chunk(sequence: Option<u64>) -> ServerMessage {
        ServerMessage::AudioChunk {
            data: "%%%".into(),
            mime_type: PcmFormat::default().mime_type(),
            sequence,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupt_chunk_does_not_stall_later_chunks() {
        for numbered in [false, true] {
            let mut f = fixture(no_jitter());
            f.session.start(ParameterSnapshot::default()).await.unwrap();
            let peer = f.peers.recv().await.unwrap();
            let sequence = |n: u64| numbered.then_some(n);

            peer.send(ServerMessage::audio(&vec![0.5; 20], PcmFormat::default(), sequence(0)))
                .await;
            peer.send(corrupt_chunk(sequence(1))).await;
            for n in 2..7 {
                peer.send(ServerMessage::audio(&vec![0.5; 20], PcmFormat::default(), sequence(n)))
                    .await;
            }
            settle().await;

            assert_eq!(f.session.decode_errors(), 1, "numbered: {}", numbered);
            assert_eq!(f.session.chunks_received(), 6, "numbered: {}", numbered);
            assert_eq!(f.buffer.fill_level(), 60, "numbered: {}", numbered);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_context_discards_held_chunks() {
        let mut f = fixture(no_jitter());
        f.session.start(ParameterSnapshot::default()).await.unwrap();
        let peer = f.peers.recv().await.unwrap();

        peer.send(stereo_chunk(0.1, 10, 0)).await;
        peer.send(stereo_chunk(0.3, 10, 2)).await;
        settle().await;
        assert_eq!(f.buffer.fill_level(), 10);

        f.session.send_control(PlaybackControl::ResetContext);
        settle().await;
        assert_eq!(f.buffer.fill_level(), 0);

        // Sequence 2 was waiting on 1 before the reset and must not play now
        peer.send(stereo_chunk(0.2, 10, 1)).await;
        settle().await;
        assert_eq!(f.buffer.fill_level(), 10);
        let pulled = f.buffer.pull(10);
        assert!(pulled.iter().all(|s| (s - 0.2).abs() < 1e-3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_injected_audio_goes_through_the_session() {
        let mut f = fixture(no_jitter());
        assert!(!f.session.inject_audio(vec![0.25; 8]));
        assert!(f.buffer.is_empty());

        f.session.start(ParameterSnapshot::default()).await.unwrap();
        let _peer = f.peers.recv().await.unwrap();
        assert!(f.session.inject_audio(vec![0.25; 8]));
        settle().await;
        assert_eq!(f.buffer.fill_level(), 4);

        f.session.stop();
        assert!(!f.session.inject_audio(vec![0.25; 8]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_resends_latest_snapshot_once() {
        let mut f = fixture(no_jitter());
        let mut params = ParameterState::new();
        f.session.start(params.snapshot()).await.unwrap();
        let mut peer = f.peers.recv().await.unwrap();
        peer.send(ServerMessage::SetupComplete).await;
        settle().await;
        drain(&mut peer);

        let latest = params.apply(ParameterDelta::new().with_density(0.9)).unwrap();
        f.session.send_update(latest);
        settle().await;
        drain(&mut peer);

        drop(peer);
        settle().await;
        assert_eq!(f.session.state(), SessionState::Reconnecting);
        // First attempt at 500 ms is refused, the second at 1.5 s succeeds
        f.transport.refuse_next(1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let mut peer = f.peers.recv().await.unwrap();
        settle().await;
        assert_eq!(f.session.state(), SessionState::Streaming);

        let sent = configs(&drain(&mut peer));
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].density, 0.9);
        assert_eq!(f.session.reconnects(), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(configs(&drain(&mut peer)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_drops_each_resend_latest_snapshot() {
        let mut f = fixture(no_jitter());
        let mut params = ParameterState::new();
        f.session.start(params.snapshot()).await.unwrap();
        let mut peer = f.peers.recv().await.unwrap();
        peer.send(ServerMessage::SetupComplete).await;
        settle().await;
        drain(&mut peer);

        for i in 0..3u64 {
            drop(peer);
            settle().await;
            assert_eq!(f.session.state(), SessionState::Reconnecting);

            let density = 0.2 + 0.2 * i as f32;
            let latest = params.apply(ParameterDelta::new().with_density(density)).unwrap();
            f.session.send_update(latest.clone());

            // Backoff starts over after every successful reconnect
            tokio::time::sleep(Duration::from_secs(1)).await;
            peer = f.peers.recv().await.unwrap();
            settle().await;
            assert_eq!(f.session.state(), SessionState::Streaming);

            let sent = configs(&drain(&mut peer));
            assert_eq!(sent.len(), 1, "drop {}", i);
            assert_eq!(sent[0].density, density);
            assert_eq!(f.session.last_sent_revision(), latest.revision);
            assert_eq!(f.session.reconnects(), i + 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_lost_after_max_attempts() {
        let mut f = fixture(ReconnectConfig {
            max_attempts: 2,
            ..no_jitter()
        });
        f.session.start(ParameterSnapshot::default()).await.unwrap();
        let peer = f.peers.recv().await.unwrap();
        f.transport.refuse_next(10);
        drop(peer);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(f.session.state(), SessionState::Closed);
        assert!(f
            .events
            .try_iter()
            .any(|e| matches!(e, SessionEvent::SessionLost(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_failure_closes() {
        let f = fixture(no_jitter());
        f.transport.refuse_next(1);

        let result = f.session.start(ParameterSnapshot::default()).await;
        assert!(matches!(result, Err(SteerError::Connect(_))));
        assert_eq!(f.session.state(), SessionState::Closed);
        assert!(f.session.status.last_error().is_some());

        // A retry keeps the session id and counts the attempt
        let id = f.session.status.read().session_id;
        f.session.start(ParameterSnapshot::default()).await.unwrap();
        assert_eq!(f.session.status.read().session_id, id);
        assert_eq!(f.session.status.connection_attempt_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_drops_connection() {
        let mut f = fixture(no_jitter());
        f.session.stop();
        assert_eq!(f.session.state(), SessionState::Idle);

        f.session.start(ParameterSnapshot::default()).await.unwrap();
        let mut peer = f.peers.recv().await.unwrap();
        settle().await;
        drain(&mut peer);

        f.session.stop();
        f.session.stop();
        assert_eq!(f.session.state(), SessionState::Closed);
        assert!(!f.session.is_running());

        settle().await;
        assert!(peer.outbound.recv().await.is_none());
    }

    /// Holds every connect until the gate opens
    struct GatedTransport {
        gate: Arc<tokio::sync::Notify>,
        peer: Arc<Mutex<Option<ConnectionPeer>>>,
    }

    impl Transport for GatedTransport {
        fn connect(&self) -> futures::future::BoxFuture<'static, Result<Connection>> {
            let gate = self.gate.clone();
            let peer = self.peer.clone();
            Box::pin(async move {
                gate.notified().await;
                let (connection, far_end) = crate::stream::transport::in_memory(16);
                *peer.lock() = Some(far_end);
                Ok(connection)
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_connect_discards_connection() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let far_end = Arc::new(Mutex::new(None));
        let transport = GatedTransport {
            gate: gate.clone(),
            peer: far_end.clone(),
        };
        let (events_tx, _events) = bounded(64);
        let session = Arc::new(StreamSession::new(
            Arc::new(transport),
            AudioRingBuffer::new(4_800, 2),
            SharedSessionStatus::new(),
            events_tx,
            SessionConfig::default(),
        ));

        let starting = tokio::spawn({
            let session = session.clone();
            async move { session.start(ParameterSnapshot::default()).await }
        });
        settle().await;
        assert_eq!(session.state(), SessionState::Connecting);

        session.stop();
        assert_eq!(session.state(), SessionState::Closed);

        gate.notify_one();
        let result = starting.await.unwrap();
        assert!(matches!(result, Err(SteerError::Connect(_))));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.is_running());

        settle().await;
        let mut peer = far_end.lock().take().expect("connect completed");
        assert_eq!(peer.outbound.try_recv(), Err(TryRecvError::Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_context_reasserts_snapshot() {
        let mut f = fixture(no_jitter());
        f.session.start(ParameterSnapshot::default()).await.unwrap();
        let mut peer = f.peers.recv().await.unwrap();
        settle().await;
        drain(&mut peer);

        f.session.send_control(PlaybackControl::ResetContext);
        settle().await;
        let sent = drain(&mut peer);
        assert_eq!(sent[0], ClientMessage::control(PlaybackControl::ResetContext));
        assert_eq!(configs(&sent).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resamples_to_device_rate() {
        let mut f = fixture(no_jitter());
        f.session.start(ParameterSnapshot::default()).await.unwrap();
        let peer = f.peers.recv().await.unwrap();

        let format = PcmFormat {
            sample_rate: 24_000,
            channels: 1,
        };
        peer.send(ServerMessage::audio(&vec![0.1; 4_800], format, Some(0))).await;
        settle().await;

        assert_eq!(f.session.decode_errors(), 0);
        assert!(f.buffer.fill_level() > 8_000, "fill {}", f.buffer.fill_level());
    }

    #[test]
    fn test_stale_epoch_is_discarded() {
        let f = fixture(no_jitter());
        let (tx, _rx) = mpsc::channel(4);
        let mut supervisor = Supervisor::new(&f.session, tx);
        supervisor.epoch = 2;

        let stale = Tagged {
            epoch: 1,
            event: ConnectionEvent::Message(stereo_chunk(0.5, 10, 0)),
        };
        assert!(supervisor.handle(stale).is_none());
        assert!(f.buffer.is_empty());

        let stale_drop = Tagged {
            epoch: 1,
            event: ConnectionEvent::Dropped("old".into()),
        };
        assert!(supervisor.handle(stale_drop).is_none());

        let current = Tagged {
            epoch: 2,
            event: ConnectionEvent::Message(stereo_chunk(0.5, 10, 0)),
        };
        assert!(supervisor.handle(current).is_none());
        assert_eq!(f.buffer.fill_level(), 10);
    }
}
