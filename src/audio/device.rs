//! Output devices driven by a pull callback
//!
//! A device asks for audio by calling the render callback with an interleaved
//! buffer to fill. Dropping the returned guard closes the device.

use crate::config::PlaybackConfig;
use crate::error::{Result, SteerError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Called on the device's cadence with a buffer to fill completely
pub type RenderCallback = Box<dyn FnMut(&mut [f32]) + Send + 'static>;

/// Format requested from a device
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Frames per callback
    pub buffer_frames: u32,
}

impl DeviceConfig {
    /// Samples in one callback buffer
    pub fn buffer_samples(&self) -> usize {
        self.buffer_frames as usize * usize::from(self.channels)
    }

    pub fn callback_period(&self) -> Duration {
        let nanos = u64::from(self.buffer_frames) * 1_000_000_000;
        Duration::from_nanos(nanos / u64::from(self.sample_rate.max(1)))
    }
}

impl From<&PlaybackConfig> for DeviceConfig {
    fn from(config: &PlaybackConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            channels: config.channels,
            buffer_frames: config.buffer_frames,
        }
    }
}

/// Keeps an open device alive; dropping it closes the device
pub trait DeviceGuard {
    /// Format the device actually opened with
    fn config(&self) -> DeviceConfig;
}

/// Something that can play audio through a pull callback
///
/// `open` is called on the thread that will own the guard, so the guard does
/// not need to be `Send`.
pub trait OutputDevice: Send + Sync {
    fn name(&self) -> String;

    fn open(&self, config: &DeviceConfig, callback: RenderCallback) -> Result<Box<dyn DeviceGuard>>;
}

/// Software clock standing in for a sound card
///
/// Calls the render callback every `buffer_frames / sample_rate` and throws
/// the rendered audio away. Used when no output hardware is available.
#[derive(Clone, Debug, Default)]
pub struct HeadlessDevice;

impl HeadlessDevice {
    pub fn new() -> Self {
        Self
    }
}

struct HeadlessGuard {
    config: DeviceConfig,
    running: Arc<AtomicBool>,
    clock: Option<JoinHandle<()>>,
}

impl DeviceGuard for HeadlessGuard {
    fn config(&self) -> DeviceConfig {
        self.config
    }
}

impl Drop for HeadlessGuard {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(clock) = self.clock.take() {
            if clock.join().is_err() {
                warn!("Headless clock thread panicked");
            }
        }
        debug!("Headless output closed");
    }
}

impl OutputDevice for HeadlessDevice {
    fn name(&self) -> String {
        "headless".to_string()
    }

    fn open(&self, config: &DeviceConfig, mut callback: RenderCallback) -> Result<Box<dyn DeviceGuard>> {
        if config.sample_rate == 0 || config.channels == 0 || config.buffer_frames == 0 {
            return Err(SteerError::AudioDevice(format!(
                "Unusable headless config: {:?}",
                config
            )));
        }

        let running = Arc::new(AtomicBool::new(true));
        let running_clone = Arc::clone(&running);
        let period = config.callback_period();
        let mut scratch = vec![0.0f32; config.buffer_samples()];

        let clock = std::thread::Builder::new()
            .name("headless-clock".into())
            .spawn(move || {
                let mut deadline = Instant::now();
                while running_clone.load(Ordering::SeqCst) {
                    callback(&mut scratch);
                    deadline += period;
                    let now = Instant::now();
                    if deadline > now {
                        std::thread::sleep(deadline - now);
                    } else {
                        // Fell behind; don't try to catch up in a burst
                        deadline = now;
                    }
                }
            })
            .map_err(|e| SteerError::AudioDevice(format!("Failed to start headless clock: {}", e)))?;

        info!(
            "Headless output opened: {} Hz, {} channels, {} frames per callback",
            config.sample_rate, config.channels, config.buffer_frames
        );

        Ok(Box::new(HeadlessGuard {
            config: *config,
            running,
            clock: Some(clock),
        }))
    }
}

#[cfg(feature = "audio-io")]
pub use self::hardware::{list_output_devices, CpalDevice};

#[cfg(feature = "audio-io")]
mod hardware {
    use super::{DeviceConfig, DeviceGuard, OutputDevice, RenderCallback};
    use crate::error::{Result, SteerError};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{BufferSize, SampleRate, Stream, StreamConfig, SupportedBufferSize};
    use tracing::{error, info, warn};

    /// Names of the output devices on the default host
    pub fn list_output_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| SteerError::AudioDevice(format!("Failed to enumerate devices: {}", e)))?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }

    /// Sound card output through cpal
    #[derive(Clone, Debug, Default)]
    pub struct CpalDevice {
        /// Device to open; the host default when `None`
        device_name: Option<String>,
    }

    impl CpalDevice {
        /// Use the default output device
        pub fn new() -> Self {
            Self::default()
        }

        /// Use the output device with this name
        pub fn with_name(name: impl Into<String>) -> Self {
            Self {
                device_name: Some(name.into()),
            }
        }

        fn find_device(&self) -> Result<cpal::Device> {
            let host = cpal::default_host();
            match &self.device_name {
                None => host
                    .default_output_device()
                    .ok_or_else(|| SteerError::AudioDevice("No output device available".into())),
                Some(wanted) => host
                    .output_devices()
                    .map_err(|e| SteerError::AudioDevice(format!("Failed to enumerate devices: {}", e)))?
                    .find(|d| d.name().map(|n| &n == wanted).unwrap_or(false))
                    .ok_or_else(|| SteerError::AudioDevice(format!("Output device {:?} not found", wanted))),
            }
        }
    }

    /// Fixed buffer size when the device accepts it, otherwise its default
    fn choose_buffer_size(device: &cpal::Device, config: &DeviceConfig) -> BufferSize {
        let supported = match device.supported_output_configs() {
            Ok(configs) => configs
                .filter(|c| c.channels() == config.channels)
                .filter(|c| c.sample_format() == cpal::SampleFormat::F32)
                .filter(|c| {
                    c.min_sample_rate().0 <= config.sample_rate && config.sample_rate <= c.max_sample_rate().0
                })
                .any(|c| match c.buffer_size() {
                    SupportedBufferSize::Range { min, max } => {
                        *min <= config.buffer_frames && config.buffer_frames <= *max
                    }
                    SupportedBufferSize::Unknown => false,
                }),
            Err(_) => false,
        };

        if supported {
            BufferSize::Fixed(config.buffer_frames)
        } else {
            warn!(
                "Device does not accept a {} frame buffer, using its default",
                config.buffer_frames
            );
            BufferSize::Default
        }
    }

    struct CpalGuard {
        config: DeviceConfig,
        _stream: Stream,
    }

    impl DeviceGuard for CpalGuard {
        fn config(&self) -> DeviceConfig {
            self.config
        }
    }

    impl Drop for CpalGuard {
        fn drop(&mut self) {
            info!("Closed audio output");
        }
    }

    impl OutputDevice for CpalDevice {
        fn name(&self) -> String {
            self.device_name.clone().unwrap_or_else(|| "default".to_string())
        }

        fn open(&self, config: &DeviceConfig, mut callback: RenderCallback) -> Result<Box<dyn DeviceGuard>> {
            let device = self.find_device()?;
            info!(
                "Using output device: {}",
                device.name().unwrap_or_else(|_| "Unknown".to_string())
            );

            let stream_config = StreamConfig {
                channels: config.channels,
                sample_rate: SampleRate(config.sample_rate),
                buffer_size: choose_buffer_size(&device, config),
            };

            let err_fn = |err| {
                error!("Audio output stream error: {}", err);
            };

            let stream = device
                .build_output_stream(
                    &stream_config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| callback(data),
                    err_fn,
                    None,
                )
                .map_err(|e| SteerError::AudioDevice(format!("Failed to build output stream: {}", e)))?;

            stream
                .play()
                .map_err(|e| SteerError::AudioDevice(format!("Failed to start output stream: {}", e)))?;

            info!(
                "Started audio output: {} Hz, {} channels",
                config.sample_rate, config.channels
            );

            Ok(Box::new(CpalGuard {
                config: *config,
                _stream: stream,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_device_config_from_playback() {
        let config = DeviceConfig::from(&PlaybackConfig::default());
        assert_eq!(config.buffer_samples(), 960 * 2);
        assert_eq!(config.callback_period(), Duration::from_millis(20));
    }

    #[test]
    fn test_headless_calls_back_until_dropped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let config = DeviceConfig {
            sample_rate: 48_000,
            channels: 2,
            buffer_frames: 48,
        };

        let guard = HeadlessDevice::new()
            .open(
                &config,
                Box::new(move |out: &mut [f32]| {
                    assert_eq!(out.len(), 96);
                    calls_clone.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        assert_eq!(guard.config(), config);

        std::thread::sleep(Duration::from_millis(50));
        drop(guard);
        let after_close = calls.load(Ordering::SeqCst);
        assert!(after_close > 0);

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(calls.load(Ordering::SeqCst), after_close);
    }

    #[test]
    fn test_headless_rejects_empty_config() {
        let config = DeviceConfig {
            sample_rate: 48_000,
            channels: 0,
            buffer_frames: 48,
        };
        let result = HeadlessDevice::new().open(&config, Box::new(|_: &mut [f32]| {}));
        assert!(matches!(result, Err(SteerError::AudioDevice(_))));
    }

    #[cfg(feature = "audio-io")]
    #[test]
    fn test_cpal_device_open() {
        // Might fail in CI environments without audio devices
        let config = DeviceConfig::from(&PlaybackConfig::default());
        if let Ok(guard) = CpalDevice::new().open(&config, Box::new(|out: &mut [f32]| out.fill(0.0))) {
            assert_eq!(guard.config().channels, 2);
        }
    }
}
