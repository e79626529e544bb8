pub mod buffer;
pub mod chunk;
pub mod device;
pub mod playback;
pub mod resampler;
pub mod tone;

pub use buffer::{AudioRingBuffer, BufferStats};
pub use chunk::{AudioChunk, ChunkReorderer, PcmFormat};
#[cfg(feature = "audio-io")]
pub use device::{list_output_devices, CpalDevice};
pub use device::{DeviceConfig, DeviceGuard, HeadlessDevice, OutputDevice, RenderCallback};
pub use playback::{PlaybackDriver, Renderer};
pub use resampler::StreamResampler;
