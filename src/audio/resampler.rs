use crate::error::{Result, SteerError};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use tracing::debug;

/// Frames per resampler call; ~10 ms at 48 kHz
const CHUNK_FRAMES: usize = 480;

/// Converts the model's stream rate to the output device rate
///
/// Input is fed chunk by chunk as it arrives. Frames that do not fill a whole
/// resampler block are carried over to the next call so chunk boundaries stay
/// seamless.
pub struct StreamResampler {
    resampler: SincFixedIn<f32>,
    input_rate: u32,
    output_rate: u32,
    channels: usize,
    /// Planar carry-over waiting for the next block
    pending: Vec<Vec<f32>>,
}

impl StreamResampler {
    /// Create a new resampler
    ///
    /// # Arguments
    /// * `input_rate` - Rate of the incoming stream
    /// * `output_rate` - Rate of the output device
    /// * `channels` - Number of interleaved channels
    pub fn new(input_rate: u32, output_rate: u32, channels: u16) -> Result<Self> {
        if input_rate == 0 || output_rate == 0 {
            return Err(SteerError::Config("Sample rates must be greater than 0".into()));
        }
        if channels == 0 {
            return Err(SteerError::Config(
                "Number of channels must be greater than 0".into(),
            ));
        }

        let params = SincInterpolationParameters {
            sinc_len: 128,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 128,
            window: WindowFunction::BlackmanHarris2,
        };

        let resampler = SincFixedIn::<f32>::new(
            output_rate as f64 / input_rate as f64,
            1.0,
            params,
            CHUNK_FRAMES,
            channels as usize,
        )
        .map_err(|e| SteerError::Config(format!("Failed to create resampler: {}", e)))?;

        debug!(
            "Created stream resampler: {} Hz -> {} Hz, {} channels",
            input_rate, output_rate, channels
        );

        Ok(Self {
            resampler,
            input_rate,
            output_rate,
            channels: channels as usize,
            pending: vec![Vec::with_capacity(CHUNK_FRAMES * 2); channels as usize],
        })
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// Resample interleaved samples
    ///
    /// Returns whatever whole blocks could be produced; may be empty while
    /// the first block is still filling.
    pub fn process(&mut self, interleaved: &[f32]) -> Result<Vec<f32>> {
        for frame in interleaved.chunks_exact(self.channels) {
            for (ch, &sample) in frame.iter().enumerate() {
                self.pending[ch].push(sample);
            }
        }

        let mut output = Vec::new();
        while self.pending[0].len() >= self.resampler.input_frames_next() {
            let needed = self.resampler.input_frames_next();
            let block: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|channel| channel.drain(..needed).collect())
                .collect();

            let planar = self
                .resampler
                .process(&block, None)
                .map_err(|e| SteerError::Decode(format!("Resampling failed: {}", e)))?;

            let frames = planar.first().map(Vec::len).unwrap_or(0);
            output.reserve(frames * self.channels);
            for i in 0..frames {
                for channel in &planar {
                    output.push(channel[i]);
                }
            }
        }

        Ok(output)
    }

    /// Drop carried-over input, e.g. after a context reset
    pub fn reset(&mut self) {
        for channel in &mut self.pending {
            channel.clear();
        }
        self.resampler.reset();
    }
}
