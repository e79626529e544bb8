//! Latest desired steering parameters
//!
//! `ParameterState` is plain data plus validation. It is only ever mutated by
//! the controller; every other component sees immutable snapshots.

use super::types::{GenerationMode, Scale, WeightedPrompt};
use crate::error::ValidationError;
use serde::{Deserialize, Serialize};

pub const BPM_MIN: u16 = 60;
pub const BPM_MAX: u16 = 200;
pub const GUIDANCE_MIN: f32 = 0.0;
pub const GUIDANCE_MAX: f32 = 6.0;

/// Immutable copy of every parameter, safe to hand across threads
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterSnapshot {
    /// Incremented on every accepted mutation
    pub revision: u64,
    pub prompts: Vec<WeightedPrompt>,
    pub bpm: u16,
    pub density: f32,
    pub brightness: f32,
    pub scale: Scale,
    pub guidance: f32,
    pub mute_bass: bool,
    pub mute_drums: bool,
    pub only_bass_and_drums: bool,
    pub mode: GenerationMode,
}

impl Default for ParameterSnapshot {
    fn default() -> Self {
        Self {
            revision: 0,
            prompts: vec![WeightedPrompt::new("Chill Lo-Fi beats", 1.0)],
            bpm: 120,
            density: 0.5,
            brightness: 0.5,
            scale: Scale::CMajorAMinor,
            guidance: 4.0,
            mute_bass: false,
            mute_drums: false,
            only_bass_and_drums: false,
            mode: GenerationMode::Quality,
        }
    }
}

/// A partial update; only the fields that are `Some` get merged
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParameterDelta {
    pub prompts: Option<Vec<WeightedPrompt>>,
    pub bpm: Option<u16>,
    pub density: Option<f32>,
    pub brightness: Option<f32>,
    pub scale: Option<Scale>,
    pub guidance: Option<f32>,
    pub mute_bass: Option<bool>,
    pub mute_drums: Option<bool>,
    pub only_bass_and_drums: Option<bool>,
    pub mode: Option<GenerationMode>,
}

impl ParameterDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prompts(mut self, prompts: Vec<WeightedPrompt>) -> Self {
        self.prompts = Some(prompts);
        self
    }

    pub fn with_bpm(mut self, bpm: u16) -> Self {
        self.bpm = Some(bpm);
        self
    }

    pub fn with_density(mut self, density: f32) -> Self {
        self.density = Some(density);
        self
    }

    pub fn with_brightness(mut self, brightness: f32) -> Self {
        self.brightness = Some(brightness);
        self
    }

    pub fn with_scale(mut self, scale: Scale) -> Self {
        self.scale = Some(scale);
        self
    }

    pub fn with_guidance(mut self, guidance: f32) -> Self {
        self.guidance = Some(guidance);
        self
    }

    pub fn with_mute_bass(mut self, mute: bool) -> Self {
        self.mute_bass = Some(mute);
        self
    }

    pub fn with_mute_drums(mut self, mute: bool) -> Self {
        self.mute_drums = Some(mute);
        self
    }

    pub fn with_only_bass_and_drums(mut self, only: bool) -> Self {
        self.only_bass_and_drums = Some(only);
        self
    }

    pub fn with_mode(mut self, mode: GenerationMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Check every present field against its domain
    ///
    /// Returns the first violation found. Nothing is clamped.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(bpm) = self.bpm {
            if !(BPM_MIN..=BPM_MAX).contains(&bpm) {
                return Err(ValidationError::BpmOutOfRange {
                    value: bpm,
                    min: BPM_MIN,
                    max: BPM_MAX,
                });
            }
        }
        if let Some(density) = self.density {
            check_range("density", density, 0.0, 1.0)?;
        }
        if let Some(brightness) = self.brightness {
            check_range("brightness", brightness, 0.0, 1.0)?;
        }
        if let Some(guidance) = self.guidance {
            check_range("guidance", guidance, GUIDANCE_MIN, GUIDANCE_MAX)?;
        }
        if let Some(prompts) = &self.prompts {
            for (index, prompt) in prompts.iter().enumerate() {
                if prompt.text.trim().is_empty() {
                    return Err(ValidationError::EmptyPrompt { index });
                }
                if !prompt.weight.is_finite() || !(0.0..=1.0).contains(&prompt.weight) {
                    return Err(ValidationError::PromptWeight {
                        index,
                        weight: prompt.weight,
                    });
                }
            }
        }
        Ok(())
    }
}

fn check_range(field: &'static str, value: f32, min: f32, max: f32) -> Result<(), ValidationError> {
    if !value.is_finite() {
        return Err(ValidationError::NotFinite { field });
    }
    if value < min || value > max {
        return Err(ValidationError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}

/// The single live set of steering parameters for a session
#[derive(Clone, Debug, Default)]
pub struct ParameterState {
    current: ParameterSnapshot,
}

impl ParameterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from explicit values; the revision is reset to zero
    pub fn with_initial(mut initial: ParameterSnapshot) -> Self {
        initial.revision = 0;
        Self { current: initial }
    }

    /// Validate and merge a delta
    ///
    /// On success the revision goes up by exactly one and the new snapshot is
    /// returned. On failure nothing changes.
    pub fn apply(&mut self, delta: ParameterDelta) -> Result<ParameterSnapshot, ValidationError> {
        delta.validate()?;

        let current = &mut self.current;
        if let Some(prompts) = delta.prompts {
            current.prompts = prompts;
        }
        if let Some(bpm) = delta.bpm {
            current.bpm = bpm;
        }
        if let Some(density) = delta.density {
            current.density = density;
        }
        if let Some(brightness) = delta.brightness {
            current.brightness = brightness;
        }
        if let Some(scale) = delta.scale {
            current.scale = scale;
        }
        if let Some(guidance) = delta.guidance {
            current.guidance = guidance;
        }
        if let Some(mute_bass) = delta.mute_bass {
            current.mute_bass = mute_bass;
        }
        if let Some(mute_drums) = delta.mute_drums {
            current.mute_drums = mute_drums;
        }
        if let Some(only) = delta.only_bass_and_drums {
            current.only_bass_and_drums = only;
        }
        if let Some(mode) = delta.mode {
            current.mode = mode;
        }
        current.revision += 1;

        Ok(current.clone())
    }

    pub fn snapshot(&self) -> ParameterSnapshot {
        self.current.clone()
    }

    pub fn revision(&self) -> u64 {
        self.current.revision
    }
}
