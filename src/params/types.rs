use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A text prompt and how strongly it steers generation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WeightedPrompt {
    pub text: String,
    pub weight: f32,
}

impl WeightedPrompt {
    pub fn new(text: impl Into<String>, weight: f32) -> Self {
        Self {
            text: text.into(),
            weight,
        }
    }
}

/// Musical scale the model should stay in
///
/// Each variant names a major key and its relative minor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Scale {
    #[default]
    CMajorAMinor,
    DFlatMajorBFlatMinor,
    DMajorBMinor,
    EFlatMajorCMinor,
    EMajorDFlatMinor,
    FMajorDMinor,
    GFlatMajorEFlatMinor,
    GMajorEMinor,
    AFlatMajorFMinor,
    AMajorGFlatMinor,
    BFlatMajorGMinor,
    BMajorAFlatMinor,
    /// Let the model pick
    ScaleUnspecified,
}

impl Scale {
    pub const ALL: [Scale; 13] = [
        Scale::CMajorAMinor,
        Scale::DFlatMajorBFlatMinor,
        Scale::DMajorBMinor,
        Scale::EFlatMajorCMinor,
        Scale::EMajorDFlatMinor,
        Scale::FMajorDMinor,
        Scale::GFlatMajorEFlatMinor,
        Scale::GMajorEMinor,
        Scale::AFlatMajorFMinor,
        Scale::AMajorGFlatMinor,
        Scale::BFlatMajorGMinor,
        Scale::BMajorAFlatMinor,
        Scale::ScaleUnspecified,
    ];

    /// Wire name, e.g. `C_MAJOR_A_MINOR`
    pub fn as_str(&self) -> &'static str {
        match self {
            Scale::CMajorAMinor => "C_MAJOR_A_MINOR",
            Scale::DFlatMajorBFlatMinor => "D_FLAT_MAJOR_B_FLAT_MINOR",
            Scale::DMajorBMinor => "D_MAJOR_B_MINOR",
            Scale::EFlatMajorCMinor => "E_FLAT_MAJOR_C_MINOR",
            Scale::EMajorDFlatMinor => "E_MAJOR_D_FLAT_MINOR",
            Scale::FMajorDMinor => "F_MAJOR_D_MINOR",
            Scale::GFlatMajorEFlatMinor => "G_FLAT_MAJOR_E_FLAT_MINOR",
            Scale::GMajorEMinor => "G_MAJOR_E_MINOR",
            Scale::AFlatMajorFMinor => "A_FLAT_MAJOR_F_MINOR",
            Scale::AMajorGFlatMinor => "A_MAJOR_G_FLAT_MINOR",
            Scale::BFlatMajorGMinor => "B_FLAT_MAJOR_G_MINOR",
            Scale::BMajorAFlatMinor => "B_MAJOR_A_FLAT_MINOR",
            Scale::ScaleUnspecified => "SCALE_UNSPECIFIED",
        }
    }

    /// Frequency of the major tonic in the octave above middle C
    pub fn tonic_hz(&self) -> f32 {
        let semitones = match self {
            Scale::CMajorAMinor | Scale::ScaleUnspecified => 0,
            Scale::DFlatMajorBFlatMinor => 1,
            Scale::DMajorBMinor => 2,
            Scale::EFlatMajorCMinor => 3,
            Scale::EMajorDFlatMinor => 4,
            Scale::FMajorDMinor => 5,
            Scale::GFlatMajorEFlatMinor => 6,
            Scale::GMajorEMinor => 7,
            Scale::AFlatMajorFMinor => 8,
            Scale::AMajorGFlatMinor => 9,
            Scale::BFlatMajorGMinor => 10,
            Scale::BMajorAFlatMinor => 11,
        };
        261.63 * 2f32.powf(semitones as f32 / 12.0)
    }
}

impl fmt::Display for Scale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scale {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase();
        Scale::ALL
            .iter()
            .copied()
            .find(|scale| scale.as_str() == wanted)
            .ok_or_else(|| ValidationError::UnknownScale(s.to_string()))
    }
}

/// What the model should optimise for
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GenerationMode {
    #[default]
    Quality,
    Diversity,
    Vocalization,
}

impl fmt::Display for GenerationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenerationMode::Quality => write!(f, "QUALITY"),
            GenerationMode::Diversity => write!(f, "DIVERSITY"),
            GenerationMode::Vocalization => write!(f, "VOCALIZATION"),
        }
    }
}
