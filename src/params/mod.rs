pub mod state;
pub mod types;

pub use state::{ParameterDelta, ParameterSnapshot, ParameterState, BPM_MAX, BPM_MIN};
pub use types::{GenerationMode, Scale, WeightedPrompt};
