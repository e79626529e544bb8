pub mod audio;
pub mod config;
pub mod controller;
pub mod error;
pub mod params;
pub mod status;
pub mod stream;

pub use config::{BufferConfig, PlaybackConfig, ReconnectConfig, SteeringConfig, StreamConfig};
pub use controller::{ControllerBuilder, SteeringController};
pub use error::{Result, SteerError, ValidationError};
pub use params::{GenerationMode, ParameterDelta, ParameterSnapshot, ParameterState, Scale, WeightedPrompt};
pub use status::{SessionEvent, SessionHandle, SessionState, SharedSessionStatus, Telemetry};
