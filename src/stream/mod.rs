pub mod backoff;
pub mod protocol;
pub mod session;
pub mod simulator;
pub mod transport;

pub use backoff::Backoff;
pub use protocol::{ClientMessage, GenerationConfig, PlaybackControl, ServerMessage};
pub use session::{SessionConfig, StreamSession};
pub use simulator::SimulatedTransport;
pub use transport::{in_memory, ChannelTransport, Connection, ConnectionPeer, Transport, TransportError};
