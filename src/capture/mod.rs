// Capture core: the sample buffer and the session orchestrator driving it.

pub mod buffer;
pub mod orchestrator;

pub use buffer::{Batch, BufferAccounting, SampleBuffer};
pub use orchestrator::{CaptureProgress, Phase, SessionOrchestrator, StopOutcome, StopReport};
