//! Biosignal capture pipeline: a wearable band's frames are tagged with the
//! active session, buffered, and delivered in batches to a remote session
//! service that may be unreachable at any time.

pub mod capture;
pub mod config;
pub mod device;
pub mod error;
pub mod model;
pub mod remote;
pub mod utils;

pub use capture::{Phase, SessionOrchestrator, StopOutcome, StopReport};
pub use config::CaptureConfig;
pub use error::{CaptureError, ConfigError, RemoteError};
