// Shared data model: samples captured from the band and the session records
// they belong to.

pub mod sample;
pub mod session;

pub use sample::{ChannelKind, DeviceStatus, Sample, GOOD_QUALITY};
pub use session::{
    DeviceModel, NewSession, Session, SessionId, SessionMetadata, SessionStatus,
    SessionSummary, SessionType,
};
