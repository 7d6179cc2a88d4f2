// Device side: the wearable link contract and a simulated band.
// Raw frames leave this module through subscriber channels only.

pub mod link;
pub mod simulated;

pub use link::{ConnectionState, DeviceInfo, DeviceLink, Frame, LinkCore, LinkEvent, LinkEvents};
pub use simulated::{Advertised, SimulatedBand, SimulatedBandConfig};
