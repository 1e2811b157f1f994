//! Shared building blocks for the beacon tracking client: event and session
//! types, configuration, errors and the delivery transport contract.

pub mod config;
pub mod error;
pub mod transport;
pub mod types;

pub use config::{DeviceConfig, TrackerConfig};
pub use error::{TrackerError, TrackerResult};
pub use transport::{CaptureTransport, NoopTransport, Transport};
pub use types::{Event, Properties, SessionInfo, SystemEvent};
