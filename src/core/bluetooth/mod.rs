//! Bluetooth functionality for the robot link
//! This module handles all bluetooth operations including scanning,
//! connecting, writing commands and receiving telemetry from the robot.

pub mod codec;
pub mod constants;
mod connection;
mod events;
mod manager;
mod notification;
mod radio;
mod scanner;
mod session;
mod types;

// Re-export types that should be publicly accessible
pub use codec::{Command, DecodeError, TelemetryFrame, WireMessage, decode, encode};
pub use connection::BluestLink;
pub use events::{EventBus, LinkEvent, ObserverId, SessionTracker, Subscription};
pub use manager::RobotManager;
pub use radio::{BluestRadio, DeviceRegistry};
pub use scanner::{DeviceScanner, Radio, ScanError, ScanHandle, ScanOutcome, ScanState};
pub use session::{
    DiscoveredService, GattTransport, LinkConfig, LinkError, LinkSession, PlatformEvent,
    PlatformEvents, SessionHandle, spawn_session,
};
pub use types::{
    Advertisement, DiscoveredPeer, InvalidAddress, LinkState, PeerIdentity, ScanFilterSpec,
    SessionId,
};
