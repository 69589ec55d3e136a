//! Local listeners bridged to pod ports.

mod controller;
mod engine;
mod model;
mod registry;
mod session;
pub mod traffic;
mod transport;
mod websocket;

#[cfg(test)]
mod testing;

pub use controller::TunnelController;
pub use engine::{ForwardOptions, TunnelEngine};
pub use model::{ActiveForward, ForwardSpec, NaturalKey, Project, DEFAULT_NAMESPACE};
pub use registry::ForwardRegistry;
pub use session::{BridgeSession, ForwardContext, SessionEnd, SessionSettings, SessionState};
pub use traffic::{TrafficEntry, TrafficMeter, TrafficSnapshot};
pub use transport::{ChannelConnector, ChannelTarget, RemoteChannel, CHANNEL_CAPACITY};
pub use websocket::WebSocketConnector;
