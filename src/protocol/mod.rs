//! Wire-level pieces of the port-forward subprotocol.
//!
//! - [`frame`] - one-byte stream-number framing of channel messages
//! - [`portforward`] - endpoint URL and offered subprotocols
//!
//! Also provides type-safe ID wrappers for forwards and sessions.

pub mod frame;
mod ids;
pub mod portforward;

pub use frame::{Frame, DATA_STREAM, ERROR_STREAM};
pub use ids::*;
