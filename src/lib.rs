//! kubelinkr
//!
//! Forwards local TCP ports to pod ports through the Kubernetes API server's
//! port-forward channel, grouped into projects that start and stop together.

#![deny(clippy::correctness)]
#![warn(clippy::suspicious)]
#![warn(clippy::style)]
#![warn(clippy::complexity)]
#![warn(clippy::perf)]

pub mod config;
pub mod error;
pub mod kube;
pub mod protocol;
pub mod tunnel;

pub use error::{Result, TunnelError};
