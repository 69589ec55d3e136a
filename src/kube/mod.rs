//! Cluster credentials.
//!
//! - [`KubeConfig`] - typed view of the kubeconfig document
//! - [`CredentialResolver`] - maps a context name to a base URL plus
//!   bearer token or client TLS identity
//! - [`tls`] - rustls client configuration for cluster connections

mod credentials;
pub mod kubeconfig;
pub mod tls;

pub use credentials::{ClientIdentity, CredentialResolver, Credentials};
pub use kubeconfig::KubeConfig;
