//! Port-forward endpoint addressing.

use url::Url;

use crate::error::{Result, TunnelError};

/// Subprotocols offered during the upgrade, most preferred first
pub const SUBPROTOCOLS: [&str; 4] = [
    "v4.channel.k8s.io",
    "v3.channel.k8s.io",
    "v2.channel.k8s.io",
    "channel.k8s.io",
];

/// Value of the `Sec-WebSocket-Protocol` request header
pub fn subprotocol_header() -> String {
    SUBPROTOCOLS.join(", ")
}

/// Path of the port-forward subresource of one pod
pub fn portforward_path(namespace: &str, pod: &str) -> String {
    format!("/api/v1/namespaces/{namespace}/pods/{pod}/portforward")
}

/// Build the WebSocket URL for a port-forward on top of a cluster base URL.
///
/// `https` becomes `wss` and `http` becomes `ws`; any path prefix of the base
/// URL (clusters behind a proxy) is kept.
pub fn portforward_url(base: &Url, namespace: &str, pod: &str, port: u16) -> Result<Url> {
    let scheme = match base.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(TunnelError::Transport(format!(
                "Unsupported cluster URL scheme: {other}"
            )))
        }
    };

    let mut url = base.clone();
    url.set_scheme(scheme)
        .map_err(|_| TunnelError::Transport(format!("Cannot use {scheme} for {base}")))?;

    let prefix = base.path().trim_end_matches('/');
    url.set_path(&format!("{}{}", prefix, portforward_path(namespace, pod)));
    url.set_query(Some(&format!("ports={port}")));
    Ok(url)
}
