//! Built-in system methods: liveness probe and the version handshake.

use anyhow::Result;
use serde_json::{json, Value};
use tracing::debug;

use crate::rpc::jsonrpc::RpcError;
use crate::server::RemoteServer;

/// Version string reported to peers.
pub const HOST_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Register the system methods on the server. Call once during startup
/// wiring, before the server is shared.
pub fn register(server: &mut RemoteServer) -> Result<()> {
    server.handle("ping", |_request| Ok(None))?;

    server.handle_sync("version", |request, response| {
        let params = request
            .params()
            .ok_or_else(|| RpcError::InvalidRequest("method requires parameters".into()))?;

        // Record the version the peer reports, so diagnostics can show
        // what is connected.
        if let Some(version) = params.get("version").and_then(Value::as_str) {
            if let Some(client) = request.client() {
                client.set_remote_version(version);
                debug!(version, "peer reported its version");
            }
        }

        response.set_result(json!({
            "version": HOST_VERSION,
            "semver": host_semver(),
        }));
        Ok(())
    })?;

    Ok(())
}

fn host_semver() -> [u64; 4] {
    let mut parts = [0u64; 4];
    for (slot, part) in parts.iter_mut().zip(HOST_VERSION.split('.')) {
        *slot = part.parse().unwrap_or(0);
    }
    parts
}
