//! Serve orchestrator (C9): starts the SSH frontend and HTTP ingress
//! under a shared cancellation context and blocks until shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use thrussh_keys::key::KeyPair;

use crate::access_id::AccessIdAllocator;
use crate::cancel::CancelToken;
use crate::events::ExchangeSink;
use crate::http_ingress;
use crate::registry::SessionRegistry;
use crate::ssh_frontend::{self, SharedSsh};

/// Everything the process entrypoint resolved from [`crate::config::Config`]
/// before calling [`serve`].
pub struct ServeParams {
    pub ssh_addr: String,
    pub http_addr: String,
    pub host_key: KeyPair,
}

/// Builds the SSH server config, the shared registry/allocator/event
/// sink, and drives C6 and C7 to completion. Returns once `root_cancel`
/// fires and both frontends have stopped accepting new connections.
pub async fn serve(params: ServeParams, root_cancel: CancelToken) -> anyhow::Result<()> {
    let http_socket_addr: SocketAddr = params
        .http_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid httpAddr {:?}: {}", params.http_addr, e))?;

    let mut ssh_config = thrussh::server::Config::default();
    // The SSH protocol keepalive (C8) already guards idle tunnels;
    // thrussh's own read-timeout would otherwise drop a session that
    // is simply sitting quiet between requests.
    ssh_config.connection_timeout = None;
    ssh_config.keys.push(params.host_key);
    let ssh_config = Arc::new(ssh_config);

    let registry = Arc::new(SessionRegistry::new());
    let allocator = Arc::new(AccessIdAllocator::new());
    let (exchange, _receiver) = ExchangeSink::new(2);

    let shared = Arc::new(SharedSsh {
        ssh_config,
        advertised_http_port: http_socket_addr.port() as u32,
        registry: registry.clone(),
        allocator,
        exchange,
    });

    let ssh_cancel = root_cancel.child_token();
    let http_cancel = root_cancel.child_token();

    let ssh_task = tokio::spawn(ssh_frontend::run(params.ssh_addr, shared, ssh_cancel));
    let http_task = tokio::spawn(http_ingress::run(params.http_addr, registry, http_cancel));

    root_cancel.cancelled().await;
    log::info!(target: "orchestrator", "shutdown signalled, draining ssh and http frontends");

    let (ssh_result, http_result) = tokio::join!(ssh_task, http_task);
    ssh_result??;
    http_result??;
    Ok(())
}
