//! SSH server frontend (C6): terminates SSH, intercepts
//! `tcpip-forward`/`cancel-tcpip-forward` global requests, allocates a
//! stable [`crate::access_id`] per session, and hands the session off
//! to a [`Forwarder`] for the lifetime of the tunnel.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use thrussh::server::{Auth, Handle, Session};
use thrussh::ChannelId;
use thrussh_keys::key;
use tokio::net::TcpListener;

use crate::access_id::AccessIdAllocator;
use crate::cancel::CancelToken;
use crate::events::ExchangeSink;
use crate::forwarder::{new_channel_router, ChannelEvent, ChannelRouter, Forwarder};
use crate::registry::SessionRegistry;

/// Number of times the session handler retries access-id allocation
/// after a collision with a live registry entry before giving up.
const MAX_ALLOCATION_ATTEMPTS: usize = 5;

/// Everything a [`TunnelHandler`] needs that is shared across every
/// SSH connection, constructed once by the serve orchestrator.
pub struct SharedSsh {
    pub ssh_config: Arc<thrussh::server::Config>,
    pub advertised_http_port: u32,
    pub registry: Arc<SessionRegistry>,
    pub allocator: Arc<AccessIdAllocator>,
    pub exchange: ExchangeSink,
}

/// Binds the SSH listener and accepts connections until `cancel`
/// fires. Each connection gets its own [`TunnelHandler`] and a child
/// cancellation token scoped to that session.
pub async fn run(ssh_addr: String, shared: Arc<SharedSsh>, cancel: CancelToken) -> anyhow::Result<()> {
    let addr: SocketAddr = ssh_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid SSHAddr {:?}: {}", ssh_addr, e))?;
    let mut listener = TcpListener::bind(&addr).await?;
    log::info!("ssh frontend listening on {}", addr);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                log::info!("ssh frontend stopping accept loop");
                return Ok(());
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer_addr)) => {
                        let shared = shared.clone();
                        let session_cancel = cancel.child_token();
                        let ssh_config = shared.ssh_config.clone();
                        tokio::spawn(async move {
                            let handler = TunnelHandler::new(Some(peer_addr), shared, session_cancel);
                            if let Err(e) = thrussh::server::run_stream(ssh_config, socket, handler).await {
                                log::debug!(target: "ssh_frontend", "session from {} ended: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        log::warn!(target: "ssh_frontend", "accept error: {}", e);
                    }
                }
            }
        }
    }
}

/// Per-connection handler. Owns the state a single client's
/// `tcpip-forward` request needs: the allocated access id, the
/// resulting Forwarder, and a channel router so inbound channel data
/// (the client's HTTP response bytes) reaches the right splice.
pub struct TunnelHandler {
    peer_addr: Option<SocketAddr>,
    shared: Arc<SharedSsh>,
    router: ChannelRouter,
    session_cancel: CancelToken,
    access_id: Option<String>,
}

impl TunnelHandler {
    fn new(peer_addr: Option<SocketAddr>, shared: Arc<SharedSsh>, session_cancel: CancelToken) -> Self {
        TunnelHandler {
            peer_addr,
            shared,
            router: new_channel_router(),
            session_cancel,
            access_id: None,
        }
    }
}

/// Session-end cleanup: the session handler task that owns this
/// `Handler` drops it once `run_stream` returns, which is exactly when
/// the registry entry must go and the Forwarder's serve loop must stop
/// -- whether the client disconnected cleanly or the connection just
/// died.
impl Drop for TunnelHandler {
    fn drop(&mut self) {
        if let Some(id) = self.access_id.take() {
            self.shared.registry.remove(&id);
            log::info!(target: "ssh_frontend", "session for {} ended, removed access id {}", self.peer_addr.map(|a| a.to_string()).unwrap_or_default(), id);
        }
        self.session_cancel.cancel();
    }
}

type FutureAuth = Pin<Box<dyn Future<Output = Result<(TunnelHandler, Auth), anyhow::Error>> + Send>>;
type FutureUnit = Pin<Box<dyn Future<Output = Result<(TunnelHandler, Session), anyhow::Error>> + Send>>;
type FutureBool = Pin<Box<dyn Future<Output = Result<(TunnelHandler, Session, bool), anyhow::Error>> + Send>>;

impl thrussh::server::Handler for TunnelHandler {
    type FutureAuth = FutureAuth;
    type FutureUnit = FutureUnit;
    type FutureBool = FutureBool;

    fn finished_auth(self, auth: Auth) -> Self::FutureAuth {
        Box::pin(async move { Ok((self, auth)) })
    }

    fn finished_bool(self, b: bool, session: Session) -> Self::FutureBool {
        Box::pin(async move { Ok((self, session, b)) })
    }

    fn finished(self, session: Session) -> Self::FutureUnit {
        Box::pin(async move { Ok((self, session)) })
    }

    /// Any client presenting no credentials at all is accepted --
    /// there is no authentication of SSH clients in this system.
    fn auth_none(self, _user: &str) -> Self::FutureAuth {
        self.finished_auth(Auth::Accept)
    }

    /// Likewise for any public key: acceptance is unconditional.
    fn auth_publickey(self, _user: &str, _key: &key::PublicKey) -> Self::FutureAuth {
        self.finished_auth(Auth::Accept)
    }

    /// A pty is always authorized so a dashboard consumer could attach
    /// to the session, even though this crate does not render one.
    fn pty_request(
        self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(thrussh::Pty, u32)],
        mut session: Session,
    ) -> Self::FutureUnit {
        session.channel_success(channel);
        self.finished(session)
    }

    fn shell_request(self, channel: ChannelId, mut session: Session) -> Self::FutureUnit {
        session.channel_success(channel);
        self.finished(session)
    }

    /// Inbound data on a `forwarded-tcpip` channel is the client's
    /// half of an HTTP response; route it to whichever splice task
    /// opened that channel. The send is synchronous (unbounded sender)
    /// and happens directly in this callback so chunks reach
    /// `ChannelReader` in the exact order the origin produced them --
    /// spawning a task per chunk would let the runtime reorder them.
    fn data(self, channel: ChannelId, data: &[u8], session: Session) -> Self::FutureUnit {
        if let Some(tx) = self.router.lock().unwrap().get(&channel) {
            let _ = tx.send(ChannelEvent::Data(data.to_vec()));
        }
        self.finished(session)
    }

    fn channel_eof(self, channel: ChannelId, session: Session) -> Self::FutureUnit {
        if let Some(tx) = self.router.lock().unwrap().get(&channel) {
            let _ = tx.send(ChannelEvent::Eof);
        }
        self.finished(session)
    }

    /// Reverse port forwarding is always authorized. Allocates a
    /// stable access id (retrying a few times on registry collision),
    /// constructs this session's Forwarder, registers it, and spawns
    /// its serve loop. The server always reports its own HTTP ingress
    /// port back to the client regardless of the requested bind --
    /// that is what makes `ssh -R 0:host:port user@server` work
    /// without the client needing to know the ingress port in advance.
    fn tcpip_forward(mut self, address: &str, port: u32, mut session: Session) -> Self::FutureBool {
        let address = address.to_string();
        Box::pin(async move {
            let handle: Handle = session.handle();
            let remote = self
                .peer_addr
                .unwrap_or_else(|| "0.0.0.0:0".parse().unwrap());

            let mut allocated: Option<(String, Arc<Forwarder>)> = None;
            for attempt in 0..MAX_ALLOCATION_ATTEMPTS {
                let candidate = if attempt == 0 {
                    self.shared.allocator.allocate(&remote)
                } else {
                    AccessIdAllocator::generate()
                };
                let forwarder = Arc::new(Forwarder::new(
                    address.clone(),
                    port,
                    handle.clone(),
                    self.router.clone(),
                    self.session_cancel.clone(),
                    self.shared.exchange.clone(),
                ));
                if self.shared.registry.try_insert(candidate.clone(), forwarder.clone()) {
                    allocated = Some((candidate, forwarder));
                    break;
                }
            }

            match allocated {
                Some((id, forwarder)) => {
                    session.set_tcpip_forward_reply_port(self.shared.advertised_http_port);
                    self.access_id = Some(id.clone());
                    log::info!(
                        target: "ssh_frontend",
                        "allocated access id {} for {} (requested forward {}:{})",
                        id, remote, address, port
                    );
                    tokio::spawn(async move {
                        forwarder.serve().await;
                    });
                    Ok((self, session, true))
                }
                None => {
                    log::error!(target: "ssh_frontend", "failed to allocate an access id for {} after {} attempts", remote, MAX_ALLOCATION_ATTEMPTS);
                    Ok((self, session, false))
                }
            }
        })
    }

    /// Idempotent: the second and later cancellations of a forward
    /// that is already gone are no-ops that still report success.
    fn cancel_tcpip_forward(mut self, _address: &str, _port: u32, session: Session) -> Self::FutureBool {
        Box::pin(async move {
            if let Some(id) = self.access_id.take() {
                self.shared.registry.remove(&id);
                self.session_cancel.cancel();
                log::info!(target: "ssh_frontend", "cancelled forward, removed access id {}", id);
            }
            Ok((self, session, true))
        })
    }
}
