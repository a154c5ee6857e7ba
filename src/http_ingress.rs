//! HTTP ingress listener (C7): the public-facing side of the tunnel.
//! Accepts plain HTTP connections, peeks the request head to route by
//! `Host`, and hands each accepted connection to the Forwarder that
//! owns its subdomain.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::time::timeout;

use crate::cancel::CancelToken;
use crate::forwarder::PendingRequest;
use crate::httpflow::{self, BAD_REQUEST_RESPONSE};
use crate::registry::SessionRegistry;
use crate::replay::ReplayReader;

/// Deadline for reading a full HTTP request head off a freshly
/// accepted ingress connection; not exposed via configuration since
/// the config schema is fixed by the wire contract (SPEC_FULL.md
/// §4.7/§4.11).
const HEAD_READ_DEADLINE: Duration = Duration::from_secs(10);

/// How long a connection will wait for room in its Forwarder's pending
/// queue before being dropped.
const SUBMIT_DEADLINE: Duration = Duration::from_secs(5);

/// Poll interval between retried `try_submit` attempts while a
/// Forwarder's pending queue is full.
const SUBMIT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Binds the HTTP ingress listener and accepts connections until
/// `cancel` fires. Accept errors are logged and do not stop the loop.
pub async fn run(http_addr: String, registry: Arc<SessionRegistry>, cancel: CancelToken) -> anyhow::Result<()> {
    let addr: std::net::SocketAddr = http_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid httpAddr {:?}: {}", http_addr, e))?;
    let mut listener = TcpListener::bind(&addr).await?;
    log::info!("http ingress listening on {}", addr);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                log::info!("http ingress stopping accept loop");
                return Ok(());
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer_addr)) => {
                        let registry = registry.clone();
                        tokio::spawn(async move {
                            handle_connection(socket, peer_addr, registry).await;
                        });
                    }
                    Err(e) => {
                        log::warn!(target: "http_ingress", "accept error: {}", e);
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    socket: tokio::net::TcpStream,
    peer_addr: std::net::SocketAddr,
    registry: Arc<SessionRegistry>,
) {
    let mut replay = ReplayReader::new(socket);
    let head = match timeout(HEAD_READ_DEADLINE, httpflow::read_request_head(&mut replay)).await {
        Ok(Ok(head)) => head,
        Ok(Err(e)) => {
            log::debug!(target: "http_ingress", "head parse failed from {}: {}", peer_addr, e);
            let mut rewound = replay.rewind_adopt();
            let _ = rewound.write_all(BAD_REQUEST_RESPONSE).await;
            return;
        }
        Err(_elapsed) => {
            log::debug!(target: "http_ingress", "head read timed out from {}", peer_addr);
            let mut rewound = replay.rewind_adopt();
            let _ = rewound.write_all(BAD_REQUEST_RESPONSE).await;
            return;
        }
    };

    let host = match &head.host {
        Some(h) => h.clone(),
        None => {
            log::debug!(target: "http_ingress", "request from {} has no Host header", peer_addr);
            let mut rewound = replay.rewind_adopt();
            let _ = rewound.write_all(BAD_REQUEST_RESPONSE).await;
            return;
        }
    };

    let access_id = match httpflow::access_id_from_host(&host) {
        Some(id) => id.to_string(),
        None => {
            log::debug!(target: "http_ingress", "host {:?} from {} has no subdomain label", host, peer_addr);
            let mut rewound = replay.rewind_adopt();
            let _ = rewound.write_all(BAD_REQUEST_RESPONSE).await;
            return;
        }
    };

    let forwarder = match registry.get(&access_id) {
        Some(f) => f,
        None => {
            log::debug!(target: "http_ingress", "unknown access id {:?} from {}", access_id, peer_addr);
            let mut rewound = replay.rewind_adopt();
            let _ = rewound.write_all(&httpflow::not_found_response(&access_id)).await;
            return;
        }
    };

    let req = PendingRequest {
        socket: replay.rewind_adopt(),
        peer_addr,
        head,
        enqueued_at: Instant::now(),
    };

    submit_with_backpressure(&forwarder, req, &access_id, peer_addr).await;
}

/// Retries `try_submit` against a backoff of [`SUBMIT_RETRY_INTERVAL`]
/// until it succeeds or [`SUBMIT_DEADLINE`] elapses, at which point the
/// connection is dropped (SPEC_FULL.md §4.7/§7, Backpressure).
async fn submit_with_backpressure(
    forwarder: &crate::forwarder::Forwarder,
    mut req: PendingRequest,
    access_id: &str,
    peer_addr: std::net::SocketAddr,
) {
    let deadline = Instant::now() + SUBMIT_DEADLINE;
    loop {
        match forwarder.try_submit(req).await {
            Ok(()) => return,
            Err(rejected) => {
                if Instant::now() >= deadline {
                    log::warn!(
                        target: "http_ingress",
                        "pending queue for {} stayed full for {:?}, dropping connection from {}",
                        access_id, SUBMIT_DEADLINE, peer_addr
                    );
                    return;
                }
                req = rejected;
                tokio::time::delay_for(SUBMIT_RETRY_INTERVAL).await;
            }
        }
    }
}
