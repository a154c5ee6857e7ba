//! Per-session dispatcher (C8): accepts [`PendingRequest`]s handed off
//! by the ingress listener, opens one `forwarded-tcpip` SSH channel per
//! request, splices both directions, and reports one [`HttpExchange`]
//! per request that yields a parseable response head.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use thrussh::server::Handle;
use thrussh::{ChannelId, CryptoVec};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::interval;

use crate::cancel::CancelToken;
use crate::blocking_queue::BlockingBoundedQueue;
use crate::events::{ExchangeSink, HttpExchange};
use crate::httpflow::{self, RequestHead};
use crate::replay::{ReplayReader, RewoundStream};

const PENDING_CAPACITY: usize = 4;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// One accepted ingress connection, already past its HTTP head, waiting
/// for this forwarder's serve loop to open an SSH channel for it.
pub struct PendingRequest {
    pub socket: RewoundStream<TcpStream>,
    pub peer_addr: SocketAddr,
    pub head: RequestHead,
    pub enqueued_at: Instant,
}

/// A slice of bytes arriving on a channel, or the end of that channel,
/// routed here by the owning SSH session's `Handler` callbacks.
#[derive(Debug)]
pub enum ChannelEvent {
    Data(Vec<u8>),
    Eof,
}

/// Shared between a connection's `Handler` impl and every `Forwarder`
/// serving requests over that connection: lets `data()`/`channel_eof()`
/// hand inbound bytes to whichever task opened the channel.
pub type ChannelRouter = Arc<Mutex<HashMap<ChannelId, mpsc::UnboundedSender<ChannelEvent>>>>;

pub fn new_channel_router() -> ChannelRouter {
    Arc::new(Mutex::new(HashMap::new()))
}

pub struct Forwarder {
    bind_addr: String,
    bind_port: u32,
    handle: Option<Handle>,
    router: ChannelRouter,
    pending: Arc<BlockingBoundedQueue<PendingRequest>>,
    cancel: CancelToken,
    exchange: ExchangeSink,
}

impl Forwarder {
    pub fn new(
        bind_addr: String,
        bind_port: u32,
        handle: Handle,
        router: ChannelRouter,
        cancel: CancelToken,
        exchange: ExchangeSink,
    ) -> Self {
        Forwarder {
            bind_addr,
            bind_port,
            handle: Some(handle),
            router,
            pending: BlockingBoundedQueue::new(PENDING_CAPACITY),
            cancel,
            exchange,
        }
    }

    /// Construction for registry unit tests, which never drive `serve`
    /// and so need no real session handle.
    pub fn new_for_test(
        bind_addr: String,
        bind_port: u32,
        cancel: CancelToken,
        exchange: ExchangeSink,
    ) -> Self {
        Forwarder {
            bind_addr,
            bind_port,
            handle: None,
            router: new_channel_router(),
            pending: BlockingBoundedQueue::new(PENDING_CAPACITY),
            cancel,
            exchange,
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.bind_addr
    }

    pub fn bind_port(&self) -> u32 {
        self.bind_port
    }

    /// Non-blocking hand-off of an accepted ingress connection. Returns
    /// the request back on failure so the caller can retry or drop it.
    pub async fn try_submit(&self, req: PendingRequest) -> Result<(), PendingRequest> {
        self.pending.try_push(req).await
    }

    /// Runs until cancelled. Dequeues pending requests in FIFO order,
    /// opening one SSH channel per request and spawning its splice
    /// independently -- a slow response never blocks the next dequeue.
    pub async fn serve(&self) {
        let mut keepalive = interval(KEEPALIVE_INTERVAL);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    log::debug!("forwarder for {}:{} draining on cancellation", self.bind_addr, self.bind_port);
                    return;
                }
                _ = keepalive.tick() => {
                    self.send_keepalive().await;
                }
                req = self.pending.recv() => {
                    self.dispatch(req);
                }
            }
        }
    }

    async fn send_keepalive(&self) {
        if let Some(handle) = &self.handle {
            let mut handle = handle.clone();
            if handle.global_request("keepalive@openssh.com", true).await.is_err() {
                log::warn!("keepalive failed on {}:{}, session likely gone", self.bind_addr, self.bind_port);
            }
        }
    }

    fn dispatch(&self, req: PendingRequest) {
        let handle = match &self.handle {
            Some(h) => h.clone(),
            None => return,
        };
        let router = self.router.clone();
        let exchange = self.exchange.clone();
        let dest_addr = self.bind_addr.clone();
        let dest_port = self.bind_port;
        tokio::spawn(async move {
            if let Err(e) = serve_one(handle, router, exchange, dest_addr, dest_port, req).await {
                log::debug!("request splice ended: {}", e);
            }
        });
    }
}

async fn serve_one(
    mut handle: Handle,
    router: ChannelRouter,
    exchange: ExchangeSink,
    dest_addr: String,
    dest_port: u32,
    req: PendingRequest,
) -> Result<(), anyhow::Error> {
    let origin_addr = req.peer_addr.ip().to_string();
    let origin_port = req.peer_addr.port() as u32;

    let channel_id = handle
        .request_forwarded_tcpip(&dest_addr, dest_port, &origin_addr, origin_port)
        .await
        .map_err(|e| anyhow::anyhow!("channel open failed: {}", e))?;

    let (tx, rx) = mpsc::unbounded_channel();
    router.lock().unwrap().insert(channel_id, tx);

    let (mut ingress_read, mut ingress_write) = tokio::io::split(req.socket);

    let bytes_sent = Arc::new(AtomicU64::new(0));
    let upload_bytes_sent = bytes_sent.clone();
    let mut upload_handle = handle.clone();
    let upload = tokio::spawn(async move {
        let mut buf = [0u8; 16 * 1024];
        loop {
            match ingress_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    upload_bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                    if upload_handle
                        .data(channel_id, CryptoVec::from_slice(&buf[..n]))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    log::debug!("ingress read error on channel {:?}: {}", channel_id, e);
                    break;
                }
            }
        }
        let _ = upload_handle.eof(channel_id).await;
    });

    let channel_reader = ChannelReader::new(rx);
    let mut replay = ReplayReader::new(channel_reader);
    let download_result = httpflow::read_response_head(&mut replay).await;
    let mut rewound = replay.rewind_adopt();

    let exchange_recorded = match download_result {
        Ok(response) => {
            let bytes_received = response.content_length.unwrap_or(0);
            exchange.emit(HttpExchange {
                request_line: format!("{} {}", req.head.method, req.head.path),
                status_code: response.status_code,
                bytes_sent: bytes_sent.load(Ordering::Relaxed),
                bytes_received,
                elapsed_ms: req.enqueued_at.elapsed().as_millis() as u64,
            });
            true
        }
        Err(e) => {
            log::debug!("response head parse failed on channel {:?}: {}", channel_id, e);
            false
        }
    };
    let _ = exchange_recorded;

    let copy_result = tokio::io::copy(&mut rewound, &mut ingress_write).await;
    let _ = ingress_write.shutdown().await;
    router.lock().unwrap().remove(&channel_id);
    let _ = upload.await;

    copy_result.map(|_| ()).map_err(anyhow::Error::from)
}

/// Adapts the [`ChannelEvent`] stream routed from a connection's
/// `Handler` callbacks into an `AsyncRead`.
struct ChannelReader {
    rx: mpsc::UnboundedReceiver<ChannelEvent>,
    buf: Vec<u8>,
    pos: usize,
    eof: bool,
}

impl ChannelReader {
    fn new(rx: mpsc::UnboundedReceiver<ChannelEvent>) -> Self {
        ChannelReader {
            rx,
            buf: Vec::new(),
            pos: 0,
            eof: false,
        }
    }
}

impl AsyncRead for ChannelReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        loop {
            if self.pos < self.buf.len() {
                let n = out.len().min(self.buf.len() - self.pos);
                out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
                self.pos += n;
                return Poll::Ready(Ok(n));
            }
            if self.eof {
                return Poll::Ready(Ok(0));
            }
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(ChannelEvent::Data(data))) => {
                    self.buf = data;
                    self.pos = 0;
                }
                Poll::Ready(Some(ChannelEvent::Eof)) | Poll::Ready(None) => {
                    self.eof = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ExchangeSink;

    #[tokio::test]
    async fn channel_reader_surfaces_data_then_eof() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(ChannelEvent::Data(b"hello ".to_vec())).unwrap();
        tx.send(ChannelEvent::Data(b"world".to_vec())).unwrap();
        tx.send(ChannelEvent::Eof).unwrap();
        drop(tx);

        let mut reader = ChannelReader::new(rx);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn try_submit_respects_capacity() {
        let (sink, _rx) = ExchangeSink::new(1);
        let forwarder = Forwarder::new_for_test(
            "127.0.0.1".into(),
            9000,
            CancelToken::new(),
            sink,
        );
        for _ in 0..PENDING_CAPACITY {
            let req = make_request().await;
            assert!(forwarder.try_submit(req).await.is_ok());
        }
        let overflow = make_request().await;
        assert!(forwarder.try_submit(overflow).await.is_err());
    }

    /// A real loopback socket pair, since `RewoundStream<TcpStream>`
    /// isn't meaningfully constructible any other way.
    async fn make_request() -> PendingRequest {
        use tokio::net::TcpListener;

        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut listener = TcpListener::bind(&addr).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (accepted, peer_addr) = listener.accept().await.unwrap();
        drop(client);

        let socket = ReplayReader::new(accepted).rewind_adopt();
        PendingRequest {
            socket,
            peer_addr,
            head: RequestHead {
                method: "GET".into(),
                path: "/".into(),
                host: None,
            },
            enqueued_at: Instant::now(),
        }
    }
}
