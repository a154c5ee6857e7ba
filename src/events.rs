//! Observability records for completed HTTP exchanges, and the bounded
//! channel a [`crate::forwarder::Forwarder`] uses to hand them off to
//! whatever is watching (a dashboard, in the source system this was
//! adapted from; any consumer, here).

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::ring::BoundedRing;

const HISTORY_CAPACITY: usize = 32;

/// One request/response pair observed while splicing an ingress
/// connection onto an SSH channel.
#[derive(Debug, Clone)]
pub struct HttpExchange {
    pub request_line: String,
    pub status_code: u16,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub elapsed_ms: u64,
}

/// Sending half of the exchange-event channel, shared by every
/// Forwarder in the process. Cloneable; sends never block -- a full
/// channel just drops the event, since the consumer is best-effort
/// observability, not a correctness-critical path. Every emitted
/// exchange is also kept in a fixed-size history ring (oldest evicted
/// first) so a late-attaching consumer can catch up.
#[derive(Clone)]
pub struct ExchangeSink {
    tx: mpsc::Sender<HttpExchange>,
    history: Arc<Mutex<BoundedRing<HttpExchange>>>,
}

impl ExchangeSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<HttpExchange>) {
        let (tx, rx) = mpsc::channel(capacity);
        let sink = ExchangeSink {
            tx,
            history: Arc::new(Mutex::new(BoundedRing::new(HISTORY_CAPACITY))),
        };
        (sink, rx)
    }

    pub fn emit(&self, exchange: HttpExchange) {
        self.history.lock().unwrap().push(exchange.clone());
        if let Err(_dropped) = self.tx.clone().try_send(exchange) {
            log::debug!(target: "events", "exchange event channel full, dropping event");
        }
    }

    /// Snapshot of the retained history, oldest first.
    pub fn history(&self) -> Vec<HttpExchange> {
        self.history.lock().unwrap().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_channel_drops_instead_of_blocking() {
        let (sink, mut rx) = ExchangeSink::new(1);
        let sample = HttpExchange {
            request_line: "GET / HTTP/1.1".into(),
            status_code: 200,
            bytes_sent: 10,
            bytes_received: 20,
            elapsed_ms: 5,
        };
        sink.emit(sample.clone());
        sink.emit(sample.clone()); // channel now full; dropped, not blocked
        sink.emit(sample.clone());

        let received = rx.recv().await.unwrap();
        assert_eq!(received.status_code, 200);
        // No second event queued; recv would otherwise hang in this test.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn history_keeps_every_emission_even_once_the_channel_is_full() {
        let (sink, _rx) = ExchangeSink::new(1);
        for i in 0..3 {
            sink.emit(HttpExchange {
                request_line: format!("GET /{} HTTP/1.1", i),
                status_code: 200,
                bytes_sent: 0,
                bytes_received: 0,
                elapsed_ms: 0,
            });
        }
        let history = sink.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].request_line, "GET /0 HTTP/1.1");
        assert_eq!(history[2].request_line, "GET /2 HTTP/1.1");
    }
}
