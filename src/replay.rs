//! Byte-buffering reader that lets a caller parse a one-shot prefix (an
//! HTTP request head) and then hand the *entire* stream -- prefix and
//! all -- to something else, unmodified.
//!
//! The buffering itself is a plain, non-async state machine
//! ([`ReplayState`]) so it can be unit tested without standing up real
//! sockets; [`ReplayReader`] and [`RewoundStream`] are thin `AsyncRead`/
//! `AsyncWrite` adapters around it.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite};

/// Tracks the buffered prefix and whether we're still recording or
/// replaying it.
#[derive(Default)]
struct ReplayState {
    buffer: Vec<u8>,
    cursor: usize,
    recording: bool,
}

impl ReplayState {
    fn new() -> Self {
        ReplayState {
            buffer: Vec::new(),
            cursor: 0,
            recording: true,
        }
    }

    /// Serves buffered bytes at the cursor, if any are left to replay.
    /// Returns the number of bytes copied into `out`.
    fn take_buffered(&mut self, out: &mut [u8]) -> usize {
        if self.cursor >= self.buffer.len() {
            return 0;
        }
        let available = &self.buffer[self.cursor..];
        let n = available.len().min(out.len());
        out[..n].copy_from_slice(&available[..n]);
        self.cursor += n;
        n
    }

    /// Records freshly-read bytes, growing the buffer, while recording
    /// is active.
    fn record(&mut self, data: &[u8]) {
        if self.recording {
            self.buffer.extend_from_slice(data);
            self.cursor = self.buffer.len();
        }
    }

    /// Rewinds the cursor to the start of the buffer and stops
    /// recording further reads; only the bytes captured so far are
    /// ever replayed.
    fn rewind(&mut self) {
        self.cursor = 0;
        self.recording = false;
    }
}

/// Wraps an inner duplex stream, recording every byte read through it.
pub struct ReplayReader<S> {
    inner: S,
    state: ReplayState,
}

impl<S> ReplayReader<S> {
    pub fn new(inner: S) -> Self {
        ReplayReader {
            inner,
            state: ReplayState::new(),
        }
    }

    /// Resets the read cursor to the start of the buffer; a subsequent
    /// read returns already-buffered bytes before any further physical
    /// reads.
    pub fn reset(&mut self) {
        self.state.cursor = 0;
    }

    /// Consumes this reader, yielding a duplex stream that first
    /// replays the buffered prefix (from the current cursor) and then
    /// continues reading from -- and writes straight through to -- the
    /// underlying stream.
    pub fn rewind_adopt(mut self) -> RewoundStream<S> {
        self.state.rewind();
        RewoundStream {
            inner: self.inner,
            state: self.state,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ReplayReader<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let me = &mut *self;
        let n = me.state.take_buffered(buf);
        if n > 0 {
            return Poll::Ready(Ok(n));
        }
        match Pin::new(&mut me.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(n)) => {
                me.state.record(&buf[..n]);
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ReplayReader<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// A duplex stream produced by [`ReplayReader::rewind_adopt`]: reads
/// drain the recorded prefix first, then fall through to the live
/// stream; writes always pass straight through.
pub struct RewoundStream<S> {
    inner: S,
    state: ReplayState,
}

impl<S: AsyncRead + Unpin> AsyncRead for RewoundStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let me = &mut *self;
        let n = me.state.take_buffered(buf);
        if n > 0 {
            return Poll::Ready(Ok(n));
        }
        Pin::new(&mut me.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for RewoundStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_reads_and_replays_from_cursor_zero() {
        let mut state = ReplayState::new();
        state.record(b"GET / HTTP/1.1\r\n");
        state.record(b"Host: a.example.com\r\n\r\n");
        state.rewind();

        let mut out = vec![0u8; 64];
        let n = state.take_buffered(&mut out);
        assert_eq!(&out[..n], b"GET / HTTP/1.1\r\nHost: a.example.com\r\n\r\n");
    }

    #[test]
    fn reset_allows_rereading_before_rewind() {
        let mut state = ReplayState::new();
        state.record(b"abc");
        assert_eq!(state.take_buffered(&mut [0u8; 1]), 0); // cursor is already at end
        state.cursor = 0;
        let mut out = [0u8; 3];
        assert_eq!(state.take_buffered(&mut out), 3);
        assert_eq!(&out, b"abc");
    }

    #[test]
    fn after_rewind_recording_stops() {
        let mut state = ReplayState::new();
        state.record(b"abc");
        state.rewind();
        let mut out = [0u8; 3];
        state.take_buffered(&mut out);
        state.record(b"def"); // should be a no-op: recording stopped
        assert_eq!(state.buffer, b"abc");
    }

    /// Minimal in-memory duplex stream for exercising the async adapters
    /// without a real socket.
    struct MockStream {
        to_read: std::collections::VecDeque<u8>,
        written: Vec<u8>,
    }

    impl AsyncRead for MockStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut [u8],
        ) -> Poll<io::Result<usize>> {
            let n = buf.len().min(self.to_read.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.to_read.pop_front().unwrap();
            }
            Poll::Ready(Ok(n))
        }
    }

    impl AsyncWrite for MockStream {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.written.extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }
        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn rewound_stream_serves_prefix_then_live_bytes() {
        use tokio::io::AsyncReadExt;

        let mock = MockStream {
            to_read: b"GET / HTTP/1.1\r\n\r\nBODY".iter().copied().collect(),
            written: Vec::new(),
        };
        let mut reader = ReplayReader::new(mock);

        let mut head = [0u8; 18];
        reader.read_exact(&mut head).await.unwrap();
        assert_eq!(&head, b"GET / HTTP/1.1\r\n\r\n");

        let mut rewound = reader.rewind_adopt();
        let mut all = Vec::new();
        rewound.read_to_end(&mut all).await.unwrap();
        assert_eq!(all, b"GET / HTTP/1.1\r\n\r\nBODY");
    }

    #[tokio::test]
    async fn rewound_stream_writes_pass_through() {
        use tokio::io::AsyncWriteExt;

        let mock = MockStream {
            to_read: std::collections::VecDeque::new(),
            written: Vec::new(),
        };
        let reader = ReplayReader::new(mock);
        let mut rewound = reader.rewind_adopt();
        rewound.write_all(b"hello").await.unwrap();
        assert_eq!(rewound.inner.written, b"hello");
    }
}
