use super::broker::Shared;
use super::frame::Frame;
use crate::config::MuxConfig;
use bytes::{Buf, Bytes};
use std::fmt;
use std::io;
use std::pin::Pin;
use parking_lot::Mutex;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

/// Send credit of one stream.
///
/// Starts at [`MuxConfig::STREAM_WINDOW`] bytes, shrinks as the stream writes
/// and grows again when the peer reports consumed bytes with a `Window`
/// frame. A writer that runs out parks until credit returns or the stream
/// goes away.
#[derive(Debug)]
pub(crate) struct SendWindow {
    state: Mutex<WindowState>,
}

#[derive(Debug)]
struct WindowState {
    available: usize,
    closed: bool,
    waker: Option<Waker>,
}

impl SendWindow {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(WindowState {
                available: MuxConfig::STREAM_WINDOW,
                closed: false,
                waker: None,
            }),
        })
    }

    pub(crate) fn grant(&self, credit: usize) {
        let waker = {
            let mut state = self.state.lock();
            state.available = state.available.saturating_add(credit);
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    pub(crate) fn close(&self) {
        let waker = {
            let mut state = self.state.lock();
            state.closed = true;
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Take up to `want` bytes of credit. `None` once the stream is gone.
    fn poll_reserve(&self, cx: &mut Context<'_>, want: usize) -> Poll<Option<usize>> {
        let mut state = self.state.lock();
        if state.closed {
            return Poll::Ready(None);
        }
        if state.available == 0 {
            state.waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        let n = want.min(state.available);
        state.available -= n;
        Poll::Ready(Some(n))
    }
}

/// One logical duplex stream of a [`MuxBroker`](super::MuxBroker).
///
/// Shutting down or dropping the stream closes both directions and sends
/// `Fin` to the peer. Reads return EOF once the peer's `Fin` arrives or the
/// connection is lost. Writes wait while the peer has not read what was
/// already sent.
pub struct MuxStream {
    id: u32,
    token: u64,
    incoming: mpsc::UnboundedReceiver<Bytes>,
    pending: Bytes,
    /// Bytes read but not yet reported back to the peer.
    consumed: usize,
    window: Arc<SendWindow>,
    shared: Arc<Shared>,
    closed: bool,
}

impl MuxStream {
    pub(crate) fn new(
        id: u32,
        token: u64,
        incoming: mpsc::UnboundedReceiver<Bytes>,
        window: Arc<SendWindow>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            id,
            token,
            incoming,
            pending: Bytes::new(),
            consumed: 0,
            window,
            shared,
            closed: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    fn close_local(&mut self) {
        if !self.closed {
            self.closed = true;
            self.shared.release(self.id, self.token);
        }
    }

    fn acknowledge(&mut self, n: usize) {
        self.consumed += n;
        if self.consumed >= MuxConfig::STREAM_WINDOW / 2 {
            let credit = std::mem::take(&mut self.consumed);
            self.shared.grant(self.id, self.token, credit);
        }
    }

    fn broken_pipe(&self) -> io::Error {
        io::Error::new(
            io::ErrorKind::BrokenPipe,
            format!("mux stream {} is closed", self.id),
        )
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending[..n]);
                this.pending.advance(n);
                this.acknowledge(n);
                return Poll::Ready(Ok(()));
            }
            match this.incoming.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => this.pending = chunk,
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.closed || !this.shared.is_live(this.id, this.token) {
            return Poll::Ready(Err(this.broken_pipe()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let n = match this.window.poll_reserve(cx, buf.len().min(MuxConfig::MAX_DATA_CHUNK)) {
            Poll::Ready(Some(n)) => n,
            Poll::Ready(None) => return Poll::Ready(Err(this.broken_pipe())),
            Poll::Pending => return Poll::Pending,
        };
        let frame = Frame::data(this.id, Bytes::copy_from_slice(&buf[..n]));
        match this.shared.send(frame) {
            Ok(()) => Poll::Ready(Ok(n)),
            Err(e) => Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, e))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().close_local();
        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        self.close_local();
    }
}

impl fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxStream")
            .field("id", &self.id)
            .field("closed", &self.closed)
            .finish()
    }
}
