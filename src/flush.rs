//! Response body streaming with bounded flush latency
//!
//! The client body is fed through a bounded channel. [`BodySender`] buffers
//! written bytes and only hands a frame to hyper on flush. When a flush
//! interval is configured, [`MaxLatencyWriter`] runs a ticking task that
//! flushes the shared sender while the copy loop keeps writing; both take
//! the same mutex so a flush never interleaves with a write.

use crate::error::BoxError;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::stream;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use hyper::HeaderMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::trace;

/// Body type handed back to the client connection
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// Buffered bytes that force a flush even without a tick
const MAX_BUFFERED: usize = 32 * 1024;

/// Frames queued towards the client before the copy loop waits
const CHANNEL_CAPACITY: usize = 16;

/// Hook run when a flush loop exits through its stop signal
pub type FlushLoopExitHook = Arc<dyn Fn() + Send + Sync>;

/// A destination that buffers writes until flushed
#[async_trait]
pub trait WriteFlush: Send {
    async fn write(&mut self, chunk: Bytes) -> io::Result<()>;
    async fn flush(&mut self) -> io::Result<()>;
}

/// Writing half of a streamed client body
pub struct BodySender {
    tx: mpsc::Sender<Result<Frame<Bytes>, BoxError>>,
    buf: BytesMut,
}

impl BodySender {
    /// Create a sender together with the body hyper will poll
    pub fn channel() -> (Self, ProxyBody) {
        let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
        let frames = stream::poll_fn(move |cx| rx.poll_recv(cx));
        let body = StreamBody::new(frames).boxed_unsync();

        (
            Self {
                tx,
                buf: BytesMut::new(),
            },
            body,
        )
    }

    async fn send(&self, frame: Frame<Bytes>) -> io::Result<()> {
        self.tx
            .send(Ok(frame))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client went away"))
    }

    /// Flush pending data, then send trailers as the final frame
    pub async fn send_trailers(&mut self, trailers: HeaderMap) -> io::Result<()> {
        self.flush().await?;
        self.send(Frame::trailers(trailers)).await
    }

    /// Abort the client body with an error
    pub async fn abort(&self, err: io::Error) {
        let _ = self.tx.send(Err(Box::new(err))).await;
    }

    /// Resolves once the client side of the body has been dropped
    pub fn closed(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let tx = self.tx.clone();
        async move { tx.closed().await }
    }
}

#[async_trait]
impl WriteFlush for BodySender {
    async fn write(&mut self, chunk: Bytes) -> io::Result<()> {
        self.buf.extend_from_slice(&chunk);
        if self.buf.len() >= MAX_BUFFERED {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let data = self.buf.split().freeze();
        self.send(Frame::data(data)).await
    }
}

#[async_trait]
impl<W: WriteFlush> WriteFlush for Arc<Mutex<W>> {
    async fn write(&mut self, chunk: Bytes) -> io::Result<()> {
        self.lock().await.write(chunk).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.lock().await.flush().await
    }
}

/// Writer whose buffered data is flushed at least every `latency`
pub struct MaxLatencyWriter<W: WriteFlush + 'static> {
    dst: Arc<Mutex<W>>,
    done: Option<oneshot::Sender<()>>,
    flush_loop: Option<JoinHandle<()>>,
}

impl<W: WriteFlush + 'static> MaxLatencyWriter<W> {
    /// Start the flush loop over a shared destination
    pub fn start(dst: Arc<Mutex<W>>, latency: Duration, on_exit: Option<FlushLoopExitHook>) -> Self {
        let (done_tx, done_rx) = oneshot::channel();
        let flush_loop = tokio::spawn(Self::flush_loop(dst.clone(), latency, done_rx, on_exit));

        Self {
            dst,
            done: Some(done_tx),
            flush_loop: Some(flush_loop),
        }
    }

    async fn flush_loop(
        dst: Arc<Mutex<W>>,
        latency: Duration,
        mut done: oneshot::Receiver<()>,
        on_exit: Option<FlushLoopExitHook>,
    ) {
        let mut ticker = interval_at(Instant::now() + latency, latency);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut done => {
                    if let Some(hook) = on_exit {
                        hook();
                    }
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = dst.lock().await.flush().await {
                        trace!("Periodic flush failed: {}", e);
                    }
                }
            }
        }
    }

    /// Signal the flush loop and wait for it to finish
    pub async fn stop(mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
        if let Some(handle) = self.flush_loop.take() {
            let _ = handle.await;
        }
    }
}

impl<W: WriteFlush + 'static> Drop for MaxLatencyWriter<W> {
    fn drop(&mut self) {
        // Dropped without stop(): end the loop without running the hook
        if let Some(handle) = self.flush_loop.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl<W: WriteFlush + 'static> WriteFlush for MaxLatencyWriter<W> {
    async fn write(&mut self, chunk: Bytes) -> io::Result<()> {
        self.dst.lock().await.write(chunk).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.dst.lock().await.flush().await
    }
}
