//! Bidirectional streaming coordinator
//!
//! A [`StreamingSession`] drives one bidi RPC with two independent halves:
//! an emitter task that sends every outbound payload and then half-closes,
//! and a collector that receives inbound payloads until the peer ends the
//! stream. The session completes when the collector does; the emitter may
//! still be running at that point and is handed back as an
//! [`EmitterHandle`].
//!
//! ## Example
//! ```ignore
//! use grpc_client::streaming::{StreamHandle, StreamingSession};
//!
//! let (tx, rx) = tokio::sync::mpsc::channel(16);
//! let inbound = client.find_maximum(ReceiverStream::new(rx)).await?.into_inner();
//!
//! let summary = StreamingSession::new()
//!     .run(StreamHandle::new(tx, inbound), requests, |response| {
//!         println!("new maximum: {}", response.maximum);
//!     })
//!     .await?;
//! ```

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tonic::Status;

use crate::error::{CallError, CallResult};

/// The peer is no longer accepting outbound payloads
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("stream closed by peer")]
pub struct StreamClosed;

/// Send direction of a stream
#[async_trait]
pub trait OutboundStream<T: Send + 'static>: Send + 'static {
    async fn send(&mut self, message: T) -> Result<(), StreamClosed>;

    /// Signal that no more payloads follow (half-close)
    async fn close_send(self)
    where
        Self: Sized;
}

/// Receive direction of a stream
///
/// `Ok(None)` is the peer's normal end of stream.
#[async_trait]
pub trait InboundStream<T: Send>: Send {
    async fn receive(&mut self) -> CallResult<Option<T>>;
}

#[async_trait]
impl<T: Send + 'static> OutboundStream<T> for mpsc::Sender<T> {
    async fn send(&mut self, message: T) -> Result<(), StreamClosed> {
        mpsc::Sender::send(self, message)
            .await
            .map_err(|_| StreamClosed)
    }

    async fn close_send(self) {
        // The request body ends once every sender is gone
        drop(self);
    }
}

#[async_trait]
impl<T: Send + 'static> InboundStream<T> for tonic::codec::Streaming<T> {
    async fn receive(&mut self) -> CallResult<Option<T>> {
        Ok(self.message().await?)
    }
}

#[async_trait]
impl<T: Send> InboundStream<T> for mpsc::Receiver<CallResult<T>> {
    async fn receive(&mut self) -> CallResult<Option<T>> {
        self.recv().await.transpose()
    }
}

/// Inbound half whose response stream is still being opened
///
/// Lets the emitter start sending before the peer has answered with
/// response headers.
pub struct PendingInbound<'a, T> {
    state: PendingState<'a, T>,
}

enum PendingState<'a, T> {
    Opening(BoxFuture<'a, Result<tonic::Response<tonic::Streaming<T>>, Status>>),
    Open(tonic::Streaming<T>),
    Failed,
}

impl<'a, T> PendingInbound<'a, T> {
    pub fn new<F>(open: F) -> Self
    where
        F: std::future::Future<Output = Result<tonic::Response<tonic::Streaming<T>>, Status>>
            + Send
            + 'a,
    {
        Self {
            state: PendingState::Opening(Box::pin(open)),
        }
    }
}

#[async_trait]
impl<'a, T: Send + 'static> InboundStream<T> for PendingInbound<'a, T> {
    async fn receive(&mut self) -> CallResult<Option<T>> {
        if let PendingState::Opening(open) = &mut self.state {
            let opened = open.await;
            match opened {
                Ok(response) => self.state = PendingState::Open(response.into_inner()),
                Err(status) => {
                    self.state = PendingState::Failed;
                    return Err(status.into());
                }
            }
        }

        match &mut self.state {
            PendingState::Open(inbound) => inbound.receive().await,
            PendingState::Opening(_) | PendingState::Failed => Ok(None),
        }
    }
}

/// Both directions of one bidi stream, owned by a single session
pub struct StreamHandle<O, I> {
    outbound: O,
    inbound: I,
}

impl<O, I> StreamHandle<O, I> {
    pub fn new(outbound: O, inbound: I) -> Self {
        Self { outbound, inbound }
    }

    pub fn into_parts(self) -> (O, I) {
        (self.outbound, self.inbound)
    }
}

/// The emitter half of a finished session
#[derive(Debug)]
pub struct EmitterHandle {
    task: JoinHandle<usize>,
}

impl EmitterHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop sending early
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Wait for the emitter; returns how many payloads it sent, `None` if it was aborted
    pub async fn finished(self) -> Option<usize> {
        self.task.await.ok()
    }
}

/// Result of a completed session
#[derive(Debug)]
pub struct SessionSummary {
    /// Payloads delivered to the collector
    pub received: usize,
    pub emitter: EmitterHandle,
}

/// Coordinator for one bidirectional stream
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamingSession {
    cancel_emitter_on_failure: bool,
}

impl StreamingSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort the emitter when the collector fails
    ///
    /// Off by default: a receive failure leaves the emitter running and the
    /// caller decides whether to stop it.
    pub fn cancel_emitter_on_failure(mut self, cancel: bool) -> Self {
        self.cancel_emitter_on_failure = cancel;
        self
    }

    /// Run the session until the peer ends the inbound stream
    ///
    /// The emitter is spawned first so sends never wait on the first
    /// receive. Every inbound payload is handed to `collect` as it arrives.
    pub async fn run<O, I, Req, Resp, E, C>(
        self,
        handle: StreamHandle<O, I>,
        emit: E,
        mut collect: C,
    ) -> CallResult<SessionSummary>
    where
        O: OutboundStream<Req>,
        I: InboundStream<Resp>,
        Req: Send + 'static,
        Resp: Send,
        E: Stream<Item = Req> + Send + 'static,
        C: FnMut(Resp),
    {
        let (outbound, mut inbound) = handle.into_parts();
        let emitter = tokio::spawn(emit_all(outbound, emit));

        let mut received = 0;
        loop {
            match inbound.receive().await {
                Ok(Some(message)) => {
                    received += 1;
                    collect(message);
                }
                Ok(None) => break,
                Err(error) => {
                    // A broken receive direction ends the whole exchange
                    let error = CallError::transport(error.code(), error.message());
                    tracing::warn!(
                        target: "grpc_client",
                        error = %error,
                        received,
                        "Bidi stream receive failed"
                    );
                    if self.cancel_emitter_on_failure {
                        emitter.abort();
                    }
                    return Err(error);
                }
            }
        }

        tracing::debug!(target: "grpc_client", received, "Peer closed bidi stream");
        Ok(SessionSummary {
            received,
            emitter: EmitterHandle { task: emitter },
        })
    }
}

async fn emit_all<O, Req, E>(mut outbound: O, emit: E) -> usize
where
    O: OutboundStream<Req>,
    Req: Send + 'static,
    E: Stream<Item = Req> + Send + 'static,
{
    let mut emit = Box::pin(emit);
    let mut sent = 0;

    while let Some(message) = emit.next().await {
        if outbound.send(message).await.is_err() {
            tracing::debug!(target: "grpc_client", sent, "Peer ended the stream, emitter stopping");
            return sent;
        }
        sent += 1;
    }

    outbound.close_send().await;
    tracing::debug!(target: "grpc_client", sent, "Emitter half-closed the stream");
    sent
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tonic::Code;

    fn pipe<T: Send + 'static>(
        capacity: usize,
    ) -> (mpsc::Sender<T>, mpsc::Receiver<T>) {
        mpsc::channel(capacity)
    }

    #[tokio::test]
    async fn test_collects_in_peer_order() {
        let (out_tx, _out_rx) = pipe::<i32>(8);
        let (in_tx, in_rx) = pipe::<CallResult<i32>>(8);
        for value in [4, 7, 19, 32] {
            in_tx.send(Ok(value)).await.unwrap();
        }
        drop(in_tx);

        let mut collected = Vec::new();
        let summary = StreamingSession::new()
            .run(
                StreamHandle::new(out_tx, in_rx),
                futures::stream::iter(vec![1, 2, 3]),
                |value| collected.push(value),
            )
            .await
            .unwrap();

        assert_eq!(collected, vec![4, 7, 19, 32]);
        assert_eq!(summary.received, 4);
    }

    #[tokio::test]
    async fn test_emitter_sends_everything_then_half_closes() {
        let (out_tx, mut out_rx) = pipe::<i32>(8);
        let (in_tx, in_rx) = pipe::<CallResult<i32>>(1);

        let session = tokio::spawn(StreamingSession::new().run(
            StreamHandle::new(out_tx, in_rx),
            futures::stream::iter(vec![4, 7, 2]),
            |_| {},
        ));

        let mut sent = Vec::new();
        while let Some(value) = out_rx.recv().await {
            sent.push(value);
        }
        // recv returning None means the emitter dropped its sender
        assert_eq!(sent, vec![4, 7, 2]);

        drop(in_tx);
        let summary = session.await.unwrap().unwrap();
        assert_eq!(summary.emitter.finished().await, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_completes_when_peer_closes_before_emitter_finishes() {
        let (out_tx, _out_rx) = pipe::<i32>(8);
        let (in_tx, in_rx) = pipe::<CallResult<i32>>(8);
        in_tx.send(Ok(4)).await.unwrap();
        drop(in_tx);

        let slow = futures::stream::iter(vec![4, 7, 2, 19]).then(|value| async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            value
        });

        let summary = StreamingSession::new()
            .run(StreamHandle::new(out_tx, in_rx), slow, |_| {})
            .await
            .unwrap();

        assert_eq!(summary.received, 1);
        assert!(!summary.emitter.is_finished());
        summary.emitter.abort();
        assert_eq!(summary.emitter.finished().await, None);
    }

    #[tokio::test]
    async fn test_emitter_stops_quietly_when_peer_is_gone() {
        let (out_tx, out_rx) = pipe::<i32>(1);
        drop(out_rx);
        let (in_tx, in_rx) = pipe::<CallResult<i32>>(1);
        drop(in_tx);

        let summary = StreamingSession::new()
            .run(
                StreamHandle::new(out_tx, in_rx),
                futures::stream::iter(vec![1, 2, 3]),
                |_: i32| {},
            )
            .await
            .unwrap();

        assert_eq!(summary.emitter.finished().await, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_failure_leaves_emitter_running() {
        let (out_tx, mut out_rx) = pipe::<i32>(8);
        let (in_tx, in_rx) = pipe::<CallResult<i32>>(8);
        in_tx
            .send(Err(CallError::transport(Code::Unavailable, "connection reset")))
            .await
            .unwrap();

        let slow = futures::stream::iter(vec![1, 2]).then(|value| async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            value
        });

        let error = StreamingSession::new()
            .run(StreamHandle::new(out_tx, in_rx), slow, |_| {})
            .await
            .unwrap_err();
        assert!(error.is_transport());

        // The detached emitter still delivers its payloads
        assert_eq!(out_rx.recv().await, Some(1));
        assert_eq!(out_rx.recv().await, Some(2));
        assert_eq!(out_rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_failure_can_cancel_emitter() {
        let (out_tx, mut out_rx) = pipe::<i32>(8);
        let (in_tx, in_rx) = pipe::<CallResult<i32>>(8);
        in_tx
            .send(Err(CallError::transport(Code::Unavailable, "connection reset")))
            .await
            .unwrap();

        let slow = futures::stream::iter(vec![1, 2]).then(|value| async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            value
        });

        let result = StreamingSession::new()
            .cancel_emitter_on_failure(true)
            .run(StreamHandle::new(out_tx, in_rx), slow, |_| {})
            .await;
        assert!(result.is_err());

        // Aborting drops the sender without anything having been sent
        assert_eq!(out_rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_receive_failure_is_reported_as_transport() {
        let (out_tx, _out_rx) = pipe::<i32>(8);
        let (in_tx, in_rx) = pipe::<CallResult<i32>>(8);
        in_tx.send(Ok(1)).await.unwrap();
        in_tx
            .send(Err(CallError::application(Code::ResourceExhausted, "too many numbers")))
            .await
            .unwrap();

        let mut collected = Vec::new();
        let error = StreamingSession::new()
            .run(
                StreamHandle::new(out_tx, in_rx),
                futures::stream::empty(),
                |value| collected.push(value),
            )
            .await
            .unwrap_err();

        assert_eq!(collected, vec![1]);
        assert_eq!(error, CallError::transport(Code::ResourceExhausted, "too many numbers"));
    }

    #[tokio::test]
    async fn test_pending_inbound_surfaces_open_failure() {
        let mut inbound: PendingInbound<'_, i32> =
            PendingInbound::new(async { Err(Status::invalid_argument("bad first message")) });

        let error = inbound.receive().await.unwrap_err();
        assert_eq!(error, CallError::application(Code::InvalidArgument, "bad first message"));
    }
}
