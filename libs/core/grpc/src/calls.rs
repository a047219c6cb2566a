//! Call-pattern drivers
//!
//! Thin wrappers over generated client methods that turn `tonic::Status`
//! into a classified [`CallError`] and take care of the plumbing for the
//! streaming shapes.
//!
//! ## Example
//! ```ignore
//! use grpc_client::calls;
//!
//! let mut client = CalculatorServiceClient::new(connection.unary_channel());
//! let sum = calls::unary(client.sum(SumRequest { first_number: 3, second_number: 10 })).await?;
//!
//! let mut client = CalculatorServiceClient::new(connection.streaming_channel());
//! let mut factors = calls::server_stream(client.prime_number_decomposition(request)).await?;
//! while let Some(factor) = factors.next().await {
//!     println!("{}", factor?.prime_factor);
//! }
//! ```

use std::future::Future;
use std::pin::Pin;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Code, Response, Status, Streaming};

use crate::error::{CallError, CallResult};
use crate::streaming::{
  OutboundStream, PendingInbound, SessionSummary, StreamClosed, StreamHandle, StreamingSession,
};

/// Outbound payloads buffered ahead of the transport
pub const STREAM_BUFFER: usize = 16;

/// Lazily delivered server-streamed responses
pub type ResponseStream<T> = Pin<Box<dyn Stream<Item = CallResult<T>> + Send>>;

/// Send one request, wait for one response or one classified error
pub async fn unary<T, F>(call: F) -> CallResult<T>
where
  F: Future<Output = Result<Response<T>, Status>>,
{
  match call.await {
    Ok(response) => Ok(response.into_inner()),
    Err(status) => {
      let error = CallError::from(status);
      tracing::debug!(target: "grpc_client", error = %error, "Unary call failed");
      Err(error)
    }
  }
}

/// Send one request and get the responses as a stream
///
/// The stream ends after the peer's last payload; a mid-stream failure is
/// yielded as an error item.
pub async fn server_stream<T, F>(call: F) -> CallResult<ResponseStream<T>>
where
  T: Send + 'static,
  F: Future<Output = Result<Response<Streaming<T>>, Status>>,
{
  let inbound = call.await?.into_inner();
  Ok(Box::pin(inbound.map(|item| item.map_err(CallError::from))))
}

/// Send half of a client-streaming call
#[derive(Debug)]
pub struct ClientStreamSender<Req> {
  tx: mpsc::Sender<Req>,
}

impl<Req: Send + 'static> ClientStreamSender<Req> {
  /// Queue one payload; fails once the call has already ended
  pub async fn send(&self, message: Req) -> Result<(), StreamClosed> {
    self.tx.send(message).await.map_err(|_| StreamClosed)
  }
}

#[async_trait::async_trait]
impl<Req: Send + 'static> OutboundStream<Req> for ClientStreamSender<Req> {
  async fn send(&mut self, message: Req) -> Result<(), StreamClosed> {
    ClientStreamSender::send(self, message).await
  }

  async fn close_send(self) {
    drop(self);
  }
}

/// Receive half of a client-streaming call
#[derive(Debug)]
pub struct ClientStreamFinisher<Resp> {
  call: JoinHandle<Result<Response<Resp>, Status>>,
}

impl<Resp> ClientStreamFinisher<Resp> {
  /// Half-close the stream and wait for the single aggregate response
  pub async fn close_and_receive<Req>(self, sender: ClientStreamSender<Req>) -> CallResult<Resp> {
    drop(sender);

    match self.call.await {
      Ok(Ok(response)) => Ok(response.into_inner()),
      Ok(Err(status)) => Err(status.into()),
      Err(join) if join.is_cancelled() => Err(CallError::transport(Code::Cancelled, "call was cancelled")),
      Err(join) => Err(CallError::transport(Code::Internal, join.to_string())),
    }
  }

  /// Drop the call without waiting for a response
  pub fn abort(&self) {
    self.call.abort();
  }
}

/// Start a client-streaming call
///
/// `open` receives the request stream and must return the generated
/// client's call future. The call runs in the background right away, so
/// `send` never waits on the response.
///
/// # Example
/// ```ignore
/// let client = CalculatorServiceClient::new(connection.streaming_channel());
/// let (sender, finisher) = calls::client_stream(move |requests| {
///     let mut client = client.clone();
///     async move { client.compute_average(requests).await }
/// });
/// for number in [1, 2, 3, 4] {
///     sender.send(ComputeAverageRequest { number }).await?;
/// }
/// let average = finisher.close_and_receive(sender).await?;
/// ```
pub fn client_stream<Req, Resp, Open, F>(
  open: Open,
) -> (ClientStreamSender<Req>, ClientStreamFinisher<Resp>)
where
  Req: Send + 'static,
  Resp: Send + 'static,
  Open: FnOnce(ReceiverStream<Req>) -> F,
  F: Future<Output = Result<Response<Resp>, Status>> + Send + 'static,
{
  let (tx, rx) = mpsc::channel(STREAM_BUFFER);
  let call = tokio::spawn(open(ReceiverStream::new(rx)));

  (ClientStreamSender { tx }, ClientStreamFinisher { call })
}

/// Run a bidirectional streaming call through a [`StreamingSession`]
///
/// Emits every item of `emit`, hands every response to `collect`, and
/// returns once the peer closes its side.
///
/// # Example
/// ```ignore
/// let mut client = CalculatorServiceClient::new(connection.streaming_channel());
/// let summary = calls::bidi_stream(
///     |requests| client.find_maximum(requests),
///     futures::stream::iter(numbers).map(|number| FindMaximumRequest { number }),
///     |response| println!("maximum so far: {}", response.maximum),
/// )
/// .await?;
/// ```
pub async fn bidi_stream<'a, Req, Resp, Open, F, E, C>(
  open: Open,
  emit: E,
  collect: C,
) -> CallResult<SessionSummary>
where
  Req: Send + 'static,
  Resp: Send + 'static,
  Open: FnOnce(ReceiverStream<Req>) -> F,
  F: Future<Output = Result<Response<Streaming<Resp>>, Status>> + Send + 'a,
  E: Stream<Item = Req> + Send + 'static,
  C: FnMut(Resp),
{
  bidi_stream_with(StreamingSession::new(), open, emit, collect).await
}

/// [`bidi_stream`] with an explicitly configured session
pub async fn bidi_stream_with<'a, Req, Resp, Open, F, E, C>(
  session: StreamingSession,
  open: Open,
  emit: E,
  collect: C,
) -> CallResult<SessionSummary>
where
  Req: Send + 'static,
  Resp: Send + 'static,
  Open: FnOnce(ReceiverStream<Req>) -> F,
  F: Future<Output = Result<Response<Streaming<Resp>>, Status>> + Send + 'a,
  E: Stream<Item = Req> + Send + 'static,
  C: FnMut(Resp),
{
  let (tx, rx) = mpsc::channel(STREAM_BUFFER);
  let inbound = PendingInbound::new(open(ReceiverStream::new(rx)));

  session.run(StreamHandle::new(tx, inbound), emit, collect).await
}
