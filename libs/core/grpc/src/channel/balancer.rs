//! Round-robin picking over ready subchannels
//!
//! [`BalancedChannel`] is the `tower::Service` handed to generated clients.
//! Each call picks the next ready subchannel from the latest [`PickerState`]
//! published by the connector, waiting for one when the call is allowed to,
//! and enforces the call's `grpc-timeout` around both the wait and the
//! dispatch. A wait-for-ready call that hits a connection the server has
//! gone away from is sent again once another subchannel is ready.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use http::HeaderValue;
use http_body_util::{BodyExt, Full};
use tokio::sync::{Notify, watch};
use tonic::body::Body;
use tonic::transport::Channel;
use tonic::{Code, ConnectError, Status};
use tower::ServiceExt;

use super::connector::ConnectorGuard;
use crate::interceptors::{GRPC_TIMEOUT_HEADER, WaitForReady};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Aggregated connectivity of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
  /// At least one subchannel is dialing and none is ready
  Connecting,
  /// At least one subchannel can take calls
  Ready,
  /// Every subchannel failed its last dial and is backing off
  TransientFailure,
  /// The connection was closed
  Shutdown,
}

/// One live HTTP/2 connection to a resolved address
#[derive(Debug, Clone)]
pub struct Subchannel {
  pub addr: SocketAddr,
  pub(crate) channel: Channel,
  pub(crate) broken: Arc<Notify>,
}

impl Subchannel {
  /// Take this subchannel out of rotation and make its task redial
  pub(crate) fn mark_broken(&self) {
    self.broken.notify_one();
  }

  /// Whether both handles refer to the same dialed connection
  pub(crate) fn is_same(&self, other: &Subchannel) -> bool {
    Arc::ptr_eq(&self.broken, &other.broken)
  }
}

/// Snapshot published by the connector on every subchannel transition
#[derive(Debug, Clone)]
pub struct PickerState {
  pub state: ConnectivityState,
  pub ready: Vec<Subchannel>,
}

impl PickerState {
  pub(crate) fn connecting() -> Self {
    Self {
      state: ConnectivityState::Connecting,
      ready: Vec::new(),
    }
  }

  pub(crate) fn shutdown() -> Self {
    Self {
      state: ConnectivityState::Shutdown,
      ready: Vec::new(),
    }
  }
}

/// Load-balanced channel over every ready subchannel of a connection
///
/// Cheap to clone; clones share the round-robin counter and keep the
/// connection's background tasks alive.
#[derive(Clone)]
pub struct BalancedChannel {
  picker: watch::Receiver<Arc<PickerState>>,
  next: Arc<AtomicUsize>,
  _guard: Arc<ConnectorGuard>,
}

impl std::fmt::Debug for BalancedChannel {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("BalancedChannel")
      .field("state", &self.picker.borrow().state)
      .finish()
  }
}

impl BalancedChannel {
  pub(crate) fn new(
    picker: watch::Receiver<Arc<PickerState>>,
    next: Arc<AtomicUsize>,
    guard: Arc<ConnectorGuard>,
  ) -> Self {
    Self {
      picker,
      next,
      _guard: guard,
    }
  }

  /// Next ready subchannel
  ///
  /// Wait-for-ready calls wait until one shows up. Fail-fast calls wait only
  /// while the connection is still connecting and fail with `Unavailable` in
  /// transient failure. Both fail with `Cancelled` once the connection is
  /// closed.
  pub(crate) async fn pick(&self, wait_for_ready: bool) -> Result<Subchannel, Status> {
    let mut picker = self.picker.clone();

    loop {
      let current = picker.borrow_and_update().clone();

      match current.state {
        ConnectivityState::Shutdown => return Err(Status::cancelled("connection is closed")),
        _ if !current.ready.is_empty() => {
          let index = self.next.fetch_add(1, Ordering::Relaxed) % current.ready.len();
          return Ok(current.ready[index].clone());
        }
        ConnectivityState::TransientFailure if !wait_for_ready => {
          return Err(Status::unavailable(
            "no ready subchannel, connection is in transient failure",
          ));
        }
        _ => {}
      }

      if picker.changed().await.is_err() {
        return Err(Status::cancelled("connection is closed"));
      }
    }
  }

  /// Wait until `subchannel` is no longer offered for picking
  async fn evicted(&self, subchannel: &Subchannel) -> Result<(), Status> {
    let mut picker = self.picker.clone();

    loop {
      let offered = picker
        .borrow_and_update()
        .ready
        .iter()
        .any(|ready| ready.is_same(subchannel));
      if !offered {
        return Ok(());
      }
      if picker.changed().await.is_err() {
        return Err(Status::cancelled("connection is closed"));
      }
    }
  }

  async fn dispatch(
    self,
    request: http::Request<Body>,
    wait_for_ready: bool,
  ) -> Result<http::Response<Body>, Status> {
    if !wait_for_ready {
      let subchannel = self.pick(false).await?;
      return send(&subchannel, request).await.map_err(Failure::into_status);
    }

    // Wait-for-ready calls are unary, their body is a single message
    let (parts, body) = request.into_parts();
    let message = body.collect().await?.to_bytes();

    loop {
      let subchannel = self.pick(true).await?;
      let body = Body::new(Full::new(message.clone()));
      let request = http::Request::from_parts(parts.clone(), body);

      match send(&subchannel, request).await {
        Ok(response) => return Ok(response),
        Err(Failure::Unsent(status)) => {
          tracing::debug!(
            target: "grpc_client",
            addr = %subchannel.addr,
            error = %status,
            "Call never reached the server, waiting for a ready subchannel"
          );
          self.evicted(&subchannel).await?;
        }
        Err(Failure::Failed(status)) => return Err(status),
      }
    }
  }
}

/// How a single attempt on a subchannel failed
enum Failure {
  /// The connection could not be re-established, nothing was written
  Unsent(Status),
  Failed(Status),
}

impl Failure {
  fn into_status(self) -> Status {
    match self {
      Self::Unsent(status) | Self::Failed(status) => status,
    }
  }
}

/// Send `request` over `subchannel`, taking it out of rotation on transport failure
async fn send(
  subchannel: &Subchannel,
  request: http::Request<Body>,
) -> Result<http::Response<Body>, Failure> {
  let error = match subchannel.channel.clone().oneshot(request).await {
    Ok(response) => return Ok(response),
    Err(error) => error,
  };

  let unsent = failed_to_connect(&error);
  let status = Status::from_error(Box::new(error));
  // Timeouts are the call's problem, not the connection's
  if status.code() != Code::Cancelled {
    tracing::warn!(
      target: "grpc_client",
      addr = %subchannel.addr,
      error = %status,
      "Transport failure, taking subchannel out of rotation"
    );
    subchannel.mark_broken();
  }

  if unsent {
    Err(Failure::Unsent(status))
  } else {
    Err(Failure::Failed(status))
  }
}

/// Whether the failure happened while dialing, before the request was written
fn failed_to_connect(error: &(dyn std::error::Error + 'static)) -> bool {
  let mut current = Some(error);

  while let Some(error) = current {
    if error.downcast_ref::<ConnectError>().is_some() {
      return true;
    }
    current = error.source();
  }
  false
}

impl tower::Service<http::Request<Body>> for BalancedChannel {
  type Response = http::Response<Body>;
  type Error = BoxError;
  type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

  fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
    // Readiness is decided per call in `pick`
    Poll::Ready(Ok(()))
  }

  fn call(&mut self, request: http::Request<Body>) -> Self::Future {
    let this = self.clone();

    Box::pin(async move {
      let deadline = request
        .headers()
        .get(GRPC_TIMEOUT_HEADER)
        .and_then(parse_grpc_timeout);
      let wait_for_ready = request.extensions().get::<WaitForReady>().is_some();

      let dispatch = this.dispatch(request, wait_for_ready);
      let result = match deadline {
        Some(timeout) => match tokio::time::timeout(timeout, dispatch).await {
          Ok(result) => result,
          Err(_) => Err(Status::deadline_exceeded(format!(
            "deadline of {timeout:?} exceeded"
          ))),
        },
        None => dispatch.await,
      };

      result.map_err(Into::into)
    })
  }
}

/// Parse a `grpc-timeout` value such as `1000000u` or `5S`
pub(crate) fn parse_grpc_timeout(value: &HeaderValue) -> Option<Duration> {
  let value = value.to_str().ok()?;
  if value.len() < 2 || value.len() > 9 {
    return None;
  }

  let (digits, unit) = value.split_at(value.len() - 1);
  let amount: u64 = digits.parse().ok()?;

  let duration = match unit {
    "H" => Duration::from_secs(amount.checked_mul(3600)?),
    "M" => Duration::from_secs(amount.checked_mul(60)?),
    "S" => Duration::from_secs(amount),
    "m" => Duration::from_millis(amount),
    "u" => Duration::from_micros(amount),
    "n" => Duration::from_nanos(amount),
    _ => return None,
  };
  Some(duration)
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::sync::mpsc;
  use tokio_test::{assert_pending, assert_ready, task};

  fn guard() -> Arc<ConnectorGuard> {
    Arc::new(ConnectorGuard::detached())
  }

  fn subchannel(port: u16) -> Subchannel {
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    Subchannel {
      addr,
      channel: tonic::transport::Endpoint::from_shared(format!("http://{addr}"))
        .unwrap()
        .connect_lazy(),
      broken: Arc::new(Notify::new()),
    }
  }

  fn state(state: ConnectivityState, ready: Vec<Subchannel>) -> Arc<PickerState> {
    Arc::new(PickerState { state, ready })
  }

  #[test]
  fn test_parse_grpc_timeout_units() {
    let parse = |v: &'static str| parse_grpc_timeout(&HeaderValue::from_static(v));

    assert_eq!(parse("1000000u"), Some(Duration::from_secs(1)));
    assert_eq!(parse("2H"), Some(Duration::from_secs(7200)));
    assert_eq!(parse("3M"), Some(Duration::from_secs(180)));
    assert_eq!(parse("5S"), Some(Duration::from_secs(5)));
    assert_eq!(parse("250m"), Some(Duration::from_millis(250)));
    assert_eq!(parse("99n"), Some(Duration::from_nanos(99)));
  }

  #[test]
  fn test_parse_grpc_timeout_rejects_garbage() {
    let parse = |v: &'static str| parse_grpc_timeout(&HeaderValue::from_static(v));

    assert_eq!(parse("S"), None);
    assert_eq!(parse("10x"), None);
    assert_eq!(parse("-1S"), None);
    assert_eq!(parse("123456789S"), None);
  }

  #[tokio::test]
  async fn test_round_robin_over_ready_subchannels() {
    let (_tx, rx) = watch::channel(state(
      ConnectivityState::Ready,
      vec![subchannel(7001), subchannel(7002), subchannel(7003)],
    ));
    let channel = BalancedChannel::new(rx, Arc::new(AtomicUsize::new(0)), guard());

    let mut ports = Vec::new();
    for _ in 0..6 {
      ports.push(channel.pick(false).await.unwrap().addr.port());
    }
    assert_eq!(ports, vec![7001, 7002, 7003, 7001, 7002, 7003]);
  }

  #[tokio::test]
  async fn test_clones_share_the_counter() {
    let (_tx, rx) = watch::channel(state(
      ConnectivityState::Ready,
      vec![subchannel(7001), subchannel(7002)],
    ));
    let first = BalancedChannel::new(rx, Arc::new(AtomicUsize::new(0)), guard());
    let second = first.clone();

    assert_eq!(first.pick(false).await.unwrap().addr.port(), 7001);
    assert_eq!(second.pick(false).await.unwrap().addr.port(), 7002);
  }

  #[tokio::test]
  async fn test_fail_fast_in_transient_failure() {
    let (_tx, rx) = watch::channel(state(ConnectivityState::TransientFailure, vec![]));
    let channel = BalancedChannel::new(rx, Arc::new(AtomicUsize::new(0)), guard());

    let status = channel.pick(false).await.unwrap_err();
    assert_eq!(status.code(), Code::Unavailable);
  }

  #[tokio::test]
  async fn test_fail_fast_waits_while_connecting() {
    let (tx, rx) = watch::channel(state(ConnectivityState::Connecting, vec![]));
    let channel = BalancedChannel::new(rx, Arc::new(AtomicUsize::new(0)), guard());

    let mut pick = task::spawn(channel.pick(false));
    assert_pending!(pick.poll());

    tx.send_replace(state(ConnectivityState::Ready, vec![subchannel(7001)]));
    assert!(pick.is_woken());
    let picked = assert_ready!(pick.poll()).unwrap();
    assert_eq!(picked.addr.port(), 7001);
  }

  #[tokio::test]
  async fn test_wait_for_ready_rides_out_transient_failure() {
    let (tx, rx) = watch::channel(state(ConnectivityState::TransientFailure, vec![]));
    let channel = BalancedChannel::new(rx, Arc::new(AtomicUsize::new(0)), guard());

    let mut pick = task::spawn(channel.pick(true));
    assert_pending!(pick.poll());

    tx.send_replace(state(ConnectivityState::Connecting, vec![]));
    assert_pending!(pick.poll());

    tx.send_replace(state(ConnectivityState::Ready, vec![subchannel(7002)]));
    let picked = assert_ready!(pick.poll()).unwrap();
    assert_eq!(picked.addr.port(), 7002);
  }

  #[tokio::test]
  async fn test_shutdown_cancels_waiting_picks() {
    let (tx, rx) = watch::channel(state(ConnectivityState::Connecting, vec![]));
    let channel = BalancedChannel::new(rx, Arc::new(AtomicUsize::new(0)), guard());

    let mut pick = task::spawn(channel.pick(true));
    assert_pending!(pick.poll());

    tx.send_replace(Arc::new(PickerState::shutdown()));
    let status = assert_ready!(pick.poll()).unwrap_err();
    assert_eq!(status.code(), Code::Cancelled);
  }

  #[tokio::test]
  async fn test_mark_broken_wakes_subchannel_task() {
    let sub = subchannel(7001);
    let broken = sub.broken.clone();
    let (done_tx, mut done_rx) = mpsc::channel(1);

    tokio::spawn(async move {
      broken.notified().await;
      let _ = done_tx.send(()).await;
    });

    sub.mark_broken();
    assert!(done_rx.recv().await.is_some());
  }

  #[test]
  fn test_failed_to_connect_walks_the_source_chain() {
    #[derive(Debug, thiserror::Error)]
    #[error("transport error")]
    struct Transport(#[source] ConnectError);

    let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
    assert!(failed_to_connect(&Transport(ConnectError(Box::new(refused)))));

    let reset = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
    assert!(!failed_to_connect(&reset));
  }

  #[tokio::test]
  async fn test_evicted_waits_for_the_subchannel_to_leave() {
    let dead = subchannel(7001);
    let (tx, rx) = watch::channel(state(
      ConnectivityState::Ready,
      vec![dead.clone(), subchannel(7002)],
    ));
    let channel = BalancedChannel::new(rx, Arc::new(AtomicUsize::new(0)), guard());

    let mut evicted = task::spawn(channel.evicted(&dead));
    assert_pending!(evicted.poll());

    // A redialed connection to the same address is a different subchannel
    tx.send_replace(state(
      ConnectivityState::Ready,
      vec![subchannel(7001), subchannel(7002)],
    ));
    assert_ready!(evicted.poll()).unwrap();
  }

  #[tokio::test]
  async fn test_wait_for_ready_call_outlives_a_dead_connection() {
    let port = std::net::TcpListener::bind("127.0.0.1:0")
      .unwrap()
      .local_addr()
      .unwrap()
      .port();
    let dead = subchannel(port);
    let broken = dead.broken.clone();
    let (tx, rx) = watch::channel(state(ConnectivityState::Ready, vec![dead]));
    let mut channel = BalancedChannel::new(rx, Arc::new(AtomicUsize::new(0)), guard());

    let mut request = http::Request::new(Body::empty());
    request
      .headers_mut()
      .insert(GRPC_TIMEOUT_HEADER, HeaderValue::from_static("10S"));
    request.extensions_mut().insert(WaitForReady);
    let call = tokio::spawn(tower::Service::call(&mut channel, request));

    tokio::time::timeout(Duration::from_secs(5), broken.notified())
      .await
      .expect("dead subchannel was not marked broken");
    tx.send_replace(state(ConnectivityState::Connecting, vec![]));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!call.is_finished());

    tx.send_replace(Arc::new(PickerState::shutdown()));
    let status = Status::from_error(call.await.unwrap().unwrap_err());
    assert_eq!(status.code(), Code::Cancelled);
  }

  #[tokio::test(start_paused = true)]
  async fn test_deadline_covers_the_wait() {
    let (_tx, rx) = watch::channel(state(ConnectivityState::Connecting, vec![]));
    let mut channel = BalancedChannel::new(rx, Arc::new(AtomicUsize::new(0)), guard());

    let mut request = http::Request::new(Body::empty());
    request
      .headers_mut()
      .insert(GRPC_TIMEOUT_HEADER, HeaderValue::from_static("1000000u"));
    request.extensions_mut().insert(WaitForReady);

    let error = tower::Service::call(&mut channel, request).await.unwrap_err();
    let status = Status::from_error(error);
    assert_eq!(status.code(), Code::DeadlineExceeded);
  }
}
