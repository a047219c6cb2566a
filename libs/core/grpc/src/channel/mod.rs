pub mod backoff;
pub mod balancer;
pub mod config;
pub(crate) mod connector;
pub mod resolver;

pub use backoff::BackoffPolicy;
pub use balancer::{BalancedChannel, ConnectivityState, PickerState, Subchannel};
pub use config::{
  BuildOptions, ConnectionOptions, DEFAULT_MAX_BACKOFF, DialPlan, MIN_CONNECT_TIMEOUT, TlsSettings,
  TransportOption, TransportSecurity,
};
pub use connector::RESOLVE_INTERVAL;
pub use resolver::{DnsResolver, LoadBalancingPolicy, ResolutionScheme, ResolvedTarget, Resolver};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::watch;
use tonic::service::interceptor::InterceptedService;

use crate::error::{GrpcError, GrpcResult};
use crate::interceptors::{
  ComposedInterceptor, RequestIdInterceptor, UnaryPolicy, WaitForReadyInterceptor,
  compose_interceptors,
};
use connector::{Connector, ConnectorGuard};

/// Channel for unary calls: request ids plus the connection's unary policy
pub type UnaryChannel =
  InterceptedService<BalancedChannel, ComposedInterceptor<RequestIdInterceptor, UnaryPolicy>>;

/// Channel for streaming calls: request ids only
pub type StreamingChannel = InterceptedService<BalancedChannel, RequestIdInterceptor>;

/// Creates a connection with the default options
///
/// ## Example
/// ```ignore
/// use grpc_client::create_connection;
/// use rpc::calculator::calculator_service_client::CalculatorServiceClient;
///
/// let connection = create_connection("localhost:50051").await?;
/// let mut client = CalculatorServiceClient::new(connection.unary_channel());
/// ```
pub async fn create_connection(target: &str) -> GrpcResult<Connection> {
  Connection::build(target, BuildOptions::default()).await
}

/// Creates a connection with explicit options
///
/// ## Example
/// ```ignore
/// use grpc_client::{create_connection_with_options, ConnectionOptions};
/// use std::time::Duration;
///
/// let options = ConnectionOptions::new().with_max_backoff(Duration::from_secs(5));
/// let connection = create_connection_with_options("dns:///calculator:50051", options.into()).await?;
/// ```
pub async fn create_connection_with_options(
  target: &str,
  options: BuildOptions,
) -> GrpcResult<Connection> {
  Connection::build(target, options).await
}

/// Shared handle to a live, self-healing connection
///
/// Dialing happens in the background: `build` returns once the target is
/// parsed and resolved, and calls wait for (or fail on) readiness according
/// to their policy. Every resolved address gets its own HTTP/2 connection and
/// calls are spread over the ready ones round-robin. Broken connections are
/// redialed with the backoff derived from
/// [`ConnectionOptions::max_backoff`].
///
/// Cloning is cheap. Channels handed out by [`unary_channel`](Self::unary_channel)
/// and [`streaming_channel`](Self::streaming_channel) keep the background
/// tasks alive until they are dropped or [`close`](Self::close) is called.
#[derive(Clone)]
pub struct Connection {
  inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
  plan: Arc<DialPlan>,
  publisher: Arc<watch::Sender<Arc<PickerState>>>,
  picker: watch::Receiver<Arc<PickerState>>,
  next: Arc<AtomicUsize>,
  guard: Arc<ConnectorGuard>,
  closed: AtomicBool,
}

impl std::fmt::Debug for Connection {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Connection")
      .field("target", &self.inner.plan.target.target)
      .field("state", &self.state())
      .finish()
  }
}

impl Connection {
  /// Build a connection using the system DNS resolver
  pub async fn build(target: &str, options: BuildOptions) -> GrpcResult<Self> {
    Self::build_with_resolver(target, options, Arc::new(DnsResolver)).await
  }

  /// Build a connection with a custom resolver
  ///
  /// The resolver is consulted once before returning and then periodically
  /// by the background connector.
  pub async fn build_with_resolver(
    target: &str,
    options: BuildOptions,
    resolver: Arc<dyn Resolver>,
  ) -> GrpcResult<Self> {
    let plan = Arc::new(DialPlan::resolve(target, options).map_err(|e| {
      tracing::error!(target: "grpc_client", target_name = %target, error = %e, "Invalid connection configuration");
      e
    })?);

    let addrs = resolver
      .resolve(&plan.target)
      .await
      .map_err(|source| GrpcError::Resolution {
        target: plan.target.target.clone(),
        source,
      })?;
    let Some(first) = addrs.first() else {
      return Err(GrpcError::NoAddresses(plan.target.target.clone()));
    };

    // Surface endpoint construction problems now rather than in the dial loop
    plan.endpoint_for(*first)?;

    let (publisher, picker) = watch::channel(Arc::new(PickerState::connecting()));
    let publisher = Arc::new(publisher);

    tracing::debug!(
      target: "grpc_client",
      target_name = %plan.target.target,
      addresses = ?addrs,
      policy = plan.target.policy.name(),
      max_backoff = ?plan.options.max_backoff,
      fail_fast = plan.options.fail_fast,
      "Creating gRPC connection"
    );

    let guard = Arc::new(Connector::spawn(
      plan.clone(),
      resolver,
      publisher.clone(),
      addrs,
    ));

    Ok(Self {
      inner: Arc::new(ConnectionInner {
        plan,
        publisher,
        picker,
        next: Arc::new(AtomicUsize::new(0)),
        guard,
        closed: AtomicBool::new(false),
      }),
    })
  }

  /// Current aggregated connectivity state
  pub fn state(&self) -> ConnectivityState {
    self.inner.picker.borrow().state
  }

  /// Addresses currently in the round-robin rotation
  pub fn ready_addresses(&self) -> Vec<std::net::SocketAddr> {
    self
      .inner
      .picker
      .borrow()
      .ready
      .iter()
      .map(|subchannel| subchannel.addr)
      .collect()
  }

  /// Wait until the state differs from `from` and return the new state
  pub async fn wait_for_state_change(&self, from: ConnectivityState) -> ConnectivityState {
    let mut picker = self.inner.picker.clone();
    match picker.wait_for(|current| current.state != from).await {
      Ok(current) => current.state,
      Err(_) => ConnectivityState::Shutdown,
    }
  }

  /// Resolved options in effect
  pub fn options(&self) -> ConnectionOptions {
    self.inner.plan.options
  }

  /// The full dial plan this connection was built from
  pub fn plan(&self) -> &DialPlan {
    &self.inner.plan
  }

  /// The bare load-balanced channel, without interceptors
  pub fn channel(&self) -> BalancedChannel {
    BalancedChannel::new(
      self.inner.picker.clone(),
      self.inner.next.clone(),
      self.inner.guard.clone(),
    )
  }

  /// Channel to use for unary calls
  pub fn unary_channel(&self) -> UnaryChannel {
    InterceptedService::new(
      self.channel(),
      compose_interceptors(RequestIdInterceptor::new(), self.inner.plan.unary_policy),
    )
  }

  /// Channel to use for streaming calls
  pub fn streaming_channel(&self) -> StreamingChannel {
    InterceptedService::new(self.channel(), RequestIdInterceptor::new())
  }

  /// The deadline-enforcing interceptor installed on unary calls, if any
  pub fn unary_interceptor(&self) -> Option<WaitForReadyInterceptor> {
    self.inner.plan.unary_policy.interceptor()
  }

  pub fn is_closed(&self) -> bool {
    self.inner.closed.load(Ordering::Acquire)
  }

  /// Stop all background tasks and fail every pending and future call
  ///
  /// Idempotent. Affects every clone of this handle and every channel
  /// obtained from it.
  pub fn close(&self) {
    if self.inner.closed.swap(true, Ordering::AcqRel) {
      return;
    }
    self.inner.guard.abort();
    self
      .inner
      .publisher
      .send_replace(Arc::new(PickerState::shutdown()));

    tracing::info!(
      target: "grpc_client",
      target_name = %self.inner.plan.target.target,
      "Connection closed"
    );
  }
}
