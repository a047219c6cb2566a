use std::net::SocketAddr;
use std::time::Duration;

use tonic::transport::Endpoint;

use super::backoff::BackoffPolicy;
use super::resolver::{ResolvedTarget, UriScheme};
use crate::error::{GrpcError, GrpcResult};
use crate::interceptors::UnaryPolicy;

/// Ceiling substituted whenever a zero max backoff is supplied
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Lower bound for a single dial attempt, regardless of the current backoff
pub const MIN_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// The externally tunable part of a connection
///
/// Everything else (backoff curve, resolver, balancing) is fixed policy.
///
/// # Example
/// ```ignore
/// let options = ConnectionOptions::new()
///     .with_max_backoff(Duration::from_secs(5))
///     .with_fail_fast(true);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionOptions {
  pub secure: bool,
  pub max_backoff: Duration,
  pub fail_fast: bool,
}

impl ConnectionOptions {
  /// Used when the caller supplies no options at all
  pub const DEFAULT: Self = Self {
    secure: false,
    max_backoff: DEFAULT_MAX_BACKOFF,
    fail_fast: false,
  };

  pub fn new() -> Self {
    Self::DEFAULT
  }

  pub fn with_secure(mut self, secure: bool) -> Self {
    self.secure = secure;
    self
  }

  pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
    self.max_backoff = max_backoff;
    self
  }

  pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
    self.fail_fast = fail_fast;
    self
  }

  /// Normalize: a zero max backoff becomes [`DEFAULT_MAX_BACKOFF`]
  pub fn resolve(self) -> Self {
    if self.max_backoff.is_zero() {
      tracing::debug!(
        target: "grpc_client",
        default = ?DEFAULT_MAX_BACKOFF,
        "Max backoff unset, using default"
      );
      return Self {
        max_backoff: DEFAULT_MAX_BACKOFF,
        ..self
      };
    }
    self
  }
}

impl Default for ConnectionOptions {
  fn default() -> Self {
    Self::DEFAULT
  }
}

/// TLS parameters for `secure = true`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsSettings {
  /// Server name to verify, defaults to the target host
  pub domain: Option<String>,
  /// Extra PEM encoded CA certificate trusted on top of the native roots
  pub ca_certificate_pem: Option<String>,
}

impl TlsSettings {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
    self.domain = Some(domain.into());
    self
  }

  pub fn with_ca_certificate_pem(mut self, pem: impl Into<String>) -> Self {
    self.ca_certificate_pem = Some(pem.into());
    self
  }

  #[cfg(feature = "tls")]
  fn client_config(&self, host: &str) -> tonic::transport::ClientTlsConfig {
    let mut config = tonic::transport::ClientTlsConfig::new()
      .with_native_roots()
      .domain_name(self.domain.clone().unwrap_or_else(|| host.to_string()));
    if let Some(pem) = &self.ca_certificate_pem {
      config = config.ca_certificate(tonic::transport::Certificate::from_pem(pem));
    }
    config
  }
}

/// Transport-level option fragments
///
/// Everything except [`BlockUntilReady`](Self::BlockUntilReady) and
/// [`Backoff`](Self::Backoff) is passed through to each subchannel's
/// endpoint. Those two are stripped: readiness is enforced per call and the
/// backoff is always derived from the connection's max backoff.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportOption {
  /// Block the build until the connection is ready. Always stripped.
  BlockUntilReady,
  /// Custom backoff curve. Always replaced.
  Backoff(BackoffPolicy),
  ConnectTimeout(Duration),
  RequestTimeout(Duration),
  KeepAlive {
    interval: Duration,
    timeout: Duration,
    while_idle: bool,
  },
  TcpNodelay(bool),
  TcpKeepalive(Option<Duration>),
  /// Initial HTTP/2 connection and stream window size
  WindowSize(u32),
  AdaptiveWindow(bool),
  ConcurrencyLimit(usize),
  UserAgent(String),
  /// Only valid together with `secure = true`
  Tls(TlsSettings),
}

impl TransportOption {
  fn apply_to_endpoint(&self, endpoint: Endpoint) -> GrpcResult<Endpoint> {
    let endpoint = match self {
      Self::ConnectTimeout(timeout) => endpoint.connect_timeout(*timeout),
      Self::RequestTimeout(timeout) => endpoint.timeout(*timeout),
      Self::KeepAlive {
        interval,
        timeout,
        while_idle,
      } => endpoint
        .http2_keep_alive_interval(*interval)
        .keep_alive_timeout(*timeout)
        .keep_alive_while_idle(*while_idle),
      Self::TcpNodelay(enabled) => endpoint.tcp_nodelay(*enabled),
      Self::TcpKeepalive(keepalive) => endpoint.tcp_keepalive(*keepalive),
      Self::WindowSize(size) => endpoint
        .initial_connection_window_size(*size)
        .initial_stream_window_size(*size),
      Self::AdaptiveWindow(enabled) => endpoint.http2_adaptive_window(*enabled),
      Self::ConcurrencyLimit(limit) => endpoint.concurrency_limit(*limit),
      Self::UserAgent(agent) => endpoint.user_agent(agent.clone())?,
      // Consumed while resolving the plan
      Self::BlockUntilReady | Self::Backoff(_) | Self::Tls(_) => endpoint,
    };
    Ok(endpoint)
  }
}

/// Caller input to the connection builder
///
/// # Example
/// ```ignore
/// let options = BuildOptions::new()
///     .with_connection_options(ConnectionOptions::new().with_fail_fast(true))
///     .with_transport_option(TransportOption::UserAgent("calculator/1.0".into()));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildOptions {
  pub connection: Option<ConnectionOptions>,
  pub transport: Vec<TransportOption>,
}

impl BuildOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_connection_options(mut self, options: ConnectionOptions) -> Self {
    self.connection = Some(options);
    self
  }

  pub fn with_transport_option(mut self, option: TransportOption) -> Self {
    self.transport.push(option);
    self
  }
}

impl From<ConnectionOptions> for BuildOptions {
  fn from(options: ConnectionOptions) -> Self {
    Self::new().with_connection_options(options)
  }
}

/// Security mode of every subchannel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSecurity {
  Insecure,
  Tls(TlsSettings),
}

/// Fully resolved dial configuration
///
/// Pure function of the target and the build options, so two builds with the
/// same input produce equal plans.
#[derive(Debug, Clone, PartialEq)]
pub struct DialPlan {
  pub target: ResolvedTarget,
  pub options: ConnectionOptions,
  pub security: TransportSecurity,
  pub backoff: BackoffPolicy,
  /// Pass-through fragments, in caller order
  pub transport: Vec<TransportOption>,
  pub unary_policy: UnaryPolicy,
}

impl DialPlan {
  /// Normalize caller input into a plan
  ///
  /// Strips `BlockUntilReady` and any caller backoff, substitutes defaults,
  /// and rejects contradictory security settings.
  pub fn resolve(target: &str, options: BuildOptions) -> GrpcResult<Self> {
    let target = ResolvedTarget::parse(target)?;
    let connection = options
      .connection
      .unwrap_or(ConnectionOptions::DEFAULT)
      .resolve();

    let mut tls = None;
    let mut transport = Vec::with_capacity(options.transport.len());
    for option in options.transport {
      match option {
        TransportOption::BlockUntilReady => {
          tracing::debug!(target: "grpc_client", "Dropping block-until-ready option");
        }
        TransportOption::Backoff(custom) => {
          tracing::debug!(
            target: "grpc_client",
            custom = ?custom,
            "Dropping caller backoff, max backoff is derived from connection options"
          );
        }
        TransportOption::Tls(settings) => tls = Some(settings),
        other => transport.push(other),
      }
    }

    let security = match (connection.secure, target.uri_scheme) {
      (true, Some(UriScheme::Http)) => {
        return Err(GrpcError::InvalidConfig(
          "secure connection requested for an http:// target".to_string(),
        ));
      }
      (false, Some(UriScheme::Https)) => {
        return Err(GrpcError::InvalidConfig(
          "https:// target requires secure = true".to_string(),
        ));
      }
      (false, _) if tls.is_some() => {
        return Err(GrpcError::InvalidConfig(
          "TLS settings supplied but secure = false".to_string(),
        ));
      }
      (false, _) => TransportSecurity::Insecure,
      (true, _) if cfg!(feature = "tls") => TransportSecurity::Tls(tls.unwrap_or_default()),
      (true, _) => return Err(GrpcError::TlsUnavailable),
    };

    Ok(Self {
      backoff: BackoffPolicy::with_max_delay(connection.max_backoff),
      unary_policy: UnaryPolicy::for_options(&connection),
      target,
      options: connection,
      security,
      transport,
    })
  }

  /// Timeout for one dial attempt after `retries` consecutive failures
  pub fn connect_timeout(&self, retries: u32) -> Duration {
    self
      .transport
      .iter()
      .find_map(|option| match option {
        TransportOption::ConnectTimeout(timeout) => Some(*timeout),
        _ => None,
      })
      .unwrap_or_else(|| MIN_CONNECT_TIMEOUT.max(self.backoff.delay(retries)))
  }

  /// Endpoint for one resolved address
  ///
  /// Applies the baseline HTTP/2 and TCP tuning first, then the caller's
  /// pass-through fragments so they win.
  pub fn endpoint_for(&self, addr: SocketAddr) -> GrpcResult<Endpoint> {
    let scheme = match self.security {
      TransportSecurity::Insecure => "http",
      TransportSecurity::Tls(_) => "https",
    };

    let mut endpoint = Endpoint::from_shared(format!("{scheme}://{addr}"))?;

    let origin = format!("{scheme}://{}", self.target.authority())
      .parse::<http::Uri>()
      .map_err(|e| GrpcError::InvalidTarget {
        target: self.target.target.clone(),
        reason: e.to_string(),
      })?;
    endpoint = endpoint.origin(origin);

    // HTTP/2 keep-alive
    endpoint = endpoint
      .http2_keep_alive_interval(Duration::from_secs(30))
      .keep_alive_timeout(Duration::from_secs(10))
      .keep_alive_while_idle(true);

    // TCP settings
    endpoint = endpoint
      .tcp_nodelay(true)
      .tcp_keepalive(Some(Duration::from_secs(30)));

    for option in &self.transport {
      endpoint = option.apply_to_endpoint(endpoint)?;
    }

    match &self.security {
      TransportSecurity::Insecure => Ok(endpoint),
      #[cfg(feature = "tls")]
      TransportSecurity::Tls(settings) => {
        Ok(endpoint.tls_config(settings.client_config(&self.target.host))?)
      }
      #[cfg(not(feature = "tls"))]
      TransportSecurity::Tls(_) => Err(GrpcError::TlsUnavailable),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_options() {
    let options = ConnectionOptions::default();
    assert!(!options.secure);
    assert_eq!(options.max_backoff, Duration::from_secs(10));
    assert!(!options.fail_fast);
    assert_eq!(options, ConnectionOptions::DEFAULT);
  }

  #[test]
  fn test_builder_pattern() {
    let options = ConnectionOptions::new()
      .with_secure(true)
      .with_max_backoff(Duration::from_secs(3))
      .with_fail_fast(true);

    assert!(options.secure);
    assert_eq!(options.max_backoff, Duration::from_secs(3));
    assert!(options.fail_fast);
  }

  #[test]
  fn test_zero_max_backoff_uses_default() {
    let options = ConnectionOptions::new().with_max_backoff(Duration::ZERO).resolve();
    assert_eq!(options.max_backoff, DEFAULT_MAX_BACKOFF);

    let plan = DialPlan::resolve(
      "localhost:50051",
      ConnectionOptions::new().with_max_backoff(Duration::ZERO).into(),
    )
    .unwrap();
    assert_eq!(plan.backoff.max_delay, DEFAULT_MAX_BACKOFF);
  }

  #[test]
  fn test_missing_options_equal_explicit_default() {
    let implicit = DialPlan::resolve("localhost:50051", BuildOptions::new()).unwrap();
    let explicit = DialPlan::resolve("localhost:50051", ConnectionOptions::DEFAULT.into()).unwrap();
    assert_eq!(implicit, explicit);
  }

  #[test]
  fn test_block_until_ready_and_backoff_are_stripped() {
    let custom = BackoffPolicy::with_max_delay(Duration::from_secs(600));
    let plan = DialPlan::resolve(
      "localhost:50051",
      BuildOptions::new()
        .with_transport_option(TransportOption::BlockUntilReady)
        .with_transport_option(TransportOption::Backoff(custom))
        .with_transport_option(TransportOption::TcpNodelay(false)),
    )
    .unwrap();

    assert_eq!(plan.transport, vec![TransportOption::TcpNodelay(false)]);
    assert_eq!(plan.backoff, BackoffPolicy::with_max_delay(DEFAULT_MAX_BACKOFF));
  }

  #[test]
  fn test_insecure_by_default() {
    let plan = DialPlan::resolve("localhost:50051", BuildOptions::new()).unwrap();
    assert_eq!(plan.security, TransportSecurity::Insecure);
  }

  #[test]
  fn test_fail_fast_disables_unary_interceptor() {
    let plan = DialPlan::resolve(
      "localhost:50051",
      ConnectionOptions::new().with_fail_fast(true).into(),
    )
    .unwrap();
    assert_eq!(plan.unary_policy, UnaryPolicy::FailFast);
    assert!(plan.unary_policy.interceptor().is_none());

    let plan = DialPlan::resolve("localhost:50051", BuildOptions::new()).unwrap();
    assert!(plan.unary_policy.interceptor().is_some());
  }

  #[test]
  fn test_contradictory_security() {
    let result = DialPlan::resolve("https://calc:443", BuildOptions::new());
    assert!(matches!(result, Err(GrpcError::InvalidConfig(_))));

    let result = DialPlan::resolve(
      "http://calc:80",
      ConnectionOptions::new().with_secure(true).into(),
    );
    assert!(matches!(result, Err(GrpcError::InvalidConfig(_))));

    let result = DialPlan::resolve(
      "calc:80",
      BuildOptions::new().with_transport_option(TransportOption::Tls(TlsSettings::new())),
    );
    assert!(matches!(result, Err(GrpcError::InvalidConfig(_))));
  }

  #[cfg(not(feature = "tls"))]
  #[test]
  fn test_secure_without_tls_feature_is_an_error() {
    let result = DialPlan::resolve("calc:443", ConnectionOptions::new().with_secure(true).into());
    assert!(matches!(result, Err(GrpcError::TlsUnavailable)));
  }

  #[cfg(feature = "tls")]
  #[test]
  fn test_secure_uses_tls() {
    let plan = DialPlan::resolve(
      "calc:443",
      BuildOptions::new()
        .with_connection_options(ConnectionOptions::new().with_secure(true))
        .with_transport_option(TransportOption::Tls(TlsSettings::new().with_domain("calc.internal"))),
    )
    .unwrap();
    assert_eq!(
      plan.security,
      TransportSecurity::Tls(TlsSettings::new().with_domain("calc.internal"))
    );
  }

  #[test]
  fn test_connect_timeout_floor() {
    let plan = DialPlan::resolve(
      "localhost:50051",
      ConnectionOptions::new().with_max_backoff(Duration::from_secs(120)).into(),
    )
    .unwrap();
    assert_eq!(plan.connect_timeout(0), MIN_CONNECT_TIMEOUT);
    assert_eq!(plan.connect_timeout(50), Duration::from_secs(120));

    let plan = DialPlan::resolve(
      "localhost:50051",
      BuildOptions::new().with_transport_option(TransportOption::ConnectTimeout(Duration::from_secs(2))),
    )
    .unwrap();
    assert_eq!(plan.connect_timeout(50), Duration::from_secs(2));
  }

  #[test]
  fn test_endpoint_for_address() {
    let plan = DialPlan::resolve(
      "localhost:50051",
      BuildOptions::new().with_transport_option(TransportOption::UserAgent("calculator/1.0".into())),
    )
    .unwrap();
    let endpoint = plan.endpoint_for("127.0.0.1:50051".parse().unwrap()).unwrap();
    assert_eq!(endpoint.uri().to_string(), "http://127.0.0.1:50051/");
  }

  #[test]
  fn test_identical_input_identical_plan() {
    let build = || {
      DialPlan::resolve(
        "dns:///calc:7000",
        BuildOptions::new()
          .with_connection_options(ConnectionOptions::new().with_max_backoff(Duration::from_secs(4)))
          .with_transport_option(TransportOption::WindowSize(1024 * 1024)),
      )
      .unwrap()
    };
    assert_eq!(build(), build());
  }
}
