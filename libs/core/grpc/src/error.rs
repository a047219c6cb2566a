use thiserror::Error;
use tonic::{Code, Status};

pub type GrpcResult<T> = Result<T, GrpcError>;

/// Outcome of a single call issued through a [`Connection`](crate::Connection)
pub type CallResult<T> = Result<T, CallError>;

/// Errors that can occur while building a connection
///
/// These are all surfaced synchronously by the connection builder. Transport
/// flakiness after the build never shows up here, it is absorbed by the
/// reconnect machinery and reported per call as a [`CallError`].
#[derive(Error, Debug)]
pub enum GrpcError {
  /// The target string could not be parsed
  #[error("Invalid target {target:?}: {reason}")]
  InvalidTarget { target: String, reason: String },

  /// The target names a resolver scheme other than DNS
  #[error("Unsupported resolver scheme {0:?} (only dns is supported)")]
  UnsupportedScheme(String),

  /// Invalid URI produced for a resolved address
  #[error("Invalid URI: {0}")]
  InvalidUri(#[from] tonic::transport::Error),

  /// Initial name resolution failed
  #[error("Failed to resolve {target}: {source}")]
  Resolution {
    target: String,
    #[source]
    source: std::io::Error,
  },

  /// Name resolution succeeded but produced no addresses
  #[error("No addresses resolved for {0}")]
  NoAddresses(String),

  /// Invalid or contradictory configuration
  #[error("Invalid configuration: {0}")]
  InvalidConfig(String),

  /// A secure connection was requested but TLS support is not compiled in
  #[error("Secure connection requested but the `tls` feature is disabled")]
  TlsUnavailable,
}

// Implement conversion to tonic::Status for use in interceptors
impl From<GrpcError> for tonic::Status {
  fn from(err: GrpcError) -> Self {
    match err {
      GrpcError::InvalidTarget { .. }
      | GrpcError::UnsupportedScheme(_)
      | GrpcError::InvalidUri(_)
      | GrpcError::InvalidConfig(_)
      | GrpcError::TlsUnavailable => tonic::Status::invalid_argument(err.to_string()),
      GrpcError::Resolution { .. } | GrpcError::NoAddresses(_) => {
        tonic::Status::unavailable(err.to_string())
      }
    }
  }
}

/// Classified failure of a call
///
/// Every failed call lands in exactly one of the two variants. `Application`
/// means the peer answered with a structured status (for example
/// `InvalidArgument` for a negative square root input) and the connection is
/// healthy. `Transport` means the call never got a meaningful answer: the
/// connection was unavailable, the deadline elapsed, the call was cancelled,
/// or the failure originated locally.
///
/// # Example
/// ```ignore
/// match calls::unary(client.square_root(request)).await {
///     Ok(response) => println!("{}", response.number_root),
///     Err(CallError::Application { code: Code::InvalidArgument, .. }) => {
///         // fix the input and try again
///     }
///     Err(error) if error.is_deadline_exceeded() => { /* back off */ }
///     Err(error) => return Err(error.into()),
/// }
/// ```
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallError {
  #[error("transport failure ({code:?}): {message}")]
  Transport { code: Code, message: String },

  #[error("application status {code:?}: {message}")]
  Application { code: Code, message: String },
}

impl CallError {
  pub fn transport(code: Code, message: impl Into<String>) -> Self {
    Self::Transport {
      code,
      message: message.into(),
    }
  }

  pub fn application(code: Code, message: impl Into<String>) -> Self {
    Self::Application {
      code,
      message: message.into(),
    }
  }

  pub fn code(&self) -> Code {
    match self {
      Self::Transport { code, .. } | Self::Application { code, .. } => *code,
    }
  }

  pub fn message(&self) -> &str {
    match self {
      Self::Transport { message, .. } | Self::Application { message, .. } => message,
    }
  }

  pub fn is_transport(&self) -> bool {
    matches!(self, Self::Transport { .. })
  }

  pub fn is_application(&self) -> bool {
    matches!(self, Self::Application { .. })
  }

  /// True for both caller-imposed and interceptor-imposed deadlines
  pub fn is_deadline_exceeded(&self) -> bool {
    self.code() == Code::DeadlineExceeded
  }
}

impl From<Status> for CallError {
  fn from(status: Status) -> Self {
    let code = status.code();
    let local = std::error::Error::source(&status).is_some();
    let message = status.message().to_string();

    match code {
      Code::Unavailable | Code::DeadlineExceeded | Code::Cancelled => {
        Self::Transport { code, message }
      }
      _ if local => Self::Transport { code, message },
      _ => Self::Application { code, message },
    }
  }
}

impl From<CallError> for Status {
  fn from(error: CallError) -> Self {
    match error {
      CallError::Transport { code, message } | CallError::Application { code, message } => {
        Status::new(code, message)
      }
    }
  }
}
