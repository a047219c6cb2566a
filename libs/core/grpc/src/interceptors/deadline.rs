use std::time::Duration;

use tonic::{Request, Status};

use crate::channel::ConnectionOptions;

/// Metadata key carrying the call deadline
pub const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";

/// Deadline imposed on unary calls that arrive without one
pub const DEFAULT_UNARY_TIMEOUT: Duration = Duration::from_secs(1);

/// Request extension asking the balancer to wait for a ready subchannel
/// instead of failing while the connection is in transient failure
///
/// Meant for unary calls only: the balancer buffers the request body so the
/// call can be sent again when the connection it landed on is already gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitForReady;

/// Interceptor that makes unary calls tolerate reconnect windows
///
/// Marks every call wait-for-ready and, when the caller set no deadline,
/// gives it [`DEFAULT_UNARY_TIMEOUT`]. The two go together: a wait-for-ready
/// call without a deadline could wait forever.
///
/// # Example
/// ```ignore
/// use grpc_client::interceptors::WaitForReadyInterceptor;
///
/// let client = CalculatorServiceClient::with_interceptor(
///     connection.channel(),
///     WaitForReadyInterceptor::new(),
/// );
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitForReadyInterceptor {
    default_timeout: Duration,
}

impl WaitForReadyInterceptor {
    pub fn new() -> Self {
        Self {
            default_timeout: DEFAULT_UNARY_TIMEOUT,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }
}

impl Default for WaitForReadyInterceptor {
    fn default() -> Self {
        Self::new()
    }
}

impl tonic::service::Interceptor for WaitForReadyInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        if request.metadata().get(GRPC_TIMEOUT_HEADER).is_none() {
            request.set_timeout(self.default_timeout);
        }
        request.extensions_mut().insert(WaitForReady);
        Ok(request)
    }
}

/// What happens to unary calls on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryPolicy {
    /// No interceptor: calls fail as soon as the connection is in transient failure
    FailFast,
    WaitForReady(WaitForReadyInterceptor),
}

impl UnaryPolicy {
    pub fn for_options(options: &ConnectionOptions) -> Self {
        if options.fail_fast {
            Self::FailFast
        } else {
            Self::WaitForReady(WaitForReadyInterceptor::new())
        }
    }

    /// The installed interceptor, `None` for fail-fast connections
    pub fn interceptor(&self) -> Option<WaitForReadyInterceptor> {
        match self {
            Self::FailFast => None,
            Self::WaitForReady(interceptor) => Some(*interceptor),
        }
    }
}

impl tonic::service::Interceptor for UnaryPolicy {
    fn call(&mut self, request: Request<()>) -> Result<Request<()>, Status> {
        match self {
            Self::FailFast => Ok(request),
            Self::WaitForReady(interceptor) => interceptor.call(request),
        }
    }
}
