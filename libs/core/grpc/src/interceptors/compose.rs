use tonic::{Request, Status};

/// Compose two interceptors into a single interceptor
///
/// Interceptors are called in order: first, then second. A connection's
/// unary channel is the request id interceptor composed with its unary
/// policy.
///
/// # Example
/// ```ignore
/// use grpc_client::interceptors::{RequestIdInterceptor, WaitForReadyInterceptor, compose_interceptors};
///
/// let composed = compose_interceptors(RequestIdInterceptor::new(), WaitForReadyInterceptor::new());
/// let client = CalculatorServiceClient::with_interceptor(channel, composed);
/// ```
pub fn compose_interceptors<A, B>(first: A, second: B) -> ComposedInterceptor<A, B>
where
  A: tonic::service::Interceptor,
  B: tonic::service::Interceptor,
{
  ComposedInterceptor { first, second }
}

/// A composed interceptor that applies two interceptors in sequence
///
/// This is the return type of `compose_interceptors()`. You typically
/// don't need to construct this directly.
#[derive(Clone, Debug)]
pub struct ComposedInterceptor<A, B> {
  first: A,
  second: B,
}

impl<A, B> tonic::service::Interceptor for ComposedInterceptor<A, B>
where
  A: tonic::service::Interceptor,
  B: tonic::service::Interceptor,
{
  fn call(&mut self, request: Request<()>) -> Result<Request<()>, Status> {
    let request = self.first.call(request)?;
    self.second.call(request)
  }
}
