use tonic::{GrpcMethod, Request, Status};

/// Metadata key used to correlate a call across client and server logs
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Interceptor tagging every outgoing call with a request id
///
/// Keeps a caller supplied `x-request-id` and generates a UUID v4 otherwise.
/// Installed on both the unary and the streaming channel of a connection.
///
/// # Example
/// ```ignore
/// use grpc_client::interceptors::RequestIdInterceptor;
///
/// let client = CalculatorServiceClient::with_interceptor(channel, RequestIdInterceptor::new());
/// ```
#[derive(Clone, Debug, Default)]
pub struct RequestIdInterceptor;

impl RequestIdInterceptor {
    /// Create a new request id interceptor
    pub fn new() -> Self {
        Self
    }
}

impl tonic::service::Interceptor for RequestIdInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        let request_id = match request.metadata().get(REQUEST_ID_HEADER) {
            Some(existing) => existing.to_str().unwrap_or_default().to_string(),
            None => {
                let request_id = uuid::Uuid::new_v4().to_string();
                request.metadata_mut().insert(
                    REQUEST_ID_HEADER,
                    request_id
                        .parse()
                        .map_err(|_| Status::internal("Failed to create request ID"))?,
                );
                request_id
            }
        };

        match request.extensions().get::<GrpcMethod>() {
            Some(method) => tracing::debug!(
                target: "grpc_client",
                request_id = %request_id,
                service = method.service(),
                method = method.method(),
                "Outgoing gRPC request"
            ),
            None => tracing::debug!(
                target: "grpc_client",
                request_id = %request_id,
                "Outgoing gRPC request"
            ),
        }

        Ok(request)
    }
}
