/// Re-export tonic's Interceptor trait for convenience
pub use tonic::service::Interceptor;

pub mod compose;
pub mod deadline;
pub mod tracing;

pub use compose::{ComposedInterceptor, compose_interceptors};
pub use deadline::{
    DEFAULT_UNARY_TIMEOUT, GRPC_TIMEOUT_HEADER, UnaryPolicy, WaitForReady, WaitForReadyInterceptor,
};
pub use tracing::{REQUEST_ID_HEADER, RequestIdInterceptor};
