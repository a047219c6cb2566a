//! # gRPC Client Library
//!
//! Resilient gRPC connections for tonic-generated clients: bounded reconnect
//! backoff, DNS resolution with round-robin balancing over every resolved
//! address, deadline-enforcing unary calls, and a coordinator for
//! bidirectional streams.
//!
//! ## Features
//!
//! - **Connection Builder**: one target per connection, dialed in the
//!   background; max backoff is always bounded and `block until ready` is
//!   never honored
//! - **Round-Robin Balancing**: one HTTP/2 subchannel per resolved address,
//!   re-resolved periodically
//! - **Wait-For-Ready Unary Calls**: unary calls ride out reconnect windows
//!   and get a 1s deadline when the caller set none
//! - **Streaming Coordinator**: independent emitter and collector over one
//!   bidi stream
//! - **Classified Errors**: every failed call is either a transport failure
//!   or an application status
//!
//! ## Quick Start
//!
//! ### Basic Usage
//! ```ignore
//! use grpc_client::{calls, create_connection};
//! use rpc::calculator::calculator_service_client::CalculatorServiceClient;
//!
//! let connection = create_connection("localhost:50051").await?;
//! let mut client = CalculatorServiceClient::new(connection.unary_channel());
//! let response = calls::unary(client.sum(SumRequest { first_number: 3, second_number: 10 })).await?;
//! connection.close();
//! ```
//!
//! ### With Custom Options
//! ```ignore
//! use grpc_client::{create_connection_with_options, BuildOptions, ConnectionOptions, TransportOption};
//! use std::time::Duration;
//!
//! let options = BuildOptions::new()
//!     .with_connection_options(ConnectionOptions::new().with_max_backoff(Duration::from_secs(5)))
//!     .with_transport_option(TransportOption::UserAgent("calculator-client/0.1".into()));
//!
//! let connection = create_connection_with_options("dns:///calculator:50051", options).await?;
//! ```
//!
//! ### Bidirectional Streaming
//! ```ignore
//! use grpc_client::calls;
//!
//! let mut client = CalculatorServiceClient::new(connection.streaming_channel());
//! calls::bidi_stream(
//!     |requests| client.find_maximum(requests),
//!     futures::stream::iter([4, 7, 2, 19]).map(|number| FindMaximumRequest { number }),
//!     |response| println!("maximum: {}", response.maximum),
//! )
//! .await?;
//! ```

pub mod calls;
pub mod channel;
pub mod error;
pub mod interceptors;
pub mod streaming;

// Re-export main types and functions for convenience
pub use channel::{
  BackoffPolicy, BalancedChannel, BuildOptions, Connection, ConnectionOptions, ConnectivityState,
  DEFAULT_MAX_BACKOFF, DialPlan, DnsResolver, Resolver, StreamingChannel, TlsSettings,
  TransportOption, TransportSecurity, UnaryChannel, create_connection,
  create_connection_with_options,
};
pub use error::{CallError, CallResult, GrpcError, GrpcResult};
pub use streaming::{
  EmitterHandle, InboundStream, OutboundStream, SessionSummary, StreamHandle, StreamingSession,
};

// Re-export interceptors for convenience
pub use interceptors::{
  ComposedInterceptor, RequestIdInterceptor, UnaryPolicy, WaitForReadyInterceptor,
  compose_interceptors,
};
