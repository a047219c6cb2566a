//! Shared test utilities for the gRPC client
//!
//! This crate provides reusable test infrastructure:
//! - `CalculatorFixture`: in-process calculator server on an ephemeral port,
//!   restartable on the same address
//! - `FixtureBehavior`: controlled misbehavior (slow unary calls, early
//!   close of the bidi stream, per-instance result offsets)
//!
//! # Usage
//!
//! ```rust,ignore
//! use test_utils::{CalculatorFixture, FixtureBehavior};
//! use std::time::Duration;
//!
//! #[tokio::test]
//! async fn my_client_test() {
//!     let server = CalculatorFixture::start_with(
//!         FixtureBehavior::new().with_unary_delay(Duration::from_millis(50)),
//!     )
//!     .await;
//!
//!     let connection = grpc_client::create_connection(&server.target()).await.unwrap();
//! }
//! ```

mod calculator;

pub use calculator::{CalculatorFixture, FixtureBehavior, prime_factors};
