use crate::{env_bool, env_or_default, env_parse, ConfigError, FromEnv};
use std::time::Duration;

pub const DEFAULT_TARGET: &str = "localhost:50051";
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 10_000;

/// gRPC client connection settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GrpcClientConfig {
    pub target: String,
    pub secure: bool,
    pub max_backoff: Duration,
    pub fail_fast: bool,
}

impl GrpcClientConfig {
    pub fn new(target: String) -> Self {
        Self {
            target,
            ..Self::default()
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }
}

impl FromEnv for GrpcClientConfig {
    /// Reads from environment variables with sensible defaults:
    /// - GRPC_TARGET: defaults to localhost:50051
    /// - GRPC_SECURE: defaults to false
    /// - GRPC_MAX_BACKOFF_MS: defaults to 10000, zero or negative also means the default
    /// - GRPC_FAIL_FAST: defaults to false
    fn from_env() -> Result<Self, ConfigError> {
        let target = env_or_default("GRPC_TARGET", DEFAULT_TARGET);
        let secure = env_bool("GRPC_SECURE", false)?;
        let fail_fast = env_bool("GRPC_FAIL_FAST", false)?;

        let max_backoff_ms = match env_parse::<i64>("GRPC_MAX_BACKOFF_MS", 0)? {
            ms if ms <= 0 => DEFAULT_MAX_BACKOFF_MS,
            ms => ms.unsigned_abs(),
        };

        Ok(Self {
            target,
            secure,
            max_backoff: Duration::from_millis(max_backoff_ms),
            fail_fast,
        })
    }
}

impl Default for GrpcClientConfig {
    fn default() -> Self {
        Self {
            target: DEFAULT_TARGET.to_string(),
            secure: false,
            max_backoff: Duration::from_millis(DEFAULT_MAX_BACKOFF_MS),
            fail_fast: false,
        }
    }
}
