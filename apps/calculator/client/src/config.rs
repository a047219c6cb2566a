//! Configuration for the calculator client

use core_config::{Environment, FromEnv, GrpcClientConfig};
use eyre::Result;
use grpc_client::{BuildOptions, ConnectionOptions, TransportOption};

const USER_AGENT: &str = concat!("calculator-client/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct Config {
    pub environment: Environment,
    pub grpc: GrpcClientConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            environment: Environment::from_env(),
            grpc: GrpcClientConfig::from_env()?,
        })
    }

    /// Replace the configured target, e.g. from the command line
    pub fn with_target(mut self, target: Option<String>) -> Self {
        if let Some(target) = target {
            self.grpc = self.grpc.with_target(target);
        }
        self
    }

    pub fn build_options(&self) -> BuildOptions {
        let connection = ConnectionOptions::new()
            .with_secure(self.grpc.secure)
            .with_max_backoff(self.grpc.max_backoff)
            .with_fail_fast(self.grpc.fail_fast);

        BuildOptions::new()
            .with_connection_options(connection)
            .with_transport_option(TransportOption::UserAgent(USER_AGENT.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_config_from_env_defaults() {
        temp_env::with_vars_unset(
            ["GRPC_TARGET", "GRPC_SECURE", "GRPC_MAX_BACKOFF_MS", "GRPC_FAIL_FAST", "APP_ENV"],
            || {
                let config = Config::from_env().unwrap();
                assert_eq!(config.environment, Environment::Development);
                assert_eq!(config.grpc.target, "localhost:50051");

                let options = config.build_options();
                let connection = options.connection.unwrap();
                assert_eq!(connection.max_backoff, Duration::from_secs(10));
                assert!(!connection.secure);
                assert!(!connection.fail_fast);
            },
        );
    }

    #[test]
    fn test_command_line_target_wins() {
        temp_env::with_var("GRPC_TARGET", Some("calc-a:50051"), || {
            let config = Config::from_env()
                .unwrap()
                .with_target(Some("calc-b:50051".to_string()));
            assert_eq!(config.grpc.target, "calc-b:50051");

            let config = Config::from_env().unwrap().with_target(None);
            assert_eq!(config.grpc.target, "calc-a:50051");
        });
    }

    #[test]
    fn test_build_options_carry_user_agent() {
        let config = Config {
            environment: Environment::Development,
            grpc: GrpcClientConfig::default(),
        };
        let options = config.build_options();
        assert!(
            options
                .transport
                .iter()
                .any(|option| matches!(option, TransportOption::UserAgent(agent) if agent.starts_with("calculator-client/")))
        );
    }
}
