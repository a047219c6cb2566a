//! Calculator Client
//!
//! Opens one resilient gRPC connection to the calculator service and runs a
//! single interaction: unary, server streaming, client streaming or
//! bidirectional streaming.

use std::time::Duration;

use clap::{Parser, Subcommand};
use core_config::tracing::{init_tracing, install_color_eyre};
use eyre::{Result, WrapErr};
use grpc_client::create_connection_with_options;
use tracing::info;

mod calculator;
mod config;

use calculator::Calculator;
use config::Config;

#[derive(Parser)]
#[command(name = "calculator-client")]
#[command(about = "Call the calculator service over a self-healing gRPC connection")]
struct Cli {
    /// Server target (host:port, dns:///host:port, http(s)://host:port). Overrides GRPC_TARGET.
    #[arg(short, long, global = true)]
    target: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add two numbers (unary)
    Sum {
        #[arg(default_value_t = 5)]
        first: i32,
        #[arg(default_value_t = 40)]
        second: i32,
    },

    /// Prime factors of a number (server streaming)
    Decompose {
        #[arg(default_value_t = 12390392840)]
        number: i64,
    },

    /// Average of a sequence (client streaming)
    Average {
        #[arg(allow_negative_numbers = true, default_values_t = [3, 5, 9, 54, 23])]
        numbers: Vec<i32>,
    },

    /// Running maximum of a sequence (bidirectional streaming)
    Maximum {
        /// Pause before sending each number
        #[arg(short, long, default_value_t = 1000)]
        interval_ms: u64,

        #[arg(allow_negative_numbers = true, default_values_t = [4, 7, 2, 19, 4, 6, 32])]
        numbers: Vec<i32>,
    },

    /// Square roots, one unary call per number
    SquareRoot {
        #[arg(allow_negative_numbers = true, default_values_t = [10, -2])]
        numbers: Vec<i32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    install_color_eyre();

    let cli = Cli::parse();
    let config = Config::from_env()?.with_target(cli.target);
    init_tracing(&config.environment);

    info!(target_name = %config.grpc.target, "Connecting to calculator service");
    let connection = create_connection_with_options(&config.grpc.target, config.build_options())
        .await
        .wrap_err_with(|| format!("Failed to create connection to {}", config.grpc.target))?;

    let calculator = Calculator::new(connection.clone());
    let result = run(&calculator, cli.command).await;

    connection.close();
    result
}

async fn run(calculator: &Calculator, command: Commands) -> Result<()> {
    match command {
        Commands::Sum { first, second } => {
            let sum = calculator.sum(first, second).await?;
            println!("{} + {} = {}", first, second, sum);
        }

        Commands::Decompose { number } => {
            println!("Prime factors of {}:", number);
            let received = calculator
                .decompose(number, |factor| println!("{}", factor))
                .await?;
            info!(number, received, "Decomposition complete");
        }

        Commands::Average { numbers } => {
            let average = calculator.average(&numbers).await?;
            println!("Average of {:?} = {}", numbers, average);
        }

        Commands::Maximum {
            interval_ms,
            numbers,
        } => {
            let received = calculator
                .maximum(numbers, Duration::from_millis(interval_ms), |maximum| {
                    println!("New maximum: {}", maximum)
                })
                .await?;
            info!(received, "Find maximum complete");
        }

        Commands::SquareRoot { numbers } => {
            let roots = calculator.square_roots(&numbers).await?;
            for (number, root) in numbers.iter().zip(roots) {
                match root {
                    Some(root) => println!("Square root of {} = {}", number, root),
                    None => println!(
                        "Square root of {} failed: we probably sent a negative number",
                        number
                    ),
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["calculator-client", "maximum"]).unwrap();
        assert!(cli.target.is_none());
        match cli.command {
            Commands::Maximum {
                interval_ms,
                numbers,
            } => {
                assert_eq!(interval_ms, 1000);
                assert_eq!(numbers, vec![4, 7, 2, 19, 4, 6, 32]);
            }
            _ => panic!("expected maximum"),
        }

        let cli = Cli::try_parse_from(["calculator-client", "square-root"]).unwrap();
        assert!(matches!(cli.command, Commands::SquareRoot { numbers } if numbers == vec![10, -2]));

        let cli = Cli::try_parse_from(["calculator-client", "decompose"]).unwrap();
        assert!(matches!(cli.command, Commands::Decompose { number: 12390392840 }));
    }

    #[test]
    fn test_cli_target_and_arguments() {
        let cli = Cli::try_parse_from([
            "calculator-client",
            "--target",
            "dns:///calculator:50051",
            "sum",
            "3",
            "10",
        ])
        .unwrap();

        assert_eq!(cli.target.as_deref(), Some("dns:///calculator:50051"));
        assert!(matches!(
            cli.command,
            Commands::Sum {
                first: 3,
                second: 10
            }
        ));
    }

    #[test]
    fn test_cli_negative_numbers() {
        let cli =
            Cli::try_parse_from(["calculator-client", "square-root", "-4", "9"]).unwrap();
        assert!(matches!(cli.command, Commands::SquareRoot { numbers } if numbers == vec![-4, 9]));
    }
}
