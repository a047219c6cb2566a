//! One method per call shape of the calculator service

use std::time::Duration;

use eyre::{Result, WrapErr};
use futures::{Stream, StreamExt};
use grpc_client::{Connection, calls};
use rpc::calculator::calculator_service_client::CalculatorServiceClient;
use rpc::calculator::{
    ComputeAverageRequest, FindMaximumRequest, PrimeNumberDecompositionRequest, SquareRootRequest,
    SumRequest,
};
use tonic::Code;
use tracing::{info, instrument, warn};

pub struct Calculator {
    connection: Connection,
}

impl Calculator {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    #[instrument(skip(self))]
    pub async fn sum(&self, first_number: i32, second_number: i32) -> Result<i32> {
        let mut client = CalculatorServiceClient::new(self.connection.unary_channel());
        let response = calls::unary(client.sum(SumRequest {
            first_number,
            second_number,
        }))
        .await
        .wrap_err("Sum call failed")?;

        Ok(response.sum_result)
    }

    /// Prime factors of `number`, handed to `on_factor` as they arrive
    #[instrument(skip(self, on_factor))]
    pub async fn decompose(&self, number: i64, mut on_factor: impl FnMut(i64)) -> Result<usize> {
        let mut client = CalculatorServiceClient::new(self.connection.streaming_channel());
        let mut factors = calls::server_stream(
            client.prime_number_decomposition(PrimeNumberDecompositionRequest { number }),
        )
        .await
        .wrap_err("Prime number decomposition call failed")?;

        let mut received = 0;
        while let Some(factor) = factors.next().await {
            let factor = factor.wrap_err("Prime number decomposition stream failed")?;
            on_factor(factor.prime_factor);
            received += 1;
        }
        Ok(received)
    }

    #[instrument(skip(self))]
    pub async fn average(&self, numbers: &[i32]) -> Result<f64> {
        let client = CalculatorServiceClient::new(self.connection.streaming_channel());
        let (sender, finisher) = calls::client_stream(move |requests| {
            let mut client = client.clone();
            async move { client.compute_average(requests).await }
        });

        for &number in numbers {
            if sender.send(ComputeAverageRequest { number }).await.is_err() {
                warn!(number, "Compute average stream ended before all numbers were sent");
                break;
            }
        }

        let response = finisher
            .close_and_receive(sender)
            .await
            .wrap_err("Compute average call failed")?;
        Ok(response.average)
    }

    /// Stream `numbers` one per `interval` and report each new running maximum
    #[instrument(skip(self, on_maximum))]
    pub async fn maximum(
        &self,
        numbers: Vec<i32>,
        interval: Duration,
        mut on_maximum: impl FnMut(i32),
    ) -> Result<usize> {
        let mut client = CalculatorServiceClient::new(self.connection.streaming_channel());

        let summary = calls::bidi_stream(
            |requests| client.find_maximum(requests),
            paced(numbers, interval),
            |response| on_maximum(response.maximum),
        )
        .await
        .wrap_err("Find maximum call failed")?;

        if !summary.emitter.is_finished() {
            info!(received = summary.received, "Server closed the stream before all numbers were sent");
            summary.emitter.abort();
        }
        Ok(summary.received)
    }

    /// Square roots in input order; `None` where the server rejected the number
    ///
    /// Application errors are reported and skipped, a transport failure ends the run.
    #[instrument(skip(self))]
    pub async fn square_roots(&self, numbers: &[i32]) -> Result<Vec<Option<f64>>> {
        let mut client = CalculatorServiceClient::new(self.connection.unary_channel());
        let mut roots = Vec::with_capacity(numbers.len());

        for &number in numbers {
            match calls::unary(client.square_root(SquareRootRequest { number })).await {
                Ok(response) => roots.push(Some(response.number_root)),
                Err(error) if error.is_application() && error.code() == Code::InvalidArgument => {
                    warn!(number, message = error.message(), "Square root rejected");
                    roots.push(None);
                }
                Err(error) => {
                    return Err(error).wrap_err_with(|| format!("Square root of {} failed", number));
                }
            }
        }
        Ok(roots)
    }
}

fn paced(
    numbers: Vec<i32>,
    interval: Duration,
) -> impl Stream<Item = FindMaximumRequest> + Send + 'static {
    futures::stream::iter(numbers).then(move |number| async move {
        tokio::time::sleep(interval).await;
        FindMaximumRequest { number }
    })
}
