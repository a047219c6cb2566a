//! In-process calculator server
//!
//! Provides a `CalculatorFixture` that serves `calculator.v1.CalculatorService`
//! on an ephemeral localhost port and can be stopped and restarted on the
//! same port to exercise reconnect behavior.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rpc::calculator::calculator_service_server::{CalculatorService, CalculatorServiceServer};
use rpc::calculator::{
    ComputeAverageRequest, ComputeAverageResponse, FindMaximumRequest, FindMaximumResponse,
    PrimeNumberDecompositionRequest, PrimeNumberDecompositionResponse, SquareRootRequest,
    SquareRootResponse, SumRequest, SumResponse,
};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::{Request, Response, Status, Streaming};

/// Knobs for making the fixture misbehave in controlled ways
#[derive(Debug, Clone, Default)]
pub struct FixtureBehavior {
    /// Delay applied before answering `Sum` and `SquareRoot`
    pub unary_delay: Option<Duration>,
    /// End the `FindMaximum` response stream after this many responses
    pub close_find_maximum_after: Option<usize>,
    /// Added to every `Sum` result so tests can tell instances apart
    pub sum_offset: i32,
}

impl FixtureBehavior {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_unary_delay(mut self, delay: Duration) -> Self {
        self.unary_delay = Some(delay);
        self
    }

    pub fn with_close_find_maximum_after(mut self, responses: usize) -> Self {
        self.close_find_maximum_after = Some(responses);
        self
    }

    pub fn with_sum_offset(mut self, offset: i32) -> Self {
        self.sum_offset = offset;
        self
    }
}

/// Prime factors of `number` in ascending order, nothing for numbers below 2
pub fn prime_factors(mut number: i64) -> Vec<i64> {
    let mut factors = Vec::new();
    let mut divisor = 2;

    while number > 1 {
        if divisor * divisor > number {
            factors.push(number);
            break;
        }
        if number % divisor == 0 {
            factors.push(divisor);
            number /= divisor;
        } else {
            divisor += 1;
        }
    }
    factors
}

#[derive(Clone)]
struct Calculator {
    behavior: FixtureBehavior,
    calls: Arc<AtomicUsize>,
}

impl Calculator {
    async fn unary_prelude(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.behavior.unary_delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[tonic::async_trait]
impl CalculatorService for Calculator {
    async fn sum(&self, request: Request<SumRequest>) -> Result<Response<SumResponse>, Status> {
        self.unary_prelude().await;
        let request = request.into_inner();

        Ok(Response::new(SumResponse {
            sum_result: request.first_number + request.second_number + self.behavior.sum_offset,
        }))
    }

    type PrimeNumberDecompositionStream =
        ReceiverStream<Result<PrimeNumberDecompositionResponse, Status>>;

    async fn prime_number_decomposition(
        &self,
        request: Request<PrimeNumberDecompositionRequest>,
    ) -> Result<Response<Self::PrimeNumberDecompositionStream>, Status> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let number = request.into_inner().number;
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            for prime_factor in prime_factors(number) {
                let response = PrimeNumberDecompositionResponse { prime_factor };
                if tx.send(Ok(response)).await.is_err() {
                    break;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn compute_average(
        &self,
        request: Request<Streaming<ComputeAverageRequest>>,
    ) -> Result<Response<ComputeAverageResponse>, Status> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut stream = request.into_inner();
        let mut sum: i64 = 0;
        let mut count: i64 = 0;

        while let Some(request) = stream.message().await? {
            sum += i64::from(request.number);
            count += 1;
        }

        if count == 0 {
            return Err(Status::invalid_argument("No numbers received"));
        }

        Ok(Response::new(ComputeAverageResponse {
            average: sum as f64 / count as f64,
        }))
    }

    type FindMaximumStream = ReceiverStream<Result<FindMaximumResponse, Status>>;

    async fn find_maximum(
        &self,
        request: Request<Streaming<FindMaximumRequest>>,
    ) -> Result<Response<Self::FindMaximumStream>, Status> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut stream = request.into_inner();
        let close_after = self.behavior.close_find_maximum_after;
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            let mut maximum: Option<i32> = None;
            let mut sent = 0;

            if close_after == Some(0) {
                return;
            }

            loop {
                let number = match stream.message().await {
                    Ok(Some(request)) => request.number,
                    Ok(None) => break,
                    Err(status) => {
                        let _ = tx.send(Err(status)).await;
                        break;
                    }
                };

                if maximum.is_some_and(|current| number <= current) {
                    continue;
                }
                maximum = Some(number);

                if tx.send(Ok(FindMaximumResponse { maximum: number })).await.is_err() {
                    break;
                }
                sent += 1;
                if close_after.is_some_and(|limit| sent >= limit) {
                    break;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn square_root(
        &self,
        request: Request<SquareRootRequest>,
    ) -> Result<Response<SquareRootResponse>, Status> {
        self.unary_prelude().await;
        let number = request.into_inner().number;

        if number < 0 {
            return Err(Status::invalid_argument(format!(
                "Received a negative number: {number}"
            )));
        }

        Ok(Response::new(SquareRootResponse {
            number_root: f64::from(number).sqrt(),
        }))
    }
}

/// Calculator server running inside the test process
///
/// The server is shut down when this struct is dropped.
///
/// # Example
///
/// ```no_run
/// use test_utils::CalculatorFixture;
///
/// # async fn example() {
/// let mut server = CalculatorFixture::start().await;
/// let target = server.target();
///
/// // Dial `target`, then simulate a hard restart
/// server.stop().await;
/// server.restart().await;
/// # }
/// ```
pub struct CalculatorFixture {
    addr: SocketAddr,
    calculator: Calculator,
    shutdown: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<()>>,
}

impl CalculatorFixture {
    /// Start a well-behaved fixture on an ephemeral port
    pub async fn start() -> Self {
        Self::start_with(FixtureBehavior::default()).await
    }

    pub async fn start_with(behavior: FixtureBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind calculator fixture");
        let addr = listener
            .local_addr()
            .expect("Failed to read fixture address");

        let mut fixture = Self {
            addr,
            calculator: Calculator {
                behavior,
                calls: Arc::new(AtomicUsize::new(0)),
            },
            shutdown: None,
            server: None,
        };
        fixture.serve(listener);
        fixture
    }

    /// Reserve a port without serving on it yet; call `restart` to start serving
    pub async fn reserve(behavior: FixtureBehavior) -> Self {
        let mut fixture = Self::start_with(behavior).await;
        fixture.stop().await;
        fixture
    }

    fn serve(&mut self, listener: TcpListener) {
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let service = CalculatorServiceServer::new(self.calculator.clone());
        let addr = self.addr;

        let server = tokio::spawn(async move {
            let result = tonic::transport::Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                    let _ = shutdown_rx.await;
                })
                .await;

            if let Err(error) = result {
                tracing::error!(%addr, error = ?error, "Calculator fixture failed");
            }
        });

        tracing::info!(%addr, "Calculator fixture serving");
        self.shutdown = Some(shutdown_tx);
        self.server = Some(server);
    }

    /// Stop serving; the port stays reserved for `restart`
    pub async fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(server) = self.server.take() {
            // Open streams can hold a graceful shutdown forever
            let abort = server.abort_handle();
            if tokio::time::timeout(Duration::from_secs(2), server).await.is_err() {
                abort.abort();
            }
        }
        tracing::info!(addr = %self.addr, "Calculator fixture stopped");
    }

    /// Serve again on the same address
    pub async fn restart(&mut self) {
        self.stop().await;
        let listener = TcpListener::bind(self.addr)
            .await
            .expect("Failed to rebind calculator fixture");
        self.serve(listener);
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Target string accepted by the connection builder
    pub fn target(&self) -> String {
        self.addr.to_string()
    }

    pub fn is_serving(&self) -> bool {
        self.server.is_some()
    }

    /// Calls handled so far, across restarts
    pub fn calls(&self) -> usize {
        self.calculator.calls.load(Ordering::SeqCst)
    }
}

impl Drop for CalculatorFixture {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(server) = self.server.take() {
            server.abort();
        }
        tracing::debug!(addr = %self.addr, "Cleaning up calculator fixture");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpc::calculator::calculator_service_client::CalculatorServiceClient;
    use tonic::Code;

    async fn client(fixture: &CalculatorFixture) -> CalculatorServiceClient<tonic::transport::Channel> {
        CalculatorServiceClient::connect(format!("http://{}", fixture.addr()))
            .await
            .unwrap()
    }

    #[test]
    fn test_prime_factors() {
        assert_eq!(prime_factors(120), vec![2, 2, 2, 3, 5]);
        assert_eq!(prime_factors(97), vec![97]);
        assert_eq!(prime_factors(1), Vec::<i64>::new());
        assert_eq!(prime_factors(-8), Vec::<i64>::new());
        assert_eq!(prime_factors(12390392840).iter().product::<i64>(), 12390392840);
    }

    #[tokio::test]
    async fn test_sum_and_offset() {
        let fixture = CalculatorFixture::start_with(FixtureBehavior::new().with_sum_offset(100)).await;
        let mut client = client(&fixture).await;

        let response = client
            .sum(SumRequest { first_number: 5, second_number: 40 })
            .await
            .unwrap();
        assert_eq!(response.into_inner().sum_result, 145);
        assert_eq!(fixture.calls(), 1);
    }

    #[tokio::test]
    async fn test_square_root_rejects_negative() {
        let fixture = CalculatorFixture::start().await;
        let mut client = client(&fixture).await;

        let status = client
            .square_root(SquareRootRequest { number: -2 })
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);

        let response = client.square_root(SquareRootRequest { number: 16 }).await.unwrap();
        assert_eq!(response.into_inner().number_root, 4.0);
    }

    #[tokio::test]
    async fn test_restart_keeps_address() {
        let mut fixture = CalculatorFixture::start().await;
        let addr = fixture.addr();

        fixture.stop().await;
        assert!(!fixture.is_serving());

        fixture.restart().await;
        assert!(fixture.is_serving());
        assert_eq!(fixture.addr(), addr);

        let mut client = client(&fixture).await;
        assert!(client.sum(SumRequest { first_number: 1, second_number: 1 }).await.is_ok());
    }
}
