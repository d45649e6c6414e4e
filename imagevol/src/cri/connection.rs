//! Runtime connection manager.
//!
//! Dials the CRI endpoint and waits until the runtime answers `Version`,
//! retrying with bounded exponential backoff under an overall deadline.
//! The resulting [`Channel`] is shared by every client; tonic re-dials it
//! transparently when the runtime restarts.

use std::path::PathBuf;
use std::time::Duration;

use hyper_util::rt::TokioIo;
use imagevol_shared::cri::VersionRequest;
use imagevol_shared::cri::runtime_service_client::RuntimeServiceClient;
use imagevol_shared::errors::{ImagevolError, ImagevolResult};
use tokio::net::UnixStream;
use tokio::time::Instant;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

/// Where the runtime listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEndpoint {
    Unix(PathBuf),
    Tcp(String),
}

impl RuntimeEndpoint {
    /// Accepts `unix:///path`, a bare absolute path, or an `http(s)://` URL.
    pub fn parse(address: &str) -> ImagevolResult<Self> {
        if let Some(path) = address.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(ImagevolError::Config(format!(
                    "runtime endpoint has no socket path: {}",
                    address
                )));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if address.starts_with('/') {
            return Ok(Self::Unix(PathBuf::from(address)));
        }
        if address.starts_with("http://") || address.starts_with("https://") {
            return Ok(Self::Tcp(address.to_string()));
        }
        Err(ImagevolError::Config(format!(
            "unsupported runtime endpoint: {}",
            address
        )))
    }

    async fn dial(&self, call_timeout: Duration) -> ImagevolResult<Channel> {
        match self {
            Self::Unix(path) => {
                let path = path.clone();
                // The URI is ignored by the connector; tonic only needs a valid one.
                let channel = Endpoint::from_static("http://[::]:50051")
                    .connect_timeout(call_timeout)
                    .connect_with_connector(service_fn(move |_: Uri| {
                        let path = path.clone();
                        async move {
                            Ok::<_, std::io::Error>(TokioIo::new(
                                UnixStream::connect(path).await?,
                            ))
                        }
                    }))
                    .await?;
                Ok(channel)
            }
            Self::Tcp(url) => {
                let channel = Endpoint::from_shared(url.clone())
                    .map_err(|e| ImagevolError::Config(format!("invalid endpoint {}: {}", url, e)))?
                    .connect_timeout(call_timeout)
                    .connect()
                    .await?;
                Ok(channel)
            }
        }
    }
}

impl std::fmt::Display for RuntimeEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
            Self::Tcp(url) => write!(f, "{}", url),
        }
    }
}

/// Exponential backoff: doubles from `initial` and saturates at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial.min(max),
            max,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }
}

/// Readiness wait parameters.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Overall deadline for the runtime to become ready.
    pub timeout: Duration,
    /// Deadline for a single dial plus `Version` probe.
    pub attempt_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            attempt_timeout: Duration::from_secs(5),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// A ready connection to the runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConnection {
    pub channel: Channel,
    pub runtime_name: String,
    pub runtime_version: String,
}

/// Connect to the runtime and block until it reports ready.
///
/// Fails with [`ImagevolError::Connection`] once `options.timeout` elapses.
pub async fn connect(
    endpoint: &RuntimeEndpoint,
    options: &ConnectOptions,
) -> ImagevolResult<RuntimeConnection> {
    let deadline = Instant::now() + options.timeout;
    let mut backoff = Backoff::new(options.initial_backoff, options.max_backoff);
    let mut attempts: u32 = 0;
    let mut last_error = String::from("no attempt made");

    loop {
        attempts += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let budget = remaining.min(options.attempt_timeout);

        match tokio::time::timeout(budget, probe(endpoint, budget)).await {
            Ok(Ok(conn)) => {
                tracing::info!(
                    endpoint = %endpoint,
                    attempts,
                    runtime = %conn.runtime_name,
                    version = %conn.runtime_version,
                    "Connected to container runtime"
                );
                return Ok(conn);
            }
            Ok(Err(e)) => last_error = e.to_string(),
            Err(_) => last_error = format!("attempt timed out after {:?}", budget),
        }

        let delay = backoff.next_delay();
        if Instant::now() + delay >= deadline {
            return Err(ImagevolError::Connection(format!(
                "runtime at {} not ready after {:?} ({} attempts): {}",
                endpoint, options.timeout, attempts, last_error
            )));
        }

        tracing::debug!(
            endpoint = %endpoint,
            attempt = attempts,
            retry_in = ?delay,
            "Runtime not ready: {}",
            last_error
        );
        tokio::time::sleep(delay).await;
    }
}

async fn probe(endpoint: &RuntimeEndpoint, budget: Duration) -> ImagevolResult<RuntimeConnection> {
    let channel = endpoint.dial(budget).await?;
    let mut client = RuntimeServiceClient::new(channel.clone());
    let version = client
        .version(VersionRequest {
            version: String::new(),
        })
        .await?
        .into_inner();

    Ok(RuntimeConnection {
        channel,
        runtime_name: version.runtime_name,
        runtime_version: version.runtime_version,
    })
}
