//! HTTP transport and retry logic for posting updates.
//!
//! The transport is a trait so the worker can be driven by a real reqwest
//! client in production and by a scripted fake in tests. Every attempt has a
//! fixed timeout; failed attempts are retried after a fixed delay up to a
//! bounded number of tries.

use std::future::Future;
use std::time::Duration;

use reqwest::header::USER_AGENT;
use reqwest::{Client, StatusCode, Url};
use tracing::{debug, warn};

use crate::protocol::Protocol;

/// Response from the destination, reduced to what classification needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: StatusCode,
    pub body: String,
}

impl HttpReply {
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// Errors that can occur during HTTP client operations.
#[derive(Debug)]
pub enum ClientError {
    /// HTTP request failed
    Request(reqwest::Error),

    /// Request timeout
    Timeout,

    /// Client configuration error
    Config(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Request(e) => write!(f, "HTTP request failed: {}", e),
            ClientError::Timeout => write!(f, "Request timed out"),
            ClientError::Config(e) => write!(f, "Client configuration error: {}", e),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Request(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout
        } else {
            ClientError::Request(err)
        }
    }
}

/// Classification of a single attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostOutcome {
    /// The destination accepted the update
    Success,

    /// The attempt failed but may succeed if repeated
    Retryable(String),

    /// The post must not be attempted (again)
    Aborted(String),
}

/// Why a record was dropped without being posted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The record is older than the configured maximum age
    Stale { age_secs: i64 },

    /// No mapped field had a value
    NoData,
}

/// Final report for a single record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Delivered { attempts: u32 },
    Failed { attempts: u32, last_error: String },
    Aborted(String),
    Skipped(SkipReason),

    /// Processing the record failed before or outside of the HTTP exchange
    Abandoned(String),
}

/// Something that can issue a GET request.
pub trait Transport: Send + Sync + 'static {
    fn get(&self, url: &Url) -> impl Future<Output = Result<HttpReply, ClientError>> + Send;
}

/// Transport backed by a pooled reqwest client.
///
/// # Example
///
/// ```no_run
/// use meteotemplate_uploader::client::{HttpTransport, Transport};
/// use reqwest::Url;
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() {
///     let transport = HttpTransport::new(Duration::from_secs(10), "example/1.0")
///         .expect("Failed to create client");
///     let url = Url::parse("http://localhost/plugins/api/update.php?PASS=x&U=1&T=1").unwrap();
///     match transport.get(&url).await {
///         Ok(reply) => println!("{}: {}", reply.status, reply.body),
///         Err(e) => eprintln!("Failed to send: {}", e),
///     }
/// }
/// ```
pub struct HttpTransport {
    /// The underlying HTTP client (reused for connection pooling)
    client: Client,

    /// Request timeout duration
    timeout: Duration,

    /// Value of the User-Agent header
    user_agent: String,
}

impl HttpTransport {
    /// Create a new transport with the given per-attempt timeout.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Config` if the HTTP client cannot be built.
    pub fn new(timeout: Duration, user_agent: impl Into<String>) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(2)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ClientError::Config(e.to_string()))?;

        Ok(Self {
            client,
            timeout,
            user_agent: user_agent.into(),
        })
    }

    /// Get the request timeout duration.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Transport for HttpTransport {
    fn get(&self, url: &Url) -> impl Future<Output = Result<HttpReply, ClientError>> + Send {
        let request = self
            .client
            .get(url.clone())
            .timeout(self.timeout)
            .header(USER_AGENT, self.user_agent.clone());

        async move {
            let response = request.send().await?;
            let status = response.status();
            let body = response.text().await?;
            Ok(HttpReply { status, body })
        }
    }
}

/// Issue the request until it succeeds, is aborted, or `max_tries` is used up.
///
/// Transport errors and responses the protocol rejects as retryable are
/// retried after `retry_wait`. Exhausting attempts is reported, not raised.
pub async fn post_with_retries<T, P>(
    transport: &T,
    protocol: &P,
    url: &Url,
    max_tries: u32,
    retry_wait: Duration,
) -> Delivery
where
    T: Transport,
    P: Protocol,
{
    let max_tries = max_tries.max(1);
    let mut last_error = String::from("no attempt made");

    for attempt in 1..=max_tries {
        if attempt > 1 {
            debug!(
                attempt = attempt,
                delay_ms = retry_wait.as_millis() as u64,
                "Retrying after failure"
            );
            tokio::time::sleep(retry_wait).await;
        }

        let outcome = match transport.get(url).await {
            Ok(reply) => protocol.check_response(&reply),
            Err(e) => PostOutcome::Retryable(e.to_string()),
        };

        match outcome {
            PostOutcome::Success => return Delivery::Delivered { attempts: attempt },
            PostOutcome::Aborted(reason) => return Delivery::Aborted(reason),
            PostOutcome::Retryable(reason) => {
                warn!(
                    protocol = protocol.name(),
                    attempt = attempt,
                    max_tries = max_tries,
                    error = %reason,
                    "Failed upload attempt"
                );
                last_error = reason;
            }
        }
    }

    Delivery::Failed {
        attempts: max_tries,
        last_error,
    }
}
