use crate::constants::{
    AWS_EC2_METADATA_DISABLED, AWS_EC2_METADATA_SERVICE_ENDPOINT, DEFAULT_EC2_METADATA_ENDPOINT,
    X_AWS_EC2_METADATA_TOKEN, X_AWS_EC2_METADATA_TOKEN_TTL_SECONDS,
};
use crate::Config;
use awsign_core::retry::{RateLimiter, RetryPolicy};
use awsign_core::time::DateTime;
use awsign_core::{Context, Error, Result};
use bytes::Bytes;
use http::header::CONTENT_LENGTH;
use http::{Method, StatusCode};
use log::debug;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// 21600s (6h) is recommended by AWS.
const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(21600);

/// Tokens are refreshed this long before they expire.
const TOKEN_REFRESH_WINDOW: Duration = Duration::from_secs(600);

/// Ec2MetadataClient reads values from the EC2 instance metadata service.
///
/// Every call fetches (or reuses) an IMDSv2 session token, then reads the
/// requested path with it. Both requests run under a [`RetryPolicy`] whose
/// rate limiter backs off when the service throttles.
#[derive(Debug, Clone)]
pub struct Ec2MetadataClient {
    endpoint: Option<String>,
    disabled: bool,
    token_ttl: Duration,
    retry_policy: RetryPolicy,

    token: Arc<Mutex<Option<(String, DateTime)>>>,
}

impl Default for Ec2MetadataClient {
    fn default() -> Self {
        Self {
            endpoint: None,
            disabled: false,
            token_ttl: DEFAULT_TOKEN_TTL,
            retry_policy: RetryPolicy::new().with_rate_limiter(RateLimiter::new()),
            token: Arc::new(Mutex::new(None)),
        }
    }
}

impl Ec2MetadataClient {
    /// Create a new `Ec2MetadataClient` instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a client from a loaded [`Config`].
    ///
    /// The endpoint and the disabled flag come from the config, and the retry
    /// policy honours `max_attempts` with a rate limiter on the context clock.
    pub fn from_config(config: &Config, ctx: &Context) -> Self {
        Self {
            endpoint: config.ec2_metadata_endpoint.clone(),
            disabled: config.ec2_metadata_disabled,
            retry_policy: config.retry_policy(ctx),
            ..Self::default()
        }
    }

    /// Set the endpoint for the metadata service.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Set how long requested session tokens live.
    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    /// Replace the retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    fn endpoint(&self, ctx: &Context) -> String {
        let endpoint = self.endpoint.clone().unwrap_or_else(|| {
            ctx.env_var(AWS_EC2_METADATA_SERVICE_ENDPOINT)
                .unwrap_or_else(|| DEFAULT_EC2_METADATA_ENDPOINT.to_string())
        });
        endpoint.trim_end_matches('/').to_string()
    }

    /// Get the metadata value at `path`, e.g. `/latest/meta-data/instance-id`.
    pub async fn get(&self, ctx: &Context, path: &str) -> Result<String> {
        if self.disabled || ctx.env_var(AWS_EC2_METADATA_DISABLED).as_deref() == Some("true") {
            return Err(Error::config_invalid("instance metadata service is disabled")
                .with_context(format!("hint: unset {AWS_EC2_METADATA_DISABLED}")));
        }

        self.retry_policy
            .run(|| async move {
                let token = self.load_token(ctx).await?;
                self.fetch(ctx, path, &token).await
            })
            .await
            .map_err(|e| e.with_context(format!("path: {path}")))
    }

    async fn load_token(&self, ctx: &Context) -> Result<String> {
        {
            let token = self.token.lock().expect("lock poisoned");
            if let Some((token, refresh_at)) = token.as_ref() {
                if *refresh_at > ctx.now() {
                    return Ok(token.clone());
                }
            }
        }

        let url = format!("{}/latest/api/token", self.endpoint(ctx));
        let req = http::Request::builder()
            .uri(&url)
            .method(Method::PUT)
            .header(CONTENT_LENGTH, "0")
            .header(
                X_AWS_EC2_METADATA_TOKEN_TTL_SECONDS,
                self.token_ttl.as_secs().to_string(),
            )
            .body(Bytes::new())
            .map_err(|e| {
                Error::request_invalid("failed to build IMDS token request")
                    .with_source(e)
                    .with_context(format!("url: {url}"))
            })?;

        let token = read_body("fetch_imds_token", send(ctx, req, "fetch_imds_token").await?)?;

        let lead = TOKEN_REFRESH_WINDOW.min(self.token_ttl);
        let refresh_at = ctx.now()
            + chrono::TimeDelta::from_std(self.token_ttl - lead)
                .unwrap_or(chrono::TimeDelta::zero());
        debug!("fetched IMDS token, refresh after {refresh_at}");

        *self.token.lock().expect("lock poisoned") = Some((token.clone(), refresh_at));
        Ok(token)
    }

    async fn fetch(&self, ctx: &Context, path: &str, token: &str) -> Result<String> {
        let url = format!("{}/{}", self.endpoint(ctx), path.trim_start_matches('/'));
        let req = http::Request::builder()
            .uri(&url)
            .method(Method::GET)
            .header(X_AWS_EC2_METADATA_TOKEN, token)
            .body(Bytes::new())
            .map_err(|e| {
                Error::request_invalid("failed to build IMDS metadata request")
                    .with_source(e)
                    .with_context(format!("url: {url}"))
            })?;

        let resp = send(ctx, req, "fetch_metadata").await?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            // The token was revoked or expired early, fetch a new one next time.
            self.token.lock().expect("lock poisoned").take();
        }
        read_body("fetch_metadata", resp)
    }
}

async fn send(
    ctx: &Context,
    req: http::Request<Bytes>,
    operation: &str,
) -> Result<http::Response<String>> {
    ctx.http_send_as_string(req).await.map_err(|e| {
        Error::unexpected("failed to connect to IMDS")
            .with_source(e)
            .with_context(format!("operation: {operation}"))
            .with_context("hint: check if running on EC2 instance")
            .set_retryable(true)
    })
}

/// Classify the response by status and return its body.
fn read_body(operation: &str, resp: http::Response<String>) -> Result<String> {
    let status = resp.status();
    if !status.is_success() {
        return Err(parse_imds_error(operation, status, resp.body()));
    }

    let body = resp.into_body();
    if body.is_empty() {
        return Err(
            Error::unexpected(format!("IMDS returned an empty body with status {status}"))
                .with_context(format!("operation: {operation}")),
        );
    }
    Ok(body)
}

fn parse_imds_error(operation: &str, status: StatusCode, body: &str) -> Error {
    let message = format!("IMDS request {operation} failed with status {status}");
    let err = match status {
        StatusCode::TOO_MANY_REQUESTS => Error::throttled(message),
        s if s.is_server_error() => Error::unexpected(message).set_retryable(true),
        _ => Error::unexpected(message),
    };

    let err = err.with_context(format!("status: {}", status.as_u16()));
    if body.is_empty() {
        err
    } else {
        err.with_context(format!("response: {body}"))
    }
}
