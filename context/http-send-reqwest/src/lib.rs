//! [`HttpSend`] backed by [`reqwest`].

use async_trait::async_trait;
use awsign_core::{Error, HttpSend, Result};
use bytes::Bytes;
use http_body_util::BodyExt;
use reqwest::{Client, Request};

/// ReqwestHttpSend sends requests with a `reqwest::Client`.
///
/// Connect failures and timeouts come back as retryable errors so that a
/// retry policy can try again.
#[derive(Debug, Default)]
pub struct ReqwestHttpSend {
    client: Client,
}

impl ReqwestHttpSend {
    /// Create a new ReqwestHttpSend with a reqwest::Client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpSend for ReqwestHttpSend {
    async fn http_send(&self, req: http::Request<Bytes>) -> Result<http::Response<Bytes>> {
        let req = Request::try_from(req).map_err(|e| {
            Error::request_invalid("failed to convert request for reqwest").with_source(e)
        })?;
        let resp: http::Response<_> = self
            .client
            .execute(req)
            .await
            .map_err(map_reqwest_error)?
            .into();

        let (parts, body) = resp.into_parts();
        let bs = BodyExt::collect(body)
            .await
            .map(|buf| buf.to_bytes())
            .map_err(map_reqwest_error)?;
        Ok(http::Response::from_parts(parts, bs))
    }
}

fn map_reqwest_error(e: reqwest::Error) -> Error {
    let retryable = e.is_connect() || e.is_timeout() || e.is_body();
    let err = if e.is_timeout() {
        Error::unexpected("http request timed out")
    } else {
        Error::unexpected("failed to send http request")
    };
    err.with_source(e).set_retryable(retryable)
}
