mod golden;
mod presigned;
mod standard;

use anyhow::Result;
use awsign_aws_v4::{Credential, RequestSigner};
use awsign_core::{Context, OsEnv, SignRequest};
use awsign_http_send_reqwest::ReqwestHttpSend;
use http::{Request, StatusCode};
use log::debug;
use reqwest::Client;
use std::env;

/// Load static credential from environment variables
pub fn load_static_credential() -> Credential {
    let access_key =
        env::var("AWSIGN_AWS_V4_ACCESS_KEY").expect("AWSIGN_AWS_V4_ACCESS_KEY must be set");
    let secret_key =
        env::var("AWSIGN_AWS_V4_SECRET_KEY").expect("AWSIGN_AWS_V4_SECRET_KEY must be set");

    let cred = Credential::new(access_key, secret_key);
    match env::var("AWSIGN_AWS_V4_SESSION_TOKEN") {
        Ok(token) => cred.with_session_token(token),
        Err(_) => cred,
    }
}

/// Initialize the live test environment, `None` unless `AWSIGN_AWS_V4_TEST=on`.
pub fn init_signing_test() -> Option<(Context, RequestSigner, String)> {
    let _ = env_logger::builder().is_test(true).try_init();
    let _ = dotenv::dotenv();

    if env::var("AWSIGN_AWS_V4_TEST").ok().as_deref() != Some("on") {
        return None;
    }

    let region = env::var("AWSIGN_AWS_V4_REGION").expect("AWSIGN_AWS_V4_REGION must be set");
    let service = env::var("AWSIGN_AWS_V4_SERVICE").unwrap_or_else(|_| "s3".to_string());
    let url = env::var("AWSIGN_AWS_V4_URL").expect("AWSIGN_AWS_V4_URL must be set");

    let context = Context::new()
        .with_env(OsEnv)
        .with_http_send(ReqwestHttpSend::default());
    let signer = RequestSigner::new(&service, &region).with_double_url_encode(service != "s3");

    Some((context, signer, url))
}

/// Send signed request and return response
pub async fn send_signed_request(
    ctx: &Context,
    signer: &RequestSigner,
    req: Request<String>,
    cred: &Credential,
) -> Result<(StatusCode, String)> {
    let (mut parts, body) = req.into_parts();
    signer
        .sign_request(ctx, &mut parts, Some(cred), None)
        .await
        .expect("sign request must succeed");
    let req = Request::from_parts(parts, body);

    debug!("signed request: {req:?}");

    let resp = Client::new().execute(req.try_into()?).await?;
    let status = resp.status();
    let body = resp.text().await?;

    debug!("response status: {status}, body: {body}");
    Ok((status, body))
}
