use crate::canonical::{signed_headers, CanonicalRequest};
use crate::constants::{
    AWS4_HMAC_SHA256, CONTENT_SHA_256_REQUIRED, PRESIGN_MAX_EXPIRATION_SECONDS,
    UNSIGNED_PAYLOAD, X_AMZ_ALGORITHM_QUERY, X_AMZ_CONTENT_SHA_256, X_AMZ_CREDENTIAL_QUERY,
    X_AMZ_DATE, X_AMZ_DATE_QUERY, X_AMZ_EXPIRES_QUERY, X_AMZ_SECURITY_TOKEN,
    X_AMZ_SECURITY_TOKEN_QUERY, X_AMZ_SIGNATURE_QUERY, X_AMZ_SIGNED_HEADERS_QUERY,
};
use crate::key_cache::SigningKeyCache;
use crate::payload::{
    NoopPostSignProcessor, PayloadHasher, PostSignProcessor, Sha256PayloadHasher,
    SignablePayload,
};
use crate::Credential;
use async_trait::async_trait;
use awsign_core::hash::{hex_hmac_sha256, hex_sha256};
use awsign_core::time::{format_date, format_iso8601, format_rfc3339, DateTime};
use awsign_core::{Context, Error, Result, SignRequest, SigningRequest};
use http::header::{HeaderName, AUTHORIZATION, HOST};
use http::request::Parts;
use log::debug;
use std::sync::Arc;
use std::time::Duration;

/// Parameters of a single signing call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningParams {
    /// Region, e.g. `us-east-1`.
    pub region: String,
    /// Signing name of the service, e.g. `s3`.
    pub service: String,
    /// Time the request is signed at.
    pub signing_time: DateTime,
    /// Encode the already encoded path once more.
    pub double_url_encode: bool,
    /// When a presigned request stops being valid. Presign only.
    pub expiration: Option<DateTime>,
}

impl SigningParams {
    /// Create params with double url encoding on and no expiration.
    pub fn new(region: &str, service: &str, signing_time: DateTime) -> Self {
        Self {
            region: region.to_string(),
            service: service.to_string(),
            signing_time,
            double_url_encode: true,
            expiration: None,
        }
    }

    /// Set whether the path is double url encoded.
    pub fn with_double_url_encode(mut self, double_url_encode: bool) -> Self {
        self.double_url_encode = double_url_encode;
        self
    }

    /// Set the absolute expiration time of a presigned request.
    pub fn with_expiration(mut self, expiration: DateTime) -> Self {
        self.expiration = Some(expiration);
        self
    }

    /// Set the expiration relative to the signing time.
    pub fn with_expires_in(self, expires_in: Duration) -> Self {
        // Out of range durations saturate, and are then refused as too long.
        let expiration = chrono::TimeDelta::from_std(expires_in)
            .ok()
            .and_then(|d| self.signing_time.checked_add_signed(d))
            .unwrap_or(DateTime::MAX_UTC);
        self.with_expiration(expiration)
    }

    /// Credential scope: `20130524/us-east-1/s3/aws4_request`.
    pub fn scope(&self) -> String {
        format!(
            "{}/{}/{}/aws4_request",
            format_date(self.signing_time),
            self.region,
            self.service
        )
    }

    /// Seconds a presigned request stays valid, checked against the 7 day cap.
    fn expires_in_seconds(&self) -> Result<i64> {
        let Some(expiration) = self.expiration else {
            return Ok(PRESIGN_MAX_EXPIRATION_SECONDS);
        };

        let seconds = (expiration - self.signing_time).num_seconds();
        if seconds > PRESIGN_MAX_EXPIRATION_SECONDS {
            return Err(Error::config_invalid(format!(
                "Requests that are pre-signed by SigV4 algorithm are valid for at most 7 days. \
                 The expiration date set on the current request [{}] has exceeded this limit.",
                format_rfc3339(expiration)
            )));
        }
        if seconds <= 0 {
            return Err(Error::config_invalid(format!(
                "presign expiration [{}] must be later than the signing time [{}]",
                format_rfc3339(expiration),
                format_rfc3339(self.signing_time)
            )));
        }
        Ok(seconds)
    }
}

/// RequestSigner that implement AWS SigV4.
///
/// - [Signature Version 4 signing process](https://docs.aws.amazon.com/general/latest/gr/signature-version-4.html)
///
/// The signing keys are taken from a [`SigningKeyCache`], shared process-wide
/// unless another one is given with [`RequestSigner::with_key_cache`].
#[derive(Debug, Clone)]
pub struct RequestSigner {
    service: String,
    region: String,
    double_url_encode: bool,

    key_cache: Arc<SigningKeyCache>,
    payload_hasher: Arc<dyn PayloadHasher>,
    presign_payload_hasher: Option<Arc<dyn PayloadHasher>>,
    post_sign_processor: Arc<dyn PostSignProcessor>,

    time: Option<DateTime>,
}

impl RequestSigner {
    /// Create a new signer for AWS SigV4.
    pub fn new(service: &str, region: &str) -> Self {
        Self {
            service: service.into(),
            region: region.into(),
            double_url_encode: true,

            key_cache: SigningKeyCache::shared(),
            payload_hasher: Arc::new(Sha256PayloadHasher),
            presign_payload_hasher: None,
            post_sign_processor: Arc::new(NoopPostSignProcessor),

            time: None,
        }
    }

    /// Set whether the path is encoded twice. Defaults to `true`.
    ///
    /// Object storage expects `false`.
    pub fn with_double_url_encode(mut self, double_url_encode: bool) -> Self {
        self.double_url_encode = double_url_encode;
        self
    }

    /// Use the given signing key cache.
    pub fn with_key_cache(mut self, key_cache: Arc<SigningKeyCache>) -> Self {
        self.key_cache = key_cache;
        self
    }

    /// Use the given hasher for the payload when signing.
    pub fn with_payload_hasher(mut self, hasher: impl PayloadHasher) -> Self {
        self.payload_hasher = Arc::new(hasher);
        self
    }

    /// Use the given hasher for the payload when presigning.
    ///
    /// Falls back to the signing hasher when unset.
    pub fn with_presign_payload_hasher(mut self, hasher: impl PayloadHasher) -> Self {
        self.presign_payload_hasher = Some(Arc::new(hasher));
        self
    }

    /// Run the given processor after every signature.
    pub fn with_post_sign_processor(mut self, processor: impl PostSignProcessor) -> Self {
        self.post_sign_processor = Arc::new(processor);
        self
    }

    /// Specify the signing time.
    ///
    /// # Note
    ///
    /// We should always take current time to sign requests.
    /// Only use this function for testing.
    pub fn with_time(mut self, time: DateTime) -> Self {
        self.time = Some(time);
        self
    }

    /// Build the params for a signing call made at `now`.
    pub fn signing_params(&self, now: DateTime, expires_in: Option<Duration>) -> SigningParams {
        let params = SigningParams::new(&self.region, &self.service, self.time.unwrap_or(now))
            .with_double_url_encode(self.double_url_encode);
        match expires_in {
            Some(d) => params.with_expires_in(d),
            None => params,
        }
    }

    /// Sign the request with an `Authorization` header.
    ///
    /// Anonymous credentials leave the request untouched.
    pub fn sign(
        &self,
        req: &mut SigningRequest,
        payload: &mut SignablePayload,
        cred: &Credential,
        params: &SigningParams,
    ) -> Result<()> {
        let cred = cred.sanitized();
        let cred = cred.as_ref();
        if cred.is_anonymous() {
            debug!("anonymous credential, skip signing");
            return Ok(());
        }

        if let Some(token) = &cred.session_token {
            req.header_insert_sensitive(HeaderName::from_static(X_AMZ_SECURITY_TOKEN), token)?;
        }
        req.header_insert(HOST, &req.host_header_value())?;
        req.header_insert(
            HeaderName::from_static(X_AMZ_DATE),
            &format_iso8601(params.signing_time),
        )?;

        let content_sha256 = self.payload_hasher.content_hash(req, payload)?;
        let content_sha256_header = HeaderName::from_static(X_AMZ_CONTENT_SHA_256);
        if req.header_get(&content_sha256_header) == Some(CONTENT_SHA_256_REQUIRED) {
            req.header_insert(content_sha256_header, &content_sha256)?;
        }

        let creq = CanonicalRequest::from_request(req, &content_sha256, params.double_url_encode)?;
        let (signature, signing_key) = self.calculate_signature(&creq, cred, params);

        req.header_insert_sensitive(
            AUTHORIZATION,
            &format!(
                "{AWS4_HMAC_SHA256} Credential={}/{}, SignedHeaders={}, Signature={signature}",
                cred.access_key_id,
                params.scope(),
                creq.signed_headers(),
            ),
        )?;

        self.post_sign_processor
            .process(req, payload, &signature, &signing_key, params)
    }

    /// Presign the request: the signature and its inputs go into the query.
    ///
    /// Anonymous credentials leave the request untouched.
    pub fn presign(
        &self,
        req: &mut SigningRequest,
        payload: &mut SignablePayload,
        cred: &Credential,
        params: &SigningParams,
    ) -> Result<()> {
        let cred = cred.sanitized();
        let cred = cred.as_ref();
        if cred.is_anonymous() {
            debug!("anonymous credential, skip presigning");
            return Ok(());
        }

        let expires_in = params.expires_in_seconds()?;
        req.header_insert(HOST, &req.host_header_value())?;

        if let Some(token) = &cred.session_token {
            req.query_push(X_AMZ_SECURITY_TOKEN_QUERY, token);
        }
        req.query_push(X_AMZ_ALGORITHM_QUERY, AWS4_HMAC_SHA256);
        req.query_push(X_AMZ_DATE_QUERY, format_iso8601(params.signing_time));
        req.query_push(
            X_AMZ_SIGNED_HEADERS_QUERY,
            signed_headers(&req.headers).join(";"),
        );
        req.query_push(X_AMZ_EXPIRES_QUERY, expires_in.to_string());
        req.query_push(
            X_AMZ_CREDENTIAL_QUERY,
            format!("{}/{}", cred.access_key_id, params.scope()),
        );

        let hasher = self
            .presign_payload_hasher
            .as_ref()
            .unwrap_or(&self.payload_hasher);
        let content_sha256 = hasher.content_hash(req, payload)?;

        let creq = CanonicalRequest::from_request(req, &content_sha256, params.double_url_encode)?;
        let (signature, _) = self.calculate_signature(&creq, cred, params);

        req.query_push(X_AMZ_SIGNATURE_QUERY, signature);
        Ok(())
    }

    fn calculate_signature(
        &self,
        creq: &CanonicalRequest,
        cred: &Credential,
        params: &SigningParams,
    ) -> (String, [u8; 32]) {
        debug!("calculated canonical request: {creq}");

        let string_to_sign = string_to_sign(creq, params);
        debug!("calculated string to sign: {string_to_sign}");

        let signing_key = self.key_cache.signing_key(
            cred,
            params.signing_time,
            &params.region,
            &params.service,
        );
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());
        (signature, signing_key)
    }

    /// Sign `http::request::Parts` with an explicit payload.
    pub fn sign_parts(
        &self,
        parts: &mut Parts,
        payload: &mut SignablePayload,
        cred: Option<&Credential>,
        params: &SigningParams,
        presign: bool,
    ) -> Result<()> {
        let mut req = SigningRequest::build(parts)?;

        if let Some(cred) = cred {
            let signed = if presign {
                self.presign(&mut req, payload, cred, params)
            } else {
                self.sign(&mut req, payload, cred, params)
            };
            if let Err(err) = signed {
                // Give the request back before bailing out.
                req.apply(parts)?;
                return Err(err);
            }
        }

        req.apply(parts)
    }
}

/// StringToSign:
///
/// ```text
/// AWS4-HMAC-SHA256
/// 20220313T072004Z
/// 20220313/<region>/<service>/aws4_request
/// <hashed_canonical_request>
/// ```
pub fn string_to_sign(creq: &CanonicalRequest, params: &SigningParams) -> String {
    format!(
        "{AWS4_HMAC_SHA256}\n{}\n{}\n{}",
        format_iso8601(params.signing_time),
        params.scope(),
        hex_sha256(&creq.to_bytes())
    )
}

#[async_trait]
impl SignRequest for RequestSigner {
    type Credential = Credential;

    async fn sign_request(
        &self,
        ctx: &Context,
        req: &mut Parts,
        credential: Option<&Self::Credential>,
        expires_in: Option<Duration>,
    ) -> Result<()> {
        let params = self.signing_params(ctx.now(), expires_in);

        // Parts carry no body: trust a hash given in x-amz-content-sha256,
        // otherwise leave the payload unsigned.
        let mut payload = match req
            .headers
            .get(X_AMZ_CONTENT_SHA_256)
            .and_then(|v| v.to_str().ok())
        {
            Some(v) if v != CONTENT_SHA_256_REQUIRED => SignablePayload::Precomputed(v.to_string()),
            _ => SignablePayload::Unsigned,
        };
        if expires_in.is_none() && !req.headers.contains_key(X_AMZ_CONTENT_SHA_256) {
            req.headers.insert(
                X_AMZ_CONTENT_SHA_256,
                http::HeaderValue::from_static(UNSIGNED_PAYLOAD),
            );
        }

        self.sign_parts(req, &mut payload, credential, &params, expires_in.is_some())
    }
}
