use crate::constants::*;
use crate::{Credential, SigningParams};
use awsign_core::retry::{RateLimiter, RetryPolicy};
use awsign_core::time::DateTime;
use awsign_core::{Context, Error, Result};
use log::warn;

/// Config for aws services.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// `region` will be loaded from:
    ///
    /// - this field if it's `is_some`
    /// - env value: [`AWS_REGION`]
    pub region: Option<String>,
    /// `access_key_id` will be loaded from
    ///
    /// - this field if it's `is_some`
    /// - env value: [`AWS_ACCESS_KEY_ID`]
    pub access_key_id: Option<String>,
    /// `secret_access_key` will be loaded from
    ///
    /// - this field if it's `is_some`
    /// - env value: [`AWS_SECRET_ACCESS_KEY`]
    pub secret_access_key: Option<String>,
    /// `session_token` will be loaded from
    ///
    /// - this field if it's `is_some`
    /// - env value: [`AWS_SESSION_TOKEN`]
    pub session_token: Option<String>,
    /// `max_attempts` will be loaded from
    ///
    /// - env value: [`AWS_MAX_ATTEMPTS`]
    /// - default to `4`
    pub max_attempts: u32,
    /// `ec2_metadata_endpoint` will be loaded from
    ///
    /// - this field if it's `is_some`
    /// - env value: [`AWS_EC2_METADATA_SERVICE_ENDPOINT`]
    pub ec2_metadata_endpoint: Option<String>,
    /// `ec2_metadata_disabled` value will be loaded from:
    ///
    /// - this field
    /// - env value: [`AWS_EC2_METADATA_DISABLED`]
    pub ec2_metadata_disabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            region: None,
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            max_attempts: 4,
            ec2_metadata_endpoint: None,
            ec2_metadata_disabled: false,
        }
    }
}

impl Config {
    /// Load config from env.
    ///
    /// Values already set on `self` win over the environment.
    pub fn from_env(mut self, ctx: &Context) -> Self {
        let envs = ctx.env_vars();

        if self.region.is_none() {
            self.region = envs.get(AWS_REGION).cloned();
        }
        if self.access_key_id.is_none() {
            self.access_key_id = envs.get(AWS_ACCESS_KEY_ID).cloned();
        }
        if self.secret_access_key.is_none() {
            self.secret_access_key = envs.get(AWS_SECRET_ACCESS_KEY).cloned();
        }
        if self.session_token.is_none() {
            self.session_token = envs.get(AWS_SESSION_TOKEN).cloned();
        }
        if let Some(v) = envs.get(AWS_MAX_ATTEMPTS) {
            match v.parse::<u32>() {
                Ok(n) if n > 0 => self.max_attempts = n,
                _ => warn!("ignore invalid {AWS_MAX_ATTEMPTS}: {v}"),
            }
        }
        if self.ec2_metadata_endpoint.is_none() {
            self.ec2_metadata_endpoint = envs.get(AWS_EC2_METADATA_SERVICE_ENDPOINT).cloned();
        }
        if let Some(v) = envs.get(AWS_EC2_METADATA_DISABLED) {
            self.ec2_metadata_disabled |= v == "true";
        }
        self
    }

    /// The static credential described by this config, if both keys are set.
    pub fn credential(&self) -> Option<Credential> {
        let (Some(ak), Some(sk)) = (&self.access_key_id, &self.secret_access_key) else {
            return None;
        };

        let cred = Credential::new(ak, sk);
        Some(match &self.session_token {
            Some(token) => cred.with_session_token(token),
            None => cred,
        })
    }

    /// Signing params for `service` in the configured region.
    pub fn signing_params(&self, service: &str, time: DateTime) -> Result<SigningParams> {
        let region = self.region.as_deref().ok_or_else(|| {
            Error::config_invalid("region is required to sign requests")
                .with_context(format!("hint: set {AWS_REGION}"))
        })?;
        Ok(SigningParams::new(region, service, time))
    }

    /// Build the retry policy: `max_attempts` attempts gated by an adaptive
    /// rate limiter that reads time from the context clock.
    pub fn retry_policy(&self, ctx: &Context) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_attempts(self.max_attempts)
            .with_rate_limiter(RateLimiter::with_shared_clock(ctx.clock()))
    }
}
