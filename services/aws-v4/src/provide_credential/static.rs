use crate::{Config, Credential};
use async_trait::async_trait;
use awsign_core::{Context, ProvideCredential, Result};

/// StaticCredentialProvider hands out the same access key pair every time.
///
/// The signer treats the credential as opaque input: nothing here refreshes,
/// chains or discovers credentials.
#[derive(Debug, Clone)]
pub struct StaticCredentialProvider {
    credential: Credential,
}

impl StaticCredentialProvider {
    /// Create a new StaticCredentialProvider with access key ID and secret access key.
    pub fn new(access_key_id: &str, secret_access_key: &str) -> Self {
        Self {
            credential: Credential::new(access_key_id, secret_access_key),
        }
    }

    /// Build the provider from the keys in `cfg`, if both are present.
    pub fn from_config(cfg: &Config) -> Option<Self> {
        cfg.credential().map(|credential| Self { credential })
    }

    /// Set the session token.
    pub fn with_session_token(mut self, token: &str) -> Self {
        self.credential.session_token = Some(token.to_string());
        self
    }
}

#[async_trait]
impl ProvideCredential for StaticCredentialProvider {
    type Credential = Credential;

    async fn provide_credential(&self, _: &Context) -> Result<Option<Self::Credential>> {
        Ok(Some(self.credential.clone()))
    }
}
