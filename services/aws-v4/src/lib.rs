//! AWS SigV4 signer
//!
//! ## Example
//!
//! ```no_run
//! use awsign_aws_v4::{RequestSigner, StaticCredentialProvider};
//! use awsign_core::{Context, Result, Signer};
//!
//! # async fn example() -> Result<()> {
//! let signer = Signer::new(
//!     Context::new(),
//!     StaticCredentialProvider::new("access_key_id", "secret_access_key"),
//!     RequestSigner::new("s3", "us-east-1").with_double_url_encode(false),
//! );
//!
//! let mut parts = http::Request::get("https://examplebucket.s3.amazonaws.com/test.txt")
//!     .body(())?
//!     .into_parts()
//!     .0;
//! signer.sign(&mut parts, None).await?;
//! # Ok(())
//! # }
//! ```

mod constants;

mod config;
pub use config::Config;

mod credential;
pub use credential::Credential;

mod provide_credential;
pub use provide_credential::StaticCredentialProvider;

mod canonical;
pub use canonical::CanonicalRequest;

mod key_cache;
pub use key_cache::derive_signing_key;
pub use key_cache::SigningKeyCache;
pub use key_cache::DEFAULT_KEY_CACHE_CAPACITY;

mod payload;
pub use payload::NoopPostSignProcessor;
pub use payload::PayloadHasher;
pub use payload::PostSignProcessor;
pub use payload::ReadSeek;
pub use payload::Sha256PayloadHasher;
pub use payload::SignablePayload;
pub use payload::UnsignedPayloadHasher;

mod sign_request;
pub use sign_request::string_to_sign;
pub use sign_request::RequestSigner;
pub use sign_request::SigningParams;

mod imds;
pub use imds::Ec2MetadataClient;
