//! Payload hashing and post-sign hooks.

use crate::constants::UNSIGNED_PAYLOAD;
use crate::SigningParams;
use awsign_core::hash::{hex_sha256, hex_sha256_reader};
use awsign_core::{Error, Result, SigningRequest};
use bytes::Bytes;
use std::fmt;
use std::io::{Read, Seek, SeekFrom};

/// A readable and rewindable payload stream.
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// Body of the request being signed.
pub enum SignablePayload {
    /// No body at all.
    Empty,
    /// Body fully in memory.
    Bytes(Bytes),
    /// Body that has to be read to be hashed. It's rewound to where it
    /// started once hashed, so it can be sent afterwards.
    Stream(Box<dyn ReadSeek>),
    /// A hash or marker computed elsewhere, used as-is.
    Precomputed(String),
    /// Don't sign the body.
    Unsigned,
}

impl fmt::Debug for SignablePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignablePayload::Empty => f.write_str("Empty"),
            SignablePayload::Bytes(bs) => write!(f, "Bytes({} bytes)", bs.len()),
            SignablePayload::Stream(_) => f.write_str("Stream"),
            SignablePayload::Precomputed(h) => f.debug_tuple("Precomputed").field(h).finish(),
            SignablePayload::Unsigned => f.write_str("Unsigned"),
        }
    }
}

/// PayloadHasher produces the value of the last line of the canonical request.
///
/// Implementations may also adjust headers, e.g. for chunked uploads that
/// replace the body hash with a marker.
pub trait PayloadHasher: fmt::Debug + Send + Sync + 'static {
    /// Compute the content hash of the payload.
    fn content_hash(
        &self,
        req: &mut SigningRequest,
        payload: &mut SignablePayload,
    ) -> Result<String>;
}

/// Hex encoded SHA256 of the payload. This is the default.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256PayloadHasher;

impl PayloadHasher for Sha256PayloadHasher {
    fn content_hash(
        &self,
        _: &mut SigningRequest,
        payload: &mut SignablePayload,
    ) -> Result<String> {
        match payload {
            SignablePayload::Empty => Ok(hex_sha256(b"")),
            SignablePayload::Bytes(bs) => Ok(hex_sha256(bs)),
            SignablePayload::Stream(r) => hash_stream(r.as_mut()),
            SignablePayload::Precomputed(hash) => Ok(hash.clone()),
            SignablePayload::Unsigned => Ok(UNSIGNED_PAYLOAD.to_string()),
        }
    }
}

fn hash_stream(r: &mut dyn ReadSeek) -> Result<String> {
    let start = r.stream_position().map_err(|e| {
        Error::unexpected("unable to read stream position before hashing payload").with_source(e)
    })?;
    let hashed = hex_sha256_reader(r);
    // Rewind on every path, including a failed read.
    let reset = r.seek(SeekFrom::Start(start));

    let hash =
        hashed.map_err(|e| Error::unexpected("unable to read payload stream").with_source(e))?;
    reset.map_err(|e| {
        Error::unexpected("unable to reset stream after calculating AWS4 signature").with_source(e)
    })?;
    Ok(hash)
}

/// Always `UNSIGNED-PAYLOAD`, used when presigning object storage urls.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsignedPayloadHasher;

impl PayloadHasher for UnsignedPayloadHasher {
    fn content_hash(&self, _: &mut SigningRequest, _: &mut SignablePayload) -> Result<String> {
        Ok(UNSIGNED_PAYLOAD.to_string())
    }
}

/// PostSignProcessor runs after the `Authorization` header is in place.
///
/// It receives the signature and the signing key, which is what chunked
/// payload signing needs to chain per-chunk signatures.
pub trait PostSignProcessor: fmt::Debug + Send + Sync + 'static {
    /// Process the signed request.
    fn process(
        &self,
        req: &mut SigningRequest,
        payload: &mut SignablePayload,
        signature: &str,
        signing_key: &[u8; 32],
        params: &SigningParams,
    ) -> Result<()>;
}

/// Does nothing. This is the default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPostSignProcessor;

impl PostSignProcessor for NoopPostSignProcessor {
    fn process(
        &self,
        _: &mut SigningRequest,
        _: &mut SignablePayload,
        _: &str,
        _: &[u8; 32],
        _: &SigningParams,
    ) -> Result<()> {
        Ok(())
    }
}
