//! Canonical form of a request, the first step of SigV4.
//!
//! ```text
//! <METHOD>\n
//! <CanonicalURI>\n
//! <CanonicalQueryString>\n
//! <CanonicalHeaders>\n
//! <SignedHeaders>\n
//! <ContentSHA256>
//! ```

use crate::constants::{
    AWS_PATH_NORMALIZE_SET, AWS_QUERY_ENCODE_SET, AWS_URI_ENCODE_SET,
    HEADERS_EXCLUDED_FROM_SIGNING,
};
use awsign_core::{Result, SigningRequest};
use http::HeaderMap;
use percent_encoding::utf8_percent_encode;
use std::fmt;

/// CanonicalRequest is recomputed for every signing call and never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalRequest {
    method: String,
    path: String,
    query: String,
    headers: Vec<(String, Vec<u8>)>,
    signed_headers: Vec<String>,
    content_sha256: String,
}

impl CanonicalRequest {
    /// Canonicalize the request as it is right now.
    ///
    /// `content_sha256` is written verbatim as the last line.
    pub fn from_request(
        req: &SigningRequest,
        content_sha256: &str,
        double_url_encode: bool,
    ) -> Result<Self> {
        Ok(Self {
            method: req.method.to_string(),
            path: canonical_uri(&req.path, double_url_encode),
            query: canonical_query(&req.query),
            headers: canonical_headers(&req.headers),
            signed_headers: signed_headers(&req.headers),
            content_sha256: content_sha256.to_string(),
        })
    }

    /// Signed header names joined by `;`.
    pub fn signed_headers(&self) -> String {
        self.signed_headers.join(";")
    }

    /// The exact bytes that get hashed into the string to sign.
    ///
    /// Header values are copied as they are on the wire, so values outside
    /// visible ascii (like utf-8 user metadata) are signed byte for byte.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256);
        for line in [&self.method, &self.path, &self.query] {
            buf.extend_from_slice(line.as_bytes());
            buf.push(b'\n');
        }
        for (name, value) in &self.headers {
            buf.extend_from_slice(name.as_bytes());
            buf.push(b':');
            buf.extend_from_slice(value);
            buf.push(b'\n');
        }
        buf.push(b'\n');
        buf.extend_from_slice(self.signed_headers().as_bytes());
        buf.push(b'\n');
        buf.extend_from_slice(self.content_sha256.as_bytes());
        buf
    }
}

impl fmt::Display for CanonicalRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.method)?;
        writeln!(f, "{}", self.path)?;
        writeln!(f, "{}", self.query)?;
        for (name, value) in &self.headers {
            writeln!(f, "{name}:{}", String::from_utf8_lossy(value))?;
        }
        writeln!(f)?;
        writeln!(f, "{}", self.signed_headers())?;
        write!(f, "{}", self.content_sha256)
    }
}

/// URI-encode the path.
///
/// The path arrives percent-encoded as it appears in the uri and is never
/// decoded: existing `%XX` sequences are kept and only characters the uri
/// left bare (like `$`) get encoded. With `double_url_encode` the result is
/// encoded once more, so `%2F` becomes `%252F`.
pub fn canonical_uri(path: &str, double_url_encode: bool) -> String {
    if path.is_empty() {
        return "/".to_string();
    }

    let encoded = utf8_percent_encode(path, &AWS_PATH_NORMALIZE_SET).to_string();
    if double_url_encode {
        utf8_percent_encode(&encoded, &AWS_URI_ENCODE_SET).to_string()
    } else {
        encoded
    }
}

/// Encode every pair, sort by encoded key then encoded value, and join.
///
/// Empty values still get their `=`.
pub fn canonical_query(query: &[(String, String)]) -> String {
    let mut pairs: Vec<(String, String)> = query
        .iter()
        .map(|(k, v)| {
            (
                utf8_percent_encode(k, &AWS_QUERY_ENCODE_SET).to_string(),
                utf8_percent_encode(v, &AWS_QUERY_ENCODE_SET).to_string(),
            )
        })
        .collect();
    pairs.sort();

    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn is_excluded(name: &str) -> bool {
    HEADERS_EXCLUDED_FROM_SIGNING
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Sorted, deduplicated, lowercase header names that take part in signing.
pub fn signed_headers(headers: &HeaderMap) -> Vec<String> {
    let mut names: Vec<String> = headers
        .keys()
        .map(|k| k.as_str().to_ascii_lowercase())
        .filter(|k| !is_excluded(k))
        .collect();
    names.sort_unstable();
    names.dedup();
    names
}

/// One `(name, value)` line per header value, in signed header order.
///
/// Values keep their insertion order within a name. Leading and trailing
/// whitespace is dropped and inner runs are collapsed to a single space.
pub fn canonical_headers(headers: &HeaderMap) -> Vec<(String, Vec<u8>)> {
    let mut lines = Vec::with_capacity(headers.len());
    for name in signed_headers(headers) {
        for value in headers.get_all(name.as_str()) {
            lines.push((name.clone(), compact_whitespace(value.as_bytes())));
        }
    }
    lines
}

fn compact_whitespace(v: &[u8]) -> Vec<u8> {
    v.split(|b| b.is_ascii_whitespace())
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>()
        .join(&b' ')
}
