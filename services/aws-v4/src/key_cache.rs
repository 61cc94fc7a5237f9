use crate::constants::AWS4_TERMINATOR;
use crate::Credential;
use awsign_core::hash::{hex_sha256, hmac_sha256};
use awsign_core::time::{days_since_epoch, format_date, DateTime};
use log::debug;
use once_cell::sync::Lazy;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};

/// Default number of signing keys kept by a cache.
pub const DEFAULT_KEY_CACHE_CAPACITY: usize = 300;

static SHARED: Lazy<Arc<SigningKeyCache>> = Lazy::new(|| Arc::new(SigningKeyCache::default()));

/// Derive the SigV4 signing key for the given day, region and service.
///
/// ```text
/// kSecret  = "AWS4" + secret
/// kDate    = HMAC(kSecret, "20130524")
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
pub fn derive_signing_key(secret: &str, date: DateTime, region: &str, service: &str) -> [u8; 32] {
    let secret = format!("AWS4{secret}");
    let sign_date = hmac_sha256(secret.as_bytes(), format_date(date).as_bytes());
    let sign_region = hmac_sha256(&sign_date, region.as_bytes());
    let sign_service = hmac_sha256(&sign_region, service.as_bytes());
    hmac_sha256(&sign_service, AWS4_TERMINATOR.as_bytes())
}

/// Bounded FIFO cache of derived signing keys.
///
/// Entries are keyed by a digest of the secret plus region and service, and
/// carry the day they were derived for. A key for a new day is a miss: it gets
/// derived and inserted in a fresh slot while yesterday's entry ages out
/// with FIFO order. Eviction ignores how often an entry is used.
///
/// One cache is meant to be shared by many signers through an `Arc`.
pub struct SigningKeyCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    /// Keyed by `(secret digest-region-service, days since epoch)`.
    entries: HashMap<(String, i64), [u8; 32]>,
    order: VecDeque<(String, i64)>,
}

impl fmt::Debug for SigningKeyCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKeyCache")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

impl Default for SigningKeyCache {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_CACHE_CAPACITY)
    }
}

impl SigningKeyCache {
    /// Create a cache holding at most `capacity` keys.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// The process-wide cache used by signers that were not given one.
    pub fn shared() -> Arc<SigningKeyCache> {
        SHARED.clone()
    }

    /// Return the signing key for the credential on the given date, deriving
    /// and caching it on a miss.
    pub fn signing_key(
        &self,
        cred: &Credential,
        date: DateTime,
        region: &str,
        service: &str,
    ) -> [u8; 32] {
        let cache_key = format!(
            "{}-{region}-{service}",
            hex_sha256(cred.secret_access_key.as_bytes())
        );
        let day = days_since_epoch(date);
        let slot = (cache_key, day);

        if let Some(key) = self.lock().entries.get(&slot) {
            return *key;
        }

        debug!("signing key cache miss for region {region}, service {service}, day {day}");
        let signing_key = derive_signing_key(&cred.secret_access_key, date, region, service);

        let mut inner = self.lock();
        if !inner.entries.contains_key(&slot) {
            while inner.order.len() >= self.capacity {
                match inner.order.pop_front() {
                    Some(oldest) => {
                        inner.entries.remove(&oldest);
                    }
                    None => break,
                }
            }
            inner.order.push_back(slot.clone());
            inner.entries.insert(slot, signing_key);
        }

        signing_key
    }

    /// Number of cached keys.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of cached keys.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every cached key.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.order.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // The guarded maps stay consistent even if a holder panicked.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
