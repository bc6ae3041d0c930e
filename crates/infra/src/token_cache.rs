//! Thread-safe credential token cache.
//!
//! Owned explicitly and passed by reference into collaborators that need
//! authenticated sessions; renewal is driven by expiry-time comparison, not
//! by ambient mutable globals.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crate::collaborators::ExtractionError;

/// An issued credential with its expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub secret: String,
    pub expires_at: DateTime<Utc>,
}

impl Token {
    /// Valid means the token outlives `now` by at least `skew`, so a token
    /// handed out here does not expire mid-call.
    pub fn is_valid_at(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        now + skew < self.expires_at
    }
}

/// Issues fresh tokens (vault lookup, login flow).
pub trait TokenSource: Send + Sync {
    fn issue(&self) -> Result<Token, ExtractionError>;
}

/// Caches the current token, renewing on expiry.
pub struct TokenCache<S> {
    source: S,
    slot: Mutex<Option<Token>>,
    skew: Duration,
}

impl<S: TokenSource> TokenCache<S> {
    pub fn new(source: S) -> Self {
        Self::with_renewal_skew(source, Duration::seconds(60))
    }

    pub fn with_renewal_skew(source: S, skew: Duration) -> Self {
        Self {
            source,
            slot: Mutex::new(None),
            skew,
        }
    }

    /// Current token, renewed through the source when missing or expiring.
    pub fn current(&self, now: DateTime<Utc>) -> Result<Token, ExtractionError> {
        let mut slot = self.slot.lock().unwrap();
        if let Some(token) = slot.as_ref() {
            if token.is_valid_at(now, self.skew) {
                return Ok(token.clone());
            }
        }
        let fresh = self.source.issue()?;
        *slot = Some(fresh.clone());
        Ok(fresh)
    }

    /// Drop the cached token (e.g. after the destination rejected it).
    pub fn invalidate(&self) {
        *self.slot.lock().unwrap() = None;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    struct CountingSource {
        issued: AtomicU32,
    }

    impl TokenSource for CountingSource {
        fn issue(&self) -> Result<Token, ExtractionError> {
            let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Token {
                secret: format!("token-{n}"),
                expires_at: Utc::now() + Duration::minutes(10),
            })
        }
    }

    #[test]
    fn reuses_valid_token() {
        let cache = TokenCache::new(CountingSource {
            issued: AtomicU32::new(0),
        });
        let now = Utc::now();
        let first = cache.current(now).unwrap();
        let second = cache.current(now).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn renews_past_expiry_skew() {
        let cache = TokenCache::new(CountingSource {
            issued: AtomicU32::new(0),
        });
        let now = Utc::now();
        let first = cache.current(now).unwrap();
        let later = now + Duration::minutes(10);
        let second = cache.current(later).unwrap();
        assert_ne!(first.secret, second.secret);
    }

    #[test]
    fn invalidate_forces_renewal() {
        let cache = TokenCache::new(CountingSource {
            issued: AtomicU32::new(0),
        });
        let now = Utc::now();
        let first = cache.current(now).unwrap();
        cache.invalidate();
        let second = cache.current(now).unwrap();
        assert_ne!(first.secret, second.secret);
    }
}
