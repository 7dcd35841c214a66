//! Access token resolution.
//!
//! Tokens are opaque strings produced by an external key service and
//! attached to broker traffic. Nothing in this crate checks them.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::broker::INBOX_PREFIX;

pub const DEFAULT_TTL: Duration = Duration::from_secs(600);
/// Past this many live entries new tokens are resolved but not cached.
pub const DEFAULT_CAPACITY: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("no token configured for {subject} ({mode})")]
    Unavailable { subject: String, mode: AccessMode },
    #[error("key service failure: {0}")]
    Service(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    Read,
    Write,
    Presence,
}

impl AccessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessMode::Read => "r",
            AccessMode::Write => "w",
            AccessMode::Presence => "p",
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait TokenResolver: Send + Sync {
    fn resolve(&self, subject: &str, mode: AccessMode) -> Result<String, KeyError>;
}

/// Hands out the single configured broker token for every subject.
pub struct StaticTokenResolver {
    token: Option<String>,
}

impl StaticTokenResolver {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

impl TokenResolver for StaticTokenResolver {
    fn resolve(&self, subject: &str, mode: AccessMode) -> Result<String, KeyError> {
        self.token.clone().ok_or_else(|| KeyError::Unavailable {
            subject: subject.to_string(),
            mode,
        })
    }
}

/// Caches resolved tokens per (subject, mode) for `ttl`.
///
/// One-shot `_INBOX.` reply subjects are never cached. Expired entries are
/// pruned when the cache reaches `capacity`.
pub struct Keystore {
    inner: Arc<dyn TokenResolver>,
    ttl: Duration,
    capacity: usize,
    cache: Mutex<HashMap<(String, AccessMode), (String, Instant)>>,
}

impl Keystore {
    pub fn new(inner: Arc<dyn TokenResolver>) -> Self {
        Self::with_ttl(inner, DEFAULT_TTL)
    }

    pub fn with_ttl(inner: Arc<dyn TokenResolver>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            capacity: DEFAULT_CAPACITY,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn cached(&self) -> usize {
        self.cache.lock().len()
    }
}

impl TokenResolver for Keystore {
    fn resolve(&self, subject: &str, mode: AccessMode) -> Result<String, KeyError> {
        let key = (subject.to_string(), mode);
        if let Some((token, at)) = self.cache.lock().get(&key) {
            if at.elapsed() < self.ttl {
                return Ok(token.clone());
            }
        }

        let token = self.inner.resolve(subject, mode)?;
        if subject.starts_with(INBOX_PREFIX) {
            return Ok(token);
        }
        debug!(subject, mode = %mode, "access token refreshed");

        let mut cache = self.cache.lock();
        if cache.len() >= self.capacity && !cache.contains_key(&key) {
            let ttl = self.ttl;
            cache.retain(|_, (_, at)| at.elapsed() < ttl);
        }
        if cache.len() < self.capacity || cache.contains_key(&key) {
            cache.insert(key, (token.clone(), Instant::now()));
        }
        Ok(token)
    }
}
