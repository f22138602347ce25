//! JWKS cache: per-issuer signing keys with single-flight refresh.
//!
//! # Behaviour
//!
//! - Fresh entries (younger than the TTL) are served without I/O.
//! - A miss or stale entry takes the issuer's refresh lock. Callers that
//!   queued behind an in-flight fetch reuse its result instead of fetching
//!   again, so N concurrent misses cost one network round trip.
//! - When a fetch fails after retries, the last-known-good key set is served
//!   (with a warning). Only an issuer that never fetched successfully
//!   surfaces [`Error::ProviderUnavailable`].
//! - After a failed refresh, stale keys are served without re-fetching for
//!   [`FAILURE_COOLDOWN`] so a dead provider is not hammered on every request.
//! - Forced refreshes (unknown `kid`, bad signature) are allowed once per
//!   [`FAILURE_COOLDOWN`] per issuer and never during a failure cooldown;
//!   otherwise the cached set is returned as is.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use jsonwebtoken::jwk::JwkSet;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::retry::RetryPolicy;
use crate::{Error, Result};

/// How long stale keys are served without retrying a failed refresh.
pub const FAILURE_COOLDOWN: Duration = Duration::from_secs(30);

/// Cached JWKS entry.
struct CachedJwks {
    keys: Arc<JwkSet>,
    fetched_at: Instant,
}

/// Per-issuer cache slot.
#[derive(Default)]
struct IssuerSlot {
    cached: RwLock<Option<CachedJwks>>,
    last_failure: RwLock<Option<Instant>>,
    last_forced: RwLock<Option<Instant>>,
    refresh: tokio::sync::Mutex<()>,
}

impl IssuerSlot {
    fn fresh(&self, ttl: Duration) -> Option<Arc<JwkSet>> {
        self.cached
            .read()
            .as_ref()
            .filter(|c| c.fetched_at.elapsed() < ttl)
            .map(|c| Arc::clone(&c.keys))
    }

    fn any(&self) -> Option<Arc<JwkSet>> {
        self.cached.read().as_ref().map(|c| Arc::clone(&c.keys))
    }

    fn fetched_since(&self, since: Instant) -> Option<Arc<JwkSet>> {
        self.cached
            .read()
            .as_ref()
            .filter(|c| c.fetched_at >= since)
            .map(|c| Arc::clone(&c.keys))
    }

    fn cooling_down(&self) -> bool {
        self.last_failure
            .read()
            .is_some_and(|t| t.elapsed() < FAILURE_COOLDOWN)
    }

    fn forced_recently(&self) -> bool {
        self.last_forced
            .read()
            .is_some_and(|t| t.elapsed() < FAILURE_COOLDOWN)
    }
}

/// JWKS cache, one slot per issuer.
pub struct JwksCache {
    slots: DashMap<String, Arc<IssuerSlot>>,
    http: reqwest::Client,
    ttl: Duration,
    retry: RetryPolicy,
    fetches: AtomicU64,
}

impl JwksCache {
    /// Create a cache that fetches with `http` and keeps key sets for `ttl`.
    #[must_use]
    pub fn new(http: reqwest::Client, ttl: Duration, retry: RetryPolicy) -> Self {
        Self {
            slots: DashMap::new(),
            http,
            ttl,
            retry,
            fetches: AtomicU64::new(0),
        }
    }

    /// Number of network fetches performed so far (all issuers).
    #[must_use]
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    fn slot(&self, issuer: &str) -> Arc<IssuerSlot> {
        Arc::clone(
            &self
                .slots
                .entry(issuer.to_string())
                .or_insert_with(|| Arc::new(IssuerSlot::default())),
        )
    }

    /// Return the key set for `issuer`, fetching from `jwks_uri` when needed.
    ///
    /// `force_refresh` bypasses the TTL (used once after a signature failure
    /// to pick up rotated keys); concurrent forced refreshes still coalesce,
    /// and a forced refresh inside the cooldown returns the cached set.
    pub async fn get_keys(
        &self,
        issuer: &str,
        jwks_uri: &str,
        force_refresh: bool,
    ) -> Result<Arc<JwkSet>> {
        let slot = self.slot(issuer);
        let requested_at = Instant::now();

        if !force_refresh {
            if let Some(keys) = slot.fresh(self.ttl) {
                return Ok(keys);
            }
            if slot.cooling_down() {
                if let Some(keys) = slot.any() {
                    debug!(issuer = %issuer, "JWKS refresh cooling down, serving stale keys");
                    return Ok(keys);
                }
            }
        }

        if force_refresh && (slot.cooling_down() || slot.forced_recently()) {
            if let Some(keys) = slot.any() {
                debug!(issuer = %issuer, "Forced JWKS refresh throttled, serving cached keys");
                return Ok(keys);
            }
        }

        let _guard = slot.refresh.lock().await;

        // A fetch that completed while we waited for the lock satisfies us.
        if let Some(keys) = slot.fetched_since(requested_at) {
            return Ok(keys);
        }
        if force_refresh {
            *slot.last_forced.write() = Some(Instant::now());
        } else if let Some(keys) = slot.fresh(self.ttl) {
            return Ok(keys);
        }

        match self.fetch(jwks_uri).await {
            Ok(keys) => {
                let keys = Arc::new(keys);
                *slot.cached.write() = Some(CachedJwks {
                    keys: Arc::clone(&keys),
                    fetched_at: Instant::now(),
                });
                *slot.last_failure.write() = None;
                Ok(keys)
            }
            Err(e) => {
                *slot.last_failure.write() = Some(Instant::now());
                if let Some(stale) = slot.any() {
                    warn!(issuer = %issuer, error = %e, "JWKS refresh failed, serving last-known-good keys");
                    Ok(stale)
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn fetch(&self, jwks_uri: &str) -> Result<JwkSet> {
        self.retry
            .run("jwks_fetch", || async {
                self.fetches.fetch_add(1, Ordering::Relaxed);
                debug!(uri = %jwks_uri, "Fetching JWKS");
                let response = self.http.get(jwks_uri).send().await?;
                if !response.status().is_success() {
                    return Err(Error::ProviderUnavailable(format!(
                        "JWKS endpoint returned HTTP {}",
                        response.status()
                    )));
                }
                response
                    .json::<JwkSet>()
                    .await
                    .map_err(|e| Error::ProviderUnavailable(format!("Invalid JWKS document: {e}")))
            })
            .await
    }
}
