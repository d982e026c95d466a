//! Named fallback strategies built on [`DegradationManager`]

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::degradation::DegradationManager;
use super::retry::RetryPolicy;
use crate::config::DegradationConfig;
use crate::{Error, Result};

/// Breaker name used for cache reads
pub const CACHE_SERVICE: &str = "redis";
/// Breaker name used for database reads
pub const DATABASE_SERVICE: &str = "database";
/// Breaker name used for object storage
pub const STORAGE_SERVICE: &str = "storage";
/// Breaker name used for push delivery
pub const PUSH_SERVICE: &str = "push";
/// Breaker name used for live update streams
pub const LIVE_UPDATES_SERVICE: &str = "live-updates";

/// Notification held for later delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredNotification {
    /// Recipient identifier
    pub recipient: String,
    /// Message body
    pub payload: serde_json::Value,
    /// When the notification was first attempted
    pub queued_at: DateTime<Utc>,
}

impl DeferredNotification {
    /// Create a notification stamped with the current time
    #[must_use]
    pub fn new(recipient: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            recipient: recipient.into(),
            payload,
            queued_at: Utc::now(),
        }
    }
}

/// Result of [`FallbackStrategies::notify_or_defer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Delivery {
    /// Delivered immediately
    Sent,
    /// Queued for deferred delivery
    Deferred,
}

/// Result of [`FallbackStrategies::live_or_polling`]
#[derive(Debug)]
pub enum UpdateChannel<T> {
    /// Live stream connected
    Live(T),
    /// Live updates unavailable; clients should poll
    Polling {
        /// Suggested poll interval
        interval: Duration,
    },
}

impl<T> UpdateChannel<T> {
    /// Whether clients fell back to polling
    #[must_use]
    pub fn is_polling(&self) -> bool {
        matches!(self, Self::Polling { .. })
    }
}

#[derive(Debug)]
struct CachedListing {
    value: serde_json::Value,
    stored_at: Instant,
}

/// Common substitutions for failing dependencies.
#[derive(Debug)]
pub struct FallbackStrategies {
    manager: Arc<DegradationManager>,
    listings: DashMap<String, CachedListing>,
    listing_ttl: Duration,
    deferred: Mutex<VecDeque<DeferredNotification>>,
    deferred_capacity: usize,
    polling_interval: Duration,
    database_retry: RetryPolicy,
}

impl FallbackStrategies {
    /// Create strategies over a shared manager
    #[must_use]
    pub fn new(manager: Arc<DegradationManager>, config: &DegradationConfig) -> Self {
        Self {
            manager,
            listings: DashMap::new(),
            listing_ttl: config.cached_listing_ttl,
            deferred: Mutex::new(VecDeque::new()),
            deferred_capacity: config.deferred_queue_capacity,
            polling_interval: config.polling_interval,
            database_retry: RetryPolicy::database(),
        }
    }

    /// Read from the cache; on a miss, or when the cache is down, read
    /// through to the database.
    ///
    /// # Errors
    ///
    /// On a miss, the database error. On a cache outage, the cache error
    /// if the database read also fails.
    pub async fn cache_or_database<C, CF, D, DF, T>(&self, cache: C, database: D) -> Result<T>
    where
        C: FnOnce() -> CF,
        CF: Future<Output = Result<Option<T>>>,
        D: FnMut() -> DF,
        DF: Future<Output = Result<T>>,
    {
        match self.manager.execute(CACHE_SERVICE, cache).await {
            Ok(Some(value)) => Ok(value),
            Ok(None) => {
                debug!("Cache miss, reading from database");
                self.manager
                    .execute_with_retry(DATABASE_SERVICE, &self.database_retry, database)
                    .await
            }
            Err(cache_error) => {
                self.manager
                    .fallback(CACHE_SERVICE, cache_error, || {
                        self.manager
                            .execute_with_retry(DATABASE_SERVICE, &self.database_retry, database)
                    })
                    .await
            }
        }
    }

    /// List from object storage, remembering the last good listing per key.
    ///
    /// # Errors
    ///
    /// Returns `Error::StorageUnavailable` when storage fails and no fresh
    /// cached listing exists for `key`.
    pub async fn storage_with_cached_listing<L, LF, T>(&self, key: &str, list: L) -> Result<T>
    where
        L: FnOnce() -> LF,
        LF: Future<Output = Result<T>>,
        T: Serialize + DeserializeOwned,
    {
        let primary_error = match self.manager.execute(STORAGE_SERVICE, list).await {
            Ok(listing) => {
                match serde_json::to_value(&listing) {
                    Ok(value) => {
                        self.listings.insert(
                            key.to_string(),
                            CachedListing {
                                value,
                                stored_at: Instant::now(),
                            },
                        );
                    }
                    Err(e) => warn!(key = %key, error = %e, "Listing not cacheable"),
                }
                return Ok(listing);
            }
            Err(e) => e,
        };

        if self.manager.fallback_enabled() {
            if let Some(listing) = self.cached_listing::<T>(key) {
                self.manager.record_fallback_used(STORAGE_SERVICE);
                info!(key = %key, error = %primary_error, "Storage down, served cached listing");
                return Ok(listing);
            }
        }

        Err(Error::StorageUnavailable(format!("{key}: {primary_error}")))
    }

    fn cached_listing<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let entry = self.listings.get(key)?;
        if entry.stored_at.elapsed() > self.listing_ttl {
            debug!(key = %key, "Cached listing expired");
            return None;
        }
        serde_json::from_value(entry.value.clone()).ok()
    }

    /// Deliver a notification; queue it for later if push delivery fails.
    ///
    /// # Errors
    ///
    /// Returns the delivery error when fallbacks are disabled or the
    /// deferred queue is full.
    pub async fn notify_or_defer<S, SF>(
        &self,
        notification: DeferredNotification,
        send: S,
    ) -> Result<Delivery>
    where
        S: FnOnce(DeferredNotification) -> SF,
        SF: Future<Output = Result<()>>,
    {
        let attempt = notification.clone();
        let primary_error = match self.manager.execute(PUSH_SERVICE, || send(attempt)).await {
            Ok(()) => return Ok(Delivery::Sent),
            Err(e) => e,
        };

        if !self.manager.fallback_enabled() {
            return Err(primary_error);
        }

        {
            let mut queue = self.deferred.lock();
            if queue.len() >= self.deferred_capacity {
                warn!(
                    recipient = %notification.recipient,
                    capacity = self.deferred_capacity,
                    "Deferred notification queue full"
                );
                return Err(primary_error);
            }
            queue.push_back(notification);
        }
        self.manager.record_fallback_used(PUSH_SERVICE);
        info!(error = %primary_error, "Push failed, notification deferred");
        Ok(Delivery::Deferred)
    }

    /// Take every deferred notification, oldest first
    pub fn drain_deferred(&self) -> Vec<DeferredNotification> {
        self.deferred.lock().drain(..).collect()
    }

    /// Number of notifications waiting for delivery
    #[must_use]
    pub fn deferred_len(&self) -> usize {
        self.deferred.lock().len()
    }

    /// Open a live update stream, or tell clients to poll.
    ///
    /// # Errors
    ///
    /// Returns the connection error when fallbacks are disabled.
    pub async fn live_or_polling<C, CF, T>(&self, connect: C) -> Result<UpdateChannel<T>>
    where
        C: FnOnce() -> CF,
        CF: Future<Output = Result<T>>,
    {
        let interval = self.polling_interval;
        self.manager
            .execute_with_fallback(
                LIVE_UPDATES_SERVICE,
                || async move { connect().await.map(UpdateChannel::Live) },
                || async move { Ok(UpdateChannel::Polling { interval }) },
            )
            .await
    }
}
