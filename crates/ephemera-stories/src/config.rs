//! Engine configuration
//!
//! Grouped per component, with presets for typical deployments.

use std::time::Duration;

use chrono::{DateTime, Utc};
use ephemera_core::OwnerId;

/// Viewer polling and view-count batching
#[derive(Debug, Clone)]
pub struct PollingConfig {
    /// Viewer poll period while the owner has the story open
    pub opened_story_poll_period: Duration,
    /// Viewer poll period after the owner closed the story
    pub viewed_story_poll_period: Duration,
    /// How long after expiry viewers can still be fetched
    pub viewers_expire_period: Duration,
    /// Delay before opened stories are reported in one batch
    pub view_flush_delay: Duration,
    /// Refresh period for view counters of own active stories
    pub interaction_refresh_period: Duration,
    /// How long a fetched first page of viewers is served from memory
    pub viewers_cache_lifetime: Duration,
    /// Maximum story ids per view-increment request
    pub max_view_batch: usize,
}

/// Sending and editing
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Transient send failures retried before giving up
    pub max_send_retries: u32,
    pub retry_backoff_base: Duration,
    pub retry_backoff_max: Duration,
    /// Missing-parts re-uploads before giving up
    pub max_reupload_attempts: u32,
    pub max_caption_length: usize,
    /// Accepted active periods, in seconds
    pub allowed_active_periods: Vec<u32>,
}

/// Entity cache lifetime and reloads
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Inaccessible stories are dropped after this long
    pub inaccessible_grace_period: Duration,
    pub gc_interval: Duration,
    /// Maximum stories dropped per collection
    pub gc_batch_limit: usize,
    /// Delay before a partially known story is re-fetched
    pub stale_story_reload_delay: Duration,
    /// Transient reload failures retried before giving up
    pub max_reload_attempts: u32,
}

/// Global list pagination
#[derive(Debug, Clone)]
pub struct ListConfig {
    /// Owners loaded from the database per page
    pub database_page_size: usize,
}

/// Configuration for the story engine
#[derive(Debug, Clone)]
pub struct StoryConfig {
    /// The local user's own owner identity
    pub self_owner: OwnerId,
    pub polling: PollingConfig,
    pub upload: UploadConfig,
    pub cache: CacheConfig,
    pub lists: ListConfig,
}

impl Default for StoryConfig {
    fn default() -> Self {
        Self {
            self_owner: OwnerId(0),
            polling: PollingConfig {
                opened_story_poll_period: Duration::from_secs(60),
                viewed_story_poll_period: Duration::from_secs(300),
                viewers_expire_period: Duration::from_secs(86400),
                view_flush_delay: Duration::from_secs(1),
                interaction_refresh_period: Duration::from_secs(60),
                viewers_cache_lifetime: Duration::from_secs(30),
                max_view_batch: 200,
            },
            upload: UploadConfig {
                max_send_retries: 3,
                retry_backoff_base: Duration::from_secs(1),
                retry_backoff_max: Duration::from_secs(60),
                max_reupload_attempts: 3,
                max_caption_length: 2048,
                allowed_active_periods: vec![6 * 3600, 12 * 3600, 86400, 2 * 86400],
            },
            cache: CacheConfig {
                inaccessible_grace_period: Duration::from_secs(1800),
                gc_interval: Duration::from_secs(300),
                gc_batch_limit: 50,
                stale_story_reload_delay: Duration::from_secs(60),
                max_reload_attempts: 3,
            },
            lists: ListConfig {
                database_page_size: 20,
            },
        }
    }
}

impl StoryConfig {
    /// Default configuration for the given local user
    pub fn for_owner(self_owner: OwnerId) -> Self {
        Self {
            self_owner,
            ..Default::default()
        }
    }

    /// Fewer background requests for metered or battery-bound clients
    ///
    /// Polls less often, batches views longer and keeps fewer retries.
    pub fn low_traffic(self_owner: OwnerId) -> Self {
        let mut config = Self::for_owner(self_owner);
        config.polling.opened_story_poll_period = Duration::from_secs(120);
        config.polling.viewed_story_poll_period = Duration::from_secs(900);
        config.polling.view_flush_delay = Duration::from_secs(10);
        config.polling.interaction_refresh_period = Duration::from_secs(300);
        config.polling.viewers_cache_lifetime = Duration::from_secs(120);
        config.upload.max_send_retries = 2;
        config.cache.gc_interval = Duration::from_secs(900);
        config
    }

    /// Short periods suitable for tests driven by a real clock
    pub fn testing(self_owner: OwnerId) -> Self {
        let mut config = Self::for_owner(self_owner);
        config.polling.view_flush_delay = Duration::from_millis(50);
        config.upload.retry_backoff_base = Duration::from_millis(20);
        config.upload.retry_backoff_max = Duration::from_millis(200);
        config.cache.gc_interval = Duration::from_secs(5);
        config
    }

    /// Validate configuration invariants
    ///
    /// An empty list means the configuration is valid.
    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if !self.self_owner.is_valid() {
            warnings.push(ConfigWarning::SelfOwnerUnset);
        }
        if self.polling.opened_story_poll_period > self.polling.viewed_story_poll_period {
            warnings.push(ConfigWarning::OpenedPollSlowerThanViewed);
        }
        if self.upload.retry_backoff_base > self.upload.retry_backoff_max {
            warnings.push(ConfigWarning::BackoffBaseExceedsMax);
        }
        if self.upload.allowed_active_periods.is_empty() {
            warnings.push(ConfigWarning::NoActivePeriods);
        }
        if self.polling.max_view_batch == 0 || self.lists.database_page_size == 0 {
            warnings.push(ConfigWarning::ZeroBatchSize);
        }
        if self.cache.gc_interval < Duration::from_secs(1) {
            warnings.push(ConfigWarning::GcIntervalTooShort);
        }

        warnings
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_empty()
    }
}

/// Configuration warnings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigWarning {
    /// `self_owner` is not a valid owner
    SelfOwnerUnset,
    /// Open stories would be polled less often than closed ones
    OpenedPollSlowerThanViewed,
    BackoffBaseExceedsMax,
    /// Every send would be rejected
    NoActivePeriods,
    ZeroBatchSize,
    /// GC interval is very short (< 1s)
    GcIntervalTooShort,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::SelfOwnerUnset => write!(f, "self_owner is not set"),
            ConfigWarning::OpenedPollSlowerThanViewed => {
                write!(f, "opened_story_poll_period exceeds viewed_story_poll_period")
            }
            ConfigWarning::BackoffBaseExceedsMax => {
                write!(f, "retry_backoff_base exceeds retry_backoff_max")
            }
            ConfigWarning::NoActivePeriods => write!(f, "allowed_active_periods is empty"),
            ConfigWarning::ZeroBatchSize => write!(f, "a batch or page size is zero"),
            ConfigWarning::GcIntervalTooShort => write!(f, "gc_interval is very short (< 1s)"),
        }
    }
}

/// Convert a configured duration for timestamp arithmetic
pub(crate) fn to_delta(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// `now + duration`, saturating at the end of representable time
pub(crate) fn deadline_after(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    now.checked_add_signed(to_delta(duration))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
