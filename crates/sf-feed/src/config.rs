use anyhow::Result;
use serde_json::{json, Value};
use sf_core::config as env_config;
use std::convert::Infallible;
use std::time::Duration;

const MIN_FLUSH_INTERVAL_MS: u64 = 10;

/// When a buffer flushes: at `max_records` queued events, or on the next
/// `flush_interval` tick, whichever comes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSettings {
    pub max_records: usize,
    pub flush_interval: Duration,
}

impl BufferSettings {
    pub fn new(max_records: usize, flush_interval: Duration) -> Self {
        Self {
            max_records: max_records.max(1),
            flush_interval: flush_interval.max(Duration::from_millis(MIN_FLUSH_INTERVAL_MS)),
        }
    }

    fn from_json(value: Option<&Value>, fallback: BufferSettings) -> Self {
        let map = value.and_then(|v| v.as_object());
        let max_records = map
            .and_then(|map| map.get("max_records"))
            .and_then(|v| v.as_u64())
            .map(|v| usize::try_from(v).unwrap_or(usize::MAX))
            .unwrap_or(fallback.max_records);
        let flush_interval = map
            .and_then(|map| map.get("flush_interval_ms"))
            .and_then(|v| v.as_u64())
            .map(Duration::from_millis)
            .unwrap_or(fallback.flush_interval);
        Self::new(max_records, flush_interval)
    }

    fn apply_env(&mut self, prefix: &str) -> Result<()> {
        if let Some(max_records) = env_config::optional_u64_env(&format!("{prefix}_MAX_RECORDS"))? {
            *self = Self::new(
                usize::try_from(max_records).unwrap_or(usize::MAX),
                self.flush_interval,
            );
        }
        if let Some(interval_ms) =
            env_config::optional_u64_env(&format!("{prefix}_FLUSH_INTERVAL_MS"))?
        {
            *self = Self::new(self.max_records, Duration::from_millis(interval_ms));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedRuntimeConfig {
    pub views: BufferSettings,
    pub likes: BufferSettings,
    pub dislikes: BufferSettings,
    pub replies: BufferSettings,
    /// Report duplicate likes/views and dislikes without a like as errors
    /// instead of absorbing them.
    pub strict_interactions: bool,
}

impl Default for FeedRuntimeConfig {
    fn default() -> Self {
        Self::from_json(&default_config_json())
    }
}

pub fn default_config_json() -> Value {
    json!({
        "buffers": {
            "views": { "max_records": 100, "flush_interval_ms": 1000 },
            "likes": { "max_records": 10, "flush_interval_ms": 5000 },
            "replies": { "max_records": 10, "flush_interval_ms": 10000 }
        },
        "strict_interactions": false
    })
}

impl FeedRuntimeConfig {
    pub fn from_json(value: &Value) -> Self {
        match Self::build(value, |_, _| Ok::<(), Infallible>(())) {
            Ok(config) => config,
            Err(never) => match never {},
        }
    }

    /// Like [`FeedRuntimeConfig::from_json`], with `FEED_<KIND>_MAX_RECORDS`,
    /// `FEED_<KIND>_FLUSH_INTERVAL_MS` and `FEED_STRICT_INTERACTIONS` taking
    /// precedence over the document. Dislikes without their own `dislikes`
    /// section inherit the like settings after `FEED_LIKES_*` is applied.
    pub fn from_json_with_env(value: &Value) -> Result<Self> {
        let mut config = Self::build(value, |settings, prefix| settings.apply_env(prefix))?;
        if let Some(strict) = env_config::optional_bool_env("FEED_STRICT_INTERACTIONS")? {
            config.strict_interactions = strict;
        }
        Ok(config)
    }

    fn build<E>(
        value: &Value,
        mut overrides: impl FnMut(&mut BufferSettings, &str) -> std::result::Result<(), E>,
    ) -> std::result::Result<Self, E> {
        let buffers = value.get("buffers").and_then(|v| v.as_object());
        let section = |name: &str| buffers.and_then(|map| map.get(name));
        let mut settings = |name: &str, prefix: &str, fallback: BufferSettings| {
            let mut parsed = BufferSettings::from_json(section(name), fallback);
            overrides(&mut parsed, prefix).map(|()| parsed)
        };

        let views = settings(
            "views",
            "FEED_VIEWS",
            BufferSettings::new(100, Duration::from_secs(1)),
        )?;
        let likes = settings(
            "likes",
            "FEED_LIKES",
            BufferSettings::new(10, Duration::from_secs(5)),
        )?;
        // Dislikes follow the like cadence unless configured on their own.
        let dislikes = settings("dislikes", "FEED_DISLIKES", likes)?;
        let replies = settings(
            "replies",
            "FEED_REPLIES",
            BufferSettings::new(10, Duration::from_secs(10)),
        )?;

        Ok(Self {
            views,
            likes,
            dislikes,
            replies,
            strict_interactions: value
                .get("strict_interactions")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::env;
    use std::sync::{Mutex, MutexGuard, OnceLock};

    /// Serializes tests that read or write `FEED_*` variables.
    pub(crate) fn env_lock() -> MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[test]
    fn defaults_match_buffer_cadence() {
        let config = FeedRuntimeConfig::default();
        assert_eq!(config.views.max_records, 100);
        assert_eq!(config.views.flush_interval, Duration::from_secs(1));
        assert_eq!(config.likes.max_records, 10);
        assert_eq!(config.likes.flush_interval, Duration::from_secs(5));
        assert_eq!(config.dislikes, config.likes);
        assert_eq!(config.replies.max_records, 10);
        assert_eq!(config.replies.flush_interval, Duration::from_secs(10));
        assert!(!config.strict_interactions);
    }

    #[test]
    fn from_json_clamps_and_inherits() {
        let config = FeedRuntimeConfig::from_json(&json!({
            "buffers": {
                "likes": { "max_records": 0, "flush_interval_ms": 1 },
                "views": { "max_records": 500 }
            },
            "strict_interactions": true
        }));

        assert_eq!(config.likes.max_records, 1);
        assert_eq!(config.likes.flush_interval, Duration::from_millis(10));
        assert_eq!(config.dislikes, config.likes);
        assert_eq!(config.views.max_records, 500);
        assert_eq!(config.views.flush_interval, Duration::from_secs(1));
        assert!(config.strict_interactions);
    }

    #[test]
    fn env_overrides_win_over_json() {
        let _guard = env_lock();
        env::set_var("FEED_VIEWS_MAX_RECORDS", "7");
        env::set_var("FEED_REPLIES_FLUSH_INTERVAL_MS", "250");
        env::set_var("FEED_STRICT_INTERACTIONS", "true");

        let config = FeedRuntimeConfig::from_json_with_env(&default_config_json()).unwrap();

        env::remove_var("FEED_VIEWS_MAX_RECORDS");
        env::remove_var("FEED_REPLIES_FLUSH_INTERVAL_MS");
        env::remove_var("FEED_STRICT_INTERACTIONS");

        assert_eq!(config.views.max_records, 7);
        assert_eq!(config.replies.flush_interval, Duration::from_millis(250));
        assert!(config.strict_interactions);
    }

    #[test]
    fn env_override_rejects_garbage() {
        let _guard = env_lock();
        env::set_var("FEED_LIKES_MAX_RECORDS", "ten");
        let result = FeedRuntimeConfig::from_json_with_env(&default_config_json());
        env::remove_var("FEED_LIKES_MAX_RECORDS");
        assert!(result.is_err());
    }

    #[test]
    fn like_env_leaves_explicit_dislike_section_alone() {
        let _guard = env_lock();
        env::set_var("FEED_LIKES_MAX_RECORDS", "3");
        let document = json!({
            "buffers": {
                "likes": { "max_records": 20 },
                "dislikes": { "max_records": 40, "flush_interval_ms": 2000 }
            }
        });
        let explicit = FeedRuntimeConfig::from_json_with_env(&document);
        let inherited = FeedRuntimeConfig::from_json_with_env(&default_config_json());
        env::remove_var("FEED_LIKES_MAX_RECORDS");

        let explicit = explicit.unwrap();
        assert_eq!(explicit.likes.max_records, 3);
        assert_eq!(explicit.dislikes.max_records, 40);
        assert_eq!(explicit.dislikes.flush_interval, Duration::from_secs(2));

        let inherited = inherited.unwrap();
        assert_eq!(inherited.likes.max_records, 3);
        assert_eq!(inherited.dislikes, inherited.likes);
    }
}
